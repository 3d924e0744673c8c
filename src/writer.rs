// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{Read, Seek, Write};

use crate::{
    entry::Entry,
    format::{
        Error, FormatKind, FormatWriter, Result, android::AndroidWriter, mtk::MtkWriter,
    },
    header::Header,
    stream::Truncate,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    New,
    Entries,
    Closed,
}

/// Boot image writer for a single format chosen at construction.
///
/// The caller drives the writer through one `write_header` call, then a
/// `get_entry` / `write_entry` / `write_data` / `finish_entry` cycle per
/// entry, then `close`. A recoverable `write_header` failure leaves the
/// writer in its initial state so the call can be retried with fixed input.
pub struct Writer<W: Read + Write + Seek + Truncate> {
    stream: W,
    format: Box<dyn FormatWriter<W>>,
    state: State,
}

impl<W: Read + Write + Seek + Truncate> Writer<W> {
    /// Construct a writer producing the given format. The stream remains the
    /// caller's: it is never closed and can be recovered with
    /// [`Writer::into_inner`].
    pub fn new(stream: W, kind: FormatKind) -> Result<Self> {
        let format: Box<dyn FormatWriter<W>> = match kind {
            FormatKind::Android => Box::new(AndroidWriter::new()),
            FormatKind::Mtk => Box::new(MtkWriter::new()),
            FormatKind::Bump => return Err(Error::UnsupportedFormat(kind)),
        };

        Ok(Self {
            stream,
            format,
            state: State::New,
        })
    }

    pub fn kind(&self) -> FormatKind {
        self.format.kind()
    }

    /// A fresh header restricted to the fields this format can store.
    pub fn get_header(&self) -> Header {
        Header::new(self.format.supported_fields())
    }

    pub fn write_header(&mut self, header: &Header) -> Result<()> {
        if self.state != State::New {
            return Err(Error::InvalidState("the header to not have been written"));
        }

        self.format.write_header(&mut self.stream, header)?;
        self.state = State::Entries;

        Ok(())
    }

    fn require_entries(&self) -> Result<()> {
        if self.state != State::Entries {
            return Err(Error::InvalidState("the header to have been written"));
        }
        Ok(())
    }

    /// The entry that must be written next. Returns `None` once every entry
    /// has been finished.
    pub fn get_entry(&mut self) -> Result<Option<Entry>> {
        self.require_entries()?;
        self.format.get_entry(&mut self.stream)
    }

    pub fn write_entry(&mut self, entry: &Entry) -> Result<()> {
        self.require_entries()?;
        self.format.write_entry(&mut self.stream, entry)
    }

    pub fn write_data(&mut self, buf: &[u8]) -> Result<usize> {
        self.require_entries()?;
        self.format.write_data(&mut self.stream, buf)
    }

    pub fn finish_entry(&mut self) -> Result<()> {
        self.require_entries()?;
        self.format.finish_entry(&mut self.stream)
    }

    /// Finalize the image. The underlying stream is left open for the caller.
    pub fn close(&mut self) -> Result<()> {
        if self.state == State::Closed {
            return Ok(());
        }

        self.require_entries()?;
        self.format.close(&mut self.stream)?;
        self.state = State::Closed;

        Ok(())
    }

    /// Return the underlying stream.
    pub fn into_inner(self) -> W {
        self.stream
    }
}
