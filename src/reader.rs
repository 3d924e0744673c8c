// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{Read, Seek};

use tracing::{debug, warn};

use crate::{
    entry::{Entry, EntryKind},
    format::{
        Error, FormatKind, FormatReader, Result, android::AndroidReader, bump::BumpReader,
        mtk::MtkReader,
    },
    header::Header,
};

/// Boot image reader that dispatches between enabled format adapters.
///
/// Unless a format is forced with [`Reader::set_format`], every enabled
/// adapter bids on the stream when the header is first read. The highest bid
/// wins; ties go to the adapter that was enabled first. A winning bid of zero
/// means no format matched.
pub struct Reader<R: Read + Seek> {
    stream: R,
    formats: Vec<Box<dyn FormatReader<R>>>,
    selected: Option<usize>,
    header_read: bool,
}

impl<R: Read + Seek> Reader<R> {
    /// Construct a reader with no formats enabled. The stream remains the
    /// caller's: it is never closed and can be recovered with
    /// [`Reader::into_inner`].
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            formats: vec![],
            selected: None,
            header_read: false,
        }
    }

    fn format_index(&self, kind: FormatKind) -> Option<usize> {
        self.formats.iter().position(|f| f.kind() == kind)
    }

    /// Enable a format. Enabling a format twice is advisory only.
    pub fn enable_format(&mut self, kind: FormatKind) {
        if self.format_index(kind).is_some() {
            warn!("{} format is already enabled", kind.name());
            return;
        }

        self.formats.push(match kind {
            FormatKind::Android => Box::new(AndroidReader::new()),
            FormatKind::Bump => Box::new(BumpReader::new()),
            FormatKind::Mtk => Box::new(MtkReader::new()),
        });
    }

    pub fn enable_all_formats(&mut self) {
        for kind in [FormatKind::Android, FormatKind::Bump, FormatKind::Mtk] {
            self.enable_format(kind);
        }
    }

    /// Skip bidding and force a specific format. The format is enabled if it
    /// was not already.
    pub fn set_format(&mut self, kind: FormatKind) {
        self.enable_format(kind);
        self.selected = self.format_index(kind);
    }

    /// The format selected by bidding or [`Reader::set_format`], if any.
    pub fn format(&self) -> Option<FormatKind> {
        self.selected.map(|i| self.formats[i].kind())
    }

    /// Set a format-specific option on every enabled format. Unknown keys are
    /// logged and ignored.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        let mut recognized = false;

        for format in &mut self.formats {
            recognized |= format.set_option(key, value)?;
        }

        if !recognized {
            warn!("Ignoring unknown option {key:?}");
        }

        Ok(())
    }

    fn bid(&mut self) -> Result<usize> {
        let mut best: Option<(usize, u64)> = None;

        for (index, format) in self.formats.iter_mut().enumerate() {
            let best_bid = best.map_or(0, |(_, bid)| bid);

            let Some(bid) = format.bid(&mut self.stream, best_bid)? else {
                debug!("{} format abstained", format.kind().name());
                continue;
            };

            debug!("{} format bid {bid} bits", format.kind().name());

            // Earlier-enabled formats win ties.
            if bid > best_bid {
                best = Some((index, bid));
            }
        }

        match best {
            Some((index, _)) => Ok(index),
            None => Err(Error::UnknownFormat),
        }
    }

    /// Read the boot image header, performing format detection first when no
    /// format has been forced.
    pub fn read_header(&mut self) -> Result<Header> {
        let index = match self.selected {
            Some(index) => index,
            None => {
                if self.formats.is_empty() {
                    return Err(Error::InvalidState("at least one enabled format"));
                }
                self.bid()?
            }
        };

        let header = self.formats[index].read_header(&mut self.stream)?;

        debug!("Reading {} format boot image", self.formats[index].kind().name());

        self.selected = Some(index);
        self.header_read = true;

        Ok(header)
    }

    fn require_header(&self) -> Result<usize> {
        if !self.header_read {
            return Err(Error::InvalidState("the header to have been read"));
        }

        self.selected
            .ok_or(Error::InvalidState("the header to have been read"))
    }

    /// Advance to the next entry in the image. Returns `None` when all
    /// entries have been visited.
    pub fn read_entry(&mut self) -> Result<Option<Entry>> {
        let index = self.require_header()?;
        self.formats[index].read_entry(&mut self.stream)
    }

    /// Seek to a specific typed entry, or back to the first entry when `kind`
    /// is `None`. Returns `None` when the image has no such entry.
    pub fn go_to_entry(&mut self, kind: Option<EntryKind>) -> Result<Option<Entry>> {
        let index = self.require_header()?;
        self.formats[index].go_to_entry(&mut self.stream, kind)
    }

    /// Read payload data from the current entry. Returns 0 once the entry is
    /// exhausted.
    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        let index = self.require_header()?;
        self.formats[index].read_data(&mut self.stream, buf)
    }

    /// Return the underlying stream.
    pub fn into_inner(self) -> R {
        self.stream
    }
}
