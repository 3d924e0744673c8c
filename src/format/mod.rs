// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Seek, Write},
    str::Utf8Error,
};

use bstr::ByteSlice;
use thiserror::Error;

use crate::{
    entry::{Entry, EntryKind},
    header::{Header, HeaderFields},
    stream::Truncate,
};

pub mod android;
pub mod bump;
pub mod mtk;
pub mod padding;
pub(crate) mod segment;

/// Identifier for a supported boot image format.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FormatKind {
    Android,
    Bump,
    Mtk,
}

impl FormatKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Bump => "bump",
            Self::Mtk => "mtk",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    // Argument errors.
    #[error("Invalid page size: {0}")]
    InvalidPageSize(u32),
    #[error("Page size field is required")]
    MissingPageSize,
    #[error("{0:?} field is too long")]
    StringTooLong(&'static str),
    #[error("{0:?} field is not supported by this format")]
    UnsupportedField(&'static str),
    #[error("No writer is available for the {} format", .0.name())]
    UnsupportedFormat(FormatKind),
    // Format errors.
    #[error("Boot image magic not found in the first {0} bytes")]
    MagicNotFound(usize),
    #[error("No enabled format matched the input")]
    UnknownFormat,
    #[error("{0:?} field: invalid value: {1}")]
    InvalidFieldValue(&'static str, u32),
    #[error("{0:?} field is not UTF-8 encoded: {data:?}", data = .1.as_bstr())]
    StringNotUtf8(&'static str, Vec<u8>, #[source] Utf8Error),
    #[error("Unexpected EOF while reading {0:?} entry")]
    UnexpectedEof(EntryKind),
    #[error("Invalid data: {0}")]
    InvalidData(&'static str),
    // Structural errors.
    #[error("Duplicate {0:?} entry")]
    DuplicateEntry(EntryKind),
    #[error("Unexpected {actual:?} entry, expected {expected:?}")]
    WrongEntry {
        expected: EntryKind,
        actual: EntryKind,
    },
    #[error("{kind:?} entry has {actual} bytes, but {expected} were declared")]
    SizeMismatch {
        kind: EntryKind,
        expected: u64,
        actual: u64,
    },
    #[error("Invalid size {size} for {kind:?} sub-header entry")]
    InvalidSubHeaderSize { kind: EntryKind, size: u64 },
    #[error("{kind:?} entry too large: {size}")]
    EntryTooLarge { kind: EntryKind, size: u64 },
    // API misuse.
    #[error("Operation requires {0}")]
    InvalidState(&'static str),
    // I/O errors, which keep the stream's own classification.
    #[error("Failed to {0}")]
    Io(&'static str, #[source] io::Error),
}

impl Error {
    /// Whether the error proves the operation cannot be retried. Recoverable
    /// errors leave the codec in a state where the caller may fix its input
    /// and repeat the failed call.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::InvalidPageSize(_)
            | Self::MissingPageSize
            | Self::StringTooLong(_)
            | Self::UnsupportedField(_)
            | Self::UnsupportedFormat(_)
            | Self::MagicNotFound(_)
            | Self::UnknownFormat
            | Self::InvalidFieldValue(..)
            | Self::StringNotUtf8(..)
            | Self::UnexpectedEof(_)
            | Self::InvalidData(_)
            | Self::InvalidState(_) => false,
            Self::DuplicateEntry(_)
            | Self::WrongEntry { .. }
            | Self::SizeMismatch { .. }
            | Self::InvalidSubHeaderSize { .. }
            | Self::EntryTooLarge { .. } => true,
            Self::Io(_, e) => e.kind() != io::ErrorKind::UnexpectedEof,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reader-side capabilities of one boot image format. Adapters are stateful:
/// discovery results from a bid round are cached and reused by
/// [`FormatReader::read_header`].
pub trait FormatReader<R: Read + Seek> {
    fn kind(&self) -> FormatKind;

    /// Bid on the stream. Returns the number of bits of evidence that the
    /// stream matches this format, or `None` to abstain when `best_bid` can no
    /// longer be beaten or the format is not applicable. The stream position
    /// on entry is unspecified; implementations must seek as needed.
    fn bid(&mut self, stream: &mut R, best_bid: u64) -> Result<Option<u64>>;

    /// Set a format-specific option. Returns whether the key was recognized.
    fn set_option(&mut self, key: &str, value: &str) -> Result<bool> {
        let _ = (key, value);
        Ok(false)
    }

    fn read_header(&mut self, stream: &mut R) -> Result<Header>;

    /// Advance to the next entry and seek the stream to its payload. Returns
    /// `None` when all entries have been visited.
    fn read_entry(&mut self, stream: &mut R) -> Result<Option<Entry>>;

    /// Seek to a specific typed entry, or to the first entry when `kind` is
    /// `None`. Returns `None` when the image has no such entry.
    fn go_to_entry(&mut self, stream: &mut R, kind: Option<EntryKind>) -> Result<Option<Entry>>;

    fn read_data(&mut self, stream: &mut R, buf: &mut [u8]) -> Result<usize>;
}

/// Writer-side capabilities of one boot image format.
pub trait FormatWriter<W: Read + Write + Seek + Truncate> {
    fn kind(&self) -> FormatKind;

    fn supported_fields(&self) -> HeaderFields;

    fn write_header(&mut self, stream: &mut W, header: &Header) -> Result<()>;

    /// Materialize the entry the caller must write next. Returns `None` once
    /// every entry has been finished.
    fn get_entry(&mut self, stream: &mut W) -> Result<Option<Entry>>;

    fn write_entry(&mut self, stream: &mut W, entry: &Entry) -> Result<()>;

    fn write_data(&mut self, stream: &mut W, buf: &[u8]) -> Result<usize>;

    fn finish_entry(&mut self, stream: &mut W) -> Result<()>;

    /// Finalize the image. A no-op unless every entry has been finished.
    fn close(&mut self, stream: &mut W) -> Result<()>;
}
