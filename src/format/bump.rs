// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{Read, Seek};

use tracing::debug;

use crate::{
    entry::{Entry, EntryKind},
    format::{
        Error, FormatKind, FormatReader, Result,
        android::{
            self, BOOT_MAGIC, MAX_HEADER_OFFSET, RawHeader, find_header, find_trailing_magic,
        },
        segment::Segments,
    },
    header::Header,
};

/// Magic appended by the bump exploit after the last section.
pub const BUMP_MAGIC: [u8; 16] = [
    0x41, 0xa9, 0xe4, 0x67, 0x74, 0x4d, 0x1d, 0x1b, 0xa4, 0x29, 0xf2, 0xec, 0xea, 0x65, 0x52, 0x79,
];

/// Reader for bumped Android boot images. The layout is identical to the
/// plain format; only the trailing magic differs, so the bid is what tells
/// the two apart.
pub struct BumpReader {
    header: Option<(RawHeader, u64)>,
    bump_offset: Option<u64>,
    allow_truncated_dt: bool,
    segments: Segments,
}

impl BumpReader {
    pub fn new() -> Self {
        Self {
            header: None,
            bump_offset: None,
            allow_truncated_dt: true,
            segments: Segments::new(),
        }
    }
}

impl Default for BumpReader {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Read + Seek> FormatReader<R> for BumpReader {
    fn kind(&self) -> FormatKind {
        FormatKind::Bump
    }

    fn bid(&mut self, stream: &mut R, best_bid: u64) -> Result<Option<u64>> {
        let max_bid = 8 * (BOOT_MAGIC.len() + BUMP_MAGIC.len()) as u64;
        if best_bid >= max_bid {
            return Ok(None);
        }

        let Some((raw, offset)) = find_header(stream)? else {
            return Ok(Some(0));
        };

        let mut bid = 8 * BOOT_MAGIC.len() as u64;

        self.bump_offset = find_trailing_magic(stream, &raw, &BUMP_MAGIC)?;
        if self.bump_offset.is_some() {
            debug!("Found bump magic at offset {:?}", self.bump_offset);
            bid += 8 * BUMP_MAGIC.len() as u64;
        }

        self.header = Some((raw, offset));

        Ok(Some(bid))
    }

    fn set_option(&mut self, key: &str, value: &str) -> Result<bool> {
        if key == "strict" {
            self.allow_truncated_dt = !android::parse_strict(value);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn read_header(&mut self, stream: &mut R) -> Result<Header> {
        let (raw, header_offset) = match self.header {
            Some(h) => h,
            None => {
                let h = find_header(stream)?.ok_or(Error::MagicNotFound(MAX_HEADER_OFFSET))?;
                self.header = Some(h);
                h
            }
        };

        if raw.page_size.get() == 0 {
            return Err(Error::InvalidFieldValue("page_size", 0));
        }

        let header = android::build_header(&raw)?;

        android::seed_reader_entries(
            &mut self.segments,
            &raw,
            header_offset,
            self.allow_truncated_dt,
        )?;

        Ok(header)
    }

    fn read_entry(&mut self, stream: &mut R) -> Result<Option<Entry>> {
        self.segments.read_entry(stream)
    }

    fn go_to_entry(&mut self, stream: &mut R, kind: Option<EntryKind>) -> Result<Option<Entry>> {
        self.segments.go_to_entry(stream, kind)
    }

    fn read_data(&mut self, stream: &mut R, buf: &mut [u8]) -> Result<usize> {
        self.segments.read_data(stream, buf)
    }
}
