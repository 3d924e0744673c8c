// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{Read, Seek, SeekFrom, Write};

use crate::{
    entry::{Entry, EntryKind},
    format::{Error, Result, padding},
    stream::ReadFillExt,
};

/// One region in the entry table of an image.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SegmentEntry {
    pub kind: EntryKind,
    /// Absolute byte offset of the payload within the image. When writing,
    /// this is recorded when the entry is opened.
    pub offset: u64,
    /// Payload size. Known up front when reading; fixed by
    /// [`Segments::finish_entry`] when writing.
    pub size: Option<u64>,
    /// Whether a read is allowed to stop short at EOF.
    pub can_truncate: bool,
    /// Alignment applied after the payload when writing, or 0 for none.
    pub align: u64,
}

impl SegmentEntry {
    fn to_entry(self) -> Entry {
        Entry {
            kind: self.kind,
            size: self.size,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Cursor {
    NotStarted,
    At(usize),
    Done,
}

/// Ordered sequence of typed payload regions over a single seekable stream.
/// The same engine drives both reading and writing: entries are traversed
/// strictly in registration order and, when writing, a successful
/// [`Segments::finish_entry`] is the only way to advance.
pub(crate) struct Segments {
    entries: Vec<SegmentEntry>,
    cursor: Cursor,
    /// Whether the current entry was opened with [`Segments::write_entry`].
    open: bool,
    /// Bytes written into the open entry so far.
    written: u64,
    /// Bytes remaining in the current entry when reading.
    remain: u64,
}

impl Segments {
    pub fn new() -> Self {
        Self {
            entries: vec![],
            cursor: Cursor::NotStarted,
            open: false,
            written: 0,
            remain: 0,
        }
    }

    /// Reset to an empty entry table. Called at the top of every header
    /// operation so that retries after recoverable failures start clean.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = Cursor::NotStarted;
        self.open = false;
        self.written = 0;
        self.remain = 0;
    }

    /// Append an entry to the table. Each entry type may appear at most once.
    pub fn add(
        &mut self,
        kind: EntryKind,
        offset: u64,
        size: Option<u64>,
        can_truncate: bool,
        align: u64,
    ) -> Result<()> {
        if self.entries.iter().any(|e| e.kind == kind) {
            return Err(Error::DuplicateEntry(kind));
        }

        self.entries.push(SegmentEntry {
            kind,
            offset,
            size,
            can_truncate,
            align,
        });

        Ok(())
    }

    pub fn entries(&self) -> &[SegmentEntry] {
        &self.entries
    }

    /// Whether every entry has been finished.
    pub fn is_complete(&self) -> bool {
        self.cursor == Cursor::Done
    }

    /// Materialize the entry that must be written next. Returns `None` once
    /// every entry has been finished.
    pub fn get_entry(&mut self) -> Option<Entry> {
        if self.cursor == Cursor::NotStarted {
            self.cursor = if self.entries.is_empty() {
                Cursor::Done
            } else {
                Cursor::At(0)
            };
        }

        match self.cursor {
            Cursor::At(i) => Some(self.entries[i].to_entry()),
            _ => None,
        }
    }

    /// Begin writing the current entry. The entry's offset is recorded from
    /// the stream position.
    pub fn write_entry(&mut self, stream: &mut (impl Write + Seek), kind: EntryKind) -> Result<()> {
        let Cursor::At(i) = self.cursor else {
            return Err(Error::InvalidState("an entry to be available"));
        };

        if self.open {
            return Err(Error::InvalidState("the current entry to be finished"));
        }

        let entry = &mut self.entries[i];
        if kind != entry.kind {
            return Err(Error::WrongEntry {
                expected: entry.kind,
                actual: kind,
            });
        }

        entry.offset = stream
            .stream_position()
            .map_err(|e| Error::Io("get entry offset", e))?;
        self.open = true;
        self.written = 0;

        Ok(())
    }

    /// Append payload bytes to the open entry.
    pub fn write_data(&mut self, stream: &mut (impl Write + Seek), buf: &[u8]) -> Result<usize> {
        let Cursor::At(i) = self.cursor else {
            return Err(Error::InvalidState("an open entry"));
        };
        if !self.open {
            return Err(Error::InvalidState("an open entry"));
        }

        let entry = self.entries[i];

        stream
            .write_all(buf)
            .map_err(|e| Error::Io("write entry data", e))?;
        self.written += buf.len() as u64;

        if let Some(size) = entry.size {
            if self.written > size {
                return Err(Error::SizeMismatch {
                    kind: entry.kind,
                    expected: size,
                    actual: self.written,
                });
            }
        }

        Ok(buf.len())
    }

    /// Finalize the open entry: fix its size, pad to the entry's alignment
    /// with NULs, and advance the cursor. Returns the finished entry so that
    /// format adapters can validate it.
    pub fn finish_entry(&mut self, stream: &mut (impl Write + Seek)) -> Result<SegmentEntry> {
        let Cursor::At(i) = self.cursor else {
            return Err(Error::InvalidState("an open entry"));
        };
        if !self.open {
            return Err(Error::InvalidState("an open entry"));
        }

        let entry = &mut self.entries[i];

        if let Some(size) = entry.size {
            if size != self.written {
                return Err(Error::SizeMismatch {
                    kind: entry.kind,
                    expected: size,
                    actual: self.written,
                });
            }
        }
        entry.size = Some(self.written);

        if entry.align > 0 {
            padding::write_zeros(&mut *stream, entry.align)
                .map_err(|e| Error::Io("write entry padding", e))?;
        }

        let finished = *entry;

        self.open = false;
        self.written = 0;
        self.cursor = if i + 1 < self.entries.len() {
            Cursor::At(i + 1)
        } else {
            Cursor::Done
        };

        Ok(finished)
    }

    /// Advance to the next entry and seek the stream to its payload. Returns
    /// `None` when all entries have been visited.
    pub fn read_entry(&mut self, stream: &mut (impl Read + Seek)) -> Result<Option<Entry>> {
        let next = match self.cursor {
            Cursor::NotStarted => 0,
            Cursor::At(i) => i + 1,
            Cursor::Done => return Ok(None),
        };

        if next >= self.entries.len() {
            self.cursor = Cursor::Done;
            return Ok(None);
        }

        self.seek_to(stream, next)?;

        Ok(Some(self.entries[next].to_entry()))
    }

    /// Seek to a specific typed entry, or to the first entry when `kind` is
    /// `None`. Returns `None` when the table has no such entry.
    pub fn go_to_entry(
        &mut self,
        stream: &mut (impl Read + Seek),
        kind: Option<EntryKind>,
    ) -> Result<Option<Entry>> {
        let index = match kind {
            Some(kind) => self.entries.iter().position(|e| e.kind == kind),
            None => (!self.entries.is_empty()).then_some(0),
        };
        let Some(index) = index else {
            return Ok(None);
        };

        self.seek_to(stream, index)?;

        Ok(Some(self.entries[index].to_entry()))
    }

    fn seek_to(&mut self, stream: &mut (impl Read + Seek), index: usize) -> Result<()> {
        let entry = &self.entries[index];

        stream
            .seek(SeekFrom::Start(entry.offset))
            .map_err(|e| Error::Io("seek to entry", e))?;

        self.cursor = Cursor::At(index);
        self.remain = entry.size.unwrap_or(0);

        Ok(())
    }

    /// Read up to `min(buf.len(), remaining)` bytes from the current entry. A
    /// short read at EOF is only permitted for entries that allow truncation;
    /// otherwise it is a format error.
    pub fn read_data(&mut self, stream: &mut (impl Read + Seek), buf: &mut [u8]) -> Result<usize> {
        let Cursor::At(i) = self.cursor else {
            return Err(Error::InvalidState("a current entry"));
        };

        let entry = self.entries[i];
        let to_read = self.remain.min(buf.len() as u64) as usize;

        let n = stream
            .read_fill(&mut buf[..to_read])
            .map_err(|e| Error::Io("read entry data", e))?;

        if n < to_read {
            if !entry.can_truncate {
                return Err(Error::UnexpectedEof(entry.kind));
            }

            // Nothing more will come; report the short count once.
            self.remain = 0;
        } else {
            self.remain -= n as u64;
        }

        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor as IoCursor;

    use super::*;

    fn write_cycle(
        segments: &mut Segments,
        stream: &mut IoCursor<Vec<u8>>,
        kind: EntryKind,
        data: &[u8],
    ) {
        let entry = segments.get_entry().unwrap();
        assert_eq!(entry.kind, kind);
        segments.write_entry(stream, kind).unwrap();
        segments.write_data(stream, data).unwrap();
        let finished = segments.finish_entry(stream).unwrap();
        assert_eq!(finished.size, Some(data.len() as u64));
    }

    #[test]
    fn duplicate_entry_rejected() {
        let mut segments = Segments::new();
        segments.add(EntryKind::Kernel, 0, None, false, 0).unwrap();

        assert!(matches!(
            segments.add(EntryKind::Kernel, 0, None, false, 0),
            Err(Error::DuplicateEntry(EntryKind::Kernel)),
        ));
    }

    #[test]
    fn write_sequencing() {
        let mut segments = Segments::new();
        segments
            .add(EntryKind::Kernel, 0, None, false, 16)
            .unwrap();
        segments
            .add(EntryKind::Ramdisk, 0, None, false, 16)
            .unwrap();

        let mut stream = IoCursor::new(vec![]);

        // Writing out of order is an error.
        assert!(matches!(
            segments.write_entry(&mut stream, EntryKind::Ramdisk),
            Err(Error::WrongEntry {
                expected: EntryKind::Kernel,
                actual: EntryKind::Ramdisk,
            }),
        ));

        write_cycle(&mut segments, &mut stream, EntryKind::Kernel, b"kernel");
        assert_eq!(stream.position(), 16);

        write_cycle(&mut segments, &mut stream, EntryKind::Ramdisk, b"ramdisk");
        assert_eq!(stream.position(), 32);

        assert!(segments.is_complete());
        assert_eq!(segments.get_entry(), None);
    }

    #[test]
    fn unaligned_entry_not_padded() {
        let mut segments = Segments::new();
        segments.add(EntryKind::Kernel, 0, None, false, 0).unwrap();

        let mut stream = IoCursor::new(vec![]);
        write_cycle(&mut segments, &mut stream, EntryKind::Kernel, b"abc");

        assert_eq!(stream.position(), 3);
    }

    #[test]
    fn read_in_order() {
        let mut segments = Segments::new();
        segments
            .add(EntryKind::Kernel, 0, Some(6), false, 0)
            .unwrap();
        segments
            .add(EntryKind::Ramdisk, 8, Some(4), false, 0)
            .unwrap();

        let mut stream = IoCursor::new(b"kernel\0\0rdsk".to_vec());
        let mut buf = [0u8; 16];

        let entry = segments.read_entry(&mut stream).unwrap().unwrap();
        assert_eq!(entry.kind, EntryKind::Kernel);
        assert_eq!(segments.read_data(&mut stream, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"kernel");

        let entry = segments.read_entry(&mut stream).unwrap().unwrap();
        assert_eq!(entry.kind, EntryKind::Ramdisk);
        assert_eq!(segments.read_data(&mut stream, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"rdsk");

        assert_eq!(segments.read_entry(&mut stream).unwrap(), None);
    }

    #[test]
    fn truncated_read() {
        let mut segments = Segments::new();
        segments
            .add(EntryKind::DeviceTree, 0, Some(8), true, 0)
            .unwrap();

        let mut stream = IoCursor::new(b"dtb".to_vec());
        let mut buf = [0u8; 16];

        segments.read_entry(&mut stream).unwrap().unwrap();
        assert_eq!(segments.read_data(&mut stream, &mut buf).unwrap(), 3);
        assert_eq!(segments.read_data(&mut stream, &mut buf).unwrap(), 0);
    }

    #[test]
    fn short_read_rejected() {
        let mut segments = Segments::new();
        segments
            .add(EntryKind::Kernel, 0, Some(8), false, 0)
            .unwrap();

        let mut stream = IoCursor::new(b"abc".to_vec());
        let mut buf = [0u8; 16];

        segments.read_entry(&mut stream).unwrap().unwrap();
        assert!(matches!(
            segments.read_data(&mut stream, &mut buf),
            Err(Error::UnexpectedEof(EntryKind::Kernel)),
        ));
    }
}
