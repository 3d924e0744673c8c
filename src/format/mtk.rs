// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{Read, Seek, SeekFrom, Write},
    mem,
};

use tracing::{debug, warn};
use zerocopy::{FromBytes, FromZeros, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    entry::{Entry, EntryKind},
    format::{
        Error, FormatKind, FormatReader, FormatWriter, Result,
        android::{self, BOOT_MAGIC, MAX_HEADER_OFFSET, RawHeader, find_header},
        segment::Segments,
    },
    header::{Header, HeaderFields},
    stream::{ReadFillExt, Truncate},
};

pub const MTK_MAGIC: [u8; 4] = [0x88, 0x16, 0x88, 0x58];

/// Total on-disk size of the sub-header preceding the kernel and ramdisk
/// payloads. Only the magic and size field carry information; the rest is a
/// type string and 0xff padding supplied by the caller.
pub const MTK_HEADER_SIZE: u64 = 512;

/// Raw on-disk layout for the leading fields of the sub-header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub(crate) struct RawMtkHeader {
    /// Magic value. This should be equal to [`MTK_MAGIC`].
    pub magic: [u8; 4],
    /// Size of the region's payload, excluding the sub-header itself.
    pub size: little_endian::U32,
}

/// Validate the sub-header at the start of a region. Returns false when the
/// region is too short, the magic does not match, or the recorded size is
/// inconsistent with the top-level header.
fn check_sub_header(
    stream: &mut (impl Read + Seek),
    offset: u64,
    expected_payload: u32,
    region: &'static str,
) -> Result<bool> {
    stream
        .seek(SeekFrom::Start(offset))
        .map_err(|e| Error::Io("seek to MTK sub-header", e))?;

    let mut buf = [0u8; mem::size_of::<RawMtkHeader>()];
    let n = stream
        .read_fill(&mut buf)
        .map_err(|e| Error::Io("read MTK sub-header", e))?;
    if n < buf.len() {
        return Ok(false);
    }

    let Ok(raw) = RawMtkHeader::read_from_bytes(&buf) else {
        return Ok(false);
    };

    if raw.magic != MTK_MAGIC {
        return Ok(false);
    }
    if raw.size.get() != expected_payload {
        warn!(
            "Mismatched size in MTK {region} sub-header: {} != {expected_payload}",
            raw.size.get(),
        );
        return Ok(false);
    }

    Ok(true)
}

/// Check that both the kernel and ramdisk regions start with consistent MTK
/// sub-headers.
fn find_sub_headers(
    stream: &mut (impl Read + Seek),
    raw: &RawHeader,
    header_offset: u64,
) -> Result<bool> {
    let kernel_size = raw.kernel_size.get();
    let ramdisk_size = raw.ramdisk_size.get();

    if raw.page_size.get() == 0
        || u64::from(kernel_size) < MTK_HEADER_SIZE
        || u64::from(ramdisk_size) < MTK_HEADER_SIZE
    {
        return Ok(false);
    }

    let offsets = android::section_offsets(raw, header_offset);

    Ok(check_sub_header(
        stream,
        offsets.kernel,
        kernel_size - MTK_HEADER_SIZE as u32,
        "kernel",
    )? && check_sub_header(
        stream,
        offsets.ramdisk,
        ramdisk_size - MTK_HEADER_SIZE as u32,
        "ramdisk",
    )?)
}

/// Reader for MTK boot images. These use the Android layout, except that the
/// kernel and ramdisk payloads are each preceded by a 512-byte sub-header
/// which the top-level size fields include.
pub struct MtkReader {
    header: Option<(RawHeader, u64)>,
    segments: Segments,
}

impl MtkReader {
    pub fn new() -> Self {
        Self {
            header: None,
            segments: Segments::new(),
        }
    }
}

impl Default for MtkReader {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Read + Seek> FormatReader<R> for MtkReader {
    fn kind(&self) -> FormatKind {
        FormatKind::Mtk
    }

    fn bid(&mut self, stream: &mut R, best_bid: u64) -> Result<Option<u64>> {
        let max_bid = 8 * (BOOT_MAGIC.len() + 2 * MTK_MAGIC.len()) as u64;
        if best_bid >= max_bid {
            return Ok(None);
        }

        let Some((raw, offset)) = find_header(stream)? else {
            return Ok(Some(0));
        };

        let mut bid = 8 * BOOT_MAGIC.len() as u64;

        if find_sub_headers(stream, &raw, offset)? {
            debug!("Found MTK sub-headers in both regions");
            bid += 8 * (2 * MTK_MAGIC.len()) as u64;
        }

        self.header = Some((raw, offset));

        Ok(Some(bid))
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
        if !find_sub_headers(stream, &raw, header_offset)? {
            return Err(Error::InvalidData("MTK sub-headers missing or inconsistent"));
        }

        let header = android::build_header(&raw)?;
        let offsets = android::section_offsets(&raw, header_offset);

        let kernel_size = u64::from(raw.kernel_size.get());
        let ramdisk_size = u64::from(raw.ramdisk_size.get());

        self.segments.clear();
        self.segments.add(
            EntryKind::MtkKernelHeader,
            offsets.kernel,
            Some(MTK_HEADER_SIZE),
            false,
            0,
        )?;
        self.segments.add(
            EntryKind::Kernel,
            offsets.kernel + MTK_HEADER_SIZE,
            Some(kernel_size - MTK_HEADER_SIZE),
            false,
            0,
        )?;
        self.segments.add(
            EntryKind::MtkRamdiskHeader,
            offsets.ramdisk,
            Some(MTK_HEADER_SIZE),
            false,
            0,
        )?;
        self.segments.add(
            EntryKind::Ramdisk,
            offsets.ramdisk + MTK_HEADER_SIZE,
            Some(ramdisk_size - MTK_HEADER_SIZE),
            false,
            0,
        )?;

        if raw.second_size.get() > 0 {
            self.segments.add(
                EntryKind::SecondBoot,
                offsets.second,
                Some(raw.second_size.get().into()),
                false,
                0,
            )?;
        }
        if raw.dt_size.get() > 0 {
            self.segments.add(
                EntryKind::DeviceTree,
                offsets.dt,
                Some(raw.dt_size.get().into()),
                false,
                0,
            )?;
        }

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

/// Writer for MTK boot images. The caller provides the two 512-byte
/// sub-headers as ordinary entries; their size fields are back-patched and
/// the image checksum computed when the image is finalized, since neither is
/// known while the payloads are being streamed.
pub struct MtkWriter {
    header: RawHeader,
    file_size: Option<u64>,
    segments: Segments,
}

impl MtkWriter {
    pub fn new() -> Self {
        Self {
            header: RawHeader::new_zeroed(),
            file_size: None,
            segments: Segments::new(),
        }
    }
}

impl Default for MtkWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Read + Write + Seek + Truncate> FormatWriter<W> for MtkWriter {
    fn kind(&self) -> FormatKind {
        FormatKind::Mtk
    }

    fn supported_fields(&self) -> HeaderFields {
        android::SUPPORTED_FIELDS
    }

    fn write_header(&mut self, stream: &mut W, header: &Header) -> Result<()> {
        let raw = android::build_raw_header(header)?;
        let page_size = u64::from(raw.page_size.get());

        // Entries may be left over from a failed call that the caller is
        // retrying.
        self.segments.clear();
        self.segments
            .add(EntryKind::MtkKernelHeader, 0, None, false, 0)?;
        self.segments
            .add(EntryKind::Kernel, 0, None, false, page_size)?;
        self.segments
            .add(EntryKind::MtkRamdiskHeader, 0, None, false, 0)?;
        self.segments
            .add(EntryKind::Ramdisk, 0, None, false, page_size)?;
        self.segments
            .add(EntryKind::SecondBoot, 0, None, false, page_size)?;
        self.segments
            .add(EntryKind::DeviceTree, 0, None, false, page_size)?;

        // The header is written during close. Leave a hole for its page.
        stream
            .seek(SeekFrom::Start(page_size))
            .map_err(|e| Error::Io("seek past header page", e))?;

        self.header = raw;
        self.file_size = None;

        Ok(())
    }

    fn get_entry(&mut self, _stream: &mut W) -> Result<Option<Entry>> {
        Ok(self.segments.get_entry())
    }

    fn write_entry(&mut self, stream: &mut W, entry: &Entry) -> Result<()> {
        self.segments.write_entry(stream, entry.kind)
    }

    fn write_data(&mut self, stream: &mut W, buf: &[u8]) -> Result<usize> {
        self.segments.write_data(stream, buf)
    }

    fn finish_entry(&mut self, stream: &mut W) -> Result<()> {
        let finished = self.segments.finish_entry(stream)?;
        let size = finished.size.unwrap_or(0);

        match finished.kind {
            EntryKind::MtkKernelHeader | EntryKind::MtkRamdiskHeader => {
                if size != MTK_HEADER_SIZE {
                    return Err(Error::InvalidSubHeaderSize {
                        kind: finished.kind,
                        size,
                    });
                }
            }
            // The top-level size fields must fit the sub-header too.
            EntryKind::Kernel | EntryKind::Ramdisk => {
                if size > u64::from(u32::MAX) - MTK_HEADER_SIZE {
                    return Err(Error::EntryTooLarge {
                        kind: finished.kind,
                        size,
                    });
                }
            }
            _ => {
                if size > u64::from(u32::MAX) {
                    return Err(Error::EntryTooLarge {
                        kind: finished.kind,
                        size,
                    });
                }
            }
        }

        match finished.kind {
            EntryKind::Kernel => self.header.kernel_size = ((size + MTK_HEADER_SIZE) as u32).into(),
            EntryKind::Ramdisk => {
                self.header.ramdisk_size = ((size + MTK_HEADER_SIZE) as u32).into();
            }
            EntryKind::SecondBoot => self.header.second_size = (size as u32).into(),
            EntryKind::DeviceTree => self.header.dt_size = (size as u32).into(),
            _ => {}
        }

        Ok(())
    }

    fn close(&mut self, stream: &mut W) -> Result<()> {
        let file_size = match self.file_size {
            Some(size) => size,
            None => {
                let pos = stream
                    .stream_position()
                    .map_err(|e| Error::Io("get file size", e))?;
                self.file_size = Some(pos);
                pos
            }
        };

        // Only finalize once every entry has been written.
        if self.segments.is_complete() {
            stream
                .truncate(file_size)
                .map_err(|e| Error::Io("truncate image", e))?;

            // Back-patch the sub-header size fields now that the payload
            // sizes are known.
            for entry in self.segments.entries() {
                let region_size = match entry.kind {
                    EntryKind::MtkKernelHeader => self.header.kernel_size.get(),
                    EntryKind::MtkRamdiskHeader => self.header.ramdisk_size.get(),
                    _ => continue,
                };
                let payload_size = region_size - MTK_HEADER_SIZE as u32;
                let field_offset = entry.offset + mem::offset_of!(RawMtkHeader, size) as u64;

                stream
                    .seek(SeekFrom::Start(field_offset))
                    .map_err(|e| Error::Io("seek to MTK size field", e))?;
                stream
                    .write_all(&payload_size.to_le_bytes())
                    .map_err(|e| Error::Io("write MTK size field", e))?;
            }

            let id = android::compute_id(stream, self.segments.entries())?;
            self.header.id[..id.as_ref().len()].copy_from_slice(id.as_ref());

            stream
                .seek(SeekFrom::Start(0))
                .map_err(|e| Error::Io("seek to header", e))?;
            self.header
                .write_to_io(&mut *stream)
                .map_err(|e| Error::Io("write header", e))?;

            debug!("Finalized MTK boot image of {file_size} bytes");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_sub_header_layout() {
        assert_eq!(mem::offset_of!(RawMtkHeader, size), 4);
        assert!(mem::size_of::<RawMtkHeader>() as u64 <= MTK_HEADER_SIZE);
    }
}
