// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{Read, Seek, SeekFrom, Write},
    mem, str,
};

use memchr::memmem;
use ring::digest::{self, Context};
use tracing::debug;
use zerocopy::{FromBytes, FromZeros, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    entry::{Entry, EntryKind},
    format::{
        Error, FormatKind, FormatReader, FormatWriter, Result,
        padding::{self, ZeroPadding},
        segment::{SegmentEntry, Segments},
    },
    header::{Header, HeaderFields},
    stream::{ReadFillExt, Truncate},
};

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";
pub const BOOT_NAME_SIZE: usize = 16;
pub const BOOT_ARGS_SIZE: usize = 512;

/// Maximum offset at which the header may start within the image.
pub const MAX_HEADER_OFFSET: usize = 512;

pub const SAMSUNG_SEANDROID_MAGIC: [u8; 16] = *b"SEANDROIDENFORCE";

/// Page sizes accepted when writing an image.
pub const PAGE_SIZES: [u32; 7] = [2048, 4096, 8192, 16384, 32768, 65536, 131072];

pub(crate) const SUPPORTED_FIELDS: HeaderFields = HeaderFields::BOARD_NAME
    .union(HeaderFields::KERNEL_CMDLINE)
    .union(HeaderFields::PAGE_SIZE)
    .union(HeaderFields::KERNEL_ADDRESS)
    .union(HeaderFields::RAMDISK_ADDRESS)
    .union(HeaderFields::SECONDBOOT_ADDRESS)
    .union(HeaderFields::KERNEL_TAGS_ADDRESS);

/// Raw on-disk layout for the boot image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub(crate) struct RawHeader {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    pub magic: [u8; 8],
    pub kernel_size: little_endian::U32,
    pub kernel_addr: little_endian::U32,
    pub ramdisk_size: little_endian::U32,
    pub ramdisk_addr: little_endian::U32,
    pub second_size: little_endian::U32,
    pub second_addr: little_endian::U32,
    pub tags_addr: little_endian::U32,
    pub page_size: little_endian::U32,
    pub dt_size: little_endian::U32,
    /// Not used by any known bootloader. Always written as zero.
    pub _unused: little_endian::U32,
    pub name: [u8; BOOT_NAME_SIZE],
    pub cmdline: [u8; BOOT_ARGS_SIZE],
    /// Image checksum (20-byte SHA-1 followed by zero padding).
    pub id: [u8; 32],
}

/// Scan the beginning of the stream for [`BOOT_MAGIC`] and parse the header at
/// the first match. Returns the header and its offset, or `None` when the
/// magic does not appear within the first [`MAX_HEADER_OFFSET`] bytes or the
/// header extends past EOF.
pub(crate) fn find_header<R: Read + Seek>(stream: &mut R) -> Result<Option<(RawHeader, u64)>> {
    let mut buf = [0u8; MAX_HEADER_OFFSET + mem::size_of::<RawHeader>()];

    stream
        .seek(SeekFrom::Start(0))
        .map_err(|e| Error::Io("seek to start of image", e))?;

    let n = stream
        .read_fill(&mut buf)
        .map_err(|e| Error::Io("read header window", e))?;

    let Some(offset) = memmem::find(&buf[..n], &BOOT_MAGIC) else {
        return Ok(None);
    };

    // A match too close to the end of the window leaves no room for the full
    // header, which also rejects matches past MAX_HEADER_OFFSET.
    let Ok((raw, _)) = RawHeader::read_from_prefix(&buf[offset..n]) else {
        return Ok(None);
    };

    debug_assert_eq!(raw.magic, BOOT_MAGIC);

    Ok(Some((raw, offset as u64)))
}

/// Absolute offsets of each section as computed from the header fields.
pub(crate) struct SectionOffsets {
    pub kernel: u64,
    pub ramdisk: u64,
    pub second: u64,
    pub dt: u64,
}

/// Compute the absolute offsets of each section. The header occupies the rest
/// of its page and every section is padded to the page size.
pub(crate) fn section_offsets(raw: &RawHeader, header_offset: u64) -> SectionOffsets {
    let page_size = u64::from(raw.page_size.get());

    // Summing a handful of u32-sized fields cannot overflow a u64. Whether
    // the file is actually long enough is checked when entries are read.
    let mut pos = header_offset + mem::size_of::<RawHeader>() as u64;
    pos += padding::calc(pos, page_size);

    let kernel = pos;
    pos += u64::from(raw.kernel_size.get());
    pos += padding::calc(pos, page_size);

    let ramdisk = pos;
    pos += u64::from(raw.ramdisk_size.get());
    pos += padding::calc(pos, page_size);

    let second = pos;
    pos += u64::from(raw.second_size.get());
    pos += padding::calc(pos, page_size);

    let dt = pos;

    SectionOffsets {
        kernel,
        ramdisk,
        second,
        dt,
    }
}

/// Offset just past the padded device tree section, where the Samsung
/// SEAndroid and Bump trailing magics live. `None` if the header's page size
/// is zero.
fn trailing_magic_offset(raw: &RawHeader) -> Option<u64> {
    let page_size = u64::from(raw.page_size.get());
    if page_size == 0 {
        return None;
    }

    // The header cannot exceed the first page, regardless of its offset.
    let mut pos = page_size;

    pos += u64::from(raw.kernel_size.get());
    pos += padding::calc(pos, page_size);
    pos += u64::from(raw.ramdisk_size.get());
    pos += padding::calc(pos, page_size);
    pos += u64::from(raw.second_size.get());
    pos += padding::calc(pos, page_size);
    pos += u64::from(raw.dt_size.get());
    pos += padding::calc(pos, page_size);

    Some(pos)
}

/// Check for a known trailing magic after the last section. Returns the
/// magic's offset when present.
pub(crate) fn find_trailing_magic<R: Read + Seek>(
    stream: &mut R,
    raw: &RawHeader,
    magic: &[u8; 16],
) -> Result<Option<u64>> {
    let Some(pos) = trailing_magic_offset(raw) else {
        return Ok(None);
    };

    stream
        .seek(SeekFrom::Start(pos))
        .map_err(|e| Error::Io("seek to trailing magic", e))?;

    let mut buf = [0u8; 16];
    let n = stream
        .read_fill(&mut buf)
        .map_err(|e| Error::Io("read trailing magic", e))?;

    Ok((n == magic.len() && buf == *magic).then_some(pos))
}

/// Translate the raw header into the neutral representation.
pub(crate) fn build_header(raw: &RawHeader) -> Result<Header> {
    let name = raw.name.trim_at_nul();
    let name = str::from_utf8(name).map_err(|e| Error::StringNotUtf8("name", name.to_vec(), e))?;

    let cmdline = raw.cmdline.trim_at_nul();
    let cmdline = str::from_utf8(cmdline)
        .map_err(|e| Error::StringNotUtf8("cmdline", cmdline.to_vec(), e))?;

    let mut header = Header::new(SUPPORTED_FIELDS);
    header.set_board_name(Some(name.to_owned()))?;
    header.set_kernel_cmdline(Some(cmdline.to_owned()))?;
    header.set_page_size(Some(raw.page_size.get()))?;
    header.set_kernel_address(Some(raw.kernel_addr.get()))?;
    header.set_ramdisk_address(Some(raw.ramdisk_addr.get()))?;
    header.set_secondboot_address(Some(raw.second_addr.get()))?;
    header.set_kernel_tags_address(Some(raw.tags_addr.get()))?;

    Ok(header)
}

/// Construct a raw header from the neutral representation, validating every
/// provided field. Sizes and the checksum are left zeroed; they are filled in
/// when the image is finalized.
pub(crate) fn build_raw_header(header: &Header) -> Result<RawHeader> {
    let mut raw = RawHeader::new_zeroed();
    raw.magic = BOOT_MAGIC;

    if let Some(addr) = header.kernel_address() {
        raw.kernel_addr = addr.into();
    }
    if let Some(addr) = header.ramdisk_address() {
        raw.ramdisk_addr = addr.into();
    }
    if let Some(addr) = header.secondboot_address() {
        raw.second_addr = addr.into();
    }
    if let Some(addr) = header.kernel_tags_address() {
        raw.tags_addr = addr.into();
    }

    let Some(page_size) = header.page_size() else {
        return Err(Error::MissingPageSize);
    };
    if !PAGE_SIZES.contains(&page_size) {
        return Err(Error::InvalidPageSize(page_size));
    }
    raw.page_size = page_size.into();

    if let Some(name) = header.board_name() {
        // The field must have room for a NUL terminator.
        if name.len() >= BOOT_NAME_SIZE {
            return Err(Error::StringTooLong("board_name"));
        }
        raw.name[..name.len()].copy_from_slice(name.as_bytes());
    }
    if let Some(cmdline) = header.kernel_cmdline() {
        if cmdline.len() >= BOOT_ARGS_SIZE {
            return Err(Error::StringTooLong("kernel_cmdline"));
        }
        raw.cmdline[..cmdline.len()].copy_from_slice(cmdline.as_bytes());
    }

    Ok(raw)
}

/// Seed the entry table from the header fields. Sections with size zero are
/// omitted entirely.
pub(crate) fn seed_reader_entries(
    segments: &mut Segments,
    raw: &RawHeader,
    header_offset: u64,
    allow_truncated_dt: bool,
) -> Result<()> {
    let offsets = section_offsets(raw, header_offset);

    segments.clear();
    segments.add(
        EntryKind::Kernel,
        offsets.kernel,
        Some(raw.kernel_size.get().into()),
        false,
        0,
    )?;
    segments.add(
        EntryKind::Ramdisk,
        offsets.ramdisk,
        Some(raw.ramdisk_size.get().into()),
        false,
        0,
    )?;

    if raw.second_size.get() > 0 {
        segments.add(
            EntryKind::SecondBoot,
            offsets.second,
            Some(raw.second_size.get().into()),
            false,
            0,
        )?;
    }
    if raw.dt_size.get() > 0 {
        segments.add(
            EntryKind::DeviceTree,
            offsets.dt,
            Some(raw.dt_size.get().into()),
            allow_truncated_dt,
            0,
        )?;
    }

    Ok(())
}

/// Compute the image checksum stored in the header's `id` field. Each entry
/// contributes its payload bytes in table order, followed by the
/// little-endian size of its region. MTK sub-header entries contribute only
/// their bytes, but their sizes are folded into the kernel and ramdisk region
/// sizes. A zero-size device tree contributes nothing at all.
///
/// This runs as a separate pass over the written data because the region
/// sizes are not all known until every entry has been finished.
pub(crate) fn compute_id(
    stream: &mut (impl Read + Seek),
    entries: &[SegmentEntry],
) -> Result<digest::Digest> {
    let mut context = Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    let mut buf = [0u8; 10240];
    let mut kernel_hdr_size = 0u32;
    let mut ramdisk_hdr_size = 0u32;

    for entry in entries {
        let size = entry.size.unwrap_or(0);

        stream
            .seek(SeekFrom::Start(entry.offset))
            .map_err(|e| Error::Io("seek to entry", e))?;

        let mut remain = size;
        while remain > 0 {
            let to_read = remain.min(buf.len() as u64) as usize;
            stream
                .read_exact(&mut buf[..to_read])
                .map_err(|e| Error::Io("read entry for checksum", e))?;
            context.update(&buf[..to_read]);
            remain -= to_read as u64;
        }

        // Sizes were validated to fit in u32 when the entries were finished.
        let size = size as u32;
        let region_size = match entry.kind {
            EntryKind::MtkKernelHeader => {
                kernel_hdr_size = size;
                continue;
            }
            EntryKind::MtkRamdiskHeader => {
                ramdisk_hdr_size = size;
                continue;
            }
            EntryKind::Kernel => size + kernel_hdr_size,
            EntryKind::Ramdisk => size + ramdisk_hdr_size,
            EntryKind::SecondBoot => size,
            EntryKind::DeviceTree => {
                if size == 0 {
                    continue;
                }
                size
            }
        };

        context.update(&region_size.to_le_bytes());
    }

    Ok(context.finish())
}

pub(crate) fn parse_strict(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value.eq_ignore_ascii_case("y")
        || value == "1"
}

/// Reader for plain Android boot images, including those carrying the Samsung
/// SEAndroid trailing magic.
pub struct AndroidReader {
    header: Option<(RawHeader, u64)>,
    samsung_offset: Option<u64>,
    allow_truncated_dt: bool,
    segments: Segments,
}

impl AndroidReader {
    pub fn new() -> Self {
        Self {
            header: None,
            samsung_offset: None,
            // Tolerate a truncated device tree unless told otherwise.
            allow_truncated_dt: true,
            segments: Segments::new(),
        }
    }
}

impl Default for AndroidReader {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Read + Seek> FormatReader<R> for AndroidReader {
    fn kind(&self) -> FormatKind {
        FormatKind::Android
    }

    fn bid(&mut self, stream: &mut R, best_bid: u64) -> Result<Option<u64>> {
        let max_bid = 8 * (BOOT_MAGIC.len() + SAMSUNG_SEANDROID_MAGIC.len()) as u64;
        if best_bid >= max_bid {
            return Ok(None);
        }

        let Some((raw, offset)) = find_header(stream)? else {
            return Ok(Some(0));
        };

        let mut bid = 8 * BOOT_MAGIC.len() as u64;

        self.samsung_offset = find_trailing_magic(stream, &raw, &SAMSUNG_SEANDROID_MAGIC)?;
        if self.samsung_offset.is_some() {
            debug!("Found SEAndroid magic at offset {:?}", self.samsung_offset);
            bid += 8 * SAMSUNG_SEANDROID_MAGIC.len() as u64;
        }

        self.header = Some((raw, offset));

        Ok(Some(bid))
    }

    fn set_option(&mut self, key: &str, value: &str) -> Result<bool> {
        if key == "strict" {
            self.allow_truncated_dt = !parse_strict(value);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn read_header(&mut self, stream: &mut R) -> Result<Header> {
        // A bid might not have been performed if the caller forced the format.
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

        let header = build_header(&raw)?;

        seed_reader_entries(
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

/// Writer for plain Android boot images.
pub struct AndroidWriter {
    header: RawHeader,
    file_size: Option<u64>,
    segments: Segments,
}

impl AndroidWriter {
    pub fn new() -> Self {
        Self {
            header: RawHeader::new_zeroed(),
            file_size: None,
            segments: Segments::new(),
        }
    }
}

impl Default for AndroidWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Read + Write + Seek + Truncate> FormatWriter<W> for AndroidWriter {
    fn kind(&self) -> FormatKind {
        FormatKind::Android
    }

    fn supported_fields(&self) -> HeaderFields {
        SUPPORTED_FIELDS
    }

    fn write_header(&mut self, stream: &mut W, header: &Header) -> Result<()> {
        let raw = build_raw_header(header)?;
        let page_size = u64::from(raw.page_size.get());

        // Entries may be left over from a failed call that the caller is
        // retrying.
        self.segments.clear();
        self.segments
            .add(EntryKind::Kernel, 0, None, false, page_size)?;
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

        if size > u64::from(u32::MAX) {
            return Err(Error::EntryTooLarge {
                kind: finished.kind,
                size,
            });
        }
        let size = size as u32;

        match finished.kind {
            EntryKind::Kernel => self.header.kernel_size = size.into(),
            EntryKind::Ramdisk => self.header.ramdisk_size = size.into(),
            EntryKind::SecondBoot => self.header.second_size = size.into(),
            EntryKind::DeviceTree => self.header.dt_size = size.into(),
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

            let id = compute_id(stream, self.segments.entries())?;
            self.header.id[..id.as_ref().len()].copy_from_slice(id.as_ref());

            stream
                .seek(SeekFrom::Start(0))
                .map_err(|e| Error::Io("seek to header", e))?;
            self.header
                .write_to_io(&mut *stream)
                .map_err(|e| Error::Io("write header", e))?;

            debug!("Finalized boot image of {file_size} bytes");
        }

        Ok(())
    }
}
