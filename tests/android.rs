/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::io::Cursor;

use bootimg::{
    entry::EntryKind,
    format::{
        FormatKind, FormatReader,
        android::{AndroidReader, BOOT_MAGIC, SAMSUNG_SEANDROID_MAGIC},
    },
    header::Header,
    reader::Reader,
    writer::Writer,
};

const PAGE_SIZE: usize = 2048;

fn padded(data: &[u8], size: usize) -> Vec<u8> {
    assert!(data.len() <= size);

    let mut result = data.to_vec();
    result.resize(size, 0);
    result
}

fn raw_header(
    kernel_size: u32,
    ramdisk_size: u32,
    second_size: u32,
    dt_size: u32,
    page_size: u32,
) -> Vec<u8> {
    let mut buf = vec![];
    buf.extend_from_slice(&BOOT_MAGIC);
    for value in [
        kernel_size,
        0x1000_8000,
        ramdisk_size,
        0x1100_0000,
        second_size,
        0x1200_0000,
        0x1000_0100,
        page_size,
        dt_size,
        0,
    ] {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf.extend_from_slice(&padded(b"myboard", 16));
    buf.extend_from_slice(&padded(b"console=ttyS0", 512));
    buf.extend_from_slice(&[0u8; 32]);

    assert_eq!(buf.len(), 608);
    buf
}

fn align_to(buf: &mut Vec<u8>, page_size: usize) {
    let remainder = buf.len() % page_size;
    if remainder != 0 {
        buf.resize(buf.len() + page_size - remainder, 0);
    }
}

/// Assemble an image by hand, with the header at an arbitrary offset.
fn build_image(
    header_offset: usize,
    kernel: &[u8],
    ramdisk: &[u8],
    second: &[u8],
    dt: &[u8],
) -> Vec<u8> {
    let mut buf = vec![0x55u8; header_offset];
    buf.extend_from_slice(&raw_header(
        kernel.len() as u32,
        ramdisk.len() as u32,
        second.len() as u32,
        dt.len() as u32,
        PAGE_SIZE as u32,
    ));
    align_to(&mut buf, PAGE_SIZE);

    for section in [kernel, ramdisk, second, dt] {
        buf.extend_from_slice(section);
        align_to(&mut buf, PAGE_SIZE);
    }

    buf
}

fn fill_header(header: &mut Header) {
    header.set_page_size(Some(PAGE_SIZE as u32)).unwrap();
    header.set_board_name(Some("myboard".to_owned())).unwrap();
    header
        .set_kernel_cmdline(Some("console=ttyS0".to_owned()))
        .unwrap();
    header.set_kernel_address(Some(0x1000_8000)).unwrap();
    header.set_ramdisk_address(Some(0x1100_0000)).unwrap();
    header.set_secondboot_address(Some(0x1200_0000)).unwrap();
    header.set_kernel_tags_address(Some(0x1000_0100)).unwrap();
}

fn write_image(payloads: &[(EntryKind, &[u8])]) -> Vec<u8> {
    let mut writer = Writer::new(Cursor::new(Vec::new()), FormatKind::Android).unwrap();

    let mut header = writer.get_header();
    fill_header(&mut header);
    writer.write_header(&header).unwrap();

    while let Some(entry) = writer.get_entry().unwrap() {
        writer.write_entry(&entry).unwrap();

        if let Some((_, data)) = payloads.iter().find(|(kind, _)| *kind == entry.kind) {
            writer.write_data(data).unwrap();
        }

        writer.finish_entry().unwrap();
    }

    writer.close().unwrap();

    writer.into_inner().into_inner()
}

fn read_all_entries(reader: &mut Reader<Cursor<Vec<u8>>>) -> Vec<(EntryKind, Vec<u8>)> {
    let mut entries = vec![];
    let mut buf = [0u8; 4096];

    while let Some(entry) = reader.read_entry().unwrap() {
        let mut data = vec![];

        loop {
            let n = reader.read_data(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }

        entries.push((entry.kind, data));
    }

    entries
}

#[test]
fn round_trip() {
    let image = write_image(&[
        (EntryKind::Kernel, b"kernel data"),
        (EntryKind::Ramdisk, b"ramdisk data"),
        (EntryKind::SecondBoot, b"second data"),
        (EntryKind::DeviceTree, b"dtb data"),
    ]);

    let mut reader = Reader::new(Cursor::new(image));
    reader.enable_all_formats();

    let header = reader.read_header().unwrap();
    assert_eq!(reader.format(), Some(FormatKind::Android));
    assert_eq!(header.page_size(), Some(PAGE_SIZE as u32));
    assert_eq!(header.board_name(), Some("myboard"));
    assert_eq!(header.kernel_cmdline(), Some("console=ttyS0"));
    assert_eq!(header.kernel_address(), Some(0x1000_8000));
    assert_eq!(header.ramdisk_address(), Some(0x1100_0000));
    assert_eq!(header.secondboot_address(), Some(0x1200_0000));
    assert_eq!(header.kernel_tags_address(), Some(0x1000_0100));

    let entries = read_all_entries(&mut reader);
    assert_eq!(
        entries,
        vec![
            (EntryKind::Kernel, b"kernel data".to_vec()),
            (EntryKind::Ramdisk, b"ramdisk data".to_vec()),
            (EntryKind::SecondBoot, b"second data".to_vec()),
            (EntryKind::DeviceTree, b"dtb data".to_vec()),
        ],
    );
}

#[test]
fn round_trip_without_optional_sections() {
    let image = write_image(&[
        (EntryKind::Kernel, b"kernel data"),
        (EntryKind::Ramdisk, b"ramdisk data"),
    ]);

    let mut reader = Reader::new(Cursor::new(image));
    reader.enable_all_formats();
    reader.read_header().unwrap();

    // Zero-size sections must be omitted entirely.
    let entries = read_all_entries(&mut reader);
    assert_eq!(
        entries,
        vec![
            (EntryKind::Kernel, b"kernel data".to_vec()),
            (EntryKind::Ramdisk, b"ramdisk data".to_vec()),
        ],
    );
}

#[test]
fn image_checksum() {
    let image = write_image(&[
        (EntryKind::Kernel, b"kernel data"),
        (EntryKind::Ramdisk, b"ramdisk data"),
        (EntryKind::DeviceTree, b"dtb data"),
    ]);

    let mut context = ring::digest::Context::new(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY);
    context.update(b"kernel data");
    context.update(&11u32.to_le_bytes());
    context.update(b"ramdisk data");
    context.update(&12u32.to_le_bytes());
    // The finished zero-size second bootloader still contributes its size.
    context.update(&0u32.to_le_bytes());
    context.update(b"dtb data");
    context.update(&8u32.to_le_bytes());
    let digest = context.finish();

    assert_eq!(&image[576..596], digest.as_ref());
    assert_eq!(&image[596..608], &[0u8; 12]);
}

#[test]
fn header_at_nonzero_offset() {
    let image = build_image(512, b"kernel data", b"ramdisk data", b"", b"");

    let mut adapter = AndroidReader::new();
    let bid = adapter.bid(&mut Cursor::new(image.clone()), 0).unwrap();
    assert_eq!(bid, Some(64));

    let mut reader = Reader::new(Cursor::new(image));
    reader.enable_format(FormatKind::Android);
    reader.read_header().unwrap();

    let entries = read_all_entries(&mut reader);
    assert_eq!(
        entries,
        vec![
            (EntryKind::Kernel, b"kernel data".to_vec()),
            (EntryKind::Ramdisk, b"ramdisk data".to_vec()),
        ],
    );
}

#[test]
fn bid_with_seandroid_magic() {
    let mut image = build_image(0, b"kernel data", b"ramdisk data", b"", b"");

    let mut adapter = AndroidReader::new();
    let bid = adapter.bid(&mut Cursor::new(image.clone()), 0).unwrap();
    assert_eq!(bid, Some(64));

    image.extend_from_slice(&SAMSUNG_SEANDROID_MAGIC);

    let mut adapter = AndroidReader::new();
    let bid = adapter.bid(&mut Cursor::new(image), 0).unwrap();
    assert_eq!(bid, Some(64 + 8 * SAMSUNG_SEANDROID_MAGIC.len() as u64));
}

#[test]
fn bid_cannot_win() {
    let image = build_image(0, b"kernel data", b"ramdisk data", b"", b"");

    let mut adapter = AndroidReader::new();
    let bid = adapter.bid(&mut Cursor::new(image), 192).unwrap();
    assert_eq!(bid, None);
}

#[test]
fn no_format_matches() {
    let mut reader = Reader::new(Cursor::new(vec![0x55u8; 8192]));
    reader.enable_all_formats();

    assert!(matches!(
        reader.read_header(),
        Err(bootimg::format::Error::UnknownFormat),
    ));
}

#[test]
fn tie_goes_to_earlier_format() {
    // A plain image matches the android and bump bidders equally well (the
    // trailing magic is missing in both cases).
    let image = build_image(0, b"kernel data", b"ramdisk data", b"", b"");

    let mut reader = Reader::new(Cursor::new(image.clone()));
    reader.enable_format(FormatKind::Android);
    reader.enable_format(FormatKind::Bump);
    reader.read_header().unwrap();
    assert_eq!(reader.format(), Some(FormatKind::Android));

    let mut reader = Reader::new(Cursor::new(image));
    reader.enable_format(FormatKind::Bump);
    reader.enable_format(FormatKind::Android);
    reader.read_header().unwrap();
    assert_eq!(reader.format(), Some(FormatKind::Bump));
}

#[test]
fn truncated_device_tree() {
    let mut image = build_image(0, b"kernel data", b"ramdisk data", b"", b"dtb data");
    // Cut the image in the middle of the device tree section.
    image.truncate(image.len() - PAGE_SIZE + 4);

    // Lenient mode returns the data up to EOF.
    let mut reader = Reader::new(Cursor::new(image.clone()));
    reader.enable_format(FormatKind::Android);
    reader.read_header().unwrap();

    let entry = reader.go_to_entry(Some(EntryKind::DeviceTree)).unwrap();
    assert_eq!(entry.map(|e| e.kind), Some(EntryKind::DeviceTree));

    let mut buf = [0u8; 4096];
    assert_eq!(reader.read_data(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"dtb ");
    assert_eq!(reader.read_data(&mut buf).unwrap(), 0);

    // Strict mode treats the truncation as an error.
    let mut reader = Reader::new(Cursor::new(image));
    reader.enable_format(FormatKind::Android);
    reader.set_option("strict", "true").unwrap();
    reader.read_header().unwrap();

    reader.go_to_entry(Some(EntryKind::DeviceTree)).unwrap();
    assert!(matches!(
        reader.read_data(&mut buf),
        Err(bootimg::format::Error::UnexpectedEof(EntryKind::DeviceTree)),
    ));
}

#[test]
fn unknown_option_is_ignored() {
    let mut reader = Reader::new(Cursor::new(vec![]));
    reader.enable_all_formats();

    reader.set_option("does-not-exist", "1").unwrap();
}

#[test]
fn invalid_page_size_leaves_stream_untouched() {
    let mut writer = Writer::new(Cursor::new(Vec::new()), FormatKind::Android).unwrap();

    let mut header = writer.get_header();
    fill_header(&mut header);
    header.set_page_size(Some(1024)).unwrap();

    let err = writer.write_header(&header).unwrap_err();
    assert!(matches!(err, bootimg::format::Error::InvalidPageSize(1024)));
    assert!(!err.is_fatal());

    header.set_page_size(None).unwrap();
    let err = writer.write_header(&header).unwrap_err();
    assert!(matches!(err, bootimg::format::Error::MissingPageSize));

    let stream = writer.into_inner();
    assert_eq!(stream.position(), 0);
    assert!(stream.into_inner().is_empty());
}

#[test]
fn retry_header_after_recoverable_failure() {
    let mut writer = Writer::new(Cursor::new(Vec::new()), FormatKind::Android).unwrap();

    let mut header = writer.get_header();
    fill_header(&mut header);
    header.set_page_size(Some(1024)).unwrap();
    writer.write_header(&header).unwrap_err();

    // The failed call must not leave any entry state behind.
    header.set_page_size(Some(PAGE_SIZE as u32)).unwrap();
    writer.write_header(&header).unwrap();

    while let Some(entry) = writer.get_entry().unwrap() {
        writer.write_entry(&entry).unwrap();
        if entry.kind == EntryKind::Kernel {
            writer.write_data(b"kernel data").unwrap();
        } else if entry.kind == EntryKind::Ramdisk {
            writer.write_data(b"ramdisk data").unwrap();
        }
        writer.finish_entry().unwrap();
    }
    writer.close().unwrap();

    let image = writer.into_inner().into_inner();

    let mut reader = Reader::new(Cursor::new(image));
    reader.enable_all_formats();
    reader.read_header().unwrap();
    let entries = read_all_entries(&mut reader);
    assert_eq!(
        entries,
        vec![
            (EntryKind::Kernel, b"kernel data".to_vec()),
            (EntryKind::Ramdisk, b"ramdisk data".to_vec()),
        ],
    );
}

#[test]
fn board_name_length_limit() {
    let mut writer = Writer::new(Cursor::new(Vec::new()), FormatKind::Android).unwrap();

    let mut header = writer.get_header();
    fill_header(&mut header);

    // 16 bytes leaves no room for the NUL terminator.
    header.set_board_name(Some("x".repeat(16))).unwrap();
    assert!(matches!(
        writer.write_header(&header),
        Err(bootimg::format::Error::StringTooLong("board_name")),
    ));

    header.set_board_name(Some("x".repeat(15))).unwrap();
    writer.write_header(&header).unwrap();
}

#[test]
fn alignment_after_each_section() {
    let image = write_image(&[
        (EntryKind::Kernel, &[0xAAu8; 3000]),
        (EntryKind::Ramdisk, &[0xBBu8; 5000]),
        (EntryKind::SecondBoot, &[0xCCu8; 100]),
        (EntryKind::DeviceTree, &[0xDDu8; 1]),
    ]);

    // Every section begins on a page boundary and the file ends on one.
    assert_eq!(image.len() % PAGE_SIZE, 0);
    assert_eq!(&image[2048..5048], &[0xAAu8; 3000][..]);
    assert_eq!(&image[5048..6144], &[0u8; 1096][..]);
    assert_eq!(&image[6144..11144], &[0xBBu8; 5000][..]);
    assert_eq!(&image[12288..12388], &[0xCCu8; 100][..]);
    assert_eq!(image[14336], 0xDD);
    assert_eq!(image.len(), 16384);
}
