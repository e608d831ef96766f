//! Directory decoding against hand-assembled archive bytes.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use pretty_assertions::assert_eq;
use spindle_formats::{
    DirectoryFormat, DirectoryTable, FormatError, HEADER_SIZE, NameHash,
};
use std::io::Cursor;

fn header(version: u32, entries: u32, preload: u32) -> Vec<u8> {
    [version, entries, preload]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn current_record(name: &str, offset: u64, length: u64, compressed: u64) -> Vec<u8> {
    let mut out = NameHash::of(name).value().to_le_bytes().to_vec();
    for field in [offset, length, compressed] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    out
}

fn legacy_record(name: &str, offset: u64, length: u64) -> Vec<u8> {
    let mut out = (name.len() as u16).to_le_bytes().to_vec();
    out.extend_from_slice(name.as_bytes());
    for field in [offset, length, 0] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    out
}

#[test]
fn test_current_directory_with_preload() {
    let mut bytes = header(2, 3, 2);
    bytes.extend(current_record("ui/font.png", 0, 10, 0));
    bytes.extend(current_record("ui/logo.png", 10, 40, 6));
    bytes.extend(current_record("maps/town.bsp", 16, 100, 0));
    let directory_len = bytes.len() as u64;
    bytes.extend(vec![0u8; 116]);

    let table = DirectoryTable::read(&mut Cursor::new(&bytes)).expect("decode");
    assert_eq!(table.format, DirectoryFormat::Current);
    assert_eq!(table.data_offset(), directory_len);
    assert_eq!(table.data_offset(), HEADER_SIZE as u64 + 3 * 28);
    assert_eq!(table.preload_span(), 16);
    assert_eq!(table.entries[1].stored_end(), 16);
    assert_eq!(table.entries[2].name_hash, NameHash::of("MAPS\\TOWN.BSP"));
    table.validate_extents(116).expect("extents");
    assert!(matches!(
        table.validate_extents(115),
        Err(FormatError::EntryOutOfBounds { index: 2, .. })
    ));
}

#[test]
fn test_legacy_directory_names_are_normalized() {
    let mut bytes = header(1, 2, 0);
    bytes.extend(legacy_record("D:\\Quest\\game\\base\\Sound\\Intro.wav", 0, 4));
    bytes.extend(legacy_record("tools/stdshaders/sky.psh", 4, 4));
    bytes.extend(b"abcdefgh");

    let table = DirectoryTable::read(&mut Cursor::new(&bytes)).expect("decode");
    assert_eq!(table.format, DirectoryFormat::Legacy);
    assert_eq!(table.entries[0].name_hash, NameHash::of("sound/intro.wav"));
    assert_eq!(table.entries[1].name_hash, NameHash::of("SKY.PSH"));
    assert_eq!(table.data_offset() as usize, bytes.len() - 8);
}

#[test]
fn test_rejected_headers() {
    let empty = header(2, 0, 0);
    assert!(matches!(
        DirectoryTable::read(&mut Cursor::new(&empty)),
        Err(FormatError::EmptyDirectory)
    ));

    let future = header(7, 1, 0);
    assert!(matches!(
        DirectoryTable::read(&mut Cursor::new(&future)),
        Err(FormatError::UnsupportedVersion(7))
    ));

    let mut overlong_preload = header(2, 1, 2);
    overlong_preload.extend(current_record("a", 0, 1, 0));
    assert!(matches!(
        DirectoryTable::read(&mut Cursor::new(&overlong_preload)),
        Err(FormatError::PreloadOutOfRange { preload: 2, count: 1 })
    ));

    let mut truncated = header(2, 2, 0);
    truncated.extend(current_record("a", 0, 1, 0));
    assert!(DirectoryTable::read(&mut Cursor::new(&truncated)).is_err());
}

#[test]
fn test_legacy_name_length_bound() {
    let mut bytes = header(1, 1, 0);
    bytes.extend(300u16.to_le_bytes());
    bytes.extend(vec![b'a'; 300]);
    bytes.extend([0u8; 24]);
    assert!(DirectoryTable::read(&mut Cursor::new(&bytes)).is_err());
}
