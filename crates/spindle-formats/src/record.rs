//! Directory records

use crate::name::{NameHash, normalize_legacy_name};
use crate::MAX_NAME_LENGTH;
use binrw::{BinRead, BinWrite};

/// Encoded size of a current-format record
pub const ENTRY_RECORD_SIZE: u64 = 28;

/// Location and size of one entry inside an archive
///
/// Offsets are relative to the start of the data section, which follows
/// the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BinRead, BinWrite)]
#[brw(little)]
pub struct DirectoryEntry {
    /// Caseless hash of the normalized name
    pub name_hash: NameHash,
    /// Offset of the stored bytes in the data section
    pub offset: u64,
    /// Logical (decoded) length
    pub length: u64,
    /// Stored length of the zlib stream, 0 for stored entries
    pub compressed_length: u64,
}

impl DirectoryEntry {
    /// Whether the stored bytes are a zlib stream
    pub const fn is_compressed(&self) -> bool {
        self.compressed_length > 0
    }

    /// Number of bytes the entry occupies in the data section
    pub const fn stored_length(&self) -> u64 {
        if self.is_compressed() {
            self.compressed_length
        } else {
            self.length
        }
    }

    /// End of the stored bytes, saturating on hostile input
    pub const fn stored_end(&self) -> u64 {
        self.offset.saturating_add(self.stored_length())
    }
}

/// Legacy variable-size record
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct LegacyEntryRecord {
    /// Length of the name that follows
    #[br(assert(name_length as usize <= MAX_NAME_LENGTH))]
    pub name_length: u16,
    /// Full entry name as stored by the packer
    #[br(count = name_length)]
    pub name: Vec<u8>,
    /// Offset of the stored bytes in the data section
    pub offset: u64,
    /// Logical (decoded) length
    pub length: u64,
    /// Stored length of the zlib stream, 0 for stored entries
    pub compressed_length: u64,
}

impl LegacyEntryRecord {
    /// Build a record for `name`
    pub fn new(name: &str, offset: u64, length: u64, compressed_length: u64) -> Self {
        let name = name.as_bytes().to_vec();
        Self {
            name_length: u16::try_from(name.len()).unwrap_or(u16::MAX),
            name,
            offset,
            length,
            compressed_length,
        }
    }

    /// Name after install-prefix stripping and case folding
    pub fn normalized_name(&self) -> String {
        normalize_legacy_name(&String::from_utf8_lossy(&self.name))
    }

    /// Convert to the hashed representation
    pub fn to_entry(&self) -> DirectoryEntry {
        DirectoryEntry {
            name_hash: NameHash::of(&self.normalized_name()),
            offset: self.offset,
            length: self.length,
            compressed_length: self.compressed_length,
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn test_entry_record_is_28_bytes() {
        let entry = DirectoryEntry {
            name_hash: NameHash(0x0102_0304),
            offset: 5,
            length: 6,
            compressed_length: 0,
        };
        let mut buf = Cursor::new(Vec::new());
        entry.write(&mut buf).expect("write entry");
        let bytes = buf.into_inner();
        assert_eq!(bytes.len() as u64, ENTRY_RECORD_SIZE);
        assert_eq!(&bytes[..4], &[4, 3, 2, 1]);

        let decoded = DirectoryEntry::read(&mut Cursor::new(&bytes)).expect("read entry");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_stored_length() {
        let stored = DirectoryEntry {
            name_hash: NameHash(0),
            offset: 100,
            length: 12,
            compressed_length: 0,
        };
        assert!(!stored.is_compressed());
        assert_eq!(stored.stored_end(), 112);

        let packed = DirectoryEntry {
            compressed_length: 9,
            ..stored
        };
        assert!(packed.is_compressed());
        assert_eq!(packed.stored_length(), 9);
        assert_eq!(packed.stored_end(), 109);
    }

    #[test]
    fn test_legacy_record_hashes_normalized_name() {
        let record = LegacyEntryRecord::new("c:\\dev\\game\\mod\\cfg\\Autoexec.cfg", 0, 10, 0);
        assert_eq!(record.normalized_name(), "CFG/AUTOEXEC.CFG");
        assert_eq!(record.to_entry().name_hash, NameHash::of("cfg/autoexec.cfg"));
    }

    #[test]
    fn test_legacy_record_decodes_variable_name() {
        let record = LegacyEntryRecord::new("sound/a.wav", 1, 2, 3);
        let mut buf = Cursor::new(Vec::new());
        record.write(&mut buf).expect("write record");
        let bytes = buf.into_inner();
        assert_eq!(bytes.len(), 2 + 11 + 24);

        let decoded = LegacyEntryRecord::read(&mut Cursor::new(&bytes)).expect("read record");
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_legacy_record_rejects_long_names() {
        let mut bytes = vec![0xFF, 0xFF];
        bytes.extend(std::iter::repeat_n(b'a', 64));
        assert!(LegacyEntryRecord::read(&mut Cursor::new(&bytes)).is_err());
    }
}
