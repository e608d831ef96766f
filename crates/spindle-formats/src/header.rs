//! Archive header

use crate::{FormatError, FormatResult, MAX_ENTRIES};
use binrw::{BinRead, BinWrite};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Encoded header size in bytes
pub const HEADER_SIZE: u64 = 12;

/// Version tag of directories that store full names per record
pub const FORMAT_VERSION_LEGACY: u32 = 1;

/// Version tag of directories that store precomputed name hashes
pub const FORMAT_VERSION_CURRENT: u32 = 2;

/// Directory encoding selected by the header version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryFormat {
    /// Variable-size records carrying the full entry name
    Legacy,
    /// Fixed-size records carrying the name hash
    Current,
}

impl DirectoryFormat {
    /// Map a header version to a directory format
    pub const fn from_version(version: u32) -> Option<Self> {
        match version {
            FORMAT_VERSION_LEGACY => Some(Self::Legacy),
            FORMAT_VERSION_CURRENT => Some(Self::Current),
            _ => None,
        }
    }

    /// Header version written for this format
    pub const fn version(self) -> u32 {
        match self {
            Self::Legacy => FORMAT_VERSION_LEGACY,
            Self::Current => FORMAT_VERSION_CURRENT,
        }
    }
}

/// Fixed archive header
///
/// ```text
/// offset  size  field
/// 0       4     version
/// 4       4     entry_count
/// 8       4     preload_entry_count
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct ArchiveHeader {
    /// Format version tag
    pub version: u32,
    /// Number of directory records
    pub entry_count: u32,
    /// Number of leading entries whose bytes form the preload section
    pub preload_entry_count: u32,
}

impl ArchiveHeader {
    /// Create a header for the given format
    pub const fn new(format: DirectoryFormat, entry_count: u32, preload_entry_count: u32) -> Self {
        Self {
            version: format.version(),
            entry_count,
            preload_entry_count,
        }
    }

    /// Decode a header from its encoded bytes
    pub fn parse(data: &[u8]) -> FormatResult<Self> {
        Ok(Self::read(&mut Cursor::new(data))?)
    }

    /// Check every field before any of them is trusted
    pub fn validate(&self) -> FormatResult<DirectoryFormat> {
        let format = DirectoryFormat::from_version(self.version)
            .ok_or(FormatError::UnsupportedVersion(self.version))?;
        if self.entry_count == 0 {
            return Err(FormatError::EmptyDirectory);
        }
        if self.entry_count > MAX_ENTRIES {
            return Err(FormatError::TooManyEntries {
                count: self.entry_count,
                max: MAX_ENTRIES,
            });
        }
        if self.preload_entry_count > self.entry_count {
            return Err(FormatError::PreloadOutOfRange {
                preload: self.preload_entry_count,
                count: self.entry_count,
            });
        }
        Ok(format)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_header_layout_is_little_endian() {
        let header = ArchiveHeader::new(DirectoryFormat::Current, 3, 1);
        let mut buf = Cursor::new(Vec::new());
        header.write(&mut buf).expect("write header");
        assert_eq!(
            buf.into_inner(),
            vec![2, 0, 0, 0, 3, 0, 0, 0, 1, 0, 0, 0]
        );
    }

    #[test]
    fn test_parse_and_validate() {
        let header = ArchiveHeader::parse(&[1, 0, 0, 0, 5, 0, 0, 0, 0, 0, 0, 0]).expect("parse");
        assert_eq!(header.validate().expect("valid"), DirectoryFormat::Legacy);
        assert_eq!(header.entry_count, 5);
    }

    #[test]
    fn test_truncated_header_fails() {
        assert!(ArchiveHeader::parse(&[2, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let header = ArchiveHeader {
            version: 7,
            entry_count: 1,
            preload_entry_count: 0,
        };
        assert!(matches!(
            header.validate(),
            Err(FormatError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn test_rejects_empty_and_oversized_directories() {
        let empty = ArchiveHeader::new(DirectoryFormat::Current, 0, 0);
        assert!(matches!(empty.validate(), Err(FormatError::EmptyDirectory)));

        let huge = ArchiveHeader::new(DirectoryFormat::Current, MAX_ENTRIES + 1, 0);
        assert!(matches!(
            huge.validate(),
            Err(FormatError::TooManyEntries { .. })
        ));
    }

    #[test]
    fn test_rejects_preload_beyond_entries() {
        let header = ArchiveHeader::new(DirectoryFormat::Current, 2, 3);
        assert!(matches!(
            header.validate(),
            Err(FormatError::PreloadOutOfRange { preload: 3, count: 2 })
        ));
    }
}
