//! Whole-directory decoding

use crate::header::{ArchiveHeader, DirectoryFormat};
use crate::record::{DirectoryEntry, LegacyEntryRecord};
use crate::{FormatError, FormatResult};
use binrw::BinRead;
use std::io::{Read, Seek};

/// Decoded header plus directory records in file order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryTable {
    /// Validated header
    pub header: ArchiveHeader,
    /// Record encoding the header selected
    pub format: DirectoryFormat,
    /// Entries in directory order; legacy names are already hashed
    pub entries: Vec<DirectoryEntry>,
    encoded_len: u64,
}

impl DirectoryTable {
    /// Decode header and records starting at the reader's position.
    ///
    /// The header is validated before the record count is trusted.
    pub fn read<R: Read + Seek>(reader: &mut R) -> FormatResult<Self> {
        let start = reader.stream_position()?;
        let header = ArchiveHeader::read(reader)?;
        let format = header.validate()?;

        let count = header.entry_count as usize;
        let mut entries = Vec::with_capacity(count);
        match format {
            DirectoryFormat::Current => {
                for _ in 0..count {
                    entries.push(DirectoryEntry::read(reader)?);
                }
            }
            DirectoryFormat::Legacy => {
                for _ in 0..count {
                    entries.push(LegacyEntryRecord::read(reader)?.to_entry());
                }
            }
        }

        let encoded_len = reader.stream_position()? - start;
        Ok(Self {
            header,
            format,
            entries,
            encoded_len,
        })
    }

    /// Encoded size of header plus records, which is where data begins
    pub const fn data_offset(&self) -> u64 {
        self.encoded_len
    }

    /// Number of leading entries served from the preload section
    pub const fn preload_entry_count(&self) -> usize {
        self.header.preload_entry_count as usize
    }

    /// Length of the preload section at the start of the data section
    pub fn preload_span(&self) -> u64 {
        let preload = self.preload_entry_count();
        if preload == 0 {
            return 0;
        }
        match self.entries.get(preload) {
            Some(first_streamed) => first_streamed.offset,
            None => self
                .entries
                .iter()
                .map(DirectoryEntry::stored_end)
                .max()
                .unwrap_or(0),
        }
    }

    /// Check that every entry lies inside a data section of `data_len`
    /// bytes and every preloaded entry inside the preload section.
    pub fn validate_extents(&self, data_len: u64) -> FormatResult<()> {
        let preload_span = self.preload_span();
        if preload_span > data_len {
            return Err(FormatError::EntryOutOfBounds {
                index: self.preload_entry_count(),
                start: 0,
                end: preload_span,
                region: "data section",
                limit: data_len,
            });
        }
        for (index, entry) in self.entries.iter().enumerate() {
            let (region, limit) = if index < self.preload_entry_count() {
                ("preload section", preload_span)
            } else {
                ("data section", data_len)
            };
            if entry.stored_end() > limit {
                return Err(FormatError::EntryOutOfBounds {
                    index,
                    start: entry.offset,
                    end: entry.stored_end(),
                    region,
                    limit,
                });
            }
        }
        Ok(())
    }
}
