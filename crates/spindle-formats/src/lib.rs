//! Binary format of spindle streaming archives
//!
//! An archive is a single packed file: a fixed header, a directory of
//! entry records, an optional preload section and the concatenated entry
//! payloads. This crate provides symmetric (parse and build) handling of
//! the header and records, the name normalization rules and the caseless
//! name hash. Streaming the payloads is the job of `spindle-storage`.
//!
//! # Layout
//!
//! ```text
//! +----------------+  0
//! | ArchiveHeader  |  12 bytes
//! +----------------+
//! | directory      |  entry_count records
//! +----------------+  data section starts here; entry offsets are relative to it
//! | preload bytes  |  [0, entries[preload_entry_count].offset)
//! | payloads ...   |
//! +----------------+
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use spindle_formats::DirectoryTable;
//! use std::fs::File;
//! use std::io::BufReader;
//!
//! let mut reader = BufReader::new(File::open("level01.spk")?);
//! let table = DirectoryTable::read(&mut reader)?;
//! println!("{} entries, data at {}", table.entries.len(), table.data_offset());
//! ```

#![warn(missing_docs)]

// Decoding errors
pub mod error;

// Header, records and whole-directory decoding
pub mod directory;
pub mod header;
pub mod record;

// Name handling
pub mod name;

pub use directory::DirectoryTable;
pub use error::{FormatError, FormatResult};
pub use header::{
    ArchiveHeader, DirectoryFormat, FORMAT_VERSION_CURRENT, FORMAT_VERSION_LEGACY, HEADER_SIZE,
};
pub use name::{NameHash, normalize_legacy_name, normalize_separators, strip_install_prefix};
pub use record::{DirectoryEntry, ENTRY_RECORD_SIZE, LegacyEntryRecord};

/// Upper bound on directory records accepted from a header
pub const MAX_ENTRIES: u32 = 1 << 20;

/// Upper bound on the stored name length of a legacy record
pub const MAX_NAME_LENGTH: usize = 260;
