//! Error types for archive format decoding

use thiserror::Error;

/// Format operation result type
pub type FormatResult<T> = Result<T, FormatError>;

/// Errors raised while decoding or validating an archive directory
#[derive(Debug, Error)]
pub enum FormatError {
    /// Underlying reader failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary structure could not be decoded
    #[error("binary decode error: {0}")]
    Binary(binrw::Error),

    /// Header carries a version this crate does not understand
    #[error("unsupported archive version {0:#x}")]
    UnsupportedVersion(u32),

    /// Header declares zero entries
    #[error("archive directory is empty")]
    EmptyDirectory,

    /// Header declares more entries than allowed
    #[error("too many entries: {count} (maximum {max})")]
    TooManyEntries {
        /// Declared entry count
        count: u32,
        /// Configured maximum
        max: u32,
    },

    /// More preloaded entries than entries
    #[error("preload count {preload} exceeds entry count {count}")]
    PreloadOutOfRange {
        /// Declared preload entry count
        preload: u32,
        /// Declared entry count
        count: u32,
    },

    /// An entry's stored bytes fall outside the region that must contain them
    #[error("entry {index} spans {start}..{end}, outside {region} of {limit} bytes")]
    EntryOutOfBounds {
        /// Directory index of the entry
        index: usize,
        /// Start of the stored extent
        start: u64,
        /// End of the stored extent
        end: u64,
        /// Region that was violated
        region: &'static str,
        /// Length of that region
        limit: u64,
    },
}

impl From<binrw::Error> for FormatError {
    fn from(err: binrw::Error) -> Self {
        match err {
            binrw::Error::Io(io) => Self::Io(io),
            binrw::Error::Backtrace(trace) => Self::from(*trace.error),
            other => Self::Binary(other),
        }
    }
}
