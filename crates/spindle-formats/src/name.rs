//! Entry name normalization and the caseless name hash
//!
//! Lookups hash names with separators normalized (`\` becomes `/`, runs
//! of `/` collapse), so `Maps\\Town.bsp`, `maps/town.bsp` and
//! `MAPS//TOWN.BSP` all resolve to the same entry. Legacy directories
//! store full install paths; those additionally lose their install
//! prefix before hashing (see [`normalize_legacy_name`]).

use binrw::{BinRead, BinWrite};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Seed of the caseless name hash.
pub const NAME_HASH_SEED: u32 = 0xAAAA_AAAA;

/// 32-bit caseless hash of a normalized entry name.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BinRead, BinWrite, Serialize, Deserialize,
)]
#[brw(little)]
pub struct NameHash(pub u32);

impl NameHash {
    /// Hash a lookup name, normalizing separators on the fly.
    pub fn of(name: &str) -> Self {
        Self::of_bytes(name.as_bytes())
    }

    /// Hash raw name bytes, normalizing separators on the fly.
    pub fn of_bytes(name: &[u8]) -> Self {
        let mut hash = NAME_HASH_SEED;
        let mut previous_slash = false;
        for &byte in name {
            let byte = if byte == b'\\' { b'/' } else { byte };
            if byte == b'/' {
                if previous_slash {
                    continue;
                }
                previous_slash = true;
            } else {
                previous_slash = false;
            }
            hash = hash
                .wrapping_shl(5)
                .wrapping_add(hash)
                .wrapping_add(u32::from(byte.to_ascii_lowercase()));
        }
        Self(hash)
    }

    /// Raw hash value.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Bucket of this hash in a table of `bucket_count` buckets.
    ///
    /// `bucket_count` must be a power of two.
    pub const fn bucket(self, bucket_count: usize) -> usize {
        (self.0 as usize) & (bucket_count - 1)
    }
}

impl fmt::Display for NameHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<&str> for NameHash {
    fn from(name: &str) -> Self {
        Self::of(name)
    }
}

/// Replace `\` with `/` and collapse repeated separators.
pub fn normalize_separators(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        let ch = if ch == '\\' { '/' } else { ch };
        if ch == '/' && out.ends_with('/') {
            continue;
        }
        out.push(ch);
    }
    out
}

/// Strip the install prefix from a separator-normalized path.
///
/// Everything up to the last `/game/<component>/` is dropped. When no
/// separator follows the component, the component is kept with its
/// leading `/`. Paths without that marker lose everything up to the last
/// `stdshaders/`. Both markers match case-insensitively.
pub fn strip_install_prefix(path: &str) -> &str {
    let lower = path.to_ascii_lowercase();
    if let Some(marker) = lower.rfind("/game/") {
        let rest = marker + "/game/".len();
        return match lower[rest..].find('/') {
            Some(component_end) => &path[rest + component_end + 1..],
            None => &path[rest - 1..],
        };
    }
    if let Some(marker) = lower.rfind("stdshaders/") {
        return &path[marker + "stdshaders/".len()..];
    }
    path
}

/// Normalize a name stored in a legacy directory record.
///
/// ```
/// use spindle_formats::normalize_legacy_name;
///
/// assert_eq!(
///     normalize_legacy_name("C:\\Steam\\game\\hl2\\materials\\\\brick.vmt"),
///     "MATERIALS/BRICK.VMT"
/// );
/// ```
pub fn normalize_legacy_name(raw: &str) -> String {
    let separated = normalize_separators(raw);
    strip_install_prefix(&separated).to_ascii_uppercase()
}
