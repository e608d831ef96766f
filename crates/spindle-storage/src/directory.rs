//! Hashed archive directory
//!
//! Entries stay in directory (file) order: the preload section is a prefix
//! of that order and sequential consumers open neighbours one after the
//! other. Lookup goes through a separate permutation of entry indices
//! grouped by hash bucket, built with a two-pass counting sort.

use parking_lot::Mutex;
use spindle_formats::{DirectoryEntry, NameHash};

/// Smallest bucket table
pub const MIN_BUCKETS: usize = 16;

/// Largest bucket table
pub const MAX_BUCKETS: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct HashBucket {
    start: u32,
    count: u32,
}

#[derive(Debug, Default)]
struct LookupHints {
    last_opened: Option<usize>,
    last_failed: Option<NameHash>,
}

/// Immutable entry table plus hash index and lookup hints
#[derive(Debug)]
pub struct ArchiveDirectory {
    entries: Vec<DirectoryEntry>,
    buckets: Vec<HashBucket>,
    hash_index: Vec<u32>,
    preload_entries: usize,
    hints: Mutex<LookupHints>,
}

impl ArchiveDirectory {
    /// Index `entries`; the first `preload_entries` are served from memory.
    pub fn new(entries: Vec<DirectoryEntry>, preload_entries: usize) -> Self {
        let bucket_count = Self::bucket_count_for(entries.len());

        // Pass one: bucket sizes and start offsets.
        let mut counts = vec![0u32; bucket_count];
        for entry in &entries {
            counts[entry.name_hash.bucket(bucket_count)] += 1;
        }
        let mut next = 0u32;
        let buckets: Vec<HashBucket> = counts
            .into_iter()
            .map(|count| {
                let bucket = HashBucket { start: next, count };
                next += count;
                bucket
            })
            .collect();

        // Pass two: place indices, ascending within each bucket.
        let mut cursor: Vec<u32> = buckets.iter().map(|b| b.start).collect();
        let mut hash_index = vec![0u32; entries.len()];
        for (index, entry) in entries.iter().enumerate() {
            let slot = &mut cursor[entry.name_hash.bucket(bucket_count)];
            hash_index[*slot as usize] = index as u32;
            *slot += 1;
        }

        Self {
            preload_entries: preload_entries.min(entries.len()),
            entries,
            buckets,
            hash_index,
            hints: Mutex::new(LookupHints::default()),
        }
    }

    /// Bucket table size used for `entry_count` entries
    pub fn bucket_count_for(entry_count: usize) -> usize {
        entry_count
            .next_power_of_two()
            .clamp(MIN_BUCKETS, MAX_BUCKETS)
    }

    /// Index of the entry carrying `hash`.
    ///
    /// Tries the last opened entry and its successor first, then the
    /// cached last miss, then the hash bucket. With duplicate hashes the
    /// bucket scan returns the lowest index; the adjacency path may return
    /// another entry with the same hash.
    pub fn find(&self, hash: NameHash) -> Option<usize> {
        let mut hints = self.hints.lock();

        if let Some(last) = hints.last_opened {
            let adjacent = [last, last + 1]
                .into_iter()
                .find(|&i| self.entries.get(i).is_some_and(|e| e.name_hash == hash));
            if let Some(index) = adjacent {
                self.remember_opened(&mut hints, index);
                return Some(index);
            }
        }

        if hints.last_failed == Some(hash) {
            return None;
        }

        let bucket = self.buckets[hash.bucket(self.buckets.len())];
        let start = bucket.start as usize;
        let found = self.hash_index[start..start + bucket.count as usize]
            .iter()
            .map(|&i| i as usize)
            .find(|&i| self.entries[i].name_hash == hash);

        match found {
            Some(index) => self.remember_opened(&mut hints, index),
            None => hints.last_failed = Some(hash),
        }
        found
    }

    fn remember_opened(&self, hints: &mut LookupHints, index: usize) {
        if !self.is_preloaded(index) {
            hints.last_opened = Some(index);
        }
    }

    /// Index of the first entry carrying `hash`, by linear scan
    pub fn find_linear(&self, hash: NameHash) -> Option<usize> {
        self.entries.iter().position(|e| e.name_hash == hash)
    }

    /// Entry at `index`
    pub fn entry(&self, index: usize) -> Option<&DirectoryEntry> {
        self.entries.get(index)
    }

    /// Entries in directory order
    pub fn iter(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.iter()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of leading entries served from the preload blob
    pub fn preload_entries(&self) -> usize {
        self.preload_entries
    }

    /// Whether `index` is served from the preload blob
    pub fn is_preloaded(&self, index: usize) -> bool {
        index < self.preload_entries
    }

    /// Number of hash buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[cfg(test)]
    fn last_opened(&self) -> Option<usize> {
        self.hints.lock().last_opened
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn entries(names: &[&str]) -> Vec<DirectoryEntry> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| DirectoryEntry {
                name_hash: NameHash::of(name),
                offset: i as u64 * 10,
                length: 10,
                compressed_length: 0,
            })
            .collect()
    }

    #[test]
    fn test_buckets_partition_entries() {
        let names: Vec<String> = (0..100).map(|i| format!("file{i}.dat")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let directory = ArchiveDirectory::new(entries(&refs), 0);

        assert_eq!(directory.bucket_count(), 128);
        let mut seen = vec![false; directory.len()];
        let mut expected_start = 0;
        for (b, bucket) in directory.buckets.iter().enumerate() {
            assert_eq!(bucket.start, expected_start);
            expected_start += bucket.count;
            let span = &directory.hash_index
                [bucket.start as usize..(bucket.start + bucket.count) as usize];
            assert!(span.windows(2).all(|w| w[0] < w[1]));
            for &i in span {
                assert_eq!(directory.entries[i as usize].name_hash.bucket(128), b);
                seen[i as usize] = true;
            }
        }
        assert!(seen.into_iter().all(|s| s));
    }

    #[test]
    fn test_bucket_count_bounds() {
        assert_eq!(ArchiveDirectory::bucket_count_for(1), MIN_BUCKETS);
        assert_eq!(ArchiveDirectory::bucket_count_for(17), 32);
        assert_eq!(ArchiveDirectory::bucket_count_for(1 << 20), MAX_BUCKETS);
    }

    #[test]
    fn test_find_updates_last_opened() {
        let directory = ArchiveDirectory::new(entries(&["a", "b", "c", "d"]), 0);
        assert_eq!(directory.find(NameHash::of("b")), Some(1));
        assert_eq!(directory.last_opened(), Some(1));
        assert_eq!(directory.find(NameHash::of("c")), Some(2));
        assert_eq!(directory.last_opened(), Some(2));
        assert_eq!(directory.find(NameHash::of("a")), Some(0));
        assert_eq!(directory.last_opened(), Some(0));
    }

    #[test]
    fn test_preloaded_hits_do_not_move_hint() {
        let directory = ArchiveDirectory::new(entries(&["a", "b", "c", "d"]), 2);
        assert_eq!(directory.find(NameHash::of("c")), Some(2));
        assert_eq!(directory.find(NameHash::of("a")), Some(0));
        assert_eq!(directory.last_opened(), Some(2));
        assert!(directory.is_preloaded(1));
        assert!(!directory.is_preloaded(2));
    }

    #[test]
    fn test_repeated_miss_short_circuits() {
        let directory = ArchiveDirectory::new(entries(&["a", "b"]), 0);
        let missing = NameHash::of("missing");
        assert_eq!(directory.find(missing), None);
        assert_eq!(directory.hints.lock().last_failed, Some(missing));
        assert_eq!(directory.find(missing), None);
        assert_eq!(directory.find(NameHash::of("b")), Some(1));
    }

    #[test]
    fn test_last_entry_adjacency_does_not_overrun() {
        let directory = ArchiveDirectory::new(entries(&["a", "b"]), 0);
        assert_eq!(directory.find(NameHash::of("b")), Some(1));
        assert_eq!(directory.find(NameHash::of("zzz")), None);
        assert_eq!(directory.find(NameHash::of("a")), Some(0));
    }

    proptest! {
        #[test]
        fn prop_hash_index_matches_linear_scan(
            names in prop::collection::hash_set("[a-z0-9/._]{1,24}", 1..300),
            probes in prop::collection::vec("[a-z0-9/._]{1,24}", 0..50),
        ) {
            let names: Vec<String> = names
                .into_iter()
                .filter(|n| !n.contains("//"))
                .collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let distinct: HashSet<NameHash> = refs.iter().map(|n| NameHash::of(n)).collect();
            prop_assume!(!refs.is_empty() && distinct.len() == refs.len());
            let directory = ArchiveDirectory::new(entries(&refs), 0);

            for name in refs.iter().copied().chain(probes.iter().map(String::as_str)) {
                let hash = NameHash::of(name);
                prop_assert_eq!(directory.find(hash), directory.find_linear(hash));
            }
        }

        #[test]
        fn prop_directory_order_opens_are_exact(
            names in prop::collection::btree_set("[a-z]{1,12}", 1..200),
            preload in 0usize..20,
        ) {
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let distinct: HashSet<NameHash> = refs.iter().map(|n| NameHash::of(n)).collect();
            prop_assume!(distinct.len() == refs.len());
            let directory = ArchiveDirectory::new(entries(&refs), preload);
            for (index, name) in refs.iter().enumerate() {
                prop_assert_eq!(directory.find(NameHash::of(name)), Some(index));
            }
            for (index, name) in refs.iter().enumerate().rev() {
                prop_assert_eq!(directory.find(NameHash::of(name)), Some(index));
            }
        }
    }
}
