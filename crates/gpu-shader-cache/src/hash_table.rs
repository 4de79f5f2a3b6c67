//! Content-addressed table for variable length byte sequences.
//!
//! Entries are partitioned by length. Each size bucket maps the xxh3 hash of
//! the first `size` bytes to the entries (or prefix markers of longer entries)
//! sharing that prefix. Lookups walk the buckets in ascending size order and
//! only pull as many bytes out of the accessor as the current bucket needs, so
//! a lookup against live memory usually stops after hashing a short prefix.

use std::sync::Arc;

use hashbrown::HashMap;
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

/// Source of the bytes being looked up.
pub trait DataAccessor {
    /// Returns the bytes in `offset..offset + len`. Shorter slices mean the
    /// readable data ends before that range does.
    fn get_span(&mut self, offset: usize, len: usize) -> &[u8];
}

/// Accessor over bytes already in memory.
pub struct SliceAccessor<'a>(pub &'a [u8]);

impl DataAccessor for SliceAccessor<'_> {
    fn get_span(&mut self, offset: usize, len: usize) -> &[u8] {
        let start = offset.min(self.0.len());
        let end = offset.saturating_add(len).min(self.0.len());
        &self.0[start..end]
    }
}

struct Entry<T> {
    data: Arc<[u8]>,
    /// `None` marks a prefix of a longer entry.
    item: Option<T>,
}

struct SizeBucket<T> {
    size: usize,
    entries: HashMap<u64, Vec<Entry<T>>>,
}

impl<T> SizeBucket<T> {
    fn new(size: usize) -> Self {
        Self {
            size,
            entries: HashMap::new(),
        }
    }

    fn add_prefix_marker(&mut self, data: &Arc<[u8]>) {
        let prefix = &data[..self.size];
        let list = self.entries.entry(xxh3_64(prefix)).or_default();
        if list.iter().any(|e| &e.data[..self.size] == prefix) {
            return;
        }
        list.push(Entry {
            data: data.clone(),
            item: None,
        });
    }
}

pub struct PartitionedHashTable<T> {
    buckets: Vec<SizeBucket<T>>,
    all_data: Vec<Arc<[u8]>>,
}

impl<T> Default for PartitionedHashTable<T> {
    fn default() -> Self {
        Self {
            buckets: Vec::new(),
            all_data: Vec::new(),
        }
    }
}

impl<T: Clone> PartitionedHashTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.all_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all_data.is_empty()
    }

    /// Returns the item stored for exactly `data`, inserting `item` first if
    /// there is none.
    pub fn get_or_add(&mut self, data: Arc<[u8]>, item: T) -> T {
        if let Some(existing) = self.find_exact(&data) {
            return existing;
        }

        let size = data.len();
        let bucket_index = match self.buckets.binary_search_by_key(&size, |b| b.size) {
            Ok(i) => i,
            Err(i) => {
                let mut bucket = SizeBucket::new(size);
                for longer in self.all_data.iter().filter(|d| d.len() > size) {
                    bucket.add_prefix_marker(longer);
                }
                self.buckets.insert(i, bucket);
                i
            }
        };

        for bucket in &mut self.buckets[..bucket_index] {
            bucket.add_prefix_marker(&data);
        }

        self.buckets[bucket_index]
            .entries
            .entry(xxh3_64(&data))
            .or_default()
            .push(Entry {
                data: data.clone(),
                item: Some(item.clone()),
            });
        self.all_data.push(data);
        item
    }

    pub fn find_exact(&self, data: &[u8]) -> Option<T> {
        let index = self
            .buckets
            .binary_search_by_key(&data.len(), |b| b.size)
            .ok()?;
        self.buckets[index]
            .entries
            .get(&xxh3_64(data))?
            .iter()
            .find(|e| *e.data == *data)
            .and_then(|e| e.item.clone())
    }

    /// Finds the entry whose bytes are a prefix of the accessor's data.
    /// Returns the item together with the stored copy of its bytes.
    pub fn try_find(&self, accessor: &mut dyn DataAccessor) -> Option<(T, Arc<[u8]>)> {
        let mut hasher = Xxh3::new();
        let mut hashed = 0usize;

        for bucket in &self.buckets {
            let span = accessor.get_span(0, bucket.size);
            if span.len() < bucket.size {
                return None;
            }
            hasher.update(&span[hashed..]);
            hashed = bucket.size;

            let candidates = bucket.entries.get(&hasher.digest())?;
            let mut prefix_known = false;
            for entry in candidates {
                if entry.data[..bucket.size] != *span {
                    continue;
                }
                match &entry.item {
                    Some(item) if entry.data.len() == bucket.size => {
                        return Some((item.clone(), entry.data.clone()));
                    }
                    _ => prefix_known = true,
                }
            }
            if !prefix_known {
                return None;
            }
        }
        None
    }
}
