//! Router-side approximation of each instance's prefix cache.
//!
//! The router cannot see an instance's KV cache directly. Instead it
//! remembers which block hashes it has sent to each instance and assumes
//! they are still cached, bounded by a per-instance LRU capacity.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// Default number of block hashes remembered per instance.
pub const DEFAULT_INDEX_CAPACITY: usize = 10_000;

/// Chained hashes of every full block of `tokens`.
///
/// Block `i`'s hash covers all tokens up to the end of block `i`, so equal
/// hashes imply equal prefixes.
pub fn block_hashes(tokens: &[u32], block_size: usize) -> Vec<u64> {
    if block_size == 0 {
        return Vec::new();
    }
    let mut prev = [0u8; 8];
    tokens
        .chunks_exact(block_size)
        .map(|block| {
            let mut hasher = Sha256::new();
            hasher.update(prev);
            for t in block {
                hasher.update(t.to_le_bytes());
            }
            let digest = hasher.finalize();
            prev.copy_from_slice(&digest[..8]);
            u64::from_le_bytes(prev)
        })
        .collect()
}

/// LRU set of block hashes for one instance.
#[derive(Debug, Default, Clone)]
struct InstanceIndex {
    /// hash -> last access tick
    entries: HashMap<u64, u64>,
    /// last access tick -> hash, oldest first
    by_age: BTreeMap<u64, u64>,
}

/// Per-instance LRU index of block hashes routed to each instance.
#[derive(Debug, Clone)]
pub struct PrefixIndex {
    block_size: usize,
    capacity: usize,
    instances: Vec<InstanceIndex>,
    tick: u64,
}

impl PrefixIndex {
    pub fn new(block_size: usize, capacity: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            capacity: capacity.max(1),
            instances: Vec::new(),
            tick: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Hashes of every full block of `tokens` under this index's block size.
    pub fn hashes_for(&self, tokens: &[u32]) -> Vec<u64> {
        block_hashes(tokens, self.block_size)
    }

    /// Number of leading `hashes` present for `instance`. Does not touch LRU
    /// order.
    pub fn matched_blocks(&self, hashes: &[u64], instance: u32) -> usize {
        match self.instances.get(instance as usize) {
            Some(index) => hashes
                .iter()
                .take_while(|h| index.entries.contains_key(h))
                .count(),
            None => 0,
        }
    }

    /// Record that `hashes` were sent to `instance`, refreshing their LRU
    /// position and evicting the oldest entries beyond capacity.
    pub fn record(&mut self, hashes: &[u64], instance: u32) {
        let idx = instance as usize;
        if self.instances.len() <= idx {
            self.instances.resize_with(idx + 1, InstanceIndex::default);
        }
        let index = &mut self.instances[idx];
        for &hash in hashes {
            self.tick += 1;
            if let Some(old) = index.entries.insert(hash, self.tick) {
                index.by_age.remove(&old);
            }
            index.by_age.insert(self.tick, hash);
        }
        while index.entries.len() > self.capacity {
            match index.by_age.pop_first() {
                Some((_, oldest)) => {
                    index.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Number of hashes remembered for `instance`.
    pub fn len_for(&self, instance: u32) -> usize {
        self.instances
            .get(instance as usize)
            .map_or(0, |i| i.entries.len())
    }
}
