//! Partitioned random source.
//!
//! One master seed feeds a registry of lazily created, per-subsystem
//! streams. A subsystem's stream depends only on the master seed and the
//! subsystem's name, so adding draws in one subsystem never shifts the
//! sequence seen by another.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

/// Subsystem whose stream is seeded with the bare master seed.
pub const SUBSYSTEM_WORKLOAD: &str = "workload";
/// Subsystem used by randomized routing policies.
pub const SUBSYSTEM_ROUTER: &str = "router";

/// Subsystem name for a per-instance stream.
pub fn subsystem_instance(id: u32) -> String {
    format!("instance_{}", id)
}

/// 64-bit FNV-1a hash of a subsystem name.
pub fn fnv1a64(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Deterministic per-subsystem random streams derived from one master seed.
#[derive(Debug, Clone)]
pub struct PartitionedRng {
    master_seed: i64,
    streams: HashMap<String, ChaCha8Rng>,
}

impl PartitionedRng {
    pub fn new(master_seed: i64) -> Self {
        Self {
            master_seed,
            streams: HashMap::new(),
        }
    }

    pub fn master_seed(&self) -> i64 {
        self.master_seed
    }

    /// Seed for a subsystem. The workload subsystem uses the master seed
    /// unchanged; every other subsystem XORs in the FNV-1a hash of its name.
    /// Total over the whole `i64` domain.
    pub fn derive_seed(&self, name: &str) -> i64 {
        if name == SUBSYSTEM_WORKLOAD {
            self.master_seed
        } else {
            self.master_seed ^ fnv1a64(name) as i64
        }
    }

    /// The stream for `name`, created on first use and cached afterwards.
    pub fn for_subsystem(&mut self, name: &str) -> &mut ChaCha8Rng {
        let seed = self.derive_seed(name);
        self.streams
            .entry(name.to_string())
            .or_insert_with(|| ChaCha8Rng::seed_from_u64(seed as u64))
    }
}
