//! KV cache simulation with block-based allocation, prefix hashing, and
//! LRU reuse of free blocks.
//!
//! Models the memory management of a vLLM-style paged KV cache:
//! - Fixed-size blocks, reference counted by the requests that hold them
//! - Content-addressed full blocks: a block's hash covers every token from
//!   the start of the sequence to the end of the block
//! - Free blocks keep their content hash until physically reused, so a
//!   released prefix stays hittable
//! - Allocation is all-or-nothing: a failed call rolls back every mutation
//!
//! [`TieredKvCache`] adds an overflow tier that absorbs evicted prefix
//! blocks and can promote them back on demand.

use crate::request::Request;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// Content hash of a full block and everything before it.
pub type BlockHash = [u8; 32];

/// Hash of a full block given the hash of the block before it.
pub fn chain_hash(parent: Option<&BlockHash>, tokens: &[u32]) -> BlockHash {
    let mut hasher = Sha256::new();
    if let Some(parent) = parent {
        hasher.update(parent);
    }
    for t in tokens {
        hasher.update(t.to_le_bytes());
    }
    hasher.finalize().into()
}

/// Chained hashes of every full block of `tokens`.
pub fn prefix_hashes(tokens: &[u32], block_size: usize) -> Vec<BlockHash> {
    let mut parent: Option<BlockHash> = None;
    tokens
        .chunks_exact(block_size.max(1))
        .map(|block| {
            let h = chain_hash(parent.as_ref(), block);
            parent = Some(h);
            h
        })
        .collect()
}

/// A single block in the KV cache.
#[derive(Debug, Clone)]
pub struct CacheBlock {
    pub id: usize,
    /// Requests currently holding this block.
    pub ref_count: u32,
    pub in_use: bool,
    /// Set once the block is full.
    pub hash: Option<BlockHash>,
    pub tokens: Vec<u32>,
    prev_free: Option<usize>,
    next_free: Option<usize>,
}

/// Statistics snapshot for reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KvCacheStats {
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
    pub peak_used_blocks: u64,
    pub utilization: f64,
    pub cached_blocks: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub allocation_failures: u64,
    pub promotions: u64,
    pub demotions: u64,
}

/// Block allocator interface shared by the single-tier and tiered caches.
pub trait KvStore: Send {
    fn block_size(&self) -> usize;
    fn total_blocks(&self) -> usize;
    fn used_blocks(&self) -> usize;
    fn free_blocks(&self) -> usize;

    /// Longest prefix of `tokens` whose full blocks are already cached.
    /// Pure: no counters change and nothing is allocated.
    fn lookup_cached_prefix(&self, tokens: &[u32]) -> Vec<usize>;

    /// Commit `cached` blocks to `request`, then fill tokens `[start, end)`
    /// of the request's sequence into fresh blocks. Returns false, with every
    /// mutation undone, if the blocks cannot be found.
    fn allocate(&mut self, request: &Request, start: usize, end: usize, cached: &[usize]) -> bool;

    /// Drop `request_id`'s references. Blocks reaching zero return to the
    /// tail of the free list with their hash intact.
    fn release(&mut self, request_id: u64);

    /// Blocks currently held by `request_id`.
    fn blocks_held(&self, request_id: u64) -> usize;

    fn stats(&self) -> KvCacheStats;

    /// Pull overflow-resident prefix blocks of `tokens` back into the fast
    /// tier ahead of a lookup. No hit is counted here.
    fn promote_prefix(&mut self, _tokens: &[u32]) {}

    /// Transfer latency accumulated by promotions since the last call.
    fn take_transfer_latency(&mut self) -> u64 {
        0
    }

    fn utilization(&self) -> f64 {
        if self.total_blocks() == 0 {
            return 0.0;
        }
        self.used_blocks() as f64 / self.total_blocks() as f64
    }

    /// `used + free == total`.
    fn is_conserved(&self) -> bool {
        self.used_blocks() + self.free_blocks() == self.total_blocks()
    }
}

/// One reversible mutation made during [`KvCacheSimulator::allocate`].
#[derive(Debug)]
enum Undo {
    RefInc(usize),
    Hit,
    Miss,
    /// A cached block left the free list from between `prev` and `next`.
    Activated {
        block: usize,
        prev: Option<usize>,
        next: Option<usize>,
    },
    /// A free block was taken from the list head for reuse.
    Popped {
        block: usize,
        old_hash: Option<BlockHash>,
        old_tokens: Vec<u32>,
        unmapped: bool,
    },
    HashRegistered {
        hash: BlockHash,
        block: usize,
        previous: Option<usize>,
    },
    TokensAppended {
        block: usize,
        count: usize,
    },
    BlockAppended(u64),
    EntryCreated(u64),
}

/// Block-based KV cache simulator for a single instance.
#[derive(Debug, Clone)]
pub struct KvCacheSimulator {
    block_size: usize,
    blocks: Vec<CacheBlock>,
    free_head: Option<usize>,
    free_tail: Option<usize>,
    free_len: usize,
    used: usize,
    peak_used: usize,
    hash_to_block: HashMap<BlockHash, usize>,
    request_blocks: HashMap<u64, Vec<usize>>,
    // --- Counters ---
    hits: u64,
    misses: u64,
    evictions: u64,
    allocation_failures: u64,
    /// Hashed content evicted by successful allocations, drained by the
    /// tiered wrapper.
    evicted: Vec<(BlockHash, Vec<u32>)>,
}

impl KvCacheSimulator {
    /// Create a cache with `total_blocks` blocks of `block_size` tokens.
    pub fn new(total_blocks: usize, block_size: usize) -> Self {
        let blocks = (0..total_blocks)
            .map(|id| CacheBlock {
                id,
                ref_count: 0,
                in_use: false,
                hash: None,
                tokens: Vec::new(),
                prev_free: id.checked_sub(1),
                next_free: if id + 1 < total_blocks {
                    Some(id + 1)
                } else {
                    None
                },
            })
            .collect();
        Self {
            block_size: block_size.max(1),
            blocks,
            free_head: if total_blocks > 0 { Some(0) } else { None },
            free_tail: total_blocks.checked_sub(1),
            free_len: total_blocks,
            used: 0,
            peak_used: 0,
            hash_to_block: HashMap::new(),
            request_blocks: HashMap::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
            allocation_failures: 0,
            evicted: Vec::new(),
        }
    }

    pub fn block(&self, id: usize) -> Option<&CacheBlock> {
        self.blocks.get(id)
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Block ids on the free list, head (next to be reused) first.
    pub fn free_list(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.free_len);
        let mut cur = self.free_head;
        while let Some(b) = cur {
            out.push(b);
            cur = self.blocks[b].next_free;
        }
        out
    }

    /// Block currently registered for `hash`.
    pub fn block_for_hash(&self, hash: &BlockHash) -> Option<usize> {
        self.hash_to_block.get(hash).copied()
    }

    // --- Free list ---

    fn unlink_free(&mut self, b: usize) -> (Option<usize>, Option<usize>) {
        let prev = self.blocks[b].prev_free;
        let next = self.blocks[b].next_free;
        match prev {
            Some(p) => self.blocks[p].next_free = next,
            None => self.free_head = next,
        }
        match next {
            Some(n) => self.blocks[n].prev_free = prev,
            None => self.free_tail = prev,
        }
        self.blocks[b].prev_free = None;
        self.blocks[b].next_free = None;
        self.free_len -= 1;
        (prev, next)
    }

    fn link_free_between(&mut self, b: usize, prev: Option<usize>, next: Option<usize>) {
        self.blocks[b].prev_free = prev;
        self.blocks[b].next_free = next;
        match prev {
            Some(p) => self.blocks[p].next_free = Some(b),
            None => self.free_head = Some(b),
        }
        match next {
            Some(n) => self.blocks[n].prev_free = Some(b),
            None => self.free_tail = Some(b),
        }
        self.free_len += 1;
    }

    fn push_free_tail(&mut self, b: usize) {
        let tail = self.free_tail;
        self.link_free_between(b, tail, None);
    }

    /// Move a free block to the tail (most recently used end).
    pub(crate) fn touch_free(&mut self, b: usize) {
        if self.blocks[b].in_use {
            return;
        }
        self.unlink_free(b);
        self.push_free_tail(b);
    }

    /// Hash of the block at the head of the free list.
    pub(crate) fn free_head_hash(&self) -> Option<Option<BlockHash>> {
        self.free_head.map(|b| self.blocks[b].hash)
    }

    /// Take the free-list head, drop its hash registration, and return its id
    /// with the evicted content if it was hashed.
    fn take_free_head(&mut self) -> Option<(usize, Option<BlockHash>, Vec<u32>, bool)> {
        let b = self.free_head?;
        self.unlink_free(b);
        let old_hash = self.blocks[b].hash.take();
        let old_tokens = std::mem::take(&mut self.blocks[b].tokens);
        let mut unmapped = false;
        if let Some(h) = old_hash {
            if self.hash_to_block.get(&h) == Some(&b) {
                self.hash_to_block.remove(&h);
                unmapped = true;
            }
        }
        Some((b, old_hash, old_tokens, unmapped))
    }

    /// Reuse the free-list head as an unreferenced cached block holding
    /// `hash`/`tokens`, placed at the free-list tail. Returns the evicted
    /// content of the reused block, if any.
    pub(crate) fn install_cached(
        &mut self,
        hash: BlockHash,
        tokens: Vec<u32>,
    ) -> Option<Option<(BlockHash, Vec<u32>)>> {
        let (b, old_hash, old_tokens, unmapped) = self.take_free_head()?;
        let evicted = if unmapped {
            self.evictions += 1;
            old_hash.map(|h| (h, old_tokens))
        } else {
            None
        };
        self.blocks[b].tokens = tokens;
        self.blocks[b].hash = Some(hash);
        self.hash_to_block.insert(hash, b);
        self.push_free_tail(b);
        Some(evicted)
    }

    pub(crate) fn drain_evicted(&mut self) -> Vec<(BlockHash, Vec<u32>)> {
        std::mem::take(&mut self.evicted)
    }

    // --- Allocation ---

    fn push_request_block(&mut self, request_id: u64, b: usize, journal: &mut Vec<Undo>) {
        match self.request_blocks.get_mut(&request_id) {
            Some(list) => {
                list.push(b);
                journal.push(Undo::BlockAppended(request_id));
            }
            None => {
                self.request_blocks.insert(request_id, vec![b]);
                journal.push(Undo::EntryCreated(request_id));
            }
        }
    }

    fn register_hash(&mut self, b: usize, parent: Option<BlockHash>, journal: &mut Vec<Undo>) {
        let hash = chain_hash(parent.as_ref(), &self.blocks[b].tokens);
        let previous = self.hash_to_block.insert(hash, b);
        self.blocks[b].hash = Some(hash);
        journal.push(Undo::HashRegistered {
            hash,
            block: b,
            previous,
        });
    }

    /// Hash of the last block `request_id` holds, if it is full.
    fn last_block_hash(&self, request_id: u64) -> Option<BlockHash> {
        self.request_blocks
            .get(&request_id)
            .and_then(|list| list.last())
            .and_then(|&b| self.blocks[b].hash)
    }

    fn try_allocate(
        &mut self,
        request: &Request,
        start: usize,
        end: usize,
        cached: &[usize],
        journal: &mut Vec<Undo>,
    ) -> bool {
        for &b in cached {
            if b >= self.blocks.len() {
                return false;
            }
            if !self.blocks[b].in_use {
                let (prev, next) = self.unlink_free(b);
                self.blocks[b].in_use = true;
                self.used += 1;
                journal.push(Undo::Activated { block: b, prev, next });
            }
            self.blocks[b].ref_count += 1;
            journal.push(Undo::RefInc(b));
            self.hits += 1;
            journal.push(Undo::Hit);
            self.push_request_block(request.id, b, journal);
        }

        if end <= start {
            return true;
        }
        let tokens = request.tokens_in(start, end);
        let mut pos = 0;

        // Top up the request's partially filled last block.
        let last = self
            .request_blocks
            .get(&request.id)
            .and_then(|list| list.last().copied());
        if let Some(b) = last {
            let room = self.block_size.saturating_sub(self.blocks[b].tokens.len());
            if room > 0 && self.blocks[b].hash.is_none() {
                let take = room.min(tokens.len());
                self.blocks[b].tokens.extend_from_slice(&tokens[..take]);
                journal.push(Undo::TokensAppended { block: b, count: take });
                pos = take;
                if self.blocks[b].tokens.len() == self.block_size {
                    let list = &self.request_blocks[&request.id];
                    let parent = list
                        .len()
                        .checked_sub(2)
                        .and_then(|i| self.blocks[list[i]].hash);
                    self.register_hash(b, parent, journal);
                }
            }
        }

        let remaining = tokens.len() - pos;
        let needed = remaining.div_ceil(self.block_size);
        if needed > self.free_len {
            return false;
        }

        while pos < tokens.len() {
            let Some((b, old_hash, old_tokens, unmapped)) = self.take_free_head() else {
                return false;
            };
            if unmapped {
                if let Some(h) = old_hash {
                    self.evicted.push((h, old_tokens.clone()));
                }
                self.evictions += 1;
            }
            journal.push(Undo::Popped {
                block: b,
                old_hash,
                old_tokens,
                unmapped,
            });

            let parent = self.last_block_hash(request.id);
            let take = self.block_size.min(tokens.len() - pos);
            let block = &mut self.blocks[b];
            block.tokens = tokens[pos..pos + take].to_vec();
            block.ref_count = 1;
            block.in_use = true;
            self.used += 1;
            self.push_request_block(request.id, b, journal);

            if start + pos < request.input_len() {
                self.misses += 1;
                journal.push(Undo::Miss);
            }
            if take == self.block_size {
                self.register_hash(b, parent, journal);
            }
            pos += take;
        }
        true
    }

    fn rollback(&mut self, journal: Vec<Undo>, evicted_len: usize) {
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::RefInc(b) => self.blocks[b].ref_count -= 1,
                Undo::Hit => self.hits -= 1,
                Undo::Miss => self.misses -= 1,
                Undo::Activated { block, prev, next } => {
                    self.blocks[block].in_use = false;
                    self.used -= 1;
                    self.link_free_between(block, prev, next);
                }
                Undo::Popped {
                    block,
                    old_hash,
                    old_tokens,
                    unmapped,
                } => {
                    let blk = &mut self.blocks[block];
                    if blk.in_use {
                        blk.in_use = false;
                        self.used -= 1;
                    }
                    let blk = &mut self.blocks[block];
                    blk.ref_count = 0;
                    blk.tokens = old_tokens;
                    blk.hash = old_hash;
                    if unmapped {
                        if let Some(h) = old_hash {
                            self.hash_to_block.insert(h, block);
                        }
                        self.evictions -= 1;
                    }
                    let head = self.free_head;
                    self.link_free_between(block, None, head);
                }
                Undo::HashRegistered {
                    hash,
                    block,
                    previous,
                } => {
                    self.blocks[block].hash = None;
                    match previous {
                        Some(p) => {
                            self.hash_to_block.insert(hash, p);
                        }
                        None => {
                            self.hash_to_block.remove(&hash);
                        }
                    }
                }
                Undo::TokensAppended { block, count } => {
                    let len = self.blocks[block].tokens.len();
                    self.blocks[block].tokens.truncate(len - count);
                }
                Undo::BlockAppended(id) => {
                    if let Some(list) = self.request_blocks.get_mut(&id) {
                        list.pop();
                    }
                }
                Undo::EntryCreated(id) => {
                    self.request_blocks.remove(&id);
                }
            }
        }
        self.evicted.truncate(evicted_len);
    }
}

impl KvStore for KvCacheSimulator {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn total_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn used_blocks(&self) -> usize {
        self.used
    }

    fn free_blocks(&self) -> usize {
        self.free_len
    }

    fn lookup_cached_prefix(&self, tokens: &[u32]) -> Vec<usize> {
        let mut found = Vec::new();
        let mut parent: Option<BlockHash> = None;
        for block in tokens.chunks_exact(self.block_size) {
            let h = chain_hash(parent.as_ref(), block);
            match self.hash_to_block.get(&h) {
                Some(&b) => found.push(b),
                None => break,
            }
            parent = Some(h);
        }
        found
    }

    fn allocate(&mut self, request: &Request, start: usize, end: usize, cached: &[usize]) -> bool {
        let mut journal = Vec::new();
        let evicted_len = self.evicted.len();
        if self.try_allocate(request, start, end, cached, &mut journal) {
            self.peak_used = self.peak_used.max(self.used);
            true
        } else {
            self.rollback(journal, evicted_len);
            self.allocation_failures += 1;
            false
        }
    }

    fn release(&mut self, request_id: u64) {
        let Some(list) = self.request_blocks.remove(&request_id) else {
            return;
        };
        for &b in list.iter().rev() {
            let block = &mut self.blocks[b];
            block.ref_count = block.ref_count.saturating_sub(1);
            if block.ref_count == 0 && block.in_use {
                block.in_use = false;
                self.used -= 1;
                self.push_free_tail(b);
            }
        }
    }

    fn blocks_held(&self, request_id: u64) -> usize {
        self.request_blocks.get(&request_id).map_or(0, Vec::len)
    }

    fn stats(&self) -> KvCacheStats {
        let lookups = self.hits + self.misses;
        KvCacheStats {
            total_blocks: self.blocks.len() as u64,
            used_blocks: self.used as u64,
            free_blocks: self.free_len as u64,
            peak_used_blocks: self.peak_used as u64,
            utilization: self.utilization(),
            cached_blocks: self.hash_to_block.len() as u64,
            hits: self.hits,
            misses: self.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.hits as f64 / lookups as f64
            },
            evictions: self.evictions,
            allocation_failures: self.allocation_failures,
            promotions: 0,
            demotions: 0,
        }
    }
}

/// Bounded LRU store of evicted prefix blocks.
#[derive(Debug, Clone, Default)]
struct OverflowTier {
    capacity: usize,
    entries: HashMap<BlockHash, (Vec<u32>, u64)>,
    by_age: BTreeMap<u64, BlockHash>,
    tick: u64,
}

impl OverflowTier {
    fn insert(&mut self, hash: BlockHash, tokens: Vec<u32>) {
        if self.capacity == 0 {
            return;
        }
        self.tick += 1;
        if let Some((_, old_tick)) = self.entries.insert(hash, (tokens, self.tick)) {
            self.by_age.remove(&old_tick);
        }
        self.by_age.insert(self.tick, hash);
        while self.entries.len() > self.capacity {
            match self.by_age.pop_first() {
                Some((_, oldest)) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn take(&mut self, hash: &BlockHash) -> Option<Vec<u32>> {
        let (tokens, tick) = self.entries.remove(hash)?;
        self.by_age.remove(&tick);
        Some(tokens)
    }

    fn contains(&self, hash: &BlockHash) -> bool {
        self.entries.contains_key(hash)
    }
}

/// Fast tier backed by an overflow tier for evicted prefix blocks.
///
/// Evicted hashed blocks are demoted to the overflow tier. Before a lookup,
/// [`promote_prefix`](KvStore::promote_prefix) copies consecutive overflow
/// blocks of the prefix back into free fast blocks and charges transfer
/// latency. Promoted blocks are unreferenced, so hits are only counted by
/// the fast tier when an allocation commits them.
#[derive(Debug, Clone)]
pub struct TieredKvCache {
    fast: KvCacheSimulator,
    overflow: OverflowTier,
    base_latency_us: u64,
    per_block_latency_us: u64,
    pending_transfer_us: u64,
    promotions: u64,
    demotions: u64,
}

impl TieredKvCache {
    pub fn new(
        total_blocks: usize,
        block_size: usize,
        overflow_blocks: usize,
        base_latency_us: u64,
        per_block_latency_us: u64,
    ) -> Self {
        Self {
            fast: KvCacheSimulator::new(total_blocks, block_size),
            overflow: OverflowTier {
                capacity: overflow_blocks,
                ..OverflowTier::default()
            },
            base_latency_us,
            per_block_latency_us,
            pending_transfer_us: 0,
            promotions: 0,
            demotions: 0,
        }
    }

    pub fn fast(&self) -> &KvCacheSimulator {
        &self.fast
    }

    fn demote_evicted(&mut self) {
        for (hash, tokens) in self.fast.drain_evicted() {
            self.overflow.insert(hash, tokens);
            self.demotions += 1;
        }
    }
}

impl KvStore for TieredKvCache {
    fn block_size(&self) -> usize {
        self.fast.block_size()
    }

    fn total_blocks(&self) -> usize {
        self.fast.total_blocks()
    }

    fn used_blocks(&self) -> usize {
        self.fast.used_blocks()
    }

    fn free_blocks(&self) -> usize {
        self.fast.free_blocks()
    }

    fn lookup_cached_prefix(&self, tokens: &[u32]) -> Vec<usize> {
        self.fast.lookup_cached_prefix(tokens)
    }

    fn allocate(&mut self, request: &Request, start: usize, end: usize, cached: &[usize]) -> bool {
        let ok = self.fast.allocate(request, start, end, cached);
        if ok {
            self.demote_evicted();
        }
        ok
    }

    fn release(&mut self, request_id: u64) {
        self.fast.release(request_id);
    }

    fn blocks_held(&self, request_id: u64) -> usize {
        self.fast.blocks_held(request_id)
    }

    fn stats(&self) -> KvCacheStats {
        KvCacheStats {
            promotions: self.promotions,
            demotions: self.demotions,
            ..self.fast.stats()
        }
    }

    fn promote_prefix(&mut self, tokens: &[u32]) {
        let hashes = prefix_hashes(tokens, self.fast.block_size());

        // Keep the fast-resident part of the prefix away from the reuse end.
        let mut resident = 0;
        for h in &hashes {
            match self.fast.block_for_hash(h) {
                Some(b) => {
                    self.fast.touch_free(b);
                    resident += 1;
                }
                None => break,
            }
        }

        let mut promoted = 0u64;
        for h in &hashes[resident..] {
            if !self.overflow.contains(h) {
                break;
            }
            match self.fast.free_head_hash() {
                None => break,
                Some(Some(head)) if hashes.contains(&head) => break,
                Some(_) => {}
            }
            let Some(tokens) = self.overflow.take(h) else {
                break;
            };
            match self.fast.install_cached(*h, tokens) {
                Some(Some((evicted_hash, evicted_tokens))) => {
                    self.overflow.insert(evicted_hash, evicted_tokens);
                    self.demotions += 1;
                }
                Some(None) => {}
                None => break,
            }
            promoted += 1;
        }

        if promoted > 0 {
            self.promotions += promoted;
            self.pending_transfer_us += self.base_latency_us + self.per_block_latency_us * promoted;
        }
    }

    fn take_transfer_latency(&mut self) -> u64 {
        std::mem::take(&mut self.pending_transfer_us)
    }
}
