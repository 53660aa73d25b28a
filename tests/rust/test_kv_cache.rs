/// Integration tests for KV cache simulation.
use fleetsim_core::kv_cache::{prefix_hashes, KvCacheSimulator, KvStore, TieredKvCache};
use fleetsim_core::Request;
use proptest::prelude::*;

fn request(id: u64, input: Vec<u32>, output_len: usize) -> Request {
    Request::new(id, 0, input, vec![0; output_len], "")
}

#[test]
fn test_cache_lifecycle() {
    let mut cache = KvCacheSimulator::new(1000, 16);

    for i in 0..10u64 {
        let input: Vec<u32> = (0..256).map(|t| t + (i % 3) as u32 * 10_000).collect();
        let req = request(i, input.clone(), 0);
        let cached = cache.lookup_cached_prefix(&input);
        let start = cached.len() * 16;
        assert!(cache.allocate(&req, start, 256, &cached));
    }
    assert!(cache.utilization() > 0.0);
    // Three distinct prompts of 16 blocks, shared by the other seven.
    assert_eq!(cache.used_blocks(), 48);
    assert_eq!(cache.stats().hits, 7 * 16);

    for i in 0..10 {
        cache.release(i);
    }
    let stats = cache.stats();
    assert_eq!(stats.used_blocks, 0);
    assert_eq!(stats.cached_blocks, 48);
}

#[test]
fn test_rollback_two_cached_three_fresh() {
    // Blocks 0 and 1 hold a released, still-hashed prefix; only two other
    // blocks are free, so the third fresh block cannot be found.
    let mut cache = KvCacheSimulator::new(4, 4);
    let prefix: Vec<u32> = (0..8).collect();
    assert!(cache.allocate(&request(1, prefix.clone(), 0), 0, 8, &[]));
    cache.release(1);

    let mut input = prefix.clone();
    input.extend(100..112);
    let req = request(2, input.clone(), 0);
    let cached = cache.lookup_cached_prefix(&input);
    assert_eq!(cached.len(), 2);

    let hits_before = cache.hits();
    let misses_before = cache.misses();
    let free_before = cache.free_list();
    let refs_before: Vec<u32> = (0..4).map(|b| cache.block(b).unwrap().ref_count).collect();

    assert!(!cache.allocate(&req, 8, 20, &cached));

    assert_eq!(cache.hits(), hits_before);
    assert_eq!(cache.misses(), misses_before);
    assert_eq!(cache.free_list(), free_before);
    let refs_after: Vec<u32> = (0..4).map(|b| cache.block(b).unwrap().ref_count).collect();
    assert_eq!(refs_after, refs_before);
    assert_eq!(cache.blocks_held(2), 0);
    assert_eq!(cache.lookup_cached_prefix(&input), cached);
    assert!(cache.is_conserved());
}

#[test]
fn test_rollback_restores_evicted_hashes() {
    let mut cache = KvCacheSimulator::new(4, 4);
    let old: Vec<u32> = (0..16).collect();
    assert!(cache.allocate(&request(1, old.clone(), 0), 0, 16, &[]));
    cache.release(1);
    assert_eq!(cache.lookup_cached_prefix(&old).len(), 4);

    // Five fresh blocks cannot fit; the blocks reused along the way must
    // get their old content hashes back.
    let fresh: Vec<u32> = (500..520).collect();
    assert!(!cache.allocate(&request(2, fresh, 0), 0, 20, &[]));
    assert_eq!(cache.lookup_cached_prefix(&old).len(), 4);
    for (i, hash) in prefix_hashes(&old, 4).iter().enumerate() {
        assert!(cache.block_for_hash(hash).is_some(), "block {} lost its hash", i);
    }
}

#[test]
fn test_hits_counted_only_at_commit() {
    let mut cache = KvCacheSimulator::new(16, 4);
    let tokens: Vec<u32> = (0..12).collect();
    assert!(cache.allocate(&request(1, tokens.clone(), 0), 0, 12, &[]));
    for _ in 0..5 {
        cache.lookup_cached_prefix(&tokens);
    }
    assert_eq!(cache.hits(), 0);

    let cached = cache.lookup_cached_prefix(&tokens);
    assert!(cache.allocate(&request(2, tokens, 0), 12, 12, &cached));
    assert_eq!(cache.hits(), 3);
}

#[test]
fn test_tiered_double_promotion_no_double_count() {
    let mut cache = TieredKvCache::new(3, 4, 16, 50, 5);
    let a: Vec<u32> = (0..12).collect();
    assert!(cache.allocate(&request(1, a.clone(), 0), 0, 12, &[]));
    cache.release(1);
    assert!(cache.allocate(&request(2, (200..212).collect(), 0), 0, 12, &[]));
    cache.release(2);

    for _ in 0..3 {
        cache.promote_prefix(&a);
    }
    let cached = cache.lookup_cached_prefix(&a);
    assert_eq!(cached.len(), 3);
    assert_eq!(cache.stats().hits, 0);
    assert!(cache.allocate(&request(3, a, 0), 12, 12, &cached));
    assert_eq!(cache.stats().hits, 3);
    assert!(cache.is_conserved());
}

#[derive(Debug, Clone)]
enum Op {
    Allocate { id: u64, group: u32, len: usize },
    Release { id: u64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..6, 0u32..3, 1usize..48).prop_map(|(id, group, len)| Op::Allocate { id, group, len }),
        (0u64..6).prop_map(|id| Op::Release { id }),
    ]
}

proptest! {
    #[test]
    fn prop_used_plus_free_is_total(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let mut cache = KvCacheSimulator::new(12, 4);
        for op in ops {
            match op {
                Op::Allocate { id, group, len } => {
                    if cache.blocks_held(id) > 0 {
                        continue;
                    }
                    let input: Vec<u32> = (0..len as u32).map(|t| t + group * 1000).collect();
                    let cached = cache.lookup_cached_prefix(&input);
                    let start = cached.len() * 4;
                    let hits_before = cache.hits();
                    let ok = cache.allocate(&request(id, input, 0), start, len, &cached);
                    if !ok {
                        prop_assert_eq!(cache.hits(), hits_before);
                        prop_assert_eq!(cache.blocks_held(id), 0);
                    }
                }
                Op::Release { id } => cache.release(id),
            }
            prop_assert!(cache.is_conserved());
        }
        for id in 0..6 {
            cache.release(id);
        }
        prop_assert_eq!(cache.used_blocks(), 0);
        prop_assert_eq!(cache.free_blocks(), 12);
    }
}
