/// Integration tests for routing and admission policies in a simulation context.
use fleetsim_algorithms::*;
use fleetsim_core::config::SimConfig;
use fleetsim_core::workload::synthesize_prompt;
use fleetsim_core::{Request, SimulationReport};
use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn small_config(policy: &str, extra_cluster: &str) -> SimConfig {
    SimConfig::from_str(&format!(
        r#"
[simulation]
name = "algo-test"
seed = 42
trace_level = "decisions"

[instance]
total_kv_blocks = 128
block_size = 16
max_running_requests = 16
max_scheduled_tokens = 2048

[instance.latency]
beta = [1000.0, 2.0, 50.0]
alpha = [100.0, 0.0, 50.0]

[cluster]
num_instances = 2
routing_policy = "{}"
{}
"#,
        policy, extra_cluster
    ))
    .unwrap()
}

/// 200 requests at 50/s, alternating one large and one small request.
fn alternating_requests() -> Vec<Request> {
    (0..200u64)
        .map(|i| {
            let (input, output) = if i % 2 == 0 { (512, 128) } else { (32, 8) };
            Request::new(i, i * 20_000, vec![i as u32; input], vec![1; output], "")
        })
        .collect()
}

fn run(config: SimConfig, requests: Vec<Request>) -> SimulationReport {
    fleetsim_core::run_simulation(config, requests).unwrap()
}

fn assignments(report: &SimulationReport) -> Vec<Option<u32>> {
    report.requests.iter().map(|r| r.instance).collect()
}

fn output_imbalance(report: &SimulationReport) -> u64 {
    let per = &report.metrics.per_instance;
    per[0].output_tokens.abs_diff(per[1].output_tokens)
}

#[test]
fn test_load_aware_differs_from_round_robin() {
    let rr = run(small_config("round-robin", ""), alternating_requests());
    let ll = run(small_config("least-loaded", ""), alternating_requests());

    assert_eq!(rr.metrics.completed, 200);
    assert_eq!(ll.metrics.completed, 200);
    assert_ne!(assignments(&rr), assignments(&ll));
    // Round-robin pins every large request to instance 0.
    assert!(
        output_imbalance(&ll) < output_imbalance(&rr),
        "least-loaded imbalance {} vs round-robin {}",
        output_imbalance(&ll),
        output_imbalance(&rr)
    );
}

#[test]
fn test_inverse_load_pipeline_matches_least_loaded() {
    let weighted = run(
        small_config("weighted", "scorers = \"queue-depth:1\""),
        alternating_requests(),
    );
    let ll = run(small_config("least-loaded", ""), alternating_requests());
    assert_eq!(assignments(&weighted), assignments(&ll));
}

#[test]
fn test_prefix_affinity_gets_cache_hits() {
    let requests: Vec<Request> = (0..40u64)
        .map(|i| {
            let group = format!("tenant-{}", i % 4);
            let input = synthesize_prompt(i, 96, Some(&group), 64);
            Request::new(i, i * 30_000, input, vec![1; 8], "")
        })
        .collect();
    let report = run(small_config("prefix-affinity", ""), requests);
    assert_eq!(report.metrics.completed, 40);
    assert!(report.metrics.kv_cache_hit_rate > 0.0);

    // Every request of a group lands where the group's first request did.
    for r in &report.requests[4..] {
        let first = &report.requests[(r.id % 4) as usize];
        assert_eq!(r.instance, first.instance, "request {}", r.id);
    }
}

#[test]
fn test_random_policy_uses_seeded_router_stream() {
    let requests = || {
        (0..30u64)
            .map(|i| Request::new(i, i * 1_000, vec![1; 16], vec![1; 2], ""))
            .collect::<Vec<_>>()
    };
    let a = run(small_config("random", "num_instances = 3"), requests());
    let b = run(small_config("random", "num_instances = 3"), requests());
    assert_eq!(assignments(&a), assignments(&b));

    let mut other = small_config("random", "num_instances = 3");
    other.simulation.seed = 7;
    let c = run(other, requests());
    assert_ne!(assignments(&a), assignments(&c));
}

#[test]
fn test_token_bucket_sheds_burst() {
    let requests: Vec<Request> = (0..20u64)
        .map(|i| Request::new(i, 0, vec![1; 100], vec![1; 4], ""))
        .collect();
    let config = small_config(
        "round-robin",
        "admission_policy = \"token-bucket\"\ntoken_bucket_capacity = 500\ntoken_bucket_refill_rate = 1",
    );
    let report = run(config, requests);
    assert_eq!(report.metrics.rejected, 15);
    assert_eq!(report.metrics.completed, 5);
    assert_eq!(report.metrics.rejection_reasons.get("token-bucket"), Some(&15));
    let summary = report.trace_summary.unwrap();
    assert_eq!(summary.admitted, 5);
    assert_eq!(summary.rejected, 15);
}

#[test]
fn test_slo_gated_never_rejects_critical() {
    let requests: Vec<Request> = (0..60u64)
        .map(|i| {
            let class = ["critical", "standard", "sheddable"][(i % 3) as usize];
            Request::new(i, i * 10, vec![i as u32; 256], vec![1; 32], class)
        })
        .collect();
    let config = small_config(
        "least-loaded",
        "admission_policy = \"slo-gated\"\nslo_standard_queue_threshold = 4\nslo_sheddable_queue_threshold = 2\nnum_instances = 1",
    );
    let mut config = config;
    config.instance.max_running_requests = 1;
    let report = run(config, requests);

    let classes = report.metrics.per_slo_class.as_ref().unwrap();
    assert_eq!(classes["critical"].rejected, 0);
    assert_eq!(classes["critical"].completed, 20);
    assert!(classes["sheddable"].rejected > 0);
    assert!(classes["sheddable"].rejected >= classes["standard"].rejected);
}

#[test]
fn test_trace_regret_zero_for_argmax_policy() {
    let report = run(
        small_config("weighted", "scorers = \"queue-depth:2,kv-utilization:1\""),
        alternating_requests(),
    );
    let summary = report.trace_summary.unwrap();
    assert_eq!(summary.routed, 200);
    assert_eq!(summary.max_regret, 0.0);
    assert_eq!(summary.unique_targets, 2);
}

fn snapshot_strategy() -> impl Strategy<Value = Vec<InstanceSnapshot>> {
    proptest::collection::vec((0u32..20, 0u32..20, 0u32..5, 0.0f64..1.0), 1..8).prop_map(
        |loads| {
            loads
                .into_iter()
                .enumerate()
                .map(|(i, (queue, batch, pending, util))| InstanceSnapshot {
                    id: i as u32,
                    queue_depth: queue,
                    batch_size: batch,
                    pending_requests: pending,
                    kv_utilization: util,
                    free_kv_blocks: 100,
                    cache_hit_rate: 0.0,
                })
                .collect()
        },
    )
}

proptest! {
    #[test]
    fn prop_queue_depth_scorer_equals_least_loaded(snaps in snapshot_strategy()) {
        let params = RoutingParams {
            block_size: 16,
            scorers: parse_scorer_configs("queue-depth:1").unwrap(),
        };
        let mut weighted = algorithm_by_name("weighted", &params).unwrap();
        let mut least = algorithm_by_name("least-loaded", &params).unwrap();
        let request = RequestInfo {
            id: 0,
            input_tokens: &[],
            output_len: 1,
            slo_class: "",
        };
        let state = RouterState { snapshots: &snaps, clock_us: 0 };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let a = weighted.route(&request, &state, &mut rng);
        let b = least.route(&request, &state, &mut rng);
        prop_assert_eq!(a.target, b.target);
    }
}
