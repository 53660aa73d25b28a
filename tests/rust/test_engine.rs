/// Integration tests for the cluster and instance simulation engine.
use fleetsim_core::config::SimConfig;
use fleetsim_core::engine::EventQueue;
use fleetsim_core::metrics::RequestOutcome;
use fleetsim_core::{Request, SimulationReport};

fn base_config(instance_extra: &str, cluster_extra: &str) -> SimConfig {
    SimConfig::from_str(&format!(
        r#"
[simulation]
name = "integration-test"
seed = 42

[instance]
total_kv_blocks = 256
block_size = 16
max_running_requests = 8
max_scheduled_tokens = 2048
{}

[instance.latency]
beta = [1000.0, 1.0, 10.0]
alpha = [100.0, 0.0, 50.0]

[cluster]
num_instances = 2
{}
"#,
        instance_extra, cluster_extra
    ))
    .unwrap()
}

fn mixed_workload(n: usize, gap_us: u64) -> Vec<Request> {
    (0..n)
        .map(|i| {
            let input = [32, 64, 128, 256][i % 4];
            let output = [4, 8, 16, 32][i % 4];
            Request::new(
                i as u64,
                i as u64 * gap_us,
                vec![i as u32; input],
                vec![1; output],
                "",
            )
        })
        .collect()
}

fn run(config: SimConfig, requests: Vec<Request>) -> SimulationReport {
    fleetsim_core::run_simulation(config, requests).unwrap()
}

fn assert_conserved(report: &SimulationReport) {
    let m = &report.metrics;
    assert_eq!(
        m.injected,
        m.completed + m.still_queued + m.still_running + m.rejected + m.dropped_unservable,
        "conservation broken: {:?}",
        m
    );
    assert_eq!(report.requests.len() as u64, m.injected);
}

/// Every completed request waited at most `tolerance` step times between
/// instance enqueue and first scheduling.
fn assert_scheduling_delay_within(report: &SimulationReport, step_us: u64, tolerance: f64) {
    let bound = step_us as f64 * tolerance;
    for r in &report.requests {
        if let Some(delay) = r.scheduling_delay_us() {
            assert!(
                delay as f64 <= bound,
                "request {} waited {}us, bound {}us",
                r.id,
                delay,
                bound
            );
        }
    }
}

#[test]
fn test_full_simulation_completes_everything() {
    let report = run(base_config("", ""), mixed_workload(100, 2_000));
    assert_eq!(report.metrics.completed, 100);
    assert_eq!(report.metrics.still_queued, 0);
    assert_eq!(report.metrics.still_running, 0);
    assert!(report.metrics.ttft.p50 > 0.0);
    assert!(report.metrics.requests_per_sec > 0.0);
    assert_conserved(&report);
    for inst in &report.metrics.per_instance {
        assert_eq!(inst.kv_cache.used_blocks, 0);
        assert_eq!(
            inst.kv_cache.used_blocks + inst.kv_cache.free_blocks,
            inst.kv_cache.total_blocks
        );
    }
}

#[test]
fn test_lifecycle_causality() {
    let report = run(base_config("", ""), mixed_workload(60, 500));
    for r in &report.requests {
        assert_eq!(r.outcome, RequestOutcome::Completed);
        let first = r.first_token_us.unwrap();
        let done = r.completion_us.unwrap();
        assert!(r.arrival_us <= first, "request {}", r.id);
        assert!(first <= done, "request {}", r.id);
        assert!(r.enqueue_us.unwrap() <= r.schedule_us.unwrap());
    }
}

#[test]
fn test_work_conserving_single_slot() {
    // One running slot; the second request arrives while the first is
    // being served and nothing arrives afterwards.
    let config = base_config("max_running_requests = 1", "num_instances = 1");
    let requests = vec![
        Request::new(0, 0, vec![1; 64], vec![2; 8], ""),
        Request::new(1, 300, vec![3; 64], vec![4; 8], ""),
    ];
    let report = run(config, requests);
    assert_eq!(report.metrics.completed, 2);
    let done: Vec<u64> = report
        .requests
        .iter()
        .map(|r| r.completion_us.unwrap())
        .collect();
    assert!(done[1] > done[0]);
    assert_conserved(&report);
}

#[test]
fn test_conservation_under_any_horizon() {
    for horizon in [0, 500, 2_000, 10_000, 50_000, 200_000] {
        let mut config = base_config("", "");
        config.simulation.horizon_us = Some(horizon);
        let report = run(config, mixed_workload(40, 1_000));
        assert_conserved(&report);
        assert!(report.metrics.sim_duration_us <= horizon);
    }
}

#[test]
fn test_horizon_shorter_than_pipeline_latency() {
    let mut config = base_config(
        "",
        "admission_latency_us = 5000\nrouting_latency_us = 5000",
    );
    config.simulation.horizon_us = Some(8_000);
    let report = run(config, mixed_workload(3, 100));

    assert_eq!(report.metrics.completed, 0);
    assert_eq!(report.metrics.injected, 3);
    assert_eq!(report.metrics.still_queued, 3);
    assert_eq!(report.metrics.warnings.len(), 2);
    assert!(report.metrics.warnings[0].contains("horizon"));
    assert!(report.metrics.warnings[1].contains("zero requests completed"));
    assert!(report
        .requests
        .iter()
        .all(|r| r.outcome == RequestOutcome::InPipeline));
}

#[test]
fn test_scheduling_delay_light_load() {
    // Requests far apart: each is scheduled in the step its arrival starts.
    let report = run(base_config("", "num_instances = 1"), mixed_workload(20, 100_000));
    assert_eq!(report.metrics.completed, 20);
    assert_scheduling_delay_within(&report, 1_000, 1.0);
}

#[test]
fn test_scheduling_delay_grows_with_contention() {
    let config = base_config("max_running_requests = 1", "num_instances = 1");
    let requests: Vec<Request> = (0..3)
        .map(|i| Request::new(i, 0, vec![i as u32; 32], vec![1; 4], ""))
        .collect();
    let report = run(config, requests);
    assert_eq!(report.metrics.completed, 3);
    let last = report.requests.last().unwrap();
    assert!(last.scheduling_delay_us().unwrap() > 0);
    // Two requests ahead, each about four steps plus output processing.
    assert_scheduling_delay_within(&report, 1_100, 10.0);
}

#[test]
fn test_preemption_under_kv_pressure() {
    let config = base_config(
        "total_kv_blocks = 8\nmax_running_requests = 4",
        "num_instances = 1",
    );
    let requests = vec![
        Request::new(0, 0, vec![5; 32], vec![1; 48], ""),
        Request::new(1, 0, vec![6; 32], vec![1; 48], ""),
    ];
    let report = run(config, requests);
    assert_eq!(report.metrics.completed, 2);
    assert!(report.metrics.preemptions > 0);
    assert!(report.metrics.kv_allocation_failures > 0);
    assert!(report.requests.iter().any(|r| r.preemptions > 0));
    assert_eq!(report.metrics.per_instance[0].kv_cache.used_blocks, 0);
    assert_conserved(&report);
}

#[test]
fn test_chunked_prefill_delays_first_token() {
    let single = || vec![Request::new(0, 0, vec![9; 256], vec![1; 4], "")];
    let whole = run(base_config("", "num_instances = 1"), single());
    let chunked = run(
        base_config("long_prefill_token_threshold = 64", "num_instances = 1"),
        single(),
    );
    let ttft = |r: &SimulationReport| r.requests[0].ttft_us().unwrap();
    // 1000 + 256 in one step versus four chunks of 1000 + 64.
    assert_eq!(ttft(&whole), 100 + 1_256);
    assert_eq!(ttft(&chunked), 100 + 4 * 1_064);
}

#[test]
fn test_unservable_request_dropped() {
    let config = base_config("total_kv_blocks = 4", "num_instances = 1");
    let requests = vec![
        Request::new(0, 0, vec![1; 32], vec![1; 4], ""),
        Request::new(1, 10, vec![1; 512], vec![1; 64], ""),
    ];
    let report = run(config, requests);
    assert_eq!(report.metrics.completed, 1);
    assert_eq!(report.metrics.dropped_unservable, 1);
    assert_eq!(report.requests[1].outcome, RequestOutcome::DroppedUnservable);
    assert_conserved(&report);
}

#[test]
fn test_tiered_cache_run() {
    let config = base_config(
        "total_kv_blocks = 32\noverflow_kv_blocks = 64",
        "num_instances = 1",
    );
    let requests: Vec<Request> = (0..30)
        .map(|i| {
            let mut input = vec![7; 64];
            input.extend(vec![i as u32; 32]);
            Request::new(i, i * 20_000, input, vec![1; 8], "")
        })
        .collect();
    let report = run(config, requests);
    assert_eq!(report.metrics.completed, 30);
    assert!(report.metrics.kv_cache_hit_rate > 0.0);
    assert_conserved(&report);
}

#[test]
fn test_event_queue_order_and_monotonic_clock() {
    let mut queue = EventQueue::new();
    for (t, label) in [(30, "c"), (10, "a"), (30, "d"), (20, "b"), (10, "a2")] {
        queue.schedule(t, label);
    }
    let mut popped = Vec::new();
    let mut last = 0;
    while let Some((t, label)) = queue.pop_until(u64::MAX).unwrap() {
        assert!(t >= last);
        last = t;
        popped.push(label);
    }
    assert_eq!(popped, vec!["a", "a2", "b", "c", "d"]);
}

#[test]
fn test_event_queue_respects_horizon() {
    let mut queue = EventQueue::new();
    queue.schedule(5, ());
    queue.schedule(50, ());
    assert!(queue.pop_until(10).unwrap().is_some());
    assert!(queue.pop_until(10).unwrap().is_none());
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.now_us(), 5);
}
