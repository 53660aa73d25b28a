/// Integration tests for workload loading and generation.
use fleetsim_core::config::SimConfig;
use fleetsim_core::rng::PartitionedRng;
use fleetsim_core::workload::{self, WorkloadError};
use std::io::Write;
use std::path::PathBuf;

fn temp_jsonl(name: &str, content: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("fleetsim-{}-{}.jsonl", name, std::process::id()));
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

const SAMPLE: &str = r#"{"arrival_us": 0, "input_len": 128, "output_len": 16, "slo_class": "critical", "prefix_group": "system", "prefix_len": 64}
{"arrival_us": 5000, "input_len": 96, "output_len": 8, "slo_class": "standard", "prefix_group": "system", "prefix_len": 64}
{"arrival_us": 2500, "input_tokens": [5, 6, 7, 8], "output_len": 4}
"#;

fn config_with_workload(workload_section: &str) -> SimConfig {
    SimConfig::from_str(&format!(
        r#"
[instance]
total_kv_blocks = 64

[cluster]
num_instances = 2

{}
"#,
        workload_section
    ))
    .unwrap()
}

#[test]
fn test_load_jsonl_file() {
    let path = temp_jsonl("load", SAMPLE);
    let requests = workload::load_jsonl(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(requests.len(), 3);
    let ids: Vec<u64> = requests.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![0, 2, 1]);
    assert_eq!(requests[1].input_tokens, vec![5, 6, 7, 8]);
    assert_eq!(requests[0].input_tokens[..64], requests[2].input_tokens[..64]);
}

#[test]
fn test_missing_file_is_io_error() {
    let err = workload::load_jsonl(&PathBuf::from("/nonexistent/fleetsim.jsonl")).unwrap_err();
    assert!(matches!(err, WorkloadError::Io(_)));
}

#[test]
fn test_explicit_path_overrides_synthetic() {
    let path = temp_jsonl("override", SAMPLE);
    let config = config_with_workload("[workload]\nnum_requests = 50");
    let requests = workload::from_config(&config, Some(&path)).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(requests.len(), 3);
}

#[test]
fn test_config_path_used() {
    let path = temp_jsonl("config-path", SAMPLE);
    let config = config_with_workload(&format!("[workload]\npath = {:?}", path.display().to_string()));
    let requests = workload::from_config(&config, None).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(requests.len(), 3);
}

#[test]
fn test_synthetic_defaults_without_section() {
    let config = config_with_workload("");
    let requests = workload::from_config(&config, None).unwrap();
    assert_eq!(requests.len(), 100);
    assert!(requests.iter().all(|r| r.input_len() >= 1 && r.output_len() >= 1));
}

#[test]
fn test_generated_prefix_groups_share_tokens() {
    let config = config_with_workload(
        "[workload]\nnum_requests = 60\nnum_prefixes = 2\nprefix_length = 48",
    );
    let section = config.workload.clone().unwrap();
    let requests = workload::generate(&section, &mut PartitionedRng::new(3));
    let heads: std::collections::BTreeSet<Vec<u32>> = requests
        .iter()
        .map(|r| r.input_tokens[..48].to_vec())
        .collect();
    assert_eq!(heads.len(), 2);
}

#[test]
fn test_jsonl_workload_runs_with_class_breakdown() {
    let path = temp_jsonl("run", SAMPLE);
    let config = config_with_workload("");
    let requests = workload::from_config(&config, Some(&path)).unwrap();
    std::fs::remove_file(&path).ok();

    let report = fleetsim_core::run_simulation(config, requests).unwrap();
    assert_eq!(report.metrics.completed, 3);
    let classes = report.metrics.per_slo_class.unwrap();
    let names: Vec<&str> = classes.keys().map(|s| s.as_str()).collect();
    assert_eq!(names, vec!["", "critical", "standard"]);
}
