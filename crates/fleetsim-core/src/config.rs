//! TOML configuration parsing for fleetsim.
//!
//! Defines the configuration schema for a simulation run: the simulation
//! envelope (seed, horizon, trace level), the per-instance resource model,
//! the cluster policies, and an optional workload source. Every parse runs
//! [`SimConfig::validate`], so the core only ever sees checked values.

use crate::latency::LatencyModel;
use crate::scheduler::{
    available_priority_policies, available_schedulers, is_valid_priority_policy,
    is_valid_scheduler,
};
use fleetsim_algorithms::{
    available_admission_policies, available_algorithms, is_valid_admission_policy,
    is_valid_algorithm, parse_scorer_configs, AdmissionParams, RoutingParams, ScorerConfig,
    SloGatedThresholds, DEFAULT_SCORERS,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub simulation: SimulationSection,
    pub instance: InstanceSection,
    pub cluster: ClusterSection,
    /// Request source for the CLI. Library callers pass requests directly.
    pub workload: Option<WorkloadSection>,
}

/// General simulation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSection {
    /// Human-readable name for this simulation.
    #[serde(default = "default_sim_name")]
    pub name: String,
    /// Master seed for every random stream.
    #[serde(default = "default_seed")]
    pub seed: i64,
    /// Logical-time ceiling in microseconds. Unbounded when absent.
    #[serde(default)]
    pub horizon_us: Option<u64>,
    /// `none` or `decisions`.
    #[serde(default = "default_trace_level")]
    pub trace_level: String,
}

fn default_sim_name() -> String {
    "simulation".to_string()
}

fn default_seed() -> i64 {
    42
}

fn default_trace_level() -> String {
    "none".to_string()
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            name: default_sim_name(),
            seed: default_seed(),
            horizon_us: None,
            trace_level: default_trace_level(),
        }
    }
}

/// Resources and scheduling of one instance. All instances are identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSection {
    #[serde(default = "default_total_kv_blocks")]
    pub total_kv_blocks: u32,
    /// Tokens per KV block.
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_max_running_requests")]
    pub max_running_requests: u32,
    /// Token budget per batch step.
    #[serde(default = "default_max_scheduled_tokens")]
    pub max_scheduled_tokens: u32,
    /// Largest prefill chunk per step. 0 disables chunked prefill.
    #[serde(default)]
    pub long_prefill_token_threshold: u32,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default = "default_priority_policy")]
    pub priority_policy: String,
    /// Overflow-tier capacity in blocks. 0 keeps a single tier.
    #[serde(default)]
    pub overflow_kv_blocks: u32,
    #[serde(default = "default_transfer_base_latency")]
    pub transfer_base_latency_us: u64,
    #[serde(default = "default_transfer_latency_per_block")]
    pub transfer_latency_per_block_us: u64,
    #[serde(default)]
    pub latency: LatencySection,
}

fn default_total_kv_blocks() -> u32 {
    8192
}
fn default_block_size() -> u32 {
    16
}
fn default_max_running_requests() -> u32 {
    256
}
fn default_max_scheduled_tokens() -> u32 {
    2048
}
fn default_scheduler() -> String {
    "fcfs".to_string()
}
fn default_priority_policy() -> String {
    "constant".to_string()
}
fn default_transfer_base_latency() -> u64 {
    100
}
fn default_transfer_latency_per_block() -> u64 {
    10
}

/// Latency coefficients, in microseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySection {
    /// `[base, per_prefill_token, per_decode_token]`.
    #[serde(default = "default_beta")]
    pub beta: Vec<f64>,
    /// `[base, per_input_token, output_processing]`.
    #[serde(default = "default_alpha")]
    pub alpha: Vec<f64>,
}

fn default_beta() -> Vec<f64> {
    LatencyModel::default().beta.to_vec()
}
fn default_alpha() -> Vec<f64> {
    LatencyModel::default().alpha.to_vec()
}

impl Default for LatencySection {
    fn default() -> Self {
        Self {
            beta: default_beta(),
            alpha: default_alpha(),
        }
    }
}

/// Cluster policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    pub num_instances: u32,
    #[serde(default = "default_admission_policy")]
    pub admission_policy: String,
    #[serde(default)]
    pub admission_latency_us: u64,
    #[serde(default = "default_routing_policy")]
    pub routing_policy: String,
    #[serde(default)]
    pub routing_latency_us: u64,
    /// Scorer pipeline for `weighted` routing, as `name:weight,...`.
    #[serde(default = "default_scorers")]
    pub scorers: String,
    #[serde(default = "default_token_bucket_capacity")]
    pub token_bucket_capacity: f64,
    /// Tokens added per second.
    #[serde(default = "default_token_bucket_refill_rate")]
    pub token_bucket_refill_rate: f64,
    #[serde(default = "default_standard_threshold")]
    pub slo_standard_queue_threshold: u32,
    #[serde(default = "default_sheddable_threshold")]
    pub slo_sheddable_queue_threshold: u32,
}

fn default_admission_policy() -> String {
    "always-admit".to_string()
}
fn default_routing_policy() -> String {
    "round-robin".to_string()
}
fn default_scorers() -> String {
    DEFAULT_SCORERS.to_string()
}
fn default_token_bucket_capacity() -> f64 {
    10_000.0
}
fn default_token_bucket_refill_rate() -> f64 {
    1_000.0
}
fn default_standard_threshold() -> u32 {
    SloGatedThresholds::default().standard_queue_threshold
}
fn default_sheddable_threshold() -> u32 {
    SloGatedThresholds::default().sheddable_queue_threshold
}

/// Request source: a normalized JSONL file or synthetic Poisson parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSection {
    /// Path to a JSONL request stream. Takes precedence over synthetic fields.
    pub path: Option<String>,
    /// Synthetic: requests per second.
    #[serde(default = "default_rate")]
    pub rate: f64,
    #[serde(default = "default_num_requests")]
    pub num_requests: u32,
    #[serde(default = "default_prompt_mean")]
    pub prompt_tokens_mean: f64,
    #[serde(default = "default_prompt_std")]
    pub prompt_tokens_std: f64,
    #[serde(default = "default_output_mean")]
    pub output_tokens_mean: f64,
    #[serde(default = "default_output_std")]
    pub output_tokens_std: f64,
    /// Distinct shared prefixes. 0 disables prefix sharing.
    #[serde(default)]
    pub num_prefixes: u32,
    /// Tokens in each shared prefix.
    #[serde(default)]
    pub prefix_length: u32,
    /// Classes assigned round-robin to synthetic requests.
    #[serde(default)]
    pub slo_classes: Vec<String>,
}

fn default_rate() -> f64 {
    10.0
}
fn default_num_requests() -> u32 {
    100
}
fn default_prompt_mean() -> f64 {
    512.0
}
fn default_prompt_std() -> f64 {
    128.0
}
fn default_output_mean() -> f64 {
    128.0
}
fn default_output_std() -> f64 {
    32.0
}

impl Default for WorkloadSection {
    fn default() -> Self {
        Self {
            path: None,
            rate: default_rate(),
            num_requests: default_num_requests(),
            prompt_tokens_mean: default_prompt_mean(),
            prompt_tokens_std: default_prompt_std(),
            output_tokens_mean: default_output_mean(),
            output_tokens_std: default_output_std(),
            num_prefixes: 0,
            prefix_length: 0,
            slo_classes: Vec::new(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn check_coefficients(name: &str, values: &[f64]) -> Result<(), ConfigError> {
    if values.len() < 3 {
        return Err(invalid(format!(
            "{} needs 3 coefficients, got {}",
            name,
            values.len()
        )));
    }
    if let Some(v) = values.iter().find(|v| !v.is_finite() || **v < 0.0) {
        return Err(invalid(format!(
            "{} coefficients must be finite and >= 0, got {}",
            name, v
        )));
    }
    Ok(())
}

impl SimConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let inst = &self.instance;
        if inst.total_kv_blocks == 0 {
            return Err(invalid("total_kv_blocks must be > 0"));
        }
        if inst.block_size == 0 {
            return Err(invalid("block_size must be > 0"));
        }
        if inst.max_running_requests == 0 {
            return Err(invalid("max_running_requests must be > 0"));
        }
        if inst.max_scheduled_tokens == 0 {
            return Err(invalid("max_scheduled_tokens must be > 0"));
        }
        if !is_valid_scheduler(&inst.scheduler) {
            return Err(invalid(format!(
                "unknown scheduler '{}'; available: {}",
                inst.scheduler,
                available_schedulers().join(", ")
            )));
        }
        if !is_valid_priority_policy(&inst.priority_policy) {
            return Err(invalid(format!(
                "unknown priority_policy '{}'; available: {}",
                inst.priority_policy,
                available_priority_policies().join(", ")
            )));
        }
        check_coefficients("beta", &inst.latency.beta)?;
        check_coefficients("alpha", &inst.latency.alpha)?;

        let cluster = &self.cluster;
        if cluster.num_instances == 0 {
            return Err(invalid("num_instances must be > 0"));
        }
        if !is_valid_admission_policy(&cluster.admission_policy) {
            return Err(invalid(format!(
                "unknown admission_policy '{}'; available: {}",
                cluster.admission_policy,
                available_admission_policies().join(", ")
            )));
        }
        if !is_valid_algorithm(&cluster.routing_policy) {
            return Err(invalid(format!(
                "unknown routing_policy '{}'; available: {}",
                cluster.routing_policy,
                available_algorithms().join(", ")
            )));
        }
        parse_scorer_configs(&cluster.scorers).map_err(|e| invalid(format!("scorers: {}", e)))?;
        if cluster.admission_policy == "token-bucket" {
            for (name, v) in [
                ("token_bucket_capacity", cluster.token_bucket_capacity),
                ("token_bucket_refill_rate", cluster.token_bucket_refill_rate),
            ] {
                if !v.is_finite() || v <= 0.0 {
                    return Err(invalid(format!("{} must be finite and > 0, got {}", name, v)));
                }
            }
        }

        match self.simulation.trace_level.as_str() {
            "none" | "decisions" => {}
            other => {
                return Err(invalid(format!(
                    "unknown trace_level '{}'; available: none, decisions",
                    other
                )))
            }
        }

        if let Some(w) = &self.workload {
            if w.path.is_none() {
                if !w.rate.is_finite() || w.rate <= 0.0 {
                    return Err(invalid("workload.rate must be finite and > 0"));
                }
                for (name, v) in [
                    ("prompt_tokens_mean", w.prompt_tokens_mean),
                    ("prompt_tokens_std", w.prompt_tokens_std),
                    ("output_tokens_mean", w.output_tokens_mean),
                    ("output_tokens_std", w.output_tokens_std),
                ] {
                    if !v.is_finite() || v < 0.0 {
                        return Err(invalid(format!("workload.{} must be finite and >= 0", name)));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn latency_model(&self) -> LatencyModel {
        let b = &self.instance.latency.beta;
        let a = &self.instance.latency.alpha;
        LatencyModel::new([b[0], b[1], b[2]], [a[0], a[1], a[2]])
    }

    pub fn scorer_configs(&self) -> Result<Vec<ScorerConfig>, ConfigError> {
        parse_scorer_configs(&self.cluster.scorers).map_err(|e| invalid(format!("scorers: {}", e)))
    }

    pub fn routing_params(&self) -> Result<RoutingParams, ConfigError> {
        Ok(RoutingParams {
            block_size: self.instance.block_size as usize,
            scorers: self.scorer_configs()?,
        })
    }

    pub fn admission_params(&self) -> AdmissionParams {
        AdmissionParams {
            token_bucket_capacity: self.cluster.token_bucket_capacity,
            token_bucket_refill_rate: self.cluster.token_bucket_refill_rate,
            slo_thresholds: SloGatedThresholds {
                standard_queue_threshold: self.cluster.slo_standard_queue_threshold,
                sheddable_queue_threshold: self.cluster.slo_sheddable_queue_threshold,
            },
        }
    }

    /// Horizon as a plain timestamp; `u64::MAX` when unbounded.
    pub fn horizon_us(&self) -> u64 {
        self.simulation.horizon_us.unwrap_or(u64::MAX)
    }

    pub fn trace_decisions(&self) -> bool {
        self.simulation.trace_level == "decisions"
    }

    /// Copy of this config with a different routing policy, for comparisons.
    pub fn with_routing_policy(&self, name: &str) -> Result<Self, ConfigError> {
        let mut config = self.clone();
        config.cluster.routing_policy = name.to_string();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
[simulation]
name = "test-sim"
seed = -7
horizon_us = 60000000
trace_level = "decisions"

[instance]
total_kv_blocks = 128
block_size = 16
max_running_requests = 32
max_scheduled_tokens = 1024
long_prefill_token_threshold = 256
scheduler = "sjf"
priority_policy = "slo-based"

[instance.latency]
beta = [1000.0, 5.0, 50.0]
alpha = [200.0, 0.5, 30.0]

[cluster]
num_instances = 4
routing_policy = "weighted"
scorers = "queue-depth:1,kv-utilization:1"
admission_policy = "slo-gated"
admission_latency_us = 50
routing_latency_us = 20
"#;

    fn minimal(extra_instance: &str, extra_cluster: &str) -> String {
        format!(
            "[instance]\n{}\n[cluster]\nnum_instances = 2\n{}\n",
            extra_instance, extra_cluster
        )
    }

    #[test]
    fn test_parse_config() {
        let config = SimConfig::from_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.simulation.name, "test-sim");
        assert_eq!(config.simulation.seed, -7);
        assert_eq!(config.horizon_us(), 60_000_000);
        assert!(config.trace_decisions());
        assert_eq!(config.cluster.num_instances, 4);
        assert_eq!(config.instance.scheduler, "sjf");
        assert_eq!(config.latency_model().beta, [1000.0, 5.0, 50.0]);
        assert_eq!(config.scorer_configs().unwrap().len(), 2);
    }

    #[test]
    fn test_defaults() {
        let config = SimConfig::from_str(&minimal("", "")).unwrap();
        assert_eq!(config.simulation.seed, 42);
        assert_eq!(config.horizon_us(), u64::MAX);
        assert_eq!(config.instance.block_size, 16);
        assert_eq!(config.cluster.routing_policy, "round-robin");
        assert_eq!(config.cluster.scorers, DEFAULT_SCORERS);
        assert_eq!(config.cluster.slo_standard_queue_threshold, 10);
        assert!(config.workload.is_none());
    }

    #[test]
    fn test_validation_zero_blocks() {
        assert!(SimConfig::from_str(&minimal("total_kv_blocks = 0", "")).is_err());
        assert!(SimConfig::from_str(&minimal("block_size = 0", "")).is_err());
    }

    #[test]
    fn test_negative_blocks_rejected_at_parse() {
        let err = SimConfig::from_str(&minimal("total_kv_blocks = -4", "")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation_zero_instances() {
        let toml = "[instance]\n[cluster]\nnum_instances = 0\n";
        assert!(SimConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_validation_unknown_names() {
        assert!(SimConfig::from_str(&minimal("scheduler = \"lifo\"", "")).is_err());
        assert!(SimConfig::from_str(&minimal("priority_policy = \"vip\"", "")).is_err());
        assert!(SimConfig::from_str(&minimal("", "routing_policy = \"p2c\"")).is_err());
        assert!(SimConfig::from_str(&minimal("", "admission_policy = \"bouncer\"")).is_err());
        assert!(SimConfig::from_str(&minimal("", "scorers = \"telepathy:1\"")).is_err());
    }

    #[test]
    fn test_validation_bad_scorer_weights() {
        for spec in ["queue-depth:0", "queue-depth:-1", "queue-depth:nan", "queue-depth:inf"] {
            let extra = format!("scorers = \"{}\"", spec);
            assert!(SimConfig::from_str(&minimal("", &extra)).is_err(), "{}", spec);
        }
        let dup = "scorers = \"queue-depth:1,queue-depth:2\"";
        assert!(SimConfig::from_str(&minimal("", dup)).is_err());
    }

    #[test]
    fn test_validation_coefficients() {
        let short = "[instance.latency]\nbeta = [1.0, 2.0]";
        assert!(SimConfig::from_str(&minimal(short, "")).is_err());
        let negative = "[instance.latency]\nalpha = [1.0, -2.0, 0.0]";
        assert!(SimConfig::from_str(&minimal(negative, "")).is_err());
    }

    #[test]
    fn test_validation_token_bucket() {
        let extra = "admission_policy = \"token-bucket\"\ntoken_bucket_capacity = 0.0";
        assert!(SimConfig::from_str(&minimal("", extra)).is_err());
        let ok = "admission_policy = \"token-bucket\"";
        assert!(SimConfig::from_str(&minimal("", ok)).is_ok());
    }

    #[test]
    fn test_validation_trace_level() {
        let toml = format!("[simulation]\ntrace_level = \"verbose\"\n{}", minimal("", ""));
        assert!(SimConfig::from_str(&toml).is_err());
    }

    #[test]
    fn test_with_routing_policy() {
        let config = SimConfig::from_str(SAMPLE_CONFIG).unwrap();
        let rr = config.with_routing_policy("round-robin").unwrap();
        assert_eq!(rr.cluster.routing_policy, "round-robin");
        assert!(config.with_routing_policy("nonexistent").is_err());
    }
}
