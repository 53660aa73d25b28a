//! Request streams for the simulator.
//!
//! Two sources produce the normalized, arrival-sorted `Vec<Request>` the
//! cluster consumes:
//! - **JSONL**: one already-normalized request per line.
//! - **Synthetic**: Poisson arrivals with normally distributed lengths, drawn
//!   from the `workload` random stream.
//!
//! Token ids are synthesized when a record only gives lengths. Requests in
//! the same `prefix_group` share their first `prefix_len` token ids, which is
//! what makes prefix caching and prefix-aware routing observable.

use crate::config::{SimConfig, WorkloadSection};
use crate::request::Request;
use crate::rng::{fnv1a64, PartitionedRng, SUBSYSTEM_WORKLOAD};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// Vocabulary size used for synthesized token ids.
const VOCAB_SIZE: u64 = 32_000;

#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("Failed to read workload file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse JSON at line {line}: {source}")]
    JsonParse {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Invalid workload: {0}")]
    Invalid(String),
}

/// One normalized JSONL record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecordIn {
    /// Defaults to the record's position in the file.
    pub id: Option<u64>,
    pub arrival_us: u64,
    /// Explicit prompt token ids. Takes precedence over `input_len`.
    pub input_tokens: Option<Vec<u32>>,
    pub input_len: Option<u32>,
    pub output_len: u32,
    #[serde(default)]
    pub slo_class: String,
    /// Requests with the same group share a prompt prefix.
    pub prefix_group: Option<String>,
    /// Shared prefix length for `prefix_group`; defaults to the whole prompt.
    pub prefix_len: Option<u32>,
}

/// Deterministic token id for position `i` of a stream keyed by `key`.
fn token_at(key: u64, i: u64) -> u32 {
    let mixed = key ^ i.wrapping_mul(0x9e3779b97f4a7c15);
    (fnv1a64(&mixed.to_string()) % VOCAB_SIZE) as u32
}

/// Prompt of `len` tokens whose first `prefix_len` come from `group`.
pub fn synthesize_prompt(id: u64, len: usize, group: Option<&str>, prefix_len: usize) -> Vec<u32> {
    let shared = group.map_or(0, |_| prefix_len.min(len));
    let group_key = group.map_or(0, fnv1a64);
    let own_key = fnv1a64(&format!("request-{}", id));
    (0..len as u64)
        .map(|i| {
            if (i as usize) < shared {
                token_at(group_key, i)
            } else {
                token_at(own_key, i)
            }
        })
        .collect()
}

/// Output token ids for a request. Their values only matter for KV hashing.
pub fn synthesize_output(id: u64, len: usize) -> Vec<u32> {
    let key = fnv1a64(&format!("output-{}", id));
    (0..len as u64).map(|i| token_at(key, i)).collect()
}

fn record_to_request(position: u64, record: RequestRecordIn) -> Result<Request, WorkloadError> {
    let id = record.id.unwrap_or(position);
    let input = match (record.input_tokens, record.input_len) {
        (Some(tokens), _) => tokens,
        (None, Some(len)) => {
            let prefix = record.prefix_len.unwrap_or(len) as usize;
            synthesize_prompt(id, len as usize, record.prefix_group.as_deref(), prefix)
        }
        (None, None) => {
            return Err(WorkloadError::Invalid(format!(
                "request {} has neither input_tokens nor input_len",
                id
            )))
        }
    };
    let output = synthesize_output(id, record.output_len as usize);
    Ok(Request::new(id, record.arrival_us, input, output, record.slo_class))
}

/// Load a JSONL request stream.
pub fn load_jsonl(path: &Path) -> Result<Vec<Request>, WorkloadError> {
    let file = std::fs::File::open(path)?;
    parse_jsonl(BufReader::new(file))
}

/// Parse JSONL from any reader. Blank lines and `#` comments are skipped.
/// The result is sorted by arrival; equal arrivals keep file order.
pub fn parse_jsonl<R: Read>(reader: BufReader<R>) -> Result<Vec<Request>, WorkloadError> {
    let mut requests = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let record: RequestRecordIn =
            serde_json::from_str(trimmed).map_err(|e| WorkloadError::JsonParse {
                line: line_num + 1,
                source: e,
            })?;
        requests.push(record_to_request(requests.len() as u64, record)?);
    }

    let mut ids: Vec<u64> = requests.iter().map(|r| r.id).collect();
    ids.sort_unstable();
    if let Some(w) = ids.windows(2).find(|w| w[0] == w[1]) {
        return Err(WorkloadError::Invalid(format!("duplicate request id {}", w[0])));
    }

    requests.sort_by_key(|r| r.arrival_us());
    Ok(requests)
}

/// Standard normal sample via Box-Muller.
fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Draw a synthetic Poisson workload from the `workload` stream.
pub fn generate(params: &WorkloadSection, rng: &mut PartitionedRng) -> Vec<Request> {
    let stream = rng.for_subsystem(SUBSYSTEM_WORKLOAD);
    let mut arrival_us = 0.0f64;
    let mut requests = Vec::with_capacity(params.num_requests as usize);

    for i in 0..params.num_requests as u64 {
        let u: f64 = stream.gen();
        arrival_us += -(1.0 - u).ln() / params.rate * 1e6;

        let prompt = (params.prompt_tokens_mean + standard_normal(stream) * params.prompt_tokens_std)
            .round()
            .max(1.0) as usize;
        let output = (params.output_tokens_mean + standard_normal(stream) * params.output_tokens_std)
            .round()
            .max(1.0) as usize;

        let group = if params.num_prefixes > 0 {
            Some(format!("prefix-{}", stream.gen_range(0..params.num_prefixes)))
        } else {
            None
        };
        let prompt = prompt.max(params.prefix_length as usize);
        let input = synthesize_prompt(i, prompt, group.as_deref(), params.prefix_length as usize);

        let class = if params.slo_classes.is_empty() {
            String::new()
        } else {
            params.slo_classes[i as usize % params.slo_classes.len()].clone()
        };

        requests.push(Request::new(
            i,
            arrival_us as u64,
            input,
            synthesize_output(i, output),
            class,
        ));
    }
    requests
}

/// Requests for a run: an explicit JSONL path wins, then `workload.path`,
/// then synthetic generation from the `[workload]` section (or its defaults).
pub fn from_config(config: &SimConfig, path: Option<&Path>) -> Result<Vec<Request>, WorkloadError> {
    let section = config.workload.clone().unwrap_or_default();
    if let Some(p) = path {
        return load_jsonl(p);
    }
    if let Some(p) = &section.path {
        return load_jsonl(Path::new(p));
    }
    let mut rng = PartitionedRng::new(config.simulation.seed);
    Ok(generate(&section, &mut rng))
}
