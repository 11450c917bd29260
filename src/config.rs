use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::editing::EditingRtcExample;
use crate::synthesis::SynthesisRtcExample;

/// Which round-trip task to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Synthesis,
    Editing,
}

/// Sampling parameters for one direction (forward or backward).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirectionConfig {
    /// OpenAI-compatible endpoint base URL, e.g. `http://localhost:8000/v1`
    pub api_endpoint: String,
    /// Model identifier sent with each request
    pub model: String,
    /// Environment variable holding the API key, when the endpoint needs one
    #[serde(default)]
    pub env_var_api_key: Option<String>,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Maximum generation length in tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Completions requested per prompt: forward samples per datapoint, or
    /// backward samples per forward sample
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,
    /// Cap on in-flight requests across all calls through this direction's
    /// prompt factory
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Per-request timeout; an elapsed timeout counts as a failed branch
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_temperature() -> f64 {
    0.8
}

fn default_max_tokens() -> u32 {
    256
}

fn default_n_samples() -> usize {
    3
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// Task-level configuration shared by both directions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskConfig {
    pub kind: TaskKind,
    /// Override for the task's built-in forward instruction
    #[serde(default)]
    pub forward_instruction: Option<String>,
    /// Override for the task's built-in backward instruction
    #[serde(default)]
    pub backward_instruction: Option<String>,
    /// Marker annotating the start of the code region (synthesis task)
    #[serde(default = "default_region_start_marker")]
    pub region_start_marker: String,
    /// Marker annotating the end of the code region (synthesis task)
    #[serde(default = "default_region_end_marker")]
    pub region_end_marker: String,
    /// Token joining few-shot examples; also terminates sampled text
    #[serde(default = "default_example_separator")]
    pub example_separator: String,
    /// Extra stop strings passed through to the endpoint
    #[serde(default)]
    pub stopping_tokens: Vec<String>,
    /// Few-shot examples for the synthesis task; each needs a ground-truth
    /// description
    #[serde(default)]
    pub synthesis_few_shot: Vec<SynthesisRtcExample>,
    /// Few-shot examples for the editing task
    #[serde(default)]
    pub editing_few_shot: Vec<EditingRtcExample>,
}

fn default_region_start_marker() -> String {
    "<<<region start>>>".to_string()
}

fn default_region_end_marker() -> String {
    "<<<region end>>>".to_string()
}

fn default_example_separator() -> String {
    "\n\n".to_string()
}

impl TaskConfig {
    /// Stop tokens for every request: the example separator first, then
    /// any configured extras.
    pub fn stop_tokens(&self) -> Vec<String> {
        let mut tokens = vec![self.example_separator.clone()];
        for token in &self.stopping_tokens {
            if !tokens.contains(token) {
                tokens.push(token.clone());
            }
        }
        tokens
    }
}

/// Root configuration for a sampling run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Input archive of datapoints (`.jsonl` or `.jsonl.gz`)
    pub input_data_path: String,
    /// Output archive of generation records
    pub output_data_path: String,
    /// Optional HTML visualization of the sampled round trips
    #[serde(default)]
    pub html_output_path: Option<String>,
    /// Datapoints processed concurrently. The per-direction request caps
    /// bound endpoint pressure; this bounds how much work is in flight so
    /// early records finish early.
    #[serde(default = "default_max_concurrent_datapoints")]
    pub max_concurrent_datapoints: usize,
    /// Retries per generation request on transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Initial backoff before a retry; doubles per attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    pub task: TaskConfig,
    pub forward: DirectionConfig,
    pub backward: DirectionConfig,
}

fn default_max_concurrent_datapoints() -> usize {
    25
}

fn default_max_retries() -> usize {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, direction) in [("forward", &self.forward), ("backward", &self.backward)] {
            if direction.max_concurrent_requests < 1 {
                bail!("{name}.max_concurrent_requests must be at least 1");
            }
            if !(0.0..=2.0).contains(&direction.temperature) {
                bail!("{name}.temperature must be within [0.0, 2.0]");
            }
            if direction.temperature == 0.0 && direction.n_samples > 1 {
                bail!("{name}: drawing more than one sample at temperature 0 is redundant");
            }
            if direction.max_tokens == 0 {
                bail!("{name}.max_tokens must be at least 1");
            }
            if direction.request_timeout_secs == 0 {
                bail!("{name}.request_timeout_secs must be at least 1");
            }
        }
        if self.max_concurrent_datapoints < 1 {
            bail!("max_concurrent_datapoints must be at least 1");
        }
        if self.task.example_separator.is_empty() {
            bail!("task.example_separator must not be empty");
        }
        match self.task.kind {
            TaskKind::Synthesis => {
                if !self.task.editing_few_shot.is_empty() {
                    bail!("task.editing_few_shot is not used by the synthesis task");
                }
                if self.task.region_start_marker.is_empty()
                    || self.task.region_end_marker.is_empty()
                {
                    bail!("synthesis region markers must not be empty");
                }
            }
            TaskKind::Editing => {
                if !self.task.synthesis_few_shot.is_empty() {
                    bail!("task.synthesis_few_shot is not used by the editing task");
                }
            }
        }
        Ok(())
    }
}
