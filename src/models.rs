use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// One (input, output) text pair prepended to a prompt for in-context
/// learning. Pair order is significant and preserved verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub input: String,
    pub output: String,
}

/// Everything a prompt factory needs to render and dispatch one request:
/// an instruction, the few-shot examples, and the datapoint-specific
/// content the model should continue from.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptInput {
    pub instruction: String,
    pub few_shot: Vec<FewShotExample>,
    pub content: String,
    /// Strings that terminate a generation, the example separator included.
    pub stop_tokens: Vec<String>,
}

/// One raw completion plus its originating request parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSample {
    pub text: String,
    pub temperature: f64,
    /// Position of this completion within its request, in issue order.
    pub sample_index: usize,
}

/// One forward sample and the backward samples generated from it.
///
/// `backward_samples` is empty when the branch failed; a failure in one
/// branch never affects its siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundTripBranch {
    pub forward_sample: GenerationSample,
    pub backward_samples: Vec<GenerationSample>,
}

/// The primary persisted unit: all round-trip samples for one datapoint.
///
/// Constructed append-only by the engine and immutable once emitted.
/// Branch order matches forward request-issue order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSamplesForDatapoint<D> {
    pub datapoint: D,
    pub branches: Vec<RoundTripBranch>,
}

/// Generation samples augmented with per-backward-sample metric scores.
///
/// Produced by the downstream evaluation consumer, not by the sampling
/// engine; the type lives here so the serialization schema stays in one
/// place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedGenerationSamplesForDatapoint<D> {
    pub samples: GenerationSamplesForDatapoint<D>,
    /// Metric name -> per-branch -> per-backward-sample score
    /// (e.g. unit-test pass rate, exact match).
    pub consistencies: BTreeMap<String, Vec<Vec<f64>>>,
}

impl<D> EvaluatedGenerationSamplesForDatapoint<D> {
    /// Shallow shape validation: every metric must carry one score list
    /// per branch, sized to that branch's backward samples.
    pub fn validate_sizes(&self) -> Result<()> {
        for (metric, per_branch) in &self.consistencies {
            if per_branch.len() != self.samples.branches.len() {
                bail!(
                    "metric `{metric}` has {} score lists for {} branches",
                    per_branch.len(),
                    self.samples.branches.len()
                );
            }
            for (scores, branch) in per_branch.iter().zip(&self.samples.branches) {
                if scores.len() != branch.backward_samples.len() {
                    bail!(
                        "metric `{metric}` has {} scores for a branch with {} backward samples",
                        scores.len(),
                        branch.backward_samples.len()
                    );
                }
            }
        }
        Ok(())
    }

    /// Computes the round-trip consistency metrics.
    ///
    /// For each metric `m` this produces `rtc-avg-m` (mean over branches of
    /// the per-branch mean score) and `rtc-m-at-k` (1.0 if any branch has a
    /// passing backward sample). Branches with no backward samples count as
    /// zero.
    pub fn compute_scores(&self) -> BTreeMap<String, f64> {
        let mut computed = BTreeMap::new();
        for (metric, per_branch) in &self.consistencies {
            if per_branch.is_empty() {
                continue;
            }
            let mut avg = 0.0;
            let mut any_pass = false;
            for scores in per_branch {
                if scores.is_empty() {
                    continue;
                }
                let branch_sum: f64 = scores.iter().sum();
                avg += branch_sum / scores.len() as f64;
                if branch_sum > 0.0 {
                    any_pass = true;
                }
            }
            computed.insert(
                format!("rtc-avg-{metric}"),
                avg / per_branch.len() as f64,
            );
            computed.insert(
                format!("rtc-{metric}-at-k"),
                if any_pass { 1.0 } else { 0.0 },
            );
        }
        computed
    }
}
