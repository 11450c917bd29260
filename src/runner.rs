use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveWriter, read_records};
use crate::config::Config;
use crate::error::{BranchFailure, GenerationFailure};
use crate::generation::PromptFactory;
use crate::models::{GenerationSample, GenerationSamplesForDatapoint, PromptInput, RoundTripBranch};
use crate::output::HtmlReport;
use crate::task::RtcTask;

/// Engine tunables beyond what the factories already hold.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub n_forward_samples: usize,
    pub n_backward_samples: usize,
    /// Recorded into each sample alongside its text.
    pub forward_temperature: f64,
    pub backward_temperature: f64,
    /// Datapoints in flight at once. The factories bound endpoint
    /// pressure; this bounds how much work starts concurrently so early
    /// records complete early.
    pub max_concurrent_datapoints: usize,
    pub max_retries: usize,
    pub retry_backoff: Duration,
}

impl RunnerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            n_forward_samples: config.forward.n_samples,
            n_backward_samples: config.backward.n_samples,
            forward_temperature: config.forward.temperature,
            backward_temperature: config.backward.temperature,
            max_concurrent_datapoints: config.max_concurrent_datapoints,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// End-of-run accounting. A run with empty-sample datapoints is still a
/// successful run with partial data; these counts are how the operator
/// assesses the failure rate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub total_datapoints: usize,
    pub duplicate_datapoints: usize,
    pub records_written: usize,
    pub empty_records: usize,
    pub failed_branches: usize,
    pub interrupted: bool,
}

struct DatapointOutcome<D> {
    record: GenerationSamplesForDatapoint<D>,
    failed_branches: usize,
}

/// Drives the two-phase sampling protocol over a datapoint archive.
pub struct Runner<T: RtcTask> {
    task: Arc<T>,
    forward_factory: Arc<dyn PromptFactory>,
    backward_factory: Arc<dyn PromptFactory>,
    options: RunnerOptions,
}

impl<T: RtcTask> Runner<T> {
    pub fn new(
        task: T,
        forward_factory: Arc<dyn PromptFactory>,
        backward_factory: Arc<dyn PromptFactory>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            task: Arc::new(task),
            forward_factory,
            backward_factory,
            options,
        }
    }

    /// Runs sampling end to end: load datapoints, sample forward and
    /// backward under the concurrency caps, and append one record per
    /// datapoint to the output archive in input order.
    ///
    /// Archive failures abort the run; everything else is recorded as
    /// partial data and the run keeps going.
    pub async fn run(
        &self,
        input_path: &Path,
        output_path: &Path,
        html_path: Option<&Path>,
    ) -> Result<RunSummary> {
        let datapoints: Vec<T::Datapoint> =
            read_records(input_path).context("failed to load input archive")?;
        let (datapoints, duplicates) = dedupe(datapoints)?;
        info!(
            datapoints = datapoints.len(),
            duplicates, "loaded input archive"
        );

        let mut writer =
            ArchiveWriter::create(output_path).context("failed to create output archive")?;
        let mut report = match html_path {
            Some(path) => Some(HtmlReport::create(path)?),
            None => None,
        };

        let mut summary = RunSummary {
            total_datapoints: datapoints.len(),
            duplicate_datapoints: duplicates,
            ..Default::default()
        };

        let mut results = stream::iter(datapoints.into_iter().enumerate().map(
            |(index, datapoint)| {
                let task = Arc::clone(&self.task);
                let forward = Arc::clone(&self.forward_factory);
                let backward = Arc::clone(&self.backward_factory);
                let options = self.options.clone();
                let fallback = datapoint.clone();
                async move {
                    // The spawn isolates task-logic panics to one datapoint.
                    let handle =
                        tokio::spawn(sample_datapoint(task, forward, backward, options, datapoint));
                    match handle.await {
                        Ok(outcome) => (index, outcome),
                        Err(join_error) => {
                            warn!(
                                index,
                                error = %join_error,
                                "datapoint processing failed; recording empty samples"
                            );
                            (
                                index,
                                DatapointOutcome {
                                    record: GenerationSamplesForDatapoint {
                                        datapoint: fallback,
                                        branches: Vec::new(),
                                    },
                                    failed_branches: 0,
                                },
                            )
                        }
                    }
                }
            },
        ))
        .buffer_unordered(self.options.max_concurrent_datapoints);

        // Completions arrive in any order; records leave in input order.
        let mut pending: BTreeMap<usize, DatapointOutcome<T::Datapoint>> = BTreeMap::new();
        let mut next_index = 0usize;

        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);
        let mut interrupt_armed = true;

        loop {
            tokio::select! {
                completed = results.next() => {
                    let Some((index, outcome)) = completed else {
                        break;
                    };
                    pending.insert(index, outcome);
                    while let Some(outcome) = pending.remove(&next_index) {
                        self.emit(&mut writer, &mut report, outcome, &mut summary)?;
                        next_index += 1;
                    }
                }
                result = &mut interrupt, if interrupt_armed => {
                    interrupt_armed = false;
                    match result {
                        Ok(()) => {
                            warn!("interrupt received; ceasing new submissions");
                            summary.interrupted = true;
                            break;
                        }
                        Err(error) => {
                            warn!(%error, "interrupt handler unavailable; running without cancellation");
                        }
                    }
                }
            }
        }

        writer
            .finish()
            .context("failed to finalize output archive")?;
        if let Some(report) = report {
            report.finish()?;
        }
        info!(
            records = summary.records_written,
            empty = summary.empty_records,
            failed_branches = summary.failed_branches,
            "run complete"
        );
        Ok(summary)
    }

    fn emit(
        &self,
        writer: &mut ArchiveWriter,
        report: &mut Option<HtmlReport>,
        outcome: DatapointOutcome<T::Datapoint>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        summary.failed_branches += outcome.failed_branches;
        if outcome.record.branches.is_empty() {
            summary.empty_records += 1;
        }
        writer
            .append(&outcome.record)
            .context("failed to append to output archive")?;
        if let Some(report) = report {
            report.append(&self.task.samples_to_html(&outcome.record))?;
        }
        summary.records_written += 1;
        Ok(())
    }
}

/// Samples one datapoint: one forward request, then one backward request
/// per forward sample, each branch independent of its siblings.
async fn sample_datapoint<T: RtcTask>(
    task: Arc<T>,
    forward: Arc<dyn PromptFactory>,
    backward: Arc<dyn PromptFactory>,
    options: RunnerOptions,
    datapoint: T::Datapoint,
) -> DatapointOutcome<T::Datapoint> {
    let forward_input = task.to_forward_input(&datapoint);
    let forward_texts = match generate_with_retry(
        forward.as_ref(),
        &forward_input,
        options.n_forward_samples,
        &options,
    )
    .await
    {
        Ok(texts) => texts,
        Err(failure) => {
            warn!(error = %failure, "forward generation failed; recording empty samples");
            return DatapointOutcome {
                record: task.assemble_record(datapoint, Vec::new()),
                failed_branches: 0,
            };
        }
    };

    let task_ref = task.as_ref();
    let backward_ref = backward.as_ref();
    let options_ref = &options;
    let datapoint_ref = &datapoint;
    let branch_futures: Vec<_> = forward_texts
        .into_iter()
        .enumerate()
        .map(|(sample_index, text)| {
            let forward_sample = GenerationSample {
                text,
                temperature: options_ref.forward_temperature,
                sample_index,
            };
            async move {
                let result = sample_branch(
                    task_ref,
                    backward_ref,
                    options_ref,
                    datapoint_ref,
                    &forward_sample,
                )
                .await;
                (forward_sample, result)
            }
        })
        .collect();

    let mut branches = Vec::with_capacity(branch_futures.len());
    let mut failed_branches = 0;
    for (forward_sample, result) in futures::future::join_all(branch_futures).await {
        let backward_samples = match result {
            Ok(samples) => samples,
            Err(failure) => {
                warn!(
                    sample_index = forward_sample.sample_index,
                    error = %failure,
                    "backward branch failed; recording it empty"
                );
                failed_branches += 1;
                Vec::new()
            }
        };
        branches.push(RoundTripBranch {
            forward_sample,
            backward_samples,
        });
    }

    DatapointOutcome {
        record: task.assemble_record(datapoint, branches),
        failed_branches,
    }
}

async fn sample_branch<T: RtcTask>(
    task: &T,
    backward: &dyn PromptFactory,
    options: &RunnerOptions,
    datapoint: &T::Datapoint,
    forward_sample: &GenerationSample,
) -> Result<Vec<GenerationSample>, BranchFailure> {
    let backward_input = task.to_backward_input(datapoint, forward_sample)?;
    let texts = generate_with_retry(
        backward,
        &backward_input,
        options.n_backward_samples,
        options,
    )
    .await?;
    Ok(texts
        .into_iter()
        .enumerate()
        .map(|(sample_index, text)| GenerationSample {
            text,
            temperature: options.backward_temperature,
            sample_index,
        })
        .collect())
}

/// Uniform retry policy for both phases: transient failures back off and
/// retry, malformed responses fail the branch immediately.
async fn generate_with_retry(
    factory: &dyn PromptFactory,
    input: &PromptInput,
    n_samples: usize,
    options: &RunnerOptions,
) -> Result<Vec<String>, GenerationFailure> {
    let mut attempt = 0;
    loop {
        match factory.generate(input, n_samples).await {
            Ok(samples) => return Ok(samples),
            Err(failure) if failure.is_transient() && attempt < options.max_retries => {
                let backoff = options.retry_backoff * 2u32.pow(attempt as u32);
                debug!(attempt, error = %failure, ?backoff, "transient failure; backing off");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(failure) => return Err(failure),
        }
    }
}

/// Drops exact duplicate datapoints (by serialized identity), keeping the
/// first occurrence in place.
fn dedupe<D: Serialize>(datapoints: Vec<D>) -> Result<(Vec<D>, usize)> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(datapoints.len());
    let mut duplicates = 0;
    for datapoint in datapoints {
        let key = serde_json::to_string(&datapoint)
            .context("failed to serialize datapoint for deduplication")?;
        if seen.insert(key) {
            unique.push(datapoint);
        } else {
            duplicates += 1;
        }
    }
    if duplicates > 0 {
        info!(duplicates, "dropped duplicate datapoints from the input");
    }
    Ok((unique, duplicates))
}
