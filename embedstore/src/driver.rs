//! Batch embedding driver.
//!
//! Pending records are pulled one chunk at a time. Each chunk is split into
//! batches, one provider call per batch, and committed with a single
//! [`Store::write_vectors`] call. Chunk buffers are dropped before the next
//! chunk is fetched, so at most one chunk is resident.

use crate::config::{DriverSettings, FailurePolicy};
use crate::error::{EmbedStoreError, Result};
use crate::llm::EmbeddingProvider;
use crate::store::{Record, Store};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Driver parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Records per commit.
    pub chunk_size: usize,
    /// Records per provider call.
    pub batch_size: usize,
    /// Retries per batch after the first attempt.
    pub max_retries: u32,
    /// Base delay between retries, multiplied by the attempt number.
    pub retry_delay: Duration,
    /// Policy once retries are exhausted.
    pub on_failure: FailurePolicy,
    /// Cap on records processed per run.
    pub limit: Option<usize>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::from(&DriverSettings::default())
    }
}

impl From<&DriverSettings> for DriverConfig {
    fn from(settings: &DriverSettings) -> Self {
        Self {
            chunk_size: settings.chunk_size,
            batch_size: settings.batch_size,
            max_retries: settings.max_retries,
            retry_delay: settings.retry_delay(),
            on_failure: settings.on_failure,
            limit: settings.limit,
        }
    }
}

/// A batch (or chunk commit) that did not make it into the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    /// 1-based chunk number.
    pub chunk: usize,
    /// Ids left unembedded.
    pub ids: Vec<i64>,
    /// Error message.
    pub reason: String,
}

/// Progress after one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkReport {
    /// 1-based chunk number.
    pub chunk: usize,
    /// Records in the chunk.
    pub attempted: usize,
    /// Records committed.
    pub embedded: usize,
    /// Records that failed.
    pub failed: usize,
}

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Provider model.
    pub model: String,
    /// Records pulled from the store.
    pub attempted: usize,
    /// Records committed.
    pub embedded: usize,
    /// Ids left unembedded, ascending.
    pub failed: Vec<i64>,
    /// Failure details.
    pub failures: Vec<BatchFailure>,
    /// Successful chunk commits.
    pub commits: usize,
    /// Whether the run stopped early, under [`FailurePolicy::Abort`] or on
    /// a store error.
    pub aborted: bool,
    /// Ids within the run's budget that were never attempted because the
    /// run stopped early, ascending.
    pub skipped: Vec<i64>,
    /// Store error that stopped the run, if any.
    pub error: Option<String>,
    /// Records still pending when the run ended.
    pub remaining: usize,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    /// A run that has not attempted anything yet.
    #[must_use]
    pub fn empty(model: &str) -> Self {
        let now = Utc::now();
        Self {
            model: model.to_string(),
            attempted: 0,
            embedded: 0,
            failed: Vec::new(),
            failures: Vec::new(),
            commits: 0,
            aborted: false,
            skipped: Vec::new(),
            error: None,
            remaining: 0,
            started_at: now,
            finished_at: now,
        }
    }

    /// Every id the run left without a vector: failed plus skipped.
    #[must_use]
    pub fn unembedded(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.failed.iter().chain(&self.skipped).copied().collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// `Err(Interrupted)` when a store error stopped the run,
    /// `Err(PartialBatchFailure)` when any id was left unembedded.
    pub fn into_result(self) -> Result<Self> {
        let unembedded = self.unembedded();
        if let Some(reason) = self.error {
            return Err(EmbedStoreError::Interrupted { reason, unembedded });
        }
        if unembedded.is_empty() {
            Ok(self)
        } else {
            Err(EmbedStoreError::PartialBatchFailure { failed: unembedded })
        }
    }

    /// Record a failure.
    fn fail(&mut self, failure: BatchFailure) {
        self.failed.extend(&failure.ids);
        self.failures.push(failure);
    }
}

/// Result of processing one chunk before its commit.
struct ChunkOutcome {
    /// Vectors ready to commit.
    vectors: BTreeMap<i64, Vec<f32>>,
    /// Batches that failed.
    failures: Vec<BatchFailure>,
    /// A batch failed under the abort policy.
    abort: bool,
}

/// Drives a [`Store`] and an [`EmbeddingProvider`] until nothing is pending.
pub struct EmbeddingDriver<'a> {
    /// Target store.
    store: &'a Store,
    /// Embedding provider.
    provider: &'a dyn EmbeddingProvider,
    /// Parameters.
    config: DriverConfig,
    /// Called after each chunk.
    observer: Option<Box<dyn FnMut(&ChunkReport) + 'a>>,
}

impl fmt::Debug for EmbeddingDriver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingDriver")
            .field("model", &self.provider.model())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<'a> EmbeddingDriver<'a> {
    /// Create a driver. Zero chunk or batch sizes are rejected.
    pub fn new(
        store: &'a Store,
        provider: &'a dyn EmbeddingProvider,
        config: DriverConfig,
    ) -> Result<Self> {
        if config.chunk_size == 0 || config.batch_size == 0 {
            return Err(EmbedStoreError::Config(
                "chunk_size and batch_size must be positive".into(),
            ));
        }
        Ok(Self {
            store,
            provider,
            config,
            observer: None,
        })
    }

    /// Register a callback invoked after every chunk.
    #[must_use]
    pub fn with_observer(mut self, observer: impl FnMut(&ChunkReport) + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Embed every pending record (up to the configured limit).
    ///
    /// Batch failures end up in the summary. A store error after the run has
    /// started stops it and is recorded in [`RunSummary::error`], with the
    /// ids it left behind in `failed` and `skipped`; only a failure to read
    /// the store's dimension up front is returned as an error. Chunks
    /// committed before a failure stay committed.
    pub fn run(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::empty(self.provider.model());
        let store = self.store;
        let mut expected_dim = store.dimension()?;
        let mut budget = self.config.limit.unwrap_or(usize::MAX);

        info!(
            model = %summary.model,
            chunk_size = self.config.chunk_size,
            batch_size = self.config.batch_size,
            "starting embedding run"
        );

        for (index, page) in store.pending_pages(self.config.chunk_size).enumerate() {
            if budget == 0 {
                break;
            }
            let mut chunk = match page {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(error = %e, "could not read pending records, stopping run");
                    summary.error = Some(e.to_string());
                    summary.aborted = true;
                    break;
                }
            };
            chunk.truncate(budget);
            budget -= chunk.len();

            let chunk_no = index + 1;
            summary.attempted += chunk.len();

            let outcome = self.process_chunk(chunk_no, &chunk, &mut expected_dim);
            let mut report = ChunkReport {
                chunk: chunk_no,
                attempted: chunk.len(),
                embedded: 0,
                failed: 0,
            };

            if outcome.abort {
                let failure = outcome.failures.into_iter().next_back();
                let reason = failure.map_or_else(String::new, |f| f.reason);
                warn!(chunk = chunk_no, %reason, "aborting run, chunk discarded");
                summary.fail(BatchFailure {
                    chunk: chunk_no,
                    ids: chunk.iter().map(|r| r.id).collect(),
                    reason,
                });
                summary.aborted = true;
                report.failed = chunk.len();
                self.notify(&report);
                break;
            }

            for failure in outcome.failures {
                report.failed += failure.ids.len();
                summary.fail(failure);
            }

            let vectors = outcome.vectors;
            if !vectors.is_empty() {
                match store.write_vectors(&vectors) {
                    Ok(written) => {
                        summary.embedded += written;
                        summary.commits += 1;
                        report.embedded = written;
                        debug!(chunk = chunk_no, written, "committed chunk");
                    }
                    Err(e) => {
                        let fatal = !matches!(
                            e,
                            EmbedStoreError::DimensionMismatch { .. }
                                | EmbedStoreError::EmptyVector(_)
                                | EmbedStoreError::NotFound(_)
                        );
                        warn!(chunk = chunk_no, error = %e, fatal, "chunk commit rejected");
                        report.failed += vectors.len();
                        summary.fail(BatchFailure {
                            chunk: chunk_no,
                            ids: vectors.keys().copied().collect(),
                            reason: e.to_string(),
                        });
                        if fatal {
                            summary.error = Some(e.to_string());
                        }
                        if fatal || self.config.on_failure == FailurePolicy::Abort {
                            summary.aborted = true;
                            self.notify(&report);
                            break;
                        }
                    }
                }
            }

            // Release chunk-local buffers before the next page is fetched.
            drop(vectors);
            drop(chunk);
            self.notify(&report);
            if budget == 0 {
                break;
            }
        }

        summary.failed.sort_unstable();
        if summary.aborted {
            summary.skipped = skipped_ids(store, &summary.failed, budget);
        }
        summary.remaining = store.count_pending().unwrap_or_else(|e| {
            warn!(error = %e, "could not count pending records");
            summary.skipped.len()
        });
        summary.finished_at = Utc::now();
        info!(
            attempted = summary.attempted,
            embedded = summary.embedded,
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            commits = summary.commits,
            aborted = summary.aborted,
            "embedding run finished"
        );
        Ok(summary)
    }

    /// Invoke the observer, if any.
    fn notify(&mut self, report: &ChunkReport) {
        if let Some(observer) = self.observer.as_mut() {
            observer(report);
        }
    }

    /// Embed every batch of a chunk.
    fn process_chunk(
        &self,
        chunk_no: usize,
        chunk: &[Record],
        expected_dim: &mut Option<usize>,
    ) -> ChunkOutcome {
        let mut outcome = ChunkOutcome {
            vectors: BTreeMap::new(),
            failures: Vec::new(),
            abort: false,
        };

        for (batch_no, batch) in chunk.chunks(self.config.batch_size).enumerate() {
            let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
            let texts: Vec<String> = batch.iter().map(Record::embedding_input).collect();

            let result = self
                .embed_with_retry(chunk_no, batch_no + 1, &texts)
                .and_then(|vectors| {
                    check_dimensions(&ids, &vectors, expected_dim).map(|()| vectors)
                });

            match result {
                Ok(vectors) => {
                    outcome.vectors.extend(ids.into_iter().zip(vectors));
                }
                Err(e) => {
                    warn!(chunk = chunk_no, batch = batch_no + 1, ?ids, error = %e, "batch failed");
                    outcome.failures.push(BatchFailure {
                        chunk: chunk_no,
                        ids,
                        reason: e.to_string(),
                    });
                    if self.config.on_failure == FailurePolicy::Abort {
                        outcome.abort = true;
                        break;
                    }
                }
            }
        }
        outcome
    }

    /// One provider call with bounded retries for retryable errors.
    fn embed_with_retry(
        &self,
        chunk_no: usize,
        batch_no: usize,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = self.provider.embed(texts).and_then(|vectors| {
                if vectors.len() == texts.len() {
                    Ok(vectors)
                } else {
                    Err(EmbedStoreError::Provider(format!(
                        "expected {} embeddings, got {}",
                        texts.len(),
                        vectors.len()
                    )))
                }
            });

            match result {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() && attempt <= self.config.max_retries => {
                    let delay = self.config.retry_delay * attempt;
                    warn!(
                        chunk = chunk_no,
                        batch = batch_no,
                        attempt,
                        ?delay,
                        error = %e,
                        "retrying batch"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Pending ids after an early stop, minus those already reported failed,
/// capped at the unused part of the run's budget. Best effort: a store that
/// cannot be read yields an empty list.
fn skipped_ids(store: &Store, failed: &[i64], budget: usize) -> Vec<i64> {
    match store.pending_ids() {
        Ok(ids) => ids
            .into_iter()
            .filter(|id| failed.binary_search(id).is_err())
            .take(budget)
            .collect(),
        Err(e) => {
            warn!(error = %e, "could not list skipped records");
            Vec::new()
        }
    }
}

/// Check a batch against the run's expected dimension, establishing it from
/// the first vector when the store has none yet.
fn check_dimensions(
    ids: &[i64],
    vectors: &[Vec<f32>],
    expected_dim: &mut Option<usize>,
) -> Result<()> {
    for (&id, vector) in ids.iter().zip(vectors) {
        if vector.is_empty() {
            return Err(EmbedStoreError::EmptyVector(id));
        }
        let expected = *expected_dim.get_or_insert(vector.len());
        if vector.len() != expected {
            return Err(EmbedStoreError::DimensionMismatch {
                id: Some(id),
                expected,
                actual: vector.len(),
            });
        }
    }
    Ok(())
}
