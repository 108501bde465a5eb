//! Provision engine: executes one phase of the manifest against the registry.
//!
//! Every entry gets exactly one [`TransferResult`]. Transfers run on a bounded
//! pool, transient failures are retried with exponential backoff, and a bad
//! entry never stops the others from being attempted.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, UploadItem};
use crate::cache::ProvisionCache;
use crate::error::{FailureKind, TransferError};
use crate::hash::Checksum;
use crate::manifest::{Direction, EntryKind, ManifestEntry};
use crate::registry::PluginRegistry;

/// Backoff for transient transfer failures
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay after `attempts` failed attempts (1-indexed): `base * multiplier^(attempts - 1)`
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1) as i32;
        Duration::from_secs_f64(self.base_delay.as_secs_f64() * self.multiplier.powi(exponent))
    }

    fn should_retry(&self, err: &TransferError, attempts: u32) -> bool {
        err.kind.is_transient() && attempts <= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }
}

/// Best-effort classification of failures a backend could not classify itself.
/// Only the message is available, so this is a heuristic.
pub fn classify(err: TransferError) -> TransferError {
    if err.kind != FailureKind::Backend {
        return err;
    }

    let message = err.message.to_ascii_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

    let kind = if contains_any(&["timed out", "timeout", "connection reset", "temporarily unavailable"]) {
        FailureKind::Transient
    } else if contains_any(&["unauthorized", "forbidden", "access denied", "401", "403"]) {
        FailureKind::AuthRejected
    } else if contains_any(&["no space left"]) {
        FailureKind::LocalDisk
    } else {
        return err;
    };

    tracing::debug!("Classified backend failure as {}: {}", kind, err.message);
    TransferError::new(kind, err.message)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        backend: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        checksum: Option<Checksum>,
        attempts: u32,
        cached: bool,
    },
    Failure {
        kind: FailureKind,
        message: String,
        attempts: u32,
    },
}

/// Outcome of one manifest entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferResult {
    pub field: String,
    pub identifier: String,
    pub local_path: PathBuf,
    pub direction: Direction,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl TransferResult {
    pub fn failed(entry: &ManifestEntry, err: TransferError, attempts: u32) -> Self {
        Self::from_entry(
            entry,
            Outcome::Failure {
                kind: err.kind,
                message: err.message,
                attempts,
            },
        )
    }

    fn from_entry(entry: &ManifestEntry, outcome: Outcome) -> Self {
        Self {
            field: entry.field.clone(),
            identifier: entry.identifier.clone(),
            local_path: entry.local_path.clone(),
            direction: entry.direction,
            outcome,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            Outcome::Failure { kind, .. } => Some(*kind),
            Outcome::Success { .. } => None,
        }
    }
}

/// Every result of one phase, in manifest order
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub direction: Direction,
    pub results: Vec<TransferResult>,
}

impl PhaseReport {
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(TransferResult::is_success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TransferResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

/// Entries of one phase that share a backend, for the upload-set hooks
struct BackendGroup {
    backend: Arc<dyn Backend>,
    indices: Vec<usize>,
}

pub struct ProvisionEngine {
    registry: Arc<PluginRegistry>,
    threads: usize,
    retry: RetryPolicy,
    cache: Option<ProvisionCache>,
}

impl ProvisionEngine {
    pub fn new(registry: Arc<PluginRegistry>, threads: usize, retry: RetryPolicy) -> Self {
        Self {
            registry,
            threads: threads.max(1),
            retry,
            cache: None,
        }
    }

    /// Serve input files from `cache` when possible and record new downloads in it
    pub fn with_cache(mut self, cache: ProvisionCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Run every entry of one phase and wait for all of them to finish.
    ///
    /// After `cancel` fires, entries that have not started are recorded as
    /// cancelled; transfers already in flight run to completion.
    pub async fn provision(
        &self,
        direction: Direction,
        entries: &[ManifestEntry],
        cancel: &CancellationToken,
    ) -> PhaseReport {
        tracing::info!("Provisioning {} {:?} entries", entries.len(), direction);

        let mut slots: Vec<Option<TransferResult>> = entries.iter().map(|_| None).collect();
        let mut groups: BTreeMap<String, BackendGroup> = BTreeMap::new();

        for (index, entry) in entries.iter().enumerate() {
            match self.registry.resolve(&entry.identifier) {
                Ok(backend) => {
                    groups
                        .entry(backend.descriptor().name.clone())
                        .or_insert_with(|| BackendGroup {
                            backend: Arc::clone(&backend),
                            indices: Vec::new(),
                        })
                        .indices
                        .push(index);
                }
                Err(err) => {
                    tracing::warn!(field = %entry.field, "{}", err);
                    slots[index] = Some(TransferResult::failed(entry, err.into(), 0));
                }
            }
        }

        if direction == Direction::Output {
            for group in groups.values_mut() {
                let items = upload_items(entries, &group.indices);
                if let Err(err) = group.backend.prepare_upload_set(&items).await {
                    let err = classify(err);
                    tracing::warn!(
                        backend = %group.backend.descriptor().name,
                        "Upload set preparation failed: {}",
                        err
                    );
                    for &index in &group.indices {
                        slots[index] = Some(TransferResult::failed(&entries[index], err.clone(), 0));
                    }
                    group.indices.clear();
                }
            }
        }

        let jobs: Vec<(usize, Arc<dyn Backend>)> = groups
            .values()
            .flat_map(|group| group.indices.iter().map(|&i| (i, Arc::clone(&group.backend))))
            .collect();

        let mut transfers = stream::iter(jobs)
            .map(|(index, backend)| {
                let entry = &entries[index];
                async move {
                    if cancel.is_cancelled() {
                        let err = TransferError::cancelled("launch cancelled before transfer started");
                        return (index, TransferResult::failed(entry, err, 0));
                    }
                    (index, self.transfer(entry, backend, cancel).await)
                }
            })
            .buffer_unordered(self.threads);

        while let Some((index, result)) = transfers.next().await {
            slots[index] = Some(result);
        }
        drop(transfers);

        if direction == Direction::Output {
            for group in groups.values().filter(|g| !g.indices.is_empty()) {
                let items = upload_items(entries, &group.indices);
                if let Err(err) = group.backend.finalize_upload_set(&items).await {
                    let err = classify(err);
                    tracing::warn!(
                        backend = %group.backend.descriptor().name,
                        "Upload set finalization failed: {}",
                        err
                    );
                    for &index in &group.indices {
                        if slots[index].as_ref().map_or(false, TransferResult::is_success) {
                            slots[index] = Some(TransferResult::failed(&entries[index], err.clone(), 1));
                        }
                    }
                }
            }
        }

        let results: Vec<TransferResult> = slots
            .into_iter()
            .zip(entries)
            .map(|(slot, entry)| {
                slot.unwrap_or_else(|| {
                    TransferResult::failed(entry, TransferError::backend("no outcome recorded"), 0)
                })
            })
            .collect();

        let report = PhaseReport { direction, results };
        tracing::info!(
            "{:?} phase finished: {} succeeded, {} failed",
            direction,
            report.results.len() - report.failures().count(),
            report.failures().count()
        );
        report
    }

    async fn transfer(
        &self,
        entry: &ManifestEntry,
        backend: Arc<dyn Backend>,
        cancel: &CancellationToken,
    ) -> TransferResult {
        let backend_name = backend.descriptor().name.clone();
        let cacheable = entry.direction == Direction::Input && entry.kind == EntryKind::File;

        if cacheable {
            if let Some(cache) = &self.cache {
                match cache.fetch(&entry.identifier, &entry.local_path).await {
                    Ok(true) => return self.succeeded(entry, backend_name, 0, true).await,
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Cache lookup failed for {}: {}", entry.identifier, e),
                }
            }
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            tracing::debug!(
                backend = %backend_name,
                attempt = attempts,
                "{:?} {} <-> {}",
                entry.direction,
                entry.identifier,
                entry.local_path.display()
            );

            let result = match entry.direction {
                Direction::Input => backend.download(&entry.identifier, &entry.local_path).await,
                Direction::Output => {
                    backend
                        .upload(&entry.local_path, &entry.identifier, entry.metadata.as_deref())
                        .await
                }
            };

            let err = match result.map_err(classify) {
                Ok(()) => break,
                Err(err) => err,
            };

            if !self.retry.should_retry(&err, attempts) {
                tracing::warn!(backend = %backend_name, "Transfer of {} failed: {}", entry.identifier, err);
                return TransferResult::failed(entry, err, attempts);
            }

            let delay = self.retry.next_delay(attempts);
            tracing::warn!(
                backend = %backend_name,
                "Transient failure for {} (attempt {}), retrying in {:?}: {}",
                entry.identifier,
                attempts,
                delay,
                err
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return TransferResult::failed(entry, err, attempts);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if cacheable {
            if let Some(cache) = &self.cache {
                cache.store(&entry.identifier, &entry.local_path).await;
            }
        }

        self.succeeded(entry, backend_name, attempts, false).await
    }

    async fn succeeded(
        &self,
        entry: &ManifestEntry,
        backend: String,
        attempts: u32,
        cached: bool,
    ) -> TransferResult {
        let checksum = if entry.local_path.is_file() {
            match Checksum::of_file_blocking(entry.local_path.clone()).await {
                Ok(sum) => Some(sum),
                Err(e) => {
                    tracing::warn!("Cannot checksum {}: {}", entry.local_path.display(), e);
                    None
                }
            }
        } else {
            None
        };

        TransferResult::from_entry(
            entry,
            Outcome::Success {
                backend,
                checksum,
                attempts,
                cached,
            },
        )
    }
}

fn upload_items(entries: &[ManifestEntry], indices: &[usize]) -> Vec<UploadItem> {
    indices
        .iter()
        .map(|&i| UploadItem {
            source: entries[i].local_path.clone(),
            identifier: entries[i].identifier.clone(),
            metadata: entries[i].metadata.clone(),
        })
        .collect()
}
