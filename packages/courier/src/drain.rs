//! The drain loop: moves committed envelopes from the outbox to handlers.
//!
//! # Architecture
//!
//! ```text
//! DrainLoop
//!     │
//!     ├─► Fetch due envelopes (OutboxStore.fetch_due)
//!     ├─► For each envelope, in store order:
//!     │       └─► Dispatcher.dispatch(envelope, cancel)
//!     │               └─► Handler<C>.handle(cmd, cancel)
//!     └─► ack on success, fail(kind) otherwise, release if never run
//! ```
//!
//! Envelopes within a cycle are dispatched one at a time, and each outcome
//! is applied before the next envelope starts. A failing envelope never
//! stops the rest of the batch. Delivery is at least once: an envelope
//! whose ack is lost will be dispatched again, so handlers should be
//! idempotent.
//!
//! # Example
//!
//! ```ignore
//! let drain = DrainLoop::new(Arc::new(outbox), Arc::new(dispatcher), DrainConfig::from_env()?);
//!
//! let shutdown = CancellationToken::new();
//! tokio::spawn({
//!     let shutdown = shutdown.clone();
//!     async move { drain.run(shutdown).await }
//! });
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DrainConfig;
use crate::dispatch::Dispatcher;
use crate::envelope::Envelope;
use crate::error::{DispatchError, FailureKind};
use crate::store::OutboxStore;

/// What happened during one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Envelopes claimed from the store.
    pub fetched: usize,
    /// Envelopes dispatched successfully and acked.
    pub completed: usize,
    /// Envelopes whose dispatch failed.
    pub failed: usize,
    /// Envelopes handed back undispatched because of shutdown.
    pub released: usize,
}

/// Drains an outbox store into a dispatcher.
pub struct DrainLoop<S, D> {
    store: Arc<S>,
    dispatcher: Arc<Dispatcher<D>>,
    config: DrainConfig,
    /// Consecutive failures per envelope, cleared on success or once the
    /// failure is permanent.
    failures: Mutex<HashMap<Uuid, u32>>,
}

impl<S, D> DrainLoop<S, D>
where
    S: OutboxStore + 'static,
    D: Send + Sync + 'static,
{
    /// Create a new drain loop.
    pub fn new(store: Arc<S>, dispatcher: Arc<Dispatcher<D>>, config: DrainConfig) -> Self {
        Self {
            store,
            dispatcher,
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DrainConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher<D> {
        &self.dispatcher
    }

    /// Consecutive failed dispatches of an envelope by this loop.
    pub fn consecutive_failures(&self, id: Uuid) -> u32 {
        self.lock_failures().get(&id).copied().unwrap_or(0)
    }

    /// Envelopes whose consecutive failures are currently remembered.
    pub fn tracked_failures(&self) -> usize {
        self.lock_failures().len()
    }

    fn lock_failures(&self) -> MutexGuard<'_, HashMap<Uuid, u32>> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run a single cycle: fetch one batch and dispatch it.
    ///
    /// Fails only if the batch could not be fetched. Dispatch failures and
    /// errors recording outcomes are logged and counted in the report.
    ///
    /// If `shutdown` fires partway through, envelopes not yet dispatched are
    /// released back to the store without counting an attempt.
    pub async fn drain_once(&self, shutdown: &CancellationToken) -> Result<DrainReport> {
        let envelopes = self.store.fetch_due(self.config.batch_size).await?;
        let mut report = DrainReport {
            fetched: envelopes.len(),
            ..Default::default()
        };

        if envelopes.is_empty() {
            return Ok(report);
        }
        debug!(count = envelopes.len(), worker_id = %self.config.worker_id, "fetched due envelopes");
        let batch: HashSet<Uuid> = envelopes.iter().map(Envelope::id).collect();

        for envelope in envelopes {
            if shutdown.is_cancelled() {
                self.release(&envelope).await;
                report.released += 1;
                continue;
            }

            match self
                .dispatcher
                .dispatch(&envelope, shutdown.child_token())
                .await
            {
                Ok(()) => {
                    self.lock_failures().remove(&envelope.id());
                    if let Err(e) = self.store.ack(envelope.id()).await {
                        error!(envelope_id = %envelope.id(), error = %e, "failed to ack envelope");
                    }
                    report.completed += 1;
                }
                Err(e) => {
                    self.record_failure(&envelope, e).await;
                    report.failed += 1;
                }
            }
        }

        self.prune_failures(&batch);
        Ok(report)
    }

    async fn record_failure(&self, envelope: &Envelope, e: DispatchError) {
        let id = envelope.id();
        let kind = e.failure_kind();
        let cancelled = matches!(e, DispatchError::Cancelled { .. });
        let message = e.to_string();

        if cancelled {
            debug!(envelope_id = %id, "dispatch cancelled");
            self.release(envelope).await;
            return;
        }

        let failures = {
            let mut failures = self.lock_failures();
            if kind == FailureKind::NonRetryable {
                // Never retried, so there is nothing left to count
                failures.remove(&id).unwrap_or(0) + 1
            } else {
                let count = failures.entry(id).or_insert(0);
                *count += 1;
                *count
            }
        };

        warn!(
            envelope_id = %id,
            command_type = envelope.command_type().unwrap_or("<missing>"),
            failures,
            ?kind,
            error = %message,
            "dispatch failed"
        );
        if failures >= self.config.poison_threshold.max(1) {
            error!(
                envelope_id = %id,
                failures,
                threshold = self.config.poison_threshold,
                "suspected poison message"
            );
        }

        if let Err(e) = self.store.fail(id, &message, kind).await {
            error!(envelope_id = %id, error = %e, "failed to record envelope failure");
        }
    }

    async fn release(&self, envelope: &Envelope) {
        if let Err(e) = self.store.release(envelope.id()).await {
            error!(envelope_id = %envelope.id(), error = %e, "failed to release envelope");
        }
    }

    /// Forget envelopes outside `batch` once too many are remembered.
    fn prune_failures(&self, batch: &HashSet<Uuid>) {
        let mut failures = self.lock_failures();
        if failures.len() > self.config.max_tracked_failures {
            let before = failures.len();
            failures.retain(|id, _| batch.contains(id));
            debug!(dropped = before - failures.len(), "pruned failure bookkeeping");
        }
    }

    /// Drain until `shutdown` fires.
    ///
    /// A full batch starts the next cycle right away; otherwise the loop
    /// waits `poll_interval`. Store errors back off for `error_backoff`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "drain loop starting"
        );

        loop {
            // Check for shutdown
            if shutdown.is_cancelled() {
                break;
            }

            let report = match self.drain_once(&shutdown).await {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "failed to fetch due envelopes");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                    continue;
                }
            };

            if report.fetched > 0 {
                debug!(
                    fetched = report.fetched,
                    completed = report.completed,
                    failed = report.failed,
                    released = report.released,
                    "drain cycle finished"
                );
            }

            if self.config.batch_size > 0 && report.fetched >= self.config.batch_size {
                // Probably more waiting
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker_id = %self.config.worker_id, "drain loop stopped");
        Ok(())
    }
}

impl<S, D> std::fmt::Debug for DrainLoop<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainLoop")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
