//! In-memory outbox.
//!
//! A complete [`OutboxStore`] and [`OutboxWriter`] backed by a vector behind
//! a mutex. Useful for tests, demos, and single-process deployments that do
//! not need durability across restarts.
//!
//! Semantics mirror what a SQL-backed outbox would do:
//!
//! - Envelopes are handed out in enqueue order.
//! - `fetch_due` claims envelopes for a lease period. A claimed envelope is
//!   not handed to anyone else until it is acked, failed, or the lease runs
//!   out.
//! - `fail` releases the claim and records the attempt. With a retry delay
//!   the envelope becomes due again only after the delay. With
//!   `max_attempts` set, exhausted or non-retryable envelopes are moved to
//!   the dead-letter list.
//! - `release` hands back an undispatched envelope without counting an
//!   attempt.
//!
//! Time is read from `tokio::time`, so tests can drive leases and retry
//! delays with a paused clock.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::FailureKind;
use crate::store::{OutboxStore, OutboxWriter};

/// Default claim lease.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// An envelope parked after exhausting its attempts or failing permanently.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub attempts: u32,
    pub last_error: String,
    pub kind: FailureKind,
}

#[derive(Debug)]
struct Entry {
    envelope: Envelope,
    attempts: u32,
    last_error: Option<String>,
    claimed_until: Option<Instant>,
    not_before: Option<Instant>,
}

impl Entry {
    fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            attempts: 0,
            last_error: None,
            claimed_until: None,
            not_before: None,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        let claimed = self.claimed_until.is_some_and(|until| until > now);
        let waiting = self.not_before.is_some_and(|at| at > now);
        !claimed && !waiting
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<Entry>,
    dead_letters: Vec<DeadLetter>,
}

impl Inner {
    fn position(&self, id: Uuid) -> Option<usize> {
        self.entries.iter().position(|e| e.envelope.id() == id)
    }
}

/// Outbox kept in process memory.
///
/// Cloning is cheap and every clone sees the same entries, so one handle can
/// be given to producers and another to the drain loop.
#[derive(Debug, Clone)]
pub struct InMemoryOutbox {
    inner: Arc<Mutex<Inner>>,
    lease: Duration,
    retry_delay: Duration,
    max_attempts: Option<u32>,
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOutbox {
    /// Create an empty outbox with the default lease, no retry delay, and no
    /// dead-lettering.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            lease: DEFAULT_LEASE,
            retry_delay: Duration::ZERO,
            max_attempts: None,
        }
    }

    /// How long a fetched envelope stays claimed.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// How long a failed envelope waits before it is due again.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Dead-letter envelopes after this many failed attempts, and
    /// non-retryable failures immediately.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Acquire the lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a transaction. Envelopes appended to it become visible only
    /// when it is committed.
    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            outbox: self.clone(),
            staged: Vec::new(),
        }
    }

    fn push_all(&self, envelopes: impl IntoIterator<Item = Envelope>) {
        let mut inner = self.lock_inner();
        inner.entries.extend(envelopes.into_iter().map(Entry::new));
    }

    /// Envelopes not yet acked or dead-lettered, claimed or not.
    pub fn pending_count(&self) -> usize {
        self.lock_inner().entries.len()
    }

    /// Snapshot of pending envelopes, in order.
    pub fn pending(&self) -> Vec<Envelope> {
        self.lock_inner()
            .entries
            .iter()
            .map(|e| e.envelope.clone())
            .collect()
    }

    /// Snapshot of the dead-letter list.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock_inner().dead_letters.clone()
    }

    /// Failed attempts recorded for a pending or dead-lettered envelope.
    pub fn attempts(&self, id: Uuid) -> Option<u32> {
        let inner = self.lock_inner();
        inner
            .entries
            .iter()
            .find(|e| e.envelope.id() == id)
            .map(|e| e.attempts)
            .or_else(|| {
                inner
                    .dead_letters
                    .iter()
                    .find(|d| d.envelope.id() == id)
                    .map(|d| d.attempts)
            })
    }

    /// Last error recorded for a pending envelope.
    pub fn last_error(&self, id: Uuid) -> Option<String> {
        let inner = self.lock_inner();
        let index = inner.position(id)?;
        inner.entries[index].last_error.clone()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn fetch_due(&self, limit: usize) -> Result<Vec<Envelope>> {
        let now = Instant::now();
        let claimed_until = now + self.lease;
        let mut inner = self.lock_inner();

        let claimed: Vec<Envelope> = inner
            .entries
            .iter_mut()
            .filter(|e| e.is_due(now))
            .take(limit)
            .map(|e| {
                e.claimed_until = Some(claimed_until);
                e.envelope.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn ack(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock_inner();
        let index = inner
            .position(id)
            .ok_or_else(|| anyhow!("envelope {} is not pending in the outbox", id))?;
        inner.entries.remove(index);
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str, kind: FailureKind) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.lock_inner();
        let index = inner
            .position(id)
            .ok_or_else(|| anyhow!("envelope {} is not pending in the outbox", id))?;

        let entry = &mut inner.entries[index];
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.claimed_until = None;
        entry.not_before = (!self.retry_delay.is_zero()).then(|| now + self.retry_delay);
        let attempts = entry.attempts;

        let exhausted = match self.max_attempts {
            Some(max) => kind == FailureKind::NonRetryable || attempts >= max,
            None => false,
        };

        if exhausted {
            let entry = inner.entries.remove(index);
            warn!(envelope_id = %id, attempts, ?kind, "envelope moved to dead letters");
            inner.dead_letters.push(DeadLetter {
                envelope: entry.envelope,
                attempts,
                last_error: error.to_string(),
                kind,
            });
        } else {
            debug!(envelope_id = %id, attempts, "envelope released after failure");
        }

        Ok(())
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock_inner();
        let index = inner
            .position(id)
            .ok_or_else(|| anyhow!("envelope {} is not pending in the outbox", id))?;
        inner.entries[index].claimed_until = None;
        debug!(envelope_id = %id, "envelope released undispatched");
        Ok(())
    }
}

#[async_trait]
impl OutboxWriter for InMemoryOutbox {
    async fn append(&mut self, envelope: Envelope) -> Result<()> {
        self.push_all([envelope]);
        Ok(())
    }
}

/// A unit of work against an [`InMemoryOutbox`].
///
/// Appends are staged and published together on [`commit`](Self::commit).
/// Dropping the transaction without committing discards them.
#[derive(Debug)]
pub struct InMemoryTransaction {
    outbox: InMemoryOutbox,
    staged: Vec<Envelope>,
}

impl InMemoryTransaction {
    /// Number of envelopes staged so far.
    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    /// Publish every staged envelope, in append order.
    pub fn commit(mut self) {
        let staged = std::mem::take(&mut self.staged);
        debug!(count = staged.len(), "outbox transaction committed");
        self.outbox.push_all(staged);
    }

    /// Discard every staged envelope.
    pub fn rollback(mut self) {
        self.staged.clear();
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            debug!(
                count = self.staged.len(),
                "outbox transaction dropped without commit, rolling back"
            );
        }
    }
}

#[async_trait]
impl OutboxWriter for InMemoryTransaction {
    async fn append(&mut self, envelope: Envelope) -> Result<()> {
        self.staged.push(envelope);
        Ok(())
    }
}
