//! Outbox persistence interfaces.
//!
//! The outbox is split in two halves, like the table it usually sits on:
//!
//! - [`OutboxWriter`] is the producer side. It runs inside the same
//!   transaction as the business write, so the command is recorded if and
//!   only if the business data is.
//! - [`OutboxStore`] is the consumer side used by the drain loop. It hands
//!   out due envelopes in a stable order and records the outcome of each.
//!
//! # Implementation Notes
//!
//! A SQL-backed store typically claims rows with something like:
//!
//! ```sql
//! UPDATE outbox
//! SET claimed_until = NOW() + INTERVAL '5 minutes'
//! WHERE id IN (
//!     SELECT id FROM outbox
//!     WHERE next_attempt_at <= NOW()
//!       AND (claimed_until IS NULL OR claimed_until < NOW())
//!     ORDER BY enqueued_at, id
//!     LIMIT $1
//!     FOR UPDATE SKIP LOCKED
//! )
//! RETURNING *
//! ```
//!
//! `SKIP LOCKED` is what lets several drain loops share one table without
//! handing out the same envelope twice.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::codec::CommandCodec;
use crate::command::Command;
use crate::envelope::Envelope;
use crate::error::FailureKind;

/// Consumer side of the outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` due envelopes, oldest first.
    ///
    /// Claimed envelopes must not be handed to another caller until they are
    /// acked, failed, released, or their claim expires. An empty result means
    /// nothing is due.
    async fn fetch_due(&self, limit: usize) -> Result<Vec<Envelope>>;

    /// Mark an envelope as delivered. It will never be fetched again.
    async fn ack(&self, id: Uuid) -> Result<()>;

    /// Record a failed delivery.
    ///
    /// The envelope stays in the outbox. The store decides when it becomes
    /// due again and whether `kind` or the attempt count warrant parking it
    /// as a dead letter.
    async fn fail(&self, id: Uuid, error: &str, kind: FailureKind) -> Result<()>;

    /// Hand back a claimed envelope that was never dispatched.
    ///
    /// Unlike `fail`, this is not an attempt: the envelope becomes due again
    /// immediately with its attempt count untouched and is never
    /// dead-lettered by a release.
    async fn release(&self, id: Uuid) -> Result<()>;
}

/// Producer side of the outbox.
///
/// Implementations are usually bound to an open database transaction.
#[async_trait]
pub trait OutboxWriter: Send {
    /// Append an envelope to the outbox.
    async fn append(&mut self, envelope: Envelope) -> Result<()>;
}

/// Encode `command` and append it to the outbox.
///
/// Returns the id of the new envelope.
///
/// # Example
///
/// ```ignore
/// let mut tx = outbox.begin();
/// orders.insert(&mut tx, &order).await?;
/// write_command(&mut tx, &codec, &SendInvoice { order_id: order.id }).await?;
/// tx.commit();
/// ```
pub async fn write_command<W, C>(
    writer: &mut W,
    codec: &dyn CommandCodec,
    command: &C,
) -> Result<Uuid>
where
    W: OutboxWriter + ?Sized,
    C: Command,
{
    let envelope = codec.encode(command)?;
    let id = envelope.id();
    writer.append(envelope).await?;
    Ok(id)
}
