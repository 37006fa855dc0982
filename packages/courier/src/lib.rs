//! # Courier
//!
//! A transactional outbox: commands are recorded in the same transaction as
//! the business data that caused them, then drained and dispatched to typed
//! handlers by a background loop.
//!
//! ## Core Concepts
//!
//! - [`Command`] = a serializable request for work, identified by a stable type tag
//! - [`Envelope`] = a command at rest: id, timestamp, headers, opaque payload
//! - [`Handler`] = the async operation that carries out one command type
//!
//! The key principle: **a command exists if and only if its transaction
//! committed**. Nothing is sent while the transaction is open; the drain
//! loop picks the envelope up once it is visible.
//!
//! ## Architecture
//!
//! ```text
//! Producer (business transaction)
//!     │
//!     ▼ write_command()
//! OutboxWriter ──► Outbox (store) ◄──────────────────┐
//!                     │                              │
//!                     ▼ fetch_due()                  │
//!                 DrainLoop                          │
//!                     │                              │
//!                     ▼ dispatch()                   │
//!                 Dispatcher                         │
//!                     │                              │
//!                     ├─► CommandCodec.decode()      │
//!                     ├─► invoker cache (TypeId)     │
//!                     ├─► Scope ─► Handler<C>        │
//!                     │                              │
//!                     └─► Ok ─► ack()  ──────────────┤
//!                         Err ─► fail(kind) ─────────┤
//!                         shutdown ─► release() ─────┘
//! ```
//!
//! ## Guarantees
//!
//! - **At-least-once delivery**: an envelope is acked only after its handler
//!   returned `Ok`; anything else leaves it in the outbox
//! - **Store order**: within a drain cycle envelopes are dispatched one at a
//!   time, in the order the store returns them
//! - **Failure isolation**: one failing envelope does not stop the batch
//! - **Fresh scope per dispatch**: handlers never share resolution state
//!
//! Handlers should be idempotent. Delivery is not exactly once.
//!
//! ## Example
//!
//! ```ignore
//! use courier::{
//!     async_trait, write_command, Command, Dispatcher, DrainConfig, DrainLoop, Handler,
//!     HandlerRegistry, InMemoryOutbox, JsonCodec,
//! };
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Greet {
//!     text: String,
//! }
//!
//! impl Command for Greet {
//!     fn command_type() -> &'static str {
//!         "greet.v1"
//!     }
//! }
//!
//! struct GreetHandler;
//!
//! #[async_trait]
//! impl Handler<Greet> for GreetHandler {
//!     async fn handle(&self, cmd: Greet, _cancel: CancellationToken) -> anyhow::Result<()> {
//!         println!("hello {}", cmd.text);
//!         Ok(())
//!     }
//! }
//!
//! let registry = HandlerRegistry::new().register_instance::<Greet, _>(GreetHandler);
//! let codec = Arc::new(JsonCodec::new(registry.command_types()?));
//! let outbox = InMemoryOutbox::new();
//!
//! // Producer side, inside the business transaction
//! let mut tx = outbox.begin();
//! write_command(&mut tx, codec.as_ref(), &Greet { text: "a".into() }).await?;
//! tx.commit();
//!
//! // Consumer side
//! let dispatcher = Dispatcher::new(codec, Arc::new(registry), ());
//! let drain = DrainLoop::new(Arc::new(outbox), Arc::new(dispatcher), DrainConfig::default());
//! drain.run(shutdown).await?;
//! ```

// Core modules
mod codec;
mod command;
mod dispatch;
mod envelope;
mod error;
mod handler;
mod registry;
mod scope;

// Outbox persistence and draining
mod config;
mod drain;
mod memory;
mod store;

// Re-export core types
pub use crate::command::{AnyCommand, Command, CommandType, CommandTypes, SerializableCommand};
pub use crate::envelope::{
    Envelope, Headers, COMMAND_TYPE_HEADER, CONTENT_TYPE_HEADER, CORRELATION_ID_HEADER,
};

// Re-export codec types
pub use codec::{encode, CommandCodec, DecodedCommand, JsonCodec};

// Re-export error types
pub use crate::error::{CodecError, DispatchError, FailureKind, RegistryError};

// Re-export handler types
pub use handler::{handler_fn, Handler, HandlerFn};
pub use registry::HandlerRegistry;
pub use scope::Scope;

// Re-export dispatcher types
pub use dispatch::{DispatchStats, Dispatcher};

// Re-export outbox types
pub use config::DrainConfig;
pub use drain::{DrainLoop, DrainReport};
pub use memory::{DeadLetter, InMemoryOutbox, InMemoryTransaction, DEFAULT_LEASE};
pub use store::{write_command, OutboxStore, OutboxWriter};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
