//! Structured error types for courier.
//!
//! Each stage of a dispatch has its own pattern-matchable error so callers
//! can tell "bad data" from "missing configuration" from "the handler
//! failed":
//!
//! - [`CodecError`]: encoding failures, unknown type tags, malformed payloads
//! - [`RegistryError`]: registration conflicts and incomplete registries
//! - [`DispatchError`]: everything surfaced by a single dispatch
//!
//! Handlers and stores return `anyhow::Result`; their errors are carried
//! as `#[source]` so the original error stays downcastable.
//!
//! # Example
//!
//! ```ignore
//! match dispatcher.dispatch(&envelope, cancel).await {
//!     Ok(()) => store.ack(envelope.id()).await?,
//!     Err(DispatchError::HandlerNotRegistered { command_type, .. }) => {
//!         eprintln!("forgot to register a handler for {}", command_type);
//!     }
//!     Err(e) => store.fail(envelope.id(), &e.to_string(), e.failure_kind()).await?,
//! }
//! ```

use thiserror::Error;
use uuid::Uuid;

/// Classification of dispatch failures for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Failure may be transient; re-draining may succeed.
    ///
    /// Examples: handler error, handler panic, cancellation
    Retryable,

    /// Failure is permanent until code or configuration changes.
    ///
    /// Examples: unknown type tag, malformed payload, missing handler
    NonRetryable,
}

/// Errors produced by a [`CommandCodec`](crate::CommandCodec).
#[derive(Debug, Error)]
pub enum CodecError {
    /// The command could not be represented in the codec's format.
    #[error("failed to encode command {command_type}: {source}")]
    Encoding {
        /// The type tag of the command being encoded.
        command_type: &'static str,
        /// The underlying serializer error.
        #[source]
        source: anyhow::Error,
    },

    /// The envelope's type tag does not name a type known to this process.
    #[error("unknown command type '{command_type}' in envelope {envelope_id}")]
    UnknownType {
        /// The envelope being decoded.
        envelope_id: Uuid,
        /// The unresolved type tag.
        command_type: String,
    },

    /// The envelope is missing required headers or its payload is malformed.
    #[error("failed to decode envelope {envelope_id}: {source}")]
    Decoding {
        /// The envelope being decoded.
        envelope_id: Uuid,
        /// What went wrong.
        #[source]
        source: anyhow::Error,
    },
}

/// Errors produced while building a [`HandlerRegistry`](crate::HandlerRegistry)
/// or a [`CommandTypes`](crate::CommandTypes) catalog.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A handler is already registered for this command type.
    #[error("handler already registered for command type: {type_name}")]
    AlreadyRegistered {
        /// The Rust type name of the command.
        type_name: &'static str,
    },

    /// Two different Rust types claim the same type tag.
    #[error("command type '{command_type}' is claimed by both {existing} and {conflicting}")]
    CommandTypeConflict {
        /// The contested type tag.
        command_type: &'static str,
        /// The type registered first.
        existing: &'static str,
        /// The type that tried to register second.
        conflicting: &'static str,
    },

    /// Some decodable command types have no handler.
    #[error("no handler registered for command types: {}", .0.join(", "))]
    MissingHandlers(Vec<&'static str>),
}

/// Errors surfaced by [`Dispatcher::dispatch`](crate::Dispatcher::dispatch).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The envelope could not be decoded. Propagated unchanged from the codec.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The command decoded fine but nothing handles its type.
    #[error("no handler registered for command type '{command_type}' ({type_name})")]
    HandlerNotRegistered {
        /// The type tag of the command.
        command_type: &'static str,
        /// The Rust type name of the command.
        type_name: &'static str,
    },

    /// The handler factory failed to produce a handler.
    #[error("failed to resolve handler for {type_name}: {source}")]
    HandlerResolution {
        /// The Rust type name of the command.
        type_name: &'static str,
        /// The factory's error.
        #[source]
        source: anyhow::Error,
    },

    /// The handler ran and returned an error.
    #[error("handler for {type_name} failed: {source}")]
    HandlerFailed {
        /// The Rust type name of the command.
        type_name: &'static str,
        /// Whatever the handler returned.
        #[source]
        source: anyhow::Error,
    },

    /// The handler panicked.
    #[error("handler for {type_name} panicked: {message}")]
    HandlerPanicked {
        /// The Rust type name of the command.
        type_name: &'static str,
        /// The panic payload, if it was a string.
        message: String,
    },

    /// Cancellation was requested before the handler was invoked.
    #[error("dispatch of {type_name} cancelled before the handler ran")]
    Cancelled {
        /// The Rust type name of the command.
        type_name: &'static str,
    },

    /// The cached invoker received a command of the wrong type.
    ///
    /// Indicates a bug in a custom codec that reports a `TypeId` that does
    /// not match the value it returned.
    #[error("invoker for {expected} received a different command type")]
    TypeMismatch {
        /// The type the invoker was built for.
        expected: &'static str,
    },
}

impl DispatchError {
    /// Returns the appropriate failure kind for this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DispatchError::Codec(_)
            | DispatchError::HandlerNotRegistered { .. }
            | DispatchError::TypeMismatch { .. } => FailureKind::NonRetryable,
            DispatchError::HandlerResolution { .. }
            | DispatchError::HandlerFailed { .. }
            | DispatchError::HandlerPanicked { .. }
            | DispatchError::Cancelled { .. } => FailureKind::Retryable,
        }
    }

    /// True when the envelope itself is bad (unknown type or malformed).
    pub fn is_bad_data(&self) -> bool {
        matches!(self, DispatchError::Codec(_))
    }
}
