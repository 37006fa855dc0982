//! Command codecs: turning commands into envelopes and back.
//!
//! A codec owns the payload format. It writes the command's type tag into
//! the envelope headers and serializes the command into the payload; on the
//! way back it resolves the tag through a [`CommandTypes`] catalog and
//! deserializes the payload into the concrete type.
//!
//! The catalog is format independent (it works through `erased_serde`), so
//! a new codec only has to supply a serializer and a deserializer for its
//! format. [`JsonCodec`] is the default.

use std::any::TypeId;
use std::sync::Arc;

use anyhow::anyhow;

use crate::command::{AnyCommand, Command, CommandTypes, SerializableCommand};
use crate::envelope::{Envelope, Headers, COMMAND_TYPE_HEADER, CONTENT_TYPE_HEADER};
use crate::error::CodecError;

/// A command reconstructed from an envelope, with its runtime type.
///
/// The dispatcher keys its invoker cache on `type_id` before it can cast
/// the command back to its concrete type.
pub struct DecodedCommand {
    /// The command, boxed.
    pub command: Box<dyn AnyCommand>,
    /// Runtime type of `command`.
    pub type_id: TypeId,
    /// The type tag stored in the envelope.
    pub command_type: &'static str,
    /// The Rust type name, for diagnostics.
    pub type_name: &'static str,
}

impl std::fmt::Debug for DecodedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedCommand")
            .field("command_type", &self.command_type)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Serializes commands into envelopes and back.
///
/// Implementations must be pure: no I/O, no side effects.
pub trait CommandCodec: Send + Sync {
    /// Encode a command into a new envelope.
    ///
    /// The envelope headers include the command's type tag.
    fn encode(&self, command: &dyn SerializableCommand) -> Result<Envelope, CodecError>;

    /// Decode an envelope back into a command and its runtime type.
    fn decode(&self, envelope: &Envelope) -> Result<DecodedCommand, CodecError>;
}

/// Encode a concrete command with any codec.
pub fn encode<C: Command>(codec: &dyn CommandCodec, command: &C) -> Result<Envelope, CodecError> {
    codec.encode(command)
}

/// JSON codec backed by `serde_json`.
///
/// # Example
///
/// ```ignore
/// let types = CommandTypes::new()
///     .register::<SendInvoice>()
///     .register::<CancelOrder>();
/// let codec = JsonCodec::new(types);
///
/// let envelope = codec.encode(&SendInvoice { invoice_id })?;
/// let decoded = codec.decode(&envelope)?;
/// ```
#[derive(Debug, Clone)]
pub struct JsonCodec {
    types: Arc<CommandTypes>,
}

impl JsonCodec {
    /// Content type written to the envelope headers.
    pub const CONTENT_TYPE: &'static str = "application/json";

    /// Create a codec for the given catalog.
    pub fn new(types: CommandTypes) -> Self {
        Self {
            types: Arc::new(types),
        }
    }

    /// Create a codec sharing an existing catalog.
    pub fn from_arc(types: Arc<CommandTypes>) -> Self {
        Self { types }
    }

    /// The catalog this codec resolves type tags against.
    pub fn types(&self) -> &CommandTypes {
        &self.types
    }
}

impl CommandCodec for JsonCodec {
    fn encode(&self, command: &dyn SerializableCommand) -> Result<Envelope, CodecError> {
        let command_type = command.type_tag();
        let payload = serde_json::to_vec(command).map_err(|e| CodecError::Encoding {
            command_type,
            source: e.into(),
        })?;

        let mut headers = Headers::new();
        headers.insert(COMMAND_TYPE_HEADER.to_string(), command_type.to_string());
        headers.insert(CONTENT_TYPE_HEADER.to_string(), Self::CONTENT_TYPE.to_string());

        Ok(Envelope::new(headers, payload))
    }

    fn decode(&self, envelope: &Envelope) -> Result<DecodedCommand, CodecError> {
        let envelope_id = envelope.id();

        if let Some(content_type) = envelope.header(CONTENT_TYPE_HEADER) {
            if content_type != Self::CONTENT_TYPE {
                return Err(CodecError::Decoding {
                    envelope_id,
                    source: anyhow!("unsupported content type '{}'", content_type),
                });
            }
        }

        let tag = envelope
            .command_type()
            .ok_or_else(|| CodecError::Decoding {
                envelope_id,
                source: anyhow!("missing '{}' header", COMMAND_TYPE_HEADER),
            })?;

        let entry = self.types.get(tag).ok_or_else(|| CodecError::UnknownType {
            envelope_id,
            command_type: tag.to_string(),
        })?;

        let mut json = serde_json::Deserializer::from_slice(envelope.payload());
        let command = entry
            .deserialize(&mut <dyn erased_serde::Deserializer>::erase(&mut json))
            .map_err(|e| CodecError::Decoding {
                envelope_id,
                source: anyhow!("invalid {} payload: {}", entry.command_type(), e),
            })?;
        json.end().map_err(|e| CodecError::Decoding {
            envelope_id,
            source: anyhow!("trailing data after {} payload: {}", entry.command_type(), e),
        })?;

        Ok(DecodedCommand {
            command,
            type_id: entry.type_id(),
            command_type: entry.command_type(),
            type_name: entry.type_name(),
        })
    }
}
