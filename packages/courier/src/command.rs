//! Command traits and the type catalog used to decode them.
//!
//! A [`Command`] is an application value that can be written to the outbox
//! and later routed to exactly one handler. Each command type carries a
//! stable, versioned type tag (`"billing.invoice.send.v1"`) that is stored
//! in the envelope and used to pick the right deserializer on the way back.
//!
//! # Schema Evolution
//!
//! - New versions are new types with new tags (`SendInvoiceV2` →
//!   `"billing.invoice.send.v2"`).
//! - Keep old types registered while old rows may still be in the outbox.
//! - No in-place migration: old rows stay as-is.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RegistryError;

/// An intra-process command that can be persisted to the outbox.
///
/// # Example
///
/// ```ignore
/// use courier::Command;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct SendInvoice {
///     pub invoice_id: Uuid,
/// }
///
/// impl Command for SendInvoice {
///     fn command_type() -> &'static str {
///         "billing.invoice.send.v1"
///     }
/// }
/// ```
pub trait Command: Serialize + DeserializeOwned + Any + Send + Sync + 'static {
    /// Stable, versioned type tag. Must not change once rows exist.
    fn command_type() -> &'static str;
}

/// Type-erased command.
///
/// Automatically implemented for every [`Command`]. The dispatcher works with
/// `Box<dyn AnyCommand>` until it reaches the invoker built for the concrete
/// type, which unboxes it again.
pub trait AnyCommand: Send + Sync {
    /// The type tag of the concrete command.
    fn type_tag(&self) -> &'static str;

    /// The `TypeId` of the concrete command.
    fn command_type_id(&self) -> TypeId;

    /// The Rust type name of the concrete command, for diagnostics.
    fn type_name(&self) -> &'static str;

    /// Downcast to concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Downcast to concrete type (boxed).
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<C: Command> AnyCommand for C {
    fn type_tag(&self) -> &'static str {
        C::command_type()
    }

    fn command_type_id(&self) -> TypeId {
        TypeId::of::<C>()
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<C>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

/// A type-erased command that can also be serialized.
///
/// This is what codecs accept, so the codec trait stays object safe.
pub trait SerializableCommand: AnyCommand + erased_serde::Serialize {}

impl<C: Command> SerializableCommand for C {}

erased_serde::serialize_trait_object!(SerializableCommand);

/// Format-independent deserializer for one command type.
type DeserializeFn =
    fn(&mut dyn erased_serde::Deserializer<'_>) -> Result<Box<dyn AnyCommand>, erased_serde::Error>;

fn deserialize_erased<C: Command>(
    deserializer: &mut dyn erased_serde::Deserializer<'_>,
) -> Result<Box<dyn AnyCommand>, erased_serde::Error> {
    let command: C = erased_serde::deserialize(deserializer)?;
    Ok(Box::new(command))
}

/// A registered command type.
#[derive(Clone, Copy)]
pub struct CommandType {
    command_type: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    deserialize: DeserializeFn,
}

impl CommandType {
    /// Describe command type `C`.
    pub fn of<C: Command>() -> Self {
        Self {
            command_type: C::command_type(),
            type_id: TypeId::of::<C>(),
            type_name: std::any::type_name::<C>(),
            deserialize: deserialize_erased::<C>,
        }
    }

    pub fn command_type(&self) -> &'static str {
        self.command_type
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Deserialize an instance from any erased serde deserializer.
    pub fn deserialize(
        &self,
        deserializer: &mut dyn erased_serde::Deserializer<'_>,
    ) -> Result<Box<dyn AnyCommand>, erased_serde::Error> {
        (self.deserialize)(deserializer)
    }
}

impl fmt::Debug for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandType")
            .field("command_type", &self.command_type)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Catalog of command types known to this process, keyed by type tag.
///
/// Codecs consult the catalog to turn a stored type tag back into a
/// concrete Rust type. Registering a new command shape only touches the
/// catalog, never the dispatcher.
#[derive(Default, Clone)]
pub struct CommandTypes {
    by_tag: HashMap<&'static str, CommandType>,
}

impl CommandTypes {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register command type `C` under its type tag.
    ///
    /// Registering the same type twice is a no-op. Registering a different
    /// type under an existing tag is rejected.
    pub fn try_register<C: Command>(&mut self) -> Result<(), RegistryError> {
        self.try_insert(CommandType::of::<C>())
    }

    /// Register command type `C`, panicking on a tag conflict.
    ///
    /// Use `try_register` for a non-panicking version.
    pub fn register<C: Command>(mut self) -> Self {
        self.try_register::<C>().unwrap_or_else(|e| panic!("{}", e));
        self
    }

    pub(crate) fn try_insert(&mut self, entry: CommandType) -> Result<(), RegistryError> {
        if let Some(existing) = self.by_tag.get(entry.command_type) {
            if existing.type_id == entry.type_id {
                return Ok(());
            }
            return Err(RegistryError::CommandTypeConflict {
                command_type: entry.command_type,
                existing: existing.type_name,
                conflicting: entry.type_name,
            });
        }
        self.by_tag.insert(entry.command_type, entry);
        Ok(())
    }

    /// Look up a command type by its tag.
    pub fn get(&self, command_type: &str) -> Option<&CommandType> {
        self.by_tag.get(command_type)
    }

    /// Check if a tag is registered.
    pub fn has(&self, command_type: &str) -> bool {
        self.by_tag.contains_key(command_type)
    }

    /// Iterate over every registered type.
    pub fn iter(&self) -> impl Iterator<Item = &CommandType> {
        self.by_tag.values()
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }
}

impl fmt::Debug for CommandTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTypes")
            .field("registered_types", &self.by_tag.keys().collect::<Vec<_>>())
            .finish()
    }
}
