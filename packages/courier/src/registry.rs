//! Handler registry: one handler factory per command type.
//!
//! The registry is built once at startup and handed to the dispatcher by
//! value (wrapped in an `Arc`). It is never global, so tests can build as
//! many independent registries as they like.
//!
//! # Registration Policy
//!
//! Registering a second handler for a command type is rejected with
//! [`RegistryError::AlreadyRegistered`]. `try_register` returns the error;
//! `register` panics with it, which is what startup code usually wants.
//!
//! # Example
//!
//! ```ignore
//! let registry = HandlerRegistry::<AppDeps>::new()
//!     .register::<SendInvoice, _, _>(|scope| Ok(SendInvoiceHandler::new(scope.deps())))
//!     .register_instance::<CancelOrder, _>(CancelOrderHandler);
//!
//! // Fail fast if the codec knows a type nobody handles
//! registry.ensure_complete(codec.types())?;
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

use crate::command::{Command, CommandType, CommandTypes};
use crate::error::{DispatchError, RegistryError};
use crate::handler::Handler;
use crate::scope::{Scope, ScopeFactory};

/// Builds a handler for one dispatch from the dispatch's scope.
type HandlerFactory<C, D> =
    Arc<dyn Fn(&Scope<D>) -> Result<Box<dyn Handler<C>>> + Send + Sync>;

/// A ready-to-call, type-erased invocation for one command type.
///
/// Takes the decoded command (boxed), the envelope id and the cancellation
/// token; opens a scope, resolves the handler and runs it.
pub(crate) type Invoker = Arc<
    dyn Fn(Box<dyn Any + Send + Sync>, Uuid, CancellationToken) -> BoxFuture<'static, Result<(), DispatchError>>
        + Send
        + Sync,
>;

type SynthesizeFn<D> = fn(&(dyn Any + Send + Sync), ScopeFactory<D>) -> Option<Invoker>;

struct Registration<D> {
    command_type: CommandType,
    /// A `HandlerFactory<C, D>` for the registered `C`.
    factory: Box<dyn Any + Send + Sync>,
    synthesize: SynthesizeFn<D>,
}

/// Maps command types to handler factories.
pub struct HandlerRegistry<D> {
    registrations: HashMap<TypeId, Registration<D>>,
}

impl<D: Send + Sync + 'static> HandlerRegistry<D> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
        }
    }

    /// Register a handler factory for command type `C`.
    ///
    /// The factory runs once per dispatch, inside that dispatch's scope.
    pub fn try_register<C, H, F>(&mut self, factory: F) -> Result<(), RegistryError>
    where
        C: Command,
        H: Handler<C> + 'static,
        F: Fn(&Scope<D>) -> Result<H> + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<C>();
        if self.registrations.contains_key(&type_id) {
            return Err(RegistryError::AlreadyRegistered {
                type_name: std::any::type_name::<C>(),
            });
        }

        let factory: HandlerFactory<C, D> =
            Arc::new(move |scope: &Scope<D>| -> Result<Box<dyn Handler<C>>> {
                let handler = factory(scope)?;
                Ok(Box::new(handler))
            });

        self.registrations.insert(
            type_id,
            Registration {
                command_type: CommandType::of::<C>(),
                factory: Box::new(factory),
                synthesize: synthesize_invoker::<C, D>,
            },
        );
        Ok(())
    }

    /// Register a handler factory for command type `C`.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for `C`.
    /// Use `try_register` for a non-panicking version.
    pub fn register<C, H, F>(mut self, factory: F) -> Self
    where
        C: Command,
        H: Handler<C> + 'static,
        F: Fn(&Scope<D>) -> Result<H> + Send + Sync + 'static,
    {
        self.try_register::<C, H, F>(factory)
            .unwrap_or_else(|e| panic!("{}", e));
        self
    }

    /// Register one shared handler instance for command type `C`.
    ///
    /// Every dispatch resolves the same instance. Use this for stateless
    /// handlers or handlers that synchronize their own state.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for `C`.
    pub fn register_instance<C, H>(self, handler: H) -> Self
    where
        C: Command,
        H: Handler<C> + 'static,
    {
        let handler = Arc::new(handler);
        self.register::<C, Arc<H>, _>(move |_scope| Ok(handler.clone()))
    }

    /// Resolve the handler for `C` within `scope`.
    ///
    /// # Errors
    ///
    /// - `HandlerNotRegistered` naming `C` if nothing was registered
    /// - `HandlerResolution` if the factory failed
    pub fn resolve<C: Command>(&self, scope: &Scope<D>) -> Result<Box<dyn Handler<C>>, DispatchError> {
        let type_name = std::any::type_name::<C>();
        let factory = self
            .registrations
            .get(&TypeId::of::<C>())
            .and_then(|r| r.factory.downcast_ref::<HandlerFactory<C, D>>())
            .ok_or(DispatchError::HandlerNotRegistered {
                command_type: C::command_type(),
                type_name,
            })?;

        factory(scope).map_err(|source| DispatchError::HandlerResolution { type_name, source })
    }

    /// Check if a handler is registered for `C`.
    pub fn handles<C: Command>(&self) -> bool {
        self.registrations.contains_key(&TypeId::of::<C>())
    }

    /// Check if a handler is registered for the given runtime type.
    pub fn handles_type_id(&self, type_id: TypeId) -> bool {
        self.registrations.contains_key(&type_id)
    }

    /// Returns the number of registered handlers.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Build a catalog of every command type this registry handles.
    ///
    /// Handy for constructing a codec that can decode exactly the handled
    /// types.
    pub fn command_types(&self) -> Result<CommandTypes, RegistryError> {
        let mut types = CommandTypes::new();
        for registration in self.registrations.values() {
            types.try_insert(registration.command_type)?;
        }
        Ok(types)
    }

    /// Check that every type in `types` has a handler.
    ///
    /// Run this at startup so a forgotten registration fails the process
    /// immediately instead of at the first dispatch.
    pub fn ensure_complete(&self, types: &CommandTypes) -> Result<(), RegistryError> {
        let mut missing: Vec<&'static str> = types
            .iter()
            .filter(|t| !self.registrations.contains_key(&CommandType::type_id(t)))
            .map(|t| t.command_type())
            .collect();

        if missing.is_empty() {
            return Ok(());
        }
        missing.sort_unstable();
        Err(RegistryError::MissingHandlers(missing))
    }

    /// Build the invoker for a runtime type, if a handler is registered.
    pub(crate) fn synthesize(&self, type_id: TypeId, scopes: ScopeFactory<D>) -> Option<Invoker> {
        let registration = self.registrations.get(&type_id)?;
        (registration.synthesize)(&*registration.factory, scopes)
    }
}

impl<D: Send + Sync + 'static> Default for HandlerRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> std::fmt::Debug for HandlerRegistry<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field(
                "registered_types",
                &self
                    .registrations
                    .values()
                    .map(|r| r.command_type.command_type())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Monomorphized once per registered command type.
///
/// The factory is downcast here, once, so the returned invoker does no
/// lookups: it unboxes the command, opens a scope, builds the handler and
/// runs it.
fn synthesize_invoker<C, D>(
    factory: &(dyn Any + Send + Sync),
    scopes: ScopeFactory<D>,
) -> Option<Invoker>
where
    C: Command,
    D: Send + Sync + 'static,
{
    let factory = factory.downcast_ref::<HandlerFactory<C, D>>()?.clone();
    let type_name = std::any::type_name::<C>();

    let invoker: Invoker = Arc::new(
        move |command: Box<dyn Any + Send + Sync>, envelope_id: Uuid, cancel: CancellationToken| {
            let factory = factory.clone();
            let scopes = scopes.clone();
            async move {
                let command = command
                    .downcast::<C>()
                    .map_err(|_| DispatchError::TypeMismatch { expected: type_name })?;

                if cancel.is_cancelled() {
                    return Err(DispatchError::Cancelled { type_name });
                }

                let scope = scopes.open(envelope_id);

                // Catch panics from both the factory and the handler; the
                // scope is dropped on every path.
                let outcome = AssertUnwindSafe(async {
                    let handler = factory(&scope)
                        .map_err(|source| DispatchError::HandlerResolution { type_name, source })?;
                    handler
                        .handle(*command, cancel)
                        .await
                        .map_err(|source| DispatchError::HandlerFailed { type_name, source })
                })
                .catch_unwind()
                .await;

                drop(scope);

                match outcome {
                    Ok(result) => result,
                    Err(panic_info) => {
                        let message = extract_panic_message(&*panic_info);
                        error!(%envelope_id, command = type_name, panic = %message, "handler panicked");
                        Err(DispatchError::HandlerPanicked { type_name, message })
                    }
                }
            }
            .boxed()
        },
    );
    Some(invoker)
}

/// Extract a human-readable message from a panic payload.
fn extract_panic_message(panic_info: &(dyn Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
