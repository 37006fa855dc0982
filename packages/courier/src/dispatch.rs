//! The dispatch engine: one envelope in, one handler invocation out.
//!
//! The `Dispatcher` is responsible for:
//! 1. Decoding the envelope through the codec
//! 2. Finding (or building) the cached invoker for the command's runtime type
//! 3. Opening a fresh scope, resolving the handler and running it
//! 4. Surfacing the most specific error on failure
//!
//! # Invoker Cache
//!
//! Resolving a handler for a runtime type means going from a `TypeId` to a
//! function monomorphized for the concrete command type. That work is done
//! once per type and the resulting invoker is cached in a concurrent map.
//! On a miss the invoker is built outside any lock and inserted with
//! get-or-insert semantics: two dispatchers racing on first sight of a type
//! may both build one, but only one is kept and each command still runs
//! exactly once.
//!
//! # Example
//!
//! ```ignore
//! let registry = HandlerRegistry::new()
//!     .register_instance::<SendInvoice, _>(SendInvoiceHandler);
//! let codec = JsonCodec::new(registry.command_types()?);
//! let dispatcher = Dispatcher::new(Arc::new(codec), Arc::new(registry), deps);
//!
//! dispatcher.dispatch(&envelope, CancellationToken::new()).await?;
//! ```

use std::any::TypeId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{CommandCodec, DecodedCommand};
use crate::envelope::Envelope;
use crate::error::DispatchError;
use crate::registry::{HandlerRegistry, Invoker};
use crate::scope::ScopeFactory;

/// Snapshot of the invoker cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Distinct command types with a cached invoker.
    pub cached_invokers: usize,
    /// How many times an invoker has been built. Equals `cached_invokers`
    /// unless first-sight races built duplicates.
    pub synthesized: usize,
}

/// Routes envelopes to their handlers.
pub struct Dispatcher<D> {
    codec: Arc<dyn CommandCodec>,
    registry: Arc<HandlerRegistry<D>>,
    scopes: ScopeFactory<D>,
    invokers: DashMap<TypeId, Invoker>,
    synthesized: AtomicUsize,
}

impl<D: Send + Sync + 'static> Dispatcher<D> {
    /// Create a new dispatcher.
    pub fn new(codec: Arc<dyn CommandCodec>, registry: Arc<HandlerRegistry<D>>, deps: D) -> Self {
        Self::from_arc(codec, registry, Arc::new(deps))
    }

    /// Create a new dispatcher with pre-wrapped Arc dependencies.
    ///
    /// Use this when you need to share the deps with other parts of the system.
    pub fn from_arc(
        codec: Arc<dyn CommandCodec>,
        registry: Arc<HandlerRegistry<D>>,
        deps: Arc<D>,
    ) -> Self {
        Self {
            codec,
            registry,
            scopes: ScopeFactory::new(deps),
            invokers: DashMap::new(),
            synthesized: AtomicUsize::new(0),
        }
    }

    /// Dispatch one envelope to its handler.
    ///
    /// # Errors
    ///
    /// - `Codec` if the envelope cannot be decoded (unknown type, bad payload)
    /// - `HandlerNotRegistered` if nothing handles the decoded type
    /// - `HandlerResolution` if the handler factory failed
    /// - `HandlerFailed` / `HandlerPanicked` if the handler did
    /// - `Cancelled` if `cancel` fired before the handler was invoked
    ///
    /// Only `Ok(())` means the command was delivered.
    pub async fn dispatch(
        &self,
        envelope: &Envelope,
        cancel: CancellationToken,
    ) -> Result<(), DispatchError> {
        let decoded = self.codec.decode(envelope)?;
        let command_type = decoded.command_type;
        let invoker = self.invoker_for(&decoded)?;

        let result = invoker(decoded.command.into_any(), envelope.id(), cancel).await;

        match &result {
            Ok(()) => debug!(envelope_id = %envelope.id(), command_type, "command dispatched"),
            Err(e) => debug!(envelope_id = %envelope.id(), command_type, error = %e, "dispatch failed"),
        }
        result
    }

    fn invoker_for(&self, decoded: &DecodedCommand) -> Result<Invoker, DispatchError> {
        if let Some(invoker) = self.invokers.get(&decoded.type_id) {
            return Ok(invoker.value().clone());
        }

        let built = self
            .registry
            .synthesize(decoded.type_id, self.scopes.clone())
            .ok_or(DispatchError::HandlerNotRegistered {
                command_type: decoded.command_type,
                type_name: decoded.type_name,
            })?;
        self.synthesized.fetch_add(1, Ordering::AcqRel);
        debug!(command_type = decoded.command_type, "invoker synthesized");

        Ok(self
            .invokers
            .entry(decoded.type_id)
            .or_insert(built)
            .value()
            .clone())
    }

    /// Current invoker cache statistics.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            cached_invokers: self.invokers.len(),
            synthesized: self.synthesized.load(Ordering::Acquire),
        }
    }

    /// Number of scopes currently open (i.e. dispatches in flight).
    pub fn open_scopes(&self) -> usize {
        self.scopes.open_count()
    }

    /// The handler registry.
    pub fn registry(&self) -> &HandlerRegistry<D> {
        &self.registry
    }

    /// The codec used to decode envelopes.
    pub fn codec(&self) -> &dyn CommandCodec {
        self.codec.as_ref()
    }

    /// Get access to the dependencies.
    pub fn deps(&self) -> &D {
        self.scopes.deps()
    }
}

impl<D> std::fmt::Debug for Dispatcher<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("cached_invokers", &self.invokers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, JsonCodec};
    use crate::command::{Command, CommandTypes};
    use crate::envelope::{Headers, COMMAND_TYPE_HEADER};
    use crate::error::CodecError;
    use crate::handler::Handler;
    use crate::scope::Scope;

    use std::sync::Mutex;

    use anyhow::Result;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    // ==========================================================================
    // Test Types
    // ==========================================================================

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SomeCommand;

    impl Command for SomeCommand {
        fn command_type() -> &'static str {
            "test.some.v1"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct AnotherCommand {
        text: String,
    }

    impl Command for AnotherCommand {
        fn command_type() -> &'static str {
            "test.another.v1"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ThirdCommand {
        text: String,
    }

    impl Command for ThirdCommand {
        fn command_type() -> &'static str {
            "test.third.v1"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ExplodingCommand;

    impl Command for ExplodingCommand {
        fn command_type() -> &'static str {
            "test.exploding.v1"
        }
    }

    /// Shared event log, the dependency handlers are built from.
    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl Events {
        fn push(&self, event: String) {
            self.0.lock().unwrap().push(event);
        }

        fn snapshot(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct AnotherCommandHandler {
        events: Arc<Events>,
    }

    #[async_trait]
    impl Handler<AnotherCommand> for AnotherCommandHandler {
        async fn handle(&self, command: AnotherCommand, _cancel: CancellationToken) -> Result<()> {
            self.events
                .push(format!("AnotherCommandHandler called - text: {}", command.text));
            Ok(())
        }
    }

    struct ThirdCommandHandler {
        events: Arc<Events>,
    }

    #[async_trait]
    impl Handler<ThirdCommand> for ThirdCommandHandler {
        async fn handle(&self, command: ThirdCommand, _cancel: CancellationToken) -> Result<()> {
            if command.text == "fail" {
                anyhow::bail!("refusing to handle '{}'", command.text);
            }
            self.events
                .push(format!("ThirdCommandHandler called - text: {}", command.text));
            Ok(())
        }
    }

    struct ExplodingHandler;

    #[async_trait]
    impl Handler<ExplodingCommand> for ExplodingHandler {
        async fn handle(&self, _command: ExplodingCommand, _cancel: CancellationToken) -> Result<()> {
            panic!("kaboom");
        }
    }

    fn all_types() -> CommandTypes {
        CommandTypes::new()
            .register::<SomeCommand>()
            .register::<AnotherCommand>()
            .register::<ThirdCommand>()
            .register::<ExplodingCommand>()
    }

    fn codec() -> Arc<JsonCodec> {
        Arc::new(JsonCodec::new(all_types()))
    }

    fn full_registry() -> HandlerRegistry<Arc<Events>> {
        HandlerRegistry::new()
            .register::<AnotherCommand, _, _>(|scope: &Scope<Arc<Events>>| {
                Ok(AnotherCommandHandler {
                    events: scope.deps().clone(),
                })
            })
            .register::<ThirdCommand, _, _>(|scope: &Scope<Arc<Events>>| {
                Ok(ThirdCommandHandler {
                    events: scope.deps().clone(),
                })
            })
            .register_instance::<ExplodingCommand, _>(ExplodingHandler)
    }

    fn dispatcher(events: Arc<Events>) -> Dispatcher<Arc<Events>> {
        Dispatcher::new(codec(), Arc::new(full_registry()), events)
    }

    fn envelope<C: Command>(command: &C) -> Envelope {
        encode(codec().as_ref(), command).unwrap()
    }

    // ==========================================================================
    // Tests
    // ==========================================================================

    #[tokio::test]
    async fn test_dispatches_to_the_right_handlers_in_order() {
        let events = Arc::new(Events::default());
        let dispatcher = dispatcher(events.clone());

        for envelope in [
            envelope(&AnotherCommand { text: "hej".into() }),
            envelope(&AnotherCommand {
                text: "hej med dig".into(),
            }),
            envelope(&ThirdCommand { text: "hej".into() }),
            envelope(&ThirdCommand {
                text: "hej med dig".into(),
            }),
        ] {
            dispatcher
                .dispatch(&envelope, CancellationToken::new())
                .await
                .unwrap();
        }

        assert_eq!(
            events.snapshot(),
            vec![
                "AnotherCommandHandler called - text: hej",
                "AnotherCommandHandler called - text: hej med dig",
                "ThirdCommandHandler called - text: hej",
                "ThirdCommandHandler called - text: hej med dig",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_handler_gives_named_error_and_runs_nothing() {
        let events = Arc::new(Events::default());
        let dispatcher = dispatcher(events.clone());

        let err = dispatcher
            .dispatch(&envelope(&SomeCommand), CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            DispatchError::HandlerNotRegistered {
                command_type,
                type_name,
            } => {
                assert_eq!(*command_type, "test.some.v1");
                assert!(type_name.ends_with("SomeCommand"));
            }
            other => panic!("expected HandlerNotRegistered, got {}", other),
        }
        assert!(err.to_string().contains("test.some.v1"));
        assert!(events.snapshot().is_empty());
        assert_eq!(dispatcher.stats().cached_invokers, 0);
        assert_eq!(dispatcher.open_scopes(), 0);
    }

    #[tokio::test]
    async fn test_invoker_is_synthesized_once_per_type() {
        let events = Arc::new(Events::default());
        let dispatcher = dispatcher(events.clone());

        for i in 0..5 {
            let env = envelope(&AnotherCommand {
                text: i.to_string(),
            });
            dispatcher
                .dispatch(&env, CancellationToken::new())
                .await
                .unwrap();
        }

        assert_eq!(events.snapshot().len(), 5);
        assert_eq!(
            dispatcher.stats(),
            DispatchStats {
                cached_invokers: 1,
                synthesized: 1,
            }
        );

        dispatcher
            .dispatch(
                &envelope(&ThirdCommand { text: "x".into() }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(dispatcher.stats().cached_invokers, 2);
        assert_eq!(dispatcher.stats().synthesized, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_sight_executes_each_command_once() {
        let events = Arc::new(Events::default());
        let dispatcher = Arc::new(dispatcher(events.clone()));

        let mut tasks = Vec::new();
        for i in 0..32 {
            let dispatcher = dispatcher.clone();
            let env = envelope(&AnotherCommand {
                text: i.to_string(),
            });
            tasks.push(tokio::spawn(async move {
                dispatcher
                    .dispatch(&env, CancellationToken::new())
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stats = dispatcher.stats();
        assert_eq!(events.snapshot().len(), 32);
        assert_eq!(stats.cached_invokers, 1);
        assert!(stats.synthesized >= 1 && stats.synthesized <= 32);
        assert_eq!(dispatcher.open_scopes(), 0);
    }

    #[tokio::test]
    async fn test_handler_error_propagates_and_scope_is_released() {
        let events = Arc::new(Events::default());
        let dispatcher = dispatcher(events.clone());

        let err = dispatcher
            .dispatch(
                &envelope(&ThirdCommand {
                    text: "fail".into(),
                }),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            DispatchError::HandlerFailed { source, .. } => {
                assert_eq!(source.to_string(), "refusing to handle 'fail'");
            }
            other => panic!("expected HandlerFailed, got {}", other),
        }
        assert_eq!(dispatcher.open_scopes(), 0);
    }

    #[tokio::test]
    async fn test_handler_panic_is_caught() {
        let dispatcher = dispatcher(Arc::new(Events::default()));

        let err = dispatcher
            .dispatch(&envelope(&ExplodingCommand), CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            DispatchError::HandlerPanicked { message, .. } => assert_eq!(message, "kaboom"),
            other => panic!("expected HandlerPanicked, got {}", other),
        }
        assert_eq!(dispatcher.open_scopes(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_invocation_runs_nothing() {
        let events = Arc::new(Events::default());
        let dispatcher = dispatcher(events.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = dispatcher
            .dispatch(&envelope(&AnotherCommand { text: "x".into() }), cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Cancelled { .. }));
        assert!(events.snapshot().is_empty());
        assert_eq!(dispatcher.open_scopes(), 0);
    }

    #[tokio::test]
    async fn test_decode_errors_propagate_unchanged() {
        let dispatcher = dispatcher(Arc::new(Events::default()));

        let unknown = Envelope::new(Headers::new(), b"{}".to_vec())
            .with_header(COMMAND_TYPE_HEADER, "test.nobody.v1");
        let err = dispatcher
            .dispatch(&unknown, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Codec(CodecError::UnknownType { .. })
        ));

        let malformed = Envelope::new(Headers::new(), b"not json".to_vec())
            .with_header(COMMAND_TYPE_HEADER, "test.another.v1");
        let err = dispatcher
            .dispatch(&malformed, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Codec(CodecError::Decoding { .. })));
        assert!(err.is_bad_data());
    }

    #[tokio::test]
    async fn test_each_dispatch_gets_a_fresh_scope() {
        let seen_scopes = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen_scopes.clone();
        let registry = HandlerRegistry::<()>::new().register::<SomeCommand, _, _>(
            move |scope: &Scope<()>| {
                recorder.lock().unwrap().push(scope.id());
                Ok(crate::handler::handler_fn(|_cmd: SomeCommand, _cancel| async {
                    Ok(())
                }))
            },
        );
        let dispatcher = Dispatcher::new(codec(), Arc::new(registry), ());

        for _ in 0..3 {
            dispatcher
                .dispatch(&envelope(&SomeCommand), CancellationToken::new())
                .await
                .unwrap();
        }

        let scopes = seen_scopes.lock().unwrap().clone();
        assert_eq!(scopes.len(), 3);
        assert_ne!(scopes[0], scopes[1]);
        assert_ne!(scopes[1], scopes[2]);
    }
}
