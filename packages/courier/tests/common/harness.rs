//! Wires an in-memory outbox, codec, registry and drain loop together.

use std::sync::Arc;

use courier::{
    write_command, Command, CommandTypes, Dispatcher, DrainConfig, DrainLoop, HandlerRegistry,
    InMemoryOutbox, JsonCodec,
};
use uuid::Uuid;

use super::fixtures::{Charge, ChargeHandler, Greet, GreetHandler, TestDeps, Unhandled};

pub struct TestHarness {
    pub outbox: InMemoryOutbox,
    pub codec: Arc<JsonCodec>,
    pub deps: Arc<TestDeps>,
    pub dispatcher: Arc<Dispatcher<TestDeps>>,
}

pub fn registry() -> HandlerRegistry<TestDeps> {
    HandlerRegistry::new()
        .register::<Greet, _, _>(GreetHandler::from_scope)
        .register::<Charge, _, _>(ChargeHandler::from_scope)
}

/// Every type the tests put on the wire, including one without a handler.
pub fn command_types() -> CommandTypes {
    CommandTypes::new()
        .register::<Greet>()
        .register::<Charge>()
        .register::<Unhandled>()
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_outbox(InMemoryOutbox::new())
    }

    pub fn with_outbox(outbox: InMemoryOutbox) -> Self {
        let codec = Arc::new(JsonCodec::new(command_types()));
        let deps = Arc::new(TestDeps::default());
        let dispatcher = Arc::new(Dispatcher::from_arc(
            codec.clone(),
            Arc::new(registry()),
            deps.clone(),
        ));

        Self {
            outbox,
            codec,
            deps,
            dispatcher,
        }
    }

    /// Append a command outside any transaction.
    pub async fn enqueue<C: Command>(&self, command: &C) -> Uuid {
        let mut writer = self.outbox.clone();
        write_command(&mut writer, self.codec.as_ref(), command)
            .await
            .unwrap()
    }

    pub fn drain_loop(&self, config: DrainConfig) -> DrainLoop<InMemoryOutbox, TestDeps> {
        DrainLoop::new(
            Arc::new(self.outbox.clone()),
            self.dispatcher.clone(),
            config,
        )
    }
}
