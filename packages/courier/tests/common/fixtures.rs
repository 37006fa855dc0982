//! Commands and handlers shared by the integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use courier::{async_trait, CancellationToken, Command, Handler, Scope};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Dependencies handed to every handler factory.
#[derive(Default)]
pub struct TestDeps {
    log: Mutex<Vec<String>>,
    invocations: AtomicUsize,
}

impl TestDeps {
    pub fn record(&self, entry: impl Into<String>) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(entry.into());
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greet {
    pub text: String,
}

impl Command for Greet {
    fn command_type() -> &'static str {
        "test.greet.v1"
    }
}

/// Fails whenever `fail` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub label: String,
    pub fail: bool,
}

impl Command for Charge {
    fn command_type() -> &'static str {
        "test.charge.v1"
    }
}

/// Known to the codec but never given a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unhandled {
    pub id: u64,
}

impl Command for Unhandled {
    fn command_type() -> &'static str {
        "test.unhandled.v1"
    }
}

pub struct GreetHandler {
    deps: Arc<TestDeps>,
}

impl GreetHandler {
    pub fn from_scope(scope: &Scope<TestDeps>) -> Result<Self> {
        Ok(Self {
            deps: scope.deps_arc(),
        })
    }
}

#[async_trait]
impl Handler<Greet> for GreetHandler {
    async fn handle(&self, command: Greet, _cancel: CancellationToken) -> Result<()> {
        self.deps.record(command.text);
        Ok(())
    }
}

pub struct ChargeHandler {
    deps: Arc<TestDeps>,
}

impl ChargeHandler {
    pub fn from_scope(scope: &Scope<TestDeps>) -> Result<Self> {
        Ok(Self {
            deps: scope.deps_arc(),
        })
    }
}

#[async_trait]
impl Handler<Charge> for ChargeHandler {
    async fn handle(&self, command: Charge, _cancel: CancellationToken) -> Result<()> {
        if command.fail {
            anyhow::bail!("card declined for {}", command.label);
        }
        self.deps.record(command.label);
        Ok(())
    }
}
