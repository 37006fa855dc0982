//! Courier Drain Worker
//!
//! Seeds an in-memory outbox with a handful of demo commands and drains it
//! until Ctrl-C. Shows the full producer to handler path in one process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use courier::{
    async_trait, write_command, CancellationToken, Command, Dispatcher, DrainConfig, DrainLoop,
    Handler, HandlerRegistry, InMemoryOutbox, JsonCodec, Scope,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Cards are declined above this amount.
const CARD_LIMIT_CENTS: u64 = 50_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SendWelcomeEmail {
    user_id: Uuid,
    email: String,
}

impl Command for SendWelcomeEmail {
    fn command_type() -> &'static str {
        "users.send_welcome_email.v1"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChargeCard {
    order_id: Uuid,
    amount_cents: u64,
}

impl Command for ChargeCard {
    fn command_type() -> &'static str {
        "billing.charge_card.v1"
    }
}

/// Stand-ins for the clients a real deployment would inject.
#[derive(Default)]
struct WorkerDeps {
    emails_sent: AtomicU64,
    cents_charged: AtomicU64,
}

struct WelcomeEmailHandler {
    deps: Arc<WorkerDeps>,
}

#[async_trait]
impl Handler<SendWelcomeEmail> for WelcomeEmailHandler {
    async fn handle(&self, cmd: SendWelcomeEmail, _cancel: CancellationToken) -> Result<()> {
        info!(user_id = %cmd.user_id, email = %cmd.email, "sending welcome email");
        self.deps.emails_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct ChargeCardHandler {
    deps: Arc<WorkerDeps>,
}

#[async_trait]
impl Handler<ChargeCard> for ChargeCardHandler {
    async fn handle(&self, cmd: ChargeCard, cancel: CancellationToken) -> Result<()> {
        // Simulated gateway round trip
        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("charge for order {} interrupted", cmd.order_id),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }

        if cmd.amount_cents > CARD_LIMIT_CENTS {
            anyhow::bail!(
                "card declined for order {}: {} cents over limit",
                cmd.order_id,
                cmd.amount_cents
            );
        }

        info!(order_id = %cmd.order_id, amount_cents = cmd.amount_cents, "card charged");
        self.deps
            .cents_charged
            .fetch_add(cmd.amount_cents, Ordering::Relaxed);
        Ok(())
    }
}

fn build_registry() -> HandlerRegistry<WorkerDeps> {
    HandlerRegistry::new()
        .register::<SendWelcomeEmail, _, _>(|scope: &Scope<WorkerDeps>| {
            Ok(WelcomeEmailHandler {
                deps: scope.deps_arc(),
            })
        })
        .register::<ChargeCard, _, _>(|scope: &Scope<WorkerDeps>| {
            Ok(ChargeCardHandler {
                deps: scope.deps_arc(),
            })
        })
}

/// Record a signup and an order the way a producer would: business write
/// and outbox append in one transaction.
async fn seed(outbox: &InMemoryOutbox, codec: &JsonCodec) -> Result<()> {
    let mut tx = outbox.begin();

    write_command(
        &mut tx,
        codec,
        &SendWelcomeEmail {
            user_id: Uuid::new_v4(),
            email: "ada@example.org".to_string(),
        },
    )
    .await?;
    for amount_cents in [1_250, 99_900, 4_000] {
        write_command(
            &mut tx,
            codec,
            &ChargeCard {
                order_id: Uuid::new_v4(),
                amount_cents,
            },
        )
        .await?;
    }

    info!(count = tx.staged(), "seeding outbox");
    tx.commit();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,courier=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    info!("Starting courier worker");

    let config = DrainConfig::from_env().context("Failed to load drain configuration")?;

    let registry = build_registry();
    let codec = Arc::new(JsonCodec::new(
        registry
            .command_types()
            .context("Conflicting command type tags")?,
    ));
    registry
        .ensure_complete(codec.types())
        .context("Handler registry is incomplete")?;

    let outbox = InMemoryOutbox::new()
        .with_retry_delay(Duration::from_secs(5))
        .with_max_attempts(3);
    seed(&outbox, &codec).await?;

    let deps = Arc::new(WorkerDeps::default());
    let dispatcher = Dispatcher::from_arc(codec, Arc::new(registry), deps.clone());
    let drain = DrainLoop::new(Arc::new(outbox.clone()), Arc::new(dispatcher), config);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            shutdown.cancel();
        }
    });

    drain.run(shutdown).await?;

    info!(
        emails_sent = deps.emails_sent.load(Ordering::Relaxed),
        cents_charged = deps.cents_charged.load(Ordering::Relaxed),
        pending = outbox.pending_count(),
        dead_letters = outbox.dead_letters().len(),
        "Courier worker stopped"
    );
    Ok(())
}
