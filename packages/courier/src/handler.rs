//! The handler capability: one command type, one async operation.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::command::Command;

/// Handles commands of type `C`.
///
/// Handlers receive the decoded command and a cancellation token. Long
/// running handlers should watch the token and bail out when it fires;
/// a handler that returns `Ok(())` is treated as delivered even if
/// cancellation was requested meanwhile.
///
/// # Example
///
/// ```ignore
/// struct SendInvoiceHandler {
///     mailer: Arc<Mailer>,
/// }
///
/// #[async_trait]
/// impl Handler<SendInvoice> for SendInvoiceHandler {
///     async fn handle(&self, cmd: SendInvoice, cancel: CancellationToken) -> Result<()> {
///         tokio::select! {
///             _ = cancel.cancelled() => anyhow::bail!("cancelled"),
///             res = self.mailer.send_invoice(cmd.invoice_id) => res,
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<C: Command>: Send + Sync {
    async fn handle(&self, command: C, cancel: CancellationToken) -> Result<()>;
}

#[async_trait]
impl<C, H> Handler<C> for Arc<H>
where
    C: Command,
    H: Handler<C> + ?Sized,
{
    async fn handle(&self, command: C, cancel: CancellationToken) -> Result<()> {
        (**self).handle(command, cancel).await
    }
}

/// A handler backed by an async closure.
///
/// Created with [`handler_fn`].
pub struct HandlerFn<C, F> {
    f: F,
    _marker: PhantomData<fn(C)>,
}

/// Wrap an async closure as a [`Handler`].
///
/// ```ignore
/// registry.register_instance::<Greet, _>(handler_fn(|cmd: Greet, _cancel| async move {
///     println!("hello {}", cmd.text);
///     Ok(())
/// }));
/// ```
pub fn handler_fn<C, F, Fut>(f: F) -> HandlerFn<C, F>
where
    C: Command,
    F: Fn(C, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    HandlerFn {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<C, F, Fut> Handler<C> for HandlerFn<C, F>
where
    C: Command,
    F: Fn(C, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, command: C, cancel: CancellationToken) -> Result<()> {
        (self.f)(command, cancel).await
    }
}
