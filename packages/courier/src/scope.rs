//! Per-dispatch resolution scopes.
//!
//! Every dispatch opens a fresh [`Scope`] and resolves its handler from it.
//! Scopes are never shared across dispatches, so a handler that keeps state
//! cannot leak it into an unrelated command. The scope is released when it
//! is dropped, which happens on every exit path of a dispatch: success,
//! handler error, cancellation, or panic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;
use uuid::Uuid;

/// Resolution scope handed to handler factories.
///
/// Gives factories access to the shared dependencies (database pool, API
/// clients, configuration) and identifies the dispatch it belongs to.
pub struct Scope<D> {
    id: Uuid,
    envelope_id: Uuid,
    deps: Arc<D>,
    open: Arc<AtomicUsize>,
}

impl<D> Scope<D> {
    /// Unique id of this scope.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The envelope being dispatched in this scope.
    pub fn envelope_id(&self) -> Uuid {
        self.envelope_id
    }

    /// Shared dependencies.
    pub fn deps(&self) -> &D {
        &self.deps
    }

    /// Shared dependencies, for handlers that need to hold onto them.
    pub fn deps_arc(&self) -> Arc<D> {
        self.deps.clone()
    }
}

impl<D> Drop for Scope<D> {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
        trace!(scope_id = %self.id, envelope_id = %self.envelope_id, "scope released");
    }
}

impl<D> std::fmt::Debug for Scope<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("envelope_id", &self.envelope_id)
            .finish_non_exhaustive()
    }
}

/// Opens scopes and counts how many are currently open.
pub(crate) struct ScopeFactory<D> {
    deps: Arc<D>,
    open: Arc<AtomicUsize>,
}

impl<D> ScopeFactory<D> {
    pub(crate) fn new(deps: Arc<D>) -> Self {
        Self {
            deps,
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn open(&self, envelope_id: Uuid) -> Scope<D> {
        self.open.fetch_add(1, Ordering::AcqRel);
        let scope = Scope {
            id: Uuid::new_v4(),
            envelope_id,
            deps: self.deps.clone(),
            open: self.open.clone(),
        };
        trace!(scope_id = %scope.id, envelope_id = %envelope_id, "scope opened");
        scope
    }

    pub(crate) fn open_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn deps(&self) -> &Arc<D> {
        &self.deps
    }
}

impl<D> Clone for ScopeFactory<D> {
    fn clone(&self) -> Self {
        Self {
            deps: self.deps.clone(),
            open: self.open.clone(),
        }
    }
}
