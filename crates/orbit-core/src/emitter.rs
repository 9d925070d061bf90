//! Named-event pub/sub with ordered, awaited listener invocation.
//!
//! Two emission modes back the request flow:
//!
//! - `settle_in_series`: fire-and-wait. Listener errors are collected and
//!   returned to the caller (which surfaces them as an `error` event) but
//!   never abort emission. Used for observational events (`transform`,
//!   `update`, ...).
//! - `fulfill_in_series`: fire-and-collect. Listener return values become
//!   hints for the request handler; the first listener error aborts the
//!   request. Used for the gating `before*` events.
//!
//! Invocation order matches registration order. Emission snapshots the
//! listener list up front, so removing a listener mid-emission affects only
//! subsequent events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use tracing::debug;

use orbit_api::{OrbitError, Result};

pub type ListenerId = u64;

type ListenerFn<E, R> = Arc<dyn Fn(E) -> BoxFuture<'static, Result<Option<R>>> + Send + Sync>;

struct Registered<E, R> {
    id: ListenerId,
    once: bool,
    handler: ListenerFn<E, R>,
}

impl<E, R> Clone for Registered<E, R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            handler: Arc::clone(&self.handler),
        }
    }
}

/// Event bus keyed by event name. `E` is the payload handed to listeners,
/// `R` the hint type listeners may return from gated events.
pub struct Emitter<E, R = ()> {
    listeners: RwLock<HashMap<String, Vec<Registered<E, R>>>>,
    next_id: AtomicU64,
}

impl<E, R> Default for Emitter<E, R> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E, R> Emitter<E, R>
where
    E: Clone + Send + 'static,
    R: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; returns an id usable with [`Emitter::off`].
    pub fn on<F, Fut>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<R>>> + Send + 'static,
    {
        self.register(event, listener, false)
    }

    /// Register a listener that is removed after its first invocation.
    pub fn one<F, Fut>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<R>>> + Send + 'static,
    {
        self.register(event, listener, true)
    }

    fn register<F, Fut>(&self, event: &str, listener: F, once: bool) -> ListenerId
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<R>>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: ListenerFn<E, R> = Arc::new(move |payload| Box::pin(listener(payload)));
        self.listeners
            .write()
            .expect("emitter lock poisoned")
            .entry(event.to_string())
            .or_default()
            .push(Registered { id, once, handler });
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn off(&self, event: &str, id: ListenerId) {
        let mut listeners = self.listeners.write().expect("emitter lock poisoned");
        if let Some(registered) = listeners.get_mut(event) {
            registered.retain(|l| l.id != id);
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .expect("emitter lock poisoned")
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Snapshot the current listeners for `event` and drop one-shot entries
    /// from the registry before invocation.
    fn snapshot(&self, event: &str) -> Vec<Registered<E, R>> {
        let mut listeners = self.listeners.write().expect("emitter lock poisoned");
        match listeners.get_mut(event) {
            Some(registered) => {
                let snapshot = registered.clone();
                registered.retain(|l| !l.once);
                snapshot
            }
            None => Vec::new(),
        }
    }

    /// Fire-and-forget emission: settle every listener, drop their errors.
    pub async fn emit(&self, event: &str, payload: &E) {
        let _ = self.settle_in_series(event, payload).await;
    }

    /// Await every listener in registration order; collect errors without
    /// aborting.
    pub async fn settle_in_series(&self, event: &str, payload: &E) -> Vec<OrbitError> {
        let mut errors = Vec::new();
        for registered in self.snapshot(event) {
            if let Err(err) = (registered.handler)(payload.clone()).await {
                debug!(event = event, listener = registered.id, %err, "listener failed during settle");
                errors.push(err);
            }
        }
        errors
    }

    /// Await every listener in registration order, collecting returned hints.
    /// The first listener error aborts and propagates.
    pub async fn fulfill_in_series(&self, event: &str, payload: &E) -> Result<Vec<Option<R>>> {
        let mut hints = Vec::new();
        for registered in self.snapshot(event) {
            hints.push((registered.handler)(payload.clone()).await?);
        }
        Ok(hints)
    }
}
