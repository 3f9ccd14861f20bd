//! Scoped delivery of interrupt and terminate signals.
//!
//! A single process-wide handler forwards every SIGINT/SIGTERM to the
//! [`SignalDispatcher`]. Build steps subscribe for the span of work they need
//! to clean up after; the [`Subscription`] unregisters on drop, so a
//! listener never outlives its step. A listener fires at most once, but its
//! subscription keeps the process alive until dropped: further signals during
//! a step's cleanup are swallowed. A signal that arrives while no
//! subscription is held terminates the process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{debug, warn};

/// Exit status for a signal with no live subscription.
pub const INTERRUPTED_EXIT: i32 = 130;

type Listener = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    /// Listeners that have not fired yet.
    listeners: BTreeMap<u64, Listener>,
    /// Subscriptions not yet dropped, fired or not.
    live: BTreeSet<u64>,
}

#[derive(Clone, Default)]
pub struct SignalDispatcher {
    registry: Arc<Mutex<Registry>>,
}

/// Registration handle; dropping it removes the listener if it has not fired.
#[must_use = "dropping a subscription unregisters its listener"]
pub struct Subscription {
    id: u64,
    registry: Arc<Mutex<Registry>>,
}

impl SignalDispatcher {
    /// A dispatcher with no process handler attached. Signals reach it only
    /// through [`deliver`](Self::deliver).
    pub fn new() -> Self {
        Self::default()
    }

    /// The dispatcher wired to the process signal handler. The handler is
    /// installed on first use.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<SignalDispatcher> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                let dispatcher = SignalDispatcher::new();
                let handler = dispatcher.clone();
                if let Err(e) = ctrlc::set_handler(move || {
                    if !handler.absorb() {
                        std::process::exit(INTERRUPTED_EXIT);
                    }
                }) {
                    warn!("failed to install signal handler: {e}");
                }
                dispatcher
            })
            .clone()
    }

    /// Run `listener` on the next delivered signal.
    pub fn subscribe(&self, listener: impl FnOnce() + Send + 'static) -> Subscription {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.insert(id, Box::new(listener));
        registry.live.insert(id);
        Subscription {
            id,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Fire and unregister every current listener, most recent subscription
    /// first. Returns how many ran.
    pub fn deliver(&self) -> usize {
        let listeners = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut registry.listeners)
        };
        let count = listeners.len();
        debug!("delivering signal to {count} listener(s)");
        for (_, listener) in listeners.into_iter().rev() {
            listener();
        }
        count
    }

    /// Deliver a signal on behalf of the process handler. Returns `false`
    /// when no subscription is held, in which case the signal is the
    /// process's to act on.
    pub fn absorb(&self) -> bool {
        let guarded = self.subscription_count() > 0;
        if self.deliver() == 0 && guarded {
            debug!("signal absorbed while a step is cleaning up");
        }
        guarded
    }

    /// Listeners that have not fired yet.
    pub fn listener_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }

    /// Subscriptions still held, including those whose listener has fired.
    pub fn subscription_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.listeners.remove(&self.id);
        registry.live.remove(&self.id);
    }
}
