//! Listener fan-out
//!
//! Output sinks implement [`DataListener`] and are registered in a
//! [`ListenerSet`]. The poll worker publishes every decoded point through
//! [`ListenerSet::publish`], which delivers it synchronously to each listener
//! in registration order.
//!
//! Each publish works on a snapshot of the set, so listeners may be added or
//! removed from any thread (including from inside `on_new_data`) without
//! affecting the delivery in progress. Errors and panics raised by a
//! listener are logged and do not reach the other listeners or the caller.

use crate::datapoint::DataPoint;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};

/// Consumer of decoded data points
///
/// `on_new_data` runs on the poll worker thread and must return promptly.
/// Listeners that do background work own their threads or tasks.
pub trait DataListener: Send + Sync {
    /// Short name used in log messages
    fn name(&self) -> &str;

    /// Handle one new data point
    fn on_new_data(&self, point: Arc<DataPoint>) -> anyhow::Result<()>;
}

/// Shared, cloneable set of registered listeners
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Arc<RwLock<Vec<Arc<dyn DataListener>>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn DataListener>) {
        debug!("Registering listener {}", listener.name());
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Remove a listener by identity. Returns false if it was not registered.
    pub fn unregister(&self, listener: &Arc<dyn DataListener>) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));

        let removed = listeners.len() != before;
        if !removed {
            debug!("Unable to unregister listener {}", listener.name());
        }
        removed
    }

    /// Remove every listener; the poll worker stops after its current cycle
    pub fn clear(&self) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current listeners in registration order
    pub fn snapshot(&self) -> Vec<Arc<dyn DataListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver a point to every listener. Returns how many accepted it.
    pub fn publish(&self, point: Arc<DataPoint>) -> usize {
        let mut delivered = 0;

        for listener in self.snapshot() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_new_data(Arc::clone(&point))
            }));

            match result {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    error!("Listener {} failed: {:#}", listener.name(), e);
                }
                Err(panic) => {
                    error!(
                        "Listener {} panicked: {}",
                        listener.name(),
                        panic_message(panic.as_ref())
                    );
                }
            }
        }

        delivered
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .snapshot()
            .iter()
            .map(|l| l.name().to_string())
            .collect();
        f.debug_struct("ListenerSet").field("listeners", &names).finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
