//! Listener registry and per-listener isolated fan-out.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::events::{Event, EventKind, normalize};
use crate::transport::Frame;
use crate::types::BoxError;

type ListenerFn = dyn Fn(&Event) -> Result<(), BoxError> + Send + Sync;

/// A callback handle. Clones share identity: registering a clone of an
/// already-registered listener is a no-op.
#[derive(Clone)]
pub struct Listener(Arc<ListenerFn>);

impl Listener {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Wrap a callback that cannot fail.
    pub fn infallible<F>(f: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Self::new(move |event| {
            f(event);
            Ok(())
        })
    }

    fn same(&self, other: &Listener) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct EventDispatcher {
    listeners: Mutex<HashMap<EventKind, Vec<Listener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Listener>>> {
        // A listener cannot panic while the lock is held, so a poisoned
        // registry is still consistent.
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `listener` for `kind`. Returns `false` if it was already
    /// registered.
    pub fn on(&self, kind: EventKind, listener: &Listener) -> bool {
        let mut registry = self.registry();
        let set = registry.entry(kind).or_default();
        if set.iter().any(|l| l.same(listener)) {
            return false;
        }
        set.push(listener.clone());
        true
    }

    /// Remove `listener` from `kind`. Returns `false` if it was not registered.
    pub fn off(&self, kind: EventKind, listener: &Listener) -> bool {
        let mut registry = self.registry();
        let Some(set) = registry.get_mut(&kind) else {
            return false;
        };
        let before = set.len();
        set.retain(|l| !l.same(listener));
        let removed = set.len() != before;
        if set.is_empty() {
            registry.remove(&kind);
        }
        removed
    }

    pub fn clear(&self) {
        self.registry().clear();
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registry().get(&kind).map_or(0, Vec::len)
    }

    pub fn total_listeners(&self) -> usize {
        self.registry().values().map(Vec::len).sum()
    }

    /// Invoke every listener registered for the event's kind.
    ///
    /// Listeners run against a snapshot taken before the first call, so a
    /// listener may register or unregister others without deadlocking. An
    /// error or panic in one listener is logged and counted; the rest still
    /// run.
    pub fn dispatch(&self, event: &Event) -> DispatchReport {
        let kind = event.kind();
        let snapshot: Vec<Listener> = self.registry().get(&kind).cloned().unwrap_or_default();

        let mut report = DispatchReport::default();
        for listener in snapshot {
            report.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| (listener.0)(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(event = kind.name(), "listener failed: {e}");
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::warn!(event = kind.name(), "listener panicked");
                }
            }
        }
        report
    }

    /// Normalize an inbound wire frame and dispatch it. Unknown names and
    /// malformed payloads are logged and dropped.
    pub fn dispatch_frame(&self, frame: &Frame) -> Option<DispatchReport> {
        match normalize(frame) {
            Ok(Some(event)) => Some(self.dispatch(&event)),
            Ok(None) => {
                tracing::debug!(event = %frame.event, "ignoring unrecognized inbound event");
                None
            }
            Err(e) => {
                tracing::warn!(event = %frame.event, "dropping malformed payload: {e}");
                None
            }
        }
    }
}
