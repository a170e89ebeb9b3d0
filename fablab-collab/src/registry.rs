//! Typed handler registry for broker events.
//!
//! Handlers register under a [`Topic`] (one event type or the `*` wildcard)
//! and receive a [`ListenerHandle`] that removes exactly that registration.
//!
//! Dispatch order for one event: every handler for the exact type in
//! registration order, then every wildcard handler. A handler that returns an
//! error or panics is logged and skipped; the remaining handlers still run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::HandlerError;
use crate::protocol::{Event, EventType};

/// Callback invoked for each matching event.
pub type Handler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

/// What a handler listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Exact(EventType),
    /// The `*` wildcard: every event.
    All,
}

impl From<EventType> for Topic {
    fn from(t: EventType) -> Self {
        Topic::Exact(t)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        if s == "*" {
            Topic::All
        } else {
            Topic::Exact(EventType::from(s))
        }
    }
}

/// Outcome counts of a single dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

type Entries = HashMap<Topic, Vec<(u64, Handler)>>;

struct RegistryInner {
    entries: Mutex<Entries>,
    next_id: AtomicU64,
}

impl RegistryInner {
    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn remove(&self, topic: &Topic, id: u64) -> bool {
        let mut entries = self.entries();
        let Some(list) = entries.get_mut(topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            entries.remove(topic);
        }
        removed
    }
}

/// Map of topic → ordered handlers. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HandlerRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry").field("topics", &self.topic_count()).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `handler` under `topic`.
    pub fn register<F>(&self, topic: impl Into<Topic>, handler: F) -> ListenerHandle
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .entries()
            .entry(topic.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        ListenerHandle { registry: Arc::downgrade(&self.inner), topic, id }
    }

    /// Invoke every handler matching `event`.
    ///
    /// The handler lists are snapshotted before any handler runs, so handlers
    /// may register or unregister listeners without deadlocking.
    pub fn dispatch(&self, event: &Event) -> DispatchReport {
        let (exact, wildcard) = {
            let entries = self.inner.entries();
            let snapshot = |topic: &Topic| -> Vec<Handler> {
                entries
                    .get(topic)
                    .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                    .unwrap_or_default()
            };
            (snapshot(&Topic::Exact(event.event_type.clone())), snapshot(&Topic::All))
        };

        let mut report = DispatchReport::default();
        for handler in exact.iter().chain(wildcard.iter()) {
            report.invoked += 1;
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    log::error!("Handler for {} (event {}) failed: {e}", event.event_type, event.id);
                }
                Err(_) => {
                    report.failed += 1;
                    log::error!("Handler for {} (event {}) panicked", event.event_type, event.id);
                }
            }
        }
        report
    }

    /// Number of handlers registered under `topic`.
    pub fn handler_count(&self, topic: &Topic) -> usize {
        self.inner.entries().get(topic).map_or(0, Vec::len)
    }

    /// Number of topics with at least one handler.
    pub fn topic_count(&self) -> usize {
        self.inner.entries().len()
    }
}

/// Capability that removes one registration.
#[must_use = "dropping the handle keeps the listener registered forever"]
#[derive(Debug)]
pub struct ListenerHandle {
    registry: Weak<RegistryInner>,
    topic: Topic,
    id: u64,
}

impl ListenerHandle {
    /// Remove this registration. Returns `false` if it was already gone.
    pub fn unregister(self) -> bool {
        match self.registry.upgrade() {
            Some(inner) => inner.remove(&self.topic, self.id),
            None => false,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}
