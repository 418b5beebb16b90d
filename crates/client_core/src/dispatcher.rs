use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock, Weak,
    },
};

use shared::protocol::{EventTag, ServerEvent};
use tracing::{error, trace};

pub type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventTag, Vec<(u64, Handler)>>>,
}

impl Registry {
    fn remove_where(&self, tag: &EventTag, matches: impl Fn(u64, &Handler) -> bool) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(tag) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, handler)| !matches(*id, handler));
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(tag);
        }
        removed
    }
}

/// Fan-out of decoded realtime events to per-tag handlers.
///
/// Events for a tag with no handlers are dropped; nothing is buffered.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    inner: Arc<Registry>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, tag: EventTag, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.on_handler(tag, Arc::new(handler))
    }

    pub fn on_handler(&self, tag: EventTag, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tag.clone())
            .or_default()
            .push((id, handler));
        Subscription {
            registry: Arc::downgrade(&self.inner),
            tag,
            id,
        }
    }

    /// Removes every registration of `handler` under `tag`, compared by
    /// pointer identity.
    pub fn off(&self, tag: &EventTag, handler: &Handler) -> bool {
        self.inner
            .remove_where(tag, |_, registered| Arc::ptr_eq(registered, handler))
    }

    /// Invokes each handler for `event.tag`. A panicking handler is logged and
    /// the rest still run. Returns how many handlers were invoked.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        let snapshot: Vec<Handler> = {
            let handlers = self
                .inner
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match handlers.get(&event.tag) {
                Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
                None => {
                    trace!(tag = %event.tag, "dispatch: no handlers");
                    return 0;
                }
            }
        };

        for handler in &snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                error!(
                    tag = %event.tag,
                    panic = panic_message(panic.as_ref()),
                    "dispatch: handler panicked"
                );
            }
        }
        snapshot.len()
    }

    pub fn clear(&self) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn handler_count(&self, tag: &EventTag) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag)
            .map_or(0, Vec::len)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Handle returned by [`EventDispatcher::on`]. Dropping it keeps the handler
/// registered.
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<Registry>,
    tag: EventTag,
    id: u64,
}

impl Subscription {
    pub fn tag(&self) -> &EventTag {
        &self.tag
    }

    /// Removes exactly this registration. Safe to call more than once.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove_where(&self.tag, |id, _| id == self.id),
            None => false,
        }
    }
}
