//! Process-local typed pub/sub.
//!
//! The bus maps event kinds to subscribed components and delivers
//! synchronously, in subscription order, short-circuiting on the first
//! error. There is no buffering and no background task: delivery is strictly
//! causal with the emitter's write path, and nested emits from node handlers
//! simply recurse.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::component::Component;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};

/// One engine instance's event bus.
///
/// Every emitted event is also appended to an in-memory journal, which is
/// the run's event log.
#[derive(Default)]
pub struct EventBus {
    subs: RefCell<HashMap<EventKind, Vec<Rc<Component>>>>,
    journal: RefCell<Vec<Event>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `component` against every kind in its subscription set.
    pub fn subscribe(&self, component: &Rc<Component>) {
        let mut subs = self.subs.borrow_mut();
        for kind in component.events() {
            subs.entry(*kind).or_default().push(Rc::clone(component));
        }
    }

    /// Delivers `event` to each subscriber in subscription order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BusDelivery`] wrapping the first subscriber error;
    /// remaining subscribers are not invoked.
    pub fn emit(&self, event: Event) -> Result<()> {
        debug!(kind = %event.kind, object = %event.object_id, origin = %event.node_id, "emit");
        self.journal.borrow_mut().push(event.clone());

        // Clone the subscriber list out so nested emits from node handlers
        // do not hold the map borrow.
        let subscribers = self
            .subs
            .borrow()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();

        for component in subscribers {
            component
                .update(&event)
                .map_err(|e| Error::BusDelivery(Box::new(e)))?;
        }
        Ok(())
    }

    /// Snapshot of every event emitted so far, in emission order.
    #[must_use]
    pub fn journal(&self) -> Vec<Event> {
        self.journal.borrow().clone()
    }

    /// Number of subscribers for a kind; mainly for setup assertions.
    #[must_use]
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subs.borrow().get(&kind).map_or(0, Vec::len)
    }
}
