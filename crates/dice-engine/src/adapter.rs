//! Cosmos adapter: the write path that turns store operations into events.
//!
//! Every `add_*` persists its slice, then emits one event per entity in
//! input order. Emission happens after commit; if a subscriber fails, the
//! rows are deleted again and the add fails with the subscriber's error.
//! This is the at-most-once contract: a write whose event could not be
//! delivered is not observable afterwards.
//!
//! The adapter implements [`CosmosView`] for the node runtime, and hands out
//! origin-scoped [`ModuleAdapter`]s so entities added by a module are
//! attributed to the invoking node.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use dice_core::bus::EventBus;
use dice_core::error::Result;
use dice_core::event::{Event, EventKind};
use dice_core::model::{Fingerprint, Hook, Host, Id, Label, Scan, Source};
use dice_core::ports::{CosmosView, ModuleAdapter};
use tracing::warn;

use crate::store::CosmosStore;

/// Event-emitting facade over the cosmos store.
pub struct CosmosAdapter {
    store: Rc<CosmosStore>,
    bus: RefCell<Weak<EventBus>>,
}

impl CosmosAdapter {
    #[must_use]
    pub fn new(store: Rc<CosmosStore>) -> Rc<Self> {
        Rc::new(Self {
            store,
            bus: RefCell::new(Weak::new()),
        })
    }

    /// Wires the bus in after construction; the bus holds the components,
    /// which hold this adapter, so the back edge is weak.
    pub fn bind_bus(&self, bus: &Rc<EventBus>) {
        *self.bus.borrow_mut() = Rc::downgrade(bus);
    }

    fn emit(&self, event: Event) -> Result<()> {
        match self.bus.borrow().upgrade() {
            Some(bus) => bus.emit(event),
            // Setup phase: no bus yet, writes are silent.
            None => Ok(()),
        }
    }

    /// Emits one event per object; on failure runs `rollback` and returns
    /// the delivery error.
    fn emit_all(
        &self,
        origin: Id,
        kind: EventKind,
        objects: &[Id],
        rollback: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        for &object in objects {
            if let Err(err) = self.emit(Event::new(origin, kind, object)) {
                if let Err(undo) = rollback() {
                    warn!(error = %undo, "rollback after failed delivery also failed");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn add_hosts_from(&self, origin: Id, hosts: Vec<Host>) -> Result<Vec<Id>> {
        let stored = self.store.add_hosts(hosts)?;
        let ids: Vec<Id> = stored.iter().map(|h| h.id).collect();
        self.emit_all(origin, EventKind::Host, &ids, || {
            self.store.delete_hosts(&ids)
        })?;
        Ok(ids)
    }

    /// Fingerprint events are routed by the affected host.
    pub fn add_fingerprints_from(
        &self,
        origin: Id,
        fingerprints: Vec<Fingerprint>,
    ) -> Result<Vec<Id>> {
        let stored = self.store.add_fingerprints(fingerprints)?;
        let ids: Vec<Id> = stored.iter().map(|f| f.id).collect();
        let hosts: Vec<Id> = stored.iter().map(|f| f.host_id).collect();
        self.emit_all(origin, EventKind::Fingerprint, &hosts, || {
            self.store.delete_fingerprints(&ids)
        })?;
        Ok(ids)
    }

    /// Label events are routed by the affected host.
    pub fn add_labels_from(&self, origin: Id, labels: Vec<Label>) -> Result<Vec<Id>> {
        let stored = self.store.add_labels(labels)?;
        let ids: Vec<Id> = stored.iter().map(|l| l.id).collect();
        let hosts: Vec<Id> = stored.iter().map(|l| l.host_id).collect();
        self.emit_all(origin, EventKind::Label, &hosts, || {
            self.store.delete_labels(&ids)
        })?;
        Ok(ids)
    }

    pub fn add_scans_from(&self, origin: Id, scans: Vec<Scan>) -> Result<Vec<Id>> {
        let stored = self.store.add_scans(scans)?;
        let ids: Vec<Id> = stored.iter().map(|s| s.id).collect();
        self.emit_all(origin, EventKind::Scan, &ids, || {
            self.store.delete_scans(&ids)
        })?;
        Ok(ids)
    }

    pub fn add_sources_from(&self, origin: Id, sources: Vec<Source>) -> Result<Vec<Id>> {
        let stored = self.store.add_sources(sources)?;
        let ids: Vec<Id> = stored.iter().map(|s| s.id).collect();
        self.emit_all(origin, EventKind::Source, &ids, || {
            self.store.delete_sources(&ids)
        })?;
        Ok(ids)
    }

    pub fn query(&self, pattern: &str) -> Result<Vec<Host>> {
        self.store.query_hosts(pattern)
    }
}

impl CosmosView for CosmosAdapter {
    fn get_host(&self, id: Id) -> Result<Host> {
        self.store.get_host(id)
    }

    fn get_source(&self, id: Id) -> Result<Source> {
        self.store.get_source(id)
    }

    fn get_scan(&self, id: Id) -> Result<Scan> {
        self.store.get_scan(id)
    }

    fn hooks_for(&self, object_id: Id) -> Result<Vec<Hook>> {
        self.store.find_hooks(object_id)
    }

    fn record_hook(&self, object_id: Id, node_id: Id, done: bool) -> Result<()> {
        self.store.record_hook(object_id, node_id, done)
    }

    fn adapter_for(&self, origin: Id) -> Box<dyn ModuleAdapter + '_> {
        Box::new(ScopedAdapter {
            adapter: self,
            origin,
        })
    }
}

/// A [`ModuleAdapter`] whose writes carry a fixed originating node.
struct ScopedAdapter<'a> {
    adapter: &'a CosmosAdapter,
    origin: Id,
}

impl ModuleAdapter for ScopedAdapter<'_> {
    fn get_host(&self, id: Id) -> Result<Host> {
        self.adapter.get_host(id)
    }

    fn get_source(&self, id: Id) -> Result<Source> {
        self.adapter.get_source(id)
    }

    fn get_scan(&self, id: Id) -> Result<Scan> {
        self.adapter.get_scan(id)
    }

    fn add_hosts(&self, hosts: Vec<Host>) -> Result<Vec<Id>> {
        self.adapter.add_hosts_from(self.origin, hosts)
    }

    fn add_fingerprints(&self, fingerprints: Vec<Fingerprint>) -> Result<Vec<Id>> {
        self.adapter.add_fingerprints_from(self.origin, fingerprints)
    }

    fn add_labels(&self, labels: Vec<Label>) -> Result<Vec<Id>> {
        self.adapter.add_labels_from(self.origin, labels)
    }

    fn add_scans(&self, scans: Vec<Scan>) -> Result<Vec<Id>> {
        self.adapter.add_scans_from(self.origin, scans)
    }

    fn add_sources(&self, sources: Vec<Source>) -> Result<Vec<Id>> {
        self.adapter.add_sources_from(self.origin, sources)
    }

    fn query(&self, pattern: &str) -> Result<Vec<Host>> {
        self.adapter.query(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CosmosStore, open_in_memory};
    use dice_core::ENGINE_NODE;
    use dice_core::component::{Component, Entry};
    use dice_core::error::Error;
    use dice_core::graph;
    use dice_core::model::{ComponentKind, Module, Node, NodeKind, Signature, Strategy};
    use dice_core::ports::ModuleInvoker;
    use dice_core::registry::Registry;
    use std::collections::BTreeMap;

    fn adapter() -> Rc<CosmosAdapter> {
        let conn = open_in_memory().unwrap();
        CosmosStore::init_schema(&conn.lock().unwrap()).unwrap();
        let sources = open_in_memory().unwrap();
        CosmosStore::init_sources_schema(&sources.lock().unwrap()).unwrap();
        CosmosAdapter::new(Rc::new(CosmosStore::new(conn, sources)))
    }

    /// Fails every invocation; used to make a subscriber error.
    struct FailingInvoker;

    impl ModuleInvoker for FailingInvoker {
        fn invoke(
            &self,
            module_id: Id,
            _event: &Event,
            _args: Option<&str>,
            _adapter: &dyn ModuleAdapter,
            _on_trigger: &mut dyn FnMut() -> Result<()>,
        ) -> Result<()> {
            Err(Error::PluginUnavailable {
                module: module_id.to_string(),
                reason: "dead".to_string(),
            })
        }
    }

    /// A classifier with one module node wired to the failing invoker.
    fn failing_classifier(cosmos: Rc<CosmosAdapter>) -> Rc<Component> {
        let mut registry = Registry::new();
        registry
            .add_module(Module {
                id: Id(1),
                name: "broken".to_string(),
                location: String::new(),
                hash: String::new(),
                tags: Vec::new(),
                properties: BTreeMap::new(),
            })
            .unwrap();
        registry
            .add_signature(Signature {
                id: Id(1),
                name: "sig".to_string(),
                component: ComponentKind::Classifier,
                nodes: vec![Node {
                    id: Id(10),
                    signature_id: Id(1),
                    kind: NodeKind::Module,
                    object_id: Id(1),
                    children: Vec::new(),
                    name: "broken".to_string(),
                    strategy: Strategy::Default,
                    args: None,
                }],
            })
            .unwrap();
        let set = Rc::new(graph::compile(&registry, &[Id(1)]).unwrap());
        let entries = vec![Entry {
            name: "sig".to_string(),
            roots: vec![Id(10)],
        }];
        Rc::new(Component::new(
            ComponentKind::Classifier,
            entries,
            set,
            cosmos,
            Rc::new(FailingInvoker),
        ))
    }

    #[test]
    fn test_add_without_bus_is_silent() {
        let adapter = adapter();
        let ids = adapter
            .add_hosts_from(ENGINE_NODE, vec![Host::default()])
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert!(adapter.get_host(ids[0]).is_ok());
    }

    #[test]
    fn test_events_attributed_to_origin() {
        let adapter = adapter();
        let bus = Rc::new(EventBus::new());
        adapter.bind_bus(&bus);

        adapter
            .add_hosts_from(Id(42), vec![Host::default()])
            .unwrap();
        let journal = bus.journal();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].node_id, Id(42));
        assert_eq!(journal[0].kind, EventKind::Host);
    }

    #[test]
    fn test_fingerprint_events_routed_by_host() {
        let adapter = adapter();
        let bus = Rc::new(EventBus::new());
        adapter.bind_bus(&bus);

        let host_id = adapter
            .add_hosts_from(ENGINE_NODE, vec![Host::default()])
            .unwrap()[0];
        adapter
            .add_fingerprints_from(
                Id(9),
                vec![Fingerprint {
                    host_id,
                    ..Fingerprint::default()
                }],
            )
            .unwrap();

        let journal = bus.journal();
        let fp_event = &journal[1];
        assert_eq!(fp_event.kind, EventKind::Fingerprint);
        assert_eq!(fp_event.object_id, host_id);
    }

    #[test]
    fn test_failed_delivery_rolls_back() {
        let adapter = adapter();
        let bus = Rc::new(EventBus::new());
        let component = failing_classifier(Rc::clone(&adapter));
        bus.subscribe(&component);
        adapter.bind_bus(&bus);

        let err = adapter
            .add_hosts_from(ENGINE_NODE, vec![Host::default()])
            .unwrap_err();
        assert!(matches!(err, Error::BusDelivery(_)));

        // The write is not observable afterwards.
        assert!(adapter.query("*").unwrap().is_empty());
    }

    #[test]
    fn test_multi_entity_rollback_removes_all() {
        let adapter = adapter();
        let bus = Rc::new(EventBus::new());
        let component = failing_classifier(Rc::clone(&adapter));
        bus.subscribe(&component);
        adapter.bind_bus(&bus);

        let err = adapter
            .add_hosts_from(
                ENGINE_NODE,
                vec![Host::default(), Host::default(), Host::default()],
            )
            .unwrap_err();
        assert!(matches!(err, Error::BusDelivery(_)));
        assert!(adapter.query("*").unwrap().is_empty());
    }
}
