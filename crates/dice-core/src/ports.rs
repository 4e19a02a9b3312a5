//! Trait seams between the dispatch core and the engine.
//!
//! The node runtime is written against these traits so the engine can wire
//! subprocess plugins and a sqlite cosmos underneath, while tests wire
//! in-process fakes.

use crate::error::Result;
use crate::event::Event;
use crate::model::{Fingerprint, Hook, Host, Id, Label, Scan, Source};

/// The surface a module sees while handling an event.
///
/// Implementations are scoped to the invoking node: entities added through
/// the adapter emit events carrying that node's id as originator.
pub trait ModuleAdapter {
    fn get_host(&self, id: Id) -> Result<Host>;
    fn get_source(&self, id: Id) -> Result<Source>;
    fn get_scan(&self, id: Id) -> Result<Scan>;

    /// Each `add_*` persists the slice in one transaction, emits one event
    /// per entity in input order, and returns the assigned ids.
    fn add_hosts(&self, hosts: Vec<Host>) -> Result<Vec<Id>>;
    fn add_fingerprints(&self, fingerprints: Vec<Fingerprint>) -> Result<Vec<Id>>;
    fn add_labels(&self, labels: Vec<Label>) -> Result<Vec<Id>>;
    fn add_scans(&self, scans: Vec<Scan>) -> Result<Vec<Id>>;
    fn add_sources(&self, sources: Vec<Source>) -> Result<Vec<Id>>;

    /// Hosts whose ip or domain matches the glob pattern.
    fn query(&self, pattern: &str) -> Result<Vec<Host>>;
}

/// What the node runtime itself needs from the cosmos.
pub trait CosmosView {
    fn get_host(&self, id: Id) -> Result<Host>;
    fn get_source(&self, id: Id) -> Result<Source>;
    fn get_scan(&self, id: Id) -> Result<Scan>;

    /// Hooks recorded against an object, the authoritative dispatch filter.
    fn hooks_for(&self, object_id: Id) -> Result<Vec<Hook>>;

    /// Creates or updates the unique `(object_id, node_id)` hook.
    fn record_hook(&self, object_id: Id, node_id: Id, done: bool) -> Result<()>;

    /// An adapter whose writes are attributed to `origin`.
    fn adapter_for(&self, origin: Id) -> Box<dyn ModuleAdapter + '_>;
}

/// Invokes a module for one event.
///
/// `on_trigger` is called each time the module requests child propagation;
/// the strategy behind it decides whether children actually run.
pub trait ModuleInvoker {
    fn invoke(
        &self,
        module_id: Id,
        event: &Event,
        args: Option<&str>,
        adapter: &dyn ModuleAdapter,
        on_trigger: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()>;

    /// Whether the module is on the dead-list. Dispatch skips dead modules
    /// instead of failing the whole component for the rest of the run.
    fn is_dead(&self, _module_id: Id) -> bool {
        false
    }
}
