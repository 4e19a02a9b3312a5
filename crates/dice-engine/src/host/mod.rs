//! Module host: launches, multiplexes, and tears down plugin processes.
//!
//! One plugin process per module, launched on first need and kept for the
//! run. A plugin that times out, crashes, or fails its handshake lands on
//! the dead-list; subsequent dispatches to it fail fast with
//! `PluginUnavailable` instead of respawning mid-run.
//!
//! A plugin serves at most one `Handle` call at a time. A nested dispatch
//! reaching a busy plugin is refused rather than deadlocking the engine on
//! a process that is blocked inside its own call.

pub mod plugin;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use dice_core::error::{Error, Result};
use dice_core::event::Event;
use dice_core::model::{Id, Module};
use dice_core::ports::{ModuleAdapter, ModuleInvoker};
use tracing::{info, warn};

pub use plugin::PluginHandle;

/// Default per-call deadline.
pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(60);

/// Default plugin startup/handshake deadline.
pub const DEFAULT_STARTUP_DEADLINE: Duration = Duration::from_secs(10);

/// Default teardown grace period before a kill.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

enum PluginState {
    Live(PluginHandle),
    /// Taken out for an in-flight `Handle` call.
    Busy,
    Dead(String),
}

/// Owns every plugin process of a run.
pub struct ModuleHost {
    socket_dir: PathBuf,
    call_deadline: Duration,
    startup_deadline: Duration,
    grace: Duration,
    modules: RefCell<HashMap<Id, Module>>,
    plugins: RefCell<HashMap<Id, PluginState>>,
    next_broker: Cell<u32>,
}

impl ModuleHost {
    #[must_use]
    pub fn new(socket_dir: PathBuf) -> Self {
        Self {
            socket_dir,
            call_deadline: DEFAULT_CALL_DEADLINE,
            startup_deadline: DEFAULT_STARTUP_DEADLINE,
            grace: DEFAULT_GRACE,
            modules: RefCell::new(HashMap::new()),
            plugins: RefCell::new(HashMap::new()),
            next_broker: Cell::new(1),
        }
    }

    /// Overrides the per-call deadline.
    #[must_use]
    pub const fn with_call_deadline(mut self, deadline: Duration) -> Self {
        self.call_deadline = deadline;
        self
    }

    /// Overrides the teardown grace period.
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Makes a module launchable. Composition registers every module bound
    /// by a compiled node.
    pub fn register(&self, module: Module) {
        self.modules.borrow_mut().insert(module.id, module);
    }

    /// The property map of a running plugin, if it was launched.
    #[must_use]
    pub fn properties(&self, module_id: Id) -> Option<serde_json::Value> {
        match self.plugins.borrow().get(&module_id) {
            Some(PluginState::Live(handle)) => Some(handle.properties().clone()),
            _ => None,
        }
    }

    fn module(&self, module_id: Id) -> Result<Module> {
        self.modules
            .borrow()
            .get(&module_id)
            .cloned()
            .ok_or_else(|| Error::not_found("module", module_id))
    }

    fn fresh_brokers(&self) -> (u32, u32) {
        let adapter = self.next_broker.get();
        let propagate = adapter.wrapping_add(1);
        // Broker 0 is the control channel and is never handed out.
        self.next_broker.set(propagate.wrapping_add(1).max(1));
        (adapter, propagate)
    }

    /// Tears down every live plugin.
    pub fn shutdown_all(&self) {
        let plugins: Vec<(Id, PluginState)> = self.plugins.borrow_mut().drain().collect();
        for (id, state) in plugins {
            if let PluginState::Live(handle) = state {
                info!(module = %id, "shutting down plugin");
                handle.shutdown(self.grace);
            }
        }
    }

    /// Whether dispatches to this module currently fail fast.
    #[must_use]
    pub fn is_dead(&self, module_id: Id) -> bool {
        matches!(
            self.plugins.borrow().get(&module_id),
            Some(PluginState::Dead(_))
        )
    }
}

impl ModuleInvoker for ModuleHost {
    fn invoke(
        &self,
        module_id: Id,
        event: &Event,
        args: Option<&str>,
        adapter: &dyn ModuleAdapter,
        on_trigger: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()> {
        let module = self.module(module_id)?;

        let state = self.plugins.borrow_mut().remove(&module_id);
        let mut handle = match state {
            Some(PluginState::Live(handle)) => handle,
            Some(PluginState::Busy) => {
                self.plugins
                    .borrow_mut()
                    .insert(module_id, PluginState::Busy);
                return Err(Error::PluginUnavailable {
                    module: module.name,
                    reason: "handle call already in flight".to_string(),
                });
            }
            Some(PluginState::Dead(reason)) => {
                self.plugins
                    .borrow_mut()
                    .insert(module_id, PluginState::Dead(reason.clone()));
                return Err(Error::PluginUnavailable {
                    module: module.name,
                    reason,
                });
            }
            None => match PluginHandle::launch(&module, &self.socket_dir, self.startup_deadline) {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(module = %module.name, error = %err, "plugin launch failed");
                    self.plugins
                        .borrow_mut()
                        .insert(module_id, PluginState::Dead(err.to_string()));
                    return Err(err);
                }
            },
        };

        self.plugins
            .borrow_mut()
            .insert(module_id, PluginState::Busy);
        let (adapter_broker, propagate_broker) = self.fresh_brokers();
        let result = handle.handle(
            event,
            args,
            adapter,
            on_trigger,
            adapter_broker,
            propagate_broker,
            self.call_deadline,
        );

        // Transport and protocol failures have already killed the child;
        // dispatch and handler errors leave it running. Liveness is the
        // single source of truth for the dead-list.
        let next_state = if handle.is_alive() {
            PluginState::Live(handle)
        } else {
            let reason = result
                .as_ref()
                .err()
                .map_or_else(|| "process exited".to_string(), ToString::to_string);
            warn!(module = %module.name, %reason, "plugin marked dead");
            PluginState::Dead(reason)
        };
        self.plugins.borrow_mut().insert(module_id, next_state);
        result
    }

    fn is_dead(&self, module_id: Id) -> bool {
        ModuleHost::is_dead(self, module_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dice_core::event::{ENGINE_NODE, Event, EventKind};
    use dice_core::model::{Fingerprint, Host, Label, Scan, Source};

    struct NullAdapter;

    impl ModuleAdapter for NullAdapter {
        fn get_host(&self, id: Id) -> Result<Host> {
            Err(Error::not_found("host", id))
        }
        fn get_source(&self, id: Id) -> Result<Source> {
            Err(Error::not_found("source", id))
        }
        fn get_scan(&self, id: Id) -> Result<Scan> {
            Err(Error::not_found("scan", id))
        }
        fn add_hosts(&self, _: Vec<Host>) -> Result<Vec<Id>> {
            Ok(Vec::new())
        }
        fn add_fingerprints(&self, _: Vec<Fingerprint>) -> Result<Vec<Id>> {
            Ok(Vec::new())
        }
        fn add_labels(&self, _: Vec<Label>) -> Result<Vec<Id>> {
            Ok(Vec::new())
        }
        fn add_scans(&self, _: Vec<Scan>) -> Result<Vec<Id>> {
            Ok(Vec::new())
        }
        fn add_sources(&self, _: Vec<Source>) -> Result<Vec<Id>> {
            Ok(Vec::new())
        }
        fn query(&self, _: &str) -> Result<Vec<Host>> {
            Ok(Vec::new())
        }
    }

    fn broken_module() -> Module {
        Module {
            id: Id(3),
            name: "ghost".to_string(),
            location: "/nonexistent/dice-ghost".to_string(),
            hash: String::new(),
            tags: Vec::new(),
            properties: Default::default(),
        }
    }

    #[test]
    fn test_unregistered_module_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let host = ModuleHost::new(dir.path().to_path_buf());
        let event = Event::new(ENGINE_NODE, EventKind::Host, Id(1));
        let err = host
            .invoke(Id(99), &event, None, &NullAdapter, &mut || Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "module", .. }));
    }

    #[test]
    fn test_launch_failure_lands_on_dead_list() {
        let dir = tempfile::tempdir().unwrap();
        let host = ModuleHost::new(dir.path().to_path_buf());
        host.register(broken_module());
        let event = Event::new(ENGINE_NODE, EventKind::Host, Id(1));

        let err = host
            .invoke(Id(3), &event, None, &NullAdapter, &mut || Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::PluginStartup { .. }));
        assert!(host.is_dead(Id(3)));

        // Subsequent dispatches fail fast instead of respawning.
        let err = host
            .invoke(Id(3), &event, None, &NullAdapter, &mut || Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::PluginUnavailable { .. }));
    }

    #[test]
    fn test_fresh_brokers_never_hand_out_control() {
        let dir = tempfile::tempdir().unwrap();
        let host = ModuleHost::new(dir.path().to_path_buf());
        for _ in 0..64 {
            let (adapter, propagate) = host.fresh_brokers();
            assert_ne!(adapter, 0);
            assert_ne!(propagate, 0);
            assert_ne!(adapter, propagate);
        }
    }
}
