//! Shared harness for engine integration tests.
//!
//! Builds a complete engine in a temp directory and wires the graphs to
//! in-process fake modules instead of plugin processes, so scenarios can
//! script module behaviour and count invocations.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use dice_core::config::{Config, PathOverrides, StandardPaths};
use dice_core::error::{Error, Result};
use dice_core::event::{Event, EventKind};
use dice_core::model::{Id, Module};
use dice_core::ports::{ModuleAdapter, ModuleInvoker};
use dice_engine::{Actions, Engine};
use tempfile::TempDir;

/// A scripted module body.
pub type Handler = Box<
    dyn Fn(&Event, &dyn ModuleAdapter, &mut dyn FnMut() -> Result<()>) -> Result<()>,
>;

/// In-process stand-in for the module host.
#[derive(Default)]
pub struct FakeInvoker {
    handlers: RefCell<HashMap<Id, Handler>>,
    names: RefCell<HashMap<Id, String>>,
    calls: RefCell<Vec<(String, EventKind)>>,
    dead: RefCell<HashMap<Id, String>>,
}

impl FakeInvoker {
    /// Makes invocation logs readable; modules without handlers are no-ops.
    pub fn register(&self, module_id: Id, name: &str) {
        self.names.borrow_mut().insert(module_id, name.to_string());
    }

    pub fn set_handler(&self, module_id: Id, name: &str, handler: Handler) {
        self.handlers.borrow_mut().insert(module_id, handler);
        self.register(module_id, name);
    }

    /// `(module name, event kind)` per invocation, in order.
    pub fn calls(&self) -> Vec<(String, EventKind)> {
        self.calls.borrow().clone()
    }

    pub fn call_names(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn count_for(&self, name: &str) -> usize {
        self.calls.borrow().iter().filter(|(n, _)| n == name).count()
    }
}

impl ModuleInvoker for FakeInvoker {
    fn invoke(
        &self,
        module_id: Id,
        event: &Event,
        _args: Option<&str>,
        adapter: &dyn ModuleAdapter,
        on_trigger: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()> {
        let name = self
            .names
            .borrow()
            .get(&module_id)
            .cloned()
            .unwrap_or_else(|| module_id.to_string());
        if let Some(reason) = self.dead.borrow().get(&module_id) {
            return Err(Error::PluginUnavailable {
                module: name,
                reason: reason.clone(),
            });
        }
        self.calls.borrow_mut().push((name.clone(), event.kind));

        let handlers = self.handlers.borrow();
        match handlers.get(&module_id) {
            Some(handler) => handler(event, adapter, on_trigger),
            None => Ok(()),
        }
    }

    fn is_dead(&self, module_id: Id) -> bool {
        self.dead.borrow().contains_key(&module_id)
    }
}

impl FakeInvoker {
    /// Simulates the host dead-listing a crashed plugin.
    pub fn mark_dead(&self, module_id: Id, reason: &str) {
        self.dead.borrow_mut().insert(module_id, reason.to_string());
    }
}

/// An engine over a temp data dir with a scripted invoker.
pub struct World {
    #[allow(dead_code)] // owns the temp dir for the engine's lifetime
    dir: TempDir,
    pub engine: Engine,
    pub invoker: Rc<FakeInvoker>,
}

impl World {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let paths = StandardPaths::resolve(&PathOverrides {
            data_home: dir.path().join("data").to_string_lossy().into_owned(),
            state_home: dir.path().join("state").to_string_lossy().into_owned(),
            config_home: dir.path().join("config").to_string_lossy().into_owned(),
            ..PathOverrides::default()
        });
        let engine = Engine::open(Config::new(paths)).expect("engine opens");
        Self {
            dir,
            engine,
            invoker: Rc::new(FakeInvoker::default()),
        }
    }

    /// Registers a module executable stub and returns its stored id.
    pub fn module(&self, kind: &str, name: &str) -> Id {
        let dir = self.engine.config().modules_dir().join(kind);
        std::fs::create_dir_all(&dir).expect("modules dir");
        let path = dir.join(name);
        std::fs::write(&path, b"#!/bin/sh\nexit 0\n").expect("module stub");

        let module = Module {
            id: Id::ZERO,
            name: name.to_string(),
            location: path.to_string_lossy().into_owned(),
            hash: "0".repeat(64),
            tags: vec![kind.to_string()],
            properties: Default::default(),
        };
        let id = self
            .engine
            .signature_store()
            .add_module(&module)
            .expect("module stored")
            .id;
        self.invoker.register(id, name);
        id
    }

    /// Writes a `.dice` file into the signatures directory.
    pub fn signature_file(&self, name: &str, body: &str) -> PathBuf {
        let dir = self.engine.config().signatures_dir();
        std::fs::create_dir_all(&dir).expect("signatures dir");
        let path = dir.join(format!("{name}.dice"));
        std::fs::write(&path, body).expect("signature file");
        path
    }

    /// Stages everything and composes with the fake invoker.
    pub fn compose(&mut self, actions: Actions) -> Result<()> {
        self.engine.stage_signatures(&["*".to_string()])?;
        let invoker: Rc<dyn ModuleInvoker> = Rc::clone(&self.invoker) as Rc<dyn ModuleInvoker>;
        self.engine.compose_with(actions, &invoker)
    }

    /// Kinds of every event emitted so far.
    pub fn journal_kinds(&self) -> Vec<EventKind> {
        self.engine.journal().iter().map(|e| e.kind).collect()
    }
}
