//! The engine runner: staging, composition, and the run loop.
//!
//! An [`Engine`] is one run's world: the three stores, the registry, the
//! event bus, the module host, and the composed components, all owned by a
//! single value threaded through the CLI. Nothing here is process-global.
//!
//! A run consumes input sources: each insert through the cosmos adapter
//! emits a `Source` event, the identifier component picks it up, and the
//! cascade (fingerprints, hosts, labels, scan requests) follows from there.

use std::path::Path;
use std::rc::Rc;

use dice_core::bus::EventBus;
use dice_core::component::Component;
use dice_core::config::Config;
use dice_core::error::{Error, Result};
use dice_core::event::{ENGINE_NODE, Event};
use dice_core::model::{ComponentKind, Id, NodeKind, Signature, Source};
use dice_core::parser;
use dice_core::ports::{CosmosView, ModuleInvoker};
use dice_core::registry::Registry;
use tracing::{debug, info};

use crate::adapter::CosmosAdapter;
use crate::compose;
use crate::host::ModuleHost;
use crate::loader;
use crate::store::{self, CosmosStore, ProjectStore, SignatureStore};

/// Source file extensions accepted by default.
pub const SOURCE_EXTENSIONS: [&str; 3] = ["json", "csv", "txt"];

/// Which components a run composes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actions {
    pub scan: bool,
    pub identify: bool,
    pub classify: bool,
}

impl Actions {
    /// Everything: identify, classify, and scan.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            scan: true,
            identify: true,
            classify: true,
        }
    }

    /// Identify and classify only, no scanner.
    #[must_use]
    pub const fn classify_only() -> Self {
        Self {
            scan: false,
            identify: true,
            classify: true,
        }
    }

    fn kinds(self) -> Vec<ComponentKind> {
        let mut kinds = Vec::new();
        if self.identify {
            kinds.push(ComponentKind::Identifier);
        }
        if self.classify {
            kinds.push(ComponentKind::Classifier);
        }
        if self.scan {
            kinds.push(ComponentKind::Scanner);
        }
        kinds
    }
}

/// One engine instance.
pub struct Engine {
    config: Config,
    registry: Registry,
    signatures: SignatureStore,
    projects: ProjectStore,
    cosmos: Rc<CosmosAdapter>,
    bus: Rc<EventBus>,
    host: Rc<ModuleHost>,
    components: Vec<Rc<Component>>,
}

impl Engine {
    /// Opens the stores under the configured data directory and builds the
    /// adapters, bus, and module host.
    pub fn open(config: Config) -> Result<Self> {
        let data = config.data_dir();

        let sig_conn = store::open(&data.join("signatures.db"))?;
        SignatureStore::init_schema(&sig_conn.lock().expect("fresh connection"))
            .map_err(|e| Error::store("init_schema", e))?;
        let signatures = SignatureStore::new(sig_conn);

        let proj_conn = store::open(&data.join("projects.db"))?;
        ProjectStore::init_schema(&proj_conn.lock().expect("fresh connection"))
            .map_err(|e| Error::store("init_schema", e))?;
        let projects = ProjectStore::new(proj_conn);

        let cosmos_conn = store::open(&data.join("cosmos.db"))?;
        CosmosStore::init_schema(&cosmos_conn.lock().expect("fresh connection"))
            .map_err(|e| Error::store("init_schema", e))?;
        let sources_conn = store::open_in_memory()?;
        CosmosStore::init_sources_schema(&sources_conn.lock().expect("fresh connection"))
            .map_err(|e| Error::store("init_schema", e))?;
        let cosmos = CosmosAdapter::new(Rc::new(CosmosStore::new(cosmos_conn, sources_conn)));

        let bus = Rc::new(EventBus::new());
        cosmos.bind_bus(&bus);
        let host = Rc::new(ModuleHost::new(config.runtime_dir()));

        Ok(Self {
            config,
            registry: Registry::new(),
            signatures,
            projects,
            cosmos,
            bus,
            host,
            components: Vec::new(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn signature_store(&self) -> &SignatureStore {
        &self.signatures
    }

    #[must_use]
    pub const fn project_store(&self) -> &ProjectStore {
        &self.projects
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The run's event log so far.
    #[must_use]
    pub fn journal(&self) -> Vec<Event> {
        self.bus.journal()
    }

    // --- staging ---

    /// Stages modules matching the globs as bare entry points. Modules must
    /// already be registered (`dice module add`).
    pub fn stage_modules(&mut self, patterns: &[String]) -> Result<()> {
        for pattern in patterns {
            for module in self.signatures.list_modules(pattern)? {
                debug!(module = %module.name, "staging bare module");
                self.registry.add_bare_module(module)?;
            }
        }
        Ok(())
    }

    /// Stages signatures matching the globs: stored ones directly, plus any
    /// `.dice` files under the signatures directory not yet in the store.
    pub fn stage_signatures(&mut self, patterns: &[String]) -> Result<()> {
        let dir = self.config.signatures_dir();
        if dir.is_dir() {
            for path in loader::find_signature_files(&dir, patterns)? {
                self.stage_signature_file(&path)?;
            }
        }
        for pattern in patterns {
            for sig in self.signatures.list_signatures(pattern)? {
                self.load_into_registry(sig)?;
            }
        }
        Ok(())
    }

    /// Parses and stores one signature file, pulling in the files of
    /// embedded signatures that are not yet stored. The whole closure is
    /// staged as one batch, so mutually embedding signatures resolve; their
    /// cycle is rejected later by the graph compiler.
    pub fn stage_signature_file(&self, path: &Path) -> Result<Signature> {
        let mut batch = Vec::new();
        let mut visited = Vec::new();
        self.collect_signature_files(path, &mut visited, &mut batch)?;
        let mut staged = self.signatures.stage_all(&batch)?;
        Ok(staged.remove(0))
    }

    fn collect_signature_files(
        &self,
        path: &Path,
        visited: &mut Vec<String>,
        batch: &mut Vec<parser::ParsedSignature>,
    ) -> Result<()> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if visited.iter().any(|v| v == name) {
            return Ok(());
        }
        visited.push(name.to_string());

        let text = std::fs::read_to_string(path)?;
        let parsed = parser::parse(name, &text)?;
        let embedded: Vec<String> = parsed
            .nodes
            .iter()
            .filter(|stub| stub.kind == NodeKind::EmbeddedSignature)
            .map(|stub| stub.name.clone())
            .collect();
        let signature = parsed.name.clone();
        batch.push(parsed);

        for target in embedded {
            if visited.iter().any(|v| *v == target)
                || self.signatures.signature_by_name(&target)?.is_some()
            {
                continue;
            }
            let file = loader::signature_file(&self.config.signatures_dir(), &target);
            if !file.is_file() {
                return Err(Error::UnresolvedReference {
                    signature: signature.clone(),
                    name: target,
                });
            }
            self.collect_signature_files(&file, visited, batch)?;
        }
        Ok(())
    }

    /// Pulls a stored signature (and everything it references) into the
    /// run's registry.
    fn load_into_registry(&mut self, sig: Signature) -> Result<()> {
        if self.registry.signature(sig.id).is_some() {
            return Ok(());
        }
        let mut embedded = Vec::new();
        for node in &sig.nodes {
            match node.kind {
                NodeKind::Module => {
                    let module = self.signatures.get_module(node.object_id)?;
                    self.registry.add_module(module)?;
                }
                NodeKind::EmbeddedSignature => embedded.push(node.object_id),
            }
        }
        // Register before recursing so cyclic embeddings terminate here and
        // are reported by the graph compiler instead of overflowing.
        self.registry.add_signature(sig)?;
        for id in embedded {
            if self.registry.signature(id).is_none() {
                let inner = self.signatures.get_signature(id)?;
                self.load_into_registry(inner)?;
            }
        }
        Ok(())
    }

    // --- composition ---

    /// Composes components for the action set and subscribes them.
    pub fn compose(&mut self, actions: Actions) -> Result<()> {
        let invoker: Rc<dyn ModuleInvoker> = Rc::clone(&self.host) as Rc<dyn ModuleInvoker>;
        self.compose_with(actions, &invoker)
    }

    /// Composition with an explicit invoker; the seam integration tests use
    /// to run graphs against in-process modules.
    pub fn compose_with(
        &mut self,
        actions: Actions,
        invoker: &Rc<dyn ModuleInvoker>,
    ) -> Result<()> {
        for module in self.registry.modules() {
            self.host.register(module.clone());
        }
        let cosmos: Rc<dyn CosmosView> = Rc::clone(&self.cosmos) as Rc<dyn CosmosView>;
        let components = compose::compose(&self.registry, &actions.kinds(), &cosmos, invoker)?;
        for component in &components {
            self.bus.subscribe(component);
        }
        self.components = components;
        Ok(())
    }

    // --- running ---

    /// Materialises file sources matching the globs under the workspace.
    pub fn find_sources(&self, patterns: &[String]) -> Result<Vec<Source>> {
        loader::find_source_files(&self.config.workspace(), patterns, &SOURCE_EXTENSIONS)
    }

    /// Seeds the run: inserts each source, which emits the `Source` event
    /// that starts the cascade. Returns on the first unrecoverable error.
    pub fn run(&self, sources: Vec<Source>) -> Result<()> {
        info!(sources = sources.len(), "run starting");
        for source in sources {
            let name = source.name.clone();
            self.cosmos
                .add_sources_from(ENGINE_NODE, vec![source])
                .map_err(|err| {
                    debug!(source = %name, error = %err, "source failed");
                    err
                })?;
        }
        Ok(())
    }

    /// Tears down every plugin process.
    pub fn teardown(&self) {
        self.host.shutdown_all();
    }

    /// Direct cosmos access for the CLI and tests.
    #[must_use]
    pub fn cosmos(&self) -> Rc<CosmosAdapter> {
        Rc::clone(&self.cosmos)
    }

    /// The run's event bus.
    #[must_use]
    pub fn bus(&self) -> Rc<EventBus> {
        Rc::clone(&self.bus)
    }

    /// Registers a project directory, creating the `.dice` marker.
    pub fn init_project(&self, path: &Path, name: Option<&str>) -> Result<dice_core::model::Project> {
        let canonical = if path.as_os_str().is_empty() || path == Path::new(".") {
            std::env::current_dir()?
        } else {
            std::fs::create_dir_all(path)?;
            path.canonicalize()?
        };
        let name = match name {
            Some(name) => name.to_string(),
            None => canonical
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("project")
                .to_string(),
        };

        let marker = canonical.join(dice_core::config::PROJECT_MARKER);
        if marker.exists() {
            return Err(Error::DuplicateName {
                kind: "project",
                name,
            });
        }
        std::fs::write(&marker, b"")?;

        let project = self.projects.add_project(&dice_core::model::Project {
            id: Id::ZERO,
            name,
            path: canonical.to_string_lossy().into_owned(),
        })?;
        info!(project = %project.name, path = %project.path, "project initialised");
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dice_core::config::{PathOverrides, StandardPaths};

    fn engine_in(dir: &Path) -> Engine {
        let paths = StandardPaths::resolve(&PathOverrides {
            data_home: dir.join("data").to_string_lossy().into_owned(),
            state_home: dir.join("state").to_string_lossy().into_owned(),
            config_home: dir.join("config").to_string_lossy().into_owned(),
            ..PathOverrides::default()
        });
        Engine::open(Config::new(paths)).unwrap()
    }

    #[test]
    fn test_open_creates_databases() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        assert!(dir.path().join("data/signatures.db").is_file());
        assert!(dir.path().join("data/cosmos.db").is_file());
        assert!(engine.journal().is_empty());
    }

    #[test]
    fn test_stage_signature_files_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let sig_dir = engine.config().signatures_dir();
        std::fs::create_dir_all(&sig_dir).unwrap();

        // Modules must be registered before signatures that bind them.
        let mod_dir = engine.config().modules_dir().join("identifier");
        std::fs::create_dir_all(&mod_dir).unwrap();
        std::fs::write(mod_dir.join("probe"), b"#!/bin/sh\n").unwrap();
        std::fs::write(mod_dir.join("deep"), b"#!/bin/sh\n").unwrap();
        let modules =
            loader::find_module_files(&engine.config().modules_dir(), &["*".to_string()]).unwrap();
        for module in &modules {
            engine.signature_store().add_module(module).unwrap();
        }

        std::fs::write(sig_dir.join("inner.dice"), "mod deep\n").unwrap();
        std::fs::write(
            sig_dir.join("outer.dice"),
            "component = identifier\nmod probe\nsig inner (mod: probe)\n",
        )
        .unwrap();

        engine.stage_signatures(&["outer".to_string()]).unwrap();

        // Both the outer signature and the embedded one ended up staged.
        assert!(engine.registry().signature_by_name("outer").is_some());
        assert!(engine.registry().signature_by_name("inner").is_some());
    }

    #[test]
    fn test_missing_embedded_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        let sig_dir = engine.config().signatures_dir();
        std::fs::create_dir_all(&sig_dir).unwrap();
        std::fs::write(sig_dir.join("broken.dice"), "sig ghost\n").unwrap();

        let err = engine
            .stage_signature_file(&sig_dir.join("broken.dice"))
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference { ref name, .. } if name == "ghost"));
    }

    #[test]
    fn test_init_project() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        let proj_dir = dir.path().join("proj");

        let project = engine.init_project(&proj_dir, Some("coin")).unwrap();
        assert_eq!(project.name, "coin");
        assert!(proj_dir.join(".dice").is_file());

        // A second init of the same directory is refused.
        let err = engine.init_project(&proj_dir, Some("coin")).unwrap_err();
        assert!(matches!(err, Error::DuplicateName { .. }));
    }
}
