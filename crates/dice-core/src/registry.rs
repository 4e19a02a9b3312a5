//! Staging registry used during engine setup.
//!
//! Holds the signatures and modules selected for a run, keyed by id, before
//! graph compilation. Written by the staging phase and read-only afterwards.
//! Adds are idempotent on id; staging the same entity twice is a no-op.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::model::{Id, Module, Node, NodeKind, Signature, Strategy};

/// Name given to the synthetic signature holding bare-module entry points.
const MODULE_ONLY_NAME: &str = "";

/// Staged signatures and modules for one run.
#[derive(Debug, Default)]
pub struct Registry {
    signatures: BTreeMap<Id, Signature>,
    modules: BTreeMap<Id, Module>,
    /// Signature insertion order, for stable composition.
    order: Vec<Id>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a signature. Idempotent on id; a different signature carrying
    /// an already-staged name is a [`Error::DuplicateName`].
    pub fn add_signature(&mut self, sig: Signature) -> Result<()> {
        if let Some(existing) = self.signatures.get(&sig.id) {
            if existing.name == sig.name {
                return Ok(());
            }
            return Err(Error::DuplicateName {
                kind: "signature",
                name: sig.name,
            });
        }
        if self.signature_by_name(&sig.name).is_some() {
            return Err(Error::DuplicateName {
                kind: "signature",
                name: sig.name,
            });
        }
        self.order.push(sig.id);
        self.signatures.insert(sig.id, sig);
        Ok(())
    }

    /// Stages a module. Idempotent on id.
    pub fn add_module(&mut self, module: Module) -> Result<()> {
        if let Some(existing) = self.modules.get(&module.id) {
            if existing.name == module.name {
                return Ok(());
            }
            return Err(Error::DuplicateName {
                kind: "module",
                name: module.name,
            });
        }
        if self.module_by_name(&module.name).is_some() {
            return Err(Error::DuplicateName {
                kind: "module",
                name: module.name,
            });
        }
        self.modules.insert(module.id, module);
        Ok(())
    }

    /// Stages a module and registers it as an entry point of the synthetic
    /// module-only signature, so it can run without an authored signature.
    pub fn add_bare_module(&mut self, module: Module) -> Result<()> {
        let module_id = module.id;
        let module_name = module.name.clone();
        self.add_module(module)?;

        let node_id = self.next_node_id();
        let placeholder = self.get_or_create_signature(Id::ZERO);
        if placeholder
            .nodes
            .iter()
            .any(|n| n.kind == NodeKind::Module && n.object_id == module_id)
        {
            return Ok(());
        }
        placeholder.nodes.push(Node {
            id: node_id,
            signature_id: Id::ZERO,
            kind: NodeKind::Module,
            object_id: module_id,
            children: Vec::new(),
            name: module_name,
            strategy: Strategy::Default,
            args: None,
        });
        Ok(())
    }

    /// Returns the signature for `id`, creating the module-only placeholder
    /// when asked for [`Id::ZERO`] the first time.
    pub fn get_or_create_signature(&mut self, id: Id) -> &mut Signature {
        if id == Id::ZERO && !self.signatures.contains_key(&id) {
            self.order.push(id);
            self.signatures.insert(
                id,
                Signature {
                    id,
                    name: MODULE_ONLY_NAME.to_string(),
                    component: crate::model::ComponentKind::Classifier,
                    nodes: Vec::new(),
                },
            );
        }
        self.signatures
            .get_mut(&id)
            .expect("placeholder signature exists for Id::ZERO; other ids must be staged first")
    }

    #[must_use]
    pub fn signature(&self, id: Id) -> Option<&Signature> {
        self.signatures.get(&id)
    }

    #[must_use]
    pub fn module(&self, id: Id) -> Option<&Module> {
        self.modules.get(&id)
    }

    #[must_use]
    pub fn signature_by_name(&self, name: &str) -> Option<&Signature> {
        self.signatures.values().find(|s| s.name == name)
    }

    #[must_use]
    pub fn module_by_name(&self, name: &str) -> Option<&Module> {
        self.modules.values().find(|m| m.name == name)
    }

    /// Staged signatures in insertion order.
    pub fn signatures(&self) -> impl Iterator<Item = &Signature> {
        self.order.iter().filter_map(|id| self.signatures.get(id))
    }

    /// All staged modules, in id order.
    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    /// Looks up a node across all staged signatures.
    #[must_use]
    pub fn node(&self, id: Id) -> Option<&Node> {
        self.signatures.values().find_map(|s| s.node(id))
    }

    /// One past the highest staged node id; used when synthesising nodes for
    /// bare modules so they cannot collide with store-assigned ids.
    fn next_node_id(&self) -> Id {
        let max = self
            .signatures
            .values()
            .flat_map(|s| s.nodes.iter())
            .map(|n| n.id.get())
            .max()
            .unwrap_or(0);
        Id(max + 1)
    }
}
