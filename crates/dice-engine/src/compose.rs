//! Component factory: compiles staged signatures into components.
//!
//! For each requested kind, the signatures tagged with that component are
//! compiled (shared arena, shared memoisation) and their roots become the
//! component's entry-point set. Bare modules staged through the synthetic
//! module-only signature join the entry set of every kind their tags cover.

use std::rc::Rc;

use dice_core::component::{Component, Entry, subscriptions};
use dice_core::error::Result;
use dice_core::graph::{self, CompiledKind, GraphSet};
use dice_core::model::{ComponentKind, Id};
use dice_core::ports::{CosmosView, ModuleInvoker};
use dice_core::registry::Registry;
use tracing::info;

/// Compiles one component per requested kind.
///
/// Kinds with no matching signatures still produce a component (with an
/// empty entry set); partial compiled state is discarded on error.
pub fn compose(
    registry: &Registry,
    kinds: &[ComponentKind],
    cosmos: &Rc<dyn CosmosView>,
    invoker: &Rc<dyn ModuleInvoker>,
) -> Result<Vec<Rc<Component>>> {
    // Compile everything the requested components need in one shared set,
    // so embedded signatures resolve across component boundaries.
    let wanted: Vec<Id> = registry
        .signatures()
        .filter(|s| s.id == Id::ZERO || kinds.contains(&s.component))
        .map(|s| s.id)
        .collect();
    let set = Rc::new(graph::compile(registry, &wanted)?);

    let mut components = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        let entries = entries_for(registry, &set, kind);
        info!(
            component = %kind,
            entries = entries.len(),
            events = ?subscriptions(kind),
            "component composed"
        );
        components.push(Rc::new(Component::new(
            kind,
            entries,
            Rc::clone(&set),
            Rc::clone(cosmos),
            Rc::clone(invoker),
        )));
    }
    Ok(components)
}

fn entries_for(registry: &Registry, set: &GraphSet, kind: ComponentKind) -> Vec<Entry> {
    let mut entries = Vec::new();
    for sig in registry.signatures() {
        if sig.id == Id::ZERO {
            // Bare modules: a module joins the kinds its tags name; an
            // untagged module joins every composed kind.
            let graph = match set.graph(Id::ZERO) {
                Some(graph) => graph,
                None => continue,
            };
            let roots: Vec<Id> = graph
                .roots
                .iter()
                .copied()
                .filter(|id| match set.node(*id).map(|n| &n.kind) {
                    Some(CompiledKind::Module { module_id, .. }) => registry
                        .module(*module_id)
                        .is_some_and(|m| m.tags.is_empty() || m.tags.iter().any(|t| t == kind.as_str())),
                    _ => false,
                })
                .collect();
            if !roots.is_empty() {
                entries.push(Entry {
                    name: sig.name.clone(),
                    roots,
                });
            }
        } else if sig.component == kind {
            if let Some(graph) = set.graph(sig.id) {
                entries.push(Entry {
                    name: graph.name.clone(),
                    roots: graph.roots.clone(),
                });
            }
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use dice_core::error::{Error, Result as CoreResult};
    use dice_core::event::Event;
    use dice_core::model::{
        Fingerprint, Hook, Host, Label, Module, Node, NodeKind, Scan, Signature, Source, Strategy,
    };
    use dice_core::ports::ModuleAdapter;
    use std::collections::BTreeMap;

    struct NoCosmos;

    impl CosmosView for NoCosmos {
        fn get_host(&self, id: Id) -> CoreResult<Host> {
            Err(Error::not_found("host", id))
        }
        fn get_source(&self, id: Id) -> CoreResult<Source> {
            Err(Error::not_found("source", id))
        }
        fn get_scan(&self, id: Id) -> CoreResult<Scan> {
            Err(Error::not_found("scan", id))
        }
        fn hooks_for(&self, _object_id: Id) -> CoreResult<Vec<Hook>> {
            Ok(Vec::new())
        }
        fn record_hook(&self, _object_id: Id, _node_id: Id, _done: bool) -> CoreResult<()> {
            Ok(())
        }
        fn adapter_for(&self, _origin: Id) -> Box<dyn ModuleAdapter + '_> {
            unreachable!("composition never dispatches")
        }
    }

    struct NoInvoker;

    impl ModuleInvoker for NoInvoker {
        fn invoke(
            &self,
            _module_id: Id,
            _event: &Event,
            _args: Option<&str>,
            _adapter: &dyn ModuleAdapter,
            _on_trigger: &mut dyn FnMut() -> CoreResult<()>,
        ) -> CoreResult<()> {
            unreachable!("composition never dispatches")
        }
    }

    fn module(id: u64, name: &str, tags: &[&str]) -> Module {
        Module {
            id: Id(id),
            name: name.to_string(),
            location: String::new(),
            hash: String::new(),
            tags: tags.iter().map(ToString::to_string).collect(),
            properties: BTreeMap::new(),
        }
    }

    fn signature(id: u64, name: &str, component: ComponentKind, module: Id, node: u64) -> Signature {
        Signature {
            id: Id(id),
            name: name.to_string(),
            component,
            nodes: vec![Node {
                id: Id(node),
                signature_id: Id(id),
                kind: NodeKind::Module,
                object_id: module,
                children: Vec::new(),
                name: "entry".to_string(),
                strategy: Strategy::Default,
                args: None,
            }],
        }
    }

    fn compose_kinds(registry: &Registry, kinds: &[ComponentKind]) -> Vec<Rc<Component>> {
        let cosmos: Rc<dyn CosmosView> = Rc::new(NoCosmos);
        let invoker: Rc<dyn ModuleInvoker> = Rc::new(NoInvoker);
        compose(registry, kinds, &cosmos, &invoker).unwrap()
    }

    #[test]
    fn test_selects_by_component_tag() {
        let mut registry = Registry::new();
        registry.add_module(module(1, "ident", &[])).unwrap();
        registry.add_module(module(2, "class", &[])).unwrap();
        registry
            .add_signature(signature(1, "find", ComponentKind::Identifier, Id(1), 10))
            .unwrap();
        registry
            .add_signature(signature(2, "judge", ComponentKind::Classifier, Id(2), 20))
            .unwrap();

        let components =
            compose_kinds(&registry, &[ComponentKind::Identifier, ComponentKind::Classifier]);
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].kind(), ComponentKind::Identifier);
        assert_eq!(components[1].kind(), ComponentKind::Classifier);
    }

    #[test]
    fn test_bare_modules_follow_tags() {
        let mut registry = Registry::new();
        registry
            .add_bare_module(module(1, "sweeper", &["scanner"]))
            .unwrap();
        registry
            .add_bare_module(module(2, "everywhere", &[]))
            .unwrap();

        let components = compose_kinds(
            &registry,
            &[ComponentKind::Classifier, ComponentKind::Scanner],
        );
        // The tagged module only joins the scanner; the untagged one joins
        // both.
        let classifier_roots: usize = components[0].entries().iter().map(|e| e.roots.len()).sum();
        let scanner_roots: usize = components[1].entries().iter().map(|e| e.roots.len()).sum();
        assert_eq!(classifier_roots, 1);
        assert_eq!(scanner_roots, 2);
    }

    #[test]
    fn test_empty_kind_still_composes() {
        let registry = Registry::new();
        let components = compose_kinds(&registry, &[ComponentKind::Scanner]);
        assert_eq!(components.len(), 1);
    }
}
