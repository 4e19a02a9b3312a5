//! Graph compiler: links staged signatures into compiled DAGs.
//!
//! Compiled nodes are owned by an arena keyed by node id; child links are
//! plain id lists. This keeps lifetimes flat and makes cycle detection a
//! visit-set over ids. Compiled graphs are memoised by signature id, so a
//! signature embedded from several places compiles exactly once.
//!
//! Compiled structure is runtime-only: child lists built here are never
//! persisted back to the node store.

use std::collections::{BTreeMap, HashSet};

use crate::error::{Error, Result};
use crate::model::{Id, Node, NodeKind, Signature, Strategy};
use crate::registry::Registry;

/// The closed variant behind a compiled node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompiledKind {
    /// Binds a module; dispatch invokes its plugin.
    Module {
        module_id: Id,
        module_name: String,
        strategy: Strategy,
        args: Option<String>,
    },
    /// References another compiled graph; dispatch forwards to its roots.
    Embedded { signature_id: Id },
}

/// A node resolved and linked for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledNode {
    pub id: Id,
    pub kind: CompiledKind,
    /// Resolved children, deduplicated, in insertion order.
    pub children: Vec<Id>,
}

/// The compiled form of one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledGraph {
    pub signature_id: Id,
    pub name: String,
    /// Nodes with no parent inside the signature.
    pub roots: Vec<Id>,
    /// Nodes with no authored children; splice points when this graph is
    /// embedded elsewhere.
    pub leaves: Vec<Id>,
}

/// Arena of compiled nodes plus the graphs built over them.
#[derive(Debug, Default)]
pub struct GraphSet {
    nodes: BTreeMap<Id, CompiledNode>,
    graphs: BTreeMap<Id, CompiledGraph>,
}

impl GraphSet {
    #[must_use]
    pub fn node(&self, id: Id) -> Option<&CompiledNode> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn graph(&self, signature_id: Id) -> Option<&CompiledGraph> {
        self.graphs.get(&signature_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &CompiledNode> {
        self.nodes.values()
    }

    pub fn graphs(&self) -> impl Iterator<Item = &CompiledGraph> {
        self.graphs.values()
    }

    /// Attaches `child` to `parent`, honouring the variant: module nodes
    /// append with set semantics, embedded nodes fan the child out to every
    /// leaf of their graph. This is what splices `sig exit (mod: m)` onto
    /// the inner graph's terminal modules.
    pub fn add_child(&mut self, parent: Id, child: Id) {
        let embedded = match self.nodes.get(&parent).map(|n| &n.kind) {
            Some(CompiledKind::Module { .. }) => None,
            Some(CompiledKind::Embedded { signature_id }) => Some(*signature_id),
            None => return,
        };
        match embedded {
            None => {
                let node = self.nodes.get_mut(&parent).expect("kind checked above");
                if !node.children.contains(&child) {
                    node.children.push(child);
                }
            }
            Some(signature_id) => {
                let leaves = self
                    .graphs
                    .get(&signature_id)
                    .map(|g| g.leaves.clone())
                    .unwrap_or_default();
                for leaf in leaves {
                    self.add_child(leaf, child);
                }
            }
        }
    }
}

/// Compiles the given signatures (and everything they embed) into one
/// [`GraphSet`]. On error no partial state is returned.
pub fn compile(registry: &Registry, signature_ids: &[Id]) -> Result<GraphSet> {
    let mut compiler = Compiler {
        registry,
        loading_signatures: HashSet::new(),
        loading_nodes: HashSet::new(),
        set: GraphSet::default(),
    };
    for &id in signature_ids {
        let sig = registry
            .signature(id)
            .ok_or_else(|| Error::not_found("signature", id))?;
        compiler.graph(sig)?;
    }
    Ok(compiler.set)
}

struct Compiler<'r> {
    registry: &'r Registry,
    loading_signatures: HashSet<Id>,
    loading_nodes: HashSet<Id>,
    set: GraphSet,
}

impl Compiler<'_> {
    fn graph(&mut self, sig: &Signature) -> Result<()> {
        if self.set.graphs.contains_key(&sig.id) {
            return Ok(());
        }
        if !self.loading_signatures.insert(sig.id) {
            // Still on the compile path: the embedding relation loops back.
            return Err(Error::Cycle {
                signature: sig.name.clone(),
                node: None,
            });
        }

        let result = self.graph_inner(sig);
        self.loading_signatures.remove(&sig.id);
        result
    }

    fn graph_inner(&mut self, sig: &Signature) -> Result<()> {
        let roots = roots_of(sig);
        for root in &roots {
            self.node(sig, root)?;
        }

        // Leaves are the nodes without authored children. They may be module
        // or embedded nodes; both can be splice targets.
        let leaves: Vec<Id> = sig
            .nodes
            .iter()
            .filter(|n| n.children.is_empty())
            .map(|n| n.id)
            .collect();

        self.set.graphs.insert(
            sig.id,
            CompiledGraph {
                signature_id: sig.id,
                name: sig.name.clone(),
                roots: roots.iter().map(|n| n.id).collect(),
                leaves,
            },
        );
        Ok(())
    }

    fn node(&mut self, sig: &Signature, node: &Node) -> Result<Id> {
        if self.set.nodes.contains_key(&node.id) {
            return Ok(node.id);
        }
        if !self.loading_nodes.insert(node.id) {
            return Err(Error::Cycle {
                signature: sig.name.clone(),
                node: Some(node.id),
            });
        }
        let result = self.node_inner(sig, node);
        self.loading_nodes.remove(&node.id);
        result
    }

    fn node_inner(&mut self, sig: &Signature, node: &Node) -> Result<Id> {
        let kind = match node.kind {
            NodeKind::Module => {
                let module = self.registry.module(node.object_id).ok_or_else(|| {
                    Error::UnresolvedReference {
                        signature: sig.name.clone(),
                        name: node.name.clone(),
                    }
                })?;
                CompiledKind::Module {
                    module_id: module.id,
                    module_name: module.name.clone(),
                    strategy: node.strategy,
                    args: node.args.clone(),
                }
            }
            NodeKind::EmbeddedSignature => {
                let target = self
                    .registry
                    .signature(node.object_id)
                    .cloned()
                    .ok_or_else(|| Error::UnresolvedReference {
                        signature: sig.name.clone(),
                        name: node.name.clone(),
                    })?;
                self.graph(&target)?;
                CompiledKind::Embedded {
                    signature_id: target.id,
                }
            }
        };

        self.set.nodes.insert(
            node.id,
            CompiledNode {
                id: node.id,
                kind,
                children: Vec::new(),
            },
        );

        for &child_id in &node.children {
            let child = sig.node(child_id).ok_or_else(|| Error::UnresolvedReference {
                signature: sig.name.clone(),
                name: format!("node {child_id}"),
            })?;
            let compiled_child = self.node(sig, child)?;
            self.set.add_child(node.id, compiled_child);
        }
        Ok(node.id)
    }
}

/// Nodes of `sig` that are not a child of any node in `sig`.
///
/// The signature store answers the same question with SQL; the two must
/// agree.
#[must_use]
pub fn roots_of(sig: &Signature) -> Vec<&Node> {
    let children: HashSet<Id> = sig
        .nodes
        .iter()
        .flat_map(|n| n.children.iter().copied())
        .collect();
    sig.nodes
        .iter()
        .filter(|n| !children.contains(&n.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ComponentKind, Module};
    use std::collections::BTreeMap;

    struct Builder {
        registry: Registry,
        next: u64,
    }

    impl Builder {
        fn new() -> Self {
            Self {
                registry: Registry::new(),
                next: 100,
            }
        }

        fn module(&mut self, name: &str) -> Id {
            self.next += 1;
            let id = Id(self.next);
            self.registry
                .add_module(Module {
                    id,
                    name: name.to_string(),
                    location: format!("/modules/{name}"),
                    hash: String::new(),
                    tags: Vec::new(),
                    properties: BTreeMap::new(),
                })
                .unwrap();
            id
        }

        /// nodes: (id, kind, object, children)
        fn signature(&mut self, id: u64, name: &str, nodes: &[(u64, NodeKind, Id, &[u64])]) {
            let sig = Signature {
                id: Id(id),
                name: name.to_string(),
                component: ComponentKind::Identifier,
                nodes: nodes
                    .iter()
                    .map(|(nid, kind, object, children)| Node {
                        id: Id(*nid),
                        signature_id: Id(id),
                        kind: *kind,
                        object_id: *object,
                        children: children.iter().map(|c| Id(*c)).collect(),
                        name: format!("n{nid}"),
                        strategy: Strategy::Default,
                        args: None,
                    })
                    .collect(),
            };
            self.registry.add_signature(sig).unwrap();
        }
    }

    #[test]
    fn test_linear_chain() {
        let mut b = Builder::new();
        let m1 = b.module("m1");
        let m2 = b.module("m2");
        b.signature(
            1,
            "chain",
            &[(10, NodeKind::Module, m1, &[11]), (11, NodeKind::Module, m2, &[])],
        );

        let set = compile(&b.registry, &[Id(1)]).unwrap();
        let graph = set.graph(Id(1)).unwrap();
        assert_eq!(graph.roots, vec![Id(10)]);
        assert_eq!(graph.leaves, vec![Id(11)]);
        assert_eq!(set.node(Id(10)).unwrap().children, vec![Id(11)]);
        assert!(set.node(Id(11)).unwrap().children.is_empty());
    }

    #[test]
    fn test_no_duplicate_children() {
        let mut b = Builder::new();
        let m1 = b.module("m1");
        let m2 = b.module("m2");
        // Child listed twice in the authored structure.
        b.signature(
            1,
            "dup",
            &[(10, NodeKind::Module, m1, &[11, 11]), (11, NodeKind::Module, m2, &[])],
        );

        let set = compile(&b.registry, &[Id(1)]).unwrap();
        assert_eq!(set.node(Id(10)).unwrap().children, vec![Id(11)]);
    }

    #[test]
    fn test_embedded_splice() {
        let mut b = Builder::new();
        let m1 = b.module("m1");
        let m2 = b.module("m2");
        let m3 = b.module("m3");
        // inner: m2 alone.
        b.signature(2, "inner", &[(20, NodeKind::Module, m2, &[])]);
        // outer: m1 -> sig(inner) -> m3.
        b.signature(
            1,
            "outer",
            &[
                (10, NodeKind::Module, m1, &[11]),
                (11, NodeKind::EmbeddedSignature, Id(2), &[12]),
                (12, NodeKind::Module, m3, &[]),
            ],
        );

        let set = compile(&b.registry, &[Id(1)]).unwrap();
        // m3 is attached to inner's leaf (m2), not to the embedded node.
        assert_eq!(set.node(Id(20)).unwrap().children, vec![Id(12)]);
        assert!(set.node(Id(11)).unwrap().children.is_empty());
        // Outer root chain is intact.
        assert_eq!(set.node(Id(10)).unwrap().children, vec![Id(11)]);
    }

    #[test]
    fn test_embedding_cycle() {
        let mut b = Builder::new();
        // x embeds y, y embeds x.
        b.signature(1, "x", &[(10, NodeKind::EmbeddedSignature, Id(2), &[])]);
        b.signature(2, "y", &[(20, NodeKind::EmbeddedSignature, Id(1), &[])]);

        let err = compile(&b.registry, &[Id(1)]).unwrap_err();
        match err {
            Error::Cycle { signature, node } => {
                assert_eq!(signature, "x");
                assert!(node.is_none());
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn test_node_self_loop() {
        let mut b = Builder::new();
        let m1 = b.module("m1");
        b.signature(1, "loopy", &[(10, NodeKind::Module, m1, &[10])]);

        let err = compile(&b.registry, &[Id(1)]).unwrap_err();
        assert!(matches!(
            err,
            Error::Cycle {
                node: Some(Id(10)),
                ..
            }
        ));
    }

    #[test]
    fn test_missing_module() {
        let mut b = Builder::new();
        b.signature(1, "broken", &[(10, NodeKind::Module, Id(999), &[])]);

        let err = compile(&b.registry, &[Id(1)]).unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference { .. }));
    }

    #[test]
    fn test_memoisation_shares_embedded_graph() {
        let mut b = Builder::new();
        let m = b.module("m");
        b.signature(3, "shared", &[(30, NodeKind::Module, m, &[])]);
        b.signature(1, "a", &[(10, NodeKind::EmbeddedSignature, Id(3), &[])]);
        b.signature(2, "b", &[(20, NodeKind::EmbeddedSignature, Id(3), &[])]);

        let set = compile(&b.registry, &[Id(1), Id(2)]).unwrap();
        assert_eq!(set.graphs().count(), 3);
        // One compiled node for the shared module.
        assert_eq!(
            set.nodes()
                .filter(|n| matches!(n.kind, CompiledKind::Module { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_diamond_roots_and_leaves() {
        let mut b = Builder::new();
        let m1 = b.module("m1");
        let m2 = b.module("m2");
        let m3 = b.module("m3");
        let m4 = b.module("m4");
        // m1 -> m2, m1 -> m3, m2 -> m4, m3 -> m4.
        b.signature(
            1,
            "diamond",
            &[
                (10, NodeKind::Module, m1, &[11, 12]),
                (11, NodeKind::Module, m2, &[13]),
                (12, NodeKind::Module, m3, &[13]),
                (13, NodeKind::Module, m4, &[]),
            ],
        );

        let set = compile(&b.registry, &[Id(1)]).unwrap();
        let graph = set.graph(Id(1)).unwrap();
        assert_eq!(graph.roots, vec![Id(10)]);
        assert_eq!(graph.leaves, vec![Id(13)]);
        // No node links to itself and no duplicate edges anywhere.
        for node in set.nodes() {
            let mut seen = HashSet::new();
            for child in &node.children {
                assert_ne!(*child, node.id, "self loop on {}", node.id);
                assert!(seen.insert(*child), "duplicate edge {} -> {child}", node.id);
            }
        }
    }

    #[test]
    fn test_roots_match_between_scan_and_graph() {
        let mut b = Builder::new();
        let m1 = b.module("m1");
        let m2 = b.module("m2");
        b.signature(
            1,
            "two-roots",
            &[
                (10, NodeKind::Module, m1, &[]),
                (11, NodeKind::Module, m2, &[]),
            ],
        );
        let sig = b.registry.signature(Id(1)).unwrap();
        let scanned: Vec<Id> = roots_of(sig).iter().map(|n| n.id).collect();
        let set = compile(&b.registry, &[Id(1)]).unwrap();
        assert_eq!(scanned, set.graph(Id(1)).unwrap().roots);
    }
}
