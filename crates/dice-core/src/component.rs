//! Components and the per-node dispatch runtime.
//!
//! A component is the dispatcher for one component kind. It owns the entry
//! points of every signature compiled for that kind and routes each incoming
//! event through the hook filter, then the target filter, then the default
//! entry set. Module nodes invoke their plugin and manage hook close-out;
//! embedded nodes forward to their graph's roots.

use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::graph::{CompiledKind, CompiledNode, GraphSet};
use crate::model::{ComponentKind, Id, Strategy};
use crate::ports::{CosmosView, ModuleInvoker};

/// Event kinds a component kind subscribes to.
///
/// The classifier also receives Label events so gate-strategy nodes can
/// observe label creation on objects they hold hooks on.
#[must_use]
pub const fn subscriptions(kind: ComponentKind) -> &'static [EventKind] {
    match kind {
        ComponentKind::Identifier => &[EventKind::Source],
        ComponentKind::Classifier => &[EventKind::Fingerprint, EventKind::Host, EventKind::Label],
        ComponentKind::Scanner => &[EventKind::Scan],
    }
}

/// One named entry group of a component: a signature's compiled roots, or
/// the bare-module nodes of the synthetic signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Signature name matched by the event target filter.
    pub name: String,
    pub roots: Vec<Id>,
}

/// A compiled dispatcher for one component kind.
pub struct Component {
    kind: ComponentKind,
    /// Entry-point groups in staging order.
    entries: Vec<Entry>,
    set: Rc<GraphSet>,
    cosmos: Rc<dyn CosmosView>,
    invoker: Rc<dyn ModuleInvoker>,
}

impl Component {
    pub fn new(
        kind: ComponentKind,
        entries: Vec<Entry>,
        set: Rc<GraphSet>,
        cosmos: Rc<dyn CosmosView>,
        invoker: Rc<dyn ModuleInvoker>,
    ) -> Self {
        Self {
            kind,
            entries,
            set,
            cosmos,
            invoker,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Subscription set for the bus.
    #[must_use]
    pub const fn events(&self) -> &'static [EventKind] {
        subscriptions(self.kind)
    }

    /// Entry-point groups, in staging order.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Routes one event: pick the nodes, dispatch sequentially, stop at the
    /// first error.
    pub fn update(&self, event: &Event) -> Result<()> {
        let nodes = self.pick(event)?;
        debug!(
            component = %self.kind,
            kind = %event.kind,
            object = %event.object_id,
            nodes = nodes.len(),
            "dispatch"
        );
        for id in nodes {
            self.dispatch(id, event, false)?;
        }
        Ok(())
    }

    /// The dispatch-node selector.
    ///
    /// Hooks win when the object has any: only open hooks whose node still
    /// exists in the run's node table are visited, and an object whose hooks
    /// are all done is finished. Otherwise the target filter applies, and
    /// failing that the full entry set. All three branches are ordered
    /// stably by node id.
    fn pick(&self, event: &Event) -> Result<Vec<Id>> {
        let hooks = self.cosmos.hooks_for(event.object_id)?;
        if !hooks.is_empty() {
            let mut ids: Vec<Id> = hooks
                .iter()
                .filter(|h| !h.done)
                .map(|h| h.node_id)
                .filter(|id| self.set.node(*id).is_some())
                .collect();
            ids.sort_unstable();
            ids.dedup();
            trace!(object = %event.object_id, hooked = ids.len(), "hook filter");
            return Ok(ids);
        }

        let mut ids: Vec<Id> = self
            .entries
            .iter()
            .filter(|e| event.targets.is_empty() || event.targets.iter().any(|t| *t == e.name))
            .flat_map(|e| e.roots.iter().copied())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// `propagated` marks events arriving through a parent's propagation
    /// rather than straight off the bus.
    fn dispatch(&self, node_id: Id, event: &Event, propagated: bool) -> Result<()> {
        let node = self
            .set
            .node(node_id)
            .ok_or_else(|| Error::not_found("node", node_id))?;
        match &node.kind {
            CompiledKind::Module {
                module_id,
                module_name,
                strategy,
                args,
            } => self.module_update(
                node,
                *module_id,
                module_name,
                *strategy,
                args.as_deref(),
                event,
                propagated,
            ),
            CompiledKind::Embedded { signature_id } => {
                let roots = self
                    .set
                    .graph(*signature_id)
                    .map(|g| g.roots.clone())
                    .unwrap_or_default();
                for root in roots {
                    self.dispatch(root, event, propagated)?;
                }
                Ok(())
            }
        }
    }

    /// The module-node runtime of one event.
    #[allow(clippy::too_many_arguments)]
    fn module_update(
        &self,
        node: &CompiledNode,
        module_id: Id,
        module_name: &str,
        strategy: Strategy,
        args: Option<&str>,
        event: &Event,
        propagated: bool,
    ) -> Result<()> {
        // Straight off the bus, a Label event is only meaningful to gate
        // nodes: the label arriving is the signal to open the gate. An event
        // handed down by a parent's propagation is processed like any other.
        if event.kind == EventKind::Label && !propagated {
            if strategy == Strategy::Gate {
                trace!(node = %node.id, "gate opened by label");
                self.propagate(node, event)?;
                self.cosmos.record_hook(event.object_id, node.id, true)?;
            }
            return Ok(());
        }

        // A module that crashed earlier in the run fails fast; the rest of
        // the entry set still runs.
        if self.invoker.is_dead(module_id) {
            warn!(node = %node.id, module = module_name, "skipping dead module");
            return Ok(());
        }

        if strategy == Strategy::None {
            self.cosmos
                .record_hook(event.object_id, node.id, strategy.unsubscribes_after())?;
            return self.propagate(node, event);
        }

        // Existence check before crossing the plugin boundary. Host,
        // fingerprint, and label events all route by the affected host.
        match event.kind {
            EventKind::Source => {
                self.cosmos.get_source(event.object_id)?;
            }
            EventKind::Scan => {
                self.cosmos.get_scan(event.object_id)?;
            }
            EventKind::Host | EventKind::Fingerprint | EventKind::Label => {
                self.cosmos.get_host(event.object_id)?;
            }
        }

        let adapter = self.cosmos.adapter_for(node.id);
        let mut on_trigger = || match strategy {
            Strategy::Default | Strategy::Hold => self.propagate(node, event),
            // The gate defers propagation until a label shows up.
            Strategy::Gate => Ok(()),
            Strategy::None => unreachable!("none nodes never reach the plugin"),
        };
        trace!(node = %node.id, module = module_name, "invoke");
        self.invoker
            .invoke(module_id, event, args, adapter.as_ref(), &mut on_trigger)?;

        self.cosmos
            .record_hook(event.object_id, node.id, strategy.unsubscribes_after())
    }

    /// Invokes children in insertion order with the same event.
    fn propagate(&self, node: &CompiledNode, event: &Event) -> Result<()> {
        for &child in &node.children {
            self.dispatch(child, event, true)?;
        }
        Ok(())
    }
}
