//! Events flowing over the bus.
//!
//! Every cosmos write produces exactly one event per persisted entity.
//! Events are transient: they live on the bus for the duration of a dispatch
//! and are not required to survive a restart.

use serde::{Deserialize, Serialize};

use crate::model::Id;

/// Node id used as the originator of events seeded by the engine runner.
pub const ENGINE_NODE: Id = Id::ZERO;

/// The kind of write an event announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Source,
    Fingerprint,
    Host,
    Label,
    Scan,
}

impl EventKind {
    /// The wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Fingerprint => "fingerprint",
            Self::Host => "host",
            Self::Label => "label",
            Self::Scan => "scan",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routed notification.
///
/// `object_id` points at the object dispatch is routed by: the affected host
/// for `Host`/`Fingerprint`/`Label` events, the entity itself for `Source`
/// and `Scan` events. Hooks are recorded against that same id, which is what
/// narrows follow-up traffic to the interested nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Originating node, or [`ENGINE_NODE`] for runner-seeded events.
    pub node_id: Id,
    pub kind: EventKind,
    pub object_id: Id,
    /// Optional signature-name filter; only entry points of the named
    /// signatures are dispatched when no hooks exist for `object_id`.
    pub targets: Vec<String>,
}

impl Event {
    /// An event with no target filter.
    #[must_use]
    pub const fn new(node_id: Id, kind: EventKind, object_id: Id) -> Self {
        Self {
            node_id,
            kind,
            object_id,
            targets: Vec::new(),
        }
    }

    /// Restricts dispatch to the named signatures' entry points.
    #[must_use]
    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }
}
