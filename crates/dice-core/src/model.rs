//! Domain model shared across the engine.
//!
//! Persistent entities carry an opaque monotonically-assigned [`Id`] handed
//! out by the stores. Names are unique within their kind (signature names
//! among signatures, module names among modules).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Opaque identifier for persistent entities.
///
/// Ids are assigned monotonically by the owning store and are never reused
/// within a database. `Id(0)` is reserved: as a signature id it denotes the
/// synthetic module-only signature, and as a node id it is the engine
/// sentinel on events seeded by the runner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Id(pub u64);

impl Id {
    /// The reserved zero id.
    pub const ZERO: Self = Self(0);

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Id {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl ToSql for Id {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        #[allow(clippy::cast_possible_wrap)]
        Ok(ToSqlOutput::from(self.0 as i64))
    }
}

impl FromSql for Id {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = i64::column_result(value)?;
        u64::try_from(raw)
            .map(Id)
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Component kind a signature is compiled into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// Consumes sources, produces hosts and fingerprints.
    Identifier,
    /// Consumes fingerprints and hosts, produces labels and scan requests.
    Classifier,
    /// Consumes scan requests, produces new sources.
    Scanner,
}

impl ComponentKind {
    /// Parses the DSL spelling of a component kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "identifier" => Some(Self::Identifier),
            "classifier" => Some(Self::Classifier),
            "scanner" => Some(Self::Scanner),
            _ => None,
        }
    }

    /// The DSL spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Identifier => "identifier",
            Self::Classifier => "classifier",
            Self::Scanner => "scanner",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named processing pipeline: a DAG of module and embedded-signature nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Store-assigned id. `Id::ZERO` for the synthetic module-only signature.
    pub id: Id,
    /// Unique signature name (filename stem unless a `name` property is set).
    pub name: String,
    /// Which component this signature belongs to.
    pub component: ComponentKind,
    /// Owned nodes in authored order.
    pub nodes: Vec<Node>,
}

impl Signature {
    /// Looks up an owned node by id.
    #[must_use]
    pub fn node(&self, id: Id) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// What a node points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// `object_id` resolves to a [`Module`].
    Module,
    /// `object_id` resolves to another [`Signature`].
    EmbeddedSignature,
}

impl NodeKind {
    /// The DSL keyword for this kind.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Module => "mod",
            Self::EmbeddedSignature => "sig",
        }
    }
}

/// A vertex inside exactly one signature.
///
/// `children` is the authored structure only; the compiled child lists built
/// by the graph compiler are runtime state and are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: Id,
    pub signature_id: Id,
    pub kind: NodeKind,
    /// Module id or signature id depending on `kind`.
    pub object_id: Id,
    /// Authored children, in declaration order.
    pub children: Vec<Id>,
    /// The name the author gave this node, kept for diagnostics and
    /// re-resolution.
    pub name: String,
    /// Propagation strategy selected by the author.
    pub strategy: Strategy,
    /// Opaque per-node arguments forwarded to the module on every call.
    pub args: Option<String>,
}

/// Per-node rule governing child traversal and hook close-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Process the event, mark the hook done, propagate on success.
    #[default]
    Default,
    /// Process the event; propagate only on a later Label event for the same
    /// object, and mark the hook done then.
    Gate,
    /// Process the event, propagate, keep the hook open.
    Hold,
    /// Do not process; propagate immediately.
    None,
}

impl Strategy {
    /// Parses the DSL spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(Self::Default),
            "gate" => Some(Self::Gate),
            "hold" => Some(Self::Hold),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// The DSL spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Gate => "gate",
            Self::Hold => "hold",
            Self::None => "none",
        }
    }

    /// Whether the hook recorded after processing is already done, i.e. the
    /// node stops listening to further events on the object.
    #[must_use]
    pub const fn unsubscribes_after(self) -> bool {
        matches!(self, Self::Default | Self::None)
    }
}

/// An out-of-process plugin registered with the engine.
///
/// Immutable once registered; removed explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub id: Id,
    /// Unique module name (executable filename stem).
    pub name: String,
    /// Path to the plugin executable.
    pub location: String,
    /// SHA-256 digest of the executable, hex-encoded.
    pub hash: String,
    pub tags: Vec<String>,
    /// Opaque property map reported by the plugin.
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// A scanned or declared target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Host {
    pub id: Id,
    pub ip: String,
    pub domain: String,
    /// Back-references, hydrated on fetch.
    pub fingerprints: Vec<Fingerprint>,
    pub labels: Vec<Label>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Raw module output attached to a host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fingerprint {
    pub id: Id,
    pub host_id: Id,
    pub module_id: Id,
    /// Opaque payload produced by the module.
    pub data: Vec<u8>,
    /// Digest of `data`, hex-encoded.
    pub hash: String,
    pub service: String,
    pub protocol: String,
    pub port: u16,
    pub created_at: Option<DateTime<Utc>>,
}

/// A classification attached to a host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Label {
    pub id: Id,
    pub host_id: Id,
    pub short: String,
    pub long: String,
    pub description: String,
    pub mitigation: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// A scan request produced by a classifier for the scanner component.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Scan {
    pub id: Id,
    pub module_id: Id,
    pub targets: Vec<String>,
    /// Opaque scanner arguments.
    pub args: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Where a source's records come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Stdin,
    Args,
}

impl SourceKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Self::File),
            "stdin" => Some(Self::Stdin),
            "args" => Some(Self::Args),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Stdin => "stdin",
            Self::Args => "args",
        }
    }
}

/// A description of input for the identifier component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: Id,
    pub name: String,
    pub kind: SourceKind,
    /// Data format, e.g. `json`, `csv`, `txt`.
    pub format: String,
    /// File path or stream description; empty for `Args` sources.
    pub location: String,
    /// JSON-encoded argument list for `Args` sources.
    pub args: Option<String>,
}

impl Source {
    /// Builds an `Args` source wrapping positional CLI targets.
    pub fn from_targets(targets: &[String]) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Id::ZERO,
            name: "targets".to_string(),
            kind: SourceKind::Args,
            format: "json".to_string(),
            location: String::new(),
            args: Some(serde_json::to_string(targets)?),
        })
    }
}

/// A directory registered as a reconnaissance project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: Id,
    pub name: String,
    pub path: String,
}

/// A named run area inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Study {
    pub id: Id,
    pub project_id: Id,
    pub name: String,
    pub path: String,
}

/// A record that a node has taken an interest in an object.
///
/// The `(object_id, node_id)` pair is unique. `done` hooks no longer receive
/// events; an object whose hooks are all done is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    pub id: Id,
    pub object_id: Id,
    pub node_id: Id,
    pub done: bool,
}
