//! Error types shared across the engine.

use thiserror::Error;

use crate::model::Id;
use crate::parser::ParseError;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between staging and teardown.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The signature DSL was malformed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Graph compilation found a cycle.
    #[error("signature '{signature}' contains a cycle{}", node.map(|n| format!(" at node {n}")).unwrap_or_default())]
    Cycle {
        signature: String,
        node: Option<Id>,
    },

    /// A node names a parent, module, or signature that is not staged.
    #[error("unresolved reference '{name}' in signature '{signature}'")]
    UnresolvedReference { signature: String, name: String },

    /// Signature or module name collision during staging.
    #[error("duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    /// A persistence operation failed.
    #[error("store operation '{op}' failed: {message}")]
    Store { op: &'static str, message: String },

    /// Launching a plugin process failed.
    #[error("module '{module}' failed to start: {message}")]
    PluginStartup { module: String, message: String },

    /// The plugin is dead or busy; dispatches to it fail fast.
    #[error("module '{module}' unavailable: {reason}")]
    PluginUnavailable { module: String, reason: String },

    /// A plugin call exceeded its deadline and the process was killed.
    #[error("module '{module}' timed out after {seconds}s")]
    PluginTimeout { module: String, seconds: u64 },

    /// The plugin did not complete the magic-cookie handshake.
    #[error("module '{module}' handshake failed: {message}")]
    PluginHandshake { module: String, message: String },

    /// The module's handler reported a failure. The plugin process itself is
    /// still healthy.
    #[error("module '{module}' failed: {message}")]
    Module { module: String, message: String },

    /// A subscriber returned an error while processing an emitted event.
    #[error("event delivery failed: {0}")]
    BusDelivery(Box<Error>),

    /// Entity lookup miss, by id or by name.
    #[error("{kind} {what} not found")]
    NotFound { kind: &'static str, what: String },

    /// I/O outside the stores.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-level protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Shorthand for store failures.
    pub fn store(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Store {
            op,
            message: err.to_string(),
        }
    }

    /// Shorthand for lookup misses.
    pub fn not_found(kind: &'static str, what: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            what: what.to_string(),
        }
    }

    /// Whether the error originated at the plugin boundary.
    #[must_use]
    pub const fn is_plugin(&self) -> bool {
        matches!(
            self,
            Self::PluginStartup { .. }
                | Self::PluginUnavailable { .. }
                | Self::PluginTimeout { .. }
                | Self::PluginHandshake { .. }
                | Self::Module { .. }
        )
    }

    /// Process exit code for the CLI: 1 user/config, 2 I/O or database,
    /// 3 plugin.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BusDelivery(inner) => inner.exit_code(),
            e if e.is_plugin() => 3,
            Self::Store { .. } | Self::Io(_) | Self::Protocol(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display() {
        let err = Error::Cycle {
            signature: "outer".to_string(),
            node: None,
        };
        assert_eq!(err.to_string(), "signature 'outer' contains a cycle");

        let err = Error::Cycle {
            signature: "outer".to_string(),
            node: Some(Id(9)),
        };
        assert_eq!(
            err.to_string(),
            "signature 'outer' contains a cycle at node 9"
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            Error::DuplicateName {
                kind: "signature",
                name: "x".into()
            }
            .exit_code(),
            1
        );
        assert_eq!(Error::store("add_host", "disk full").exit_code(), 2);
        assert_eq!(
            Error::PluginTimeout {
                module: "banner".into(),
                seconds: 30
            }
            .exit_code(),
            3
        );
        let wrapped = Error::BusDelivery(Box::new(Error::PluginUnavailable {
            module: "banner".into(),
            reason: "dead".into(),
        }));
        assert_eq!(wrapped.exit_code(), 3);
    }

    #[test]
    fn test_is_plugin() {
        assert!(Error::PluginHandshake {
            module: "m".into(),
            message: "bad cookie".into()
        }
        .is_plugin());
        assert!(!Error::store("get_host", "locked").is_plugin());
    }
}
