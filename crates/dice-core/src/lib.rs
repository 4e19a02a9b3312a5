//! # dice-core
//!
//! Core library for DICE, a scanning-and-classification engine for network
//! reconnaissance. Operators describe multi-stage analyses as *signatures*:
//! declarative DAGs of out-of-process modules. This crate holds everything
//! that is independent of persistence and process management:
//!
//! - the signature DSL parser and its normalising printer
//! - the staging registry and the graph compiler
//! - components, the node runtime, and the event bus
//! - the plugin wire protocol (framing and message schema)
//! - standard-path and project configuration
//!
//! The sqlite stores, the module host, and the engine runner live in
//! `dice-engine`; the plugin-side SDK in `dice-plugin`.

#![warn(clippy::all)]

pub mod bus;
pub mod component;
pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod model;
pub mod parser;
pub mod ports;
pub mod registry;
pub mod wire;

pub use error::{Error, Result};
pub use event::{ENGINE_NODE, Event, EventKind};
pub use model::{
    ComponentKind, Fingerprint, Hook, Host, Id, Label, Module, Node, NodeKind, Project, Scan,
    Signature, Source, SourceKind, Strategy, Study,
};
