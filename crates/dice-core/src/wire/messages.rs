//! Plugin protocol messages.
//!
//! JSON payloads inside the frames of [`super::frame`]. Field names are part
//! of the wire contract and stable across releases; new fields must be
//! additive and optional.
//!
//! The engine is the requester on the control channel (`Properties`,
//! `Handle`, `Shutdown`). During a `Handle` call the plugin is the requester
//! on the two sub-channels advertised in the request: the Adapter channel
//! for cosmos access and the Propagate channel to ask for child propagation.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::{Fingerprint, Host, Id, Label, Scan, Source};

/// Fixed protocol version exchanged in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable naming the engine's listening socket.
pub const SOCKET_ENV: &str = "DICE_PLUGIN_SOCKET";

/// Environment variable carrying the magic cookie.
pub const COOKIE_ENV: &str = "DICE_MAGIC_COOKIE";

/// The cookie value a well-behaved plugin echoes back.
pub const COOKIE_VALUE: &str = "d1ce-module";

/// First frame a plugin sends after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub magic_cookie: String,
    pub protocol_version: u32,
}

/// Engine's reply completing the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub protocol_version: u32,
}

/// The event as a module sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    pub id: Id,
    pub kind: EventKind,
}

/// Engine → plugin, control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Ask the module for its property map.
    Properties,
    /// Handle one event. The two broker ids name the sub-channels the
    /// engine is accepting for the duration of this call.
    Handle {
        adapter_broker_id: u32,
        propagate_broker_id: u32,
        event: WireEvent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<String>,
    },
    /// Ask the module process to exit.
    Shutdown,
}

/// Plugin → engine, control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Properties { fields: serde_json::Value },
    Handled,
    Error { message: String },
}

/// Plugin → engine, adapter sub-channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterRequest {
    GetHost { id: Id },
    GetSource { id: Id },
    GetScan { id: Id },
    AddHosts { hosts: Vec<Host> },
    AddFingerprints { fingerprints: Vec<Fingerprint> },
    AddLabels { labels: Vec<Label> },
    AddScans { scans: Vec<Scan> },
    AddSources { sources: Vec<Source> },
    Query { query: String },
}

/// Engine → plugin, adapter sub-channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterResponse {
    Host { host: Host },
    Source { source: Source },
    Scan { scan: Scan },
    /// Ids assigned by an `Add*` request, in input order.
    Ids { ids: Vec<Id> },
    Hosts { hosts: Vec<Host> },
    Error { message: String },
}

/// Plugin → engine, propagate sub-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropagateRequest {
    Trigger,
}

/// Engine → plugin, propagate sub-channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropagateResponse {
    Ack,
    Error { message: String },
}

/// Serializes a message for framing.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| Error::Protocol(format!("encode failed: {e}")))
}

/// Deserializes a framed payload.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| Error::Protocol(format!("decode failed: {e}")))
}
