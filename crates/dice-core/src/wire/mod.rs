//! Plugin wire protocol: framing plus message schema.

pub mod frame;
pub mod messages;

pub use frame::{CONTROL_BROKER, Frame, MAX_FRAME_SIZE, read_frame, write_frame};
pub use messages::{
    AdapterRequest, AdapterResponse, COOKIE_ENV, COOKIE_VALUE, ControlRequest, ControlResponse,
    Handshake, HandshakeAck, PROTOCOL_VERSION, PropagateRequest, PropagateResponse, SOCKET_ENV,
    WireEvent, decode, encode,
};
