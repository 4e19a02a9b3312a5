//! # dice-plugin
//!
//! SDK for writing DICE modules. A module is an executable the engine
//! launches with two environment variables: `DICE_PLUGIN_SOCKET`, the Unix
//! socket to connect to, and `DICE_MAGIC_COOKIE`, the cookie to echo in the
//! handshake. After the handshake the engine drives the module over framed
//! JSON messages; during a `Handle` call the module reaches back into the
//! engine through the advertised Adapter and Propagate sub-channels.
//!
//! ```no_run
//! use dice_plugin::{Adapter, Module, PluginError, Propagate, serve};
//! use dice_core::wire::WireEvent;
//! use dice_core::model::{Fingerprint, Host};
//!
//! struct Identify;
//!
//! impl Module for Identify {
//!     fn handle(
//!         &mut self,
//!         event: &WireEvent,
//!         _args: Option<&str>,
//!         adapter: &Adapter<'_>,
//!         propagate: &Propagate<'_>,
//!     ) -> Result<(), PluginError> {
//!         let source = adapter.get_source(event.id)?;
//!         let ids = adapter.add_hosts(vec![Host {
//!             ip: "203.0.113.7".into(),
//!             ..Host::default()
//!         }])?;
//!         adapter.add_fingerprints(vec![Fingerprint {
//!             host_id: ids[0],
//!             data: source.name.into_bytes(),
//!             ..Fingerprint::default()
//!         }])?;
//!         propagate.trigger()
//!     }
//! }
//!
//! fn main() {
//!     if let Err(err) = serve(Identify) {
//!         eprintln!("module failed: {err}");
//!         std::process::exit(1);
//!     }
//! }
//! ```

#![warn(clippy::all)]

use std::cell::RefCell;
use std::env;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream;

use dice_core::model::{Fingerprint, Host, Id, Label, Scan, Source};
use dice_core::wire::{
    AdapterRequest, AdapterResponse, CONTROL_BROKER, COOKIE_ENV, ControlRequest, ControlResponse,
    Frame, Handshake, HandshakeAck, PROTOCOL_VERSION, PropagateRequest, PropagateResponse,
    SOCKET_ENV, WireEvent, decode, encode, read_frame, write_frame,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// Failures on the plugin side of the protocol.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Required environment variable missing.
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The engine rejected the handshake.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// The engine-side adapter returned an error.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// The engine refused a propagation request.
    #[error("propagate error: {0}")]
    Propagate(String),

    /// Handler-level failure, reported back to the engine verbatim.
    #[error("{0}")]
    Handler(String),
}

impl From<dice_core::Error> for PluginError {
    fn from(err: dice_core::Error) -> Self {
        match err {
            dice_core::Error::Io(e) => Self::Io(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// A DICE module implementation.
pub trait Module {
    /// Property map reported to the engine at startup.
    fn properties(&self) -> serde_json::Value {
        serde_json::Value::Object(serde_json::Map::new())
    }

    /// Handles one event.
    fn handle(
        &mut self,
        event: &WireEvent,
        args: Option<&str>,
        adapter: &Adapter<'_>,
        propagate: &Propagate<'_>,
    ) -> Result<(), PluginError>;
}

/// The shared connection; clients borrow it per call.
struct Connection {
    stream: RefCell<UnixStream>,
}

impl Connection {
    fn send<T: Serialize>(&self, broker: u32, message: &T) -> Result<(), PluginError> {
        let payload = encode(message)?;
        write_frame(&mut *self.stream.borrow_mut(), broker, &payload)?;
        Ok(())
    }

    fn recv(&self) -> Result<Frame, PluginError> {
        Ok(read_frame(&mut *self.stream.borrow_mut())?)
    }

    /// One request/response exchange on a sub-channel. The engine serves
    /// sub-channel requests strictly in order, so the next frame on this
    /// broker is the reply.
    fn request<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        broker: u32,
        request: &Req,
    ) -> Result<Resp, PluginError> {
        self.send(broker, request)?;
        let frame = self.recv()?;
        if frame.broker_id != broker {
            return Err(PluginError::Protocol(format!(
                "reply on broker {} (want {broker})",
                frame.broker_id
            )));
        }
        Ok(decode(&frame.payload)?)
    }
}

/// Client for the engine's Adapter service, valid for one `Handle` call.
pub struct Adapter<'c> {
    conn: &'c Connection,
    broker: u32,
}

impl Adapter<'_> {
    fn call(&self, request: &AdapterRequest) -> Result<AdapterResponse, PluginError> {
        let response: AdapterResponse = self.conn.request(self.broker, request)?;
        if let AdapterResponse::Error { message } = response {
            return Err(PluginError::Adapter(message));
        }
        Ok(response)
    }

    pub fn get_host(&self, id: Id) -> Result<Host, PluginError> {
        match self.call(&AdapterRequest::GetHost { id })? {
            AdapterResponse::Host { host } => Ok(host),
            other => Err(unexpected("host", &other)),
        }
    }

    pub fn get_source(&self, id: Id) -> Result<Source, PluginError> {
        match self.call(&AdapterRequest::GetSource { id })? {
            AdapterResponse::Source { source } => Ok(source),
            other => Err(unexpected("source", &other)),
        }
    }

    pub fn get_scan(&self, id: Id) -> Result<Scan, PluginError> {
        match self.call(&AdapterRequest::GetScan { id })? {
            AdapterResponse::Scan { scan } => Ok(scan),
            other => Err(unexpected("scan", &other)),
        }
    }

    pub fn add_hosts(&self, hosts: Vec<Host>) -> Result<Vec<Id>, PluginError> {
        self.ids(&AdapterRequest::AddHosts { hosts })
    }

    pub fn add_fingerprints(&self, fingerprints: Vec<Fingerprint>) -> Result<Vec<Id>, PluginError> {
        self.ids(&AdapterRequest::AddFingerprints { fingerprints })
    }

    pub fn add_labels(&self, labels: Vec<Label>) -> Result<Vec<Id>, PluginError> {
        self.ids(&AdapterRequest::AddLabels { labels })
    }

    pub fn add_scans(&self, scans: Vec<Scan>) -> Result<Vec<Id>, PluginError> {
        self.ids(&AdapterRequest::AddScans { scans })
    }

    pub fn add_sources(&self, sources: Vec<Source>) -> Result<Vec<Id>, PluginError> {
        self.ids(&AdapterRequest::AddSources { sources })
    }

    pub fn query(&self, query: &str) -> Result<Vec<Host>, PluginError> {
        match self.call(&AdapterRequest::Query {
            query: query.to_string(),
        })? {
            AdapterResponse::Hosts { hosts } => Ok(hosts),
            other => Err(unexpected("hosts", &other)),
        }
    }

    fn ids(&self, request: &AdapterRequest) -> Result<Vec<Id>, PluginError> {
        match self.call(request)? {
            AdapterResponse::Ids { ids } => Ok(ids),
            other => Err(unexpected("ids", &other)),
        }
    }
}

fn unexpected(want: &str, got: &AdapterResponse) -> PluginError {
    PluginError::Protocol(format!("expected {want}, got {got:?}"))
}

/// Client for the engine's Propagate service, valid for one `Handle` call.
pub struct Propagate<'c> {
    conn: &'c Connection,
    broker: u32,
}

impl Propagate<'_> {
    /// Asks the engine to traverse this node's children.
    pub fn trigger(&self) -> Result<(), PluginError> {
        match self.conn.request(self.broker, &PropagateRequest::Trigger)? {
            PropagateResponse::Ack => Ok(()),
            PropagateResponse::Error { message } => Err(PluginError::Propagate(message)),
        }
    }
}

/// Connects, handshakes, and serves the module until the engine hangs up.
pub fn serve<M: Module>(module: M) -> Result<(), PluginError> {
    let socket = env::var(SOCKET_ENV).map_err(|_| PluginError::MissingEnv(SOCKET_ENV))?;
    let cookie = env::var(COOKIE_ENV).map_err(|_| PluginError::MissingEnv(COOKIE_ENV))?;
    let stream = UnixStream::connect(&socket)?;
    serve_stream(stream, &cookie, module)
}

/// Serves a module on an already-connected stream. [`serve`] wires this up
/// from the environment; tests drive it over a socketpair.
pub fn serve_stream<M: Module>(
    stream: UnixStream,
    cookie: &str,
    mut module: M,
) -> Result<(), PluginError> {
    let conn = Connection {
        stream: RefCell::new(stream),
    };

    conn.send(
        CONTROL_BROKER,
        &Handshake {
            magic_cookie: cookie.to_string(),
            protocol_version: PROTOCOL_VERSION,
        },
    )?;
    let ack_frame = conn.recv()?;
    let ack: HandshakeAck = decode(&ack_frame.payload)?;
    if ack.protocol_version != PROTOCOL_VERSION {
        return Err(PluginError::Handshake(format!(
            "engine speaks protocol {}, this module speaks {PROTOCOL_VERSION}",
            ack.protocol_version
        )));
    }
    debug!("handshake complete");

    loop {
        let frame = match conn.recv() {
            Ok(frame) => frame,
            // The engine closing the connection is a normal exit.
            Err(PluginError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        };
        if frame.broker_id != CONTROL_BROKER {
            return Err(PluginError::Protocol(format!(
                "request on unexpected broker {}",
                frame.broker_id
            )));
        }
        match decode::<ControlRequest>(&frame.payload)? {
            ControlRequest::Properties => {
                conn.send(
                    CONTROL_BROKER,
                    &ControlResponse::Properties {
                        fields: module.properties(),
                    },
                )?;
            }
            ControlRequest::Handle {
                adapter_broker_id,
                propagate_broker_id,
                event,
                args,
            } => {
                let adapter = Adapter {
                    conn: &conn,
                    broker: adapter_broker_id,
                };
                let propagate = Propagate {
                    conn: &conn,
                    broker: propagate_broker_id,
                };
                let response =
                    match module.handle(&event, args.as_deref(), &adapter, &propagate) {
                        Ok(()) => ControlResponse::Handled,
                        Err(err) => ControlResponse::Error {
                            message: err.to_string(),
                        },
                    };
                conn.send(CONTROL_BROKER, &response)?;
            }
            ControlRequest::Shutdown => {
                debug!("shutdown requested");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dice_core::event::EventKind;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::thread;

    /// Plays the engine side of the wire on one half of a socketpair.
    fn engine_side<F>(script: F) -> UnixStream
    where
        F: FnOnce(UnixStream) + Send + 'static,
    {
        let (ours, theirs) = UnixStream::pair().unwrap();
        thread::spawn(move || script(theirs));
        ours
    }

    struct Echo;

    impl Module for Echo {
        fn properties(&self) -> serde_json::Value {
            serde_json::json!({"name": "echo"})
        }

        fn handle(
            &mut self,
            _event: &WireEvent,
            _args: Option<&str>,
            _adapter: &Adapter<'_>,
            propagate: &Propagate<'_>,
        ) -> Result<(), PluginError> {
            propagate.trigger()
        }
    }

    #[test]
    fn test_serve_handshake_and_handle() {
        let plugin_stream = engine_side(|mut stream| {
            // Expect the handshake.
            let hello: Handshake = decode(&read_frame(&mut stream).unwrap().payload).unwrap();
            assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
            let ack = encode(&HandshakeAck {
                protocol_version: PROTOCOL_VERSION,
            })
            .unwrap();
            write_frame(&mut stream, CONTROL_BROKER, &ack).unwrap();

            // Issue a handle call with brokers 4/5.
            let request = encode(&ControlRequest::Handle {
                adapter_broker_id: 4,
                propagate_broker_id: 5,
                event: WireEvent {
                    id: Id(1),
                    kind: EventKind::Source,
                },
                args: None,
            })
            .unwrap();
            write_frame(&mut stream, CONTROL_BROKER, &request).unwrap();

            // The module triggers propagation; ack it.
            let frame = read_frame(&mut stream).unwrap();
            assert_eq!(frame.broker_id, 5);
            let ack = encode(&PropagateResponse::Ack).unwrap();
            write_frame(&mut stream, 5, &ack).unwrap();

            // Expect the handled reply, then hang up.
            let frame = read_frame(&mut stream).unwrap();
            assert_eq!(frame.broker_id, CONTROL_BROKER);
            let reply: ControlResponse = decode(&frame.payload).unwrap();
            assert_eq!(reply, ControlResponse::Handled);
            stream.flush().unwrap();
        });

        serve_stream(plugin_stream, "test", Echo).unwrap();
    }

    #[test]
    fn test_shutdown_request_exits_cleanly() {
        let plugin_stream = engine_side(|mut stream| {
            let _hello = read_frame(&mut stream).unwrap();
            let ack = encode(&HandshakeAck {
                protocol_version: PROTOCOL_VERSION,
            })
            .unwrap();
            write_frame(&mut stream, CONTROL_BROKER, &ack).unwrap();
            let shutdown = encode(&ControlRequest::Shutdown).unwrap();
            write_frame(&mut stream, CONTROL_BROKER, &shutdown).unwrap();
        });

        serve_stream(plugin_stream, "test", Echo).unwrap();
    }

    #[test]
    fn test_handler_error_reported() {
        struct Failing;
        impl Module for Failing {
            fn handle(
                &mut self,
                _event: &WireEvent,
                _args: Option<&str>,
                _adapter: &Adapter<'_>,
                _propagate: &Propagate<'_>,
            ) -> Result<(), PluginError> {
                Err(PluginError::Handler("no banner found".to_string()))
            }
        }

        let plugin_stream = engine_side(|mut stream| {
            let _hello = read_frame(&mut stream).unwrap();
            let ack = encode(&HandshakeAck {
                protocol_version: PROTOCOL_VERSION,
            })
            .unwrap();
            write_frame(&mut stream, CONTROL_BROKER, &ack).unwrap();

            let request = encode(&ControlRequest::Handle {
                adapter_broker_id: 2,
                propagate_broker_id: 3,
                event: WireEvent {
                    id: Id(9),
                    kind: EventKind::Host,
                },
                args: None,
            })
            .unwrap();
            write_frame(&mut stream, CONTROL_BROKER, &request).unwrap();

            let frame = read_frame(&mut stream).unwrap();
            let reply: ControlResponse = decode(&frame.payload).unwrap();
            assert_eq!(
                reply,
                ControlResponse::Error {
                    message: "no banner found".to_string()
                }
            );
        });

        serve_stream(plugin_stream, "test", Failing).unwrap();
    }
}
