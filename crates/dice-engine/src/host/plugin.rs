//! One plugin process and its connection.
//!
//! The engine listens on a per-plugin Unix socket, exports the socket path
//! and magic cookie in the child's environment, and spawns the module
//! executable. The plugin's first frame must be a matching handshake; the
//! engine then fetches its property map once and keeps the connection for
//! the run.
//!
//! `handle` drives one `Handle` call: it advertises two fresh broker ids,
//! then serves the plugin's Adapter and Propagate requests until the control
//! channel carries the reply. Both sub-channels are gone when it returns.

use std::io::ErrorKind;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use dice_core::error::{Error, Result};
use dice_core::event::Event;
use dice_core::ports::ModuleAdapter;
use dice_core::model::Module;
use dice_core::wire::{
    AdapterRequest, AdapterResponse, CONTROL_BROKER, COOKIE_ENV, COOKIE_VALUE, ControlRequest,
    ControlResponse, Frame, Handshake, HandshakeAck, PROTOCOL_VERSION, PropagateRequest,
    PropagateResponse, SOCKET_ENV, WireEvent, decode, encode, read_frame, write_frame,
};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// How long to poll for the plugin's connection and handshake.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A launched plugin with an established connection.
pub struct PluginHandle {
    module: Module,
    child: Child,
    stream: UnixStream,
    socket_path: PathBuf,
    properties: serde_json::Value,
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("module", &self.module)
            .field("socket_path", &self.socket_path)
            .field("properties", &self.properties)
            .finish()
    }
}

impl PluginHandle {
    /// Spawns the module executable and completes the handshake.
    ///
    /// # Errors
    ///
    /// [`Error::PluginStartup`] when the process cannot be spawned or never
    /// connects, [`Error::PluginHandshake`] when the cookie or protocol
    /// version is wrong. In both cases the child is terminated.
    pub fn launch(module: &Module, socket_dir: &Path, startup: Duration) -> Result<Self> {
        std::fs::create_dir_all(socket_dir)?;
        let socket_path = socket_dir.join(format!(
            "module-{}-{}.sock",
            module.id,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path).map_err(|e| Error::PluginStartup {
            module: module.name.clone(),
            message: format!("bind {}: {e}", socket_path.display()),
        })?;
        listener.set_nonblocking(true)?;

        let child = Command::new(&module.location)
            .env(SOCKET_ENV, &socket_path)
            .env(COOKIE_ENV, COOKIE_VALUE)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| Error::PluginStartup {
                module: module.name.clone(),
                message: format!("spawn {}: {e}", module.location),
            })?;

        let mut handle = match Self::establish(module, child, &listener, &socket_path, startup) {
            Ok(handle) => handle,
            Err(err) => {
                let _ = std::fs::remove_file(&socket_path);
                return Err(err);
            }
        };
        // The listener is single-use; the socket file can go away now.
        drop(listener);
        let _ = std::fs::remove_file(&handle.socket_path);

        if let Err(err) = handle.fetch_properties(startup) {
            handle.kill();
            return Err(err);
        }
        debug!(module = %handle.module.name, pid = handle.child.id(), "plugin up");
        Ok(handle)
    }

    /// Accepts the connection and verifies the handshake. Split out so the
    /// protocol can be exercised against a stand-in peer in tests.
    pub fn establish(
        module: &Module,
        mut child: Child,
        listener: &UnixListener,
        socket_path: &Path,
        startup: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + startup;
        let stream = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(Error::PluginStartup {
                            module: module.name.clone(),
                            message: format!("exited during startup: {status}"),
                        });
                    }
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        return Err(Error::PluginStartup {
                            module: module.name.clone(),
                            message: "never connected".to_string(),
                        });
                    }
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    let _ = child.kill();
                    return Err(Error::PluginStartup {
                        module: module.name.clone(),
                        message: format!("accept: {e}"),
                    });
                }
            }
        };
        stream.set_nonblocking(false)?;

        let mut handle = Self {
            module: module.clone(),
            child,
            stream,
            socket_path: socket_path.to_path_buf(),
            properties: serde_json::Value::Null,
        };
        if let Err(err) = handle.shake_hands(startup) {
            let _ = handle.child.kill();
            return Err(err);
        }
        Ok(handle)
    }

    fn shake_hands(&mut self, timeout: Duration) -> Result<()> {
        let fail = |message: String| Error::PluginHandshake {
            module: self.module.name.clone(),
            message,
        };

        self.stream.set_read_timeout(Some(timeout))?;
        let frame = read_frame(&mut self.stream).map_err(|e| fail(format!("no hello: {e}")))?;
        if frame.broker_id != CONTROL_BROKER {
            return Err(fail(format!("hello on broker {}", frame.broker_id)));
        }
        let hello: Handshake =
            decode(&frame.payload).map_err(|e| fail(format!("bad hello: {e}")))?;
        if hello.magic_cookie != COOKIE_VALUE {
            return Err(fail("wrong magic cookie".to_string()));
        }
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(fail(format!(
                "protocol version {} (want {PROTOCOL_VERSION})",
                hello.protocol_version
            )));
        }
        let ack = encode(&HandshakeAck {
            protocol_version: PROTOCOL_VERSION,
        })?;
        write_frame(&mut self.stream, CONTROL_BROKER, &ack)?;
        Ok(())
    }

    fn fetch_properties(&mut self, timeout: Duration) -> Result<()> {
        let request = encode(&ControlRequest::Properties)?;
        write_frame(&mut self.stream, CONTROL_BROKER, &request)?;
        self.stream.set_read_timeout(Some(timeout))?;
        let frame = read_frame(&mut self.stream)?;
        match decode::<ControlResponse>(&frame.payload)? {
            ControlResponse::Properties { fields } => {
                self.properties = fields;
                Ok(())
            }
            other => Err(Error::Protocol(format!(
                "expected properties, got {other:?}"
            ))),
        }
    }

    /// The property map reported at startup.
    #[must_use]
    pub const fn properties(&self) -> &serde_json::Value {
        &self.properties
    }

    #[must_use]
    pub fn module_name(&self) -> &str {
        &self.module.name
    }

    /// Drives one `Handle` call to completion.
    ///
    /// On any transport or protocol failure the child is killed before the
    /// error is returned, so a caller can decide live-vs-dead by asking
    /// [`Self::is_alive`]. Errors raised by engine-side dispatch (a failed
    /// propagation) and by the module's own handler leave the process
    /// running.
    pub fn handle(
        &mut self,
        event: &Event,
        args: Option<&str>,
        adapter: &dyn ModuleAdapter,
        on_trigger: &mut dyn FnMut() -> Result<()>,
        adapter_broker: u32,
        propagate_broker: u32,
        deadline: Duration,
    ) -> Result<()> {
        let request = encode(&ControlRequest::Handle {
            adapter_broker_id: adapter_broker,
            propagate_broker_id: propagate_broker,
            event: WireEvent {
                id: event.object_id,
                kind: event.kind,
            },
            args: args.map(str::to_string),
        })?;
        self.send(CONTROL_BROKER, &request)?;

        let until = Instant::now() + deadline;
        // An engine-side dispatch failure during propagation outranks
        // whatever the plugin replies.
        let mut dispatch_error: Option<Error> = None;

        loop {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timeout_error(deadline));
            }
            self.stream.set_read_timeout(Some(remaining))?;
            let frame = match read_frame(&mut self.stream) {
                Ok(frame) => frame,
                Err(Error::Io(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    return Err(self.timeout_error(deadline));
                }
                Err(err) => return Err(self.connection_error(err)),
            };

            if frame.broker_id == adapter_broker {
                self.serve_adapter(&frame, adapter, adapter_broker)?;
            } else if frame.broker_id == propagate_broker {
                if let Err(err) = self.check(decode::<PropagateRequest>(&frame.payload)) {
                    return Err(err);
                }
                let response = match on_trigger() {
                    Ok(()) => PropagateResponse::Ack,
                    Err(err) => {
                        let response = PropagateResponse::Error {
                            message: err.to_string(),
                        };
                        dispatch_error.get_or_insert(err);
                        response
                    }
                };
                let payload = encode(&response)?;
                self.send(propagate_broker, &payload)?;
            } else if frame.broker_id == CONTROL_BROKER {
                let reply = self.check(decode::<ControlResponse>(&frame.payload))?;
                if let Some(err) = dispatch_error.take() {
                    return Err(err);
                }
                return match reply {
                    ControlResponse::Handled => Ok(()),
                    ControlResponse::Error { message } => Err(Error::Module {
                        module: self.module.name.clone(),
                        message,
                    }),
                    ControlResponse::Properties { .. } => Err(self.protocol_error(
                        "unexpected properties reply to handle".to_string(),
                    )),
                };
            } else {
                return Err(self.protocol_error(format!(
                    "frame on unknown broker {}",
                    frame.broker_id
                )));
            }
        }
    }

    /// Whether the plugin process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn send(&mut self, broker: u32, payload: &[u8]) -> Result<()> {
        if let Err(err) = write_frame(&mut self.stream, broker, payload) {
            return Err(self.connection_error(err));
        }
        Ok(())
    }

    /// Promotes a decode failure into a connection-poisoning error.
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|err| match err {
            Error::Protocol(message) => self.protocol_error(message),
            other => other,
        })
    }

    fn serve_adapter(
        &mut self,
        frame: &Frame,
        adapter: &dyn ModuleAdapter,
        broker: u32,
    ) -> Result<()> {
        let request = self.check(decode::<AdapterRequest>(&frame.payload))?;
        let response = match serve(adapter, request) {
            Ok(response) => response,
            Err(err) => AdapterResponse::Error {
                message: err.to_string(),
            },
        };
        let payload = encode(&response)?;
        self.send(broker, &payload)
    }

    fn protocol_error(&mut self, message: String) -> Error {
        warn!(module = %self.module.name, %message, "protocol violation, killing plugin");
        let _ = self.child.kill();
        let _ = self.child.wait();
        Error::Protocol(message)
    }

    fn timeout_error(&mut self, deadline: Duration) -> Error {
        warn!(module = %self.module.name, "plugin call deadline expired, killing");
        let _ = self.child.kill();
        let _ = self.child.wait();
        Error::PluginTimeout {
            module: self.module.name.clone(),
            seconds: deadline.as_secs(),
        }
    }

    fn connection_error(&mut self, err: Error) -> Error {
        let _ = self.child.kill();
        let _ = self.child.wait();
        Error::PluginUnavailable {
            module: self.module.name.clone(),
            reason: format!("connection lost: {err}"),
        }
    }

    /// Graceful teardown: ask, signal, wait, then kill.
    pub fn shutdown(mut self, grace: Duration) {
        if let Ok(payload) = encode(&ControlRequest::Shutdown) {
            let _ = write_frame(&mut self.stream, CONTROL_BROKER, &payload);
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);

        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(self.child.id() as i32);
        let _ = kill(pid, Signal::SIGTERM);

        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(module = %self.module.name, %status, "plugin exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                _ => break,
            }
        }
        warn!(module = %self.module.name, "plugin ignored shutdown, killing");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Hard kill without the grace dance.
    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Executes one adapter request against the engine-side adapter.
fn serve(adapter: &dyn ModuleAdapter, request: AdapterRequest) -> Result<AdapterResponse> {
    Ok(match request {
        AdapterRequest::GetHost { id } => AdapterResponse::Host {
            host: adapter.get_host(id)?,
        },
        AdapterRequest::GetSource { id } => AdapterResponse::Source {
            source: adapter.get_source(id)?,
        },
        AdapterRequest::GetScan { id } => AdapterResponse::Scan {
            scan: adapter.get_scan(id)?,
        },
        AdapterRequest::AddHosts { hosts } => AdapterResponse::Ids {
            ids: adapter.add_hosts(hosts)?,
        },
        AdapterRequest::AddFingerprints { fingerprints } => AdapterResponse::Ids {
            ids: adapter.add_fingerprints(fingerprints)?,
        },
        AdapterRequest::AddLabels { labels } => AdapterResponse::Ids {
            ids: adapter.add_labels(labels)?,
        },
        AdapterRequest::AddScans { scans } => AdapterResponse::Ids {
            ids: adapter.add_scans(scans)?,
        },
        AdapterRequest::AddSources { sources } => AdapterResponse::Ids {
            ids: adapter.add_sources(sources)?,
        },
        AdapterRequest::Query { query } => AdapterResponse::Hosts {
            hosts: adapter.query(&query)?,
        },
    })
}
