//! The client role.
//!
//! Establishment walks the CM state machine: resolve the server address,
//! build the peer connection, resolve a route, run the connect handshake.
//! Once established, the interactive session reads stdin lines on a
//! dedicated thread and forwards them over a channel, so a pending read
//! never delays handling of a disconnect; each forwarded line is posted as
//! a send plus a receive for the reply, until the exit sentinel.

use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cm::{CmId, EventChannel, EventKind};
use crate::config::EchoConfig;
use crate::connection::{
    destroy_peer_connection, establish_peer_connection, ConnectionTable, PeerConnection,
};
use crate::context::DeviceRegistry;
use crate::echo::ClientEcho;
use crate::error::{Error, Result};
use crate::wire;

/// Client connection-establishment states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Nothing issued yet.
    Init,
    /// Waiting for the server address to resolve to a device.
    AddrResolving,
    /// Waiting for a route to the server.
    RouteResolving,
    /// Connect handshake in flight.
    Connecting,
    /// Ready for the interactive exchange.
    Established,
    /// Terminal state.
    Closed,
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientAction {
    /// Build the peer connection, then start route resolution.
    PrepareAndResolveRoute,
    /// Start the connect handshake.
    Connect,
    /// The connection is ready; start the interactive session.
    StartSession,
    /// Tear the connection down; the machine reached its terminal state.
    Teardown,
    /// The handshake was aborted by a CM error event.
    Fail,
    /// The event is meaningless in this state; ignore it.
    Ignore,
}

impl ClientState {
    pub(crate) fn on_event(self, kind: EventKind) -> (ClientState, ClientAction) {
        use ClientAction::*;
        use ClientState::*;
        match (self, kind) {
            (AddrResolving, EventKind::AddressResolved) => (RouteResolving, PrepareAndResolveRoute),
            (RouteResolving, EventKind::RouteResolved) => (Connecting, Connect),
            (Connecting, EventKind::Established) => (Established, StartSession),
            (_, EventKind::Disconnected) => (Closed, Teardown),
            (AddrResolving | RouteResolving | Connecting, EventKind::Other(_)) => (Closed, Fail),
            (state, _) => (state, Ignore),
        }
    }
}

/// An established echo client connection.
pub struct EchoClient {
    cm: Arc<CmId>,
    conn: Arc<PeerConnection>,
    closed: Arc<AtomicBool>,
    events: Option<thread::JoinHandle<()>>,
    _registry: DeviceRegistry,
}

impl EchoClient {
    /// Resolve, connect, and return once the connection is established.
    pub fn connect(server: SocketAddr, config: &EchoConfig) -> Result<Self> {
        let channel = EventChannel::create()?;
        let cm = Arc::new(CmId::create(&channel)?);
        let table = Arc::new(ConnectionTable::new());
        let registry = DeviceRegistry::new();

        info!(%server, "resolving address");
        cm.resolve_addr(server, config.resolve_timeout_ms)?;
        let mut state = ClientState::AddrResolving;
        let mut key = None;

        while state != ClientState::Established {
            let event = channel.next()?;
            let (next, action) = state.on_event(event.kind);
            debug!(from = ?state, to = ?next, kind = ?event.kind, "cm transition");
            state = next;
            match action {
                ClientAction::PrepareAndResolveRoute => {
                    let device =
                        registry.ensure(cm.verbs()?, Arc::new(ClientEcho), table.clone(), config)?;
                    key = Some(establish_peer_connection(&device, &cm, &table, config)?);
                    cm.resolve_route(config.resolve_timeout_ms)?;
                }
                ClientAction::Connect => cm.connect()?,
                ClientAction::StartSession => {}
                ClientAction::Teardown | ClientAction::Fail => {
                    destroy_peer_connection(&cm, &table);
                    return Err(Error::Handshake {
                        event: event.describe(),
                    });
                }
                ClientAction::Ignore => {
                    warn!(kind = ?event.kind, "ignoring unexpected CM event");
                }
            }
        }

        let key = match key {
            Some(key) => key,
            None => {
                return Err(Error::Handshake {
                    event: "established before address resolution".into(),
                })
            }
        };
        let conn = table.get(key).ok_or(Error::ConnectionClosed(key))?;
        info!(key, "connected");

        // the channel moves to a pump thread so the disconnect event is
        // handled even while the session is busy
        let closed = Arc::new(AtomicBool::new(false));
        let events = {
            let cm = cm.clone();
            let closed = closed.clone();
            thread::Builder::new()
                .name("cm-events".into())
                .spawn(move || event_pump(channel, cm, table, closed))
                .map_err(|e| Error::Io {
                    op: "spawn cm event pump",
                    source: e,
                })?
        };

        Ok(EchoClient {
            cm,
            conn,
            closed,
            events: Some(events),
            _registry: registry,
        })
    }

    /// Post one outbound line plus the receive for its echo.
    pub fn send_line(&self, line: &str) -> Result<()> {
        self.conn.fill_send(line.as_bytes())?;
        self.conn.post_send()?;
        self.conn.post_receive()
    }

    /// Initiate a graceful disconnect. Teardown completes on the event-pump
    /// thread once the disconnect event arrives.
    pub fn disconnect(&self) -> Result<()> {
        self.cm.disconnect()
    }

    /// Whether the connection reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The underlying connection, for inspecting payloads and counters.
    pub fn connection(&self) -> &Arc<PeerConnection> {
        &self.conn
    }
}

impl Drop for EchoClient {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.cm.disconnect();
        }
        if let Some(events) = self.events.take() {
            let _ = events.join();
        }
    }
}

fn event_pump(
    channel: EventChannel,
    cm: Arc<CmId>,
    table: Arc<ConnectionTable>,
    closed: Arc<AtomicBool>,
) {
    loop {
        match channel.next() {
            Ok(event) => match event.kind {
                EventKind::Disconnected => {
                    info!("disconnected");
                    destroy_peer_connection(&cm, &table);
                    closed.store(true, Ordering::Release);
                    break;
                }
                kind => warn!(?kind, "ignoring CM event"),
            },
            Err(e) => {
                warn!(error = %e, "cm event wait failed");
                closed.store(true, Ordering::Release);
                break;
            }
        }
    }
}

/// Run the interactive client: echo stdin lines through the server until
/// the exit sentinel, end of input, or disconnection.
pub fn run_client(server: SocketAddr, config: &EchoConfig) -> Result<()> {
    let client = EchoClient::connect(server, config)?;

    let (tx, rx) = mpsc::channel::<String>();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            let stdin = io::stdin();
            loop {
                print!(">>> ");
                let _ = io::stdout().flush();
                let mut line = String::new();
                match stdin.lock().read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = line.trim_end_matches(['\r', '\n']).to_string();
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                }
            }
        })
        .map_err(|e| Error::Io {
            op: "spawn stdin reader",
            source: e,
        })?;

    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => {
                if wire::is_exit(&line) {
                    let _ = client.disconnect();
                    break;
                }
                match client.send_line(&line) {
                    Ok(()) => {}
                    Err(Error::PayloadTooLarge { len, max }) => {
                        warn!(len, max, "line too long, not sent");
                    }
                    Err(Error::ConnectionClosed(_)) => break,
                    Err(e) => return Err(e),
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if client.is_closed() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                // end of input behaves like the sentinel
                let _ = client.disconnect();
                break;
            }
        }
    }

    // joins the event pump once the disconnect event lands
    drop(client);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn other() -> EventKind {
        EventKind::Other(rdma_sys::rdma_cm_event_type::RDMA_CM_EVENT_REJECTED)
    }

    #[test]
    fn happy_path_reaches_established() {
        let (s, a) = ClientState::AddrResolving.on_event(EventKind::AddressResolved);
        assert_eq!(s, ClientState::RouteResolving);
        assert_eq!(a, ClientAction::PrepareAndResolveRoute);

        let (s, a) = s.on_event(EventKind::RouteResolved);
        assert_eq!(s, ClientState::Connecting);
        assert_eq!(a, ClientAction::Connect);

        let (s, a) = s.on_event(EventKind::Established);
        assert_eq!(s, ClientState::Established);
        assert_eq!(a, ClientAction::StartSession);
    }

    #[test]
    fn disconnect_is_terminal_from_any_state() {
        for state in [
            ClientState::Init,
            ClientState::AddrResolving,
            ClientState::RouteResolving,
            ClientState::Connecting,
            ClientState::Established,
            ClientState::Closed,
        ] {
            let (s, a) = state.on_event(EventKind::Disconnected);
            assert_eq!(s, ClientState::Closed);
            assert_eq!(a, ClientAction::Teardown);
        }
    }

    #[test]
    fn cm_errors_abort_the_handshake() {
        for state in [
            ClientState::AddrResolving,
            ClientState::RouteResolving,
            ClientState::Connecting,
        ] {
            let (s, a) = state.on_event(other());
            assert_eq!(s, ClientState::Closed);
            assert_eq!(a, ClientAction::Fail);
        }
    }

    #[test]
    fn stray_events_are_ignored() {
        let (s, a) = ClientState::Established.on_event(EventKind::AddressResolved);
        assert_eq!(s, ClientState::Established);
        assert_eq!(a, ClientAction::Ignore);

        let (s, a) = ClientState::Established.on_event(other());
        assert_eq!(s, ClientState::Established);
        assert_eq!(a, ClientAction::Ignore);

        let (s, a) = ClientState::Closed.on_event(EventKind::Established);
        assert_eq!(s, ClientState::Closed);
        assert_eq!(a, ClientAction::Ignore);

        let (s, a) = ClientState::AddrResolving.on_event(EventKind::RouteResolved);
        assert_eq!(s, ClientState::AddrResolving);
        assert_eq!(a, ClientAction::Ignore);
    }
}
