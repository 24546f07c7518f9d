//! The server role.
//!
//! The listener identifier stays in the listening state for the lifetime of
//! the process. Every connect request gets its own identifier, peer
//! connection, and accept; every disconnect tears exactly that connection
//! down. Echoing itself happens on the completion-poller thread via
//! [`crate::echo::ServerEcho`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cm::{CmId, EventChannel, EventKind};
use crate::config::EchoConfig;
use crate::connection::{destroy_peer_connection, establish_peer_connection, ConnectionTable};
use crate::context::DeviceRegistry;
use crate::echo::ServerEcho;
use crate::error::Result;

/// Per-accepted-connection states. The listener itself has no machine; it
/// stays listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerConnState {
    /// Accept posted, waiting for the handshake to finish.
    Accepting,
    /// Ready for echo traffic.
    Established,
    /// Terminal state.
    Closed,
}

impl ServerConnState {
    pub(crate) fn on_event(self, kind: EventKind) -> ServerConnState {
        match (self, kind) {
            (ServerConnState::Accepting, EventKind::Established) => ServerConnState::Established,
            (_, EventKind::Disconnected) => ServerConnState::Closed,
            (state, _) => state,
        }
    }
}

struct Session {
    cm: CmId,
    state: ServerConnState,
}

/// A bound, listening echo server.
pub struct EchoServer {
    channel: EventChannel,
    // owns the listening identifier for the lifetime of the server
    _listener: CmId,
    table: Arc<ConnectionTable>,
    registry: DeviceRegistry,
    config: EchoConfig,
    sessions: HashMap<usize, Session>,
}

impl EchoServer {
    /// Bind the listener and start accepting connection requests.
    pub fn bind(addr: SocketAddr, config: &EchoConfig) -> Result<Self> {
        let channel = EventChannel::create()?;
        let listener = CmId::create(&channel)?;
        listener.bind(addr)?;
        listener.listen(config.backlog)?;
        info!(%addr, "listening");
        Ok(EchoServer {
            channel,
            _listener: listener,
            table: Arc::new(ConnectionTable::new()),
            registry: DeviceRegistry::new(),
            config: config.clone(),
            sessions: HashMap::new(),
        })
    }

    /// Number of currently live connections.
    pub fn connections(&self) -> usize {
        self.table.len()
    }

    /// Serve forever. Returns only on a CM-channel failure.
    pub fn serve(&mut self) -> Result<()> {
        loop {
            self.step()?;
        }
    }

    /// Wait for and process one CM event.
    pub fn step(&mut self) -> Result<()> {
        let event = self.channel.next()?;
        match event.kind {
            EventKind::ConnectRequest => {
                let Some(cm) = event.incoming() else {
                    warn!("connect request without an identifier");
                    return Ok(());
                };
                let device = self.registry.ensure(
                    cm.verbs()?,
                    Arc::new(ServerEcho),
                    self.table.clone(),
                    &self.config,
                )?;
                let key = establish_peer_connection(&device, &cm, &self.table, &self.config)?;
                cm.accept()?;
                info!(key, "connection request accepted");
                self.sessions.insert(
                    key,
                    Session {
                        cm,
                        state: ServerConnState::Accepting,
                    },
                );
            }
            EventKind::Established => {
                match event.key.and_then(|key| {
                    self.sessions.get_mut(&key).map(|session| (key, session))
                }) {
                    Some((key, session)) => {
                        session.state = session.state.on_event(EventKind::Established);
                        info!(key, "connection established");
                    }
                    None => warn!("established event for an unknown connection"),
                }
            }
            EventKind::Disconnected => {
                match event
                    .key
                    .and_then(|key| self.sessions.remove(&key).map(|session| (key, session)))
                {
                    Some((key, mut session)) => {
                        session.state = session.state.on_event(EventKind::Disconnected);
                        destroy_peer_connection(&session.cm, &self.table);
                        info!(key, state = ?session.state, "connection closed");
                        // dropping the session destroys its identifier
                    }
                    None => warn!("disconnect event for an unknown connection"),
                }
            }
            kind => warn!(?kind, "ignoring CM event"),
        }
        Ok(())
    }
}

/// Bind and serve forever.
pub fn run_server(addr: SocketAddr, config: &EchoConfig) -> Result<()> {
    EchoServer::bind(addr, config)?.serve()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_then_establish_then_close() {
        let state = ServerConnState::Accepting;
        let state = state.on_event(EventKind::Established);
        assert_eq!(state, ServerConnState::Established);
        let state = state.on_event(EventKind::Disconnected);
        assert_eq!(state, ServerConnState::Closed);
    }

    #[test]
    fn disconnect_before_establish_still_closes() {
        let state = ServerConnState::Accepting.on_event(EventKind::Disconnected);
        assert_eq!(state, ServerConnState::Closed);
    }

    #[test]
    fn stray_events_leave_the_state_alone() {
        let state = ServerConnState::Established.on_event(EventKind::Established);
        assert_eq!(state, ServerConnState::Established);
        let state = ServerConnState::Closed.on_event(EventKind::AddressResolved);
        assert_eq!(state, ServerConnState::Closed);
    }
}
