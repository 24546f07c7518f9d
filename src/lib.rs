//! A point-to-point echo service built directly on RDMA connection
//! management and queue-pair verbs, rather than on sockets.
//!
//! librdmacm handles the out-of-band connection setup (address and route
//! resolution, connect/accept handshake, disconnect notification) and
//! delivers lifecycle events over an event channel. Everything on the data
//! path — pinned-memory registration, posting send/receive work requests,
//! and harvesting work completions — goes through libibverbs on a
//! reliable-connected (RC) queue pair.
//!
//! The crate is organized around three long-lived pieces:
//!
//! - [`context::DeviceContext`]: one per device per process. Owns the
//!   protection domain, the shared completion queue, its notification
//!   channel, and the completion-poller thread.
//! - [`connection::PeerConnection`]: one per established peer. Holds the
//!   queue-pair handle and the two registered 1024-byte message buffers.
//!   Connections live in a [`connection::ConnectionTable`] whose slab key is
//!   carried as the work-request id of every posted operation, so a
//!   completion maps back to its connection without aliasing pointers.
//! - [`poller`]: blocks on the completion notification channel, rearms it,
//!   drains ready completions, and hands each one to a role-specific
//!   [`poller::CompletionHandler`] — the echoing server or the printing
//!   client, in [`echo`].
//!
//! The [`client`] and [`server`] modules drive the CM event state machines
//! and own the interactive session (client) and the accept loop (server).
//! The `echo-client` and `echo-server` binaries are thin CLI shells over
//! [`client::run_client`] and [`server::run_server`].
//!
//! You can exercise all of this without specialized hardware by loading the
//! SoftRoCE (`rdma_rxe`) driver on an ordinary network interface.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod client;
pub mod cm;
pub mod config;
pub mod connection;
pub mod context;
pub mod echo;
pub mod error;
pub mod poller;
pub mod server;
pub mod wire;

pub use config::EchoConfig;
pub use error::{Error, Result};
