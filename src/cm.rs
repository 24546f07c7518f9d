//! Safe wrappers over the librdmacm connection-manager surface.
//!
//! librdmacm delivers connection-lifecycle events (address resolved, route
//! resolved, connect request, established, disconnected) over an event
//! channel. Each event names a connection identifier (`rdma_cm_id`); the
//! identifier's opaque context slot carries the connection-table key so that
//! events map back to their connection without aliasing pointers.

use std::ffi::CStr;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ptr::{self, NonNull};

use rdma_sys::{
    ibv_context, ibv_cq, ibv_pd, ibv_qp, ibv_qp_init_attr, ibv_qp_type, rdma_accept,
    rdma_ack_cm_event, rdma_bind_addr, rdma_cm_event, rdma_cm_id, rdma_conn_param, rdma_connect,
    rdma_create_event_channel, rdma_create_id, rdma_create_qp, rdma_destroy_event_channel,
    rdma_destroy_id, rdma_destroy_qp, rdma_disconnect, rdma_event_channel, rdma_event_str,
    rdma_get_cm_event, rdma_listen, rdma_port_space, rdma_resolve_addr, rdma_resolve_route,
};
use tracing::warn;

use crate::error::{Error, Result};

/// Connection-lifecycle events the state machines consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The destination address resolved to a local RDMA device.
    AddressResolved,
    /// A route to the destination was computed.
    RouteResolved,
    /// A remote peer asked to connect (listener side).
    ConnectRequest,
    /// The connection is up on both sides.
    Established,
    /// The peer disconnected, or a local disconnect completed.
    Disconnected,
    /// Any other CM event, carrying the raw event code.
    Other(u32),
}

impl From<u32> for EventKind {
    fn from(raw: u32) -> Self {
        use rdma_sys::rdma_cm_event_type::*;
        match raw {
            RDMA_CM_EVENT_ADDR_RESOLVED => EventKind::AddressResolved,
            RDMA_CM_EVENT_ROUTE_RESOLVED => EventKind::RouteResolved,
            RDMA_CM_EVENT_CONNECT_REQUEST => EventKind::ConnectRequest,
            RDMA_CM_EVENT_ESTABLISHED => EventKind::Established,
            RDMA_CM_EVENT_DISCONNECTED => EventKind::Disconnected,
            other => EventKind::Other(other),
        }
    }
}

/// Human-readable name of a raw CM event code.
pub fn event_name(raw: u32) -> String {
    let s = unsafe { rdma_event_str(raw) };
    if s.is_null() {
        format!("event {raw}")
    } else {
        unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned()
    }
}

/// One decoded CM event: what happened and which identifier it applies to.
///
/// The raw event is acknowledged before this is handed out, so destroying
/// the identifier from an event handler cannot deadlock on an unacked event.
pub struct ConnectionEvent {
    /// The event class.
    pub kind: EventKind,
    /// Connection-table key attached to the identifier, if one is attached.
    pub key: Option<usize>,
    /// CM status code; non-zero for rejections and unreachable peers.
    pub status: i32,
    id: *mut rdma_cm_id,
}

impl ConnectionEvent {
    /// Take ownership of the new identifier carried by a connect request.
    ///
    /// Returns `None` for every other event kind. Call at most once: the
    /// returned handle owns the identifier.
    pub fn incoming(&self) -> Option<CmId> {
        if self.kind != EventKind::ConnectRequest {
            return None;
        }
        NonNull::new(self.id).map(|id| CmId { id })
    }

    /// Describe the event for error reporting.
    pub fn describe(&self) -> String {
        match self.kind {
            EventKind::Other(raw) => format!("{} (status {})", event_name(raw), self.status),
            kind => format!("{kind:?} (status {})", self.status),
        }
    }
}

/// Read the connection-table key out of an identifier's context slot.
///
/// The slot stores `key + 1` so that a fresh identifier (NULL context) is
/// distinguishable from key zero.
fn connection_key_of(id: *mut rdma_cm_id) -> Option<usize> {
    if id.is_null() {
        return None;
    }
    (unsafe { (*id).context } as usize).checked_sub(1)
}

/// The CM event channel: a stream of [`ConnectionEvent`]s.
pub struct EventChannel {
    ch: NonNull<rdma_event_channel>,
}

// The channel is an fd plus librdmacm-internal state that is safe to use
// across threads; we only ever read it from one thread at a time.
unsafe impl Send for EventChannel {}
unsafe impl Sync for EventChannel {}

impl EventChannel {
    /// Open a new event channel.
    pub fn create() -> Result<Self> {
        NonNull::new(unsafe { rdma_create_event_channel() })
            .map(|ch| EventChannel { ch })
            .ok_or_else(|| Error::cm("rdma_create_event_channel"))
    }

    /// Block until the next CM event and decode it. The raw event is
    /// acknowledged before returning.
    pub fn next(&self) -> Result<ConnectionEvent> {
        let mut ev: *mut rdma_cm_event = ptr::null_mut();
        let rc = unsafe { rdma_get_cm_event(self.ch.as_ptr(), &mut ev) };
        if rc != 0 {
            return Err(Error::cm("rdma_get_cm_event"));
        }
        let (kind, status, id) = unsafe { ((*ev).event.into(), (*ev).status, (*ev).id) };
        let rc = unsafe { rdma_ack_cm_event(ev) };
        if rc != 0 {
            warn!(error = %io::Error::last_os_error(), "rdma_ack_cm_event failed");
        }
        Ok(ConnectionEvent {
            kind,
            key: connection_key_of(id),
            status,
            id,
        })
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        unsafe { rdma_destroy_event_channel(self.ch.as_ptr()) };
    }
}

/// An owned connection identifier.
///
/// Listener, client, and each accepted server connection have one. Dropping
/// it destroys the identifier; the queue pair hanging off it must be
/// destroyed first via [`CmId::destroy_qp`].
pub struct CmId {
    id: NonNull<rdma_cm_id>,
}

// librdmacm identifiers may be driven from multiple threads; destruction is
// serialized by ownership.
unsafe impl Send for CmId {}
unsafe impl Sync for CmId {}

impl CmId {
    /// Create an identifier bound to `channel`, RDMA_PS_TCP port space.
    pub fn create(channel: &EventChannel) -> Result<Self> {
        let mut id: *mut rdma_cm_id = ptr::null_mut();
        let rc = unsafe {
            rdma_create_id(
                channel.ch.as_ptr(),
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        if rc != 0 {
            return Err(Error::cm("rdma_create_id"));
        }
        NonNull::new(id)
            .map(|id| CmId { id })
            .ok_or_else(|| Error::cm("rdma_create_id"))
    }

    /// Bind to a local address (listener side).
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        let mut storage = sockaddr_of(addr);
        let rc = unsafe {
            rdma_bind_addr(
                self.id.as_ptr(),
                &mut storage as *mut _ as *mut rdma_sys::sockaddr,
            )
        };
        cm_check(rc, "rdma_bind_addr")
    }

    /// Start listening with the given backlog.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        cm_check(unsafe { rdma_listen(self.id.as_ptr(), backlog) }, "rdma_listen")
    }

    /// Start asynchronous address resolution toward `addr`.
    pub fn resolve_addr(&self, addr: SocketAddr, timeout_ms: i32) -> Result<()> {
        let mut storage = sockaddr_of(addr);
        let rc = unsafe {
            rdma_resolve_addr(
                self.id.as_ptr(),
                ptr::null_mut(),
                &mut storage as *mut _ as *mut rdma_sys::sockaddr,
                timeout_ms,
            )
        };
        cm_check(rc, "rdma_resolve_addr")
    }

    /// Start asynchronous route resolution.
    pub fn resolve_route(&self, timeout_ms: i32) -> Result<()> {
        cm_check(
            unsafe { rdma_resolve_route(self.id.as_ptr(), timeout_ms) },
            "rdma_resolve_route",
        )
    }

    /// Start the connect handshake.
    pub fn connect(&self) -> Result<()> {
        let mut param = default_conn_param();
        cm_check(unsafe { rdma_connect(self.id.as_ptr(), &mut param) }, "rdma_connect")
    }

    /// Accept a pending connect request.
    pub fn accept(&self) -> Result<()> {
        let mut param = default_conn_param();
        cm_check(unsafe { rdma_accept(self.id.as_ptr(), &mut param) }, "rdma_accept")
    }

    /// Tear the connection down. Both sides observe a disconnected event.
    pub fn disconnect(&self) -> Result<()> {
        cm_check(unsafe { rdma_disconnect(self.id.as_ptr()) }, "rdma_disconnect")
    }

    /// Verbs context of the device this identifier resolved to. Available
    /// once address resolution (client) or a connect request (server) has
    /// bound the identifier to a device.
    pub fn verbs(&self) -> Result<NonNull<ibv_context>> {
        NonNull::new(unsafe { (*self.id.as_ptr()).verbs }).ok_or(Error::Cm {
            op: "identifier not bound to a device",
            source: io::Error::from(io::ErrorKind::NotFound),
        })
    }

    /// Create the RC queue pair for this identifier, bound to the shared
    /// completion queue on both the send and receive side.
    pub fn create_qp(&self, pd: *mut ibv_pd, cq: *mut ibv_cq, depth: u32) -> Result<()> {
        let mut attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
        attr.send_cq = cq;
        attr.recv_cq = cq;
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.cap.max_send_wr = depth;
        attr.cap.max_recv_wr = depth;
        attr.cap.max_send_sge = 1;
        attr.cap.max_recv_sge = 1;
        cm_check(
            unsafe { rdma_create_qp(self.id.as_ptr(), pd, &mut attr) },
            "rdma_create_qp",
        )
    }

    /// The queue pair created by [`CmId::create_qp`].
    pub fn qp(&self) -> Result<NonNull<ibv_qp>> {
        NonNull::new(unsafe { (*self.id.as_ptr()).qp }).ok_or(Error::Cm {
            op: "identifier has no queue pair",
            source: io::Error::from(io::ErrorKind::NotFound),
        })
    }

    /// Destroy the queue pair. Posts racing this call are fenced by the
    /// connection's queue-pair handle, not here.
    pub fn destroy_qp(&self) {
        unsafe { rdma_destroy_qp(self.id.as_ptr()) };
    }

    /// Record the connection-table key in the identifier's context slot.
    pub fn attach_connection_key(&self, key: usize) {
        unsafe { (*self.id.as_ptr()).context = (key + 1) as *mut std::os::raw::c_void };
    }

    /// The connection-table key previously attached, if any.
    pub fn connection_key(&self) -> Option<usize> {
        connection_key_of(self.id.as_ptr())
    }
}

impl Drop for CmId {
    fn drop(&mut self) {
        let rc = unsafe { rdma_destroy_id(self.id.as_ptr()) };
        if rc != 0 {
            warn!(error = %io::Error::last_os_error(), "rdma_destroy_id failed");
        }
    }
}

fn cm_check(rc: i32, op: &'static str) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::cm(op))
    }
}

fn default_conn_param() -> rdma_conn_param {
    let mut param = unsafe { mem::zeroed::<rdma_conn_param>() };
    param.responder_resources = 1;
    param.initiator_depth = 1;
    param.retry_count = 0;
    param.rnr_retry_count = 7;
    param
}

fn sockaddr_of(addr: SocketAddr) -> libc::sockaddr_storage {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
        }
    }
    storage
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdma_sys::rdma_cm_event_type::*;

    #[test]
    fn event_kinds_decode() {
        assert_eq!(
            EventKind::from(RDMA_CM_EVENT_ADDR_RESOLVED),
            EventKind::AddressResolved
        );
        assert_eq!(
            EventKind::from(RDMA_CM_EVENT_ROUTE_RESOLVED),
            EventKind::RouteResolved
        );
        assert_eq!(
            EventKind::from(RDMA_CM_EVENT_CONNECT_REQUEST),
            EventKind::ConnectRequest
        );
        assert_eq!(
            EventKind::from(RDMA_CM_EVENT_ESTABLISHED),
            EventKind::Established
        );
        assert_eq!(
            EventKind::from(RDMA_CM_EVENT_DISCONNECTED),
            EventKind::Disconnected
        );
    }

    #[test]
    fn unknown_event_kinds_carry_their_code() {
        assert_eq!(
            EventKind::from(RDMA_CM_EVENT_REJECTED),
            EventKind::Other(RDMA_CM_EVENT_REJECTED)
        );
    }

    #[test]
    fn context_slot_distinguishes_unset_from_key_zero() {
        let mut id = unsafe { mem::zeroed::<rdma_cm_id>() };
        assert_eq!(connection_key_of(&mut id), None);
        id.context = 1 as *mut std::os::raw::c_void;
        assert_eq!(connection_key_of(&mut id), Some(0));
        id.context = 42 as *mut std::os::raw::c_void;
        assert_eq!(connection_key_of(&mut id), Some(41));
        assert_eq!(connection_key_of(ptr::null_mut()), None);
    }

    #[test]
    fn ipv4_sockaddr_is_network_ordered() {
        let storage = sockaddr_of("192.168.0.1:7471".parse().unwrap());
        let sin = unsafe { *(&storage as *const _ as *const libc::sockaddr_in) };
        assert_eq!(sin.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(u16::from_be(sin.sin_port), 7471);
        assert_eq!(sin.sin_addr.s_addr.to_ne_bytes(), [192, 168, 0, 1]);
    }

    #[test]
    fn ipv6_sockaddr_keeps_octets() {
        let storage = sockaddr_of("[::1]:7471".parse().unwrap());
        let sin6 = unsafe { *(&storage as *const _ as *const libc::sockaddr_in6) };
        assert_eq!(sin6.sin6_family, libc::AF_INET6 as libc::sa_family_t);
        assert_eq!(u16::from_be(sin6.sin6_port), 7471);
        let mut expected = [0u8; 16];
        expected[15] = 1;
        assert_eq!(sin6.sin6_addr.s6_addr, expected);
    }
}
