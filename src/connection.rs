//! Per-peer connection state.
//!
//! A [`PeerConnection`] owns the two registered message buffers of one peer
//! and a detachable handle to the queue pair, which itself belongs to the CM
//! identifier. Connections live in a [`ConnectionTable`]; the slab key is
//! carried as the work-request id of every posted operation, so completions
//! map back to their connection by index rather than by pointer.

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rdma_sys::{
    ibv_access_flags, ibv_dereg_mr, ibv_mr, ibv_pd, ibv_post_recv, ibv_post_send, ibv_qp,
    ibv_recv_wr, ibv_reg_mr, ibv_send_flags, ibv_send_wr, ibv_sge, ibv_wr_opcode,
};
use slab::Slab;
use tracing::debug;

use crate::cm::CmId;
use crate::config::EchoConfig;
use crate::context::DeviceContext;
use crate::error::{Error, Result};
use crate::poller::CompletionKind;
use crate::wire;

/// A pinned, registered message buffer.
///
/// The memory region is deregistered exactly once, in Drop, before the
/// backing allocation is freed.
struct RegisteredBuffer {
    mr: NonNull<ibv_mr>,
    lkey: u32,
    addr: u64,
    len: usize,
    data: Mutex<Box<[u8]>>,
}

// The region is pinned for the device; CPU-side access is serialized by the
// data mutex, and the mr pointer is only freed in Drop.
unsafe impl Send for RegisteredBuffer {}
unsafe impl Sync for RegisteredBuffer {}

impl RegisteredBuffer {
    fn register(pd: *mut ibv_pd, len: usize, access: ibv_access_flags) -> Result<Self> {
        let mut data = vec![0u8; len].into_boxed_slice();
        let mr = unsafe { ibv_reg_mr(pd, data.as_mut_ptr() as *mut _, len as _, access.0 as i32) };
        let mr = NonNull::new(mr).ok_or_else(|| Error::verbs("ibv_reg_mr"))?;
        let (lkey, addr) = unsafe { ((*mr.as_ptr()).lkey, (*mr.as_ptr()).addr as u64) };
        Ok(RegisteredBuffer {
            mr,
            lkey,
            addr,
            len,
            data: Mutex::new(data),
        })
    }

    fn sge(&self) -> ibv_sge {
        ibv_sge {
            addr: self.addr,
            length: self.len as u32,
            lkey: self.lkey,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.lock().unwrap())
    }
}

impl Drop for RegisteredBuffer {
    fn drop(&mut self) {
        let rc = unsafe { ibv_dereg_mr(self.mr.as_ptr()) };
        if rc != 0 {
            tracing::warn!(errno = rc, "ibv_dereg_mr failed");
        }
    }
}

/// State owned by one established peer connection.
///
/// The queue pair belongs to the CM identifier; the connection keeps a
/// detachable handle behind a mutex, so a post racing teardown fails with
/// [`Error::ConnectionClosed`] instead of touching a destroyed queue pair.
pub struct PeerConnection {
    key: usize,
    qp: Mutex<Option<NonNull<ibv_qp>>>,
    send: RegisteredBuffer,
    recv: RegisteredBuffer,
    sends_posted: AtomicU64,
    recvs_posted: AtomicU64,
    sends_completed: AtomicU64,
    recvs_completed: AtomicU64,
    // keeps the protection domain alive until the regions are deregistered
    _device: Arc<DeviceContext>,
}

unsafe impl Send for PeerConnection {}
unsafe impl Sync for PeerConnection {}

impl PeerConnection {
    /// The connection-table key, also the work-request id of every
    /// operation posted on this connection.
    pub fn key(&self) -> usize {
        self.key
    }

    /// Encode `payload` into the send buffer, NUL-padded.
    pub fn fill_send(&self, payload: &[u8]) -> Result<()> {
        self.send.with(|buf| wire::encode_payload(payload, buf))
    }

    /// Copy the receive buffer into the send buffer verbatim, padding
    /// included — the echo path.
    pub fn copy_recv_to_send(&self) {
        let message = self.recv.with(|buf| buf.to_vec());
        self.send.with(|buf| buf.copy_from_slice(&message));
    }

    /// Decoded payload currently in the receive buffer.
    pub fn recv_payload(&self) -> String {
        self.recv.with(|buf| wire::decode_payload(buf))
    }

    /// Decoded payload currently in the send buffer.
    pub fn send_payload(&self) -> String {
        self.send.with(|buf| wire::decode_payload(buf))
    }

    /// Post a send work request carrying the send buffer.
    pub fn post_send(&self) -> Result<()> {
        let qp = self.qp.lock().unwrap();
        let qp = qp.as_ref().ok_or(Error::ConnectionClosed(self.key))?;
        let mut sge = self.send.sge();
        let mut wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = self.key as u64;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        let mut bad: *mut ibv_send_wr = ptr::null_mut();
        let rc = unsafe { ibv_post_send(qp.as_ptr(), &mut wr, &mut bad) };
        if rc != 0 {
            return Err(Error::verbs_errno("ibv_post_send", rc));
        }
        self.sends_posted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Post a receive work request targeting the receive buffer.
    pub fn post_receive(&self) -> Result<()> {
        let qp = self.qp.lock().unwrap();
        let qp = qp.as_ref().ok_or(Error::ConnectionClosed(self.key))?;
        let mut sge = self.recv.sge();
        let mut wr = unsafe { mem::zeroed::<ibv_recv_wr>() };
        wr.wr_id = self.key as u64;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        let mut bad: *mut ibv_recv_wr = ptr::null_mut();
        let rc = unsafe { ibv_post_recv(qp.as_ptr(), &mut wr, &mut bad) };
        if rc != 0 {
            return Err(Error::verbs_errno("ibv_post_recv", rc));
        }
        self.recvs_posted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Take the queue-pair handle out, failing any later post. Called by
    /// teardown before the queue pair is destroyed; a post already holding
    /// the lock finishes first.
    pub(crate) fn detach_qp(&self) {
        self.qp.lock().unwrap().take();
    }

    pub(crate) fn note_completion(&self, kind: CompletionKind) {
        match kind {
            CompletionKind::Send => self.sends_completed.fetch_add(1, Ordering::Relaxed),
            CompletionKind::Receive => self.recvs_completed.fetch_add(1, Ordering::Relaxed),
            CompletionKind::Other(_) => 0,
        };
    }

    /// Send work requests posted over the connection's lifetime.
    pub fn posted_sends(&self) -> u64 {
        self.sends_posted.load(Ordering::Relaxed)
    }

    /// Receive work requests posted over the connection's lifetime.
    pub fn posted_receives(&self) -> u64 {
        self.recvs_posted.load(Ordering::Relaxed)
    }

    /// Send completions observed so far.
    pub fn completed_sends(&self) -> u64 {
        self.sends_completed.load(Ordering::Relaxed)
    }

    /// Receive completions observed so far.
    pub fn completed_receives(&self) -> u64 {
        self.recvs_completed.load(Ordering::Relaxed)
    }
}

/// Live connections keyed by slab index.
///
/// The table is the only shared mapping between the CM event loop and the
/// completion poller; entries are `Arc`s, so a completion dispatched
/// concurrently with teardown keeps its connection's memory alive until the
/// dispatch finishes.
pub struct ConnectionTable<T = Arc<PeerConnection>> {
    slots: Mutex<Slab<T>>,
}

impl<T> ConnectionTable<T> {
    /// An empty table.
    pub fn new() -> Self {
        ConnectionTable {
            slots: Mutex::new(Slab::new()),
        }
    }

    /// Remove and return the entry under `key`, if it is still live.
    pub fn remove(&self, key: usize) -> Option<T> {
        let mut slots = self.slots.lock().unwrap();
        if slots.contains(key) {
            Some(slots.remove(key))
        } else {
            None
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Whether the table has no live connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> ConnectionTable<T> {
    /// Look up the entry under `key`.
    pub fn get(&self, key: usize) -> Option<T> {
        self.slots.lock().unwrap().get(key).cloned()
    }
}

impl<T> Default for ConnectionTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the queue pair, buffers, and memory regions for a new peer and
/// post the initial receive. Returns the connection-table key, which is also
/// attached to the CM identifier's context slot.
///
/// Every failure here is fatal to the process: the caller propagates it to
/// main, which exits with the underlying error code.
pub fn establish_peer_connection(
    device: &Arc<DeviceContext>,
    cm: &CmId,
    table: &ConnectionTable,
    config: &EchoConfig,
) -> Result<usize> {
    // holding the table lock serializes connection setup against the poller
    let mut slots = table.slots.lock().unwrap();
    let entry = slots.vacant_entry();
    let key = entry.key();

    cm.create_qp(device.pd(), device.cq(), config.queue_depth)?;
    let qp = cm.qp()?;

    let send = RegisteredBuffer::register(
        device.pd(),
        config.buffer_size,
        ibv_access_flags::IBV_ACCESS_LOCAL_WRITE | ibv_access_flags::IBV_ACCESS_REMOTE_READ,
    )?;
    let recv = RegisteredBuffer::register(
        device.pd(),
        config.buffer_size,
        ibv_access_flags::IBV_ACCESS_LOCAL_WRITE | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE,
    )?;

    let conn = Arc::new(PeerConnection {
        key,
        qp: Mutex::new(Some(qp)),
        send,
        recv,
        sends_posted: AtomicU64::new(0),
        recvs_posted: AtomicU64::new(0),
        sends_completed: AtomicU64::new(0),
        recvs_completed: AtomicU64::new(0),
        _device: device.clone(),
    });
    conn.post_receive()?;
    entry.insert(conn);
    cm.attach_connection_key(key);
    debug!(key, "peer connection established");
    Ok(key)
}

/// Tear down the connection attached to `cm`: fail further posts, destroy
/// the queue pair, and drop the table entry, which deregisters both memory
/// regions before their buffers are freed.
///
/// The caller must only do this after the disconnect event, when
/// outstanding work items have completed or been flushed; a completion
/// still in flight resolves to a removed key and is dropped by the poller.
pub fn destroy_peer_connection(cm: &CmId, table: &ConnectionTable) {
    let Some(key) = cm.connection_key() else {
        return;
    };
    if let Some(conn) = table.remove(key) {
        conn.detach_qp();
        cm.destroy_qp();
        debug!(
            key,
            sends = conn.posted_sends(),
            recvs = conn.posted_receives(),
            "peer connection destroyed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable_and_reusable() {
        let table: ConnectionTable<u32> = ConnectionTable::new();
        let (a, b) = {
            let mut slots = table.slots.lock().unwrap();
            let a = slots.insert(10);
            let b = slots.insert(20);
            (a, b)
        };
        assert_ne!(a, b);
        assert_eq!(table.get(a), Some(10));
        assert_eq!(table.get(b), Some(20));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn removal_happens_exactly_once() {
        let table: ConnectionTable<u32> = ConnectionTable::new();
        let key = table.slots.lock().unwrap().insert(7);
        assert_eq!(table.remove(key), Some(7));
        // a flushed completion arriving after teardown resolves to nothing
        assert_eq!(table.remove(key), None);
        assert_eq!(table.get(key), None);
        assert!(table.is_empty());
    }

    #[test]
    fn lookups_miss_for_never_allocated_keys() {
        let table: ConnectionTable<u32> = ConnectionTable::new();
        assert_eq!(table.get(123), None);
        assert_eq!(table.remove(123), None);
    }
}
