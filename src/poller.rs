//! The completion poller.
//!
//! One poller thread per device context blocks on the completion
//! notification channel, acknowledges and rearms it, then drains every
//! ready work completion and dispatches it to the role's
//! [`CompletionHandler`]. Failed completions are logged and skipped; the
//! transport error that caused them also surfaces as a CM disconnect, which
//! is where teardown happens.

use std::ffi::CStr;
use std::mem;
use std::os::fd::BorrowedFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use rdma_sys::{
    ibv_ack_cq_events, ibv_comp_channel, ibv_cq, ibv_get_cq_event, ibv_poll_cq, ibv_req_notify_cq,
    ibv_wc, ibv_wc_opcode, ibv_wc_status, ibv_wc_status_str,
};
use tracing::{debug, error, trace, warn};

use crate::connection::{ConnectionTable, PeerConnection};

/// How many completions one drain pass pulls at a time.
const POLL_BATCH: usize = 16;

/// How long one channel wait lasts before the shutdown flag is rechecked.
const SHUTDOWN_POLL_MS: u8 = 100;

/// Work-completion class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// A posted send finished.
    Send,
    /// An inbound message landed in the receive buffer.
    Receive,
    /// Any other opcode, carried raw.
    Other(u32),
}

impl CompletionKind {
    /// Receive completions are flagged by the high opcode bit; everything
    /// in this service is otherwise a plain send.
    fn from_opcode(opcode: u32) -> Self {
        if (opcode & ibv_wc_opcode::IBV_WC_RECV) != 0 {
            CompletionKind::Receive
        } else if opcode == ibv_wc_opcode::IBV_WC_SEND {
            CompletionKind::Send
        } else {
            CompletionKind::Other(opcode)
        }
    }
}

/// One dispatched work completion.
pub struct Completion {
    /// Connection-table key the work item was posted under.
    pub key: usize,
    /// Send/receive class.
    pub kind: CompletionKind,
    /// Raw verbs status code.
    pub status: u32,
}

impl Completion {
    fn from_wc(wc: &ibv_wc) -> Self {
        Completion {
            key: wc.wr_id as usize,
            kind: CompletionKind::from_opcode(wc.opcode),
            status: wc.status,
        }
    }

    /// Whether the work item completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == ibv_wc_status::IBV_WC_SUCCESS
    }
}

/// Human-readable verbs completion status.
pub fn status_str(status: u32) -> String {
    let s = unsafe { ibv_wc_status_str(status) };
    if s.is_null() {
        format!("status {status}")
    } else {
        unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned()
    }
}

/// Role-specific reaction to completed work items.
///
/// Implementations are called from the poller thread, one completion at a
/// time, only for successful completions whose work-request id resolves to
/// a live connection.
pub trait CompletionHandler: Send + Sync {
    /// React to one completed work item on `conn`.
    fn on_completion(&self, conn: &PeerConnection, completion: &Completion);
}

/// Raw handles the poller reads. All are owned by the `DeviceContext` that
/// spawned the poller, which joins the thread before destroying them.
pub(crate) struct CqHandles {
    pub(crate) cq: *mut ibv_cq,
    pub(crate) channel: *mut ibv_comp_channel,
    pub(crate) fd: i32,
}

unsafe impl Send for CqHandles {}

/// The poller loop. Runs until `shutdown` is set.
pub(crate) fn run(
    handles: CqHandles,
    table: Arc<ConnectionTable>,
    handler: Arc<dyn CompletionHandler>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Acquire) {
        // wait for a completion-queue notification, waking periodically so
        // the shutdown flag is observed between drain cycles
        let borrowed = unsafe { BorrowedFd::borrow_raw(handles.fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(SHUTDOWN_POLL_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!(error = %e, "poll on completion channel failed");
                break;
            }
        }

        let mut cq = ptr::null_mut();
        let mut cq_context = ptr::null_mut();
        let rc = unsafe { ibv_get_cq_event(handles.channel, &mut cq, &mut cq_context) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                continue;
            }
            error!(error = %err, "ibv_get_cq_event failed");
            break;
        }
        unsafe { ibv_ack_cq_events(cq, 1) };

        // rearm before draining, so a completion arriving between the drain
        // and the next wait still raises a notification
        let rc = unsafe { ibv_req_notify_cq(handles.cq, 0) };
        if rc != 0 {
            error!(errno = rc, "ibv_req_notify_cq failed");
            break;
        }

        drain(&handles, &table, &*handler);
    }
    debug!("completion poller stopped");
}

fn drain(handles: &CqHandles, table: &ConnectionTable, handler: &dyn CompletionHandler) {
    let mut wcs: [ibv_wc; POLL_BATCH] = unsafe { mem::zeroed() };
    loop {
        let n = unsafe { ibv_poll_cq(handles.cq, POLL_BATCH as i32, wcs.as_mut_ptr()) };
        if n < 0 {
            error!("ibv_poll_cq failed");
            return;
        }
        if n == 0 {
            return;
        }
        for wc in &wcs[..n as usize] {
            let completion = Completion::from_wc(wc);
            if !completion.is_success() {
                // logged but not fatal; the connection is torn down by the
                // CM disconnect that follows a transport error
                warn!(
                    key = completion.key,
                    status = %status_str(completion.status),
                    "work completion failed"
                );
                continue;
            }
            match table.get(completion.key) {
                Some(conn) => {
                    conn.note_completion(completion.kind);
                    handler.on_completion(&conn, &completion);
                }
                None => {
                    trace!(key = completion.key, "completion for a torn-down connection")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_classification() {
        assert_eq!(
            CompletionKind::from_opcode(ibv_wc_opcode::IBV_WC_SEND),
            CompletionKind::Send
        );
        assert_eq!(
            CompletionKind::from_opcode(ibv_wc_opcode::IBV_WC_RECV),
            CompletionKind::Receive
        );
        // receives carry a flag bit, not a single value
        assert_eq!(
            CompletionKind::from_opcode(ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM),
            CompletionKind::Receive
        );
        assert_eq!(
            CompletionKind::from_opcode(ibv_wc_opcode::IBV_WC_RDMA_WRITE),
            CompletionKind::Other(ibv_wc_opcode::IBV_WC_RDMA_WRITE)
        );
    }

    #[test]
    fn status_success_check() {
        let ok = Completion {
            key: 0,
            kind: CompletionKind::Send,
            status: ibv_wc_status::IBV_WC_SUCCESS,
        };
        assert!(ok.is_success());
        let failed = Completion {
            key: 0,
            kind: CompletionKind::Send,
            status: ibv_wc_status::IBV_WC_RETRY_EXC_ERR,
        };
        assert!(!failed.is_success());
    }
}
