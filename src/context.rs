//! Shared per-device context.
//!
//! One [`DeviceContext`] exists per RDMA device per process. It owns the
//! protection domain, the completion queue every peer connection shares, the
//! completion notification channel, and the poller thread that drains it.
//! The [`DeviceRegistry`] hands out the shared context by reference count
//! and rejects a second device: the service has no multi-device support.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rdma_sys::{
    ibv_alloc_pd, ibv_comp_channel, ibv_context, ibv_cq, ibv_create_comp_channel, ibv_create_cq,
    ibv_dealloc_pd, ibv_destroy_comp_channel, ibv_destroy_cq, ibv_free_device_list,
    ibv_get_device_list, ibv_pd, ibv_req_notify_cq,
};
use tracing::warn;

use crate::config::EchoConfig;
use crate::connection::ConnectionTable;
use crate::error::{Error, Result};
use crate::poller::{self, CompletionHandler, CqHandles};

/// Whether any RDMA device is visible to this process. Used by the
/// hardware-gated integration tests to skip instead of fail.
pub fn rdma_device_present() -> bool {
    let mut n = 0i32;
    let list = unsafe { ibv_get_device_list(&mut n) };
    if list.is_null() {
        return false;
    }
    unsafe { ibv_free_device_list(list) };
    n > 0
}

/// The process-wide device state shared by every peer connection.
pub struct DeviceContext {
    verbs: NonNull<ibv_context>,
    pd: NonNull<ibv_pd>,
    cq: NonNull<ibv_cq>,
    channel: NonNull<ibv_comp_channel>,
    shutdown: Arc<AtomicBool>,
    poller: Mutex<Option<thread::JoinHandle<()>>>,
}

// The verbs structures behind these pointers are thread safe; the pointers
// themselves are only destroyed in Drop, after the poller has been joined.
unsafe impl Send for DeviceContext {}
unsafe impl Sync for DeviceContext {}

impl DeviceContext {
    fn build(
        verbs: NonNull<ibv_context>,
        handler: Arc<dyn CompletionHandler>,
        table: Arc<ConnectionTable>,
        config: &EchoConfig,
    ) -> Result<Arc<Self>> {
        let pd = NonNull::new(unsafe { ibv_alloc_pd(verbs.as_ptr()) })
            .ok_or_else(|| Error::verbs("ibv_alloc_pd"))?;

        let channel = NonNull::new(unsafe { ibv_create_comp_channel(verbs.as_ptr()) })
            .ok_or_else(|| Error::verbs("ibv_create_comp_channel"))?;
        // the poller multiplexes the channel with a timeout, so reads from it
        // must not block
        let fd = unsafe { (*channel.as_ptr()).fd };
        set_nonblocking(fd)?;

        let cq = NonNull::new(unsafe {
            ibv_create_cq(verbs.as_ptr(), config.cq_depth, ptr::null_mut(), channel.as_ptr(), 0)
        })
        .ok_or_else(|| Error::verbs("ibv_create_cq"))?;
        let rc = unsafe { ibv_req_notify_cq(cq.as_ptr(), 0) };
        if rc != 0 {
            return Err(Error::verbs_errno("ibv_req_notify_cq", rc));
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let handles = CqHandles {
            cq: cq.as_ptr(),
            channel: channel.as_ptr(),
            fd,
        };
        let poller = {
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("cq-poller".into())
                .spawn(move || poller::run(handles, table, handler, shutdown))
                .map_err(|e| Error::Io {
                    op: "spawn completion poller",
                    source: e,
                })?
        };

        Ok(Arc::new(DeviceContext {
            verbs,
            pd,
            cq,
            channel,
            shutdown,
            poller: Mutex::new(Some(poller)),
        }))
    }

    pub(crate) fn pd(&self) -> *mut ibv_pd {
        self.pd.as_ptr()
    }

    pub(crate) fn cq(&self) -> *mut ibv_cq {
        self.cq.as_ptr()
    }

    pub(crate) fn raw_verbs(&self) -> *mut ibv_context {
        self.verbs.as_ptr()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // stop the poller before destroying anything it reads
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.poller.lock().unwrap().take() {
            if handle.join().is_err() {
                warn!("completion poller panicked");
            }
        }
        unsafe {
            let rc = ibv_destroy_cq(self.cq.as_ptr());
            if rc != 0 {
                warn!(errno = rc, "ibv_destroy_cq failed");
            }
            let rc = ibv_destroy_comp_channel(self.channel.as_ptr());
            if rc != 0 {
                warn!(errno = rc, "ibv_destroy_comp_channel failed");
            }
            let rc = ibv_dealloc_pd(self.pd.as_ptr());
            if rc != 0 {
                warn!(errno = rc, "ibv_dealloc_pd failed");
            }
        }
        // the verbs context belongs to librdmacm and is not closed here
    }
}

/// Hands out the one [`DeviceContext`] of this process.
pub struct DeviceRegistry {
    slot: Mutex<Option<Arc<DeviceContext>>>,
}

impl DeviceRegistry {
    /// An empty registry; the context is built on first use.
    pub fn new() -> Self {
        DeviceRegistry {
            slot: Mutex::new(None),
        }
    }

    /// Return the shared device context, building it (and spawning the
    /// completion poller) on the first call. A different device on a later
    /// call is a fatal configuration error.
    pub fn ensure(
        &self,
        verbs: NonNull<ibv_context>,
        handler: Arc<dyn CompletionHandler>,
        table: Arc<ConnectionTable>,
        config: &EchoConfig,
    ) -> Result<Arc<DeviceContext>> {
        let mut slot = self.slot.lock().unwrap();
        if let Some(device) = slot.as_ref() {
            if device.raw_verbs() != verbs.as_ptr() {
                return Err(Error::DeviceMismatch);
            }
            return Ok(device.clone());
        }
        let device = DeviceContext::build(verbs, handler, table, config)?;
        *slot = Some(device.clone());
        Ok(device)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Put the completion-channel fd into non-blocking mode, so
/// `ibv_get_cq_event` can be multiplexed with the shutdown flag.
fn set_nonblocking(fd: i32) -> Result<()> {
    let flags = nix::fcntl::fcntl(fd, nix::fcntl::F_GETFL).map_err(|e| Error::Verbs {
        op: "fcntl(F_GETFL)",
        source: e.into(),
    })?;
    let arg = nix::fcntl::FcntlArg::F_SETFL(
        nix::fcntl::OFlag::from_bits_retain(flags) | nix::fcntl::OFlag::O_NONBLOCK,
    );
    nix::fcntl::fcntl(fd, arg).map_err(|e| Error::Verbs {
        op: "fcntl(F_SETFL)",
        source: e.into(),
    })?;
    Ok(())
}
