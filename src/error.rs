//! Error types for the echo service.

use std::io;

/// Errors surfaced by CM and verb calls.
///
/// Setup-path errors are fatal: the binaries log the failing operation and
/// exit with the underlying OS error code. Completion-path errors are logged
/// by the poller and do not terminate the process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A librdmacm call failed.
    #[error("{op}: {source}")]
    Cm {
        /// The failing call.
        op: &'static str,
        /// errno reported by the library.
        #[source]
        source: io::Error,
    },

    /// A libibverbs call failed.
    #[error("{op}: {source}")]
    Verbs {
        /// The failing call.
        op: &'static str,
        /// errno reported by the library.
        #[source]
        source: io::Error,
    },

    /// An ordinary I/O operation (thread spawn, stdin) failed.
    #[error("{op}: {source}")]
    Io {
        /// The failing operation.
        op: &'static str,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A second RDMA device showed up in one process. All peer connections
    /// of a process must share a single device context.
    #[error("peer connections in one process must share one RDMA device")]
    DeviceMismatch,

    /// The connect handshake was aborted by a CM error event.
    #[error("connection handshake failed: {event}")]
    Handshake {
        /// Description of the CM event that aborted the handshake.
        event: String,
    },

    /// The operation raced connection teardown.
    #[error("connection {0} is closed")]
    ConnectionClosed(usize),

    /// The payload does not fit the fixed wire buffer.
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge {
        /// Offered payload length.
        len: usize,
        /// Largest payload the wire buffer can carry.
        max: usize,
    },
}

impl Error {
    /// Wrap the current `errno` as a failed CM call.
    pub(crate) fn cm(op: &'static str) -> Self {
        Error::Cm {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Wrap the current `errno` as a failed verb call.
    pub(crate) fn verbs(op: &'static str) -> Self {
        Error::Verbs {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Wrap an explicit error code as a failed verb call. Some verbs return
    /// the error number directly instead of setting `errno`.
    pub(crate) fn verbs_errno(op: &'static str, errno: i32) -> Self {
        Error::Verbs {
            op,
            source: io::Error::from_raw_os_error(errno),
        }
    }

    /// The OS error code behind this error, when there is one. Binaries use
    /// it as their exit code on fatal failures.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Cm { source, .. } | Error::Verbs { source, .. } | Error::Io { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

/// Result alias for echo-service operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failing_operation() {
        let err = Error::verbs_errno("ibv_post_send", libc::ENOMEM);
        assert!(err.to_string().starts_with("ibv_post_send: "));
    }

    #[test]
    fn errno_is_preserved_for_verb_failures() {
        let err = Error::verbs_errno("ibv_create_cq", libc::EINVAL);
        assert_eq!(err.errno(), Some(libc::EINVAL));
    }

    #[test]
    fn logical_errors_have_no_errno() {
        assert_eq!(Error::DeviceMismatch.errno(), None);
        assert_eq!(Error::ConnectionClosed(3).errno(), None);
    }
}
