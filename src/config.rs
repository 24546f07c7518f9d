//! Transport parameters.

use crate::wire::BUFFER_SIZE;

/// Fixed transport parameters of the echo service.
///
/// The defaults are the service's wire contract: fixed 1024-byte messages,
/// ten outstanding work requests per queue, a backlog of ten.
#[derive(Debug, Clone)]
pub struct EchoConfig {
    /// Size of the send and receive buffers, in bytes.
    pub buffer_size: usize,
    /// Outstanding work requests per queue (send and receive each).
    pub queue_depth: u32,
    /// Minimum completion-queue depth.
    pub cq_depth: i32,
    /// Listen backlog of pending connection requests.
    pub backlog: i32,
    /// Address and route resolution timeout, in milliseconds.
    pub resolve_timeout_ms: i32,
}

impl Default for EchoConfig {
    fn default() -> Self {
        EchoConfig {
            buffer_size: BUFFER_SIZE,
            queue_depth: 10,
            cq_depth: 10,
            backlog: 10,
            resolve_timeout_ms: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_wire_contract() {
        let config = EchoConfig::default();
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.queue_depth, 10);
        assert_eq!(config.cq_depth, 10);
        assert_eq!(config.backlog, 10);
        assert_eq!(config.resolve_timeout_ms, 500);
    }
}
