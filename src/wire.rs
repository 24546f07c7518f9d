//! Fixed-size message framing.
//!
//! Every message on the wire is exactly [`BUFFER_SIZE`] bytes: the ASCII
//! payload followed by NUL padding. The padding guarantees a terminator, so
//! the largest payload is one byte short of the buffer.

use crate::error::{Error, Result};

/// Size of every message buffer, in bytes.
pub const BUFFER_SIZE: usize = 1024;

/// Largest payload a message buffer can carry.
pub const MAX_PAYLOAD: usize = BUFFER_SIZE - 1;

/// Client input that requests a graceful shutdown instead of an exchange.
pub const EXIT_SENTINEL: &str = "exit";

/// Copy `payload` into `buf` and zero the remainder.
///
/// Fails with [`Error::PayloadTooLarge`] when the payload would leave no
/// room for the NUL terminator.
pub fn encode_payload(payload: &[u8], buf: &mut [u8]) -> Result<()> {
    if payload.len() >= buf.len() {
        return Err(Error::PayloadTooLarge {
            len: payload.len(),
            max: buf.len().saturating_sub(1),
        });
    }
    buf[..payload.len()].copy_from_slice(payload);
    buf[payload.len()..].fill(0);
    Ok(())
}

/// Decode the payload of a padded buffer: everything up to the first NUL.
pub fn decode_payload(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Whether a line of client input is the shutdown sentinel.
pub fn is_exit(line: &str) -> bool {
    line == EXIT_SENTINEL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_trims_padding() {
        let mut buf = [0xffu8; BUFFER_SIZE];
        encode_payload(b"hello rdma", &mut buf).unwrap();
        assert_eq!(decode_payload(&buf), "hello rdma");
        // the rest of the buffer is zeroed, not left over from earlier use
        assert!(buf[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn empty_payload_round_trips() {
        let mut buf = [0xffu8; BUFFER_SIZE];
        encode_payload(b"", &mut buf).unwrap();
        assert_eq!(decode_payload(&buf), "");
    }

    #[test]
    fn max_payload_fits() {
        let mut buf = [0u8; BUFFER_SIZE];
        let payload = vec![b'a'; MAX_PAYLOAD];
        encode_payload(&payload, &mut buf).unwrap();
        assert_eq!(decode_payload(&buf).len(), MAX_PAYLOAD);
    }

    #[test]
    fn full_buffer_payload_is_rejected() {
        let mut buf = [0u8; BUFFER_SIZE];
        let payload = vec![b'a'; BUFFER_SIZE];
        match encode_payload(&payload, &mut buf) {
            Err(Error::PayloadTooLarge { len, max }) => {
                assert_eq!(len, BUFFER_SIZE);
                assert_eq!(max, MAX_PAYLOAD);
            }
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_buffer_decodes_whole() {
        let buf = [b'x'; 8];
        assert_eq!(decode_payload(&buf), "xxxxxxxx");
    }

    #[test]
    fn sentinel_is_exact_match() {
        assert!(is_exit("exit"));
        assert!(!is_exit("exit "));
        assert!(!is_exit("EXIT"));
        assert!(!is_exit("quit"));
    }
}
