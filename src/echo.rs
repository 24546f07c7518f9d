//! Role-specific echo protocol handlers.

use tracing::{info, warn};

use crate::connection::PeerConnection;
use crate::poller::{Completion, CompletionHandler, CompletionKind};

/// What the server does in reaction to one completion class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reaction {
    /// Post a replacement receive before anything else.
    pub(crate) replenish_receive: bool,
    /// Copy the received payload into the send buffer and post the echo.
    pub(crate) echo_back: bool,
}

/// Each inbound message consumes one receive work item, so the server must
/// repost one receive per receive completion or the queue pair stops
/// accepting traffic after `queue_depth` exchanges.
pub(crate) fn server_reaction(kind: CompletionKind) -> Reaction {
    match kind {
        CompletionKind::Receive => Reaction {
            replenish_receive: true,
            echo_back: true,
        },
        CompletionKind::Send | CompletionKind::Other(_) => Reaction {
            replenish_receive: false,
            echo_back: false,
        },
    }
}

/// Client handler: prints both directions of the exchange on stdout.
pub struct ClientEcho;

impl CompletionHandler for ClientEcho {
    fn on_completion(&self, conn: &PeerConnection, completion: &Completion) {
        match completion.kind {
            CompletionKind::Receive => {
                println!("[{}] received: {}", conn.key(), conn.recv_payload());
            }
            CompletionKind::Send => {
                println!("[{}] sent: {}", conn.key(), conn.send_payload());
            }
            CompletionKind::Other(opcode) => {
                warn!(key = conn.key(), opcode, "unexpected completion");
            }
        }
    }
}

/// Server handler: echoes every received payload back to its sender.
pub struct ServerEcho;

impl CompletionHandler for ServerEcho {
    fn on_completion(&self, conn: &PeerConnection, completion: &Completion) {
        let reaction = server_reaction(completion.kind);
        if reaction.replenish_receive {
            if let Err(e) = conn.post_receive() {
                warn!(key = conn.key(), error = %e, "failed to replenish receive");
            }
        }
        if reaction.echo_back {
            conn.copy_recv_to_send();
            match conn.post_send() {
                Ok(()) => info!(key = conn.key(), payload = %conn.send_payload(), "echoing"),
                Err(e) => warn!(key = conn.key(), error = %e, "failed to post echo"),
            }
        }
        if completion.kind == CompletionKind::Send {
            info!(key = conn.key(), payload = %conn.send_payload(), "echoed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_consumed_receive_is_replenished() {
        let reaction = server_reaction(CompletionKind::Receive);
        assert!(reaction.replenish_receive);
        assert!(reaction.echo_back);
    }

    #[test]
    fn send_completions_post_nothing() {
        let reaction = server_reaction(CompletionKind::Send);
        assert!(!reaction.replenish_receive);
        assert!(!reaction.echo_back);
    }

    #[test]
    fn unknown_opcodes_post_nothing() {
        let reaction = server_reaction(CompletionKind::Other(97));
        assert_eq!(
            reaction,
            Reaction {
                replenish_receive: false,
                echo_back: false
            }
        );
    }
}
