//! Raw message channel between the window and worker contexts.
//!
//! A [`channel_pair`] produces two [`MessagePort`] endpoints wired back to
//! back. Delivery is in-order and best-effort: once the peer endpoint is
//! dropped, sends become silent no-ops rather than errors, because the
//! sender has no liveness protocol to learn the peer is gone.
//!
//! Ports are owned, non-cloneable handles. A port can ride inside an
//! [`Envelope`] to be *moved* to the peer context atomically with the
//! message. This is how the collaboration handshake hands a dedicated
//! channel to the worker.

use tokio::sync::mpsc;

/// A unit of traffic on a port: opaque payload bytes plus at most one
/// transferred port.
pub struct Envelope {
    /// Wire-encoded payload.
    pub bytes: Vec<u8>,
    /// Port moved along with this message, if any.
    pub transfer: Option<MessagePort>,
}

impl Envelope {
    /// Wrap payload bytes with no transfer.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            transfer: None,
        }
    }

    /// Wrap payload bytes and move a port along with them.
    pub fn with_transfer(bytes: Vec<u8>, port: MessagePort) -> Self {
        Self {
            bytes,
            transfer: Some(port),
        }
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("bytes", &self.bytes.len())
            .field("transfer", &self.transfer.is_some())
            .finish()
    }
}

/// One end of a two-ended transport. Exclusive ownership: once sent to the
/// peer context inside an [`Envelope`], the sender must not use it again, and
/// the type system enforces this because `MessagePort` is not `Clone`.
pub struct MessagePort {
    tx: PortTx,
    rx: PortRx,
}

/// Send half of a split port.
pub struct PortTx {
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Receive half of a split port.
pub struct PortRx {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

/// Create a connected pair of ports.
pub fn channel_pair() -> (MessagePort, MessagePort) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MessagePort {
            tx: PortTx { tx: a_tx },
            rx: PortRx { rx: a_rx },
        },
        MessagePort {
            tx: PortTx { tx: b_tx },
            rx: PortRx { rx: b_rx },
        },
    )
}

impl MessagePort {
    /// Send an envelope to the peer.
    ///
    /// Returns `true` if the peer could still receive it, `false` if the
    /// peer endpoint is gone (the message is dropped silently).
    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope)
    }

    /// Receive the next envelope. Yields `None` once the peer endpoint is
    /// dropped and the in-flight queue is drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Whether the peer endpoint has been dropped.
    pub fn is_peer_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Split into independent send/receive halves so separate tasks (or
    /// separate `select!` arms) can own each direction.
    pub fn split(self) -> (PortTx, PortRx) {
        (self.tx, self.rx)
    }

    /// Close this endpoint. The peer's `recv` terminates after draining.
    pub fn close(self) {}
}

impl std::fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePort")
            .field("peer_closed", &self.is_peer_closed())
            .finish()
    }
}

impl PortTx {
    /// Send an envelope; `false` means the peer is gone and the message was
    /// dropped.
    pub fn send(&self, envelope: Envelope) -> bool {
        match self.tx.send(envelope) {
            Ok(()) => true,
            Err(_) => {
                log::trace!("port send dropped: peer endpoint closed");
                false
            }
        }
    }

    /// Whether the peer endpoint has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PortRx {
    /// Receive the next envelope; `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, mut b) = channel_pair();

        for i in 0..10u8 {
            assert!(a.send(Envelope::new(vec![i])));
        }

        for i in 0..10u8 {
            let env = b.recv().await.unwrap();
            assert_eq!(env.bytes, vec![i]);
            assert!(env.transfer.is_none());
        }
    }

    #[tokio::test]
    async fn test_bidirectional() {
        let (mut a, mut b) = channel_pair();

        a.send(Envelope::new(b"ping".to_vec()));
        assert_eq!(b.recv().await.unwrap().bytes, b"ping");

        b.send(Envelope::new(b"pong".to_vec()));
        assert_eq!(a.recv().await.unwrap().bytes, b"pong");
    }

    #[tokio::test]
    async fn test_send_after_peer_drop_is_noop() {
        let (a, b) = channel_pair();
        drop(b);

        // Not an error, just a no-op.
        assert!(!a.send(Envelope::new(vec![1, 2, 3])));
        assert!(a.is_peer_closed());
    }

    #[tokio::test]
    async fn test_recv_terminates_after_close() {
        let (a, mut b) = channel_pair();
        a.send(Envelope::new(vec![7]));
        a.close();

        // Queued message still arrives, then the stream ends.
        assert_eq!(b.recv().await.unwrap().bytes, vec![7]);
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_port_transfer_moves_endpoint() {
        let (a, mut b) = channel_pair();
        let (inner_a, mut inner_b) = channel_pair();

        // Move one end of the inner pair across the outer channel.
        a.send(Envelope::with_transfer(b"handshake".to_vec(), inner_a));

        let env = b.recv().await.unwrap();
        assert_eq!(env.bytes, b"handshake");
        let moved = env.transfer.unwrap();

        // The moved endpoint still talks to its original peer.
        moved.send(Envelope::new(b"via moved port".to_vec()));
        assert_eq!(inner_b.recv().await.unwrap().bytes, b"via moved port");
    }

    #[tokio::test]
    async fn test_split_halves() {
        let (a, b) = channel_pair();
        let (a_tx, _a_rx) = a.split();
        let (_b_tx, mut b_rx) = b.split();

        assert!(a_tx.send(Envelope::new(vec![9])));
        assert_eq!(b_rx.recv().await.unwrap().bytes, vec![9]);
    }
}
