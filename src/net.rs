//! Session-scoped broadcast channel handle.
//!
//! The transport layer multiplexes one authenticated broadcast channel per
//! session and hands the core a pair of bounded queues: one towards the wire
//! and one with inbound traffic. Inbound messages carry the public key the
//! transport authenticated the sender with; the core never sees raw wire
//! bytes. Delivery is at-least-once with best-effort ordering, so the
//! protocol de-duplicates and tag-filters on its side.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::group::OperatorPublicKey;

/// Outcome of queueing a message for transmission.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The transport is permanently gone; the session cannot continue.
    #[error("broadcast transport shut down")]
    Shutdown,
    /// The phase or session context fired while the send was blocked on
    /// backpressure.
    #[error("send cancelled")]
    Cancelled,
}

/// An inbound broadcast message together with the sender identity the
/// transport vouched for.
#[derive(Clone, Debug)]
pub struct IncomingMessage<M> {
    pub payload: M,
    pub sender_public_key: OperatorPublicKey,
}

/// Cheap cloneable handle for disseminating messages to all group members.
#[derive(Debug)]
pub struct BroadcastSender<M>(mpsc::Sender<M>);

impl<M> Clone for BroadcastSender<M> {
    fn clone(&self) -> Self {
        BroadcastSender(self.0.clone())
    }
}

impl<M> BroadcastSender<M> {
    /// Queues `message` for transmission to every member. Returns once the
    /// transport accepted it; a blocked send observes `cancel`.
    pub async fn send(&self, cancel: &CancellationToken, message: M) -> Result<(), SendError> {
        tokio::select! {
            biased;
            queued = self.0.send(message) => queued.map_err(|_| SendError::Shutdown),
            _ = cancel.cancelled() => Err(SendError::Cancelled),
        }
    }
}

/// The per-session channel handle given to the protocol core.
#[derive(Debug)]
pub struct BroadcastChannel<M> {
    sender: BroadcastSender<M>,
    receiver: mpsc::Receiver<IncomingMessage<M>>,
}

impl<M> BroadcastChannel<M> {
    pub fn new(
        outgoing: mpsc::Sender<M>,
        incoming: mpsc::Receiver<IncomingMessage<M>>,
    ) -> Self {
        BroadcastChannel {
            sender: BroadcastSender(outgoing),
            receiver: incoming,
        }
    }

    pub fn split(self) -> (BroadcastSender<M>, mpsc::Receiver<IncomingMessage<M>>) {
        (self.sender, self.receiver)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn send_queues_for_transmission() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (_in_tx, in_rx) = mpsc::channel::<IncomingMessage<&'static str>>(4);
        let (sender, _receiver) = BroadcastChannel::new(out_tx, in_rx).split();

        let cancel = CancellationToken::new();
        sender.send(&cancel, "hello").await.unwrap();
        assert_eq!(out_rx.recv().await, Some("hello"));
    }

    #[tokio::test]
    async fn send_after_transport_loss_fails() {
        let (out_tx, out_rx) = mpsc::channel::<&'static str>(1);
        drop(out_rx);
        let sender = BroadcastSender(out_tx);
        let cancel = CancellationToken::new();
        assert_eq!(sender.send(&cancel, "x").await, Err(SendError::Shutdown));
    }

    #[tokio::test]
    async fn blocked_send_observes_cancellation() {
        let (out_tx, _out_rx) = mpsc::channel::<u32>(1);
        let sender = BroadcastSender(out_tx);
        let cancel = CancellationToken::new();

        // fill the queue so the next send blocks on backpressure
        sender.send(&cancel, 1).await.unwrap();
        cancel.cancel();
        assert_eq!(sender.send(&cancel, 2).await, Err(SendError::Cancelled));
    }
}
