//! DM dispatch
//!
//! The bridge queues direct messages to users (welcome, bridging requests)
//! and moves on. Delivery belongs to whoever consumes the queue.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::db::schemas::{DmKind, UserKey};

/// A direct message to send to a user via a protocol's bot account
#[derive(Clone, Debug, PartialEq)]
pub struct DirectMessage {
    pub to: UserKey,
    /// Protocol whose bot account sends it
    pub from_protocol: String,
    pub kind: DmKind,
    pub text: String,
}

/// Fire-and-forget DM queue
pub trait Notifier: Send + Sync {
    fn queue(&self, dm: DirectMessage);
}

/// [`Notifier`] backed by an unbounded channel
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<DirectMessage>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DirectMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn queue(&self, dm: DirectMessage) {
        debug!(to = %dm.to, kind = ?dm.kind, "Queueing DM");
        if let Err(e) = self.tx.send(dm) {
            warn!(to = %e.0.to, "DM queue closed, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.queue(DirectMessage {
            to: UserKey::new("activitypub", "https://inst/alice"),
            from_protocol: "atproto".into(),
            kind: DmKind::Welcome,
            text: "hi".into(),
        });

        let dm = rx.recv().await.unwrap();
        assert_eq!(dm.kind, DmKind::Welcome);
    }

    #[test]
    fn test_closed_queue_does_not_panic() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        notifier.queue(DirectMessage {
            to: UserKey::new("web", "user.com"),
            from_protocol: "activitypub".into(),
            kind: DmKind::RequestBridging,
            text: "hi".into(),
        });
    }
}
