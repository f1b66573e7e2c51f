use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{oneshot, watch};

use crate::error::TransportError;

use super::envelope::{SyncEnvelope, SyncReply};

/// Pairing and reachability as reported by the platform link.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LinkState {
    pub activated: bool,
    pub paired: bool,
    pub counterpart_installed: bool,
    pub reachable: bool,
}

impl LinkState {
    pub fn connected() -> Self {
        Self {
            activated: true,
            paired: true,
            counterpart_installed: true,
            reachable: true,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::connected()
        }
    }
}

/// What arrives from the peer, tagged with the primitive that carried it.
#[derive(Debug)]
pub enum Inbound {
    /// Immediate message; the peer waits on `reply`.
    Message {
        envelope: SyncEnvelope,
        reply: oneshot::Sender<SyncReply>,
    },
    /// Queued transfer, delivered in order once the link allows it.
    Transfer(SyncEnvelope),
    /// Latest context; an unread context is overwritten by a newer one.
    Context(SyncEnvelope),
}

impl Inbound {
    pub fn envelope(&self) -> &SyncEnvelope {
        match self {
            Inbound::Message { envelope, .. } => envelope,
            Inbound::Transfer(envelope) | Inbound::Context(envelope) => envelope,
        }
    }
}

/// The four link primitives the coordinator composes. Inbound traffic is
/// handed out separately as an `mpsc` receiver by whoever builds the transport.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    fn link_state(&self) -> LinkState;

    /// Push notifications for pairing and reachability changes.
    fn watch_link(&self) -> watch::Receiver<LinkState>;

    /// Best effort; fails unless the peer is reachable right now. Callers
    /// apply their own reply timeout.
    async fn send_message(&self, envelope: SyncEnvelope) -> Result<SyncReply, TransportError>;

    /// Guaranteed eventual delivery, queued while the peer is away.
    async fn transfer(&self, envelope: SyncEnvelope) -> Result<(), TransportError>;

    /// Last-write-wins state broadcast.
    async fn update_context(&self, envelope: SyncEnvelope) -> Result<(), TransportError>;
}
