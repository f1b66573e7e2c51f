//! In-process link between two endpoints, used for headless runs and tests.
//! Reachability and message loss are driven from the `InMemoryLink` handle.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::TransportError;

use super::{
    envelope::{SyncEnvelope, SyncReply},
    transport::{Inbound, LinkState, SyncTransport},
};

#[derive(Default)]
struct Outbox {
    transfers: VecDeque<SyncEnvelope>,
    context: Option<SyncEnvelope>,
}

struct Side {
    outbox: Mutex<Outbox>,
    peer_inbound: mpsc::UnboundedSender<Inbound>,
}

struct Shared {
    link: watch::Sender<LinkState>,
    sides: [Side; 2],
    drop_messages: AtomicBool,
}

impl Shared {
    fn outbox(&self, side: usize) -> MutexGuard<'_, Outbox> {
        self.sides[side]
            .outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn deliverable(&self) -> bool {
        let state = *self.link.borrow();
        state.activated && state.reachable
    }

    /// Pushes queued transfers, then the pending context, to the other side.
    fn flush(&self, side: usize) {
        if !self.deliverable() {
            return;
        }
        let (transfers, context) = {
            let mut outbox = self.outbox(side);
            (std::mem::take(&mut outbox.transfers), outbox.context.take())
        };
        let peer = &self.sides[side].peer_inbound;
        for envelope in transfers {
            let _ = peer.send(Inbound::Transfer(envelope));
        }
        if let Some(envelope) = context {
            let _ = peer.send(Inbound::Context(envelope));
        }
    }
}

pub struct InMemoryTransport {
    shared: Arc<Shared>,
    side: usize,
}

pub struct Endpoint {
    pub transport: Arc<InMemoryTransport>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Control handle for a paired in-memory link.
#[derive(Clone)]
pub struct InMemoryLink {
    shared: Arc<Shared>,
}

impl InMemoryLink {
    pub fn pair(initial: LinkState) -> (InMemoryLink, Endpoint, Endpoint) {
        let (to_a, inbound_a) = mpsc::unbounded_channel();
        let (to_b, inbound_b) = mpsc::unbounded_channel();
        let (link, _) = watch::channel(initial);

        let shared = Arc::new(Shared {
            link,
            sides: [
                Side {
                    outbox: Mutex::new(Outbox::default()),
                    peer_inbound: to_b,
                },
                Side {
                    outbox: Mutex::new(Outbox::default()),
                    peer_inbound: to_a,
                },
            ],
            drop_messages: AtomicBool::new(false),
        });

        let endpoint = |side: usize, inbound| Endpoint {
            transport: Arc::new(InMemoryTransport {
                shared: shared.clone(),
                side,
            }),
            inbound,
        };
        let a = endpoint(0, inbound_a);
        let b = endpoint(1, inbound_b);

        (InMemoryLink { shared }, a, b)
    }

    pub fn state(&self) -> LinkState {
        *self.shared.link.borrow()
    }

    pub fn set_state(&self, state: LinkState) {
        self.shared.link.send_replace(state);
        self.shared.flush(0);
        self.shared.flush(1);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.set_state(LinkState {
            reachable,
            ..self.state()
        });
    }

    /// While set, immediate messages vanish and their replies never come.
    pub fn set_drop_messages(&self, drop: bool) {
        self.shared.drop_messages.store(drop, Ordering::SeqCst);
    }

    /// Transfers still waiting for the link on one side (0 or 1).
    pub fn queued_transfers(&self, side: usize) -> usize {
        self.shared.outbox(side).transfers.len()
    }
}

#[async_trait]
impl SyncTransport for InMemoryTransport {
    fn link_state(&self) -> LinkState {
        *self.shared.link.borrow()
    }

    fn watch_link(&self) -> watch::Receiver<LinkState> {
        self.shared.link.subscribe()
    }

    async fn send_message(&self, envelope: SyncEnvelope) -> Result<SyncReply, TransportError> {
        let state = self.link_state();
        if !state.activated {
            return Err(TransportError::NotActivated);
        }
        if !state.reachable {
            return Err(TransportError::Unreachable);
        }
        if self.shared.drop_messages.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.sides[self.side]
            .peer_inbound
            .send(Inbound::Message {
                envelope,
                reply: reply_tx,
            })
            .map_err(|_| TransportError::Disconnected)?;

        reply_rx.await.map_err(|_| TransportError::Disconnected)
    }

    async fn transfer(&self, envelope: SyncEnvelope) -> Result<(), TransportError> {
        if !self.link_state().activated {
            return Err(TransportError::NotActivated);
        }
        self.shared.outbox(self.side).transfers.push_back(envelope);
        self.shared.flush(self.side);
        Ok(())
    }

    async fn update_context(&self, envelope: SyncEnvelope) -> Result<(), TransportError> {
        if !self.link_state().activated {
            return Err(TransportError::NotActivated);
        }
        self.shared.outbox(self.side).context = Some(envelope);
        self.shared.flush(self.side);
        Ok(())
    }
}
