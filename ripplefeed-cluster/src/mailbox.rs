//! Typed mailbox addresses
//!
//! An `Addr<M>` is an opaque destination that accepts exactly one message
//! type. Delivery to one address is reliable and ordered; nothing is promised
//! about ordering across addresses. Addresses compare by `(peer, id)` so they
//! can key maps.

use async_trait::async_trait;
use bytes::Bytes;
use ripplefeed_core::{PeerId, SubscriptionId};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{decode_frame, encode_frame, StampedMsg};

/// Delivery endpoint behind an address
#[async_trait]
pub trait MessageSink<M>: Send + Sync {
    /// Deliver one message
    async fn send(&self, msg: M) -> Result<()>;

    /// Resolves once the receiving side is gone
    async fn closed(&self);
}

/// Address of a subscriber's inbound mailbox
pub type ClientAddr = Addr<StampedMsg>;

/// Address a Broadcast Server listens on for unsubscribe requests
pub type StopAddr = Addr<StopRequest>;

/// Unsubscribe request sent to a Broadcast Server's [`StopAddr`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopRequest {
    /// Drop the region or limit window registered for one subscription
    ///
    /// The client stays registered, so its stamps keep counting up.
    Subscription { client: ClientAddr, sub: SubscriptionId },
    /// Drop the client and everything it registered
    Client(ClientAddr),
}

impl StopRequest {
    #[must_use]
    pub const fn client(&self) -> &ClientAddr {
        match self {
            Self::Subscription { client, .. } | Self::Client(client) => client,
        }
    }
}

pub struct Addr<M> {
    peer: PeerId,
    id: Uuid,
    sink: Arc<dyn MessageSink<M>>,
}

impl<M: Send + 'static> Addr<M> {
    pub fn new(peer: PeerId, sink: Arc<dyn MessageSink<M>>) -> Self {
        Self {
            peer,
            id: Uuid::new_v4(),
            sink,
        }
    }

    pub async fn send(&self, msg: M) -> Result<()> {
        self.sink.send(msg).await
    }

    pub async fn closed(&self) {
        self.sink.closed().await;
    }
}

impl<M> Addr<M> {
    #[must_use]
    pub const fn peer(&self) -> &PeerId {
        &self.peer
    }

    #[must_use]
    pub const fn id(&self) -> &Uuid {
        &self.id
    }
}

impl<M> Clone for Addr<M> {
    fn clone(&self) -> Self {
        Self {
            peer: self.peer.clone(),
            id: self.id,
            sink: Arc::clone(&self.sink),
        }
    }
}

impl<M> fmt::Debug for Addr<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("peer", &self.peer)
            .field("id", &self.id)
            .finish()
    }
}

impl<M> fmt::Display for Addr<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer, self.id)
    }
}

impl<M> PartialEq for Addr<M> {
    fn eq(&self, other: &Self) -> bool {
        self.peer == other.peer && self.id == other.id
    }
}

impl<M> Eq for Addr<M> {}

impl<M> PartialOrd for Addr<M> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<M> Ord for Addr<M> {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.peer, &self.id).cmp(&(&other.peer, &other.id))
    }
}

impl<M> Hash for Addr<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer.hash(state);
        self.id.hash(state);
    }
}

/// In-process sink backed by an unbounded tokio channel
struct ChannelSink<M> {
    tx: mpsc::UnboundedSender<M>,
}

#[async_trait]
impl<M: Send + 'static> MessageSink<M> for ChannelSink<M> {
    async fn send(&self, msg: M) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| Error::Delivery("mailbox receiver dropped".to_string()))
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}

/// Create an in-process mailbox owned by `peer`
pub fn mailbox<M: Send + 'static>(peer: PeerId) -> (Addr<M>, mpsc::UnboundedReceiver<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Addr::new(peer, Arc::new(ChannelSink { tx })), rx)
}

/// Sink that encodes stamped messages into wire frames
struct FrameSink {
    tx: mpsc::Sender<Bytes>,
}

#[async_trait]
impl MessageSink<StampedMsg> for FrameSink {
    async fn send(&self, msg: StampedMsg) -> Result<()> {
        let frame = encode_frame(&msg)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::Delivery("frame channel closed".to_string()))
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}

/// Client address whose messages travel as encoded frames over `tx`
pub fn frame_mailbox(peer: PeerId, tx: mpsc::Sender<Bytes>) -> ClientAddr {
    Addr::new(peer, Arc::new(FrameSink { tx }))
}

/// Counters reported by [`relay_frames`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub relayed: u64,
    pub discarded: u64,
}

/// Decode frames from `frames` and forward them to `target`
///
/// A malformed frame is logged and discarded; the channel stays open. Returns
/// when the frame channel closes or `target` stops accepting messages.
pub async fn relay_frames(mut frames: mpsc::Receiver<Bytes>, target: ClientAddr) -> RelayStats {
    let mut stats = RelayStats::default();

    while let Some(frame) = frames.recv().await {
        let msg = match decode_frame(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, frame_len = frame.len(), "Discarding malformed changefeed frame");
                stats.discarded += 1;
                continue;
            }
        };

        if let Err(e) = target.send(msg).await {
            debug!(error = %e, target = %target, "Relay target gone, stopping");
            break;
        }
        stats.relayed += 1;
    }

    stats
}
