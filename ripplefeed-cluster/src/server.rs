//! Per-shard Broadcast Server
//!
//! One `Server` exists per physical shard. It registers subscribers, stamps
//! every outbound message with a per-subscriber sequence number, and fans
//! changes out to every subscriber whose region covers the changed key. Limit
//! subscriptions get their own [`LimitWindow`] and receive window diffs
//! instead of raw changes.
//!
//! Locking is two-level: `clients` is a reader-writer lock (fan-outs and stamp
//! reads share it, registration and removal take it exclusively) and every
//! limit window has its own mutex underneath, so unrelated windows never
//! contend.

use futures::future::join_all;
use ripplefeed_core::{Datum, PeerId, Region, ShardId, SubscriptionId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::limit::LimitWindow;
use crate::mailbox::{mailbox, ClientAddr, StopAddr, StopRequest};
use crate::protocol::{KeyedRow, LimitSpec, Msg, StampedMsg};
use crate::storage::RowSource;

/// Old and new value of one secondary index for a written row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexChange {
    pub old: Option<Datum>,
    pub new: Option<Datum>,
}

/// A row write as seen by the change-feed layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub primary_key: Datum,
    pub old_val: Option<Datum>,
    pub new_val: Option<Datum>,
    /// Index values per secondary index (the primary index included when a
    /// limit subscription orders by it)
    pub index_changes: BTreeMap<String, IndexChange>,
}

impl Mutation {
    #[must_use]
    pub const fn new(primary_key: Datum, old_val: Option<Datum>, new_val: Option<Datum>) -> Self {
        Self {
            primary_key,
            old_val,
            new_val,
            index_changes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_index(mut self, sindex: impl Into<String>, old: Option<Datum>, new: Option<Datum>) -> Self {
        self.index_changes.insert(sindex.into(), IndexChange { old, new });
        self
    }
}

type SharedWindow = Arc<Mutex<LimitWindow>>;

struct ClientInfo {
    /// Cancelled when the subscriber is gone; child of the server's token
    alive: CancellationToken,
    stamp: AtomicU64,
    regions: BTreeMap<SubscriptionId, Region>,
    limit_clients: BTreeMap<String, BTreeMap<SubscriptionId, SharedWindow>>,
}

impl ClientInfo {
    fn wants(&self, key: Option<&Datum>) -> bool {
        key.map_or(true, |key| self.regions.values().any(|region| region.contains(key)))
    }
}

pub struct Server {
    uuid: ShardId,
    table: String,
    clients: RwLock<BTreeMap<ClientAddr, ClientInfo>>,
    stop_addr: StopAddr,
    stopped: CancellationToken,
    tracker: TaskTracker,
    weak_self: Weak<Server>,
}

impl Server {
    /// Create a server and start its unsubscribe mailbox
    pub fn new(peer: PeerId, table: impl Into<String>) -> Arc<Self> {
        let (stop_addr, mut stop_rx) = mailbox::<StopRequest>(peer);

        let server = Arc::new_cyclic(|weak_self| Self {
            uuid: ShardId::new(),
            table: table.into(),
            clients: RwLock::new(BTreeMap::new()),
            stop_addr,
            stopped: CancellationToken::new(),
            tracker: TaskTracker::new(),
            weak_self: weak_self.clone(),
        });

        let weak = Arc::downgrade(&server);
        let stopped = server.stopped.clone();
        server.tracker.spawn(async move {
            loop {
                tokio::select! {
                    () = stopped.cancelled() => break,
                    request = stop_rx.recv() => {
                        let (Some(request), Some(server)) = (request, weak.upgrade()) else {
                            break;
                        };
                        match request {
                            StopRequest::Subscription { client, sub } => {
                                server.remove_subscription(&client, &sub).await;
                            }
                            StopRequest::Client(client) => server.remove_client(&client, "unsubscribed").await,
                        }
                    }
                }
            }
        });

        info!(shard_id = %server.uuid, table = %server.table, "Broadcast server started");
        server
    }

    /// Identity stamped onto every message this server sends
    #[must_use]
    pub const fn uuid(&self) -> ShardId {
        self.uuid
    }

    /// Address subscribers send [`StopRequest`]s to
    #[must_use]
    pub fn stop_addr(&self) -> StopAddr {
        self.stop_addr.clone()
    }

    /// Cancelled once the server is terminal
    #[must_use]
    pub fn stopped_token(&self) -> CancellationToken {
        self.stopped.clone()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn has_client(&self, addr: &ClientAddr) -> bool {
        self.clients.read().await.contains_key(addr)
    }

    /// Register interest of `addr` in `region` on behalf of subscription `sub`
    ///
    /// Returns the stamp the next message to `addr` will carry. Registration
    /// and the stamp read happen under the exclusive lock, so a read positioned
    /// at the returned stamp neither misses nor repeats a pushed change.
    pub async fn add_client(&self, addr: &ClientAddr, sub: SubscriptionId, region: Region) -> Result<u64> {
        let mut clients = self.clients.write().await;
        if self.is_stopped() {
            return Err(Error::ServerStopped(self.uuid));
        }

        let info = self.client_entry(&mut clients, addr);
        info.regions.insert(sub, region);
        let stamp = info.stamp.load(Ordering::SeqCst);

        debug!(shard_id = %self.uuid, client = %addr, sub = %sub, stamp, "Client region registered");
        Ok(stamp)
    }

    /// Register a limit subscription seeded with `start_data` and send the
    /// seed as a `LimitStart` message
    ///
    /// Returns the stamp carried by the `LimitStart` message.
    pub async fn add_limit_client(
        &self,
        addr: &ClientAddr,
        region: Region,
        sub: SubscriptionId,
        spec: LimitSpec,
        start_data: Vec<KeyedRow>,
    ) -> Result<u64> {
        let mut clients = self.clients.write().await;
        if self.is_stopped() {
            return Err(Error::ServerStopped(self.uuid));
        }

        let table = self.table.clone();
        let info = self.client_entry(&mut clients, addr);
        let windows = info.limit_clients.entry(spec.sindex.clone()).or_default();
        if windows.contains_key(&sub) {
            return Err(Error::Registration(format!(
                "limit subscription {sub} already registered"
            )));
        }

        let sindex = spec.sindex.clone();
        let window = LimitWindow::new(table, sub, spec, region, start_data);
        let start = window.start_message();
        windows.insert(sub, Arc::new(Mutex::new(window)));

        let stamp = info.stamp.load(Ordering::SeqCst);
        self.send_one(addr, info, start).await;

        info!(shard_id = %self.uuid, client = %addr, sub = %sub, sindex = %sindex, stamp, "Limit client registered");
        Ok(stamp)
    }

    /// The stamp the next message to `addr` will carry, without consuming it
    pub async fn get_stamp(&self, addr: &ClientAddr) -> Option<u64> {
        self.clients
            .read()
            .await
            .get(addr)
            .map(|info| info.stamp.load(Ordering::SeqCst))
    }

    /// Deliver `msg` to every subscriber whose region contains `key`, or to
    /// every subscriber when `key` is `None`
    ///
    /// Holds the shared lock for the whole fan-out, so a subscriber cannot be
    /// removed mid-delivery. Returns the number of subscribers reached.
    pub async fn send_all(&self, msg: &Msg, key: Option<&Datum>) -> usize {
        if self.is_stopped() {
            debug!(shard_id = %self.uuid, kind = msg.kind(), "Server stopped, dropping message");
            return 0;
        }

        let clients = self.clients.read().await;
        self.fan_out(&clients, msg, key).await
    }

    /// Apply a row write: update the limit windows ordered by an index the
    /// write touched, then fan the raw change out by primary key
    ///
    /// `source` refills windows that the write left short; it must reflect the
    /// write already.
    pub async fn publish(&self, mutation: &Mutation, source: &dyn RowSource) -> Result<usize> {
        if self.is_stopped() {
            return Err(Error::ServerStopped(self.uuid));
        }

        let clients = self.clients.read().await;

        for (addr, info) in clients.iter() {
            for (sindex, change) in &mutation.index_changes {
                let Some(windows) = info.limit_clients.get(sindex) else {
                    continue;
                };
                for window in windows.values() {
                    let mut window = window.lock().await;
                    window.delete(&mutation.primary_key);
                    if let (Some(value), Some(row)) = (&change.new, &mutation.new_val) {
                        window.add(mutation.primary_key.clone(), value.clone(), row.clone());
                    }

                    // Sent under the window lock so diffs of one window keep stamp order
                    match window.commit(source).await {
                        Ok(msgs) => {
                            for msg in msgs {
                                self.send_one(addr, info, msg).await;
                            }
                        }
                        Err(e) => {
                            error!(
                                shard_id = %self.uuid,
                                sub = %window.sub(),
                                error = %e,
                                "Limit window commit failed, diff kept for next commit"
                            );
                        }
                    }
                }
            }
        }

        let msg = Msg::change(mutation.old_val.clone(), mutation.new_val.clone());
        Ok(self.fan_out(&clients, &msg, Some(&mutation.primary_key)).await)
    }

    /// Run `f` on every limit window ordered by `sindex`, holding the shared
    /// registry lock and that window's exclusive lock
    pub async fn foreach_limit<F>(&self, sindex: &str, mut f: F)
    where
        F: FnMut(&mut LimitWindow),
    {
        let clients = self.clients.read().await;
        for info in clients.values() {
            let Some(windows) = info.limit_clients.get(sindex) else {
                continue;
            };
            for window in windows.values() {
                let mut window = window.lock().await;
                f(&mut window);
            }
        }
    }

    /// Send `Stop` to every subscriber and make the server terminal
    pub async fn stop_all(&self) {
        let mut clients = self.clients.write().await;
        if self.is_stopped() {
            return;
        }

        let stops = clients
            .iter()
            .map(|(addr, info)| self.send_one(addr, info, Msg::Stop));
        join_all(stops).await;

        self.stopped.cancel();
        let count = clients.len();
        clients.clear();

        info!(shard_id = %self.uuid, table = %self.table, clients = count, "Broadcast server stopped");
    }

    /// Stop the server and wait for every task it spawned to finish
    pub async fn shutdown(&self) {
        self.stop_all().await;
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn client_entry<'a>(
        &self,
        clients: &'a mut BTreeMap<ClientAddr, ClientInfo>,
        addr: &ClientAddr,
    ) -> &'a mut ClientInfo {
        clients.entry(addr.clone()).or_insert_with(|| {
            let alive = self.stopped.child_token();
            self.watch_client(addr.clone(), alive.clone());
            info!(shard_id = %self.uuid, client = %addr, "Client subscribed");
            ClientInfo {
                alive,
                stamp: AtomicU64::new(0),
                regions: BTreeMap::new(),
                limit_clients: BTreeMap::new(),
            }
        })
    }

    /// Remove the client once its mailbox closes or a delivery to it fails
    fn watch_client(&self, addr: ClientAddr, alive: CancellationToken) {
        let weak = self.weak_self.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = alive.cancelled() => {}
                () = addr.closed() => {}
            }
            if let Some(server) = weak.upgrade() {
                server.remove_client(&addr, "disconnected").await;
            }
        });
    }

    /// Forget the region or limit window `sub` registered for `addr`
    ///
    /// The client entry itself stays so that later registrations continue
    /// its stamp sequence.
    pub async fn remove_subscription(&self, addr: &ClientAddr, sub: &SubscriptionId) -> bool {
        let mut clients = self.clients.write().await;
        let Some(info) = clients.get_mut(addr) else {
            return false;
        };

        let mut removed = info.regions.remove(sub).is_some();
        info.limit_clients.retain(|_, windows| {
            removed |= windows.remove(sub).is_some();
            !windows.is_empty()
        });

        if removed {
            debug!(shard_id = %self.uuid, client = %addr, sub = %sub, "Subscription removed");
        }
        removed
    }

    /// Number of limit windows across every client
    pub async fn limit_count(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .flat_map(|info| info.limit_clients.values())
            .map(BTreeMap::len)
            .sum()
    }

    async fn remove_client(&self, addr: &ClientAddr, reason: &str) {
        let removed = self.clients.write().await.remove(addr);
        if let Some(info) = removed {
            info.alive.cancel();
            info!(shard_id = %self.uuid, client = %addr, reason, "Client removed");
        }
    }

    async fn fan_out(
        &self,
        clients: &BTreeMap<ClientAddr, ClientInfo>,
        msg: &Msg,
        key: Option<&Datum>,
    ) -> usize {
        let sends: Vec<_> = clients
            .iter()
            .filter(|(_, info)| info.wants(key))
            .map(|(addr, info)| self.send_one(addr, info, msg.clone()))
            .collect();
        let reached = sends.len();
        join_all(sends).await;
        reached
    }

    /// Stamp and send one message; a failed delivery is abandoned and the
    /// subscriber marked dead
    async fn send_one(&self, addr: &ClientAddr, info: &ClientInfo, msg: Msg) {
        if info.alive.is_cancelled() {
            return;
        }

        let stamp = info.stamp.fetch_add(1, Ordering::SeqCst);
        let kind = msg.kind();
        let stamped = StampedMsg {
            server: self.uuid,
            stamp,
            msg,
        };

        if let Err(e) = addr.send(stamped).await {
            warn!(shard_id = %self.uuid, client = %addr, stamp, error = %e, "Delivery failed, dropping client");
            info.alive.cancel();
        } else {
            debug!(shard_id = %self.uuid, client = %addr, stamp, kind, "Message sent");
        }
    }
}
