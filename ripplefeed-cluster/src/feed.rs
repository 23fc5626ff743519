//! Feed Multiplexer
//!
//! One [`Feed`] exists per (table, node). It owns a single inbound mailbox that
//! every shard's Broadcast Server pushes to, puts each shard's messages back
//! into stamp order, and hands the ordered stream to every attached
//! [`Subscription`]. A shard whose next stamp can never arrive fails the whole
//! feed: every subscription receives the error and then ends.

use futures::stream::{FuturesUnordered, Stream, StreamExt};
use parking_lot::Mutex;
use ripplefeed_core::{ChangefeedConfig, Datum, PeerId, ShardId, SubscriptionId, TableId};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mailbox::{mailbox, ClientAddr, StopAddr, StopRequest};
use crate::protocol::{KeySpec, KeyedRow, Msg, StampedMsg};
use crate::shard::{row_key, NamespaceSource, ShardSubscription, SubscribeRequest};

/// The table a feed follows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub id: TableId,
    pub name: String,
    /// Field holding the primary key of each row
    pub primary_key: String,
}

impl TableRef {
    pub fn new(id: TableId, name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            primary_key: primary_key.into(),
        }
    }
}

/// Notified when a feed may have lost its last subscription
pub(crate) trait FeedRelease: Send + Sync {
    fn release(&self, table: TableId);
}

struct Unmanaged;

impl FeedRelease for Unmanaged {
    fn release(&self, _table: TableId) {}
}

/// Per-shard reordering state
#[derive(Debug, Default)]
struct ShardCursor {
    expected: u64,
    pending: BTreeMap<u64, Msg>,
    /// When the current gap opened
    gap_since: Option<Instant>,
}

/// Restores per-shard stamp order and detects gaps that will never close
#[derive(Debug)]
pub(crate) struct Sequencer {
    cursors: HashMap<ShardId, ShardCursor>,
    max_pending: usize,
    gap_timeout: Duration,
}

impl Sequencer {
    pub(crate) fn new(config: &ChangefeedConfig) -> Self {
        Self {
            cursors: HashMap::new(),
            max_pending: config.max_pending_per_shard,
            gap_timeout: config.gap_timeout(),
        }
    }

    /// Accept one message and return every message it released, in stamp order
    pub(crate) fn push(&mut self, msg: StampedMsg, now: Instant) -> Result<Vec<StampedMsg>> {
        let server = msg.server;
        let cursor = self.cursors.entry(server).or_default();

        match msg.stamp.cmp(&cursor.expected) {
            Ordering::Less => {
                warn!(shard_id = %server, stamp = msg.stamp, expected = cursor.expected, "Discarding stale changefeed message");
                Ok(Vec::new())
            }
            Ordering::Greater => {
                if cursor.pending.contains_key(&msg.stamp) {
                    warn!(shard_id = %server, stamp = msg.stamp, "Discarding duplicate changefeed message");
                    return Ok(Vec::new());
                }
                cursor.pending.insert(msg.stamp, msg.msg);
                let since = *cursor.gap_since.get_or_insert(now);
                debug!(shard_id = %server, stamp = msg.stamp, expected = cursor.expected, pending = cursor.pending.len(), "Buffered out-of-order message");

                if cursor.pending.len() > self.max_pending || now.duration_since(since) >= self.gap_timeout {
                    return Err(Error::GapExhausted {
                        shard: server,
                        expected: cursor.expected,
                    });
                }
                Ok(Vec::new())
            }
            Ordering::Equal => {
                cursor.expected += 1;
                let mut released = vec![msg];
                while let Some(next) = cursor.pending.remove(&cursor.expected) {
                    released.push(StampedMsg {
                        server,
                        stamp: cursor.expected,
                        msg: next,
                    });
                    cursor.expected += 1;
                }
                cursor.gap_since = if cursor.pending.is_empty() { None } else { Some(now) };
                Ok(released)
            }
        }
    }

    /// Fail if any gap has been open longer than the gap timeout
    pub(crate) fn check_gaps(&self, now: Instant) -> Result<()> {
        for (server, cursor) in &self.cursors {
            if let Some(since) = cursor.gap_since {
                if now.duration_since(since) >= self.gap_timeout {
                    return Err(Error::GapExhausted {
                        shard: *server,
                        expected: cursor.expected,
                    });
                }
            }
        }
        Ok(())
    }

    /// The error for a shard that went away without a `Stop`
    pub(crate) fn shard_gone(&self, server: ShardId) -> Error {
        Error::GapExhausted {
            shard: server,
            expected: self.cursors.get(&server).map_or(0, |cursor| cursor.expected),
        }
    }
}

struct Consumer {
    keyspec: KeySpec,
    sub: SubscriptionId,
    /// Starting stamp per shard; `None` while the handshake is in flight
    starts: Option<HashMap<ShardId, u64>>,
    held: Vec<StampedMsg>,
    tx: mpsc::UnboundedSender<Result<Msg>>,
}

impl Consumer {
    fn matches(&self, msg: &Msg, primary_key: &str) -> bool {
        match (&self.keyspec, msg) {
            (_, Msg::Stop) => false,
            (KeySpec::Limit(_), msg) => msg.limit_sub() == Some(&self.sub),
            (KeySpec::Range { range }, Msg::Change { old_val, new_val }) => [old_val, new_val]
                .into_iter()
                .flatten()
                .filter_map(|row| row_key(row, primary_key))
                .any(|key| range.contains(key)),
            (KeySpec::Point { key }, Msg::Change { old_val, new_val }) => [old_val, new_val]
                .into_iter()
                .flatten()
                .any(|row| row_key(row, primary_key) == Some(key)),
            (KeySpec::Range { .. } | KeySpec::Point { .. }, _) => false,
        }
    }

    fn deliver(&mut self, msg: &StampedMsg) {
        match &self.starts {
            None => self.held.push(msg.clone()),
            Some(starts) => {
                if starts.get(&msg.server).is_some_and(|start| msg.stamp >= *start) {
                    // A closed receiver is detached when its subscription drops
                    let _ = self.tx.send(Ok(msg.msg.clone()));
                }
            }
        }
    }
}

#[derive(Default)]
struct FeedState {
    consumers: HashMap<u64, Consumer>,
    next_consumer: u64,
    failed: Option<Error>,
}

/// State shared by a feed, its processing task, and its subscriptions
struct FeedCore {
    id: Uuid,
    table: TableRef,
    state: Mutex<FeedState>,
    release: Arc<dyn FeedRelease>,
    /// Subscriptions whose shard registrations should be dropped
    detached: mpsc::UnboundedSender<SubscriptionId>,
}

impl FeedCore {
    fn attach(&self, keyspec: KeySpec, sub: SubscriptionId) -> Result<(u64, mpsc::UnboundedReceiver<Result<Msg>>)> {
        let mut state = self.state.lock();
        if let Some(e) = &state.failed {
            return Err(e.clone());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_consumer;
        state.next_consumer += 1;
        state.consumers.insert(
            id,
            Consumer {
                keyspec,
                sub,
                starts: None,
                held: Vec::new(),
                tx,
            },
        );
        Ok((id, rx))
    }

    /// Finish a handshake: send the backfill, then every held message at or
    /// after the consumer's starting stamps
    fn activate(&self, id: u64, starts: HashMap<ShardId, u64>, initial: Vec<KeyedRow>) {
        let mut state = self.state.lock();
        let Some(consumer) = state.consumers.get_mut(&id) else {
            return;
        };

        for row in initial {
            let _ = consumer.tx.send(Ok(Msg::change(None, Some(row.row))));
        }
        consumer.starts = Some(starts);
        for msg in mem::take(&mut consumer.held) {
            consumer.deliver(&msg);
        }
    }

    /// Returns true when this removed the last consumer
    fn detach(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        state.consumers.remove(&id).is_some() && state.consumers.is_empty()
    }

    fn dispatch(&self, msg: &StampedMsg) {
        let mut state = self.state.lock();
        for consumer in state.consumers.values_mut() {
            if consumer.matches(&msg.msg, &self.table.primary_key) {
                consumer.deliver(msg);
            }
        }
    }

    /// Deliver `error` to every consumer and drop them all
    fn fail(&self, error: Error) {
        let mut state = self.state.lock();
        if state.failed.is_none() {
            state.failed = Some(error.clone());
        }
        for (_, consumer) in state.consumers.drain() {
            let _ = consumer.tx.send(Err(error.clone()));
        }
    }

    fn receive(&self, sequencer: &mut Sequencer, msg: StampedMsg) -> Result<()> {
        for released in sequencer.push(msg, Instant::now())? {
            if released.msg == Msg::Stop {
                return Err(Error::FeedAborted(format!("shard {} stopped", released.server)));
            }
            debug!(feed_id = %self.id, shard_id = %released.server, stamp = released.stamp, kind = released.msg.kind(), "Message released");
            self.dispatch(&released);
        }
        Ok(())
    }
}

type Links = Arc<tokio::sync::Mutex<BTreeMap<ShardId, StopAddr>>>;

/// Per-(table, node) change-feed multiplexer
pub struct Feed {
    core: Arc<FeedCore>,
    addr: ClientAddr,
    namespace: Arc<dyn NamespaceSource>,
    links: Links,
    gone_tx: mpsc::UnboundedSender<ShardId>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Feed {
    /// Create a feed that nothing removes when it runs out of subscriptions
    pub fn new(
        peer: PeerId,
        table: TableRef,
        namespace: Arc<dyn NamespaceSource>,
        config: &ChangefeedConfig,
    ) -> Arc<Self> {
        Self::with_release(peer, table, namespace, config, Arc::new(Unmanaged))
    }

    pub(crate) fn with_release(
        peer: PeerId,
        table: TableRef,
        namespace: Arc<dyn NamespaceSource>,
        config: &ChangefeedConfig,
        release: Arc<dyn FeedRelease>,
    ) -> Arc<Self> {
        let (addr, inbound) = mailbox::<StampedMsg>(peer);
        let (gone_tx, gone_rx) = mpsc::unbounded_channel();
        let (detached, detached_rx) = mpsc::unbounded_channel();
        let core = Arc::new(FeedCore {
            id: Uuid::new_v4(),
            table,
            state: Mutex::new(FeedState::default()),
            release,
            detached,
        });

        let feed = Arc::new(Self {
            core: core.clone(),
            addr,
            namespace,
            links: Arc::new(tokio::sync::Mutex::new(BTreeMap::new())),
            gone_tx,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        feed.tracker.spawn(run(
            core,
            inbound,
            gone_rx,
            feed.cancel.clone(),
            Sequencer::new(config),
            config.gap_timeout() / 2,
        ));
        feed.tracker.spawn(unsubscribe_detached(
            feed.id(),
            feed.addr.clone(),
            feed.links.clone(),
            detached_rx,
            feed.cancel.clone(),
        ));

        info!(feed_id = %feed.id(), table = %feed.core.table.name, "Feed created");
        feed
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    #[must_use]
    pub fn table(&self) -> &TableRef {
        &self.core.table
    }

    /// The mailbox every shard pushes this feed's messages to
    #[must_use]
    pub const fn addr(&self) -> &ClientAddr {
        &self.addr
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.core.state.lock().consumers.len()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.core.state.lock().failed.is_some()
    }

    pub async fn shard_count(&self) -> usize {
        self.links.lock().await.len()
    }

    /// Attach a new subscription for `keyspec`
    ///
    /// Registers with every shard the keyspec routes to, then delivers the
    /// backfill rows (ordered by primary key) followed by live messages.
    pub async fn subscribe(&self, keyspec: KeySpec) -> Result<Subscription> {
        let sub = SubscriptionId::new();
        let (consumer, rx) = self.core.attach(keyspec.clone(), sub)?;
        // Dropped on every error path below, which detaches the consumer
        let subscription = Subscription {
            core: self.core.clone(),
            consumer,
            sub,
            rx,
            done: false,
        };

        let table = &self.core.table;
        let shards = self.namespace.shards(&table.id).await?;
        let region = keyspec.region();
        let request = SubscribeRequest {
            table_name: table.name.clone(),
            keyspec,
            sub,
        };

        let mut handshakes: FuturesUnordered<_> = shards
            .iter()
            .filter(|shard| shard.region().intersects(&region))
            .map(|shard| shard.subscribe(&self.addr, &request))
            .collect();

        let mut starts = HashMap::new();
        let mut initial = Vec::new();
        let mut failure = None;
        // Drain every handshake so each shard that registered us is linked
        while let Some(result) = handshakes.next().await {
            match result {
                Ok(shard_sub) => {
                    self.link(&shard_sub).await;
                    starts.insert(shard_sub.server, shard_sub.stamp);
                    initial.extend(shard_sub.initial);
                }
                Err(e) => {
                    warn!(feed_id = %self.id(), error = %e, "Shard subscription failed");
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        initial.sort_by(|a, b| a.key.primary_key.cmp(&b.key.primary_key));
        let shard_count = starts.len();
        let initial_rows = initial.len();
        self.core.activate(consumer, starts, initial);

        info!(
            feed_id = %self.id(),
            table = %table.name,
            keyspec = request.keyspec.kind(),
            shards = shard_count,
            initial_rows,
            "Subscription attached"
        );
        Ok(subscription)
    }

    /// Stop processing, unsubscribe from every shard, and fail any remaining
    /// subscriptions
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let links = mem::take(&mut *self.links.lock().await);
        for (server, stop_addr) in links {
            if let Err(e) = stop_addr.send(StopRequest::Client(self.addr.clone())).await {
                debug!(feed_id = %self.id(), shard_id = %server, error = %e, "Unsubscribe not delivered");
            }
        }

        self.core.fail(Error::FeedAborted("feed shut down".to_string()));
        info!(feed_id = %self.id(), table = %self.core.table.name, "Feed shut down");
    }

    /// Remember a shard's stop address and watch for it going away
    async fn link(&self, shard_sub: &ShardSubscription) {
        let mut links = self.links.lock().await;
        if links.contains_key(&shard_sub.server) {
            return;
        }
        links.insert(shard_sub.server, shard_sub.stop_addr.clone());

        let server = shard_sub.server;
        let stopped = shard_sub.stopped.clone();
        let cancel = self.cancel.clone();
        let gone_tx = self.gone_tx.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = stopped.cancelled() => {
                    let _ = gone_tx.send(server);
                }
            }
        });
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    core: Arc<FeedCore>,
    mut inbound: mpsc::UnboundedReceiver<StampedMsg>,
    mut gone: mpsc::UnboundedReceiver<ShardId>,
    cancel: CancellationToken,
    mut sequencer: Sequencer,
    gap_check: Duration,
) {
    let mut ticker = tokio::time::interval(gap_check);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break Ok(()),
            msg = inbound.recv() => {
                let Some(msg) = msg else { break Ok(()) };
                if let Err(e) = core.receive(&mut sequencer, msg) {
                    break Err(e);
                }
            }
            // Queued messages drain first, so a Stop already sent wins over this
            Some(server) = gone.recv() => break Err(sequencer.shard_gone(server)),
            _ = ticker.tick() => {
                if let Err(e) = sequencer.check_gaps(Instant::now()) {
                    break Err(e);
                }
            }
        }
    };

    if let Err(e) = outcome {
        error!(feed_id = %core.id, table = %core.table.name, error = %e, "Feed failed");
        core.fail(e);
        core.release.release(core.table.id);
    }
}

/// Drop the shard registrations of every detached subscription
///
/// Every linked shard is asked; a shard that never saw the subscription
/// ignores the request.
async fn unsubscribe_detached(
    feed_id: Uuid,
    addr: ClientAddr,
    links: Links,
    mut detached: mpsc::UnboundedReceiver<SubscriptionId>,
    cancel: CancellationToken,
) {
    loop {
        let sub = tokio::select! {
            () = cancel.cancelled() => break,
            sub = detached.recv() => match sub {
                Some(sub) => sub,
                None => break,
            },
        };

        let links = links.lock().await.clone();
        for (server, stop_addr) in links {
            let request = StopRequest::Subscription {
                client: addr.clone(),
                sub,
            };
            if let Err(e) = stop_addr.send(request).await {
                debug!(feed_id = %feed_id, shard_id = %server, sub = %sub, error = %e, "Unsubscribe not delivered");
            }
        }
        debug!(feed_id = %feed_id, sub = %sub, "Detached subscription unregistered");
    }
}

/// One downstream consumer's ordered view of a feed
///
/// Yields `Ok` messages until the feed fails, then the error once, then ends.
pub struct Subscription {
    core: Arc<FeedCore>,
    consumer: u64,
    sub: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Result<Msg>>,
    done: bool,
}

impl Subscription {
    #[must_use]
    pub fn feed_id(&self) -> Uuid {
        self.core.id
    }

    /// Next message, or `None` once the subscription has ended
    pub async fn recv(&mut self) -> Option<Result<Msg>> {
        StreamExt::next(self).await
    }

    /// Primary key of a change's new row, falling back to its old row
    #[must_use]
    pub fn change_key(&self, msg: &Msg) -> Option<Datum> {
        let Msg::Change { old_val, new_val } = msg else {
            return None;
        };
        new_val
            .iter()
            .chain(old_val)
            .find_map(|row| row_key(row, &self.core.table.primary_key))
            .cloned()
    }
}

impl Stream for Subscription {
    type Item = Result<Msg>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Closed once the feed stops, and then the whole client is dropped
        let _ = self.core.detached.send(self.sub);
        if self.core.detach(self.consumer) {
            self.core.release.release(self.core.table.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Mutation, Server};
    use crate::shard::{LocalNamespace, LocalShard};
    use crate::test_helpers::{n, MemoryTable};
    use ripplefeed_core::{DatumRange, Region};
    use serde_json::json;
    use tokio::time::timeout;

    fn config() -> ChangefeedConfig {
        ChangefeedConfig {
            registration_timeout_ms: 1_000,
            max_pending_per_shard: 3,
            gap_timeout_ms: 200,
        }
    }

    fn stamped(server: ShardId, stamp: u64) -> StampedMsg {
        StampedMsg {
            server,
            stamp,
            msg: Msg::change(None, Some(Datum::from(i64::try_from(stamp).unwrap_or_default()))),
        }
    }

    fn stamps(msgs: &[StampedMsg]) -> Vec<u64> {
        msgs.iter().map(|m| m.stamp).collect()
    }

    #[test]
    fn test_sequencer_reorders_per_shard() {
        let mut seq = Sequencer::new(&config());
        let a = ShardId::new();
        let b = ShardId::new();
        let now = Instant::now();

        assert!(seq.push(stamped(a, 1), now).unwrap().is_empty());
        assert_eq!(stamps(&seq.push(stamped(b, 0), now).unwrap()), [0]);
        assert_eq!(stamps(&seq.push(stamped(a, 0), now).unwrap()), [0, 1]);
        assert_eq!(stamps(&seq.push(stamped(a, 2), now).unwrap()), [2]);
    }

    #[test]
    fn test_sequencer_discards_duplicates() {
        let mut seq = Sequencer::new(&config());
        let a = ShardId::new();
        let now = Instant::now();

        seq.push(stamped(a, 0), now).unwrap();
        assert!(seq.push(stamped(a, 0), now).unwrap().is_empty());
        assert!(seq.push(stamped(a, 2), now).unwrap().is_empty());
        assert!(seq.push(stamped(a, 2), now).unwrap().is_empty());
        assert_eq!(stamps(&seq.push(stamped(a, 1), now).unwrap()), [1, 2]);
    }

    #[test]
    fn test_sequencer_buffer_overflow_is_gap_exhaustion() {
        let mut seq = Sequencer::new(&config());
        let a = ShardId::new();
        let now = Instant::now();

        for stamp in 1..=3 {
            seq.push(stamped(a, stamp), now).unwrap();
        }
        assert_eq!(
            seq.push(stamped(a, 4), now),
            Err(Error::GapExhausted { shard: a, expected: 0 })
        );
    }

    #[test]
    fn test_sequencer_gap_timeout() {
        let mut seq = Sequencer::new(&config());
        let a = ShardId::new();
        let start = Instant::now();

        seq.push(stamped(a, 1), start).unwrap();
        assert!(seq.check_gaps(start + Duration::from_millis(100)).is_ok());
        assert_eq!(
            seq.check_gaps(start + Duration::from_millis(200)),
            Err(Error::GapExhausted { shard: a, expected: 0 })
        );
    }

    #[test]
    fn test_range_consumer_matches_by_primary_key() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let consumer = Consumer {
            keyspec: KeySpec::range(DatumRange::half_open(n(0), n(10))),
            sub: SubscriptionId::new(),
            starts: None,
            held: Vec::new(),
            tx,
        };
        let row = |id: i64| -> Datum { serde_json::from_value(json!({ "id": id })).unwrap() };

        assert!(consumer.matches(&Msg::change(None, Some(row(3))), "id"));
        assert!(consumer.matches(&Msg::change(Some(row(3)), Some(row(30))), "id"));
        assert!(!consumer.matches(&Msg::change(None, Some(row(30))), "id"));
        assert!(!consumer.matches(&Msg::Stop, "id"));
    }

    async fn single_shard_feed() -> (Arc<Feed>, Arc<LocalShard>, Arc<MemoryTable>) {
        let table = Arc::new(MemoryTable::new("t", "id"));
        let shard = Arc::new(LocalShard::new(
            Region::universe(),
            Server::new(PeerId::from("node-a"), "t"),
            table.clone(),
            "id",
        ));
        let namespace = Arc::new(LocalNamespace::new());
        let table_id = TableId::new();
        namespace.register(table_id, vec![shard.clone()]);

        let feed = Feed::new(
            PeerId::from("node-b"),
            TableRef::new(table_id, "t", "id"),
            namespace,
            &config(),
        );
        (feed, shard, table)
    }

    #[tokio::test]
    async fn test_backfill_then_live_changes() {
        let (feed, shard, table) = single_shard_feed().await;
        let row = |id: i64| -> Datum { serde_json::from_value(json!({ "id": id })).unwrap() };
        table.put(row(2));
        table.put(row(1));

        let mut sub = feed.subscribe(KeySpec::range(DatumRange::universe())).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().unwrap(), Msg::change(None, Some(row(1))));
        assert_eq!(sub.recv().await.unwrap().unwrap(), Msg::change(None, Some(row(2))));

        let mutation = Mutation::new(n(3), None, Some(row(3)));
        shard
            .write(&mutation, || {
                table.put(row(3));
                Ok(())
            })
            .await
            .unwrap();
        let live = sub.recv().await.unwrap().unwrap();
        assert_eq!(live, Msg::change(None, Some(row(3))));
        assert_eq!(sub.change_key(&live), Some(n(3)));
        assert_eq!(feed.shard_count().await, 1);
    }

    #[tokio::test]
    async fn test_stop_fails_every_subscription() {
        let (feed, shard, _table) = single_shard_feed().await;
        let mut first = feed.subscribe(KeySpec::range(DatumRange::universe())).await.unwrap();
        let mut second = feed.subscribe(KeySpec::point(n(1))).await.unwrap();

        shard.server().stop_all().await;

        for sub in [&mut first, &mut second] {
            let got = timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
            assert!(matches!(got, Some(Err(Error::FeedAborted(_)))));
            assert!(sub.recv().await.is_none());
        }
        assert!(feed.is_failed());
        assert!(matches!(
            feed.subscribe(KeySpec::point(n(1))).await,
            Err(Error::FeedAborted(_))
        ));
    }

    #[tokio::test]
    async fn test_dropping_subscription_detaches() {
        let (feed, _shard, _table) = single_shard_feed().await;
        let sub = feed.subscribe(KeySpec::point(n(1))).await.unwrap();
        assert_eq!(feed.consumer_count(), 1);
        drop(sub);
        assert_eq!(feed.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_unsubscribes_from_shards() {
        let (feed, shard, _table) = single_shard_feed().await;
        let _sub = feed.subscribe(KeySpec::point(n(1))).await.unwrap();
        assert!(shard.server().has_client(feed.addr()).await);

        feed.shutdown().await;
        timeout(Duration::from_secs(1), async {
            while shard.server().has_client(feed.addr()).await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("feed should be unsubscribed");
    }
}
