//! Subscription Registry
//!
//! At most one [`Feed`] exists per table on this node. Lookups share a
//! read lock; creating a feed takes the write lock for the whole shard
//! handshake, so concurrent first subscribers to one table end up on the same
//! feed.

use ripplefeed_core::{ChangefeedConfig, PeerId, TableId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::feed::{Feed, FeedRelease, Subscription, TableRef};
use crate::protocol::KeySpec;
use crate::shard::NamespaceSource;

struct RegistryInner {
    peer: PeerId,
    namespace: Arc<dyn NamespaceSource>,
    config: ChangefeedConfig,
    feeds: RwLock<HashMap<TableId, Arc<Feed>>>,
    /// Cancelled when the registry shuts down
    cancel: CancellationToken,
    /// Shutdown barrier: one token per in-flight `new_feed` and release task
    tracker: TaskTracker,
}

impl RegistryInner {
    async fn maybe_remove_feed(&self, table: &TableId) -> bool {
        let removed = {
            let mut feeds = self.feeds.write().await;
            match feeds.get(table) {
                Some(feed) if feed.consumer_count() == 0 => feeds.remove(table),
                _ => None,
            }
        };

        match removed {
            Some(feed) => {
                feed.shutdown().await;
                info!(table_id = %table, feed_id = %feed.id(), "Feed removed");
                true
            }
            None => false,
        }
    }

    /// Run a shard round-trip bounded by the registration timeout and by
    /// registry shutdown
    async fn bounded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.registration_timeout();
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Interrupted),
            result = tokio::time::timeout(limit, op) => result.map_err(|_| {
                Error::Timeout(format!("feed registration exceeded {}ms", limit.as_millis()))
            })?,
        }
    }
}

/// Removes a feed from its registry once its last subscription is gone
struct ReleaseHandle {
    inner: Weak<RegistryInner>,
}

impl FeedRelease for ReleaseHandle {
    fn release(&self, table: TableId) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.cancel.is_cancelled() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let tracker = inner.tracker.clone();
        tracker.spawn_on(
            async move {
                inner.maybe_remove_feed(&table).await;
            },
            &handle,
        );
    }
}

/// Per-node deduplicating map from table to feed
pub struct FeedRegistry {
    inner: Arc<RegistryInner>,
}

impl FeedRegistry {
    pub fn new(peer: PeerId, namespace: Arc<dyn NamespaceSource>, config: ChangefeedConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                peer,
                namespace,
                config,
                feeds: RwLock::new(HashMap::new()),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Subscribe to `table`, creating its feed if this node has none yet
    ///
    /// A failed round-trip leaves nothing registered.
    pub async fn new_feed(&self, table: &TableRef, keyspec: KeySpec) -> Result<Subscription> {
        let _barrier = self.inner.tracker.token();
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }

        {
            let feeds = self.inner.feeds.read().await;
            if let Some(feed) = feeds.get(&table.id).filter(|feed| !feed.is_failed()) {
                debug!(table = %table.name, feed_id = %feed.id(), "Attaching to existing feed");
                return self.inner.bounded(feed.subscribe(keyspec)).await;
            }
        }

        let mut feeds = self.inner.feeds.write().await;
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }

        // Another caller may have created the feed while we waited
        if let Some(feed) = feeds.get(&table.id) {
            if !feed.is_failed() {
                debug!(table = %table.name, feed_id = %feed.id(), "Attaching to existing feed");
                return self.inner.bounded(feed.subscribe(keyspec)).await;
            }
        }
        if let Some(stale) = feeds.remove(&table.id) {
            info!(table = %table.name, feed_id = %stale.id(), "Replacing failed feed");
            self.inner.tracker.spawn(async move { stale.shutdown().await });
        }

        let release = Arc::new(ReleaseHandle {
            inner: Arc::downgrade(&self.inner),
        });
        let feed = Feed::with_release(
            self.inner.peer.clone(),
            table.clone(),
            self.inner.namespace.clone(),
            &self.inner.config,
            release,
        );

        match self.inner.bounded(feed.subscribe(keyspec)).await {
            Ok(subscription) => {
                feeds.insert(table.id, feed);
                info!(table = %table.name, feed_id = %subscription.feed_id(), "Feed registered");
                Ok(subscription)
            }
            Err(e) => {
                warn!(table = %table.name, error = %e, "Feed registration failed");
                feed.shutdown().await;
                Err(e)
            }
        }
    }

    /// Drop the feed for `table` if it has no subscriptions left
    pub async fn maybe_remove_feed(&self, table: &TableId) -> bool {
        self.inner.maybe_remove_feed(table).await
    }

    /// Remove the feed for `table` regardless of its subscriptions
    pub async fn detach_feed(&self, table: &TableId) -> Option<Arc<Feed>> {
        let feed = self.inner.feeds.write().await.remove(table);
        if let Some(feed) = &feed {
            info!(table_id = %table, feed_id = %feed.id(), "Feed detached");
        }
        feed
    }

    pub async fn get_feed(&self, table: &TableId) -> Option<Arc<Feed>> {
        self.inner.feeds.read().await.get(table).cloned()
    }

    pub async fn feed_count(&self) -> usize {
        self.inner.feeds.read().await.len()
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Interrupt in-flight `new_feed` calls, wait for them to return, then
    /// shut every feed down
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let feeds: Vec<_> = self.inner.feeds.write().await.drain().map(|(_, feed)| feed).collect();
        let count = feeds.len();
        for feed in feeds {
            feed.shutdown().await;
        }

        info!(peer = %self.inner.peer, feeds = count, "Feed registry shut down");
    }
}

impl Drop for FeedRegistry {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use crate::shard::{LocalNamespace, LocalShard, MockShardHandle};
    use crate::test_helpers::{n, MemoryTable};
    use ripplefeed_core::{DatumRange, Region};
    use std::time::Duration;
    use tokio::time::timeout;

    fn config() -> ChangefeedConfig {
        ChangefeedConfig {
            registration_timeout_ms: 200,
            ..ChangefeedConfig::default()
        }
    }

    fn local_table(namespace: &LocalNamespace) -> TableRef {
        let table = Arc::new(MemoryTable::new("t", "id"));
        let shard = LocalShard::new(Region::universe(), Server::new(PeerId::from("node-a"), "t"), table, "id");
        let table_ref = TableRef::new(TableId::new(), "t", "id");
        namespace.register(table_ref.id, vec![Arc::new(shard)]);
        table_ref
    }

    #[tokio::test]
    async fn test_second_subscriber_shares_feed() {
        let namespace = Arc::new(LocalNamespace::new());
        let table = local_table(&namespace);
        let registry = FeedRegistry::new(PeerId::from("node-b"), namespace, config());

        let first = registry.new_feed(&table, KeySpec::point(n(1))).await.unwrap();
        let second = registry.new_feed(&table, KeySpec::point(n(2))).await.unwrap();
        assert_eq!(first.feed_id(), second.feed_id());
        assert_eq!(registry.feed_count().await, 1);
    }

    #[tokio::test]
    async fn test_maybe_remove_feed_keeps_busy_feed() {
        let namespace = Arc::new(LocalNamespace::new());
        let table = local_table(&namespace);
        let registry = FeedRegistry::new(PeerId::from("node-b"), namespace, config());

        let sub = registry.new_feed(&table, KeySpec::point(n(1))).await.unwrap();
        assert!(!registry.maybe_remove_feed(&table.id).await);
        drop(sub);

        // The release task and this call race; exactly one of them removes it
        registry.maybe_remove_feed(&table.id).await;
        assert!(!registry.maybe_remove_feed(&table.id).await);
        assert_eq!(registry.feed_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_registration_leaves_nothing() {
        let mut mock = MockShardHandle::new();
        mock.expect_region().returning(Region::universe);
        mock.expect_subscribe()
            .returning(|_, _| Err(Error::Registration("shard unavailable".to_string())));

        let namespace = Arc::new(LocalNamespace::new());
        let table = TableRef::new(TableId::new(), "t", "id");
        namespace.register(table.id, vec![Arc::new(mock)]);
        let registry = FeedRegistry::new(PeerId::from("node-b"), namespace, config());

        let result = registry.new_feed(&table, KeySpec::range(DatumRange::universe())).await;
        assert!(matches!(result, Err(Error::Registration(_))));
        assert_eq!(registry.feed_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_table_is_registration_error() {
        let registry = FeedRegistry::new(PeerId::from("node-b"), Arc::new(LocalNamespace::new()), config());
        let table = TableRef::new(TableId::new(), "missing", "id");
        assert!(matches!(
            registry.new_feed(&table, KeySpec::point(n(1))).await,
            Err(Error::Registration(_))
        ));
    }

    #[tokio::test]
    async fn test_new_feed_after_shutdown_is_interrupted() {
        let namespace = Arc::new(LocalNamespace::new());
        let table = local_table(&namespace);
        let registry = FeedRegistry::new(PeerId::from("node-b"), namespace, config());

        let mut sub = registry.new_feed(&table, KeySpec::point(n(1))).await.unwrap();
        timeout(Duration::from_secs(1), registry.shutdown()).await.expect("shutdown");

        assert!(registry.is_shutdown());
        assert!(matches!(sub.recv().await, Some(Err(Error::FeedAborted(_)))));
        assert!(matches!(
            registry.new_feed(&table, KeySpec::point(n(1))).await,
            Err(Error::Interrupted)
        ));
    }
}
