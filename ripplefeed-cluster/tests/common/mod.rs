//! Shared fixtures for ripplefeed-cluster integration tests

#![allow(dead_code)]

use futures::StreamExt;
use parking_lot::RwLock;
use ripplefeed_cluster::{
    KeyedRow, LocalNamespace, LocalShard, Mutation, ReadRequest, RowSource, RowStream, Server, SortKey,
    Sorting, Subscription, TableRef,
};
use ripplefeed_core::{ChangefeedConfig, Datum, DatumRange, PeerId, Region, TableId};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const PRIMARY_KEY: &str = "id";

pub fn n(v: i64) -> Datum {
    Datum::from(v)
}

pub fn row(id: i64, score: i64) -> Datum {
    serde_json::from_value(json!({ "id": id, "score": score })).unwrap()
}

pub fn config() -> ChangefeedConfig {
    ripplefeed_core::logging::init_test_logging();
    ChangefeedConfig {
        registration_timeout_ms: 1_000,
        max_pending_per_shard: 16,
        gap_timeout_ms: 500,
    }
}

/// Rows of one shard; every index is the row field of the same name
#[derive(Default)]
pub struct ShardStore {
    rows: RwLock<BTreeMap<Datum, Datum>>,
}

impl ShardStore {
    pub fn get(&self, key: &Datum) -> Option<Datum> {
        self.rows.read().get(key).cloned()
    }

    pub fn insert(&self, row: Datum) -> Option<Datum> {
        let key = row.get_field(PRIMARY_KEY).cloned().unwrap_or_default();
        self.rows.write().insert(key, row)
    }

    pub fn remove(&self, key: &Datum) -> Option<Datum> {
        self.rows.write().remove(key)
    }

    pub fn keyed(&self, sindex: &str) -> Vec<KeyedRow> {
        self.rows
            .read()
            .iter()
            .filter_map(|(key, row)| {
                let value = row.get_field(sindex)?.clone();
                Some(KeyedRow::new(SortKey::new(value, key.clone()), row.clone()))
            })
            .collect()
    }
}

impl RowSource for ShardStore {
    fn read<'a>(&'a self, request: ReadRequest<'a>) -> RowStream<'a> {
        let mut rows: Vec<KeyedRow> = self
            .keyed(request.sindex)
            .into_iter()
            .filter(|entry| request.range.contains(&entry.key.index_value))
            .filter(|entry| {
                request
                    .start_after
                    .map_or(true, |after| request.sorting.compare(&entry.key, after) == Ordering::Greater)
            })
            .collect();
        rows.sort_by(|a, b| request.sorting.compare(&a.key, &b.key));
        if let Some(limit) = request.limit {
            rows.truncate(limit);
        }
        futures::stream::iter(rows.into_iter().map(Ok)).boxed()
    }
}

/// A table split over in-process shards, one store per shard
pub struct TestCluster {
    pub namespace: Arc<LocalNamespace>,
    pub table: TableRef,
    pub shards: Vec<(Arc<LocalShard>, Arc<ShardStore>)>,
}

impl TestCluster {
    /// Split the primary keys at `bounds`: `[.., b0)`, `[b0, b1)`, ..., `[bn, ..)`
    pub fn new(bounds: &[i64]) -> Self {
        let mut regions = Vec::new();
        let mut left = std::ops::Bound::Unbounded;
        for bound in bounds {
            regions.push(Region::new(DatumRange::new(left, std::ops::Bound::Excluded(n(*bound)))));
            left = std::ops::Bound::Included(n(*bound));
        }
        regions.push(Region::new(DatumRange::new(left, std::ops::Bound::Unbounded)));

        let table = TableRef::new(TableId::new(), "scores", PRIMARY_KEY);
        let shards: Vec<_> = regions
            .into_iter()
            .map(|region| {
                let store = Arc::new(ShardStore::default());
                let server = Server::new(PeerId::from("storage-node"), table.name.clone());
                let shard = Arc::new(LocalShard::new(region, server, store.clone(), PRIMARY_KEY));
                (shard, store)
            })
            .collect();

        let namespace = Arc::new(LocalNamespace::new());
        namespace.register(
            table.id,
            shards.iter().map(|(shard, _)| shard.clone() as Arc<dyn ripplefeed_cluster::ShardHandle>).collect(),
        );

        Self { namespace, table, shards }
    }

    fn shard_for(&self, key: &Datum) -> &(Arc<LocalShard>, Arc<ShardStore>) {
        use ripplefeed_cluster::ShardHandle;
        self.shards
            .iter()
            .find(|(shard, _)| shard.region().contains(key))
            .expect("regions cover every key")
    }

    /// Seed a row without publishing it
    pub fn seed(&self, row: Datum) {
        let key = row.get_field(PRIMARY_KEY).cloned().unwrap_or_default();
        self.shard_for(&key).1.insert(row);
    }

    /// Insert or replace a row and publish the write
    pub async fn put(&self, row: Datum) {
        let key = row.get_field(PRIMARY_KEY).cloned().unwrap_or_default();
        let (shard, store) = self.shard_for(&key);
        let old = store.get(&key);
        let mutation = mutation(key, old, Some(row.clone()));
        shard
            .write(&mutation, || {
                store.insert(row);
                Ok(())
            })
            .await
            .unwrap();
    }

    /// Delete a row and publish the write
    pub async fn delete(&self, id: i64) {
        let key = n(id);
        let (shard, store) = self.shard_for(&key);
        let old = store.get(&key);
        let mutation = mutation(key.clone(), old, None);
        shard
            .write(&mutation, || {
                store.remove(&key);
                Ok(())
            })
            .await
            .unwrap();
    }

    /// Every row, ordered by `(sindex value, primary key)` in `sorting` order
    pub fn sorted(&self, sindex: &str, sorting: Sorting) -> Vec<KeyedRow> {
        let mut rows: Vec<_> = self.shards.iter().flat_map(|(_, store)| store.keyed(sindex)).collect();
        rows.sort_by(|a, b| sorting.compare(&a.key, &b.key));
        rows
    }
}

fn mutation(key: Datum, old: Option<Datum>, new: Option<Datum>) -> Mutation {
    let field = |row: &Option<Datum>, name: &str| row.as_ref().and_then(|r| r.get_field(name).cloned());
    Mutation::new(key, old.clone(), new.clone())
        .with_index("score", field(&old, "score"), field(&new, "score"))
        .with_index(PRIMARY_KEY, field(&old, PRIMARY_KEY), field(&new, PRIMARY_KEY))
}

/// Receive everything currently queued on `sub`, stopping after `idle` of silence
pub async fn drain(sub: &mut Subscription, idle: Duration) -> Vec<ripplefeed_cluster::Result<ripplefeed_cluster::Msg>> {
    let mut msgs = Vec::new();
    while let Ok(Some(msg)) = tokio::time::timeout(idle, sub.recv()).await {
        msgs.push(msg);
    }
    msgs
}
