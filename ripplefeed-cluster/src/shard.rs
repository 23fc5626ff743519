//! Shard collaborators of a feed
//!
//! A feed talks to shards through [`ShardHandle`] and discovers them through
//! [`NamespaceSource`]. [`LocalShard`] is the in-process implementation: it
//! pairs a Broadcast [`Server`] with the shard's [`RowSource`] and serialises
//! writes against subscription handshakes, which is what makes the stamp a
//! subscriber gets line up with the rows its backfill read returns.

use async_trait::async_trait;
use parking_lot::RwLock;
use ripplefeed_core::{Datum, DatumRange, Region, ShardId, SubscriptionId, TableId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::limit::LimitWindow;
use crate::mailbox::{ClientAddr, StopAddr};
use crate::protocol::{KeySpec, KeyedRow, Sorting};
use crate::server::{Mutation, Server};
use crate::storage::{collect_rows, ReadRequest, RowSource};

/// A feed's request to one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub table_name: String,
    pub keyspec: KeySpec,
    /// Identifies the limit window when `keyspec` is a limit spec
    pub sub: SubscriptionId,
}

/// A shard's answer to [`ShardHandle::subscribe`]
#[derive(Debug, Clone)]
pub struct ShardSubscription {
    pub server: ShardId,
    /// First stamp the subscriber must apply on top of `initial`
    pub stamp: u64,
    /// Backfill rows in primary-key order, consistent with `stamp`
    pub initial: Vec<KeyedRow>,
    pub stop_addr: StopAddr,
    /// Cancelled once the shard will send nothing further
    pub stopped: CancellationToken,
}

/// One shard holding part of a table
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShardHandle: Send + Sync {
    /// Primary-key region held by this shard
    fn region(&self) -> Region;

    /// Register `addr` for `request` and return its starting stamp and backfill
    async fn subscribe(&self, addr: &ClientAddr, request: &SubscribeRequest) -> Result<ShardSubscription>;
}

/// Table-to-shards lookup
#[async_trait]
pub trait NamespaceSource: Send + Sync {
    async fn shards(&self, table: &TableId) -> Result<Vec<Arc<dyn ShardHandle>>>;
}

/// Namespace backed by an in-memory map
#[derive(Default)]
pub struct LocalNamespace {
    tables: RwLock<HashMap<TableId, Vec<Arc<dyn ShardHandle>>>>,
}

impl LocalNamespace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, table: TableId, shards: Vec<Arc<dyn ShardHandle>>) {
        debug!(table_id = %table, shards = shards.len(), "Table registered");
        self.tables.write().insert(table, shards);
    }

    pub fn unregister(&self, table: &TableId) -> bool {
        self.tables.write().remove(table).is_some()
    }
}

#[async_trait]
impl NamespaceSource for LocalNamespace {
    async fn shards(&self, table: &TableId) -> Result<Vec<Arc<dyn ShardHandle>>> {
        self.tables
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| Error::Registration(format!("unknown table {table}")))
    }
}

/// In-process shard
pub struct LocalShard {
    region: Region,
    server: Arc<Server>,
    source: Arc<dyn RowSource>,
    primary_key: String,
    /// Held by writes and subscription handshakes
    gate: Mutex<()>,
}

impl LocalShard {
    pub fn new(
        region: Region,
        server: Arc<Server>,
        source: Arc<dyn RowSource>,
        primary_key: impl Into<String>,
    ) -> Self {
        Self {
            region,
            server,
            source,
            primary_key: primary_key.into(),
            gate: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Apply a write to storage with `apply`, then publish it
    ///
    /// Returns the number of plain subscribers the change reached.
    pub async fn write<F>(&self, mutation: &Mutation, apply: F) -> Result<usize>
    where
        F: FnOnce() -> Result<()> + Send,
    {
        if !self.region.contains(&mutation.primary_key) {
            return Err(Error::Storage(format!(
                "key {} is outside shard {}",
                mutation.primary_key,
                self.server.uuid()
            )));
        }

        let _gate = self.gate.lock().await;
        apply()?;
        self.server.publish(mutation, self.source.as_ref()).await
    }

    async fn read(&self, request: ReadRequest<'_>) -> Result<Vec<KeyedRow>> {
        let rows = collect_rows(self.source.read(request)).await?;
        Ok(rows
            .into_iter()
            .filter(|row| self.region.contains(&row.key.primary_key))
            .collect())
    }

    fn primary_read<'a>(&'a self, table: &'a str, range: &'a DatumRange) -> ReadRequest<'a> {
        ReadRequest {
            table,
            sindex: &self.primary_key,
            range,
            sorting: Sorting::Ascending,
            start_after: None,
            limit: None,
        }
    }
}

#[async_trait]
impl ShardHandle for LocalShard {
    fn region(&self) -> Region {
        self.region.clone()
    }

    async fn subscribe(&self, addr: &ClientAddr, request: &SubscribeRequest) -> Result<ShardSubscription> {
        let _gate = self.gate.lock().await;
        let table = request.table_name.as_str();

        let (stamp, initial) = match &request.keyspec {
            KeySpec::Range { range } => {
                let stamp = self.server.add_client(addr, request.sub, Region::new(range.clone())).await?;
                let initial = if self.region.intersects(&Region::new(range.clone())) {
                    self.read(self.primary_read(table, range)).await?
                } else {
                    Vec::new()
                };
                (stamp, initial)
            }
            KeySpec::Point { key } => {
                let stamp = self.server.add_client(addr, request.sub, Region::point(key.clone())).await?;
                let range = DatumRange::point(key.clone());
                let initial = if self.region.contains(key) {
                    self.read(self.primary_read(table, &range)).await?
                } else {
                    Vec::new()
                };
                (stamp, initial)
            }
            KeySpec::Limit(spec) => {
                let start = LimitWindow::seed_rows(self.source.as_ref(), table, spec, &self.region).await?;
                let stamp = self
                    .server
                    .add_limit_client(addr, self.region.clone(), request.sub, spec.clone(), start)
                    .await?;
                (stamp, Vec::new())
            }
        };

        info!(
            shard_id = %self.server.uuid(),
            client = %addr,
            keyspec = request.keyspec.kind(),
            stamp,
            initial_rows = initial.len(),
            "Shard subscription established"
        );

        Ok(ShardSubscription {
            server: self.server.uuid(),
            stamp,
            initial,
            stop_addr: self.server.stop_addr(),
            stopped: self.server.stopped_token(),
        })
    }
}

/// Primary key of `row`, read from its `primary_key` field
#[must_use]
pub fn row_key<'a>(row: &'a Datum, primary_key: &str) -> Option<&'a Datum> {
    row.get_field(primary_key)
}
