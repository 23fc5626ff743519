//! Incremental top-N window for limit subscriptions
//!
//! A [`LimitWindow`] keeps the first `limit` rows (in index order) of a
//! secondary-index range consistent with a stream of row mutations and emits
//! the minimal diff a subscriber needs to reconstruct the same window.
//!
//! The window is always a prefix of the matching rows in storage. Deletions
//! can shrink it below capacity; the hole is refilled from storage on
//! [`LimitWindow::commit`] by reading the rows just past the window boundary.
//! Rows that sort past the boundary while the window is not known to hold
//! every matching row are left for that refill, since storage may hold rows
//! between them and the boundary.

use futures::StreamExt;
use ripplefeed_core::{Datum, Region, SubscriptionId};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::mem;
use tracing::debug;

use crate::error::Result;
use crate::protocol::{KeyedRow, LimitSpec, Msg, SortKey, Sorting};
use crate::storage::{ReadRequest, RowSource};

/// Per-subscription top-N state
///
/// Mutating methods take `&mut self`; a window shared by a Broadcast Server is
/// only reachable through its lock (see `Server::foreach_limit`).
#[derive(Debug)]
pub struct LimitWindow {
    table: String,
    sub: SubscriptionId,
    spec: LimitSpec,
    /// Primary-key region of the shard feeding this window
    region: Region,
    data: BTreeMap<SortKey, Datum>,
    positions: BTreeMap<Datum, SortKey>,
    /// Set while `data` holds every matching row in storage
    complete: bool,
    added: BTreeMap<SortKey, Datum>,
    deleted: BTreeMap<SortKey, Datum>,
}

impl LimitWindow {
    /// Seed a window from `start_data`, which must come from a read of the
    /// spec's range in the spec's order
    pub fn new(
        table: impl Into<String>,
        sub: SubscriptionId,
        spec: LimitSpec,
        region: Region,
        start_data: Vec<KeyedRow>,
    ) -> Self {
        let complete = start_data.len() < spec.limit;
        let mut window = Self {
            table: table.into(),
            sub,
            spec,
            region,
            data: BTreeMap::new(),
            positions: BTreeMap::new(),
            complete,
            added: BTreeMap::new(),
            deleted: BTreeMap::new(),
        };
        for entry in start_data {
            window.insert(entry.key, entry.row);
        }
        while window.data.len() > window.spec.limit {
            window.pop_last();
            window.complete = false;
        }
        window
    }

    #[must_use]
    pub const fn sub(&self) -> &SubscriptionId {
        &self.sub
    }

    #[must_use]
    pub fn sindex(&self) -> &str {
        &self.spec.sindex
    }

    #[must_use]
    pub const fn spec(&self) -> &LimitSpec {
        &self.spec
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.added.is_empty() || !self.deleted.is_empty()
    }

    /// Current rows in window order
    #[must_use]
    pub fn entries(&self) -> Vec<KeyedRow> {
        let rows = self.data.iter().map(|(k, v)| KeyedRow::new(k.clone(), v.clone()));
        match self.spec.sorting {
            Sorting::Ascending => rows.collect(),
            Sorting::Descending => rows.rev().collect(),
        }
    }

    /// The message that seeds a subscriber with the current window
    #[must_use]
    pub fn start_message(&self) -> Msg {
        Msg::LimitStart {
            sub: self.sub,
            start_data: self.entries(),
        }
    }

    /// Remove the row with `primary_key` from the window, if present
    pub fn delete(&mut self, primary_key: &Datum) {
        let Some(key) = self.positions.remove(primary_key) else {
            return;
        };
        if let Some(row) = self.data.remove(&key) {
            self.record_removal(key, row);
        }
    }

    /// Offer a row whose index value is `index_value`
    ///
    /// An existing row with the same primary key is replaced. If the window
    /// overflows, the last row in window order is evicted.
    pub fn add(&mut self, primary_key: Datum, index_value: Datum, row: Datum) {
        self.delete(&primary_key);

        if !self.spec.range.contains(&index_value) || !self.region.contains(&primary_key) {
            return;
        }

        let key = SortKey::new(index_value, primary_key);
        let inside = self
            .last()
            .is_some_and(|last| self.spec.sorting.compare(&key, last) == Ordering::Less);
        if !inside && !self.complete {
            return;
        }

        self.insert(key.clone(), row.clone());
        self.added.insert(key, row);

        if self.data.len() > self.spec.limit {
            if let Some((evicted, evicted_row)) = self.pop_last() {
                self.record_removal(evicted, evicted_row);
            }
            self.complete = false;
        }
    }

    /// Refill the window if deletions left it short, then turn the pending
    /// changes into `LimitChange` messages and clear them
    ///
    /// `source` is only read when the window is below capacity and storage
    /// may hold rows past the boundary.
    pub async fn commit(&mut self, source: &dyn RowSource) -> Result<Vec<Msg>> {
        if self.data.len() < self.spec.limit && !self.complete {
            self.refill(source).await?;
        }

        let added = mem::take(&mut self.added);
        let deleted = mem::take(&mut self.deleted);

        let mut msgs = Vec::with_capacity(added.len() + deleted.len());
        for (key, old_row) in &deleted {
            // A key both removed and added collapses into one change
            let new_val = match added.get(key) {
                Some(row) if row == old_row => continue,
                Some(row) => Some(KeyedRow::new(key.clone(), row.clone())),
                None => None,
            };
            msgs.push(Msg::LimitChange {
                sub: self.sub,
                old_key: Some(key.clone()),
                new_val,
            });
        }
        for (key, row) in added {
            if deleted.contains_key(&key) {
                continue;
            }
            msgs.push(Msg::LimitChange {
                sub: self.sub,
                old_key: None,
                new_val: Some(KeyedRow::new(key, row)),
            });
        }

        if !msgs.is_empty() {
            debug!(
                table = %self.table,
                sub = %self.sub,
                changes = msgs.len(),
                window_len = self.data.len(),
                "Limit window committed"
            );
        }
        Ok(msgs)
    }

    async fn refill(&mut self, source: &dyn RowSource) -> Result<()> {
        let want = self.spec.limit - self.data.len();
        let start_after = self.last().cloned();
        let range = self.spec.range.clone();
        let sindex = self.spec.sindex.clone();
        let table = self.table.clone();

        // The source may hold rows of other shards; they are skipped without
        // counting toward `want`, so the read is unbounded and consumed lazily
        let mut rows = source.read(ReadRequest {
            table: &table,
            sindex: &sindex,
            range: &range,
            sorting: self.spec.sorting,
            start_after: start_after.as_ref(),
            limit: None,
        });

        let mut fetched = 0;
        let mut skipped = 0;
        let mut exhausted = true;
        while let Some(entry) = rows.next().await {
            let entry = entry?;
            if !self.region.contains(&entry.key.primary_key) {
                skipped += 1;
                continue;
            }
            if self.positions.contains_key(&entry.key.primary_key) {
                continue;
            }
            fetched += 1;
            self.insert(entry.key.clone(), entry.row.clone());
            self.added.insert(entry.key, entry.row);
            if self.data.len() >= self.spec.limit {
                exhausted = false;
                break;
            }
        }
        if exhausted {
            self.complete = true;
        }

        debug!(
            table = %self.table,
            sub = %self.sub,
            requested = want,
            fetched,
            skipped,
            complete = self.complete,
            "Limit window refilled"
        );
        Ok(())
    }

    /// Read the first `spec.limit` rows of `region` in window order
    pub async fn seed_rows(
        source: &dyn RowSource,
        table: &str,
        spec: &LimitSpec,
        region: &Region,
    ) -> Result<Vec<KeyedRow>> {
        let mut rows = source.read(ReadRequest {
            table,
            sindex: &spec.sindex,
            range: &spec.range,
            sorting: spec.sorting,
            start_after: None,
            limit: None,
        });

        let mut seed = Vec::with_capacity(spec.limit);
        while seed.len() < spec.limit {
            let Some(entry) = rows.next().await else {
                break;
            };
            let entry = entry?;
            if region.contains(&entry.key.primary_key) {
                seed.push(entry);
            }
        }
        Ok(seed)
    }

    fn insert(&mut self, key: SortKey, row: Datum) {
        self.positions.insert(key.primary_key.clone(), key.clone());
        self.data.insert(key, row);
    }

    /// Last key in window order
    fn last(&self) -> Option<&SortKey> {
        match self.spec.sorting {
            Sorting::Ascending => self.data.keys().next_back(),
            Sorting::Descending => self.data.keys().next(),
        }
    }

    fn pop_last(&mut self) -> Option<(SortKey, Datum)> {
        let popped = match self.spec.sorting {
            Sorting::Ascending => self.data.pop_last(),
            Sorting::Descending => self.data.pop_first(),
        };
        if let Some((key, _)) = &popped {
            self.positions.remove(&key.primary_key);
        }
        popped
    }

    fn record_removal(&mut self, key: SortKey, row: Datum) {
        // A row added since the last commit disappears without a trace
        if self.added.remove(&key).is_none() {
            self.deleted.entry(key).or_insert(row);
        }
    }
}

/// Subscriber-side reconstruction of a limit window from `LimitStart` and
/// `LimitChange` messages
///
/// Windows of several shards may be applied to the same replica; shards hold
/// disjoint primary keys, so the union of their windows contains the global
/// window and [`WindowReplica::rows`] trims it back to `limit`.
#[derive(Debug, Clone)]
pub struct WindowReplica {
    sub: SubscriptionId,
    sorting: Sorting,
    limit: usize,
    entries: BTreeMap<SortKey, Datum>,
}

impl WindowReplica {
    #[must_use]
    pub const fn new(sub: SubscriptionId, sorting: Sorting, limit: usize) -> Self {
        Self {
            sub,
            sorting,
            limit,
            entries: BTreeMap::new(),
        }
    }

    /// Apply one message; messages for other subscriptions are ignored
    pub fn apply(&mut self, msg: &Msg) {
        match msg {
            Msg::LimitStart { sub, start_data } if *sub == self.sub => {
                for entry in start_data {
                    self.entries.insert(entry.key.clone(), entry.row.clone());
                }
            }
            Msg::LimitChange {
                sub,
                old_key,
                new_val,
            } if *sub == self.sub => {
                if let Some(key) = old_key {
                    self.entries.remove(key);
                }
                if let Some(entry) = new_val {
                    self.entries.insert(entry.key.clone(), entry.row.clone());
                }
            }
            Msg::LimitStart { .. } | Msg::LimitChange { .. } | Msg::Change { .. } | Msg::Stop => {}
        }
    }

    /// The window, in window order
    #[must_use]
    pub fn rows(&self) -> Vec<KeyedRow> {
        let rows = self.entries.iter().map(|(k, v)| KeyedRow::new(k.clone(), v.clone()));
        match self.sorting {
            Sorting::Ascending => rows.take(self.limit).collect(),
            Sorting::Descending => rows.rev().take(self.limit).collect(),
        }
    }
}
