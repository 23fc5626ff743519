//! Test helpers and fixtures for ripplefeed-cluster tests

use futures::StreamExt;
use parking_lot::RwLock;
use ripplefeed_core::Datum;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::protocol::{KeyedRow, SortKey, Sorting};
use crate::storage::{ReadRequest, RowSource, RowStream};

pub fn n(v: i64) -> Datum {
    Datum::from(v)
}

pub fn s(v: &str) -> Datum {
    Datum::from(v)
}

/// In-memory table keyed by primary key
///
/// Secondary-index values are the row field named like the index.
pub struct MemoryTable {
    name: String,
    primary_key: String,
    rows: RwLock<BTreeMap<Datum, Datum>>,
}

impl MemoryTable {
    pub fn new(name: &str, primary_key: &str) -> Self {
        Self {
            name: name.to_string(),
            primary_key: primary_key.to_string(),
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store `value` under primary key `key`
    pub fn put_kv(&self, key: i64, value: &str) -> Option<Datum> {
        self.rows.write().insert(n(key), s(value))
    }

    /// Store an object row under its primary-key field
    pub fn put(&self, row: Datum) -> Option<Datum> {
        let key = row
            .get_field(&self.primary_key)
            .cloned()
            .unwrap_or_default();
        self.rows.write().insert(key, row)
    }

    pub fn delete_key(&self, key: i64) -> Option<Datum> {
        self.rows.write().remove(&n(key))
    }

    pub fn get(&self, key: &Datum) -> Option<Datum> {
        self.rows.read().get(key).cloned()
    }

    /// First `limit` rows of the primary index
    pub fn sorted_rows(&self, sorting: Sorting, limit: usize) -> Vec<KeyedRow> {
        let range = ripplefeed_core::DatumRange::universe();
        self.matching(&ReadRequest {
            table: &self.name,
            sindex: &self.primary_key,
            range: &range,
            sorting,
            start_after: None,
            limit: Some(limit),
        })
    }

    fn index_value(&self, sindex: &str, key: &Datum, row: &Datum) -> Option<Datum> {
        if sindex == self.primary_key {
            Some(key.clone())
        } else {
            row.get_field(sindex).cloned()
        }
    }

    fn matching(&self, request: &ReadRequest<'_>) -> Vec<KeyedRow> {
        let rows = self.rows.read();
        let mut matched: Vec<KeyedRow> = rows
            .iter()
            .filter_map(|(key, row)| {
                let value = self.index_value(request.sindex, key, row)?;
                request
                    .range
                    .contains(&value)
                    .then(|| KeyedRow::new(SortKey::new(value, key.clone()), row.clone()))
            })
            .filter(|entry| {
                request
                    .start_after
                    .map_or(true, |after| request.sorting.compare(&entry.key, after) == Ordering::Greater)
            })
            .collect();
        matched.sort_by(|a, b| request.sorting.compare(&a.key, &b.key));
        if let Some(limit) = request.limit {
            matched.truncate(limit);
        }
        matched
    }
}

impl RowSource for MemoryTable {
    fn read<'a>(&'a self, request: ReadRequest<'a>) -> RowStream<'a> {
        futures::stream::iter(self.matching(&request).into_iter().map(Ok)).boxed()
    }
}
