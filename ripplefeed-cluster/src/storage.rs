//! Storage read capabilities consumed by the change-feed core
//!
//! Two flavours of read exist. A [`RowSource`] is self-contained and may run
//! at any time, including after the write that triggered it has released its
//! storage locks. A [`SnapshotSource`] reads through a borrowed, in-progress
//! snapshot; [`AtSnapshot`] adapts it into a `RowSource` whose lifetime is
//! tied to the snapshot borrow, so it cannot be called after the snapshot is
//! gone.

use futures::stream::BoxStream;
use futures::TryStreamExt;
use ripplefeed_core::DatumRange;

use crate::error::Result;
use crate::protocol::{KeyedRow, SortKey, Sorting};

/// Lazy ordered sequence of rows
pub type RowStream<'a> = BoxStream<'a, Result<KeyedRow>>;

/// Parameters of an index-ordered read
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest<'a> {
    pub table: &'a str,
    /// Index to order and filter by; the primary key name reads the primary index
    pub sindex: &'a str,
    /// Range over index values
    pub range: &'a DatumRange,
    pub sorting: Sorting,
    /// Only rows strictly after this position (in `sorting` order)
    pub start_after: Option<&'a SortKey>,
    /// At most this many rows
    pub limit: Option<usize>,
}

/// Self-contained read
pub trait RowSource: Send + Sync {
    fn read<'a>(&'a self, request: ReadRequest<'a>) -> RowStream<'a>;
}

/// Read through a borrowed storage snapshot
pub trait SnapshotSource: Send + Sync {
    type Snapshot: Send + Sync;

    fn read_at<'a>(&'a self, snapshot: &'a Self::Snapshot, request: ReadRequest<'a>) -> RowStream<'a>;
}

/// A snapshot-bound source usable wherever a [`RowSource`] is expected, for
/// no longer than the snapshot borrow
pub struct AtSnapshot<'s, S: SnapshotSource> {
    source: &'s S,
    snapshot: &'s S::Snapshot,
}

impl<'s, S: SnapshotSource> AtSnapshot<'s, S> {
    pub const fn new(source: &'s S, snapshot: &'s S::Snapshot) -> Self {
        Self { source, snapshot }
    }
}

impl<S: SnapshotSource> RowSource for AtSnapshot<'_, S> {
    fn read<'a>(&'a self, request: ReadRequest<'a>) -> RowStream<'a> {
        self.source.read_at(self.snapshot, request)
    }
}

/// Drain a row stream into a vector
pub async fn collect_rows(stream: RowStream<'_>) -> Result<Vec<KeyedRow>> {
    stream.try_collect().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use ripplefeed_core::Datum;
    use std::collections::BTreeMap;

    /// Versioned store whose snapshots are frozen copies
    struct Versioned {
        current: BTreeMap<Datum, Datum>,
    }

    impl SnapshotSource for Versioned {
        type Snapshot = BTreeMap<Datum, Datum>;

        fn read_at<'a>(&'a self, snapshot: &'a Self::Snapshot, request: ReadRequest<'a>) -> RowStream<'a> {
            let rows: Vec<_> = snapshot
                .iter()
                .filter(|(k, _)| request.range.contains(k))
                .map(|(k, v)| Ok(KeyedRow::new(SortKey::new(k.clone(), k.clone()), v.clone())))
                .collect();
            futures::stream::iter(rows).boxed()
        }
    }

    #[tokio::test]
    async fn test_snapshot_read_sees_snapshot_not_current() {
        let mut store = Versioned {
            current: BTreeMap::new(),
        };
        store.current.insert(Datum::from(1), Datum::from("a"));
        let snapshot = store.current.clone();
        store.current.insert(Datum::from(2), Datum::from("b"));

        let source = AtSnapshot::new(&store, &snapshot);
        let range = DatumRange::universe();
        let rows = collect_rows(source.read(ReadRequest {
            table: "t",
            sindex: "id",
            range: &range,
            sorting: Sorting::Ascending,
            start_after: None,
            limit: None,
        }))
        .await
        .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row, Datum::from("a"));
        assert_eq!(store.current.len(), 2);
    }
}
