//! Change-feed wire protocol
//!
//! `Msg` is what a Broadcast Server pushes, `StampedMsg` is the envelope that
//! orders it, `KeySpec` is what a subscriber asks for.

use bytes::Bytes;
use ripplefeed_core::{Datum, DatumRange, Region, ShardId, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{Error, Result};

/// Position of a row in a limit window: secondary-index value first, primary
/// key as the tie-break so rows with equal index values are totally ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SortKey {
    pub index_value: Datum,
    pub primary_key: Datum,
}

impl SortKey {
    #[must_use]
    pub const fn new(index_value: Datum, primary_key: Datum) -> Self {
        Self {
            index_value,
            primary_key,
        }
    }
}

/// A row together with its position in index order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedRow {
    pub key: SortKey,
    pub row: Datum,
}

impl KeyedRow {
    #[must_use]
    pub const fn new(key: SortKey, row: Datum) -> Self {
        Self { key, row }
    }
}

/// Messages pushed from a Broadcast Server to its subscribers
///
/// Serialized with the variant tag first so a reader can discriminate before
/// decoding the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Msg {
    /// The shard will send nothing further
    #[default]
    Stop,

    /// A row changed; `None` on either side means absent
    Change {
        old_val: Option<Datum>,
        new_val: Option<Datum>,
    },

    /// Seed of a limit window, in window order
    LimitStart {
        sub: SubscriptionId,
        start_data: Vec<KeyedRow>,
    },

    /// One net change to a limit window
    LimitChange {
        sub: SubscriptionId,
        old_key: Option<SortKey>,
        new_val: Option<KeyedRow>,
    },
}

impl Msg {
    #[must_use]
    pub const fn change(old_val: Option<Datum>, new_val: Option<Datum>) -> Self {
        Self::Change { old_val, new_val }
    }

    /// Message kind as a string, used in log fields
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Change { .. } => "change",
            Self::LimitStart { .. } => "limit_start",
            Self::LimitChange { .. } => "limit_change",
        }
    }

    /// Subscription id of a limit message
    #[must_use]
    pub const fn limit_sub(&self) -> Option<&SubscriptionId> {
        match self {
            Self::LimitStart { sub, .. } | Self::LimitChange { sub, .. } => Some(sub),
            Self::Stop | Self::Change { .. } => None,
        }
    }
}

/// A message stamped with its origin and per-(server, subscriber) sequence
/// number. `(server, stamp)` is the only ordering key; stamps from different
/// servers are incomparable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampedMsg {
    pub server: ShardId,
    pub stamp: u64,
    pub msg: Msg,
}

/// Sort direction of a limit window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sorting {
    Ascending,
    Descending,
}

impl Sorting {
    /// Compare two keys in window order (`Less` = earlier in the window)
    #[must_use]
    pub fn compare(self, a: &SortKey, b: &SortKey) -> Ordering {
        match self {
            Self::Ascending => a.cmp(b),
            Self::Descending => b.cmp(a),
        }
    }
}

/// Parameters of a limit subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    /// Range over the secondary-index values
    pub range: DatumRange,
    pub sindex: String,
    pub sorting: Sorting,
    pub limit: usize,
}

/// What a subscriber is interested in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySpec {
    Range { range: DatumRange },
    Limit(LimitSpec),
    Point { key: Datum },
}

impl KeySpec {
    #[must_use]
    pub const fn range(range: DatumRange) -> Self {
        Self::Range { range }
    }

    #[must_use]
    pub const fn point(key: Datum) -> Self {
        Self::Point { key }
    }

    #[must_use]
    pub fn limit(range: DatumRange, sindex: impl Into<String>, sorting: Sorting, limit: usize) -> Self {
        Self::Limit(LimitSpec {
            range,
            sindex: sindex.into(),
            sorting,
            limit,
        })
    }

    /// Primary-key region this spec routes to. A limit window is ordered by a
    /// secondary index, so it can be affected by a write anywhere in the table.
    #[must_use]
    pub fn region(&self) -> Region {
        match self {
            Self::Range { range } => Region::new(range.clone()),
            Self::Limit(_) => Region::universe(),
            Self::Point { key } => Region::point(key.clone()),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Range { .. } => "range",
            Self::Limit(_) => "limit",
            Self::Point { .. } => "point",
        }
    }
}

/// Encode a stamped message as a wire frame
pub fn encode_frame(msg: &StampedMsg) -> Result<Bytes> {
    serde_json::to_vec(msg)
        .map(Bytes::from)
        .map_err(|e| Error::Protocol(format!("Failed to encode message: {e}")))
}

/// Decode a wire frame into a stamped message
pub fn decode_frame(frame: &[u8]) -> Result<StampedMsg> {
    serde_json::from_slice(frame).map_err(|e| Error::Protocol(format!("Malformed frame: {e}")))
}
