pub mod datum;
pub mod id;
pub mod range;

pub use datum::Datum;
pub use id::{PeerId, ShardId, SubscriptionId, TableId};
pub use range::{DatumRange, Region};
