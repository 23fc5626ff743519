pub mod config;
pub mod logging;
pub mod models;

pub use config::{ChangefeedConfig, Config, LoggingConfig};
pub use models::{Datum, DatumRange, PeerId, Region, ShardId, SubscriptionId, TableId};
