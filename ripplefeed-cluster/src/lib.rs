pub mod error;
pub mod feed;
pub mod limit;
pub mod mailbox;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shard;
pub mod storage;

#[cfg(test)]
pub mod test_helpers;

pub use error::{Error, Result};
pub use feed::{Feed, Subscription, TableRef};
pub use limit::{LimitWindow, WindowReplica};
pub use mailbox::{
    frame_mailbox, mailbox, relay_frames, Addr, ClientAddr, MessageSink, RelayStats, StopAddr,
    StopRequest,
};
pub use protocol::{decode_frame, encode_frame, KeySpec, KeyedRow, LimitSpec, Msg, SortKey, Sorting, StampedMsg};
pub use registry::FeedRegistry;
pub use server::{IndexChange, Mutation, Server};
pub use shard::{LocalNamespace, LocalShard, NamespaceSource, ShardHandle, ShardSubscription, SubscribeRequest};
pub use storage::{AtSnapshot, ReadRequest, RowSource, RowStream, SnapshotSource};
