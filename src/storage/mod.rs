//! Storage — generation-indexed checkpoint shards on local disk

mod checkpoint;

pub use checkpoint::{CheckpointManager, ShardParts, ShardRecord, SHARD_FORMAT_VERSION};
