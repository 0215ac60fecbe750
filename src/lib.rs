//! EmberDB: a shard-partitioned, multi-column-family LSM storage engine
//! with MVCC snapshot reads, epoch-based resource reclamation and
//! concurrent compaction.
//!
//! The engine sits beneath a replicated consensus layer that orders write
//! batches; it serves point reads, versioned writes and snapshots at shard
//! granularity. Consensus, placement, RPC and the transaction manager are
//! external collaborators wired in through the capability hooks on
//! [`engine::Hooks`].

pub mod blob;
pub mod cache;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod flock;
pub mod format;
pub mod levels;
pub mod manifest;
pub mod memtable;
pub mod scheduler;
pub mod shard;
pub mod sstable;
pub mod tmpfs;
pub mod write_batch;

mod flush;
mod split;

pub use config::{CfConfig, Options, S3Options};
pub use engine::{Engine, Hooks, IdAllocator, Item, MetaChangeListener, MetaReader, RecoverHandler, SnapAccess};
pub use error::{Error, Result};
pub use format::Value;
pub use shard::{Shard, SplitStage};
pub use write_batch::WriteBatch;
