//! Cycle chain handling for the archivist node: bootstrap sync from peer
//! archivers, change squashing, and live processing of pushed records.

// === Membership changes ===
pub mod change;
pub mod squasher;

// === Chain ===
pub mod chain;
pub mod processor;
pub mod sync;

// === State metadata ===
pub mod catch_up;

#[cfg(test)]
mod fixtures;

pub use catch_up::{section_network_hash, CatchUpError, MetadataCatchUp, NetworkHashes, ARCHIVE_BATCH};
pub use chain::CycleChain;
pub use change::{parse_record, Change};
pub use processor::{CycleProcessor, CycleReport, RemovedNodes, METADATA_RETENTION};
pub use squasher::ChangeSquasher;
pub use sync::{cycles_to_get, CycleChainSync, SyncConfig, SyncError, SyncOutcome};
