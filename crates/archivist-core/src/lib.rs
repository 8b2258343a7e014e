// === Identities ===
pub mod archiver;
pub mod node;

// === Cycle chain ===
pub mod cycle;

// === Pushed data ===
pub mod data;
pub mod state_metadata;

// === Re-exports ===
pub use archiver::ArchiverNodeInfo;
pub use cycle::{compute_marker, CycleRecord};
pub use data::{DataRequest, DataResponse, DataType, UnknownDataType};
pub use node::{ConsensusNodeInfo, JoinedConsensor, NodeStatus, NodeUpdate};
pub use state_metadata::{
    ReceiptHashes, StateHashes, StateMetaData, StateMetadataHash, SummaryHashes,
};

/// Hex ed25519 public key; the stable identity of every node and archiver.
pub type PublicKey = String;
/// Node id assigned by the network when a consensor joins.
pub type NodeId = String;
/// Content hash of a cycle record, excluding its own marker.
pub type CycleMarker = String;
