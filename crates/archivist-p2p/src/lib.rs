// === Node directory ===
pub mod node_list;

// === Peer requests ===
pub mod client;
pub mod message_protocol;
pub mod robust_query;
pub mod transport;

// === Archiver protocol ===
pub mod gossip_protocol;
pub mod membership;
pub mod peer_manager;

pub use client::ArchiverClient;
pub use membership::{lists_archiver, until_next_q1, LeaveError, Membership, MembershipRequest, RequestType};
pub use gossip_protocol::{GossipConfig, GossipCoordinator, GossipRejected, GossipSender, Reconciliation};
pub use message_protocol::{CycleInfoResponse, GossipAck, GossipEnvelope, GossipPayload, NodeListResponse, PushFrame};
pub use node_list::{NodeEntry, NodeRegistry};
pub use peer_manager::{classify, poll_reputations, ArchiverList, Reputation};
pub use robust_query::{robust_query, sequential_query, QueryError, SequentialAnswer};
pub use transport::{HttpTransport, PeerTransport, TransportError};
