//! Live data feed for the archivist node: which consensus nodes push data to
//! us, over which sockets, and when to give up on them.

pub mod data_sender;
pub mod socket_client;
pub mod timers;

pub use data_sender::{
    DataCursor, DataSender, DataSenderManager, PushRejected, SenderChange, SenderConfig, SenderError,
};
pub use socket_client::{ConnectionId, PushConnector, PushEvent, PushHandle, TcpPushConnector};
pub use timers::{TimerFired, TimerKind, TimerRegistry};
