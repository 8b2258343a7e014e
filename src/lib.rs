//! Archive node for a sharded, cycle-based consensus network.
//!
//! The [`Archiver`] reactor owns the node directory, the cycle chain, the
//! data-sender subscriptions and the gossip tallies. [`ingress::routes`]
//! exposes it to peer archivers over HTTP.

pub mod archiver;
pub mod config;
pub mod ingress;

pub use archiver::{Archiver, ArchiverHandle, ArchiverStatus, Command, HandleError};
pub use config::{ArchiverConfig, ConfigError};
pub use ingress::routes;
