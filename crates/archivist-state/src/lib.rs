//! Storage seam for the archiver.
//!
//! The archiver never talks to a database directly; it goes through
//! [`Persistence`]. [`MemoryStore`] backs tests and single-process runs.

pub mod memory;
pub mod persistence;

pub use memory::MemoryStore;
pub use persistence::{Account, ArchivedCycle, ArchivedSection, Persistence, Receipt, StorageError};
