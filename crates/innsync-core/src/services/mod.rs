//! Shared services used by the sync engine and both binaries

mod store;

pub use store::SyncStore;
