//! innsync-core - Channel manager synchronization engine
//!
//! This crate holds the models, the libSQL store, the resilient channel
//! client, wire mappers, guest matching, conflict handling and the sync
//! services shared by the API server and the operator CLI.

// Declares `db_enum!`, so it has to come before the modules using it.
#[macro_use]
pub mod models;

pub mod channel;
pub mod config;
pub mod conflict;
pub mod connection;
pub mod context;
pub mod db;
pub mod error;
pub mod mapper;
pub mod matching;
pub mod pms;
pub mod services;
pub mod sync;
pub mod util;

pub use connection::ConnectionConfig;
pub use context::{ChannelProvider, SyncContext};
pub use error::{Error, Result};
