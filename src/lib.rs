//! In-memory key-value server speaking RESP, with durability via an
//! append-only log and point-in-time snapshots, plus an asynchronous
//! primary-to-replica command stream.
//!
//! ```no_run
//! use minikv::{Engine, ServerConfig, server};
//!
//! let engine = Engine::new(ServerConfig::default());
//! engine.boot()?;
//! let listener = server::bind(&engine)?;
//! server::serve(listener, engine);
//! # Ok::<(), minikv::KvError>(())
//! ```

pub mod aof;
pub mod backlog;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod rdb;
pub mod replica;
pub mod resp;
pub mod server;
pub mod skiplist;
pub mod store;

pub use config::{AofMode, AofOptions, RdbOptions, ReplicaOptions, ServerConfig};
pub use engine::Engine;
pub use error::{KvError, Result};
pub use store::KeyValueStore;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {
    pub use crate::{AofMode, Engine, KeyValueStore, KvError, Result, ServerConfig};
}
