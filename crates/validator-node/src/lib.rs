//! Ambient stack for the validator binary: config loading and the per-chain
//! task supervisor. The binary itself (`src/bin/validator-node.rs`) is a thin
//! wrapper that wires these two modules to a concrete [`ChainClientFactory`]
//! and a [`validator_store_sqlite::SqliteBackend`].

pub mod settings;
pub mod supervisor;

pub use settings::{load_config, ConfigError};
pub use supervisor::{ChainClientFactory, Supervisor};
