//! Configuration management
//!
//! Node settings from defaults, an optional TOML file and the
//! `NODE_ADDRESS` / `NODE_ID` / `MINING_ADDRESS` / `SEED_NODES` variables.

pub mod settings;

pub use settings::{Config, DEFAULT_NODE_ADDR};
