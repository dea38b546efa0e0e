//! Configuration loading
//!
//! Server settings come from a YAML/TOML file with `MKTS__` environment
//! overrides. Backfill flags are parsed by the CLI layer.

pub mod duration;
mod settings;

pub use settings::{ReplicationSettings, ServerSettings, DEFAULT_CONFIG_PATH, ENV_PREFIX};
