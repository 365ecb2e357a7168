//! Configuration loading and service assembly.

pub mod bootstrap;
pub mod config;
mod secret;

pub use bootstrap::{Quarry, build_providers, build_store, resolve_config_path};
pub use config::Config;
pub use secret::Secret;
