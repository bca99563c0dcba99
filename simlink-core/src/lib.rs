//! Shared configuration and logging for the simlink crates.

pub mod config;
pub mod logging;

pub use config::{Config, LoggingConfig, RpcConfig, StreamingConfig};
