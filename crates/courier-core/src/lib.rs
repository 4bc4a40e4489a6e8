//! Core domain + application logic for the encrypted delivery orchestrator.
//!
//! This crate is framework-agnostic. Provider backends (TDLib bridge,
//! telegram-cli) and the relay producer live behind ports (traits)
//! implemented in adapter crates.

pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod ports;
pub mod relay;
pub mod reporter;
pub mod retry;
pub mod retry_queue;
pub mod secret_session;
pub mod store;
pub mod utils;

#[cfg(test)]
mod testing;

pub use errors::{Error, Result};
