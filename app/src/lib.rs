//! Orchestration core for a local image-generation engine: launches and
//! supervises the engine process, follows its console output, and keeps the
//! local checkpoint directory in step with what the engine has loaded.

pub mod checkpoints;
pub mod clients;
pub mod config;
pub mod engine;
mod error;
pub mod events;
pub mod logging;
pub mod parser;
pub mod persistence;
mod setup;
pub mod state;

#[cfg(test)]
mod test_support;

pub use error::Error;
pub use setup::{setup_core, Core, CoreOptions};
