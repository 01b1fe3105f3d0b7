//! Reconciles job proposals and bridges on a fleet of oracle nodes.

pub mod bridges;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod incident;
pub mod matcher;
pub mod node;
pub mod notify;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod types;

pub use error::{Error, ErrorKind, Result};
