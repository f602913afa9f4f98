//! Shared domain types for SerialAgent: config, errors, tool/message
//! contracts, capability negotiation, and trace events.
//!
//! This crate has no async runtime or network dependencies of its own — it
//! is the vocabulary every other crate in the workspace builds on.

pub mod capability;
pub mod config;
pub mod error;
pub mod stream;
pub mod tool;
pub mod trace;

pub use error::{Error, Result};
