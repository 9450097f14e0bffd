//! Shared types for the DotBot platform: error taxonomy, tool and message
//! types, model roles and agent lifecycle enums, and server configuration.
//!
//! This crate has no I/O — everything here is plain data used by both the
//! server and the local agent.

pub mod config;
pub mod error;
pub mod model;
pub mod tool;

pub use error::{Error, ErrorKind, Result};
