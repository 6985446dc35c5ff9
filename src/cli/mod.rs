//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Streaming a single completion through a client session
//! - Starting the backend and reporting its status
//! - Finding an open port for a backend

pub mod commands;
pub mod handlers;

pub use handlers::{handle_complete, handle_find_port, handle_status};
