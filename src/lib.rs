//! Session layer between concurrent web clients and one llama.cpp TCP server.
//!
//! The crate supervises the backend process, speaks its request/response
//! protocol, and multiplexes per-client generation streams onto it with
//! at most one generation per client and clean cancellation.

pub mod backend;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod port;
pub mod protocol;
pub mod service;
pub mod session;

// Re-export commonly used types
pub use backend::{BackendAddress, BackendState, BackendSupervisor};
pub use client::{CancelHandle, Completion, CompletionBackend, LlamaClient};
pub use error::{Error, Result};
pub use protocol::{GenerationOptions, OptionValue};
pub use service::Playground;
pub use session::{ClientIdentity, SessionEvent, SessionRegistry, Subscription};
