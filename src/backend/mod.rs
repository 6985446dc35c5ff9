//! Supervision of the external llama.cpp inference process.

pub mod supervisor;

pub use supervisor::BackendSupervisor;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Availability of the backend process.
///
/// `Loading` moves to `Ready` once the backend first accepts a connection,
/// or to `Error` when spawning fails or the readiness checks run out.
/// `Error` is permanent for the lifetime of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Loading,
    Ready,
    Error,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendState::Loading => write!(f, "loading"),
            BackendState::Ready => write!(f, "ready"),
            BackendState::Error => write!(f, "error"),
        }
    }
}

/// Resolved address of the backend's listening socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAddress {
    pub host: String,
    pub port: u16,
}

impl BackendAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
