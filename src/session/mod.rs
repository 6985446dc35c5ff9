//! Client sessions multiplexed onto the single backend.

pub mod registry;

pub use registry::{SessionRegistry, Subscription};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identity handed to each subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(Uuid);

impl ClientIdentity {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ClientIdentity {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Events delivered to one subscriber.
///
/// The first event of every subscription is `Identity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    Identity(ClientIdentity),
    /// Generated text
    Completion(String),
    /// The generation ended, was cancelled, or failed
    RequestComplete,
    /// Transport failure of the current generation; followed by `RequestComplete`
    Error(String),
}
