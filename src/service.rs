//! The playground service.
//!
//! Wires the backend supervisor, the connection manager and the session
//! registry together into one explicitly owned object with its own
//! start/shutdown lifecycle. A web transport holds a `Playground` and
//! maps its subscription and mutation endpoints onto these methods.

use std::sync::Arc;

use tracing::{error, info};

use crate::backend::{BackendAddress, BackendState, BackendSupervisor};
use crate::client::{CompletionBackend, LlamaClient};
use crate::config::Settings;
use crate::error::Result;
use crate::protocol::GenerationOptions;
use crate::session::{ClientIdentity, SessionRegistry, Subscription};

pub struct Playground {
    settings: Settings,
    supervisor: BackendSupervisor,
    client: LlamaClient,
    sessions: SessionRegistry,
}

impl Playground {
    /// Build the service from validated settings. Nothing is spawned yet.
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;

        let supervisor = BackendSupervisor::new(settings.backend.clone());
        let client = LlamaClient::new(supervisor.clone());
        let backend: Arc<dyn CompletionBackend> = Arc::new(client.clone());
        let sessions = SessionRegistry::new(backend);

        Ok(Self {
            settings,
            supervisor,
            client,
            sessions,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn client(&self) -> &LlamaClient {
        &self.client
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Start the backend and wait until it is ready.
    pub async fn start(&self) -> Result<BackendAddress> {
        self.supervisor.start().await
    }

    /// Kick off backend startup without waiting for it.
    ///
    /// Requests made meanwhile wait for readiness on their own.
    pub fn start_in_background(&self) {
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            match supervisor.start().await {
                Ok(address) => info!(%address, "backend started"),
                Err(e) => error!("backend failed to start: {}", e),
            }
        });
    }

    pub fn status(&self) -> BackendState {
        self.supervisor.state()
    }

    pub fn subscribe(&self) -> Subscription {
        self.sessions.subscribe()
    }

    pub async fn start_generation(
        &self,
        identity: ClientIdentity,
        prompt: String,
        options: GenerationOptions,
    ) -> Result<()> {
        self.sessions.start_generation(identity, prompt, options).await
    }

    pub fn cancel_generation(&self, identity: ClientIdentity) -> Result<()> {
        self.sessions.cancel_generation(identity)
    }

    /// Cancel all generations and stop the managed backend process.
    pub async fn shutdown(&self) {
        info!(
            clients = self.sessions.client_count(),
            generating = self.sessions.generating_count(),
            "shutting down"
        );
        self.sessions.cancel_all();
        self.supervisor.shutdown().await;
    }
}
