//! Session registry and per-client event routing.
//!
//! Each subscriber owns one channel keyed by its [`ClientIdentity`]; text
//! from a generation is only ever sent down the channel of the identity
//! that started it. At most one generation is in flight per identity.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ClientIdentity, SessionEvent};
use crate::client::{CancelHandle, Completion, CompletionBackend};
use crate::error::{Error, Result};
use crate::protocol::GenerationOptions;

/// Registry of subscribed clients and their in-flight generations.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    backend: Arc<dyn CompletionBackend>,
    clients: Mutex<HashMap<ClientIdentity, ClientEntry>>,
    next_generation: AtomicU64,
}

struct ClientEntry {
    events: mpsc::UnboundedSender<SessionEvent>,
    generation: Option<ActiveGeneration>,
}

struct ActiveGeneration {
    id: u64,
    cancel: CancelHandle,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                backend,
                clients: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Register a new client.
    ///
    /// The returned subscription yields [`SessionEvent::Identity`] first.
    /// Dropping it unsubscribes the client.
    pub fn subscribe(&self) -> Subscription {
        let identity = ClientIdentity::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SessionEvent::Identity(identity));

        self.inner.clients.lock().insert(
            identity,
            ClientEntry {
                events: tx,
                generation: None,
            },
        );
        info!(%identity, "client subscribed");

        Subscription {
            identity,
            events: rx,
            registry: self.clone(),
        }
    }

    /// Remove a client, cancelling its generation if one is running.
    ///
    /// Returns false if the identity was not registered.
    pub fn unsubscribe(&self, identity: ClientIdentity) -> bool {
        let entry = self.inner.clients.lock().remove(&identity);
        match entry {
            Some(entry) => {
                if let Some(generation) = entry.generation {
                    debug!(%identity, generation = generation.id, "cancelling generation of disconnected client");
                    generation.cancel.cancel();
                }
                info!(%identity, "client unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Start generating `prompt` for `identity`.
    ///
    /// Returns once the backend connection is open; text is delivered on
    /// the client's subscription, followed by `RequestComplete`.
    pub async fn start_generation(
        &self,
        identity: ClientIdentity,
        prompt: String,
        options: GenerationOptions,
    ) -> Result<()> {
        let (id, cancel) = {
            let mut clients = self.inner.clients.lock();
            let entry = clients
                .get_mut(&identity)
                .ok_or(Error::IdentityNotFound(identity))?;
            if entry.generation.is_some() {
                return Err(Error::AlreadyGenerating(identity));
            }
            let id = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            let cancel = CancelHandle::new();
            entry.generation = Some(ActiveGeneration {
                id,
                cancel: cancel.clone(),
            });
            (id, cancel)
        };
        info!(%identity, generation = id, prompt_chars = prompt.chars().count(), "starting generation");

        // Clears the mark if this future is dropped while connecting.
        let pending = PendingGeneration {
            inner: self.inner.as_ref(),
            identity,
            id,
            armed: true,
        };

        let completion = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                pending.disarm();
                self.inner.finish(identity, id, None);
                return Ok(());
            }
            result = self.inner.backend.complete(&prompt, &options) => result,
        };

        match completion {
            Ok(completion) => {
                pending.disarm();
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { inner.forward(identity, id, completion, cancel).await });
                Ok(())
            }
            Err(e) => {
                warn!(%identity, generation = id, "generation failed to start: {}", e);
                drop(pending);
                Err(e)
            }
        }
    }

    /// Cancel the running generation of `identity`.
    pub fn cancel_generation(&self, identity: ClientIdentity) -> Result<()> {
        let clients = self.inner.clients.lock();
        let entry = clients.get(&identity).ok_or(Error::IdentityNotFound(identity))?;
        let generation = entry
            .generation
            .as_ref()
            .ok_or(Error::NotGenerating(identity))?;
        debug!(%identity, generation = generation.id, "cancel requested");
        generation.cancel.cancel();
        Ok(())
    }

    /// Cancel every running generation.
    pub fn cancel_all(&self) {
        let clients = self.inner.clients.lock();
        for generation in clients.values().filter_map(|c| c.generation.as_ref()) {
            generation.cancel.cancel();
        }
    }

    pub fn is_registered(&self, identity: ClientIdentity) -> bool {
        self.inner.clients.lock().contains_key(&identity)
    }

    pub fn is_generating(&self, identity: ClientIdentity) -> bool {
        self.inner
            .clients
            .lock()
            .get(&identity)
            .map_or(false, |c| c.generation.is_some())
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    pub fn generating_count(&self) -> usize {
        self.inner
            .clients
            .lock()
            .values()
            .filter(|c| c.generation.is_some())
            .count()
    }
}

impl RegistryInner {
    async fn forward(&self, identity: ClientIdentity, id: u64, completion: Completion, cancel: CancelHandle) {
        let Completion {
            mut stream,
            cancel: connection,
        } = completion;

        let mut failure = None;
        let mut chunks = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    connection.cancel();
                    debug!(%identity, generation = id, "generation cancelled");
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(text)) => {
                        chunks += 1;
                        self.deliver(identity, SessionEvent::Completion(text));
                    }
                    Some(Err(e)) => {
                        warn!(%identity, generation = id, "generation stream failed: {}", e);
                        failure = Some(e);
                        break;
                    }
                    None => break,
                }
            }
        }

        debug!(%identity, generation = id, chunks, "generation finished");
        self.finish(identity, id, failure);
    }

    fn deliver(&self, identity: ClientIdentity, event: SessionEvent) {
        if let Some(entry) = self.clients.lock().get(&identity) {
            let _ = entry.events.send(event);
        }
    }

    /// Clear the generation and tell the client it is over.
    fn finish(&self, identity: ClientIdentity, id: u64, failure: Option<Error>) {
        let mut clients = self.clients.lock();
        if let Some(entry) = clients.get_mut(&identity) {
            if entry.generation.as_ref().map(|g| g.id) == Some(id) {
                entry.generation = None;
                if let Some(e) = failure {
                    let _ = entry.events.send(SessionEvent::Error(e.to_string()));
                }
                let _ = entry.events.send(SessionEvent::RequestComplete);
            }
        }
    }

    /// Clear the generation without notifying the client.
    fn release(&self, identity: ClientIdentity, id: u64) {
        let mut clients = self.clients.lock();
        if let Some(entry) = clients.get_mut(&identity) {
            if entry.generation.as_ref().map(|g| g.id) == Some(id) {
                entry.generation = None;
            }
        }
    }
}

/// Generation marked on a client but not yet handed to a forwarder.
///
/// Dropping it while armed releases the mark.
struct PendingGeneration<'a> {
    inner: &'a RegistryInner,
    identity: ClientIdentity,
    id: u64,
    armed: bool,
}

impl PendingGeneration<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGeneration<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(identity = %self.identity, generation = self.id, "generation abandoned before connecting");
            self.inner.release(self.identity, self.id);
        }
    }
}

/// A subscribed client's event stream.
pub struct Subscription {
    identity: ClientIdentity,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    registry: SessionRegistry,
}

impl Subscription {
    pub fn identity(&self) -> ClientIdentity {
        self.identity
    }

    /// Next event, or `None` once the client has been removed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }
}

impl Stream for Subscription {
    type Item = SessionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(self.identity);
    }
}
