//! Per-request connections to the backend.
//!
//! Every completion opens its own TCP connection, writes one request
//! frame, and exposes the decoded reply as a stream of text chunks with a
//! cancel handle that closes the socket.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{BackendAddress, BackendSupervisor};
use crate::error::{Error, Result};
use crate::protocol::{Frame, GenerationOptions, ResponseDecoder};

/// Generated text chunks in the order the backend sent them.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Closes the connection behind a [`Completion`].
///
/// After cancellation the stream ends without an error and without
/// further text. Cancelling more than once is a no-op.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        self.0.cancelled().await
    }
}

/// An in-flight completion.
pub struct Completion {
    pub stream: TextStream,
    pub cancel: CancelHandle,
}

impl Completion {
    pub fn new(stream: TextStream, cancel: CancelHandle) -> Self {
        Self { stream, cancel }
    }

    /// Drain the stream into a single string.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(chunk) = self.stream.next().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }
}

/// Anything able to turn a prompt into a [`Completion`].
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, prompt: &str, options: &GenerationOptions) -> Result<Completion>;
}

/// Connection manager for the llama.cpp TCP server
#[derive(Clone)]
pub struct LlamaClient {
    supervisor: BackendSupervisor,
}

impl LlamaClient {
    pub fn new(supervisor: BackendSupervisor) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &BackendSupervisor {
        &self.supervisor
    }

    async fn connect(address: &BackendAddress) -> Result<TcpStream> {
        let socket = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(Error::Transport)?;
        debug!(%address, "complete(): connected to server");
        Ok(socket)
    }
}

#[async_trait]
impl CompletionBackend for LlamaClient {
    async fn complete(&self, prompt: &str, options: &GenerationOptions) -> Result<Completion> {
        let address = self.supervisor.start().await?;
        let mut socket = Self::connect(&address).await?;

        let frame = Frame::request(prompt, options);
        debug!("complete(): sending tcp packet: {}", frame);
        socket.write_all(&frame.encode()).await.map_err(Error::Transport)?;

        let cancel = CancelHandle::new();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(
            FramedRead::new(socket, ResponseDecoder::new(prompt)),
            tx,
            cancel.clone(),
        ));

        Ok(Completion::new(
            Box::pin(UnboundedReceiverStream::new(rx)),
            cancel,
        ))
    }
}

/// Forward decoded text until the server closes, the connection fails,
/// the handle is cancelled, or the consumer goes away. The socket is
/// dropped on return.
async fn pump(
    mut reader: FramedRead<TcpStream, ResponseDecoder>,
    tx: mpsc::UnboundedSender<Result<String>>,
    cancel: CancelHandle,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("complete(): connection cancelled");
                break;
            }
            _ = tx.closed() => break,
            item = reader.next() => match item {
                Some(Ok(text)) => {
                    if tx.send(Ok(text)).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!("complete(): connection error: {}", e);
                    let _ = tx.send(Err(Error::Transport(e)));
                    break;
                }
                None => {
                    debug!("complete(): connection closed by server");
                    break;
                }
            }
        }
    }
}
