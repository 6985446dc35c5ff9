//! Common test utilities: an in-process llama.cpp TCP server and a
//! scripted completion backend.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use llama_playground_core::{
    config::{PortSetting, Settings},
    protocol::{Frame, GenerationOptions},
    CancelHandle, Completion, CompletionBackend, Result, SessionEvent, Subscription,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const BANNER: &str =
    "main: seed = 1680000000\nllama_model_load: done\nsampling parameters: temp = 0.800000, top_k = 40, top_p = 0.950000\n\n";

const STEP: Duration = Duration::from_millis(5);
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// How the fake server answers a request.
#[derive(Clone)]
pub enum Reply {
    /// Write the chunks, then close
    Chunks(Vec<String>),
    /// Write the chunks, then wait for the client to close
    ChunksThenHold(Vec<String>),
    /// Banner, prompt echo split in two, then `" answer to <prompt>"` in
    /// three-character pieces, then close
    Echo,
}

/// Minimal stand-in for the llama.cpp tcp_server.
pub struct FakeLlamaServer {
    pub address: SocketAddr,
    frames: Arc<Mutex<Vec<Frame>>>,
    closed_by_client: Arc<AtomicUsize>,
}

impl FakeLlamaServer {
    pub async fn start(reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let closed_by_client = Arc::new(AtomicUsize::new(0));

        let (f, c) = (frames.clone(), closed_by_client.clone());
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                tokio::spawn(serve(socket, reply.clone(), f.clone(), c.clone()));
            }
        });

        Self {
            address,
            frames,
            closed_by_client,
        }
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    pub fn closed_by_client(&self) -> usize {
        self.closed_by_client.load(Ordering::SeqCst)
    }

    /// Settings pointing an unmanaged backend at this server.
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::defaults().unwrap();
        settings.backend.managed = false;
        settings.backend.host = self.address.ip().to_string();
        settings.backend.port = PortSetting::Fixed(self.address.port());
        settings
    }
}

async fn read_frame(socket: &mut TcpStream) -> Option<Frame> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);

        let Some(newline) = buf.iter().position(|b| *b == b'\n') else { continue };
        let Some(count) = std::str::from_utf8(&buf[..newline]).ok().and_then(|s| s.parse::<usize>().ok()) else {
            return None;
        };
        let terminators = buf[newline + 1..].iter().filter(|b| **b == 0).count();
        if terminators >= count {
            return Frame::decode(&buf).ok();
        }
    }
}

async fn serve(mut socket: TcpStream, reply: Reply, frames: Arc<Mutex<Vec<Frame>>>, closed: Arc<AtomicUsize>) {
    let Some(frame) = read_frame(&mut socket).await else { return };
    let prompt = frame.prompt().unwrap_or_default();
    frames.lock().push(frame);

    let (chunks, hold) = match reply {
        Reply::Chunks(chunks) => (chunks, false),
        Reply::ChunksThenHold(chunks) => (chunks, true),
        Reply::Echo => {
            let half = prompt.len() / 2;
            let mut chunks = vec![BANNER.to_string(), format!(" {}", &prompt[..half]), prompt[half..].to_string()];
            let answer: Vec<char> = format!(" answer to {}", prompt).chars().collect();
            chunks.extend(answer.chunks(3).map(|c| c.iter().collect::<String>()));
            (chunks, false)
        }
    };

    for chunk in chunks {
        if socket.write_all(chunk.as_bytes()).await.is_err() {
            return;
        }
        let _ = socket.flush().await;
        tokio::time::sleep(STEP).await;
    }

    if hold {
        let mut sink = [0u8; 64];
        loop {
            match socket.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// One call made against [`ScriptedBackend`].
pub struct ScriptedCall {
    pub prompt: String,
    pub tx: mpsc::UnboundedSender<Result<String>>,
    pub cancel: CancelHandle,
}

struct RecordedCall {
    prompt: String,
    tx: Option<mpsc::UnboundedSender<Result<String>>>,
    cancel: CancelHandle,
}

/// A completion backend whose streams are fed by the test.
///
/// The stream of a call ends once the test drops the sender handed out
/// by [`ScriptedBackend::call`].
#[derive(Default)]
pub struct ScriptedBackend {
    calls: Mutex<Vec<RecordedCall>>,
    cancellations: Arc<AtomicUsize>,
    fail_next: Mutex<Option<std::io::ErrorKind>>,
    stall_next: Mutex<bool>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connections(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    /// Hand out the sender of call `index`. Only the first call per index
    /// gets a live sender.
    pub fn call(&self, index: usize) -> ScriptedCall {
        let mut calls = self.calls.lock();
        let recorded = &mut calls[index];
        let tx = recorded.tx.take().unwrap_or_else(|| mpsc::unbounded_channel().0);
        ScriptedCall {
            prompt: recorded.prompt.clone(),
            tx,
            cancel: recorded.cancel.clone(),
        }
    }

    pub fn fail_next(&self, kind: std::io::ErrorKind) {
        *self.fail_next.lock() = Some(kind);
    }

    /// Make the next connect attempt hang forever.
    pub fn stall_next(&self) {
        *self.stall_next.lock() = true;
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, prompt: &str, _options: &GenerationOptions) -> Result<Completion> {
        let failure = self.fail_next.lock().take();
        if let Some(kind) = failure {
            return Err(llama_playground_core::Error::Transport(kind.into()));
        }
        let stall = std::mem::take(&mut *self.stall_next.lock());
        if stall {
            return futures::future::pending().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancelHandle::new();

        let watcher = cancel.clone();
        let cancellations = self.cancellations.clone();
        tokio::spawn(async move {
            watcher.cancelled().await;
            cancellations.fetch_add(1, Ordering::SeqCst);
        });

        self.calls.lock().push(RecordedCall {
            prompt: prompt.to_string(),
            tx: Some(tx),
            cancel: cancel.clone(),
        });

        let until = cancel.clone();
        let stream = UnboundedReceiverStream::new(rx).take_until(async move { until.cancelled().await });
        Ok(Completion::new(Box::pin(stream), cancel))
    }
}

/// Next event on a subscription, failing the test after a timeout.
pub async fn next_event(subscription: &mut Subscription) -> SessionEvent {
    tokio::time::timeout(EVENT_TIMEOUT, subscription.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("subscription closed")
}

/// Collect completion text until `RequestComplete`.
pub async fn collect_until_complete(subscription: &mut Subscription) -> (String, Vec<SessionEvent>) {
    let mut text = String::new();
    let mut events = Vec::new();
    loop {
        let event = next_event(subscription).await;
        if let SessionEvent::Completion(chunk) = &event {
            text.push_str(chunk);
        }
        let done = event == SessionEvent::RequestComplete;
        events.push(event);
        if done {
            return (text, events);
        }
    }
}

/// Poll `check` until it holds or a timeout elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(STEP).await;
    }
    check()
}

pub fn options() -> GenerationOptions {
    GenerationOptions::new().with("--n_predict", 16i64).with("--temp", 0.7)
}
