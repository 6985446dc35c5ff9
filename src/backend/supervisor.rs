//! Launches the backend binary (or adopts an external one) and gates
//! every request on its readiness.

use std::process::Stdio;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BackendAddress, BackendState};
use crate::config::{BackendSettings, PortSetting};
use crate::error::{Error, Result};
use crate::port::find_open_port;

type Launch = Shared<BoxFuture<'static, std::result::Result<BackendAddress, String>>>;

/// Owns the backend process and its readiness state.
///
/// Cloning yields another handle to the same supervisor.
#[derive(Clone)]
pub struct BackendSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    settings: BackendSettings,
    state: watch::Sender<BackendState>,
    launch: Mutex<Option<Launch>>,
    child: Mutex<Option<Child>>,
    stopping: CancellationToken,
}

impl BackendSupervisor {
    pub fn new(settings: BackendSettings) -> Self {
        let (state, _) = watch::channel(BackendState::Loading);
        Self {
            inner: Arc::new(Inner {
                settings,
                state,
                launch: Mutex::new(None),
                child: Mutex::new(None),
                stopping: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.inner.settings
    }

    /// Current backend state
    pub fn state(&self) -> BackendState {
        *self.inner.state.borrow()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<BackendState> {
        self.inner.state.subscribe()
    }

    /// Start the backend if needed and wait until it accepts connections.
    ///
    /// The launch runs once: concurrent and later callers all await the
    /// same outcome. A failed launch is never retried.
    pub async fn start(&self) -> Result<BackendAddress> {
        let launch = {
            let mut guard = self.inner.launch.lock();
            guard
                .get_or_insert_with(|| {
                    let inner = Arc::clone(&self.inner);
                    // Spawned so a dropped caller cannot abandon the launch halfway.
                    let handle = tokio::spawn(async move { inner.launch().await });
                    async move {
                        handle
                            .await
                            .unwrap_or_else(|e| Err(format!("launch task failed: {}", e)))
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };

        launch.await.map_err(Error::Startup)
    }

    /// Abort a launch still in progress, kill the managed process, if
    /// any, and wait for it to exit.
    pub async fn shutdown(&self) {
        self.inner.stopping.cancel();
        let child = self.inner.child.lock().take();
        if let Some(mut child) = child {
            info!(pid = ?child.id(), "stopping backend process");
            if let Err(e) = child.start_kill() {
                warn!("failed to signal backend process: {}", e);
            }
            match child.wait().await {
                Ok(status) => info!(%status, "backend process stopped"),
                Err(e) => warn!("failed to reap backend process: {}", e),
            }
        }
    }
}

impl Inner {
    async fn launch(&self) -> std::result::Result<BackendAddress, String> {
        let settings = &self.settings;

        if self.stopping.is_cancelled() {
            return self.fail("supervisor was shut down".into());
        }

        if !settings.managed {
            let port = match settings.port {
                PortSetting::Fixed(port) => port,
                PortSetting::Auto => {
                    return self.fail("port must be set to a number when the backend is not managed".into())
                }
            };
            let address = BackendAddress::new(settings.host.clone(), port);
            info!(%address, "using external backend");
            self.state.send_replace(BackendState::Ready);
            return Ok(address);
        }

        let bin_path = settings.resolved_bin_path();
        if !bin_path.exists() {
            return self.fail(format!("backend binary not found at {}", bin_path.display()));
        }

        let port = match settings.port {
            PortSetting::Fixed(port) => port,
            PortSetting::Auto => {
                debug!("start(): port is set to auto, finding random open port");
                let (min, max) = settings.port_range;
                match find_open_port(min, max).await {
                    Ok(port) => port,
                    Err(e) => return self.fail(format!("could not allocate a port: {}", e)),
                }
            }
        };
        let address = BackendAddress::new(settings.host.clone(), port);

        info!(bin = %bin_path.display(), model = %settings.model_path, %address, "starting backend process");
        let spawned = Command::new(&bin_path)
            .arg("-l")
            .arg(port.to_string())
            .arg("-m")
            .arg(&settings.model_path)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(child) => *self.child.lock() = Some(child),
            Err(e) => return self.fail(format!("failed to spawn {}: {}", bin_path.display(), e)),
        }

        self.wait_for_ready(address).await
    }

    async fn wait_for_ready(&self, address: BackendAddress) -> std::result::Result<BackendAddress, String> {
        tokio::select! {
            biased;
            _ = self.stopping.cancelled() => {
                self.kill_child();
                self.fail("shut down before the backend became ready".into())
            }
            result = self.poll_until_listening(address) => result,
        }
    }

    async fn poll_until_listening(&self, address: BackendAddress) -> std::result::Result<BackendAddress, String> {
        let attempts = self.settings.probe_attempts;
        let interval = self.settings.probe_interval();

        for attempt in 1..=attempts {
            if let Some(status) = self.exited() {
                return self.fail(format!("backend exited with {} before accepting connections", status));
            }

            match TcpStream::connect((address.host.as_str(), address.port)).await {
                Ok(stream) => {
                    drop(stream);
                    info!(%address, attempt, "backend is ready");
                    self.state.send_replace(BackendState::Ready);
                    return Ok(address);
                }
                Err(e) => {
                    debug!("start(): error: {}, retrying in {:?} ({}/{})", e, interval, attempt, attempts);
                }
            }
            tokio::time::sleep(interval).await;
        }

        self.kill_child();
        self.fail(format!(
            "backend did not accept connections on {} after {} attempts",
            address, attempts
        ))
    }

    fn kill_child(&self) {
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                warn!("failed to signal backend process: {}", e);
            }
        }
    }

    fn exited(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.child.lock();
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                guard.take();
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("failed to poll backend process: {}", e);
                None
            }
        }
    }

    fn fail(&self, reason: String) -> std::result::Result<BackendAddress, String> {
        error!("backend startup failed: {}", reason);
        self.state.send_replace(BackendState::Error);
        Err(reason)
    }
}
