//! Mount session lifecycle.
//!
//! Claims the mount point, registers it with FUSE, runs the engine until an
//! unmount is requested and then releases everything. [`mount`] does this on
//! the calling thread; [`spawn_mount`] runs it on a dedicated thread and hands
//! back a [`MountHandle`].

use crate::adapter::Adapter;
use crate::config::RestFsConfig;
use crate::engine::{EngineState, MountEngine};
use crate::error::{RestFsError, Result};
use crate::fuse::FuseHost;
use crate::mount::{options_to_fuser, MountClaim, MountError};
use crate::transport::HttpTransport;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// One registered mount: the claimed mount point, the kernel session and the
/// engine serving it.
struct MountSession {
    engine: Arc<MountEngine>,
    host: Arc<FuseHost>,
    claim: MountClaim,
    origin: String,
}

impl MountSession {
    /// Validate, claim and register. Everything that can fail before serving
    /// fails here, on the caller's thread.
    fn establish(adapter: Arc<dyn Adapter>, local_path: &Path, config: &RestFsConfig) -> Result<Self> {
        config.validate()?;
        let options = config.mount_options()?;
        let translator = config.translator()?;
        let claim = MountClaim::acquire(local_path)?;
        let mountpoint = claim.mountpoint().display().to_string();

        let transport = HttpTransport::new(&config.transport_config()).map_err(|e| {
            RestFsError::MountFailed {
                mountpoint: mountpoint.clone(),
                reason: e.to_string(),
            }
        })?;
        let engine = Arc::new(MountEngine::new(
            adapter,
            Arc::new(transport),
            translator,
            config.engine_config(),
        ));
        engine.begin_mount();

        let (bridge, host) = FuseHost::new(config.attr_defaults(claim.mountpoint()), config.attr_ttl());
        let fuser_opts = options_to_fuser(&options, &config.host);
        let session = match fuser::spawn_mount2(bridge, claim.mountpoint(), &fuser_opts) {
            Ok(session) => session,
            Err(e) => {
                engine.abort_mount();
                error!("FUSE refused mount at {}: {}", mountpoint, e);
                return Err(MountError::Rejected {
                    mountpoint,
                    reason: e.to_string(),
                }
                .into());
            }
        };
        host.attach(session);

        let origin = format!("{}://{}", config.protocol, config.host);
        info!("mounted {} at {}", origin, mountpoint);
        Ok(Self {
            engine,
            host: Arc::new(host),
            claim,
            origin,
        })
    }

    /// Serve until `shutdown` resolves or the kernel ends the session.
    async fn run<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let result = Arc::clone(&self.engine)
            .serve(Arc::clone(&self.host), shutdown)
            .await;
        debug_assert_eq!(self.engine.state(), EngineState::Unmounted);
        match &result {
            Ok(()) => info!(
                "unmounted {} from {}",
                self.origin,
                self.claim.mountpoint().display()
            ),
            Err(e) => warn!(
                "unmount of {} from {} finished with error: {}",
                self.origin,
                self.claim.mountpoint().display(),
                e
            ),
        }
        result
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("restfs-worker")
        .build()?)
}

/// Resolves on SIGINT or SIGTERM.
pub async fn interrupt_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Mount `config.host` at `local_path` and serve until SIGINT, SIGTERM or an
/// external `umount`.
///
/// Blocks the calling thread and runs its own tokio runtime, so it must not
/// be called from inside one.
pub fn mount<A>(adapter: A, local_path: impl AsRef<Path>, config: RestFsConfig) -> Result<()>
where
    A: Adapter + 'static,
{
    let session = MountSession::establish(Arc::new(adapter), local_path.as_ref(), &config)?;
    let runtime = build_runtime()?;
    runtime.block_on(session.run(interrupt_signal()))
}

/// Mount on a dedicated thread.
///
/// Returns once the mount is registered with the kernel, so mount point and
/// FUSE failures come back from this call rather than from the thread.
pub fn spawn_mount<A>(
    adapter: A,
    local_path: impl AsRef<Path>,
    config: RestFsConfig,
) -> Result<MountHandle>
where
    A: Adapter + 'static,
{
    let session = MountSession::establish(Arc::new(adapter), local_path.as_ref(), &config)?;
    let mountpoint = session.claim.mountpoint().to_path_buf();

    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let thread = std::thread::Builder::new()
        .name("restfs-mount".into())
        .spawn(move || {
            // a dropped sender counts as an unmount request
            let shutdown = async {
                let _ = cancel_rx.await;
            };
            let result =
                build_runtime().and_then(|runtime| runtime.block_on(session.run(shutdown)));
            let _ = done_tx.send(());
            result
        })?;

    Ok(MountHandle {
        mountpoint,
        cancel: Some(cancel_tx),
        done: Some(done_rx),
        thread: Some(thread),
    })
}

/// Handle to a mount running on its own thread.
/// Dropping it requests an unmount without waiting for it.
pub struct MountHandle {
    mountpoint: PathBuf,
    cancel: Option<oneshot::Sender<()>>,
    done: Option<oneshot::Receiver<()>>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl MountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Ask the mount to shut down. In-flight calls still get their replies.
    pub fn unmount(&mut self) {
        if let Some(tx) = self.cancel.take() {
            info!("unmount requested for {}", self.mountpoint.display());
            let _ = tx.send(());
        }
    }

    /// Resolves once the mount has ended, for whatever reason.
    pub async fn finished(&mut self) {
        if let Some(rx) = self.done.as_mut() {
            let _ = rx.await;
        }
        self.done = None;
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the mount thread and return its result. Does not request an
    /// unmount by itself.
    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| {
                RestFsError::Io(std::io::Error::other("mount thread panicked"))
            })?,
            None => Ok(()),
        }
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        self.unmount();
    }
}
