use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

use redock_core::paths::{redock_root, socket_path, state_dir};
use redock_core::types::ReconcileState;
use redock_core::DeployConfig;
use redock_reconcile::{pipeline, run_record, CancelToken, Orchestrator, RunRecord};

use crate::error::{io_err, DaemonError};
use crate::protocol::{DaemonRequest, DaemonResponse, TriggerReply};

/// Pending triggers beyond this make `reconcile` requests wait for room.
const QUEUE_CAPACITY: usize = 64;

/// Runs one reconciliation on behalf of the daemon.
pub trait Deployer: Send + Sync + 'static {
    /// Blocking; always called from a blocking worker.
    fn deploy(&self, source: &str, cancel: &CancelToken) -> RunRecord;

    fn state(&self) -> ReconcileState;
}

/// [`Deployer`] over a real [`Orchestrator`], persisting every run record.
pub struct OrchestratorDeployer {
    orchestrator: Orchestrator,
    home: PathBuf,
}

impl OrchestratorDeployer {
    pub fn new(orchestrator: Orchestrator, home: PathBuf) -> Self {
        Self { orchestrator, home }
    }
}

impl Deployer for OrchestratorDeployer {
    fn deploy(&self, source: &str, cancel: &CancelToken) -> RunRecord {
        pipeline::run(&self.orchestrator, &self.home, source, cancel)
    }

    fn state(&self) -> ReconcileState {
        self.orchestrator.state()
    }
}

struct ReconcileJob {
    source: String,
    respond_to: oneshot::Sender<TriggerReply>,
}

/// What the processor has done so far, for `status`.
#[derive(Debug, Default)]
struct ProcessorStats {
    runs: u64,
    triggers: u64,
    last_run: Option<RunRecord>,
}

/// Start the daemon for `config` and block the current thread until it exits.
pub fn start_blocking(home: &Path, config: DeployConfig) -> Result<(), DaemonError> {
    init_tracing();
    let orchestrator = Orchestrator::from_config(config, home)
        .with_last_good_stack(pipeline::previous_good_stack(home));
    let deployer = Arc::new(OrchestratorDeployer::new(orchestrator, home.to_path_buf()));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), deployer))
}

/// Run the daemon: trigger processor, socket server and ctrl-c handler.
pub async fn run(home: PathBuf, deployer: Arc<dyn Deployer>) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let last_run = match run_record::load_at(&home) {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(error = %err, "ignoring unreadable run record");
            None
        }
    };
    let stats = Arc::new(RwLock::new(ProcessorStats {
        last_run,
        ..Default::default()
    }));
    let started_at = Utc::now();
    let cancel = CancelToken::new();

    let (job_tx, job_rx) = mpsc::channel::<ReconcileJob>(QUEUE_CAPACITY);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let deployer = deployer.clone();
        let stats = stats.clone();
        let cancel = cancel.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = processor_task(deployer, job_rx, cancel, stats, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = SocketContext {
            home: home.clone(),
            deployer: deployer.clone(),
            stats: stats.clone(),
            job_tx: job_tx.clone(),
            cancel: cancel.clone(),
            shutdown_tx: shutdown.clone(),
            started_at_unix: started_at.timestamp(),
        };
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = socket_server_task(ctx, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            cancel.cancel();
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };
    drop(job_tx);

    let (processor_result, socket_result, signal_result) =
        tokio::join!(processor_handle, socket_handle, signal_handle);

    handle_join("processor", processor_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

/// Serve triggers one run at a time. Every trigger already queued when a
/// run starts is folded into that run, so the run starts after the newest
/// of them arrived and each waiter gets its result.
async fn processor_task(
    deployer: Arc<dyn Deployer>,
    mut job_rx: mpsc::Receiver<ReconcileJob>,
    cancel: CancelToken,
    stats: Arc<RwLock<ProcessorStats>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            maybe_job = job_rx.recv() => {
                let Some(first) = maybe_job else { break };
                let mut batch = vec![first];
                while let Ok(job) = job_rx.try_recv() {
                    batch.push(job);
                }
                let source = batch
                    .last()
                    .map(|job| job.source.clone())
                    .unwrap_or_else(|| "daemon".to_string());
                if batch.len() > 1 {
                    tracing::info!(coalesced = batch.len(), %source, "coalescing queued triggers into one run");
                }

                let deployer = deployer.clone();
                let run_cancel = cancel.clone();
                let record = tokio::task::spawn_blocking(move || deployer.deploy(&source, &run_cancel))
                    .await
                    .map_err(|err| DaemonError::Protocol(format!("reconcile task join error: {err}")))?;

                {
                    let mut stats = stats.write().await;
                    stats.runs += 1;
                    stats.triggers += batch.len() as u64;
                    stats.last_run = Some(record.clone());
                }

                let coalesced = batch.len();
                for job in batch {
                    let _ = job.respond_to.send(TriggerReply {
                        record: record.clone(),
                        coalesced,
                    });
                }
            }
        }
    }

    Ok(())
}

struct SocketContext {
    home: PathBuf,
    deployer: Arc<dyn Deployer>,
    stats: Arc<RwLock<ProcessorStats>>,
    job_tx: mpsc::Sender<ReconcileJob>,
    cancel: CancelToken,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: i64,
}

async fn socket_server_task(
    ctx: SocketContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&ctx.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon listening");

    let ctx = Arc::new(ctx);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, ctx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(stream: UnixStream, ctx: Arc<SocketContext>) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => DaemonResponse::ok(build_status_payload(&ctx).await),
            "reconcile" => {
                let source = request.source.clone().unwrap_or_else(|| "daemon".to_string());
                match enqueue_reconcile(&ctx.job_tx, source).await {
                    Ok(reply) => DaemonResponse::ok(json!(reply)),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            "stop" => {
                ctx.cancel.cancel();
                let _ = ctx.shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn build_status_payload(ctx: &SocketContext) -> Value {
    let (runs, triggers, last_run) = {
        let stats = ctx.stats.read().await;
        (stats.runs, stats.triggers, stats.last_run.clone())
    };
    let queued = ctx.job_tx.max_capacity() - ctx.job_tx.capacity();

    json!({
        "running": true,
        "started_at_unix": ctx.started_at_unix,
        "state": ctx.deployer.state(),
        "queued": queued,
        "runs": runs,
        "triggers": triggers,
        "last_run": last_run,
        "socket": socket_path(&ctx.home).display().to_string(),
    })
}

async fn enqueue_reconcile(
    job_tx: &mpsc::Sender<ReconcileJob>,
    source: String,
) -> Result<TriggerReply, DaemonError> {
    let (tx, rx) = oneshot::channel();
    job_tx
        .send(ReconcileJob {
            source,
            respond_to: tx,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("reconcile queue"))?;

    rx.await
        .map_err(|_| DaemonError::ChannelClosed("reconcile response"))
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [redock_root(home), state_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Install the global subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
