//! Tunnel agent process supervision.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::privilege::{sweep_residual_processes, PrivilegedRunner, SuRunner};

/// Buffer for the running/stopped state broadcast.
const STATE_BUFFER: usize = 16;

/// Prefix tagging stderr lines in the shared log.
const STDERR_TAG: &str = "[stderr] ";

/// Published tunnel agent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Running,
    Stopped,
}

/// Filesystem locations of the supervised binary.
#[derive(Debug, Clone)]
pub struct TunnelAgentPaths {
    /// Bundled binary shipped with the control plane, copied out on first
    /// start.
    pub resource: PathBuf,
    /// Extraction target that actually gets executed.
    pub binary: PathBuf,
    /// Tunnel agent config file, passed via `-c`.
    pub config: PathBuf,
}

struct ProcessSlot {
    running: bool,
    /// Incremented per launch; an exit monitor only clears state for its
    /// own generation, so a stale monitor cannot clobber a newer process.
    generation: u64,
    shutdown_tx: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

struct SupervisorInner {
    paths: TunnelAgentPaths,
    runner: Arc<dyn PrivilegedRunner>,
    slot: Mutex<ProcessSlot>,
    running_flag: AtomicBool,
    state_tx: broadcast::Sender<TunnelState>,
    log: Arc<StdMutex<String>>,
}

/// Supervises the external reverse-tunnel binary.
///
/// Cheap to clone; all clones share the same process slot.
#[derive(Clone)]
pub struct TunnelAgentSupervisor {
    inner: Arc<SupervisorInner>,
}

impl TunnelAgentSupervisor {
    pub fn new(paths: TunnelAgentPaths, runner: Arc<dyn PrivilegedRunner>) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_BUFFER);
        Self {
            inner: Arc::new(SupervisorInner {
                paths,
                runner,
                slot: Mutex::new(ProcessSlot {
                    running: false,
                    generation: 0,
                    shutdown_tx: None,
                    tasks: Vec::new(),
                }),
                running_flag: AtomicBool::new(false),
                state_tx,
                log: Arc::new(StdMutex::new(String::new())),
            }),
        }
    }

    /// Supervisor with the production `su` runner.
    pub fn with_su(paths: TunnelAgentPaths) -> Self {
        Self::new(paths, Arc::new(SuRunner))
    }

    pub fn is_running(&self) -> bool {
        self.inner.running_flag.load(Ordering::SeqCst)
    }

    /// Subscribe to running/stopped transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelState> {
        self.inner.state_tx.subscribe()
    }

    /// Combined stdout/stderr log of the supervised process.
    pub fn output_log(&self) -> String {
        self.inner.log.lock().unwrap().clone()
    }

    /// Start the tunnel agent. No-op when already running; any readiness
    /// failure is logged and leaves the supervisor stopped.
    pub async fn start(&self, use_privileged: bool) {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        if slot.running {
            debug!("Tunnel agent already running");
            return;
        }

        if !inner.paths.config.exists() {
            error!(config = %inner.paths.config.display(), "Tunnel config missing, not starting");
            return;
        }
        if let Err(err) = inner.ensure_binary() {
            error!(
                binary = %inner.paths.binary.display(),
                error = %err,
                "Tunnel binary is not executable, not starting"
            );
            return;
        }

        if use_privileged {
            sweep_residual_processes(&*inner.runner, &inner.binary_name()).await;
        }

        let mut child = match inner.spawn_agent(use_privileged) {
            Ok(child) => child,
            Err(err) => {
                error!(error = %err, "Failed to spawn tunnel agent");
                return;
            }
        };
        info!(
            binary = %inner.paths.binary.display(),
            privileged = use_privileged,
            "Tunnel agent started"
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        slot.generation += 1;
        let generation = slot.generation;
        slot.running = true;
        slot.shutdown_tx = Some(shutdown_tx);
        slot.tasks.clear();
        if let Some(stdout) = stdout {
            slot.tasks
                .push(spawn_line_pump(stdout, inner.log.clone(), None));
        }
        if let Some(stderr) = stderr {
            slot.tasks
                .push(spawn_line_pump(stderr, inner.log.clone(), Some(STDERR_TAG)));
        }
        slot.tasks
            .push(spawn_exit_monitor(inner.clone(), child, shutdown_rx, generation));

        inner.running_flag.store(true, Ordering::SeqCst);
        let _ = inner.state_tx.send(TunnelState::Running);
    }

    /// Stop the tunnel agent: kill the process, then join the pump and
    /// monitor tasks. No-op when nothing is running.
    pub async fn stop(&self) {
        let (shutdown_tx, tasks) = {
            let mut slot = self.inner.slot.lock().await;
            if !slot.running && slot.shutdown_tx.is_none() && slot.tasks.is_empty() {
                debug!("Tunnel agent not running");
                return;
            }
            (slot.shutdown_tx.take(), std::mem::take(&mut slot.tasks))
        };

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
        for task in tasks {
            let _ = task.await;
        }
        debug!("Tunnel agent stopped");
    }

    /// Sequential stop-then-start. Not atomic with respect to concurrent
    /// start/stop calls; the last writer wins.
    pub async fn restart(&self, use_privileged: bool) {
        self.stop().await;
        self.start(use_privileged).await;
    }
}

impl SupervisorInner {
    fn binary_name(&self) -> String {
        self.paths
            .binary
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tunnel-agent".to_string())
    }

    /// Extract the bundled binary if needed and make sure it is executable.
    fn ensure_binary(&self) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if !self.paths.binary.exists() {
            if let Some(parent) = self.paths.binary.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&self.paths.resource, &self.paths.binary)?;
            info!(
                resource = %self.paths.resource.display(),
                binary = %self.paths.binary.display(),
                "Extracted tunnel agent binary"
            );
        }

        let broad = std::fs::set_permissions(
            &self.paths.binary,
            std::fs::Permissions::from_mode(0o777),
        );
        if broad.is_err() {
            // Fall back to adding executable bits to whatever mode is there.
            let mut perms = std::fs::metadata(&self.paths.binary)?.permissions();
            let mode = perms.mode();
            perms.set_mode(mode | 0o111);
            std::fs::set_permissions(&self.paths.binary, perms)?;
        }

        let mode = std::fs::metadata(&self.paths.binary)?.permissions().mode();
        if mode & 0o111 == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "executable bit could not be set",
            ));
        }
        Ok(())
    }

    fn spawn_agent(&self, use_privileged: bool) -> std::io::Result<Child> {
        let mut command = if use_privileged {
            let mut command = Command::new("su");
            command.arg("-c").arg(format!(
                "{} -c {}",
                self.paths.binary.display(),
                self.paths.config.display()
            ));
            command
        } else {
            let mut command = Command::new(&self.paths.binary);
            command.arg("-c").arg(&self.paths.config);
            command
        };
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.spawn()
    }

    /// Clear running state, but only for the launch that owns `generation`.
    async fn mark_stopped(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        if slot.generation != generation {
            debug!("Stale exit monitor, ignoring");
            return;
        }
        slot.running = false;
        slot.shutdown_tx = None;
        slot.tasks.clear();
        self.running_flag.store(false, Ordering::SeqCst);
        let _ = self.state_tx.send(TunnelState::Stopped);
    }
}

/// Pump process output lines into the shared log.
fn spawn_line_pump<R>(
    reader: R,
    log: Arc<StdMutex<String>>,
    tag: Option<&'static str>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(tag = tag.unwrap_or(""), line = %line, "Tunnel agent output");
            let mut log = log.lock().unwrap();
            if let Some(tag) = tag {
                log.push_str(tag);
            }
            log.push_str(&line);
            log.push('\n');
        }
    })
}

/// Wait for the process to exit on its own or be told to die.
fn spawn_exit_monitor(
    inner: Arc<SupervisorInner>,
    mut child: Child,
    shutdown_rx: oneshot::Receiver<()>,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => info!(code = ?status.code(), "Tunnel agent exited"),
                Err(err) => warn!(error = %err, "Tunnel agent wait failed"),
            },
            _ = shutdown_rx => {
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "Failed to kill tunnel agent");
                }
            }
        }
        inner.mark_stopped(generation).await;
    })
}
