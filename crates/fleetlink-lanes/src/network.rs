//! Network lane: serializes every registry/session-affecting operation and
//! republishes session events outward.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use fleetlink_control::{
    DownloadResult, ExecResult, ProgressFn, SessionRegistry, ShellEvent,
};

/// Buffer for the outward event broadcast.
const EVENTS_BUFFER: usize = 64;

/// Commands accepted by the network lane.
pub enum NetCommand {
    StartServer {
        port: u16,
    },
    StopServer,
    SendShell {
        id: String,
        cmd: String,
    },
    RunCommand {
        id: String,
        cmd: String,
        timeout: Duration,
        reply: oneshot::Sender<ExecResult>,
    },
    UploadFile {
        id: String,
        local: PathBuf,
        remote: String,
        progress: Option<ProgressFn>,
        reply: oneshot::Sender<bool>,
    },
    DownloadFile {
        id: String,
        remote: String,
        local: PathBuf,
        progress: Option<ProgressFn>,
        reply: oneshot::Sender<DownloadResult>,
    },
    Shutdown,
}

/// Events published by the network lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// Sorted set of live session ids.
    ClientsChanged(Vec<String>),
    ShellOutput { id: String, line: String },
    ShellEnded { id: String },
}

/// Single consumer of all registry/session operations.
pub struct NetworkLane {
    commands_tx: mpsc::UnboundedSender<NetCommand>,
    events_tx: broadcast::Sender<NetEvent>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl NetworkLane {
    pub fn new(registry: SessionRegistry) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENTS_BUFFER);
        let worker = tokio::spawn(run_lane(registry, commands_rx, events_tx.clone()));
        Self {
            commands_tx,
            events_tx,
            worker: StdMutex::new(Some(worker)),
        }
    }

    /// Enqueue a command. Dropped silently once the lane has shut down.
    pub fn send(&self, command: NetCommand) {
        let _ = self.commands_tx.send(command);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.events_tx.subscribe()
    }

    pub fn start_server(&self, port: u16) {
        self.send(NetCommand::StartServer { port });
    }

    pub fn stop_server(&self) {
        self.send(NetCommand::StopServer);
    }

    pub fn send_shell(&self, id: &str, cmd: &str) {
        self.send(NetCommand::SendShell {
            id: id.to_string(),
            cmd: cmd.to_string(),
        });
    }

    /// Run a managed command and await its result through the lane.
    pub async fn run_command(&self, id: &str, cmd: &str, timeout: Duration) -> ExecResult {
        let (reply, result) = oneshot::channel();
        self.send(NetCommand::RunCommand {
            id: id.to_string(),
            cmd: cmd.to_string(),
            timeout,
            reply,
        });
        result
            .await
            .unwrap_or_else(|_| ExecResult::Failed("network lane is gone".to_string()))
    }

    pub async fn upload_file(
        &self,
        id: &str,
        local: PathBuf,
        remote: &str,
        progress: Option<ProgressFn>,
    ) -> bool {
        let (reply, result) = oneshot::channel();
        self.send(NetCommand::UploadFile {
            id: id.to_string(),
            local,
            remote: remote.to_string(),
            progress,
            reply,
        });
        result.await.unwrap_or(false)
    }

    pub async fn download_file(
        &self,
        id: &str,
        remote: &str,
        local: PathBuf,
        progress: Option<ProgressFn>,
    ) -> DownloadResult {
        let (reply, result) = oneshot::channel();
        self.send(NetCommand::DownloadFile {
            id: id.to_string(),
            remote: remote.to_string(),
            local,
            progress,
            reply,
        });
        result.await.unwrap_or(DownloadResult::Failed)
    }

    /// Drain-stop the lane: cancels forwarders and closes the registry.
    pub async fn shutdown(&self) {
        self.send(NetCommand::Shutdown);
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn run_lane(
    registry: SessionRegistry,
    mut commands_rx: mpsc::UnboundedReceiver<NetCommand>,
    events_tx: broadcast::Sender<NetEvent>,
) {
    let mut clients_rx = registry.subscribe();
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            command = commands_rx.recv() => {
                match command {
                    None | Some(NetCommand::Shutdown) => break,
                    Some(command) => handle_command(&registry, command).await,
                }
            }
            changed = clients_rx.recv() => {
                let ids = match changed {
                    Ok(ids) => ids,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Client set stream lagged, resyncing");
                        registry.current_ids()
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                sync_forwarders(&registry, &mut forwarders, &ids, &events_tx);
                let _ = events_tx.send(NetEvent::ClientsChanged(ids));
            }
        }
    }

    for (_, task) in forwarders.drain() {
        task.abort();
    }
    registry.stop().await;
    debug!("Network lane stopped");
}

/// Execute one command. Failures are logged or turned into reply values;
/// nothing here may take the lane down.
async fn handle_command(registry: &SessionRegistry, command: NetCommand) {
    match command {
        NetCommand::StartServer { port } => {
            if let Err(err) = registry.start(port).await {
                error!(port, error = %err, "Failed to start server");
            }
        }
        NetCommand::StopServer => registry.stop().await,
        NetCommand::SendShell { id, cmd } => match registry.get(&id) {
            Some(session) => session.send_shell(&cmd).await,
            None => warn!(session = %id, "Shell send for unknown client"),
        },
        NetCommand::RunCommand {
            id,
            cmd,
            timeout,
            reply,
        } => {
            let result = match registry.get(&id) {
                Some(session) => session.run_command(&cmd, timeout).await,
                None => ExecResult::Failed(format!("unknown client {id}")),
            };
            let _ = reply.send(result);
        }
        NetCommand::UploadFile {
            id,
            local,
            remote,
            progress,
            reply,
        } => {
            let result = match registry.get(&id) {
                Some(session) => session.upload_file(&local, &remote, progress, timeout_for_transfer()).await,
                None => {
                    warn!(session = %id, "Upload for unknown client");
                    false
                }
            };
            let _ = reply.send(result);
        }
        NetCommand::DownloadFile {
            id,
            remote,
            local,
            progress,
            reply,
        } => {
            let result = match registry.get(&id) {
                Some(session) => {
                    session
                        .download_file(&remote, &local, progress, timeout_for_transfer())
                        .await
                }
                None => {
                    warn!(session = %id, "Download for unknown client");
                    DownloadResult::Failed
                }
            };
            let _ = reply.send(result);
        }
        NetCommand::Shutdown => unreachable!("handled by the lane loop"),
    }
}

/// File transfers move real payloads; give them a generous fixed window.
fn timeout_for_transfer() -> Duration {
    Duration::from_secs(120)
}

/// Keep one shell-event forwarder per live session.
fn sync_forwarders(
    registry: &SessionRegistry,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
    ids: &[String],
    events_tx: &broadcast::Sender<NetEvent>,
) {
    forwarders.retain(|id, task| {
        if ids.contains(id) {
            true
        } else {
            task.abort();
            false
        }
    });

    for id in ids {
        if forwarders.contains_key(id) {
            continue;
        }
        let Some(session) = registry.get(id) else {
            continue;
        };
        let task = tokio::spawn(forward_shell_events(
            id.clone(),
            session.subscribe_shell(),
            events_tx.clone(),
        ));
        forwarders.insert(id.clone(), task);
    }
}

async fn forward_shell_events(
    id: String,
    mut shell_rx: broadcast::Receiver<ShellEvent>,
    events_tx: broadcast::Sender<NetEvent>,
) {
    loop {
        match shell_rx.recv().await {
            Ok(ShellEvent::OutputLine(line)) => {
                let _ = events_tx.send(NetEvent::ShellOutput {
                    id: id.clone(),
                    line,
                });
            }
            Ok(ShellEvent::CommandEnd) => {
                let _ = events_tx.send(NetEvent::ShellEnded { id: id.clone() });
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(session = %id, missed, "Shell event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
