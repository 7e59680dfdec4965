//! Tunnel lane: serializes tunnel agent lifecycle operations and
//! republishes the supervisor's state transitions.

use std::sync::Mutex as StdMutex;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use fleetlink_tunnel::{TunnelAgentSupervisor, TunnelState};

const EVENTS_BUFFER: usize = 16;

/// Commands accepted by the tunnel lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelCommand {
    Start { privileged: bool },
    Stop,
    Restart { privileged: bool },
    Shutdown,
}

/// Tunnel agent state transitions as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEvent {
    Running,
    Stopped,
}

/// Single consumer of tunnel agent lifecycle operations.
pub struct TunnelLane {
    commands_tx: mpsc::UnboundedSender<TunnelCommand>,
    events_tx: broadcast::Sender<TunnelEvent>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl TunnelLane {
    pub fn new(supervisor: TunnelAgentSupervisor) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENTS_BUFFER);
        let worker = tokio::spawn(run_lane(supervisor, commands_rx, events_tx.clone()));
        Self {
            commands_tx,
            events_tx,
            worker: StdMutex::new(Some(worker)),
        }
    }

    pub fn send(&self, command: TunnelCommand) {
        let _ = self.commands_tx.send(command);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events_tx.subscribe()
    }

    /// Stop the lane, stopping the supervised process first.
    pub async fn shutdown(&self) {
        self.send(TunnelCommand::Shutdown);
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn run_lane(
    supervisor: TunnelAgentSupervisor,
    mut commands_rx: mpsc::UnboundedReceiver<TunnelCommand>,
    events_tx: broadcast::Sender<TunnelEvent>,
) {
    let mut state_rx = supervisor.subscribe();

    loop {
        tokio::select! {
            command = commands_rx.recv() => {
                match command {
                    None | Some(TunnelCommand::Shutdown) => break,
                    Some(TunnelCommand::Start { privileged }) => supervisor.start(privileged).await,
                    Some(TunnelCommand::Stop) => supervisor.stop().await,
                    Some(TunnelCommand::Restart { privileged }) => supervisor.restart(privileged).await,
                }
            }
            state = state_rx.recv() => {
                let event = match state {
                    Ok(TunnelState::Running) => TunnelEvent::Running,
                    Ok(TunnelState::Stopped) => TunnelEvent::Stopped,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if supervisor.is_running() { TunnelEvent::Running } else { TunnelEvent::Stopped }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let _ = events_tx.send(event);
            }
        }
    }

    supervisor.stop().await;
    debug!("Tunnel lane stopped");
}
