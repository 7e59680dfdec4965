//! Dispatch lane: the single point where external intents enter the system.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::network::NetworkLane;
use crate::tunnel::{TunnelCommand, TunnelLane};

/// Intents accepted from external collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Select a device for interaction, or deselect with `None`.
    SelectClient(Option<String>),
    SendShell { id: String, text: String },
    StartTunnel { privileged: bool },
    StopTunnel,
    Shutdown,
}

/// Interaction mode, derived purely from the most recent selection or
/// shell-send intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Shell,
}

/// Single consumer of external intents, routing them to the other lanes.
pub struct DispatchLane {
    intents_tx: mpsc::UnboundedSender<Intent>,
    mode_rx: watch::Receiver<Mode>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl DispatchLane {
    pub fn new(network: Arc<NetworkLane>, tunnel: Arc<TunnelLane>) -> Self {
        let (intents_tx, intents_rx) = mpsc::unbounded_channel();
        let (mode_tx, mode_rx) = watch::channel(Mode::Idle);
        let worker = tokio::spawn(run_lane(network, tunnel, intents_rx, mode_tx));
        Self {
            intents_tx,
            mode_rx,
            worker: StdMutex::new(Some(worker)),
        }
    }

    pub fn send(&self, intent: Intent) {
        let _ = self.intents_tx.send(intent);
    }

    /// Current interaction mode.
    pub fn mode(&self) -> Mode {
        *self.mode_rx.borrow()
    }

    /// Watch interaction mode changes.
    pub fn watch_mode(&self) -> watch::Receiver<Mode> {
        self.mode_rx.clone()
    }

    pub async fn shutdown(&self) {
        self.send(Intent::Shutdown);
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn run_lane(
    network: Arc<NetworkLane>,
    tunnel: Arc<TunnelLane>,
    mut intents_rx: mpsc::UnboundedReceiver<Intent>,
    mode_tx: watch::Sender<Mode>,
) {
    while let Some(intent) = intents_rx.recv().await {
        match intent {
            Intent::Shutdown => break,
            Intent::SelectClient(selection) => {
                let mode = match selection {
                    Some(_) => Mode::Shell,
                    None => Mode::Idle,
                };
                debug!(?mode, "Selection changed");
                let _ = mode_tx.send(mode);
            }
            Intent::SendShell { id, text } => {
                let _ = mode_tx.send(Mode::Shell);
                network.send_shell(&id, &text);
            }
            Intent::StartTunnel { privileged } => {
                tunnel.send(TunnelCommand::Start { privileged });
            }
            Intent::StopTunnel => {
                tunnel.send(TunnelCommand::Stop);
            }
        }
    }
    debug!("Dispatch lane stopped");
}
