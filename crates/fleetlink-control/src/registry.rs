//! Listener ownership and the live session set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::session::Session;
use fleetlink_proto::DEFAULT_MAX_BINARY_FRAME;

/// Buffer for the live-id-set broadcast.
const CLIENTS_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
}

/// Registry tuning knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a fresh session may take to send its `register` frame.
    pub registration_timeout: Duration,
    /// Per-session cap on binary frame payloads.
    pub max_binary_frame: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registration_timeout: Duration::from_secs(5),
            max_binary_frame: DEFAULT_MAX_BINARY_FRAME,
        }
    }
}

struct ListenerHandle {
    /// Port as requested by the caller, for the rebind no-op check.
    port: u16,
    /// Port actually bound, which differs when the caller asked for 0.
    local_port: u16,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct RegistryInner {
    config: RegistryConfig,
    sessions: StdMutex<HashMap<String, Arc<Session>>>,
    listener: StdMutex<Option<ListenerHandle>>,
    clients_tx: broadcast::Sender<Vec<String>>,
    closer_tx: mpsc::UnboundedSender<String>,
}

/// Owns the listening socket and the set of live sessions.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (clients_tx, _) = broadcast::channel(CLIENTS_BUFFER);
        let (closer_tx, closer_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(RegistryInner {
            config,
            sessions: StdMutex::new(HashMap::new()),
            listener: StdMutex::new(None),
            clients_tx,
            closer_tx,
        });
        tokio::spawn(reap_closed(Arc::downgrade(&inner), closer_rx));
        Self { inner }
    }

    /// Start listening on `port`. Starting on the already-bound port is a
    /// no-op; a different port tears the existing listener and its sessions
    /// down first.
    pub async fn start(&self, port: u16) -> Result<(), RegistryError> {
        {
            let listener = self.inner.listener.lock().unwrap();
            if let Some(handle) = listener.as_ref() {
                if handle.port == port {
                    debug!(port, "Registry already listening");
                    return Ok(());
                }
            }
        }
        self.stop().await;

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| RegistryError::Bind { port, source })?;
        let local_port = listener
            .local_addr()
            .map_err(|source| RegistryError::Bind { port, source })?
            .port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(self.inner.clone(), listener, shutdown_rx));
        *self.inner.listener.lock().unwrap() = Some(ListenerHandle {
            port,
            local_port,
            shutdown_tx,
            task,
        });
        info!(port = local_port, "Registry listening");
        Ok(())
    }

    /// Stop the listener and close every live session, republishing an
    /// empty id set. Safe to call when not started.
    pub async fn stop(&self) {
        let handle = self.inner.listener.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.shutdown_tx.send(());
            let _ = handle.task.await;
            debug!("Listener stopped");
        }

        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in drained {
            session.close().await;
        }
        self.inner.republish();
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.lock().unwrap().get(id).cloned()
    }

    /// Subscribe to changes of the sorted live session id set.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.inner.clients_tx.subscribe()
    }

    /// Current sorted live session ids.
    pub fn current_ids(&self) -> Vec<String> {
        self.inner.sorted_ids()
    }

    /// Bound port while listening, useful when started with port 0.
    pub fn local_port(&self) -> Option<u16> {
        self.inner
            .listener
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| handle.local_port)
    }
}

impl RegistryInner {
    fn admit(self: &Arc<Self>, stream: tokio::net::TcpStream, peer: std::net::SocketAddr) {
        let session = Session::new(
            stream,
            peer,
            self.config.max_binary_frame,
            self.closer_tx.clone(),
        );
        let id = session.id().to_string();

        let replaced = self
            .sessions
            .lock()
            .unwrap()
            .insert(id.clone(), session.clone());
        if let Some(stale) = replaced {
            debug!(session = %id, "Replacing stale session with the same id");
            tokio::spawn(async move { stale.close().await });
        }

        info!(session = %id, "Accepted agent connection");
        self.republish();

        let wait = self.config.registration_timeout;
        tokio::spawn(async move { session.run_registration(wait).await });
    }

    /// Remove `id` if its current entry is a closed session.
    ///
    /// A stale entry that was overwritten by a reconnect must not evict its
    /// replacement, hence the closed check against the *current* entry.
    fn remove_closed(&self, id: &str) {
        let removed = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get(id) {
                Some(session) if session.is_closed() => {
                    sessions.remove(id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            info!(session = %id, "Session removed");
            self.republish();
        }
    }

    fn sorted_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn republish(&self) {
        let ids = self.sorted_ids();
        debug!(clients = ids.len(), "Publishing client set");
        let _ = self.clients_tx.send(ids);
    }
}

async fn accept_loop(
    inner: Arc<RegistryInner>,
    listener: TcpListener,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("Accept loop shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => inner.admit(stream, peer),
                Err(err) => {
                    error!(error = %err, "Accept failed, stopping listener");
                    break;
                }
            }
        }
    }
}

/// Drain session close notifications and prune the map.
async fn reap_closed(
    inner: Weak<RegistryInner>,
    mut closer_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(id) = closer_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.remove_closed(&id);
    }
}
