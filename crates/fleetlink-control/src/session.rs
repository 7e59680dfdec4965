//! One connected device agent.
//!
//! The protocol carries no correlation identifiers, so every operation takes
//! the session's IO mutex for its entire request/response exchange, streamed
//! binary payloads included. Interleaving two exchanges on one socket would
//! corrupt both; the mutex is the load-bearing invariant here.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use fleetlink_proto::{
    validate_remote_path, FrameError, FrameStream, Message, RegistrationInfo, Request,
};

/// Timeout applied to fire-and-forget shell commands.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Shell event buffer; a subscriber lagging by more than this loses the
/// oldest events and continues, the producer never blocks.
const SHELL_EVENT_BUFFER: usize = 256;

/// Events observed on a session's shell stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    OutputLine(String),
    CommandEnd,
}

/// Outcome of a managed shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecResult {
    Output(String),
    Failed(String),
    TimedOut,
}

/// Outcome of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListFilesResult {
    Listed(Vec<fleetlink_proto::RemoteFileEntry>),
    /// The agent reported an error for the listed path.
    Error(String),
    /// Malformed or missing response, invalid path, or a dead session.
    Failed,
}

/// Outcome of a file download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadResult {
    Done,
    NotFound,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    Timeout,
    InvalidLength,
    IoInterrupted,
    ProtocolMismatch,
}

/// Last failure recorded by a transfer operation on this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub message: String,
}

/// Progress observer for file transfers, called with `(done, total)` bytes.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Why an exchange did not produce a reply message.
enum ExchangeError {
    TimedOut,
    Fatal(TransferErrorKind, String),
}

/// The server-side state of one accepted agent connection.
pub struct Session {
    id: String,
    io: Mutex<FrameStream<TcpStream>>,
    registration: StdRwLock<Option<RegistrationInfo>>,
    last_transfer_error: StdRwLock<Option<TransferError>>,
    output_log: StdMutex<String>,
    shell_tx: broadcast::Sender<ShellEvent>,
    closed: AtomicBool,
    closer: mpsc::UnboundedSender<String>,
}

impl Session {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        max_binary_frame: u32,
        closer: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        let (shell_tx, _) = broadcast::channel(SHELL_EVENT_BUFFER);
        Arc::new(Self {
            id: peer.to_string(),
            io: Mutex::new(FrameStream::with_max_binary(stream, max_binary_frame)),
            registration: StdRwLock::new(None),
            last_transfer_error: StdRwLock::new(None),
            output_log: StdMutex::new(String::new()),
            shell_tx,
            closed: AtomicBool::new(false),
            closer,
        })
    }

    /// Session id, derived from the peer address and immutable.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Identity the agent announced, if it registered in time.
    pub fn registration_info(&self) -> Option<RegistrationInfo> {
        self.registration.read().unwrap().clone()
    }

    /// Last failure recorded by a transfer operation.
    pub fn last_transfer_error(&self) -> Option<TransferError> {
        self.last_transfer_error.read().unwrap().clone()
    }

    /// Full shell output accumulated over the session lifetime.
    pub fn output_log(&self) -> String {
        self.output_log.lock().unwrap().clone()
    }

    /// Subscribe to shell output events. Late subscribers see no history.
    pub fn subscribe_shell(&self) -> broadcast::Receiver<ShellEvent> {
        self.shell_tx.subscribe()
    }

    /// Wait for the agent's optional `register` frame.
    ///
    /// Timing out or receiving some other message type is a normal outcome;
    /// the session stays fully usable without registration. Only a framing
    /// or IO failure closes the connection.
    pub(crate) async fn run_registration(&self, wait: Duration) {
        let mut io = self.io.lock().await;
        if self.is_closed() {
            return;
        }
        match timeout(wait, io.read_json()).await {
            Err(_) => {
                debug!(session = %self.id, "No registration within timeout");
            }
            Ok(Ok(message)) => match RegistrationInfo::from_message(&message) {
                Some(reg) => {
                    info!(
                        session = %self.id,
                        device_name = %reg.device_name,
                        device_id = %reg.device_id,
                        arch = %reg.arch,
                        "Agent registered"
                    );
                    *self.registration.write().unwrap() = Some(reg);
                }
                None => {
                    debug!(
                        session = %self.id,
                        msg_type = message.msg_type(),
                        "First frame was not a register message"
                    );
                }
            },
            Ok(Err(err)) => {
                warn!(session = %self.id, error = %err, "Registration read failed, closing");
                self.close_locked(&mut io).await;
            }
        }
    }

    /// Run a shell command and capture its output.
    pub async fn run_command(&self, cmd: &str, wait: Duration) -> ExecResult {
        let mut io = self.io.lock().await;
        let request = Request::Exec {
            cmd: cmd.to_string(),
        };
        let message = match self.exchange(&mut io, &request, wait).await {
            Ok(message) => message,
            Err(ExchangeError::TimedOut) => return ExecResult::TimedOut,
            Err(ExchangeError::Fatal(_, message)) => return ExecResult::Failed(message),
        };

        if message.msg_type() != "exec" {
            return ExecResult::Failed("Invalid response from client".to_string());
        }
        if message.has_error() {
            return ExecResult::Failed(message.error().to_string());
        }
        ExecResult::Output(message.str_field("output").unwrap_or_default().to_string())
    }

    /// Fire-and-forget shell send: run the command with the default timeout
    /// and publish its output line by line, then a command-end marker.
    pub async fn send_shell(&self, cmd: &str) {
        match self.run_command(cmd, DEFAULT_EXEC_TIMEOUT).await {
            ExecResult::Output(output) => {
                for line in output.lines() {
                    self.emit_line(line);
                }
            }
            ExecResult::Failed(err) => self.emit_line(&format!("[ERROR] {err}")),
            ExecResult::TimedOut => self.emit_line("[ERROR] Command timed out"),
        }
        let _ = self.shell_tx.send(ShellEvent::CommandEnd);
    }

    /// List a remote directory.
    pub async fn list_files(&self, path: &str, wait: Duration) -> ListFilesResult {
        if !validate_remote_path(path) {
            return ListFilesResult::Failed;
        }
        let mut io = self.io.lock().await;
        let request = Request::File {
            path: path.to_string(),
        };
        let message = match self.exchange(&mut io, &request, wait).await {
            Ok(message) => message,
            Err(err) => {
                self.record_exchange_error(&err);
                return ListFilesResult::Failed;
            }
        };

        if message.msg_type() != "file" {
            self.record_transfer_error(
                TransferErrorKind::ProtocolMismatch,
                format!("expected file reply, got {}", message.msg_type()),
            );
            return ListFilesResult::Failed;
        }
        if message.has_error() {
            return ListFilesResult::Error(message.error().to_string());
        }
        match message.file_entries() {
            Some(entries) => ListFilesResult::Listed(entries),
            None => ListFilesResult::Failed,
        }
    }

    /// Upload a local file to the agent. Returns `true` only when the agent
    /// acknowledged the full payload with a blank error.
    pub async fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        progress: Option<ProgressFn>,
        wait: Duration,
    ) -> bool {
        if !validate_remote_path(remote) {
            return false;
        }
        let total = match tokio::fs::metadata(local).await {
            Ok(meta) => meta.len(),
            Err(err) => {
                self.record_transfer_error(TransferErrorKind::IoInterrupted, err.to_string());
                return false;
            }
        };
        // The wire length field is a signed 32-bit value on the agent side.
        if total > i32::MAX as u64 {
            self.record_transfer_error(
                TransferErrorKind::InvalidLength,
                format!("file is {total} bytes, over the transfer limit"),
            );
            return false;
        }
        let mut file = match tokio::fs::File::open(local).await {
            Ok(file) => file,
            Err(err) => {
                self.record_transfer_error(TransferErrorKind::IoInterrupted, err.to_string());
                return false;
            }
        };

        let mut io = self.io.lock().await;
        let request = Request::UploadFile {
            path: remote.to_string(),
        };
        if let Err(err) = self.send_request(&mut io, &request).await {
            self.record_exchange_error(&err);
            return false;
        }

        let report = progress_adapter(progress);
        if let Err(err) = io.write_binary_from(&mut file, total, report).await {
            let err = ExchangeError::Fatal(transfer_kind(&err), err.to_string());
            self.close_locked(&mut io).await;
            self.record_exchange_error(&err);
            return false;
        }

        let message = match self.await_reply(&mut io, wait).await {
            Ok(message) => message,
            Err(err) => {
                self.record_exchange_error(&err);
                return false;
            }
        };
        if message.msg_type() != "uploadfile" {
            self.record_transfer_error(
                TransferErrorKind::ProtocolMismatch,
                format!("expected uploadfile reply, got {}", message.msg_type()),
            );
            return false;
        }
        !message.has_error()
    }

    /// Download a remote file into `local`.
    pub async fn download_file(
        &self,
        remote: &str,
        local: &Path,
        progress: Option<ProgressFn>,
        wait: Duration,
    ) -> DownloadResult {
        if !validate_remote_path(remote) {
            return DownloadResult::Failed;
        }
        let mut io = self.io.lock().await;
        let request = Request::DownloadFile {
            path: remote.to_string(),
        };
        let message = match self.exchange(&mut io, &request, wait).await {
            Ok(message) => message,
            Err(err) => {
                self.record_exchange_error(&err);
                return DownloadResult::Failed;
            }
        };

        if message.msg_type() != "downloadfile" {
            self.record_transfer_error(
                TransferErrorKind::ProtocolMismatch,
                format!("expected downloadfile reply, got {}", message.msg_type()),
            );
            return DownloadResult::Failed;
        }
        if message.has_error() {
            if message.error().to_lowercase().contains("not") {
                return DownloadResult::NotFound;
            }
            return DownloadResult::Failed;
        }

        let mut file = match tokio::fs::File::create(local).await {
            Ok(file) => file,
            Err(err) => {
                self.record_transfer_error(TransferErrorKind::IoInterrupted, err.to_string());
                return DownloadResult::Failed;
            }
        };

        let report = progress_adapter(progress);
        match timeout(wait, io.read_binary_into(&mut file, report)).await {
            Err(_) => {
                self.close_locked(&mut io).await;
                self.record_transfer_error(
                    TransferErrorKind::Timeout,
                    "timed out reading file payload".to_string(),
                );
                DownloadResult::Failed
            }
            Ok(Err(err)) => {
                self.close_locked(&mut io).await;
                self.record_transfer_error(transfer_kind(&err), err.to_string());
                DownloadResult::Failed
            }
            Ok(Ok(_)) => DownloadResult::Done,
        }
    }

    /// Query device information. The reply is returned as-is; a mismatched
    /// reply type is replaced by a synthesized error object.
    pub async fn request_device_info(&self, wait: Duration) -> serde_json::Value {
        let mut io = self.io.lock().await;
        match self.exchange(&mut io, &Request::Info, wait).await {
            Ok(message) if message.msg_type() == "info" => message.into_value(),
            Ok(_) => json!({"type": "info", "error": "Invalid response from client"}),
            Err(ExchangeError::TimedOut) => {
                json!({"type": "info", "error": "Request timed out"})
            }
            Err(ExchangeError::Fatal(_, message)) => json!({"type": "info", "error": message}),
        }
    }

    /// Close the session. Idempotent; only the first call shuts the socket
    /// down and notifies the registry.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut io = self.io.lock().await;
        let _ = io.shutdown().await;
        drop(io);
        self.notify_closed();
    }

    /// Close while already holding the IO lock (fatal error paths).
    async fn close_locked(&self, io: &mut FrameStream<TcpStream>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = io.shutdown().await;
        self.notify_closed();
    }

    fn notify_closed(&self) {
        debug!(session = %self.id, "Session closed");
        let _ = self.closer.send(self.id.clone());
    }

    /// Write one request frame. Any failure here is connection-fatal.
    async fn send_request(
        &self,
        io: &mut FrameStream<TcpStream>,
        request: &Request,
    ) -> Result<(), ExchangeError> {
        if self.is_closed() {
            return Err(ExchangeError::Fatal(
                TransferErrorKind::IoInterrupted,
                "session is closed".to_string(),
            ));
        }
        if let Err(err) = io.write_json(request).await {
            let fault = ExchangeError::Fatal(transfer_kind(&err), err.to_string());
            self.close_locked(io).await;
            return Err(fault);
        }
        Ok(())
    }

    /// Await the JSON reply to a request that was already written.
    ///
    /// A timeout here closes the session: the agent may still answer later,
    /// and with no correlation ids a late reply would desynchronize the next
    /// exchange on this socket. Framing errors close it for the same reason.
    async fn await_reply(
        &self,
        io: &mut FrameStream<TcpStream>,
        wait: Duration,
    ) -> Result<Message, ExchangeError> {
        match timeout(wait, io.read_json()).await {
            Err(_) => {
                self.close_locked(io).await;
                Err(ExchangeError::TimedOut)
            }
            Ok(Err(err)) => {
                let fault = ExchangeError::Fatal(transfer_kind(&err), err.to_string());
                self.close_locked(io).await;
                Err(fault)
            }
            Ok(Ok(message)) => Ok(message),
        }
    }

    async fn exchange(
        &self,
        io: &mut FrameStream<TcpStream>,
        request: &Request,
        wait: Duration,
    ) -> Result<Message, ExchangeError> {
        self.send_request(io, request).await?;
        self.await_reply(io, wait).await
    }

    fn emit_line(&self, line: &str) {
        {
            let mut log = self.output_log.lock().unwrap();
            log.push_str(line);
            log.push('\n');
        }
        let _ = self.shell_tx.send(ShellEvent::OutputLine(line.to_string()));
    }

    fn record_exchange_error(&self, err: &ExchangeError) {
        match err {
            ExchangeError::TimedOut => self.record_transfer_error(
                TransferErrorKind::Timeout,
                "timed out waiting for reply".to_string(),
            ),
            ExchangeError::Fatal(kind, message) => {
                self.record_transfer_error(*kind, message.clone())
            }
        }
    }

    fn record_transfer_error(&self, kind: TransferErrorKind, message: String) {
        warn!(session = %self.id, ?kind, %message, "Transfer error");
        *self.last_transfer_error.write().unwrap() = Some(TransferError { kind, message });
    }
}

/// Map a framing error onto the transfer error taxonomy.
fn transfer_kind(err: &FrameError) -> TransferErrorKind {
    match err {
        FrameError::InvalidLength { .. } => TransferErrorKind::InvalidLength,
        FrameError::UnexpectedKind { .. }
        | FrameError::InvalidJson(_)
        | FrameError::MissingType => TransferErrorKind::ProtocolMismatch,
        FrameError::Io(_) | FrameError::Closed => TransferErrorKind::IoInterrupted,
    }
}

fn progress_adapter(progress: Option<ProgressFn>) -> impl FnMut(u64, u64) {
    move |done, total| {
        if let Some(report) = &progress {
            report(done, total);
        }
    }
}
