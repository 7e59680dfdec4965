//! Session and registry layer of the fleetlink control plane.
//!
//! A [`Session`] is the server-side representative of one connected device
//! agent: it owns the socket, runs the optional registration handshake, and
//! serves strictly serialized request/response operations. The
//! [`SessionRegistry`] owns the listening socket and the live session set,
//! republishing the sorted id set whenever it changes.

pub mod registry;
pub mod session;

pub use registry::{RegistryConfig, RegistryError, SessionRegistry};
pub use session::{
    DownloadResult, ExecResult, ListFilesResult, ProgressFn, Session, ShellEvent, TransferError,
    TransferErrorKind, DEFAULT_EXEC_TIMEOUT,
};
