//! Wire protocol for the fleetlink control plane.
//!
//! Agents connect over raw TCP and exchange length-prefixed frames:
//! `[u32 BE length][u8 kind][payload]`. Kind `0x01` carries a UTF-8 JSON
//! object with a mandatory `type` field, kind `0x02` carries raw bytes
//! (file transfer payloads). The protocol has no correlation identifiers,
//! so a connection supports exactly one outstanding request at a time;
//! serialization of exchanges is the caller's responsibility.

pub mod frame;
pub mod messages;
pub mod paths;

pub use frame::{Frame, FrameError, FrameKind, FrameStream, DEFAULT_MAX_BINARY_FRAME, MAX_JSON_FRAME};
pub use messages::{Message, RegistrationInfo, RemoteFileEntry, Request};
pub use paths::validate_remote_path;
