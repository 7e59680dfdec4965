//! Protocol message types.
//!
//! Requests the control plane sends are a closed set and serialize through
//! [`Request`]. Inbound messages come from untrusted agents and may carry
//! arbitrary extra fields (the `info` reply in particular), so they are kept
//! as loose JSON behind the [`Message`] accessors rather than forced into
//! rigid structs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::FrameError;

/// Requests sent from the control plane to an agent.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    Exec { cmd: String },
    File { path: String },
    UploadFile { path: String },
    DownloadFile { path: String },
    Info,
}

impl Request {
    /// The `type` field value this request serializes with, which is also
    /// the `type` its reply must carry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Exec { .. } => "exec",
            Request::File { .. } => "file",
            Request::UploadFile { .. } => "uploadfile",
            Request::DownloadFile { .. } => "downloadfile",
            Request::Info => "info",
        }
    }
}

/// One decoded JSON protocol message.
///
/// Guaranteed to be a JSON object with a string `type` field; everything
/// else is read through tolerant accessors.
#[derive(Debug, Clone)]
pub struct Message {
    value: Value,
}

impl Message {
    /// Parse a JSON frame payload. Non-objects and objects without a string
    /// `type` field are protocol violations.
    pub fn from_payload(payload: &[u8]) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_slice(payload)?;
        let is_typed = value
            .as_object()
            .and_then(|obj| obj.get("type"))
            .map(Value::is_string)
            .unwrap_or(false);
        if !is_typed {
            return Err(FrameError::MissingType);
        }
        Ok(Self { value })
    }

    pub fn msg_type(&self) -> &str {
        // Invariant from `from_payload`: `type` exists and is a string.
        self.value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.value.get(name).and_then(Value::as_str)
    }

    /// The `error` field, blank when absent.
    pub fn error(&self) -> &str {
        self.str_field("error").unwrap_or("")
    }

    /// Whether the message carries a non-blank `error` field.
    pub fn has_error(&self) -> bool {
        !self.error().trim().is_empty()
    }

    /// Entries of a `file` listing reply, `None` when `items` is absent or
    /// not an array. Malformed entries are skipped.
    pub fn file_entries(&self) -> Option<Vec<RemoteFileEntry>> {
        let items = self.value.get("items")?.as_array()?;
        Some(
            items
                .iter()
                .filter_map(|item| {
                    let path = item.get("path")?.as_str()?.to_string();
                    let is_file = item.get("type")?.as_str()? == "file";
                    Some(RemoteFileEntry { path, is_file })
                })
                .collect(),
        )
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// Identity an agent announces in its optional `register` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub arch: String,
}

impl RegistrationInfo {
    /// Extract registration info from a message, `None` unless the message
    /// type is `register`.
    pub fn from_message(message: &Message) -> Option<Self> {
        if message.msg_type() != "register" {
            return None;
        }
        serde_json::from_value(message.value().clone()).ok()
    }
}

/// One entry of a remote directory listing.
///
/// The wire encodes directories with `type: "path"` and files with
/// `type: "file"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileEntry {
    pub path: String,
    pub is_file: bool,
}
