#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Wire types for hotwire's hot-module-replacement protocol.
//!
//! Every message between the dev server and a live client (browser or
//! module runner) is a [`HotPayload`], serialised as JSON and tagged by
//! its `type` field.
//!
//! ## Wire format
//! Stream transports use length-prefixed JSON:
//! - 4-byte little-endian u32 length prefix
//! - JSON payload bytes
//!
//! WebSocket transports send the bare JSON text.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};

/// Protocol version. Bump when changing message format.
pub const HMR_PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size for sanity checking (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reserved `custom` event names used by the core itself.
pub mod events {
    /// Client → server: a module called `hot.invalidate()`.
    pub const INVALIDATE: &str = "hotwire:invalidate";
    /// Runner → server: fetch a module (RPC request).
    pub const FETCH: &str = "hotwire:fetch";
    /// Server → runner: reply to [`FETCH`].
    pub const FETCH_RESULT: &str = "hotwire:fetch-result";
}

/// A message on a transport channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HotPayload {
    /// Sent once per channel after the handshake.
    Connected,
    /// Targeted hot updates.
    Update { updates: Vec<Update> },
    /// Discard all module state and restart.
    FullReload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(
            rename = "triggeredBy",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        triggered_by: Option<String>,
    },
    /// Collaborator-defined event.
    Custom {
        event: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Modules removed from the graph.
    Prune { paths: Vec<String> },
    /// Overlay-style error for a live session.
    Error { err: ErrorPayload },
}

impl HotPayload {
    /// Full reload of everything.
    #[must_use]
    pub fn full_reload() -> Self {
        Self::FullReload {
            path: Some("*".to_string()),
            triggered_by: None,
        }
    }

    /// Build a `custom` payload from any serialisable data.
    ///
    /// # Errors
    /// Returns an error if `data` cannot be represented as JSON.
    pub fn custom<T: Serialize>(event: impl Into<String>, data: &T) -> serde_json::Result<Self> {
        Ok(Self::Custom {
            event: event.into(),
            data: serde_json::to_value(data)?,
        })
    }

    /// The `type` tag, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Update { .. } => "update",
            Self::FullReload { .. } => "full-reload",
            Self::Custom { .. } => "custom",
            Self::Prune { .. } => "prune",
            Self::Error { .. } => "error",
        }
    }
}

/// Kind of a single update entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateKind {
    JsUpdate,
    CssUpdate,
}

/// One hot-update boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    /// Url of the boundary module whose callbacks run.
    pub path: String,
    /// Url of the module that is re-imported.
    pub accepted_path: String,
    pub timestamp: u64,
}

/// Error details carried by [`HotPayload::Error`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default)]
    pub stack: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<ErrorLocation>,
}

impl ErrorPayload {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
}

/// Data of the [`events::INVALIDATE`] custom event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidateMessage {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Data of the [`events::FETCH`] custom event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub id: u64,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importer: Option<String>,
}

/// Data of the [`events::FETCH_RESULT`] custom event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<FetchResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the server hands a module runner for one import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FetchResult {
    /// Transformed code to evaluate in the runner.
    #[serde(rename_all = "camelCase")]
    Inlined {
        /// Resolved identity (including query).
        id: String,
        /// Public url, without timestamp query.
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        code: String,
        /// Source map JSON, if the transformer produced one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        map: Option<String>,
        /// Specifier as written → url to import, with `?t=` when the
        /// dependency was hot-updated.
        #[serde(default)]
        imports: BTreeMap<String, String>,
    },
    /// Left to the runner's host (e.g. a bare package).
    External { specifier: String },
}

/// Encode a payload to bytes with length prefix.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn encode_frame<T: Serialize>(frame: &T) -> io::Result<Vec<u8>> {
    let json =
        serde_json::to_vec(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let len = u32::try_from(json.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;

    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Decode a frame from bytes (without length prefix).
///
/// # Errors
/// Returns an error if deserialization fails.
pub fn decode_frame<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> io::Result<T> {
    serde_json::from_slice(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Validate a decoded length prefix.
///
/// # Errors
/// Returns `InvalidData` if the frame exceeds [`MAX_FRAME_SIZE`].
pub fn check_frame_len(len: u32) -> io::Result<usize> {
    let len = len as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }
    Ok(len)
}

/// Write a length-prefixed frame to a writer.
///
/// # Errors
/// Returns an error if encoding or writing fails.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> io::Result<()> {
    let encoded = encode_frame(frame)?;
    writer.write_all(&encoded)?;
    writer.flush()
}

/// Read a length-prefixed frame from a reader.
///
/// # Errors
/// Returns an error if reading or decoding fails.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> io::Result<T> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = check_frame_len(u32::from_le_bytes(len_buf))?;

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;

    decode_frame(&buf)
}
