//! API message types.
//!
//! Requests arrive as one JSON object per frame, tagged by `op`. Every request
//! carries the caller-asserted `user_id`; all but `create` and `list-for-user`
//! also name a `session_id`.

use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle state of a session. `Terminated` and `Error` are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initializing,
    Active,
    Terminated,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Initializing => "initializing",
            SessionState::Active => "active",
            SessionState::Terminated => "terminated",
            SessionState::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session's working directory is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceType {
    /// Fresh directory per session, removed on cleanup.
    #[default]
    Isolated,
    /// Stable per-user directory reused across sessions.
    Persistent,
}

/// Credential material handed to the agent process as environment variables.
///
/// `Debug` never prints values.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub HashMap<String, String>);

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.0.keys().collect();
        keys.sort();
        f.debug_struct("Credentials")
            .field("keys", &keys)
            .field("values", &"<redacted>")
            .finish()
    }
}

/// One timestamped fragment of captured process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub data: String,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub status: SessionState,
    pub workspace_path: String,
    pub workspace_type: WorkspaceType,
    pub created_ms: u64,
    pub last_activity_ms: u64,
    pub output_buffer_len: usize,
}

/// An inbound API request.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Caller-chosen correlation id, echoed in the response.
    #[serde(default)]
    pub id: u64,
    #[serde(flatten)]
    pub op: Operation,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Operation {
    Create {
        user_id: String,
        #[serde(default)]
        credentials: Credentials,
        #[serde(default)]
        workspace_type: Option<WorkspaceType>,
    },
    SendCommand {
        user_id: String,
        session_id: String,
        command: String,
    },
    GetOutput {
        user_id: String,
        session_id: String,
        #[serde(default)]
        clear: bool,
    },
    GetStatus {
        user_id: String,
        session_id: String,
    },
    Resize {
        user_id: String,
        session_id: String,
        cols: u16,
        rows: u16,
    },
    Terminate {
        user_id: String,
        session_id: String,
    },
    ListForUser {
        user_id: String,
    },
}

impl Operation {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::SendCommand { .. } => "send-command",
            Operation::GetOutput { .. } => "get-output",
            Operation::GetStatus { .. } => "get-status",
            Operation::Resize { .. } => "resize",
            Operation::Terminate { .. } => "terminate",
            Operation::ListForUser { .. } => "list-for-user",
        }
    }
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// An outbound API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success<T: Serialize>(id: u64, result: &T) -> HubResult<Self> {
        let value = serde_json::to_value(result)
            .map_err(|e| HubError::Internal(format!("failed to encode response: {e}")))?;
        Ok(Self {
            id,
            ok: true,
            result: Some(value),
            error: None,
        })
    }

    pub fn failure(id: u64, err: &HubError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// Decode a request from a JSON text frame.
pub fn decode_request(text: &str) -> HubResult<Request> {
    Ok(serde_json::from_str(text)?)
}
