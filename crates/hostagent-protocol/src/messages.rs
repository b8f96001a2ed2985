//! Request and response frames.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::expose::Expose;
use crate::volume::VolumePath;

/// Request sent from a client to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Start a host binary under supervision.
    Start(StartRequest),

    /// Stream the output of a started process until it exits.
    Wait(WaitRequest),

    /// Keep-alive ping. The first one switches the connection into
    /// keep-alive mode; later ones refresh the idle timer.
    KeepAlive(KeepAliveRequest),

    /// Clean end of a keep-alive stream. The agent kills the process and
    /// answers with `KeepAliveAck`.
    KeepAliveClose,

    /// Kill a managed process and release its firewall rules.
    Kill(KillRequest),

    /// Link paths mounted into a container onto host paths.
    Mount(MountRequest),

    /// Agent and host version.
    Version,

    /// Health check.
    Ping,
}

impl AgentRequest {
    /// Short method name used in request logs.
    pub fn method(&self) -> &'static str {
        match self {
            AgentRequest::Start(_) => "start",
            AgentRequest::Wait(_) => "wait",
            AgentRequest::KeepAlive(_) => "keep_alive",
            AgentRequest::KeepAliveClose => "keep_alive_close",
            AgentRequest::Kill(_) => "kill",
            AgentRequest::Mount(_) => "mount",
            AgentRequest::Version => "version",
            AgentRequest::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    /// Absolute path of the binary on the host.
    pub path: String,
    /// Lowercase hex SHA-1 of the binary.
    pub checksum: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// `KEY=VALUE` entries merged over the host environment.
    #[serde(default)]
    pub envs: Vec<String>,
    /// Working directory. Blank means the binary's parent directory.
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub exposes: Vec<Expose>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitRequest {
    pub process_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub process_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillRequest {
    pub process_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountRequest {
    /// `KEY=VALUE` labels identifying exactly one running container.
    pub selectors: Vec<String>,
    #[serde(default)]
    pub paths: Vec<VolumePath>,
}

/// Response sent from the agent to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentResponse {
    Started(StartedResponse),

    /// Chunk of the process's standard output.
    Stdout(OutputChunk),

    /// Chunk of the process's standard error.
    Stderr(OutputChunk),

    /// Terminal frame of a wait stream.
    Exited(ExitedResponse),

    KeepAliveAck,

    Killed(KilledResponse),

    Mounted(MountedResponse),

    Version(VersionResponse),

    Pong,

    Error(ErrorResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedResponse {
    pub process_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountedResponse {
    /// Host paths that were linked. Unmapped or missing sources are skipped.
    pub destinations: Vec<String>,
}

/// Raw output bytes, base64 encoded so binary output survives JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub data_base64: String,
}

impl OutputChunk {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            data_base64: STANDARD.encode(data),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data_base64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitedResponse {
    /// Exit code, absent when the process was terminated by a signal or its
    /// status could not be read.
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KilledResponse {
    pub process_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub agent_version: String,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Binary or process does not exist.
    NotFound,
    /// Binary checksum does not match the requested one.
    IntegrityMismatch,
    /// A managed process with the same name is alive.
    AlreadyRunning,
    /// Malformed or disallowed request.
    InvalidArgument,
    /// Host-side failure (spawn, shell, I/O, deadline).
    Internal,
    /// A handler panicked.
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::IntegrityMismatch => "integrity_mismatch",
            ErrorCode::AlreadyRunning => "already_running",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::Internal => "internal",
            ErrorCode::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AgentResponse {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        AgentResponse::Error(ErrorResponse {
            code,
            message: message.into(),
        })
    }

    /// Whether this frame ends a wait stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentResponse::Exited(_) | AgentResponse::Error(_))
    }
}
