//! Error taxonomy for the synthesis client.
//!
//! Every failure the caller can observe is one of these variants. The orchestrator
//! uses [`TtsError::is_retryable`] and [`TtsError::marks_channel_unhealthy`] to decide
//! whether to retry an exchange and how to hand the channel back to the pool.

use thiserror::Error;

/// Errors raised by the synthesis client.
///
/// The type is `Clone` so a single lease refresh result can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TtsError {
    /// Option, engine, or protocol mismatch. Raised before any network I/O.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The lease was rejected, expired, or could not be refreshed.
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Connection reset, refused, or timed out.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Out-of-order, duplicate, or missing chunk sequence numbers.
    #[error("Protocol integrity error: {0}")]
    ProtocolIntegrity(String),

    /// Terminal error status reported by the service.
    #[error("Server error: {}", .messages.join("; "))]
    Server {
        /// Status code reported by the transport, when one exists (HTTP or gRPC code).
        code: Option<i32>,
        /// Human readable messages exactly as the service supplied them.
        messages: Vec<String>,
    },

    /// Invalid client configuration (environment, YAML file, missing endpoint).
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for client operations.
pub type TtsResult<T> = Result<T, TtsError>;

impl TtsError {
    /// Builds a server error from a single message.
    pub fn server(code: Option<i32>, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            messages: vec![message.into()],
        }
    }

    /// Builds a transport error describing an elapsed timeout.
    pub fn timeout(operation: &str, after: std::time::Duration) -> Self {
        Self::Transport(format!(
            "{operation} timed out after {}ms",
            after.as_millis()
        ))
    }

    /// Whether the orchestrator may retry the whole exchange after this error.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Authorization(_) | Self::Transport(_))
    }

    /// Whether a channel that produced this error must be discarded rather than reused.
    ///
    /// Authorization failures leave the channel healthy: lease validity and channel
    /// health are tracked independently.
    #[inline]
    pub fn marks_channel_unhealthy(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ProtocolIntegrity(_))
    }

    /// Short machine-friendly name of the error class, used for telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Authorization(_) => "authorization",
            Self::Transport(_) => "transport",
            Self::ProtocolIntegrity(_) => "protocol-integrity",
            Self::Server { .. } => "server",
            Self::Configuration(_) => "configuration",
        }
    }
}

impl From<reqwest::Error> for TtsError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return match status.as_u16() {
                401 | 403 => Self::Authorization(err.to_string()),
                429 | 502 | 503 | 504 => Self::Transport(err.to_string()),
                code => Self::server(Some(code as i32), err.to_string()),
            };
        }
        if err.is_builder() {
            return Self::Configuration(err.to_string());
        }
        Self::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TtsError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::Http(response) => match response.status().as_u16() {
                401 | 403 => Self::Authorization(format!(
                    "WebSocket handshake rejected with status {}",
                    response.status()
                )),
                code @ (429 | 502 | 503 | 504) => {
                    Self::Transport(format!("WebSocket handshake failed with status {code}"))
                }
                code => Self::server(
                    Some(code as i32),
                    format!("WebSocket handshake failed with status {code}"),
                ),
            },
            WsError::Url(e) => Self::Configuration(format!("Invalid WebSocket URL: {e}")),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<tonic::Status> for TtsError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;

        let message = status.message().to_string();
        match status.code() {
            Code::Unauthenticated | Code::PermissionDenied => Self::Authorization(message),
            Code::Unavailable
            | Code::ResourceExhausted
            | Code::DeadlineExceeded
            | Code::Aborted => Self::Transport(format!("{:?}: {message}", status.code())),
            code => Self::server(Some(code as i32), message),
        }
    }
}

impl From<serde_json::Error> for TtsError {
    fn from(err: serde_json::Error) -> Self {
        Self::ProtocolIntegrity(format!("Malformed JSON message: {err}"))
    }
}

impl From<serde_yaml::Error> for TtsError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration(format!("Invalid YAML configuration: {err}"))
    }
}

impl From<std::io::Error> for TtsError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
