//! Wire protocol identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::TtsError;

/// Wire protocol used to talk to the synthesis service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Server-streaming RPC over a shared HTTP/2 channel.
    Grpc,
    /// One chunked HTTP response per request.
    Http,
    /// Full-duplex socket, one connection per concurrent session.
    #[serde(rename = "ws")]
    WebSocket,
}

impl Protocol {
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Grpc => "grpc",
            Self::Http => "http",
            Self::WebSocket => "ws",
        }
    }

    /// Whether one channel may carry many concurrent sessions.
    #[inline]
    pub const fn supports_multiplexing(&self) -> bool {
        matches!(self, Self::Grpc)
    }

    /// Whether follow-up text can be sent after the first request on the same session.
    #[inline]
    pub const fn supports_incremental_input(&self) -> bool {
        matches!(self, Self::WebSocket)
    }

    pub const fn all() -> &'static [Self] {
        &[Self::Grpc, Self::Http, Self::WebSocket]
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = TtsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "grpc" => Ok(Self::Grpc),
            "http" | "https" => Ok(Self::Http),
            "ws" | "wss" | "websocket" => Ok(Self::WebSocket),
            other => Err(TtsError::Validation(format!("Unknown protocol '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_grpc_multiplexes() {
        assert!(Protocol::Grpc.supports_multiplexing());
        assert!(!Protocol::Http.supports_multiplexing());
        assert!(!Protocol::WebSocket.supports_multiplexing());
    }

    #[test]
    fn test_parse() {
        assert_eq!("GRPC".parse::<Protocol>().unwrap(), Protocol::Grpc);
        assert_eq!("websocket".parse::<Protocol>().unwrap(), Protocol::WebSocket);
        assert!("carrier-pigeon".parse::<Protocol>().is_err());
    }
}
