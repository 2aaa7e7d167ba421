//! Synthesis engines and the engine/protocol support matrix.
//!
//! Engine names may carry a protocol suffix (`Play3.0-mini-ws`, `PlayDialog-http`) which
//! selects the wire protocol unless the caller names one explicitly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::protocol::Protocol;
use crate::errors::{TtsError, TtsResult};

/// Remote synthesis engine (voice model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Engine {
    /// Play 3.0 mini - fast, multilingual (default)
    #[default]
    #[serde(rename = "Play3.0-mini")]
    Play30Mini,
    /// PlayDialog - expressive, two-speaker dialogue
    #[serde(rename = "PlayDialog")]
    PlayDialog,
    /// PlayDialog Multilingual
    #[serde(rename = "PlayDialogMultilingual")]
    PlayDialogMultilingual,
    /// PlayDialog Arabic
    #[serde(rename = "PlayDialogArabic")]
    PlayDialogArabic,
    /// PlayHT 2.0 Turbo - legacy English-only model
    #[serde(rename = "PlayHT2.0-turbo")]
    PlayHt20Turbo,
    /// PlayHT 2.0
    #[serde(rename = "PlayHT2.0")]
    PlayHt20,
}

impl Engine {
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Play30Mini => "Play3.0-mini",
            Self::PlayDialog => "PlayDialog",
            Self::PlayDialogMultilingual => "PlayDialogMultilingual",
            Self::PlayDialogArabic => "PlayDialogArabic",
            Self::PlayHt20Turbo => "PlayHT2.0-turbo",
            Self::PlayHt20 => "PlayHT2.0",
        }
    }

    /// Protocols this engine accepts.
    pub const fn protocols(&self) -> &'static [Protocol] {
        match self {
            Self::PlayHt20Turbo | Self::PlayHt20 => &[Protocol::Grpc],
            Self::Play30Mini => &[Protocol::Http, Protocol::WebSocket, Protocol::Grpc],
            Self::PlayDialog | Self::PlayDialogMultilingual | Self::PlayDialogArabic => {
                &[Protocol::Http, Protocol::WebSocket]
            }
        }
    }

    /// Protocol used when neither the caller nor the engine name picks one.
    pub const fn default_protocol(&self) -> Protocol {
        match self {
            Self::PlayHt20Turbo | Self::PlayHt20 => Protocol::Grpc,
            _ => Protocol::Http,
        }
    }

    #[inline]
    pub fn supports(&self, protocol: Protocol) -> bool {
        self.protocols().contains(&protocol)
    }

    #[inline]
    pub const fn supports_dialogue(&self) -> bool {
        matches!(
            self,
            Self::PlayDialog | Self::PlayDialogMultilingual | Self::PlayDialogArabic
        )
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::Play30Mini,
            Self::PlayDialog,
            Self::PlayDialogMultilingual,
            Self::PlayDialogArabic,
            Self::PlayHt20Turbo,
            Self::PlayHt20,
        ]
    }

    fn from_exact(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|e| e.as_str() == name)
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An engine name resolved into an engine and an optional protocol suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSelection {
    pub engine: Engine,
    pub protocol: Option<Protocol>,
}

impl EngineSelection {
    /// Parses an engine name such as `Play3.0-mini`, `Play3.0-mini-ws` or `PlayHT2.0-turbo`.
    ///
    /// Deprecated names `Play3.0`, `Play3.0-http` and `Play3.0-ws` map to `Play3.0-mini`.
    pub fn parse(name: &str) -> TtsResult<Self> {
        let name = name.trim();
        match name {
            "Play3.0" => {
                warn!("Voice engine Play3.0 is deprecated; use Play3.0-mini-http or Play3.0-mini-ws");
                return Ok(Self {
                    engine: Engine::Play30Mini,
                    protocol: Some(Protocol::Http),
                });
            }
            "Play3.0-http" => {
                warn!("Voice engine Play3.0-http is deprecated; use Play3.0-mini-http");
                return Ok(Self {
                    engine: Engine::Play30Mini,
                    protocol: Some(Protocol::Http),
                });
            }
            "Play3.0-ws" => {
                warn!("Voice engine Play3.0-ws is deprecated; use Play3.0-mini-ws");
                return Ok(Self {
                    engine: Engine::Play30Mini,
                    protocol: Some(Protocol::WebSocket),
                });
            }
            _ => {}
        }

        if let Some(engine) = Engine::from_exact(name) {
            return Ok(Self {
                engine,
                protocol: None,
            });
        }

        if let Some((base, suffix)) = name.rsplit_once('-')
            && let Some(engine) = Engine::from_exact(base)
            && let Some(protocol) = parse_suffix(suffix)
        {
            return Ok(Self {
                engine,
                protocol: Some(protocol),
            });
        }

        Err(TtsError::Validation(format!("Unknown voice engine '{name}'")))
    }

    /// Picks the protocol for a request: explicit argument, then name suffix, then engine default.
    pub fn resolve(&self, explicit: Option<Protocol>) -> TtsResult<Protocol> {
        let protocol = explicit
            .or(self.protocol)
            .unwrap_or_else(|| self.engine.default_protocol());
        if !self.engine.supports(protocol) {
            return Err(TtsError::Validation(format!(
                "Engine {} does not support the {} protocol (supported: {})",
                self.engine,
                protocol,
                self.engine
                    .protocols()
                    .iter()
                    .map(Protocol::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        Ok(protocol)
    }
}

impl FromStr for EngineSelection {
    type Err = TtsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Engine> for EngineSelection {
    fn from(engine: Engine) -> Self {
        Self {
            engine,
            protocol: None,
        }
    }
}

fn parse_suffix(suffix: &str) -> Option<Protocol> {
    match suffix {
        "http" => Some(Protocol::Http),
        "ws" => Some(Protocol::WebSocket),
        "grpc" => Some(Protocol::Grpc),
        _ => None,
    }
}
