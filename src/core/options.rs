//! Per-request synthesis options and their validity scopes.
//!
//! Every optional hyperparameter declares which engines and which protocols accept it.
//! [`RequestOptions::validate_for`] checks both scopes and the value ranges before any
//! network I/O happens.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::engine::Engine;
use super::protocol::Protocol;
use crate::errors::{TtsError, TtsResult};

pub const DEFAULT_SAMPLE_RATE: u32 = 24000;
pub const MIN_SPEED: f32 = 0.5;
pub const MAX_SPEED: f32 = 2.0;
pub const DEFAULT_SPEED: f32 = 1.0;
pub const MIN_TEMPERATURE: f32 = 0.0;
pub const MAX_TEMPERATURE: f32 = 2.0;
pub const MAX_NUM_CANDIDATES: u32 = 10;
pub const SUPPORTED_SAMPLE_RATES: &[u32] = &[8000, 16000, 24000, 44100, 48000];

// =============================================================================
// Audio Format
// =============================================================================

/// Output audio format. Payloads are opaque bytes in this format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Raw PCM data
    Raw,
    /// MP3
    Mp3,
    /// WAV container (default)
    #[default]
    Wav,
    /// OGG container
    Ogg,
    /// FLAC lossless
    Flac,
    /// G.711 mu-law
    Mulaw,
}

impl AudioFormat {
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
            Self::Ogg => "ogg",
            Self::Flac => "flac",
            Self::Mulaw => "mulaw",
        }
    }

    /// MIME type sent in the `Accept` header.
    #[inline]
    pub const fn content_type(&self) -> &'static str {
        match self {
            Self::Raw => "audio/pcm",
            Self::Mp3 => "audio/mpeg",
            Self::Wav => "audio/wav",
            Self::Ogg => "audio/ogg",
            Self::Flac => "audio/flac",
            Self::Mulaw => "audio/basic",
        }
    }

    /// Enum value on the gRPC wire.
    #[inline]
    pub const fn wire_value(&self) -> i32 {
        match self {
            Self::Raw => 0,
            Self::Mp3 => 1,
            Self::Wav => 2,
            Self::Ogg => 3,
            Self::Flac => 4,
            Self::Mulaw => 5,
        }
    }

    /// Index of the first chunk that carries audio samples. Container formats open
    /// with a header chunk.
    #[inline]
    pub const fn first_audio_chunk(&self) -> u64 {
        match self {
            Self::Raw | Self::Mulaw => 0,
            Self::Mp3 | Self::Wav | Self::Ogg | Self::Flac => 1,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Option scopes
// =============================================================================

/// Identifies one optional request parameter for scope checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKey {
    Seed,
    Temperature,
    TopP,
    TextGuidance,
    VoiceGuidance,
    StyleGuidance,
    RepetitionPenalty,
    DisableStabilization,
    Language,
    Voice2,
    TurnPrefix,
    TurnPrefix2,
    VoiceConditioningSeconds,
    NumCandidates,
    CandidateRankingMethod,
    Extension,
}

impl OptionKey {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Temperature => "temperature",
            Self::TopP => "top_p",
            Self::TextGuidance => "text_guidance",
            Self::VoiceGuidance => "voice_guidance",
            Self::StyleGuidance => "style_guidance",
            Self::RepetitionPenalty => "repetition_penalty",
            Self::DisableStabilization => "disable_stabilization",
            Self::Language => "language",
            Self::Voice2 => "voice_2",
            Self::TurnPrefix => "turn_prefix",
            Self::TurnPrefix2 => "turn_prefix_2",
            Self::VoiceConditioningSeconds => "voice_conditioning_seconds",
            Self::NumCandidates => "num_candidates",
            Self::CandidateRankingMethod => "candidate_ranking_method",
            Self::Extension => "other",
        }
    }

    /// Engines that accept this option.
    pub fn accepts_engine(&self, engine: Engine) -> bool {
        use Engine::*;
        match self {
            Self::Seed | Self::Temperature | Self::TopP | Self::Extension => true,
            Self::TextGuidance | Self::VoiceGuidance | Self::RepetitionPenalty => {
                matches!(engine, Play30Mini | PlayHt20 | PlayHt20Turbo)
            }
            Self::StyleGuidance => matches!(engine, Play30Mini),
            Self::DisableStabilization => matches!(engine, PlayHt20 | PlayHt20Turbo),
            Self::Language => matches!(engine, Play30Mini | PlayDialogMultilingual),
            Self::Voice2
            | Self::TurnPrefix
            | Self::TurnPrefix2
            | Self::VoiceConditioningSeconds
            | Self::NumCandidates
            | Self::CandidateRankingMethod => engine.supports_dialogue(),
        }
    }

    /// Protocols that can carry this option.
    pub fn accepts_protocol(&self, protocol: Protocol) -> bool {
        match self {
            Self::DisableStabilization => protocol == Protocol::Grpc,
            Self::NumCandidates | Self::CandidateRankingMethod => protocol != Protocol::Grpc,
            _ => true,
        }
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Request options
// =============================================================================

/// Immutable description of one synthesis request (text is supplied separately).
///
/// # Example
///
/// ```rust
/// use stream_tts_client::{AudioFormat, RequestOptions};
///
/// let options = RequestOptions::new("s3://voice-cloning-zero-shot/.../manifest.json")
///     .with_format(AudioFormat::Mp3)
///     .with_speed(1.2)
///     .with_temperature(0.7);
/// assert_eq!(options.format, AudioFormat::Mp3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Voice identifier (manifest URL or voice id)
    pub voice: String,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub speed: f32,
    pub seed: Option<i32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub text_guidance: Option<f32>,
    pub voice_guidance: Option<f32>,
    pub style_guidance: Option<f32>,
    pub repetition_penalty: Option<f32>,
    /// Only meaningful for PlayHT2.0 engines
    pub disable_stabilization: bool,
    pub language: Option<String>,
    /// Second speaker voice (dialogue engines)
    pub voice_2: Option<String>,
    pub turn_prefix: Option<String>,
    pub turn_prefix_2: Option<String>,
    pub voice_conditioning_seconds: Option<f32>,
    pub num_candidates: Option<u32>,
    pub candidate_ranking_method: Option<String>,
    /// Free-form engine extension; must be a JSON object.
    pub extension: Option<serde_json::Value>,
}

impl RequestOptions {
    pub fn new(voice: impl Into<String>) -> Self {
        Self {
            voice: voice.into(),
            format: AudioFormat::default(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            speed: DEFAULT_SPEED,
            seed: None,
            temperature: None,
            top_p: None,
            text_guidance: None,
            voice_guidance: None,
            style_guidance: None,
            repetition_penalty: None,
            disable_stabilization: false,
            language: None,
            voice_2: None,
            turn_prefix: None,
            turn_prefix_2: None,
            voice_conditioning_seconds: None,
            num_candidates: None,
            candidate_ranking_method: None,
            extension: None,
        }
    }

    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_seed(mut self, seed: i32) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Sets the second speaker for dialogue engines.
    pub fn with_dialogue(
        mut self,
        voice_2: impl Into<String>,
        turn_prefix: impl Into<String>,
        turn_prefix_2: impl Into<String>,
    ) -> Self {
        self.voice_2 = Some(voice_2.into());
        self.turn_prefix = Some(turn_prefix.into());
        self.turn_prefix_2 = Some(turn_prefix_2.into());
        self
    }

    pub fn with_extension(mut self, extension: serde_json::Value) -> Self {
        self.extension = Some(extension);
        self
    }

    /// Optional parameters that are set on this request.
    pub fn set_options(&self) -> Vec<OptionKey> {
        let flags = [
            (self.seed.is_some(), OptionKey::Seed),
            (self.temperature.is_some(), OptionKey::Temperature),
            (self.top_p.is_some(), OptionKey::TopP),
            (self.text_guidance.is_some(), OptionKey::TextGuidance),
            (self.voice_guidance.is_some(), OptionKey::VoiceGuidance),
            (self.style_guidance.is_some(), OptionKey::StyleGuidance),
            (self.repetition_penalty.is_some(), OptionKey::RepetitionPenalty),
            (self.disable_stabilization, OptionKey::DisableStabilization),
            (self.language.is_some(), OptionKey::Language),
            (self.voice_2.is_some(), OptionKey::Voice2),
            (self.turn_prefix.is_some(), OptionKey::TurnPrefix),
            (self.turn_prefix_2.is_some(), OptionKey::TurnPrefix2),
            (
                self.voice_conditioning_seconds.is_some(),
                OptionKey::VoiceConditioningSeconds,
            ),
            (self.num_candidates.is_some(), OptionKey::NumCandidates),
            (
                self.candidate_ranking_method.is_some(),
                OptionKey::CandidateRankingMethod,
            ),
            (self.extension.is_some(), OptionKey::Extension),
        ];
        flags
            .into_iter()
            .filter_map(|(set, key)| set.then_some(key))
            .collect()
    }

    /// Checks value ranges and engine/protocol scopes.
    pub fn validate_for(&self, engine: Engine, protocol: Protocol) -> TtsResult<()> {
        self.validate_values()?;

        for key in self.set_options() {
            if !key.accepts_engine(engine) {
                return Err(TtsError::Validation(format!(
                    "Option '{key}' is not supported by engine {engine}"
                )));
            }
            if !key.accepts_protocol(protocol) {
                return Err(TtsError::Validation(format!(
                    "Option '{key}' cannot be sent over the {protocol} protocol"
                )));
            }
        }
        Ok(())
    }

    fn validate_values(&self) -> TtsResult<()> {
        if self.voice.trim().is_empty() {
            return Err(TtsError::Validation("voice is required".to_string()));
        }
        if !(MIN_SPEED..=MAX_SPEED).contains(&self.speed) {
            return Err(TtsError::Validation(format!(
                "speed must be between {MIN_SPEED} and {MAX_SPEED}, got {}",
                self.speed
            )));
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(TtsError::Validation(format!(
                "sample_rate must be one of {SUPPORTED_SAMPLE_RATES:?}, got {}",
                self.sample_rate
            )));
        }
        if let Some(temp) = self.temperature
            && !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&temp)
        {
            return Err(TtsError::Validation(format!(
                "temperature must be between {MIN_TEMPERATURE} and {MAX_TEMPERATURE}, got {temp}"
            )));
        }
        if let Some(top_p) = self.top_p
            && !(0.0..=1.0).contains(&top_p)
        {
            return Err(TtsError::Validation(format!(
                "top_p must be between 0 and 1, got {top_p}"
            )));
        }
        for (name, value) in [
            ("text_guidance", self.text_guidance),
            ("voice_guidance", self.voice_guidance),
            ("style_guidance", self.style_guidance),
            ("repetition_penalty", self.repetition_penalty),
            ("voice_conditioning_seconds", self.voice_conditioning_seconds),
        ] {
            if let Some(v) = value
                && !(v.is_finite() && v >= 0.0)
            {
                return Err(TtsError::Validation(format!(
                    "{name} must be a non-negative number, got {v}"
                )));
            }
        }
        if let Some(n) = self.num_candidates
            && !(1..=MAX_NUM_CANDIDATES).contains(&n)
        {
            return Err(TtsError::Validation(format!(
                "num_candidates must be between 1 and {MAX_NUM_CANDIDATES}, got {n}"
            )));
        }
        if let Some(ext) = &self.extension
            && !ext.is_object()
        {
            return Err(TtsError::Validation(
                "extension must be a JSON object".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate_everywhere() {
        let options = RequestOptions::new("voice-1");
        for engine in Engine::all() {
            for protocol in engine.protocols() {
                assert!(options.validate_for(*engine, *protocol).is_ok());
            }
        }
    }

    #[test]
    fn test_dialogue_fields_rejected_for_mini() {
        let options = RequestOptions::new("voice-1").with_dialogue("voice-2", "S1:", "S2:");
        let err = options
            .validate_for(Engine::Play30Mini, Protocol::Http)
            .unwrap_err();
        assert!(err.to_string().contains("voice_2"));
        assert!(options
            .validate_for(Engine::PlayDialog, Protocol::Http)
            .is_ok());
    }

    #[test]
    fn test_disable_stabilization_needs_grpc_engine() {
        let mut options = RequestOptions::new("voice-1");
        options.disable_stabilization = true;
        assert!(options
            .validate_for(Engine::PlayHt20, Protocol::Grpc)
            .is_ok());
        assert!(options
            .validate_for(Engine::Play30Mini, Protocol::Grpc)
            .is_err());
    }

    #[test]
    fn test_candidates_not_over_grpc() {
        let mut options = RequestOptions::new("voice-1");
        options.num_candidates = Some(2);
        let err = options
            .validate_for(Engine::PlayDialog, Protocol::Grpc)
            .unwrap_err();
        assert!(matches!(err, TtsError::Validation(_)));
    }

    #[test]
    fn test_value_ranges() {
        let options = RequestOptions::new("v").with_speed(3.0);
        assert!(options.validate_for(Engine::Play30Mini, Protocol::Http).is_err());

        let options = RequestOptions::new("v").with_sample_rate(12345);
        assert!(options.validate_for(Engine::Play30Mini, Protocol::Http).is_err());

        let options = RequestOptions::new("v").with_top_p(1.5);
        assert!(options.validate_for(Engine::Play30Mini, Protocol::Http).is_err());

        let options = RequestOptions::new("").with_speed(1.0);
        assert!(options.validate_for(Engine::Play30Mini, Protocol::Http).is_err());

        let options = RequestOptions::new("v").with_extension(serde_json::json!([1, 2]));
        assert!(options.validate_for(Engine::Play30Mini, Protocol::Http).is_err());
    }

    #[test]
    fn test_format_wire_values() {
        assert_eq!(AudioFormat::Raw.wire_value(), 0);
        assert_eq!(AudioFormat::Mulaw.wire_value(), 5);
        assert_eq!(AudioFormat::Mp3.content_type(), "audio/mpeg");
    }
}
