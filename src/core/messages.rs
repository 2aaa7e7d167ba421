//! Wire messages for the three protocols.
//!
//! gRPC messages are declared by hand with `prost` derives. HTTP request bodies and
//! WebSocket commands share [`SynthesisParams`], flattened next to their text field.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::engine::Engine;
use super::options::RequestOptions;

// =============================================================================
// gRPC (protobuf)
// =============================================================================

/// Synthesis parameters carried by a gRPC request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TtsParams {
    #[prost(string, repeated, tag = "1")]
    pub text: Vec<String>,
    #[prost(string, tag = "2")]
    pub voice: String,
    #[prost(int32, optional, tag = "3")]
    pub quality: Option<i32>,
    #[prost(int32, optional, tag = "4")]
    pub format: Option<i32>,
    #[prost(int32, optional, tag = "5")]
    pub sample_rate: Option<i32>,
    #[prost(float, optional, tag = "6")]
    pub speed: Option<f32>,
    #[prost(int32, optional, tag = "7")]
    pub seed: Option<i32>,
    #[prost(float, optional, tag = "8")]
    pub temperature: Option<f32>,
    #[prost(float, optional, tag = "9")]
    pub top_p: Option<f32>,
    #[prost(float, optional, tag = "10")]
    pub text_guidance: Option<f32>,
    #[prost(float, optional, tag = "11")]
    pub voice_guidance: Option<f32>,
    #[prost(float, optional, tag = "12")]
    pub style_guidance: Option<f32>,
    #[prost(float, optional, tag = "13")]
    pub repetition_penalty: Option<f32>,
    #[prost(bool, optional, tag = "14")]
    pub disable_stabilization: Option<bool>,
    #[prost(string, optional, tag = "15")]
    pub language: Option<String>,
    #[prost(string, optional, tag = "16")]
    pub voice_2: Option<String>,
    #[prost(string, optional, tag = "17")]
    pub turn_prefix: Option<String>,
    #[prost(string, optional, tag = "18")]
    pub turn_prefix_2: Option<String>,
    #[prost(float, optional, tag = "19")]
    pub voice_conditioning_seconds: Option<f32>,
    #[prost(int32, optional, tag = "20")]
    pub num_candidates: Option<i32>,
    #[prost(string, optional, tag = "21")]
    pub candidate_ranking_method: Option<String>,
    /// Engine-specific extension, JSON encoded.
    #[prost(string, optional, tag = "22")]
    pub other: Option<String>,
}

impl TtsParams {
    pub fn from_options(text: Vec<String>, options: &RequestOptions) -> Self {
        Self {
            text,
            voice: options.voice.clone(),
            quality: None,
            format: Some(options.format.wire_value()),
            sample_rate: Some(options.sample_rate as i32),
            speed: Some(options.speed),
            seed: options.seed,
            temperature: options.temperature,
            top_p: options.top_p,
            text_guidance: options.text_guidance,
            voice_guidance: options.voice_guidance,
            style_guidance: options.style_guidance,
            repetition_penalty: options.repetition_penalty,
            disable_stabilization: options.disable_stabilization.then_some(true),
            language: options.language.clone(),
            voice_2: options.voice_2.clone(),
            turn_prefix: options.turn_prefix.clone(),
            turn_prefix_2: options.turn_prefix_2.clone(),
            voice_conditioning_seconds: options.voice_conditioning_seconds,
            num_candidates: options.num_candidates.map(|n| n as i32),
            candidate_ranking_method: options.candidate_ranking_method.clone(),
            other: options.extension.as_ref().map(|v| v.to_string()),
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TtsRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub lease: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub params: Option<TtsParams>,
}

/// Terminal or progress status reported with a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Unspecified = 0,
    Complete = 1,
    InProgress = 2,
    Canceled = 3,
    Error = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Status {
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub code: i32,
    #[prost(string, repeated, tag = "2")]
    pub description: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TtsResponse {
    #[prost(int64, tag = "1")]
    pub sequence: i64,
    #[prost(string, tag = "2")]
    pub request_id: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub data: Bytes,
    #[prost(message, optional, tag = "4")]
    pub status: Option<Status>,
}

// =============================================================================
// HTTP / WebSocket (JSON)
// =============================================================================

/// Parameters shared by the HTTP body and WebSocket commands.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisParams {
    pub voice: String,
    pub output_format: &'static str,
    pub sample_rate: u32,
    pub speed: f32,
    pub voice_engine: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_guidance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_guidance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style_guidance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_prefix_2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_conditioning_seconds: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_candidates: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_ranking_method: Option<String>,
    /// Engine extension keys, merged into the top-level object.
    #[serde(flatten)]
    pub extension: serde_json::Map<String, serde_json::Value>,
}

impl SynthesisParams {
    pub fn from_options(options: &RequestOptions, engine: Engine) -> Self {
        let extension = match &options.extension {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        Self {
            voice: options.voice.clone(),
            output_format: options.format.as_str(),
            sample_rate: options.sample_rate,
            speed: options.speed,
            voice_engine: engine.as_str(),
            seed: options.seed,
            temperature: options.temperature,
            top_p: options.top_p,
            text_guidance: options.text_guidance,
            voice_guidance: options.voice_guidance,
            style_guidance: options.style_guidance,
            repetition_penalty: options.repetition_penalty,
            language: options.language.clone(),
            voice_2: options.voice_2.clone(),
            turn_prefix: options.turn_prefix.clone(),
            turn_prefix_2: options.turn_prefix_2.clone(),
            voice_conditioning_seconds: options.voice_conditioning_seconds,
            num_candidates: options.num_candidates,
            candidate_ranking_method: options.candidate_ranking_method.clone(),
            extension,
        }
    }
}

/// HTTP streaming request body.
#[derive(Debug, Clone, Serialize)]
pub struct HttpTtsRequest {
    pub text: Vec<String>,
    #[serde(flatten)]
    pub params: SynthesisParams,
    pub version: &'static str,
}

impl HttpTtsRequest {
    pub fn new(text: Vec<String>, params: SynthesisParams) -> Self {
        Self {
            text,
            params,
            version: "v3",
        }
    }
}

/// One text fragment sent over an open WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct WsCommand {
    pub text: String,
    pub request_id: String,
    #[serde(flatten)]
    pub params: SynthesisParams,
}

/// Control message received over the WebSocket. Audio arrives as binary frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum WsServerMessage {
    #[serde(rename = "start")]
    Start {
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(rename = "end")]
    End {
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Error body returned by the HTTP endpoint on failure.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(alias = "error_message")]
    pub message: Option<String>,
    #[serde(alias = "error_id", alias = "error_code")]
    pub code: Option<String>,
}
