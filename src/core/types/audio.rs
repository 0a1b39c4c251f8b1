//! Text-to-speech request shape

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub model: String,
    pub input: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default)]
    pub response_format: String,
    #[serde(default)]
    pub speed: f64,
    /// `"sse"` requests base64 audio frames over SSE instead of raw bytes
    #[serde(default)]
    pub stream_format: String,
}
