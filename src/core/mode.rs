//! Relay request modes
//!
//! The kind of request being relayed. A closed enum: every new mode
//! requires every adaptor to opt in via `Adaptor::supports`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Unknown,
    ChatCompletions,
    Completions,
    Embeddings,
    ImagesGenerations,
    Rerank,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    VideoGenerationsGetJobs,
    VideoGenerationsContent,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Unknown => "unknown",
            Mode::ChatCompletions => "chat_completions",
            Mode::Completions => "completions",
            Mode::Embeddings => "embeddings",
            Mode::ImagesGenerations => "images_generations",
            Mode::Rerank => "rerank",
            Mode::AudioSpeech => "audio_speech",
            Mode::AudioTranscription => "audio_transcription",
            Mode::AudioTranslation => "audio_translation",
            Mode::VideoGenerationsGetJobs => "video_generations_get_jobs",
            Mode::VideoGenerationsContent => "video_generations_content",
        }
    }

    /// Modes that may hold the upstream connection open for a long time
    /// get the longer per-attempt timeout.
    pub fn is_streaming_capable(&self) -> bool {
        matches!(
            self,
            Mode::ChatCompletions | Mode::Completions | Mode::AudioSpeech
        )
    }

    /// Video job follow-ups must go to the channel that created the job;
    /// they bypass the selector entirely.
    pub fn requires_channel_binding(&self) -> bool {
        matches!(
            self,
            Mode::VideoGenerationsGetJobs | Mode::VideoGenerationsContent
        )
    }

    /// Wire form used in stored rows and test records.
    pub fn as_i32(&self) -> i32 {
        match self {
            Mode::Unknown => 0,
            Mode::ChatCompletions => 1,
            Mode::Completions => 2,
            Mode::Embeddings => 3,
            Mode::ImagesGenerations => 4,
            Mode::Rerank => 5,
            Mode::AudioSpeech => 6,
            Mode::AudioTranscription => 7,
            Mode::AudioTranslation => 8,
            Mode::VideoGenerationsGetJobs => 9,
            Mode::VideoGenerationsContent => 10,
        }
    }

    pub fn from_i32(v: i32) -> Mode {
        match v {
            1 => Mode::ChatCompletions,
            2 => Mode::Completions,
            3 => Mode::Embeddings,
            4 => Mode::ImagesGenerations,
            5 => Mode::Rerank,
            6 => Mode::AudioSpeech,
            7 => Mode::AudioTranscription,
            8 => Mode::AudioTranslation,
            9 => Mode::VideoGenerationsGetJobs,
            10 => Mode::VideoGenerationsContent,
            _ => Mode::Unknown,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        for v in 0..=11 {
            let mode = Mode::from_i32(v);
            if mode != Mode::Unknown {
                assert_eq!(mode.as_i32(), v);
            }
        }
    }
}
