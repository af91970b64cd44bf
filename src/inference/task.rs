use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Error, Result};

use crate::inference::audio::AudioDecoder;

/// Whisper checkpoint sizes that can be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    pub const ALL: [ModelSize; 5] = [
        ModelSize::Tiny,
        ModelSize::Base,
        ModelSize::Small,
        ModelSize::Medium,
        ModelSize::Large,
    ];

    /// The Hugging Face repository holding the safetensors checkpoint
    pub fn repo_id(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v3",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        }
    }
}

impl Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ModelSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match ModelSize::ALL.iter().find(|size| size.as_str() == s) {
            Some(size) => Ok(*size),
            None => bail!("Invalid model size: {s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Transcribe,
    Translate,
}

impl Task {
    pub const ALL: [Task; 2] = [Task::Transcribe, Task::Translate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Transcribe => "transcribe",
            Task::Translate => "translate",
        }
    }
}

impl Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Task {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match Task::ALL.iter().find(|task| task.as_str() == s) {
            Some(task) => Ok(*task),
            None => bail!("Invalid task: {s}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    /// ISO 639-1 language code of the spoken audio, e.g. `en`
    pub language: String,
    pub task: Task,
    /// Whether the loaded weights are expected to run in f16
    pub half_precision: bool,
    /// How the uploaded file is turned into 16 kHz mono samples
    pub decoder: AudioDecoder,
}

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    /// Full text of all segments, `None` when the model produced nothing usable
    pub text: Option<String>,
    pub language: String,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
pub struct Segment {
    /// Offset into the audio in seconds
    pub start: f64,
    pub duration: f64,
    pub text: String,
    /// Sampling temperature the segment was finally decoded at
    pub temperature: f64,
}

/// A loaded speech model that can turn an audio file into text.
pub trait SpeechModel: Send + Sync {
    fn transcribe(&self, audio_path: &Path, options: &TranscribeOptions) -> Result<Transcript>;
}
