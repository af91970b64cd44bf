use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::ValueEnum;
use clap_serde_derive::ClapSerde;
use serde::Deserialize;
use tracing::info;

use crate::inference::audio::AudioDecoder;
use crate::inference::task::ModelSize;

#[derive(ClapSerde, Debug)]
pub struct Config {
    /// The address the listener binds to
    #[default("0.0.0.0".to_owned())]
    #[arg(short, long, env = "TRANSCRIPTION_RUNNER_ADDRESS")]
    pub(crate) address: String,

    /// The port the listener binds to
    #[default(8000)]
    #[arg(short, long, env = "TRANSCRIPTION_RUNNER_PORT")]
    pub(crate) port: u16,

    /// Compute device used for inference
    #[default(DevicePreference::Auto)]
    #[arg(long, env = "TRANSCRIPTION_RUNNER_DEVICE", value_enum)]
    pub(crate) device: DevicePreference,

    /// How uploaded audio is decoded into samples
    #[default(AudioDecoderKind::Ffmpeg)]
    #[arg(long, env = "TRANSCRIPTION_RUNNER_AUDIO_DECODER", value_enum)]
    pub(crate) audio_decoder: AudioDecoderKind,

    /// The ffmpeg executable, either a path or a name looked up in PATH
    #[default("ffmpeg".to_owned())]
    #[arg(long, env = "TRANSCRIPTION_RUNNER_FFMPEG_PATH")]
    pub(crate) ffmpeg_path: String,

    /// Directory for uploaded files while they are transcribed, empty for the system default
    #[default(String::new())]
    #[arg(long, env = "TRANSCRIPTION_RUNNER_TEMP_DIR")]
    pub(crate) temp_dir: String,

    /// Maximum accepted request body in bytes
    #[default(25_000_000)]
    #[arg(long, env = "TRANSCRIPTION_RUNNER_MAX_UPLOAD_BYTES")]
    pub(crate) max_upload_bytes: usize,

    /// Model size to load before accepting requests, empty to load on demand
    #[default(String::new())]
    #[arg(long, env = "TRANSCRIPTION_RUNNER_PRELOAD_MODEL")]
    pub(crate) preload_model: String,

    /// OTLP collector endpoint for traces and metrics, empty to disable export
    #[default(String::new())]
    #[arg(long, env = "TRANSCRIPTION_RUNNER_OTLP_ENDPOINT")]
    pub(crate) otlp_endpoint: String,
}

#[derive(ValueEnum, Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
}

#[derive(ValueEnum, Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioDecoderKind {
    #[default]
    Ffmpeg,
    Symphonia,
}

impl Config {
    /// Values missing from the file keep their defaults
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let opt: <Config as ClapSerde>::Opt = toml::from_str(&str)?;
        Ok(Config::default().merge(opt))
    }

    pub fn otlp_endpoint(&self) -> Option<String> {
        Some(self.otlp_endpoint.clone()).filter(|endpoint| !endpoint.is_empty())
    }

    pub fn temp_dir(&self) -> PathBuf {
        if self.temp_dir.is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(&self.temp_dir)
        }
    }

    pub fn audio_decoder(&self) -> AudioDecoder {
        match self.audio_decoder {
            AudioDecoderKind::Ffmpeg => AudioDecoder::Ffmpeg {
                program: PathBuf::from(&self.ffmpeg_path),
            },
            AudioDecoderKind::Symphonia => AudioDecoder::Symphonia,
        }
    }

    pub fn preload_model(&self) -> Result<Option<ModelSize>> {
        if self.preload_model.is_empty() {
            return Ok(None);
        }
        let size = self
            .preload_model
            .parse()
            .context("Invalid preload_model")?;
        Ok(Some(size))
    }

    pub fn device(&self) -> Result<Device> {
        let device = match self.device {
            DevicePreference::Auto => Device::cuda_if_available(0)?,
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Device::new_cuda(0).context("CUDA device unavailable")?,
        };
        info!("Using {device:?} for inference");
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.port, 8000);
        assert_eq!(config.device, DevicePreference::Auto);
        assert_eq!(config.max_upload_bytes, 25_000_000);
        assert!(config.otlp_endpoint().is_none());
        assert!(config.preload_model().unwrap().is_none());
        assert_eq!(config.temp_dir(), std::env::temp_dir());
        assert!(matches!(
            config.audio_decoder(),
            AudioDecoder::Ffmpeg { program } if program == PathBuf::from("ffmpeg")
        ));
    }

    #[test]
    fn toml_overrides_only_given_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
port = 9000
audio_decoder = "symphonia"
ffmpeg_path = "/opt/ffmpeg/bin/ffmpeg"
preload_model = "tiny"
otlp_endpoint = "http://collector:4317"
"#
        )
        .unwrap();

        let config = Config::from_toml(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.audio_decoder, AudioDecoderKind::Symphonia);
        assert_eq!(config.ffmpeg_path, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.preload_model().unwrap(), Some(ModelSize::Tiny));
        assert_eq!(
            config.otlp_endpoint().as_deref(),
            Some("http://collector:4317")
        );
    }

    #[test]
    fn unknown_preload_model_is_rejected() {
        let config = Config {
            preload_model: "huge".into(),
            ..Config::default()
        };
        assert!(config.preload_model().is_err());
    }

    #[test]
    fn cpu_preference_is_honoured() {
        let config = Config {
            device: DevicePreference::Cpu,
            ..Config::default()
        };
        assert!(config.device().unwrap().is_cpu());
    }
}
