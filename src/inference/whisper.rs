use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Device};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use tracing::info;

use crate::inference::audio_pipeline::AudioGeneratorPipeline;
use crate::inference::cache::ModelLoader;
use crate::inference::task::{ModelSize, SpeechModel, TranscribeOptions, Transcript};

#[derive(Clone)]
pub struct WhisperModel {
    generator_pipeline: AudioGeneratorPipeline,
}

impl WhisperModel {
    #[tracing::instrument(level = "info", skip(api, device))]
    pub fn new(api: &Api, size: ModelSize, device: &Device, half_precision: bool) -> Result<Self> {
        let repo = api.repo(Repo::with_revision(
            size.repo_id().into(),
            RepoType::Model,
            "main".into(),
        ));
        let config_path = repo.get("config.json")?;
        let tokenizer_path = repo.get("tokenizer.json")?;
        let weights_path = repo.get("model.safetensors")?;

        let dtype = if half_precision { DType::F16 } else { DType::F32 };
        let generator_pipeline = AudioGeneratorPipeline::with_safetensors_model(
            &config_path,
            &tokenizer_path,
            &weights_path,
            device,
            dtype,
        )?;
        info!("Loaded whisper {size} as {dtype:?}");

        Ok(Self { generator_pipeline })
    }
}

impl SpeechModel for WhisperModel {
    #[tracing::instrument(level = "info", skip(self, options), fields(language = %options.language, task = %options.task))]
    fn transcribe(&self, audio_path: &Path, options: &TranscribeOptions) -> Result<Transcript> {
        // Each request decodes with its own kv cache and sampler state
        self.generator_pipeline
            .clone()
            .transcribe(audio_path, options)
    }
}

/// Fetches checkpoints from the Hugging Face hub, reusing its local cache.
pub struct WhisperLoader {
    api: Api,
}

impl WhisperLoader {
    pub fn new(api: Api) -> Self {
        Self { api }
    }
}

impl ModelLoader for WhisperLoader {
    fn load(
        &self,
        size: ModelSize,
        device: &Device,
        half_precision: bool,
    ) -> Result<Arc<dyn SpeechModel>> {
        Ok(Arc::new(WhisperModel::new(
            &self.api,
            size,
            device,
            half_precision,
        )?))
    }
}
