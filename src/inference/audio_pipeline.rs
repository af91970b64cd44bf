#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

use std::path::Path;

use anyhow::{anyhow, bail, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::VarBuilder;
use candle_transformers::models::whisper;
use candle_transformers::models::whisper::model::Whisper;
use candle_transformers::models::whisper::{
    audio, Config, COMPRESSION_RATIO_THRESHOLD, EOT_TOKEN, HOP_LENGTH, LOGPROB_THRESHOLD,
    NO_SPEECH_THRESHOLD, NO_SPEECH_TOKENS, NO_TIMESTAMPS_TOKEN, N_FFT, SOT_TOKEN, TEMPERATURES,
    TRANSCRIBE_TOKEN, TRANSLATE_TOKEN,
};
use rand::distributions::Distribution;
use rand::SeedableRng;
use tokenizers::Tokenizer;
use tracing::{debug, error, warn};

use crate::inference::audio::{mel_filters, SAMPLE_RATE};
use crate::inference::task::{Segment, Task, TranscribeOptions, Transcript};

// Decoding loop after https://github.com/huggingface/candle/blob/main/candle-examples/examples/whisper/main.rs
#[derive(Clone)]
pub struct AudioGeneratorPipeline {
    model: Whisper,
    tokenizer: Tokenizer,
    config: Config,
    device: Device,
    dtype: DType,
    mel_filters: Vec<f32>,
    suppress_tokens: Tensor,
    sot_token: u32,
    transcribe_token: u32,
    translate_token: u32,
    eot_token: u32,
    no_speech_token: u32,
    no_timestamps_token: u32,
    seed: rand::rngs::StdRng,
}

impl AudioGeneratorPipeline {
    pub fn with_safetensors_model(
        config_path: &Path,
        tokenizer_path: &Path,
        weights_path: &Path,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let config: Config = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(anyhow::Error::msg)?;

        // SAFETY: the weights file lives in the hub cache and is not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)? };
        let model = Whisper::load(&vb, config.clone())?;

        let mel_filters = mel_filters(SAMPLE_RATE, N_FFT, config.num_mel_bins);

        let no_timestamps_token = token_id(&tokenizer, NO_TIMESTAMPS_TOKEN)?;
        let suppress_tokens: Vec<f32> = (0..model.config.vocab_size as u32)
            .map(|i| {
                if model.config.suppress_tokens.contains(&i) {
                    f32::NEG_INFINITY
                } else {
                    0f32
                }
            })
            .collect();
        let suppress_tokens = Tensor::new(suppress_tokens.as_slice(), device)?;
        let sot_token = token_id(&tokenizer, SOT_TOKEN)?;
        let transcribe_token = token_id(&tokenizer, TRANSCRIBE_TOKEN)?;
        let translate_token = token_id(&tokenizer, TRANSLATE_TOKEN)?;
        let eot_token = token_id(&tokenizer, EOT_TOKEN)?;
        let Some(no_speech_token) = NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| token_id(&tokenizer, token).ok())
        else {
            bail!("Unable to find any non-speech token")
        };

        Ok(Self {
            model,
            tokenizer,
            config,
            device: device.clone(),
            dtype,
            mel_filters,
            suppress_tokens,
            sot_token,
            transcribe_token,
            translate_token,
            eot_token,
            no_speech_token,
            no_timestamps_token,
            seed: rand::rngs::StdRng::seed_from_u64(299_792_458),
        })
    }

    pub fn transcribe(
        &mut self,
        audio_path: &Path,
        options: &TranscribeOptions,
    ) -> Result<Transcript> {
        if options.half_precision != (self.dtype == DType::F16) {
            warn!(
                "Requested half precision {} but weights are {:?}, using {:?}",
                options.half_precision, self.dtype, self.dtype
            );
        }

        let pcm = options.decoder.decode(audio_path)?;
        if pcm.is_empty() {
            bail!("Audio file contains no samples")
        }
        let mel = self.load_mel(&pcm)?;
        let (_, _, content_frames) = mel.dims3()?;

        let Ok(language_token) = token_id(&self.tokenizer, &format!("<|{}|>", options.language))
        else {
            bail!("language {} is not supported", options.language)
        };
        let task_token = match options.task {
            Task::Transcribe => self.transcribe_token,
            Task::Translate => self.translate_token,
        };

        let mut seek = 0;
        let mut segments = vec![];
        while seek < content_frames {
            let time_offset = (seek * HOP_LENGTH) as f64 / f64::from(SAMPLE_RATE);
            let segment_size = usize::min(content_frames - seek, whisper::N_FRAMES);
            let mel_segment = mel.narrow(2, seek, segment_size)?;
            let segment_duration = (segment_size * HOP_LENGTH) as f64 / f64::from(SAMPLE_RATE);
            let dr = self.decode_with_fallback(&mel_segment, language_token, task_token)?;
            seek += segment_size;
            if dr.no_speech_prob > NO_SPEECH_THRESHOLD && dr.avg_logprob < LOGPROB_THRESHOLD {
                debug!("no speech detected, skipping {seek} {dr:?}");
                continue;
            }
            segments.push(Segment {
                start: time_offset,
                duration: segment_duration,
                text: dr.text,
                temperature: dr.temperature,
            });
        }

        let text = segments.iter().map(|s| s.text.as_str()).collect::<String>();
        Ok(Transcript {
            text: Some(text),
            language: options.language.clone(),
            segments,
        })
    }

    fn decode_with_fallback(
        &mut self,
        segment: &Tensor,
        language_token: u32,
        task_token: u32,
    ) -> Result<DecodingResult> {
        for (i, &t) in TEMPERATURES.iter().enumerate() {
            let dr = self.decode(segment, t, language_token, task_token);
            if i == TEMPERATURES.len() - 1 {
                return dr;
            }
            // On errors, we try again with a different temperature.
            match dr {
                Ok(dr) => {
                    let needs_fallback = dr.compression_ratio > COMPRESSION_RATIO_THRESHOLD
                        || dr.avg_logprob < LOGPROB_THRESHOLD;
                    if !needs_fallback || dr.no_speech_prob > NO_SPEECH_THRESHOLD {
                        return Ok(dr);
                    }
                }
                Err(err) => {
                    error!("Error running at {t}: {err}");
                }
            }
        }
        unreachable!()
    }

    fn decode(
        &mut self,
        mel: &Tensor,
        t: f64,
        language_token: u32,
        task_token: u32,
    ) -> Result<DecodingResult> {
        let model = &mut self.model;
        let audio_features = model.encoder.forward(mel, true)?;
        debug!("audio features: {:?}", audio_features.dims());

        let sample_len = model.config.max_target_positions / 2;
        let mut sum_logprob = 0f64;
        let mut no_speech_prob = f64::NAN;
        let mut tokens = vec![
            self.sot_token,
            language_token,
            task_token,
            self.no_timestamps_token,
        ];

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), mel.device())?;

            // The model expects a batch dim but this inference loop does not handle
            // it so we add it at this point.
            let tokens_t = tokens_t.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, &audio_features, i == 0)?;

            // Extract the no speech probability on the first iteration by looking at the first
            // token logits and the probability for the according token.
            if i == 0 {
                let logits = model
                    .decoder
                    .final_linear(&ys.i(..1)?)?
                    .i(0)?
                    .i(0)?
                    .to_dtype(DType::F32)?;
                no_speech_prob = f64::from(
                    softmax(&logits, 0)?
                        .i(self.no_speech_token as usize)?
                        .to_scalar::<f32>()?,
                );
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .to_dtype(DType::F32)?;
            let logits = logits.broadcast_add(&self.suppress_tokens)?;
            let next_token = if t > 0f64 {
                let prs = softmax(&(&logits / t)?, 0)?;
                let logits_v: Vec<f32> = prs.to_vec1()?;
                let distr = rand::distributions::WeightedIndex::new(&logits_v)?;
                u32::try_from(distr.sample(&mut self.seed))?
            } else {
                let logits_v: Vec<f32> = logits.to_vec1()?;
                logits_v
                    .iter()
                    .enumerate()
                    .max_by(|(_, u), (_, v)| u.total_cmp(v))
                    .map(|(i, _)| i as u32)
                    .ok_or_else(|| anyhow!("Model produced empty logits"))?
            };
            tokens.push(next_token);
            let prob = f64::from(
                softmax(&logits, D::Minus1)?
                    .i(next_token as usize)?
                    .to_scalar::<f32>()?,
            );
            if next_token == self.eot_token || tokens.len() > model.config.max_target_positions {
                break;
            }
            sum_logprob += prob.ln();
        }
        let text = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(anyhow::Error::msg)?;
        let avg_logprob = sum_logprob / tokens.len() as f64;

        Ok(DecodingResult {
            text,
            avg_logprob,
            no_speech_prob,
            temperature: t,
            compression_ratio: f64::NAN,
        })
    }

    fn load_mel(&self, pcm: &[f32]) -> Result<Tensor> {
        let mel = audio::pcm_to_mel(&self.config, pcm, &self.mel_filters);
        let mel_len = mel.len();
        let mel = Tensor::from_vec(
            mel,
            (
                1,
                self.config.num_mel_bins,
                mel_len / self.config.num_mel_bins,
            ),
            &self.device,
        )?
        .to_dtype(self.dtype)?;
        debug!("loaded mel: {:?}", mel.dims());
        Ok(mel)
    }
}

#[derive(Debug, Clone)]
struct DecodingResult {
    text: String,
    avg_logprob: f64,
    no_speech_prob: f64,
    temperature: f64,
    compression_ratio: f64,
}

pub fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    match tokenizer.token_to_id(token) {
        None => bail!("no token-id for {token}"),
        Some(id) => Ok(id),
    }
}
