#![allow(clippy::cast_precision_loss)]

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Sample rate every decoder has to deliver, as expected by Whisper
pub const SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone)]
pub enum AudioDecoder {
    /// Shell out to an ffmpeg executable which resamples and down-mixes any input
    Ffmpeg { program: PathBuf },
    /// Decode in-process, the source must already be sampled at 16 kHz
    Symphonia,
}

impl AudioDecoder {
    /// Decodes the file into mono f32 samples at [`SAMPLE_RATE`]
    pub fn decode(&self, path: &Path) -> Result<Vec<f32>> {
        let samples = match self {
            AudioDecoder::Ffmpeg { program } => ffmpeg_decode(program, path)?,
            AudioDecoder::Symphonia => {
                let (samples, sample_rate) = pcm_decode(path)?;
                if sample_rate != SAMPLE_RATE {
                    bail!(
                        "Input file must have a {} sampling rate, got {}",
                        SAMPLE_RATE,
                        sample_rate
                    )
                }
                samples
            }
        };
        debug!("pcm data loaded {}", samples.len());
        Ok(samples)
    }
}

fn ffmpeg_decode(program: &Path, path: &Path) -> Result<Vec<f32>> {
    let output = Command::new(program)
        .args(["-nostdin", "-threads", "0", "-i"])
        .arg(path)
        .args(["-f", "s16le", "-ac", "1", "-acodec", "pcm_s16le", "-ar"])
        .arg(SAMPLE_RATE.to_string())
        .arg("-")
        .output()
        .with_context(|| format!("Failed to run ffmpeg at {}", program.display()))?;

    if !output.status.success() {
        bail!(
            "Failed to load audio: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }

    let mut pcm = vec![0i16; output.stdout.len() / 2];
    LittleEndian::read_i16_into(&output.stdout[..pcm.len() * 2], &mut pcm);
    Ok(pcm.into_iter().map(|s| f32::from(s) / 32768.0).collect())
}

/// Decodes the first audio track of the file, averaging all channels into one
pub fn pcm_decode(path: &Path) -> Result<(Vec<f32>, u32)> {
    let source = File::open(path)?;
    let stream = MediaSourceStream::new(Box::new(source), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        stream,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;
    let Some(track) = format
        .tracks()
        .iter()
        .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
    else {
        bail!("No supported audio track found")
    };
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut pcm = vec![];
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break
            }
            Err(err) => return Err(err.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(err)) => {
                warn!("Skipping undecodable packet: {err}");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let spec = *decoded.spec();
        sample_rate = spec.rate;
        let channels = spec.channels.count().max(1);

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        pcm.extend(
            buffer
                .samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );
    }

    Ok((pcm, sample_rate))
}

fn hz_to_mel(hz: f64) -> f64 {
    const MIN_LOG_HZ: f64 = 1000.0;
    let f_sp = 200.0 / 3.0;
    let min_log_mel = MIN_LOG_HZ / f_sp;
    let log_step = 6.4f64.ln() / 27.0;
    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / log_step
    } else {
        hz / f_sp
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const MIN_LOG_HZ: f64 = 1000.0;
    let f_sp = 200.0 / 3.0;
    let min_log_mel = MIN_LOG_HZ / f_sp;
    let log_step = 6.4f64.ln() / 27.0;
    if mel >= min_log_mel {
        MIN_LOG_HZ * (log_step * (mel - min_log_mel)).exp()
    } else {
        mel * f_sp
    }
}

/// Slaney-style mel filterbank laid out row-major as `[n_mels, n_fft / 2 + 1]`
pub fn mel_filters(sample_rate: u32, n_fft: usize, n_mels: usize) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let nyquist = f64::from(sample_rate) / 2.0;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|i| nyquist * i as f64 / (n_freqs - 1) as f64)
        .collect();

    let max_mel = hz_to_mel(nyquist);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * n_freqs];
    for mel in 0..n_mels {
        let (left, center, right) = (mel_points[mel], mel_points[mel + 1], mel_points[mel + 2]);
        let norm = 2.0 / (right - left);
        for (bin, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - left) / (center - left);
            let upper = (right - freq) / (right - center);
            let weight = lower.min(upper).max(0.0) * norm;
            filters[mel * n_freqs + bin] = weight as f32;
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_wav(samples: &[i16], sample_rate: u32, channels: u16) -> tempfile::NamedTempFile {
        let data_len = u32::try_from(samples.len() * 2).unwrap();
        let block_align = channels * 2;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * u32::from(block_align)).to_le_bytes());
        bytes.extend_from_slice(&block_align.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }

        let mut file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn symphonia_decodes_16khz_wav() {
        let samples: Vec<i16> = (0..1600).map(|i| if i % 2 == 0 { 16384 } else { -16384 }).collect();
        let file = write_wav(&samples, SAMPLE_RATE, 1);

        let pcm = AudioDecoder::Symphonia.decode(file.path()).unwrap();
        assert_eq!(pcm.len(), 1600);
        assert!((pcm[0] - 0.5).abs() < 1e-3);
        assert!((pcm[1] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn symphonia_downmixes_stereo() {
        // left and right cancel each other out
        let samples: Vec<i16> = (0..800).flat_map(|_| [8192, -8192]).collect();
        let file = write_wav(&samples, SAMPLE_RATE, 2);

        let pcm = AudioDecoder::Symphonia.decode(file.path()).unwrap();
        assert_eq!(pcm.len(), 800);
        assert!(pcm.iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn symphonia_rejects_other_sample_rates() {
        let file = write_wav(&[0; 800], 8_000, 1);

        let err = AudioDecoder::Symphonia.decode(file.path()).unwrap_err();
        assert!(err.to_string().contains("16000 sampling rate"));
    }

    #[test]
    fn missing_ffmpeg_is_reported() {
        let decoder = AudioDecoder::Ffmpeg {
            program: PathBuf::from("/nonexistent/bin/ffmpeg"),
        };
        let err = decoder.decode(Path::new("audio.wav")).unwrap_err();
        assert!(err.to_string().contains("Failed to run ffmpeg at /nonexistent/bin/ffmpeg"));
    }

    #[cfg(unix)]
    #[test]
    fn ffmpeg_output_is_read_as_s16le() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("ffmpeg");
        std::fs::write(&program, "#!/bin/sh\nprintf '\\000\\100\\000\\300'\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let pcm = AudioDecoder::Ffmpeg { program }
            .decode(Path::new("audio.mp3"))
            .unwrap();
        assert_eq!(pcm, vec![0.5, -0.5]);
    }

    #[cfg(unix)]
    #[test]
    fn ffmpeg_failure_surfaces_stderr() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("ffmpeg");
        std::fs::write(&program, "#!/bin/sh\necho 'Invalid data found' >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = AudioDecoder::Ffmpeg { program }
            .decode(Path::new("audio.m4a"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to load audio: Invalid data found");
    }

    #[test]
    fn mel_filters_shape_and_weights() {
        let filters = mel_filters(SAMPLE_RATE, 400, 80);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|w| w.is_finite() && *w >= 0.0));

        // the first band peaks right above 0 Hz
        assert_eq!(filters[0], 0.0);
        assert!(filters[1] > 0.02 && filters[1] < 0.03);

        for row in filters.chunks(201) {
            assert!(row.iter().sum::<f32>() > 0.0);
        }
    }

    #[test]
    fn mel_scale_is_continuous_at_the_log_boundary() {
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
        assert!((mel_to_hz(hz_to_mel(4321.0)) - 4321.0).abs() < 1e-6);
        assert!((mel_to_hz(hz_to_mel(300.0)) - 300.0).abs() < 1e-9);
    }
}
