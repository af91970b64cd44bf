use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use clap_serde_derive::ClapSerde;
use hf_hub::api::sync::Api;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;
use crate::inference::audio::AudioDecoder;
use crate::inference::cache::ModelCache;
use crate::inference::whisper::WhisperLoader;
use crate::telemetry::{init_telemetry, shutdown_telemetry};

mod api;
mod config;
mod error;
mod inference;
mod telemetry;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEFAULT_CONFIG_FILE: &str = "TranscriptionRunner.toml";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "TRANSCRIPTION_RUNNER_CONFIG_FILE", default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) cache: Arc<ModelCache>,
    pub(crate) decoder: AudioDecoder,
    pub(crate) temp_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();
    let config = match load_config(&mut args) {
        Ok(config) => config,
        Err(err) => {
            init_telemetry(None)?;
            exit_err!(
                1,
                "Failed to read configuration file {} with error: {}",
                args.config_file,
                err
            );
        }
    };
    init_telemetry(config.otlp_endpoint().as_deref())?;

    let device = config.device()?;
    let cache = Arc::new(ModelCache::new(
        Arc::new(WhisperLoader::new(Api::new()?)),
        device,
    ));
    if let Some(size) = config.preload_model()? {
        cache.preload(size).await?;
        info!("{} model(s) ready", cache.loaded());
    }

    let state = AppState {
        cache,
        decoder: config.audio_decoder(),
        temp_dir: config.temp_dir(),
    };
    let router = api::router(state, config.max_upload_bytes);

    let listener = TcpListener::bind(format!("{}:{}", config.address, config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);
    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}, cuda: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c(),
        candle_core::utils::cuda_is_available()
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    shutdown_telemetry();
    Ok(())
}

/// File values override defaults and flags or environment variables override both.
/// A missing default file is not an error.
fn load_config(args: &mut Args) -> Result<Config> {
    match Config::from_toml(&args.config_file) {
        Ok(conf) => Ok(conf.merge(&mut args.opt_config)),
        Err(_)
            if args.config_file == DEFAULT_CONFIG_FILE
                && !std::path::Path::new(DEFAULT_CONFIG_FILE).exists() =>
        {
            Ok(Config::default().merge(&mut args.opt_config))
        }
        Err(err) => Err(err),
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

#[macro_export]
macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {
        {
            error!($fmt $(, $arg)*);
            std::process::exit($code);
        }
    };
}
