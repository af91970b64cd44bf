use std::path::Path;

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Multipart, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::bail_request;
use crate::error::{bad_multipart, ServiceError, ServiceResult};
use crate::inference::task::{ModelSize, Task, TranscribeOptions};
use crate::AppState;

pub(crate) const ALLOWED_EXTENSIONS: [&str; 4] = [".wav", ".mp3", ".m4a", ".flac"];

#[derive(Deserialize, Debug)]
#[serde(default)]
pub(crate) struct TranscribeParams {
    pub(crate) language: String,
    pub(crate) model_size: String,
    pub(crate) task: String,
}

impl Default for TranscribeParams {
    fn default() -> Self {
        Self {
            language: "en".into(),
            model_size: ModelSize::Small.to_string(),
            task: Task::Transcribe.to_string(),
        }
    }
}

#[derive(Serialize, Debug)]
pub(crate) struct TranscribeResponse {
    status: &'static str,
    transcribed_text: Option<String>,
    error: Option<String>,
}

impl TranscribeResponse {
    fn success(text: String) -> Self {
        Self {
            status: "success",
            transcribed_text: Some(text),
            error: None,
        }
    }
}

struct Upload {
    filename: String,
    bytes: Bytes,
}

/// Lower-cased extension of the last path component including the dot, empty if there is none
pub(crate) fn file_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}

/// Checks extension, model size and task in that order, the first failure wins
pub(crate) fn validate(
    filename: &str,
    model_size: &str,
    task: &str,
) -> ServiceResult<(ModelSize, Task)> {
    let extension = file_extension(filename);
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        bail_request!(
            "Unsupported file type: {}. Allowed: {}",
            extension,
            ALLOWED_EXTENSIONS.join(", ")
        );
    }

    let Ok(model_size) = model_size.parse::<ModelSize>() else {
        bail_request!(
            "Invalid model size. Choose from: {}",
            ModelSize::ALL.map(|size| size.as_str()).join(", ")
        );
    };
    let Ok(task) = task.parse::<Task>() else {
        bail_request!(
            "Invalid task. Choose from: {}",
            Task::ALL.map(|task| task.as_str()).join(", ")
        );
    };

    Ok((model_size, task))
}

#[axum_macros::debug_handler]
pub(crate) async fn handle_transcribe_request(
    State(state): State<AppState>,
    query: Result<Query<TranscribeParams>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ServiceResult<Json<TranscribeResponse>> {
    match transcribe(&state, query, multipart).await {
        Ok(text) => Ok(Json(TranscribeResponse::success(text))),
        Err(err @ ServiceError::BadRequest(_)) => {
            warn!("Rejected transcription request: {}", err.message());
            Err(err)
        }
        Err(err) => {
            error!("Transcription error: {}", err.message());
            Err(err)
        }
    }
}

async fn transcribe(
    state: &AppState,
    query: Result<Query<TranscribeParams>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ServiceResult<String> {
    // Extractor rejections are rendered like every other bad request
    let Query(mut params) =
        query.map_err(|rejection| ServiceError::BadRequest(rejection.body_text()))?;
    let mut multipart =
        multipart.map_err(|rejection| ServiceError::BadRequest(rejection.body_text()))?;

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_owned();
                let bytes = field.bytes().await.map_err(bad_multipart)?;
                upload = Some(Upload { filename, bytes });
            }
            // Form fields take precedence over the query string
            Some("language") => params.language = field.text().await.map_err(bad_multipart)?,
            Some("model_size") => params.model_size = field.text().await.map_err(bad_multipart)?,
            Some("task") => params.task = field.text().await.map_err(bad_multipart)?,
            _ => {}
        }
    }
    let Some(upload) = upload else {
        bail_request!("Missing field file in multipart form")
    };

    let (model_size, task) = validate(&upload.filename, &params.model_size, &params.task)?;
    info!(
        "Processing transcription for file: {} ({} bytes, {model_size}, {task}, {})",
        upload.filename,
        upload.bytes.len(),
        params.language
    );

    // Only the extension of the client supplied name is kept, the file is removed when dropped
    let temp_file = tempfile::Builder::new()
        .prefix("temp_")
        .suffix(&file_extension(&upload.filename))
        .tempfile_in(&state.temp_dir)?;
    tokio::fs::write(temp_file.path(), &upload.bytes).await?;

    let model = state.cache.get(model_size).await?;
    let options = TranscribeOptions {
        language: params.language,
        task,
        half_precision: state.cache.half_precision(),
        decoder: state.decoder.clone(),
    };

    let transcript = tokio::task::spawn_blocking(move || {
        let transcript = model.transcribe(temp_file.path(), &options);
        drop(temp_file);
        transcript
    })
    .await??;

    for segment in &transcript.segments {
        debug!(
            "{:.1}s -- {:.1}s (t={}): {}",
            segment.start,
            segment.start + segment.duration,
            segment.temperature,
            segment.text
        );
    }
    info!(
        "Decoded {} segment(s) of {} audio",
        transcript.segments.len(),
        transcript.language
    );

    match transcript.text {
        Some(text) => Ok(text.trim().to_owned()),
        None => Err(ServiceError::TranscriptionFailed),
    }
}
