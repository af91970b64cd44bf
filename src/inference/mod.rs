pub mod audio;
pub mod audio_pipeline;
pub mod cache;
pub mod task;
pub mod whisper;
