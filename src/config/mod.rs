//! Pipeline configuration
//!
//! Validated configuration groups for the pipeline, helper binaries, Opus
//! encoder, retry engine, and logger.

pub mod schema;

pub use schema::{
    DownloaderConfig, LoggerConfig, OpusSettings, PipelineConfig, PipelineSettings,
    RetrySettings, TranscoderConfig, AUDIO_FORMATS, LOG_LEVELS,
};
