//! voicepipe - audio streaming pipeline core
//!
//! This crate drives an external media downloader and transcoder as a piped
//! pair, assembles the resulting raw PCM into 20ms frames, encodes them to
//! Opus, and delivers packets to a bounded voice sink. Failures are
//! classified into a closed taxonomy that selects the retry schedule and
//! decides when the short-lived stream URL is re-resolved.

pub mod audio;
pub mod classify;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod pipeline;
pub mod process;
pub mod retry;
pub mod sink;
pub mod utils;

pub use classify::{Classification, Classifier, ErrorKind};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{PipelineController, PipelineState, PipelineStatus};
pub use sink::VoiceSink;
