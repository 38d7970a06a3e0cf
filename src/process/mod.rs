//! Helper process management
//!
//! This module provides:
//! - Invocation contracts for the downloader and transcoder binaries
//! - Stream mode selection (pipe vs direct)
//! - The supervised downloader/transcoder pair with bounded stderr
//!   scrollback and deterministic teardown

pub mod command;
pub mod manager;
pub mod scrollback;

pub use command::{
    downloader_args, resolver_args, stream_mode, transcoder_args, validate_binaries,
    validate_source_url, StreamMode,
};
pub use manager::{ChildExit, PairExits, ProcessInfo, ProcessManager};
pub use scrollback::Scrollback;
