use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voicepipe::config::PipelineConfig;
use voicepipe::diagnostics::{Diagnostics, NullMetricsSink};
use voicepipe::pipeline::{PipelineController, PipelineState};
use voicepipe::sink::VoiceSink;

/// Log level for the pipeline
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// voicepipe command line arguments
#[derive(Parser, Debug)]
#[command(name = "voicepipe")]
#[command(version, about = "Stream a media URL as Opus packets", long_about = None)]
struct CliArgs {
    /// Source URL to play
    url: String,

    /// Path to the downloader binary
    #[arg(long, value_name = "PATH", default_value = "yt-dlp")]
    downloader_bin: String,

    /// Path to the transcoder binary
    #[arg(long, value_name = "PATH", default_value = "ffmpeg")]
    transcoder_bin: String,

    /// Opus bitrate in bps
    #[arg(long, value_name = "BPS", default_value_t = 128_000)]
    bitrate: u32,

    /// Retry budget for the session
    #[arg(long, value_name = "N", default_value_t = 3)]
    max_retries: u32,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Log format (text, json)
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,
}

fn init_logging(level: LogLevel, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.as_filter()));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.log_format);

    let mut config = PipelineConfig::default();
    config.downloader.binary_path = args.downloader_bin;
    config.transcoder.binary_path = args.transcoder_bin;
    config.opus.bitrate = args.bitrate;
    config.retry.max_retries = args.max_retries;
    config.validate()?;

    let controller = Arc::new(PipelineController::new(
        config,
        Arc::new(Diagnostics::logging_only()),
        Arc::new(NullMetricsSink),
    ));
    controller.initialize().await?;

    let (sink, mut rx) = VoiceSink::new(64);
    let drain = tokio::spawn(async move {
        let mut packets: u64 = 0;
        let mut bytes: u64 = 0;
        while let Some(packet) = rx.recv().await {
            packets += 1;
            bytes += packet.len() as u64;
        }
        (packets, bytes)
    });

    controller.play(&args.url, sink).await?;
    // play() has moved the state to Starting, so waiting for Stopped below
    // only completes when the session actually ends.
    let mut state_watch = controller.state_watch();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping playback");
            controller.stop().await?;
        }
        _ = state_watch.wait_for(|state| *state == PipelineState::Stopped) => {}
    }

    let status = controller.status().await;
    controller.shutdown().await?;
    drop(controller);

    let (packets, bytes) = drain.await?;
    println!(
        "frames read: {}, packets delivered: {} ({} bytes), dropped: {}",
        status.frames_read, packets, bytes, status.packets_dropped
    );
    if let Some(error) = status.last_error {
        println!("last error: {}", error);
        std::process::exit(1);
    }

    Ok(())
}
