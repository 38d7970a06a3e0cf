//! PCM framing and Opus encoding
//!
//! This module provides:
//! - Frame constants for the voice contract (48kHz stereo S16LE, 20ms)
//! - Frame assembly from the transcoder's byte stream
//! - Opus encoding with strict packet bounds

pub mod encoder;
pub mod frame;

pub use encoder::{OpusConfig, OpusEncoder, OpusPacket, MAX_PACKET_BYTES};
pub use frame::{
    AudioFrame, FrameAssembler, CHANNELS, FRAME_BYTES, FRAME_DURATION,
    FRAME_INTERLEAVED_SAMPLES, FRAME_SAMPLES, SAMPLE_RATE,
};
