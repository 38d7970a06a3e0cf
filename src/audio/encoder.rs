//! Opus encoder wrapper for the voice service
//!
//! Enforces the voice frame contract: 48kHz stereo input in 960-sample
//! frames, packets no larger than 4000 bytes, VBR on.

use std::time::Instant;

use audiopus::coder::{Encoder, GenericCtl};
use audiopus::{Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use tracing::{info, trace, warn};

use super::frame::{AudioFrame, FRAME_DURATION, FRAME_INTERLEAVED_SAMPLES, FRAME_SAMPLES};
use crate::error::{PipelineError, Result};
use crate::utils::LogThrottler;

/// Maximum size of a single Opus packet
pub const MAX_PACKET_BYTES: usize = 4000;

/// Bitrates the voice service accepts
const BITRATE_RANGE: std::ops::RangeInclusive<u32> = 8_000..=510_000;

/// Opus encoder configuration
#[derive(Debug, Clone)]
pub struct OpusConfig {
    /// Target bitrate in bps
    pub bitrate: u32,
    /// Samples per channel per frame
    pub frame_size: u32,
    /// Variable bitrate
    pub vbr: bool,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            bitrate: 128_000,
            frame_size: FRAME_SAMPLES,
            vbr: true,
        }
    }
}

/// Encoded Opus packet
#[derive(Debug, Clone)]
pub struct OpusPacket {
    /// Encoded Opus data, at most `MAX_PACKET_BYTES` long
    pub data: Bytes,
    /// Duration in milliseconds
    pub duration_ms: u32,
    /// Sequence number
    pub sequence: u64,
    /// Encode timestamp
    pub timestamp: Instant,
}

impl OpusPacket {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Opus encoder with an explicit session lifecycle
///
/// `initialize` constructs the underlying encoder once per instance;
/// `prepare_for_streaming` re-checks the runtime parameters before each
/// session; `close` releases the encoder state and is idempotent.
pub struct OpusEncoder {
    config: OpusConfig,
    inner: Option<Encoder>,
    output_buffer: Vec<u8>,
    frame_count: u64,
    over_budget_count: u64,
    throttler: LogThrottler,
}

impl OpusEncoder {
    /// Create an uninitialized encoder with the given configuration.
    pub fn new(config: OpusConfig) -> Self {
        Self {
            config,
            inner: None,
            output_buffer: vec![0u8; MAX_PACKET_BYTES],
            frame_count: 0,
            over_budget_count: 0,
            throttler: LogThrottler::with_secs(5),
        }
    }

    /// Construct the underlying Opus encoder. Calling this twice on the same
    /// instance is an error.
    pub fn initialize(&mut self) -> Result<()> {
        if self.inner.is_some() {
            return Err(PipelineError::Encoding(
                "opus encoder already initialized".to_string(),
            ));
        }

        let mut encoder =
            Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)
                .map_err(|e| PipelineError::Encoding(format!("opus encoder create: {:?}", e)))?;

        encoder
            .set_bitrate(Bitrate::BitsPerSecond(self.config.bitrate as i32))
            .map_err(|e| PipelineError::Encoding(format!("opus set bitrate: {:?}", e)))?;
        encoder
            .set_vbr(self.config.vbr)
            .map_err(|e| PipelineError::Encoding(format!("opus set vbr: {:?}", e)))?;

        info!(
            bitrate = self.config.bitrate,
            vbr = self.config.vbr,
            "Opus encoder created: 48000Hz 2ch"
        );

        self.inner = Some(encoder);
        Ok(())
    }

    /// Validate the runtime parameters against the voice contract. Fails
    /// fast before a session starts rather than on the first frame.
    pub fn prepare_for_streaming(&self) -> Result<()> {
        if self.inner.is_none() {
            return Err(PipelineError::Encoding(
                "opus encoder not initialized".to_string(),
            ));
        }
        if self.config.frame_size != FRAME_SAMPLES {
            return Err(PipelineError::Config(format!(
                "invalid config: opus frame size must be {}, got {}",
                FRAME_SAMPLES, self.config.frame_size
            )));
        }
        if !BITRATE_RANGE.contains(&self.config.bitrate) {
            return Err(PipelineError::Config(format!(
                "invalid config: opus bitrate {} outside accepted range",
                self.config.bitrate
            )));
        }
        Ok(())
    }

    /// Encode one PCM frame into an Opus packet.
    ///
    /// The input must hold exactly `FRAME_SAMPLES * CHANNELS` interleaved
    /// samples; anything else is rejected before touching the codec.
    pub fn encode(&mut self, frame: &AudioFrame) -> Result<OpusPacket> {
        let encoder = self.inner.as_mut().ok_or_else(|| {
            PipelineError::Encoding("opus encoder not initialized".to_string())
        })?;

        let samples = frame.samples();
        if samples.len() != FRAME_INTERLEAVED_SAMPLES {
            return Err(PipelineError::Encoding(format!(
                "pcm frame size mismatch: expected {} samples, got {}",
                FRAME_INTERLEAVED_SAMPLES,
                samples.len()
            )));
        }

        let started = Instant::now();
        let encoded_len = encoder
            .encode(samples.as_slice(), &mut self.output_buffer)
            .map_err(|e| PipelineError::Encoding(format!("opus encode failed: {:?}", e)))?;
        let elapsed = started.elapsed();

        // Encoding slower than the frame budget means the loop will fall
        // behind real time. Recorded and warned, never fatal on its own.
        if elapsed > FRAME_DURATION {
            self.over_budget_count += 1;
            if self.throttler.should_log("opus_encode_budget") {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    overruns = self.over_budget_count,
                    "Opus encode exceeded the 20ms frame budget"
                );
            }
        }

        self.frame_count += 1;

        trace!(
            samples = samples.len(),
            bytes = encoded_len,
            "Encoded PCM frame to Opus"
        );

        Ok(OpusPacket {
            data: Bytes::copy_from_slice(&self.output_buffer[..encoded_len]),
            duration_ms: (FRAME_SAMPLES * 1000 / super::frame::SAMPLE_RATE),
            sequence: self.frame_count - 1,
            timestamp: Instant::now(),
        })
    }

    /// Reset the codec state between sessions while keeping the encoder
    /// instance ready for reuse.
    pub fn end_session(&mut self) -> Result<()> {
        if let Some(ref mut encoder) = self.inner {
            encoder
                .reset_state()
                .map_err(|e| PipelineError::Encoding(format!("opus reset failed: {:?}", e)))?;
        }
        self.frame_count = 0;
        self.over_budget_count = 0;
        Ok(())
    }

    /// Release the encoder state. Idempotent.
    pub fn close(&mut self) {
        self.inner = None;
        self.frame_count = 0;
        self.over_budget_count = 0;
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.is_some()
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frame_count
    }

    pub fn over_budget_count(&self) -> u64 {
        self.over_budget_count
    }

    pub fn config(&self) -> &OpusConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::FRAME_BYTES;

    fn silence_frame() -> AudioFrame {
        AudioFrame::new(Bytes::from(vec![0u8; FRAME_BYTES]), 1)
    }

    fn ready_encoder() -> OpusEncoder {
        let mut encoder = OpusEncoder::new(OpusConfig::default());
        encoder.initialize().unwrap();
        encoder
    }

    #[test]
    fn test_double_initialize_fails() {
        let mut encoder = ready_encoder();
        assert!(encoder.initialize().is_err());
    }

    #[test]
    fn test_encode_before_initialize_fails() {
        let mut encoder = OpusEncoder::new(OpusConfig::default());
        let err = encoder.encode(&silence_frame()).unwrap_err();
        assert!(matches!(err, PipelineError::Encoding(_)));
    }

    #[test]
    fn test_prepare_rejects_bad_frame_size() {
        let mut encoder = OpusEncoder::new(OpusConfig {
            frame_size: 480,
            ..Default::default()
        });
        encoder.initialize().unwrap();
        let err = encoder.prepare_for_streaming().unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_prepare_rejects_bad_bitrate() {
        let mut encoder = OpusEncoder::new(OpusConfig {
            bitrate: 1_000_000,
            ..Default::default()
        });
        encoder.initialize().unwrap();
        assert!(encoder.prepare_for_streaming().is_err());
    }

    #[test]
    fn test_encode_silence() {
        let mut encoder = ready_encoder();
        encoder.prepare_for_streaming().unwrap();

        let packet = encoder.encode(&silence_frame()).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() <= MAX_PACKET_BYTES);
        assert_eq!(packet.duration_ms, 20);
        assert_eq!(packet.sequence, 0);
    }

    #[test]
    fn test_encode_rejects_short_input() {
        let mut encoder = ready_encoder();
        let short = AudioFrame::new(Bytes::from(vec![0u8; 100]), 1);
        let err = encoder.encode(&short).unwrap_err();
        assert!(matches!(err, PipelineError::Encoding(_)));
        assert!(err.to_string().contains("frame size"));
    }

    #[test]
    fn test_encode_rejects_empty_input() {
        let mut encoder = ready_encoder();
        let empty = AudioFrame::new(Bytes::new(), 1);
        assert!(encoder.encode(&empty).is_err());
    }

    #[test]
    fn test_packet_bound_over_many_frames() {
        let mut encoder = ready_encoder();
        // Loud deterministic ramp, harder to compress than silence
        let mut data = Vec::with_capacity(FRAME_BYTES);
        for i in 0..FRAME_INTERLEAVED_SAMPLES {
            let sample = ((i as i32 * 37) % 65536 - 32768) as i16;
            data.extend_from_slice(&sample.to_le_bytes());
        }
        let frame = AudioFrame::new(Bytes::from(data), 1);

        for _ in 0..50 {
            let packet = encoder.encode(&frame).unwrap();
            assert!(packet.len() <= MAX_PACKET_BYTES);
        }
        assert_eq!(encoder.frames_encoded(), 50);
    }

    #[test]
    fn test_end_session_keeps_encoder_usable() {
        let mut encoder = ready_encoder();
        encoder.encode(&silence_frame()).unwrap();
        encoder.end_session().unwrap();
        assert_eq!(encoder.frames_encoded(), 0);
        assert!(encoder.is_initialized());
        assert!(encoder.encode(&silence_frame()).is_ok());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut encoder = ready_encoder();
        encoder.close();
        encoder.close();
        assert!(!encoder.is_initialized());
    }
}
