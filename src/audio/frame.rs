//! PCM frame constants and assembly
//!
//! The voice contract is fixed: 48kHz stereo signed-16 little-endian PCM in
//! 20ms windows. The assembler turns the transcoder's byte stream into exact
//! frames, carrying partial reads across calls.

use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::error::Result;

/// Output sample rate in Hz
pub const SAMPLE_RATE: u32 = 48_000;
/// Channel count (interleaved stereo)
pub const CHANNELS: u32 = 2;
/// Samples per channel per frame (20ms at 48kHz)
pub const FRAME_SAMPLES: u32 = 960;
/// Interleaved samples per frame
pub const FRAME_INTERLEAVED_SAMPLES: usize = (FRAME_SAMPLES * CHANNELS) as usize;
/// Bytes per frame (signed-16 samples)
pub const FRAME_BYTES: usize = FRAME_INTERLEAVED_SAMPLES * 2;
/// Wall-clock duration of one frame
pub const FRAME_DURATION: std::time::Duration = std::time::Duration::from_millis(20);

/// One 20ms window of raw PCM
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw PCM data (S16LE interleaved), exactly `FRAME_BYTES` long
    pub data: Bytes,
    /// Frame sequence number within the session
    pub sequence: u64,
    /// Assembly timestamp
    pub timestamp: Instant,
}

impl AudioFrame {
    pub fn new(data: Bytes, sequence: u64) -> Self {
        Self {
            data,
            sequence,
            timestamp: Instant::now(),
        }
    }

    /// Interleaved sample count
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2
    }

    /// View the payload as interleaved i16 samples.
    ///
    /// S16LE matches native i16 on little-endian targets; the copy path only
    /// runs when the buffer lands on an odd address.
    pub fn samples(&self) -> Vec<i16> {
        match bytemuck::try_cast_slice::<u8, i16>(&self.data) {
            Ok(samples) => samples.to_vec(),
            Err(_) => self
                .data
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
        }
    }
}

/// Assembles exact PCM frames from the transcoder's stdout.
///
/// A read may return fewer bytes than a frame; the assembler keeps filling
/// until the frame completes, the stream ends, or the read fails. A
/// truncated tail at end-of-stream is dropped.
pub struct FrameAssembler<R> {
    reader: R,
    buf: Vec<u8>,
    sequence: u64,
}

impl<R: AsyncRead + Unpin> FrameAssembler<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: vec![0u8; FRAME_BYTES],
            sequence: 0,
        }
    }

    /// Number of complete frames produced so far.
    pub fn frames_read(&self) -> u64 {
        self.sequence
    }

    /// Read the next complete frame, or `None` on end-of-stream.
    pub async fn next_frame(&mut self) -> Result<Option<AudioFrame>> {
        let mut filled = 0usize;
        while filled < FRAME_BYTES {
            let n = self.reader.read(&mut self.buf[filled..]).await?;
            if n == 0 {
                if filled > 0 {
                    warn!(
                        bytes = filled,
                        "Dropping truncated PCM tail at end of stream"
                    );
                } else {
                    debug!(frames = self.sequence, "PCM stream ended cleanly");
                }
                return Ok(None);
            }
            filled += n;
        }

        self.sequence += 1;
        Ok(Some(AudioFrame::new(
            Bytes::copy_from_slice(&self.buf),
            self.sequence,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constants() {
        assert_eq!(FRAME_INTERLEAVED_SAMPLES, 1920);
        assert_eq!(FRAME_BYTES, 3840);
        assert_eq!(FRAME_DURATION.as_millis(), 20);
    }

    #[test]
    fn test_samples_little_endian() {
        let mut data = vec![0u8; FRAME_BYTES];
        data[0] = 0x01;
        data[1] = 0x02; // 0x0201 little-endian
        let frame = AudioFrame::new(Bytes::from(data), 1);
        let samples = frame.samples();
        assert_eq!(samples.len(), FRAME_INTERLEAVED_SAMPLES);
        assert_eq!(samples[0], 0x0201);
    }

    #[tokio::test]
    async fn test_assembler_exact_frames() {
        let input = vec![7u8; FRAME_BYTES * 3];
        let mut assembler = FrameAssembler::new(&input[..]);

        for expected_seq in 1..=3u64 {
            let frame = assembler.next_frame().await.unwrap().unwrap();
            assert_eq!(frame.data.len(), FRAME_BYTES);
            assert_eq!(frame.sequence, expected_seq);
        }
        assert!(assembler.next_frame().await.unwrap().is_none());
        assert_eq!(assembler.frames_read(), 3);
    }

    #[tokio::test]
    async fn test_assembler_drops_truncated_tail() {
        let input = vec![0u8; FRAME_BYTES + 100];
        let mut assembler = FrameAssembler::new(&input[..]);

        assert!(assembler.next_frame().await.unwrap().is_some());
        // 100 trailing bytes do not form a frame
        assert!(assembler.next_frame().await.unwrap().is_none());
        assert_eq!(assembler.frames_read(), 1);
    }

    #[tokio::test]
    async fn test_assembler_spans_partial_reads() {
        // tokio's `chain` yields each part separately, forcing partial fills
        let first = vec![1u8; 1000];
        let second = vec![2u8; FRAME_BYTES - 1000];
        let reader = tokio::io::AsyncReadExt::chain(&first[..], &second[..]);
        let mut assembler = FrameAssembler::new(reader);

        let frame = assembler.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.data.len(), FRAME_BYTES);
        assert_eq!(frame.data[0], 1);
        assert_eq!(frame.data[FRAME_BYTES - 1], 2);
    }

    #[tokio::test]
    async fn test_assembler_empty_stream() {
        let input: Vec<u8> = Vec::new();
        let mut assembler = FrameAssembler::new(&input[..]);
        assert!(assembler.next_frame().await.unwrap().is_none());
        assert_eq!(assembler.frames_read(), 0);
    }
}
