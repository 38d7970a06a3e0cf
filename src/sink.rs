//! Voice sink
//!
//! The bounded channel that carries Opus packets toward the voice
//! transport. The frame loop is the only producer and never blocks on it:
//! when the channel is full the packet is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{PipelineError, Result};

/// Default capacity of the voice sink channel, in packets
pub const DEFAULT_SINK_CAPACITY: usize = 64;

/// Outcome of a non-blocking send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Packet accepted by the channel
    Sent,
    /// Channel full, packet dropped
    Dropped,
}

/// Producer handle over the bounded voice channel
#[derive(Clone)]
pub struct VoiceSink {
    tx: mpsc::Sender<Bytes>,
    dropped: Arc<AtomicU64>,
}

impl VoiceSink {
    /// Create a sink with the given capacity, returning the consumer end
    /// for the voice transport.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::from_sender(tx), rx)
    }

    /// Wrap an existing sender, e.g. one provided by the voice transport.
    pub fn from_sender(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue one packet without blocking.
    ///
    /// A full channel drops the packet and increments the drop counter; a
    /// closed channel means the voice transport is gone and surfaces as a
    /// `VoiceSink` error.
    pub fn try_send(&self, packet: Bytes) -> Result<SendOutcome> {
        match self.tx.try_send(packet) {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(SendOutcome::Dropped)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PipelineError::VoiceSink(
                "voice sink closed".to_string(),
            )),
        }
    }

    /// Packets dropped because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the consumer end has been torn down
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
