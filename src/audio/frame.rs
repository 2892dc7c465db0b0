//! # Audio Frames
//!
//! An [`AudioFrame`] is one chunk of raw PCM audio exactly as it arrived on a
//! transport message. The relay never decodes, resamples or re-chunks audio:
//! whatever bytes the browser sends in one binary message are handed to the
//! upstream session as one frame, and whatever the upstream synthesizes is
//! sent back to the browser as one binary message.
//!
//! ## Audio Format:
//! - **Sample Rate**: 24kHz (24,000 Hz)
//! - **Bit Depth**: 16-bit PCM, little-endian signed integers
//! - **Channels**: Mono (1 channel)
//!
//! ## Key Rust Concepts:
//! - **Bytes**: Reference-counted byte buffer, so cloning a frame never copies audio
//! - **Newtype pattern**: Wrapping `Bytes` gives frames their own type without runtime cost

use bytes::Bytes;

/// Sample rate of every frame on both legs of the relay.
pub const SAMPLE_RATE_HZ: u32 = 24_000;

/// Number of interleaved channels (mono).
pub const CHANNELS: u16 = 1;

/// Size of one 16-bit sample in bytes.
pub const BYTES_PER_SAMPLE: usize = 2;

/// One immutable chunk of PCM audio.
///
/// Frames are transient: produced by one side, consumed once by a forward
/// operation, then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame(Bytes);

impl AudioFrame {
    /// Wrap transport bytes as a frame. No copy is made for `Bytes` input.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of whole mono samples in the frame.
    ///
    /// A trailing odd byte is not counted, though it is still forwarded.
    pub fn sample_count(&self) -> usize {
        self.0.len() / (BYTES_PER_SAMPLE * CHANNELS as usize)
    }

    /// Playback duration of the frame in milliseconds (used for logging).
    pub fn duration_ms(&self) -> f64 {
        self.sample_count() as f64 * 1000.0 / SAMPLE_RATE_HZ as f64
    }
}

impl From<Vec<u8>> for AudioFrame {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}
