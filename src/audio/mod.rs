//! # Audio Module
//!
//! Audio as seen by the relay: opaque PCM frames moving between the browser
//! and the upstream voice session. Capture, playback and resampling all
//! happen in the browser; this side only forwards.

pub mod frame;

pub use frame::AudioFrame;
