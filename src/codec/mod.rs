//! Audio codec bindings
//!
//! Compiled with the `opus-codec` feature. Without it the audio pipeline
//! takes any [`AudioDecoder`](crate::media::AudioDecoder) or runs in silence
//! passthrough.

#[cfg(feature = "opus-codec")]
pub mod decoder;

#[cfg(feature = "opus-codec")]
pub use decoder::{DecoderStats, OpusAudioDecoder};
