//! # Audio Module
//!
//! Per-call audio handling for the realtime gateway.
//!
//! ## Key Components:
//! - **Session Registry**: Live calls keyed by session id (`session`)
//! - **Audio Accumulator**: Utterance buffers flushed on `voice_end` (`buffer`)
//! - **Audio Conversion**: Numeric-array decoding and PCM to WAV (`processor`)
//!
//! ## Audio Format:
//! - **Sample Rate**: 16kHz
//! - **Bit Depth**: 16-bit PCM, little-endian
//! - **Channels**: Mono

pub mod buffer; // Utterance buffers and the accumulator front end
pub mod processor; // Format conversion helpers
pub mod session; // Call sessions and the session registry

pub use buffer::AudioAccumulator;
pub use session::{CallSession, SessionError, SessionRegistry, SessionSnapshot, TurnTicket};
