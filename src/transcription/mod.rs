//! # Transcription Module
//!
//! Speech-to-text through the upstream streaming recognition backend.
//!
//! ## Key Components:
//! - **Wire Protocol**: Binary frame codec with sequence numbers and gzip payloads
//! - **Streaming Client**: Sends one utterance per connection and collects the transcript
//!
//! ## Error Model:
//! - No speech recognised → `Ok(String::new())`
//! - Backend unreachable, rejected or timed out → `Err(BackendError)`
//!
//! The turn pipeline treats both as "couldn't hear you" and answers with the
//! character's fallback line.

pub mod client; // WebSocket client for the recognition backend
pub mod protocol; // Binary frame encoding/decoding

pub use client::StreamingAsrClient;
