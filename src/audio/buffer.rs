//! # Audio Accumulation
//!
//! Collects the audio of one utterance until the client signals the end of
//! speech.
//!
//! ## Key Features:
//! - **No size cap, no auto-flush**: Only an explicit `voice_end` empties the buffer
//! - **Atomic flush**: The buffer is taken and cleared under the session lock,
//!   so a concurrent append lands either in this utterance or the next, never both
//! - **Empty flush is a no-op**: No pipeline run for an utterance with no audio

use crate::audio::session::{SessionError, SessionRegistry, TurnTicket};
use std::mem;
use std::sync::Arc;
use tracing::debug;

/// Raw bytes of the current utterance.
#[derive(Debug, Default)]
pub struct AudioBuffer {
    data: Vec<u8>,
    chunks: usize,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the new length.
    pub fn append(&mut self, chunk: &[u8]) -> usize {
        self.data.extend_from_slice(chunk);
        self.chunks += 1;
        self.data.len()
    }

    /// Take everything buffered so far, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        self.chunks = 0;
        mem::take(&mut self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks
    }
}

/// Session-addressed front end to the per-session buffers.
#[derive(Clone)]
pub struct AudioAccumulator {
    registry: Arc<SessionRegistry>,
}

impl AudioAccumulator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Append a chunk to an active session's buffer.
    ///
    /// ## Returns:
    /// - **Ok(len)**: Bytes now buffered for the utterance
    /// - **Err(...)**: Session missing or no longer active
    pub fn append(&self, session_id: &str, chunk: &[u8]) -> Result<usize, SessionError> {
        let session = self.registry.get_active(session_id)?;
        let buffered = session.append_audio(chunk)?;
        debug!(session_id, chunk = chunk.len(), buffered, "audio chunk appended");
        Ok(buffered)
    }

    /// Flush the utterance for the pipeline.
    ///
    /// `Ok(None)` when nothing was buffered. See `CallSession::begin_turn`
    /// for the in-flight rejection rule.
    pub fn flush_on_end_of_utterance(&self, session_id: &str) -> Result<Option<TurnTicket>, SessionError> {
        let session = self.registry.get_active(session_id)?;
        session.begin_turn()
    }
}
