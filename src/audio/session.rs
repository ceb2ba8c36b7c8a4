//! # Call Session Management
//!
//! Tracks the server-side state of every ongoing realtime call.
//!
//! ## Session Lifecycle:
//! 1. **Created** by `start_call` (a duplicate `start_call` returns the live session)
//! 2. **Receiving audio**: every `audio_chunk` appends to the session buffer
//! 3. **Turn in flight**: `voice_end` flushes the buffer and claims the turn slot
//! 4. **Removed** by `stop_call` or a dropped connection, exactly once
//!
//! ## Locking:
//! - The registry map has its own `RwLock`, held only for the map operation
//! - Each session has its own `Mutex` for buffer, transcript tracking and turn slot
//! - Neither lock is ever held across an `.await`

use crate::audio::buffer::AudioBuffer;
use crate::pipeline::persona::Persona;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::task::JoinHandle;

/// Session-level failures reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    NotFound(String),
    Inactive(String),
    /// A previous turn's pipeline is still running
    TurnInProgress(String),
    CapacityReached(usize),
    OwnedByAnotherUser(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotFound(id) => write!(f, "session {} not found", id),
            SessionError::Inactive(id) => write!(f, "session {} is not active", id),
            SessionError::TurnInProgress(id) => {
                write!(f, "session {} is still answering the previous utterance", id)
            }
            SessionError::CapacityReached(max) => {
                write!(f, "maximum concurrent calls ({}) reached", max)
            }
            SessionError::OwnedByAnotherUser(id) => {
                write!(f, "session {} belongs to another user", id)
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// Audio handed to the pipeline for one turn, plus the id that releases the slot.
#[derive(Debug)]
pub struct TurnTicket {
    pub turn_id: u64,
    pub audio: Vec<u8>,
}

/// Mutable per-session state, guarded by the session mutex.
#[derive(Default)]
struct SessionState {
    buffer: AudioBuffer,
    /// Length of the longest transcript seen for the current utterance
    text_offset: usize,
    last_text: String,
    /// Watchdog for the turn in flight
    pending_timer: Option<JoinHandle<()>>,
    /// Pipeline task of the turn in flight
    running: Option<JoinHandle<()>>,
    turn_in_flight: Option<u64>,
    next_turn_id: u64,
    total_audio_bytes: usize,
    turns_started: u32,
}

/// Point-in-time view of a session, for status endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub is_active: bool,
    pub user_id: i64,
    pub character_id: i64,
    pub character_name: String,
    pub buffered_bytes: usize,
    pub total_audio_bytes: usize,
    pub turns_started: u32,
    pub turn_in_flight: bool,
    pub created_at: DateTime<Utc>,
}

/// One ongoing realtime call.
pub struct CallSession {
    pub session_id: String,
    pub user_id: i64,
    pub character_id: i64,
    pub persona: Arc<Persona>,
    pub created_at: DateTime<Utc>,
    active: AtomicBool,
    state: Mutex<SessionState>,
}

impl CallSession {
    pub fn new(session_id: &str, user_id: i64, character_id: i64, persona: Arc<Persona>) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id,
            character_id,
            persona,
            created_at: Utc::now(),
            active: AtomicBool::new(true),
            state: Mutex::new(SessionState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Mark the session stopped and cancel its pending timer.
    ///
    /// Returns false if it was already inactive. An in-flight pipeline run is
    /// left to finish; its delivery becomes a no-op once the connection is gone.
    pub fn deactivate(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        if let Some(timer) = self.state().pending_timer.take() {
            timer.abort();
        }
        was_active
    }

    /// Append a chunk of audio; returns the new buffer size.
    pub fn append_audio(&self, chunk: &[u8]) -> Result<usize, SessionError> {
        if !self.is_active() {
            return Err(SessionError::Inactive(self.session_id.clone()));
        }
        let mut state = self.state();
        state.total_audio_bytes += chunk.len();
        Ok(state.buffer.append(chunk))
    }

    pub fn buffered_bytes(&self) -> usize {
        self.state().buffer.len()
    }

    /// Flush the buffer and claim the turn slot in one step.
    ///
    /// ## Returns:
    /// - **Ok(Some(ticket))**: Audio to run through the pipeline
    /// - **Ok(None)**: Nothing buffered, nothing to do
    /// - **Err(TurnInProgress)**: Previous turn still running; the buffer is left untouched
    pub fn begin_turn(&self) -> Result<Option<TurnTicket>, SessionError> {
        if !self.is_active() {
            return Err(SessionError::Inactive(self.session_id.clone()));
        }
        let mut state = self.state();
        if state.turn_in_flight.is_some() {
            return Err(SessionError::TurnInProgress(self.session_id.clone()));
        }
        if state.buffer.is_empty() {
            return Ok(None);
        }

        let audio = state.buffer.take();
        state.next_turn_id += 1;
        let turn_id = state.next_turn_id;
        state.turn_in_flight = Some(turn_id);
        state.turns_started += 1;
        Ok(Some(TurnTicket { turn_id, audio }))
    }

    /// Attach the pipeline task and its watchdog to `turn_id`.
    ///
    /// If that turn already finished the watchdog is cancelled straight away.
    /// On a stopped session the pipeline keeps running but nothing times it.
    pub fn arm_turn(&self, turn_id: u64, run: JoinHandle<()>, watchdog: JoinHandle<()>) {
        let mut state = self.state();
        if state.turn_in_flight != Some(turn_id) {
            watchdog.abort();
            return;
        }
        state.running = Some(run);
        if self.is_active() {
            if let Some(previous) = state.pending_timer.replace(watchdog) {
                previous.abort();
            }
        } else {
            watchdog.abort();
        }
    }

    /// Release the turn slot after delivery and start the next utterance clean.
    ///
    /// Returns false when the slot had already been released by the watchdog.
    pub fn complete_turn(&self, turn_id: u64) -> bool {
        let mut state = self.state();
        if state.turn_in_flight != Some(turn_id) {
            return false;
        }
        state.turn_in_flight = None;
        state.text_offset = 0;
        state.last_text.clear();
        // Called from the pipeline task itself, so detach rather than abort
        state.running = None;
        if let Some(timer) = state.pending_timer.take() {
            timer.abort();
        }
        true
    }

    /// Called by the watchdog: abort a pipeline that never finished and
    /// release its slot.
    pub fn expire_turn(&self, turn_id: u64) -> bool {
        let mut state = self.state();
        if state.turn_in_flight != Some(turn_id) {
            return false;
        }
        state.turn_in_flight = None;
        state.text_offset = 0;
        state.last_text.clear();
        if let Some(run) = state.running.take() {
            run.abort();
        }
        // The watchdog is the task running this call, so just detach it
        state.pending_timer = None;
        true
    }

    pub fn turn_in_flight(&self) -> bool {
        self.state().turn_in_flight.is_some()
    }

    /// Record a transcript for the current utterance. Returns true if it grew.
    pub fn record_transcript(&self, text: &str) -> bool {
        let mut state = self.state();
        if text.len() <= state.text_offset {
            return false;
        }
        state.text_offset = text.len();
        state.last_text = text.to_string();
        true
    }

    pub fn last_text(&self) -> String {
        self.state().last_text.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        SessionSnapshot {
            session_id: self.session_id.clone(),
            is_active: self.is_active(),
            user_id: self.user_id,
            character_id: self.character_id,
            character_name: self.persona.name.clone(),
            buffered_bytes: state.buffer.len(),
            total_audio_bytes: state.total_audio_bytes,
            turns_started: state.turns_started,
            turn_in_flight: state.turn_in_flight.is_some(),
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("character_id", &self.character_id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Registry of live call sessions, keyed by the caller-supplied session id.
///
/// ## Thread Safety:
/// The map lock is held only while the map itself is read or changed, so one
/// call's audio or pipeline work never waits on another call.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<CallSession>>>,
    max_concurrent_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions,
        }
    }

    /// Create a session, or return the live one with the same id.
    ///
    /// ## Returns:
    /// - **Ok((session, false))**: A new session was registered
    /// - **Ok((session, true))**: The id was already active; the existing session is returned
    /// - **Err(...)**: Capacity reached, or the id belongs to another user
    pub fn create(
        &self,
        session_id: &str,
        user_id: i64,
        character_id: i64,
        persona: Arc<Persona>,
    ) -> Result<(Arc<CallSession>, bool), SessionError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = sessions.get(session_id) {
            if existing.is_active() {
                if existing.user_id != user_id {
                    return Err(SessionError::OwnedByAnotherUser(session_id.to_string()));
                }
                return Ok((Arc::clone(existing), true));
            }
        }

        let live = sessions
            .iter()
            .filter(|(id, s)| s.is_active() && id.as_str() != session_id)
            .count();
        if live >= self.max_concurrent_sessions {
            return Err(SessionError::CapacityReached(self.max_concurrent_sessions));
        }

        let session = Arc::new(CallSession::new(session_id, user_id, character_id, persona));
        sessions.insert(session_id.to_string(), Arc::clone(&session));
        Ok((session, false))
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<CallSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Look up a session that must still be active.
    pub fn get_active(&self, session_id: &str) -> Result<Arc<CallSession>, SessionError> {
        let session = self
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if !session.is_active() {
            return Err(SessionError::Inactive(session_id.to_string()));
        }
        Ok(session)
    }

    /// Deregister and deactivate a session.
    ///
    /// Only the first call for a given registration returns the session.
    pub fn remove(&self, session_id: &str) -> Option<Arc<CallSession>> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        if let Some(session) = &removed {
            session.deactivate();
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.is_active())
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.max_concurrent_sessions
    }
}
