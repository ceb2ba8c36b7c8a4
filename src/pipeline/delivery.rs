//! Result hand-off from the turn pipeline back to whoever owns the connection.

/// Outcome of one turn, addressed to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Reply {
        session_id: String,
        user_text: String,
        ai_text: String,
        audio: Vec<u8>,
        /// True when the canned "couldn't hear you" line was used
        fallback: bool,
    },
    Failed {
        session_id: String,
        message: String,
        /// Generated text, when only synthesis failed
        ai_text: Option<String>,
    },
}

impl TurnEvent {
    pub fn session_id(&self) -> &str {
        match self {
            TurnEvent::Reply { session_id, .. } | TurnEvent::Failed { session_id, .. } => session_id,
        }
    }
}

/// Receives turn results. Delivery is best-effort: a sink whose connection
/// has gone away drops the event.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, event: TurnEvent);
}
