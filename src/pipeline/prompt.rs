//! Prompt assembly and reply clean-up for voice turns.

use super::persona::Persona;
use crate::models::{ChatMessage, ConversationTurn};
use chrono::{DateTime, Duration, Utc};

/// Absence after which the character is asked to acknowledge the gap.
pub fn absence_threshold() -> Duration {
    Duration::days(1)
}

/// Build the messages for one generation request.
///
/// ## Parameters:
/// - `history_newest_first`: Prior turns as the store returns them
/// - `window`: How many of those turns to include
/// - `user_text`: What the user just said
/// - `now`: Reference time for the absence check
pub fn compose(
    persona: &Persona,
    history_newest_first: &[ConversationTurn],
    window: usize,
    user_text: &str,
    now: DateTime<Utc>,
) -> Vec<ChatMessage> {
    let mut system = format!(
        "You are {name}. Stay in character at all times and never mention being an AI.\n\n{prompt}\n\n\
         You are talking with the user on a voice call, so answer the way {name} would speak: \
         warm, natural and brief.",
        name = persona.name,
        prompt = persona.persona_prompt.trim(),
    );

    if let Some(latest) = history_newest_first.first() {
        let elapsed = now.signed_duration_since(latest.created_at);
        if elapsed > absence_threshold() {
            system.push_str(&format!(
                "\n\nIt has been {} day(s) since the user last talked with you. \
                 Acknowledge the time apart naturally, the way {} would, before carrying on.",
                elapsed.num_days(),
                persona.name
            ));
        }
    }

    let mut messages = vec![ChatMessage::system(system)];
    for turn in history_newest_first.iter().take(window).rev() {
        if !turn.user_text.trim().is_empty() {
            messages.push(ChatMessage::user(turn.user_text.trim()));
        }
        if !turn.ai_text.trim().is_empty() {
            messages.push(ChatMessage::assistant(turn.ai_text.trim()));
        }
    }
    messages.push(ChatMessage::user(user_text));
    messages
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bracket {
    Round,
    Square,
}

impl Bracket {
    fn opening(c: char) -> Option<Self> {
        match c {
            '(' | '（' => Some(Self::Round),
            '[' | '【' => Some(Self::Square),
            _ => None,
        }
    }

    fn closing(c: char) -> Option<Self> {
        match c {
            ')' | '）' => Some(Self::Round),
            ']' | '】' => Some(Self::Square),
            _ => None,
        }
    }
}

/// Strip stage directions from a generated reply so only speakable text is left.
///
/// Removes closed `(...)`, `（...）`, `[...]`, `【...】` and `*...*` spans, then
/// collapses whitespace. Unbalanced brackets and asterisks stay as text.
pub fn clean_reply(raw: &str) -> String {
    // An unpaired asterisk is punctuation, not a stage direction
    let strip_asterisks = raw.matches('*').count() % 2 == 0;
    let mut out = String::with_capacity(raw.len());
    // Offsets in `out` where still-open brackets were written
    let mut open: Vec<(usize, Bracket)> = Vec::new();
    let mut star: Option<usize> = None;

    for c in raw.chars() {
        if let Some(kind) = Bracket::opening(c) {
            open.push((out.len(), kind));
            out.push(c);
        } else if let Some(kind) = Bracket::closing(c) {
            match open.last() {
                Some(&(start, top)) if top == kind => {
                    open.pop();
                    out.truncate(start);
                    star = star.filter(|&offset| offset <= start);
                }
                _ => out.push(c),
            }
        } else if c == '*' && strip_asterisks {
            match star.take() {
                Some(start) => {
                    out.truncate(start);
                    open.retain(|&(offset, _)| offset < start);
                }
                None => star = Some(out.len()),
            }
        } else {
            out.push(c);
        }
    }
    if let Some(start) = star {
        out.insert(start, '*');
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
