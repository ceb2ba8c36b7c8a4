//! In-memory character and conversation stores.
//!
//! Character management and durable persistence belong to other services;
//! these implementations keep the voice-call service runnable on its own and
//! double as the stores used in tests.

use super::{CharacterStore, ConversationStore, StoreError};
use crate::models::{Character, ConversationTurn};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Character store seeded with the built-in cast.
pub struct InMemoryCharacterStore {
    characters: RwLock<HashMap<i64, Character>>,
}

impl InMemoryCharacterStore {
    pub fn new(characters: impl IntoIterator<Item = Character>) -> Self {
        Self {
            characters: RwLock::new(characters.into_iter().map(|c| (c.id, c)).collect()),
        }
    }

    pub fn with_builtin_characters() -> Self {
        Self::new(builtin_characters())
    }
}

#[async_trait]
impl CharacterStore for InMemoryCharacterStore {
    async fn load_character(&self, character_id: i64) -> Result<Character, StoreError> {
        self.characters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&character_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("character {}", character_id)))
    }
}

/// Turns grouped by (user, character), oldest first.
#[derive(Default)]
pub struct InMemoryConversationStore {
    turns: RwLock<HashMap<(i64, i64), Vec<ConversationTurn>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a turn directly, e.g. to seed history.
    pub fn insert(&self, turn: ConversationTurn) {
        self.turns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((turn.user_id, turn.character_id))
            .or_default()
            .push(turn);
    }

    pub fn turn_count(&self, user_id: i64, character_id: i64) -> usize {
        self.turns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(user_id, character_id))
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load_history(
        &self,
        user_id: i64,
        character_id: i64,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        let turns = self.turns.read().unwrap_or_else(PoisonError::into_inner);
        Ok(turns
            .get(&(user_id, character_id))
            .map(|history| history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn save_turn(&self, turn: ConversationTurn) -> Result<(), StoreError> {
        self.insert(turn);
        Ok(())
    }
}

pub fn builtin_characters() -> Vec<Character> {
    vec![
        Character {
            id: 1,
            name: "Lin Daiyu".to_string(),
            persona_prompt: "You are Lin Daiyu from Dream of the Red Chamber: gifted at poetry, \
                             sensitive and quick-witted, gentle but a little melancholy. You speak \
                             with classical elegance and notice small feelings others miss."
                .to_string(),
        },
        Character {
            id: 2,
            name: "Sun Wukong".to_string(),
            persona_prompt: "You are Sun Wukong, the Monkey King from Journey to the West: bold, \
                             mischievous, fiercely loyal and endlessly confident. You call yourself \
                             'this old monkey' and love boasting about your seventy-two transformations."
                .to_string(),
        },
        Character {
            id: 3,
            name: "Li Bai".to_string(),
            persona_prompt: "You are Li Bai, the Tang dynasty poet: free-spirited, romantic, fond of \
                             wine and moonlight. You weave vivid imagery into everyday conversation."
                .to_string(),
        },
        Character {
            id: 4,
            name: "Hermione Granger".to_string(),
            persona_prompt: "You are Hermione Granger from Hogwarts: brilliant, hard-working and kind, \
                             a little bossy about rules and homework, always ready with a fact or a spell."
                .to_string(),
        },
    ]
}
