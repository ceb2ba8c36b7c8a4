//! Per-character speaking configuration.
//!
//! Greeting line, "couldn't hear you" fallback and voice selection are keyed
//! by character id, with a default profile for characters that have no
//! dedicated entry. A `Persona` is resolved once when a call starts and is
//! shared by every turn of that call.

use crate::models::{Character, VoiceProfile};
use std::collections::HashMap;

/// Everything the turn pipeline needs to speak as one character.
#[derive(Debug, Clone, PartialEq)]
pub struct Persona {
    pub character_id: i64,
    pub name: String,
    pub persona_prompt: String,
    pub greeting: String,
    pub noise_reply: String,
    pub voice: VoiceProfile,
}

#[derive(Debug, Clone)]
struct PersonaProfile {
    greeting: &'static str,
    noise_reply: &'static str,
    voice_type: &'static str,
    speed_ratio: f32,
}

const DEFAULT_NOISE_REPLY: &str =
    "Sorry, I couldn't hear you clearly. It might be a bit noisy where you are, could you say that again?";
const DEFAULT_VOICE: &str = "qiniu_zh_female_wwxkjx";

pub struct PersonaCatalog {
    profiles: HashMap<i64, PersonaProfile>,
}

impl Default for PersonaCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PersonaCatalog {
    pub fn builtin() -> Self {
        let profiles = [
            (
                1,
                PersonaProfile {
                    greeting: "Ah, you've come. I was just reading poems by the window. What brings you here today?",
                    noise_reply: "Forgive me, the wind is rustling the bamboo and I couldn't make out your words. Would you say it once more?",
                    voice_type: "qiniu_zh_female_wwxkjx",
                    speed_ratio: 0.9,
                },
            ),
            (
                2,
                PersonaProfile {
                    greeting: "Hey hey! This old monkey is here! What adventure are we off to today?",
                    noise_reply: "Eh? This old monkey's sharp ears didn't catch that! Say it again, louder!",
                    voice_type: "qiniu_zh_male_hlsnkk",
                    speed_ratio: 1.2,
                },
            ),
            (
                3,
                PersonaProfile {
                    greeting: "Welcome, friend! Pour a cup of wine and let us talk beneath the moon.",
                    noise_reply: "The breeze carried your voice away like a falling petal. Would you speak again?",
                    voice_type: "qiniu_zh_male_wncwxz",
                    speed_ratio: 1.0,
                },
            ),
            (
                4,
                PersonaProfile {
                    greeting: "Hello! I'm Hermione. I was just in the library, but I always have time for a chat.",
                    noise_reply: "Sorry, I didn't quite catch that. There seems to be some interference, could you repeat it?",
                    voice_type: "qiniu_zh_female_tmjxxy",
                    speed_ratio: 1.1,
                },
            ),
        ];
        Self { profiles: profiles.into_iter().collect() }
    }

    /// Build the persona for `character`, falling back to the default profile.
    pub fn resolve(&self, character: &Character) -> Persona {
        let (greeting, noise_reply, voice) = match self.profiles.get(&character.id) {
            Some(profile) => (
                profile.greeting.to_string(),
                profile.noise_reply.to_string(),
                VoiceProfile {
                    voice_type: profile.voice_type.to_string(),
                    speed_ratio: profile.speed_ratio,
                },
            ),
            None => (
                format!("Hello! I'm {}, it's lovely to talk with you!", character.name),
                DEFAULT_NOISE_REPLY.to_string(),
                VoiceProfile {
                    voice_type: DEFAULT_VOICE.to_string(),
                    speed_ratio: 1.0,
                },
            ),
        };

        Persona {
            character_id: character.id,
            name: character.name.clone(),
            persona_prompt: character.persona_prompt.clone(),
            greeting,
            noise_reply,
            voice,
        }
    }
}
