//! # Turn Pipeline
//!
//! Everything that happens between "the user stopped talking" and "the
//! character's reply is on its way back".
//!
//! ## Key Components:
//! - **Persona**: Greeting, noise reply and voice per character (`persona`)
//! - **Prompt**: History window, persona instructions, reply clean-up (`prompt`)
//! - **Orchestrator**: The per-turn state machine and its watchdog (`orchestrator`)
//! - **Delivery**: Where finished turns are sent (`delivery`)

pub mod delivery; // Turn results and the sink trait
pub mod orchestrator; // Recognition → generation → synthesis → persistence
pub mod persona; // Per-character speaking configuration
pub mod prompt; // Prompt assembly and reply clean-up

#[cfg(test)]
pub mod testing;

pub use delivery::{DeliverySink, TurnEvent};
pub use orchestrator::{PipelineSettings, TurnOrchestrator, TurnOutcome, TurnStage};
