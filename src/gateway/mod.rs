//! # Realtime Call Gateway
//!
//! Protocol-level handling of the realtime connection, independent of the
//! WebSocket actor that carries it (see `websocket.rs`).
//!
//! ## Key Components:
//! - **Messages**: Client and server envelopes (`messages`)
//! - **Controller**: What each client message does to sessions and turns (`controller`)
//! - **Hub**: Finds the live connection for a session when a turn finishes (`hub`)

pub mod controller; // Client message dispatch
pub mod hub; // Session id → connection routing
pub mod messages; // JSON envelopes

pub use controller::{CallController, Dispatch, SessionChange};
pub use hub::ConnectionHub;
pub use messages::{ClientEnvelope, ServerEnvelope, ServerEvent};
