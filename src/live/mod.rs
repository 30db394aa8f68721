//! # Live Speech Service
//!
//! Client for the bidirectional streaming speech endpoint the agent runs on.
//!
//! ## Key Components:
//! - **Protocol**: setup / realtime input messages out, [`LiveEvent`]s in
//! - **Instruction**: the persona system instruction sent at setup
//! - **Connection**: the websocket transport and its reader/writer tasks

pub mod connection;
pub mod instruction;
pub mod protocol;

pub use connection::{ConnectionCloser, LiveConnection, LiveTransport, WebSocketTransport};
pub use protocol::{LiveEvent, SetupMessage};
