//! Conversation turns: inbound message handling, streaming and
//! non-streaming reply generation, and the speech work tied to a reply.

pub mod events;
pub mod generator;
pub mod service;
pub mod speech_task;
pub mod streaming;

pub use events::{EventSink, EventWriter, SinkClosed};
pub use service::{TurnDeps, TurnReply, TurnRequest, TurnService};
pub use streaming::{StreamingTurn, TurnOutcome, TurnStatus};
