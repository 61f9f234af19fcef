//! Shared document and entity types for the trading orchestrator workspace.
//!
//! Every stage boundary parses into one of these typed records; message
//! payloads at the bus boundary remain schema-light JSON, but nothing past
//! that boundary shuttles untyped maps around.

pub mod entities;
pub mod guardrails;
pub mod message;
pub mod money;
pub mod plan;
pub mod stage;
pub mod ticker;

pub use entities::*;
pub use guardrails::*;
pub use message::*;
pub use money::{Micros, Shares, MICROS_SCALE};
pub use plan::*;
pub use stage::*;
pub use ticker::Ticker;
