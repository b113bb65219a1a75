//! Domain types shared between triggers and the orchestrator.
//!
//! - Message: a delivered payload plus its return path
//! - Disposition/Settlement: the ack/nack outcome sent back to the source

pub mod message;

// Re-export commonly used types
pub use message::{Acker, Disposition, Message, Settlement};
