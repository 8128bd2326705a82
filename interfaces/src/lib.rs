//! Inter-Layer Interfaces Library
//!
//! This crate provides the message contracts and queues used between the eNodeB layers.

pub mod message_types;
pub mod msgq;

pub use message_types::{BearerRef, LayerMessage, RrcCommand};
pub use msgq::{message_queue, MessageReceiver, MessageSender};

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Message queue closed: {0}")]
    QueueClosed(String),
}
