use std::io;
use thiserror::Error;

use crate::types::{Event, Version};

#[derive(Error, Debug)]
pub enum EventideError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("model '{0}' is not writable outside the apply phase")]
    NotWritable(String),

    #[error("migration '{0}' failed: {1}")]
    Migration(String, String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("event {} failed", .0.v)]
    EventFailed(Box<Event>),

    #[error("giving up on event {0}")]
    GaveUp(Version),

    #[error("engine is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, EventideError>;

impl EventideError {
    /// The processed event carried by an `EventFailed` rejection, if any.
    ///
    /// Waiters for a version that committed with an error map receive the
    /// full event record; this is the accessor for it.
    pub fn failed_event(&self) -> Option<&Event> {
        match self {
            EventideError::EventFailed(event) => Some(event),
            _ => None,
        }
    }
}
