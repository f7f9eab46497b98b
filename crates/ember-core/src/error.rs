//! Error types for the Ember inference engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The arena cannot satisfy a block allocation. The scheduler absorbs
    /// this (preempt and retry, or leave the request waiting); it is never
    /// surfaced to callers as a request failure.
    #[error("KV cache capacity exhausted: {0}")]
    NoCapacity(String),

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Engine is shut down")]
    Shutdown,

    #[error("Model execution failed: {0}")]
    ModelFailure(String),

    #[error("Block persistence failed: {0}")]
    Persistence(String),

    #[error("Tokenization error: {0}")]
    Tokenization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
