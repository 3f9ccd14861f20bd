//! Container engine adapters for boxforge.
//!
//! The executor drives exactly one engine through the [`Engine`] trait: a
//! blocking interface over create/start/commit/remove/inspect/list/pull/tag/
//! load/attach/wait/copy. [`docker::DockerEngine`] drives the Docker Engine
//! API through bollard over a Unix socket or TCP; [`mock::MockEngine`] keeps everything in
//! memory for tests.

pub mod config;
pub mod docker;
pub mod engine;
pub mod message;
pub mod mock;

pub use config::{EngineConfig, Endpoint};
pub use docker::DockerEngine;
pub use engine::{frame, Attachment, ByteStream, Engine, ImageRecord, ImageSummary};
pub use message::JsonMessage;
pub use mock::{MockEngine, MockOp, RunScript};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine client error: {0}")]
    Client(#[source] bollard::errors::Error),
    #[error("engine returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("wait failed: {0}")]
    Wait(String),
    #[error("engine protocol error: {0}")]
    Protocol(String),
    #[error("engine JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("engine config error: {0}")]
    Config(String),
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => Self::Api {
                status: status_code,
                message,
            },
            other => Self::Client(other),
        }
    }
}

impl EngineError {
    /// Conflict raised when a removal races another removal of the same
    /// container.
    pub fn is_removal_in_progress(&self) -> bool {
        matches!(self, Self::Api { status: 409, message } if message.contains("already in progress"))
    }
}
