//! Build step executor for boxforge.
//!
//! The [`Executor`] drives one container engine through a sequential build:
//! it looks up cached layers by fingerprint, runs steps in ephemeral
//! containers and commits them as new layers, imports minimal image archives
//! directly, and fetches base images. Every step owns its container, its
//! helper threads, and its signal subscription; all of them are released on
//! every exit path before the step returns.

pub mod archive;
pub mod cache;
pub mod executor;
pub mod fetch;
pub mod host;
pub mod lifecycle;
pub mod options;
pub mod run;
pub mod signals;
pub mod state;
pub mod stream;

pub use archive::{scan_import_response, write_image_archive};
pub use executor::Executor;
pub use host::{HostIo, ProcessIo, RawModeGuard};
pub use lifecycle::{destroy_container, ContainerGuard, StepHook};
pub use options::ExecutorOptions;
pub use signals::{SignalDispatcher, Subscription};
pub use state::BuildState;
pub use stream::{copy_until_stopped, demultiplex};

use boxforge_engine::EngineError;
use boxforge_schema::{ContainerId, SchemaError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("could not attach to container {container}: {source}")]
    Attach {
        container: ContainerId,
        source: EngineError,
    },
    #[error("could not start container {container}: {source}")]
    Start {
        container: ContainerId,
        source: EngineError,
    },
    #[error("could not commit container {container}: {source}")]
    Commit {
        container: ContainerId,
        source: EngineError,
    },
    #[error("could not remove intermediate container {container}: {source}")]
    RemoveIntermediate {
        container: ContainerId,
        source: EngineError,
    },
    #[error("waiting on container {container} failed: {source}")]
    Wait {
        container: ContainerId,
        source: EngineError,
    },
    #[error("command exited with status {code} for container {container}")]
    NonZeroExit { code: i64, container: ContainerId },
    #[error("image import failed: {0}")]
    ArchiveImport(String),
    #[error("pull failed: {0}")]
    Pull(String),
    #[error("interrupted while running container {container}")]
    Interrupted { container: ContainerId },
    #[error("container stream error: {0}")]
    Stream(std::io::Error),
    #[error("terminal error: {0}")]
    Terminal(std::io::Error),
    #[error("no image has been built yet")]
    NoImage,
    #[error("file not found in container: {0}")]
    FileNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
