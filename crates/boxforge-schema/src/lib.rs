//! Build configuration and wire schema for boxforge.
//!
//! This crate defines the data the executor exchanges with a container engine:
//! the mutable build configuration (`BuildConfig`) and its two conversions into
//! an engine container config (`ContainerConfig`) and a minimal image config
//! blob (`ImageSpec`), the index documents of a loadable image archive, and the
//! string newtypes used for image ids, container ids, and cache fingerprints.

pub mod archive;
pub mod config;
pub mod container;
pub mod image;
pub mod types;

pub use archive::{
    config_member, layer_member, manifest_for, repositories_for, ManifestEntry, Repositories,
    MANIFEST, REPOSITORIES,
};
pub use config::{normalize_port, BuildConfig};
pub use container::{ContainerConfig, EmptyObject};
pub use image::{host_architecture, History, ImageSpec, RootFs};
pub use types::{ContainerId, Fingerprint, ImageId};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid port specification: '{0}'")]
    InvalidPort(String),
    #[error("invalid environment entry: '{0}'")]
    InvalidEnv(String),
}
