use crate::container::{ContainerConfig, EmptyObject};
use crate::image::{host_architecture, History, ImageSpec, RootFs};
use crate::SchemaError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Mutable configuration accumulated across build steps.
///
/// Steps adjust it (environment, command, working directory, ports) and the
/// executor stamps it onto every container it creates and every image it
/// commits or imports. Cache hits and fetches overwrite it with the config
/// recorded on the adopted image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// `KEY=value` entries, insertion ordered, one per key.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub user: String,
    /// Normalized `port/proto` entries.
    #[serde(default)]
    pub exposed_ports: BTreeSet<String>,
    #[serde(default)]
    pub volumes: BTreeSet<String>,
}

impl BuildConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, replacing an existing entry in place.
    pub fn set_env(&mut self, key: &str, value: &str) -> Result<(), SchemaError> {
        if key.is_empty() || key.contains('=') {
            return Err(SchemaError::InvalidEnv(key.to_owned()));
        }
        let entry = format!("{key}={value}");
        let prefix = format!("{key}=");
        match self.env.iter_mut().find(|e| e.starts_with(&prefix)) {
            Some(existing) => *existing = entry,
            None => self.env.push(entry),
        }
        Ok(())
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|e| {
            let (k, v) = e.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    pub fn expose(&mut self, port: &str) -> Result<(), SchemaError> {
        self.exposed_ports.insert(normalize_port(port)?);
        Ok(())
    }

    /// Engine container config for a container built from `image`.
    ///
    /// `stdin` opens and attaches the container's input; `tty` allocates a
    /// pseudo-terminal, which also means the output stream is not framed.
    pub fn to_container_config(&self, image: &str, tty: bool, stdin: bool) -> ContainerConfig {
        ContainerConfig {
            image: image.to_owned(),
            cmd: non_empty(&self.cmd),
            entrypoint: non_empty(&self.entrypoint),
            env: non_empty(&self.env),
            working_dir: self.workdir.clone(),
            user: self.user.clone(),
            exposed_ports: as_set(&self.exposed_ports),
            volumes: as_set(&self.volumes),
            tty,
            open_stdin: stdin,
            stdin_once: stdin,
            attach_stdin: stdin,
            attach_stdout: true,
            attach_stderr: true,
        }
    }

    /// Minimal image config blob for an image with no layer history beyond
    /// its own.
    pub fn to_image_spec(&self, created: DateTime<Utc>) -> ImageSpec {
        ImageSpec {
            architecture: host_architecture().to_owned(),
            os: "linux".to_owned(),
            created,
            config: self.to_container_config("", false, false),
            rootfs: RootFs {
                kind: "layers".to_owned(),
                diff_ids: Vec::new(),
            },
            history: vec![History {
                created,
                created_by: "boxforge import".to_owned(),
                comment: String::new(),
                empty_layer: true,
            }],
        }
    }

    /// Adopt the configuration recorded on an engine image.
    pub fn merge_container_config(&mut self, config: &ContainerConfig) {
        self.cmd = config.cmd.clone().unwrap_or_default();
        self.entrypoint = config.entrypoint.clone().unwrap_or_default();
        self.env = config.env.clone().unwrap_or_default();
        self.workdir.clone_from(&config.working_dir);
        self.user.clone_from(&config.user);
        self.exposed_ports = config
            .exposed_ports
            .as_ref()
            .map(|ports| ports.keys().cloned().collect())
            .unwrap_or_default();
        self.volumes = config
            .volumes
            .as_ref()
            .map(|vols| vols.keys().cloned().collect())
            .unwrap_or_default();
    }
}

/// Normalize `80`, `80/tcp`, `53/UDP` into engine `port/proto` form.
pub fn normalize_port(spec: &str) -> Result<String, SchemaError> {
    let spec = spec.trim();
    let (port, proto) = spec.split_once('/').unwrap_or((spec, "tcp"));
    let proto = proto.to_ascii_lowercase();
    if port.parse::<u16>().map_or(true, |p| p == 0) {
        return Err(SchemaError::InvalidPort(spec.to_owned()));
    }
    if !matches!(proto.as_str(), "tcp" | "udp" | "sctp") {
        return Err(SchemaError::InvalidPort(spec.to_owned()));
    }
    Ok(format!("{port}/{proto}"))
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

fn as_set(values: &BTreeSet<String>) -> Option<BTreeMap<String, EmptyObject>> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().map(|v| (v.clone(), EmptyObject {})).collect())
    }
}
