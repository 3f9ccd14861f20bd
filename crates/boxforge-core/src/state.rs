use boxforge_schema::{BuildConfig, ContainerConfig, ImageId};

/// Everything the pipeline carries from one step to the next.
///
/// `resulting_image` only moves forward on a successful commit, cache hit,
/// fetch, or import. A failed step leaves it untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildState {
    pub resulting_image: Option<ImageId>,
    pub use_cache: bool,
    pub tty: bool,
    pub stdin: bool,
    pub config: BuildConfig,
}

impl Default for BuildState {
    fn default() -> Self {
        Self {
            resulting_image: None,
            use_cache: true,
            tty: false,
            stdin: false,
            config: BuildConfig::default(),
        }
    }
}

impl BuildState {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Engine config for a container on top of the current image.
    pub fn container_config(&self) -> ContainerConfig {
        let image = self.resulting_image.as_ref().map_or("", ImageId::as_str);
        self.config.to_container_config(image, self.tty, self.stdin)
    }
}
