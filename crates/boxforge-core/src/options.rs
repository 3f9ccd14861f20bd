use std::path::PathBuf;

/// Executor switches that do not belong to the build configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    pub use_cache: bool,
    pub tty: bool,
    pub stdin: bool,
    /// Mirror every imported archive to this file.
    pub archive_debug_path: Option<PathBuf>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            tty: false,
            stdin: false,
            archive_debug_path: None,
        }
    }
}

impl ExecutorOptions {
    /// Defaults adjusted by `BOXFORGE_NO_CACHE` and `BOXFORGE_ARCHIVE_DEBUG`.
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("BOXFORGE_NO_CACHE").ok().as_deref(),
            std::env::var("BOXFORGE_ARCHIVE_DEBUG").ok().as_deref(),
        )
    }

    fn from_vars(no_cache: Option<&str>, archive_debug: Option<&str>) -> Self {
        let no_cache = no_cache.is_some_and(|v| {
            matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
        });
        Self {
            use_cache: !no_cache,
            archive_debug_path: archive_debug
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            ..Self::default()
        }
    }
}
