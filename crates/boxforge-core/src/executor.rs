use crate::host::{HostIo, ProcessIo};
use crate::lifecycle::ContainerGuard;
use crate::options::ExecutorOptions;
use crate::signals::SignalDispatcher;
use crate::state::BuildState;
use crate::ExecError;
use boxforge_engine::{ByteStream, DockerEngine, Engine, EngineConfig};
use boxforge_schema::{BuildConfig, ImageId};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Runs build steps against one engine.
///
/// The executor owns the [`BuildState`]; every operation that moves the
/// resulting image takes `&mut self`. Step operations live next to the
/// concern they implement: [`check_cache`](Self::check_cache),
/// [`commit`](Self::commit), [`run_hook`](Self::run_hook),
/// [`import`](Self::import), and [`fetch`](Self::fetch).
pub struct Executor {
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) state: BuildState,
    pub(crate) options: ExecutorOptions,
    pub(crate) signals: SignalDispatcher,
    pub(crate) host: Arc<dyn HostIo>,
}

impl Executor {
    /// Executor on process stdio, listening to process signals.
    pub fn new(engine: Arc<dyn Engine>, options: ExecutorOptions) -> Self {
        let state = BuildState {
            use_cache: options.use_cache,
            tty: options.tty,
            stdin: options.stdin,
            ..BuildState::default()
        };
        Self {
            engine,
            state,
            options,
            signals: SignalDispatcher::global(),
            host: Arc::new(ProcessIo),
        }
    }

    /// Executor on the Docker endpoint named by the environment.
    pub fn connect(options: ExecutorOptions) -> Result<Self, ExecError> {
        let engine = DockerEngine::new(&EngineConfig::from_env())?;
        info!("connected to {} engine", engine.name());
        Ok(Self::new(Arc::new(engine), options))
    }

    #[must_use]
    pub fn with_signals(mut self, signals: SignalDispatcher) -> Self {
        self.signals = signals;
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: Arc<dyn HostIo>) -> Self {
        self.host = host;
        self
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn state(&self) -> &BuildState {
        &self.state
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub fn image_id(&self) -> Option<&ImageId> {
        self.state.resulting_image.as_ref()
    }

    /// Start the next step from an existing image.
    pub fn set_image_id(&mut self, id: ImageId) {
        self.state.resulting_image = Some(id);
    }

    pub fn set_use_cache(&mut self, use_cache: bool) {
        self.state.use_cache = use_cache;
    }

    pub fn set_tty(&mut self, tty: bool) {
        self.state.tty = tty;
    }

    pub fn set_stdin(&mut self, stdin: bool) {
        self.state.stdin = stdin;
    }

    pub fn load_config(&mut self, config: BuildConfig) {
        self.state.config = config;
    }

    pub fn config(&self) -> &BuildConfig {
        &self.state.config
    }

    pub fn config_mut(&mut self) -> &mut BuildConfig {
        &mut self.state.config
    }

    /// Tag the resulting image as `repo[:tag]`; the tag defaults to `latest`.
    pub fn tag(&self, reference: &str) -> Result<(), ExecError> {
        let image = self.state.resulting_image.as_ref().ok_or(ExecError::NoImage)?;
        let (repo, tag) = split_tag(reference);
        self.engine.tag_image(image, repo, tag)?;
        info!("tagged {} as {repo}:{tag}", image.short());
        Ok(())
    }

    /// Contents of one file from a throwaway container on the current image.
    pub fn copy_one_file_from_container(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        let guard = ContainerGuard::new(Arc::clone(&self.engine), self.create()?);

        let wanted = Path::new(path.trim_end_matches('/'))
            .file_name()
            .ok_or_else(|| ExecError::FileNotFound(path.to_owned()))?;
        let mut archive = tar::Archive::new(self.engine.copy_from_container(guard.id(), path)?);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.as_os_str() == wanted {
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                return Ok(content);
            }
        }
        Err(ExecError::FileNotFound(path.to_owned()))
    }

    /// Tar stream of `path` inside container `id`, as the engine sends it.
    pub fn copy_from_container(&self, id: &str, path: &str) -> Result<ByteStream, ExecError> {
        Ok(self.engine.copy_from_container(id, path)?)
    }
}

fn split_tag(reference: &str) -> (&str, &str) {
    let name_start = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[name_start..].rfind(':') {
        Some(i) => (
            &reference[..name_start + i],
            &reference[name_start + i + 1..],
        ),
        None => (reference, "latest"),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::host::RawModeGuard;
    use boxforge_engine::MockEngine;
    use std::io::{self, Cursor, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    pub struct CaptureIo {
        pub stdout: SharedBuf,
        pub stderr: SharedBuf,
        pub input: Vec<u8>,
        pub raw_entered: Arc<AtomicUsize>,
        pub raw_restored: Arc<AtomicUsize>,
    }

    impl HostIo for CaptureIo {
        fn stdin(&self) -> Box<dyn Read + Send> {
            Box::new(Cursor::new(self.input.clone()))
        }

        fn stdout(&self) -> Box<dyn Write + Send> {
            Box::new(self.stdout.clone())
        }

        fn stderr(&self) -> Box<dyn Write + Send> {
            Box::new(self.stderr.clone())
        }

        fn raw_mode(&self) -> io::Result<RawModeGuard> {
            self.raw_entered.fetch_add(1, Ordering::SeqCst);
            let restored = Arc::clone(&self.raw_restored);
            Ok(RawModeGuard::new(move || {
                restored.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    pub fn executor(engine: &Arc<MockEngine>) -> (Executor, CaptureIo) {
        let io = CaptureIo::default();
        let engine: Arc<dyn Engine> = Arc::clone(engine) as Arc<dyn Engine>;
        let exec = Executor::new(engine, ExecutorOptions::default())
            .with_signals(SignalDispatcher::new())
            .with_host(Arc::new(io.clone()));
        (exec, io)
    }
}
