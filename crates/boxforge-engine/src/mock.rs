use crate::engine::{frame, Attachment, ByteStream, Engine, ImageRecord, ImageSummary};
use crate::EngineError;
use boxforge_schema::{ContainerConfig, ContainerId, ImageId, ManifestEntry, MANIFEST};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Cursor, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(5);

/// Engine operations that can be made to fail once via
/// [`MockEngine::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Create,
    Start,
    Commit,
    Remove,
    Inspect,
    List,
    Pull,
    Tag,
    Load,
    Attach,
    Wait,
    Copy,
}

/// What a started container prints and how it ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunScript {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
    /// Keep running until removed.
    pub hang: bool,
    /// Send output without stream headers even when there is no tty.
    pub unframed: bool,
}

impl RunScript {
    pub fn output(stdout: &str) -> Self {
        Self {
            stdout: stdout.as_bytes().to_vec(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = stderr.as_bytes().to_vec();
        self
    }

    #[must_use]
    pub fn exit(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    #[must_use]
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    #[must_use]
    pub fn unframed(mut self) -> Self {
        self.unframed = true;
        self
    }
}

struct MockContainer {
    config: ContainerConfig,
    running: bool,
    exit_code: Option<i64>,
    output: Option<Sender<Vec<u8>>>,
}

#[derive(Default)]
struct MockState {
    counter: u64,
    images: Vec<ImageRecord>,
    remote: HashMap<String, ContainerConfig>,
    containers: HashMap<String, MockContainer>,
    files: HashMap<String, Vec<u8>>,
    default_script: RunScript,
    scripts: VecDeque<RunScript>,
    failures: Vec<MockOp>,
    load_response: Option<String>,
    loaded: Vec<Vec<u8>>,
    created: Vec<ContainerConfig>,
    removals: Vec<(String, bool)>,
    pulls: Vec<String>,
}

impl MockState {
    fn next_id(&mut self, kind: &str) -> String {
        self.counter += 1;
        blake3::hash(format!("mock-{kind}:{}", self.counter).as_bytes())
            .to_hex()
            .to_string()
    }

    fn check(&mut self, op: MockOp) -> Result<(), EngineError> {
        match self.failures.iter().position(|f| *f == op) {
            Some(pos) => {
                self.failures.remove(pos);
                Err(EngineError::Api {
                    status: 500,
                    message: format!("injected {op:?} failure"),
                })
            }
            None => Ok(()),
        }
    }

    fn find_image(&self, reference: &str) -> Option<usize> {
        let latest = format!("{reference}:latest");
        self.images.iter().position(|img| {
            img.id == reference
                || img.repo_tags.as_ref().is_some_and(|tags| {
                    tags.iter().any(|t| *t == reference || *t == latest)
                })
        })
    }

    fn container(&mut self, id: &str) -> Result<&mut MockContainer, EngineError> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))
    }

    fn register(&mut self, parent: &str, comment: &str, config: Option<ContainerConfig>) -> ImageId {
        let id = ImageId::new(format!("sha256:{}", self.next_id("image")));
        self.images.push(ImageRecord {
            id: id.clone(),
            parent_id: parent.to_owned(),
            comment: comment.to_owned(),
            config,
            repo_tags: None,
        });
        id
    }

    fn retag(&mut self, index: usize, tag: String) {
        for img in &mut self.images {
            if let Some(tags) = img.repo_tags.as_mut() {
                tags.retain(|t| *t != tag);
            }
        }
        self.images[index]
            .repo_tags
            .get_or_insert_with(Vec::new)
            .push(tag);
    }
}

/// In-memory engine for tests.
///
/// Images keep insertion order, so listings are deterministic. Started
/// containers replay a [`RunScript`] through their attach stream, framed
/// unless the container has a tty.
pub struct MockEngine {
    state: Mutex<MockState>,
    stdin: Arc<Mutex<Vec<u8>>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            stdin: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call of `op` fail with a server error.
    pub fn fail_next(&self, op: MockOp) {
        self.state().failures.push(op);
    }

    /// Script used by every start without a queued script.
    pub fn set_run_script(&self, script: RunScript) {
        self.state().default_script = script;
    }

    /// Script for the next start only.
    pub fn queue_run_script(&self, script: RunScript) {
        self.state().scripts.push_back(script);
    }

    /// Replace the result stream of every subsequent load.
    pub fn set_load_response(&self, response: &str) {
        self.state().load_response = Some(response.to_owned());
    }

    pub fn add_image(&self, parent: &str, comment: &str, config: ContainerConfig) -> ImageId {
        self.state().register(parent, comment, Some(config))
    }

    pub fn add_tagged_image(&self, reference: &str, config: ContainerConfig) -> ImageId {
        let mut state = self.state();
        let id = state.register("", "", Some(config));
        let index = state.images.len() - 1;
        state.retag(index, reference.to_owned());
        id
    }

    /// Make `reference` available to pulls.
    pub fn add_remote_image(&self, reference: &str, config: ContainerConfig) {
        self.state().remote.insert(reference.to_owned(), config);
    }

    /// Content served for `path` by archive copies out of any container.
    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.state().files.insert(path.to_owned(), content.to_vec());
    }

    pub fn images(&self) -> Vec<ImageRecord> {
        self.state().images.clone()
    }

    pub fn live_containers(&self) -> Vec<ContainerId> {
        self.state()
            .containers
            .keys()
            .map(|id| ContainerId::new(id.as_str()))
            .collect()
    }

    pub fn container_exists(&self, id: &str) -> bool {
        self.state().containers.contains_key(id)
    }

    pub fn created_configs(&self) -> Vec<ContainerConfig> {
        self.state().created.clone()
    }

    /// Every removal attempt as `(id, force)`, failed ones included.
    pub fn remove_calls(&self) -> Vec<(String, bool)> {
        self.state().removals.clone()
    }

    pub fn loaded_archives(&self) -> Vec<Vec<u8>> {
        self.state().loaded.clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state().pulls.clone()
    }

    /// Bytes written to any container's input.
    pub fn stdin_received(&self) -> Vec<u8> {
        self.stdin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn create_container(&self, config: &ContainerConfig) -> Result<ContainerId, EngineError> {
        let mut state = self.state();
        state.check(MockOp::Create)?;
        if state.find_image(&config.image).is_none() {
            return Err(EngineError::NotFound(format!(
                "No such image: {}",
                config.image
            )));
        }
        let id = state.next_id("container");
        state.created.push(config.clone());
        state.containers.insert(
            id.clone(),
            MockContainer {
                config: config.clone(),
                running: false,
                exit_code: None,
                output: None,
            },
        );
        Ok(ContainerId::new(id))
    }

    fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        state.check(MockOp::Start)?;
        if state.container(id)?.running {
            return Ok(());
        }
        let script = state
            .scripts
            .pop_front()
            .unwrap_or_else(|| state.default_script.clone());

        let container = state.container(id)?;
        container.running = true;
        if let Some(output) = &container.output {
            let tty = container.config.tty;
            for (stream, payload) in [(1, &script.stdout), (2, &script.stderr)] {
                if payload.is_empty() {
                    continue;
                }
                let chunk = if tty || script.unframed {
                    payload.clone()
                } else {
                    frame(stream, payload)
                };
                let _ = output.send(chunk);
            }
        }
        if !script.hang {
            container.output = None;
            container.running = false;
            container.exit_code = Some(script.exit_code);
        }
        Ok(())
    }

    fn commit_container(
        &self,
        id: &str,
        comment: &str,
        config: &ContainerConfig,
    ) -> Result<ImageId, EngineError> {
        let mut state = self.state();
        state.check(MockOp::Commit)?;
        let base = state.container(id)?.config.image.clone();
        let parent = state
            .find_image(&base)
            .map(|i| state.images[i].id.to_string())
            .unwrap_or_default();
        Ok(state.register(&parent, comment, Some(config.clone())))
    }

    fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let mut state = self.state();
        state.removals.push((id.to_owned(), force));
        state.check(MockOp::Remove)?;
        if state.container(id)?.running && !force {
            return Err(EngineError::Api {
                status: 409,
                message: format!("You cannot remove a running container {id}"),
            });
        }
        state.containers.remove(id);
        Ok(())
    }

    fn inspect_image(&self, reference: &str) -> Result<ImageRecord, EngineError> {
        let mut state = self.state();
        state.check(MockOp::Inspect)?;
        state
            .find_image(reference)
            .map(|i| state.images[i].clone())
            .ok_or_else(|| EngineError::NotFound(format!("No such image: {reference}")))
    }

    fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        let mut state = self.state();
        state.check(MockOp::List)?;
        Ok(state
            .images
            .iter()
            .map(|img| ImageSummary {
                id: img.id.clone(),
                parent_id: img.parent_id.clone(),
            })
            .collect())
    }

    fn pull_image(&self, reference: &str) -> Result<ByteStream, EngineError> {
        let mut state = self.state();
        state.check(MockOp::Pull)?;
        state.pulls.push(reference.to_owned());

        let Some(config) = state.remote.get(reference).cloned() else {
            let message = format!("pull access denied for {reference}, repository does not exist");
            let line = serde_json::json!({"errorDetail": {"message": message}, "error": message});
            return Ok(Box::new(Cursor::new(format!("{line}\n").into_bytes())));
        };

        let layer = state.next_id("layer")[..12].to_owned();
        let id = state.register("", "", Some(config));
        let index = state.images.len() - 1;
        state.retag(index, reference.to_owned());

        let lines = [
            serde_json::json!({"status": format!("Pulling from {reference}"), "id": "latest"}),
            serde_json::json!({"status": "Pulling fs layer", "id": layer.as_str()}),
            serde_json::json!({"status": "Downloading", "progressDetail": {"current": 512, "total": 1024}, "progress": "[=========>         ]     512B/1.024kB", "id": layer.as_str()}),
            serde_json::json!({"status": "Pull complete", "id": layer.as_str()}),
            serde_json::json!({"status": format!("Digest: {id}")}),
            serde_json::json!({"status": format!("Status: Downloaded newer image for {reference}")}),
        ];
        let body: String = lines.iter().map(|l| format!("{l}\r\n")).collect();
        Ok(Box::new(Cursor::new(body.into_bytes())))
    }

    fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        state.check(MockOp::Tag)?;
        let index = state
            .find_image(image)
            .ok_or_else(|| EngineError::NotFound(format!("No such image: {image}")))?;
        state.retag(index, format!("{repo}:{tag}"));
        Ok(())
    }

    fn load_image(&self, mut archive: ByteStream) -> Result<ByteStream, EngineError> {
        self.state().check(MockOp::Load)?;
        let mut content = Vec::new();
        archive.read_to_end(&mut content)?;

        let mut state = self.state();
        state.loaded.push(content.clone());
        if let Some(response) = state.load_response.clone() {
            return Ok(Box::new(Cursor::new(response.into_bytes())));
        }

        let line = match read_loadable(&content) {
            Ok((tag, config)) => {
                let id = state.register("", "", Some(config));
                let index = state.images.len() - 1;
                let tag = if tag.rsplit('/').next().is_some_and(|n| n.contains(':')) {
                    tag
                } else {
                    format!("{tag}:latest")
                };
                state.retag(index, tag.clone());
                tracing::debug!("mock engine loaded {tag} as {id}");
                serde_json::json!({"stream": format!("Loaded image: {tag}\n")})
            }
            Err(message) => serde_json::json!({"errorDetail": {"message": message}, "error": message}),
        };
        Ok(Box::new(Cursor::new(format!("{line}\n").into_bytes())))
    }

    fn attach_container(
        &self,
        id: &str,
        stdin: bool,
        stop: &CancellationToken,
    ) -> Result<Attachment, EngineError> {
        let mut state = self.state();
        state.check(MockOp::Attach)?;
        let (tx, rx) = mpsc::channel();
        state.container(id)?.output = Some(tx);

        let input: Option<Box<dyn Write + Send>> = if stdin {
            Some(Box::new(StdinSink {
                buf: Arc::clone(&self.stdin),
                stop: stop.clone(),
            }))
        } else {
            None
        };
        Ok(Attachment {
            output: Box::new(ChannelReader {
                rx,
                pending: Vec::new(),
                offset: 0,
                stop: stop.clone(),
            }),
            input,
        })
    }

    fn wait_container(&self, id: &str, cancel: &CancellationToken) -> Result<i64, EngineError> {
        self.state().check(MockOp::Wait)?;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if let Some(code) = self.state().container(id)?.exit_code {
                return Ok(code);
            }
            std::thread::sleep(POLL);
        }
    }

    fn copy_from_container(&self, id: &str, path: &str) -> Result<ByteStream, EngineError> {
        let mut state = self.state();
        state.check(MockOp::Copy)?;
        state.container(id)?;
        let content = state.files.get(path).cloned().ok_or_else(|| {
            EngineError::NotFound(format!("Could not find the file {path} in container {id}"))
        })?;

        let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_data(&mut header, name, content.as_slice())?;
        Ok(Box::new(Cursor::new(builder.into_inner()?)))
    }
}

/// Tag and container config of a save-format archive.
fn read_loadable(content: &[u8]) -> Result<(String, ContainerConfig), String> {
    let mut members = HashMap::new();
    let mut archive = tar::Archive::new(content);
    let entries = archive.entries().map_err(|e| e.to_string())?;
    for entry in entries {
        let mut entry = entry.map_err(|e| e.to_string())?;
        let name = entry
            .path()
            .map_err(|e| e.to_string())?
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(|e| e.to_string())?;
        members.insert(name, data);
    }

    let manifest = members
        .get(MANIFEST)
        .ok_or_else(|| format!("open {MANIFEST}: no such file or directory"))?;
    let manifest: Vec<ManifestEntry> =
        serde_json::from_slice(manifest).map_err(|e| e.to_string())?;
    let entry = manifest.first().ok_or("empty manifest")?;
    let blob = members
        .get(&entry.config)
        .ok_or_else(|| format!("open {}: no such file or directory", entry.config))?;
    let spec: serde_json::Value = serde_json::from_slice(blob).map_err(|e| e.to_string())?;
    let config = serde_json::from_value(spec["config"].clone()).map_err(|e| e.to_string())?;
    let tag = entry.repo_tags.first().cloned().unwrap_or_default();
    Ok((tag, config))
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
    stop: CancellationToken,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.offset < self.pending.len() {
                let n = buf.len().min(self.pending.len() - self.offset);
                buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }
            if self.stop.is_cancelled() {
                return Ok(0);
            }
            match self.rx.recv_timeout(POLL) {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
    }
}

struct StdinSink {
    buf: Arc<Mutex<Vec<u8>>>,
    stop: CancellationToken,
}

impl Write for StdinSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.stop.is_cancelled() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
