use crate::config::{Endpoint, EngineConfig};
use crate::engine::{frame, Attachment, ByteStream, Engine, ImageRecord, ImageSummary};
use crate::EngineError;
use bollard::container::LogOutput;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerConfig as WireConfig, ContainerCreateBody, ContainerWaitResponse};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CommitContainerOptionsBuilder, CreateContainerOptions,
    CreateImageOptionsBuilder,
    DownloadFromContainerOptionsBuilder, ImportImageOptions, ListImagesOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, TagImageOptionsBuilder,
    WaitContainerOptions,
};
use bollard::{ClientVersion, Docker};
use boxforge_schema::{ContainerConfig, ContainerId, ImageId};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};
use std::pin::Pin;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const UPLOAD_CHUNK: usize = 32 * 1024;
const STREAM_BUFFER: usize = 16;

/// Docker Engine API client on top of bollard.
///
/// The adapter owns a small tokio runtime and exposes a blocking interface on
/// top of it; it must not be called from inside another async runtime.
/// Streaming responses are driven by tasks on that runtime and handed to the
/// caller as blocking readers, so helper threads can hold an attach stream
/// while the pipeline thread issues other requests.
pub struct DockerEngine {
    docker: Docker,
    runtime: Runtime,
}

impl DockerEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let endpoint = config.endpoint()?;
        let version = client_version(&config.api_version)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("boxforge-engine")
            .enable_all()
            .build()?;

        let docker = {
            let _entered = runtime.enter();
            match &endpoint {
                Endpoint::Unix(path) => Docker::connect_with_socket(
                    &path.to_string_lossy(),
                    config.timeout_secs,
                    &version,
                )?,
                Endpoint::Tcp(addr) => Docker::connect_with_http(
                    &format!("tcp://{addr}"),
                    config.timeout_secs,
                    &version,
                )?,
            }
        };
        debug!("engine endpoint {endpoint:?}, api {}", config.api_version);
        Ok(Self { docker, runtime })
    }

    pub fn from_env() -> Result<Self, EngineError> {
        Self::new(&EngineConfig::from_env())
    }

    fn reader(&self, rx: Chunks, stop: Option<CancellationToken>) -> ChunkReader {
        ChunkReader::new(rx, self.runtime.handle().clone(), stop)
    }
}

impl Engine for DockerEngine {
    fn name(&self) -> &str {
        "docker"
    }

    fn create_container(&self, config: &ContainerConfig) -> Result<ContainerId, EngineError> {
        let body: ContainerCreateBody = rewire(config)?;
        let created = self
            .runtime
            .block_on(self.docker.create_container(None::<CreateContainerOptions>, body))?;
        for warning in &created.warnings {
            warn!("engine: {warning}");
        }
        Ok(ContainerId::new(created.id))
    }

    fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.runtime
            .block_on(self.docker.start_container(id, None::<StartContainerOptions>))?;
        Ok(())
    }

    fn commit_container(
        &self,
        id: &str,
        comment: &str,
        config: &ContainerConfig,
    ) -> Result<ImageId, EngineError> {
        let options = CommitContainerOptionsBuilder::default()
            .container(id)
            .comment(comment)
            .build();
        let wire: WireConfig = rewire(config)?;
        let committed = self
            .runtime
            .block_on(self.docker.commit_container(options, wire))?;
        Ok(ImageId::new(committed.id))
    }

    fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveContainerOptionsBuilder::default().force(force).build();
        self.runtime
            .block_on(self.docker.remove_container(id, Some(options)))?;
        Ok(())
    }

    fn inspect_image(&self, reference: &str) -> Result<ImageRecord, EngineError> {
        let inspect = self.runtime.block_on(self.docker.inspect_image(reference))?;
        rewire(&inspect)
    }

    fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        let options = ListImagesOptionsBuilder::default().all(true).build();
        let images = self.runtime.block_on(self.docker.list_images(Some(options)))?;
        Ok(images
            .into_iter()
            .map(|img| ImageSummary {
                id: ImageId::new(img.id),
                parent_id: img.parent_id,
            })
            .collect())
    }

    fn pull_image(&self, reference: &str) -> Result<ByteStream, EngineError> {
        let (image, tag) = split_reference(reference);
        let mut options = CreateImageOptionsBuilder::default().from_image(image);
        if let Some(tag) = tag {
            options = options.tag(tag);
        }
        let options = options.build();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let docker = self.docker.clone();
        self.runtime.spawn(async move {
            forward_json(docker.create_image(Some(options), None, None), &tx).await;
        });
        Ok(Box::new(self.reader(rx, None)))
    }

    fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<(), EngineError> {
        let options = TagImageOptionsBuilder::default().repo(repo).tag(tag).build();
        self.runtime
            .block_on(self.docker.tag_image(image, Some(options)))?;
        Ok(())
    }

    fn load_image(&self, archive: ByteStream) -> Result<ByteStream, EngineError> {
        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
        self.runtime.spawn_blocking(move || {
            if let Err(e) = pump(archive, &tx) {
                warn!("image archive upload stopped: {e}");
            }
        });
        let (result_tx, result_rx) = mpsc::channel(STREAM_BUFFER);
        let docker = self.docker.clone();
        self.runtime.spawn(async move {
            let body = ReceiverStream::new(rx).map(Ok::<_, io::Error>);
            let result = docker.import_image_stream(ImportImageOptions::default(), body, None);
            forward_json(result, &result_tx).await;
        });
        Ok(Box::new(self.reader(result_rx, None)))
    }

    fn attach_container(
        &self,
        id: &str,
        stdin: bool,
        stop: &CancellationToken,
    ) -> Result<Attachment, EngineError> {
        let options = AttachContainerOptionsBuilder::default()
            .stream(true)
            .stdout(true)
            .stderr(true)
            .stdin(stdin)
            .build();
        let attached = self
            .runtime
            .block_on(self.docker.attach_container(id, Some(options)))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let output = attached.output;
        self.runtime.spawn(async move {
            forward(output.map(|item| item.map(reframe)), &tx).await;
        });

        let handle = self.runtime.handle().clone();
        let input: Option<Box<dyn Write + Send>> = if stdin {
            Some(Box::new(BlockingWriter {
                inner: attached.input,
                handle: handle.clone(),
                stop: stop.clone(),
            }))
        } else {
            None
        };
        Ok(Attachment {
            output: Box::new(self.reader(rx, Some(stop.clone()))),
            input,
        })
    }

    fn wait_container(&self, id: &str, cancel: &CancellationToken) -> Result<i64, EngineError> {
        self.runtime.block_on(async {
            let mut waiting = Box::pin(self.docker.wait_container(id, None::<WaitContainerOptions>));
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(EngineError::Cancelled),
                status = waiting.next() => exit_status(status),
            }
        })
    }

    fn copy_from_container(&self, id: &str, path: &str) -> Result<ByteStream, EngineError> {
        let options = DownloadFromContainerOptionsBuilder::default().path(path).build();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let docker = self.docker.clone();
        let id = id.to_owned();
        self.runtime.spawn(async move {
            forward(docker.download_from_container(&id, Some(options)), &tx).await;
        });

        // A missing path fails on the first chunk, before the caller reads.
        let mut reader = self.reader(rx, None);
        reader.prime()?;
        Ok(Box::new(reader))
    }
}

type Chunks = mpsc::Receiver<Result<Bytes, DockerError>>;

/// Pass chunks on until the stream ends, fails, or the reader goes away.
async fn forward<S>(chunks: S, tx: &mpsc::Sender<Result<Bytes, DockerError>>)
where
    S: Stream<Item = Result<Bytes, DockerError>>,
{
    let mut chunks = Box::pin(chunks);
    while let Some(item) = chunks.next().await {
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
}

/// Pass messages on as newline-delimited JSON. A failure ends the stream as
/// an `{"error": ...}` line.
async fn forward_json<S, T>(messages: S, tx: &mpsc::Sender<Result<Bytes, DockerError>>)
where
    S: Stream<Item = Result<T, DockerError>>,
    T: Serialize,
{
    let lines = messages.map(|item| {
        Ok::<_, DockerError>(item.map_or_else(|e| error_line(&e), |msg| json_line(&msg)))
    });
    forward(lines, tx).await;
}

/// `1.41` or `v1.41` as a bollard client version.
fn client_version(api_version: &str) -> Result<ClientVersion, EngineError> {
    let invalid = || EngineError::Config(format!("invalid engine API version '{api_version}'"));
    let (major, minor) = api_version
        .trim_start_matches('v')
        .split_once('.')
        .ok_or_else(invalid)?;
    Ok(ClientVersion {
        major_version: major.parse().map_err(|_| invalid())?,
        minor_version: minor.parse().map_err(|_| invalid())?,
    })
}

/// Convert between two types that share the engine's JSON wire format.
fn rewire<T: Serialize, U: DeserializeOwned>(value: &T) -> Result<U, EngineError> {
    Ok(serde_json::from_value(serde_json::to_value(value)?)?)
}

/// The exit code of a finished container. bollard reports non-zero codes
/// as errors; only an error message from the engine is a real failure.
fn exit_status(
    status: Option<Result<ContainerWaitResponse, DockerError>>,
) -> Result<i64, EngineError> {
    match status {
        Some(Ok(resp)) => {
            let message = resp.error.and_then(|e| e.message).unwrap_or_default();
            if message.is_empty() {
                Ok(resp.status_code)
            } else {
                Err(EngineError::Wait(message))
            }
        }
        Some(Err(DockerError::DockerContainerWaitError { error, code })) => {
            if error.is_empty() {
                Ok(code)
            } else {
                Err(EngineError::Wait(error))
            }
        }
        Some(Err(e)) => Err(e.into()),
        None => Err(EngineError::Protocol(
            "wait ended without an exit status".to_owned(),
        )),
    }
}

/// Attach output as the engine frames it on the wire: console output raw,
/// everything else behind an 8-byte stream header.
fn reframe(output: LogOutput) -> Bytes {
    match output {
        LogOutput::Console { message } => message,
        LogOutput::StdIn { message } => Bytes::from(frame(0, &message)),
        LogOutput::StdOut { message } => Bytes::from(frame(1, &message)),
        LogOutput::StdErr { message } => Bytes::from(frame(2, &message)),
    }
}

fn json_line<T: Serialize>(msg: &T) -> Bytes {
    let mut line = match serde_json::to_vec(msg) {
        Ok(line) => line,
        Err(e) => serde_json::json!({ "error": format!("unreadable engine message: {e}") })
            .to_string()
            .into_bytes(),
    };
    line.push(b'\n');
    Bytes::from(line)
}

fn error_line(err: &DockerError) -> Bytes {
    let message = match err {
        DockerError::DockerStreamError { error } => error.clone(),
        DockerError::DockerResponseServerError { message, .. } => message.clone(),
        other => other.to_string(),
    };
    let mut line = serde_json::json!({ "error": message }).to_string();
    line.push('\n');
    Bytes::from(line)
}

/// Split an image reference into the `fromImage`/`tag` pair the pull endpoint
/// expects. Untagged references pull `latest`; digests pass through whole.
fn split_reference(reference: &str) -> (&str, Option<&str>) {
    if reference.contains('@') {
        return (reference, None);
    }
    let name_start = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[name_start..].rfind(':') {
        Some(i) => (
            &reference[..name_start + i],
            Some(&reference[name_start + i + 1..]),
        ),
        None => (reference, Some("latest")),
    }
}

/// Feed a blocking reader into an upload channel.
fn pump(mut archive: ByteStream, tx: &mpsc::Sender<Bytes>) -> io::Result<()> {
    let mut buf = vec![0u8; UPLOAD_CHUNK];
    loop {
        match archive.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    return Err(io::ErrorKind::BrokenPipe.into());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Blocking view of a channel of byte chunks. With a stop token, reads report
/// end-of-stream once the token is cancelled.
struct ChunkReader {
    rx: Chunks,
    chunk: Bytes,
    handle: Handle,
    stop: Option<CancellationToken>,
}

impl ChunkReader {
    fn new(rx: Chunks, handle: Handle, stop: Option<CancellationToken>) -> Self {
        Self {
            rx,
            chunk: Bytes::new(),
            handle,
            stop,
        }
    }

    /// Wait for the first chunk so an engine error surfaces as itself rather
    /// than as an io error on the first read.
    fn prime(&mut self) -> Result<(), EngineError> {
        if let Some(chunk) = self.next_chunk() {
            self.chunk = chunk?;
        }
        Ok(())
    }

    fn next_chunk(&mut self) -> Option<Result<Bytes, DockerError>> {
        let Self {
            rx, handle, stop, ..
        } = self;
        match stop {
            Some(stop) => handle.block_on(async {
                tokio::select! {
                    biased;
                    () = stop.cancelled() => None,
                    chunk = rx.recv() => chunk,
                }
            }),
            None => rx.blocking_recv(),
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.chunk.is_empty() {
            match self.next_chunk() {
                Some(chunk) => self.chunk = chunk.map_err(io::Error::other)?,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len());
        buf[..n].copy_from_slice(&self.chunk.split_to(n));
        Ok(n)
    }
}

struct BlockingWriter {
    inner: Pin<Box<dyn AsyncWrite + Send>>,
    handle: Handle,
    stop: CancellationToken,
}

impl Write for BlockingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Self {
            inner,
            handle,
            stop,
        } = self;
        handle.block_on(async {
            tokio::select! {
                biased;
                () = stop.cancelled() => Err(io::ErrorKind::BrokenPipe.into()),
                written = inner.write(buf) => written,
            }
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        let Self { inner, handle, .. } = self;
        handle.block_on(inner.flush())
    }
}
