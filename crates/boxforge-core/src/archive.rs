//! Direct image import from a minimal save-format archive.

use crate::executor::Executor;
use crate::ExecError;
use boxforge_engine::JsonMessage;
use boxforge_schema::{config_member, manifest_for, repositories_for, ImageId, ImageSpec};
use boxforge_schema::{MANIFEST, REPOSITORIES};
use chrono::Utc;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use tracing::{debug, info, warn};

/// Write the three archive members for image `id`: the config blob, the
/// repository index, and the manifest, in that order. Each member is fully
/// serialized before its header is written, so the header carries its exact
/// size.
pub fn write_image_archive<W: Write>(dst: W, id: &str, spec: &ImageSpec) -> Result<W, ExecError> {
    let members = [
        (config_member(id), serde_json::to_vec(spec)?),
        (REPOSITORIES.to_owned(), serde_json::to_vec(&repositories_for(id))?),
        (MANIFEST.to_owned(), serde_json::to_vec(&manifest_for(id))?),
    ];
    let mtime = u64::try_from(spec.created.timestamp()).unwrap_or(0);

    let mut builder = tar::Builder::new(dst);
    for (name, payload) in &members {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(payload.len() as u64);
        header.set_mode(0o666);
        header.set_uid(0);
        header.set_gid(0);
        header.set_username("root")?;
        header.set_groupname("root")?;
        header.set_mtime(mtime);
        builder.append_data(&mut header, name, payload.as_slice())?;
    }
    Ok(builder.into_inner()?)
}

/// Scan a load/import result stream. A line carrying an error fails the
/// import even when the transport succeeded. Lines that are not JSON are
/// skipped.
pub fn scan_import_response<R: Read>(response: R) -> Result<(), ExecError> {
    for line in BufReader::new(response).lines() {
        let line = line?;
        match JsonMessage::parse(&line) {
            Some(Ok(msg)) => {
                if let Some(err) = msg.error_message() {
                    return Err(ExecError::ArchiveImport(err.to_owned()));
                }
                if let Some(text) = msg.stream.as_deref().or(msg.status.as_deref()) {
                    debug!("import: {}", text.trim_end());
                }
            }
            Some(Err(_)) => debug!("skipping non-JSON import output: {line}"),
            None => {}
        }
    }
    Ok(())
}

/// Writer that mirrors everything written through it into a debug file.
/// A failing mirror is dropped without affecting the main stream.
struct DebugTee<W> {
    inner: W,
    copy: Option<File>,
}

impl<W: Write> Write for DebugTee<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if let Some(copy) = self.copy.as_mut() {
            if let Err(e) = copy.write_all(&buf[..n]) {
                warn!("archive debug copy failed: {e}");
                self.copy = None;
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Executor {
    /// Import an image archive for `id` built from the current configuration.
    ///
    /// The layer `content` is spooled to a temporary file that is removed on
    /// every path. The archive is streamed to the engine through a pipe while
    /// it is being written. On success `id` becomes the resulting image.
    ///
    /// The spooled layer is not embedded in the archive: the manifest names
    /// the layer member but only the three index members are sent.
    pub fn import(&mut self, id: &ImageId, mut content: impl Read) -> Result<(), ExecError> {
        let mut spool = tempfile::Builder::new()
            .prefix("boxforge-layer-")
            .tempfile()?;
        let spooled = io::copy(&mut content, spool.as_file_mut())?;
        debug!("spooled {spooled} bytes to {}", spool.path().display());

        let spec = self.state.config.to_image_spec(Utc::now());
        let copy = match &self.options.archive_debug_path {
            Some(path) => Some(File::create(path)?),
            None => None,
        };
        let (reader, writer) = io::pipe()?;
        let engine = &self.engine;

        let (loaded, produced) = std::thread::scope(|scope| {
            let producer = scope.spawn(move || -> Result<(), ExecError> {
                let tee = DebugTee {
                    inner: writer,
                    copy,
                };
                write_image_archive(tee, id, &spec)?.flush()?;
                Ok(())
            });
            let loaded = engine
                .load_image(Box::new(reader))
                .map_err(ExecError::from)
                .and_then(scan_import_response);
            let produced = producer.join().unwrap_or_else(|_| {
                Err(ExecError::ArchiveImport("archive writer panicked".to_owned()))
            });
            (loaded, produced)
        });
        loaded?;
        produced?;

        info!("imported image {id}");
        self.state.resulting_image = Some(id.clone());
        Ok(())
    }
}
