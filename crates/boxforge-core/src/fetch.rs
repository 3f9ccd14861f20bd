use crate::executor::Executor;
use crate::ExecError;
use boxforge_engine::{EngineError, JsonMessage};
use boxforge_schema::ImageId;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::time::Duration;
use tracing::info;

impl Executor {
    /// Resolve `reference` to a local image, pulling it if the engine does
    /// not have it. The image's recorded configuration is adopted and it
    /// becomes the resulting image.
    pub fn fetch(&mut self, reference: &str) -> Result<ImageId, ExecError> {
        let record = match self.engine.inspect_image(reference) {
            Ok(record) => record,
            Err(EngineError::NotFound(_)) => {
                self.pull(reference)?;
                self.engine.inspect_image(reference)?
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(config) = &record.config {
            self.state.config.merge_container_config(config);
        }
        info!("using image {} for '{reference}'", record.id.short());
        self.state.resulting_image = Some(record.id.clone());
        Ok(record.id)
    }

    fn pull(&self, reference: &str) -> Result<(), ExecError> {
        info!("pulling {reference}");
        let progress = self.engine.pull_image(reference)?;
        if self.state.tty {
            return show_progress(progress, PullDisplay::new(reference), reference);
        }

        let mut out = self.host.stdout();
        write!(out, "+++ Pulling {reference:?}...")?;
        out.flush()?;
        drain_progress(progress)?;
        writeln!(out, "done.")?;
        Ok(())
    }
}

/// The next message of a pull stream; an error message fails the pull.
fn next_message(line: &str) -> Result<Option<JsonMessage>, ExecError> {
    match JsonMessage::parse(line) {
        Some(Ok(msg)) => match msg.error_message() {
            Some(err) => Err(ExecError::Pull(err.to_owned())),
            None => Ok(Some(msg)),
        },
        _ => Ok(None),
    }
}

fn drain_progress(progress: impl Read) -> Result<(), ExecError> {
    for line in BufReader::new(progress).lines() {
        next_message(&line?)?;
    }
    Ok(())
}

/// Status text of one message, e.g. `Downloading [==>   ] 1MB/3MB`.
fn progress_text(msg: &JsonMessage) -> Option<String> {
    let status = msg.status.as_deref()?;
    Some(match msg.progress.as_deref() {
        Some(progress) if !progress.is_empty() => format!("{status} {progress}"),
        _ => status.to_owned(),
    })
}

/// Live progress: one line per layer, plus a status line for messages that
/// are not about a layer.
struct PullDisplay {
    multi: MultiProgress,
    status: ProgressBar,
    layer_style: ProgressStyle,
    layers: HashMap<String, ProgressBar>,
}

impl PullDisplay {
    fn new(reference: &str) -> Self {
        Self::on(MultiProgress::new(), reference)
    }

    fn on(multi: MultiProgress, reference: &str) -> Self {
        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .expect("valid template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        status.set_message(format!("pulling {reference}"));
        status.enable_steady_tick(Duration::from_millis(80));
        Self {
            multi,
            status,
            layer_style: ProgressStyle::with_template("  {prefix:.bold} {msg}")
                .expect("valid template"),
            layers: HashMap::new(),
        }
    }

    fn update(&mut self, msg: &JsonMessage) {
        let Some(text) = progress_text(msg) else {
            return;
        };
        let Some(id) = msg.id.as_deref().filter(|id| !id.is_empty()) else {
            self.status.set_message(text);
            return;
        };
        let bar = self.layers.entry(id.to_owned()).or_insert_with(|| {
            let bar = self
                .multi
                .insert_before(&self.status, ProgressBar::new_spinner());
            bar.set_style(self.layer_style.clone());
            bar.set_prefix(id.to_owned());
            bar
        });
        bar.set_message(text);
    }

    fn finish(self, outcome: Result<&str, &ExecError>) {
        for bar in self.layers.values() {
            bar.finish();
        }
        self.status
            .set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
        match outcome {
            Ok(reference) => self
                .status
                .finish_with_message(format!("✓ pulled {reference}")),
            Err(e) => self.status.abandon_with_message(format!("✗ {e}")),
        }
    }
}

fn show_progress(
    progress: impl Read,
    mut display: PullDisplay,
    reference: &str,
) -> Result<(), ExecError> {
    let result = render_lines(progress, &mut display);
    display.finish(result.as_ref().map(|()| reference));
    result
}

fn render_lines(progress: impl Read, display: &mut PullDisplay) -> Result<(), ExecError> {
    for line in BufReader::new(progress).lines() {
        if let Some(msg) = next_message(&line?)? {
            display.update(&msg);
        }
    }
    Ok(())
}
