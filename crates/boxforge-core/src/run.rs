//! Interactive execution of a step's command inside its container.

use crate::executor::Executor;
use crate::host::RawModeGuard;
use crate::stream::{copy_until_stopped, demultiplex};
use crate::ExecError;
use boxforge_engine::{Attachment, EngineError};
use boxforge_schema::{ContainerId, Fingerprint};
use console::Style;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BEGIN_OUTPUT: &str = "------ BEGIN OUTPUT ------";
const END_OUTPUT: &str = "------- END OUTPUT -------";

/// First error reported by any helper; reporting it stops the others.
struct FirstError {
    slot: Mutex<Option<io::Error>>,
    stop: CancellationToken,
}

impl FirstError {
    fn new(stop: CancellationToken) -> Self {
        Self {
            slot: Mutex::new(None),
            stop,
        }
    }

    fn report(&self, err: io::Error) {
        if self.stop.is_cancelled() {
            debug!("ignoring stream error after stop: {err}");
            return;
        }
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.stop.cancel();
    }

    fn take(&self) -> Option<io::Error> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Executor {
    /// Run the container's command with its stdio wired to the host.
    ///
    /// Output is copied until the process exits; input is forwarded only
    /// when stdin is enabled, with the terminal in raw mode for the duration.
    /// An interrupt, or a copy error other than a clean end of stream, stops
    /// waiting early. All helper threads are joined before this returns.
    pub fn run_hook(&self, id: &ContainerId) -> Result<Option<Fingerprint>, ExecError> {
        let stdin = self.state.stdin;
        let tty = self.state.tty;
        let stop = CancellationToken::new();

        let Attachment { mut output, input } = self
            .engine
            .attach_container(id, stdin, &stop)
            .map_err(|source| ExecError::Attach {
                container: id.clone(),
                source,
            })?;
        debug!("attached to {} (tty={tty}, stdin={stdin})", id.short());

        let _terminal = if stdin {
            self.host.raw_mode().map_err(ExecError::Terminal)?
        } else {
            RawModeGuard::noop()
        };

        let errors = FirstError::new(stop.clone());
        let interrupted = Arc::new(AtomicBool::new(false));
        let _subscription = {
            let interrupted = Arc::clone(&interrupted);
            let stop = stop.clone();
            let mut notice = self.host.stderr();
            let short = id.short().to_owned();
            self.signals.subscribe(move || {
                interrupted.store(true, Ordering::SeqCst);
                let _ = write!(
                    notice,
                    "\r\n!!! interrupt received, stopping container {short}...\r\n"
                );
                let _ = notice.flush();
                stop.cancel();
            })
        };

        let (status, copied) = std::thread::scope(|scope| {
            let _stop_on_exit = stop.clone().drop_guard();

            if let Some(mut input) = input {
                let mut host_in = self.host.stdin();
                let (errors, stop) = (&errors, &stop);
                scope.spawn(move || {
                    match copy_until_stopped(&mut host_in, &mut input, stop) {
                        Ok(n) => debug!("forwarded {n} bytes of input"),
                        Err(e) => errors.report(e),
                    }
                    let _ = input.flush();
                });
            }

            if !stdin {
                self.marker(BEGIN_OUTPUT);
            }
            let copier = {
                let mut stdout = self.host.stdout();
                let mut stderr = self.host.stderr();
                let (errors, stop) = (&errors, &stop);
                scope.spawn(move || {
                    let copied = if tty {
                        copy_until_stopped(&mut output, &mut stdout, stop).map(drop)
                    } else {
                        demultiplex(&mut output, &mut stdout, &mut stderr, stop)
                    };
                    if let Err(e) = &copied {
                        errors.report(io::Error::new(e.kind(), e.to_string()));
                    }
                    copied
                })
            };

            self.engine
                .start_container(id)
                .map_err(|source| ExecError::Start {
                    container: id.clone(),
                    source,
                })?;

            let status = self.engine.wait_container(id, &stop);
            if status.is_err() {
                stop.cancel();
            }
            let copied = copier
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("output copy panicked")));
            Ok::<_, ExecError>((status, copied))
        })?;

        if interrupted.load(Ordering::SeqCst) {
            return Err(ExecError::Interrupted {
                container: id.clone(),
            });
        }
        match status {
            Ok(code) => {
                copied.map_err(ExecError::Stream)?;
                if !stdin {
                    self.marker(END_OUTPUT);
                }
                if code != 0 {
                    return Err(ExecError::NonZeroExit {
                        code,
                        container: id.clone(),
                    });
                }
                Ok(None)
            }
            Err(EngineError::Cancelled) => Err(ExecError::Stream(
                errors
                    .take()
                    .unwrap_or_else(|| io::Error::other("container output stopped")),
            )),
            Err(source) => Err(ExecError::Wait {
                container: id.clone(),
                source,
            }),
        }
    }

    fn marker(&self, text: &str) {
        let style = Style::new().red().bold().on_white();
        let mut out = self.host.stdout();
        let _ = writeln!(out, "{}", style.apply_to(text));
        let _ = out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::{executor, CaptureIo};
    use boxforge_engine::{MockEngine, MockOp, RunScript};
    use boxforge_schema::ContainerConfig;

    fn started(engine: &Arc<MockEngine>) -> (Executor, CaptureIo, ContainerId) {
        let base = engine.add_tagged_image("alpine", ContainerConfig::default());
        let (mut exec, io) = executor(engine);
        exec.set_image_id(base);
        let id = exec.create().unwrap();
        (exec, io, id)
    }

    #[test]
    fn zero_exit_prints_output_between_markers() {
        let engine = Arc::new(MockEngine::new());
        engine.set_run_script(RunScript::output("hi\n").with_stderr("warn\n"));
        let (exec, io, id) = started(&engine);

        assert!(exec.run_hook(&id).unwrap().is_none());
        let out = io.stdout.text();
        let begin = out.find(BEGIN_OUTPUT).unwrap();
        let hi = out.find("hi\n").unwrap();
        let end = out.find(END_OUTPUT).unwrap();
        assert!(begin < hi && hi < end);
        assert_eq!(io.stderr.text(), "warn\n");
    }

    #[test]
    fn nonzero_exit_names_code_and_container() {
        let engine = Arc::new(MockEngine::new());
        engine.set_run_script(RunScript::default().exit(2));
        let (exec, _, id) = started(&engine);

        let err = exec.run_hook(&id).unwrap_err();
        assert!(matches!(err, ExecError::NonZeroExit { code: 2, .. }));
        let text = err.to_string();
        assert!(text.contains("status 2"));
        assert!(text.contains(id.as_str()));
    }

    #[test]
    fn tty_with_stdin_forwards_input_in_raw_mode() {
        let engine = Arc::new(MockEngine::new());
        engine.set_run_script(RunScript::output("prompt> "));
        let base = engine.add_tagged_image("alpine", ContainerConfig::default());
        let (mut exec, _) = executor(&engine);
        let io = CaptureIo {
            input: b"ls\n".to_vec(),
            ..CaptureIo::default()
        };
        exec = exec.with_host(Arc::new(io.clone()));
        exec.set_image_id(base);
        exec.set_tty(true);
        exec.set_stdin(true);
        let id = exec.create().unwrap();

        exec.run_hook(&id).unwrap();
        assert_eq!(io.stdout.text(), "prompt> ");
        assert_eq!(io.raw_entered.load(Ordering::SeqCst), 1);
        assert_eq!(io.raw_restored.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attach_failure_is_reported() {
        let engine = Arc::new(MockEngine::new());
        let (exec, io, id) = started(&engine);
        engine.fail_next(MockOp::Attach);

        let err = exec.run_hook(&id).unwrap_err();
        assert!(matches!(err, ExecError::Attach { .. }));
        assert!(err.to_string().starts_with("could not attach to container"));
        assert!(io.stdout.text().is_empty());
    }

    #[test]
    fn start_failure_joins_helpers() {
        let engine = Arc::new(MockEngine::new());
        let (exec, _, id) = started(&engine);
        engine.fail_next(MockOp::Start);
        assert!(matches!(
            exec.run_hook(&id),
            Err(ExecError::Start { .. })
        ));
    }

    #[test]
    fn wait_failure_surfaces_engine_text() {
        let engine = Arc::new(MockEngine::new());
        let (exec, _, id) = started(&engine);
        engine.fail_next(MockOp::Wait);
        let err = exec.run_hook(&id).unwrap_err();
        assert!(err.to_string().contains("injected Wait failure"));
    }

    #[test]
    fn malformed_output_stops_a_running_container() {
        let engine = Arc::new(MockEngine::new());
        let garbage = RunScript::output("not a framed stream\n").unframed();
        engine.set_run_script(garbage.hanging());
        let (exec, _, id) = started(&engine);

        let began = std::time::Instant::now();
        let err = exec.run_hook(&id).unwrap_err();
        assert!(began.elapsed() < std::time::Duration::from_secs(5));
        match err {
            ExecError::Stream(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
            other => panic!("expected a stream error, got {other}"),
        }
        assert!(engine.container_exists(&id));
    }

    #[test]
    fn first_error_wins_and_stops() {
        let stop = CancellationToken::new();
        let errors = FirstError::new(stop.clone());
        errors.report(io::Error::other("first"));
        errors.report(io::Error::other("second"));
        assert!(stop.is_cancelled());
        assert_eq!(errors.take().unwrap().to_string(), "first");
        assert!(errors.take().is_none());
    }
}
