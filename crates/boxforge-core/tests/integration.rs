use boxforge_core::{ExecError, Executor, ExecutorOptions, HostIo, RawModeGuard, SignalDispatcher};
use boxforge_engine::{Engine, MockEngine, MockOp, RunScript};
use boxforge_schema::{BuildConfig, ContainerConfig, Fingerprint, ImageId};
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Host stdio that records output and counts terminal mode switches.
#[derive(Clone, Default)]
struct FakeTerminal {
    stdout: Captured,
    stderr: Captured,
    raw_entered: Arc<AtomicUsize>,
    raw_restored: Arc<AtomicUsize>,
}

/// Input that never arrives, like an idle keyboard.
struct IdleInput;

impl Read for IdleInput {
    fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
        thread::sleep(Duration::from_millis(5));
        Err(io::ErrorKind::WouldBlock.into())
    }
}

impl HostIo for FakeTerminal {
    fn stdin(&self) -> Box<dyn Read + Send> {
        Box::new(IdleInput)
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

struct Session {
    engine: Arc<MockEngine>,
    exec: Executor,
    term: FakeTerminal,
    signals: SignalDispatcher,
}

fn session() -> Session {
    init_tracing();
    let engine = Arc::new(MockEngine::new());
    let term = FakeTerminal::default();
    let signals = SignalDispatcher::new();
    let dyn_engine: Arc<dyn Engine> = engine.clone();
    let exec = Executor::new(dyn_engine, ExecutorOptions::default())
        .with_signals(signals.clone())
        .with_host(Arc::new(term.clone()));
    Session {
        engine,
        exec,
        term,
        signals,
    }
}

fn session_on_base() -> (Session, ImageId) {
    let mut s = session();
    let base = s
        .engine
        .add_tagged_image("debian:bookworm", ContainerConfig::default());
    s.exec.fetch("debian:bookworm").unwrap();
    (s, base)
}

fn fp(s: &str) -> Fingerprint {
    Fingerprint::new(s)
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

// Scenario a: an empty session never hits the cache.
#[test]
fn empty_session_cache_miss() {
    let mut s = session();
    assert!(!s.exec.check_cache(&fp("run echo hi")).unwrap());
}

// Scenario b: a child of the current image with a matching comment is a hit.
#[test]
fn cache_hit_moves_resulting_image() {
    let mut s = session();
    let child = s
        .engine
        .add_image("abc", "run echo hi", ContainerConfig::default());
    s.exec.set_image_id(ImageId::new("abc"));

    assert!(s.exec.check_cache(&fp("run echo hi")).unwrap());
    assert_eq!(s.exec.image_id(), Some(&child));
}

// Scenario c: the import archive carries exactly three members in order.
#[test]
fn import_archive_members() {
    let mut s = session();
    s.exec.load_config(BuildConfig {
        cmd: vec!["/bin/sh".to_owned()],
        ..BuildConfig::default()
    });
    s.exec
        .import(&ImageId::new("img1"), Cursor::new(Vec::new()))
        .unwrap();

    let archives = s.engine.loaded_archives();
    assert_eq!(archives.len(), 1);
    let mut archive = tar::Archive::new(archives[0].as_slice());
    let mut members = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let size = entry.header().size().unwrap();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        assert_eq!(size, data.len() as u64);
        members.push((name, data));
    }

    let names: Vec<_> = members.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["img1.json", "repositories", "manifest.json"]);
    assert_eq!(members[1].1, br#"{"img1":{"latest":"img1"}}"#);
    let manifest: serde_json::Value = serde_json::from_slice(&members[2].1).unwrap();
    assert_eq!(manifest[0]["Config"], "img1.json");
    assert_eq!(manifest[0]["RepoTags"][0], "img1");
    assert_eq!(manifest[0]["Layers"][0], "img1/layer.tar");
    assert_eq!(s.exec.image_id(), Some(&ImageId::new("img1")));
}

// Scenario d: output of a successful run reaches the host.
#[test]
fn run_prints_output() {
    let (mut s, _) = session_on_base();
    s.engine.set_run_script(RunScript::output("hi"));

    s.exec.commit_run(&fp("run echo hi")).unwrap();
    assert!(s.term.stdout.text().contains("hi"));
    assert!(s.engine.live_containers().is_empty());
}

// Scenario e: a non-zero exit names the status.
#[test]
fn run_reports_exit_status() {
    let (mut s, base) = session_on_base();
    s.engine.set_run_script(RunScript::default().exit(2));

    let err = s.exec.commit_run(&fp("run false")).unwrap_err();
    assert!(err.to_string().contains("status 2"), "{err}");
    assert_eq!(s.exec.image_id(), Some(&base));
    assert!(s.engine.live_containers().is_empty());
}

#[test]
fn destroy_is_idempotent() {
    let (s, _) = session_on_base();
    let id = s.exec.create().unwrap();
    s.exec.destroy(&id).unwrap();
    s.exec.destroy(&id).unwrap();
}

#[test]
fn container_removed_after_every_commit_outcome() {
    let (mut s, _) = session_on_base();

    s.exec.commit(&fp("env A=1"), None).unwrap();
    assert!(s.engine.live_containers().is_empty());

    s.engine.queue_run_script(RunScript::output("ok"));
    s.exec.commit_run(&fp("run true")).unwrap();
    assert!(s.engine.live_containers().is_empty());

    s.engine.queue_run_script(RunScript::default().exit(1));
    assert!(s.exec.commit_run(&fp("run false")).is_err());
    assert!(s.engine.live_containers().is_empty());

    s.engine.fail_next(MockOp::Start);
    assert!(s.exec.commit_run(&fp("run never")).is_err());
    assert!(s.engine.live_containers().is_empty());
}

#[test]
fn layered_build_reuses_cache() {
    let (mut s, base) = session_on_base();
    s.exec.config_mut().set_env("STAGE", "build").unwrap();
    s.exec.commit(&fp("env STAGE=build"), None).unwrap();
    s.exec.commit_run(&fp("run make")).unwrap();
    let built = s.exec.image_id().unwrap().clone();
    let creates = s.engine.created_configs().len();

    s.exec.set_image_id(base);
    assert!(s.exec.check_cache(&fp("env STAGE=build")).unwrap());
    assert!(s.exec.check_cache(&fp("run make")).unwrap());
    assert_eq!(s.exec.image_id(), Some(&built));
    assert_eq!(s.engine.created_configs().len(), creates);
    assert_eq!(s.exec.config().env_value("STAGE"), Some("build"));
}

#[test]
fn committed_image_carries_build_config() {
    let (mut s, _) = session_on_base();
    s.exec.config_mut().workdir = "/src".to_owned();
    s.exec.config_mut().expose("8080").unwrap();
    s.exec.commit(&fp("workdir /src"), None).unwrap();

    let rec = s.engine.inspect_image(s.exec.image_id().unwrap()).unwrap();
    let config = rec.config.unwrap();
    assert_eq!(config.working_dir, "/src");
    assert!(config.exposed_ports.unwrap().contains_key("8080/tcp"));
}

#[test]
fn failed_intermediate_removal_fails_step() {
    let (mut s, base) = session_on_base();
    s.engine.fail_next(MockOp::Remove);

    let err = s.exec.commit(&fp("env A=1"), None).unwrap_err();
    assert!(matches!(err, ExecError::RemoveIntermediate { .. }));
    assert_eq!(s.exec.image_id(), Some(&base));
    assert!(s.engine.live_containers().is_empty());
}

#[test]
fn import_error_line_overrides_transport_success() {
    let mut s = session();
    s.engine
        .set_load_response("{\"stream\":\"Loading layer\"}\n{\"error\":\"layer does not exist\"}\n");

    let err = s
        .exec
        .import(&ImageId::new("img2"), Cursor::new(b"data".to_vec()))
        .unwrap_err();
    assert!(matches!(err, ExecError::ArchiveImport(ref m) if m == "layer does not exist"));
    assert!(s.exec.image_id().is_none());
}

#[test]
fn fetch_pulls_and_merges_config() {
    let mut s = session();
    s.engine.add_remote_image(
        "python:3.12",
        ContainerConfig {
            cmd: Some(vec!["python3".to_owned()]),
            env: Some(vec!["LANG=C.UTF-8".to_owned()]),
            ..ContainerConfig::default()
        },
    );

    let id = s.exec.fetch("python:3.12").unwrap();
    assert_eq!(s.exec.image_id(), Some(&id));
    assert_eq!(s.exec.config().cmd, vec!["python3"]);
    assert_eq!(s.exec.config().env_value("LANG"), Some("C.UTF-8"));
    assert!(s.term.stdout.text().starts_with("+++ Pulling \"python:3.12\"..."));
}

#[test]
fn tag_and_copy_file() {
    let (mut s, _) = session_on_base();
    s.engine.add_file("/app/VERSION", b"1.4.2\n");
    s.exec.commit(&fp("copy VERSION /app/"), None).unwrap();

    s.exec.tag("registry.local:5000/app:1.4").unwrap();
    let tagged = s.engine.inspect_image("registry.local:5000/app:1.4").unwrap();
    assert_eq!(Some(&tagged.id), s.exec.image_id());

    let content = s.exec.copy_one_file_from_container("/app/VERSION").unwrap();
    assert_eq!(content, b"1.4.2\n");
    assert!(matches!(
        s.exec.copy_one_file_from_container("/app/MISSING"),
        Err(ExecError::Engine(_))
    ));
    assert!(s.engine.live_containers().is_empty());
}

#[test]
fn interrupt_destroys_container_and_restores_terminal_once() {
    let (mut s, base) = session_on_base();
    s.engine.set_run_script(RunScript::output("working...").hanging());
    s.exec.set_tty(true);
    s.exec.set_stdin(true);

    let signals = s.signals.clone();
    let output = s.term.stdout.clone();
    let interrupter = thread::spawn(move || {
        // commit's destroy listener plus run_hook's stop listener
        wait_for("step listeners", || signals.listener_count() == 2);
        wait_for("container output", || output.text().contains("working..."));
        signals.deliver()
    });

    let err = s.exec.commit_run(&fp("run sleep infinity")).unwrap_err();
    assert_eq!(interrupter.join().unwrap(), 2);

    assert!(matches!(err, ExecError::Interrupted { .. }), "{err}");
    assert!(s.engine.live_containers().is_empty());
    assert!(s.engine.remove_calls().iter().any(|(_, force)| *force));
    assert_eq!(s.term.raw_entered.load(Ordering::SeqCst), 1);
    assert_eq!(s.term.raw_restored.load(Ordering::SeqCst), 1);
    assert!(s.term.stderr.text().contains("interrupt received"));
    assert_eq!(s.signals.listener_count(), 0);
    assert_eq!(s.signals.subscription_count(), 0);
    assert_eq!(s.exec.image_id(), Some(&base));
}

#[test]
fn malformed_output_fails_step_and_removes_container() {
    let (mut s, base) = session_on_base();
    let garbage = RunScript::output("plain text, no stream headers\n").unframed();
    s.engine.set_run_script(garbage.hanging());
    let images_before = s.engine.images().len();

    let began = Instant::now();
    let err = s.exec.commit_run(&fp("run ./emit-garbage")).unwrap_err();
    assert!(began.elapsed() < Duration::from_secs(5));

    match err {
        ExecError::Stream(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
        other => panic!("expected a stream error, got {other}"),
    }
    assert!(s.engine.live_containers().is_empty());
    assert_eq!(s.engine.images().len(), images_before);
    assert_eq!(s.exec.image_id(), Some(&base));
}

#[test]
fn signal_outside_a_step_reaches_nobody() {
    let (mut s, _) = session_on_base();
    s.exec.commit(&fp("env A=1"), None).unwrap();
    assert_eq!(s.signals.listener_count(), 0);
    assert_eq!(s.signals.deliver(), 0);
    assert!(!s.signals.absorb());
}
