//! End-to-end runs of the controller against the echo worker binary.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fabric_app::Controller;
use fabric_config::FabricConfig;
use fabric_engine::{Engine, OUT_KEY, Submission, lock_ray};
use fabric_types::{MessageKind, Qid, RayStatus};
use serde_json::{Value, json};
use tempfile::{TempDir, tempdir};

const WORKER: &str = env!("CARGO_BIN_EXE_fabric-echo-worker");
const PATIENCE: Duration = Duration::from_secs(20);

struct Fixture {
    _dir: TempDir,
    engine: Arc<Engine>,
    controller: Arc<Controller>,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.controller.shutdown();
        self.engine.shutdown();
    }
}

fn write_worker_config(dir: &Path) -> String {
    let path = dir.join("worker.toml");
    std::fs::write(
        &path,
        "[worker]\ntick_ms = 10\nsuspend_after_ms = 100\nsuspend_retry_ms = 50\n",
    )
    .unwrap();
    path.display().to_string()
}

fn start(extra_args: &[&str]) -> Fixture {
    fabric_app::init_tracing();
    let dir = tempdir().unwrap();
    let mut config = FabricConfig::default();
    config.store.path = dir.path().join("store");
    config.controller.tick_ms = 10;
    config.controller.shutdown_grace_ms = 500;
    config.controller.worker_command = vec![
        WORKER.to_string(),
        "--config".to_string(),
        write_worker_config(dir.path()),
    ];
    config
        .controller
        .worker_command
        .extend(extra_args.iter().map(ToString::to_string));

    let engine = Engine::start(&config).unwrap();
    let controller = Controller::start(&config, &engine).unwrap();
    Fixture {
        _dir: dir,
        engine,
        controller,
    }
}

fn wait_finished(engine: &Engine, qid: &Qid) -> bool {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if lock_ray(&engine.ray(qid)).is_finished() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn worker_output_reaches_the_store() {
    let fixture = start(&[]);
    let qid = fixture
        .engine
        .prepare(&json!({"x": 1}), Submission::with_qid("echo-1"))
        .unwrap();

    assert!(wait_finished(&fixture.engine, &qid));
    assert_eq!(lock_ray(&fixture.engine.ray(&qid)).status(), RayStatus::Completed);
    assert_eq!(
        fixture.engine.read::<Value>(&qid, OUT_KEY).unwrap(),
        Some(json!({"x": 1}))
    );
}

#[test]
fn failing_execution_is_recorded_and_the_worker_keeps_going() {
    let fixture = start(&[]);
    let bad = fixture
        .engine
        .prepare(&json!({"fail": "no model loaded"}), Submission::default())
        .unwrap();
    let good = fixture
        .engine
        .prepare(&json!({"x": 2}), Submission::default())
        .unwrap();

    assert!(wait_finished(&fixture.engine, &bad));
    assert!(wait_finished(&fixture.engine, &good));

    let failed = lock_ray(&fixture.engine.ray(&bad)).clone();
    assert_eq!(failed.status(), RayStatus::Failed);
    let error = failed
        .messages()
        .iter()
        .find(|message| message.kind == MessageKind::Error)
        .unwrap();
    assert!(error.content.contains("no model loaded"));
    assert_eq!(lock_ray(&fixture.engine.ray(&good)).status(), RayStatus::Completed);
}

#[test]
fn crashed_worker_fails_the_execution() {
    let fixture = start(&["--crash-on-load"]);
    let qid = fixture
        .engine
        .prepare(&json!({"x": 1}), Submission::default())
        .unwrap();

    assert!(wait_finished(&fixture.engine, &qid));
    assert_eq!(lock_ray(&fixture.engine.ray(&qid)).status(), RayStatus::Failed);
}

#[test]
fn work_after_a_crash_gets_a_fresh_worker() {
    let marker_dir = tempdir().unwrap();
    let marker = marker_dir.path().join("crashed");
    let fixture = start(&["--crash-once", &marker.display().to_string()]);
    let first = fixture
        .engine
        .prepare(&json!({"x": 1}), Submission::default())
        .unwrap();
    assert!(wait_finished(&fixture.engine, &first));
    assert_eq!(lock_ray(&fixture.engine.ray(&first)).status(), RayStatus::Failed);

    // The crashed worker lingers briefly before exiting; new work must not
    // inherit its state.
    let second = fixture
        .engine
        .prepare(&json!({"x": 2}), Submission::default())
        .unwrap();
    assert!(wait_finished(&fixture.engine, &second));
    assert_eq!(lock_ray(&fixture.engine.ray(&second)).status(), RayStatus::Completed);
    assert_eq!(
        fixture.engine.read::<Value>(&second, OUT_KEY).unwrap(),
        Some(json!({"x": 2}))
    );
}

#[test]
fn suspended_worker_is_respawned_for_new_work() {
    let fixture = start(&["--suspend-when-idle"]);
    let first = fixture
        .engine
        .prepare(&json!({"n": 1}), Submission::default())
        .unwrap();
    assert!(wait_finished(&fixture.engine, &first));

    let deadline = Instant::now() + PATIENCE;
    while fixture.controller.worker_alive() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(!fixture.controller.worker_alive());

    let second = fixture
        .engine
        .prepare(&json!({"n": 2}), Submission::default())
        .unwrap();
    assert!(wait_finished(&fixture.engine, &second));
    assert_eq!(
        fixture.engine.read::<Value>(&second, OUT_KEY).unwrap(),
        Some(json!({"n": 2}))
    );
}
