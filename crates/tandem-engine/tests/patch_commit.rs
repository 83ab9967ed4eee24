use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tandem_dsp::analysis;
use tandem_engine::recording::recording_channel;
use tandem_engine::{
    EngineConfig, EngineHealth, EngineSnapshot, EngineStatus, HeadlessDriver, Ident, ModuleKind,
    MonitorHandle, PatchBuilder, PatchPlan, Supervisor, ThreadLauncher, Value,
};

const BLOCK: usize = 256;

fn id(text: &str) -> Ident {
    Ident::new(text).expect("ident")
}

fn wait_for(
    supervisor: &Arc<Mutex<Supervisor>>,
    timeout: Duration,
    done: impl Fn(&EngineStatus) -> bool,
) -> EngineStatus {
    let deadline = Instant::now() + timeout;
    loop {
        let status = supervisor.lock().status();
        if done(&status) || Instant::now() >= deadline {
            return status;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

fn started() -> Supervisor {
    let config = EngineConfig {
        buffer_len: BLOCK,
        ..EngineConfig::default()
    };
    let mut supervisor = Supervisor::new(
        config,
        PatchPlan::classic(440.0),
        Arc::new(ThreadLauncher::new()),
    )
    .expect("supervisor");
    supervisor.start().expect("start");
    assert!(supervisor.send_line("/gate/env 1"));
    supervisor
}

fn zero_crossing_hz(samples: &[f32], sample_rate: f32) -> f32 {
    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] < 0.0) != (pair[1] < 0.0))
        .count();
    crossings as f32 / 2.0 / (samples.len() as f32 / sample_rate)
}

#[test]
fn committed_patch_takes_over_without_gaps() {
    let mut supervisor = started();
    let metrics = supervisor.metrics();
    let (tap, mut recorder) = recording_channel(1 << 20, metrics.clone());
    let callback = supervisor.callback_with_recording(tap);
    let sample_rate = supervisor.config().sample_rate;
    let supervisor = Arc::new(Mutex::new(supervisor));
    let monitor = MonitorHandle::spawn(Arc::clone(&supervisor), MonitorHandle::DEFAULT_INTERVAL)
        .expect("monitor");
    let driver = HeadlessDriver::spawn(callback, sample_rate, BLOCK, 1).expect("driver");

    let status = wait_for(&supervisor, Duration::from_secs(3), |s| {
        s.health == EngineHealth::Running
    });
    assert_eq!(status.health, EngineHealth::Running);
    thread::sleep(Duration::from_millis(60));
    recorder.start();
    thread::sleep(Duration::from_millis(100));

    let before = status.active.expect("active");
    supervisor
        .lock()
        .commit_patch(PatchPlan::classic(220.0))
        .expect("commit");
    let status = wait_for(&supervisor, Duration::from_secs(3), |s| s.commits == 1);
    assert_eq!(status.commits, 1);
    assert_eq!(status.active, Some(before.other()));
    assert!(!status.commit_pending);
    let switched_at = recorder.drain();
    thread::sleep(Duration::from_millis(300));
    let samples = recorder.stop();

    driver.stop().expect("driver");
    monitor.stop().expect("monitor");

    assert!(samples.len() > switched_at + 10 * BLOCK);
    for block in samples.chunks_exact(BLOCK) {
        assert!(analysis::all_finite(block));
        assert!(analysis::rms(block) > 1.0e-3, "silent block in recording");
    }
    let tail = &samples[samples.len() - 16 * BLOCK..];
    let hz = zero_crossing_hz(tail, sample_rate);
    assert!((hz - 220.0).abs() < 25.0, "new plan plays at {hz} Hz");

    let mut guard = supervisor.lock();
    assert_eq!(guard.plan(), &PatchPlan::classic(220.0));
    assert_eq!(guard.ledger().gate(id("env")), Some(true));
    guard.shutdown();
}

#[test]
fn patch_that_fails_priming_is_rejected() {
    let mut supervisor = started();
    let before = supervisor.active().expect("active");

    let mut builder = PatchBuilder::new();
    builder
        .create(id("osc"), ModuleKind::Oscillator)
        .set_param(id("osc"), id("gain"), 0.0);
    supervisor
        .commit_patch(builder.commit().expect("plan"))
        .expect("commit accepted");
    assert!(supervisor.status().commit_pending);

    let deadline = Instant::now() + Duration::from_secs(3);
    let status = loop {
        let status = supervisor.poll();
        if status.rejected_commits == 1 && status.health == EngineHealth::Running {
            break status;
        }
        assert!(Instant::now() < deadline, "{status:#?}");
        thread::sleep(Duration::from_millis(1));
    };
    assert_eq!(status.commits, 0);
    assert_eq!(status.active, Some(before));
    assert!(!status.commit_pending);
    assert_eq!(supervisor.plan(), &PatchPlan::classic(440.0));
}

#[test]
fn snapshot_restore_replays_plan_and_params() {
    let mut supervisor = started();
    assert!(supervisor.send_line("/mod/osc/freq 330"));
    let snapshot = supervisor.snapshot();

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("snapshot.json");
    snapshot.save(&path).expect("save");
    let loaded = EngineSnapshot::load(&path).expect("load");
    assert_eq!(loaded, snapshot);
    assert_eq!(
        loaded.params.value(id("osc"), id("freq")),
        Some(Value::Float(330.0))
    );

    supervisor.send_line("/mod/osc/freq 550");
    supervisor.restore(loaded).expect("restore");
    let deadline = Instant::now() + Duration::from_secs(3);
    while supervisor.poll().commits == 0 {
        assert!(Instant::now() < deadline, "restore never committed");
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(
        supervisor.ledger().value(id("osc"), id("freq")),
        Some(Value::Float(330.0))
    );
}
