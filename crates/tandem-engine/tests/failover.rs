use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tandem_dsp::analysis;
use tandem_engine::recording::{recording_channel, Recorder};
use tandem_engine::{
    EngineConfig, EngineError, EngineHealth, EngineStatus, HeadlessDriver, Ident, ModuleKind,
    MonitorHandle, PatchBuilder, PatchPlan, SlotId, Supervisor, ThreadLauncher,
};

fn config() -> EngineConfig {
    EngineConfig {
        buffer_len: 256,
        heartbeat_timeout_ms: 40,
        priming_timeout_ms: 2_000,
        ..EngineConfig::default()
    }
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

struct Rig {
    launcher: ThreadLauncher,
    supervisor: Arc<Mutex<Supervisor>>,
    recorder: Recorder,
    monitor: Option<MonitorHandle>,
    driver: Option<HeadlessDriver>,
}

impl Rig {
    /// Starts the engine, waits for a primed standby, then opens the gate so
    /// both workers have to apply it while running.
    fn start() -> Self {
        let launcher = ThreadLauncher::new();
        let config = config();
        let mut supervisor = Supervisor::new(
            config.clone(),
            PatchPlan::classic(440.0),
            Arc::new(launcher.clone()),
        )
        .expect("supervisor");
        supervisor.start().expect("start");
        let (tap, recorder) = recording_channel(1 << 20, supervisor.metrics());
        let callback = supervisor.callback_with_recording(tap);
        let supervisor = Arc::new(Mutex::new(supervisor));
        let monitor = MonitorHandle::spawn(Arc::clone(&supervisor), MonitorHandle::DEFAULT_INTERVAL)
            .expect("monitor");
        let driver = HeadlessDriver::spawn(callback, config.sample_rate, config.buffer_len, 2)
            .expect("driver");
        let rig = Self {
            launcher,
            supervisor,
            recorder,
            monitor: Some(monitor),
            driver: Some(driver),
        };
        let status = wait_for(&rig.supervisor, Duration::from_secs(3), |s| {
            s.health == EngineHealth::Running
        });
        assert_eq!(status.health, EngineHealth::Running, "{status:#?}");
        assert!(rig.supervisor.lock().send_line("/gate/env 1"));
        thread::sleep(Duration::from_millis(200));
        rig
    }

    fn active(&self) -> SlotId {
        self.supervisor.lock().active().expect("active slot")
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            let _ = driver.stop();
        }
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.stop();
        }
        self.supervisor.lock().shutdown();
    }
}

fn block_levels(samples: &[f32]) -> Vec<f32> {
    samples
        .chunks_exact(config().buffer_len)
        .map(analysis::rms)
        .collect()
}

#[test]
fn crashed_worker_fails_over_to_standby() {
    let mut rig = Rig::start();
    let before = rig.active();
    let metrics = rig.supervisor.lock().metrics();
    let substituted = metrics.snapshot().last_good;
    rig.recorder.start();
    thread::sleep(Duration::from_millis(100));

    assert!(rig.launcher.crash(before.index()));
    let status = wait_for(&rig.supervisor, Duration::from_secs(2), |s| s.failovers == 1);
    assert_eq!(status.failovers, 1);
    assert_eq!(status.active, Some(before.other()));
    thread::sleep(Duration::from_millis(150));
    let samples = rig.recorder.stop();
    assert!(metrics.snapshot().last_good - substituted <= 1);

    // The standby kept rendering with the gate open: no silent block and
    // no restart of the envelope across the switch.
    let levels = block_levels(&samples);
    assert!(levels.len() > 20, "{} blocks recorded", levels.len());
    assert!(levels.iter().all(|rms| *rms > 1e-3), "{levels:?}");
    assert!(samples.iter().all(|s| s.is_finite()));

    // The crashed slot is rebuilt as the new standby.
    let status = wait_for(&rig.supervisor, Duration::from_secs(3), |s| {
        s.health == EngineHealth::Running
    });
    assert_eq!(status.health, EngineHealth::Running);
    assert!(status.slot(before).generation >= 2);
}

#[test]
fn hung_worker_is_detected_by_heartbeat() {
    let rig = Rig::start();
    let before = rig.active();
    assert!(rig.launcher.hang(before.index()));

    let status = wait_for(&rig.supervisor, Duration::from_secs(2), |s| s.failovers == 1);
    assert_eq!(status.failovers, 1);
    assert_eq!(status.active, Some(before.other()));

    let status = wait_for(&rig.supervisor, Duration::from_secs(3), |s| {
        s.health == EngineHealth::Running
    });
    assert_eq!(status.health, EngineHealth::Running);
    assert!(status.metrics.buffers_read > 0);
}

#[test]
fn standby_crash_does_not_switch() {
    let rig = Rig::start();
    let active = rig.active();
    assert!(rig.launcher.crash(active.other().index()));
    thread::sleep(Duration::from_millis(20));
    let status = wait_for(&rig.supervisor, Duration::from_secs(3), |s| {
        s.health == EngineHealth::Running
    });
    assert_eq!(status.active, Some(active));
    assert_eq!(status.failovers, 0);
    assert!(status.slot(active.other()).generation >= 2);
}

#[test]
fn silent_patch_never_becomes_active() {
    let id = |text| Ident::new(text).expect("ident");
    let mut builder = PatchBuilder::new();
    builder
        .create(id("osc"), ModuleKind::Oscillator)
        .set_param(id("osc"), id("gain"), 0.0);
    let plan = builder.commit().expect("plan");
    let config = EngineConfig {
        max_spawn_attempts: 2,
        ..config()
    };
    let mut supervisor =
        Supervisor::new(config, plan, Arc::new(ThreadLauncher::new())).expect("supervisor");
    let result = supervisor.start();
    assert!(matches!(result, Err(EngineError::Fatal)), "{result:?}");
    let status = supervisor.status();
    assert_eq!(status.health, EngineHealth::Fatal);
    assert_eq!(status.active, None);
    assert!(supervisor.fence().is_fatal());

    let mut callback = supervisor.callback();
    let mut out = [1.0f32; 64];
    callback.render(&mut out, 1);
    assert!(out.iter().all(|s| *s == 0.0));
}

#[cfg(unix)]
#[test]
fn killed_worker_process_fails_over() {
    use tandem_engine::ProcessLauncher;

    let launcher = ProcessLauncher::new(env!("CARGO_BIN_EXE_tandem-worker"));
    let config = config();
    let mut supervisor = Supervisor::new(config.clone(), PatchPlan::classic(330.0), Arc::new(launcher))
        .expect("supervisor");
    supervisor.start().expect("start");
    let callback = supervisor.callback();
    let supervisor = Arc::new(Mutex::new(supervisor));
    let monitor = MonitorHandle::spawn(Arc::clone(&supervisor), MonitorHandle::DEFAULT_INTERVAL)
        .expect("monitor");
    let driver =
        HeadlessDriver::spawn(callback, config.sample_rate, config.buffer_len, 1).expect("driver");

    let status = wait_for(&supervisor, Duration::from_secs(5), |s| {
        s.health == EngineHealth::Running
    });
    assert_eq!(status.health, EngineHealth::Running, "{status:#?}");
    let before = status.active.expect("active");
    let pid = status.slot(before).pid.expect("pid");
    assert_ne!(pid, std::process::id());

    supervisor.lock().kill_worker(before).expect("kill");
    let status = wait_for(&supervisor, Duration::from_secs(3), |s| s.failovers == 1);
    assert_eq!(status.active, Some(before.other()));
    let status = wait_for(&supervisor, Duration::from_secs(5), |s| {
        s.health == EngineHealth::Running
    });
    assert_ne!(status.slot(before).pid, Some(pid));

    driver.stop().expect("driver");
    monitor.stop().expect("monitor");
    supervisor.lock().shutdown();
}
