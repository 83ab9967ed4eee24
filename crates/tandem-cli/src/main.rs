use std::io::BufRead;
use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use parking_lot::Mutex;
use tandem_dsp::analysis;
use tandem_engine::modules::ModuleSettings;
use tandem_engine::{
    AudioCallback, Command, EngineConfig, EngineSnapshot, HeadlessDriver, Ident, ModuleHost,
    MonitorHandle, PatchPlan, SlotId, Supervisor, ThreadLauncher, WorkerLauncher,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => execute_run(args),
        Commands::Render(args) => execute_render(args),
        Commands::CheckPatch { patch } => execute_check(&patch),
    }
}

#[derive(Parser)]
#[command(author, version, about = "Fault-tolerant realtime synthesis with a hot-standby worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine and read control messages from stdin.
    Run(RunArgs),
    /// Render a patch in-process and report block levels.
    Render(RenderArgs),
    /// Validate a patch file and print its execution order.
    CheckPatch {
        patch: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Patch description (JSON).
    #[arg(long)]
    patch: PathBuf,
    /// Engine configuration (JSON); defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Snapshot to restore after start-up.
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// Drive the callback from a thread instead of an audio device.
    #[arg(long)]
    headless: bool,
    /// Stop after this many seconds; otherwise run until stdin closes.
    #[arg(long)]
    seconds: Option<f32>,
    /// Run workers as threads even when the worker binary is available.
    #[arg(long)]
    in_process: bool,
    /// Also accept control messages as UDP datagrams on this address.
    #[arg(long, value_name = "ADDR")]
    udp: Option<SocketAddr>,
}

#[derive(Args)]
struct RenderArgs {
    #[arg(long)]
    patch: PathBuf,
    #[arg(long, default_value_t = 1.0)]
    seconds: f32,
    /// Release every envelope after this many milliseconds.
    #[arg(long)]
    gate_ms: Option<f32>,
    #[arg(long)]
    config: Option<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::default()),
    }
}

fn launcher(config: &EngineConfig, in_process: bool) -> Arc<dyn WorkerLauncher> {
    #[cfg(unix)]
    if !in_process {
        if let Some(executable) = config.resolve_worker_executable() {
            info!(worker = %executable.display(), "using worker processes");
            return Arc::new(tandem_engine::ProcessLauncher::new(executable));
        }
        warn!("worker binary not found; running workers as threads");
    }
    #[cfg(not(unix))]
    let _ = (config, in_process);
    Arc::new(ThreadLauncher::new())
}

enum Output {
    Headless(HeadlessDriver),
    #[cfg(feature = "native")]
    Device(tandem_engine::OutputStream),
}

fn start_output(callback: AudioCallback, config: &EngineConfig, headless: bool) -> Result<Output> {
    #[cfg(feature = "native")]
    if !headless {
        let stream = tandem_engine::start_output(callback, config.sample_rate, config.buffer_len)?;
        return Ok(Output::Device(stream));
    }
    #[cfg(not(feature = "native"))]
    if !headless {
        warn!("built without audio device support; running headless");
    }
    let driver = HeadlessDriver::spawn(callback, config.sample_rate, config.buffer_len, 2)?;
    Ok(Output::Headless(driver))
}

fn execute_run(args: RunArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let plan = PatchPlan::load(&args.patch)?;
    let launcher = launcher(&config, args.in_process);

    let mut supervisor = Supervisor::new(config.clone(), plan, launcher)?;
    supervisor.start()?;
    if let Some(path) = &args.snapshot {
        let snapshot = EngineSnapshot::load(path)
            .with_context(|| format!("failed to load snapshot {}", path.display()))?;
        supervisor.restore(snapshot)?;
    }
    let output = start_output(supervisor.callback(), &config, args.headless)?;
    let supervisor = Arc::new(Mutex::new(supervisor));
    let monitor = MonitorHandle::spawn(Arc::clone(&supervisor), MonitorHandle::DEFAULT_INTERVAL)?;

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || handler_stop.store(true, Ordering::Relaxed))
        .context("failed to install interrupt handler")?;
    spawn_listener(Arc::clone(&supervisor), Arc::clone(&stop), args.seconds.is_none())?;
    if let Some(addr) = args.udp {
        spawn_udp_listener(Arc::clone(&supervisor), Arc::clone(&stop), addr)?;
    }

    let deadline = args
        .seconds
        .map(|seconds| Instant::now() + Duration::from_secs_f32(seconds.max(0.0)));
    while !stop.load(Ordering::Relaxed) && deadline.map_or(true, |d| Instant::now() < d) {
        thread::sleep(Duration::from_millis(20));
    }

    match output {
        Output::Headless(driver) => {
            driver.stop()?;
        }
        #[cfg(feature = "native")]
        Output::Device(stream) => drop(stream),
    }
    monitor.stop()?;
    let mut supervisor = supervisor.lock();
    let status = supervisor.poll();
    supervisor.shutdown();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Reads control lines from stdin. Lines starting with `:` are engine
/// commands (`:status`, `:commit <patch>`, `:save <snapshot>`, `:kill a|b`);
/// everything else goes through the control boundary.
fn spawn_listener(
    supervisor: Arc<Mutex<Supervisor>>,
    stop: Arc<AtomicBool>,
    stop_on_eof: bool,
) -> Result<()> {
    thread::Builder::new()
        .name("tandem-control".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if let Err(err) = handle_line(&supervisor, line.trim()) {
                    warn!(error = ?err, line = line.trim(), "control command failed");
                }
                if stop.load(Ordering::Relaxed) {
                    return;
                }
            }
            if stop_on_eof {
                stop.store(true, Ordering::Relaxed);
            }
        })
        .context("failed to spawn control listener")?;
    Ok(())
}

/// One control message per datagram, in the same text form as stdin.
fn spawn_udp_listener(
    supervisor: Arc<Mutex<Supervisor>>,
    stop: Arc<AtomicBool>,
    addr: SocketAddr,
) -> Result<()> {
    let socket =
        UdpSocket::bind(addr).with_context(|| format!("failed to bind control socket {addr}"))?;
    socket
        .set_read_timeout(Some(Duration::from_millis(100)))
        .context("failed to set control socket timeout")?;
    info!(%addr, "listening for control datagrams");
    thread::Builder::new()
        .name("tandem-udp".into())
        .spawn(move || {
            let mut datagram = [0u8; 1024];
            while !stop.load(Ordering::Relaxed) {
                let (len, peer) = match socket.recv_from(&mut datagram) {
                    Ok(received) => received,
                    Err(err)
                        if matches!(
                            err.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) =>
                    {
                        continue
                    }
                    Err(err) => {
                        warn!(error = %err, "control socket failed");
                        return;
                    }
                };
                let Ok(text) = std::str::from_utf8(&datagram[..len]) else {
                    warn!(%peer, "dropping non-utf8 control datagram");
                    continue;
                };
                for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
                    if let Err(err) = handle_line(&supervisor, line) {
                        warn!(error = ?err, %peer, line, "control command failed");
                    }
                }
            }
        })
        .context("failed to spawn udp listener")?;
    Ok(())
}

fn handle_line(supervisor: &Mutex<Supervisor>, line: &str) -> Result<()> {
    let Some(rest) = line.strip_prefix(':') else {
        supervisor.lock().send_line(line);
        return Ok(());
    };
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("status"), None) => {
            let status = supervisor.lock().status();
            println!("{}", serde_json::to_string(&status)?);
        }
        (Some("commit"), Some(path)) => {
            let plan = PatchPlan::load(Path::new(path))?;
            supervisor.lock().commit_patch(plan)?;
        }
        (Some("save"), Some(path)) => {
            supervisor.lock().snapshot().save(Path::new(path))?;
        }
        (Some("kill"), Some(slot)) => {
            let slot = match slot {
                "a" => SlotId::A,
                "b" => SlotId::B,
                other => anyhow::bail!("unknown slot {other:?}"),
            };
            supervisor.lock().kill_worker(slot)?;
        }
        _ => anyhow::bail!("unknown engine command {line:?}"),
    }
    Ok(())
}

fn execute_render(args: RenderArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    config.validate()?;
    let plan = PatchPlan::load(&args.patch)?;
    let settings = ModuleSettings {
        sample_rate: config.sample_rate,
        block_len: config.buffer_len,
        gain_smoothing_ms: config.gain_smoothing_ms,
        filter_smoothing_ms: config.filter_smoothing_ms,
    };
    let mut host = ModuleHost::new(&plan, settings, config.command_capacity)?;
    host.gate_all(true);

    let block_ms = config.buffer_len as f32 / config.sample_rate * 1000.0;
    let blocks = (args.seconds.max(0.0) * 1000.0 / block_ms).ceil() as usize;
    let release_at = args.gate_ms.map(|ms| (ms / block_ms).round() as usize);
    let envelopes: Vec<Ident> = plan
        .modules()
        .iter()
        .filter(|module| module.kind == tandem_engine::ModuleKind::Envelope)
        .map(|module| module.id)
        .collect();

    let mut last = None;
    let mut worst_step = 0.0f32;
    let mut non_finite = 0usize;
    for index in 0..blocks {
        if release_at == Some(index) {
            for id in &envelopes {
                let _ = host.queue_command(Command::set_gate(*id, false));
            }
        }
        let block = host.process_chain().as_slice();
        if !analysis::all_finite(block) {
            non_finite += 1;
        }
        worst_step = worst_step.max(analysis::max_step(block, last));
        last = block.last().copied();
        println!(
            "{index}\t{:.3} ms\trms {:.6}\tpeak {:.6}",
            index as f32 * block_ms,
            analysis::rms(block),
            analysis::peak(block)
        );
    }
    println!("blocks {blocks}\tmax step {worst_step:.6}\tnon-finite blocks {non_finite}");
    Ok(())
}

fn execute_check(path: &Path) -> Result<()> {
    let plan = PatchPlan::load(path)?;
    println!("{} modules", plan.len());
    for (index, module) in plan.modules().iter().enumerate() {
        let inputs: Vec<String> = module.inputs.iter().map(|id| id.to_string()).collect();
        println!(
            "{index}: {} ({}) <- [{}]",
            module.id,
            module.kind.name(),
            inputs.join(", ")
        );
    }
    Ok(())
}
