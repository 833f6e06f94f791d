// src/main.rs

//! Agent entry-point.
//!
//! 1. Parse configuration & set up structured logging
//! 2. Build the platform notification provider
//! 3. Install callbacks (log + delayed remediation on creation)
//! 4. Listen until Ctrl-C, then stop cleanly
//!
// ───── std / 3rd-party imports ──────────────────────────────────────────────
use anyhow::{Context, Result};
use chrono::Local;
use crossbeam::channel::bounded;
use fern::Dispatch;
use log::LevelFilter;
use std::{
    path::{Path, PathBuf},
    process,
    sync::Arc,
    thread,
};

// ───── local imports ────────────────────────────────────────────────────────
use procwatch::comms::ChannelProvider;
use procwatch::config::{self, Config};
use procwatch::remediation::{self, ProcessTarget, Remediator};
use procwatch::{EventKind, EventRecord, MonitorError, ProcessMonitor};

const CONFIG_FILE: &str = "procwatch.toml";

// ───── helpers ──────────────────────────────────────────────────────────────

/// Directory that contains the running executable.
fn exe_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot determine executable path")?;
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}

/// First CLI argument, or `procwatch.toml` next to the executable.
fn config_path(exe_dir: &Path) -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| exe_dir.join(CONFIG_FILE))
}

/// Configure global logging as requested in `cfg.logging`.
fn setup_logging(exe_dir: &Path, cfg: &Config) -> Result<(), fern::InitError> {
    let level = match cfg.logging.level.to_uppercase().as_str() {
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    let log_path = cfg
        .logging
        .enable
        .then(|| exe_dir.join(cfg.logging.file.as_deref().unwrap_or("procwatch.log")));

    let mut dispatch = Dispatch::new()
        .format(|out, msg, record| {
            out.finish(format_args!(
                "[{}][{:5}][{}][pid={}][tid={:?}] {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                process::id(),
                thread::current().id(),
                msg
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    if let Some(path) = log_path {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

// ───── agent logic ──────────────────────────────────────────────────────────

fn install_callbacks<P: ChannelProvider>(monitor: &ProcessMonitor<P>, cfg: &Config) {
    let remediator: Option<Arc<dyn Remediator>> =
        cfg.remediation.enabled.then(|| remediation::build(cfg.remediation.strategy));
    let grace = cfg.remediation.grace_delay;

    monitor.set_on_created(move |name, pid| {
        let record = EventRecord::new(EventKind::Created, name, pid);
        log::info!("{}", serde_json::to_string(&record).unwrap_or_else(|_| format!("{record:?}")));

        let Some(remediator) = remediator.as_ref() else { return };
        let target = ProcessTarget::new(name, pid);
        // Outcome is logged by the remediation thread; nobody waits on it.
        if let Err(e) = remediation::spawn_delayed(Arc::clone(remediator), target, grace) {
            log::error!("cannot schedule remediation of {name} (pid {pid}): {e}");
        }
    });

    monitor.set_on_destroyed(|name, pid| {
        let record = EventRecord::new(EventKind::Destroyed, name, pid);
        log::info!("{}", serde_json::to_string(&record).unwrap_or_else(|_| format!("{record:?}")));
    });

    monitor.set_on_error(|fault| log::error!("monitor fault: {fault}"));
}

fn run<P: ChannelProvider>(provider: P, cfg: &Config) -> Result<()> {
    let monitor = ProcessMonitor::with_options(provider, cfg.monitor.options.clone());
    install_callbacks(&monitor, cfg);

    if cfg.monitor.processes.is_empty() {
        log::warn!("no processes configured under [monitor].processes");
    }

    match monitor.start_listening(cfg.monitor.processes.as_slice()) {
        Ok(()) => {}
        Err(MonitorError::PartialSubscription { failed }) => {
            log::warn!("continuing without {} subscription(s)", failed.len());
        }
        Err(e) => return Err(e).context("starting process monitor"),
    }

    let (quit_tx, quit_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = quit_tx.try_send(());
    })
    .context("installing Ctrl-C handler")?;

    log::info!("monitoring; press Ctrl-C to stop");
    let _ = quit_rx.recv();

    monitor.stop_listening().context("stopping process monitor")?;
    log::info!("agent stopped");
    Ok(())
}

#[cfg(windows)]
fn run_platform(cfg: &Config) -> Result<()> {
    run(procwatch::comms::wmi::WmiProvider, cfg)
}

#[cfg(not(windows))]
fn run_platform(cfg: &Config) -> Result<()> {
    log::warn!("WMI is unavailable on this platform; running against the simulated service");
    run(procwatch::comms::simulated::SimulatedService::new(), cfg)
}

fn main() {
    // 1 ─ Context
    let outcome = exe_dir().and_then(|dir| {
        let path = config_path(&dir);
        let cfg = config::load(&path).with_context(|| format!("loading {}", path.display()))?;

        // 2 ─ Logging
        setup_logging(&dir, &cfg).context("logging setup failed")?;
        log::info!("procwatch {} starting (pid {})", env!("CARGO_PKG_VERSION"), process::id());

        // 3 ─ Monitor
        run_platform(&cfg)
    });

    if let Err(e) = outcome {
        eprintln!("[{}][ERROR][procwatch] {:#}", Local::now().to_rfc3339(), e);
        process::exit(1);
    }
}
