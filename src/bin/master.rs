//! Master process entry point.
//!
//! Owns the system-under-test (core, gNB) lifecycle across fuzzing slots,
//! publishes the shared epoch counter, and spawns/reaps one
//! `nascorefuzz-worker` subprocess per configured worker. Grounded on
//! `run_parallel.py`'s `main`/`do_full_reset`/`reset_watcher`/
//! `master_exit_handler` (spec.md §4.8).

use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nascorefuzz::config::Config;
use nascorefuzz::ctrl::CtrlDir;
use nascorefuzz::error::{Error, Result};
use nascorefuzz::sut;

/// Time the master waits after writing `reset_pending` before tearing the
/// SUT down, matching `do_full_reset`'s `time.sleep(1.0)`.
const RESET_SETTLE: Duration = Duration::from_secs(1);
const RESET_WATCHER_POLL: Duration = Duration::from_millis(200);
const AMF_SMF_PROC_NAMES: &[&str] = &["open5gs-amfd", "open5gs-smfd"];
const GNB_HEALTH_TIMEOUT: Duration = Duration::from_secs(10);
const WORKER_STOP_SIGINT_WAIT: Duration = Duration::from_secs(5);

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        log::error!("master exiting on unhandled error: {e}");
        std::process::exit(1);
    }
}

/// `do_full_reset`: writes `reset_pending`, tears down UE/gNB/core, starts
/// core and gNB back up, health-checks the gNB, publishes a fresh epoch,
/// and clears `reset_pending` plus any queued reset requests. Returns the
/// new epoch.
fn do_full_reset(cfg: &Config, ctrl: &CtrlDir) -> Result<u64> {
    log::info!("[MASTER] full reset: restarting core & gNB");
    ctrl.mark_reset_pending()?;
    std::thread::sleep(RESET_SETTLE);

    sut::kill_ue_all();
    sut::kill_gnb();
    sut::kill_core();
    std::thread::sleep(Duration::from_millis(500));

    let core_log_dir = &cfg.log_dir;
    fs::create_dir_all(core_log_dir).map_err(Error::Io)?;
    let _core_child = sut::start_core(cfg, core_log_dir)?;
    if !sut::wait_nf_procs(AMF_SMF_PROC_NAMES, Duration::from_secs(cfg.core_wait_timeout_secs)) {
        log::warn!("[MASTER] AMF/SMF not detected in time");
    }
    std::thread::sleep(Duration::from_secs(10));

    let _gnb_child = sut::start_gnb(cfg, core_log_dir)?;
    std::thread::sleep(Duration::from_secs(3));
    let gnb_log = core_log_dir.join("gnb.log");
    if !sut::health_check(&gnb_log, GNB_HEALTH_TIMEOUT) {
        log::warn!("[MASTER] gNB health_check failed, continuing anyway");
    }

    let epoch = ctrl.read_epoch() + 1;
    ctrl.write_epoch(epoch)?;
    ctrl.clear_reset_pending()?;
    ctrl.clear_reset_requests()?;
    log::info!("[MASTER] full reset done, epoch={epoch}");
    Ok(epoch)
}

/// Spawns one `nascorefuzz-worker --wid <w>` subprocess, its stdout/stderr
/// redirected to its own `worker.log`, matching `spawn_worker`.
fn spawn_worker(cfg: &Config, wid: u32) -> Result<Child> {
    let log_dir = cfg.worker_log_dir(wid);
    fs::create_dir_all(&log_dir).map_err(Error::Io)?;
    let log_path = log_dir.join("worker.log");
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(Error::Io)?;
    let err_file = log_file.try_clone().map_err(Error::Io)?;

    let exe = worker_exe_path();
    Command::new(exe)
        .arg("--wid")
        .arg(wid.to_string())
        .stdout(log_file)
        .stderr(err_file)
        .spawn()
        .map_err(Error::Io)
}

/// Resolves the sibling `nascorefuzz-worker` binary next to this one, the
/// way `run_parallel.py` invokes `python3 core_fuzzer.py` from its own
/// working directory.
fn worker_exe_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("nascorefuzz-worker")))
        .unwrap_or_else(|| PathBuf::from("nascorefuzz-worker"))
}

/// Copies a finished slot's per-worker FSM/MCTS/corpus snapshots into
/// `logs/worker_<w>/logs/w<w>_<tag>/`, matching `collect_outputs`.
fn collect_outputs(cfg: &Config, wid: u32, tag: &str) -> Result<()> {
    let wdir = cfg.worker_log_dir(wid);
    let outdir = wdir.join(format!("w{wid}_{tag}"));
    fs::create_dir_all(&outdir).map_err(Error::Io)?;
    for name in [
        "savedFSM.json",
        "savedFSM_sm.json",
        "savedMCTS_amf.json",
        "savedMCTS_smf.json",
        "corpus.json",
    ] {
        let src = wdir.join(name);
        if src.exists() {
            fs::copy(&src, outdir.join(name)).map_err(Error::Io)?;
        }
    }
    Ok(())
}

/// Sends `SIGINT` to every worker, waits up to `WORKER_STOP_SIGINT_WAIT`,
/// then escalates stragglers to `SIGTERM` and finally `SIGKILL`, mirroring
/// `master_exit_handler`'s cascade.
fn stop_workers(workers: &mut [Child]) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    for child in workers.iter() {
        let _ = signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGINT);
    }
    let deadline = Instant::now() + WORKER_STOP_SIGINT_WAIT;
    while Instant::now() < deadline {
        if workers.iter_mut().all(|c| matches!(c.try_wait(), Ok(Some(_)))) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    for child in workers.iter_mut() {
        if matches!(child.try_wait(), Ok(None)) {
            log::warn!("[MASTER] worker pid {} did not exit on SIGINT, sending SIGTERM", child.id());
            let _ = signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
        }
    }
    std::thread::sleep(Duration::from_secs(1));
    for child in workers.iter_mut() {
        if matches!(child.try_wait(), Ok(None)) {
            log::warn!("[MASTER] worker pid {} is stuck, sending SIGKILL", child.id());
            let _ = child.kill();
        }
        let _ = child.wait();
    }
}

/// The background thread started per-slot: polls `reset_requests/` every
/// 0.2s and runs a full reset whenever any worker has deposited one.
fn spawn_reset_watcher(cfg: Config, ctrl: CtrlDir, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            if ctrl.has_pending_reset_requests() {
                log::info!("[MASTER] reset request observed, performing full reset");
                if let Err(e) = do_full_reset(&cfg, &ctrl) {
                    log::error!("[MASTER] full reset failed: {e}");
                }
            }
            std::thread::sleep(RESET_WATCHER_POLL);
        }
    })
}

fn run() -> Result<()> {
    let cfg = Config::load();
    let ctrl = CtrlDir::new(&cfg.ctrl_dir)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone()).map_err(Error::Io)?;

    if let Some(open5gs) = &cfg.open5gs_path {
        let _ = Command::new("lcov")
            .args(["--directory"])
            .arg(open5gs)
            .args(["--zerocounters"])
            .status();
    }

    ctrl.reset_epoch_files()?;
    do_full_reset(&cfg, &ctrl)?;

    let mut workers: Vec<Child> = Vec::new();

    if !cfg.parallel {
        log::info!("[MASTER] PARALLEL=0, full reset complete, nothing further to run");
        return Ok(());
    }

    'hours: for hour in 0..cfg.hours_total {
        for slot in 0..cfg.slots_per_hour {
            if shutdown.load(Ordering::Relaxed) {
                break 'hours;
            }
            let tag = format!("{hour:02}_{slot}");

            let watcher_stop = Arc::new(AtomicBool::new(false));
            let watcher = spawn_reset_watcher(cfg.clone(), ctrl.clone(), watcher_stop.clone());

            workers.clear();
            for wid in 0..cfg.n_workers {
                match spawn_worker(&cfg, wid) {
                    Ok(child) => workers.push(child),
                    Err(e) => log::error!("[MASTER] failed to spawn worker {wid}: {e}"),
                }
            }
            log::info!("[+] round {tag} started with {} workers", cfg.n_workers);

            let slot_deadline = Instant::now() + Duration::from_secs(cfg.round_sec);
            while Instant::now() < slot_deadline && !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(200));
            }

            watcher_stop.store(true, Ordering::Relaxed);
            let _ = watcher.join();

            stop_workers(&mut workers);
            for wid in 0..cfg.n_workers {
                if let Err(e) = collect_outputs(&cfg, wid, &tag) {
                    log::warn!("[MASTER] failed collecting outputs for worker {wid}: {e}");
                }
            }
            workers.clear();

            if let Some(open5gs) = &cfg.open5gs_path {
                let coverage_dir = cfg.log_dir.join("gcov");
                match sut::collect_coverage(open5gs, &coverage_dir, &tag) {
                    Ok(path) => log::info!("[MASTER] coverage captured at {}", path.display()),
                    Err(e) => log::warn!("[MASTER] coverage capture failed: {e}"),
                }
            }

            if shutdown.load(Ordering::Relaxed) {
                break 'hours;
            }
            do_full_reset(&cfg, &ctrl)?;
            log::info!("[+] {tag} finished, data stored");
        }
    }

    log::info!("[MASTER] stopping worker processes");
    stop_workers(&mut workers);
    sut::kill_gnb();
    sut::kill_core();
    ctrl.reset_epoch_files()?;
    Ok(())
}
