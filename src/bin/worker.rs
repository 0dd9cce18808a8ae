//! Worker process entry point.
//!
//! Owns one process-local FSM/MCTS/corpus, reconnects to the UE simulator
//! across epoch-triggered restarts, and drives [`Driver::run_round`] in a
//! loop until `SIGINT`. Grounded on `core_fuzzer.py`'s `while True:` worker
//! loop and `run_parallel.py`'s per-worker subprocess contract (spec.md
//! §4.8, §4.6).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use libafl_bolts::current_nanos;
use libafl_bolts::rands::{Rand, StdRand};

use nascorefuzz::config::Config;
use nascorefuzz::ctrl::CtrlDir;
use nascorefuzz::driver::Driver;
use nascorefuzz::error::{Error, Result};
use nascorefuzz::fsm::Fsm;
use nascorefuzz::mcts::MctsSchedule;
use nascorefuzz::oracle::Oracle;
use nascorefuzz::scanners::GnbErrorDrain;
use nascorefuzz::ue_link::UeLink;

/// `Fsm::new`'s init-state name; not worker-configurable (every worker's
/// FSM starts from the same NAS registration-state machine root).
const INIT_STATE_AMF: &str = "Deregistered";
const INIT_STATE_SMF: &str = "PDUSessionInactive";

/// §4.8 worker lifecycle: "on >=10 consecutive initial connect failures
/// deposit a reset request".
const MAX_INIT_CONNECT_FAILURES: u32 = 10;

/// Effectively unbounded: the first `wait_for_epoch_change` call blocks
/// until the master's initial full reset publishes `epoch >= 1`.
const INITIAL_EPOCH_WAIT: Duration = Duration::from_secs(86_400 * 365);

#[derive(Debug, Parser)]
#[command(about = "nascorefuzz worker: runs fuzz rounds against one UE simulator instance")]
struct Cli {
    #[arg(help = "0-based worker identifier", short = 'w', long = "wid", required = true)]
    wid: u32,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli.wid) {
        log::error!("worker {} exiting on unhandled error: {e}", cli.wid);
        std::process::exit(1);
    }
}

fn snapshot_paths(cfg: &Config, wid: u32) -> (PathBuf, PathBuf, PathBuf, PathBuf, PathBuf) {
    let dir = cfg.worker_log_dir(wid);
    (
        dir.join("savedFSM.json"),
        dir.join("savedFSM_sm.json"),
        dir.join("savedMCTS_amf.json"),
        dir.join("savedMCTS_smf.json"),
        dir.join("corpus.json"),
    )
}

fn load_fsm(path: &Path, init_state: &str) -> Result<Fsm> {
    match fs::read_to_string(path) {
        Ok(json) => Fsm::from_json(&json),
        Err(_) => Ok(Fsm::new(init_state)),
    }
}

fn load_schedule(path: &Path, init_state: &str) -> Option<MctsSchedule> {
    let json = fs::read_to_string(path).ok()?;
    MctsSchedule::from_json(&json).ok()
}

/// Flushes all four per-worker snapshot files. Called after every round
/// and, guaranteed, on every exit path, per §5's "idempotent scoped save".
fn save_snapshots(cfg: &Config, driver: &Driver) -> Result<()> {
    let (fsm_path, fsm_sm_path, mcts_amf_path, mcts_smf_path, corpus_path) = snapshot_paths(cfg, driver.wid);
    fs::create_dir_all(fsm_path.parent().unwrap()).map_err(Error::Io)?;
    fs::write(&fsm_path, driver.fsm.to_json()?).map_err(Error::Io)?;
    fs::write(&fsm_sm_path, driver.fsm_sm.to_json()?).map_err(Error::Io)?;
    fs::write(&mcts_amf_path, driver.schedule_amf.to_json()?).map_err(Error::Io)?;
    fs::write(&mcts_smf_path, driver.schedule_smf.to_json()?).map_err(Error::Io)?;
    fs::write(&corpus_path, driver.corpus.export_json()?).map_err(Error::Io)?;
    Ok(())
}

/// Each worker's three-port triple (spec.md §6) collapses to a single
/// control connection here: [`UeLink::send_symbol`]/`send_raw` already
/// multiplex framed-symbol and raw-fuzz-payload traffic over one socket,
/// so there is nothing left for the other two ports to carry.
fn connect_link(cfg: &Config, wid: u32) -> Result<UeLink> {
    let port = cfg.ue_port_base + (wid as u16) * 3;
    UeLink::connect("127.0.0.1", port)
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn now_tag() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

fn run(wid: u32) -> Result<()> {
    let cfg = Config::load();
    let ctrl = CtrlDir::new(&cfg.ctrl_dir)?;
    let mut rand = StdRand::with_seed(current_nanos() ^ u64::from(wid));

    log::info!("worker {wid} waiting for epoch >= 1");
    let mut prev_epoch = ctrl.wait_for_epoch_change(0, INITIAL_EPOCH_WAIT, &mut rand);
    log::info!("worker {wid} starting at epoch {prev_epoch}");

    let (fsm_path, fsm_sm_path, mcts_amf_path, mcts_smf_path, _corpus_path) = snapshot_paths(&cfg, wid);
    let fsm = load_fsm(&fsm_path, INIT_STATE_AMF)?;
    let fsm_sm = load_fsm(&fsm_sm_path, INIT_STATE_SMF)?;
    let mut driver = Driver::new(wid, fsm, fsm_sm, Oracle::new());
    if let Some(sched) = load_schedule(&mcts_amf_path, INIT_STATE_AMF) {
        driver.schedule_amf = sched;
    }
    if let Some(sched) = load_schedule(&mcts_smf_path, INIT_STATE_SMF) {
        driver.schedule_smf = sched;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone()).map_err(Error::Io)?;

    let worker_log_dir = cfg.worker_log_dir(wid);
    fs::create_dir_all(&worker_log_dir).map_err(Error::Io)?;
    let core_log = cfg.log_dir.join("core.log");
    let gnb_log = cfg.log_dir.join("gnb.log");
    let crash_log_dir = cfg.log_dir.join("crash");
    fs::create_dir_all(&crash_log_dir).map_err(Error::Io)?;
    let mut gnb_drain = GnbErrorDrain::new(gnb_log);

    let mut ue: Option<UeLink> = None;
    let mut consecutive_connect_failures = 0u32;

    while !shutdown.load(Ordering::Relaxed) {
        if ctrl.reset_pending() {
            ue = None;
            log::info!("worker {wid} observed reset_pending, waiting for master");
            prev_epoch = ctrl.wait_master_reset(prev_epoch, &mut rand);
        } else {
            let epoch = ctrl.read_epoch();
            if epoch > prev_epoch {
                log::info!("worker {wid} epoch {prev_epoch} -> {epoch}: local UE reset");
                ue = None;
                prev_epoch = epoch;
            }
        }

        if ue.is_none() {
            match connect_link(&cfg, wid) {
                Ok(link) => {
                    ue = Some(link);
                    consecutive_connect_failures = 0;
                }
                Err(e) => {
                    consecutive_connect_failures += 1;
                    log::warn!("worker {wid} connect attempt {consecutive_connect_failures} failed: {e}");
                    if consecutive_connect_failures >= MAX_INIT_CONNECT_FAILURES {
                        let _ = ctrl.request_reset(wid, now_ms(), "init_connect_timeout");
                        prev_epoch = ctrl.wait_master_reset(prev_epoch, &mut rand);
                        consecutive_connect_failures = 0;
                    } else {
                        let jitter_ms = rand.below(400) as u64;
                        std::thread::sleep(Duration::from_millis(100 + jitter_ms));
                    }
                    continue;
                }
            }
        }

        let tag = now_tag();
        let round_result = {
            let link = ue.as_mut().expect("connected above");
            driver.run_round(link, &mut rand, &mut gnb_drain, &core_log, &crash_log_dir, &tag)
        };

        match round_result {
            Ok(outcome) => {
                log::debug!("worker {wid} round outcome: {outcome:?}");
                if let nascorefuzz::driver::RoundOutcome::Completed(summary) = &outcome {
                    if summary.pending_global_reset {
                        let _ = ctrl.request_reset(wid, now_ms(), "component_crash");
                    }
                }
                if matches!(outcome, nascorefuzz::driver::RoundOutcome::UeCrashSuspected) {
                    ue = None;
                }
            }
            Err(e) => {
                log::error!("worker {wid} round failed: {e}");
                if !e.is_transient() {
                    ue = None;
                }
            }
        }

        if let Err(e) = save_snapshots(&cfg, &driver) {
            log::warn!("worker {wid} snapshot flush failed: {e}");
        }
    }

    log::info!("worker {wid} caught SIGINT, flushing snapshots and exiting");
    save_snapshots(&cfg, &driver)?;
    Ok(())
}
