//! Filesystem control-plane primitives shared by the master and every
//! worker: the epoch counter, the reset-pending flag, and the
//! reset-request drop directory.
//!
//! Grounded on `run_parallel.py` (`write_epoch`/`read_epoch`/
//! `clear_reset_requests`/`reset_epoch_files`/`do_full_reset`) and
//! `core_fuzzer.py` (`get_epoch`/`wait_for_epoch_change`/
//! `request_global_reset`/`wait_master_reset`); spec.md §4.8.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use libafl_bolts::rands::Rand;

use crate::error::{Error, Result};

/// Everything under a single control directory: `<ctrl>/epoch`,
/// `<ctrl>/reset_pending`, `<ctrl>/reset_requests/*.req`.
#[derive(Debug, Clone)]
pub struct CtrlDir {
    root: PathBuf,
}

impl CtrlDir {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let dir = CtrlDir { root };
        fs::create_dir_all(&dir.root).map_err(Error::Io)?;
        fs::create_dir_all(dir.reset_requests_dir()).map_err(Error::Io)?;
        Ok(dir)
    }

    fn epoch_file(&self) -> PathBuf {
        self.root.join("epoch")
    }

    fn reset_pending_file(&self) -> PathBuf {
        self.root.join("reset_pending")
    }

    pub fn reset_requests_dir(&self) -> PathBuf {
        self.root.join("reset_requests")
    }

    /// Reads the epoch counter; an absent or unparseable file reads as 0.
    pub fn read_epoch(&self) -> u64 {
        fs::read_to_string(self.epoch_file())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Write-then-rename so readers never observe a half-written epoch.
    pub fn write_epoch(&self, epoch: u64) -> Result<()> {
        let tmp = self.root.join("epoch.tmp");
        fs::write(&tmp, epoch.to_string()).map_err(Error::Io)?;
        fs::rename(&tmp, self.epoch_file()).map_err(Error::Io)
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_pending_file().exists()
    }

    pub fn mark_reset_pending(&self) -> Result<()> {
        fs::write(self.reset_pending_file(), b"").map_err(Error::Io)
    }

    pub fn clear_reset_pending(&self) -> Result<()> {
        match fs::remove_file(self.reset_pending_file()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Deposits `ctrl/reset_requests/Worker<wid>_<ms>_<reason>.req`.
    pub fn request_reset(&self, wid: u32, now_ms: u128, reason: &str) -> Result<()> {
        let path = self
            .reset_requests_dir()
            .join(format!("Worker{wid}_{now_ms}_{reason}.req"));
        fs::write(path, reason).map_err(Error::Io)
    }

    pub fn has_pending_reset_requests(&self) -> bool {
        fs::read_dir(self.reset_requests_dir())
            .map(|mut it| it.any(|e| e.is_ok()))
            .unwrap_or(false)
    }

    pub fn clear_reset_requests(&self) -> Result<()> {
        for entry in fs::read_dir(self.reset_requests_dir()).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some("req") {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    /// Clears `epoch` to 0, removes `reset_pending`, and clears every
    /// pending reset request — the master's startup/shutdown
    /// `reset_epoch_files`.
    pub fn reset_epoch_files(&self) -> Result<()> {
        self.write_epoch(0)?;
        self.clear_reset_pending()?;
        self.clear_reset_requests()
    }

    /// Blocks (bounded by `timeout`) until the epoch exceeds `prev_epoch`,
    /// polling every 0.2s plus a random 0.0-0.3s jitter; returns whatever
    /// was last observed if the timeout elapses.
    pub fn wait_for_epoch_change<R: Rand>(&self, prev_epoch: u64, timeout: Duration, rand: &mut R) -> u64 {
        let deadline = Instant::now() + timeout;
        loop {
            let epoch = self.read_epoch();
            if epoch > prev_epoch {
                return epoch;
            }
            if Instant::now() >= deadline {
                return self.read_epoch();
            }
            let jitter_ms = rand.below(300) as u64;
            std::thread::sleep(Duration::from_millis(200 + jitter_ms));
        }
    }

    /// Blocks until `reset_pending` disappears, then waits (bounded, 600s
    /// per spec.md scenario 5) for the epoch to advance past `prev_epoch`.
    pub fn wait_master_reset<R: Rand>(&self, prev_epoch: u64, rand: &mut R) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(180);
        while self.reset_pending() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(200));
        }
        self.wait_for_epoch_change(prev_epoch, Duration::from_secs(600), rand)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libafl_bolts::rands::StdRand;

    fn tmp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nascorefuzz-ctrl-test-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn epoch_defaults_to_zero_when_absent() {
        let ctrl = CtrlDir::new(tmp_dir("epoch-default")).unwrap();
        assert_eq!(ctrl.read_epoch(), 0);
    }

    #[test]
    fn epoch_round_trips() {
        let ctrl = CtrlDir::new(tmp_dir("epoch-roundtrip")).unwrap();
        ctrl.write_epoch(7).unwrap();
        assert_eq!(ctrl.read_epoch(), 7);
    }

    #[test]
    fn reset_pending_flag_round_trips() {
        let ctrl = CtrlDir::new(tmp_dir("reset-pending")).unwrap();
        assert!(!ctrl.reset_pending());
        ctrl.mark_reset_pending().unwrap();
        assert!(ctrl.reset_pending());
        ctrl.clear_reset_pending().unwrap();
        assert!(!ctrl.reset_pending());
    }

    #[test]
    fn reset_requests_are_deposited_and_cleared() {
        let ctrl = CtrlDir::new(tmp_dir("reset-requests")).unwrap();
        assert!(!ctrl.has_pending_reset_requests());
        ctrl.request_reset(2, 12345, "init_connect_timeout").unwrap();
        assert!(ctrl.has_pending_reset_requests());
        ctrl.clear_reset_requests().unwrap();
        assert!(!ctrl.has_pending_reset_requests());
    }

    #[test]
    fn wait_for_epoch_change_returns_latest_on_timeout() {
        let ctrl = CtrlDir::new(tmp_dir("epoch-timeout")).unwrap();
        ctrl.write_epoch(3).unwrap();
        let mut rand = StdRand::with_seed(1);
        let observed = ctrl.wait_for_epoch_change(5, Duration::from_millis(50), &mut rand);
        assert_eq!(observed, 3);
    }

    #[test]
    fn wait_for_epoch_change_observes_increase() {
        let ctrl = CtrlDir::new(tmp_dir("epoch-increase")).unwrap();
        ctrl.write_epoch(1).unwrap();
        let mut rand = StdRand::with_seed(1);
        let observed = ctrl.wait_for_epoch_change(0, Duration::from_millis(500), &mut rand);
        assert_eq!(observed, 1);
    }
}
