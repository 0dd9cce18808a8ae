//! Process lifecycle management for the system-under-test components
//! (core network, gNB, UE instances) and the IMSI-offset allocator.
//!
//! Grounded on `setup_helper.py` (process spawn/kill, IMSI offsets,
//! `sendRRCRelease`) and `run_parallel.py` (`wait_nf_procs`,
//! `health_check`, coverage-tool invocation via `lcov_helper.py`).
//! The core/gNB/UE binaries themselves are external collaborators, out of
//! scope per spec.md §1 — this module only manages their processes.

use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::config::Config;
use crate::error::{Error, Result};

/// IMSI offsets wrap at this value, matching `setup_helper.py`'s
/// `MAX_IMSI_OFFSET`.
pub const MAX_IMSI_OFFSET: u64 = 98;

/// Process-scoped IMSI offset allocator, one per worker, per the Design
/// Notes' "global mutable state initialized once per worker" guidance.
#[derive(Debug, Default)]
pub struct ImsiAllocator {
    offset: u64,
}

impl ImsiAllocator {
    pub fn new() -> Self {
        ImsiAllocator { offset: 0 }
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset % (MAX_IMSI_OFFSET + 1);
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn next_offset(&mut self) -> u64 {
        self.offset = (self.offset + 1) % (MAX_IMSI_OFFSET + 1);
        self.offset
    }

    pub fn imsi(&self, imsi_base: u64) -> String {
        format!("imsi-{}", imsi_base + self.offset)
    }
}

fn log_file(dir: &Path, name: &str) -> Result<File> {
    fs::create_dir_all(dir).map_err(Error::Io)?;
    File::create(dir.join(name)).map_err(Error::Io)
}

pub fn start_core(cfg: &Config, log_dir: &Path) -> Result<Child> {
    let open5gs = cfg.require_open5gs_path()?;
    let out = log_file(log_dir, "core.log")?;
    let err = out.try_clone().map_err(Error::Io)?;
    let config_path = open5gs.join("build").join("configs").join("sample.yaml");
    Command::new("5gc")
        .args(["-c"])
        .arg(&config_path)
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .process_group(0)
        .spawn()
        .map_err(Error::Io)
}

pub fn start_gnb(cfg: &Config, log_dir: &Path) -> Result<Child> {
    let ueransim = cfg.require_ueransim_path()?;
    let out = log_file(log_dir, "gnb.log")?;
    let err = out.try_clone().map_err(Error::Io)?;
    let config_path = ueransim.join("config").join("open5gs-gnb.yaml");
    Command::new("nr-gnb")
        .args(["-c"])
        .arg(&config_path)
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .process_group(0)
        .spawn()
        .map_err(Error::Io)
}

pub fn start_ue(cfg: &Config, log_dir: &Path, log_name: &str, port: u16, imsi: &str) -> Result<Child> {
    let ueransim = cfg.require_ueransim_path()?;
    let out = log_file(log_dir, log_name)?;
    let err = out.try_clone().map_err(Error::Io)?;
    let config_path = ueransim.join("config").join("open5gs-ue.yaml");
    log::info!("ue imsi: {imsi} port: {port}");
    Command::new("nr-ue")
        .arg("-c")
        .arg(&config_path)
        .args(["-i", imsi, "-p", &port.to_string()])
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .process_group(0)
        .spawn()
        .map_err(Error::Io)
}

fn pkill(pattern: &str) {
    let _ = Command::new("pkill")
        .args(["-2", "-f", pattern])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

pub fn kill_core() {
    pkill("5gc");
    if let Ok(out) = Command::new("ps").args(["-ef"]).output() {
        let text = String::from_utf8_lossy(&out.stdout);
        for line in text.lines().filter(|l| l.contains("open5gs")) {
            if let Some(pid_str) = line.split_whitespace().nth(1) {
                if let Ok(pid) = pid_str.parse::<i32>() {
                    let _ = signal::kill(Pid::from_raw(pid), Signal::SIGINT);
                }
            }
        }
    }
}

pub fn kill_gnb() {
    pkill("nr-gnb");
}

pub fn kill_ue_all() {
    pkill("nr-ue");
}

/// Sends `SIGINT` to a UE child, escalating to `SIGKILL` if it doesn't
/// exit within 2s.
pub fn terminate_ue(child: &mut Child) -> Result<()> {
    let pid = Pid::from_raw(child.id() as i32);
    let _ = signal::kill(pid, Signal::SIGINT);
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return Ok(()),
            Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(100)),
            Ok(None) => {
                log::warn!("UE process {} did not terminate gracefully, killing", child.id());
                child.kill().map_err(Error::Io)?;
                return child.wait().map(|_| ()).map_err(Error::Io);
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// Issues the gNB `ue-release 1` command used before sending a
/// `serviceRequest` symbol.
pub fn send_rrc_release() -> Result<()> {
    Command::new("nr-cli")
        .args(["UERANSIM-gnb-999-70-1", "--exec", "ue-release 1"])
        .spawn()
        .map_err(Error::Io)?;
    std::thread::sleep(Duration::from_millis(250));
    Ok(())
}

/// Polls `ps -eo comm` until every name in `names` appears, or `timeout`
/// elapses.
pub fn wait_nf_procs(names: &[&str], timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let Ok(out) = Command::new("ps").args(["-eo", "comm"]).output() else {
            std::thread::sleep(Duration::from_millis(500));
            continue;
        };
        let text = String::from_utf8_lossy(&out.stdout);
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        if names.iter().all(|n| lines.contains(n)) {
            log::info!("core start done");
            return true;
        }
        std::thread::sleep(Duration::from_millis(500));
    }
    log::warn!("core start fail: timed out waiting for {names:?}");
    false
}

/// Polls the gNB log for the fixed success marker until it appears, or
/// `timeout` elapses.
pub fn health_check(gnb_log: &Path, timeout: Duration) -> bool {
    const SUCCESS_MESSAGE: &str = "NG Setup procedure is successful";
    log::info!("health check: verifying gNB connection to AMF");
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(content) = fs::read_to_string(gnb_log) {
            if content.contains(SUCCESS_MESSAGE) {
                log::info!("health check passed: found '{SUCCESS_MESSAGE}'");
                return true;
            }
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    log::warn!("health check failed: timed out waiting for gNB to connect");
    false
}

/// Shells out to `lcov`/`genhtml` exactly as `lcov_helper.py` does; the
/// resulting `.info`/html output is not interpreted by this crate.
pub fn collect_coverage(open5gs_path: &Path, out_dir: &Path, tag: &str) -> Result<PathBuf> {
    fs::create_dir_all(out_dir).map_err(Error::Io)?;
    let info = out_dir.join(format!("coverage_{tag}.info"));
    let status = Command::new("lcov")
        .arg("--directory")
        .arg(open5gs_path)
        .args(["--capture", "--output-file"])
        .arg(&info)
        .args(["--rc", "lcov_branch_coverage=1"])
        .status()
        .map_err(Error::Io)?;
    if !status.success() {
        return Err(Error::Other(format!("lcov capture failed for tag {tag}")));
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imsi_allocator_wraps_at_max_offset() {
        let mut alloc = ImsiAllocator::new();
        alloc.set_offset(MAX_IMSI_OFFSET);
        assert_eq!(alloc.next_offset(), 0);
    }

    #[test]
    fn imsi_string_uses_base_plus_offset() {
        let mut alloc = ImsiAllocator::new();
        alloc.set_offset(2);
        assert_eq!(alloc.imsi(999_700_000_000_001), "imsi-999700000000003");
    }
}
