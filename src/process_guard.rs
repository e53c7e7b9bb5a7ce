//! Process Guard
//!
//! Detects whether the target application is running and can request it
//! be closed: a graceful close signal per process, followed immediately by
//! a forced terminate, then a single authoritative re-check. The guard
//! never loops or retries; the caller decides whether to retry, escalate,
//! or abort while an instance is still open.

use crate::product::TargetApp;
use sysinfo::System;

/// Primitive process operations the guard is built on. Production uses
/// [`SystemProbe`]; tests substitute a fake.
pub trait ProcessProbe {
    /// PIDs of all processes whose image name matches exactly.
    fn pids_by_name(&self, name: &str) -> Vec<u32>;

    /// Ask the process to close gracefully.
    fn close_gracefully(&self, pid: u32) -> Result<(), String>;

    /// Forcefully terminate the process.
    fn terminate(&self, pid: u32) -> Result<(), String>;
}

/// Guard for the one process name the engine cares about.
pub struct ProcessGuard<P: ProcessProbe> {
    probe: P,
    process_name: String,
}

impl<P: ProcessProbe> ProcessGuard<P> {
    pub fn new(probe: P, app: &TargetApp) -> Self {
        ProcessGuard {
            probe,
            process_name: app.process_name.clone(),
        }
    }

    /// Whether any instance of the target application is running.
    pub fn is_running(&self) -> bool {
        !self.probe.pids_by_name(&self.process_name).is_empty()
    }

    /// Attempt to close every running instance: graceful signal, then
    /// forced terminate, per process. Per-process errors are swallowed
    /// into a counter; the post-condition re-check is authoritative.
    /// Returns `true` iff no matching process remains afterward.
    pub fn request_close(&self) -> bool {
        let pids = self.probe.pids_by_name(&self.process_name);
        if pids.is_empty() {
            return true;
        }

        let mut faults = 0usize;
        for pid in &pids {
            if let Err(e) = self.probe.close_gracefully(*pid) {
                log::debug!("graceful close of pid {} failed: {}", pid, e);
                faults += 1;
            }
            if let Err(e) = self.probe.terminate(*pid) {
                log::debug!("terminate of pid {} failed: {}", pid, e);
                faults += 1;
            }
        }
        if faults > 0 {
            log::warn!(
                "{} close attempt(s) on {} reported errors",
                faults,
                self.process_name
            );
        }

        self.probe.pids_by_name(&self.process_name).is_empty()
    }
}

/// Probe backed by `sysinfo` for enumeration and the platform's terminate
/// mechanism.
#[derive(Debug, Default)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        SystemProbe
    }
}

impl ProcessProbe for SystemProbe {
    fn pids_by_name(&self, name: &str) -> Vec<u32> {
        let mut sys = System::new();
        sys.refresh_processes();
        sys.processes_by_exact_name(name)
            .map(|p| p.pid().as_u32())
            .collect()
    }

    #[cfg(windows)]
    fn close_gracefully(&self, pid: u32) -> Result<(), String> {
        // Without /F taskkill posts WM_CLOSE to the process's windows.
        taskkill(pid, false)
    }

    #[cfg(windows)]
    fn terminate(&self, pid: u32) -> Result<(), String> {
        taskkill(pid, true)
    }

    #[cfg(not(windows))]
    fn close_gracefully(&self, pid: u32) -> Result<(), String> {
        signal_process(pid, sysinfo::Signal::Term)
    }

    #[cfg(not(windows))]
    fn terminate(&self, pid: u32) -> Result<(), String> {
        signal_process(pid, sysinfo::Signal::Kill)
    }
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> Result<(), String> {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;

    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/PID", &pid.to_string()]);
    if force {
        cmd.arg("/F");
    }
    let output = cmd
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .map_err(|e| e.to_string())?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(stderr.trim().to_string())
    }
}

#[cfg(not(windows))]
fn signal_process(pid: u32, signal: sysinfo::Signal) -> Result<(), String> {
    let mut sys = System::new();
    sys.refresh_processes();
    let process = sys
        .process(sysinfo::Pid::from_u32(pid))
        .ok_or_else(|| format!("pid {} not found", pid))?;
    match process.kill_with(signal) {
        Some(true) => Ok(()),
        Some(false) => Err(format!("signal to pid {} failed", pid)),
        None => Err("signal not supported on this platform".to_string()),
    }
}
