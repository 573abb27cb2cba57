//! Process lifecycle management for child processes
//!
//! Ensures external tools (cargo, dpkg-deb, useradd, systemctl, ...) do not
//! outlive an interrupted deployment run.
//!
//! - Children are spawned in their own process group (Unix)
//! - Every child PID is tracked in a global registry
//! - On SIGINT/SIGTERM/SIGHUP, or when the run timeout expires, the run is
//!   cancelled and all children get SIGTERM, then SIGKILL after a grace period
//! - A second interrupt exits immediately

use crate::cancel::{CancelToken, SystemClock, sleep_cancellable};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long children get between SIGTERM and SIGKILL
pub const CHILD_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Global registry of child process IDs
static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Registry tracking all spawned child processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    /// Set of child PIDs currently running
    pids: HashSet<u32>,
    /// Whether cleanup has already been initiated (prevent double-cleanup)
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Run `f` against the global registry. A poisoned lock is recovered:
    /// the registry is a plain PID set and stays consistent.
    pub fn with_global<T>(f: impl FnOnce(&mut ChildRegistry) -> T) -> T {
        let registry = Self::global();
        let mut guard = registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Register a new child process
    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        tracing::debug!("Registered child process PID {}", pid);
    }

    /// Unregister a child process (called when it exits normally)
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        tracing::debug!("Unregistered child process PID {}", pid);
    }

    /// Get count of tracked children
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate all tracked child processes.
    /// Sends SIGTERM first, waits up to `grace_period`, then SIGKILL.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            tracing::debug!("Cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            tracing::debug!("No child processes to terminate");
            return;
        }

        tracing::info!("Terminating {} child process(es)...", self.pids.len());
        let pids: Vec<u32> = self.pids.iter().copied().collect();
        unix_signals::terminate(&pids, grace_period);
        self.pids.clear();
        tracing::info!("Child process cleanup complete");
    }
}

#[cfg(unix)]
mod unix_signals {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    use std::time::{Duration, Instant};

    pub(super) fn terminate(pids: &[u32], grace_period: Duration) {
        // Group signal first so tools spawned by the child are caught too
        for &pid in pids {
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                tracing::warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
                if let Err(e2) = send_signal(pid, Signal::SIGTERM) {
                    tracing::warn!("Failed to send SIGTERM to PID {}: {}", pid, e2);
                }
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids.iter().all(|&pid| !is_process_alive(pid)) {
                tracing::info!("All child processes terminated gracefully");
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in pids {
            if is_process_alive(pid) {
                tracing::warn!("Process group {} did not terminate, sending SIGKILL", pid);
                if send_signal_to_group(pid, Signal::SIGKILL).is_err() {
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }
    }

    pub(super) fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
        signal::kill(Pid::from_raw(pid as i32), signal)
    }

    /// Negative PID addresses the whole process group
    fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
        signal::kill(Pid::from_raw(-(pgid as i32)), signal)
    }

    /// Check if a process is still alive (not dead or zombie)
    pub(super) fn is_process_alive(pid: u32) -> bool {
        if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
            return false;
        }

        // Field 3 of /proc/<pid>/stat is the state; Z and X are not alive
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            let fields: Vec<&str> = stat.split_whitespace().collect();
            if fields.len() > 2 {
                return !matches!(fields[2], "Z" | "X");
            }
        }

        true
    }
}

#[cfg(not(unix))]
mod unix_signals {
    use std::time::Duration;

    pub(super) fn terminate(pids: &[u32], _grace_period: Duration) {
        tracing::warn!(
            "Process group termination unsupported on this platform; {} child(ren) left running",
            pids.len()
        );
    }
}

/// Install interrupt handling for one run.
///
/// The first SIGINT/SIGTERM/SIGHUP cancels `cancel` and terminates tracked
/// children so the in-flight stage fails promptly and the summary still
/// prints. A second signal exits with `128 + signal`.
#[cfg(unix)]
pub fn install_interrupt_handler(cancel: CancelToken) -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };

            if cancel.is_cancelled() {
                tracing::warn!("Received second {}, exiting", signal_name);
                std::process::exit(128 + sig);
            }

            tracing::info!("Received {}, cancelling run...", signal_name);
            cancel.cancel();
            ChildRegistry::with_global(|registry| registry.terminate_all(CHILD_GRACE_PERIOD));
        }
    });

    Ok(())
}

/// Cancel the run once `timeout` of wall-clock time has passed and terminate
/// the tracked children, exactly as an interrupt would. Returns early,
/// without touching children, if the run is cancelled some other way first.
pub fn spawn_run_watchdog(cancel: CancelToken, timeout: Duration) -> JoinHandle<()> {
    std::thread::spawn(move || {
        if !sleep_cancellable(&SystemClock, &cancel, timeout) {
            return;
        }
        tracing::warn!("Run timeout of {:?} reached, cancelling", timeout);
        cancel.cancel();
        ChildRegistry::with_global(|registry| registry.terminate_all(CHILD_GRACE_PERIOD));
    })
}

/// Install interrupt handling for one run (Ctrl-C only).
#[cfg(not(unix))]
pub fn install_interrupt_handler(cancel: CancelToken) -> std::io::Result<()> {
    ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        tracing::info!("Received Ctrl-C, cancelling run...");
        cancel.cancel();
        ChildRegistry::with_global(|registry| registry.terminate_all(CHILD_GRACE_PERIOD));
    })
    .map_err(std::io::Error::other)
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group
    fn in_new_process_group(&mut self) -> &mut Self;
}

#[cfg(unix)]
impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // PGID = child PID, so the whole tree can be signalled at once
        self.process_group(0);
        set_parent_death_signal(self);
        self
    }
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal(cmd: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| {
            // Child dies with us; a half-finished useradd or dpkg-deb must not linger
            if nix::libc::prctl(nix::libc::PR_SET_PDEATHSIG, nix::libc::SIGTERM) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_parent_death_signal(_cmd: &mut std::process::Command) {}

#[cfg(not(unix))]
impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        self
    }
}
