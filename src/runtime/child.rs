//! Guarded recorder child processes.
//!
//! Children stay in the caller's process group, so a terminal interrupt aimed at the
//! harness reaches the recorder too and it finalizes on its own. A guard that is dropped
//! terminates and reaps its child, so no recorder outlives the iteration that started it.

use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::{ProfError, ProfResult};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct ChildGuard {
    child: Option<Child>,
    pid: u32,
    label: String,
}

impl ChildGuard {
    /// Spawns `cmd` with stdout and stderr appended to `log`.
    ///
    /// A missing or non-executable program maps to `ToolUnavailable`.
    pub fn spawn(cmd: &mut Command, label: &str, log: &Path) -> ProfResult<Self> {
        let out = File::options().create(true).append(true).open(log)?;
        let err = out.try_clone()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err));

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                ProfError::ToolUnavailable(format!(
                    "{label}: cannot execute {:?}: {e}",
                    cmd.get_program()
                ))
            }
            _ => ProfError::Io(e),
        })?;
        let pid = child.id();
        tracing::debug!(pid, "{label} spawned");
        Ok(Self {
            child: Some(child),
            pid,
            label: label.to_string(),
        })
    }

    pub fn id(&self) -> u32 {
        self.pid
    }

    /// True while the child has not exited (or has not been reaped yet).
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Asks the child to finish gracefully.
    pub fn interrupt(&mut self) -> ProfResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        signal_child(self.pid, Signal::Interrupt, self.child.as_mut())?;
        Ok(())
    }

    /// Waits for the child to exit, at most `timeout`. `None` means it is still running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> ProfResult<Option<ExitStatus>> {
        let Some(child) = self.child.as_mut() else {
            return Err(ProfError::InvalidState(format!("{} already reaped", self.label)));
        };
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                self.child = None;
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Forcibly stops and reaps the child. Safe to call repeatedly.
    pub fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        tracing::warn!(pid = self.pid, "terminating {}", self.label);
        let _ = signal_child(self.pid, Signal::Terminate, Some(&mut child));
        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
        let _ = signal_child(self.pid, Signal::Kill, Some(&mut child));
        let _ = child.wait();
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Runs `cmd` to completion within `timeout`; nonzero exit or timeout is `RecordingFailed`.
pub fn run_bounded(cmd: &mut Command, label: &str, log: &Path, timeout: Duration) -> ProfResult<()> {
    let mut guard = ChildGuard::spawn(cmd, label, log)?;
    match guard.wait_timeout(timeout)? {
        Some(status) if status.success() => Ok(()),
        Some(status) => Err(ProfError::RecordingFailed(format!(
            "{label} exited with {}: {}",
            format_status(status),
            crate::tail_lines(log, 5)
        ))),
        None => {
            guard.terminate();
            Err(ProfError::RecordingFailed(format!(
                "{label} did not finish within {}ms",
                timeout.as_millis()
            )))
        }
    }
}

pub fn format_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => signal_description(status),
    }
}

#[cfg(unix)]
fn signal_description(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => format!("signal {sig}"),
        None => "unknown status".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_description(_status: ExitStatus) -> String {
    "unknown status".to_string()
}

/// Whether a process with this id still exists.
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_child(pid: u32, signal: Signal, _child: Option<&mut Child>) -> ProfResult<()> {
    let sig = match signal {
        Signal::Interrupt => libc::SIGINT,
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // Already exited.
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(ProfError::Io(err));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_child(_pid: u32, _signal: Signal, child: Option<&mut Child>) -> ProfResult<()> {
    if let Some(child) = child {
        child.kill()?;
    }
    Ok(())
}
