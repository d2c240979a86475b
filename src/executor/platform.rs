//! OS process control: liveness probes and process-tree termination.

use crate::error::ExecError;

/// Liveness and termination for recorded pids.
///
/// A pid may have been recycled by the OS, so callers probe `is_alive`
/// right before acting on one.
pub trait ProcessControl: Send + Sync {
    /// Whether a process with this pid currently exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Terminate the process group / tree rooted at `pid`. A process that
    /// is already gone is not an error.
    fn terminate_tree(&self, pid: u32) -> Result<(), ExecError>;
}

/// The host operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

#[cfg(unix)]
impl ProcessControl for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        // Signal 0 probes existence without delivering anything.
        if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn terminate_tree(&self, pid: u32) -> Result<(), ExecError> {
        if pid == 0 || pid > i32::MAX as u32 {
            return Ok(());
        }
        let pid = pid as libc::pid_t;

        // Children are spawned as group leaders, so -pid reaches the tree.
        if unsafe { libc::kill(-pid, libc::SIGTERM) } == 0 {
            return Ok(());
        }
        if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(ExecError::Signal {
            pid: pid as u32,
            reason: err.to_string(),
        })
    }
}

#[cfg(windows)]
impl ProcessControl for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH"])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }

    fn terminate_tree(&self, pid: u32) -> Result<(), ExecError> {
        if !self.is_alive(pid) {
            return Ok(());
        }
        let out = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output()
            .map_err(|e| ExecError::Signal {
                pid,
                reason: e.to_string(),
            })?;
        if out.status.success() || !self.is_alive(pid) {
            Ok(())
        } else {
            Err(ExecError::Signal {
                pid,
                reason: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(SystemProcesses.is_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_and_out_of_range_are_dead() {
        assert!(!SystemProcesses.is_alive(0));
        assert!(!SystemProcesses.is_alive(u32::MAX));
    }

    #[test]
    fn exited_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!SystemProcesses.is_alive(pid));
        // Terminating a gone process is a no-op.
        assert!(SystemProcesses.terminate_tree(pid).is_ok());
    }

    #[test]
    fn terminate_kills_running_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(SystemProcesses.is_alive(pid));
        SystemProcesses.terminate_tree(pid).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
