//! Process management for managed servers.
//!
//! Commands are shell-interpreted and spawned into their own process group
//! so that stopping a server also takes down any descendants the shell
//! line produced. The diagnostic pipe is drained continuously into the log.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::core::errors::FleetError;

/// A spawned child with its stdio pipes detached for the adapter.
pub struct SpawnedChild {
    pub process: ChildProcess,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Owns a child process and its process group.
pub struct ChildProcess {
    child: Child,
    pid: u32,
    reaped: bool,
}

impl ChildProcess {
    /// Spawn `sh -c <command>` with piped stdio in a fresh process group.
    ///
    /// The stderr pipe is drained by a background task for the child's
    /// whole lifetime so the child can never block on it.
    pub fn spawn(name: &str, command: &str) -> Result<SpawnedChild, FleetError> {
        debug!(server = name, command, "spawning child process");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // SAFETY: setpgid in the forked child before exec is the standard
        // way to give the shell line its own process group; the call is
        // async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| FleetError::Process(format!("failed to spawn '{command}': {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| FleetError::Process("child exited before it could be tracked".into()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FleetError::Process("child stdin pipe missing".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FleetError::Process("child stdout pipe missing".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FleetError::Process("child stderr pipe missing".into()))?;

        let server = name.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            while let Ok(n) = reader.read_line(&mut line).await {
                if n == 0 {
                    break;
                }
                debug!(server = %server, "child stderr: {}", line.trim_end());
                line.clear();
            }
        });

        Ok(SpawnedChild {
            process: ChildProcess {
                child,
                pid,
                reaped: false,
            },
            stdin,
            stdout,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// SIGTERM the whole process group.
    pub fn terminate_group(&self) {
        signal_group(self.pid, libc::SIGTERM);
    }

    /// SIGTERM the group, reap the direct child, escalate to SIGKILL if the
    /// reap does not complete within two seconds.
    pub async fn shutdown(mut self) {
        self.terminate_group();
        match tokio::time::timeout(std::time::Duration::from_secs(2), self.child.wait()).await {
            Ok(Ok(status)) => debug!(pid = self.pid, %status, "child exited"),
            Ok(Err(e)) => warn!(pid = self.pid, error = %e, "failed to reap child"),
            Err(_) => {
                warn!(pid = self.pid, "child ignored SIGTERM, killing group");
                signal_group(self.pid, libc::SIGKILL);
                let _ = self.child.wait().await;
            }
        }
        self.reaped = true;
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        // Last line of defense if shutdown() was never awaited. The reaped
        // flag keeps a recycled pid from being signalled.
        if self.reaped {
            return;
        }
        let _ = self.child.start_kill();
        signal_group(self.pid, libc::SIGKILL);
    }
}

/// Send `sig` to the process group led by `pid`.
pub fn signal_group(pid: u32, sig: i32) {
    // SAFETY: plain syscall; a negative pid addresses the group.
    unsafe {
        libc::kill(-(pid as i32), sig);
    }
}

/// Send `sig` to a single process by pid.
pub fn signal_pid(pid: u32, sig: i32) -> bool {
    // SAFETY: plain syscall.
    unsafe { libc::kill(pid as i32, sig) == 0 }
}

/// Zero-signal probe: true if `pid` names a live process we may signal.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    signal_pid(pid, 0)
}
