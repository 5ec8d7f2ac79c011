//! Daemon harness: foreground run, background detach, stop and status.

use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::control;
use crate::core::errors::FleetError;
use crate::mcp::process::{pid_alive, signal_pid};
use crate::settings::Settings;
use crate::supervisor::Supervisor;

/// Default control-plane port.
pub const DEFAULT_PORT: u16 = 8080;

/// How long `start` waits before probing the fresh pid file.
const STARTUP_GRACE: Duration = Duration::from_secs(2);
/// Poll cadence and bound while waiting for a stopping daemon.
const STOP_POLL: Duration = Duration::from_millis(500);
const STOP_ATTEMPTS: u32 = 10;

pub struct Daemon {
    settings: Settings,
    port: u16,
}

impl Daemon {
    pub fn new(settings: Settings, port: u16) -> Result<Self, FleetError> {
        settings.ensure_dirs()?;
        Ok(Self { settings, port })
    }

    /// Foreground mode: write the pid file, serve the control plane, block
    /// until a signal or a listener failure, then stop everything.
    pub async fn run(&self) -> Result<(), FleetError> {
        info!(port = self.port, "starting daemon");
        self.write_pid_file()?;
        let result = self.run_inner().await;
        self.remove_pid_file();
        result
    }

    async fn run_inner(&self) -> Result<(), FleetError> {
        let supervisor = Supervisor::new(self.settings.clone()).await?;

        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| {
                FleetError::Transport(format!("failed to bind control port {}: {e}", self.port))
            })?;

        let token = CancellationToken::new();
        let signal_token = token.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            signal_token.cancel();
        });

        let result = control::serve(supervisor.clone(), listener, token).await;
        if let Err(ref e) = result {
            error!(error = %e, "control plane server failed");
        }

        info!("shutting down supervisor");
        supervisor.shutdown().await;
        result
    }

    /// Background mode: re-exec this binary with the `run` subcommand,
    /// detached into its own session, stdout/stderr appended to the daemon
    /// log; then probe the fresh pid file.
    pub async fn start(&self) -> Result<(), FleetError> {
        if self.is_running() {
            return Err(FleetError::Precondition("daemon is already running".into()));
        }

        let exe = std::env::current_exe()?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.settings.daemon_log_path())?;
        let log_err = log.try_clone()?;

        let mut cmd = std::process::Command::new(exe);
        cmd.arg("run")
            .arg("--port")
            .arg(self.port.to_string())
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);
        // SAFETY: setsid in the forked child detaches it from our session
        // and controlling terminal; the call is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        cmd.spawn()
            .map_err(|e| FleetError::Process(format!("failed to spawn daemon: {e}")))?;

        tokio::time::sleep(STARTUP_GRACE).await;
        if !self.is_running() {
            return Err(FleetError::Process(format!(
                "daemon failed to start, see {}",
                self.settings.daemon_log_path().display()
            )));
        }

        println!(
            "Daemon started successfully (PID: {})",
            self.read_pid().unwrap_or(0)
        );
        println!("Logs: {}", self.settings.daemon_log_path().display());
        Ok(())
    }

    /// SIGTERM the daemon, poll for exit up to five seconds, escalate to
    /// SIGKILL, remove the pid file.
    pub async fn stop(&self) -> Result<(), FleetError> {
        let Some(pid) = self.read_pid() else {
            return Err(FleetError::Precondition("daemon is not running".into()));
        };
        if !pid_alive(pid) {
            self.remove_pid_file();
            return Err(FleetError::Precondition("daemon is not running".into()));
        }

        if !signal_pid(pid, libc::SIGTERM) {
            return Err(FleetError::Process(format!(
                "failed to signal daemon pid {pid}"
            )));
        }

        for _ in 0..STOP_ATTEMPTS {
            if !pid_alive(pid) {
                self.remove_pid_file();
                println!("Daemon stopped successfully");
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL).await;
        }

        signal_pid(pid, libc::SIGKILL);
        self.remove_pid_file();
        println!("Daemon killed after timeout");
        Ok(())
    }

    pub fn status(&self) -> String {
        match self.read_pid() {
            Some(pid) if pid_alive(pid) => format!("Daemon is running (PID: {pid})"),
            _ => "Daemon is not running".to_string(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.read_pid().map(pid_alive).unwrap_or(false)
    }

    fn write_pid_file(&self) -> Result<(), FleetError> {
        std::fs::write(
            self.settings.daemon_pid_path(),
            std::process::id().to_string(),
        )?;
        Ok(())
    }

    fn read_pid(&self) -> Option<u32> {
        let data = std::fs::read_to_string(self.settings.daemon_pid_path()).ok()?;
        data.trim().parse().ok()
    }

    fn remove_pid_file(&self) {
        let _ = std::fs::remove_file(self.settings.daemon_pid_path());
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon_in(dir: &std::path::Path) -> Daemon {
        let settings = Settings::new(dir.join("cfg"), dir.join("state"));
        Daemon::new(settings, DEFAULT_PORT).unwrap()
    }

    #[tokio::test]
    async fn status_without_pid_file_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let d = daemon_in(dir.path());
        assert_eq!(d.status(), "Daemon is not running");
        assert!(!d.is_running());
    }

    #[tokio::test]
    async fn stop_without_pid_file_is_a_precondition_error() {
        let dir = tempfile::tempdir().unwrap();
        let d = daemon_in(dir.path());
        assert!(matches!(
            d.stop().await.unwrap_err(),
            FleetError::Precondition(_)
        ));
    }

    #[tokio::test]
    async fn live_pid_file_reports_running() {
        let dir = tempfile::tempdir().unwrap();
        let d = daemon_in(dir.path());
        // Our own pid is certainly alive.
        std::fs::write(
            d.settings.daemon_pid_path(),
            std::process::id().to_string(),
        )
        .unwrap();
        assert!(d.is_running());
        assert!(d.status().contains("running"));
    }

    #[tokio::test]
    async fn stale_pid_file_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let d = daemon_in(dir.path());
        // Pid numbers this large are not handed out on Linux.
        std::fs::write(d.settings.daemon_pid_path(), "4194304").unwrap();
        assert!(!d.is_running());
    }
}
