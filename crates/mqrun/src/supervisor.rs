use std::{
    fs,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use anyhow::Context;
use mqrun_process::{LifecycleState, ProbeOutcome, StopOutcome};
use tokio::process::{Child, Command};

use crate::artifact_cache;
use crate::config::SupervisorConfig;
use crate::pid_record::{PidRecord, RecordedPid};
use crate::port_probe;
use crate::signal;

#[derive(Debug, Clone)]
pub struct StartReport {
    pub pid: u32,
    pub artifact: PathBuf,
    pub probe: ProbeOutcome,
    pub state: LifecycleState,
    /// Pid from an earlier record that was still alive when it was overwritten.
    pub replaced: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct StatusReport {
    pub probe: ProbeOutcome,
    pub state: LifecycleState,
}

#[derive(Debug, Clone)]
pub struct StopReport {
    pub outcome: StopOutcome,
    pub probe: ProbeOutcome,
    pub state: LifecycleState,
}

#[derive(Debug)]
pub struct ConsoleReport {
    pub pid: u32,
    /// `None` when the server exited before the port wait finished.
    pub probe: Option<ProbeOutcome>,
    pub exit: ExitStatus,
    pub interrupted: bool,
}

/// Runs one server artifact on one port: fetch, launch, verify, stop.
#[derive(Debug, Clone)]
pub struct Supervisor {
    cfg: SupervisorConfig,
    record: PidRecord,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig) -> Self {
        let record = PidRecord::new(cfg.pid_file_path.clone());
        Self { cfg, record }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.cfg
    }

    fn ensure_cache_dir(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.cfg.cache_dir)
            .with_context(|| format!("create cache dir {}", self.cfg.cache_dir.display()))
    }

    async fn resolve_artifact(&self) -> anyhow::Result<PathBuf> {
        artifact_cache::ensure(&self.cfg.source_url, &self.cfg.cache_dir, self.cfg.tls).await
    }

    fn command(&self, artifact: &Path) -> Command {
        let mut cmd = Command::new(&self.cfg.launch.program);
        cmd.args(self.cfg.launch.render(artifact))
            .current_dir(&self.cfg.install_dir);
        cmd
    }

    fn spawn_failed(&self, artifact: &Path) -> String {
        format!(
            "spawn `{}` (cwd {})",
            self.cfg.launch.display(artifact),
            self.cfg.install_dir.display()
        )
    }

    /// Launch the server in its own session and return once the port answers
    /// or the start budget is spent. An unreachable port is reported, not fatal.
    pub async fn start(&self) -> anyhow::Result<StartReport> {
        self.ensure_cache_dir()?;
        let artifact = self.resolve_artifact().await?;

        println!("Will run and detach from CLI and return to prompt...");
        let (pid, replaced) = {
            let _lock = self.record.lock()?;
            let replaced = self.warn_if_record_live();
            let pid = self.spawn_detached(&artifact)?;
            self.record.write(pid)?;
            (pid, replaced)
        };
        tracing::info!(
            pid,
            port = self.cfg.listen_port,
            record = %self.record.path().display(),
            log = %self.cfg.server_log_path().display(),
            "server started in background"
        );

        let probe = port_probe::wait_until_open(self.cfg.listen_port, self.cfg.start_budget).await;
        let state = LifecycleState::Starting.settle(probe);
        if state == LifecycleState::Unconfirmed {
            tracing::warn!(
                pid,
                port = self.cfg.listen_port,
                attempts = probe.attempts,
                "server did not open its port within the start budget"
            );
        }
        Ok(StartReport {
            pid,
            artifact,
            probe,
            state,
            replaced,
        })
    }

    /// The record is about to be overwritten; say so if it names a live process.
    /// Call with the record lock held.
    fn warn_if_record_live(&self) -> Option<u32> {
        let old = match self.record.read() {
            Ok(Some(RecordedPid::Pid(old))) if signal::is_alive(old) => old,
            _ => return None,
        };
        println!(
            "Replacing pid record for port {}; previous server (pid {old}) may still be running",
            self.cfg.listen_port
        );
        tracing::warn!(
            pid = old,
            port = self.cfg.listen_port,
            record = %self.record.path().display(),
            "overwriting pid record of a live process"
        );
        Some(old)
    }

    fn spawn_detached(&self, artifact: &Path) -> anyhow::Result<u32> {
        let log_path = self.cfg.server_log_path();
        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("open server log {}", log_path.display()))?;
        let log_err = log.try_clone()?;

        let mut cmd = self.command(artifact);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(crate::supervisor_support::detach_from_session);
            }
        }

        tracing::debug!(cmd = %self.cfg.launch.display(artifact), "spawning detached server");
        let child = cmd
            .spawn()
            .with_context(|| self.spawn_failed(artifact))?;
        // Dropping the handle leaves the process running; the PID record is the
        // only reference kept.
        child
            .id()
            .ok_or_else(|| anyhow::anyhow!("server exited before its pid was known"))
    }

    /// Run the server attached to this terminal until it exits or Ctrl-C.
    pub async fn console(&self) -> anyhow::Result<ConsoleReport> {
        self.ensure_cache_dir()?;
        let artifact = self.resolve_artifact().await?;

        println!("Entered console mode (blocking, Ctrl-C to breakout)...");
        let (mut child, pid) = {
            let _lock = self.record.lock()?;
            self.warn_if_record_live();
            let child = self
                .command(&artifact)
                .spawn()
                .with_context(|| self.spawn_failed(&artifact))?;
            let pid = child
                .id()
                .ok_or_else(|| anyhow::anyhow!("server exited before its pid was known"))?;
            self.record.write(pid)?;
            (child, pid)
        };
        tracing::info!(pid, port = self.cfg.listen_port, "server started in console mode");

        let waited = self.wait_in_console(&mut child, pid).await;
        self.forget_if_current(pid);
        let (exit, probe, interrupted) = waited?;

        println!("Server exited with {exit}");
        Ok(ConsoleReport {
            pid,
            probe,
            exit,
            interrupted,
        })
    }

    async fn wait_in_console(
        &self,
        child: &mut Child,
        pid: u32,
    ) -> anyhow::Result<(ExitStatus, Option<ProbeOutcome>, bool)> {
        let probe = port_probe::wait_until_open(self.cfg.listen_port, self.cfg.start_budget);
        tokio::pin!(probe);
        let mut probed: Option<ProbeOutcome> = None;
        let mut interrupted = false;
        let mut ctrl_c_armed = true;

        let exit = loop {
            tokio::select! {
                status = child.wait() => break status.context("wait for server")?,
                outcome = &mut probe, if probed.is_none() => {
                    probed = Some(outcome);
                }
                res = tokio::signal::ctrl_c(), if ctrl_c_armed => {
                    ctrl_c_armed = false;
                    interrupted = on_ctrl_c(res, pid);
                }
            }
        };
        Ok((exit, probed, interrupted))
    }

    /// Drop the PID record if it still names `pid`.
    fn forget_if_current(&self, pid: u32) {
        let res = self.record.lock().and_then(|_lock| match self.record.read()? {
            Some(RecordedPid::Pid(current)) if current == pid => self.record.remove().map(|_| ()),
            _ => Ok(()),
        });
        if let Err(e) = res {
            tracing::warn!(pid, error = %e, "failed to clean up pid record");
        }
    }

    /// One probe; never looks at the PID record.
    pub async fn status(&self) -> StatusReport {
        let probe = port_probe::wait_until_open(self.cfg.listen_port, self.cfg.status_budget).await;
        StatusReport {
            probe,
            state: LifecycleState::Unknown.settle(probe),
        }
    }

    /// Signal the recorded process and wait for the port to close.
    ///
    /// Every failure while signalling is swallowed: the record is removed and
    /// the stop counts as done.
    pub async fn stop(&self) -> anyhow::Result<StopReport> {
        self.ensure_cache_dir()?;
        let outcome = {
            let _lock = self.record.lock()?;
            self.signal_recorded()
        };
        match &outcome {
            StopOutcome::AlreadyStopped => println!("Already stopped."),
            StopOutcome::Signalled(pid) => tracing::info!(pid, "sent SIGTERM"),
            StopOutcome::StaleRecordRemoved(reason) => {
                tracing::warn!(reason = %reason, "removed stale pid record")
            }
        }

        let probe =
            port_probe::wait_until_closed(self.cfg.listen_port, self.cfg.stop_budget).await;
        let state = LifecycleState::Stopping.settle(probe);
        Ok(StopReport {
            outcome,
            probe,
            state,
        })
    }

    fn signal_recorded(&self) -> StopOutcome {
        let recorded = match self.record.read() {
            Ok(None) => return StopOutcome::AlreadyStopped,
            Ok(Some(recorded)) => recorded,
            Err(e) => {
                return self.drop_stale(format!("{e:#}"));
            }
        };

        let pid = match recorded {
            RecordedPid::Pid(pid) => pid,
            RecordedPid::Corrupt(raw) => {
                println!("Kill process with pid: {}", raw.trim());
                return self.drop_stale(format!("unparsable pid record: {:?}", raw.trim()));
            }
        };

        println!("Kill process with pid: {pid}");
        match signal::terminate(pid) {
            Ok(()) => {
                if let Err(e) = self.record.remove() {
                    tracing::warn!(pid, error = %e, "failed to remove pid record");
                }
                StopOutcome::Signalled(pid)
            }
            Err(e) => self.drop_stale(e.to_string()),
        }
    }

    fn drop_stale(&self, reason: String) -> StopOutcome {
        if let Err(e) = self.record.remove() {
            tracing::warn!(error = %e, "failed to remove pid record");
        }
        StopOutcome::StaleRecordRemoved(reason)
    }
}

/// Handles the Ctrl-C listener firing in console mode; returns whether the
/// user interrupted. If the listener itself failed, the server is left alone.
fn on_ctrl_c(res: std::io::Result<()>, pid: u32) -> bool {
    if let Err(e) = res {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C; console can only end with the server");
        return false;
    }
    println!("Interrupted, stopping server...");
    if let Err(e) = signal::terminate(pid) {
        tracing::warn!(pid, error = %e, "failed to signal console server");
    }
    true
}
