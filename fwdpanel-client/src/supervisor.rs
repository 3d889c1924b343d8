//! Restart-on-crash supervision for the local backend process.
//!
//! Restarts are paced by the same [`BackoffPolicy`] the channel client uses
//! for reconnects. A run that stays up for `stable_after` clears the failure
//! count, so only consecutive crashes count against the cap.

use std::{io, process::ExitStatus, sync::Arc, time::Duration};

use fwdpanel_core::BackoffPolicy;
use thiserror::Error;
use tokio::{
    process::Command,
    sync::watch,
    task::JoinHandle,
    time::{Instant, sleep},
};
use tracing::{error, info, warn};

use crate::config::BackendConfig;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("backend command must not be empty")]
    EmptyCommand,
    #[error("invalid restart policy: {0}")]
    InvalidPolicy(String),
    #[error("backend crashed {failures} times in a row, giving up (last: {last_status})")]
    GaveUp { failures: u32, last_status: String },
    #[error("supervisor task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The backend exited successfully on its own.
    Completed,
    /// `shutdown()` was requested; the child was killed.
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSpec {
    pub command: String,
    pub args: Vec<String>,
    pub policy: BackoffPolicy,
    pub stable_after: Duration,
}

impl From<&BackendConfig> for SupervisorSpec {
    fn from(config: &BackendConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            policy: config.restart_policy(),
            stable_after: Duration::from_millis(config.stable_after_ms),
        }
    }
}

pub struct SupervisorHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    task: JoinHandle<Result<SupervisorExit, SupervisorError>>,
}

/// Cloneable stop switch detached from the handle, for signal handlers.
#[derive(Clone)]
pub struct SupervisorStopper {
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl SupervisorStopper {
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl SupervisorHandle {
    /// Kills the running child and stops restarting it.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    #[must_use]
    pub fn stopper(&self) -> SupervisorStopper {
        SupervisorStopper {
            shutdown_tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub async fn wait(self) -> Result<SupervisorExit, SupervisorError> {
        self.task
            .await
            .map_err(|err| SupervisorError::Join(err.to_string()))?
    }
}

pub fn spawn_supervisor(spec: SupervisorSpec) -> Result<SupervisorHandle, SupervisorError> {
    if spec.command.trim().is_empty() {
        return Err(SupervisorError::EmptyCommand);
    }
    spec.policy
        .validate()
        .map_err(|err| SupervisorError::InvalidPolicy(err.to_string()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(supervise(spec, shutdown_rx));
    Ok(SupervisorHandle {
        shutdown_tx: Arc::new(shutdown_tx),
        task,
    })
}

enum RunOutcome {
    Exited(ExitStatus),
    Failed(io::Error),
    Stopped,
}

async fn supervise(
    spec: SupervisorSpec,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<SupervisorExit, SupervisorError> {
    let mut failures: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            return Ok(SupervisorExit::Stopped);
        }

        info!(command = %spec.command, args = ?spec.args, "starting backend");
        let started = Instant::now();
        let last_status = match run_once(&spec, &mut shutdown_rx).await {
            RunOutcome::Stopped => {
                info!(command = %spec.command, "backend stopped");
                return Ok(SupervisorExit::Stopped);
            }
            RunOutcome::Exited(status) if status.success() => {
                info!(command = %spec.command, "backend exited cleanly");
                return Ok(SupervisorExit::Completed);
            }
            RunOutcome::Exited(status) => status.to_string(),
            RunOutcome::Failed(err) => format!("spawn failed: {err}"),
        };

        if started.elapsed() >= spec.stable_after {
            failures = 0;
        }
        failures = failures.saturating_add(1);

        if !spec.policy.allows(failures) {
            error!(
                command = %spec.command,
                failures,
                last_status = %last_status,
                "backend keeps crashing, giving up"
            );
            return Err(SupervisorError::GaveUp {
                failures,
                last_status,
            });
        }

        let delay = spec.policy.next_delay(failures);
        warn!(
            command = %spec.command,
            failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            last_status = %last_status,
            "backend exited, restarting"
        );

        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return Ok(SupervisorExit::Stopped),
            () = sleep(delay) => {}
        }
    }
}

async fn run_once(spec: &SupervisorSpec, shutdown_rx: &mut watch::Receiver<bool>) -> RunOutcome {
    let mut child = match Command::new(&spec.command)
        .args(&spec.args)
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => return RunOutcome::Failed(err),
    };

    tokio::select! {
        biased;
        _ = shutdown_rx.changed() => {
            if let Err(err) = child.kill().await {
                warn!(command = %spec.command, "failed to kill backend: {err}");
            }
            RunOutcome::Stopped
        }
        status = child.wait() => match status {
            Ok(status) => RunOutcome::Exited(status),
            Err(err) => RunOutcome::Failed(err),
        },
    }
}
