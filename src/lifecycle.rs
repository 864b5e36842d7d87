use crate::config::LifecycleConfig;
use crate::handle::{self, ChildHandle, Escalation, ExitInfo, HandleError, PidHandle};
use crate::log::{self, LogStream};
use crate::paths::Paths;
use crate::registry::{NewServer, RegistryError, ServerRecord, ServerRegistry, ServerStatus, Transition};
use crate::sys::PidState;
use crate::template::{self, LaunchError, Template};
use std::path::PathBuf;
use std::process::ExitStatus;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub name: Option<String>,
    pub template: Template,
    pub port: u16,
    pub working_dir: PathBuf,
    pub script_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub id: String,
    pub pid: u32,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopOutcome {
    pub record: ServerRecord,
    pub escalation: Escalation,
}

#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("server not found: {0}")]
    NotFound(String),
    #[error("server {0} is already stopped")]
    AlreadyStopped(String),
    #[error(transparent)]
    Signal(#[from] HandleError),
}

impl From<RegistryError> for StopError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => StopError::NotFound(id),
            RegistryError::AlreadyStopped(id) => StopError::AlreadyStopped(id),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KillError {
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("access denied to process {0}")]
    AccessDenied(u32),
    #[error("refusing to kill protected pid {0}")]
    Protected(u32),
    #[error(transparent)]
    Signal(HandleError),
}

impl From<HandleError> for KillError {
    fn from(err: HandleError) -> Self {
        match err {
            HandleError::NotFound(pid) => KillError::NotFound(pid),
            HandleError::AccessDenied(pid) => KillError::AccessDenied(pid),
            other => KillError::Signal(other),
        }
    }
}

#[derive(Debug)]
struct ExitEvent {
    id: String,
    pid: u32,
    code: Option<i32>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Manager {
    paths: Paths,
    config: LifecycleConfig,
    registry: ServerRegistry,
    exits: mpsc::UnboundedSender<ExitEvent>,
}

impl Manager {
    /// Must be called inside a tokio runtime; starts the reaper task.
    pub fn new(paths: Paths, config: LifecycleConfig) -> Self {
        let registry = ServerRegistry::new();
        let (exits, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_reaper(registry.clone(), rx));
        Self {
            paths,
            config,
            registry,
            exits,
        }
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub async fn list(&self) -> Vec<ServerRecord> {
        self.registry.list().await
    }

    pub async fn launch(&self, request: LaunchRequest) -> Result<Launched, LaunchError> {
        let plan = template::plan(
            request.template,
            request.port,
            &request.working_dir,
            request.script_file.as_deref(),
            &self.config,
        )?;
        plan.materialize().await?;

        let key = self.registry.allocate_id().await;
        let id = key.to_string();
        tokio::fs::create_dir_all(self.paths.log_dir())
            .await
            .map_err(LaunchError::Spawn)?;

        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .envs(plan.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&plan.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LaunchError::RuntimeMissing(plan.program.clone()),
            _ => LaunchError::Spawn(e),
        })?;
        let Some(pid) = child.id() else {
            return Err(LaunchError::ExitedImmediately("unknown status".to_string()));
        };

        if let Some(stdout) = child.stdout.take() {
            log::spawn_log_copier(
                id.clone(),
                LogStream::Stdout,
                stdout,
                self.paths.stdout_log(&id),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            log::spawn_log_copier(
                id.clone(),
                LogStream::Stderr,
                stderr,
                self.paths.stderr_log(&id),
            );
        }

        let early_exit = child.try_wait().ok().flatten();
        let (exit_tx, exit_rx) = watch::channel(None);
        let record = self
            .registry
            .insert(NewServer {
                id: key,
                name: request
                    .name
                    .unwrap_or_else(|| format!("{}-{}", request.template, request.port)),
                template: request.template,
                port: request.port,
                working_dir: request.working_dir,
                pid,
                exited: exit_rx,
            })
            .await;

        self.check_early_exit(&id, early_exit, &exit_tx).await?;

        spawn_monitor(id.clone(), pid, child, exit_tx, self.exits.clone());
        tracing::info!(
            server = %id,
            name = %record.name,
            pid,
            port = record.port,
            command = %plan.command_line(),
            "launched server"
        );

        Ok(Launched {
            id,
            pid,
            port: record.port,
        })
    }

    /// Moves a just-inserted record to FAILED when its child is already gone
    /// with an unsuccessful status.
    async fn check_early_exit(
        &self,
        id: &str,
        early_exit: Option<ExitStatus>,
        exit_tx: &watch::Sender<Option<ExitInfo>>,
    ) -> Result<(), LaunchError> {
        let Some(status) = early_exit.filter(|s| !s.success()) else {
            return Ok(());
        };
        let _ = exit_tx.send(Some(ExitInfo {
            code: status.code(),
        }));
        self.registry.transition(id, ServerStatus::Failed).await;
        tracing::warn!(server = %id, %status, "server exited immediately");
        Err(LaunchError::ExitedImmediately(status.to_string()))
    }

    /// Graceful stop with escalation. Blocks up to the kill timeout.
    pub async fn stop(&self, id: &str) -> Result<StopOutcome, StopError> {
        let mut child: ChildHandle = self.registry.begin_stop(id).await?;

        let escalation = match handle::escalate(&mut child, self.config.kill_timeout()).await {
            Ok(escalation) => escalation,
            Err(e) => {
                self.registry.release_stop(id).await;
                return Err(e.into());
            }
        };

        let record = match self.registry.transition(id, ServerStatus::Stopped).await {
            Transition::Applied(record) => record,
            // The reaper got there first.
            Transition::AlreadyTerminal(_) | Transition::NotFound => self
                .registry
                .get(id)
                .await
                .ok_or_else(|| StopError::NotFound(id.to_string()))?,
        };
        tracing::info!(server = %id, pid = record.pid, ?escalation, "stopped server");
        Ok(StopOutcome { record, escalation })
    }

    /// Terminate an arbitrary OS process. Registry state follows via the
    /// monitor when the pid belongs to a managed server.
    pub async fn kill_pid(&self, pid: u32) -> Result<Escalation, KillError> {
        if pid == 0 || pid == std::process::id() {
            return Err(KillError::Protected(pid));
        }

        let mut target = PidHandle::new(pid);
        match target.state() {
            PidState::Gone => return Err(KillError::NotFound(pid)),
            PidState::Foreign => return Err(KillError::AccessDenied(pid)),
            PidState::Alive => {}
        }

        let escalation = handle::escalate(&mut target, self.config.kill_timeout()).await?;
        tracing::info!(pid, ?escalation, "killed process");
        Ok(escalation)
    }

    /// Last `lines` lines of a server's captured output, oldest first.
    pub async fn read_log(&self, id: &str, lines: usize) -> Result<Vec<String>, StopError> {
        if self.registry.get(id).await.is_none() {
            return Err(StopError::NotFound(id.to_string()));
        }

        let stdout = self.paths.stdout_log(id);
        let stderr = self.paths.stderr_log(id);
        let tails = tokio::task::spawn_blocking(move || {
            let out = log::tail_file(&stdout, lines).unwrap_or_default();
            let err = log::tail_file(&stderr, lines).unwrap_or_default();
            (out, err)
        })
        .await;
        let (out, err) = tails.unwrap_or_default();

        Ok(merge_tails(out, err, lines))
    }

    /// Stop every RUNNING server concurrently.
    pub async fn shutdown_all(&self) {
        let mut set = JoinSet::new();
        for id in self.registry.running_ids().await {
            let manager = self.clone();
            set.spawn(async move {
                if let Err(e) = manager.stop(&id).await {
                    tracing::warn!(server = %id, error = %e, "failed to stop server on shutdown");
                }
            });
        }
        while set.join_next().await.is_some() {}
    }
}

// ---------------------------------------------------------------------------
// Monitor and reaper
// ---------------------------------------------------------------------------

fn spawn_monitor(
    id: String,
    pid: u32,
    mut child: Child,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    exits: mpsc::UnboundedSender<ExitEvent>,
) {
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(server = %id, pid, error = %e, "failed to wait on child");
                None
            }
        };
        let _ = exit_tx.send(Some(ExitInfo { code }));
        let _ = exits.send(ExitEvent { id, pid, code });
    });
}

async fn run_reaper(registry: ServerRegistry, mut exits: mpsc::UnboundedReceiver<ExitEvent>) {
    while let Some(event) = exits.recv().await {
        match registry.transition(&event.id, ServerStatus::Stopped).await {
            Transition::Applied(_) => {
                tracing::info!(server = %event.id, pid = event.pid, code = ?event.code, "server exited");
            }
            Transition::AlreadyTerminal(status) => {
                tracing::debug!(server = %event.id, %status, "exit after terminal transition");
            }
            Transition::NotFound => {
                tracing::warn!(server = %event.id, "exit event for unknown server");
            }
        }
    }
}

/// Interleave stdout and stderr tails by their timestamp prefix.
fn merge_tails(out: Vec<String>, err: Vec<String>, lines: usize) -> Vec<String> {
    let mut merged: Vec<(String, LogStream)> = out
        .into_iter()
        .map(|l| (l, LogStream::Stdout))
        .chain(err.into_iter().map(|l| (l, LogStream::Stderr)))
        .collect();
    merged.sort_by(|(a, _), (b, _)| timestamp_of(a).cmp(timestamp_of(b)));

    let skip = merged.len().saturating_sub(lines);
    merged
        .into_iter()
        .skip(skip)
        .map(|(line, stream)| format!("[{stream}] {line}"))
        .collect()
}

fn timestamp_of(line: &str) -> &str {
    line.split_once(" | ").map_or("", |(ts, _)| ts)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
