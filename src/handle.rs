use crate::sys::{self, PidState, SignalError};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 5000;
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait for SIGKILL to take effect before giving up on observing it.
pub const FORCE_KILL_GRACE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("access denied signalling process {0}")]
    AccessDenied(u32),
    #[error("failed to signal process {pid}: {source}")]
    Io {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

impl HandleError {
    fn from_signal(pid: u32, err: SignalError) -> Self {
        match err {
            SignalError::NoSuchProcess => HandleError::NotFound(pid),
            SignalError::PermissionDenied => HandleError::AccessDenied(pid),
            SignalError::Io(source) => HandleError::Io { pid, source },
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

/// Control surface over one OS process.
pub trait ProcessHandle {
    fn pid(&self) -> u32;

    fn is_alive(&self) -> bool;

    /// Ask the process to exit.
    fn terminate(&self) -> Result<(), HandleError>;

    fn force_kill(&self) -> Result<(), HandleError>;

    /// Wait up to `timeout` for the process to exit. Returns true once it has.
    fn wait(&mut self, timeout: Duration) -> impl Future<Output = bool> + Send;
}

/// Handle on an arbitrary pid that we did not spawn. Exit is observed by polling.
#[derive(Debug, Clone, Copy)]
pub struct PidHandle {
    pid: u32,
}

impl PidHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn state(&self) -> PidState {
        sys::check_pid(self.pid)
    }
}

impl ProcessHandle for PidHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        sys::is_pid_alive(self.pid)
    }

    fn terminate(&self) -> Result<(), HandleError> {
        sys::terminate(self.pid).map_err(|e| HandleError::from_signal(self.pid, e))
    }

    fn force_kill(&self) -> Result<(), HandleError> {
        sys::force_kill(self.pid).map_err(|e| HandleError::from_signal(self.pid, e))
    }

    async fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.is_alive() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        true
    }
}

/// Exit information published by a child's monitor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

/// Handle on a child we spawned. The monitor task owns the `Child` and
/// publishes its exit on a watch channel, so waiting never races the reaper.
#[derive(Debug, Clone)]
pub struct ChildHandle {
    pid: u32,
    exited: watch::Receiver<Option<ExitInfo>>,
}

impl ChildHandle {
    pub fn new(pid: u32, exited: watch::Receiver<Option<ExitInfo>>) -> Self {
        Self { pid, exited }
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exited.borrow()
    }

    fn signal_result(&self, result: Result<(), SignalError>) -> Result<(), HandleError> {
        match result {
            Ok(()) => Ok(()),
            // Reaped between the liveness check and the signal.
            Err(SignalError::NoSuchProcess) if self.exit_info().is_some() => Ok(()),
            Err(e) => Err(HandleError::from_signal(self.pid, e)),
        }
    }
}

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.exit_info().is_none()
    }

    fn terminate(&self) -> Result<(), HandleError> {
        if !self.is_alive() {
            return Ok(());
        }
        self.signal_result(sys::terminate(self.pid))
    }

    fn force_kill(&self) -> Result<(), HandleError> {
        if !self.is_alive() {
            return Ok(());
        }
        self.signal_result(sys::force_kill(self.pid))
    }

    async fn wait(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.exited.wait_for(|e| e.is_some())).await {
            Ok(Ok(_)) => true,
            // Sender dropped without publishing: the monitor is gone, so is the child.
            Ok(Err(_)) => true,
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    AlreadyExited,
    Terminated,
    ForceKilled,
}

/// Graceful terminate, bounded wait, then forced kill.
///
/// A process that disappears at any point counts as success; a forced kill of
/// an already-exited process is a no-op.
pub async fn escalate<H: ProcessHandle>(
    handle: &mut H,
    timeout: Duration,
) -> Result<Escalation, HandleError> {
    match handle.terminate() {
        Ok(()) => {}
        Err(HandleError::NotFound(_)) => return Ok(Escalation::AlreadyExited),
        Err(e) => return Err(e),
    }

    if handle.wait(timeout).await {
        return Ok(Escalation::Terminated);
    }

    tracing::debug!(pid = handle.pid(), "graceful stop timed out, sending SIGKILL");
    match handle.force_kill() {
        Ok(()) | Err(HandleError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    handle.wait(FORCE_KILL_GRACE).await;
    Ok(Escalation::ForceKilled)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spawn_sleep() -> std::process::Child {
        std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_pid_handle_nonexistent_is_not_found() {
        let mut handle = PidHandle::new(4_194_999);
        assert!(!handle.is_alive());
        let result = escalate(&mut handle, Duration::from_millis(100)).await;
        assert!(matches!(result, Ok(Escalation::AlreadyExited)));
    }

    #[tokio::test]
    async fn test_pid_handle_terminates_sleep() {
        let mut child = spawn_sleep();
        let pid = child.id();
        // Reap in the background so the pid disappears once signalled.
        let reaper = std::thread::spawn(move || child.wait());

        let mut handle = PidHandle::new(pid);
        assert!(handle.is_alive());
        let outcome = escalate(&mut handle, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, Escalation::Terminated);
        reaper.join().unwrap().unwrap();
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_pid_handle_escalates_when_term_ignored() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        let pid = child.id();
        // Give the shell a moment to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let reaper = std::thread::spawn(move || child.wait());

        let mut handle = PidHandle::new(pid);
        let outcome = escalate(&mut handle, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, Escalation::ForceKilled);
        reaper.join().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_child_handle_wait_sees_published_exit() {
        let (tx, rx) = watch::channel(None);
        let mut handle = ChildHandle::new(4_194_999, rx);
        assert!(handle.is_alive());
        assert!(!handle.wait(Duration::from_millis(50)).await);

        tx.send(Some(ExitInfo { code: Some(0) })).unwrap();
        assert!(handle.wait(Duration::from_millis(50)).await);
        assert!(!handle.is_alive());
        // Signals to an exited child are no-ops.
        assert!(handle.terminate().is_ok());
        assert!(handle.force_kill().is_ok());
    }

    #[tokio::test]
    async fn test_child_handle_dropped_sender_counts_as_exit() {
        let (tx, rx) = watch::channel(None);
        let mut handle = ChildHandle::new(4_194_999, rx);
        drop(tx);
        assert!(handle.wait(Duration::from_millis(50)).await);
    }
}
