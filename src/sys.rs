use std::io;

/// Result of probing a pid without affecting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidState {
    Alive,
    /// The process exists but belongs to someone we cannot signal.
    Foreign,
    Gone,
}

/// Errors from delivering a signal, normalized across platforms.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("no such process")]
    NoSuchProcess,
    #[error("permission denied")]
    PermissionDenied,
    #[error(transparent)]
    Io(#[from] io::Error),
}

// =========================================================================
// Unix implementation
// =========================================================================

#[cfg(unix)]
mod platform {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    fn to_pid(pid: u32) -> Result<Pid, SignalError> {
        // pid_t is signed; anything above i32::MAX would address a process group.
        i32::try_from(pid)
            .ok()
            .filter(|p| *p > 0)
            .map(Pid::from_raw)
            .ok_or(SignalError::NoSuchProcess)
    }

    fn deliver(pid: u32, sig: Option<Signal>) -> Result<(), SignalError> {
        let pid = to_pid(pid)?;
        match signal::kill(pid, sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(SignalError::NoSuchProcess),
            Err(Errno::EPERM) => Err(SignalError::PermissionDenied),
            Err(e) => Err(SignalError::Io(io::Error::other(e))),
        }
    }

    pub fn check_pid(pid: u32) -> PidState {
        match deliver(pid, None) {
            Ok(()) => PidState::Alive,
            Err(SignalError::PermissionDenied) => PidState::Foreign,
            Err(_) => PidState::Gone,
        }
    }

    pub fn terminate(pid: u32) -> Result<(), SignalError> {
        deliver(pid, Some(Signal::SIGTERM))
    }

    pub fn force_kill(pid: u32) -> Result<(), SignalError> {
        deliver(pid, Some(Signal::SIGKILL))
    }

    pub fn configure_daemon_cmd(cmd: &mut std::process::Command) {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    pub async fn signal_shutdown() {
        use tokio::signal::unix::{SignalKind, signal};

        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            tracing::warn!("could not install signal handlers, relying on shutdown requests");
            std::future::pending::<()>().await;
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
}

// =========================================================================
// Windows implementation
// =========================================================================

#[cfg(windows)]
mod platform {
    use super::*;
    use windows_sys::Win32::Foundation::{CloseHandle, ERROR_ACCESS_DENIED, GetLastError};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_TERMINATE,
        TerminateProcess,
    };

    const STILL_ACTIVE: u32 = 259;

    pub fn check_pid(pid: u32) -> PidState {
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                return if GetLastError() == ERROR_ACCESS_DENIED {
                    PidState::Foreign
                } else {
                    PidState::Gone
                };
            }
            let mut exit_code: u32 = 0;
            let result = GetExitCodeProcess(handle, &mut exit_code);
            CloseHandle(handle);
            if result != 0 && exit_code == STILL_ACTIVE {
                PidState::Alive
            } else {
                PidState::Gone
            }
        }
    }

    // Windows has no polite signal for arbitrary processes; both paths terminate.
    pub fn terminate(pid: u32) -> Result<(), SignalError> {
        terminate_process(pid)
    }

    pub fn force_kill(pid: u32) -> Result<(), SignalError> {
        terminate_process(pid)
    }

    fn terminate_process(pid: u32) -> Result<(), SignalError> {
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return Err(if GetLastError() == ERROR_ACCESS_DENIED {
                    SignalError::PermissionDenied
                } else {
                    SignalError::NoSuchProcess
                });
            }
            let result = TerminateProcess(handle, 1);
            CloseHandle(handle);
            if result == 0 {
                return Err(SignalError::Io(io::Error::last_os_error()));
            }
        }
        Ok(())
    }

    pub fn configure_daemon_cmd(cmd: &mut std::process::Command) {
        use std::os::windows::process::CommandExt;
        // CREATE_NEW_PROCESS_GROUP
        cmd.creation_flags(0x00000200);
    }

    pub async fn signal_shutdown() {
        tokio::signal::ctrl_c().await.ok();
    }
}

pub use platform::*;

pub fn is_pid_alive(pid: u32) -> bool {
    check_pid(pid) != PidState::Gone
}
