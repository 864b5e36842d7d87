use crate::paths::Paths;
use crate::sys::{self, PidState};
use std::fs;
use std::io;

pub fn write_pid_file(paths: &Paths) -> io::Result<()> {
    let pid = std::process::id();
    fs::write(paths.pid_file(), pid.to_string())
}

pub fn read_pid_file(paths: &Paths) -> Option<u32> {
    fs::read_to_string(paths.pid_file())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

pub fn remove_pid_file(paths: &Paths) {
    let _ = fs::remove_file(paths.pid_file());
}

/// True when the pid file names a live process. A stale file is removed.
pub fn is_daemon_running(paths: &Paths) -> bool {
    let Some(pid) = read_pid_file(paths) else {
        return false;
    };

    match sys::check_pid(pid) {
        PidState::Alive | PidState::Foreign => true,
        PidState::Gone => {
            remove_pid_file(paths);
            false
        }
    }
}
