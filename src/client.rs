use crate::paths::Paths;
use crate::pid;
use crate::protocol::{self, Request, Response};
use crate::sys;
use color_eyre::eyre::{Context, bail};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

const CONNECT_RETRIES: u32 = 10;
const CONNECT_DELAY: Duration = Duration::from_millis(200);
/// Polls of 100 ms while waiting for a fresh daemon's socket.
const STARTUP_POLLS: u32 = 50;

pub fn send_request(paths: &Paths, request: &Request) -> color_eyre::Result<Response> {
    ensure_daemon_running(paths)?;
    let mut stream = connect_with_retry(paths, CONNECT_RETRIES, CONNECT_DELAY)?;

    let encoded = protocol::encode_request(request)?;
    stream.write_all(&encoded)?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    if line.is_empty() {
        bail!("daemon closed the connection without a response");
    }
    let response = protocol::decode_response(&line)?;
    Ok(response)
}

/// Send a request only if a daemon is already up. Used by `shutdown`, which
/// should not start a daemon just to stop it.
pub fn send_if_running(paths: &Paths, request: &Request) -> color_eyre::Result<Option<Response>> {
    if !pid::is_daemon_running(paths) {
        return Ok(None);
    }
    send_request(paths, request).map(Some)
}

fn ensure_daemon_running(paths: &Paths) -> color_eyre::Result<()> {
    if pid::is_daemon_running(paths) {
        return Ok(());
    }

    std::fs::create_dir_all(paths.data_dir())
        .with_context(|| format!("failed to create {}", paths.data_dir().display()))?;
    spawn_daemon()?;

    let socket = paths.socket_file();
    for _ in 0..STARTUP_POLLS {
        if socket.exists() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    bail!(
        "timed out waiting for daemon to start (see {})",
        paths.daemon_log().display()
    );
}

fn spawn_daemon() -> color_eyre::Result<()> {
    let exe = std::env::current_exe().context("failed to get current executable path")?;

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    sys::configure_daemon_cmd(&mut cmd);
    cmd.spawn().context("failed to spawn daemon")?;

    Ok(())
}

fn connect_with_retry(
    paths: &Paths,
    retries: u32,
    delay: Duration,
) -> color_eyre::Result<UnixStream> {
    let socket = paths.socket_file();
    let mut last_error = None;

    for _ in 0..retries {
        match UnixStream::connect(&socket) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                last_error = Some(e);
                std::thread::sleep(delay);
            }
        }
    }

    match last_error {
        Some(e) => bail!("failed to connect to daemon after {retries} attempts: {e}"),
        None => bail!("failed to connect to daemon"),
    }
}
