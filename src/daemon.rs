use crate::config::{self, Settings};
use crate::lifecycle::{LaunchRequest, Manager};
use crate::paths::Paths;
use crate::pid;
use crate::protocol::{self, Request, Response};
use crate::scanner::Scanner;
use crate::{stats, sys};
use color_eyre::eyre::{bail, eyre};
use std::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

pub const LOG_ENV: &str = "PORTWARDEN_LOG";

#[derive(Clone)]
struct Context {
    manager: Manager,
    scanner: Scanner,
    shutdown_tx: watch::Sender<bool>,
}

pub async fn run(paths: Paths) -> color_eyre::Result<()> {
    fs::create_dir_all(paths.data_dir())?;
    init_logging(&paths)?;

    if pid::is_daemon_running(&paths) {
        bail!("daemon is already running");
    }

    let settings = match config::load_settings(&paths.config_file()) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, path = %paths.config_file().display(), "invalid configuration");
            return Err(eyre!("{}: {e}", paths.config_file().display()));
        }
    };

    pid::write_pid_file(&paths)?;

    let socket_path = paths.socket_file();
    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    tracing::info!(socket = %socket_path.display(), pid = std::process::id(), "daemon listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let Settings { scan, lifecycle } = settings;
    let ctx = Context {
        manager: Manager::new(paths.clone(), lifecycle),
        scanner: Scanner::new(scan),
        shutdown_tx,
    };

    let result = run_accept_loop(&ctx, &listener, &mut shutdown_rx).await;

    tracing::info!("daemon shutting down");
    ctx.manager.shutdown_all().await;

    let _ = fs::remove_file(paths.socket_file());
    pid::remove_pid_file(&paths);

    result
}

fn init_logging(paths: &Paths) -> color_eyre::Result<()> {
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.daemon_log())?;
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    // A second daemon in the same process keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file)),
        )
        .try_init();
    Ok(())
}

async fn run_accept_loop(
    ctx: &Context,
    listener: &UnixListener,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> color_eyre::Result<()> {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, _addr) = accept_result?;
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        tracing::warn!(error = %e, "connection error");
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = sys::signal_shutdown() => {
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(stream: tokio::net::UnixStream, ctx: Context) -> color_eyre::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();
    buf_reader.read_line(&mut line).await?;

    if line.is_empty() {
        return Ok(());
    }

    let response = match protocol::decode_request(&line) {
        Ok(request) => {
            tracing::debug!(?request, "request");
            // Run the handler on its own task so a panic becomes a response.
            match tokio::spawn(dispatch(ctx, request)).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, "request handler failed");
                    Response::error(format!("internal error: {e}"))
                }
            }
        }
        Err(e) => Response::error(format!("invalid request: {e}")),
    };

    let encoded = protocol::encode_response(&response)?;
    writer.write_all(&encoded).await?;
    writer.shutdown().await?;

    Ok(())
}

async fn dispatch(ctx: Context, request: Request) -> Response {
    match request {
        Request::ScanPorts { range, cap } => Response::Ports {
            ports: ctx.scanner.scan(range, cap).await,
        },
        Request::KillProcess { pid } => match ctx.manager.kill_pid(pid).await {
            Ok(_) => Response::Terminated { pid },
            Err(e) => Response::error(e.to_string()),
        },
        Request::LaunchServer {
            template,
            port,
            working_dir,
            script_file,
            name,
        } => {
            let request = LaunchRequest {
                name,
                template,
                port,
                working_dir,
                script_file,
            };
            match ctx.manager.launch(request).await {
                Ok(launched) => Response::Started {
                    id: launched.id,
                    pid: launched.pid,
                    port: launched.port,
                },
                Err(e) => Response::error(e.to_string()),
            }
        }
        Request::ListServers => Response::Servers {
            servers: ctx.manager.list().await,
        },
        Request::StopServer { server_id } => match ctx.manager.stop(&server_id).await {
            Ok(_) => Response::StopResult {
                ok: true,
                error: None,
            },
            Err(e) => Response::StopResult {
                ok: false,
                error: Some(e.to_string()),
            },
        },
        Request::SystemStats => Response::Stats(stats::collect().await),
        Request::ServerLog { server_id, lines } => {
            match ctx.manager.read_log(&server_id, lines).await {
                Ok(lines) => Response::Log { lines },
                Err(e) => Response::error(e.to_string()),
            }
        }
        Request::Shutdown => {
            let _ = ctx.shutdown_tx.send(true);
            Response::Success {
                message: Some("daemon shutting down".to_string()),
            }
        }
    }
}
