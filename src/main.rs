use chrono::Utc;
use clap::{CommandFactory, Parser};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use owo_colors::OwoColorize;
use portwarden::cli::{Cli, Command};
use portwarden::protocol::{Request, Response};
use portwarden::registry::{ServerRecord, ServerStatus};
use portwarden::scanner::{PortRecord, PortStatus};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    if cli.daemon {
        let paths = portwarden::paths::Paths::new()?;
        run_daemon(paths).await?;
    } else if let Some(command) = cli.command {
        let paths = portwarden::paths::Paths::new()?;
        let response = match command {
            Command::Shutdown => {
                match send_if_running(&paths, &Request::Shutdown)? {
                    Some(response) => response,
                    None => {
                        println!("{}", "daemon is not running".yellow());
                        return Ok(());
                    }
                }
            }
            other => {
                let request = command_to_request(other)?;
                send_request(&paths, &request)?
            }
        };

        if cli.json {
            print_response_json(&response)?;
        } else {
            print_response(&response);
        }
        if is_failure(&response) {
            std::process::exit(1);
        }
    } else {
        Cli::command().print_help()?;
    }

    Ok(())
}

#[cfg(unix)]
async fn run_daemon(paths: portwarden::paths::Paths) -> color_eyre::Result<()> {
    portwarden::daemon::run(paths).await
}

#[cfg(unix)]
fn send_request(
    paths: &portwarden::paths::Paths,
    request: &Request,
) -> color_eyre::Result<Response> {
    portwarden::client::send_request(paths, request)
}

#[cfg(unix)]
fn send_if_running(
    paths: &portwarden::paths::Paths,
    request: &Request,
) -> color_eyre::Result<Option<Response>> {
    portwarden::client::send_if_running(paths, request)
}

#[cfg(not(unix))]
async fn run_daemon(_paths: portwarden::paths::Paths) -> color_eyre::Result<()> {
    color_eyre::eyre::bail!("the daemon requires Unix domain sockets")
}

#[cfg(not(unix))]
fn send_request(
    _paths: &portwarden::paths::Paths,
    _request: &Request,
) -> color_eyre::Result<Response> {
    color_eyre::eyre::bail!("the daemon requires Unix domain sockets")
}

#[cfg(not(unix))]
fn send_if_running(
    _paths: &portwarden::paths::Paths,
    _request: &Request,
) -> color_eyre::Result<Option<Response>> {
    color_eyre::eyre::bail!("the daemon requires Unix domain sockets")
}

fn command_to_request(command: Command) -> color_eyre::Result<Request> {
    match command {
        Command::Scan { range, cap } => Ok(Request::ScanPorts { range, cap }),
        Command::Kill { pid } => Ok(Request::KillProcess { pid }),
        Command::Launch {
            template,
            port,
            dir,
            script,
            name,
        } => {
            // The daemon has its own cwd, so send an absolute path.
            let dir = match dir {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            Ok(Request::LaunchServer {
                template,
                port,
                working_dir: std::path::absolute(dir)?,
                script_file: script,
                name,
            })
        }
        Command::List => Ok(Request::ListServers),
        Command::Stop { id } => Ok(Request::StopServer { server_id: id }),
        Command::Stats => Ok(Request::SystemStats),
        Command::Log { id, lines } => Ok(Request::ServerLog {
            server_id: id,
            lines,
        }),
        Command::Shutdown => Ok(Request::Shutdown),
    }
}

fn is_failure(response: &Response) -> bool {
    matches!(
        response,
        Response::Error { .. } | Response::StopResult { ok: false, .. }
    )
}

fn print_response_json(response: &Response) -> color_eyre::Result<()> {
    let json = serde_json::to_string(response)?;
    println!("{json}");
    Ok(())
}

fn status_color(status: ServerStatus) -> Color {
    match status {
        ServerStatus::Running => Color::Green,
        ServerStatus::Stopped => Color::Reset,
        ServerStatus::Failed => Color::Red,
    }
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|n| Cell::new(n).add_attribute(Attribute::Bold))
        .collect()
}

fn print_response(response: &Response) {
    match response {
        Response::Success { message } => {
            if let Some(msg) = message {
                println!("{}", msg.green());
            } else {
                println!("{}", "ok".green());
            }
        }
        Response::Error { error } => {
            eprintln!("{} {}", "error:".red().bold(), error);
        }
        Response::Ports { ports } => print_ports(ports),
        Response::Terminated { pid } => {
            println!("{} {pid}", "terminated pid".green());
        }
        Response::Started { id, pid, port } => {
            println!(
                "{} {} {}",
                "started".green(),
                id.cyan().bold(),
                format!("(pid {pid}, port {port})").dimmed()
            );
        }
        Response::Servers { servers } => print_servers(servers),
        Response::StopResult { ok: true, .. } => {
            println!("{}", "stopped".green());
        }
        Response::StopResult { ok: false, error } => {
            eprintln!(
                "{} {}",
                "error:".red().bold(),
                error.as_deref().unwrap_or("stop failed")
            );
        }
        Response::Stats(stats) => {
            println!("  {} {}%", "cpu:".dimmed(), stats.cpu_usage_percent);
            println!("  {} {}%", "memory:".dimmed(), stats.memory_usage_percent);
            println!(
                "  {} {}",
                "listening ports:".dimmed(),
                stats.active_listening_ports
            );
        }
        Response::Log { lines } => {
            for line in lines {
                println!("{line}");
            }
        }
    }
}

fn print_ports(ports: &[PortRecord]) {
    if ports.is_empty() {
        println!("{}", "no ports in use".yellow());
        return;
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(header(&["port", "proto", "status", "pid", "process", "service"]));
    for p in ports {
        let status_cell = match p.status {
            PortStatus::Listening => Cell::new(p.status).fg(Color::Green),
            PortStatus::Open => Cell::new(p.status).fg(Color::Yellow),
        };
        table.add_row(vec![
            Cell::new(p.port).fg(Color::Cyan),
            Cell::new("TCP"),
            status_cell,
            Cell::new(dash(p.owning_pid.map(|pid| pid.to_string()))),
            Cell::new(dash(p.process_name.clone())),
            Cell::new(&p.service_label).fg(Color::Magenta),
        ]);
    }
    println!("{table}");
}

fn print_servers(servers: &[ServerRecord]) {
    if servers.is_empty() {
        println!("{}", "no servers launched".yellow());
        return;
    }
    let now = Utc::now();
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(header(&[
        "id", "name", "template", "port", "pid", "status", "uptime", "dir",
    ]));
    for s in servers {
        let uptime = match s.status {
            ServerStatus::Running => {
                format_uptime(u64::try_from((now - s.start_time).num_seconds()).ok())
            }
            _ => format_uptime(None),
        };
        table.add_row(vec![
            Cell::new(&s.id).fg(Color::Cyan),
            Cell::new(&s.name),
            Cell::new(s.template).fg(Color::Magenta),
            Cell::new(s.port),
            Cell::new(s.pid),
            Cell::new(s.status).fg(status_color(s.status)),
            Cell::new(uptime),
            Cell::new(s.working_dir.display()),
        ]);
    }
    println!("{table}");
}

fn dash(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

fn format_uptime(seconds: Option<u64>) -> String {
    match seconds {
        None => "-".to_string(),
        Some(s) if s < 60 => format!("{s}s"),
        Some(s) if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        Some(s) if s < 86400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        Some(s) => format!("{}d {}h", s / 86400, (s % 86400) / 3600),
    }
}
