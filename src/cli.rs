use crate::protocol::DEFAULT_LOG_LINES;
use crate::scanner::RangeSelector;
use crate::template::Template;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "portwarden",
    about = "Inspect local TCP ports and manage ad-hoc dev servers",
    version
)]
pub struct Cli {
    #[arg(long, hide = true)]
    pub daemon: bool,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List TCP ports in use on this machine
    Scan {
        /// common (1-1024), extended (1-10000) or all
        #[arg(long, default_value_t = RangeSelector::Common)]
        range: RangeSelector,
        /// Upper bound on probed ports when the connection table is unavailable
        #[arg(long)]
        cap: Option<usize>,
    },
    /// Terminate a process by pid
    Kill { pid: u32 },
    /// Launch a server from a template
    Launch {
        /// static-http, scripted-node or scripted-generic
        template: Template,
        #[arg(long)]
        port: u16,
        /// Working directory (defaults to the current directory)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Script to run, relative to the working directory
        #[arg(long)]
        script: Option<PathBuf>,
        #[arg(long)]
        name: Option<String>,
    },
    /// List launched servers
    #[command(visible_alias = "ls")]
    List,
    /// Stop a launched server
    Stop { id: String },
    /// Show CPU, memory and listening port counts
    Stats,
    /// Show captured server output
    Log {
        id: String,
        #[arg(long, default_value_t = DEFAULT_LOG_LINES)]
        lines: usize,
    },
    /// Stop all servers and shut down the daemon
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_defaults() {
        let cli = Cli::try_parse_from(["portwarden", "scan"]).unwrap();
        match cli.command.unwrap() {
            Command::Scan { range, cap } => {
                assert_eq!(range, RangeSelector::Common);
                assert!(cap.is_none());
            }
            _ => panic!("expected Scan"),
        }
    }

    #[test]
    fn test_scan_with_range_and_cap() {
        let cli =
            Cli::try_parse_from(["portwarden", "scan", "--range", "EXTENDED", "--cap", "300"])
                .unwrap();
        match cli.command.unwrap() {
            Command::Scan { range, cap } => {
                assert_eq!(range, RangeSelector::Extended);
                assert_eq!(cap, Some(300));
            }
            _ => panic!("expected Scan"),
        }
    }

    #[test]
    fn test_scan_rejects_unknown_range() {
        assert!(Cli::try_parse_from(["portwarden", "scan", "--range", "huge"]).is_err());
    }

    #[test]
    fn test_kill_requires_numeric_pid() {
        let cli = Cli::try_parse_from(["portwarden", "kill", "4242"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::Kill { pid: 4242 }));
        assert!(Cli::try_parse_from(["portwarden", "kill", "abc"]).is_err());
        assert!(Cli::try_parse_from(["portwarden", "kill"]).is_err());
    }

    #[test]
    fn test_launch_full() {
        let cli = Cli::try_parse_from([
            "portwarden",
            "launch",
            "scripted-node",
            "--port",
            "3001",
            "--dir",
            "/srv/app",
            "--script",
            "index.js",
            "--name",
            "api",
        ])
        .unwrap();
        match cli.command.unwrap() {
            Command::Launch {
                template,
                port,
                dir,
                script,
                name,
            } => {
                assert_eq!(template, Template::ScriptedNode);
                assert_eq!(port, 3001);
                assert_eq!(dir, Some(PathBuf::from("/srv/app")));
                assert_eq!(script, Some(PathBuf::from("index.js")));
                assert_eq!(name.as_deref(), Some("api"));
            }
            _ => panic!("expected Launch"),
        }
    }

    #[test]
    fn test_launch_requires_port() {
        assert!(Cli::try_parse_from(["portwarden", "launch", "static-http"]).is_err());
        assert!(
            Cli::try_parse_from(["portwarden", "launch", "php", "--port", "80"]).is_err()
        );
    }

    #[test]
    fn test_list_alias() {
        let cli = Cli::try_parse_from(["portwarden", "ls"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::List));
    }

    #[test]
    fn test_stop_and_log() {
        let cli = Cli::try_parse_from(["portwarden", "stop", "srv-1"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::Stop { id } if id == "srv-1"));

        let cli = Cli::try_parse_from(["portwarden", "log", "srv-1"]).unwrap();
        match cli.command.unwrap() {
            Command::Log { id, lines } => {
                assert_eq!(id, "srv-1");
                assert_eq!(lines, 15);
            }
            _ => panic!("expected Log"),
        }
    }

    #[test]
    fn test_json_flag_is_global() {
        let cli = Cli::try_parse_from(["portwarden", "stats", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command.unwrap(), Command::Stats));
    }

    #[test]
    fn test_daemon_flag() {
        let cli = Cli::try_parse_from(["portwarden", "--daemon"]).unwrap();
        assert!(cli.daemon);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_shutdown() {
        let cli = Cli::try_parse_from(["portwarden", "shutdown"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::Shutdown));
    }
}
