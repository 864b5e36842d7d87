//! Snapshot of the OS TCP connection table.
//!
//! Linux reads `/proc/net/tcp{,6}` and maps socket inodes to pids through
//! `/proc/<pid>/fd`. Other Unix systems ask `lsof`, Windows asks `netstat`.
//! Parsers are plain functions over text so they can be exercised anywhere.

use std::collections::BTreeSet;
use std::io;

/// One socket from the table. `pid` is absent when ownership is not observable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub port: u16,
    pub listening: bool,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnTable {
    entries: Vec<SocketEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("permission denied reading the connection table")]
    PermissionDenied,
    #[error("connection table unavailable: {0}")]
    Unavailable(String),
}

impl From<io::Error> for TableError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::PermissionDenied => TableError::PermissionDenied,
            _ => TableError::Unavailable(e.to_string()),
        }
    }
}

impl ConnTable {
    pub fn from_entries(entries: Vec<SocketEntry>) -> Self {
        Self { entries }
    }

    pub fn listening(&self) -> impl Iterator<Item = &SocketEntry> {
        self.entries.iter().filter(|e| e.listening)
    }

    /// Distinct listening ports.
    pub fn listening_ports(&self) -> BTreeSet<u16> {
        self.listening().map(|e| e.port).collect()
    }

    /// Owning pid of a listening socket on `port`, preferring entries that have one.
    pub fn owner_of(&self, port: u16) -> Option<u32> {
        self.listening()
            .filter(|e| e.port == port)
            .find_map(|e| e.pid)
    }
}

/// Read the table once. Blocking; call from `spawn_blocking` on async paths.
pub fn snapshot() -> Result<ConnTable, TableError> {
    platform::snapshot()
}

// ---------------------------------------------------------------------------
// Linux: /proc
// ---------------------------------------------------------------------------

const TCP_LISTEN_STATE: &str = "0A";

/// A row of `/proc/net/tcp` before ownership is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcSocket {
    pub port: u16,
    pub listening: bool,
    pub inode: u64,
}

/// Parse the body of `/proc/net/tcp` or `/proc/net/tcp6`. Malformed rows are skipped.
pub fn parse_proc_net_tcp(content: &str) -> Vec<ProcSocket> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let inode = fields[9].parse().ok()?;
            Some(ProcSocket {
                port,
                listening: fields[3].eq_ignore_ascii_case(TCP_LISTEN_STATE),
                inode,
            })
        })
        .filter(|s| s.port != 0)
        .collect()
}

/// Extract the inode from an fd link target such as `socket:[12345]`.
pub fn parse_socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    pub fn snapshot() -> Result<ConnTable, TableError> {
        let mut sockets = Vec::new();
        let mut read_any = false;
        let mut last_err = None;
        for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
            match fs::read_to_string(path) {
                Ok(content) => {
                    read_any = true;
                    sockets.extend(parse_proc_net_tcp(&content));
                }
                Err(e) => last_err = Some(e),
            }
        }
        if !read_any {
            return Err(last_err
                .map(TableError::from)
                .unwrap_or_else(|| TableError::Unavailable("no tcp tables".to_string())));
        }

        let owners = inode_owners();
        let entries = sockets
            .into_iter()
            .map(|s| SocketEntry {
                port: s.port,
                listening: s.listening,
                pid: owners.get(&s.inode).copied(),
            })
            .collect();
        Ok(ConnTable::from_entries(entries))
    }

    /// Map socket inodes to pids. Processes whose fd table we cannot read
    /// are skipped; their sockets stay unowned.
    fn inode_owners() -> HashMap<u64, u32> {
        let mut owners = HashMap::new();
        let Ok(proc_dir) = fs::read_dir("/proc") else {
            return owners;
        };
        for entry in proc_dir.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(target) = fs::read_link(fd.path())
                    && let Some(inode) = target.to_str().and_then(parse_socket_inode)
                {
                    owners.entry(inode).or_insert(pid);
                }
            }
        }
        owners
    }
}

// ---------------------------------------------------------------------------
// Other Unix: lsof
// ---------------------------------------------------------------------------

/// Parse `lsof -nP -iTCP -sTCP:LISTEN -F pn` output.
pub fn parse_lsof(output: &str) -> Vec<SocketEntry> {
    let mut entries = Vec::new();
    let mut pid = None;
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix('p') {
            pid = rest.trim().parse().ok();
        } else if let Some(name) = line.strip_prefix('n') {
            // `*:8080`, `127.0.0.1:5432`, `[::1]:631`; connected sockets carry `->`.
            let local = name.split("->").next().unwrap_or(name);
            if let Some(port) = local
                .rsplit_once(':')
                .and_then(|(_, p)| p.parse::<u16>().ok())
                .filter(|p| *p != 0)
            {
                entries.push(SocketEntry {
                    port,
                    listening: !name.contains("->"),
                    pid,
                });
            }
        }
    }
    entries
}

#[cfg(all(unix, not(target_os = "linux")))]
mod platform {
    use super::*;

    pub fn snapshot() -> Result<ConnTable, TableError> {
        let output = std::process::Command::new("lsof")
            .args(["-nP", "-iTCP", "-sTCP:LISTEN", "-F", "pn"])
            .output()?;
        // lsof exits 1 when nothing matched.
        if !output.status.success() && !output.stdout.is_empty() {
            return Err(TableError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(ConnTable::from_entries(parse_lsof(&text)))
    }
}

// ---------------------------------------------------------------------------
// Windows: netstat
// ---------------------------------------------------------------------------

/// Parse `netstat -ano -p TCP` output.
pub fn parse_netstat(output: &str) -> Vec<SocketEntry> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 || !fields[0].eq_ignore_ascii_case("TCP") {
                return None;
            }
            let port = fields[1]
                .rsplit_once(':')
                .and_then(|(_, p)| p.parse::<u16>().ok())
                .filter(|p| *p != 0)?;
            Some(SocketEntry {
                port,
                listening: fields[3].eq_ignore_ascii_case("LISTENING"),
                pid: fields[4].parse().ok().filter(|p| *p != 0),
            })
        })
        .collect()
}

#[cfg(windows)]
mod platform {
    use super::*;

    pub fn snapshot() -> Result<ConnTable, TableError> {
        let output = std::process::Command::new("netstat")
            .args(["-ano", "-p", "TCP"])
            .output()?;
        if !output.status.success() {
            return Err(TableError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(ConnTable::from_entries(parse_netstat(&text)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
