use crate::registry::ServerRecord;
use crate::scanner::{PortRecord, RangeSelector};
use crate::stats::SystemStats;
use crate::template::Template;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_LOG_LINES: usize = 15;

fn default_log_lines() -> usize {
    DEFAULT_LOG_LINES
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Request {
    ScanPorts {
        #[serde(default)]
        range: RangeSelector,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cap: Option<usize>,
    },
    KillProcess {
        pid: u32,
    },
    LaunchServer {
        template: Template,
        port: u16,
        working_dir: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        script_file: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ListServers,
    StopServer {
        server_id: String,
    },
    SystemStats,
    ServerLog {
        server_id: String,
        #[serde(default = "default_log_lines")]
        lines: usize,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Response {
    Ports {
        ports: Vec<PortRecord>,
    },
    Terminated {
        pid: u32,
    },
    Started {
        id: String,
        pid: u32,
        port: u16,
    },
    Servers {
        servers: Vec<ServerRecord>,
    },
    StopResult {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Stats(SystemStats),
    Log {
        lines: Vec<String>,
    },
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        error: String,
    },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            error: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Malformed(String),
}

pub fn encode_request(req: &Request) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(req)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::Malformed("empty request line".to_string()));
    }
    Ok(serde_json::from_str(trimmed)?)
}

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(resp)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_response(line: &str) -> Result<Response, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::Malformed("empty response line".to_string()));
    }
    Ok(serde_json::from_str(trimmed)?)
}
