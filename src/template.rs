use crate::config::LifecycleConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const NODE_SCRIPT_NAME: &str = "portwarden-server.js";
pub const PYTHON_SCRIPT_NAME: &str = "portwarden-server.py";

const NODE_SCRIPT: &str = r#"const http = require('http');

const port = Number(process.env.PORT || 3000);
const host = process.env.HOST || '127.0.0.1';

http
  .createServer((req, res) => {
    console.log(`${new Date().toISOString()} ${req.method} ${req.url}`);
    res.writeHead(200, { 'Content-Type': 'application/json' });
    res.end(JSON.stringify({ status: 'ok', port, path: req.url }));
  })
  .listen(port, host, () => {
    console.log(`listening on http://${host}:${port}`);
  });
"#;

const PYTHON_SCRIPT: &str = r#"import json
import os
from http.server import BaseHTTPRequestHandler, HTTPServer

PORT = int(os.environ.get("PORT", "8000"))
HOST = os.environ.get("HOST", "127.0.0.1")


class Handler(BaseHTTPRequestHandler):
    def do_GET(self):
        body = json.dumps({"status": "ok", "port": PORT, "path": self.path}).encode()
        self.send_response(200)
        self.send_header("Content-Type", "application/json")
        self.send_header("Content-Length", str(len(body)))
        self.end_headers()
        self.wfile.write(body)


if __name__ == "__main__":
    print(f"listening on http://{HOST}:{PORT}", flush=True)
    HTTPServer((HOST, PORT), Handler).serve_forever()
"#;

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Template {
    StaticHttp,
    ScriptedNode,
    ScriptedGeneric,
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Template::StaticHttp => write!(f, "static-http"),
            Template::ScriptedNode => write!(f, "scripted-node"),
            Template::ScriptedGeneric => write!(f, "scripted-generic"),
        }
    }
}

impl FromStr for Template {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static-http" | "static" => Ok(Template::StaticHttp),
            "scripted-node" | "node" => Ok(Template::ScriptedNode),
            "scripted-generic" | "script" => Ok(Template::ScriptedGeneric),
            other => Err(format!(
                "unknown template '{other}', expected static-http, scripted-node or scripted-generic"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("invalid port: {0}")]
    InvalidPort(u16),
    #[error("working directory does not exist: {0}")]
    MissingWorkingDir(PathBuf),
    #[error("script file not found: {0}")]
    MissingScript(PathBuf),
    #[error("invalid runtime command '{command}': {reason}")]
    InvalidRuntime { command: String, reason: String },
    #[error("runtime not found: {0}")]
    RuntimeMissing(String),
    #[error("failed to write generated script {path}: {source}")]
    ScriptWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("process exited immediately with {0}")]
    ExitedImmediately(String),
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// A generated server script to write before spawning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedScript {
    pub path: PathBuf,
    pub contents: &'static str,
}

/// Concrete command for a template, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub script: Option<GeneratedScript>,
}

impl LaunchPlan {
    /// Write the generated script, if any.
    pub async fn materialize(&self) -> Result<(), LaunchError> {
        if let Some(script) = &self.script {
            tokio::fs::write(&script.path, script.contents)
                .await
                .map_err(|source| LaunchError::ScriptWrite {
                    path: script.path.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub fn parse_command(command: &str) -> Result<(String, Vec<String>), LaunchError> {
    let invalid = |reason: String| LaunchError::InvalidRuntime {
        command: command.to_string(),
        reason,
    };
    let mut words = shell_words::split(command).map_err(|e| invalid(e.to_string()))?;
    if words.is_empty() {
        return Err(invalid("command is empty".to_string()));
    }
    let program = words.remove(0);
    Ok((program, words))
}

/// Validate inputs and resolve `template` into a command. Performs no writes.
pub fn plan(
    template: Template,
    port: u16,
    working_dir: &Path,
    script_file: Option<&Path>,
    runtimes: &LifecycleConfig,
) -> Result<LaunchPlan, LaunchError> {
    if port == 0 {
        return Err(LaunchError::InvalidPort(port));
    }
    if !working_dir.is_dir() {
        return Err(LaunchError::MissingWorkingDir(working_dir.to_path_buf()));
    }

    let script = match script_file {
        Some(path) => {
            let resolved = if path.is_relative() {
                working_dir.join(path)
            } else {
                path.to_path_buf()
            };
            if !resolved.is_file() {
                return Err(LaunchError::MissingScript(resolved));
            }
            Some(resolved)
        }
        None => None,
    };

    let mut generated = None;
    let (program, args) = match template {
        Template::StaticHttp => {
            let (program, mut args) = parse_command(&runtimes.python)?;
            args.extend([
                "-m".to_string(),
                "http.server".to_string(),
                port.to_string(),
                "--bind".to_string(),
                runtimes.bind_address.clone(),
                "--directory".to_string(),
                working_dir.to_string_lossy().into_owned(),
            ]);
            (program, args)
        }
        Template::ScriptedNode => {
            let path = match script {
                Some(path) => path,
                None => generate(&mut generated, working_dir.join(NODE_SCRIPT_NAME), NODE_SCRIPT),
            };
            with_script(parse_command(&runtimes.node)?, &path)
        }
        Template::ScriptedGeneric => match script {
            Some(path) => match interpreter_for(&path, runtimes)? {
                Some(interpreter) => with_script(interpreter, &path),
                None => (path.to_string_lossy().into_owned(), Vec::new()),
            },
            None => {
                let path =
                    generate(&mut generated, working_dir.join(PYTHON_SCRIPT_NAME), PYTHON_SCRIPT);
                with_script(parse_command(&runtimes.python)?, &path)
            }
        },
    };

    Ok(LaunchPlan {
        program,
        args,
        env: vec![
            ("PORT".to_string(), port.to_string()),
            ("HOST".to_string(), runtimes.bind_address.clone()),
        ],
        cwd: working_dir.to_path_buf(),
        script: generated,
    })
}

fn generate(
    slot: &mut Option<GeneratedScript>,
    path: PathBuf,
    contents: &'static str,
) -> PathBuf {
    *slot = Some(GeneratedScript {
        path: path.clone(),
        contents,
    });
    path
}

fn with_script((program, mut args): (String, Vec<String>), script: &Path) -> (String, Vec<String>) {
    args.push(script.to_string_lossy().into_owned());
    (program, args)
}

/// `None` means the script is executed directly.
fn interpreter_for(
    script: &Path,
    runtimes: &LifecycleConfig,
) -> Result<Option<(String, Vec<String>)>, LaunchError> {
    let ext = script
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let command = match ext.as_deref() {
        Some("py") => &runtimes.python,
        Some("js" | "mjs" | "cjs") => &runtimes.node,
        Some("sh") => &runtimes.shell,
        _ => return Ok(None),
    };
    parse_command(command).map(Some)
}
