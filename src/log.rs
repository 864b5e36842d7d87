use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// 10 MB rotation threshold
pub const LOG_ROTATION_SIZE: u64 = 10 * 1024 * 1024;

/// Keep up to 3 rotated files (.1, .2, .3)
pub const LOG_ROTATION_KEEP: u32 = 3;

pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "out"),
            LogStream::Stderr => write!(f, "err"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tail
// ---------------------------------------------------------------------------

pub fn tail_file(path: &Path, n: usize) -> io::Result<Vec<String>> {
    use std::io::{Read, Seek};

    if n == 0 {
        return Ok(Vec::new());
    }

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(Vec::new());
    }

    // Walk backwards in chunks until we have seen n + 1 newlines.
    const CHUNK: usize = 8192;
    let mut newlines: usize = 0;
    let mut pos = len;
    let mut start_offset: u64 = 0;

    'outer: while pos > 0 {
        let read_start = pos.saturating_sub(CHUNK as u64);
        let to_read = (pos - read_start) as usize;
        let mut buf = vec![0u8; to_read];
        file.seek(io::SeekFrom::Start(read_start))?;
        file.read_exact(&mut buf)?;

        for (i, &b) in buf.iter().enumerate().rev() {
            if b == b'\n' {
                newlines += 1;
                if newlines > n {
                    start_offset = read_start + (i as u64) + 1;
                    break 'outer;
                }
            }
        }
        pos = read_start;
    }

    file.seek(io::SeekFrom::Start(start_offset))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let mut lines: Vec<String> = String::from_utf8_lossy(&bytes)
        .lines()
        .map(String::from)
        .collect();
    lines.truncate(n);
    Ok(lines)
}

// ---------------------------------------------------------------------------
// Rotation
// ---------------------------------------------------------------------------

pub async fn rotate_log(path: &Path, max_rotations: u32) -> io::Result<()> {
    let oldest = rotated_path(path, max_rotations);
    if tokio::fs::try_exists(&oldest).await.unwrap_or(false) {
        tokio::fs::remove_file(&oldest).await?;
    }

    for i in (1..max_rotations).rev() {
        let from = rotated_path(path, i);
        let to = rotated_path(path, i + 1);
        if tokio::fs::try_exists(&from).await.unwrap_or(false) {
            tokio::fs::rename(&from, &to).await?;
        }
    }

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::rename(path, rotated_path(path, 1)).await?;
    }

    Ok(())
}

fn rotated_path(path: &Path, n: u32) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(format!(".{n}"));
    p.into()
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

pub fn spawn_log_copier(
    server_id: String,
    stream: LogStream,
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    log_path: PathBuf,
) {
    tokio::spawn(async move {
        if let Err(e) = run_log_copier(reader, &log_path).await {
            tracing::warn!(server = %server_id, %stream, error = %e, "log copier stopped");
        }
    });
}

async fn run_log_copier(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    log_path: &Path,
) -> io::Result<()> {
    let mut buf_reader = TokioBufReader::new(reader);
    let mut file = open_append(log_path).await?;
    let mut byte_count = tokio::fs::metadata(log_path).await?.len();

    let mut line = Vec::new();
    loop {
        line.clear();
        let n = buf_reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            break;
        }

        let text = String::from_utf8_lossy(&line);
        let formatted = format!(
            "{} | {}\n",
            chrono::Local::now().format(LOG_TIMESTAMP_FORMAT),
            text.trim_end_matches(['\r', '\n'])
        );
        let line_bytes = formatted.as_bytes();

        if byte_count + line_bytes.len() as u64 > LOG_ROTATION_SIZE {
            file.flush().await?;
            drop(file);
            rotate_log(log_path, LOG_ROTATION_KEEP).await?;
            file = open_append(log_path).await?;
            byte_count = 0;
        }

        file.write_all(line_bytes).await?;
        byte_count += line_bytes.len() as u64;
    }

    file.flush().await?;
    Ok(())
}

async fn open_append(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
