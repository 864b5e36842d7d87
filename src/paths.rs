use color_eyre::eyre::bail;
use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "PORTWARDEN_DATA_DIR";

#[derive(Debug, Clone)]
pub struct Paths {
    data_dir: PathBuf,
}

impl Paths {
    pub fn new() -> color_eyre::Result<Self> {
        if let Ok(path) = std::env::var(DATA_DIR_ENV) {
            return Ok(Self {
                data_dir: PathBuf::from(path),
            });
        }
        let Some(base) = dirs::data_dir() else {
            bail!("could not determine data directory");
        };
        Ok(Self {
            data_dir: base.join("portwarden"),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { data_dir: base }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("portwarden.pid")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.data_dir.join("portwarden.sock")
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("portwarden.toml")
    }

    /// The daemon's own tracing output.
    pub fn daemon_log(&self) -> PathBuf {
        self.data_dir.join("daemon.log")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn stdout_log(&self, server_id: &str) -> PathBuf {
        self.log_dir().join(format!("{server_id}-out.log"))
    }

    pub fn stderr_log(&self, server_id: &str) -> PathBuf {
        self.log_dir().join(format!("{server_id}-err.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_data_dir_linux() {
        let paths = Paths::new().unwrap();
        let data_dir = paths.data_dir().to_str().unwrap();
        assert!(
            data_dir.ends_with(".local/share/portwarden") || data_dir.contains("portwarden"),
            "expected Linux data dir, got: {data_dir}"
        );
    }

    #[test]
    fn test_files_under_data_dir() {
        let paths = Paths::with_base(PathBuf::from("/tmp/portwarden-test"));
        for (file, name) in [
            (paths.pid_file(), "portwarden.pid"),
            (paths.socket_file(), "portwarden.sock"),
            (paths.config_file(), "portwarden.toml"),
            (paths.daemon_log(), "daemon.log"),
            (paths.log_dir(), "logs"),
        ] {
            assert!(file.starts_with(paths.data_dir()));
            assert!(file.ends_with(name), "{} should end with {name}", file.display());
        }
    }

    #[test]
    fn test_server_logs_include_id() {
        let paths = Paths::with_base(PathBuf::from("/tmp/portwarden-test"));
        assert!(paths.stdout_log("srv-3").ends_with("logs/srv-3-out.log"));
        assert!(paths.stderr_log("srv-3").ends_with("logs/srv-3-err.log"));
    }
}
