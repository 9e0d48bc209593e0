use std::{
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "hikeathon.log";

pub fn log_path(data_dir: &Path) -> PathBuf {
    data_dir.join("logs").join(LOG_FILE_NAME)
}

/// Installs the global subscriber. Logs go to `<data_dir>/logs/hikeathon.log`
/// and fall back to stderr when the file cannot be opened.
pub fn init_logging(data_dir: &Path) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let path = log_path(data_dir);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", path.display());
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_lives_under_the_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        init_logging(dir.path());
        tracing::info!("logging initialised");
        let path = log_path(dir.path());
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());
    }
}
