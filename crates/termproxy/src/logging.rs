use std::env;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{ProxyError, Result};

/// Filter used when `RUST_LOG` is unset. Diagnostics are off unless `DEBUG`
/// is set, since stderr shares the raw-mode terminal.
fn default_directive() -> &'static str {
    match env::var_os("DEBUG") {
        Some(v) if !v.is_empty() && v != "0" => "debug",
        _ => "off",
    }
}

/// Install the global subscriber. With `log_file`, output is appended there
/// instead of stderr.
pub fn init(log_file: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive()));

    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    ProxyError::Usage(format!("could not open log file {}: {e}", path.display()))
                })?;
            fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };
    if let Err(err) = installed {
        // A subscriber is already set (tests, embedding); keep it.
        tracing::debug!(error = %err, "tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritable_log_file_is_a_usage_error() {
        let err = init(Some(Path::new("/nonexistent/dir/termproxy.log"))).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_USAGE);
    }

    #[test]
    fn log_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("termproxy.log");
        init(Some(&path)).unwrap();
        assert!(path.exists());
    }
}
