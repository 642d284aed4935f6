//! External tool runner
//!
//! Output of the invoked program goes to a log file, never the console.
//! The log is kept on failure for post-mortem inspection.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ExternalToolError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}; see {}", log_path.display())]
    Failed {
        program: String,
        status: String,
        log_path: PathBuf,
    },

    #[error("{program} succeeded but {} was not produced", path.display())]
    MissingOutput { program: String, path: PathBuf },
}

pub trait ToolRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str], cwd: &Path, log_path: &Path) -> Result<(), ExternalToolError>;
}

pub struct ProcessToolRunner;

impl ToolRunner for ProcessToolRunner {
    fn run(&self, program: &str, args: &[&str], cwd: &Path, log_path: &Path) -> Result<(), ExternalToolError> {
        let spawn_err = |source| ExternalToolError::Spawn {
            program: program.to_string(),
            source,
        };
        let log = File::create(log_path).map_err(spawn_err)?;
        let log_err = log.try_clone().map_err(spawn_err)?;

        info!(program, ?args, log = %log_path.display(), "running external tool");
        let status = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .status()
            .map_err(spawn_err)?;

        if status.success() {
            Ok(())
        } else {
            error!(program, %status, log = %log_path.display(), "external tool failed");
            Err(ExternalToolError::Failed {
                program: program.to_string(),
                status: status.to_string(),
                log_path: log_path.to_path_buf(),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_output_goes_to_log() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("tool.log");
        ProcessToolRunner
            .run("sh", &["-c", "echo hello; echo oops >&2"], dir.path(), &log)
            .unwrap();
        let content = fs::read_to_string(&log).unwrap();
        assert!(content.contains("hello"));
        assert!(content.contains("oops"));
    }

    #[test]
    fn test_failure_keeps_log() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("tool.log");
        let err = ProcessToolRunner
            .run("sh", &["-c", "echo broken; exit 3"], dir.path(), &log)
            .unwrap_err();
        assert!(matches!(err, ExternalToolError::Failed { ref log_path, .. } if log_path == &log));
        assert!(fs::read_to_string(&log).unwrap().contains("broken"));
    }
}
