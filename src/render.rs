//! Script Renderer - install_hybrid.sh
//!
//! The script body is a fixed template; only resolved values vary, so the
//! same config always renders to the same bytes. Files are written whole:
//! content lands in a temporary sibling first and is renamed over the
//! target once complete and chmod-ed.

use minijinja::{context, Environment, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::hashing::sha256_hex;
use crate::resolver::{MissingValue, ResolvedConfig};
use crate::ENGINE_VERSION;

pub const INSTALL_SCRIPT_NAME: &str = "install_hybrid.sh";
pub const CONFIG_ARCHIVE_NAME: &str = "config.tgz";
pub const INSTALL_LOG_NAME: &str = "pip_install.log";

/// rwxr-x---
pub const SCRIPT_MODE: u32 = 0o750;

const INSTALL_HYBRID_TEMPLATE: &str = r#"#!/bin/bash
# Slurm hybrid controller configuration installer.
# Rendered by slurm-hybrid-core {{ engine_version }}. Regenerate instead of editing.
set -e

export SLURM_HYBRID_OUTPUT_DIR={{ output_dir | sh }}
{%- if control_addr %}
export SLURM_HYBRID_CONTROL_ADDR={{ control_addr | sh }}
{%- endif %}

pip3 install -r {{ scripts_dir | sh }}/requirements.txt --user > "${SLURM_HYBRID_OUTPUT_DIR}/{{ install_log }}" 2>&1
python3 {{ scripts_dir | sh }}/setup.py --hybrid --bucket {{ bucket_path | sh }}
unzip -o -q "${SLURM_HYBRID_OUTPUT_DIR}/scripts.zip" -d "${SLURM_HYBRID_OUTPUT_DIR}"
tar --exclude='*.log' --exclude='{{ script_name }}' --exclude='*.zip' --exclude='{{ archive_name }}' -czf "${SLURM_HYBRID_OUTPUT_DIR}/{{ archive_name }}" -C "${SLURM_HYBRID_OUTPUT_DIR}" .
echo "Success: hybrid configuration packaged in ${SLURM_HYBRID_OUTPUT_DIR}/{{ archive_name }}"
"#;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    MissingValue(#[from] MissingValue),

    #[error("Template {name} failed: {source}")]
    Template {
        name: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RenderError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedArtifact {
    pub name: String,
    pub content: String,
    pub mode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrittenArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub mode: u32,
    pub outcome: WriteOutcome,
}

impl RenderedArtifact {
    pub fn sha256(&self) -> String {
        sha256_hex(self.content.as_bytes())
    }

    /// Write the artifact into `dir`, replacing any previous version as a
    /// whole. The mode is applied explicitly, so the umask has no effect.
    pub fn write_to(&self, dir: &Path) -> Result<WrittenArtifact, RenderError> {
        let target = dir.join(&self.name);
        fs::create_dir_all(dir).map_err(|e| RenderError::io(dir, e))?;

        let outcome = match fs::read(&target) {
            Ok(existing) if existing == self.content.as_bytes() => WriteOutcome::Unchanged,
            Ok(_) => WriteOutcome::Updated,
            Err(_) => WriteOutcome::Created,
        };

        if outcome == WriteOutcome::Unchanged {
            set_mode(&target, self.mode)?;
        } else {
            let mut tmp = NamedTempFile::new_in(dir).map_err(|e| RenderError::io(dir, e))?;
            tmp.write_all(self.content.as_bytes())
                .and_then(|_| tmp.as_file().sync_all())
                .map_err(|e| RenderError::io(tmp.path(), e))?;
            set_mode(tmp.path(), self.mode)?;
            tmp.persist(&target).map_err(|e| RenderError::io(&target, e.error))?;
        }

        info!(path = %target.display(), ?outcome, "wrote {}", self.name);
        Ok(WrittenArtifact {
            path: target,
            sha256: self.sha256(),
            mode: self.mode,
            outcome,
        })
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), RenderError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| RenderError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), RenderError> {
    Ok(())
}

/// Quote a value for use as a single shell word. Plain paths and URIs are
/// left untouched so the script stays readable.
fn shell_word(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=@%+,".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Fail with `MissingValue` unless every value the install script embeds
/// is set. Lets callers refuse to start work that would only fail at render.
pub fn require_inputs(config: &ResolvedConfig) -> Result<(), RenderError> {
    config.require_str("output_dir")?;
    config.require_str("scripts_dir")?;
    config.bucket_path()?;
    Ok(())
}

#[derive(Clone)]
pub struct ScriptRenderer {
    env: Environment<'static>,
}

impl ScriptRenderer {
    pub fn new() -> Result<Self, RenderError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env.add_filter("sh", shell_word);
        env.add_template(INSTALL_SCRIPT_NAME, INSTALL_HYBRID_TEMPLATE)
            .map_err(|source| RenderError::Template {
                name: INSTALL_SCRIPT_NAME.to_string(),
                source,
            })?;
        Ok(Self { env })
    }

    /// Render the hybrid installer. `control_addr` is the address allocated
    /// for the controller, when one exists.
    pub fn render_install_script(
        &self,
        config: &ResolvedConfig,
        control_addr: Option<IpAddr>,
    ) -> Result<RenderedArtifact, RenderError> {
        let output_dir = config.require_str("output_dir")?;
        let scripts_dir = config.require_str("scripts_dir")?.trim_end_matches('/');
        let bucket_path = config.bucket_path()?;

        let template = self
            .env
            .get_template(INSTALL_SCRIPT_NAME)
            .map_err(|source| RenderError::Template {
                name: INSTALL_SCRIPT_NAME.to_string(),
                source,
            })?;
        let content = template
            .render(context! {
                engine_version => ENGINE_VERSION,
                output_dir => output_dir,
                scripts_dir => scripts_dir,
                bucket_path => bucket_path,
                control_addr => control_addr.map(|a| a.to_string()),
                install_log => INSTALL_LOG_NAME,
                script_name => INSTALL_SCRIPT_NAME,
                archive_name => CONFIG_ARCHIVE_NAME,
            })
            .map_err(|source| RenderError::Template {
                name: INSTALL_SCRIPT_NAME.to_string(),
                source,
            })?;

        debug!(bytes = content.len(), "rendered {}", INSTALL_SCRIPT_NAME);
        Ok(RenderedArtifact {
            name: INSTALL_SCRIPT_NAME.to_string(),
            content,
            mode: SCRIPT_MODE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Resolver;
    use crate::schema::{ConfigSchema, RawConfig};
    use tempfile::tempdir;

    fn config(raw: RawConfig) -> ResolvedConfig {
        Resolver::new(ConfigSchema::hybrid_controller()).resolve(&raw).unwrap()
    }

    fn hybrid() -> ResolvedConfig {
        config(
            RawConfig::new()
                .with("enable_hybrid", true)
                .with("output_dir", "/tmp/x")
                .with("scripts_dir", "/tmp/y")
                .with("bucket_path", "gs://b/p"),
        )
    }

    #[test]
    fn test_shell_word_quoting() {
        assert_eq!(shell_word("/tmp/x"), "/tmp/x");
        assert_eq!(shell_word("gs://b/p"), "gs://b/p");
        assert_eq!(shell_word("/tmp/my dir"), "'/tmp/my dir'");
        assert_eq!(shell_word("it's"), r"'it'\''s'");
        assert_eq!(shell_word(""), "''");
    }

    #[test]
    fn test_render_is_deterministic() {
        let renderer = ScriptRenderer::new().unwrap();
        let config = hybrid();
        let a = renderer.render_install_script(&config, None).unwrap();
        let b = renderer.render_install_script(&config, None).unwrap();
        assert_eq!(a.content, b.content);
        assert_eq!(a.sha256(), b.sha256());
    }

    #[test]
    fn test_control_addr_export() {
        let renderer = ScriptRenderer::new().unwrap();
        let addr: IpAddr = "10.1.2.3".parse().unwrap();
        let script = renderer.render_install_script(&hybrid(), Some(addr)).unwrap();
        assert!(script.content.contains("export SLURM_HYBRID_CONTROL_ADDR=10.1.2.3\n"));

        let script = renderer.render_install_script(&hybrid(), None).unwrap();
        assert!(!script.content.contains("SLURM_HYBRID_CONTROL_ADDR"));
    }

    #[test]
    fn test_missing_scripts_dir_is_render_error() {
        let renderer = ScriptRenderer::new().unwrap();
        let config = config(RawConfig::new().with("bucket_path", "gs://b/p"));
        let err = renderer.render_install_script(&config, None).unwrap_err();
        assert!(matches!(err, RenderError::MissingValue(ref m) if m.option == "scripts_dir"));
    }

    #[test]
    fn test_require_inputs() {
        assert!(require_inputs(&hybrid()).is_ok());
        let err = require_inputs(&config(RawConfig::new().with("scripts_dir", "/tmp/y"))).unwrap_err();
        assert!(matches!(err, RenderError::MissingValue(ref m) if m.option == "bucket_path"));
    }

    #[test]
    fn test_write_outcomes() {
        let dir = tempdir().unwrap();
        let artifact = ScriptRenderer::new()
            .unwrap()
            .render_install_script(&hybrid(), None)
            .unwrap();

        let first = artifact.write_to(dir.path()).unwrap();
        assert_eq!(first.outcome, WriteOutcome::Created);
        let second = artifact.write_to(dir.path()).unwrap();
        assert_eq!(second.outcome, WriteOutcome::Unchanged);
        assert_eq!(first.sha256, second.sha256);

        let changed = RenderedArtifact {
            content: format!("{}# extra\n", artifact.content),
            ..artifact.clone()
        };
        assert_eq!(changed.write_to(dir.path()).unwrap().outcome, WriteOutcome::Updated);
        assert_eq!(fs::read_to_string(dir.path().join(INSTALL_SCRIPT_NAME)).unwrap(), changed.content);

        // no temporary files left behind
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_unchanged_rewrite_restores_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let artifact = ScriptRenderer::new()
            .unwrap()
            .render_install_script(&hybrid(), None)
            .unwrap();
        let written = artifact.write_to(dir.path()).unwrap();
        fs::set_permissions(&written.path, fs::Permissions::from_mode(0o777)).unwrap();

        artifact.write_to(dir.path()).unwrap();
        let mode = fs::metadata(&written.path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SCRIPT_MODE);
    }
}
