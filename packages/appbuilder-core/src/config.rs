//! Runtime configuration.
//!
//! Everything tunable lives on [`RuntimeConfig`]; the binary builds one from
//! CLI flags plus environment fallbacks and the rest of the runtime only ever
//! sees the resolved struct.

use std::path::PathBuf;
use std::time::Duration;

use appbuilder_error::BuilderError;

/// Which transport backs the reasoning model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    /// Subprocess-hosted reasoning model operating on the local filesystem
    /// sandbox.
    Local,
    /// Scripted in-process transport; no external model process. Used by the
    /// test suite and for offline development.
    Mock,
}

impl std::str::FromStr for SandboxMode {
    type Err = BuilderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "local" => Ok(SandboxMode::Local),
            "mock" => Ok(SandboxMode::Mock),
            other => Err(BuilderError::InvalidRequest {
                message: format!("unknown sandbox mode: {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub sandbox_mode: SandboxMode,
    /// Root directory under which per-session workspaces are created.
    pub workspace_root: PathBuf,
    /// Command line of the reasoning-model subprocess (`local` mode).
    pub model_command: Vec<String>,
    /// API key handed to the model subprocess. Required in `local` mode.
    pub model_api_key: Option<String>,
    /// Optional project scaffold copied into each fresh workspace.
    pub scaffold_dir: Option<PathBuf>,
    /// Optional curated component library injected as `curated/`.
    pub curated_dir: Option<PathBuf>,
    /// First port probed for dev servers; kept above user-facing services.
    pub port_range_start: u16,
    /// Number of ports probed before giving up.
    pub port_range_len: u16,
    /// Command template for the preview dev server. `$PORT` is substituted
    /// with the session's allocated port.
    pub dev_server_command: String,
    /// Public base used to derive preview URLs, e.g. `http://localhost`.
    pub preview_base: String,
    /// Key/value pairs written to `.env.local` before the dev server starts.
    pub preview_env: Vec<(String, String)>,
    /// Whole-turn budget; the streaming iteration is cancelled on expiry.
    pub turn_timeout: Duration,
    /// Grace window between a disconnect and session teardown.
    pub cleanup_grace: Duration,
    /// Grace between group-TERM and group-KILL at teardown.
    pub child_kill_grace: Duration,
    /// Dev-server readiness probe budget.
    pub readiness_timeout: Duration,
    /// Default foreground shell timeout.
    pub shell_timeout: Duration,
    /// Consecutive failed build cycles tolerated per turn before the
    /// self-correction hook turns terminal.
    pub max_correction_cycles: u32,
    /// Remove workspace directories on session teardown.
    pub remove_workspaces: bool,
    /// Enable the data-platform exploration preamble in the system prompt.
    pub data_platform: bool,
}

impl RuntimeConfig {
    /// Sensible defaults for a local deployment; the binary overrides from
    /// flags and the environment.
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            sandbox_mode: SandboxMode::Local,
            workspace_root,
            model_command: vec!["reasoner".to_string(), "--stream-json".to_string()],
            model_api_key: None,
            scaffold_dir: None,
            curated_dir: None,
            port_range_start: 3001,
            port_range_len: 100,
            dev_server_command: "npm run dev".to_string(),
            preview_base: "http://localhost".to_string(),
            preview_env: Vec::new(),
            turn_timeout: Duration::from_secs(600),
            cleanup_grace: Duration::from_secs(60),
            child_kill_grace: Duration::from_secs(5),
            readiness_timeout: Duration::from_secs(30),
            shell_timeout: Duration::from_secs(120),
            max_correction_cycles: 3,
            remove_workspaces: false,
            data_platform: false,
        }
    }

    /// Validates invariants that would otherwise surface deep inside a turn.
    pub fn validate(&self) -> Result<(), BuilderError> {
        if self.sandbox_mode == SandboxMode::Local && self.model_api_key.is_none() {
            return Err(BuilderError::Init {
                message: "model API key is required in local mode".to_string(),
            });
        }
        if self.port_range_len == 0 {
            return Err(BuilderError::Init {
                message: "port range must be non-empty".to_string(),
            });
        }
        if self.model_command.is_empty() && self.sandbox_mode == SandboxMode::Local {
            return Err(BuilderError::Init {
                message: "model command must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_mode_requires_api_key() {
        let config = RuntimeConfig::new(PathBuf::from("/tmp/appbuilder"));
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::new(PathBuf::from("/tmp/appbuilder"));
        config.model_api_key = Some("key".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mock_mode_needs_no_key() {
        let mut config = RuntimeConfig::new(PathBuf::from("/tmp/appbuilder"));
        config.sandbox_mode = SandboxMode::Mock;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sandbox_mode_parses() {
        assert_eq!("local".parse::<SandboxMode>().unwrap(), SandboxMode::Local);
        assert_eq!("MOCK".parse::<SandboxMode>().unwrap(), SandboxMode::Mock);
        assert!("e2b".parse::<SandboxMode>().is_err());
    }
}
