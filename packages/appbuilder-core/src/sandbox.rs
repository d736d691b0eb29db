//! Sandbox supervisor.
//!
//! Owns one session's workspace directory, its allocated preview port, and
//! every background child process the agent starts. All file paths coming out
//! of tool calls are resolved here; anything whose canonical form leaves the
//! workspace root is rejected before it touches the filesystem.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use appbuilder_error::BuilderError;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::scaffold;

/// Internal bookkeeping directory inside a workspace; hidden from glob/grep.
const INTERNAL_DIR: &str = ".appbuilder";

/// Directories never worth searching.
const SKIP_DIRS: [&str; 4] = ["node_modules", ".git", ".next", INTERNAL_DIR];

/// Cap on grep output lines so a loose pattern cannot flood the model.
const MAX_GREP_MATCHES: usize = 200;

/// Attempts at spawning the dev server on a fresh port after a bind race.
const DEV_SERVER_SPAWN_ATTEMPTS: u32 = 3;

/// A long-lived child started through the shell tool or the dev-server tool.
#[derive(Debug)]
struct ChildRecord {
    child: Child,
    /// Process-group id; the whole group is signalled at teardown.
    pgid: i32,
    command: String,
    tool_call_id: String,
    /// Set for the dev server; identifies it among background children.
    port: Option<u16>,
}

/// Outcome of a foreground shell command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug)]
pub struct SandboxSupervisor {
    session_id: String,
    config: RuntimeConfig,
    workspace: PathBuf,
    /// Canonical workspace root; the prefix every resolved path must carry.
    root: Mutex<Option<PathBuf>>,
    allocated_port: Mutex<Option<u16>>,
    children: Mutex<Vec<ChildRecord>>,
    http: reqwest::Client,
}

impl SandboxSupervisor {
    pub fn new(session_id: &str, config: RuntimeConfig) -> Self {
        let workspace = config.workspace_root.join(session_id);
        Self {
            session_id: session_id.to_string(),
            config,
            workspace,
            root: Mutex::new(None),
            allocated_port: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            http: reqwest::Client::new(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Creates the workspace directory, installs the scaffold and curated
    /// library on first creation, and allocates the session port.
    pub async fn ensure_workspace(&self) -> Result<PathBuf, BuilderError> {
        {
            let root = self.root.lock().await;
            if let Some(root) = root.as_ref() {
                return Ok(root.clone());
            }
        }

        let fresh = !self.workspace.exists();
        std::fs::create_dir_all(&self.workspace)?;
        if fresh {
            scaffold::install(&self.workspace, &self.config)?;
        }
        let canonical = self.workspace.canonicalize()?;

        let mut port = self.allocated_port.lock().await;
        if port.is_none() {
            *port = Some(self.find_available_port()?);
        }
        info!(
            session_id = %self.session_id,
            workspace = %canonical.display(),
            port = port.unwrap_or(0),
            "workspace ready"
        );
        drop(port);

        let mut root = self.root.lock().await;
        *root = Some(canonical.clone());
        Ok(canonical)
    }

    pub async fn allocated_port(&self) -> Option<u16> {
        *self.allocated_port.lock().await
    }

    /// Preview URL derived from the public base and the allocated port.
    pub async fn preview_url(&self) -> Option<String> {
        self.allocated_port
            .lock()
            .await
            .map(|port| format!("{}:{port}", self.config.preview_base))
    }

    fn find_available_port(&self) -> Result<u16, BuilderError> {
        let start = self.config.port_range_start;
        let end = start.saturating_add(self.config.port_range_len);
        for port in start..end {
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                return Ok(port);
            }
        }
        Err(BuilderError::NoAvailablePort { start, end })
    }

    /// Resolves a (possibly relative) tool path to its canonical form and
    /// rejects it unless it lies strictly inside the workspace root. Symlinks
    /// are resolved before the prefix check.
    pub async fn resolve_path(&self, input: &str) -> Result<PathBuf, BuilderError> {
        let root = self.ensure_workspace().await?;
        resolve_against(&root, input).inspect_err(|_| {
            warn!(
                session_id = %self.session_id,
                path = %input,
                "rejected path outside workspace"
            );
        })
    }

    pub async fn read_file(&self, path: &str) -> Result<String, BuilderError> {
        let resolved = self.resolve_path(path).await?;
        std::fs::read_to_string(&resolved).map_err(|err| BuilderError::ToolFailure {
            message: format!("failed to read {path}: {err}"),
        })
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<PathBuf, BuilderError> {
        let resolved = self.resolve_path(path).await?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&resolved, content)?;
        debug!(session_id = %self.session_id, path = %resolved.display(), bytes = content.len(), "wrote file");
        Ok(resolved)
    }

    /// In-place string substitution. The old string must occur exactly once;
    /// anything else is reported back to the model instead of guessing.
    pub async fn edit_file(
        &self,
        path: &str,
        old: &str,
        new: &str,
    ) -> Result<PathBuf, BuilderError> {
        if old.is_empty() {
            return Err(BuilderError::ToolFailure {
                message: "old_string must not be empty".to_string(),
            });
        }
        let resolved = self.resolve_path(path).await?;
        let content = std::fs::read_to_string(&resolved).map_err(|err| BuilderError::ToolFailure {
            message: format!("failed to read {path}: {err}"),
        })?;
        match content.matches(old).count() {
            0 => Err(BuilderError::ToolFailure {
                message: format!("old_string not found in {path}"),
            }),
            1 => {
                std::fs::write(&resolved, content.replacen(old, new, 1))?;
                Ok(resolved)
            }
            n => Err(BuilderError::ToolFailure {
                message: format!("old_string occurs {n} times in {path}; provide more context"),
            }),
        }
    }

    /// Glob for files under the workspace root. Patterns are always resolved
    /// relative to the root; matches outside it are dropped.
    pub async fn glob(&self, pattern: &str) -> Result<Vec<String>, BuilderError> {
        let root = self.ensure_workspace().await?;
        let full = root.join(pattern.trim_start_matches('/'));
        let full = full.to_string_lossy().to_string();
        let mut matches = Vec::new();
        let paths = glob::glob(&full).map_err(|err| BuilderError::ToolFailure {
            message: format!("invalid glob pattern: {err}"),
        })?;
        for entry in paths.flatten() {
            let Ok(canonical) = entry.canonicalize() else {
                continue;
            };
            if !canonical.starts_with(&root) {
                continue;
            }
            if let Ok(relative) = canonical.strip_prefix(&root) {
                let text = relative.to_string_lossy().to_string();
                if !text.starts_with(INTERNAL_DIR) {
                    matches.push(text);
                }
            }
        }
        matches.sort();
        Ok(matches)
    }

    /// Regex search across workspace files, `path:line: text` per match.
    pub async fn grep(&self, pattern: &str, path: Option<&str>) -> Result<Vec<String>, BuilderError> {
        let root = self.ensure_workspace().await?;
        let regex = regex::Regex::new(pattern).map_err(|err| BuilderError::ToolFailure {
            message: format!("invalid regex: {err}"),
        })?;
        let base = match path {
            Some(path) => self.resolve_path(path).await?,
            None => root.clone(),
        };
        let mut matches = Vec::new();
        if base.is_file() {
            grep_file(&base, &root, &regex, &mut matches);
        } else {
            grep_dir(&base, &root, &regex, &mut matches);
        }
        Ok(matches)
    }

    /// Runs a foreground shell command in the workspace with a timeout. The
    /// child gets its own process group so an expired timeout can take its
    /// descendants down with it.
    pub async fn run_command(
        &self,
        command: &str,
        timeout_secs: Option<u64>,
    ) -> Result<CommandOutcome, BuilderError> {
        let root = self.ensure_workspace().await?;
        let budget = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.shell_timeout);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.config.preview_env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|err| BuilderError::Spawn {
            message: err.to_string(),
        })?;
        let pgid = child.id().map(|pid| pid as i32);

        match timeout(budget, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutcome {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                exit_code: output.status.code().unwrap_or(-1),
            }),
            Ok(Err(err)) => Err(BuilderError::Spawn {
                message: err.to_string(),
            }),
            Err(_) => {
                if let Some(pgid) = pgid {
                    signal_group(pgid, libc::SIGKILL);
                }
                Err(BuilderError::Timeout {
                    seconds: budget.as_secs(),
                })
            }
        }
    }

    /// Starts a long-running command in the background, in its own process
    /// group, and registers it as a session-owned child.
    pub async fn spawn_background(
        &self,
        command: &str,
        tool_call_id: &str,
    ) -> Result<u32, BuilderError> {
        let child = self.spawn_group(command, None).await?;
        let pid = child.id().ok_or_else(|| BuilderError::Spawn {
            message: "background process exited before registration".to_string(),
        })?;
        let mut children = self.children.lock().await;
        children.push(ChildRecord {
            pgid: pid as i32,
            child,
            command: command.to_string(),
            tool_call_id: tool_call_id.to_string(),
            port: None,
        });
        info!(
            session_id = %self.session_id,
            pid,
            command = %command,
            "background process started"
        );
        Ok(pid)
    }

    async fn spawn_group(&self, command: &str, port: Option<u16>) -> Result<Child, BuilderError> {
        let root = self.ensure_workspace().await?;
        let log_dir = root.join(INTERNAL_DIR).join("logs");
        std::fs::create_dir_all(&log_dir)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("children.log"))?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&root)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        if let Some(port) = port {
            cmd.env("PORT", port.to_string());
        }
        for (key, value) in &self.config.preview_env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn().map_err(|err| BuilderError::Spawn {
            message: err.to_string(),
        })
    }

    /// Starts (or restarts) the preview dev server on the session's allocated
    /// port and waits for it to answer HTTP before reporting success. The
    /// port requested by the model is ignored by the caller; only the
    /// allocated port is ever used.
    pub async fn start_dev_server(&self, tool_call_id: &str) -> Result<String, BuilderError> {
        let root = self.ensure_workspace().await?;
        self.stop_dev_server().await;
        scaffold::write_preview_env(&root, &self.config.preview_env)?;

        let mut last_error = None;
        for attempt in 0..DEV_SERVER_SPAWN_ATTEMPTS {
            let port = match self.allocated_port().await {
                Some(port) if attempt == 0 => port,
                // A bind race lost the sticky port; take a fresh one.
                _ => {
                    let fresh = self.find_available_port()?;
                    *self.allocated_port.lock().await = Some(fresh);
                    fresh
                }
            };

            let command = self.config.dev_server_command.replace("$PORT", &port.to_string());
            let mut child = self.spawn_group(&command, Some(port)).await?;
            let pid = child.id().map(|pid| pid as i32);

            match self.wait_for_ready(port).await {
                Ok(()) => {
                    let pid = pid.ok_or_else(|| BuilderError::Spawn {
                        message: "dev server exited after readiness".to_string(),
                    })?;
                    let mut children = self.children.lock().await;
                    children.push(ChildRecord {
                        pgid: pid,
                        child,
                        command,
                        tool_call_id: tool_call_id.to_string(),
                        port: Some(port),
                    });
                    let url = format!("{}:{port}", self.config.preview_base);
                    info!(session_id = %self.session_id, port, url = %url, "dev server ready");
                    return Ok(url);
                }
                Err(err) => {
                    let exited = matches!(child.try_wait(), Ok(Some(_)));
                    if let Some(pgid) = pid {
                        signal_group(pgid, libc::SIGTERM);
                    }
                    let _ = timeout(self.config.child_kill_grace, child.wait()).await;
                    if let Some(pgid) = pid {
                        signal_group(pgid, libc::SIGKILL);
                    }
                    if exited {
                        // The process died before serving; most likely it lost
                        // the port to a concurrent bind. Retry on a fresh one.
                        warn!(session_id = %self.session_id, port, "dev server exited early; retrying");
                        last_error = Some(err);
                        continue;
                    }
                    warn!(session_id = %self.session_id, port, "dev server failed readiness probe");
                    return Err(err);
                }
            }
        }
        Err(last_error.unwrap_or(BuilderError::Spawn {
            message: "dev server did not start".to_string(),
        }))
    }

    /// HTTP readiness probe with exponentially spaced retries. Any HTTP
    /// response counts as ready; a broken server still answering 500 is the
    /// agent's problem, not a supervision failure.
    pub async fn wait_for_ready(&self, port: u16) -> Result<(), BuilderError> {
        let url = format!("http://127.0.0.1:{port}/");
        let deadline = tokio::time::Instant::now() + self.config.readiness_timeout;
        let mut delay = Duration::from_millis(100);
        loop {
            if self.http.get(&url).send().await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() + delay > deadline {
                return Err(BuilderError::Timeout {
                    seconds: self.config.readiness_timeout.as_secs(),
                });
            }
            sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(2));
        }
    }

    /// Terminates the current dev server, if one is alive.
    pub async fn stop_dev_server(&self) {
        let mut children = self.children.lock().await;
        let mut kept = Vec::new();
        for record in children.drain(..) {
            if record.port.is_some() {
                terminate_record(record, self.config.child_kill_grace).await;
            } else {
                kept.push(record);
            }
        }
        *children = kept;
    }

    /// Number of live background children, dev server included.
    pub async fn child_count(&self) -> usize {
        self.children.lock().await.len()
    }

    /// Commands of the currently registered children, for diagnostics.
    pub async fn child_commands(&self) -> Vec<String> {
        self.children
            .lock()
            .await
            .iter()
            .map(|record| record.command.clone())
            .collect()
    }

    /// Group-terminates every tracked child with bounded grace, releases the
    /// port, and (when configured) removes the workspace directory.
    pub async fn teardown(&self) {
        let records: Vec<ChildRecord> = self.children.lock().await.drain(..).collect();
        for record in records {
            debug!(
                session_id = %self.session_id,
                pgid = record.pgid,
                tool_call_id = %record.tool_call_id,
                "terminating child group"
            );
            terminate_record(record, self.config.child_kill_grace).await;
        }
        *self.allocated_port.lock().await = None;
        *self.root.lock().await = None;

        if self.config.remove_workspaces && self.workspace.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.workspace) {
                warn!(session_id = %self.session_id, error = %err, "failed to remove workspace");
            }
        }
        info!(session_id = %self.session_id, "sandbox torn down");
    }

    /// Teardown plus a fresh workspace: used by session reset.
    pub async fn reset(&self) -> Result<(), BuilderError> {
        self.teardown().await;
        if self.workspace.exists() {
            std::fs::remove_dir_all(&self.workspace)?;
        }
        self.ensure_workspace().await?;
        Ok(())
    }
}

/// SIGTERM the group, wait out the grace period, then SIGKILL the group.
async fn terminate_record(mut record: ChildRecord, grace: Duration) {
    signal_group(record.pgid, libc::SIGTERM);
    if timeout(grace, record.child.wait()).await.is_err() {
        signal_group(record.pgid, libc::SIGKILL);
        let _ = record.child.wait().await;
    }
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: i32) {
    unsafe {
        libc::kill(-pgid, signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _signal: i32) {}

/// Synchronous containment check against a workspace directory that already
/// exists. The policy gate uses this for its own pass; the supervisor's
/// [`SandboxSupervisor::resolve_path`] is the authoritative one.
pub fn resolve_within(workspace: &Path, input: &str) -> Result<PathBuf, BuilderError> {
    let root = workspace
        .canonicalize()
        .map_err(|_| BuilderError::OutOfSandbox {
            path: input.to_string(),
        })?;
    resolve_against(&root, input)
}

fn resolve_against(root: &Path, input: &str) -> Result<PathBuf, BuilderError> {
    let candidate = Path::new(input);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let canonical = canonicalize_lenient(&joined).map_err(|_| BuilderError::OutOfSandbox {
        path: input.to_string(),
    })?;
    if canonical == *root || !canonical.starts_with(root) {
        return Err(BuilderError::OutOfSandbox {
            path: input.to_string(),
        });
    }
    Ok(canonical)
}

/// Canonicalizes a path that may not exist yet: the deepest existing ancestor
/// is resolved through the filesystem (following symlinks) and the remaining
/// components are re-appended. Paths whose missing tail contains `..` are
/// rejected.
fn canonicalize_lenient(path: &Path) -> std::io::Result<PathBuf> {
    match path.canonicalize() {
        Ok(canonical) => Ok(canonical),
        Err(_) => {
            let parent = path.parent().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
            })?;
            let name = path.file_name().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "unresolvable path component")
            })?;
            Ok(canonicalize_lenient(parent)?.join(name))
        }
    }
}

fn grep_dir(dir: &Path, root: &Path, regex: &regex::Regex, matches: &mut Vec<String>) {
    if matches.len() >= MAX_GREP_MATCHES {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            if SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            grep_dir(&path, root, regex, matches);
        } else {
            grep_file(&path, root, regex, matches);
        }
        if matches.len() >= MAX_GREP_MATCHES {
            return;
        }
    }
}

fn grep_file(path: &Path, root: &Path, regex: &regex::Regex, matches: &mut Vec<String>) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    let display = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string();
    for (index, line) in content.lines().enumerate() {
        if regex.is_match(line) {
            matches.push(format!("{display}:{}: {line}", index + 1));
            if matches.len() >= MAX_GREP_MATCHES {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxMode;

    fn supervisor(root: &Path) -> SandboxSupervisor {
        let mut config = RuntimeConfig::new(root.to_path_buf());
        config.sandbox_mode = SandboxMode::Mock;
        config.readiness_timeout = Duration::from_millis(400);
        config.child_kill_grace = Duration::from_millis(500);
        SandboxSupervisor::new("sess-test", config)
    }

    #[tokio::test]
    async fn workspace_is_scaffolded_once() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        let root = supervisor.ensure_workspace().await.unwrap();
        assert!(root.join("package.json").exists());
        assert!(root.join("curated/registry.json").exists());
        assert!(supervisor.allocated_port().await.is_some());
    }

    #[tokio::test]
    async fn relative_paths_resolve_inside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        let root = supervisor.ensure_workspace().await.unwrap();
        let resolved = supervisor.resolve_path("app/page.tsx").await.unwrap();
        assert!(resolved.starts_with(&root));
    }

    #[tokio::test]
    async fn parent_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor.ensure_workspace().await.unwrap();
        let err = supervisor.resolve_path("../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, BuilderError::OutOfSandbox { .. }));
    }

    #[tokio::test]
    async fn absolute_paths_outside_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor.ensure_workspace().await.unwrap();
        let err = supervisor.resolve_path("/etc/hostname").await.unwrap_err();
        assert!(matches!(err, BuilderError::OutOfSandbox { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        let root = supervisor.ensure_workspace().await.unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("escape")).unwrap();
        let err = supervisor.resolve_path("escape/secret.txt").await.unwrap_err();
        assert!(matches!(err, BuilderError::OutOfSandbox { .. }));
    }

    #[tokio::test]
    async fn write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor
            .write_file("app/components/chart.tsx", "export {}")
            .await
            .unwrap();
        let content = supervisor.read_file("app/components/chart.tsx").await.unwrap();
        assert_eq!(content, "export {}");
    }

    #[tokio::test]
    async fn edit_requires_a_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor
            .write_file("lib/a.ts", "let x = 1;\nlet x2 = 1;\n")
            .await
            .unwrap();

        let err = supervisor.edit_file("lib/a.ts", "= 1;", "= 2;").await.unwrap_err();
        assert!(matches!(err, BuilderError::ToolFailure { .. }));

        supervisor
            .edit_file("lib/a.ts", "let x = 1;", "let x = 9;")
            .await
            .unwrap();
        let content = supervisor.read_file("lib/a.ts").await.unwrap();
        assert!(content.contains("let x = 9;"));
    }

    #[tokio::test]
    async fn glob_and_grep_stay_inside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor
            .write_file("app/page.tsx", "export default function Page() {}\n")
            .await
            .unwrap();

        let matches = supervisor.glob("app/*.tsx").await.unwrap();
        assert_eq!(matches, vec!["app/page.tsx".to_string()]);

        let hits = supervisor.grep("default function", None).await.unwrap();
        assert!(hits.iter().any(|line| line.starts_with("app/page.tsx:1:")));
    }

    #[tokio::test]
    async fn foreground_commands_report_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        let ok = supervisor.run_command("echo out; echo err >&2", None).await.unwrap();
        assert_eq!(ok.exit_code, 0);
        assert_eq!(ok.stdout.trim(), "out");
        assert_eq!(ok.stderr.trim(), "err");

        let failed = supervisor.run_command("exit 7", None).await.unwrap();
        assert_eq!(failed.exit_code, 7);
    }

    #[tokio::test]
    async fn foreground_timeout_kills_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        let err = supervisor.run_command("sleep 30", Some(1)).await.unwrap_err();
        assert!(matches!(err, BuilderError::Timeout { .. }));
    }

    #[tokio::test]
    async fn teardown_clears_children_and_port() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor.ensure_workspace().await.unwrap();
        supervisor.spawn_background("sleep 30", "call_bg").await.unwrap();
        assert_eq!(supervisor.child_count().await, 1);

        supervisor.teardown().await;
        assert_eq!(supervisor.child_count().await, 0);
        assert!(supervisor.allocated_port().await.is_none());
        // Workspace is retained by default for post-mortem inspection.
        assert!(supervisor.workspace().exists());
    }

    #[tokio::test]
    async fn failed_dev_server_probe_leaves_no_children() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::new(dir.path().to_path_buf());
        config.sandbox_mode = SandboxMode::Mock;
        config.readiness_timeout = Duration::from_millis(300);
        config.child_kill_grace = Duration::from_millis(300);
        config.dev_server_command = "sleep 30".to_string();
        let supervisor = SandboxSupervisor::new("sess-probe", config);
        supervisor.ensure_workspace().await.unwrap();

        let err = supervisor.start_dev_server("call_dev").await.unwrap_err();
        assert!(matches!(err, BuilderError::Timeout { .. }));
        assert_eq!(supervisor.child_count().await, 0);
    }

    #[tokio::test]
    async fn readiness_probe_succeeds_against_live_listener() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor.ensure_workspace().await.unwrap();
        let port = supervisor.allocated_port().await.unwrap();

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                use tokio::io::AsyncWriteExt;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                    .await;
            }
        });

        supervisor.wait_for_ready(port).await.unwrap();
    }
}
