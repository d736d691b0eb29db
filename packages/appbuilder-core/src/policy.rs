//! Policy gate.
//!
//! A synchronous allow/deny decision evaluated on every tool call before
//! anything executes. Rules run in a fixed order; the first match wins. A
//! denied call never touches the filesystem or spawns a process — the model
//! receives a synthetic error result explaining why and may re-plan.

use serde_json::Value;
use tracing::warn;

use crate::context::SessionCtx;
use crate::sandbox;
use crate::tools::ToolName;

/// Shell fragments that are never allowed, whatever the surrounding command.
/// Root-wide deletion, privilege escalation, raw device writes, fork bombs,
/// and pipe-to-shell installs.
const DANGEROUS_COMMAND_PATTERNS: [&str; 11] = [
    "rm -rf /",
    "rm -rf ~",
    "rm -rf *",
    "sudo ",
    "> /dev/",
    "mkfs",
    "dd if=",
    ":(){:|:&};:",
    "chmod -R 777 /",
    "curl | bash",
    "wget | bash",
];

/// Canonical-path substrings that mark credential material.
const SENSITIVE_PATH_PATTERNS: [&str; 8] = [
    ".env",
    "credentials",
    "secrets",
    ".git/config",
    "id_rsa",
    ".ssh/",
    "password",
    ".npmrc",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
}

impl PolicyDecision {
    fn deny(reason: impl Into<String>) -> Self {
        PolicyDecision::Deny {
            reason: reason.into(),
        }
    }
}

/// Evaluates the gate for one tool call. Rule order: shell denylist, path
/// containment, sensitive-file denylist, review gate, port bounds.
pub fn decide(tool: ToolName, input: &Value, ctx: &SessionCtx) -> PolicyDecision {
    if tool == ToolName::Bash {
        let command = input.get("command").and_then(Value::as_str).unwrap_or("");
        for pattern in DANGEROUS_COMMAND_PATTERNS {
            if command.contains(pattern) {
                warn!(
                    session_id = %ctx.session_id,
                    command = %command,
                    pattern = %pattern,
                    "blocked dangerous command"
                );
                return PolicyDecision::deny(format!("dangerous command blocked: {pattern}"));
            }
        }
    }

    if tool.is_file_family() {
        if let Some(path) = file_path_of(input) {
            let resolved = sandbox::resolve_within(ctx.supervisor.workspace(), path);
            match resolved {
                Err(_) => {
                    warn!(
                        session_id = %ctx.session_id,
                        path = %path,
                        "blocked path outside workspace"
                    );
                    return PolicyDecision::deny(format!("path outside workspace: {path}"));
                }
                Ok(canonical) => {
                    let lowered = canonical.to_string_lossy().to_lowercase();
                    for pattern in SENSITIVE_PATH_PATTERNS {
                        if lowered.contains(pattern) {
                            warn!(
                                session_id = %ctx.session_id,
                                path = %path,
                                pattern = %pattern,
                                "blocked sensitive file access"
                            );
                            return PolicyDecision::deny(format!(
                                "access to sensitive file denied: {path}"
                            ));
                        }
                    }
                }
            }
        }
    }

    if tool == ToolName::StartDevServer && !ctx.review().allows_dev_server() {
        return PolicyDecision::deny(
            "security review has not passed; run the security-reviewer sub-agent and \
             mark-security-review-passed before starting the dev server",
        );
    }

    if let Some(port) = input.get("port") {
        if let Some(port) = port.as_i64() {
            if !(1..=65535).contains(&port) {
                return PolicyDecision::deny(format!("port out of range: {port}"));
            }
        }
    }

    PolicyDecision::Allow
}

fn file_path_of(input: &Value) -> Option<&str> {
    input
        .get("file_path")
        .or_else(|| input.get("path"))
        .and_then(Value::as_str)
}
