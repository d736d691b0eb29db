//! Tool surface.
//!
//! The named operations the reasoning model may invoke. Every tool has a
//! declarative input schema (`schemars`) and returns a structured result with
//! a free-form `output` text, an `exitCode` for shell commands, and an
//! optional `url`. Dispatch always goes through the session's policy gate and
//! hook pipeline before reaching here; this module only parses inputs and
//! delegates to the sandbox supervisor.

use appbuilder_error::BuilderError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::context::SessionCtx;

/// Every tool the runtime dispatches. `task` is intercepted by the agent
/// session (delegation needs a transport); the rest execute here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    Read,
    Write,
    Edit,
    Glob,
    Grep,
    Bash,
    GetPreviewUrl,
    StartDevServer,
    MarkReviewPassed,
    Task,
}

impl ToolName {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Read" => Some(ToolName::Read),
            "Write" => Some(ToolName::Write),
            "Edit" => Some(ToolName::Edit),
            "Glob" => Some(ToolName::Glob),
            "Grep" => Some(ToolName::Grep),
            "Bash" => Some(ToolName::Bash),
            "get-preview-url" => Some(ToolName::GetPreviewUrl),
            "start-dev-server" => Some(ToolName::StartDevServer),
            "mark-security-review-passed" => Some(ToolName::MarkReviewPassed),
            "Task" => Some(ToolName::Task),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::Read => "Read",
            ToolName::Write => "Write",
            ToolName::Edit => "Edit",
            ToolName::Glob => "Glob",
            ToolName::Grep => "Grep",
            ToolName::Bash => "Bash",
            ToolName::GetPreviewUrl => "get-preview-url",
            ToolName::StartDevServer => "start-dev-server",
            ToolName::MarkReviewPassed => "mark-security-review-passed",
            ToolName::Task => "Task",
        }
    }

    /// Tools whose target is a filesystem path inside the workspace.
    pub fn is_file_family(&self) -> bool {
        matches!(
            self,
            ToolName::Read | ToolName::Write | ToolName::Edit | ToolName::Grep
        )
    }

    /// Tools that change files when they succeed.
    pub fn mutates_files(&self) -> bool {
        matches!(self, ToolName::Write | ToolName::Edit)
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReadInput {
    pub file_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WriteInput {
    pub file_path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EditInput {
    pub file_path: String,
    pub old_string: String,
    pub new_string: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GlobInput {
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GrepInput {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BashInput {
    pub command: String,
    /// Start the command as a session-owned background child instead of
    /// waiting for it.
    #[serde(default)]
    pub background: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StartDevServerInput {
    /// Accepted for schema compatibility and ignored: the supervisor always
    /// substitutes the session's allocated port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MarkReviewPassedInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskInput {
    /// Registered sub-agent name.
    pub subagent: String,
    pub prompt: String,
}

/// Structured result of a tool call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutcome {
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ToolOutcome {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn to_content(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "output": self.output }))
    }
}

fn parse_input<T: serde::de::DeserializeOwned>(
    tool: ToolName,
    input: &Value,
) -> Result<T, BuilderError> {
    serde_json::from_value(input.clone()).map_err(|err| BuilderError::ToolFailure {
        message: format!("invalid input for {tool}: {err}"),
    })
}

/// Executes a tool call against the session's sandbox. The caller has already
/// run the policy gate and pre-hooks; `task` never reaches this function.
pub async fn execute(
    tool: ToolName,
    input: &Value,
    call_id: &str,
    ctx: &SessionCtx,
) -> Result<ToolOutcome, BuilderError> {
    match tool {
        ToolName::Read => {
            let input: ReadInput = parse_input(tool, input)?;
            let content = ctx.supervisor.read_file(&input.file_path).await?;
            Ok(ToolOutcome::text(content))
        }
        ToolName::Write => {
            let input: WriteInput = parse_input(tool, input)?;
            let resolved = ctx.supervisor.write_file(&input.file_path, &input.content).await?;
            Ok(ToolOutcome::text(format!(
                "Wrote {} bytes to {}",
                input.content.len(),
                resolved.display()
            )))
        }
        ToolName::Edit => {
            let input: EditInput = parse_input(tool, input)?;
            let resolved = ctx
                .supervisor
                .edit_file(&input.file_path, &input.old_string, &input.new_string)
                .await?;
            Ok(ToolOutcome::text(format!("Edited {}", resolved.display())))
        }
        ToolName::Glob => {
            let input: GlobInput = parse_input(tool, input)?;
            let matches = ctx.supervisor.glob(&input.pattern).await?;
            Ok(ToolOutcome::text(if matches.is_empty() {
                "No files matched".to_string()
            } else {
                matches.join("\n")
            }))
        }
        ToolName::Grep => {
            let input: GrepInput = parse_input(tool, input)?;
            let matches = ctx
                .supervisor
                .grep(&input.pattern, input.path.as_deref())
                .await?;
            Ok(ToolOutcome::text(if matches.is_empty() {
                "No matches".to_string()
            } else {
                matches.join("\n")
            }))
        }
        ToolName::Bash => {
            let input: BashInput = parse_input(tool, input)?;
            if input.background {
                let pid = ctx.supervisor.spawn_background(&input.command, call_id).await?;
                Ok(ToolOutcome {
                    output: format!("Started in background (pid {pid})"),
                    exit_code: Some(0),
                    url: None,
                })
            } else {
                let outcome = ctx
                    .supervisor
                    .run_command(&input.command, input.timeout_secs)
                    .await?;
                let mut output = String::new();
                if !outcome.stdout.is_empty() {
                    output.push_str(&outcome.stdout);
                }
                if !outcome.stderr.is_empty() {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&outcome.stderr);
                }
                Ok(ToolOutcome {
                    output,
                    exit_code: Some(outcome.exit_code),
                    url: None,
                })
            }
        }
        ToolName::GetPreviewUrl => match ctx.supervisor.preview_url().await {
            Some(url) => Ok(ToolOutcome {
                output: format!("Preview URL: {url}"),
                exit_code: None,
                url: Some(url),
            }),
            None => Err(BuilderError::ToolFailure {
                message: "no port allocated yet".to_string(),
            }),
        },
        ToolName::StartDevServer => {
            let input: StartDevServerInput = parse_input(tool, input)?;
            if let Some(requested) = input.port {
                if Some(requested) != ctx.supervisor.allocated_port().await {
                    tracing::debug!(
                        session_id = %ctx.session_id,
                        requested,
                        "ignoring requested dev-server port in favor of the allocated one"
                    );
                }
            }
            let url = ctx.supervisor.start_dev_server(call_id).await?;
            ctx.note_preview_ready();
            Ok(ToolOutcome {
                output: format!("Dev server running at {url}"),
                exit_code: None,
                url: Some(url),
            })
        }
        ToolName::MarkReviewPassed => {
            let input: MarkReviewPassedInput = parse_input(tool, input)?;
            ctx.note_review_passed();
            let summary = input.summary.unwrap_or_else(|| "no findings".to_string());
            tracing::info!(session_id = %ctx.session_id, summary = %summary, "security review passed");
            Ok(ToolOutcome::text("Security review recorded as passed"))
        }
        ToolName::Task => Err(BuilderError::ToolFailure {
            message: "task delegation is handled by the agent session".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuntimeConfig, SandboxMode};
    use crate::state::ReviewState;
    use schemars::schema_for;

    fn ctx(root: &std::path::Path) -> SessionCtx {
        let mut config = RuntimeConfig::new(root.to_path_buf());
        config.sandbox_mode = SandboxMode::Mock;
        SessionCtx::new("sess-tools", config)
    }

    #[test]
    fn tool_names_round_trip() {
        for tool in [
            ToolName::Read,
            ToolName::Write,
            ToolName::Edit,
            ToolName::Glob,
            ToolName::Grep,
            ToolName::Bash,
            ToolName::GetPreviewUrl,
            ToolName::StartDevServer,
            ToolName::MarkReviewPassed,
            ToolName::Task,
        ] {
            assert_eq!(ToolName::parse(tool.as_str()), Some(tool));
        }
        assert_eq!(ToolName::parse("Delete"), None);
    }

    #[test]
    fn input_schemas_declare_required_fields() {
        let schema = serde_json::to_value(schema_for!(WriteInput)).unwrap();
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "file_path"));
        assert!(required.iter().any(|v| v == "content"));

        let schema = serde_json::to_value(schema_for!(BashInput)).unwrap();
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "command"));
    }

    #[tokio::test]
    async fn write_then_read_through_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());

        let outcome = execute(
            ToolName::Write,
            &json!({ "file_path": "app/page.tsx", "content": "export default 1" }),
            "call_1",
            &ctx,
        )
        .await
        .unwrap();
        assert!(outcome.output.contains("Wrote"));

        let outcome = execute(
            ToolName::Read,
            &json!({ "file_path": "app/page.tsx" }),
            "call_2",
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(outcome.output, "export default 1");
    }

    #[tokio::test]
    async fn bash_reports_exit_code_in_content() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let outcome = execute(
            ToolName::Bash,
            &json!({ "command": "exit 3" }),
            "call_3",
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        let content = outcome.to_content();
        assert_eq!(content["exitCode"], 3);
    }

    #[tokio::test]
    async fn mark_review_passed_transitions_state() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        assert_eq!(ctx.review(), ReviewState::None);
        execute(ToolName::MarkReviewPassed, &json!({}), "call_4", &ctx)
            .await
            .unwrap();
        assert_eq!(ctx.review(), ReviewState::Passed);
    }

    #[tokio::test]
    async fn preview_url_uses_allocated_port() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        ctx.supervisor.ensure_workspace().await.unwrap();
        let port = ctx.supervisor.allocated_port().await.unwrap();
        let outcome = execute(ToolName::GetPreviewUrl, &json!({}), "call_5", &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.url, Some(format!("http://localhost:{port}")));
    }
}
