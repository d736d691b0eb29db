//! Hook pipeline.
//!
//! Two phases wrap every tool call. Pre-hooks run before execution and may
//! deny (sharing the policy gate's deny mechanism) or inject a system
//! message; post-hooks observe the outcome and may inject a system message
//! into the model's next step or fail the turn. Hooks match on tool name,
//! run strictly sequentially, and a failing hook is logged without aborting
//! the pipeline.

use serde_json::Value;
use tracing::{error, info, warn};

use appbuilder_error::BuilderError;

use crate::context::SessionCtx;
use crate::sandbox;
use crate::tools::{ToolName, ToolOutcome};

/// Shell commands treated as build/verification steps by the self-correction
/// hook.
const BUILD_COMMANDS: [&str; 4] = ["npm run build", "npx tsc", "next build", "npm run type-check"];

/// Sub-agents whose successful completion counts as data exploration.
const EXPLORATION_SUBAGENTS: [&str; 2] = ["data-explorer", "requirements-analyzer"];

/// Marker the planner profile emits when it still needs answers from the
/// user.
const NEEDS_CLARIFICATION_MARKER: &str = "NEEDS_CLARIFICATION";

/// How much captured output a correction message may carry.
const MAX_INJECTED_OUTPUT: usize = 2000;

/// Result of the pre-hook phase for one tool call.
#[derive(Debug, Clone, Default)]
pub struct PreOutcome {
    /// Set when a pre-hook denied the call.
    pub deny: Option<String>,
    /// System messages to hand to the model before the call executes.
    pub inject: Vec<String>,
}

/// One action produced by the post-hook phase.
#[derive(Debug, Clone, PartialEq)]
pub enum PostAction {
    /// Feed a synthetic system message into the model's next step.
    InjectSystem(String),
    /// The turn cannot continue; surface a terminal error instead.
    FailTurn(String),
}

/// Per-turn hook state; reset at the start of every user turn.
#[derive(Debug, Default)]
pub struct TurnHookState {
    /// Consecutive failed build cycles within this turn.
    pub failed_build_cycles: u32,
}

/// View of a finished tool call handed to post-hooks.
#[derive(Debug)]
pub struct OutcomeView<'a> {
    pub outcome: Option<&'a ToolOutcome>,
    pub is_error: bool,
}

#[derive(Debug, Clone, Copy)]
enum HookMatcher {
    Any,
    FileFamily,
    Mutating,
    Tool(ToolName),
}

impl HookMatcher {
    fn matches(&self, tool: ToolName) -> bool {
        match self {
            HookMatcher::Any => true,
            HookMatcher::FileFamily => tool.is_file_family(),
            HookMatcher::Mutating => tool.mutates_files(),
            HookMatcher::Tool(name) => tool == *name,
        }
    }
}

type PreHookFn = fn(&SessionCtx, ToolName, &Value) -> Result<PreHookAction, BuilderError>;
type PostHookFn = fn(
    &SessionCtx,
    ToolName,
    &Value,
    &OutcomeView<'_>,
    &mut TurnHookState,
    &HookPipeline,
) -> Result<Option<PostAction>, BuilderError>;

#[derive(Debug, Clone, Default)]
enum PreHookAction {
    #[default]
    None,
    Deny(String),
    Inject(String),
}

struct PreHook {
    name: &'static str,
    matcher: HookMatcher,
    run: PreHookFn,
}

struct PostHook {
    name: &'static str,
    matcher: HookMatcher,
    run: PostHookFn,
}

pub struct HookPipeline {
    max_correction_cycles: u32,
    pre: Vec<PreHook>,
    post: Vec<PostHook>,
}

impl HookPipeline {
    pub fn new(max_correction_cycles: u32) -> Self {
        Self {
            max_correction_cycles,
            pre: vec![
                PreHook {
                    name: "audit-log",
                    matcher: HookMatcher::Any,
                    run: audit_log,
                },
                PreHook {
                    name: "validate-paths",
                    matcher: HookMatcher::FileFamily,
                    run: validate_paths,
                },
                PreHook {
                    name: "discovery-reminder",
                    matcher: HookMatcher::Mutating,
                    run: discovery_reminder,
                },
            ],
            post: vec![
                PostHook {
                    name: "build-failure-correction",
                    matcher: HookMatcher::Tool(ToolName::Bash),
                    run: build_failure_correction,
                },
                PostHook {
                    name: "review-invalidation",
                    matcher: HookMatcher::Mutating,
                    run: review_invalidation,
                },
                PostHook {
                    name: "planning-tracking",
                    matcher: HookMatcher::Any,
                    run: planning_tracking,
                },
            ],
        }
    }

    /// Runs every matching pre-hook in order. The first deny wins but later
    /// hooks still run (the audit log must never be skipped by ordering).
    pub fn run_pre(&self, ctx: &SessionCtx, tool: ToolName, input: &Value) -> PreOutcome {
        let mut result = PreOutcome::default();
        for hook in &self.pre {
            if !hook.matcher.matches(tool) {
                continue;
            }
            match (hook.run)(ctx, tool, input) {
                Ok(PreHookAction::None) => {}
                Ok(PreHookAction::Deny(reason)) => {
                    if result.deny.is_none() {
                        result.deny = Some(reason);
                    }
                }
                Ok(PreHookAction::Inject(message)) => result.inject.push(message),
                Err(err) => {
                    error!(hook = hook.name, error = %err, "pre-hook failed");
                }
            }
        }
        result
    }

    /// Runs every matching post-hook in order, collecting their actions.
    pub fn run_post(
        &self,
        ctx: &SessionCtx,
        tool: ToolName,
        input: &Value,
        outcome: &OutcomeView<'_>,
        turn: &mut TurnHookState,
    ) -> Vec<PostAction> {
        let mut actions = Vec::new();
        for hook in &self.post {
            if !hook.matcher.matches(tool) {
                continue;
            }
            match (hook.run)(ctx, tool, input, outcome, turn, self) {
                Ok(Some(action)) => actions.push(action),
                Ok(None) => {}
                Err(err) => {
                    error!(hook = hook.name, error = %err, "post-hook failed");
                }
            }
        }
        actions
    }
}

/// Truncates at a char boundary at or below `max` bytes.
fn truncate_utf8(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("...");
}

/// Unconditional audit record of every tool call; never denies.
fn audit_log(ctx: &SessionCtx, tool: ToolName, input: &Value) -> Result<PreHookAction, BuilderError> {
    let mut rendered = input.to_string();
    truncate_utf8(&mut rendered, 200);
    info!(
        session_id = %ctx.session_id,
        tool = %tool,
        input = %rendered,
        "tool call"
    );
    Ok(PreHookAction::None)
}

/// Defence-in-depth duplicate of the policy gate's containment check.
fn validate_paths(
    ctx: &SessionCtx,
    _tool: ToolName,
    input: &Value,
) -> Result<PreHookAction, BuilderError> {
    let Some(path) = input
        .get("file_path")
        .or_else(|| input.get("path"))
        .and_then(Value::as_str)
    else {
        return Ok(PreHookAction::None);
    };
    match sandbox::resolve_within(ctx.supervisor.workspace(), path) {
        Ok(_) => Ok(PreHookAction::None),
        Err(_) => {
            warn!(session_id = %ctx.session_id, path = %path, "pre-hook rejected path");
            Ok(PreHookAction::Deny(format!("path outside workspace: {path}")))
        }
    }
}

/// One-time soft reminder to explore available data before writing code.
fn discovery_reminder(
    ctx: &SessionCtx,
    _tool: ToolName,
    _input: &Value,
) -> Result<PreHookAction, BuilderError> {
    if !ctx.should_remind_discovery() {
        return Ok(PreHookAction::None);
    }
    Ok(PreHookAction::Inject(
        "## Reminder: Discovery Phase\n\n\
         You are about to write code without exploring available data first. \
         Consider delegating to the `data-explorer` sub-agent to discover data \
         sources and confirm requirements. If requirements are already agreed \
         with the user, proceed."
            .to_string(),
    ))
}

/// When a known build command fails, steer the model into the review/fix
/// loop; after too many consecutive failures, give up on the turn.
fn build_failure_correction(
    ctx: &SessionCtx,
    _tool: ToolName,
    input: &Value,
    outcome: &OutcomeView<'_>,
    turn: &mut TurnHookState,
    pipeline: &HookPipeline,
) -> Result<Option<PostAction>, BuilderError> {
    let command = input.get("command").and_then(Value::as_str).unwrap_or("");
    if !BUILD_COMMANDS.iter().any(|build| command.contains(build)) {
        return Ok(None);
    }
    let exit_code = outcome.outcome.and_then(|o| o.exit_code);
    let failed = outcome.is_error || exit_code.is_some_and(|code| code != 0);
    if !failed {
        turn.failed_build_cycles = 0;
        return Ok(None);
    }

    turn.failed_build_cycles += 1;
    if turn.failed_build_cycles > pipeline.max_correction_cycles {
        warn!(
            session_id = %ctx.session_id,
            cycles = turn.failed_build_cycles,
            "build kept failing; ending turn"
        );
        return Ok(Some(PostAction::FailTurn(format!(
            "build failed {} consecutive times; giving up on this turn",
            turn.failed_build_cycles
        ))));
    }

    let mut output = outcome
        .outcome
        .map(|o| o.output.clone())
        .unwrap_or_default();
    truncate_utf8(&mut output, MAX_INJECTED_OUTPUT);
    warn!(
        session_id = %ctx.session_id,
        command = %command,
        exit_code = exit_code.unwrap_or(-1),
        "build failed; injecting self-correction"
    );
    Ok(Some(PostAction::InjectSystem(format!(
        "## Build Failed - Self-Correction Required\n\n\
         `{command}` failed with exit code {code}.\n\n\
         ### Output\n```\n{output}\n```\n\n\
         ### Required Actions\n\
         1. Read the error output carefully and identify the root cause.\n\
         2. Delegate to the `code-reviewer` sub-agent (via the Task tool) to \
         analyze the errors.\n\
         3. Delegate to the `error-fixer` sub-agent to apply each fix.\n\
         4. Run the build again to verify.\n\n\
         Do NOT start the preview server until the build succeeds.",
        code = exit_code.unwrap_or(-1),
    ))))
}

/// Any successful file mutation re-opens the security question.
fn review_invalidation(
    ctx: &SessionCtx,
    tool: ToolName,
    _input: &Value,
    outcome: &OutcomeView<'_>,
    _turn: &mut TurnHookState,
    _pipeline: &HookPipeline,
) -> Result<Option<PostAction>, BuilderError> {
    if outcome.is_error {
        return Ok(None);
    }
    info!(session_id = %ctx.session_id, tool = %tool, "code mutated; review state updated");
    ctx.note_code_mutation();
    Ok(None)
}

/// Advances the planning state machine on exploration and planner
/// completions.
fn planning_tracking(
    ctx: &SessionCtx,
    tool: ToolName,
    input: &Value,
    outcome: &OutcomeView<'_>,
    _turn: &mut TurnHookState,
    _pipeline: &HookPipeline,
) -> Result<Option<PostAction>, BuilderError> {
    if outcome.is_error || tool != ToolName::Task {
        return Ok(None);
    }
    let subagent = input.get("subagent").and_then(Value::as_str).unwrap_or("");
    if EXPLORATION_SUBAGENTS.contains(&subagent) {
        ctx.note_exploration();
    } else if subagent == "planner" {
        let needs_clarification = outcome
            .outcome
            .is_some_and(|o| o.output.contains(NEEDS_CLARIFICATION_MARKER));
        ctx.note_planner_done(needs_clarification);
    }
    Ok(None)
}
