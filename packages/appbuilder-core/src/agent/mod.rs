//! Agent session.
//!
//! The long-lived wrapper around one reasoning-model transport. A session is
//! initialized exactly once, holds the model's multi-turn memory for the life
//! of the user session, and translates user turns into envelope streams:
//! every tool request from the model passes the policy gate and hook pipeline
//! before it executes on the sandbox supervisor.

pub mod mock;
pub mod transport;

use std::sync::Arc;

use appbuilder_error::BuilderError;
use appbuilder_protocol::{Envelope, ModelEvent, ModelInput};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::SessionCtx;
use crate::hooks::{HookPipeline, OutcomeView, PostAction, TurnHookState};
use crate::policy::{self, PolicyDecision};
use crate::prompt;
use crate::scaffold::CuratedComponent;
use crate::subagents::{SubAgentProfile, SubAgentRegistry};
use crate::tools::{self, TaskInput, ToolName, ToolOutcome};

pub use transport::{ModelTransport, SubprocessFactory, TransportFactory, TransportRole};

/// Upper bound on events consumed from one sub-agent delegation.
const MAX_SUBAGENT_EVENTS: usize = 128;

/// Destination for the envelopes of a turn. The connection layer implements
/// this on top of the per-session send lock.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn send(&self, envelope: Envelope);
}

pub struct AgentSession {
    ctx: Arc<SessionCtx>,
    factory: Arc<dyn TransportFactory>,
    registry: SubAgentRegistry,
    hooks: HookPipeline,
    transport: Option<Box<dyn ModelTransport>>,
    /// Set when a turn was cancelled mid-stream; the next turn drains stale
    /// events before sending anything.
    needs_drain: bool,
}

impl AgentSession {
    pub fn new(ctx: Arc<SessionCtx>, factory: Arc<dyn TransportFactory>) -> Self {
        let hooks = HookPipeline::new(ctx.config.max_correction_cycles);
        Self {
            ctx,
            factory,
            registry: SubAgentRegistry::default(),
            hooks,
            transport: None,
            needs_drain: false,
        }
    }

    pub fn ctx(&self) -> &Arc<SessionCtx> {
        &self.ctx
    }

    /// Materializes the workspace, composes the system prompt, and connects
    /// the model transport. Called exactly once per agent session.
    pub async fn initialize(&mut self) -> Result<(), BuilderError> {
        if self.transport.is_some() {
            return Err(BuilderError::Init {
                message: "agent session already initialized".to_string(),
            });
        }
        let workspace = self
            .ctx
            .supervisor
            .ensure_workspace()
            .await
            .map_err(|err| BuilderError::Init {
                message: format!("workspace creation failed: {err}"),
            })?;

        let curated = load_curated_registry(&workspace);
        let system_prompt = prompt::compose(&self.ctx.config, &self.registry, &curated);

        let mut transport = self.factory.create(TransportRole::Main, &self.ctx)?;
        transport
            .send(ModelInput::System {
                content: system_prompt,
            })
            .await?;
        self.transport = Some(transport);
        info!(session_id = %self.ctx.session_id, "agent session initialized");
        Ok(())
    }

    /// Marks the previous turn as cancelled so its leftover stream events are
    /// discarded before the next one.
    pub fn abort_turn(&mut self) {
        self.needs_drain = true;
    }

    /// Processes one user turn, emitting envelopes into `sink` until the
    /// model's terminal summary arrives. Returns `Err` when the turn failed;
    /// the caller owns the terminal `error` envelope in that case.
    pub async fn chat(&mut self, message: &str, sink: &dyn EnvelopeSink) -> Result<(), BuilderError> {
        let transport = self.transport.as_mut().ok_or_else(|| BuilderError::Init {
            message: "agent session not initialized".to_string(),
        })?;
        if self.needs_drain {
            transport.drain_pending();
            self.needs_drain = false;
        }

        // A user turn that arrives while a plan awaits approval is the
        // approval.
        self.ctx.note_user_approval();

        transport
            .send(ModelInput::User {
                content: message.to_string(),
            })
            .await?;

        let mut turn = TurnHookState::default();
        let mut preview_url: Option<String> = None;

        loop {
            let event = transport.next_event().await?;
            let Some(event) = event else {
                return Err(BuilderError::ToolFailure {
                    message: "model stream ended unexpectedly".to_string(),
                });
            };
            match event {
                ModelEvent::Text { content } => {
                    sink.send(Envelope::Text { content }).await;
                }
                ModelEvent::ToolResult {
                    id,
                    content,
                    is_error,
                } => {
                    sink.send(Envelope::ToolResult {
                        tool_use_id: id,
                        content,
                        is_error,
                    })
                    .await;
                }
                ModelEvent::Result {
                    cost_usd,
                    duration_ms,
                    num_turns,
                    is_error,
                } => {
                    if is_error {
                        return Err(BuilderError::ToolFailure {
                            message: "model reported a failed turn".to_string(),
                        });
                    }
                    let url = match preview_url.take() {
                        Some(url) => Some(url),
                        None => self.ctx.supervisor.preview_url().await,
                    };
                    sink.send(Envelope::Done {
                        preview_url: url,
                        cost_usd,
                        duration_ms,
                        num_turns,
                    })
                    .await;
                    return Ok(());
                }
                ModelEvent::ToolUse { id, name, input } => {
                    let resolution = resolve_call(
                        &self.ctx,
                        &self.hooks,
                        &self.registry,
                        self.factory.as_ref(),
                        &mut turn,
                        None,
                        &name,
                        &input,
                        &id,
                    )
                    .await;

                    if !resolution.denied {
                        sink.send(Envelope::ToolUse {
                            tool: name.clone(),
                            input: input.clone(),
                            id: id.clone(),
                        })
                        .await;
                    }

                    transport
                        .send(ModelInput::ToolResult {
                            id: id.clone(),
                            content: resolution.content.clone(),
                            is_error: resolution.is_error,
                        })
                        .await?;
                    sink.send(Envelope::ToolResult {
                        tool_use_id: id,
                        content: resolution.content,
                        is_error: resolution.is_error,
                    })
                    .await;

                    for message in resolution.inject {
                        transport.send(ModelInput::System { content: message }).await?;
                    }
                    if let Some(url) = resolution.url {
                        preview_url = Some(url);
                    }
                    if let Some(reason) = resolution.fail {
                        return Err(BuilderError::ToolFailure { message: reason });
                    }
                }
            }
        }
    }

    /// Disconnects the transport and releases session-bound resources.
    /// Idempotent and infallible by contract.
    pub async fn cleanup(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect().await;
        }
        self.ctx.supervisor.teardown().await;
        info!(session_id = %self.ctx.session_id, "agent session cleaned up");
    }
}

/// Outcome of gating and executing a single tool call.
struct CallResolution {
    content: Value,
    is_error: bool,
    url: Option<String>,
    /// System messages to hand the model after the result.
    inject: Vec<String>,
    /// Set when a post-hook decided the turn cannot continue.
    fail: Option<String>,
    /// True when the call was rejected before execution; the `tool_use`
    /// envelope is suppressed in that case.
    denied: bool,
}

impl CallResolution {
    fn denied(reason: String) -> Self {
        Self {
            content: Value::String(format!("Tool call blocked: {reason}")),
            is_error: true,
            url: None,
            inject: Vec::new(),
            fail: None,
            denied: true,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn resolve_call(
    ctx: &Arc<SessionCtx>,
    hooks: &HookPipeline,
    registry: &SubAgentRegistry,
    factory: &dyn TransportFactory,
    turn: &mut TurnHookState,
    profile: Option<&SubAgentProfile>,
    name: &str,
    input: &Value,
    call_id: &str,
) -> CallResolution {
    let Some(tool) = ToolName::parse(name) else {
        ctx.audit(name, "deny", "unknown tool");
        return CallResolution::denied(format!("unknown tool: {name}"));
    };

    if let Some(profile) = profile {
        if tool == ToolName::Task {
            ctx.audit(name, "deny", &format!("nested delegation from {}", profile.name));
            return CallResolution::denied("nested delegation is not permitted".to_string());
        }
        if !profile.allows(tool) {
            ctx.audit(name, "deny", &format!("outside {} tool subset", profile.name));
            return CallResolution::denied(format!(
                "tool {tool} is not permitted for sub-agent {}",
                profile.name
            ));
        }
    }

    if let PolicyDecision::Deny { reason } = policy::decide(tool, input, ctx) {
        ctx.audit(name, "deny", &reason);
        return CallResolution::denied(reason);
    }

    let pre = hooks.run_pre(ctx, tool, input);
    if let Some(reason) = pre.deny {
        ctx.audit(name, "deny", &reason);
        return CallResolution::denied(reason);
    }
    ctx.audit(name, "allow", call_id);

    let executed = if tool == ToolName::Task {
        run_subagent(ctx, hooks, registry, factory, turn, input).await
    } else {
        tools::execute(tool, input, call_id, ctx).await
    };

    let (content, is_error, url, outcome) = match &executed {
        Ok(outcome) => {
            // A shell command that exited non-zero is a tool failure even
            // though the dispatch itself succeeded.
            let failed = outcome.exit_code.is_some_and(|code| code != 0);
            (outcome.to_content(), failed, outcome.url.clone(), Some(outcome))
        }
        Err(err) => {
            debug!(session_id = %ctx.session_id, tool = %tool, error = %err, "tool failed");
            (Value::String(err.to_string()), true, None, None)
        }
    };

    let view = OutcomeView { outcome, is_error };
    let mut inject = pre.inject;
    let mut fail = None;
    for action in hooks.run_post(ctx, tool, input, &view, turn) {
        match action {
            PostAction::InjectSystem(message) => inject.push(message),
            PostAction::FailTurn(reason) => fail = Some(reason),
        }
    }

    CallResolution {
        content,
        is_error,
        url,
        inject,
        fail,
        denied: false,
    }
}

/// Runs one sub-agent delegation to completion on its own transport. The
/// sub-agent shares the session's policy gate, hook pipeline, and workspace
/// but only sees its declared tool subset; its intermediate activity stays in
/// the server log.
async fn run_subagent(
    ctx: &Arc<SessionCtx>,
    hooks: &HookPipeline,
    registry: &SubAgentRegistry,
    factory: &dyn TransportFactory,
    turn: &mut TurnHookState,
    input: &Value,
) -> Result<ToolOutcome, BuilderError> {
    let task: TaskInput =
        serde_json::from_value(input.clone()).map_err(|err| BuilderError::ToolFailure {
            message: format!("invalid task input: {err}"),
        })?;
    let profile = registry
        .get(&task.subagent)
        .ok_or_else(|| BuilderError::ToolFailure {
            message: format!("unknown sub-agent: {}", task.subagent),
        })?;

    info!(
        session_id = %ctx.session_id,
        subagent = %profile.name,
        "delegating to sub-agent"
    );
    let mut transport = factory.create(TransportRole::SubAgent(profile), ctx)?;
    transport
        .send(ModelInput::System {
            content: profile.system_prompt.to_string(),
        })
        .await?;
    transport
        .send(ModelInput::User {
            content: task.prompt.clone(),
        })
        .await?;

    let mut text = String::new();
    for _ in 0..MAX_SUBAGENT_EVENTS {
        let Some(event) = transport.next_event().await? else {
            transport.disconnect().await;
            return Err(BuilderError::ToolFailure {
                message: format!("sub-agent {} stream ended unexpectedly", profile.name),
            });
        };
        match event {
            ModelEvent::Text { content } => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&content);
            }
            ModelEvent::Result { is_error, .. } => {
                transport.disconnect().await;
                if is_error {
                    return Err(BuilderError::ToolFailure {
                        message: format!("sub-agent {} failed", profile.name),
                    });
                }
                return Ok(ToolOutcome::text(text.trim().to_string()));
            }
            ModelEvent::ToolUse { id, name, input } => {
                let resolution = Box::pin(resolve_call(
                    ctx,
                    hooks,
                    registry,
                    factory,
                    turn,
                    Some(profile),
                    &name,
                    &input,
                    &id,
                ))
                .await;
                debug!(
                    session_id = %ctx.session_id,
                    subagent = %profile.name,
                    tool = %name,
                    is_error = resolution.is_error,
                    "sub-agent tool call"
                );
                transport
                    .send(ModelInput::ToolResult {
                        id,
                        content: resolution.content,
                        is_error: resolution.is_error,
                    })
                    .await?;
                for message in resolution.inject {
                    transport.send(ModelInput::System { content: message }).await?;
                }
                if let Some(reason) = resolution.fail {
                    transport.disconnect().await;
                    return Err(BuilderError::ToolFailure { message: reason });
                }
            }
            ModelEvent::ToolResult { .. } => {}
        }
    }
    transport.disconnect().await;
    warn!(session_id = %ctx.session_id, subagent = %profile.name, "sub-agent exceeded step budget");
    Err(BuilderError::ToolFailure {
        message: format!("sub-agent {} exceeded its step budget", profile.name),
    })
}

fn load_curated_registry(workspace: &std::path::Path) -> Vec<CuratedComponent> {
    let path = workspace.join("curated").join("registry.json");
    match std::fs::read_to_string(&path) {
        Ok(body) => serde_json::from_str(&body).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}
