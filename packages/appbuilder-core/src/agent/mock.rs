//! Scripted model transport.
//!
//! Backs `mock` mode and the test suite: user and system messages are matched
//! against registered scripts by substring and the scripted events play back
//! through the normal tool pipeline. Anything without a script is echoed as
//! an assistant message, so the runtime stays explorable without a model
//! process.

use std::collections::VecDeque;

use appbuilder_error::BuilderError;
use appbuilder_protocol::{ModelEvent, ModelInput};
use async_trait::async_trait;
use serde_json::Value;

use crate::context::SessionCtx;

use super::transport::{ModelTransport, TransportFactory, TransportRole};

/// Convenience constructors for scripted events.
pub fn text(content: &str) -> ModelEvent {
    ModelEvent::Text {
        content: content.to_string(),
    }
}

pub fn tool_use(id: &str, name: &str, input: Value) -> ModelEvent {
    ModelEvent::ToolUse {
        id: id.to_string(),
        name: name.to_string(),
        input,
    }
}

pub fn result_ok() -> ModelEvent {
    ModelEvent::Result {
        cost_usd: Some(0.01),
        duration_ms: Some(1200),
        num_turns: Some(1),
        is_error: false,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedBehavior {
    /// Substring of a user message → events to play.
    pub user_scripts: Vec<(String, Vec<ModelEvent>)>,
    /// Substring of an injected system message → events to play.
    pub system_scripts: Vec<(String, Vec<ModelEvent>)>,
    /// Sub-agent profile name → final text of its scripted reply.
    pub subagent_replies: Vec<(String, String)>,
}

impl ScriptedBehavior {
    pub fn with_user_script(mut self, key: &str, events: Vec<ModelEvent>) -> Self {
        self.user_scripts.push((key.to_string(), events));
        self
    }

    pub fn with_system_script(mut self, key: &str, events: Vec<ModelEvent>) -> Self {
        self.system_scripts.push((key.to_string(), events));
        self
    }

    pub fn with_subagent_reply(mut self, profile: &str, reply: &str) -> Self {
        self.subagent_replies.push((profile.to_string(), reply.to_string()));
        self
    }
}

pub struct ScriptedTransport {
    behavior: ScriptedBehavior,
    queue: VecDeque<ModelEvent>,
    /// Fixed reply used for sub-agent roles instead of script matching.
    fixed_reply: Option<String>,
}

impl ScriptedTransport {
    pub fn new(behavior: ScriptedBehavior) -> Self {
        Self {
            behavior,
            queue: VecDeque::new(),
            fixed_reply: None,
        }
    }

    fn for_subagent(behavior: ScriptedBehavior, profile: &str) -> Self {
        let reply = behavior
            .subagent_replies
            .iter()
            .find(|(name, _)| name == profile)
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| format!("{profile} completed"));
        Self {
            behavior,
            queue: VecDeque::new(),
            fixed_reply: Some(reply),
        }
    }

    fn enqueue_user(&mut self, content: &str) {
        if let Some(reply) = &self.fixed_reply {
            let reply = reply.clone();
            self.queue.push_back(text(&reply));
            self.queue.push_back(result_ok());
            return;
        }
        let script = self
            .behavior
            .user_scripts
            .iter()
            .find(|(key, _)| content.contains(key.as_str()))
            .map(|(_, events)| events.clone());
        match script {
            Some(events) => self.queue.extend(events),
            None => {
                self.queue.push_back(text(content));
                self.queue.push_back(result_ok());
            }
        }
    }

    fn enqueue_system(&mut self, content: &str) {
        let script = self
            .behavior
            .system_scripts
            .iter()
            .find(|(key, _)| content.contains(key.as_str()))
            .map(|(_, events)| events.clone());
        if let Some(events) = script {
            self.queue.extend(events);
        }
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn send(&mut self, input: ModelInput) -> Result<(), BuilderError> {
        match input {
            ModelInput::User { content } => self.enqueue_user(&content),
            ModelInput::System { content } => self.enqueue_system(&content),
            // Tool results do not branch scripts; the remaining queue plays on.
            ModelInput::ToolResult { .. } => {}
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<ModelEvent>, BuilderError> {
        Ok(self.queue.pop_front())
    }

    fn drain_pending(&mut self) {
        self.queue.clear();
    }

    async fn disconnect(&mut self) {
        self.queue.clear();
    }
}

/// Factory for scripted transports; cloned behavior per created transport.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFactory {
    pub behavior: ScriptedBehavior,
}

impl ScriptedFactory {
    pub fn new(behavior: ScriptedBehavior) -> Self {
        Self { behavior }
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(
        &self,
        role: TransportRole<'_>,
        _ctx: &SessionCtx,
    ) -> Result<Box<dyn ModelTransport>, BuilderError> {
        Ok(match role {
            TransportRole::Main => Box::new(ScriptedTransport::new(self.behavior.clone())),
            TransportRole::SubAgent(profile) => Box::new(ScriptedTransport::for_subagent(
                self.behavior.clone(),
                profile.name,
            )),
        })
    }
}
