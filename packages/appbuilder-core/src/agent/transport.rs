//! Reasoning-model transports.
//!
//! The agent session talks to the model through [`ModelTransport`]: one JSON
//! object per line in each direction. The production implementation hosts the
//! model as a subprocess; the scripted implementation in [`super::mock`]
//! backs `mock` mode and the test suite.

use std::process::Stdio;

use appbuilder_error::BuilderError;
use appbuilder_protocol::{ModelEvent, ModelInput};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::context::SessionCtx;
use crate::subagents::SubAgentProfile;

/// Bidirectional line-oriented channel to a reasoning model.
#[async_trait]
pub trait ModelTransport: Send {
    async fn send(&mut self, input: ModelInput) -> Result<(), BuilderError>;

    /// Next typed event from the model; `None` when the stream ended.
    async fn next_event(&mut self) -> Result<Option<ModelEvent>, BuilderError>;

    /// Discards events buffered from a cancelled turn so they cannot leak
    /// into the next one.
    fn drain_pending(&mut self);

    /// Tears the transport down; idempotent and infallible.
    async fn disconnect(&mut self);
}

/// Who a transport is being created for.
pub enum TransportRole<'a> {
    Main,
    SubAgent(&'a SubAgentProfile),
}

/// Creates transports for main agents and sub-agent delegations.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        role: TransportRole<'_>,
        ctx: &SessionCtx,
    ) -> Result<Box<dyn ModelTransport>, BuilderError>;
}

/// Hosts the reasoning model as a subprocess speaking newline-delimited JSON
/// over stdin/stdout. Stderr is drained into the server log.
pub struct SubprocessTransport {
    child: Child,
    stdin_tx: mpsc::UnboundedSender<String>,
    events_rx: mpsc::UnboundedReceiver<String>,
}

impl SubprocessTransport {
    pub fn spawn(
        session_id: &str,
        command: &[String],
        api_key: Option<&str>,
        workspace: &std::path::Path,
        extra_args: &[String],
    ) -> Result<Self, BuilderError> {
        let (program, args) = command.split_first().ok_or_else(|| BuilderError::Init {
            message: "model command is empty".to_string(),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .args(extra_args)
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(key) = api_key {
            cmd.env("MODEL_API_KEY", key);
        }

        let mut child = cmd.spawn().map_err(|err| BuilderError::Init {
            message: format!("failed to spawn model process: {err}"),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| BuilderError::Init {
            message: "model process has no stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| BuilderError::Init {
            message: "model process has no stderr".to_string(),
        })?;
        let mut stdin = child.stdin.take().ok_or_else(|| BuilderError::Init {
            message: "model process has no stdin".to_string(),
        })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if events_tx.send(line).is_err() {
                    break;
                }
            }
        });

        let session = session_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(session_id = %session, line = %line, "model stderr");
            }
        });

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            child,
            stdin_tx,
            events_rx,
        })
    }
}

#[async_trait]
impl ModelTransport for SubprocessTransport {
    async fn send(&mut self, input: ModelInput) -> Result<(), BuilderError> {
        let line = serde_json::to_string(&input)?;
        self.stdin_tx
            .send(line)
            .map_err(|_| BuilderError::ToolFailure {
                message: "model process closed its stdin".to_string(),
            })
    }

    async fn next_event(&mut self) -> Result<Option<ModelEvent>, BuilderError> {
        loop {
            let Some(line) = self.events_rx.recv().await else {
                return Ok(None);
            };
            match serde_json::from_str::<ModelEvent>(&line) {
                Ok(event) => return Ok(Some(event)),
                Err(err) => {
                    // Unparseable output is diagnostic noise, not fatal.
                    warn!(error = %err, line = %line, "skipping unparseable model output");
                }
            }
        }
    }

    fn drain_pending(&mut self) {
        while self.events_rx.try_recv().is_ok() {}
    }

    async fn disconnect(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Default factory: one model subprocess per agent, with profile flags for
/// sub-agent delegations.
pub struct SubprocessFactory;

impl TransportFactory for SubprocessFactory {
    fn create(
        &self,
        role: TransportRole<'_>,
        ctx: &SessionCtx,
    ) -> Result<Box<dyn ModelTransport>, BuilderError> {
        let extra_args = match role {
            TransportRole::Main => Vec::new(),
            TransportRole::SubAgent(profile) => vec![
                "--profile".to_string(),
                profile.name.to_string(),
                "--model-tier".to_string(),
                profile.tier.as_str().to_string(),
            ],
        };
        let transport = SubprocessTransport::spawn(
            &ctx.session_id,
            &ctx.config.model_command,
            ctx.config.model_api_key.as_deref(),
            ctx.supervisor.workspace(),
            &extra_args,
        )?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuntimeConfig, SandboxMode};
    use serde_json::json;

    #[tokio::test]
    async fn subprocess_round_trips_events_through_cat() {
        // `cat` echoes stdin to stdout, so every input line comes back; the
        // transport must skip lines that are not model events and surface the
        // ones that are.
        let dir = tempfile::tempdir().unwrap();
        let mut transport = SubprocessTransport::spawn(
            "sess-transport",
            &["cat".to_string()],
            None,
            dir.path(),
            &[],
        )
        .unwrap();

        // A user line echoes back as an unparseable model event and is
        // skipped; the hand-written event line is surfaced.
        transport
            .send(ModelInput::User {
                content: "hello".to_string(),
            })
            .await
            .unwrap();
        transport
            .stdin_tx
            .send(
                json!({ "type": "text", "content": "hi there" })
                    .to_string(),
            )
            .unwrap();

        let event = transport.next_event().await.unwrap().unwrap();
        assert_eq!(
            event,
            ModelEvent::Text {
                content: "hi there".to_string()
            }
        );
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn factory_requires_a_model_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::new(dir.path().to_path_buf());
        config.sandbox_mode = SandboxMode::Mock;
        config.model_command = Vec::new();
        let ctx = SessionCtx::new("sess-factory", config);
        match SubprocessFactory.create(TransportRole::Main, &ctx) {
            Err(err) => assert!(matches!(err, BuilderError::Init { .. })),
            Ok(_) => panic!("expected factory to reject a missing model command"),
        }
    }
}
