//! Shared harness for the session-level scenario tests. Everything drives the
//! connection manager directly over an in-memory envelope channel with the
//! scripted model transport, so the full pipeline short of the socket runs.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use appbuilder_core::agent::mock::{ScriptedBehavior, ScriptedFactory};
use appbuilder_core::config::{RuntimeConfig, SandboxMode};
use appbuilder_core::connection::ConnectionManager;
use appbuilder_protocol::{ClientMessage, Envelope};
use tokio::sync::mpsc;

pub struct TestApp {
    pub manager: Arc<ConnectionManager>,
    pub root: tempfile::TempDir,
}

impl TestApp {
    pub fn new(behavior: ScriptedBehavior) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let config = test_config(root.path());
        Self::with_config(config, behavior, root)
    }

    pub fn with_config(
        config: RuntimeConfig,
        behavior: ScriptedBehavior,
        root: tempfile::TempDir,
    ) -> Self {
        let manager = Arc::new(ConnectionManager::new(
            config,
            Arc::new(ScriptedFactory::new(behavior)),
        ));
        Self { manager, root }
    }

    /// Opens a channel and connects; returns the envelope receiver after the
    /// `connection` envelope has been bound.
    pub async fn connect(
        &self,
        session_id: &str,
        reconnect: bool,
    ) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.manager
            .connect(tx, session_id, reconnect)
            .await
            .expect("connect");
        rx
    }

    pub async fn chat(&self, session_id: &str, message: &str) {
        self.manager
            .receive(
                session_id,
                ClientMessage::Chat {
                    message: message.to_string(),
                },
            )
            .await
            .expect("receive chat");
    }

    pub fn workspace(&self, session_id: &str) -> std::path::PathBuf {
        self.root.path().join(session_id)
    }
}

pub fn test_config(root: &Path) -> RuntimeConfig {
    let mut config = RuntimeConfig::new(root.to_path_buf());
    config.sandbox_mode = SandboxMode::Mock;
    config.turn_timeout = Duration::from_secs(60);
    config.cleanup_grace = Duration::from_millis(400);
    config.child_kill_grace = Duration::from_millis(500);
    config.readiness_timeout = Duration::from_millis(800);
    // A command that stays alive but never serves HTTP; tests that need a
    // "ready" dev server run their own listener on the allocated port.
    config.dev_server_command = "sleep 30".to_string();
    config
}

pub async fn next_envelope(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("channel closed")
}

/// Collects envelopes until (and including) the turn's terminal envelope.
pub async fn collect_turn(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Envelope> {
    let mut envelopes = Vec::new();
    loop {
        let envelope = next_envelope(rx).await;
        let terminal = envelope.is_terminal();
        envelopes.push(envelope);
        if terminal {
            return envelopes;
        }
    }
}

pub fn tool_uses<'a>(envelopes: &'a [Envelope]) -> Vec<(&'a str, &'a serde_json::Value)> {
    envelopes
        .iter()
        .filter_map(|envelope| match envelope {
            Envelope::ToolUse { tool, input, .. } => Some((tool.as_str(), input)),
            _ => None,
        })
        .collect()
}

pub fn tool_results(envelopes: &[Envelope]) -> Vec<(&serde_json::Value, bool)> {
    envelopes
        .iter()
        .filter_map(|envelope| match envelope {
            Envelope::ToolResult {
                content, is_error, ..
            } => Some((content, *is_error)),
            _ => None,
        })
        .collect()
}

pub fn done_preview_url(envelopes: &[Envelope]) -> Option<String> {
    envelopes.iter().find_map(|envelope| match envelope {
        Envelope::Done { preview_url, .. } => preview_url.clone(),
        _ => None,
    })
}

pub fn port_of(url: &str) -> u16 {
    url.rsplit(':')
        .next()
        .and_then(|port| port.parse().ok())
        .expect("url carries a port")
}

/// Minimal HTTP responder for readiness probes, bound to a fixed port.
pub async fn serve_http_ok(port: u16) -> tokio::task::JoinHandle<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("bind probe listener");
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await;
        }
    })
}
