//! Connection manager.
//!
//! Binds one bidirectional envelope channel per session to a long-lived agent
//! session and serializes client turns. Three locks keep the bookkeeping
//! sound: the table lock guards the session map, the per-session agent lock
//! serializes turns (a second chat is rejected, never queued), and the
//! per-session send lock makes envelope order on the channel total.

use std::collections::HashMap;
use std::sync::Arc;

use appbuilder_error::BuilderError;
use appbuilder_protocol::{ClientMessage, Envelope};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::agent::{AgentSession, EnvelopeSink, TransportFactory};
use crate::config::RuntimeConfig;
use crate::context::SessionCtx;

enum AgentSlot {
    /// No agent yet (mid-initialization or after a torn-down reset).
    Empty,
    Ready(AgentSession),
    /// A reset failed; every subsequent operation errors until the session
    /// is discarded.
    Broken,
}

/// One session's channel binding and turn serialization state.
pub struct SessionHandle {
    session_id: String,
    /// Send lock + outbound channel. `None` while no client is bound.
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    /// Turn lock; held for the full lifetime of one chat stream.
    agent: Mutex<AgentSlot>,
    /// Scheduled teardown, cancelled on reconnect.
    cleanup: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            outbound: Mutex::new(None),
            agent: Mutex::new(AgentSlot::Empty),
            cleanup: std::sync::Mutex::new(None),
        }
    }

    async fn bind(&self, channel: mpsc::UnboundedSender<Envelope>) {
        let mut outbound = self.outbound.lock().await;
        // Dropping a previous sender ends the stale socket pump.
        *outbound = Some(channel);
    }

    async fn unbind(&self) {
        let mut outbound = self.outbound.lock().await;
        *outbound = None;
    }

    async fn is_bound(&self) -> bool {
        self.outbound.lock().await.is_some()
    }

    /// Serialized envelope write; drops the envelope when no client is bound
    /// (e.g. turns finishing after a disconnect).
    pub async fn send_envelope(&self, envelope: Envelope) {
        let outbound = self.outbound.lock().await;
        match outbound.as_ref() {
            Some(channel) => {
                if channel.send(envelope).is_err() {
                    warn!(session_id = %self.session_id, "client channel closed during send");
                }
            }
            None => {
                warn!(session_id = %self.session_id, "dropping envelope for unbound session");
            }
        }
    }

    fn cancel_cleanup(&self) {
        let mut cleanup = self
            .cleanup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = cleanup.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl EnvelopeSink for SessionHandle {
    async fn send(&self, envelope: Envelope) {
        self.send_envelope(envelope).await;
    }
}

pub struct ConnectionManager {
    config: RuntimeConfig,
    factory: Arc<dyn TransportFactory>,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl ConnectionManager {
    pub fn new(config: RuntimeConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            config,
            factory,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn new_agent(&self, session_id: &str) -> AgentSession {
        let ctx = Arc::new(SessionCtx::new(session_id, self.config.clone()));
        AgentSession::new(ctx, self.factory.clone())
    }

    /// Binds a channel to a session. With `reconnect` and a live session the
    /// existing agent (and its conversation memory) is reused and any pending
    /// teardown is cancelled; otherwise a fresh agent session is constructed
    /// and fully initialized before the `connection` envelope is emitted. An
    /// initialization failure surfaces as `Err` with no envelope sent.
    pub async fn connect(
        self: &Arc<Self>,
        channel: mpsc::UnboundedSender<Envelope>,
        session_id: &str,
        reconnect: bool,
    ) -> Result<(), BuilderError> {
        let handle = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(session_id) {
                Some(handle) => {
                    // Cancel under the table lock: the expiry task removes the
                    // session under this same lock, so it cannot slip between
                    // our lookup and the abort.
                    handle.cancel_cleanup();
                    handle.clone()
                }
                None => {
                    let handle = Arc::new(SessionHandle::new(session_id));
                    sessions.insert(session_id.to_string(), handle.clone());
                    handle
                }
            }
        };

        let reconnected = if reconnect {
            let slot = handle.agent.try_lock();
            match slot {
                // Locked means a turn from the previous connection is still
                // streaming; the agent exists and is reused.
                Err(_) => true,
                Ok(slot) => matches!(&*slot, AgentSlot::Ready(_)),
            }
        } else {
            false
        };

        if !reconnected {
            let mut slot = handle.agent.lock().await;
            if let AgentSlot::Ready(old) = &mut *slot {
                info!(session_id = %session_id, "replacing agent session for fresh connect");
                old.cleanup().await;
            }
            *slot = AgentSlot::Empty;

            let mut agent = self.new_agent(session_id);
            match agent.initialize().await {
                Ok(()) => *slot = AgentSlot::Ready(agent),
                Err(err) => {
                    drop(slot);
                    self.sessions.lock().await.remove(session_id);
                    error!(session_id = %session_id, error = %err, "agent initialization failed");
                    return Err(err);
                }
            }
        }

        handle.bind(channel).await;
        handle
            .send_envelope(Envelope::Connection {
                session_id: session_id.to_string(),
                reconnected,
            })
            .await;
        info!(session_id = %session_id, reconnected, "client connected");
        Ok(())
    }

    /// Routes one client message. Chat acquires the turn lock (non-blocking;
    /// a busy session rejects), ping answers immediately, reset tears the
    /// agent and workspace down and rebuilds them.
    pub async fn receive(
        self: &Arc<Self>,
        session_id: &str,
        message: ClientMessage,
    ) -> Result<(), BuilderError> {
        let handle = self
            .sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| BuilderError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        match message {
            ClientMessage::Ping => {
                handle.send_envelope(Envelope::Pong).await;
                Ok(())
            }
            ClientMessage::Chat { message } => {
                self.handle_chat(&handle, &message).await;
                Ok(())
            }
            ClientMessage::Reset => {
                self.handle_reset(&handle).await;
                Ok(())
            }
        }
    }

    async fn handle_chat(&self, handle: &Arc<SessionHandle>, message: &str) {
        if message.is_empty() {
            handle
                .send_envelope(Envelope::Error {
                    message: "empty message received".to_string(),
                })
                .await;
            return;
        }

        let Ok(mut slot) = handle.agent.try_lock() else {
            warn!(session_id = %handle.session_id, "chat rejected: turn in flight");
            handle
                .send_envelope(Envelope::Error {
                    message: "please wait for the current response to complete".to_string(),
                })
                .await;
            return;
        };

        let agent = match &mut *slot {
            AgentSlot::Ready(agent) => agent,
            AgentSlot::Broken => {
                handle
                    .send_envelope(Envelope::Error {
                        message: "session is broken; open a new session".to_string(),
                    })
                    .await;
                return;
            }
            AgentSlot::Empty => {
                handle
                    .send_envelope(Envelope::Error {
                        message: "session not initialized".to_string(),
                    })
                    .await;
                return;
            }
        };

        let sink: &dyn EnvelopeSink = handle.as_ref();
        match timeout(self.config.turn_timeout, agent.chat(message, sink)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(session_id = %handle.session_id, error = %err, "turn failed");
                agent.abort_turn();
                handle
                    .send_envelope(Envelope::Error {
                        message: err.to_string(),
                    })
                    .await;
            }
            Err(_) => {
                let seconds = self.config.turn_timeout.as_secs();
                warn!(session_id = %handle.session_id, seconds, "turn timed out");
                agent.abort_turn();
                handle
                    .send_envelope(Envelope::Error {
                        message: format!("response timed out after {seconds} seconds"),
                    })
                    .await;
            }
        }
    }

    async fn handle_reset(&self, handle: &Arc<SessionHandle>) {
        let Ok(mut slot) = handle.agent.try_lock() else {
            handle
                .send_envelope(Envelope::Error {
                    message: "cannot reset while a response is in progress".to_string(),
                })
                .await;
            return;
        };

        if let AgentSlot::Ready(old) = &mut *slot {
            old.cleanup().await;
        }
        *slot = AgentSlot::Empty;

        // The workspace is rebuilt from scratch; session identity persists.
        let workspace = self.config.workspace_root.join(&handle.session_id);
        if workspace.exists() {
            if let Err(err) = std::fs::remove_dir_all(&workspace) {
                warn!(session_id = %handle.session_id, error = %err, "failed to clear workspace");
            }
        }

        let mut agent = self.new_agent(&handle.session_id);
        match agent.initialize().await {
            Ok(()) => {
                *slot = AgentSlot::Ready(agent);
                drop(slot);
                info!(session_id = %handle.session_id, "session reset");
                handle
                    .send_envelope(Envelope::Connection {
                        session_id: handle.session_id.clone(),
                        reconnected: false,
                    })
                    .await;
            }
            Err(err) => {
                *slot = AgentSlot::Broken;
                drop(slot);
                error!(session_id = %handle.session_id, error = %err, "reset failed; session broken");
                handle
                    .send_envelope(Envelope::Error {
                        message: "reset failed; session is broken".to_string(),
                    })
                    .await;
            }
        }
    }

    /// Unbinds the channel. Graceful disconnects schedule teardown after the
    /// grace window so page reloads keep their agent; otherwise teardown runs
    /// immediately.
    pub async fn disconnect(self: &Arc<Self>, session_id: &str, graceful: bool) {
        let handle = {
            let sessions = self.sessions.lock().await;
            sessions.get(session_id).cloned()
        };
        let Some(handle) = handle else {
            return;
        };
        handle.unbind().await;

        if graceful {
            let mut cleanup = handle
                .cleanup
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if cleanup.as_ref().is_some_and(|task| !task.is_finished()) {
                return;
            }
            let manager = Arc::clone(self);
            let session_id = session_id.to_string();
            let grace = self.config.cleanup_grace;
            info!(session_id = %session_id, grace_secs = grace.as_secs(), "scheduled session cleanup");
            *cleanup = Some(tokio::spawn(async move {
                sleep(grace).await;
                manager.expire_session(&session_id).await;
            }));
        } else {
            let removed = self.sessions.lock().await.remove(session_id);
            if let Some(handle) = removed {
                Self::teardown_handle(&handle).await;
            }
        }
    }

    /// Grace-window expiry: removes the session atomically unless a client
    /// rebound in the meantime, then tears the agent down exactly once.
    async fn expire_session(self: &Arc<Self>, session_id: &str) {
        let handle = {
            let mut sessions = self.sessions.lock().await;
            let Some(handle) = sessions.get(session_id).cloned() else {
                return;
            };
            if handle.is_bound().await {
                info!(session_id = %session_id, "client reconnected; cleanup skipped");
                return;
            }
            sessions.remove(session_id)
        };
        if let Some(handle) = handle {
            info!(session_id = %session_id, "grace period expired; tearing session down");
            Self::teardown_handle(&handle).await;
        }
    }

    async fn teardown_handle(handle: &Arc<SessionHandle>) {
        let mut slot = handle.agent.lock().await;
        if let AgentSlot::Ready(agent) = &mut *slot {
            agent.cleanup().await;
        }
        *slot = AgentSlot::Empty;
    }

    /// Sends a standalone error envelope, e.g. for malformed client frames.
    pub async fn send_error(self: &Arc<Self>, session_id: &str, message: &str) {
        let handle = {
            let sessions = self.sessions.lock().await;
            sessions.get(session_id).cloned()
        };
        if let Some(handle) = handle {
            handle
                .send_envelope(Envelope::Error {
                    message: message.to_string(),
                })
                .await;
        }
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Daemon shutdown: tear every session down.
    pub async fn shutdown(self: &Arc<Self>) {
        let handles: Vec<Arc<SessionHandle>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.cancel_cleanup();
            Self::teardown_handle(&handle).await;
        }
    }
}
