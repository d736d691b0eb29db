//! Per-session tool-execution context.
//!
//! Every tool call acts on the sandbox and state machines of the session that
//! issued it. The context is threaded explicitly through the dispatch chain —
//! policy gate, hooks, tool execution, sub-agent delegation — so nothing ever
//! reaches for process-global state.

use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::RuntimeConfig;
use crate::sandbox::SandboxSupervisor;
use crate::state::{PlanningState, ReviewState};

#[derive(Debug, Default)]
struct DiscoveryFlags {
    explored: bool,
    warned: bool,
}

/// Shared, session-scoped state consulted by the tool pipeline.
#[derive(Debug)]
pub struct SessionCtx {
    pub session_id: String,
    pub config: RuntimeConfig,
    pub supervisor: Arc<SandboxSupervisor>,
    review: Mutex<ReviewState>,
    planning: Mutex<PlanningState>,
    discovery: Mutex<DiscoveryFlags>,
}

impl SessionCtx {
    pub fn new(session_id: &str, config: RuntimeConfig) -> Self {
        let supervisor = Arc::new(SandboxSupervisor::new(session_id, config.clone()));
        Self {
            session_id: session_id.to_string(),
            config,
            supervisor,
            review: Mutex::new(ReviewState::default()),
            planning: Mutex::new(PlanningState::default()),
            discovery: Mutex::new(DiscoveryFlags::default()),
        }
    }

    pub fn review(&self) -> ReviewState {
        *self.review.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn planning(&self) -> PlanningState {
        *self.planning.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A code-mutating tool call completed; the review gate reacts and a
    /// pending plan moves into its build phase.
    pub fn note_code_mutation(&self) {
        let mut review = self.review.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *review = review.on_code_mutation();
        drop(review);
        let mut planning = self.planning.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *planning = planning.on_build_started();
    }

    pub fn note_review_passed(&self) {
        let mut review = self.review.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *review = review.on_review_passed();
    }

    pub fn note_exploration(&self) {
        let mut planning = self.planning.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *planning = planning.on_exploration();
        let mut discovery = self.discovery.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        discovery.explored = true;
    }

    pub fn note_planner_done(&self, needs_clarification: bool) {
        let mut planning = self.planning.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *planning = planning.on_planner_done(needs_clarification);
    }

    pub fn note_user_approval(&self) {
        let mut planning = self.planning.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *planning = planning.on_user_approval();
    }

    pub fn note_preview_ready(&self) {
        let mut planning = self.planning.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *planning = planning.on_preview_ready();
    }

    /// One-shot check for the discovery reminder: returns true exactly once,
    /// when code is about to be written before any exploration happened.
    pub fn should_remind_discovery(&self) -> bool {
        let mut discovery = self.discovery.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if discovery.explored || discovery.warned {
            return false;
        }
        discovery.warned = true;
        true
    }

    /// Appends one line to the session's audit log. Every tool call is
    /// recorded here, denied attempts included; failures to write never
    /// surface into the call path.
    pub fn audit(&self, tool: &str, decision: &str, detail: &str) {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "-".to_string());
        let line = format!("[{timestamp}] tool={tool} decision={decision} {detail}\n");
        let dir = self.supervisor.workspace().join(".appbuilder");
        if std::fs::create_dir_all(&dir).is_err() {
            return;
        }
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("audit.log"))
        {
            let _ = file.write_all(line.as_bytes());
        }
    }

    /// Reset hook for session resets: state machines return to their initial
    /// values while the session identity persists.
    pub fn reset_state(&self) {
        *self.review.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = ReviewState::default();
        *self.planning.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            PlanningState::default();
        *self.discovery.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            DiscoveryFlags::default();
    }
}
