//! The three typed request paths the agent runtime awaits, per spec §4.3.
//!
//! Thin wrapper over [`crate::store::InteractionStore`], the same shape as
//! `ApprovalManager::check_approval`'s orchestration: build a request,
//! race it against a timeout/cancellation signal, translate the outcome
//! into a typed response. Here the "timeout" is already built into the
//! store (a per-kind timer armed at `create`), so the broker's own
//! `tokio::select!` only has to race the store future against the caller's
//! cancellation signal.

use tokio_util::sync::CancellationToken;

use crate::error::{BrokerError, Result};
use crate::store::{InteractionStore, RejectReason};
use crate::types::{
    AskUserPayload, AskUserResponse, InteractionData, InteractionMetadata, InteractionResponse,
    PermissionPayload, PermissionResponse, PlanApprovalPayload, PlanApprovalResponse, RiskLevel,
    SessionId, UserId,
};

/// Agent-side permission mode. Some modes short-circuit a permission
/// request without ever creating an interaction (spec §4.3, §9 glossary
/// "Permission mode").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    /// Every tool call is prompted for.
    Default,
    /// Read/Write/Edit proceed without prompting.
    AcceptEdits,
    /// Only a read-only/planning tool subset proceeds without prompting.
    Plan,
    /// Every tool call proceeds without prompting.
    BypassPermissions,
}

const ACCEPT_EDITS_TOOLS: &[&str] = &["Read", "Write", "Edit"];

const PLAN_MODE_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "Task",
    "ExitPlanMode",
    "TodoRead",
    "TodoWrite",
    "AskUserQuestion",
];

fn mode_short_circuit(mode: PermissionMode, tool_name: &str) -> Option<PermissionResponse> {
    match mode {
        PermissionMode::BypassPermissions => Some(PermissionResponse::allow()),
        PermissionMode::AcceptEdits if ACCEPT_EDITS_TOOLS.contains(&tool_name) => {
            Some(PermissionResponse::allow())
        }
        PermissionMode::Plan if PLAN_MODE_TOOLS.contains(&tool_name) => {
            Some(PermissionResponse::allow())
        }
        _ => None,
    }
}

/// Facade over [`InteractionStore`] offering the three typed request paths
/// the agent runtime calls directly.
#[derive(Clone)]
pub struct Broker {
    store: InteractionStore,
}

impl Broker {
    /// Wrap an existing store.
    #[must_use]
    pub fn new(store: InteractionStore) -> Self {
        Self { store }
    }

    /// The underlying store, for components (sweeper, `FanoutRouter`) that
    /// need direct access.
    #[must_use]
    pub fn store(&self) -> &InteractionStore {
        &self.store
    }

    /// Request permission to invoke a tool. Mode-based short-circuits
    /// (spec §4.3) avoid creating an interaction entirely when applicable;
    /// otherwise blocks on a human decision.
    pub async fn request_permission(
        &self,
        tool_name: &str,
        tool_input: serde_json::Value,
        session_id: Option<SessionId>,
        user_id: UserId,
        risk_level: RiskLevel,
        category: impl Into<String>,
        suggestions: Vec<String>,
        mode: PermissionMode,
        cancel: &CancellationToken,
    ) -> Result<PermissionResponse> {
        if let Some(response) = mode_short_circuit(mode, tool_name) {
            return Ok(response);
        }

        let data = InteractionData::Permission(PermissionPayload {
            tool_name: tool_name.to_string(),
            tool_input,
        });
        let metadata = InteractionMetadata::new(risk_level, category).with_suggestions(suggestions);

        let (id, rx) = self.store.create(data, session_id, user_id, metadata)?;

        let outcome = tokio::select! {
            biased;
            res = rx.wait() => res,
            () = cancel.cancelled() => {
                let _ = self.store.reject(id, RejectReason::Cancelled);
                Err(BrokerError::Cancelled(id))
            }
        };

        match outcome? {
            InteractionResponse::Permission(response) => Ok(response),
            other => Err(BrokerError::Internal(format!(
                "expected permission response, got {:?}",
                other.kind()
            ))),
        }
    }

    /// Request approval of a proposed plan.
    pub async fn request_plan_approval(
        &self,
        plan_markdown: impl Into<String>,
        proposed_steps: Vec<String>,
        session_id: Option<SessionId>,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<PlanApprovalResponse> {
        let data = InteractionData::PlanApproval(PlanApprovalPayload {
            plan_markdown: plan_markdown.into(),
            proposed_steps,
        });
        let metadata = InteractionMetadata::new(RiskLevel::Medium, "plan-approval");

        let (id, rx) = self.store.create(data, session_id, user_id, metadata)?;

        let outcome = tokio::select! {
            biased;
            res = rx.wait() => res,
            () = cancel.cancelled() => {
                let _ = self.store.reject(id, RejectReason::Cancelled);
                Err(BrokerError::Cancelled(id))
            }
        };

        match outcome? {
            InteractionResponse::PlanApproval(response) => Ok(response),
            other => Err(BrokerError::Internal(format!(
                "expected plan-approval response, got {:?}",
                other.kind()
            ))),
        }
    }

    /// Ask the user one or more multiple-choice questions.
    pub async fn ask_user(
        &self,
        questions: Vec<crate::types::Question>,
        session_id: Option<SessionId>,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<AskUserResponse> {
        let payload = AskUserPayload { questions };
        if !payload.is_well_formed() {
            return Err(BrokerError::Internal(
                "ask_user requires at least one question".to_string(),
            ));
        }

        let data = InteractionData::AskUser(payload);
        let metadata = InteractionMetadata::new(RiskLevel::Low, "ask-user");

        let (id, rx) = self.store.create(data, session_id, user_id, metadata)?;

        let outcome = tokio::select! {
            biased;
            res = rx.wait() => res,
            () = cancel.cancelled() => {
                let _ = self.store.reject(id, RejectReason::Cancelled);
                Err(BrokerError::Cancelled(id))
            }
        };

        match outcome? {
            InteractionResponse::AskUser(response) => Ok(response),
            other => Err(BrokerError::Internal(format!(
                "expected ask-user response, got {:?}",
                other.kind()
            ))),
        }
    }
}
