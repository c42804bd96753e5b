//! Core data model: interactions, sessions, payloads and responses.
//!
//! These are the internal representations used by [`crate::store`] and
//! [`crate::broker`]. Wire-facing (de)serialization of the same shapes for
//! the WebSocket fan-out layer lives in `broker-gateway::protocol`.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a pending interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InteractionId(pub Uuid);

impl InteractionId {
    /// Allocate a fresh random interaction id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InteractionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InteractionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interaction:{}", self.0)
    }
}

/// Opaque session identifier. Format-validated UUID v4 at every boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Allocate a fresh random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

/// Identifier for an authenticated human user.
///
/// Opaque from the broker's point of view — issuance and verification are
/// the auth layer's responsibility (out of scope, see spec §1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a connected WebSocket subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Allocate a fresh random client id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

/// Risk level assessed for a sensitive action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Routine, reversible.
    Low,
    /// Worth a second look.
    Medium,
    /// Irreversible or broad in effect.
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// The three interaction kinds the broker mediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InteractionKind {
    /// Permit a tool invocation.
    Permission,
    /// Approve a proposed plan.
    PlanApproval,
    /// Free-form multiple-choice question(s).
    AskUser,
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permission => write!(f, "permission"),
            Self::PlanApproval => write!(f, "plan-approval"),
            Self::AskUser => write!(f, "ask-user"),
        }
    }
}

/// Metadata attached to every interaction, independent of its kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionMetadata {
    /// Assessed risk level.
    pub risk_level: RiskLevel,
    /// Free-form category label (e.g. "filesystem", "network").
    pub category: String,
    /// Suggested responses, if any (rendered as quick-pick options).
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl InteractionMetadata {
    /// Build metadata with no suggestions.
    #[must_use]
    pub fn new(risk_level: RiskLevel, category: impl Into<String>) -> Self {
        Self {
            risk_level,
            category: category.into(),
            suggestions: Vec::new(),
        }
    }

    /// Attach suggestions.
    #[must_use]
    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }
}

// ---------------------------------------------------------------------
// Permission
// ---------------------------------------------------------------------

/// Payload for a permission interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionPayload {
    /// Name of the tool the agent wants to invoke.
    pub tool_name: String,
    /// Opaque tool input (kind-specific, not validated by the broker).
    pub tool_input: serde_json::Value,
}

/// The human's decision on a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionDecision {
    /// Allow this one invocation.
    Allow,
    /// Deny this invocation.
    Deny,
    /// Allow for the rest of the session.
    AllowSession,
    /// Allow permanently.
    AllowAlways,
    /// Allow, but with modified tool input.
    Modify,
}

/// Response to a permission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    /// The decision made.
    pub decision: PermissionDecision,
    /// Modified tool input. Required when `decision == Modify`.
    #[serde(default)]
    pub updated_input: Option<serde_json::Value>,
}

impl PermissionResponse {
    /// Build an allow response.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            decision: PermissionDecision::Allow,
            updated_input: None,
        }
    }

    /// Build a deny response.
    #[must_use]
    pub fn deny() -> Self {
        Self {
            decision: PermissionDecision::Deny,
            updated_input: None,
        }
    }

    /// Build a modify response with replacement input.
    #[must_use]
    pub fn modify(updated_input: serde_json::Value) -> Self {
        Self {
            decision: PermissionDecision::Modify,
            updated_input: Some(updated_input),
        }
    }

    /// Validate the `decision=modify ⇒ updatedInput non-nil` invariant.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        match self.decision {
            PermissionDecision::Modify => self.updated_input.is_some(),
            _ => true,
        }
    }

    /// Whether this response proceeds with the tool call.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self.decision, PermissionDecision::Deny)
    }
}

// ---------------------------------------------------------------------
// Plan approval
// ---------------------------------------------------------------------

/// Payload for a plan-approval interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanApprovalPayload {
    /// The plan rendered as markdown.
    pub plan_markdown: String,
    /// Structured list of the plan's proposed steps.
    pub proposed_steps: Vec<String>,
}

/// Agent-side permission mode a plan-approval response may transition to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanApprovalMode {
    /// Normal per-action permission prompting resumes.
    Default,
    /// Edits proceed without further prompting.
    AcceptEdits,
    /// All tool calls proceed without prompting.
    BypassPermissions,
    /// Reject the plan outright.
    Reject,
}

/// Response to a plan-approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanApprovalResponse {
    /// The permission mode to transition the agent session to.
    pub permission_mode: PlanApprovalMode,
    /// Optional free-text feedback from the reviewer.
    #[serde(default)]
    pub feedback: Option<String>,
}

impl PlanApprovalResponse {
    /// Whether this response rejects the plan (terminal via `reject`, not
    /// `resolve` — see spec §4.3 / `PlanApprovalResponse` entity).
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self.permission_mode, PlanApprovalMode::Reject)
    }
}

// ---------------------------------------------------------------------
// Ask user
// ---------------------------------------------------------------------

/// A single selectable option presented to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOption {
    /// Short label.
    pub label: String,
    /// Longer explanation.
    #[serde(default)]
    pub description: Option<String>,
}

/// A single question within an ask-user interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    /// Short header/title.
    pub header: String,
    /// The question text.
    pub question: String,
    /// Selectable options.
    pub options: Vec<QuestionOption>,
    /// Whether more than one option may be selected.
    #[serde(default)]
    pub multi_select: bool,
}

/// Payload for an ask-user interaction. `questions.len() >= 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskUserPayload {
    /// The questions to present, in order.
    pub questions: Vec<Question>,
}

impl AskUserPayload {
    /// Validate the `questions.length >= 1` invariant.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        !self.questions.is_empty()
    }
}

/// A single answer: either one selected option/free-text value, or a set
/// (for `multi_select` questions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    /// Single selection or free text (the `"Other: …"` convention).
    Single(String),
    /// Multiple selections.
    Multi(HashSet<String>),
}

/// Response to an ask-user request: every question index must be answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskUserResponse {
    /// Question index (0-based) -> answer.
    pub answers: HashMap<usize, AnswerValue>,
}

impl AskUserResponse {
    /// Validate that every question in `payload` was answered.
    #[must_use]
    pub fn answers_all(&self, payload: &AskUserPayload) -> bool {
        (0..payload.questions.len()).all(|i| self.answers.contains_key(&i))
    }
}

// ---------------------------------------------------------------------
// The interaction envelope
// ---------------------------------------------------------------------

/// The kind-specific request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "interactionType", rename_all = "kebab-case")]
pub enum InteractionData {
    /// Permission request.
    Permission(PermissionPayload),
    /// Plan approval request.
    PlanApproval(PlanApprovalPayload),
    /// Ask-user request.
    AskUser(AskUserPayload),
}

impl InteractionData {
    /// The discriminant kind for this payload.
    #[must_use]
    pub fn kind(&self) -> InteractionKind {
        match self {
            Self::Permission(_) => InteractionKind::Permission,
            Self::PlanApproval(_) => InteractionKind::PlanApproval,
            Self::AskUser(_) => InteractionKind::AskUser,
        }
    }
}

/// The kind-specific response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "interactionType", rename_all = "kebab-case")]
pub enum InteractionResponse {
    /// Permission decision.
    Permission(PermissionResponse),
    /// Plan approval decision.
    PlanApproval(PlanApprovalResponse),
    /// Ask-user answers.
    AskUser(AskUserResponse),
}

impl InteractionResponse {
    /// The discriminant kind for this response.
    #[must_use]
    pub fn kind(&self) -> InteractionKind {
        match self {
            Self::Permission(_) => InteractionKind::Permission,
            Self::PlanApproval(_) => InteractionKind::PlanApproval,
            Self::AskUser(_) => InteractionKind::AskUser,
        }
    }
}

/// Terminal/non-terminal status of an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InteractionStatus {
    /// Awaiting a response.
    Pending,
    /// Resolved by a human decision.
    Resolved,
    /// Rejected (cancelled, session-evicted, or denied as a safety fallback).
    Rejected,
    /// No response arrived before the per-interaction timer fired.
    TimedOut,
}

impl InteractionStatus {
    /// Whether this status is a sink (no further transitions).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A read-only snapshot of an interaction's state, safe to hand out to
/// callers that should not be able to mutate store internals (fan-out,
/// `getForSessions`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionSnapshot {
    /// Unique id.
    pub id: InteractionId,
    /// Owning session, if any.
    pub session_id: Option<SessionId>,
    /// Owning user.
    pub user_id: UserId,
    /// Kind-specific payload.
    pub data: InteractionData,
    /// Kind-independent metadata.
    pub metadata: InteractionMetadata,
    /// When the interaction was created.
    pub requested_at: DateTime<Utc>,
    /// When the interaction reached a terminal state, if it has.
    pub decided_at: Option<DateTime<Utc>>,
    /// Current status.
    pub status: InteractionStatus,
}

impl InteractionSnapshot {
    /// The interaction's kind, derived from its payload.
    #[must_use]
    pub fn kind(&self) -> InteractionKind {
        self.data.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interaction_id_display() {
        let id = InteractionId::new();
        assert!(id.to_string().starts_with("interaction:"));
    }

    #[test]
    fn permission_response_modify_requires_input() {
        let bad = PermissionResponse {
            decision: PermissionDecision::Modify,
            updated_input: None,
        };
        assert!(!bad.is_well_formed());

        let good = PermissionResponse::modify(serde_json::json!({"path": "/a"}));
        assert!(good.is_well_formed());
    }

    #[test]
    fn permission_response_allow_is_allowed() {
        assert!(PermissionResponse::allow().is_allowed());
        assert!(!PermissionResponse::deny().is_allowed());
    }

    #[test]
    fn plan_approval_reject_is_rejection() {
        let resp = PlanApprovalResponse {
            permission_mode: PlanApprovalMode::Reject,
            feedback: Some("too risky".to_string()),
        };
        assert!(resp.is_rejection());
    }

    #[test]
    fn ask_user_payload_requires_one_question() {
        let empty = AskUserPayload { questions: vec![] };
        assert!(!empty.is_well_formed());

        let one = AskUserPayload {
            questions: vec![Question {
                header: "h".into(),
                question: "q?".into(),
                options: vec![],
                multi_select: false,
            }],
        };
        assert!(one.is_well_formed());
    }

    #[test]
    fn ask_user_response_answers_all() {
        let payload = AskUserPayload {
            questions: vec![
                Question {
                    header: "h1".into(),
                    question: "q1?".into(),
                    options: vec![],
                    multi_select: false,
                },
                Question {
                    header: "h2".into(),
                    question: "q2?".into(),
                    options: vec![],
                    multi_select: true,
                },
            ],
        };

        let mut answers = HashMap::new();
        answers.insert(0, AnswerValue::Single("Other: yes".to_string()));
        let partial = AskUserResponse {
            answers: answers.clone(),
        };
        assert!(!partial.answers_all(&payload));

        answers.insert(
            1,
            AnswerValue::Multi(HashSet::from(["a".to_string(), "b".to_string()])),
        );
        let full = AskUserResponse { answers };
        assert!(full.answers_all(&payload));
    }

    #[test]
    fn interaction_status_terminal() {
        assert!(!InteractionStatus::Pending.is_terminal());
        assert!(InteractionStatus::Resolved.is_terminal());
        assert!(InteractionStatus::Rejected.is_terminal());
        assert!(InteractionStatus::TimedOut.is_terminal());
    }

    #[test]
    fn interaction_data_kind_roundtrip() {
        let data = InteractionData::AskUser(AskUserPayload { questions: vec![] });
        assert_eq!(data.kind(), InteractionKind::AskUser);

        let json = serde_json::to_string(&data).unwrap();
        let back: InteractionData = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), InteractionKind::AskUser);
    }
}
