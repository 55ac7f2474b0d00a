//! The task-graph vocabulary and typed entity views.
//!
//! Every enum that crosses the database or contract boundary carries an
//! `as_str`/`from_str` pair; the string forms are the canonical wire values.
//! Entities reference each other by id only — no cyclic pointers.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

// =============================================================================
// Node / edge / requirement vocabulary
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Aggregator node; DONE when its DECOMPOSE children complete.
    Goal,
    /// Executor-run node producing a deliverable.
    Action,
    /// Reviewer-run node.
    Check,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Goal => "GOAL",
            NodeType::Action => "ACTION",
            NodeType::Check => "CHECK",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GOAL" => Some(NodeType::Goal),
            "ACTION" => Some(NodeType::Action),
            "CHECK" => Some(NodeType::Check),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    Decompose,
    DependsOn,
    Alternative,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Decompose => "DECOMPOSE",
            EdgeType::DependsOn => "DEPENDS_ON",
            EdgeType::Alternative => "ALTERNATIVE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DECOMPOSE" => Some(EdgeType::Decompose),
            "DEPENDS_ON" => Some(EdgeType::DependsOn),
            "ALTERNATIVE" => Some(EdgeType::Alternative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AndOr {
    #[default]
    And,
    Or,
}

impl AndOr {
    pub fn as_str(&self) -> &'static str {
        match self {
            AndOr::And => "AND",
            AndOr::Or => "OR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "AND" => Some(AndOr::And),
            "OR" => Some(AndOr::Or),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementKind {
    File,
    Confirmation,
    SkillOutput,
}

impl RequirementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequirementKind::File => "FILE",
            RequirementKind::Confirmation => "CONFIRMATION",
            RequirementKind::SkillOutput => "SKILL_OUTPUT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "FILE" => Some(RequirementKind::File),
            "CONFIRMATION" => Some(RequirementKind::Confirmation),
            "SKILL_OUTPUT" => Some(RequirementKind::SkillOutput),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementSource {
    User,
    Agent,
    Any,
}

impl RequirementSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequirementSource::User => "USER",
            RequirementSource::Agent => "AGENT",
            RequirementSource::Any => "ANY",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "USER" => Some(RequirementSource::User),
            "AGENT" => Some(RequirementSource::Agent),
            "ANY" => Some(RequirementSource::Any),
            _ => None,
        }
    }
}

// =============================================================================
// Task status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    /// ACTION only: an unreviewed candidate artifact is waiting for the reviewer.
    ReadyToCheck,
    ToBeModify,
    Blocked,
    Done,
    Failed,
    Abandoned,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Ready => "READY",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::ReadyToCheck => "READY_TO_CHECK",
            TaskStatus::ToBeModify => "TO_BE_MODIFY",
            TaskStatus::Blocked => "BLOCKED",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Abandoned => "ABANDONED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "READY" => Some(TaskStatus::Ready),
            "IN_PROGRESS" => Some(TaskStatus::InProgress),
            "READY_TO_CHECK" => Some(TaskStatus::ReadyToCheck),
            "TO_BE_MODIFY" => Some(TaskStatus::ToBeModify),
            "BLOCKED" => Some(TaskStatus::Blocked),
            "DONE" => Some(TaskStatus::Done),
            "FAILED" => Some(TaskStatus::Failed),
            "ABANDONED" => Some(TaskStatus::Abandoned),
            _ => None,
        }
    }

    /// Terminal states never revisited by the readiness sweep.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedReason {
    WaitingInput,
    WaitingSkill,
    WaitingExternal,
    WaitingApproval,
}

impl BlockedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockedReason::WaitingInput => "WAITING_INPUT",
            BlockedReason::WaitingSkill => "WAITING_SKILL",
            BlockedReason::WaitingExternal => "WAITING_EXTERNAL",
            BlockedReason::WaitingApproval => "WAITING_APPROVAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "WAITING_INPUT" => Some(BlockedReason::WaitingInput),
            "WAITING_SKILL" => Some(BlockedReason::WaitingSkill),
            "WAITING_EXTERNAL" => Some(BlockedReason::WaitingExternal),
            "WAITING_APPROVAL" => Some(BlockedReason::WaitingApproval),
            _ => None,
        }
    }
}

// =============================================================================
// Review vocabulary
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    Approve,
    Modify,
    RequestExternalInput,
}

impl ReviewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewAction::Approve => "APPROVE",
            ReviewAction::Modify => "MODIFY",
            ReviewAction::RequestExternalInput => "REQUEST_EXTERNAL_INPUT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "APPROVE" => Some(ReviewAction::Approve),
            "MODIFY" => Some(ReviewAction::Modify),
            "REQUEST_EXTERNAL_INPUT" => Some(ReviewAction::RequestExternalInput),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestionPriority {
    High,
    Med,
    Low,
}

impl SuggestionPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionPriority::High => "HIGH",
            SuggestionPriority::Med => "MED",
            SuggestionPriority::Low => "LOW",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "HIGH" => Some(SuggestionPriority::High),
            "MED" => Some(SuggestionPriority::Med),
            "LOW" => Some(SuggestionPriority::Low),
            _ => None,
        }
    }
}

/// Artifact formats the executor is allowed to emit.
pub const ALLOWED_ARTIFACT_FORMATS: &[&str] = &["md", "txt", "json", "html", "css", "js"];

/// Wire-level agent ids. The executor and reviewer ids appear inside
/// persisted contracts, so they are fixed strings rather than display names.
pub const AGENT_EXECUTOR: &str = "xiaobo";
pub const AGENT_REVIEWER: &str = "xiaojing";
pub const ALLOWED_AGENTS: &[&str] = &[AGENT_EXECUTOR, AGENT_REVIEWER];

// =============================================================================
// Entities
// =============================================================================

#[derive(Debug, Clone)]
pub struct Plan {
    pub plan_id: String,
    pub title: String,
    pub owner_agent_id: String,
    pub root_task_id: String,
    pub created_at: String,
    pub constraints: JsonValue,
}

#[derive(Debug, Clone)]
pub struct TaskNode {
    pub task_id: String,
    pub plan_id: String,
    pub node_type: NodeType,
    pub title: String,
    pub goal_statement: Option<String>,
    pub owner_agent_id: String,
    pub priority: i64,
    pub status: TaskStatus,
    pub blocked_reason: Option<BlockedReason>,
    pub attempt_count: i64,
    pub active_branch: bool,
    pub active_artifact_id: Option<String>,
    pub approved_artifact_id: Option<String>,
    pub tags: Vec<String>,
    // Strong-workflow (v2) fields; nullable in v1 plans.
    pub estimated_person_days: Option<f64>,
    pub deliverable_spec: Option<JsonValue>,
    pub acceptance_criteria: Option<JsonValue>,
    pub review_target_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Evidence {
    pub evidence_id: String,
    pub requirement_id: String,
    pub evidence_type: String,
    /// Dedup key: file content hash, confirmation id, or skill-output id.
    pub ref_id: String,
    pub ref_path: Option<String>,
    pub sha256: Option<String>,
    pub added_at: String,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub artifact_id: String,
    pub task_id: String,
    pub name: String,
    pub path: String,
    pub format: String,
    pub version: i64,
    pub sha256: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct Review {
    pub review_id: String,
    pub task_id: String,
    pub reviewer_agent_id: String,
    pub reviewed_artifact_id: Option<String>,
    pub total_score: i64,
    pub breakdown: JsonValue,
    pub suggestions: JsonValue,
    pub summary: String,
    pub action_required: ReviewAction,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub event_id: String,
    pub plan_id: String,
    pub task_id: Option<String>,
    pub event_type: String,
    pub payload: JsonValue,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Ready,
            TaskStatus::InProgress,
            TaskStatus::ReadyToCheck,
            TaskStatus::ToBeModify,
            TaskStatus::Blocked,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Abandoned,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::from_str("RUNNING"), None);
    }

    #[test]
    fn test_edge_and_node_round_trip() {
        for et in [EdgeType::Decompose, EdgeType::DependsOn, EdgeType::Alternative] {
            assert_eq!(EdgeType::from_str(et.as_str()), Some(et));
        }
        for nt in [NodeType::Goal, NodeType::Action, NodeType::Check] {
            assert_eq!(NodeType::from_str(nt.as_str()), Some(nt));
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Abandoned.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::ReadyToCheck.is_terminal());
    }
}
