//! Status legality rules per node type.
//!
//! READY_TO_CHECK is reserved for ACTION nodes holding an unreviewed
//! candidate artifact; GOAL and CHECK nodes must never carry it.

use crate::model::{NodeType, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRuleError {
    pub message: String,
}

impl std::fmt::Display for StatusRuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StatusRuleError {}

pub fn allowed_statuses_for_node_type(node_type: NodeType) -> &'static [TaskStatus] {
    use TaskStatus::*;
    match node_type {
        NodeType::Goal => &[Pending, Ready, InProgress, Blocked, Done, Failed, Abandoned],
        NodeType::Action => &[
            Pending,
            Ready,
            InProgress,
            Blocked,
            ReadyToCheck,
            ToBeModify,
            Done,
            Failed,
            Abandoned,
        ],
        NodeType::Check => &[Pending, Ready, InProgress, Blocked, Done, Failed, Abandoned],
    }
}

pub fn validate_status_for_node_type(
    node_type: &str,
    status: &str,
) -> Result<(), StatusRuleError> {
    let nt = NodeType::from_str(node_type.trim()).ok_or_else(|| StatusRuleError {
        message: format!("unknown node_type: {:?}", node_type),
    })?;
    let st = TaskStatus::from_str(status.trim()).ok_or_else(|| StatusRuleError {
        message: format!("unknown status: {:?}", status),
    })?;
    if !allowed_statuses_for_node_type(nt).contains(&st) {
        return Err(StatusRuleError {
            message: format!(
                "status {:?} is not allowed for node_type {:?}",
                st.as_str(),
                nt.as_str()
            ),
        });
    }
    Ok(())
}
