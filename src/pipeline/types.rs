//! Shared types for the decision pipeline.

use serde::{Deserialize, Serialize};

use crate::logistics::{IssueType, Priority};

/// Whether a rule's proposal can be acted on without review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Definite,
    /// Sent to the advisor before anything happens.
    Ambiguous,
}

/// What a rule wants done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    Escalate {
        issue_type: IssueType,
        priority: Priority,
        description: String,
    },
    RequestEta {
        po_number: String,
    },
    Observe {
        note: String,
    },
}

/// One rule output for a site.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposedAction {
    pub kind: ActionKind,
    pub confidence: Confidence,
    pub site_id: String,
    pub load_id: Option<String>,
    pub carrier_id: Option<String>,
    /// Stable identifier of the rule that fired.
    pub rule: &'static str,
}

impl ProposedAction {
    pub fn summary(&self) -> String {
        match &self.kind {
            ActionKind::Escalate {
                priority,
                description,
                ..
            } => format!("{priority} escalation: {description}"),
            ActionKind::RequestEta { po_number } => format!("request ETA for {po_number}"),
            ActionKind::Observe { note } => note.clone(),
        }
    }
}

/// Which decision tier settled an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Rule,
    Advisor,
}

/// A proposal after the advisor has had its say.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedAction {
    Escalate {
        issue_type: IssueType,
        priority: Priority,
        description: String,
    },
    RequestEta {
        po_number: String,
    },
    Observe {
        note: String,
    },
    Dismiss {
        reason: String,
    },
}

/// A settled action ready for the execution-mode gate.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub action: PlannedAction,
    pub tier: Tier,
    pub site_id: String,
    pub load_id: Option<String>,
    pub carrier_id: Option<String>,
    pub rule: &'static str,
}

impl Plan {
    /// Take a definite proposal as-is.
    pub fn from_rule(proposal: ProposedAction) -> Self {
        let action = match proposal.kind {
            ActionKind::Escalate {
                issue_type,
                priority,
                description,
            } => PlannedAction::Escalate {
                issue_type,
                priority,
                description,
            },
            ActionKind::RequestEta { po_number } => PlannedAction::RequestEta { po_number },
            ActionKind::Observe { note } => PlannedAction::Observe { note },
        };
        Self {
            action,
            tier: Tier::Rule,
            site_id: proposal.site_id,
            load_id: proposal.load_id,
            carrier_id: proposal.carrier_id,
            rule: proposal.rule,
        }
    }

    pub fn summary(&self) -> String {
        match &self.action {
            PlannedAction::Escalate {
                priority,
                description,
                ..
            } => format!("{priority} escalation: {description}"),
            PlannedAction::RequestEta { po_number } => format!("request ETA for {po_number}"),
            PlannedAction::Observe { note } => note.clone(),
            PlannedAction::Dismiss { reason } => format!("dismissed: {reason}"),
        }
    }
}
