//! Activity log entries: the append-only audit trail shown to operators.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    CheckStarted,
    CheckCompleted,
    InventoryChecked,
    EmailSent,
    EmailReceived,
    EtaUpdated,
    EscalationCreated,
    EscalationResolved,
    DeliveryRecorded,
    /// Logged for information only: dismissed proposals, skipped actions, advisor failures.
    Observation,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::CheckStarted => "check_started",
            ActivityType::CheckCompleted => "check_completed",
            ActivityType::InventoryChecked => "inventory_checked",
            ActivityType::EmailSent => "email_sent",
            ActivityType::EmailReceived => "email_received",
            ActivityType::EtaUpdated => "eta_updated",
            ActivityType::EscalationCreated => "escalation_created",
            ActivityType::EscalationResolved => "escalation_resolved",
            ActivityType::DeliveryRecorded => "delivery_recorded",
            ActivityType::Observation => "observation",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "check_started" => ActivityType::CheckStarted,
            "check_completed" => ActivityType::CheckCompleted,
            "inventory_checked" => ActivityType::InventoryChecked,
            "email_sent" => ActivityType::EmailSent,
            "email_received" => ActivityType::EmailReceived,
            "eta_updated" => ActivityType::EtaUpdated,
            "escalation_created" => ActivityType::EscalationCreated,
            "escalation_resolved" => ActivityType::EscalationResolved,
            "delivery_recorded" => ActivityType::DeliveryRecorded,
            "observation" => ActivityType::Observation,
            other => return Err(format!("unknown activity type: {other}")),
        })
    }
}

/// One audit-trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    /// `None` for system-level work such as mailbox polling.
    pub agent_id: Option<String>,
    pub activity_type: ActivityType,
    pub site_id: Option<String>,
    pub load_id: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    pub fn new(activity_type: ActivityType, details: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: None,
            activity_type,
            site_id: None,
            load_id: None,
            details,
            created_at: Utc::now(),
        }
    }

    pub fn by_agent(mut self, agent_id: Option<&str>) -> Self {
        self.agent_id = agent_id.map(str::to_string);
        self
    }

    pub fn for_site(mut self, site_id: Option<&str>) -> Self {
        self.site_id = site_id.map(str::to_string);
        self
    }

    pub fn for_load(mut self, load_id: Option<&str>) -> Self {
        self.load_id = load_id.map(str::to_string);
        self
    }

    /// One-line rendering used in advisor context.
    pub fn summary(&self) -> String {
        let detail = self
            .details
            .get("summary")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.details.to_string());
        format!(
            "{} {}: {}",
            self.created_at.format("%Y-%m-%d %H:%M"),
            self.activity_type,
            detail
        )
    }
}
