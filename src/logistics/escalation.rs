//! Escalations: human-actionable issues raised by the decision pipeline or an operator.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of problem an escalation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    InventoryRisk,
    DelayedLoad,
    StaleEta,
    CarrierUnreliability,
    Other,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::InventoryRisk => "inventory_risk",
            IssueType::DelayedLoad => "delayed_load",
            IssueType::StaleEta => "stale_eta",
            IssueType::CarrierUnreliability => "carrier_unreliability",
            IssueType::Other => "other",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "inventory_risk" => Ok(IssueType::InventoryRisk),
            "delayed_load" => Ok(IssueType::DelayedLoad),
            "stale_eta" => Ok(IssueType::StaleEta),
            "carrier_unreliability" => Ok(IssueType::CarrierUnreliability),
            "other" => Ok(IssueType::Other),
            other => Err(format!("unknown issue type: {other}")),
        }
    }
}

/// Escalation urgency, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// Contribution of one resolved escalation to a site's weighted total.
    pub fn weight(&self) -> f64 {
        match self {
            Priority::Low => 0.25,
            Priority::Medium => 0.5,
            Priority::High => 0.75,
            Priority::Critical => 1.0,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationStatus {
    Open,
    Resolved,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Open => "open",
            EscalationStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for EscalationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(EscalationStatus::Open),
            "resolved" => Ok(EscalationStatus::Resolved),
            other => Err(format!("unknown escalation status: {other}")),
        }
    }
}

/// A flagged issue awaiting human resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Uuid,
    pub issue_type: IssueType,
    pub priority: Priority,
    pub description: String,
    pub status: EscalationStatus,
    pub site_id: Option<String>,
    pub load_id: Option<String>,
    /// Agent that raised it; `None` for operator-created escalations.
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    /// Set at resolution: the underlying issue turned out not to exist.
    pub false_alarm: bool,
}

impl Escalation {
    pub fn new(issue_type: IssueType, priority: Priority, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            issue_type,
            priority,
            description: description.into(),
            status: EscalationStatus::Open,
            site_id: None,
            load_id: None,
            agent_id: None,
            created_at: Utc::now(),
            resolved_at: None,
            resolution_notes: None,
            false_alarm: false,
        }
    }

    pub fn with_site(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = Some(site_id.into());
        self
    }

    pub fn with_load(mut self, load_id: Option<String>) -> Self {
        self.load_id = load_id;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn is_open(&self) -> bool {
        self.status == EscalationStatus::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parse_is_case_insensitive() {
        assert_eq!("CRITICAL".parse::<Priority>().unwrap(), Priority::Critical);
        assert_eq!(" high ".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn priority_orders_by_urgency() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Critical.weight() > Priority::Low.weight());
    }

    #[test]
    fn issue_type_roundtrip() {
        for issue in [
            IssueType::InventoryRisk,
            IssueType::DelayedLoad,
            IssueType::StaleEta,
            IssueType::CarrierUnreliability,
            IssueType::Other,
        ] {
            assert_eq!(issue.as_str().parse::<IssueType>().unwrap(), issue);
        }
    }

    #[test]
    fn serde_uses_wire_casing() {
        let esc = Escalation::new(IssueType::StaleEta, Priority::Medium, "no reply")
            .with_site("s1");
        let json = serde_json::to_value(&esc).unwrap();
        assert_eq!(json["priority"], "MEDIUM");
        assert_eq!(json["issue_type"], "stale_eta");
        assert_eq!(json["status"], "OPEN");
        assert!(esc.is_open());
    }
}
