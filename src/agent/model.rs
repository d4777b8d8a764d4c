//! Agents and their run records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::Tier;

/// How much an agent is allowed to do on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Every action becomes a draft. Nothing is applied.
    DraftOnly,
    /// ETA requests are sent and definite escalations created; advisor-confirmed ones are drafted.
    AutoEmail,
    FullAuto,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::DraftOnly => "draft_only",
            ExecutionMode::AutoEmail => "auto_email",
            ExecutionMode::FullAuto => "full_auto",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "draft_only" => Ok(ExecutionMode::DraftOnly),
            "auto_email" => Ok(ExecutionMode::AutoEmail),
            "full_auto" => Ok(ExecutionMode::FullAuto),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// A coordination agent responsible for a set of sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub execution_mode: ExecutionMode,
    pub check_interval_minutes: u32,
    /// Overrides the interval when set.
    pub cron_schedule: Option<String>,
    pub enabled: bool,
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            execution_mode: ExecutionMode::DraftOnly,
            check_interval_minutes: 15,
            cron_schedule: None,
            enabled: true,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// When the next scheduled run should start, strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
        if let Some(expr) = self.cron_schedule.as_deref() {
            return next_cron_fire(expr, after)?
                .ok_or_else(|| format!("cron schedule '{expr}' has no upcoming fire time"));
        }
        let minutes = i64::from(self.check_interval_minutes.max(1));
        Ok(after + chrono::Duration::minutes(minutes))
    }
}

/// Parse a cron expression and compute the next fire time after `after`.
pub fn next_cron_fire(
    schedule: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, String> {
    let cron_schedule =
        cron::Schedule::from_str(schedule).map_err(|e| format!("invalid cron: {e}"))?;
    Ok(cron_schedule.after(&after).next())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Scheduled => write!(f, "scheduled"),
            TriggerKind::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for TriggerKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TriggerKind::Scheduled),
            "manual" => Ok(TriggerKind::Manual),
            other => Err(format!("unknown trigger kind: {other}")),
        }
    }
}

/// Status of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl RunStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Timeout => write!(f, "timeout"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "timeout" => Ok(RunStatus::Timeout),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Per-run counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub sites_checked: u32,
    pub loads_checked: u32,
    pub emails_sent: u32,
    pub escalations_created: u32,
    pub draft_actions: u32,
    pub advisor_calls: u32,
    pub advisor_tokens: u64,
}

/// What happened to one proposed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Drafted,
    /// Dismissals and observations: logged, never applied.
    Recorded,
    /// Deduplicated or no longer applicable.
    Skipped,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::Drafted => "drafted",
            Outcome::Recorded => "recorded",
            Outcome::Skipped => "skipped",
            Outcome::Failed => "failed",
        }
    }
}

/// One entry in a run's ordered decision list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSummary {
    pub site_id: String,
    pub load_id: Option<String>,
    /// Identifier of the rule that produced the proposal.
    pub rule: String,
    pub tier: Tier,
    pub outcome: Outcome,
    pub summary: String,
}

/// One execution of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: Uuid,
    pub agent_id: String,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: RunStatus,
    /// Mode in effect when the run started.
    pub execution_mode: ExecutionMode,
    pub counts: RunCounts,
    /// Estimated advisor spend in USD.
    pub advisor_cost: Decimal,
    pub decisions: Vec<DecisionSummary>,
    pub error: Option<String>,
    pub cancel_requested: bool,
}

impl AgentRun {
    pub fn start(agent: &Agent, trigger: TriggerKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent.id.clone(),
            trigger,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            status: RunStatus::Running,
            execution_mode: agent.execution_mode,
            counts: RunCounts::default(),
            advisor_cost: Decimal::ZERO,
            decisions: Vec::new(),
            error: None,
            cancel_requested: false,
        }
    }

    /// Set the final status and timing fields.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.error = error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_status_roundtrip() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Timeout,
        ] {
            let parsed: RunStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!(!RunStatus::Running.is_final());
        assert!(RunStatus::Timeout.is_final());
    }

    #[test]
    fn execution_mode_parse() {
        assert_eq!(
            "FULL_AUTO".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::FullAuto
        );
        assert!("yolo".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn interval_schedule() {
        let mut agent = Agent::new("a1", "North");
        agent.check_interval_minutes = 30;
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(
            agent.next_fire_after(t).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap()
        );
    }

    #[test]
    fn cron_overrides_interval() {
        let mut agent = Agent::new("a1", "North");
        // sec min hour dom mon dow
        agent.cron_schedule = Some("0 0 9 * * *".to_string());
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(
            agent.next_fire_after(t).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
        );

        agent.cron_schedule = Some("not a cron".to_string());
        assert!(agent.next_fire_after(t).is_err());
    }

    #[test]
    fn finish_sets_duration() {
        let agent = Agent::new("a1", "North");
        let mut run = AgentRun::start(&agent, TriggerKind::Manual);
        run.finish(RunStatus::Completed, None);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.ended_at.is_some());
        assert!(run.duration_ms.unwrap() >= 0);
    }
}
