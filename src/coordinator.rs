//! The coordinator facade: every operator-facing operation in one place.
//!
//! The HTTP API and `main` talk only to this type. Background tasks
//! (scheduler, watchdog, poller) share its store and knowledge graph.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{
    Agent, AgentRun, AgentRunner, EtaMailer, ExecutionMode, RunHandle, TriggerKind,
};
use crate::config::CoordinatorConfig;
use crate::error::{DatabaseError, Error, RunError};
use crate::knowledge::{
    CarrierReliability, KnowledgeEvent, KnowledgeGraph, RebuildSummary, ScoringParams, SiteRisk,
};
use crate::logistics::{Activity, ActivityType, Escalation, EtaRequest, IssueType, Load, Priority};
use crate::mail::EmailSender;
use crate::pipeline::{Advisor, RuleEngine};
use crate::store::Database;

/// Operator-created escalation.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEscalation {
    pub issue_type: IssueType,
    pub priority: Priority,
    pub description: String,
    pub site_id: Option<String>,
    pub load_id: Option<String>,
}

/// Result of requesting ETAs for all of an agent's stale loads.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EtaSweep {
    /// PO numbers a request was sent for.
    pub sent: Vec<String>,
    /// Stale loads already asked within the staleness window.
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Coordinator {
    store: Arc<dyn Database>,
    knowledge: KnowledgeGraph,
    runner: Arc<AgentRunner>,
    mailer: EtaMailer,
    staleness: chrono::Duration,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Database>,
        config: &CoordinatorConfig,
        advisor: Arc<dyn Advisor>,
        sender: Arc<dyn EmailSender>,
    ) -> Self {
        let knowledge = KnowledgeGraph::new(Arc::clone(&store), ScoringParams::from(&config.knowledge));
        let mailer = EtaMailer::new(Arc::clone(&store), knowledge.clone(), sender);
        let runner = Arc::new(AgentRunner::new(
            Arc::clone(&store),
            knowledge.clone(),
            RuleEngine::new(config.rules.clone()),
            advisor,
            mailer.clone(),
            config.scheduler.site_concurrency,
            config.scheduler.escalation_cooldown,
        ));
        info!(model_tiers = config.llm.is_some(), "Coordinator ready");

        Self {
            store,
            knowledge,
            runner,
            mailer,
            staleness: config.rules.staleness(),
        }
    }

    pub fn store(&self) -> Arc<dyn Database> {
        Arc::clone(&self.store)
    }

    pub fn knowledge(&self) -> &KnowledgeGraph {
        &self.knowledge
    }

    pub fn runner(&self) -> Arc<AgentRunner> {
        Arc::clone(&self.runner)
    }

    // ── Agents & runs ───────────────────────────────────────────────

    pub async fn list_agents(&self) -> Result<Vec<Agent>, DatabaseError> {
        self.store.list_agents().await
    }

    pub async fn set_execution_mode(&self, agent_id: &str, mode: ExecutionMode) -> Result<(), RunError> {
        if !self.store.set_execution_mode(agent_id, mode).await? {
            return Err(RunError::AgentNotFound {
                agent_id: agent_id.to_string(),
            });
        }
        info!(agent = %agent_id, %mode, "Execution mode changed");
        Ok(())
    }

    /// Start a manual run. It executes in the background.
    pub async fn trigger_run(&self, agent_id: &str) -> Result<RunHandle, RunError> {
        self.runner.trigger(agent_id, TriggerKind::Manual).await
    }

    /// Ask a running run to stop before its next site.
    ///
    /// Returns `false` when the run has already finished.
    pub async fn cancel_run(&self, id: Uuid, reason: &str) -> Result<bool, RunError> {
        if self.store.request_run_cancel(id, reason).await? {
            info!(run_id = %id, %reason, "Run cancellation requested");
            return Ok(true);
        }
        match self.store.get_run(id).await? {
            Some(_) => Ok(false),
            None => Err(RunError::NotFound { id }),
        }
    }

    pub async fn get_run(&self, id: Uuid) -> Result<AgentRun, RunError> {
        self.store.get_run(id).await?.ok_or(RunError::NotFound { id })
    }

    pub async fn list_runs(&self, agent_id: Option<&str>, limit: i64) -> Result<Vec<AgentRun>, DatabaseError> {
        self.store.list_runs(agent_id, limit).await
    }

    /// Newest first.
    pub async fn activity_feed(&self, limit: i64, agent_id: Option<&str>) -> Result<Vec<Activity>, DatabaseError> {
        self.store.list_activities(limit, agent_id).await
    }

    // ── ETA requests ────────────────────────────────────────────────

    /// Send an ETA request for one load now, regardless of when it was last asked.
    pub async fn request_eta(&self, load_id: &str) -> Result<EtaRequest, Error> {
        let load = self.open_load(load_id).await?;
        self.mailer.send(&load, None).await
    }

    /// Request ETAs for every stale load at the agent's active sites.
    ///
    /// Loads asked within the staleness window are skipped.
    pub async fn request_eta_all(&self, agent_id: &str) -> Result<EtaSweep, Error> {
        if self.store.get_agent(agent_id).await?.is_none() {
            return Err(RunError::AgentNotFound {
                agent_id: agent_id.to_string(),
            }
            .into());
        }

        let sites: HashSet<String> = self
            .store
            .list_sites_for_agent(agent_id)
            .await?
            .into_iter()
            .filter(|s| s.active)
            .map(|s| s.id)
            .collect();
        let last_requests = self.store.latest_eta_requests().await?;
        let now = Utc::now();

        let mut sweep = EtaSweep::default();
        for load in self.store.list_open_loads().await? {
            if !sites.contains(&load.site_id) || !load.is_stale(now, self.staleness) {
                continue;
            }
            let recently_asked = last_requests
                .get(&load.id)
                .is_some_and(|sent| now - *sent < self.staleness);
            if recently_asked {
                sweep.skipped.push(load.po_number);
                continue;
            }
            match self.mailer.send(&load, Some(agent_id)).await {
                Ok(_) => sweep.sent.push(load.po_number),
                Err(e) => {
                    warn!(po = %load.po_number, error = %e, "ETA request failed");
                    sweep.failed.push(load.po_number);
                }
            }
        }
        info!(
            agent = %agent_id,
            sent = sweep.sent.len(),
            skipped = sweep.skipped.len(),
            failed = sweep.failed.len(),
            "ETA sweep complete"
        );
        Ok(sweep)
    }

    // ── Escalations & deliveries ────────────────────────────────────

    pub async fn list_escalations(&self, open_only: bool, limit: i64) -> Result<Vec<Escalation>, DatabaseError> {
        self.store.list_escalations(open_only, limit).await
    }

    pub async fn create_escalation(&self, new: NewEscalation) -> Result<Escalation, Error> {
        if let Some(site_id) = &new.site_id
            && self.store.get_site(site_id).await?.is_none()
        {
            return Err(not_found("site", site_id));
        }
        if let Some(load_id) = &new.load_id
            && self.store.get_load(load_id).await?.is_none()
        {
            return Err(not_found("load", load_id));
        }

        let mut escalation = Escalation::new(new.issue_type, new.priority, new.description)
            .with_load(new.load_id);
        escalation.site_id = new.site_id;
        self.store.insert_escalation(&escalation).await?;

        self.log(
            Activity::new(
                ActivityType::EscalationCreated,
                json!({
                    "summary": format!("{} escalation (manual): {}", escalation.priority, escalation.description),
                    "escalation_id": escalation.id,
                    "issue_type": escalation.issue_type,
                    "priority": escalation.priority,
                    "manual": true,
                }),
            )
            .for_site(escalation.site_id.as_deref())
            .for_load(escalation.load_id.as_deref()),
        )
        .await;
        info!(id = %escalation.id, priority = %escalation.priority, "Manual escalation created");
        Ok(escalation)
    }

    /// Resolve an OPEN escalation and feed the outcome to the knowledge graph.
    pub async fn resolve_escalation(
        &self,
        id: Uuid,
        notes: Option<&str>,
        false_alarm: bool,
    ) -> Result<Escalation, Error> {
        if !self.store.resolve_escalation(id, notes, false_alarm, Utc::now()).await? {
            return match self.store.get_escalation(id).await? {
                Some(_) => Err(DatabaseError::Constraint(format!("escalation {id} is already resolved")).into()),
                None => Err(not_found("escalation", &id.to_string())),
            };
        }
        let escalation = self
            .store
            .get_escalation(id)
            .await?
            .ok_or_else(|| not_found("escalation", &id.to_string()))?;

        if let Some(event) = KnowledgeEvent::from_resolved_escalation(&escalation)
            && let Err(e) = self.knowledge.record(&event).await
        {
            warn!(escalation = %id, error = %e, "Failed to record resolution");
        }
        self.log(
            Activity::new(
                ActivityType::EscalationResolved,
                json!({
                    "summary": format!(
                        "Resolved {} escalation{}",
                        escalation.priority,
                        if false_alarm { " (false alarm)" } else { "" }
                    ),
                    "escalation_id": id,
                    "false_alarm": false_alarm,
                    "notes": notes,
                }),
            )
            .by_agent(escalation.agent_id.as_deref())
            .for_site(escalation.site_id.as_deref())
            .for_load(escalation.load_id.as_deref()),
        )
        .await;
        Ok(escalation)
    }

    /// Mark a load DELIVERED and feed the delivery to the knowledge graph.
    pub async fn record_delivery(
        &self,
        load_id: &str,
        delivered_at: Option<DateTime<Utc>>,
    ) -> Result<Load, Error> {
        let load = self.open_load(load_id).await?;
        let delivered_at = delivered_at.unwrap_or_else(Utc::now);
        if !self.store.mark_load_delivered(load_id, delivered_at).await? {
            return Err(DatabaseError::Constraint(format!("load {load_id} is already closed")).into());
        }
        let load = self
            .store
            .get_load(load_id)
            .await?
            .ok_or_else(|| not_found("load", load_id))?;

        let late = load.current_eta.is_some_and(|eta| delivered_at > eta);
        if let Some(event) = KnowledgeEvent::from_delivered_load(&load)
            && let Err(e) = self.knowledge.record(&event).await
        {
            warn!(load = %load_id, error = %e, "Failed to record delivery");
        }
        self.log(
            Activity::new(
                ActivityType::DeliveryRecorded,
                json!({
                    "summary": format!("{} delivered{}", load.po_number, if late { " late" } else { "" }),
                    "po_number": load.po_number,
                    "delivered_at": delivered_at,
                    "eta": load.current_eta,
                }),
            )
            .for_site(Some(load.site_id.as_str()))
            .for_load(Some(load.id.as_str())),
        )
        .await;
        info!(po = %load.po_number, late, "Delivery recorded");
        Ok(load)
    }

    // ── Knowledge graph ─────────────────────────────────────────────

    pub async fn carrier_reliability(&self, carrier_id: &str) -> Result<Option<CarrierReliability>, DatabaseError> {
        self.knowledge.carrier(carrier_id).await
    }

    pub async fn carrier_reliabilities(&self) -> Result<Vec<CarrierReliability>, DatabaseError> {
        self.knowledge.carriers().await
    }

    pub async fn site_risk(&self, site_id: &str) -> Result<Option<SiteRisk>, DatabaseError> {
        self.knowledge.site(site_id).await
    }

    pub async fn site_risks(&self) -> Result<Vec<SiteRisk>, DatabaseError> {
        self.knowledge.sites().await
    }

    pub async fn rebuild_knowledge(&self) -> Result<RebuildSummary, DatabaseError> {
        self.knowledge.rebuild().await
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn open_load(&self, load_id: &str) -> Result<Load, Error> {
        let load = self
            .store
            .get_load(load_id)
            .await?
            .ok_or_else(|| not_found("load", load_id))?;
        if load.status.is_terminal() {
            return Err(DatabaseError::Constraint(format!("load {load_id} is {}", load.status.as_str())).into());
        }
        Ok(load)
    }

    async fn log(&self, activity: Activity) {
        if let Err(e) = self.store.append_activity(&activity).await {
            warn!(kind = %activity.activity_type, error = %e, "Failed to append activity");
        }
    }
}

fn not_found(entity: &str, id: &str) -> Error {
    DatabaseError::NotFound {
        entity: entity.to_string(),
        id: id.to_string(),
    }
    .into()
}
