//! Agent run execution.
//!
//! A run snapshots the agent's sites, evaluates them concurrently (rules,
//! then the advisor for ambiguous proposals), and applies the settled plans
//! one site at a time. Before each site the persisted run record is checked
//! for a cancel request or a watchdog timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::eta::EtaMailer;
use crate::agent::gate::{Gate, gate};
use crate::agent::model::{
    Agent, AgentRun, DecisionSummary, Outcome, RunStatus, TriggerKind,
};
use crate::error::{DatabaseError, Error, RunError};
use crate::knowledge::KnowledgeGraph;
use crate::logistics::{Activity, ActivityType, Escalation, Load, Site};
use crate::pipeline::{
    Advisor, AdvisorContext, Confidence, Plan, PlannedAction, RuleContext, RuleEngine, settle,
};
use crate::store::Database;

/// Activity lines handed to the advisor.
const ADVISOR_ACTIVITY_LINES: i64 = 8;

/// Evaluation result for one site, produced concurrently.
struct SiteEvaluation {
    site: Site,
    loads: Vec<Load>,
    plans: Vec<Plan>,
    advisor_calls: u32,
    advisor_tokens: u64,
    advisor_cost: Decimal,
    advisor_failures: Vec<String>,
}

/// A spawned run.
pub struct RunHandle {
    pub id: Uuid,
    handle: JoinHandle<()>,
}

impl RunHandle {
    /// Wait for the run to be finalized.
    pub async fn wait(self) {
        if let Err(e) = self.handle.await {
            error!(run_id = %self.id, "Run supervisor failed: {e}");
        }
    }
}

/// Holds one slot of the in-flight count until the run's supervisor ends.
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn enter(count: &Arc<watch::Sender<usize>>) -> Self {
        count.send_modify(|n| *n += 1);
        Self(Arc::clone(count))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

pub struct AgentRunner {
    store: Arc<dyn Database>,
    knowledge: KnowledgeGraph,
    rules: RuleEngine,
    advisor: Arc<dyn Advisor>,
    mailer: EtaMailer,
    site_concurrency: usize,
    escalation_cooldown: chrono::Duration,
    in_flight: Arc<watch::Sender<usize>>,
}

impl AgentRunner {
    pub fn new(
        store: Arc<dyn Database>,
        knowledge: KnowledgeGraph,
        rules: RuleEngine,
        advisor: Arc<dyn Advisor>,
        mailer: EtaMailer,
        site_concurrency: usize,
        escalation_cooldown: Duration,
    ) -> Self {
        Self {
            store,
            knowledge,
            rules,
            advisor,
            mailer,
            site_concurrency: site_concurrency.max(1),
            escalation_cooldown: chrono::Duration::from_std(escalation_cooldown)
                .unwrap_or(chrono::Duration::hours(6)),
            in_flight: Arc::new(watch::Sender::new(0)),
        }
    }

    /// Runs spawned by this runner that have not been finalized yet.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait for in-flight runs to finish. Returns `false` if some were
    /// still running when `timeout` elapsed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut rx = self.in_flight.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        )
    }

    /// Open a run record and execute it in the background.
    ///
    /// The record is inserted before this returns, so a second trigger for
    /// the same agent fails with `AlreadyRunning` while this one is live.
    pub async fn trigger(
        self: &Arc<Self>,
        agent_id: &str,
        trigger: TriggerKind,
    ) -> Result<RunHandle, RunError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| RunError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;
        if !agent.enabled {
            return Err(RunError::AgentDisabled {
                agent_id: agent_id.to_string(),
            });
        }

        let run = AgentRun::start(&agent, trigger);
        if !self.store.begin_run(&run).await? {
            return Err(RunError::AlreadyRunning {
                agent_id: agent_id.to_string(),
            });
        }
        info!(run_id = %run.id, agent = %agent.id, %trigger, mode = %agent.execution_mode, "Run started");

        let id = run.id;
        let runner = Arc::clone(self);
        let slot = InFlight::enter(&self.in_flight);
        let handle = tokio::spawn(async move {
            runner.supervise(agent, run).await;
            drop(slot);
        });
        Ok(RunHandle { id, handle })
    }

    /// Execute in a child task so a panic still finalizes the record.
    async fn supervise(self: Arc<Self>, agent: Agent, run: AgentRun) {
        let id = run.id;
        let runner = Arc::clone(&self);
        let fallback = run.clone();
        let child = tokio::spawn(async move { runner.execute(agent, run).await });

        match child.await {
            Ok(()) => {}
            Err(e) => {
                let reason = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    e.to_string()
                };
                error!(run_id = %id, %reason, "Run panicked");
                let mut run = fallback;
                run.finish(
                    RunStatus::Failed,
                    Some(RunError::Panicked { id, reason }.to_string()),
                );
                self.finalize(&run).await;
            }
        }
    }

    async fn execute(&self, agent: Agent, mut run: AgentRun) {
        let outcome = self.run_checks(&agent, &mut run).await;
        match outcome {
            Ok(()) => run.finish(RunStatus::Completed, None),
            Err(RunError::Superseded { .. }) => {
                warn!(run_id = %run.id, "Run was finalized elsewhere, abandoning");
                return;
            }
            Err(RunError::Cancelled { reason, .. }) => {
                info!(run_id = %run.id, %reason, "Run cancelled");
                run.finish(RunStatus::Failed, Some(format!("cancelled: {reason}")));
            }
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Run failed");
                run.finish(RunStatus::Failed, Some(e.to_string()));
            }
        }

        if self.finalize(&run).await {
            self.log(
                Activity::new(
                    ActivityType::CheckCompleted,
                    json!({
                        "summary": format!(
                            "{} run {}: {} sites, {} escalations, {} emails, {} drafts",
                            run.trigger,
                            run.status,
                            run.counts.sites_checked,
                            run.counts.escalations_created,
                            run.counts.emails_sent,
                            run.counts.draft_actions
                        ),
                        "run_id": run.id,
                        "status": run.status,
                        "counts": run.counts,
                        "advisor_cost": run.advisor_cost,
                    }),
                )
                .by_agent(Some(agent.id.as_str())),
            )
            .await;
        }
    }

    async fn finalize(&self, run: &AgentRun) -> bool {
        match self.store.finalize_run(run).await {
            Ok(true) => {
                info!(
                    run_id = %run.id,
                    status = %run.status,
                    sites = run.counts.sites_checked,
                    decisions = run.decisions.len(),
                    duration_ms = run.duration_ms.unwrap_or_default(),
                    "Run finalized"
                );
                true
            }
            Ok(false) => {
                warn!(run_id = %run.id, "Run already finalized");
                false
            }
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Failed to finalize run");
                false
            }
        }
    }

    async fn run_checks(&self, agent: &Agent, run: &mut AgentRun) -> Result<(), RunError> {
        self.store
            .append_activity(
                &Activity::new(
                    ActivityType::CheckStarted,
                    json!({
                        "summary": format!("{} check started ({})", run.trigger, run.execution_mode),
                        "run_id": run.id,
                    }),
                )
                .by_agent(Some(agent.id.as_str())),
            )
            .await?;

        let now = Utc::now();
        let (sites, loads_by_site, ctx) = self.snapshot(&agent.id, now).await?;
        debug!(run_id = %run.id, sites = sites.len(), "Snapshot loaded");

        let pending = sites.into_iter().map(|site| {
            let loads = loads_by_site.get(&site.id).cloned().unwrap_or_default();
            self.evaluate_site(site, loads, &ctx)
        });
        let evaluations: Vec<SiteEvaluation> = futures::stream::iter(pending)
            .buffered(self.site_concurrency)
            .collect()
            .await;

        for evaluation in evaluations {
            self.checkpoint(run.id).await?;
            self.apply_site(agent, run, evaluation, now).await;
        }
        Ok(())
    }

    async fn snapshot(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Vec<Site>, HashMap<String, Vec<Load>>, RuleContext), DatabaseError> {
        let sites: Vec<Site> = self
            .store
            .list_sites_for_agent(agent_id)
            .await?
            .into_iter()
            .filter(|s| s.active)
            .collect();

        let open_loads = self.store.list_open_loads().await?;
        let mut ctx = RuleContext::new(now);
        ctx.late_loads_by_carrier = RuleContext::index_late_loads(&open_loads, now);
        ctx.last_eta_requests = self.store.latest_eta_requests().await?;
        ctx.carriers = self
            .knowledge
            .carriers()
            .await?
            .into_iter()
            .map(|c| (c.carrier_id.clone(), c))
            .collect();
        ctx.site_risks = self
            .knowledge
            .sites()
            .await?
            .into_iter()
            .map(|s| (s.site_id.clone(), s))
            .collect();

        let mut loads_by_site: HashMap<String, Vec<Load>> = HashMap::new();
        for load in open_loads {
            loads_by_site.entry(load.site_id.clone()).or_default().push(load);
        }
        Ok((sites, loads_by_site, ctx))
    }

    async fn evaluate_site(&self, site: Site, loads: Vec<Load>, ctx: &RuleContext) -> SiteEvaluation {
        let proposals = self.rules.evaluate(&site, &loads, ctx);
        let mut evaluation = SiteEvaluation {
            site,
            loads,
            plans: Vec::with_capacity(proposals.len()),
            advisor_calls: 0,
            advisor_tokens: 0,
            advisor_cost: Decimal::ZERO,
            advisor_failures: Vec::new(),
        };

        for proposal in proposals {
            if proposal.confidence == Confidence::Definite {
                evaluation.plans.push(Plan::from_rule(proposal));
                continue;
            }

            let recent_activity = match self
                .store
                .recent_activities_for_site(&evaluation.site.id, ADVISOR_ACTIVITY_LINES)
                .await
            {
                Ok(entries) => entries.iter().map(Activity::summary).collect(),
                Err(e) => {
                    warn!(site = %evaluation.site.id, error = %e, "No activity for advisor context");
                    Vec::new()
                }
            };
            let context = AdvisorContext {
                carrier: proposal
                    .carrier_id
                    .as_ref()
                    .and_then(|c| ctx.carriers.get(c))
                    .cloned(),
                site_risk: ctx.site_risks.get(&evaluation.site.id).cloned(),
                site: evaluation.site.clone(),
                loads: evaluation.loads.clone(),
                recent_activity,
                proposal,
            };

            let advice = self.advisor.propose(&context).await;
            evaluation.advisor_calls += 1;
            evaluation.advisor_tokens += u64::from(advice.usage.total());
            evaluation.advisor_cost += advice.cost;
            if let Some(failure) = &advice.failure {
                evaluation
                    .advisor_failures
                    .push(format!("{}: {failure}", context.proposal.rule));
            }
            evaluation.plans.push(settle(context.proposal, &advice.decision));
        }
        evaluation
    }

    /// Stop if the run was cancelled or finalized by the watchdog.
    async fn checkpoint(&self, run_id: Uuid) -> Result<(), RunError> {
        let checkpoint = self
            .store
            .run_checkpoint(run_id)
            .await?
            .ok_or(RunError::NotFound { id: run_id })?;
        if checkpoint.status.is_final() {
            return Err(RunError::Superseded { id: run_id });
        }
        if let Some(reason) = checkpoint.cancel_reason {
            return Err(RunError::Cancelled { id: run_id, reason });
        }
        Ok(())
    }

    async fn apply_site(
        &self,
        agent: &Agent,
        run: &mut AgentRun,
        evaluation: SiteEvaluation,
        now: DateTime<Utc>,
    ) {
        let SiteEvaluation {
            site,
            loads,
            plans,
            advisor_calls,
            advisor_tokens,
            advisor_cost,
            advisor_failures,
        } = evaluation;

        run.counts.sites_checked += 1;
        run.counts.loads_checked += loads.len() as u32;
        run.counts.advisor_calls += advisor_calls;
        run.counts.advisor_tokens += advisor_tokens;
        run.advisor_cost += advisor_cost;

        self.log(
            Activity::new(
                ActivityType::InventoryChecked,
                json!({
                    "summary": match site.hours_to_runout() {
                        Some(h) => format!("{}: {h:.1}h to runout, {} open loads", site.name, loads.len()),
                        None => format!("{}: no consumption, {} open loads", site.name, loads.len()),
                    },
                    "run_id": run.id,
                    "hours_to_runout": site.hours_to_runout(),
                    "current_inventory": site.current_inventory,
                }),
            )
            .by_agent(Some(agent.id.as_str()))
            .for_site(Some(site.id.as_str())),
        )
        .await;

        for failure in advisor_failures {
            self.observe(agent, &site.id, None, format!("Advisor failure, proposal dismissed ({failure})"))
                .await;
        }

        for plan in plans {
            let (outcome, detail) = self.apply_plan(agent, run, &plan, &loads, now).await;
            debug!(
                run_id = %run.id,
                site = %site.id,
                rule = plan.rule,
                outcome = outcome.as_str(),
                "Decision applied"
            );
            run.decisions.push(DecisionSummary {
                site_id: plan.site_id.clone(),
                load_id: plan.load_id.clone(),
                rule: plan.rule.to_string(),
                tier: plan.tier,
                outcome,
                summary: match detail {
                    Some(detail) => format!("{}; {detail}", plan.summary()),
                    None => plan.summary(),
                },
            });
        }
    }

    /// Apply one plan. Failures affect only this action.
    async fn apply_plan(
        &self,
        agent: &Agent,
        run: &mut AgentRun,
        plan: &Plan,
        loads: &[Load],
        now: DateTime<Utc>,
    ) -> (Outcome, Option<String>) {
        let load_id = plan.load_id.as_deref();

        match gate(run.execution_mode, plan) {
            Gate::Record => {
                self.observe(agent, &plan.site_id, load_id, plan.summary()).await;
                (Outcome::Recorded, None)
            }
            Gate::Draft => {
                run.counts.draft_actions += 1;
                self.log(
                    Activity::new(
                        ActivityType::Observation,
                        json!({
                            "summary": format!("Draft: {}", plan.summary()),
                            "draft": true,
                            "run_id": run.id,
                            "rule": plan.rule,
                            "tier": plan.tier,
                        }),
                    )
                    .by_agent(Some(agent.id.as_str()))
                    .for_site(Some(plan.site_id.as_str()))
                    .for_load(load_id),
                )
                .await;
                (Outcome::Drafted, None)
            }
            Gate::Apply => match &plan.action {
                PlannedAction::Escalate {
                    issue_type,
                    priority,
                    description,
                } => {
                    let escalation = Escalation::new(*issue_type, *priority, description.clone())
                        .with_site(plan.site_id.clone())
                        .with_load(plan.load_id.clone())
                        .with_agent(agent.id.clone());
                    match self
                        .store
                        .create_escalation_deduped(&escalation, now - self.escalation_cooldown)
                        .await
                    {
                        Ok(true) => {
                            run.counts.escalations_created += 1;
                            self.log(
                                Activity::new(
                                    ActivityType::EscalationCreated,
                                    json!({
                                        "summary": plan.summary(),
                                        "escalation_id": escalation.id,
                                        "issue_type": escalation.issue_type,
                                        "priority": escalation.priority,
                                        "run_id": run.id,
                                    }),
                                )
                                .by_agent(Some(agent.id.as_str()))
                                .for_site(Some(plan.site_id.as_str()))
                                .for_load(load_id),
                            )
                            .await;
                            info!(
                                site = %plan.site_id,
                                priority = %escalation.priority,
                                issue = escalation.issue_type.as_str(),
                                "Escalation created"
                            );
                            (Outcome::Applied, None)
                        }
                        Ok(false) => (
                            Outcome::Skipped,
                            Some("open or recent escalation exists".into()),
                        ),
                        Err(e) => {
                            error!(site = %plan.site_id, error = %e, "Escalation insert failed");
                            (Outcome::Failed, Some(e.to_string()))
                        }
                    }
                }
                PlannedAction::RequestEta { po_number } => {
                    let Some(load) = loads.iter().find(|l| Some(l.id.as_str()) == load_id) else {
                        let note = format!("load for {po_number} missing from snapshot");
                        self.observe(agent, &plan.site_id, load_id, note.clone()).await;
                        return (Outcome::Skipped, Some(note));
                    };
                    match self.mailer.send(load, Some(agent.id.as_str())).await {
                        Ok(_) => {
                            run.counts.emails_sent += 1;
                            (Outcome::Applied, None)
                        }
                        Err(e) => {
                            warn!(po = %po_number, error = %e, "ETA request failed");
                            let outcome = match e {
                                Error::Database(DatabaseError::NotFound { .. }) => Outcome::Skipped,
                                _ => Outcome::Failed,
                            };
                            self.observe(
                                agent,
                                &plan.site_id,
                                load_id,
                                format!("ETA request for {po_number} failed: {e}"),
                            )
                            .await;
                            (outcome, Some(e.to_string()))
                        }
                    }
                }
                PlannedAction::Observe { .. } | PlannedAction::Dismiss { .. } => {
                    (Outcome::Recorded, None)
                }
            },
        }
    }

    async fn observe(&self, agent: &Agent, site_id: &str, load_id: Option<&str>, note: String) {
        self.log(
            Activity::new(ActivityType::Observation, json!({ "summary": note }))
                .by_agent(Some(agent.id.as_str()))
                .for_site(Some(site_id))
                .for_load(load_id),
        )
        .await;
    }

    /// Append an activity. A failed audit write never fails the action.
    async fn log(&self, activity: Activity) {
        if let Err(e) = self.store.append_activity(&activity).await {
            warn!(kind = %activity.activity_type, error = %e, "Failed to append activity");
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::model::ExecutionMode;
    use crate::config::RuleConfig;
    use crate::error::MailError;
    use crate::knowledge::ScoringParams;
    use crate::llm::TokenUsage;
    use crate::logistics::{Carrier, LoadStatus};
    use crate::mail::{EmailSender, OutgoingMail};
    use crate::pipeline::{Advice, Decision, HeuristicAdvisor};
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<OutgoingMail>>,
    }

    #[async_trait]
    impl EmailSender for RecordingSender {
        async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
            self.sent.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }

    struct FailingAdvisor;

    #[async_trait]
    impl Advisor for FailingAdvisor {
        fn name(&self) -> &str {
            "failing"
        }

        async fn propose(&self, _context: &AdvisorContext) -> Advice {
            Advice {
                decision: Decision::Dismiss {
                    reason: "advisor unavailable".into(),
                },
                usage: TokenUsage {
                    input_tokens: 120,
                    output_tokens: 0,
                },
                cost: Decimal::new(3, 4),
                failure: Some("timed out".into()),
            }
        }
    }

    /// Blocks in `propose` until released, so a test can act mid-run.
    #[derive(Default)]
    struct GatedAdvisor {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Advisor for GatedAdvisor {
        fn name(&self) -> &str {
            "gated"
        }

        async fn propose(&self, context: &AdvisorContext) -> Advice {
            self.entered.notify_one();
            self.release.notified().await;
            HeuristicAdvisor.propose(context).await
        }
    }

    struct PanickingAdvisor;

    #[async_trait]
    impl Advisor for PanickingAdvisor {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn propose(&self, _context: &AdvisorContext) -> Advice {
            panic!("advisor exploded");
        }
    }

    struct Harness {
        backend: Arc<LibSqlBackend>,
        store: Arc<dyn Database>,
        sender: Arc<RecordingSender>,
        runner: Arc<AgentRunner>,
    }

    async fn harness(mode: ExecutionMode, advisor: Arc<dyn Advisor>) -> Harness {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let store: Arc<dyn Database> = Arc::clone(&backend) as Arc<dyn Database>;
        let knowledge = KnowledgeGraph::new(Arc::clone(&store), ScoringParams::default());
        let sender = Arc::new(RecordingSender::default());
        let mailer = EtaMailer::new(
            Arc::clone(&store),
            knowledge.clone(),
            Arc::clone(&sender) as Arc<dyn EmailSender>,
        );
        let runner = Arc::new(AgentRunner::new(
            Arc::clone(&store),
            knowledge,
            RuleEngine::new(RuleConfig::default()),
            advisor,
            mailer,
            3,
            Duration::from_secs(6 * 3600),
        ));

        store
            .upsert_agent(&Agent::new("north", "North Region").with_mode(mode))
            .await
            .unwrap();
        store
            .upsert_carrier(&Carrier {
                id: "c1".into(),
                name: "Rapid Fuel".into(),
                dispatcher_email: "dispatch@rapid.test".into(),
            })
            .await
            .unwrap();
        Harness {
            backend,
            store,
            sender,
            runner,
        }
    }

    /// Site with `hours` of fuel left at 100 gal/h.
    async fn add_site(store: &Arc<dyn Database>, id: &str, hours: f64) {
        store
            .upsert_site(
                &Site::new(id, format!("Site {id}"))
                    .with_inventory(hours * 100.0, 10_000.0, 100.0)
                    .with_agent("north"),
            )
            .await
            .unwrap();
    }

    async fn run_once(h: &Harness) -> AgentRun {
        let handle = h.runner.trigger("north", TriggerKind::Manual).await.unwrap();
        let id = handle.id;
        handle.wait().await;
        h.store.get_run(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn critical_site_escalated_once_across_runs() {
        let h = harness(ExecutionMode::FullAuto, Arc::new(HeuristicAdvisor)).await;
        add_site(&h.store, "s1", 6.0).await;

        let first = run_once(&h).await;
        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(first.counts.escalations_created, 1);
        assert_eq!(first.decisions[0].outcome, Outcome::Applied);

        let second = run_once(&h).await;
        assert_eq!(second.counts.escalations_created, 0);
        assert_eq!(second.decisions[0].outcome, Outcome::Skipped);

        let open = h.store.list_escalations(true, 10).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].agent_id.as_deref(), Some("north"));
    }

    #[tokio::test]
    async fn draft_only_records_every_site_and_applies_nothing() {
        let h = harness(ExecutionMode::DraftOnly, Arc::new(HeuristicAdvisor)).await;
        for i in 1..=5 {
            add_site(&h.store, &format!("s{i}"), 6.0).await;
        }

        let run = run_once(&h).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.counts.sites_checked, 5);
        assert_eq!(run.decisions.len(), 5);
        assert!(run.decisions.iter().all(|d| d.outcome == Outcome::Drafted));
        assert_eq!(run.counts.draft_actions, 5);
        assert!(h.store.list_escalations(false, 10).await.unwrap().is_empty());
        assert!(h.sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_load_gets_one_request_per_window() {
        let h = harness(ExecutionMode::AutoEmail, Arc::new(HeuristicAdvisor)).await;
        add_site(&h.store, "s1", 100.0).await;
        h.store
            .upsert_load(&Load::new("l1", "PO-2026-001", "s1", "c1", LoadStatus::Scheduled))
            .await
            .unwrap();

        let first = run_once(&h).await;
        assert_eq!(first.counts.emails_sent, 1);
        assert_eq!(first.counts.loads_checked, 1);

        let second = run_once(&h).await;
        assert_eq!(second.counts.emails_sent, 0);

        let sent = h.sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "dispatch@rapid.test");
        assert!(sent[0].subject.contains("PO-2026-001"));
        assert_eq!(h.store.list_eta_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn advisor_failure_becomes_dismissal_and_observation() {
        let h = harness(ExecutionMode::FullAuto, Arc::new(FailingAdvisor)).await;
        // Inside the 48h watch band with nothing scheduled: ambiguous.
        add_site(&h.store, "s1", 30.0).await;

        let run = run_once(&h).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.counts.advisor_calls, 1);
        assert_eq!(run.counts.advisor_tokens, 120);
        assert_eq!(run.advisor_cost, Decimal::new(3, 4));
        assert_eq!(run.decisions.len(), 1);
        assert_eq!(run.decisions[0].tier, crate::pipeline::Tier::Advisor);
        assert_eq!(run.decisions[0].outcome, Outcome::Recorded);
        assert!(h.store.list_escalations(false, 10).await.unwrap().is_empty());

        let feed = h.store.list_activities(50, Some("north")).await.unwrap();
        assert!(feed.iter().any(|a| {
            a.activity_type == ActivityType::Observation && a.summary().contains("Advisor failure")
        }));
    }

    #[tokio::test]
    async fn concurrent_trigger_rejected() {
        let h = harness(ExecutionMode::DraftOnly, Arc::new(HeuristicAdvisor)).await;
        let agent = h.store.get_agent("north").await.unwrap().unwrap();
        let live = AgentRun::start(&agent, TriggerKind::Scheduled);
        assert!(h.store.begin_run(&live).await.unwrap());

        let err = h
            .runner
            .trigger("north", TriggerKind::Manual)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RunError::AlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn unknown_and_disabled_agents_rejected() {
        let h = harness(ExecutionMode::DraftOnly, Arc::new(HeuristicAdvisor)).await;
        let err = h.runner.trigger("nobody", TriggerKind::Manual).await.err().unwrap();
        assert!(matches!(err, RunError::AgentNotFound { .. }));

        let mut agent = h.store.get_agent("north").await.unwrap().unwrap();
        agent.enabled = false;
        h.store.upsert_agent(&agent).await.unwrap();
        let err = h.runner.trigger("north", TriggerKind::Manual).await.err().unwrap();
        assert!(matches!(err, RunError::AgentDisabled { .. }));
    }

    #[tokio::test]
    async fn checkpoint_observes_cancel_and_timeout() {
        let h = harness(ExecutionMode::DraftOnly, Arc::new(HeuristicAdvisor)).await;
        let agent = h.store.get_agent("north").await.unwrap().unwrap();
        let run = AgentRun::start(&agent, TriggerKind::Manual);
        h.store.begin_run(&run).await.unwrap();

        assert!(h.runner.checkpoint(run.id).await.is_ok());

        h.store.request_run_cancel(run.id, "operator stop").await.unwrap();
        let err = h.runner.checkpoint(run.id).await.unwrap_err();
        assert!(matches!(err, RunError::Cancelled { ref reason, .. } if reason == "operator stop"));

        let now = Utc::now();
        h.store
            .timeout_stale_runs(now + chrono::Duration::seconds(1), now)
            .await
            .unwrap();
        let err = h.runner.checkpoint(run.id).await.unwrap_err();
        assert!(matches!(err, RunError::Superseded { .. }));
    }

    #[tokio::test]
    async fn cancelled_run_is_finalized_failed() {
        let advisor = Arc::new(GatedAdvisor::default());
        let h = harness(ExecutionMode::FullAuto, Arc::clone(&advisor) as Arc<dyn Advisor>).await;
        // Watch band with nothing scheduled goes to the advisor.
        add_site(&h.store, "s1", 30.0).await;

        let handle = h.runner.trigger("north", TriggerKind::Manual).await.unwrap();
        let id = handle.id;
        advisor.entered.notified().await;
        assert!(h.store.request_run_cancel(id, "operator stop").await.unwrap());
        advisor.release.notify_one();
        handle.wait().await;

        let run = h.store.get_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("cancelled: operator stop"));
        assert_eq!(run.counts.sites_checked, 0);
        assert!(run.ended_at.is_some());
        assert!(h.store.list_escalations(false, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn panicking_run_is_finalized_failed() {
        let h = harness(ExecutionMode::FullAuto, Arc::new(PanickingAdvisor)).await;
        add_site(&h.store, "s1", 30.0).await;

        let run = run_once(&h).await;
        assert_eq!(run.status, RunStatus::Failed);
        let error = run.error.unwrap_or_default();
        assert!(error.contains("panicked"), "{error}");
        assert!(error.contains("advisor exploded"), "{error}");
        assert_eq!(h.runner.in_flight(), 0);

        // The agent is free to run again.
        assert!(h.runner.trigger("north", TriggerKind::Manual).await.is_ok());
    }

    #[tokio::test]
    async fn store_error_mid_run_is_finalized_failed() {
        let h = harness(ExecutionMode::FullAuto, Arc::new(HeuristicAdvisor)).await;
        add_site(&h.store, "s1", 6.0).await;
        h.backend
            .execute_raw("ALTER TABLE loads RENAME TO loads_offline")
            .await
            .unwrap();

        let run = run_once(&h).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap_or_default().contains("list_open_loads"));
        assert!(run.ended_at.is_some());
        assert!(h.store.list_escalations(false, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_runs() {
        let advisor = Arc::new(GatedAdvisor::default());
        let h = harness(ExecutionMode::DraftOnly, Arc::clone(&advisor) as Arc<dyn Advisor>).await;
        add_site(&h.store, "s1", 30.0).await;

        let handle = h.runner.trigger("north", TriggerKind::Manual).await.unwrap();
        let id = handle.id;
        advisor.entered.notified().await;
        assert_eq!(h.runner.in_flight(), 1);
        assert!(!h.runner.drain(Duration::from_millis(50)).await);

        advisor.release.notify_one();
        assert!(h.runner.drain(Duration::from_secs(5)).await);
        assert_eq!(h.runner.in_flight(), 0);
        let run = h.store.get_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn inactive_sites_are_not_checked() {
        let h = harness(ExecutionMode::FullAuto, Arc::new(HeuristicAdvisor)).await;
        add_site(&h.store, "s1", 6.0).await;
        let mut idle = Site::new("s2", "Closed Depot")
            .with_inventory(100.0, 10_000.0, 100.0)
            .with_agent("north");
        idle.active = false;
        h.store.upsert_site(&idle).await.unwrap();

        let run = run_once(&h).await;
        assert_eq!(run.counts.sites_checked, 1);
        assert!(run.decisions.iter().all(|d| d.site_id == "s1"));
    }

    #[test]
    fn panic_payloads_render() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(42_u8)), "unknown panic");
    }
}
