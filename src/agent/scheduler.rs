//! Periodic run scheduling and the stale-run watchdog.
//!
//! Each enabled agent gets its own ticker task. The ticker re-reads the agent
//! before every wait, so schedule, mode, and enablement changes take effect
//! without a restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::model::{Agent, TriggerKind};
use crate::agent::runner::AgentRunner;
use crate::config::SchedulerConfig;
use crate::error::{DatabaseError, RunError};
use crate::store::Database;

/// Longest single sleep; bounds how long a config change goes unnoticed.
const MAX_NAP: Duration = Duration::from_secs(60);

/// Running scheduler tasks.
pub struct SchedulerHandle {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl SchedulerHandle {
    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop every ticker and the watchdog. Runs already in flight keep going;
    /// wait for them with `AgentRunner::drain`.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles {
            handle.abort();
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn Database>,
    runner: Arc<AgentRunner>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Database>, runner: Arc<AgentRunner>, config: SchedulerConfig) -> Self {
        Self {
            store,
            runner,
            config,
        }
    }

    /// Spawn a ticker for every known agent plus the watchdog.
    ///
    /// Disabled agents get a ticker too; it idles until they are enabled.
    pub async fn start(self: &Arc<Self>) -> Result<SchedulerHandle, DatabaseError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let agents = self.store.list_agents().await?;

        let mut handles = Vec::with_capacity(agents.len() + 1);
        for agent in agents {
            handles.push(self.spawn_ticker(agent.id, Arc::clone(&shutdown)));
        }
        handles.push(self.spawn_watchdog(Arc::clone(&shutdown)));

        info!(
            tickers = handles.len() - 1,
            watchdog_secs = self.config.watchdog_interval.as_secs(),
            "Scheduler started"
        );
        Ok(SchedulerHandle { handles, shutdown })
    }

    fn spawn_ticker(self: &Arc<Self>, agent_id: String, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let jitter = startup_jitter(scheduler.config.startup_jitter);
            debug!(agent = %agent_id, jitter_ms = jitter.as_millis() as u64, "Ticker starting");
            tokio::time::sleep(jitter).await;

            let mut last_started: Option<DateTime<Utc>> = None;
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    info!(agent = %agent_id, "Ticker shutting down");
                    return;
                }

                let agent = match scheduler.store.get_agent(&agent_id).await {
                    Ok(Some(agent)) => agent,
                    Ok(None) => {
                        info!(agent = %agent_id, "Agent removed, ticker exiting");
                        return;
                    }
                    Err(e) => {
                        error!(agent = %agent_id, error = %e, "Failed to load agent");
                        tokio::time::sleep(MAX_NAP).await;
                        continue;
                    }
                };
                if !agent.enabled {
                    tokio::time::sleep(MAX_NAP).await;
                    continue;
                }

                let now = Utc::now();
                let due = scheduler.due_at(&agent, last_started, now);
                if due > now {
                    let wait = (due - now).to_std().unwrap_or_default().min(MAX_NAP);
                    tokio::time::sleep(wait).await;
                    continue;
                }

                last_started = Some(now);
                scheduler.fire(&agent_id).await;
            }
        })
    }

    /// When the next scheduled run for `agent` is due.
    ///
    /// Interval agents fire immediately on startup; cron agents wait for
    /// their first slot. An unparseable cron falls back to the default interval.
    fn due_at(
        &self,
        agent: &Agent,
        last_started: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let anchor = match (last_started, agent.cron_schedule.is_some()) {
            (Some(started), _) => started,
            (None, true) => now,
            (None, false) => return now,
        };
        match agent.next_fire_after(anchor) {
            Ok(at) => at,
            Err(e) => {
                warn!(agent = %agent.id, error = %e, "Bad schedule, using default interval");
                anchor
                    + chrono::Duration::from_std(self.config.default_check_interval)
                        .unwrap_or(chrono::Duration::minutes(15))
            }
        }
    }

    /// Trigger a scheduled run and wait for it, so runs never overlap on one ticker.
    async fn fire(&self, agent_id: &str) {
        match self.runner.trigger(agent_id, TriggerKind::Scheduled).await {
            Ok(handle) => handle.wait().await,
            Err(RunError::AlreadyRunning { .. }) => {
                debug!(agent = %agent_id, "Skipping tick, run already in progress");
            }
            Err(RunError::AgentDisabled { .. }) => {
                debug!(agent = %agent_id, "Skipping tick, agent disabled");
            }
            Err(e) => warn!(agent = %agent_id, error = %e, "Scheduled run not started"),
        }
    }

    fn spawn_watchdog(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(scheduler.config.watchdog_interval);
            loop {
                tick.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                if let Err(e) = scheduler.sweep(Utc::now()).await {
                    error!("Watchdog sweep failed: {e}");
                }
            }
        })
    }

    /// Finalize as TIMEOUT every run that has been RUNNING longer than the limit.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, DatabaseError> {
        let limit = chrono::Duration::from_std(self.config.max_run_duration)
            .unwrap_or(chrono::Duration::minutes(10));
        let timed_out = self.store.timeout_stale_runs(now - limit, now).await?;
        for id in &timed_out {
            warn!(run_id = %id, limit_secs = limit.num_seconds(), "Run timed out");
        }
        Ok(timed_out)
    }
}

fn startup_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::eta::EtaMailer;
    use crate::agent::model::{AgentRun, RunStatus};
    use crate::config::RuleConfig;
    use crate::knowledge::{KnowledgeGraph, ScoringParams};
    use crate::mail::LogOnlySender;
    use crate::pipeline::{HeuristicAdvisor, RuleEngine};
    use crate::store::LibSqlBackend;
    use chrono::TimeZone;

    async fn scheduler(config: SchedulerConfig) -> (Arc<Scheduler>, Arc<dyn Database>) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let knowledge = KnowledgeGraph::new(Arc::clone(&store), ScoringParams::default());
        let mailer = EtaMailer::new(
            Arc::clone(&store),
            knowledge.clone(),
            Arc::new(LogOnlySender),
        );
        let runner = Arc::new(AgentRunner::new(
            Arc::clone(&store),
            knowledge,
            RuleEngine::new(RuleConfig::default()),
            Arc::new(HeuristicAdvisor),
            mailer,
            2,
            Duration::from_secs(3600),
        ));
        (
            Arc::new(Scheduler::new(Arc::clone(&store), runner, config)),
            store,
        )
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn interval_agents_fire_immediately_then_on_interval() {
        let (s, _) = scheduler(SchedulerConfig::default()).await;
        let mut agent = Agent::new("a1", "North");
        agent.check_interval_minutes = 20;

        assert_eq!(s.due_at(&agent, None, at(8, 0)), at(8, 0));
        assert_eq!(s.due_at(&agent, Some(at(8, 0)), at(8, 5)), at(8, 20));
    }

    #[tokio::test]
    async fn cron_agents_wait_for_their_slot() {
        let (s, _) = scheduler(SchedulerConfig::default()).await;
        let mut agent = Agent::new("a1", "North");
        agent.cron_schedule = Some("0 30 * * * *".into());
        assert_eq!(s.due_at(&agent, None, at(8, 0)), at(8, 30));

        agent.cron_schedule = Some("garbage".into());
        assert_eq!(s.due_at(&agent, Some(at(8, 0)), at(8, 1)), at(8, 15));
    }

    #[tokio::test]
    async fn sweep_times_out_overdue_runs() {
        let (s, store) = scheduler(SchedulerConfig {
            max_run_duration: Duration::from_secs(60),
            ..SchedulerConfig::default()
        })
        .await;
        let agent = Agent::new("a1", "North");
        store.upsert_agent(&agent).await.unwrap();
        let mut run = AgentRun::start(&agent, TriggerKind::Scheduled);
        run.started_at = Utc::now() - chrono::Duration::minutes(5);
        store.begin_run(&run).await.unwrap();

        let swept = s.sweep(Utc::now()).await.unwrap();
        assert_eq!(swept, vec![run.id]);
        let stored = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Timeout);

        assert!(s.sweep(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ticker_runs_agent_and_stops_on_shutdown() {
        let (s, store) = scheduler(SchedulerConfig {
            startup_jitter: Duration::ZERO,
            ..SchedulerConfig::default()
        })
        .await;
        store.upsert_agent(&Agent::new("a1", "North")).await.unwrap();

        let handle = s.start().await.unwrap();
        assert_eq!(handle.task_count(), 2);

        let mut runs = Vec::new();
        for _ in 0..50 {
            runs = store.list_runs(Some("a1"), 10).await.unwrap();
            if runs.iter().any(|r| r.status.is_final()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.shutdown();

        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger, TriggerKind::Scheduled);
        assert_eq!(runs[0].status, RunStatus::Completed);
    }

    #[test]
    fn zero_jitter_is_zero() {
        assert_eq!(startup_jitter(Duration::ZERO), Duration::ZERO);
        assert!(startup_jitter(Duration::from_millis(5)) <= Duration::from_millis(5));
    }
}
