//! Configuration types.
//!
//! Every section has a `Default` and a `from_env()` that falls back to the
//! default for any variable that is missing or fails to parse.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::llm::LlmConfig;
use crate::mail::MailConfig;

/// Read and parse an environment variable, falling back to `default`.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparseable config value");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

/// Full coordinator configuration.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub rules: RuleConfig,
    pub knowledge: KnowledgeConfig,
    pub api: ApiConfig,
    /// `None` when no model API key is configured (deterministic tiers only).
    pub llm: Option<LlmConfig>,
    /// `None` when `EMAIL_IMAP_HOST` is unset (mailbox polling disabled).
    pub mail: Option<MailConfig>,
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        Self {
            database: DatabaseConfig::from_env(),
            logging: LoggingConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            rules: RuleConfig::from_env(),
            knowledge: KnowledgeConfig::from_env(),
            api: ApiConfig::from_env(),
            llm: LlmConfig::from_env(),
            mail: MailConfig::from_env(),
        }
    }
}

/// Database location.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/fuel-coordinator.db"),
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let path = std::env::var("COORDINATOR_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default().path);
        Self { path }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// When set, logs are also written to a daily rolling file here.
    pub dir: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self {
            dir: std::env::var("COORDINATOR_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}

/// Run scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval used for agents that do not set their own.
    pub default_check_interval: Duration,
    /// Runs older than this are finalized as TIMEOUT by the watchdog.
    pub max_run_duration: Duration,
    /// How often the watchdog sweeps for overdue runs.
    pub watchdog_interval: Duration,
    /// Maximum number of sites evaluated concurrently within one run.
    pub site_concurrency: usize,
    /// Escalations for the same site/load/issue are not re-created within this window.
    pub escalation_cooldown: Duration,
    /// Upper bound on the random delay before an agent's first scheduled tick.
    pub startup_jitter: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_check_interval: Duration::from_secs(15 * 60),
            max_run_duration: Duration::from_secs(10 * 60),
            watchdog_interval: Duration::from_secs(60),
            site_concurrency: 4,
            escalation_cooldown: Duration::from_secs(6 * 3600),
            startup_jitter: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            default_check_interval: Duration::from_secs(
                env_or("AGENT_CHECK_INTERVAL_MINUTES", 15u64) * 60,
            ),
            max_run_duration: env_secs("AGENT_MAX_RUN_SECS", d.max_run_duration),
            watchdog_interval: env_secs("AGENT_WATCHDOG_SECS", d.watchdog_interval),
            site_concurrency: env_or("AGENT_SITE_CONCURRENCY", d.site_concurrency).max(1),
            escalation_cooldown: env_secs("ESCALATION_COOLDOWN_SECS", d.escalation_cooldown),
            startup_jitter: env_secs("AGENT_STARTUP_JITTER_SECS", d.startup_jitter),
        }
    }
}

/// Thresholds for the deterministic rule tier.
#[derive(Debug, Clone)]
pub struct RuleConfig {
    /// Below this many hours to runout with nothing in transit: CRITICAL.
    pub critical_runout_hours: f64,
    /// Below this many hours with no active load: HIGH.
    pub high_runout_hours: f64,
    /// An ETA older than this is stale.
    pub staleness_window: Duration,
    /// Unanswered ETA requests older than this many windows raise a stale-ETA escalation.
    pub follow_up_windows: u32,
    /// Other late loads a flagged carrier must have before it is escalated.
    pub carrier_cluster_size: usize,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            critical_runout_hours: 12.0,
            high_runout_hours: 24.0,
            staleness_window: Duration::from_secs(4 * 3600),
            follow_up_windows: 2,
            carrier_cluster_size: 2,
        }
    }
}

impl RuleConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            critical_runout_hours: env_or("RULE_CRITICAL_RUNOUT_HOURS", d.critical_runout_hours),
            high_runout_hours: env_or("RULE_HIGH_RUNOUT_HOURS", d.high_runout_hours),
            staleness_window: Duration::from_secs(
                env_or("RULE_STALENESS_HOURS", 4u64) * 3600,
            ),
            follow_up_windows: env_or("RULE_FOLLOW_UP_WINDOWS", d.follow_up_windows).max(1),
            carrier_cluster_size: env_or("RULE_CARRIER_CLUSTER_SIZE", d.carrier_cluster_size),
        }
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.staleness_window)
            .unwrap_or_else(|_| chrono::Duration::hours(4))
    }
}

/// Knowledge graph scoring parameters.
#[derive(Debug, Clone)]
pub struct KnowledgeConfig {
    /// Number of most recent deliveries that receive `recent_weight`.
    pub recent_window: usize,
    /// Weight applied to each delivery inside the recent window.
    pub recent_weight: f64,
    /// Carriers scoring below this are flagged unreliable.
    pub unreliable_below: f64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            recent_window: 10,
            recent_weight: 2.0,
            unreliable_below: 0.4,
        }
    }
}

impl KnowledgeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            recent_window: env_or("KG_RECENT_WINDOW", d.recent_window),
            recent_weight: env_or("KG_RECENT_WEIGHT", d.recent_weight).max(1.0),
            unreliable_below: d.unreliable_below,
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("COORDINATOR_API_ADDR")
                .unwrap_or_else(|_| Self::default().bind_addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let rules = RuleConfig::default();
        assert_eq!(rules.critical_runout_hours, 12.0);
        assert_eq!(rules.high_runout_hours, 24.0);
        assert_eq!(rules.staleness(), chrono::Duration::hours(4));

        let kg = KnowledgeConfig::default();
        assert_eq!(kg.recent_window, 10);
        assert_eq!(kg.recent_weight, 2.0);

        let sched = SchedulerConfig::default();
        assert_eq!(sched.default_check_interval, Duration::from_secs(900));
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        // Variable name is unique to this test.
        unsafe { std::env::set_var("FUEL_COORD_TEST_GARBAGE", "not-a-number") };
        assert_eq!(env_or("FUEL_COORD_TEST_GARBAGE", 7u32), 7);
        unsafe { std::env::set_var("FUEL_COORD_TEST_GARBAGE", " 42 ") };
        assert_eq!(env_or("FUEL_COORD_TEST_GARBAGE", 7u32), 42);
        unsafe { std::env::remove_var("FUEL_COORD_TEST_GARBAGE") };
    }
}
