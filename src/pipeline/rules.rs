//! Deterministic rule tier.
//!
//! Pure evaluation of one site against its loads and the network context.
//! Three categories fire independently:
//! - inventory risk (hours to runout vs. what is on the way)
//! - load staleness (ETA requests and follow-up escalations)
//! - carrier trust (flagged carriers with a cluster of late loads)
//!
//! Within a category the first applicable rule wins.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::RuleConfig;
use crate::knowledge::model::{CarrierReliability, SiteRisk};
use crate::logistics::{IssueType, Load, LoadStatus, Priority, Site};
use crate::pipeline::types::{ActionKind, Confidence, ProposedAction};

/// Rule identifiers carried on every proposal.
pub mod codes {
    pub const INVENTORY_CRITICAL: &str = "inventory_critical";
    pub const INVENTORY_HIGH: &str = "inventory_high";
    pub const INVENTORY_WATCH: &str = "inventory_watch";
    pub const ETA_STALE: &str = "eta_stale";
    pub const ETA_FOLLOW_UP: &str = "eta_follow_up";
    pub const CARRIER_CLUSTER: &str = "carrier_cluster";
    pub const CARRIER_FLAGGED_ISOLATED: &str = "carrier_flagged_isolated";
}

/// Network-wide lookups shared by every site in a run.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    pub carriers: HashMap<String, CarrierReliability>,
    pub site_risks: HashMap<String, SiteRisk>,
    /// Late load ids per carrier across all sites.
    pub late_loads_by_carrier: HashMap<String, Vec<String>>,
    /// Most recent ETA request per load id.
    pub last_eta_requests: HashMap<String, DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl RuleContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            ..Default::default()
        }
    }

    /// Group the late loads in `loads` by carrier.
    pub fn index_late_loads(loads: &[Load], now: DateTime<Utc>) -> HashMap<String, Vec<String>> {
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        for load in loads.iter().filter(|l| l.is_late(now)) {
            index
                .entry(load.carrier_id.clone())
                .or_default()
                .push(load.id.clone());
        }
        index
    }
}

pub struct RuleEngine {
    config: RuleConfig,
}

impl RuleEngine {
    pub fn new(config: RuleConfig) -> Self {
        Self { config }
    }

    /// Evaluate one site. `loads` are the site's non-terminal loads.
    pub fn evaluate(&self, site: &Site, loads: &[Load], ctx: &RuleContext) -> Vec<ProposedAction> {
        let mut actions = Vec::new();
        if let Some(action) = self.inventory_risk(site, loads) {
            actions.push(action);
        }
        actions.extend(self.load_staleness(site, loads, ctx));
        actions.extend(self.carrier_trust(site, loads, ctx));

        debug!(
            site = %site.id,
            loads = loads.len(),
            proposals = actions.len(),
            "Site evaluated"
        );
        actions
    }

    fn inventory_risk(&self, site: &Site, loads: &[Load]) -> Option<ProposedAction> {
        let hours = site.hours_to_runout()?;
        let in_transit = loads.iter().any(|l| l.status == LoadStatus::InTransit);
        let covered = loads.iter().any(|l| l.status.is_active());
        let critical = self.config.critical_runout_hours;
        let high = self.config.high_runout_hours;

        let (priority, confidence, rule, detail) = if hours < critical && !in_transit {
            (
                Priority::Critical,
                Confidence::Definite,
                codes::INVENTORY_CRITICAL,
                "nothing in transit",
            )
        } else if (critical..high).contains(&hours) && !covered {
            (
                Priority::High,
                Confidence::Definite,
                codes::INVENTORY_HIGH,
                "no load scheduled",
            )
        } else if (high..site.runout_threshold_hours).contains(&hours) && !covered {
            (
                Priority::Medium,
                Confidence::Ambiguous,
                codes::INVENTORY_WATCH,
                "no load scheduled",
            )
        } else {
            return None;
        };

        Some(ProposedAction {
            kind: ActionKind::Escalate {
                issue_type: IssueType::InventoryRisk,
                priority,
                description: format!(
                    "{} runs out in {hours:.1}h ({:.0} gal at {:.1} gal/h), {detail}",
                    site.name, site.current_inventory, site.consumption_rate
                ),
            },
            confidence,
            site_id: site.id.clone(),
            load_id: None,
            carrier_id: None,
            rule,
        })
    }

    fn load_staleness(&self, site: &Site, loads: &[Load], ctx: &RuleContext) -> Vec<ProposedAction> {
        let window = self.config.staleness();
        let follow_up_after = window * self.config.follow_up_windows as i32;
        let site_urgent = site
            .hours_to_runout()
            .is_some_and(|h| h < self.config.high_runout_hours);

        let mut actions = Vec::new();
        for load in loads
            .iter()
            .filter(|l| !l.status.is_terminal() && l.is_stale(ctx.now, window))
        {
            let last_request = ctx.last_eta_requests.get(&load.id).copied();

            let unanswered = last_request.filter(|sent| {
                ctx.now - *sent > follow_up_after
                    && load.last_eta_update.is_none_or(|updated| updated < *sent)
            });
            if let Some(sent) = unanswered {
                let priority = if site_urgent {
                    Priority::High
                } else {
                    Priority::Medium
                };
                actions.push(ProposedAction {
                    kind: ActionKind::Escalate {
                        issue_type: IssueType::StaleEta,
                        priority,
                        description: format!(
                            "No ETA reply for {} since request at {}",
                            load.po_number,
                            sent.format("%Y-%m-%d %H:%M UTC")
                        ),
                    },
                    confidence: Confidence::Definite,
                    site_id: site.id.clone(),
                    load_id: Some(load.id.clone()),
                    carrier_id: Some(load.carrier_id.clone()),
                    rule: codes::ETA_FOLLOW_UP,
                });
                continue;
            }

            let recently_requested = last_request.is_some_and(|sent| ctx.now - sent < window);
            if recently_requested {
                continue;
            }
            actions.push(ProposedAction {
                kind: ActionKind::RequestEta {
                    po_number: load.po_number.clone(),
                },
                confidence: Confidence::Definite,
                site_id: site.id.clone(),
                load_id: Some(load.id.clone()),
                carrier_id: Some(load.carrier_id.clone()),
                rule: codes::ETA_STALE,
            });
        }
        actions
    }

    fn carrier_trust(&self, site: &Site, loads: &[Load], ctx: &RuleContext) -> Vec<ProposedAction> {
        let mut seen = HashSet::new();
        let mut actions = Vec::new();

        for load in loads {
            if !seen.insert(load.carrier_id.as_str()) {
                continue;
            }
            let Some(carrier) = ctx
                .carriers
                .get(&load.carrier_id)
                .filter(|c| c.flagged_unreliable)
            else {
                continue;
            };

            let other_late = ctx
                .late_loads_by_carrier
                .get(&load.carrier_id)
                .map(|ids| ids.iter().filter(|id| **id != load.id).count())
                .unwrap_or(0);

            let (kind, confidence, rule) = if other_late >= self.config.carrier_cluster_size {
                (
                    ActionKind::Escalate {
                        issue_type: IssueType::CarrierUnreliability,
                        priority: Priority::High,
                        description: format!(
                            "Carrier {} (score {:.2}) has {other_late} other late loads; {} at risk",
                            load.carrier_id, carrier.reliability_score, load.po_number
                        ),
                    },
                    Confidence::Ambiguous,
                    codes::CARRIER_CLUSTER,
                )
            } else {
                (
                    ActionKind::Observe {
                        note: format!(
                            "Carrier {} is flagged unreliable (score {:.2}) and carries {}",
                            load.carrier_id, carrier.reliability_score, load.po_number
                        ),
                    },
                    Confidence::Definite,
                    codes::CARRIER_FLAGGED_ISOLATED,
                )
            };

            actions.push(ProposedAction {
                kind,
                confidence,
                site_id: site.id.clone(),
                load_id: Some(load.id.clone()),
                carrier_id: Some(load.carrier_id.clone()),
                rule,
            });
        }
        actions
    }
}
