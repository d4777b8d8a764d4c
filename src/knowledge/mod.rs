//! Knowledge graph: per-carrier reliability and per-site risk.
//!
//! Records are written with compare-and-swap on a version column, so the
//! scheduler, poller, and API can all record outcomes without shared locks.
//!
//! Live updates fold one event into the stored record. An event no newer
//! than the record's last applied event would fold out of order, so that key
//! is recomputed from the source tables instead. Every caller persists the
//! source row before recording, which keeps both paths equal to `replay`.

pub mod model;
pub mod update;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use model::{CarrierReliability, KnowledgeEvent, SiteRisk};
pub use update::{ScoringParams, replay};

use crate::error::DatabaseError;
use crate::store::Database;

/// Attempts before a contended write gives up.
const MAX_CAS_ATTEMPTS: u32 = 8;

/// Outcome of a full rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct RebuildSummary {
    pub events: usize,
    pub carriers: usize,
    pub sites: usize,
}

/// Live knowledge graph backed by the store.
#[derive(Clone)]
pub struct KnowledgeGraph {
    store: Arc<dyn Database>,
    params: ScoringParams,
}

impl KnowledgeGraph {
    pub fn new(store: Arc<dyn Database>, params: ScoringParams) -> Self {
        Self { store, params }
    }

    /// Apply one event to every record it touches.
    pub async fn record(&self, event: &KnowledgeEvent) -> Result<(), DatabaseError> {
        if let Some(carrier_id) = event.carrier_id() {
            self.update_carrier(carrier_id, event).await?;
        }
        if let Some(site_id) = event.site_id() {
            self.update_site(site_id, event).await?;
        }
        Ok(())
    }

    async fn update_carrier(
        &self,
        carrier_id: &str,
        event: &KnowledgeEvent,
    ) -> Result<(), DatabaseError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.store.get_carrier_reliability(carrier_id).await?;
            let expected = current.as_ref().map(|r| r.version);
            let record = match current {
                Some(r) if !is_newer(event, r.updated_at) => {
                    debug!(carrier = carrier_id, "Out-of-order event, replaying carrier");
                    self.replay_carrier(carrier_id).await?
                }
                current => {
                    let mut record = current.unwrap_or_else(|| CarrierReliability::new(carrier_id));
                    update::apply_carrier(&mut record, event, &self.params);
                    record
                }
            };

            if self.store.save_carrier_reliability(&record, expected).await? {
                debug!(
                    carrier = carrier_id,
                    score = record.reliability_score,
                    flagged = record.flagged_unreliable,
                    "Carrier reliability updated"
                );
                return Ok(());
            }
            debug!(carrier = carrier_id, attempt, "Carrier reliability write conflict, retrying");
        }
        warn!(carrier = carrier_id, "Carrier reliability update abandoned");
        Err(DatabaseError::Contention {
            entity: "carrier_reliability".to_string(),
            id: carrier_id.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    async fn update_site(&self, site_id: &str, event: &KnowledgeEvent) -> Result<(), DatabaseError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.store.get_site_risk(site_id).await?;
            let expected = current.as_ref().map(|r| r.version);
            let record = match current {
                Some(r) if !is_newer(event, r.updated_at) => {
                    debug!(site = site_id, "Out-of-order event, replaying site");
                    self.replay_site(site_id).await?
                }
                current => {
                    let mut record = current.unwrap_or_else(|| SiteRisk::new(site_id));
                    update::apply_site(&mut record, event);
                    record
                }
            };

            if self.store.save_site_risk(&record, expected).await? {
                debug!(site = site_id, risk = record.risk_score, "Site risk updated");
                return Ok(());
            }
            debug!(site = site_id, attempt, "Site risk write conflict, retrying");
        }
        warn!(site = site_id, "Site risk update abandoned");
        Err(DatabaseError::Contention {
            entity: "site_risk".to_string(),
            id: site_id.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    async fn replay_carrier(&self, carrier_id: &str) -> Result<CarrierReliability, DatabaseError> {
        let events = self
            .source_events()
            .await?
            .into_iter()
            .filter(|e| e.carrier_id() == Some(carrier_id))
            .collect();
        Ok(replay(events, &self.params)
            .carriers
            .remove(carrier_id)
            .unwrap_or_else(|| CarrierReliability::new(carrier_id)))
    }

    async fn replay_site(&self, site_id: &str) -> Result<SiteRisk, DatabaseError> {
        let events = self
            .source_events()
            .await?
            .into_iter()
            .filter(|e| e.site_id() == Some(site_id))
            .collect();
        Ok(replay(events, &self.params)
            .sites
            .remove(site_id)
            .unwrap_or_else(|| SiteRisk::new(site_id)))
    }

    pub async fn carrier(&self, carrier_id: &str) -> Result<Option<CarrierReliability>, DatabaseError> {
        self.store.get_carrier_reliability(carrier_id).await
    }

    pub async fn site(&self, site_id: &str) -> Result<Option<SiteRisk>, DatabaseError> {
        self.store.get_site_risk(site_id).await
    }

    pub async fn carriers(&self) -> Result<Vec<CarrierReliability>, DatabaseError> {
        self.store.list_carrier_reliability().await
    }

    pub async fn sites(&self) -> Result<Vec<SiteRisk>, DatabaseError> {
        self.store.list_site_risk().await
    }

    /// Every knowledge event derivable from the source tables.
    pub async fn source_events(&self) -> Result<Vec<KnowledgeEvent>, DatabaseError> {
        let mut events = Vec::new();
        events.extend(
            self.store
                .list_delivered_loads()
                .await?
                .iter()
                .filter_map(KnowledgeEvent::from_delivered_load),
        );
        events.extend(
            self.store
                .list_resolved_escalations()
                .await?
                .iter()
                .filter_map(KnowledgeEvent::from_resolved_escalation),
        );
        events.extend(
            self.store
                .list_eta_requests()
                .await?
                .iter()
                .map(KnowledgeEvent::from_eta_request),
        );
        events.extend(
            self.store
                .list_answered_inbound()
                .await?
                .iter()
                .filter_map(KnowledgeEvent::from_inbound),
        );
        Ok(events)
    }

    /// Recompute every record from source events and overwrite the tables.
    ///
    /// Writes are checked against the versions read before the source scan,
    /// so a live update that lands mid-rebuild forces another pass instead of
    /// being overwritten.
    pub async fn rebuild(&self) -> Result<RebuildSummary, DatabaseError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let carriers_before = self.store.list_carrier_reliability().await?;
            let sites_before = self.store.list_site_risk().await?;

            let events = self.source_events().await?;
            let event_count = events.len();
            let state = replay(events, &self.params);

            let mut carriers: Vec<CarrierReliability> = state.carriers.into_values().collect();
            carriers.sort_by(|a, b| a.carrier_id.cmp(&b.carrier_id));
            let mut sites: Vec<SiteRisk> = state.sites.into_values().collect();
            sites.sort_by(|a, b| a.site_id.cmp(&b.site_id));

            if self
                .write_rebuilt(&carriers_before, &sites_before, &carriers, &sites)
                .await?
            {
                info!(
                    events = event_count,
                    carriers = carriers.len(),
                    sites = sites.len(),
                    "Knowledge graph rebuilt"
                );
                return Ok(RebuildSummary {
                    events: event_count,
                    carriers: carriers.len(),
                    sites: sites.len(),
                });
            }
            debug!(attempt, "Knowledge graph changed during rebuild, retrying");
        }
        warn!("Knowledge graph rebuild abandoned");
        Err(DatabaseError::Contention {
            entity: "knowledge_graph".to_string(),
            id: "rebuild".to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Write rebuilt records and prune keys with no source events. `false` as
    /// soon as any record moved past its `*_before` version.
    async fn write_rebuilt(
        &self,
        carriers_before: &[CarrierReliability],
        sites_before: &[SiteRisk],
        carriers: &[CarrierReliability],
        sites: &[SiteRisk],
    ) -> Result<bool, DatabaseError> {
        let versions: HashMap<&str, i64> = carriers_before
            .iter()
            .map(|c| (c.carrier_id.as_str(), c.version))
            .collect();
        for record in carriers {
            let expected = versions.get(record.carrier_id.as_str()).copied();
            if !self.store.save_carrier_reliability(record, expected).await? {
                return Ok(false);
            }
        }
        for stale in carriers_before
            .iter()
            .filter(|old| !carriers.iter().any(|c| c.carrier_id == old.carrier_id))
        {
            if !self
                .store
                .delete_carrier_reliability(&stale.carrier_id, stale.version)
                .await?
            {
                return Ok(false);
            }
        }

        let versions: HashMap<&str, i64> = sites_before
            .iter()
            .map(|s| (s.site_id.as_str(), s.version))
            .collect();
        for record in sites {
            let expected = versions.get(record.site_id.as_str()).copied();
            if !self.store.save_site_risk(record, expected).await? {
                return Ok(false);
            }
        }
        for stale in sites_before
            .iter()
            .filter(|old| !sites.iter().any(|s| s.site_id == old.site_id))
        {
            if !self.store.delete_site_risk(&stale.site_id, stale.version).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Whether `event` lies strictly after the record's last applied event.
/// Stored timestamps keep microseconds, so the event is compared at that
/// precision.
fn is_newer(event: &KnowledgeEvent, updated_at: Option<DateTime<Utc>>) -> bool {
    updated_at.is_none_or(|last| event.occurred_at().trunc_subsecs(6) > last)
}
