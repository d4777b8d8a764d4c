//! Unified `Database` trait: the single async interface for all persistence.
//!
//! Every task (scheduler, watchdog, poller, API) shares one implementation.
//! Methods that guard an invariant return `bool` for "the guarded write
//! happened" so callers can tell a conflict from an error.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agent::model::{Agent, AgentRun, ExecutionMode, RunStatus};
use crate::error::DatabaseError;
use crate::knowledge::model::{CarrierReliability, SiteRisk};
use crate::logistics::{Activity, Carrier, Escalation, EtaRequest, InboundEmail, Load, Site};

/// Fields a running run checks before applying each site.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCheckpoint {
    pub status: RunStatus,
    /// Set when an operator asked for cancellation.
    pub cancel_reason: Option<String>,
}

#[async_trait]
pub trait Database: Send + Sync {
    // ── Agents ──────────────────────────────────────────────────────

    async fn upsert_agent(&self, agent: &Agent) -> Result<(), DatabaseError>;

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, DatabaseError>;

    async fn list_agents(&self) -> Result<Vec<Agent>, DatabaseError>;

    /// Returns `false` when the agent does not exist.
    async fn set_execution_mode(
        &self,
        agent_id: &str,
        mode: ExecutionMode,
    ) -> Result<bool, DatabaseError>;

    // ── Carriers, sites, loads ──────────────────────────────────────

    async fn upsert_carrier(&self, carrier: &Carrier) -> Result<(), DatabaseError>;

    async fn get_carrier(&self, id: &str) -> Result<Option<Carrier>, DatabaseError>;

    async fn list_carriers(&self) -> Result<Vec<Carrier>, DatabaseError>;

    async fn upsert_site(&self, site: &Site) -> Result<(), DatabaseError>;

    async fn get_site(&self, id: &str) -> Result<Option<Site>, DatabaseError>;

    /// All sites assigned to an agent, active or not, ordered by id.
    async fn list_sites_for_agent(&self, agent_id: &str) -> Result<Vec<Site>, DatabaseError>;

    async fn upsert_load(&self, load: &Load) -> Result<(), DatabaseError>;

    async fn get_load(&self, id: &str) -> Result<Option<Load>, DatabaseError>;

    async fn get_load_by_po(&self, po_number: &str) -> Result<Option<Load>, DatabaseError>;

    /// Every load not yet DELIVERED or CANCELLED, network-wide.
    async fn list_open_loads(&self) -> Result<Vec<Load>, DatabaseError>;

    /// Set the ETA on a non-terminal load. `false` if the load is missing or
    /// terminal, or already carries an update newer than `updated_at`.
    async fn update_load_eta(
        &self,
        load_id: &str,
        eta: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Move a non-terminal load to DELIVERED. `false` if it was already terminal.
    async fn mark_load_delivered(
        &self,
        load_id: &str,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn list_delivered_loads(&self) -> Result<Vec<Load>, DatabaseError>;

    // ── Escalations ─────────────────────────────────────────────────

    /// Insert unless an escalation with the same issue type, site, and load is
    /// OPEN or was created at or after `since`. Returns whether it was inserted.
    async fn create_escalation_deduped(
        &self,
        escalation: &Escalation,
        since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Unconditional insert, for operator-created escalations.
    async fn insert_escalation(&self, escalation: &Escalation) -> Result<(), DatabaseError>;

    async fn get_escalation(&self, id: Uuid) -> Result<Option<Escalation>, DatabaseError>;

    async fn list_escalations(
        &self,
        open_only: bool,
        limit: i64,
    ) -> Result<Vec<Escalation>, DatabaseError>;

    /// Resolve an OPEN escalation. `false` if it is missing or already resolved.
    async fn resolve_escalation(
        &self,
        id: Uuid,
        notes: Option<&str>,
        false_alarm: bool,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn list_resolved_escalations(&self) -> Result<Vec<Escalation>, DatabaseError>;

    // ── ETA requests ────────────────────────────────────────────────

    async fn insert_eta_request(&self, request: &EtaRequest) -> Result<(), DatabaseError>;

    /// Withdraw a request whose mail never went out.
    async fn delete_eta_request(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Most recent request time per load id.
    async fn latest_eta_requests(&self) -> Result<HashMap<String, DateTime<Utc>>, DatabaseError>;

    async fn last_eta_request_for_po(
        &self,
        po_number: &str,
    ) -> Result<Option<EtaRequest>, DatabaseError>;

    async fn list_eta_requests(&self) -> Result<Vec<EtaRequest>, DatabaseError>;

    // ── Inbound email ───────────────────────────────────────────────

    /// Returns `false` when a record with the same mailbox message id exists.
    async fn insert_inbound_email(&self, email: &InboundEmail) -> Result<bool, DatabaseError>;

    async fn list_inbound_emails(&self, limit: i64) -> Result<Vec<InboundEmail>, DatabaseError>;

    /// Successfully parsed replies that carry a response latency.
    async fn list_answered_inbound(&self) -> Result<Vec<InboundEmail>, DatabaseError>;

    // ── Activity log ────────────────────────────────────────────────

    async fn append_activity(&self, activity: &Activity) -> Result<(), DatabaseError>;

    /// Newest first.
    async fn list_activities(
        &self,
        limit: i64,
        agent_id: Option<&str>,
    ) -> Result<Vec<Activity>, DatabaseError>;

    async fn recent_activities_for_site(
        &self,
        site_id: &str,
        limit: i64,
    ) -> Result<Vec<Activity>, DatabaseError>;

    // ── Agent runs ──────────────────────────────────────────────────

    /// Insert a RUNNING record. `false` when the agent already has one.
    async fn begin_run(&self, run: &AgentRun) -> Result<bool, DatabaseError>;

    /// Write the final state, only if the run is still RUNNING.
    async fn finalize_run(&self, run: &AgentRun) -> Result<bool, DatabaseError>;

    /// `false` if the run is missing or already final.
    async fn request_run_cancel(&self, id: Uuid, reason: &str) -> Result<bool, DatabaseError>;

    async fn run_checkpoint(&self, id: Uuid) -> Result<Option<RunCheckpoint>, DatabaseError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<AgentRun>, DatabaseError>;

    /// Newest first.
    async fn list_runs(
        &self,
        agent_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AgentRun>, DatabaseError>;

    /// Finalize as TIMEOUT every RUNNING run started before `cutoff`.
    async fn timeout_stale_runs(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError>;

    // ── Knowledge graph ─────────────────────────────────────────────

    async fn get_carrier_reliability(
        &self,
        carrier_id: &str,
    ) -> Result<Option<CarrierReliability>, DatabaseError>;

    /// Compare-and-swap write. `expected_version = None` means "must not exist yet".
    /// Returns `false` on a version conflict.
    async fn save_carrier_reliability(
        &self,
        record: &CarrierReliability,
        expected_version: Option<i64>,
    ) -> Result<bool, DatabaseError>;

    async fn list_carrier_reliability(&self) -> Result<Vec<CarrierReliability>, DatabaseError>;

    async fn get_site_risk(&self, site_id: &str) -> Result<Option<SiteRisk>, DatabaseError>;

    async fn save_site_risk(
        &self,
        record: &SiteRisk,
        expected_version: Option<i64>,
    ) -> Result<bool, DatabaseError>;

    async fn list_site_risk(&self) -> Result<Vec<SiteRisk>, DatabaseError>;

    /// Delete a carrier record if its version still matches. `false` on conflict.
    async fn delete_carrier_reliability(
        &self,
        carrier_id: &str,
        expected_version: i64,
    ) -> Result<bool, DatabaseError>;

    /// Delete a site record if its version still matches. `false` on conflict.
    async fn delete_site_risk(&self, site_id: &str, expected_version: i64)
    -> Result<bool, DatabaseError>;
}
