//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 (microseconds, `Z` suffix) so that string comparison
//! in SQL matches chronological order.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::agent::model::{Agent, AgentRun, ExecutionMode, RunCounts, RunStatus};
use crate::error::DatabaseError;
use crate::knowledge::model::{CarrierReliability, SiteRisk};
use crate::logistics::{
    Activity, Carrier, Escalation, EscalationStatus, EtaRequest, InboundEmail, Load, Site,
};
use crate::store::migrations;
use crate::store::traits::{Database, RunCheckpoint};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::init_schema(self.conn()).await
    }

    /// Run arbitrary SQL against the connection. Used by tests to break tables.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("execute_raw: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn get_ts(row: &libsql::Row, idx: i32) -> DateTime<Utc> {
    parse_datetime(&row.get::<String>(idx).unwrap_or_default())
}

fn get_opt_ts(row: &libsql::Row, idx: i32) -> Option<DateTime<Utc>> {
    row.get::<String>(idx).ok().map(|s| parse_datetime(&s))
}

fn get_flag(row: &libsql::Row, idx: i32) -> bool {
    row.get::<i64>(idx).unwrap_or(0) != 0
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> Result<T, DatabaseError> {
    raw.parse().map_err(DatabaseError::Serialization)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned + Default>(raw: Option<String>) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// Read the first row, if any.
async fn first_row<T>(
    mut rows: libsql::Rows,
    map: impl Fn(&libsql::Row) -> Result<T, DatabaseError>,
    op: &str,
) -> Result<Option<T>, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => map(&row).map(Some),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
    }
}

/// Read all rows, skipping any that fail to map.
async fn all_rows<T>(
    mut rows: libsql::Rows,
    map: impl Fn(&libsql::Row) -> Result<T, DatabaseError>,
    op: &str,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => match map(&row) {
                Ok(v) => out.push(v),
                Err(e) => tracing::warn!(op, "Skipping row: {e}"),
            },
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
    Ok(out)
}

// ── Row mapping ─────────────────────────────────────────────────────

const AGENT_COLUMNS: &str =
    "id, name, execution_mode, check_interval_minutes, cron_schedule, enabled";

fn row_to_agent(row: &libsql::Row) -> Result<Agent, DatabaseError> {
    let mode: String = row.get(2).unwrap_or_else(|_| "draft_only".to_string());
    Ok(Agent {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        execution_mode: parse_enum(&mode)?,
        check_interval_minutes: row.get::<i64>(3).unwrap_or(15) as u32,
        cron_schedule: row.get::<String>(4).ok(),
        enabled: get_flag(row, 5),
    })
}

const CARRIER_COLUMNS: &str = "id, name, dispatcher_email";

fn row_to_carrier(row: &libsql::Row) -> Result<Carrier, DatabaseError> {
    Ok(Carrier {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        dispatcher_email: row.get(2).unwrap_or_default(),
    })
}

const SITE_COLUMNS: &str = "id, name, current_inventory, tank_capacity, consumption_rate, runout_threshold_hours, min_delivery_quantity, agent_id, active, notes, updated_at";

fn row_to_site(row: &libsql::Row) -> Result<Site, DatabaseError> {
    Ok(Site {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        current_inventory: row.get(2).unwrap_or(0.0),
        tank_capacity: row.get(3).unwrap_or(0.0),
        consumption_rate: row.get(4).unwrap_or(0.0),
        runout_threshold_hours: row.get(5).unwrap_or(48.0),
        min_delivery_quantity: row.get(6).unwrap_or(0.0),
        agent_id: row.get::<String>(7).ok(),
        active: get_flag(row, 8),
        notes: row.get::<String>(9).ok(),
        updated_at: get_ts(row, 10),
    })
}

const LOAD_COLUMNS: &str = "id, po_number, status, site_id, carrier_id, current_eta, last_eta_update, created_at, shipped_at, delivered_at";

fn row_to_load(row: &libsql::Row) -> Result<Load, DatabaseError> {
    let status: String = row.get(2).unwrap_or_default();
    Ok(Load {
        id: row.get(0).unwrap_or_default(),
        po_number: row.get(1).unwrap_or_default(),
        status: parse_enum(&status)?,
        site_id: row.get(3).unwrap_or_default(),
        carrier_id: row.get(4).unwrap_or_default(),
        current_eta: get_opt_ts(row, 5),
        last_eta_update: get_opt_ts(row, 6),
        created_at: get_ts(row, 7),
        shipped_at: get_opt_ts(row, 8),
        delivered_at: get_opt_ts(row, 9),
    })
}

const ESCALATION_COLUMNS: &str = "id, issue_type, priority, description, status, site_id, load_id, agent_id, created_at, resolved_at, resolution_notes, false_alarm";

fn row_to_escalation(row: &libsql::Row) -> Result<Escalation, DatabaseError> {
    let issue: String = row.get(1).unwrap_or_default();
    let priority: String = row.get(2).unwrap_or_default();
    let status: String = row.get(4).unwrap_or_else(|_| "open".to_string());
    Ok(Escalation {
        id: row
            .get::<String>(0)
            .unwrap_or_default()
            .parse()
            .unwrap_or_default(),
        issue_type: parse_enum(&issue)?,
        priority: parse_enum(&priority)?,
        description: row.get(3).unwrap_or_default(),
        status: parse_enum::<EscalationStatus>(&status)?,
        site_id: row.get::<String>(5).ok(),
        load_id: row.get::<String>(6).ok(),
        agent_id: row.get::<String>(7).ok(),
        created_at: get_ts(row, 8),
        resolved_at: get_opt_ts(row, 9),
        resolution_notes: row.get::<String>(10).ok(),
        false_alarm: get_flag(row, 11),
    })
}

const ACTIVITY_COLUMNS: &str = "id, agent_id, activity_type, site_id, load_id, details, created_at";

fn row_to_activity(row: &libsql::Row) -> Result<Activity, DatabaseError> {
    let activity_type: String = row.get(2).unwrap_or_default();
    let details: String = row.get(5).unwrap_or_else(|_| "{}".to_string());
    Ok(Activity {
        id: row
            .get::<String>(0)
            .unwrap_or_default()
            .parse()
            .unwrap_or_default(),
        agent_id: row.get::<String>(1).ok(),
        activity_type: parse_enum(&activity_type)?,
        site_id: row.get::<String>(3).ok(),
        load_id: row.get::<String>(4).ok(),
        details: serde_json::from_str(&details).unwrap_or(serde_json::json!({})),
        created_at: get_ts(row, 6),
    })
}

const INBOUND_COLUMNS: &str = "id, message_id, sender, subject, body, received_at, po_number, eta, load_id, carrier_id, parse_method, parse_success, parse_message, response_latency_hours, created_at";

fn row_to_inbound(row: &libsql::Row) -> Result<InboundEmail, DatabaseError> {
    let method: String = row.get(10).unwrap_or_else(|_| "pattern".to_string());
    Ok(InboundEmail {
        id: row
            .get::<String>(0)
            .unwrap_or_default()
            .parse()
            .unwrap_or_default(),
        message_id: row.get(1).unwrap_or_default(),
        sender: row.get(2).unwrap_or_default(),
        subject: row.get(3).unwrap_or_default(),
        body: row.get(4).unwrap_or_default(),
        received_at: get_ts(row, 5),
        po_number: row.get::<String>(6).ok(),
        eta: get_opt_ts(row, 7),
        load_id: row.get::<String>(8).ok(),
        carrier_id: row.get::<String>(9).ok(),
        parse_method: parse_enum(&method)?,
        parse_success: get_flag(row, 11),
        parse_message: row.get(12).unwrap_or_default(),
        response_latency_hours: row.get::<f64>(13).ok(),
        created_at: get_ts(row, 14),
    })
}

const ETA_REQUEST_COLUMNS: &str = "id, load_id, carrier_id, po_number, recipient, agent_id, sent_at";

fn row_to_eta_request(row: &libsql::Row) -> Result<EtaRequest, DatabaseError> {
    Ok(EtaRequest {
        id: row
            .get::<String>(0)
            .unwrap_or_default()
            .parse()
            .unwrap_or_default(),
        load_id: row.get(1).unwrap_or_default(),
        carrier_id: row.get(2).unwrap_or_default(),
        po_number: row.get(3).unwrap_or_default(),
        recipient: row.get(4).unwrap_or_default(),
        agent_id: row.get::<String>(5).ok(),
        sent_at: get_ts(row, 6),
    })
}

const RUN_COLUMNS: &str = "id, agent_id, trigger_kind, started_at, ended_at, duration_ms, status, execution_mode, sites_checked, loads_checked, emails_sent, escalations_created, draft_actions, advisor_calls, advisor_tokens, advisor_cost, decisions, error, cancel_requested";

fn row_to_run(row: &libsql::Row) -> Result<AgentRun, DatabaseError> {
    let trigger: String = row.get(2).unwrap_or_default();
    let status: String = row.get(6).unwrap_or_else(|_| "running".to_string());
    let mode: String = row.get(7).unwrap_or_default();
    let count = |idx: i32| row.get::<i64>(idx).unwrap_or(0) as u32;
    let cost: String = row.get(15).unwrap_or_else(|_| "0".to_string());

    Ok(AgentRun {
        id: row
            .get::<String>(0)
            .unwrap_or_default()
            .parse()
            .unwrap_or_default(),
        agent_id: row.get(1).unwrap_or_default(),
        trigger: parse_enum(&trigger)?,
        started_at: get_ts(row, 3),
        ended_at: get_opt_ts(row, 4),
        duration_ms: row.get::<i64>(5).ok(),
        status: parse_enum(&status)?,
        execution_mode: parse_enum(&mode)?,
        counts: RunCounts {
            sites_checked: count(8),
            loads_checked: count(9),
            emails_sent: count(10),
            escalations_created: count(11),
            draft_actions: count(12),
            advisor_calls: count(13),
            advisor_tokens: row.get::<i64>(14).unwrap_or(0) as u64,
        },
        advisor_cost: Decimal::from_str(&cost).unwrap_or(Decimal::ZERO),
        decisions: from_json(row.get::<String>(16).ok()),
        error: row.get::<String>(17).ok(),
        cancel_requested: get_flag(row, 18),
    })
}

const CARRIER_RELIABILITY_COLUMNS: &str = "carrier_id, total_deliveries, late_deliveries, avg_delay_hours, worst_delay_hours, recent_outcomes, reliability_score, flagged_unreliable, eta_requests_sent, responses_received, avg_response_hours, recent_events, updated_at, version";

fn row_to_carrier_reliability(row: &libsql::Row) -> Result<CarrierReliability, DatabaseError> {
    let count = |idx: i32| row.get::<i64>(idx).unwrap_or(0) as u32;
    Ok(CarrierReliability {
        carrier_id: row.get(0).unwrap_or_default(),
        total_deliveries: count(1),
        late_deliveries: count(2),
        avg_delay_hours: row.get(3).unwrap_or(0.0),
        worst_delay_hours: row.get(4).unwrap_or(0.0),
        recent_outcomes: from_json(row.get::<String>(5).ok()),
        reliability_score: row.get(6).unwrap_or(0.5),
        flagged_unreliable: get_flag(row, 7),
        eta_requests_sent: count(8),
        responses_received: count(9),
        avg_response_hours: row.get(10).unwrap_or(0.0),
        recent_events: from_json(row.get::<String>(11).ok()),
        updated_at: get_opt_ts(row, 12),
        version: row.get(13).unwrap_or(0),
    })
}

/// Values for columns 1..=13 of `CARRIER_RELIABILITY_COLUMNS`.
fn carrier_reliability_values(rec: &CarrierReliability) -> Result<Vec<libsql::Value>, DatabaseError> {
    Ok(vec![
        rec.carrier_id.clone().into(),
        i64::from(rec.total_deliveries).into(),
        i64::from(rec.late_deliveries).into(),
        rec.avg_delay_hours.into(),
        rec.worst_delay_hours.into(),
        to_json(&rec.recent_outcomes)?.into(),
        rec.reliability_score.into(),
        i64::from(rec.flagged_unreliable).into(),
        i64::from(rec.eta_requests_sent).into(),
        i64::from(rec.responses_received).into(),
        rec.avg_response_hours.into(),
        to_json(&rec.recent_events)?.into(),
        opt_ts(rec.updated_at),
    ])
}

const SITE_RISK_COLUMNS: &str = "site_id, total_escalations, weighted_escalations, false_alarms, delivery_count, false_alarm_rate, risk_score, recent_events, updated_at, version";

fn row_to_site_risk(row: &libsql::Row) -> Result<SiteRisk, DatabaseError> {
    let count = |idx: i32| row.get::<i64>(idx).unwrap_or(0) as u32;
    Ok(SiteRisk {
        site_id: row.get(0).unwrap_or_default(),
        total_escalations: count(1),
        weighted_escalations: row.get(2).unwrap_or(0.0),
        false_alarms: count(3),
        delivery_count: count(4),
        false_alarm_rate: row.get(5).unwrap_or(0.0),
        risk_score: row.get(6).unwrap_or(0.0),
        recent_events: from_json(row.get::<String>(7).ok()),
        updated_at: get_opt_ts(row, 8),
        version: row.get(9).unwrap_or(0),
    })
}

/// Values for columns 1..=9 of `SITE_RISK_COLUMNS`.
fn site_risk_values(rec: &SiteRisk) -> Result<Vec<libsql::Value>, DatabaseError> {
    Ok(vec![
        rec.site_id.clone().into(),
        i64::from(rec.total_escalations).into(),
        rec.weighted_escalations.into(),
        i64::from(rec.false_alarms).into(),
        i64::from(rec.delivery_count).into(),
        rec.false_alarm_rate.into(),
        rec.risk_score.into(),
        to_json(&rec.recent_events)?.into(),
        opt_ts(rec.updated_at),
    ])
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    // ── Agents ──────────────────────────────────────────────────────

    async fn upsert_agent(&self, agent: &Agent) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO agents (id, name, execution_mode, check_interval_minutes, cron_schedule, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, execution_mode = excluded.execution_mode,
                    check_interval_minutes = excluded.check_interval_minutes,
                    cron_schedule = excluded.cron_schedule, enabled = excluded.enabled",
                params![
                    agent.id.clone(),
                    agent.name.clone(),
                    agent.execution_mode.as_str(),
                    i64::from(agent.check_interval_minutes),
                    opt_text(agent.cron_schedule.as_deref()),
                    i64::from(agent.enabled),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_agent: {e}")))?;
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_agent: {e}")))?;
        first_row(rows, row_to_agent, "get_agent").await
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, DatabaseError> {
        let rows = self
            .conn()
            .query(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY id"), ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_agents: {e}")))?;
        all_rows(rows, row_to_agent, "list_agents").await
    }

    async fn set_execution_mode(
        &self,
        agent_id: &str,
        mode: ExecutionMode,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE agents SET execution_mode = ?2 WHERE id = ?1",
                params![agent_id, mode.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_execution_mode: {e}")))?;
        Ok(count > 0)
    }

    // ── Carriers, sites, loads ──────────────────────────────────────

    async fn upsert_carrier(&self, carrier: &Carrier) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO carriers (id, name, dispatcher_email) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, dispatcher_email = excluded.dispatcher_email",
                params![
                    carrier.id.clone(),
                    carrier.name.clone(),
                    carrier.dispatcher_email.clone()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_carrier: {e}")))?;
        Ok(())
    }

    async fn get_carrier(&self, id: &str) -> Result<Option<Carrier>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {CARRIER_COLUMNS} FROM carriers WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_carrier: {e}")))?;
        first_row(rows, row_to_carrier, "get_carrier").await
    }

    async fn list_carriers(&self) -> Result<Vec<Carrier>, DatabaseError> {
        let rows = self
            .conn()
            .query(&format!("SELECT {CARRIER_COLUMNS} FROM carriers ORDER BY id"), ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_carriers: {e}")))?;
        all_rows(rows, row_to_carrier, "list_carriers").await
    }

    async fn upsert_site(&self, site: &Site) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO sites ({SITE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name,
                        current_inventory = excluded.current_inventory, tank_capacity = excluded.tank_capacity,
                        consumption_rate = excluded.consumption_rate,
                        runout_threshold_hours = excluded.runout_threshold_hours,
                        min_delivery_quantity = excluded.min_delivery_quantity,
                        agent_id = excluded.agent_id, active = excluded.active,
                        notes = excluded.notes, updated_at = excluded.updated_at"
                ),
                params![
                    site.id.clone(),
                    site.name.clone(),
                    site.current_inventory,
                    site.tank_capacity,
                    site.consumption_rate,
                    site.runout_threshold_hours,
                    site.min_delivery_quantity,
                    opt_text(site.agent_id.as_deref()),
                    i64::from(site.active),
                    opt_text(site.notes.as_deref()),
                    ts(site.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_site: {e}")))?;
        Ok(())
    }

    async fn get_site(&self, id: &str) -> Result<Option<Site>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_site: {e}")))?;
        first_row(rows, row_to_site, "get_site").await
    }

    async fn list_sites_for_agent(&self, agent_id: &str) -> Result<Vec<Site>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {SITE_COLUMNS} FROM sites WHERE agent_id = ?1 ORDER BY id"),
                params![agent_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_sites_for_agent: {e}")))?;
        all_rows(rows, row_to_site, "list_sites_for_agent").await
    }

    async fn upsert_load(&self, load: &Load) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO loads ({LOAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(id) DO UPDATE SET status = excluded.status,
                        site_id = excluded.site_id, carrier_id = excluded.carrier_id,
                        current_eta = excluded.current_eta, last_eta_update = excluded.last_eta_update,
                        shipped_at = excluded.shipped_at, delivered_at = excluded.delivered_at"
                ),
                params![
                    load.id.clone(),
                    load.po_number.clone(),
                    load.status.as_str(),
                    load.site_id.clone(),
                    load.carrier_id.clone(),
                    opt_ts(load.current_eta),
                    opt_ts(load.last_eta_update),
                    ts(load.created_at),
                    opt_ts(load.shipped_at),
                    opt_ts(load.delivered_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_load: {e}")))?;
        Ok(())
    }

    async fn get_load(&self, id: &str) -> Result<Option<Load>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {LOAD_COLUMNS} FROM loads WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_load: {e}")))?;
        first_row(rows, row_to_load, "get_load").await
    }

    async fn get_load_by_po(&self, po_number: &str) -> Result<Option<Load>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {LOAD_COLUMNS} FROM loads WHERE po_number = ?1"),
                params![po_number],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_load_by_po: {e}")))?;
        first_row(rows, row_to_load, "get_load_by_po").await
    }

    async fn list_open_loads(&self) -> Result<Vec<Load>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOAD_COLUMNS} FROM loads WHERE status NOT IN ('delivered', 'cancelled') ORDER BY created_at, id"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_open_loads: {e}")))?;
        all_rows(rows, row_to_load, "list_open_loads").await
    }

    async fn update_load_eta(
        &self,
        load_id: &str,
        eta: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE loads SET current_eta = ?2, last_eta_update = ?3
                 WHERE id = ?1 AND status NOT IN ('delivered', 'cancelled')
                   AND (last_eta_update IS NULL OR last_eta_update <= ?3)",
                params![load_id, ts(eta), ts(updated_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_load_eta: {e}")))?;
        Ok(count > 0)
    }

    async fn mark_load_delivered(
        &self,
        load_id: &str,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE loads SET status = 'delivered', delivered_at = ?2
                 WHERE id = ?1 AND status NOT IN ('delivered', 'cancelled')",
                params![load_id, ts(delivered_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_load_delivered: {e}")))?;
        Ok(count > 0)
    }

    async fn list_delivered_loads(&self) -> Result<Vec<Load>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOAD_COLUMNS} FROM loads WHERE status = 'delivered' AND delivered_at IS NOT NULL ORDER BY delivered_at"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_delivered_loads: {e}")))?;
        all_rows(rows, row_to_load, "list_delivered_loads").await
    }

    // ── Escalations ─────────────────────────────────────────────────

    async fn create_escalation_deduped(
        &self,
        esc: &Escalation,
        since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "INSERT INTO escalations (id, issue_type, priority, description, status, site_id, load_id, agent_id, created_at, false_alarm)
                 SELECT ?1, ?2, ?3, ?4, 'open', ?5, ?6, ?7, ?8, 0
                 WHERE NOT EXISTS (
                     SELECT 1 FROM escalations
                     WHERE issue_type = ?2
                       AND COALESCE(site_id, '') = COALESCE(?5, '')
                       AND COALESCE(load_id, '') = COALESCE(?6, '')
                       AND (status = 'open' OR created_at >= ?9)
                 )",
                params![
                    esc.id.to_string(),
                    esc.issue_type.as_str(),
                    esc.priority.as_str(),
                    esc.description.clone(),
                    opt_text(esc.site_id.as_deref()),
                    opt_text(esc.load_id.as_deref()),
                    opt_text(esc.agent_id.as_deref()),
                    ts(esc.created_at),
                    ts(since),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_escalation_deduped: {e}")))?;
        if count == 0 {
            debug!(
                issue = %esc.issue_type,
                site = ?esc.site_id,
                load = ?esc.load_id,
                "Escalation suppressed by dedupe"
            );
        }
        Ok(count > 0)
    }

    async fn insert_escalation(&self, esc: &Escalation) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO escalations ({ESCALATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    esc.id.to_string(),
                    esc.issue_type.as_str(),
                    esc.priority.as_str(),
                    esc.description.clone(),
                    esc.status.as_str(),
                    opt_text(esc.site_id.as_deref()),
                    opt_text(esc.load_id.as_deref()),
                    opt_text(esc.agent_id.as_deref()),
                    ts(esc.created_at),
                    opt_ts(esc.resolved_at),
                    opt_text(esc.resolution_notes.as_deref()),
                    i64::from(esc.false_alarm),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_escalation: {e}")))?;
        Ok(())
    }

    async fn get_escalation(&self, id: Uuid) -> Result<Option<Escalation>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ESCALATION_COLUMNS} FROM escalations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_escalation: {e}")))?;
        first_row(rows, row_to_escalation, "get_escalation").await
    }

    async fn list_escalations(
        &self,
        open_only: bool,
        limit: i64,
    ) -> Result<Vec<Escalation>, DatabaseError> {
        let filter = if open_only { "WHERE status = 'open'" } else { "" };
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ESCALATION_COLUMNS} FROM escalations {filter} ORDER BY created_at DESC LIMIT ?1"
                ),
                params![limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_escalations: {e}")))?;
        all_rows(rows, row_to_escalation, "list_escalations").await
    }

    async fn resolve_escalation(
        &self,
        id: Uuid,
        notes: Option<&str>,
        false_alarm: bool,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE escalations SET status = 'resolved', resolved_at = ?2, resolution_notes = ?3, false_alarm = ?4
                 WHERE id = ?1 AND status = 'open'",
                params![
                    id.to_string(),
                    ts(resolved_at),
                    opt_text(notes),
                    i64::from(false_alarm)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_escalation: {e}")))?;
        Ok(count > 0)
    }

    async fn list_resolved_escalations(&self) -> Result<Vec<Escalation>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ESCALATION_COLUMNS} FROM escalations WHERE status = 'resolved' ORDER BY resolved_at"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_resolved_escalations: {e}")))?;
        all_rows(rows, row_to_escalation, "list_resolved_escalations").await
    }

    // ── ETA requests ────────────────────────────────────────────────

    async fn insert_eta_request(&self, req: &EtaRequest) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO eta_requests ({ETA_REQUEST_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    req.id.to_string(),
                    req.load_id.clone(),
                    req.carrier_id.clone(),
                    req.po_number.clone(),
                    req.recipient.clone(),
                    opt_text(req.agent_id.as_deref()),
                    ts(req.sent_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_eta_request: {e}")))?;
        Ok(())
    }

    async fn delete_eta_request(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM eta_requests WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_eta_request: {e}")))?;
        Ok(())
    }

    async fn latest_eta_requests(&self) -> Result<HashMap<String, DateTime<Utc>>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT load_id, MAX(sent_at) FROM eta_requests GROUP BY load_id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_eta_requests: {e}")))?;
        let pairs = all_rows(
            rows,
            |row| Ok((row.get::<String>(0).unwrap_or_default(), get_ts(row, 1))),
            "latest_eta_requests",
        )
        .await?;
        Ok(pairs.into_iter().collect())
    }

    async fn last_eta_request_for_po(
        &self,
        po_number: &str,
    ) -> Result<Option<EtaRequest>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ETA_REQUEST_COLUMNS} FROM eta_requests WHERE po_number = ?1 ORDER BY sent_at DESC LIMIT 1"
                ),
                params![po_number],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("last_eta_request_for_po: {e}")))?;
        first_row(rows, row_to_eta_request, "last_eta_request_for_po").await
    }

    async fn list_eta_requests(&self) -> Result<Vec<EtaRequest>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ETA_REQUEST_COLUMNS} FROM eta_requests ORDER BY sent_at"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_eta_requests: {e}")))?;
        all_rows(rows, row_to_eta_request, "list_eta_requests").await
    }

    // ── Inbound email ───────────────────────────────────────────────

    async fn insert_inbound_email(&self, email: &InboundEmail) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO inbound_emails ({INBOUND_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    email.id.to_string(),
                    email.message_id.clone(),
                    email.sender.clone(),
                    email.subject.clone(),
                    email.body.clone(),
                    ts(email.received_at),
                    opt_text(email.po_number.as_deref()),
                    opt_ts(email.eta),
                    opt_text(email.load_id.as_deref()),
                    opt_text(email.carrier_id.as_deref()),
                    email.parse_method.to_string(),
                    i64::from(email.parse_success),
                    email.parse_message.clone(),
                    opt_real(email.response_latency_hours),
                    ts(email.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_inbound_email: {e}")))?;
        Ok(count > 0)
    }

    async fn list_inbound_emails(&self, limit: i64) -> Result<Vec<InboundEmail>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INBOUND_COLUMNS} FROM inbound_emails ORDER BY received_at DESC LIMIT ?1"
                ),
                params![limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_inbound_emails: {e}")))?;
        all_rows(rows, row_to_inbound, "list_inbound_emails").await
    }

    async fn list_answered_inbound(&self) -> Result<Vec<InboundEmail>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INBOUND_COLUMNS} FROM inbound_emails
                     WHERE parse_success = 1 AND response_latency_hours IS NOT NULL
                     ORDER BY received_at"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_answered_inbound: {e}")))?;
        all_rows(rows, row_to_inbound, "list_answered_inbound").await
    }

    // ── Activity log ────────────────────────────────────────────────

    async fn append_activity(&self, activity: &Activity) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO activities ({ACTIVITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    activity.id.to_string(),
                    opt_text(activity.agent_id.as_deref()),
                    activity.activity_type.as_str(),
                    opt_text(activity.site_id.as_deref()),
                    opt_text(activity.load_id.as_deref()),
                    activity.details.to_string(),
                    ts(activity.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_activity: {e}")))?;
        Ok(())
    }

    async fn list_activities(
        &self,
        limit: i64,
        agent_id: Option<&str>,
    ) -> Result<Vec<Activity>, DatabaseError> {
        let rows = match agent_id {
            Some(agent) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE agent_id = ?1 ORDER BY created_at DESC, seq DESC LIMIT ?2"
                        ),
                        params![agent, limit],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {ACTIVITY_COLUMNS} FROM activities ORDER BY created_at DESC, seq DESC LIMIT ?1"
                        ),
                        params![limit],
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list_activities: {e}")))?;
        all_rows(rows, row_to_activity, "list_activities").await
    }

    async fn recent_activities_for_site(
        &self,
        site_id: &str,
        limit: i64,
    ) -> Result<Vec<Activity>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE site_id = ?1 ORDER BY created_at DESC, seq DESC LIMIT ?2"
                ),
                params![site_id, limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_activities_for_site: {e}")))?;
        all_rows(rows, row_to_activity, "recent_activities_for_site").await
    }

    // ── Agent runs ──────────────────────────────────────────────────

    async fn begin_run(&self, run: &AgentRun) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO agent_runs (id, agent_id, trigger_kind, started_at, status, execution_mode)
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5)",
                params![
                    run.id.to_string(),
                    run.agent_id.clone(),
                    run.trigger.to_string(),
                    ts(run.started_at),
                    run.execution_mode.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("begin_run: {e}")))?;
        Ok(count > 0)
    }

    async fn finalize_run(&self, run: &AgentRun) -> Result<bool, DatabaseError> {
        let decisions = to_json(&run.decisions)?;
        let duration: libsql::Value = match run.duration_ms {
            Some(ms) => libsql::Value::Integer(ms),
            None => libsql::Value::Null,
        };
        let c = &run.counts;
        let count = self
            .conn()
            .execute(
                "UPDATE agent_runs SET status = ?2, ended_at = ?3, duration_ms = ?4,
                    sites_checked = ?5, loads_checked = ?6, emails_sent = ?7,
                    escalations_created = ?8, draft_actions = ?9, advisor_calls = ?10,
                    advisor_tokens = ?11, advisor_cost = ?12, decisions = ?13, error = ?14
                 WHERE id = ?1 AND status = 'running'",
                params![
                    run.id.to_string(),
                    run.status.to_string(),
                    opt_ts(run.ended_at),
                    duration,
                    i64::from(c.sites_checked),
                    i64::from(c.loads_checked),
                    i64::from(c.emails_sent),
                    i64::from(c.escalations_created),
                    i64::from(c.draft_actions),
                    i64::from(c.advisor_calls),
                    c.advisor_tokens as i64,
                    run.advisor_cost.to_string(),
                    decisions,
                    opt_text(run.error.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finalize_run: {e}")))?;
        Ok(count > 0)
    }

    async fn request_run_cancel(&self, id: Uuid, reason: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE agent_runs SET cancel_requested = 1, cancel_reason = ?2
                 WHERE id = ?1 AND status = 'running'",
                params![id.to_string(), reason],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("request_run_cancel: {e}")))?;
        Ok(count > 0)
    }

    async fn run_checkpoint(&self, id: Uuid) -> Result<Option<RunCheckpoint>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT status, cancel_requested, cancel_reason FROM agent_runs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("run_checkpoint: {e}")))?;
        first_row(
            rows,
            |row| {
                let status: String = row.get(0).unwrap_or_default();
                let cancel_reason = get_flag(row, 1).then(|| {
                    row.get::<String>(2)
                        .unwrap_or_else(|_| "cancel requested".to_string())
                });
                Ok(RunCheckpoint {
                    status: parse_enum(&status)?,
                    cancel_reason,
                })
            },
            "run_checkpoint",
        )
        .await
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<AgentRun>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM agent_runs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_run: {e}")))?;
        first_row(rows, row_to_run, "get_run").await
    }

    async fn list_runs(
        &self,
        agent_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AgentRun>, DatabaseError> {
        let rows = match agent_id {
            Some(agent) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {RUN_COLUMNS} FROM agent_runs WHERE agent_id = ?1 ORDER BY started_at DESC LIMIT ?2"
                        ),
                        params![agent, limit],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {RUN_COLUMNS} FROM agent_runs ORDER BY started_at DESC LIMIT ?1"
                        ),
                        params![limit],
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list_runs: {e}")))?;
        all_rows(rows, row_to_run, "list_runs").await
    }

    async fn timeout_stale_runs(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT id, started_at FROM agent_runs WHERE status = 'running' AND started_at < ?1",
                params![ts(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("timeout_stale_runs: {e}")))?;
        let overdue = all_rows(
            rows,
            |row| Ok((row.get::<String>(0).unwrap_or_default(), get_ts(row, 1))),
            "timeout_stale_runs",
        )
        .await?;

        let mut timed_out = Vec::new();
        for (id, started_at) in overdue {
            let count = self
                .conn()
                .execute(
                    "UPDATE agent_runs SET status = 'timeout', ended_at = ?2, duration_ms = ?3,
                        error = 'exceeded maximum run duration'
                     WHERE id = ?1 AND status = 'running'",
                    params![
                        id.clone(),
                        ts(now),
                        (now - started_at).num_milliseconds()
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("timeout_stale_runs: {e}")))?;
            if count > 0
                && let Ok(uuid) = id.parse()
            {
                timed_out.push(uuid);
            }
        }
        Ok(timed_out)
    }

    // ── Knowledge graph ─────────────────────────────────────────────

    async fn get_carrier_reliability(
        &self,
        carrier_id: &str,
    ) -> Result<Option<CarrierReliability>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CARRIER_RELIABILITY_COLUMNS} FROM carrier_reliability WHERE carrier_id = ?1"
                ),
                params![carrier_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_carrier_reliability: {e}")))?;
        first_row(rows, row_to_carrier_reliability, "get_carrier_reliability").await
    }

    async fn save_carrier_reliability(
        &self,
        record: &CarrierReliability,
        expected_version: Option<i64>,
    ) -> Result<bool, DatabaseError> {
        let mut values = carrier_reliability_values(record)?;
        let sql = match expected_version {
            None => format!(
                "INSERT OR IGNORE INTO carrier_reliability ({CARRIER_RELIABILITY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 1)"
            ),
            Some(version) => {
                values.push(version.into());
                "UPDATE carrier_reliability SET total_deliveries = ?2, late_deliveries = ?3,
                    avg_delay_hours = ?4, worst_delay_hours = ?5, recent_outcomes = ?6,
                    reliability_score = ?7, flagged_unreliable = ?8, eta_requests_sent = ?9,
                    responses_received = ?10, avg_response_hours = ?11, recent_events = ?12,
                    updated_at = ?13, version = version + 1
                 WHERE carrier_id = ?1 AND version = ?14"
                    .to_string()
            }
        };
        let count = self
            .conn()
            .execute(&sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("save_carrier_reliability: {e}")))?;
        Ok(count > 0)
    }

    async fn list_carrier_reliability(&self) -> Result<Vec<CarrierReliability>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CARRIER_RELIABILITY_COLUMNS} FROM carrier_reliability ORDER BY carrier_id"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_carrier_reliability: {e}")))?;
        all_rows(rows, row_to_carrier_reliability, "list_carrier_reliability").await
    }

    async fn get_site_risk(&self, site_id: &str) -> Result<Option<SiteRisk>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {SITE_RISK_COLUMNS} FROM site_risk WHERE site_id = ?1"),
                params![site_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_site_risk: {e}")))?;
        first_row(rows, row_to_site_risk, "get_site_risk").await
    }

    async fn save_site_risk(
        &self,
        record: &SiteRisk,
        expected_version: Option<i64>,
    ) -> Result<bool, DatabaseError> {
        let mut values = site_risk_values(record)?;
        let sql = match expected_version {
            None => format!(
                "INSERT OR IGNORE INTO site_risk ({SITE_RISK_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1)"
            ),
            Some(version) => {
                values.push(version.into());
                "UPDATE site_risk SET total_escalations = ?2, weighted_escalations = ?3,
                    false_alarms = ?4, delivery_count = ?5, false_alarm_rate = ?6,
                    risk_score = ?7, recent_events = ?8, updated_at = ?9, version = version + 1
                 WHERE site_id = ?1 AND version = ?10"
                    .to_string()
            }
        };
        let count = self
            .conn()
            .execute(&sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("save_site_risk: {e}")))?;
        Ok(count > 0)
    }

    async fn list_site_risk(&self) -> Result<Vec<SiteRisk>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {SITE_RISK_COLUMNS} FROM site_risk ORDER BY site_id"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_site_risk: {e}")))?;
        all_rows(rows, row_to_site_risk, "list_site_risk").await
    }

    async fn delete_carrier_reliability(
        &self,
        carrier_id: &str,
        expected_version: i64,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM carrier_reliability WHERE carrier_id = ?1 AND version = ?2",
                params![carrier_id, expected_version],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_carrier_reliability: {e}")))?;
        Ok(count > 0)
    }

    async fn delete_site_risk(
        &self,
        site_id: &str,
        expected_version: i64,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM site_risk WHERE site_id = ?1 AND version = ?2",
                params![site_id, expected_version],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_site_risk: {e}")))?;
        Ok(count > 0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
