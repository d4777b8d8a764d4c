//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "logistics_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                execution_mode TEXT NOT NULL DEFAULT 'draft_only',
                check_interval_minutes INTEGER NOT NULL DEFAULT 15,
                cron_schedule TEXT,
                enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS carriers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                dispatcher_email TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sites (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                current_inventory REAL NOT NULL DEFAULT 0,
                tank_capacity REAL NOT NULL DEFAULT 0,
                consumption_rate REAL NOT NULL DEFAULT 0,
                runout_threshold_hours REAL NOT NULL DEFAULT 48,
                min_delivery_quantity REAL NOT NULL DEFAULT 0,
                agent_id TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                notes TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sites_agent ON sites(agent_id);

            CREATE TABLE IF NOT EXISTS loads (
                id TEXT PRIMARY KEY,
                po_number TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                site_id TEXT NOT NULL,
                carrier_id TEXT NOT NULL,
                current_eta TEXT,
                last_eta_update TEXT,
                created_at TEXT NOT NULL,
                shipped_at TEXT,
                delivered_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_loads_status ON loads(status);
            CREATE INDEX IF NOT EXISTS idx_loads_site ON loads(site_id);

            CREATE TABLE IF NOT EXISTS escalations (
                id TEXT PRIMARY KEY,
                issue_type TEXT NOT NULL,
                priority TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                site_id TEXT,
                load_id TEXT,
                agent_id TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                resolution_notes TEXT,
                false_alarm INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_escalations_dedupe
                ON escalations(issue_type, site_id, load_id);
            CREATE INDEX IF NOT EXISTS idx_escalations_status ON escalations(status);

            CREATE TABLE IF NOT EXISTS activities (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                agent_id TEXT,
                activity_type TEXT NOT NULL,
                site_id TEXT,
                load_id TEXT,
                details TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_activities_created ON activities(created_at);
            CREATE INDEX IF NOT EXISTS idx_activities_site ON activities(site_id);

            CREATE TABLE IF NOT EXISTS inbound_emails (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL UNIQUE,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                received_at TEXT NOT NULL,
                po_number TEXT,
                eta TEXT,
                load_id TEXT,
                carrier_id TEXT,
                parse_method TEXT NOT NULL,
                parse_success INTEGER NOT NULL,
                parse_message TEXT NOT NULL,
                response_latency_hours REAL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS eta_requests (
                id TEXT PRIMARY KEY,
                load_id TEXT NOT NULL,
                carrier_id TEXT NOT NULL,
                po_number TEXT NOT NULL,
                recipient TEXT NOT NULL,
                agent_id TEXT,
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_eta_requests_load ON eta_requests(load_id);
            CREATE INDEX IF NOT EXISTS idx_eta_requests_po ON eta_requests(po_number);
        "#,
    },
    Migration {
        version: 2,
        name: "agent_runs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS agent_runs (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                trigger_kind TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                duration_ms INTEGER,
                status TEXT NOT NULL DEFAULT 'running',
                execution_mode TEXT NOT NULL,
                sites_checked INTEGER NOT NULL DEFAULT 0,
                loads_checked INTEGER NOT NULL DEFAULT 0,
                emails_sent INTEGER NOT NULL DEFAULT 0,
                escalations_created INTEGER NOT NULL DEFAULT 0,
                draft_actions INTEGER NOT NULL DEFAULT 0,
                advisor_calls INTEGER NOT NULL DEFAULT 0,
                advisor_tokens INTEGER NOT NULL DEFAULT 0,
                advisor_cost TEXT NOT NULL DEFAULT '0',
                decisions TEXT NOT NULL DEFAULT '[]',
                error TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                cancel_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_agent_runs_agent ON agent_runs(agent_id, started_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_agent_runs_one_running
                ON agent_runs(agent_id) WHERE status = 'running';
        "#,
    },
    Migration {
        version: 3,
        name: "knowledge_graph",
        sql: r#"
            CREATE TABLE IF NOT EXISTS carrier_reliability (
                carrier_id TEXT PRIMARY KEY,
                total_deliveries INTEGER NOT NULL DEFAULT 0,
                late_deliveries INTEGER NOT NULL DEFAULT 0,
                avg_delay_hours REAL NOT NULL DEFAULT 0,
                worst_delay_hours REAL NOT NULL DEFAULT 0,
                recent_outcomes TEXT NOT NULL DEFAULT '[]',
                reliability_score REAL NOT NULL DEFAULT 0.5,
                flagged_unreliable INTEGER NOT NULL DEFAULT 0,
                eta_requests_sent INTEGER NOT NULL DEFAULT 0,
                responses_received INTEGER NOT NULL DEFAULT 0,
                avg_response_hours REAL NOT NULL DEFAULT 0,
                recent_events TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT,
                version INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS site_risk (
                site_id TEXT PRIMARY KEY,
                total_escalations INTEGER NOT NULL DEFAULT 0,
                weighted_escalations REAL NOT NULL DEFAULT 0,
                false_alarms INTEGER NOT NULL DEFAULT 0,
                delivery_count INTEGER NOT NULL DEFAULT 0,
                false_alarm_rate REAL NOT NULL DEFAULT 0,
                risk_score REAL NOT NULL DEFAULT 0,
                recent_events TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT,
                version INTEGER NOT NULL DEFAULT 1
            );
        "#,
    },
];

/// Create the tracking table and apply all pending migrations.
pub async fn init_schema(conn: &Connection) -> Result<(), DatabaseError> {
    run_migrations(conn).await
}

/// Apply every migration newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
