//! Integration tests for the coordinator REST API.
//!
//! Each test builds a coordinator over in-memory libsql and drives the Axum
//! router directly with `oneshot`, so no port is bound.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use chrono::Utc;
use serde_json::{Value, json};
use tower::ServiceExt;

use fuel_coordinator::agent::{Agent, AgentRun, ExecutionMode, RunStatus, TriggerKind};
use fuel_coordinator::error::MailError;
use fuel_coordinator::logistics::{Carrier, Load, LoadStatus, Site};
use fuel_coordinator::mail::{EmailSender, OutgoingMail};
use fuel_coordinator::pipeline::HeuristicAdvisor;
use fuel_coordinator::store::{Database, LibSqlBackend};
use fuel_coordinator::{Coordinator, CoordinatorConfig, api};

/// Maximum time a run may take before the test is considered hung.
const RUN_TIMEOUT: Duration = Duration::from_secs(5);

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

struct TestApp {
    router: Router,
    store: Arc<dyn Database>,
    sender: Arc<RecordingSender>,
}

impl TestApp {
    async fn new(mode: ExecutionMode) -> Self {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
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

        let sender = Arc::new(RecordingSender::default());
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&store),
            &CoordinatorConfig::default(),
            Arc::new(HeuristicAdvisor),
            Arc::clone(&sender) as Arc<dyn EmailSender>,
        ));
        Self {
            router: api::router(coordinator),
            store,
            sender,
        }
    }

    /// Site with `hours` of fuel left at 100 gal/h.
    async fn add_site(&self, id: &str, hours: f64) {
        self.store
            .upsert_site(
                &Site::new(id, format!("Site {id}"))
                    .with_inventory(hours * 100.0, 10_000.0, 100.0)
                    .with_agent("north"),
            )
            .await
            .unwrap();
    }

    async fn add_load(&self, id: &str, site_id: &str, status: LoadStatus) {
        self.store
            .upsert_load(&Load::new(id, format!("PO-2026-{id}"), site_id, "c1", status))
            .await
            .unwrap();
    }

    async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// Trigger a manual run and wait for it to be finalized.
    async fn run(&self) -> Value {
        let (status, body) = self.call(Method::POST, "/api/agents/north/runs", None).await;
        assert_eq!(status, StatusCode::ACCEPTED, "{body}");
        let run_id = body["run_id"].as_str().unwrap().to_string();

        let deadline = tokio::time::Instant::now() + RUN_TIMEOUT;
        loop {
            let (_, run) = self.call(Method::GET, &format!("/api/runs/{run_id}"), None).await;
            if run["status"] != "RUNNING" {
                return run;
            }
            assert!(tokio::time::Instant::now() < deadline, "run {run_id} never finished");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test]
async fn health_check() {
    let app = TestApp::new(ExecutionMode::DraftOnly).await;
    let (status, body) = app.call(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn critical_site_escalated_exactly_once() {
    let app = TestApp::new(ExecutionMode::FullAuto).await;
    app.add_site("s1", 8.0).await;
    // A scheduled load does not cover a site that runs out before it arrives.
    app.add_load("001", "s1", LoadStatus::Scheduled).await;

    let first = app.run().await;
    assert_eq!(first["status"], "COMPLETED");
    assert_eq!(first["counts"]["escalations_created"], 1);

    let second = app.run().await;
    assert_eq!(second["status"], "COMPLETED");
    assert_eq!(second["counts"]["escalations_created"], 0);

    let (_, open) = app
        .call(Method::GET, "/api/escalations?open_only=true", None)
        .await;
    let critical: Vec<&Value> = open
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["priority"] == "CRITICAL")
        .collect();
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0]["site_id"], "s1");
}

#[tokio::test]
async fn delayed_load_gets_one_email_per_window() {
    let app = TestApp::new(ExecutionMode::AutoEmail).await;
    app.add_site("s1", 200.0).await;
    app.add_load("002", "s1", LoadStatus::Delayed).await;

    let first = app.run().await;
    assert_eq!(first["counts"]["emails_sent"], 1);
    let second = app.run().await;
    assert_eq!(second["counts"]["emails_sent"], 0);

    let (status, sweep) = app
        .call(Method::POST, "/api/agents/north/eta-requests", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sweep["sent"], json!([]));
    assert_eq!(sweep["skipped"], json!(["PO-2026-002"]));

    assert_eq!(app.sender.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn manual_eta_request_always_sends() {
    let app = TestApp::new(ExecutionMode::DraftOnly).await;
    app.add_site("s1", 200.0).await;
    app.add_load("003", "s1", LoadStatus::InTransit).await;

    for _ in 0..2 {
        let (status, body) = app
            .call(Method::POST, "/api/loads/003/eta-request", None)
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["po_number"], "PO-2026-003");
    }
    let sent = app.sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].subject, "ETA Request - Load PO-2026-003");

    let (status, _) = app
        .call(Method::POST, "/api/loads/missing/eta-request", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn draft_only_summarizes_every_flagged_site() {
    let app = TestApp::new(ExecutionMode::DraftOnly).await;
    for i in 1..=5 {
        app.add_site(&format!("s{i}"), 6.0).await;
    }

    let run = app.run().await;
    assert_eq!(run["status"], "COMPLETED");
    assert_eq!(run["execution_mode"], "draft_only");
    let decisions = run["decisions"].as_array().unwrap();
    assert_eq!(decisions.len(), 5);
    assert!(decisions.iter().all(|d| d["outcome"] == "drafted"));
    assert_eq!(run["counts"]["escalations_created"], 0);
    assert_eq!(run["counts"]["draft_actions"], 5);

    let (_, escalations) = app.call(Method::GET, "/api/escalations", None).await;
    assert_eq!(escalations, json!([]));
    assert!(app.sender.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_trigger_rejected() {
    let app = TestApp::new(ExecutionMode::DraftOnly).await;
    let agent = app.store.get_agent("north").await.unwrap().unwrap();
    let live = AgentRun::start(&agent, TriggerKind::Scheduled);
    assert!(app.store.begin_run(&live).await.unwrap());

    let (status, body) = app.call(Method::POST, "/api/agents/north/runs", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already has a run"));

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/api/runs/{}/cancel", live.id),
            Some(json!({ "reason": "operator stop" })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    let stored = app.store.get_run(live.id).await.unwrap().unwrap();
    assert!(stored.cancel_requested);
    assert_eq!(stored.status, RunStatus::Running);
}

#[tokio::test]
async fn execution_mode_changes_apply_to_next_run() {
    let app = TestApp::new(ExecutionMode::DraftOnly).await;
    app.add_site("s1", 6.0).await;

    let (status, _) = app
        .call(
            Method::PUT,
            "/api/agents/north/mode",
            Some(json!({ "mode": "full_auto" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let run = app.run().await;
    assert_eq!(run["execution_mode"], "full_auto");
    assert_eq!(run["counts"]["escalations_created"], 1);

    let (status, _) = app
        .call(Method::PUT, "/api/agents/north/mode", Some(json!({ "mode": "yolo" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = app
        .call(
            Method::PUT,
            "/api/agents/ghost/mode",
            Some(json!({ "mode": "full_auto" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn outcomes_feed_the_knowledge_graph() {
    let app = TestApp::new(ExecutionMode::DraftOnly).await;
    app.add_site("s1", 200.0).await;
    let eta = Utc::now() - chrono::Duration::hours(2);
    app.store
        .upsert_load(
            &Load::new("004", "PO-2026-004", "s1", "c1", LoadStatus::InTransit)
                .with_eta(eta, eta - chrono::Duration::hours(4)),
        )
        .await
        .unwrap();

    let (status, load) = app
        .call(Method::POST, "/api/loads/004/delivery", Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(load["status"], "DELIVERED");

    let (status, carrier) = app
        .call(Method::GET, "/api/knowledge/carriers/c1", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(carrier["total_deliveries"], 1);
    assert_eq!(carrier["late_deliveries"], 1);

    let (status, escalation) = app
        .call(
            Method::POST,
            "/api/escalations",
            Some(json!({
                "issue_type": "inventory_risk",
                "priority": "HIGH",
                "description": "gauge reads low",
                "site_id": "s1"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = escalation["id"].as_str().unwrap();

    let (status, resolved) = app
        .call(
            Method::POST,
            &format!("/api/escalations/{id}/resolve"),
            Some(json!({ "notes": "sensor fault", "false_alarm": true })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["status"], "RESOLVED");

    let (_, site) = app.call(Method::GET, "/api/knowledge/sites/s1", None).await;
    assert_eq!(site["false_alarms"], 1);
    assert_eq!(site["delivery_count"], 1);

    let (status, summary) = app
        .call(Method::POST, "/api/knowledge/rebuild", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["carriers"], 1);

    let (_, rebuilt) = app.call(Method::GET, "/api/knowledge/sites/s1", None).await;
    assert_eq!(rebuilt["false_alarms"], site["false_alarms"]);
    assert_eq!(rebuilt["risk_score"], site["risk_score"]);

    let (_, feed) = app.call(Method::GET, "/api/activity?limit=10", None).await;
    let kinds: Vec<&str> = feed
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["activity_type"].as_str().unwrap())
        .collect();
    assert_eq!(kinds[0], "escalation_resolved");
    assert!(kinds.contains(&"delivery_recorded"));
}

#[tokio::test]
async fn malformed_ids_are_bad_requests() {
    let app = TestApp::new(ExecutionMode::DraftOnly).await;
    let (status, _) = app.call(Method::GET, "/api/runs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = app
        .call(Method::GET, &format!("/api/runs/{}", uuid::Uuid::new_v4()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coordinator.db");
    {
        let store = LibSqlBackend::new_local(&path).await.unwrap();
        store.upsert_agent(&Agent::new("north", "North")).await.unwrap();
    }
    let store = LibSqlBackend::new_local(&path).await.unwrap();
    let agent = store.get_agent("north").await.unwrap().unwrap();
    assert_eq!(agent.execution_mode, ExecutionMode::DraftOnly);
}
