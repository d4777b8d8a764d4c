//! Mailbox poll loop.
//!
//! Each cycle lists unread messages and handles them one at a time:
//! fetch, extract, apply the ETA, persist, then mark read. A message is only
//! marked read after its record is stored, so a failure mid-message re-reads
//! it. The ETA write is ordered by reply time and the unique message id keeps
//! the second pass from duplicating anything.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, MailError};
use crate::ingest::extract::EtaExtractor;
use crate::knowledge::{KnowledgeEvent, KnowledgeGraph};
use crate::logistics::{Activity, ActivityType, InboundEmail};
use crate::mail::{MailMessage, Mailbox, clean_body};
use crate::store::Database;

/// Counts for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub unread: usize,
    pub parsed: usize,
    pub unparsed: usize,
    /// Self-sent, duplicate, or unreadable.
    pub skipped: usize,
    /// Left unread for the next cycle.
    pub failed: usize,
}

pub struct IngestPipeline {
    store: Arc<dyn Database>,
    mailbox: Arc<dyn Mailbox>,
    extractor: EtaExtractor,
    knowledge: KnowledgeGraph,
}

enum Handled {
    Parsed,
    Unparsed,
    Skipped,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn Database>,
        mailbox: Arc<dyn Mailbox>,
        extractor: EtaExtractor,
        knowledge: KnowledgeGraph,
    ) -> Self {
        Self {
            store,
            mailbox,
            extractor,
            knowledge,
        }
    }

    /// Run one poll cycle. Stops between messages once `shutdown` is set.
    pub async fn poll_once(&self, shutdown: &AtomicBool) -> Result<PollSummary, MailError> {
        let uids = match self.mailbox.list_unread().await {
            Ok(uids) => uids,
            Err(e) => {
                self.mailbox.close().await;
                return Err(e);
            }
        };
        let mut summary = PollSummary {
            unread: uids.len(),
            ..Default::default()
        };
        if uids.is_empty() {
            self.mailbox.close().await;
            return Ok(summary);
        }
        debug!(count = uids.len(), "Unread carrier mail");

        for uid in &uids {
            if shutdown.load(Ordering::Relaxed) {
                info!("Mail poll cancelled between messages");
                break;
            }

            match self.handle(uid).await {
                Ok(Handled::Parsed) => summary.parsed += 1,
                Ok(Handled::Unparsed) => summary.unparsed += 1,
                Ok(Handled::Skipped) => summary.skipped += 1,
                Err(e) => {
                    warn!(uid = %uid, error = %e, "Message left unread");
                    summary.failed += 1;
                }
            }
        }

        self.mailbox.close().await;
        Ok(summary)
    }

    async fn handle(&self, uid: &str) -> Result<Handled, Error> {
        let message = match self.mailbox.fetch(uid).await {
            Ok(m) => m,
            Err(MailError::Unparseable { .. }) => {
                warn!(uid, "Unreadable message, marking read");
                self.mailbox.mark_read(uid).await?;
                return Ok(Handled::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        if message.sender.eq_ignore_ascii_case(self.mailbox.address()) {
            debug!(uid, "Skipping self-sent email");
            self.mailbox.mark_read(uid).await?;
            return Ok(Handled::Skipped);
        }

        let outcome = self.ingest(&message).await?;
        self.mailbox.mark_read(uid).await?;
        Ok(outcome)
    }

    /// Extract and persist one message, applying its ETA when parsed.
    async fn ingest(&self, message: &MailMessage) -> Result<Handled, Error> {
        let body = clean_body(&message.body);
        let extraction = self
            .extractor
            .extract(&message.subject, &body, message.received_at)
            .await;

        let load = match &extraction.po_number {
            Some(po) => self.store.get_load_by_po(po).await?,
            None => None,
        };
        let latency = match &extraction.po_number {
            Some(po) if extraction.success() => self
                .store
                .last_eta_request_for_po(po)
                .await?
                .map(|req| (message.received_at - req.sent_at).num_seconds() as f64 / 3600.0)
                .filter(|hours| *hours >= 0.0),
            _ => None,
        };

        let record = InboundEmail {
            id: Uuid::new_v4(),
            message_id: message.message_id.clone(),
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            received_at: message.received_at,
            po_number: extraction.po_number.clone(),
            eta: extraction.eta,
            load_id: load.as_ref().map(|l| l.id.clone()),
            carrier_id: load.as_ref().map(|l| l.carrier_id.clone()),
            parse_method: extraction.method,
            parse_success: extraction.success(),
            parse_message: extraction.message.clone(),
            response_latency_hours: latency,
            created_at: Utc::now(),
        };

        // Applied before the record is stored: if the insert fails the message
        // stays unread and the next cycle writes the same ETA again.
        let applied = match (&load, record.eta, record.parse_success) {
            (Some(load), Some(eta), true) => {
                self.store
                    .update_load_eta(&load.id, eta, message.received_at)
                    .await?
            }
            _ => false,
        };

        if !self.store.insert_inbound_email(&record).await? {
            debug!(message_id = %record.message_id, "Already ingested");
            return Ok(Handled::Skipped);
        }

        let site_id = load.as_ref().map(|l| l.site_id.as_str());
        let load_id = record.load_id.as_deref();
        self.log(
            Activity::new(
                ActivityType::EmailReceived,
                json!({
                    "summary": format!("Reply from {}: {}", record.sender, record.parse_message),
                    "message_id": record.message_id,
                    "po_number": record.po_number,
                    "parse_method": record.parse_method,
                    "parse_success": record.parse_success,
                    "model_tokens": extraction.usage.total(),
                }),
            )
            .for_site(site_id)
            .for_load(load_id),
        )
        .await;

        let (Some(eta), true) = (record.eta, record.parse_success) else {
            info!(
                sender = %record.sender,
                po = ?record.po_number,
                reason = %record.parse_message,
                "Reply not parsed"
            );
            return Ok(Handled::Unparsed);
        };

        let Some(load) = load else {
            warn!(po = ?record.po_number, "Parsed reply for unknown PO");
            return Ok(Handled::Parsed);
        };

        if applied {
            self.log(
                Activity::new(
                    ActivityType::EtaUpdated,
                    json!({
                        "summary": format!("{} ETA {}", load.po_number, eta.format("%Y-%m-%d %H:%M")),
                        "po_number": load.po_number,
                        "previous_eta": load.current_eta,
                        "eta": eta,
                        "source": "email",
                    }),
                )
                .for_site(Some(load.site_id.as_str()))
                .for_load(Some(load.id.as_str())),
            )
            .await;
            info!(po = %load.po_number, %eta, "Load ETA updated from reply");
        } else {
            debug!(po = %load.po_number, status = %load.status, "Load is terminal or has a newer ETA, not applied");
        }

        if let Some(event) = KnowledgeEvent::from_inbound(&record)
            && let Err(e) = self.knowledge.record(&event).await
        {
            error!(carrier = %load.carrier_id, error = %e, "Failed to record reply latency");
        }

        Ok(Handled::Parsed)
    }

    async fn log(&self, activity: Activity) {
        if let Err(e) = self.store.append_activity(&activity).await {
            warn!(kind = %activity.activity_type, error = %e, "Failed to append activity");
        }
    }
}

/// A running mailbox poller.
pub struct PollerHandle {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl PollerHandle {
    /// Stop polling once the message in hand is stored.
    ///
    /// An idle poller stops immediately. One still busy after `grace` is
    /// aborted; its current message stays unread and is handled next start.
    pub async fn stop(self, grace: Duration) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify_one();
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(grace, self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Email poller task failed: {e}"),
            Err(_) => {
                warn!("Email poller did not stop within {}s, aborting", grace.as_secs());
                abort.abort();
            }
        }
    }
}

/// Spawn a background task that polls the mailbox on `interval`.
pub fn spawn_email_poller(pipeline: Arc<IngestPipeline>, interval: Duration) -> PollerHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    let shutdown_flag = Arc::clone(&shutdown);
    let wake_signal = Arc::clone(&wake);

    let handle = tokio::spawn(async move {
        info!("Email poller started, polling every {}s", interval.as_secs());
        let mut tick = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = wake.notified() => {}
            }

            if shutdown.load(Ordering::Relaxed) {
                info!("Email poller shutting down");
                return;
            }

            match pipeline.poll_once(&shutdown).await {
                Ok(summary) if summary.unread > 0 => info!(
                    unread = summary.unread,
                    parsed = summary.parsed,
                    unparsed = summary.unparsed,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    "Mail poll complete"
                ),
                Ok(_) => {}
                Err(e) => error!("Email poll failed: {e}"),
            }
        }
    });

    PollerHandle {
        handle,
        shutdown: shutdown_flag,
        wake: wake_signal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::ScoringParams;
    use crate::logistics::{Carrier, EtaRequest, Load, LoadStatus, Site};
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    const OWN_ADDRESS: &str = "coordinator@fuel.test";

    #[derive(Default)]
    struct StubMailbox {
        messages: Mutex<HashMap<String, MailMessage>>,
        unread: Mutex<Vec<String>>,
        marked: Mutex<Vec<String>>,
        broken: Vec<String>,
        unreachable: bool,
        closed: AtomicUsize,
    }

    impl StubMailbox {
        fn deliver(&self, msg: MailMessage) {
            self.unread.lock().unwrap().push(msg.uid.clone());
            self.messages.lock().unwrap().insert(msg.uid.clone(), msg);
        }

        fn marked(&self) -> Vec<String> {
            self.marked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Mailbox for StubMailbox {
        fn address(&self) -> &str {
            OWN_ADDRESS
        }

        async fn list_unread(&self) -> Result<Vec<String>, MailError> {
            if self.unreachable {
                return Err(MailError::CommandFailed {
                    command: "UID SEARCH".into(),
                    reason: "connection reset".into(),
                });
            }
            Ok(self.unread.lock().unwrap().clone())
        }

        async fn fetch(&self, uid: &str) -> Result<MailMessage, MailError> {
            if self.broken.iter().any(|b| b == uid) {
                return Err(MailError::CommandFailed {
                    command: "UID FETCH".into(),
                    reason: "connection reset".into(),
                });
            }
            self.messages
                .lock()
                .unwrap()
                .get(uid)
                .cloned()
                .ok_or_else(|| MailError::Unparseable { uid: uid.into() })
        }

        async fn mark_read(&self, uid: &str) -> Result<(), MailError> {
            self.unread.lock().unwrap().retain(|u| u != uid);
            self.marked.lock().unwrap().push(uid.to_string());
            Ok(())
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn reply(uid: &str, sender: &str, subject: &str, body: &str) -> MailMessage {
        MailMessage {
            uid: uid.into(),
            message_id: format!("<{uid}@carrier.test>"),
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            received_at: received(),
        }
    }

    async fn setup(mailbox: Arc<StubMailbox>) -> (IngestPipeline, Arc<LibSqlBackend>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store
            .upsert_site(&Site::new("s1", "North Depot").with_inventory(5000.0, 10_000.0, 100.0))
            .await
            .unwrap();
        store
            .upsert_carrier(&Carrier {
                id: "c1".into(),
                name: "Acme Haulage".into(),
                dispatcher_email: "dispatch@acme.test".into(),
            })
            .await
            .unwrap();
        store
            .upsert_load(&Load::new("l1", "PO-2026-001", "s1", "c1", LoadStatus::InTransit))
            .await
            .unwrap();
        store
            .insert_eta_request(&EtaRequest {
                id: Uuid::new_v4(),
                load_id: "l1".into(),
                carrier_id: "c1".into(),
                po_number: "PO-2026-001".into(),
                recipient: "dispatch@acme.test".into(),
                agent_id: Some("a1".into()),
                sent_at: received() - chrono::Duration::hours(3),
            })
            .await
            .unwrap();

        let db: Arc<dyn Database> = store.clone();
        let pipeline = IngestPipeline::new(
            Arc::clone(&db),
            mailbox,
            EtaExtractor::patterns_only(),
            KnowledgeGraph::new(db, ScoringParams::default()),
        );
        (pipeline, store)
    }

    #[tokio::test]
    async fn parsed_reply_updates_load_and_latency() {
        let mailbox = Arc::new(StubMailbox::default());
        mailbox.deliver(reply(
            "1",
            "dispatch@acme.test",
            "RE: ETA Request - Load PO-2026-001",
            "between 1400 and 1600\n\nSent from my iPhone",
        ));
        let (pipeline, store) = setup(Arc::clone(&mailbox)).await;

        let summary = pipeline.poll_once(&AtomicBool::new(false)).await.unwrap();
        assert_eq!(summary.parsed, 1);
        assert_eq!(mailbox.marked(), vec!["1"]);

        let load = store.get_load("l1").await.unwrap().unwrap();
        assert_eq!(
            load.current_eta,
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 16, 0, 0).unwrap())
        );
        assert_eq!(load.last_eta_update, Some(received()));

        let inbound = store.list_inbound_emails(10).await.unwrap();
        assert_eq!(inbound.len(), 1);
        assert!(inbound[0].parse_success);
        assert_eq!(inbound[0].load_id.as_deref(), Some("l1"));
        assert_eq!(inbound[0].response_latency_hours, Some(3.0));

        let carrier = store.get_carrier_reliability("c1").await.unwrap().unwrap();
        assert_eq!(carrier.responses_received, 1);
        assert_eq!(carrier.avg_response_hours, 3.0);

        let kinds: Vec<ActivityType> = store
            .list_activities(10, None)
            .await
            .unwrap()
            .iter()
            .map(|a| a.activity_type)
            .collect();
        assert!(kinds.contains(&ActivityType::EmailReceived));
        assert!(kinds.contains(&ActivityType::EtaUpdated));
    }

    #[tokio::test]
    async fn unparsable_reply_is_stored_and_marked_read_once() {
        let mailbox = Arc::new(StubMailbox::default());
        mailbox.deliver(reply(
            "2",
            "dispatch@acme.test",
            "RE: ETA Request - Load PO-2026-001",
            "Running late, will call",
        ));
        let (pipeline, store) = setup(Arc::clone(&mailbox)).await;

        let summary = pipeline.poll_once(&AtomicBool::new(false)).await.unwrap();
        assert_eq!(summary.unparsed, 1);
        let again = pipeline.poll_once(&AtomicBool::new(false)).await.unwrap();
        assert_eq!(again.unread, 0);
        assert_eq!(mailbox.marked(), vec!["2"]);

        let inbound = store.list_inbound_emails(10).await.unwrap();
        assert_eq!(inbound.len(), 1);
        assert!(!inbound[0].parse_success);
        assert_eq!(inbound[0].po_number.as_deref(), Some("PO-2026-001"));

        let load = store.get_load("l1").await.unwrap().unwrap();
        assert_eq!(load.current_eta, None);
    }

    #[tokio::test]
    async fn self_sent_and_duplicates_are_skipped() {
        let mailbox = Arc::new(StubMailbox::default());
        mailbox.deliver(reply("3", OWN_ADDRESS, "ETA Request - Load PO-2026-001", "1400"));
        mailbox.deliver(reply("4", "dispatch@acme.test", "RE: PO-2026-001", "1500"));
        let (pipeline, store) = setup(Arc::clone(&mailbox)).await;

        let first = pipeline.poll_once(&AtomicBool::new(false)).await.unwrap();
        assert_eq!(first.skipped, 1);
        assert_eq!(first.parsed, 1);

        // The server re-delivers message 4 under a new uid.
        let mut copy = reply("5", "dispatch@acme.test", "RE: PO-2026-001", "1500");
        copy.message_id = "<4@carrier.test>".into();
        mailbox.deliver(copy);
        let second = pipeline.poll_once(&AtomicBool::new(false)).await.unwrap();
        assert_eq!(second.skipped, 1);

        assert_eq!(store.list_inbound_emails(10).await.unwrap().len(), 1);
        assert_eq!(mailbox.marked(), vec!["3", "4", "5"]);
    }

    #[tokio::test]
    async fn fetch_failure_leaves_message_unread() {
        let mailbox = Arc::new(StubMailbox {
            broken: vec!["6".into()],
            ..Default::default()
        });
        mailbox.deliver(reply("6", "dispatch@acme.test", "RE: PO-2026-001", "1500"));
        let (pipeline, _store) = setup(Arc::clone(&mailbox)).await;

        let summary = pipeline.poll_once(&AtomicBool::new(false)).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(mailbox.marked().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_between_messages() {
        let mailbox = Arc::new(StubMailbox::default());
        mailbox.deliver(reply("7", "dispatch@acme.test", "RE: PO-2026-001", "1500"));
        let (pipeline, store) = setup(Arc::clone(&mailbox)).await;

        let summary = pipeline.poll_once(&AtomicBool::new(true)).await.unwrap();
        assert_eq!(summary.unread, 1);
        assert_eq!(summary.parsed, 0);
        assert!(store.list_inbound_emails(10).await.unwrap().is_empty());
    }

    fn fifteen_hundred() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn activity_failure_still_applies_eta() {
        let mailbox = Arc::new(StubMailbox::default());
        mailbox.deliver(reply("8", "dispatch@acme.test", "RE: PO-2026-001", "1500"));
        let (pipeline, store) = setup(Arc::clone(&mailbox)).await;

        store
            .execute_raw("ALTER TABLE activities RENAME TO activities_offline")
            .await
            .unwrap();
        let summary = pipeline.poll_once(&AtomicBool::new(false)).await.unwrap();
        store
            .execute_raw("ALTER TABLE activities_offline RENAME TO activities")
            .await
            .unwrap();

        assert_eq!(summary.parsed, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(mailbox.marked(), vec!["8"]);
        let load = store.get_load("l1").await.unwrap().unwrap();
        assert_eq!(load.current_eta, Some(fifteen_hundred()));
        let carrier = store.get_carrier_reliability("c1").await.unwrap().unwrap();
        assert_eq!(carrier.responses_received, 1);
    }

    #[tokio::test]
    async fn failed_persist_is_retried_next_cycle() {
        let mailbox = Arc::new(StubMailbox::default());
        mailbox.deliver(reply("9", "dispatch@acme.test", "RE: PO-2026-001", "1500"));
        let (pipeline, store) = setup(Arc::clone(&mailbox)).await;

        store
            .execute_raw("ALTER TABLE inbound_emails RENAME TO inbound_offline")
            .await
            .unwrap();
        let first = pipeline.poll_once(&AtomicBool::new(false)).await.unwrap();
        store
            .execute_raw("ALTER TABLE inbound_offline RENAME TO inbound_emails")
            .await
            .unwrap();
        assert_eq!(first.failed, 1);
        assert!(mailbox.marked().is_empty());

        let second = pipeline.poll_once(&AtomicBool::new(false)).await.unwrap();
        assert_eq!(second.parsed, 1);
        assert_eq!(mailbox.marked(), vec!["9"]);

        let load = store.get_load("l1").await.unwrap().unwrap();
        assert_eq!(load.current_eta, Some(fifteen_hundred()));
        let inbound = store.list_inbound_emails(10).await.unwrap();
        assert_eq!(inbound.len(), 1);
        assert!(inbound[0].parse_success);

        let kinds: Vec<ActivityType> = store
            .list_activities(10, None)
            .await
            .unwrap()
            .iter()
            .map(|a| a.activity_type)
            .collect();
        assert!(kinds.contains(&ActivityType::EtaUpdated));
        let carrier = store.get_carrier_reliability("c1").await.unwrap().unwrap();
        assert_eq!(carrier.responses_received, 1);
    }

    #[tokio::test]
    async fn empty_poll_closes_session() {
        let mailbox = Arc::new(StubMailbox::default());
        let (pipeline, _store) = setup(Arc::clone(&mailbox)).await;

        let summary = pipeline.poll_once(&AtomicBool::new(false)).await.unwrap();
        assert_eq!(summary.unread, 0);
        assert_eq!(mailbox.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_listing_closes_session() {
        let mailbox = Arc::new(StubMailbox {
            unreachable: true,
            ..Default::default()
        });
        let (pipeline, _store) = setup(Arc::clone(&mailbox)).await;

        assert!(pipeline.poll_once(&AtomicBool::new(false)).await.is_err());
        assert_eq!(mailbox.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_poller_stops_without_waiting_for_next_tick() {
        let mailbox = Arc::new(StubMailbox::default());
        mailbox.deliver(reply(
            "1",
            "dispatch@acme.test",
            "Re: ETA request PO-2026-001",
            "Arriving 14:30",
        ));
        let (pipeline, _store) = setup(Arc::clone(&mailbox)).await;

        let poller = spawn_email_poller(Arc::new(pipeline), Duration::from_secs(3600));
        for _ in 0..200 {
            if !mailbox.marked().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mailbox.marked(), vec!["1".to_string()]);

        let stopped = tokio::time::timeout(
            Duration::from_secs(2),
            poller.stop(Duration::from_secs(30)),
        )
        .await;
        assert!(stopped.is_ok());
    }
}
