//! Sending ETA requests to carriers.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, Error};
use crate::knowledge::{KnowledgeEvent, KnowledgeGraph};
use crate::logistics::{Activity, ActivityType, EtaRequest, Load};
use crate::mail::{EmailSender, OutgoingMail};
use crate::store::Database;

/// Composes, sends, and records ETA request emails.
#[derive(Clone)]
pub struct EtaMailer {
    store: Arc<dyn Database>,
    knowledge: KnowledgeGraph,
    sender: Arc<dyn EmailSender>,
}

impl EtaMailer {
    pub fn new(store: Arc<dyn Database>, knowledge: KnowledgeGraph, sender: Arc<dyn EmailSender>) -> Self {
        Self {
            store,
            knowledge,
            sender,
        }
    }

    /// Send one request for `load`. No dedupe: callers decide whether to send.
    pub async fn send(&self, load: &Load, agent_id: Option<&str>) -> Result<EtaRequest, Error> {
        let site = self
            .store
            .get_site(&load.site_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "site".into(),
                id: load.site_id.clone(),
            })?;
        let carrier = self
            .store
            .get_carrier(&load.carrier_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "carrier".into(),
                id: load.carrier_id.clone(),
            })?;

        let mail = OutgoingMail::eta_request(load, &site, &carrier);
        let request = EtaRequest {
            id: Uuid::new_v4(),
            load_id: load.id.clone(),
            carrier_id: carrier.id.clone(),
            po_number: load.po_number.clone(),
            recipient: mail.to.clone(),
            agent_id: agent_id.map(str::to_string),
            sent_at: Utc::now(),
        };

        // Recorded before sending so a sent mail always has its row.
        self.store.insert_eta_request(&request).await?;
        if let Err(e) = self.sender.send(&mail).await {
            if let Err(db) = self.store.delete_eta_request(request.id).await {
                warn!(request = %request.id, error = %db, "Failed to withdraw unsent ETA request");
            }
            return Err(e.into());
        }

        let activity = Activity::new(
            ActivityType::EmailSent,
            json!({
                "summary": format!("ETA request for {} sent to {}", load.po_number, mail.to),
                "po_number": load.po_number,
                "recipient": mail.to,
                "subject": mail.subject,
            }),
        )
        .by_agent(agent_id)
        .for_site(Some(load.site_id.as_str()))
        .for_load(Some(load.id.as_str()));
        if let Err(e) = self.store.append_activity(&activity).await {
            warn!(po = %load.po_number, error = %e, "Failed to log ETA request");
        }

        if let Err(e) = self
            .knowledge
            .record(&KnowledgeEvent::from_eta_request(&request))
            .await
        {
            warn!(carrier = %carrier.id, error = %e, "Failed to record ETA request");
        }

        info!(po = %load.po_number, to = %mail.to, "ETA request sent");
        Ok(request)
    }
}
