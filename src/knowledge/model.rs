//! Knowledge graph records and the outcome events that drive them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::logistics::{Escalation, EtaRequest, InboundEmail, Load, LoadStatus, Priority};

/// Score given to a carrier with no delivery history.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// How many human-readable event summaries each record keeps.
pub const RECENT_EVENTS: usize = 10;

/// A short, timestamped description of something that changed a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentEvent {
    pub at: DateTime<Utc>,
    pub summary: String,
}

/// Accumulated delivery and responsiveness statistics for one carrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarrierReliability {
    pub carrier_id: String,
    pub total_deliveries: u32,
    pub late_deliveries: u32,
    /// Mean delay over late deliveries only.
    pub avg_delay_hours: f64,
    pub worst_delay_hours: f64,
    /// On-time flags for the most recent deliveries, oldest first.
    pub recent_outcomes: Vec<bool>,
    pub reliability_score: f64,
    pub flagged_unreliable: bool,
    pub eta_requests_sent: u32,
    pub responses_received: u32,
    pub avg_response_hours: f64,
    pub recent_events: Vec<RecentEvent>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token, bumped by every stored write.
    #[serde(skip)]
    pub version: i64,
}

impl CarrierReliability {
    pub fn new(carrier_id: impl Into<String>) -> Self {
        Self {
            carrier_id: carrier_id.into(),
            total_deliveries: 0,
            late_deliveries: 0,
            avg_delay_hours: 0.0,
            worst_delay_hours: 0.0,
            recent_outcomes: Vec::new(),
            reliability_score: NEUTRAL_SCORE,
            flagged_unreliable: false,
            eta_requests_sent: 0,
            responses_received: 0,
            avg_response_hours: 0.0,
            recent_events: Vec::new(),
            updated_at: None,
            version: 0,
        }
    }

    pub fn on_time_rate(&self) -> Option<f64> {
        (self.total_deliveries > 0).then(|| {
            f64::from(self.total_deliveries - self.late_deliveries)
                / f64::from(self.total_deliveries)
        })
    }

    pub fn response_rate(&self) -> Option<f64> {
        (self.eta_requests_sent > 0)
            .then(|| (f64::from(self.responses_received) / f64::from(self.eta_requests_sent)).min(1.0))
    }
}

/// Accumulated escalation and delivery statistics for one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRisk {
    pub site_id: String,
    /// Resolved escalations counted so far.
    pub total_escalations: u32,
    /// Sum of priority weights over resolved escalations.
    pub weighted_escalations: f64,
    pub false_alarms: u32,
    pub delivery_count: u32,
    pub false_alarm_rate: f64,
    pub risk_score: f64,
    pub recent_events: Vec<RecentEvent>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub version: i64,
}

impl SiteRisk {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            total_escalations: 0,
            weighted_escalations: 0.0,
            false_alarms: 0,
            delivery_count: 0,
            false_alarm_rate: 0.0,
            risk_score: 0.0,
            recent_events: Vec::new(),
            updated_at: None,
            version: 0,
        }
    }
}

/// An outcome that changes knowledge graph statistics.
///
/// Built from source records by the `from_*` constructors, which both the
/// live path and rebuild use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnowledgeEvent {
    Delivered {
        carrier_id: String,
        site_id: String,
        po_number: String,
        eta: Option<DateTime<Utc>>,
        delivered_at: DateTime<Utc>,
    },
    EtaRequested {
        carrier_id: String,
        po_number: String,
        at: DateTime<Utc>,
    },
    EtaResponded {
        carrier_id: String,
        po_number: String,
        latency_hours: f64,
        at: DateTime<Utc>,
    },
    EscalationResolved {
        site_id: String,
        priority: Priority,
        false_alarm: bool,
        at: DateTime<Utc>,
    },
}

impl KnowledgeEvent {
    /// A delivered load. `None` unless the load is DELIVERED with a timestamp.
    pub fn from_delivered_load(load: &Load) -> Option<Self> {
        if load.status != LoadStatus::Delivered {
            return None;
        }
        Some(KnowledgeEvent::Delivered {
            carrier_id: load.carrier_id.clone(),
            site_id: load.site_id.clone(),
            po_number: load.po_number.clone(),
            eta: load.current_eta,
            delivered_at: load.delivered_at?,
        })
    }

    /// A resolved, site-scoped escalation.
    pub fn from_resolved_escalation(escalation: &Escalation) -> Option<Self> {
        if escalation.is_open() {
            return None;
        }
        Some(KnowledgeEvent::EscalationResolved {
            site_id: escalation.site_id.clone()?,
            priority: escalation.priority,
            false_alarm: escalation.false_alarm,
            at: escalation.resolved_at?,
        })
    }

    pub fn from_eta_request(request: &EtaRequest) -> Self {
        KnowledgeEvent::EtaRequested {
            carrier_id: request.carrier_id.clone(),
            po_number: request.po_number.clone(),
            at: request.sent_at,
        }
    }

    /// A carrier reply that answered one of our requests.
    pub fn from_inbound(email: &InboundEmail) -> Option<Self> {
        if !email.parse_success {
            return None;
        }
        Some(KnowledgeEvent::EtaResponded {
            carrier_id: email.carrier_id.clone()?,
            po_number: email.po_number.clone()?,
            latency_hours: email.response_latency_hours?,
            at: email.received_at,
        })
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            KnowledgeEvent::Delivered { delivered_at, .. } => *delivered_at,
            KnowledgeEvent::EtaRequested { at, .. }
            | KnowledgeEvent::EtaResponded { at, .. }
            | KnowledgeEvent::EscalationResolved { at, .. } => *at,
        }
    }

    pub fn carrier_id(&self) -> Option<&str> {
        match self {
            KnowledgeEvent::Delivered { carrier_id, .. }
            | KnowledgeEvent::EtaRequested { carrier_id, .. }
            | KnowledgeEvent::EtaResponded { carrier_id, .. } => Some(carrier_id),
            KnowledgeEvent::EscalationResolved { .. } => None,
        }
    }

    pub fn site_id(&self) -> Option<&str> {
        match self {
            KnowledgeEvent::Delivered { site_id, .. }
            | KnowledgeEvent::EscalationResolved { site_id, .. } => Some(site_id),
            _ => None,
        }
    }

    /// Secondary ordering for events sharing a timestamp.
    pub(crate) fn tie_break(&self) -> (u8, &str) {
        match self {
            KnowledgeEvent::EtaRequested { po_number, .. } => (0, po_number),
            KnowledgeEvent::EtaResponded { po_number, .. } => (1, po_number),
            KnowledgeEvent::Delivered { po_number, .. } => (2, po_number),
            KnowledgeEvent::EscalationResolved { site_id, .. } => (3, site_id),
        }
    }
}
