//! Inbound carrier emails and outbound ETA requests.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which extraction tier produced an inbound record's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMethod {
    Model,
    Pattern,
}

impl fmt::Display for ParseMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParseMethod::Model => "model",
            ParseMethod::Pattern => "pattern",
        })
    }
}

impl FromStr for ParseMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(ParseMethod::Model),
            "pattern" => Ok(ParseMethod::Pattern),
            other => Err(format!("unknown parse method: {other}")),
        }
    }
}

/// An email read from the carrier mailbox. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEmail {
    pub id: Uuid,
    /// Mailbox-side identifier (Message-ID header or UID).
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub po_number: Option<String>,
    pub eta: Option<DateTime<Utc>>,
    pub load_id: Option<String>,
    pub carrier_id: Option<String>,
    pub parse_method: ParseMethod,
    pub parse_success: bool,
    pub parse_message: String,
    /// Hours between our last ETA request for this PO and this reply.
    pub response_latency_hours: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// An ETA request email that went out to a carrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtaRequest {
    pub id: Uuid,
    pub load_id: String,
    pub carrier_id: String,
    pub po_number: String,
    pub recipient: String,
    /// `None` when triggered by an operator.
    pub agent_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}
