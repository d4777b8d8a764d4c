//! Domain records for fuel logistics.

pub mod activity;
pub mod escalation;
pub mod inbound;
pub mod model;

pub use activity::{Activity, ActivityType};
pub use escalation::{Escalation, EscalationStatus, IssueType, Priority};
pub use inbound::{EtaRequest, InboundEmail, ParseMethod};
pub use model::{Carrier, Load, LoadStatus, Site};
