//! Sites, loads, and carriers: the externally-owned snapshots the engine reads.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A fuel carrier and where to reach its dispatch desk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Carrier {
    pub id: String,
    pub name: String,
    pub dispatcher_email: String,
}

/// A customer site with a monitored tank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    /// Gallons currently in the tank.
    pub current_inventory: f64,
    pub tank_capacity: f64,
    /// Gallons per hour.
    pub consumption_rate: f64,
    /// Upper bound of the "watch" band: sites closer to runout than this are reviewed.
    pub runout_threshold_hours: f64,
    pub min_delivery_quantity: f64,
    pub agent_id: Option<String>,
    pub active: bool,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Site {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            current_inventory: 0.0,
            tank_capacity: 0.0,
            consumption_rate: 0.0,
            runout_threshold_hours: 48.0,
            min_delivery_quantity: 0.0,
            agent_id: None,
            active: true,
            notes: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_inventory(mut self, current: f64, capacity: f64, rate_per_hour: f64) -> Self {
        self.current_inventory = current;
        self.tank_capacity = capacity;
        self.consumption_rate = rate_per_hour;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Hours until the tank is empty at the current rate.
    ///
    /// `None` when the site is not consuming (rate ≤ 0), which means "not at risk".
    pub fn hours_to_runout(&self) -> Option<f64> {
        if self.consumption_rate <= 0.0 {
            None
        } else {
            Some(self.current_inventory / self.consumption_rate)
        }
    }
}

/// Lifecycle of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadStatus {
    Scheduled,
    InTransit,
    Delayed,
    Delivered,
    Cancelled,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Scheduled => "scheduled",
            LoadStatus::InTransit => "in_transit",
            LoadStatus::Delayed => "delayed",
            LoadStatus::Delivered => "delivered",
            LoadStatus::Cancelled => "cancelled",
        }
    }

    /// Still expected at the site: counts as cover. A delayed load is late,
    /// not lost.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            LoadStatus::Scheduled | LoadStatus::InTransit | LoadStatus::Delayed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadStatus::Delivered | LoadStatus::Cancelled)
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scheduled" => Ok(LoadStatus::Scheduled),
            "in_transit" => Ok(LoadStatus::InTransit),
            "delayed" => Ok(LoadStatus::Delayed),
            "delivered" => Ok(LoadStatus::Delivered),
            "cancelled" | "canceled" => Ok(LoadStatus::Cancelled),
            other => Err(format!("unknown load status: {other}")),
        }
    }
}

/// A shipment of fuel to one site by one carrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Load {
    pub id: String,
    pub po_number: String,
    pub status: LoadStatus,
    pub site_id: String,
    pub carrier_id: String,
    pub current_eta: Option<DateTime<Utc>>,
    pub last_eta_update: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Load {
    pub fn new(
        id: impl Into<String>,
        po_number: impl Into<String>,
        site_id: impl Into<String>,
        carrier_id: impl Into<String>,
        status: LoadStatus,
    ) -> Self {
        Self {
            id: id.into(),
            po_number: po_number.into(),
            status,
            site_id: site_id.into(),
            carrier_id: carrier_id.into(),
            current_eta: None,
            last_eta_update: None,
            created_at: Utc::now(),
            shipped_at: None,
            delivered_at: None,
        }
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>, updated: DateTime<Utc>) -> Self {
        self.current_eta = Some(eta);
        self.last_eta_update = Some(updated);
        self
    }

    /// Delayed, or still en route with an ETA already in the past.
    pub fn is_late(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            LoadStatus::Delayed => true,
            s if s.is_active() => self.current_eta.is_some_and(|eta| eta < now),
            _ => false,
        }
    }

    /// Whether the ETA needs refreshing.
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if self.status == LoadStatus::Delayed || self.current_eta.is_none() {
            return true;
        }
        match self.last_eta_update {
            Some(updated) => now - updated > window,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hours_to_runout_divides_inventory_by_rate() {
        let site = Site::new("s1", "Depot").with_inventory(1200.0, 8000.0, 100.0);
        assert_eq!(site.hours_to_runout(), Some(12.0));
    }

    #[test]
    fn zero_consumption_is_never_at_risk() {
        let site = Site::new("s1", "Depot").with_inventory(10.0, 8000.0, 0.0);
        assert_eq!(site.hours_to_runout(), None);
        let negative = Site::new("s2", "Odd").with_inventory(10.0, 8000.0, -3.0);
        assert_eq!(negative.hours_to_runout(), None);
    }

    #[test]
    fn load_status_roundtrip() {
        for status in [
            LoadStatus::Scheduled,
            LoadStatus::InTransit,
            LoadStatus::Delayed,
            LoadStatus::Delivered,
            LoadStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<LoadStatus>().unwrap(), status);
        }
        assert!("lost".parse::<LoadStatus>().is_err());
    }

    #[test]
    fn staleness_rules() {
        let now = Utc::now();
        let window = Duration::hours(4);

        let fresh = Load::new("l1", "PO-2024-001", "s1", "c1", LoadStatus::InTransit)
            .with_eta(now + Duration::hours(3), now - Duration::hours(1));
        assert!(!fresh.is_stale(now, window));

        let old = fresh.clone().with_eta(now + Duration::hours(3), now - Duration::hours(5));
        assert!(old.is_stale(now, window));

        let no_eta = Load::new("l2", "PO-2024-002", "s1", "c1", LoadStatus::Scheduled);
        assert!(no_eta.is_stale(now, window));

        let mut delayed = fresh.clone();
        delayed.status = LoadStatus::Delayed;
        assert!(delayed.is_stale(now, window));

        let mut delivered = no_eta.clone();
        delivered.status = LoadStatus::Delivered;
        assert!(!delivered.is_stale(now, window));
    }

    #[test]
    fn late_means_delayed_or_past_eta() {
        let now = Utc::now();
        let on_time = Load::new("l1", "PO-2024-001", "s1", "c1", LoadStatus::InTransit)
            .with_eta(now + Duration::hours(1), now);
        assert!(!on_time.is_late(now));

        let overdue = on_time.clone().with_eta(now - Duration::hours(1), now);
        assert!(overdue.is_late(now));

        let mut delayed = on_time.clone();
        delayed.status = LoadStatus::Delayed;
        assert!(delayed.is_late(now));
    }
}
