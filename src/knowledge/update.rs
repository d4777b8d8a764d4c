//! The knowledge graph update function.
//!
//! `apply_carrier` and `apply_site` are the only code that changes record
//! statistics. Live updates call them on one stored record; `replay` folds a
//! full event history through them to rebuild every record from scratch.

use std::collections::HashMap;

use super::model::{
    CarrierReliability, KnowledgeEvent, NEUTRAL_SCORE, RECENT_EVENTS, RecentEvent, SiteRisk,
};
use crate::config::KnowledgeConfig;

/// Scoring constants derived from `KnowledgeConfig`.
#[derive(Debug, Clone, Copy)]
pub struct ScoringParams {
    pub recent_window: usize,
    pub recent_weight: f64,
    pub unreliable_below: f64,
}

impl From<&KnowledgeConfig> for ScoringParams {
    fn from(config: &KnowledgeConfig) -> Self {
        Self {
            recent_window: config.recent_window,
            recent_weight: config.recent_weight,
            unreliable_below: config.unreliable_below,
        }
    }
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self::from(&KnowledgeConfig::default())
    }
}

/// Weighted on-time fraction.
///
/// Each outcome in `recent` counts `recent_weight` times; older deliveries
/// (the remainder of `total`) count once.
pub fn reliability_score(total: u32, late: u32, recent: &[bool], recent_weight: f64) -> f64 {
    if total == 0 {
        return NEUTRAL_SCORE;
    }
    let total_f = f64::from(total);
    let recent_n = (recent.len() as f64).min(total_f);
    let recent_on_time = recent.iter().filter(|on_time| **on_time).count() as f64;
    let on_time_total = f64::from(total.saturating_sub(late));

    let older_n = total_f - recent_n;
    let older_on_time = (on_time_total - recent_on_time).clamp(0.0, older_n);

    let numerator = older_on_time + recent_weight * recent_on_time;
    let denominator = older_n + recent_weight * recent_n;
    if denominator <= 0.0 {
        return NEUTRAL_SCORE;
    }
    (numerator / denominator).clamp(0.0, 1.0)
}

/// `min(1, weighted / (deliveries + 1))`, scaled down by the false-alarm rate.
pub fn risk_score(weighted_escalations: f64, deliveries: u32, false_alarm_rate: f64) -> f64 {
    let raw = (weighted_escalations / (f64::from(deliveries) + 1.0)).min(1.0);
    (raw * (1.0 - false_alarm_rate)).clamp(0.0, 1.0)
}

fn push_recent(events: &mut Vec<RecentEvent>, event: &KnowledgeEvent, summary: String) {
    events.push(RecentEvent {
        at: event.occurred_at(),
        summary,
    });
    if events.len() > RECENT_EVENTS {
        let excess = events.len() - RECENT_EVENTS;
        events.drain(..excess);
    }
}

fn hours(delta: chrono::Duration) -> f64 {
    delta.num_seconds() as f64 / 3600.0
}

/// Fold one event into a carrier record. Events for other carriers are ignored.
pub fn apply_carrier(record: &mut CarrierReliability, event: &KnowledgeEvent, params: &ScoringParams) {
    if event.carrier_id() != Some(record.carrier_id.as_str()) {
        return;
    }

    match event {
        KnowledgeEvent::Delivered {
            po_number,
            eta,
            delivered_at,
            ..
        } => {
            record.total_deliveries += 1;
            let delay = eta
                .map(|eta| hours(*delivered_at - eta))
                .filter(|delay| *delay > 0.0);

            let summary = match delay {
                Some(delay) => {
                    record.late_deliveries += 1;
                    let n = f64::from(record.late_deliveries);
                    record.avg_delay_hours += (delay - record.avg_delay_hours) / n;
                    record.worst_delay_hours = record.worst_delay_hours.max(delay);
                    format!("{po_number} delivered {delay:.1}h late")
                }
                None => format!("{po_number} delivered on time"),
            };

            record.recent_outcomes.push(delay.is_none());
            if record.recent_outcomes.len() > params.recent_window {
                let excess = record.recent_outcomes.len() - params.recent_window;
                record.recent_outcomes.drain(..excess);
            }
            push_recent(&mut record.recent_events, event, summary);
        }
        KnowledgeEvent::EtaRequested { po_number, .. } => {
            record.eta_requests_sent += 1;
            push_recent(
                &mut record.recent_events,
                event,
                format!("ETA requested for {po_number}"),
            );
        }
        KnowledgeEvent::EtaResponded {
            po_number,
            latency_hours,
            ..
        } => {
            record.responses_received += 1;
            let n = f64::from(record.responses_received);
            record.avg_response_hours += (latency_hours - record.avg_response_hours) / n;
            push_recent(
                &mut record.recent_events,
                event,
                format!("{po_number} ETA reply after {latency_hours:.1}h"),
            );
        }
        KnowledgeEvent::EscalationResolved { .. } => return,
    }

    record.reliability_score = reliability_score(
        record.total_deliveries,
        record.late_deliveries,
        &record.recent_outcomes,
        params.recent_weight,
    );
    record.flagged_unreliable =
        record.total_deliveries > 0 && record.reliability_score < params.unreliable_below;
    record.updated_at = Some(event.occurred_at());
}

/// Fold one event into a site record. Events for other sites are ignored.
pub fn apply_site(record: &mut SiteRisk, event: &KnowledgeEvent) {
    if event.site_id() != Some(record.site_id.as_str()) {
        return;
    }

    match event {
        KnowledgeEvent::Delivered { po_number, .. } => {
            record.delivery_count += 1;
            push_recent(
                &mut record.recent_events,
                event,
                format!("{po_number} delivered"),
            );
        }
        KnowledgeEvent::EscalationResolved {
            priority,
            false_alarm,
            ..
        } => {
            record.total_escalations += 1;
            record.weighted_escalations += priority.weight();
            if *false_alarm {
                record.false_alarms += 1;
            }
            let label = if *false_alarm { "false alarm" } else { "confirmed" };
            push_recent(
                &mut record.recent_events,
                event,
                format!("{priority} escalation resolved ({label})"),
            );
        }
        _ => return,
    }

    record.false_alarm_rate = if record.total_escalations > 0 {
        f64::from(record.false_alarms) / f64::from(record.total_escalations)
    } else {
        0.0
    };
    record.risk_score = risk_score(
        record.weighted_escalations,
        record.delivery_count,
        record.false_alarm_rate,
    );
    record.updated_at = Some(event.occurred_at());
}

/// All records produced by a replay.
#[derive(Debug, Default, Clone)]
pub struct KnowledgeState {
    pub carriers: HashMap<String, CarrierReliability>,
    pub sites: HashMap<String, SiteRisk>,
}

impl KnowledgeState {
    /// Apply one event, creating records for keys seen for the first time.
    pub fn apply(&mut self, event: &KnowledgeEvent, params: &ScoringParams) {
        if let Some(id) = event.carrier_id() {
            let record = self
                .carriers
                .entry(id.to_string())
                .or_insert_with(|| CarrierReliability::new(id));
            apply_carrier(record, event, params);
        }
        if let Some(id) = event.site_id() {
            let record = self
                .sites
                .entry(id.to_string())
                .or_insert_with(|| SiteRisk::new(id));
            apply_site(record, event);
        }
    }
}

/// Rebuild every record by folding `events` in time order.
pub fn replay(mut events: Vec<KnowledgeEvent>, params: &ScoringParams) -> KnowledgeState {
    events.sort_by(|a, b| {
        a.occurred_at()
            .cmp(&b.occurred_at())
            .then_with(|| a.tie_break().cmp(&b.tie_break()))
    });
    let mut state = KnowledgeState::default();
    for event in &events {
        state.apply(event, params);
    }
    state
}
