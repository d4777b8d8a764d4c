//! Escalation advisor: second opinion on ambiguous proposals.
//!
//! The advisor never fails a run. Timeouts, provider errors, malformed or
//! out-of-domain answers all come back as a dismissal with `failure` set so
//! the runner can log an observation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::error::AdvisorError;
use crate::knowledge::model::{CarrierReliability, RecentEvent, SiteRisk};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, TokenUsage, extract_json_object};
use crate::logistics::{Load, Priority, Site};
use crate::pipeline::rules::codes;
use crate::pipeline::types::{ActionKind, Plan, PlannedAction, ProposedAction, Tier};

const ADVISOR_TEMPERATURE: f32 = 0.1;
const ADVISOR_MAX_TOKENS: u32 = 400;
/// Knowledge-graph events listed per carrier and per site.
const RECENT_EVENTS_SHOWN: usize = 5;

/// Site risk at or above this confirms a proposal in the heuristic advisor.
const RISKY_SITE: f64 = 0.5;
/// False-alarm rate at or above this makes the heuristic advisor sceptical.
const NOISY_SITE: f64 = 0.5;

/// What the advisor decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Confirm {
        priority: Priority,
        description: String,
    },
    Dismiss {
        reason: String,
    },
    Modify {
        priority: Priority,
        description: String,
    },
}

/// Everything the advisor sees about one proposal.
#[derive(Debug, Clone)]
pub struct AdvisorContext {
    pub proposal: ProposedAction,
    pub site: Site,
    pub loads: Vec<Load>,
    pub carrier: Option<CarrierReliability>,
    pub site_risk: Option<SiteRisk>,
    /// One-line summaries, newest first.
    pub recent_activity: Vec<String>,
}

/// A decision plus what it cost.
#[derive(Debug, Clone)]
pub struct Advice {
    pub decision: Decision,
    pub usage: TokenUsage,
    pub cost: Decimal,
    /// Set when the decision is a fallback dismissal.
    pub failure: Option<String>,
}

impl Advice {
    fn free(decision: Decision) -> Self {
        Self {
            decision,
            usage: TokenUsage::default(),
            cost: Decimal::ZERO,
            failure: None,
        }
    }
}

/// Combine an ambiguous proposal with the advisor's decision.
pub fn settle(proposal: ProposedAction, decision: &Decision) -> Plan {
    let issue_type = match &proposal.kind {
        ActionKind::Escalate { issue_type, .. } => Some(*issue_type),
        _ => None,
    };
    let mut plan = Plan::from_rule(proposal);
    plan.tier = Tier::Advisor;

    match (decision, issue_type) {
        (Decision::Dismiss { reason }, _) => {
            plan.action = PlannedAction::Dismiss {
                reason: reason.clone(),
            };
        }
        (
            Decision::Confirm {
                priority,
                description,
            }
            | Decision::Modify {
                priority,
                description,
            },
            Some(issue_type),
        ) => {
            plan.action = PlannedAction::Escalate {
                issue_type,
                priority: *priority,
                description: description.clone(),
            };
        }
        // Non-escalation proposals keep their original action.
        (_, None) => {}
    }
    plan
}

#[async_trait]
pub trait Advisor: Send + Sync {
    fn name(&self) -> &str;

    async fn propose(&self, context: &AdvisorContext) -> Advice;
}

// ── LLM advisor ─────────────────────────────────────────────────────

pub struct LlmAdvisor {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl LlmAdvisor {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    async fn consult(&self, context: &AdvisorContext) -> (Result<Decision, AdvisorError>, TokenUsage) {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_advisor_system_prompt()),
            ChatMessage::user(build_advisor_user_prompt(context)),
        ])
        .with_temperature(ADVISOR_TEMPERATURE)
        .with_max_tokens(ADVISOR_MAX_TOKENS);

        let response = match tokio::time::timeout(self.timeout, self.llm.complete(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return (Err(AdvisorError::Llm(e)), TokenUsage::default()),
            Err(_) => return (Err(AdvisorError::Timeout(self.timeout)), TokenUsage::default()),
        };
        let usage = response.usage();
        (parse_advisor_response(&response.content), usage)
    }
}

#[async_trait]
impl Advisor for LlmAdvisor {
    fn name(&self) -> &str {
        self.llm.model_name()
    }

    async fn propose(&self, context: &AdvisorContext) -> Advice {
        let (result, usage) = self.consult(context).await;
        let cost = self.llm.estimate_cost(usage);

        match result {
            Ok(decision) => {
                debug!(
                    site = %context.site.id,
                    rule = context.proposal.rule,
                    ?decision,
                    tokens = usage.total(),
                    "Advisor decided"
                );
                Advice {
                    decision,
                    usage,
                    cost,
                    failure: None,
                }
            }
            Err(e) => {
                warn!(
                    site = %context.site.id,
                    rule = context.proposal.rule,
                    error = %e,
                    "Advisor failed, dismissing proposal"
                );
                Advice {
                    decision: Decision::Dismiss {
                        reason: format!("advisor unavailable: {e}"),
                    },
                    usage,
                    cost,
                    failure: Some(e.to_string()),
                }
            }
        }
    }
}

// ── Heuristic advisor ───────────────────────────────────────────────

/// Deterministic advisor used when no model is configured.
///
/// Confirms when the knowledge graph shows risk: a risky site, or a flagged
/// carrier at a site whose escalations are usually real.
pub struct HeuristicAdvisor;

#[async_trait]
impl Advisor for HeuristicAdvisor {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn propose(&self, context: &AdvisorContext) -> Advice {
        let risk = context.site_risk.as_ref();
        let risk_score = risk.map(|r| r.risk_score).unwrap_or(0.0);
        let false_alarm_rate = risk.map(|r| r.false_alarm_rate).unwrap_or(0.0);
        let carrier_flagged = context
            .carrier
            .as_ref()
            .is_some_and(|c| c.flagged_unreliable);

        let ActionKind::Escalate {
            priority,
            description,
            ..
        } = &context.proposal.kind
        else {
            return Advice::free(Decision::Dismiss {
                reason: "only escalations are reviewed".to_string(),
            });
        };

        let decision = if risk_score >= RISKY_SITE {
            Decision::Confirm {
                priority: *priority,
                description: format!("{description} (site risk {risk_score:.2})"),
            }
        } else if carrier_flagged && false_alarm_rate < NOISY_SITE {
            Decision::Confirm {
                priority: *priority,
                description: format!("{description} (carrier flagged unreliable)"),
            }
        } else {
            Decision::Dismiss {
                reason: format!(
                    "knowledge graph shows no elevated risk (site risk {risk_score:.2}, false alarms {:.0}%)",
                    false_alarm_rate * 100.0
                ),
            }
        };
        Advice::free(decision)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_advisor_system_prompt() -> String {
    "You review proposed escalations for a fuel delivery coordination team. \
     A rule flagged a possible problem but it is not clear-cut. Decide whether a human \
     coordinator should be alerted.\n\n\
     Decisions:\n\
     - \"confirm\": raise the escalation as proposed. Provide priority and description.\n\
     - \"modify\": raise it with a different priority or clearer description.\n\
     - \"dismiss\": not worth a human's attention right now. Provide reason.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"decision\": \"...\", \"priority\": \"LOW|MEDIUM|HIGH|CRITICAL\", \"description\": \"...\", \"reason\": \"...\"}\n\n\
     Rules:\n\
     - Sites with a high false-alarm rate deserve scepticism\n\
     - Carriers flagged unreliable deserve less benefit of the doubt\n\
     - Keep descriptions to one sentence a dispatcher can act on"
        .to_string()
}

fn build_advisor_user_prompt(ctx: &AdvisorContext) -> String {
    let mut prompt = String::with_capacity(1024);
    let site = &ctx.site;

    prompt.push_str(&format!("Proposal ({}): {}\n", ctx.proposal.rule, ctx.proposal.summary()));
    if ctx.proposal.rule == codes::CARRIER_CLUSTER {
        prompt.push_str("Reason: carrier has several late loads across the network\n");
    }

    prompt.push_str(&format!("\nSite: {} ({})\n", site.name, site.id));
    prompt.push_str(&format!(
        "Inventory: {:.0} / {:.0} gal, consuming {:.1} gal/h",
        site.current_inventory, site.tank_capacity, site.consumption_rate
    ));
    if let Some(hours) = site.hours_to_runout() {
        prompt.push_str(&format!(", runout in {hours:.1}h"));
    }
    prompt.push('\n');
    if let Some(notes) = site.notes.as_deref().filter(|n| !n.is_empty()) {
        prompt.push_str(&format!("Coordinator notes: {notes}\n"));
    }

    if !ctx.loads.is_empty() {
        prompt.push_str("\nLoads:\n");
        for load in &ctx.loads {
            let eta = load
                .current_eta
                .map(|e| e.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            prompt.push_str(&format!(
                "  {} {} via {} ETA {}\n",
                load.po_number, load.status, load.carrier_id, eta
            ));
        }
    }

    match &ctx.carrier {
        Some(c) => prompt.push_str(&format!(
            "\nCarrier {}: reliability {:.2}{}, {} deliveries, {} late, avg delay {:.1}h\n",
            c.carrier_id,
            c.reliability_score,
            if c.flagged_unreliable { " (flagged)" } else { "" },
            c.total_deliveries,
            c.late_deliveries,
            c.avg_delay_hours
        )),
        None => prompt.push_str("\nCarrier: no history\n"),
    }
    if let Some(c) = &ctx.carrier {
        push_recent_events(&mut prompt, &c.recent_events);
    }

    match &ctx.site_risk {
        Some(r) => prompt.push_str(&format!(
            "Site history: risk {:.2}, {} resolved escalations, false-alarm rate {:.0}%\n",
            r.risk_score,
            r.total_escalations,
            r.false_alarm_rate * 100.0
        )),
        None => prompt.push_str("Site history: none\n"),
    }
    if let Some(r) = &ctx.site_risk {
        push_recent_events(&mut prompt, &r.recent_events);
    }

    if !ctx.recent_activity.is_empty() {
        prompt.push_str("\nRecent activity:\n");
        for line in ctx.recent_activity.iter().take(8) {
            let preview: String = line.chars().take(200).collect();
            prompt.push_str(&format!("  {preview}\n"));
        }
    }

    prompt
}

/// Newest first, capped at `RECENT_EVENTS_SHOWN`.
fn push_recent_events(prompt: &mut String, events: &[RecentEvent]) {
    for event in events.iter().rev().take(RECENT_EVENTS_SHOWN) {
        prompt.push_str(&format!(
            "  {} {}\n",
            event.at.format("%Y-%m-%d %H:%M"),
            event.summary
        ));
    }
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct AdvisorResponse {
    decision: String,
    #[serde(default)]
    priority: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    reason: String,
}

fn parse_advisor_response(raw: &str) -> Result<Decision, AdvisorError> {
    let json_str = extract_json_object(raw);
    let response: AdvisorResponse = serde_json::from_str(&json_str)
        .map_err(|e| AdvisorError::Malformed(format!("JSON parse error: {e}")))?;

    let priority = || {
        response
            .priority
            .parse::<Priority>()
            .map_err(|_| AdvisorError::OutOfDomain {
                field: "priority".to_string(),
                value: response.priority.clone(),
            })
    };
    let description = || {
        if response.description.trim().is_empty() {
            Err(AdvisorError::Malformed("missing description".to_string()))
        } else {
            Ok(response.description.trim().to_string())
        }
    };

    match response.decision.trim().to_lowercase().as_str() {
        "confirm" => Ok(Decision::Confirm {
            priority: priority()?,
            description: description()?,
        }),
        "modify" => Ok(Decision::Modify {
            priority: priority()?,
            description: description()?,
        }),
        "dismiss" => Ok(Decision::Dismiss {
            reason: if response.reason.is_empty() {
                "dismissed by advisor".into()
            } else {
                response.reason.clone()
            },
        }),
        other => Err(AdvisorError::OutOfDomain {
            field: "decision".to_string(),
            value: other.to_string(),
        }),
    }
}
