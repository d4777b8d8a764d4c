//! Two-tier ETA extraction: model first, patterns as the fallback.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ExtractError;
use crate::ingest::patterns::{self, PatternParse};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, TokenUsage, extract_json_object};
use crate::logistics::ParseMethod;

/// Result of extracting one reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub po_number: Option<String>,
    pub eta: Option<DateTime<Utc>>,
    pub method: ParseMethod,
    pub message: String,
    pub usage: TokenUsage,
    pub cost: Decimal,
}

impl Extraction {
    /// A PO was found and an ETA resolved.
    pub fn success(&self) -> bool {
        self.po_number.is_some() && self.eta.is_some()
    }
}

/// What the model is asked to return.
#[derive(Debug, Deserialize)]
struct ModelAnswer {
    #[serde(default)]
    po_number: Option<String>,
    #[serde(default)]
    eta: Option<String>,
    #[serde(default)]
    note: Option<String>,
}

pub struct EtaExtractor {
    llm: Option<Arc<dyn LlmProvider>>,
    timeout: Duration,
}

impl EtaExtractor {
    pub fn new(llm: Option<Arc<dyn LlmProvider>>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Pattern tier only.
    pub fn patterns_only() -> Self {
        Self::new(None, Duration::ZERO)
    }

    /// Extract the PO and ETA from a cleaned reply.
    pub async fn extract(&self, subject: &str, body: &str, received_at: DateTime<Utc>) -> Extraction {
        let pattern = patterns::parse_reply(subject, body, received_at);

        let Some(llm) = &self.llm else {
            return fallback(pattern, body, None, TokenUsage::default(), Decimal::ZERO);
        };

        let (usage, answer) = self.ask_model(llm.as_ref(), subject, body, received_at).await;
        let cost = llm.estimate_cost(usage);
        match answer {
            Ok(answer) => {
                let po_number = answer
                    .po_number
                    .as_deref()
                    .and_then(|po| patterns::extract_po(po, ""))
                    .or(pattern.po_number);
                let eta = answer.eta.as_deref().and_then(parse_model_eta);
                let message = describe(&po_number, eta, answer.note.as_deref());
                debug!(po = ?po_number, ?eta, "Model extracted reply");
                Extraction {
                    po_number,
                    eta,
                    method: ParseMethod::Model,
                    message,
                    usage,
                    cost,
                }
            }
            Err(e) => {
                warn!(error = %e, "Model extraction failed, using patterns");
                fallback(pattern, body, Some(e.to_string()), usage, cost)
            }
        }
    }

    /// Tokens are reported even when the answer is unusable.
    async fn ask_model(
        &self,
        llm: &dyn LlmProvider,
        subject: &str,
        body: &str,
        received_at: DateTime<Utc>,
    ) -> (TokenUsage, Result<ModelAnswer, ExtractError>) {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_extraction_prompt()),
            ChatMessage::user(format!(
                "Received: {}\nSubject: {subject}\n\n{body}",
                received_at.format("%Y-%m-%dT%H:%M:%SZ (%A)")
            )),
        ])
        .with_temperature(0.0)
        .with_max_tokens(200);

        let response = match tokio::time::timeout(self.timeout, llm.complete(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return (TokenUsage::default(), Err(e.into())),
            Err(_) => {
                return (
                    TokenUsage::default(),
                    Err(ExtractError::Unavailable(format!("timed out after {:?}", self.timeout))),
                );
            }
        };
        let usage = response.usage();
        (usage, parse_answer(&response.content))
    }
}

fn parse_answer(content: &str) -> Result<ModelAnswer, ExtractError> {
    let json = extract_json_object(content);
    let answer: ModelAnswer = serde_json::from_str(&json)
        .map_err(|e| ExtractError::Unparsable(format!("JSON parse error: {e}")))?;

    if let Some(eta) = answer.eta.as_deref()
        && parse_model_eta(eta).is_none()
    {
        return Err(ExtractError::Unparsable(format!("bad eta: {eta}")));
    }
    Ok(answer)
}

fn fallback(
    pattern: PatternParse,
    body: &str,
    model_error: Option<String>,
    usage: TokenUsage,
    cost: Decimal,
) -> Extraction {
    let mut message = if pattern.vague {
        match &pattern.po_number {
            Some(_) => "vague reply, no ETA given".to_string(),
            None => "vague reply, no PO number found".to_string(),
        }
    } else {
        describe(&pattern.po_number, pattern.eta, None)
    };

    let succeeded = pattern.po_number.is_some() && pattern.eta.is_some();
    if !succeeded {
        let issues = patterns::issue_keywords(body);
        if !issues.is_empty() {
            message.push_str(&format!("; review: {}", issues.join(", ")));
        }
    }
    if let Some(err) = model_error {
        message.push_str(&format!(" (model unavailable: {err})"));
    }

    Extraction {
        po_number: pattern.po_number,
        eta: pattern.eta,
        method: ParseMethod::Pattern,
        message,
        usage,
        cost,
    }
}

fn describe(po_number: &Option<String>, eta: Option<DateTime<Utc>>, note: Option<&str>) -> String {
    let base = match (po_number, eta) {
        (Some(po), Some(eta)) => format!("ETA {} for {po}", eta.format("%Y-%m-%d %H:%M")),
        (Some(_), None) => "no ETA found".to_string(),
        (None, Some(_)) => "no PO number found".to_string(),
        (None, None) => "no PO number or ETA found".to_string(),
    };
    match note.filter(|n| !n.trim().is_empty()) {
        Some(note) => format!("{base}; {note}"),
        None => base,
    }
}

/// Accepts RFC 3339 or a naive `YYYY-MM-DDTHH:MM[:SS]` taken as UTC.
fn parse_model_eta(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn build_extraction_prompt() -> String {
    "You read carrier replies to fuel delivery ETA requests and extract the PO number \
     and the promised arrival time.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"po_number\": \"PO-YYYY-NNN\" or null, \"eta\": \"YYYY-MM-DDTHH:MM\" or null, \"note\": \"...\"}\n\n\
     Rules:\n\
     - Times are UTC and relative to the Received timestamp\n\
     - For a range, use the LATER time\n\
     - \"tomorrow\" means the day after Received\n\
     - A bare time at or before the Received time means the next day\n\
     - If the carrier is vague (\"running late\", \"not sure\"), eta is null\n\
     - Use note for anything a dispatcher must see (breakdown, shortage, cancellation)"
        .to_string()
}
