//! Mail types: parsed inbound messages, outbound mail, body cleaning.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};

use crate::logistics::{Carrier, Load, Site};

/// An inbound message fetched from the mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    /// Mailbox-local identifier used for mark-read.
    pub uid: String,
    /// `Message-ID` header, or a generated id when absent.
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    /// Readable text, uncleaned.
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl MailMessage {
    /// Parse an RFC 822 message. Returns `None` when it cannot be parsed at all.
    pub fn parse(uid: &str, raw: &[u8]) -> Option<Self> {
        let parsed = MessageParser::default().parse(raw)?;

        let sender = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into());
        let subject = parsed.subject().unwrap_or("(no subject)").to_string();
        let message_id = parsed
            .message_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("uid-{uid}"));
        let received_at = parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            .unwrap_or_else(Utc::now);

        Some(Self {
            uid: uid.to_string(),
            message_id,
            sender,
            subject,
            body: extract_text(&parsed),
            received_at,
        })
    }
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

/// An outbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl OutgoingMail {
    /// ETA request to a carrier's dispatcher for one load.
    pub fn eta_request(load: &Load, site: &Site, carrier: &Carrier) -> Self {
        let current_eta = load
            .current_eta
            .map(|eta| eta.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "Not provided".to_string());

        let body = format!(
            "Dear {carrier} Dispatch,\n\
             \n\
             We are requesting an updated ETA for the following load:\n\
             \n\
             PO Number: {po}\n\
             Destination: {site_name} ({site_id})\n\
             Current ETA: {current_eta}\n\
             \n\
             Please reply to this email with the updated ETA in one of these formats:\n\
             - Military time (e.g. \"1430\")\n\
             - 12-hour format (e.g. \"2:30 PM\")\n\
             - Time range (e.g. \"between 1400 and 1600\")\n\
             \n\
             Please keep the PO number in the subject line.\n\
             \n\
             Thank you,\n\
             Fuel Logistics Coordination",
            carrier = carrier.name,
            po = load.po_number,
            site_name = site.name,
            site_id = site.id,
        );

        Self {
            to: carrier.dispatcher_email.clone(),
            subject: format!("ETA Request - Load {}", load.po_number),
            body,
        }
    }
}

// ── Body cleaning ───────────────────────────────────────────────────

/// Strip quoted replies and signatures before extraction.
pub fn clean_body(body: &str) -> String {
    strip_signature(&strip_quoted_text(body))
}

/// Strip quoted text from an email body.
///
/// Removes:
/// - Lines starting with `>` (quoted reply lines)
/// - "On ... wrote:" attribution lines and everything after
/// - "--- Original Message ---" separators and everything after
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }

        // "On Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:"
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }

        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }

        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}

/// Cut the body at the first signature marker.
pub fn strip_signature(body: &str) -> String {
    let mut result = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed == "--"
            || trimmed.starts_with("Sent from my ")
            || trimmed.starts_with("Get Outlook for")
        {
            break;
        }
        result.push(line);
    }
    result.join("\n").trim().to_string()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logistics::LoadStatus;
    use chrono::TimeZone;

    // ── Cleaning ────────────────────────────────────────────────────

    #[test]
    fn strip_quoted_lines_and_attribution() {
        let body = "ETA 1430\n> When will you arrive?\n\nOn Mon, Mar 2, 2026 at 9:00 AM Dispatch <d@x.com> wrote:\n> PO-2026-001";
        assert_eq!(strip_quoted_text(body), "ETA 1430");
    }

    #[test]
    fn strip_original_message_separator() {
        let body = "Tomorrow 0600\n\n--- Original Message ---\nbetween 1400 and 1600";
        assert_eq!(strip_quoted_text(body), "Tomorrow 0600");
    }

    #[test]
    fn strip_signature_markers() {
        assert_eq!(strip_signature("Arriving 3 PM\n--\nBob\n555-0100"), "Arriving 3 PM");
        assert_eq!(strip_signature("Arriving 3 PM\n-- \nBob"), "Arriving 3 PM");
        assert_eq!(strip_signature("1500\n\nSent from my iPhone"), "1500");
        assert_eq!(strip_signature("1500\nGet Outlook for iOS"), "1500");
    }

    #[test]
    fn clean_body_removes_both() {
        let body = "Should be there by 1600\n\nSent from my iPhone\n\n> between 1000 and 1200";
        assert_eq!(clean_body(body), "Should be there by 1600");
    }

    #[test]
    fn strip_html_keeps_words_apart() {
        assert_eq!(strip_html("<p>ETA</p><p>1430</p>"), "ETA 1430");
        assert_eq!(strip_html("No HTML here"), "No HTML here");
    }

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_plain_message() {
        let raw = b"From: Dispatch <dispatch@carrier.com>\r\n\
            To: coordinator@fuel.com\r\n\
            Subject: RE: ETA Request - Load PO-2026-001\r\n\
            Message-ID: <abc@carrier.com>\r\n\
            Date: Mon, 2 Mar 2026 10:00:00 +0000\r\n\
            \r\n\
            between 1400 and 1600\r\n";
        let msg = MailMessage::parse("7", raw).unwrap();
        assert_eq!(msg.uid, "7");
        assert_eq!(msg.sender, "dispatch@carrier.com");
        assert_eq!(msg.message_id, "abc@carrier.com");
        assert_eq!(msg.subject, "RE: ETA Request - Load PO-2026-001");
        assert!(msg.body.contains("between 1400 and 1600"));
        assert_eq!(
            msg.received_at,
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn parse_without_message_id_uses_uid() {
        let raw = b"From: a@b.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let msg = MailMessage::parse("42", raw).unwrap();
        assert_eq!(msg.message_id, "uid-42");
    }

    // ── Composition ─────────────────────────────────────────────────

    #[test]
    fn eta_request_mail() {
        let site = Site::new("s1", "North Depot");
        let carrier = Carrier {
            id: "c1".into(),
            name: "Acme Haulage".into(),
            dispatcher_email: "dispatch@acme.com".into(),
        };
        let load = Load::new("l1", "PO-2026-001", "s1", "c1", LoadStatus::InTransit);

        let mail = OutgoingMail::eta_request(&load, &site, &carrier);
        assert_eq!(mail.to, "dispatch@acme.com");
        assert_eq!(mail.subject, "ETA Request - Load PO-2026-001");
        assert!(mail.body.contains("Dear Acme Haulage Dispatch"));
        assert!(mail.body.contains("North Depot (s1)"));
        assert!(mail.body.contains("Current ETA: Not provided"));
        assert!(mail.body.contains("between 1400 and 1600"));
    }
}
