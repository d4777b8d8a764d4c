//! Pattern extraction of PO numbers and ETAs from carrier replies.
//!
//! Ranges resolve to their later bound. Bare times resolve against the date
//! the reply was received; "tomorrow" adds a day, and a time at or before the
//! received time rolls to the next day.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use regex::{Captures, Regex};

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static pattern compiles")
}

static PO_NUMBER: LazyLock<Regex> = LazyLock::new(|| compile(r"(?i)\b(PO-\d{4}-\d{3})\b"));

static VAGUE: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r"\brunning\s+late\b|\bdelayed\b|\bnot\s+sure\b|\bdon'?t\s+know\b|\bunknown\b|\btbd\b|\bwill\s+advise\b",
    )
});

static TOMORROW: LazyLock<Regex> = LazyLock::new(|| compile(r"\btomorrow\b"));

/// "between 1400 and 1600", "1400-1600", "1400 to 1600"
static MILITARY_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"\b(?:between\s+)?(\d{3,4})\s*(?:-|to|and)\s*(\d{3,4})\b")
});

/// "2-4 pm", "1:00 pm - 3:30 pm", "between 4 and 7:45 am"
static CLOCK_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r"\b(?:between\s+)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\s*(?:-|to|and)\s*(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b",
    )
});

/// "3:30 pm"
static CLOCK_WITH_MINUTES: LazyLock<Regex> =
    LazyLock::new(|| compile(r"\b(\d{1,2}):(\d{2})\s*(am|pm)\b"));

/// "3 pm"
static CLOCK_HOUR: LazyLock<Regex> = LazyLock::new(|| compile(r"\b(\d{1,2})\s*(am|pm)\b"));

/// "March 3, 2026", "3 Mar 2026", "2026-03-03", "3/3/2026"
static CALENDAR_DATE: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r"\b(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2}(?:st|nd|rd|th)?,?\s+\d{4}\b|\b\d{1,2}(?:st|nd|rd|th)?\s+(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?,?\s+\d{4}\b|\b\d{4}-\d{1,2}-\d{1,2}\b|\b\d{1,2}/\d{1,2}/\d{2,4}\b",
    )
});

/// "1430", not part of a date or number run.
static MILITARY: LazyLock<Regex> = LazyLock::new(|| compile(r"(?:^|[^\d/\-:])([01]\d|2[0-3])([0-5]\d)\b"));

/// "14:30"
static TWENTY_FOUR_HOUR: LazyLock<Regex> =
    LazyLock::new(|| compile(r"\b([01]?\d|2[0-3]):([0-5]\d)\b"));

/// Phrases in an unparsed reply that a coordinator should see.
const ISSUE_KEYWORDS: &[&str] = &[
    "out of stock",
    "ran out",
    "shortage",
    "cannot deliver",
    "can't deliver",
    "truck broke",
    "breakdown",
    "cancelled",
    "canceled",
    "refuse",
    "accident",
];

/// What the pattern tier found in one reply.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternParse {
    pub po_number: Option<String>,
    pub eta: Option<DateTime<Utc>>,
    /// The reply explicitly declined to give a time.
    pub vague: bool,
}

/// First PO number in the subject, then the body, uppercased.
pub fn extract_po(subject: &str, body: &str) -> Option<String> {
    [subject, body]
        .iter()
        .find_map(|text| PO_NUMBER.captures(text))
        .map(|c| c[1].to_uppercase())
}

pub fn is_vague(text: &str) -> bool {
    VAGUE.is_match(&text.to_lowercase())
}

/// Issue keywords present in `text`, in list order.
pub fn issue_keywords(text: &str) -> Vec<&'static str> {
    let lower = text.to_lowercase();
    ISSUE_KEYWORDS
        .iter()
        .copied()
        .filter(|k| lower.contains(k))
        .collect()
}

fn to_24h(hour: u32, period: Option<&str>) -> Option<u32> {
    match period {
        Some("am") if hour == 12 => Some(0),
        Some("am") if hour <= 12 => Some(hour),
        Some("pm") if hour == 12 => Some(12),
        Some("pm") if hour < 12 => Some(hour + 12),
        None if hour < 24 => Some(hour),
        _ => None,
    }
}

fn minutes(caps: &Captures, idx: usize) -> u32 {
    caps.get(idx)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn military(digits: &str) -> Option<NaiveTime> {
    let value: u32 = digits.parse().ok()?;
    NaiveTime::from_hms_opt(value / 100, value % 100, 0)
}

/// Time of day named in `text`, taking the later bound of any range.
pub fn find_time(text: &str) -> Option<NaiveTime> {
    let text = PO_NUMBER.replace_all(&text.to_lowercase(), " ").into_owned();
    let text = CALENDAR_DATE.replace_all(&text, " ").into_owned();

    if let Some(c) = CLOCK_RANGE.captures(&text) {
        let end_hour: u32 = c[4].parse().ok()?;
        let hour = to_24h(end_hour, c.get(6).map(|m| m.as_str()))?;
        return NaiveTime::from_hms_opt(hour, minutes(&c, 5), 0);
    }
    if let Some(c) = MILITARY_RANGE.captures(&text)
        && military(&c[1]).is_some()
        && let Some(end) = military(&c[2])
    {
        return Some(end);
    }
    if let Some(c) = CLOCK_WITH_MINUTES.captures(&text) {
        let hour = to_24h(c[1].parse().ok()?, Some(&c[3]))?;
        return NaiveTime::from_hms_opt(hour, minutes(&c, 2), 0);
    }
    if let Some(c) = CLOCK_HOUR.captures(&text) {
        let hour = to_24h(c[1].parse().ok()?, Some(&c[2]))?;
        return NaiveTime::from_hms_opt(hour, 0, 0);
    }
    if let Some(c) = MILITARY.captures(&text) {
        return military(&format!("{}{}", &c[1], &c[2]));
    }
    if let Some(c) = TWENTY_FOUR_HOUR.captures(&text) {
        return NaiveTime::from_hms_opt(c[1].parse().ok()?, c[2].parse().ok()?, 0);
    }
    None
}

/// Anchor a time of day to the reply's received date.
pub fn resolve_time(time: NaiveTime, tomorrow: bool, received_at: DateTime<Utc>) -> DateTime<Utc> {
    let mut eta = received_at.date_naive().and_time(time).and_utc();
    if tomorrow {
        eta += Duration::days(1);
    } else if eta <= received_at {
        eta += Duration::days(1);
    }
    eta
}

pub fn mentions_tomorrow(text: &str) -> bool {
    TOMORROW.is_match(&text.to_lowercase())
}

/// Run the whole pattern tier over a cleaned reply.
pub fn parse_reply(subject: &str, body: &str, received_at: DateTime<Utc>) -> PatternParse {
    let po_number = extract_po(subject, body);

    if is_vague(body) {
        return PatternParse {
            po_number,
            eta: None,
            vague: true,
        };
    }

    let eta = find_time(body).map(|t| resolve_time(t, mentions_tomorrow(body), received_at));
    PatternParse {
        po_number,
        eta,
        vague: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap()
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0).unwrap()
    }

    fn hm(text: &str) -> Option<(u32, u32)> {
        find_time(text).map(|t| (t.hour(), t.minute()))
    }

    // ── PO numbers ──────────────────────────────────────────────────

    #[test]
    fn po_subject_first_and_uppercased() {
        assert_eq!(
            extract_po("RE: ETA Request - Load po-2026-001", "also PO-2026-002"),
            Some("PO-2026-001".into())
        );
        assert_eq!(
            extract_po("Re: your email", "Load PO-2026-002 at 1400"),
            Some("PO-2026-002".into())
        );
        assert_eq!(extract_po("hello", "no number here"), None);
        assert_eq!(extract_po("PO-26-1", ""), None);
    }

    // ── Times ───────────────────────────────────────────────────────

    #[test]
    fn ranges_take_later_bound() {
        assert_eq!(hm("between 1400 and 1600"), Some((16, 0)));
        assert_eq!(hm("we'll be there 2-4 pm"), Some((16, 0)));
        assert_eq!(hm("1:00 pm - 3:30 pm"), Some((15, 30)));
        assert_eq!(hm("between 4 and 7:45 am"), Some((7, 45)));
        assert_eq!(hm("10:00 am - 12:00 pm"), Some((12, 0)));
        assert_eq!(hm("between 900 and 1130"), Some((11, 30)));
    }

    #[test]
    fn single_times() {
        assert_eq!(hm("ETA 0600"), Some((6, 0)));
        assert_eq!(hm("arriving 1500"), Some((15, 0)));
        assert_eq!(hm("3:00 PM"), Some((15, 0)));
        assert_eq!(hm("10:30 am"), Some((10, 30)));
        assert_eq!(hm("by 3 pm"), Some((15, 0)));
        assert_eq!(hm("12 am"), Some((0, 0)));
        assert_eq!(hm("driver says 14:45"), Some((14, 45)));
    }

    #[test]
    fn po_digits_are_not_times() {
        assert_eq!(hm("Load PO-2026-001 confirmed"), None);
        assert_eq!(hm("PO-2026-001 arriving 1430"), Some((14, 30)));
    }

    #[test]
    fn years_are_not_times() {
        assert_eq!(hm("Arriving March 3, 2026 1400"), Some((14, 0)));
        assert_eq!(hm("3 Mar 2026 at 0930"), Some((9, 30)));
        assert_eq!(hm("ETA 2026-03-03 1430"), Some((14, 30)));
        assert_eq!(hm("Delivery on 3/3/2026 at 4 pm"), Some((16, 0)));
        assert_eq!(hm("see you March 3, 2026"), None);
    }

    #[test]
    fn no_time() {
        assert_eq!(hm("Thanks, will call"), None);
        assert_eq!(hm("2500"), None);
    }

    // ── Resolution ──────────────────────────────────────────────────

    #[test]
    fn range_resolves_same_day() {
        let p = parse_reply("RE: PO-2026-001", "between 1400 and 1600", received());
        assert_eq!(p.po_number.as_deref(), Some("PO-2026-001"));
        assert_eq!(p.eta, Some(at(2, 16, 0)));
        assert!(!p.vague);
    }

    #[test]
    fn past_time_rolls_to_next_day() {
        let p = parse_reply("RE: PO-2026-001", "0800", received());
        assert_eq!(p.eta, Some(at(3, 8, 0)));

        let same_minute = parse_reply("RE: PO-2026-001", "9:15 am", received());
        assert_eq!(same_minute.eta, Some(at(3, 9, 15)));
    }

    #[test]
    fn tomorrow_adds_a_day() {
        let p = parse_reply("RE: PO-2026-001", "Tomorrow at 1400", received());
        assert_eq!(p.eta, Some(at(3, 14, 0)));
        let early = parse_reply("RE: PO-2026-001", "tomorrow 0600", received());
        assert_eq!(early.eta, Some(at(3, 6, 0)));
    }

    #[test]
    fn vague_replies_have_no_eta() {
        for body in ["Running late, will update", "Not sure yet", "Delayed at terminal 1400"] {
            let p = parse_reply("RE: PO-2026-001", body, received());
            assert!(p.vague, "{body}");
            assert_eq!(p.eta, None);
        }
    }

    #[test]
    fn keywords_found() {
        assert_eq!(
            issue_keywords("Terminal is OUT OF STOCK, possible accident on I-95"),
            vec!["out of stock", "accident"]
        );
        assert!(issue_keywords("see you at 1400").is_empty());
    }
}
