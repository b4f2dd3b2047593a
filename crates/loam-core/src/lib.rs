//! Core domain model for LOAM: the prospect record, its lifecycle, and the
//! parsing rules for values stored as untyped text cells.

use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "loam-core";

/// Canonical write format for lifecycle timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Column names as they appear in the store header.
pub mod col {
    pub const NAME: &str = "name";
    pub const WEBSITE: &str = "website";
    pub const CONTACT_EMAILS: &str = "contact_emails";
    pub const TITLES: &str = "titles";
    pub const REVIEWS_RAW: &str = "reviews_raw";
    pub const CONTENT_ANALYSIS_RAW: &str = "content_analysis_raw";
    pub const ICEBREAKER: &str = "icebreaker";
    pub const IDENTIFIED_PAINS: &str = "identified_pains";
    pub const PROPOSED_SOLUTIONS: &str = "proposed_solutions";
    pub const EVIDENCE: &str = "evidence";
    pub const SUBJECT: &str = "subject";
    pub const BODY: &str = "body";
    pub const SENT_DATE: &str = "sent_date";
    pub const LAST_CONTACT_DATE: &str = "last_contact_date";
    pub const EMAIL_STATUS: &str = "email_status";
    pub const TERMINATION_REASON: &str = "termination_reason";
    pub const FOLLOW_UP_1_SENT_DATE: &str = "follow_up_1_sent_date";
    pub const FOLLOW_UP_2_SENT_DATE: &str = "follow_up_2_sent_date";
    pub const FOLLOW_UP_3_SENT_DATE: &str = "follow_up_3_sent_date";
}

/// Every column a well-formed tracking sheet carries, in canonical order.
pub const TRACKING_COLUMNS: &[&str] = &[
    col::NAME,
    col::WEBSITE,
    col::CONTACT_EMAILS,
    col::TITLES,
    col::REVIEWS_RAW,
    col::CONTENT_ANALYSIS_RAW,
    col::ICEBREAKER,
    col::IDENTIFIED_PAINS,
    col::PROPOSED_SOLUTIONS,
    col::EVIDENCE,
    col::SUBJECT,
    col::BODY,
    col::SENT_DATE,
    col::LAST_CONTACT_DATE,
    col::EMAIL_STATUS,
    col::TERMINATION_REASON,
    col::FOLLOW_UP_1_SENT_DATE,
    col::FOLLOW_UP_2_SENT_DATE,
    col::FOLLOW_UP_3_SENT_DATE,
];

/// The three follow-up date columns, in sequence order.
pub const FOLLOW_UP_COLUMNS: &[&str] = &[
    col::FOLLOW_UP_1_SENT_DATE,
    col::FOLLOW_UP_2_SENT_DATE,
    col::FOLLOW_UP_3_SENT_DATE,
];

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("valid email regex")
    })
}

/// One row of the tracking store. All fields are kept as stored text; typed
/// views (timestamps, lists, status) are parsed on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prospect {
    pub name: String,
    pub website: String,
    pub contact_emails: String,
    pub titles: String,
    pub reviews_raw: String,
    pub content_analysis_raw: String,
    pub icebreaker: String,
    pub identified_pains: String,
    pub proposed_solutions: String,
    pub evidence: String,
    pub subject: String,
    pub body: String,
    pub sent_date: String,
    pub last_contact_date: String,
    pub email_status: String,
    pub termination_reason: String,
    pub follow_up_1_sent_date: String,
    pub follow_up_2_sent_date: String,
    pub follow_up_3_sent_date: String,
}

impl Prospect {
    /// Read a field by store column name.
    pub fn get(&self, column: &str) -> Option<&str> {
        let value = match column {
            col::NAME => &self.name,
            col::WEBSITE => &self.website,
            col::CONTACT_EMAILS => &self.contact_emails,
            col::TITLES => &self.titles,
            col::REVIEWS_RAW => &self.reviews_raw,
            col::CONTENT_ANALYSIS_RAW => &self.content_analysis_raw,
            col::ICEBREAKER => &self.icebreaker,
            col::IDENTIFIED_PAINS => &self.identified_pains,
            col::PROPOSED_SOLUTIONS => &self.proposed_solutions,
            col::EVIDENCE => &self.evidence,
            col::SUBJECT => &self.subject,
            col::BODY => &self.body,
            col::SENT_DATE => &self.sent_date,
            col::LAST_CONTACT_DATE => &self.last_contact_date,
            col::EMAIL_STATUS => &self.email_status,
            col::TERMINATION_REASON => &self.termination_reason,
            col::FOLLOW_UP_1_SENT_DATE => &self.follow_up_1_sent_date,
            col::FOLLOW_UP_2_SENT_DATE => &self.follow_up_2_sent_date,
            col::FOLLOW_UP_3_SENT_DATE => &self.follow_up_3_sent_date,
            _ => return None,
        };
        Some(value.as_str())
    }

    /// Write a field by store column name. Returns false for columns the
    /// record does not track (the caller drops those silently).
    pub fn set(&mut self, column: &str, value: String) -> bool {
        let slot = match column {
            col::NAME => &mut self.name,
            col::WEBSITE => &mut self.website,
            col::CONTACT_EMAILS => &mut self.contact_emails,
            col::TITLES => &mut self.titles,
            col::REVIEWS_RAW => &mut self.reviews_raw,
            col::CONTENT_ANALYSIS_RAW => &mut self.content_analysis_raw,
            col::ICEBREAKER => &mut self.icebreaker,
            col::IDENTIFIED_PAINS => &mut self.identified_pains,
            col::PROPOSED_SOLUTIONS => &mut self.proposed_solutions,
            col::EVIDENCE => &mut self.evidence,
            col::SUBJECT => &mut self.subject,
            col::BODY => &mut self.body,
            col::SENT_DATE => &mut self.sent_date,
            col::LAST_CONTACT_DATE => &mut self.last_contact_date,
            col::EMAIL_STATUS => &mut self.email_status,
            col::TERMINATION_REASON => &mut self.termination_reason,
            col::FOLLOW_UP_1_SENT_DATE => &mut self.follow_up_1_sent_date,
            col::FOLLOW_UP_2_SENT_DATE => &mut self.follow_up_2_sent_date,
            col::FOLLOW_UP_3_SENT_DATE => &mut self.follow_up_3_sent_date,
            _ => return false,
        };
        *slot = value;
        true
    }

    /// Build a record from a header row and a data row. Short rows are padded
    /// with empty cells and long rows truncated; unknown header columns are
    /// ignored.
    pub fn from_row(header: &[String], cells: &[String]) -> Self {
        let mut prospect = Prospect::default();
        for (index, column) in header.iter().enumerate() {
            let cell = cells.get(index).map(String::as_str).unwrap_or("");
            prospect.set(column, cell.to_string());
        }
        prospect
    }

    /// Project the record onto a header order. Columns the record does not
    /// track come out empty.
    pub fn to_row(&self, header: &[String]) -> Vec<String> {
        header
            .iter()
            .map(|column| self.get(column).unwrap_or("").to_string())
            .collect()
    }

    /// Primary key for store lookups.
    pub fn key(&self) -> String {
        normalize_website_key(&self.website)
    }

    pub fn status(&self) -> EmailStatus {
        EmailStatus::parse(&self.email_status)
    }

    /// First usable recipient address from the stored contact list.
    pub fn primary_email(&self) -> Option<String> {
        first_email(&self.contact_emails)
    }

    /// Lifecycle timestamps in sequence order: initial send, then the three
    /// follow-ups. Malformed cells parse to `None`.
    pub fn lifecycle_timestamps(&self) -> [Option<NaiveDateTime>; 4] {
        [
            parse_timestamp(&self.sent_date),
            parse_timestamp(&self.follow_up_1_sent_date),
            parse_timestamp(&self.follow_up_2_sent_date),
            parse_timestamp(&self.follow_up_3_sent_date),
        ]
    }

    /// Most recent lifecycle timestamp, the value `last_contact_date` must
    /// always equal.
    pub fn latest_contact(&self) -> Option<NaiveDateTime> {
        self.lifecycle_timestamps().into_iter().flatten().max()
    }

    pub fn stage(&self) -> LifecycleStage {
        if self.status() == EmailStatus::Bounced {
            return LifecycleStage::Bounced;
        }
        let [sent, fu1, fu2, fu3] = self.lifecycle_timestamps();
        match (sent, fu1, fu2, fu3) {
            (None, ..) => LifecycleStage::New,
            (Some(_), None, ..) => LifecycleStage::AwaitingFu1,
            (Some(_), Some(_), None, _) => LifecycleStage::AwaitingFu2,
            (Some(_), Some(_), Some(_), None) => LifecycleStage::AwaitingFu3,
            _ => LifecycleStage::Exhausted,
        }
    }
}

/// Delivery status column values. `Bounced` is terminal; anything the sender
/// wrote that we do not recognize is treated as non-contactable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmailStatus {
    Empty,
    Sent,
    Delivered,
    Bounced,
    Unknown,
}

impl EmailStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" => EmailStatus::Empty,
            "Sent" => EmailStatus::Sent,
            "Delivered" => EmailStatus::Delivered,
            "Bounced" => EmailStatus::Bounced,
            _ => EmailStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EmailStatus::Empty => "",
            EmailStatus::Sent => "Sent",
            EmailStatus::Delivered => "Delivered",
            EmailStatus::Bounced => "Bounced",
            EmailStatus::Unknown => "Unknown",
        }
    }

    /// Whether the record may still receive mail.
    pub fn contactable(self) -> bool {
        matches!(
            self,
            EmailStatus::Empty | EmailStatus::Sent | EmailStatus::Delivered
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStage {
    New,
    AwaitingFu1,
    AwaitingFu2,
    AwaitingFu3,
    Exhausted,
    Bounced,
}

/// Normalize a website URL into the store's primary key: lowercase host and
/// path with the scheme, a leading `www.`, and any trailing slash stripped.
pub fn normalize_website_key(raw: &str) -> String {
    let mut key = raw.trim().to_ascii_lowercase();
    for scheme in ["https://", "http://"] {
        if let Some(rest) = key.strip_prefix(scheme) {
            key = rest.to_string();
            break;
        }
    }
    if let Some(rest) = key.strip_prefix("www.") {
        key = rest.to_string();
    }
    key.trim_end_matches('/').to_string()
}

/// Parse a list-shaped cell. Strict JSON array first, then a comma-separated
/// fallback. Stored data is never evaluated as code.
pub fn parse_string_list(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') {
        if let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(trimmed) {
            return values
                .into_iter()
                .filter_map(|v| match v {
                    serde_json::Value::String(s) => Some(s),
                    other => Some(other.to_string()),
                })
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
    trimmed
        .split(',')
        .map(|s| s.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Extract the first email address from a list-shaped or bare-string cell.
pub fn first_email(raw: &str) -> Option<String> {
    let candidates = parse_string_list(raw);
    let haystacks: Vec<&str> = if candidates.is_empty() {
        vec![raw]
    } else {
        candidates.iter().map(String::as_str).collect()
    };
    for candidate in haystacks {
        if let Some(found) = email_regex().find(candidate) {
            return Some(found.as_str().to_ascii_lowercase());
        }
    }
    None
}

/// Lenient timestamp read: the canonical format first, then a bare date.
/// Anything else is `None`, which downstream treats as "not yet set".
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_FORMAT) {
        return Some(ts);
    }
    chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}
