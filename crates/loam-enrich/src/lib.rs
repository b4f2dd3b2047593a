//! Collaborator contracts consumed by the pipeline and the outreach runners,
//! plus the concrete HTTP/scraping implementations.
//!
//! Everything external sits behind an `async_trait` seam: discovery,
//! contact finding, verification, analysis, generation, sending. Per-item
//! failures stay inside each call; callers drop the item and move on.

use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use loam_core::Prospect;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "loam-enrich";

/// Seconds-scale default for every outbound network call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A business surfaced by discovery, pre-enrichment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessCandidate {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub website: String,
}

/// Scraped contact surface of a website. Empty lists mean "nothing found",
/// not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub emails: Vec<String>,
    pub titles: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyStatus {
    Valid,
    Invalid,
    Risky,
    Error,
}

/// Output of pain-point analysis over reviews + site content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default)]
    pub icebreaker: String,
    #[serde(default)]
    pub identified_pains: Vec<String>,
    #[serde(default)]
    pub proposed_solutions: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub subject: String,
    pub body: String,
}

/// Everything the generator needs to draft an initial message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusinessFacts {
    pub name: String,
    pub titles: Vec<String>,
    pub icebreaker: String,
    pub identified_pains: Vec<String>,
    pub proposed_solutions: Vec<String>,
    pub evidence: Vec<String>,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<BusinessCandidate>, EnrichError>;
}

#[async_trait]
pub trait ContactFinder: Send + Sync {
    async fn find(&self, website: &str) -> Result<ContactInfo, EnrichError>;
}

#[async_trait]
pub trait EmailVerifier: Send + Sync {
    /// Never fails upward; transport problems come back as `Error`.
    async fn verify(&self, email: &str) -> VerifyStatus;
}

#[async_trait]
pub trait ReviewSource: Send + Sync {
    /// Opaque review payload for a discovery key, stored as-is.
    async fn fetch(&self, key: &str) -> Result<JsonValue, EnrichError>;
}

#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    /// Opaque site-content payload for a website, stored as-is.
    async fn analyze(&self, website: &str) -> Result<JsonValue, EnrichError>;
}

#[async_trait]
pub trait ProspectAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        reviews: &JsonValue,
        content: &JsonValue,
    ) -> Result<Analysis, EnrichError>;
}

#[async_trait]
pub trait MessageGenerator: Send + Sync {
    /// `Ok(None)` means "skip this candidate", not a failure.
    async fn generate(&self, facts: &BusinessFacts)
        -> Result<Option<OutboundMessage>, EnrichError>;

    /// Draft follow-up `stage` (1..=3) for an already-contacted prospect.
    async fn follow_up(
        &self,
        prospect: &Prospect,
        stage: u8,
    ) -> Result<Option<OutboundMessage>, EnrichError>;
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    /// An `Err` is a transport failure; the caller decides what that means
    /// for the record.
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), EnrichError>;
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("valid email regex")
    })
}

/// Role keywords worth surfacing from a contact page.
const SENIOR_TITLES: &[&str] = &[
    "owner",
    "ceo",
    "founder",
    "president",
    "managing director",
    "marketing director",
    "sales director",
    "marketing manager",
];

/// Paths checked in addition to the homepage.
const CONTACT_PAGE_PATHS: &[&str] = &["/contact", "/contact-us", "/about", "/about-us", "/team"];

/// Pull emails (body text + `mailto:` links) and senior-role titles out of one
/// HTML document. Sets keep the output deterministic.
pub fn extract_contacts(html: &str) -> ContactInfo {
    let document = Html::parse_document(html);
    let text: String = document.root_element().text().collect::<Vec<_>>().join(" ");

    let mut emails: BTreeSet<String> = email_regex()
        .find_iter(&text)
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect();

    let mailto = Selector::parse("a[href]").expect("static selector");
    for anchor in document.select(&mailto) {
        if let Some(href) = anchor.value().attr("href") {
            if let Some(raw) = href.strip_prefix("mailto:") {
                if let Some(found) = email_regex().find(raw) {
                    emails.insert(found.as_str().to_ascii_lowercase());
                }
            }
        }
    }

    let lowered = text.to_ascii_lowercase();
    let titles: BTreeSet<String> = SENIOR_TITLES
        .iter()
        .filter(|t| lowered.contains(*t))
        .map(|t| title_case(t))
        .collect();

    ContactInfo {
        emails: emails.into_iter().collect(),
        titles: titles.into_iter().collect(),
    }
}

fn title_case(phrase: &str) -> String {
    phrase
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Homepage plus the common contact/about pages, scheme-defaulted.
pub fn candidate_pages(website: &str) -> Vec<String> {
    let base = if website.starts_with("http://") || website.starts_with("https://") {
        website.to_string()
    } else {
        format!("https://{website}")
    };
    let root = base.trim_end_matches('/').to_string();
    let mut pages = vec![root.clone()];
    for path in CONTACT_PAGE_PATHS {
        pages.push(format!("{root}{path}"));
    }
    pages
}

/// Contact finder that fetches a site's likely contact pages and scrapes
/// them. Individual page failures are logged and skipped.
pub struct ScrapingContactFinder {
    client: reqwest::Client,
}

impl ScrapingContactFinder {
    pub fn new(timeout: Duration) -> Result<Self, EnrichError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(EnrichError::Http)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContactFinder for ScrapingContactFinder {
    async fn find(&self, website: &str) -> Result<ContactInfo, EnrichError> {
        if website.trim().is_empty() {
            return Ok(ContactInfo::default());
        }
        let mut emails: BTreeSet<String> = BTreeSet::new();
        let mut titles: BTreeSet<String> = BTreeSet::new();
        for url in candidate_pages(website) {
            let page = match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.text().await {
                    Ok(text) => text,
                    Err(err) => {
                        debug!(url, %err, "failed reading page body");
                        continue;
                    }
                },
                Ok(resp) => {
                    debug!(url, status = %resp.status(), "skipping non-success page");
                    continue;
                }
                Err(err) => {
                    debug!(url, %err, "page fetch failed");
                    continue;
                }
            };
            let found = extract_contacts(&page);
            emails.extend(found.emails);
            titles.extend(found.titles);
        }
        Ok(ContactInfo {
            emails: emails.into_iter().collect(),
            titles: titles.into_iter().collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    #[serde(default)]
    results: Vec<BusinessCandidate>,
}

/// Discovery over a places-text-search-shaped API.
pub struct PlacesDiscovery {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PlacesDiscovery {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, EnrichError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(EnrichError::Http)?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl Discovery for PlacesDiscovery {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<BusinessCandidate>, EnrichError> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let response: DiscoveryResponse = self
            .client
            .get(&url)
            .query(&[("query", query), ("key", self.api_key.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut candidates = response.results;
        candidates.truncate(max_results);
        Ok(candidates)
    }
}

#[async_trait]
impl ReviewSource for PlacesDiscovery {
    async fn fetch(&self, key: &str) -> Result<JsonValue, EnrichError> {
        let url = format!("{}/details", self.base_url.trim_end_matches('/'));
        let value: JsonValue = self
            .client
            .get(&url)
            .query(&[("key", self.api_key.as_str()), ("id", key), ("fields", "reviews")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(value
            .get("result")
            .and_then(|r| r.get("reviews"))
            .cloned()
            .unwrap_or(JsonValue::Array(Vec::new())))
    }
}

#[derive(Debug, Deserialize)]
struct VerifierData {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifierResponse {
    data: Option<VerifierData>,
}

/// Verifier-API-backed email check. Without an API key it degrades to a
/// permissive simulation so the pipeline can run end to end in development.
pub struct VerifierClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl VerifierClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, EnrichError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(EnrichError::Http)?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl EmailVerifier for VerifierClient {
    async fn verify(&self, email: &str) -> VerifyStatus {
        let Some(api_key) = &self.api_key else {
            return VerifyStatus::Valid;
        };
        let url = format!("{}/email-verifier", self.base_url.trim_end_matches('/'));
        let result = self
            .client
            .get(&url)
            .query(&[("email", email), ("api_key", api_key.as_str())])
            .send()
            .await;
        let response = match result {
            Ok(r) => r,
            Err(err) => {
                warn!(email, %err, "verifier request failed");
                return VerifyStatus::Error;
            }
        };
        let parsed: Result<VerifierResponse, _> = response.json().await;
        match parsed {
            Ok(body) => match body.data.and_then(|d| d.status).as_deref() {
                Some("valid") => VerifyStatus::Valid,
                Some("invalid") => VerifyStatus::Invalid,
                Some("risky") => VerifyStatus::Risky,
                _ => VerifyStatus::Error,
            },
            Err(err) => {
                warn!(email, %err, "verifier response unreadable");
                VerifyStatus::Error
            }
        }
    }
}

/// Call-to-action phrases counted during site content analysis.
const CTA_PHRASES: &[&str] = &[
    "get a quote",
    "free quote",
    "request a quote",
    "get an estimate",
    "free estimate",
    "contact us",
    "schedule a consultation",
    "book now",
    "request service",
];

const SOCIAL_DOMAINS: &[&str] = &[
    "facebook.com",
    "instagram.com",
    "twitter.com",
    "linkedin.com",
    "youtube.com",
];

/// Reduce a homepage to the conversion signals the analyzer prompt cares
/// about.
pub fn summarize_site_content(html: &str) -> JsonValue {
    let document = Html::parse_document(html);
    let text: String = document.root_element().text().collect::<Vec<_>>().join(" ");
    let lowered = text.to_ascii_lowercase();

    let title_sel = Selector::parse("title").expect("static selector");
    let title = document
        .select(&title_sel)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let ctas: Vec<&str> = CTA_PHRASES
        .iter()
        .copied()
        .filter(|phrase| lowered.contains(phrase))
        .collect();

    let anchor_sel = Selector::parse("a[href]").expect("static selector");
    let socials: BTreeSet<&str> = document
        .select(&anchor_sel)
        .filter_map(|a| a.value().attr("href"))
        .flat_map(|href| SOCIAL_DOMAINS.iter().copied().filter(move |d| href.contains(d)))
        .collect();

    json!({
        "title": title,
        "cta_phrases": ctas,
        "social_profiles": socials.into_iter().collect::<Vec<_>>(),
        "word_count": lowered.split_whitespace().count(),
    })
}

/// Content analyzer that fetches the homepage and summarizes it.
pub struct SiteContentAnalyzer {
    client: reqwest::Client,
}

impl SiteContentAnalyzer {
    pub fn new(timeout: Duration) -> Result<Self, EnrichError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(EnrichError::Http)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContentAnalyzer for SiteContentAnalyzer {
    async fn analyze(&self, website: &str) -> Result<JsonValue, EnrichError> {
        let Some(homepage) = candidate_pages(website).into_iter().next() else {
            return Ok(JsonValue::Null);
        };
        let html = self
            .client
            .get(&homepage)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(summarize_site_content(&html))
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

impl LlmConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

/// Chat-completions-backed analyzer and generator. Prompts demand a single
/// JSON object; anything unparseable is treated as "model declined".
pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self, EnrichError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(EnrichError::Http)?;
        Ok(Self { client, config })
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, EnrichError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response: ChatResponse = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EnrichError::Message("completion had no content".to_string()))
    }
}

/// Strip a markdown code fence if the model wrapped its JSON in one, then
/// parse.
pub fn parse_model_json(raw: &str) -> Option<JsonValue> {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    serde_json::from_str(inner).ok()
}

pub fn parse_message_json(raw: &str) -> Option<OutboundMessage> {
    let value = parse_model_json(raw)?;
    let subject = value.get("subject")?.as_str()?.trim().to_string();
    let body = value.get("body")?.as_str()?.trim().to_string();
    if subject.is_empty() || body.is_empty() {
        return None;
    }
    Some(OutboundMessage { subject, body })
}

pub fn parse_analysis_json(raw: &str) -> Option<Analysis> {
    let value = parse_model_json(raw)?;
    serde_json::from_value(value).ok()
}

#[async_trait]
impl ProspectAnalyzer for LlmClient {
    async fn analyze(
        &self,
        reviews: &JsonValue,
        content: &JsonValue,
    ) -> Result<Analysis, EnrichError> {
        let system = "You are a marketing strategist. Respond with exactly one JSON object \
                      with keys: icebreaker (string), identified_pains (array of strings), \
                      proposed_solutions (array of strings), evidence (array of strings). \
                      The icebreaker is a single genuine compliment; never mention negative \
                      reviews or technical site issues.";
        let user = format!(
            "Customer reviews:\n{reviews}\n\nWebsite content summary:\n{content}\n\n\
             Identify the business's growth pains, propose matching services, and cite \
             the evidence you used."
        );
        let raw = self.complete(system, &user).await?;
        parse_analysis_json(&raw)
            .ok_or_else(|| EnrichError::Message("analysis response was not valid JSON".to_string()))
    }
}

#[async_trait]
impl MessageGenerator for LlmClient {
    async fn generate(
        &self,
        facts: &BusinessFacts,
    ) -> Result<Option<OutboundMessage>, EnrichError> {
        let system = "You are a brand and content strategist writing concise, aspirational \
                      cold outreach for premium home-service businesses. Respond with exactly \
                      one JSON object: {\"subject\": string, \"body\": string}. Keep the body \
                      near 120 words, opportunity-vision-path structure, no desperation.";
        let titles = if facts.titles.is_empty() {
            "the Owner".to_string()
        } else {
            facts.titles.join(", ")
        };
        let user = format!(
            "Business: {}\nLikely recipient role(s): {}\nIcebreaker: {}\n\
             Identified pains: {}\nProposed solutions: {}\nEvidence: {}",
            facts.name,
            titles,
            facts.icebreaker,
            facts.identified_pains.join("; "),
            facts.proposed_solutions.join("; "),
            facts.evidence.join("; "),
        );
        let raw = self.complete(system, &user).await?;
        Ok(parse_message_json(&raw))
    }

    async fn follow_up(
        &self,
        prospect: &Prospect,
        stage: u8,
    ) -> Result<Option<OutboundMessage>, EnrichError> {
        let tone = match stage {
            1 => "a short, friendly nudge referencing the original note",
            2 => "a value-add angle: share one concrete idea they could use",
            _ => "a polite, final break-up note leaving the door open",
        };
        let system = "You are a brand and content strategist writing follow-up emails. \
                      Respond with exactly one JSON object: {\"subject\": string, \
                      \"body\": string}. Under 90 words.";
        let user = format!(
            "Business: {}\nOriginal subject: {}\nOriginal body:\n{}\n\n\
             Write follow-up #{stage}: {tone}.",
            prospect.name, prospect.subject, prospect.body,
        );
        let raw = self.complete(system, &user).await?;
        Ok(parse_message_json(&raw))
    }
}

/// Sender over a JSON send API.
pub struct HttpMessageSender {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    from: String,
}

impl HttpMessageSender {
    pub fn new(
        base_url: impl Into<String>,
        api_token: impl Into<String>,
        from: impl Into<String>,
    ) -> Result<Self, EnrichError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(EnrichError::Http)?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_token: api_token.into(),
            from: from.into(),
        })
    }
}

#[async_trait]
impl MessageSender for HttpMessageSender {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), EnrichError> {
        let url = format!("{}/messages", self.base_url.trim_end_matches('/'));
        self.client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&json!({
                "from": self.from,
                "to": recipient,
                "subject": subject,
                "text": body,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_contacts_finds_body_and_mailto_emails() {
        let html = r#"
            <html><body>
              <p>Reach the Owner at Info@GreenScapes.com for estimates.</p>
              <a href="mailto:sales@greenscapes.com?subject=hi">Email sales</a>
              <a href="/about">About</a>
            </body></html>"#;
        let contacts = extract_contacts(html);
        assert_eq!(
            contacts.emails,
            vec!["info@greenscapes.com", "sales@greenscapes.com"]
        );
        assert_eq!(contacts.titles, vec!["Owner"]);
    }

    #[test]
    fn extract_contacts_on_empty_page_yields_empty_lists() {
        let contacts = extract_contacts("<html><body><p>Welcome!</p></body></html>");
        assert!(contacts.emails.is_empty());
        assert!(contacts.titles.is_empty());
    }

    #[test]
    fn candidate_pages_cover_homepage_and_contact_paths() {
        let pages = candidate_pages("greenscapes.com/");
        assert_eq!(pages[0], "https://greenscapes.com");
        assert!(pages.contains(&"https://greenscapes.com/contact".to_string()));
        assert!(pages.contains(&"https://greenscapes.com/team".to_string()));

        let explicit = candidate_pages("http://acme.com");
        assert_eq!(explicit[0], "http://acme.com");
    }

    #[test]
    fn site_summary_counts_ctas_and_socials() {
        let html = r#"
            <html><head><title>GreenScapes | Premium Landscaping</title></head>
            <body>
              <a href="https://www.instagram.com/greenscapes">IG</a>
              <a href="https://facebook.com/greenscapes">FB</a>
              <p>Get a quote today or book now.</p>
            </body></html>"#;
        let summary = summarize_site_content(html);
        assert_eq!(
            summary["title"].as_str(),
            Some("GreenScapes | Premium Landscaping")
        );
        let ctas: Vec<&str> = summary["cta_phrases"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(ctas.contains(&"get a quote"));
        assert!(ctas.contains(&"book now"));
        assert_eq!(summary["social_profiles"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn message_json_requires_nonempty_subject_and_body() {
        let ok = parse_message_json(r#"{"subject": "An idea", "body": "Hello there."}"#).unwrap();
        assert_eq!(ok.subject, "An idea");
        assert!(parse_message_json(r#"{"subject": "", "body": "x"}"#).is_none());
        assert!(parse_message_json(r#"{"subject": "x"}"#).is_none());
        assert!(parse_message_json("the model rambled instead").is_none());
    }

    #[test]
    fn model_json_tolerates_code_fences() {
        let fenced = "```json\n{\"subject\": \"s\", \"body\": \"b\"}\n```";
        assert!(parse_message_json(fenced).is_some());
    }

    #[test]
    fn analysis_json_fills_missing_fields_with_defaults() {
        let analysis =
            parse_analysis_json(r#"{"icebreaker": "Your patio gallery is stunning."}"#).unwrap();
        assert_eq!(analysis.icebreaker, "Your patio gallery is stunning.");
        assert!(analysis.identified_pains.is_empty());
    }
}
