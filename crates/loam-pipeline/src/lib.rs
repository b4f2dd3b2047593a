//! Concurrent prospect-build pipeline: discovery, contact finding and
//! verification, analysis and message generation, then one store append.
//!
//! Each enrichment stage runs over a semaphore-bounded `JoinSet` and joins in
//! completion order, so output ordering is non-deterministic. A failing item
//! is logged with its identity and dropped; it never fails the batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use loam_core::{normalize_website_key, Prospect};
use loam_enrich::{
    BusinessCandidate, BusinessFacts, ContactFinder, ContentAnalyzer, Discovery, EmailVerifier,
    MessageGenerator, ProspectAnalyzer, ReviewSource, VerifyStatus,
};
use loam_store::ProspectStore;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "loam-pipeline";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Width of each stage's worker pool.
    pub worker_count: usize,
    /// Pause after each completed generation task; bounds sustained
    /// throughput against the model API, not burst concurrency.
    pub generation_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            generation_delay: Duration::from_secs(1),
        }
    }
}

/// Per-stage counts for one build run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    pub discovered: usize,
    pub new_candidates: usize,
    pub with_verified_contacts: usize,
    pub generated: usize,
    pub appended: usize,
}

#[derive(Debug, Clone)]
struct VerifiedCandidate {
    candidate: BusinessCandidate,
    emails: Vec<String>,
    titles: Vec<String>,
}

/// Orchestrates one build run over the collaborator seams.
pub struct ProspectPipeline {
    store: ProspectStore,
    discovery: Arc<dyn Discovery>,
    contact_finder: Arc<dyn ContactFinder>,
    verifier: Arc<dyn EmailVerifier>,
    reviews: Arc<dyn ReviewSource>,
    content: Arc<dyn ContentAnalyzer>,
    analyzer: Arc<dyn ProspectAnalyzer>,
    generator: Arc<dyn MessageGenerator>,
    config: PipelineConfig,
}

impl ProspectPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: ProspectStore,
        discovery: Arc<dyn Discovery>,
        contact_finder: Arc<dyn ContactFinder>,
        verifier: Arc<dyn EmailVerifier>,
        reviews: Arc<dyn ReviewSource>,
        content: Arc<dyn ContentAnalyzer>,
        analyzer: Arc<dyn ProspectAnalyzer>,
        generator: Arc<dyn MessageGenerator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            discovery,
            contact_finder,
            verifier,
            reviews,
            content,
            analyzer,
            generator,
            config,
        }
    }

    /// Run discovery through append. Store failures abort the batch; per-item
    /// enrichment failures only drop that item.
    pub async fn build(&self, query: &str, max_leads: usize) -> anyhow::Result<BuildSummary> {
        let mut summary = BuildSummary::default();
        info!(query, max_leads, "starting prospect build");

        self.store
            .ensure_columns()
            .await
            .context("preparing tracking columns")?;
        let existing = self
            .store
            .existing_keys()
            .await
            .context("loading existing prospect keys")?;

        let discovered = self
            .discovery
            .search(query, max_leads)
            .await
            .context("discovery search failed")?;
        summary.discovered = discovered.len();

        let mut seen: HashSet<String> = HashSet::new();
        let fresh: Vec<BusinessCandidate> = discovered
            .into_iter()
            .filter(|c| {
                let key = normalize_website_key(&c.website);
                if key.is_empty() || existing.contains(&key) {
                    return false;
                }
                seen.insert(key)
            })
            .collect();
        summary.new_candidates = fresh.len();
        info!(
            discovered = summary.discovered,
            new = summary.new_candidates,
            "discovery complete"
        );
        if fresh.is_empty() {
            return Ok(summary);
        }

        let verified = self.find_and_verify_contacts(fresh).await;
        summary.with_verified_contacts = verified.len();
        info!(count = verified.len(), "contact verification complete");

        let prospects = self.analyze_and_generate(verified).await;
        summary.generated = prospects.len();
        if prospects.is_empty() {
            warn!("no prospects survived analysis and generation");
            return Ok(summary);
        }

        summary.appended = self
            .store
            .append(&prospects)
            .await
            .context("appending prospects to store")?;
        info!(appended = summary.appended, "prospect build complete");
        Ok(summary)
    }

    /// Stage one: scrape each candidate's site and keep only candidates with
    /// at least one address the verifier accepts.
    async fn find_and_verify_contacts(
        &self,
        candidates: Vec<BusinessCandidate>,
    ) -> Vec<VerifiedCandidate> {
        let limit = Arc::new(Semaphore::new(self.config.worker_count.max(1)));
        let mut tasks: JoinSet<Option<VerifiedCandidate>> = JoinSet::new();

        for candidate in candidates {
            let limit = limit.clone();
            let finder = self.contact_finder.clone();
            let verifier = self.verifier.clone();
            tasks.spawn(async move {
                let _permit = limit.acquire().await.expect("semaphore not closed");
                let contacts = match finder.find(&candidate.website).await {
                    Ok(contacts) => contacts,
                    Err(err) => {
                        warn!(business = %candidate.name, website = %candidate.website, %err,
                              "contact finding failed; dropping candidate");
                        return None;
                    }
                };
                if contacts.emails.is_empty() {
                    debug!(business = %candidate.name, "no contact emails found");
                    return None;
                }
                let mut valid = Vec::new();
                for email in &contacts.emails {
                    if verifier.verify(email).await == VerifyStatus::Valid {
                        valid.push(email.clone());
                    }
                }
                if valid.is_empty() {
                    debug!(business = %candidate.name, "no emails survived verification");
                    return None;
                }
                Some(VerifiedCandidate {
                    candidate,
                    emails: valid,
                    titles: contacts.titles,
                })
            });
        }

        let mut survivors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(candidate)) => survivors.push(candidate),
                Ok(None) => {}
                Err(err) => warn!(%err, "contact task panicked; dropping its candidate"),
            }
        }
        survivors
    }

    /// Stage two: reviews + site content, pain analysis, then message
    /// generation. The post-completion delay throttles the model API.
    async fn analyze_and_generate(&self, candidates: Vec<VerifiedCandidate>) -> Vec<Prospect> {
        let limit = Arc::new(Semaphore::new(self.config.worker_count.max(1)));
        let mut tasks: JoinSet<Option<Prospect>> = JoinSet::new();

        for verified in candidates {
            let limit = limit.clone();
            let reviews = self.reviews.clone();
            let content = self.content.clone();
            let analyzer = self.analyzer.clone();
            let generator = self.generator.clone();
            tasks.spawn(async move {
                let _permit = limit.acquire().await.expect("semaphore not closed");
                enrich_one(&*reviews, &*content, &*analyzer, &*generator, verified).await
            });
        }

        let mut prospects = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(prospect)) => prospects.push(prospect),
                Ok(None) => {}
                Err(err) => warn!(%err, "analysis task panicked; dropping its candidate"),
            }
            tokio::time::sleep(self.config.generation_delay).await;
        }
        prospects
    }
}

async fn enrich_one(
    reviews: &dyn ReviewSource,
    content: &dyn ContentAnalyzer,
    analyzer: &dyn ProspectAnalyzer,
    generator: &dyn MessageGenerator,
    verified: VerifiedCandidate,
) -> Option<Prospect> {
    let name = verified.candidate.name.clone();

    // Missing reviews are common and not disqualifying.
    let review_blob = match reviews.fetch(&verified.candidate.key).await {
        Ok(value) => value,
        Err(err) => {
            debug!(business = %name, %err, "review fetch failed; continuing without reviews");
            JsonValue::Array(Vec::new())
        }
    };

    let content_blob = match content.analyze(&verified.candidate.website).await {
        Ok(value) => value,
        Err(err) => {
            warn!(business = %name, %err, "content analysis failed; dropping candidate");
            return None;
        }
    };

    let analysis = match analyzer.analyze(&review_blob, &content_blob).await {
        Ok(analysis) => analysis,
        Err(err) => {
            warn!(business = %name, %err, "pain analysis failed; dropping candidate");
            return None;
        }
    };

    let facts = BusinessFacts {
        name: name.clone(),
        titles: verified.titles.clone(),
        icebreaker: analysis.icebreaker.clone(),
        identified_pains: analysis.identified_pains.clone(),
        proposed_solutions: analysis.proposed_solutions.clone(),
        evidence: analysis.evidence.clone(),
    };
    let message = match generator.generate(&facts).await {
        Ok(Some(message)) => message,
        Ok(None) => {
            debug!(business = %name, "generator declined this candidate");
            return None;
        }
        Err(err) => {
            warn!(business = %name, %err, "message generation failed; dropping candidate");
            return None;
        }
    };

    let mut prospect = Prospect::default();
    prospect.name = verified.candidate.name;
    prospect.website = verified.candidate.website;
    prospect.contact_emails = json_list(&verified.emails);
    prospect.titles = json_list(&verified.titles);
    prospect.reviews_raw = review_blob.to_string();
    prospect.content_analysis_raw = content_blob.to_string();
    prospect.icebreaker = analysis.icebreaker;
    prospect.identified_pains = json_list(&analysis.identified_pains);
    prospect.proposed_solutions = json_list(&analysis.proposed_solutions);
    prospect.evidence = json_list(&analysis.evidence);
    prospect.subject = message.subject;
    prospect.body = message.body;
    Some(prospect)
}

fn json_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use loam_enrich::{Analysis, ContactInfo, EnrichError, OutboundMessage};
    use loam_store::InMemoryGrid;

    struct FixedDiscovery(Vec<BusinessCandidate>);

    #[async_trait]
    impl Discovery for FixedDiscovery {
        async fn search(
            &self,
            _query: &str,
            max_results: usize,
        ) -> Result<Vec<BusinessCandidate>, EnrichError> {
            let mut results = self.0.clone();
            results.truncate(max_results);
            Ok(results)
        }
    }

    /// Finds a contact page for every site except the one it is told to fail
    /// on and the one with no addresses at all.
    struct ScriptedContacts {
        failing_site: String,
        empty_site: String,
    }

    #[async_trait]
    impl ContactFinder for ScriptedContacts {
        async fn find(&self, website: &str) -> Result<ContactInfo, EnrichError> {
            if website == self.failing_site {
                return Err(EnrichError::Message("connect timeout".to_string()));
            }
            if website == self.empty_site {
                return Ok(ContactInfo::default());
            }
            let host = normalize_website_key(website);
            Ok(ContactInfo {
                emails: vec![format!("info@{host}"), format!("bogus@{host}")],
                titles: vec!["Owner".to_string()],
            })
        }
    }

    /// Accepts only `info@` addresses.
    struct PickyVerifier;

    #[async_trait]
    impl EmailVerifier for PickyVerifier {
        async fn verify(&self, email: &str) -> VerifyStatus {
            if email.starts_with("info@") {
                VerifyStatus::Valid
            } else {
                VerifyStatus::Invalid
            }
        }
    }

    struct NoReviews;

    #[async_trait]
    impl ReviewSource for NoReviews {
        async fn fetch(&self, _key: &str) -> Result<JsonValue, EnrichError> {
            Err(EnrichError::Message("reviews unavailable".to_string()))
        }
    }

    struct StaticContent;

    #[async_trait]
    impl ContentAnalyzer for StaticContent {
        async fn analyze(&self, _website: &str) -> Result<JsonValue, EnrichError> {
            Ok(serde_json::json!({"title": "site"}))
        }
    }

    struct StaticAnalyzer;

    #[async_trait]
    impl ProspectAnalyzer for StaticAnalyzer {
        async fn analyze(
            &self,
            _reviews: &JsonValue,
            _content: &JsonValue,
        ) -> Result<Analysis, EnrichError> {
            Ok(Analysis {
                icebreaker: "Lovely gallery.".to_string(),
                identified_pains: vec!["thin social presence".to_string()],
                proposed_solutions: vec!["Content & Social Media Management".to_string()],
                evidence: vec!["no posts since 2022".to_string()],
            })
        }
    }

    /// Declines one business by name, drafts for everyone else.
    struct SelectiveGenerator {
        declined: String,
    }

    #[async_trait]
    impl MessageGenerator for SelectiveGenerator {
        async fn generate(
            &self,
            facts: &BusinessFacts,
        ) -> Result<Option<OutboundMessage>, EnrichError> {
            if facts.name == self.declined {
                return Ok(None);
            }
            Ok(Some(OutboundMessage {
                subject: format!("An idea for {}", facts.name),
                body: "Short, aspirational pitch.".to_string(),
            }))
        }

        async fn follow_up(
            &self,
            _prospect: &Prospect,
            _stage: u8,
        ) -> Result<Option<OutboundMessage>, EnrichError> {
            Ok(None)
        }
    }

    fn candidate(name: &str, website: &str) -> BusinessCandidate {
        BusinessCandidate {
            key: format!("place-{name}"),
            name: name.to_string(),
            website: website.to_string(),
            ..BusinessCandidate::default()
        }
    }

    fn pipeline_under_test(store: ProspectStore) -> ProspectPipeline {
        ProspectPipeline::new(
            store,
            Arc::new(FixedDiscovery(vec![
                candidate("Acme", "https://acme.com"),
                candidate("Beta", "https://beta.com"),
                candidate("Gamma", "https://gamma.com"),
                candidate("Delta", "https://delta.com"),
                candidate("Echo", "https://echo.com"),
                // Duplicate of Acme under a different spelling.
                candidate("Acme Again", "http://www.acme.com/"),
            ])),
            Arc::new(ScriptedContacts {
                failing_site: "https://gamma.com".to_string(),
                empty_site: "https://delta.com".to_string(),
            }),
            Arc::new(PickyVerifier),
            Arc::new(NoReviews),
            Arc::new(StaticContent),
            Arc::new(StaticAnalyzer),
            Arc::new(SelectiveGenerator {
                declined: "Echo".to_string(),
            }),
            PipelineConfig {
                worker_count: 4,
                generation_delay: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn failures_are_isolated_and_output_is_message_ready() {
        let grid = Arc::new(InMemoryGrid::new());
        let store = ProspectStore::new(grid.clone());
        let pipeline = pipeline_under_test(store.clone());

        let summary = pipeline.build("landscaping in san diego", 10).await.unwrap();
        assert_eq!(summary.discovered, 6);
        // The in-batch duplicate of acme.com is dropped up front.
        assert_eq!(summary.new_candidates, 5);
        // Gamma's scrape failed, Delta had no addresses.
        assert_eq!(summary.with_verified_contacts, 3);
        // Echo was declined by the generator.
        assert_eq!(summary.generated, 2);
        assert_eq!(summary.appended, 2);

        let stored = store.fetch_all().await.unwrap();
        assert_eq!(stored.len(), 2);
        for prospect in &stored {
            assert!(!prospect.subject.is_empty());
            assert!(!prospect.body.is_empty());
            assert!(prospect.primary_email().is_some());
            // Only verified addresses are persisted.
            assert!(!prospect.contact_emails.contains("bogus@"));
        }
    }

    #[tokio::test]
    async fn candidates_already_in_store_are_skipped() {
        let grid = Arc::new(InMemoryGrid::new());
        let store = ProspectStore::new(grid.clone());
        let mut tracked = Prospect::default();
        tracked.name = "Acme".to_string();
        tracked.website = "acme.com".to_string();
        store.append(&[tracked]).await.unwrap();

        let pipeline = pipeline_under_test(store.clone());
        let summary = pipeline.build("landscaping", 10).await.unwrap();

        // Acme and its in-batch duplicate both drop against the store key.
        assert_eq!(summary.new_candidates, 4);
        let keys: Vec<String> = store
            .fetch_all()
            .await
            .unwrap()
            .iter()
            .map(Prospect::key)
            .collect();
        assert_eq!(keys.iter().filter(|k| k.as_str() == "acme.com").count(), 1);
    }

    #[tokio::test]
    async fn empty_discovery_is_a_clean_no_op() {
        let grid = Arc::new(InMemoryGrid::new());
        let store = ProspectStore::new(grid.clone());
        let pipeline = ProspectPipeline::new(
            store,
            Arc::new(FixedDiscovery(Vec::new())),
            Arc::new(ScriptedContacts {
                failing_site: String::new(),
                empty_site: String::new(),
            }),
            Arc::new(PickyVerifier),
            Arc::new(NoReviews),
            Arc::new(StaticContent),
            Arc::new(StaticAnalyzer),
            Arc::new(SelectiveGenerator {
                declined: String::new(),
            }),
            PipelineConfig::default(),
        );
        let summary = pipeline.build("anything", 5).await.unwrap();
        assert_eq!(summary, BuildSummary::default());
    }
}
