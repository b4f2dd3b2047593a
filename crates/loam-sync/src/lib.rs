//! Bulk synchronization against the tabular store: the `UpdateBatch` that
//! campaign runs accumulate into, the maintenance jobs (deduplication,
//! last-contact backfill, bounce processing), and the optional cron scheduler
//! for the daily jobs.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use loam_core::{col, format_timestamp, EmailStatus, Prospect};
use loam_store::{BulkUpdateOutcome, KeyedUpdates, ProspectStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "loam-sync";

/// Keyed absolute-value updates, flushed to the store in one round trip.
///
/// Every value is the final cell content, never a delta, so applying a batch
/// twice leaves the store exactly as applying it once did. That makes the
/// crash window between a send and the flush safe to replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateBatch {
    updates: KeyedUpdates,
}

impl UpdateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Number of keys with pending updates.
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Stage one field write. Later writes to the same key and field win.
    pub fn set(&mut self, key: &str, field: &str, value: impl Into<String>) {
        self.updates
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
    }

    /// Stage a lifecycle timestamp and keep `last_contact_date` equal to it.
    /// Callers only record sends as they happen, so the newest send is always
    /// the latest contact.
    pub fn set_timestamp(&mut self, key: &str, field: &str, at: NaiveDateTime) {
        let stamp = format_timestamp(at);
        self.set(key, field, stamp.clone());
        self.set(key, col::LAST_CONTACT_DATE, stamp);
    }

    pub fn set_status(&mut self, key: &str, status: EmailStatus) {
        self.set(key, col::EMAIL_STATUS, status.as_str());
    }

    /// Terminal transition: the record stops receiving mail and carries the
    /// reason it was closed.
    pub fn mark_bounced(&mut self, key: &str, reason: &str) {
        self.set_status(key, EmailStatus::Bounced);
        self.set(key, col::TERMINATION_REASON, reason);
    }

    /// Fold another batch into this one; the other batch's values win on
    /// overlap.
    pub fn merge(&mut self, other: UpdateBatch) {
        for (key, fields) in other.updates {
            self.updates.entry(key).or_default().extend(fields);
        }
    }

    /// Flush to the store in a single `bulk_update` round trip.
    pub async fn apply(&self, store: &ProspectStore) -> Result<BulkUpdateOutcome, StoreError> {
        let outcome = store.bulk_update(&self.updates).await?;
        info!(
            keys = self.updates.len(),
            matched = outcome.matched_rows,
            cells = outcome.cells_written,
            "applied update batch"
        );
        Ok(outcome)
    }

    pub fn as_updates(&self) -> &KeyedUpdates {
        &self.updates
    }
}

/// Source of bounced recipient addresses, typically a mailbox scan.
#[async_trait]
pub trait BounceSource: Send + Sync {
    async fn bounced_recipients(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BounceReport {
    pub reported: usize,
    pub matched: usize,
    pub already_terminal: usize,
}

/// Mark every record whose first contact email appears in the bounce source
/// as `Bounced` with a delivery-failure reason. One bulk write.
pub async fn process_bounces(
    store: &ProspectStore,
    source: &dyn BounceSource,
) -> Result<BounceReport> {
    let recipients = source
        .bounced_recipients()
        .await
        .context("reading bounce source")?;
    let mut report = BounceReport {
        reported: recipients.len(),
        ..BounceReport::default()
    };
    if recipients.is_empty() {
        return Ok(report);
    }

    let prospects = store.fetch_all().await.context("reading prospect store")?;
    let mut by_email: HashMap<String, &Prospect> = HashMap::new();
    for prospect in &prospects {
        if let Some(email) = prospect.primary_email() {
            by_email.entry(email).or_insert(prospect);
        }
    }

    let mut batch = UpdateBatch::new();
    for recipient in &recipients {
        let Some(prospect) = by_email.get(&recipient.trim().to_ascii_lowercase()) else {
            warn!(recipient, "bounce recipient matches no tracked prospect");
            continue;
        };
        if prospect.status() == EmailStatus::Bounced {
            report.already_terminal += 1;
            continue;
        }
        batch.mark_bounced(&prospect.key(), "Delivery Failure");
        report.matched += 1;
    }

    if !batch.is_empty() {
        batch.apply(store).await.context("writing bounce updates")?;
    }
    info!(
        reported = report.reported,
        matched = report.matched,
        "bounce processing complete"
    );
    Ok(report)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    pub scanned: usize,
    pub removed: usize,
}

/// Remove duplicate rows, keeping the last occurrence of each normalized
/// website key. Rows without a usable key are kept untouched. Rewrites the
/// whole table, so this must not run concurrently with other writers.
pub async fn deduplicate(store: &ProspectStore) -> Result<DedupReport> {
    let snapshot = store.read_snapshot().await.context("reading store")?;
    if snapshot.is_empty() {
        return Ok(DedupReport::default());
    }

    let prospects: Vec<Prospect> = snapshot
        .rows
        .iter()
        .map(|cells| Prospect::from_row(&snapshot.header, cells))
        .collect();
    let scanned = prospects.len();

    let mut last_index: BTreeMap<String, usize> = BTreeMap::new();
    for (index, prospect) in prospects.iter().enumerate() {
        let key = prospect.key();
        if !key.is_empty() {
            last_index.insert(key, index);
        }
    }

    let kept: Vec<Prospect> = prospects
        .into_iter()
        .enumerate()
        .filter(|(index, prospect)| {
            let key = prospect.key();
            key.is_empty() || last_index.get(&key) == Some(index)
        })
        .map(|(_, prospect)| prospect)
        .collect();

    let report = DedupReport {
        scanned,
        removed: scanned - kept.len(),
    };
    if report.removed > 0 {
        store
            .clear_and_rewrite(&snapshot.header, &kept)
            .await
            .context("rewriting deduplicated store")?;
    }
    info!(
        scanned = report.scanned,
        removed = report.removed,
        "deduplication complete"
    );
    Ok(report)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub scanned: usize,
    pub corrected: usize,
}

/// Recompute `last_contact_date` for every row as the max of its lifecycle
/// timestamps, clearing it where no timestamp is set. Same rewrite caveat as
/// `deduplicate`.
pub async fn backfill_last_contact(store: &ProspectStore) -> Result<BackfillReport> {
    let snapshot = store.read_snapshot().await.context("reading store")?;
    if snapshot.is_empty() {
        return Ok(BackfillReport::default());
    }

    let mut prospects: Vec<Prospect> = snapshot
        .rows
        .iter()
        .map(|cells| Prospect::from_row(&snapshot.header, cells))
        .collect();
    let mut report = BackfillReport {
        scanned: prospects.len(),
        ..BackfillReport::default()
    };

    for prospect in &mut prospects {
        let expected = prospect
            .latest_contact()
            .map(format_timestamp)
            .unwrap_or_default();
        if prospect.last_contact_date != expected {
            prospect.last_contact_date = expected;
            report.corrected += 1;
        }
    }

    if report.corrected > 0 {
        store
            .clear_and_rewrite(&snapshot.header, &prospects)
            .await
            .context("rewriting backfilled store")?;
    }
    info!(
        scanned = report.scanned,
        corrected = report.corrected,
        "last-contact backfill complete"
    );
    Ok(report)
}

/// Campaign file: discovery defaults and the strategy-gate allow-list.
#[derive(Debug, Clone, Deserialize)]
pub struct CampaignConfig {
    pub discovery_query: String,
    #[serde(default = "default_max_leads")]
    pub max_leads: usize,
    #[serde(default = "default_daily_cap")]
    pub daily_send_cap: usize,
    #[serde(default)]
    pub strategy_keywords: Vec<String>,
}

fn default_max_leads() -> usize {
    25
}

fn default_daily_cap() -> usize {
    50
}

impl CampaignConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub sending_cron: String,
    pub follow_up_cron: String,
}

impl ScheduleConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: std::env::var("LOAM_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sending_cron: std::env::var("LOAM_SENDING_CRON")
                .unwrap_or_else(|_| "0 0 9 * * *".to_string()),
            follow_up_cron: std::env::var("LOAM_FOLLOW_UP_CRON")
                .unwrap_or_else(|_| "0 30 9 * * *".to_string()),
        }
    }
}

/// Build the daily-job scheduler when enabled. The jobs themselves are
/// injected as boxed closures so this crate stays below the campaign runners.
pub async fn maybe_build_scheduler<S, F>(
    config: &ScheduleConfig,
    sending_job: S,
    follow_up_job: F,
) -> Result<Option<JobScheduler>>
where
    S: Fn() + Send + Sync + Clone + 'static,
    F: Fn() + Send + Sync + Clone + 'static,
{
    if !config.enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(config.sending_cron.as_str(), move |_uuid, _l| {
        let run = sending_job.clone();
        Box::pin(async move {
            info!("scheduled daily sending triggered");
            run();
        })
    })
    .with_context(|| format!("creating sending job for cron {}", config.sending_cron))?;
    sched.add(job).await.context("adding sending job")?;

    let job = Job::new_async(config.follow_up_cron.as_str(), move |_uuid, _l| {
        let run = follow_up_job.clone();
        Box::pin(async move {
            info!("scheduled follow-up run triggered");
            run();
        })
    })
    .with_context(|| format!("creating follow-up job for cron {}", config.follow_up_cron))?;
    sched.add(job).await.context("adding follow-up job")?;

    Ok(Some(sched))
}
