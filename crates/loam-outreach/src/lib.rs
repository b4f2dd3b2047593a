//! Outreach state machine: follow-up eligibility over the lifecycle
//! timestamps, the strategy-alignment gate, and the initial-send and
//! follow-up campaign runners.
//!
//! Runners never write mid-scan. Every decision lands in one `UpdateBatch`
//! that is flushed after the scan, so a run costs one read and one write
//! round trip against the store no matter how many records it touches.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use loam_core::{col, parse_string_list, LifecycleStage, Prospect, FOLLOW_UP_COLUMNS};
use loam_enrich::{MessageGenerator, MessageSender};
use loam_store::ProspectStore;
use loam_sync::UpdateBatch;
use serde::Serialize;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "loam-outreach";

/// Days after the previous touch before follow-ups 1, 2 and 3 come due.
pub const FOLLOW_UP_THRESHOLD_DAYS: [i64; 3] = [3, 5, 7];

pub const DEFAULT_STRATEGY_KEYWORDS: &[&str] =
    &["Content", "Social Media", "Brand", "Targeted Lead Generation"];

pub const REASON_MISSING_DATA: &str = "Missing Data";
pub const REASON_SENDING_FAILED: &str = "Sending Failed";
pub const REASON_OUTDATED_STRATEGY: &str = "Outdated Strategy";

/// Which follow-up, if any, a record is due for at `now`.
///
/// The threshold is measured from the previous stage's timestamp. Records
/// whose prerequisite timestamp is missing or malformed are not eligible
/// this cycle; a later backfill or manual fix makes them eligible again.
pub fn follow_up_due(prospect: &Prospect, now: NaiveDateTime) -> Option<u8> {
    if !prospect.status().contactable() {
        return None;
    }
    let stage: u8 = match prospect.stage() {
        LifecycleStage::AwaitingFu1 => 1,
        LifecycleStage::AwaitingFu2 => 2,
        LifecycleStage::AwaitingFu3 => 3,
        _ => return None,
    };
    let timestamps = prospect.lifecycle_timestamps();
    let anchor = timestamps[(stage - 1) as usize]?;
    let due = anchor + chrono::Duration::days(FOLLOW_UP_THRESHOLD_DAYS[(stage - 1) as usize]);
    (now >= due).then_some(stage)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    /// At least one proposed solution matches the current service offering.
    Aligned,
    /// The record's pitch predates the current offering; close it out.
    Misaligned,
    /// `proposed_solutions` is empty or unreadable; leave the record alone.
    Unreadable,
}

/// Keyword allow-list over a record's parsed `proposed_solutions`.
#[derive(Debug, Clone)]
pub struct StrategyGate {
    keywords: Vec<String>,
}

impl Default for StrategyGate {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl StrategyGate {
    /// An empty keyword list falls back to the default offering.
    pub fn new(keywords: Vec<String>) -> Self {
        let keywords = if keywords.is_empty() {
            DEFAULT_STRATEGY_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect()
        } else {
            keywords
        };
        Self { keywords }
    }

    pub fn check(&self, prospect: &Prospect) -> GateVerdict {
        let solutions = parse_string_list(&prospect.proposed_solutions);
        if solutions.is_empty() {
            return GateVerdict::Unreadable;
        }
        let aligned = solutions.iter().any(|solution| {
            let solution = solution.to_ascii_lowercase();
            self.keywords
                .iter()
                .any(|keyword| solution.contains(&keyword.to_ascii_lowercase()))
        });
        if aligned {
            GateVerdict::Aligned
        } else {
            GateVerdict::Misaligned
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutreachConfig {
    /// Pause after each successful send.
    pub inter_send_delay: Duration,
}

impl Default for OutreachConfig {
    fn default() -> Self {
        Self {
            inter_send_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SendReport {
    pub considered: usize,
    pub attempted: usize,
    pub sent: usize,
    pub terminated_missing_data: usize,
    pub terminated_send_failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FollowUpReport {
    pub considered: usize,
    pub eligible: usize,
    pub attempted: usize,
    pub sent: usize,
    pub terminated_outdated_strategy: usize,
    pub terminated_send_failed: usize,
    pub skipped: usize,
}

/// Runs the two daily campaigns against the store.
pub struct CampaignRunner {
    store: ProspectStore,
    sender: Arc<dyn MessageSender>,
    generator: Arc<dyn MessageGenerator>,
    gate: StrategyGate,
    config: OutreachConfig,
}

impl CampaignRunner {
    pub fn new(
        store: ProspectStore,
        sender: Arc<dyn MessageSender>,
        generator: Arc<dyn MessageGenerator>,
        gate: StrategyGate,
        config: OutreachConfig,
    ) -> Self {
        Self {
            store,
            sender,
            generator,
            gate,
            config,
        }
    }

    /// First-touch campaign: send the stored draft to every record that has
    /// never been contacted, acting on at most `max_emails` records per run.
    ///
    /// Records missing a subject, body or recipient are closed out with
    /// `Missing Data`; transport failures close the record with
    /// `Sending Failed`. Terminations count against the cap like sends do,
    /// so one run never transitions more than `max_emails` records.
    pub async fn run_initial_sending(
        &self,
        max_emails: usize,
        now: NaiveDateTime,
    ) -> Result<SendReport> {
        let prospects = self.store.fetch_all().await.context("reading store")?;
        let mut report = SendReport::default();
        let mut batch = UpdateBatch::new();
        let mut acted = 0usize;

        for prospect in &prospects {
            if acted >= max_emails {
                info!(cap = max_emails, "daily send cap reached");
                break;
            }
            if !prospect.sent_date.trim().is_empty() || !prospect.status().contactable() {
                continue;
            }
            let key = prospect.key();
            if key.is_empty() {
                warn!(name = %prospect.name, "record has no usable website key; skipping");
                continue;
            }
            report.considered += 1;

            let draft_complete =
                !prospect.subject.trim().is_empty() && !prospect.body.trim().is_empty();
            let recipient = match prospect.primary_email() {
                Some(recipient) if draft_complete => recipient,
                _ => {
                    debug!(key, "draft incomplete; terminating");
                    batch.mark_bounced(&key, REASON_MISSING_DATA);
                    report.terminated_missing_data += 1;
                    acted += 1;
                    continue;
                }
            };

            acted += 1;
            report.attempted += 1;
            match self
                .sender
                .send(&recipient, &prospect.subject, &prospect.body)
                .await
            {
                Ok(()) => {
                    batch.set_timestamp(&key, col::SENT_DATE, now);
                    report.sent += 1;
                    tokio::time::sleep(self.config.inter_send_delay).await;
                }
                Err(err) => {
                    warn!(key, %err, "initial send failed; terminating");
                    batch.mark_bounced(&key, REASON_SENDING_FAILED);
                    report.terminated_send_failed += 1;
                }
            }
        }

        if !batch.is_empty() {
            batch
                .apply(&self.store)
                .await
                .context("writing send outcomes")?;
        }
        info!(
            considered = report.considered,
            attempted = report.attempted,
            sent = report.sent,
            "initial sending complete"
        );
        Ok(report)
    }

    /// Follow-up campaign: for every record due a follow-up at `now`, check
    /// strategy alignment, generate a stage-appropriate message, and send it.
    /// Acts on at most `limit` records per run; strategy closures count
    /// against the cap like sends do.
    pub async fn run_follow_ups(&self, limit: usize, now: NaiveDateTime) -> Result<FollowUpReport> {
        let prospects = self.store.fetch_all().await.context("reading store")?;
        let mut report = FollowUpReport {
            considered: prospects.len(),
            ..FollowUpReport::default()
        };
        let mut batch = UpdateBatch::new();
        let mut acted = 0usize;

        for prospect in &prospects {
            if acted >= limit {
                info!(cap = limit, "follow-up cap reached");
                break;
            }
            let Some(stage) = follow_up_due(prospect, now) else {
                continue;
            };
            report.eligible += 1;
            let key = prospect.key();
            if key.is_empty() {
                warn!(name = %prospect.name, "record has no usable website key; skipping");
                report.skipped += 1;
                continue;
            }

            match self.gate.check(prospect) {
                GateVerdict::Aligned => {}
                GateVerdict::Misaligned => {
                    info!(key, "pitch no longer matches offering; closing without sending");
                    batch.mark_bounced(&key, REASON_OUTDATED_STRATEGY);
                    report.terminated_outdated_strategy += 1;
                    acted += 1;
                    continue;
                }
                GateVerdict::Unreadable => {
                    debug!(key, "proposed solutions unreadable; skipping this cycle");
                    report.skipped += 1;
                    continue;
                }
            }

            let Some(recipient) = prospect.primary_email() else {
                warn!(key, "no usable recipient; skipping");
                report.skipped += 1;
                continue;
            };
            let message = match self.generator.follow_up(prospect, stage).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!(key, stage, "generator declined a follow-up");
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    warn!(key, stage, %err, "follow-up generation failed; skipping");
                    report.skipped += 1;
                    continue;
                }
            };

            acted += 1;
            report.attempted += 1;
            match self
                .sender
                .send(&recipient, &message.subject, &message.body)
                .await
            {
                Ok(()) => {
                    batch.set_timestamp(&key, FOLLOW_UP_COLUMNS[(stage - 1) as usize], now);
                    report.sent += 1;
                    tokio::time::sleep(self.config.inter_send_delay).await;
                }
                Err(err) => {
                    warn!(key, stage, %err, "follow-up send failed; terminating");
                    batch.mark_bounced(&key, REASON_SENDING_FAILED);
                    report.terminated_send_failed += 1;
                }
            }
        }

        if !batch.is_empty() {
            batch
                .apply(&self.store)
                .await
                .context("writing follow-up outcomes")?;
        }
        info!(
            eligible = report.eligible,
            attempted = report.attempted,
            sent = report.sent,
            "follow-up run complete"
        );
        Ok(report)
    }
}
