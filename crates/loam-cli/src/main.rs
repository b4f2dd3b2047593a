use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use loam_enrich::{
    HttpMessageSender, LlmClient, LlmConfig, PlacesDiscovery, ScrapingContactFinder,
    SiteContentAnalyzer, VerifierClient,
};
use loam_outreach::{CampaignRunner, OutreachConfig, StrategyGate};
use loam_pipeline::{PipelineConfig, ProspectPipeline};
use loam_store::{HttpGrid, HttpGridConfig, ProspectStore};
use loam_sync::{BounceSource, CampaignConfig};
use loam_web::{AppState, JobExecutor, JobRegistry, LogRingBuffer, RingBufferLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "loam")]
#[command(about = "Lead outreach automation: build, send, follow up, maintain")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Discover new prospects, enrich them, and append message-ready rows.
    Build {
        /// Discovery query; falls back to the campaign file.
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        max_leads: Option<usize>,
        #[arg(long, default_value_t = 10)]
        workers: usize,
    },
    /// Send stored drafts to never-contacted prospects.
    Send {
        #[arg(long)]
        max_emails: Option<usize>,
    },
    /// Send due follow-ups.
    FollowUps {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Mark prospects whose mail bounced.
    Bounces,
    /// Remove duplicate rows, keeping the most recent per website.
    Dedupe,
    /// Recompute last_contact_date for every row.
    Backfill,
    /// Run the control panel.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8000")]
        addr: String,
    },
}

#[derive(Debug, Clone)]
struct EnvConfig {
    store_base_url: String,
    store_token: String,
    places_base_url: String,
    places_key: String,
    verifier_base_url: String,
    verifier_key: Option<String>,
    llm_base_url: String,
    llm_key: String,
    llm_model: String,
    mail_base_url: String,
    mail_token: String,
    mail_from: String,
    campaign_file: PathBuf,
    http_timeout_secs: u64,
}

impl EnvConfig {
    fn from_env() -> Self {
        Self {
            store_base_url: std::env::var("LOAM_STORE_URL")
                .unwrap_or_else(|_| "http://localhost:9700".to_string()),
            store_token: std::env::var("LOAM_STORE_TOKEN").unwrap_or_default(),
            places_base_url: std::env::var("LOAM_PLACES_URL")
                .unwrap_or_else(|_| "http://localhost:9701".to_string()),
            places_key: std::env::var("LOAM_PLACES_KEY").unwrap_or_default(),
            verifier_base_url: std::env::var("LOAM_VERIFIER_URL")
                .unwrap_or_else(|_| "https://api.hunter.io/v2".to_string()),
            verifier_key: std::env::var("LOAM_VERIFIER_KEY").ok(),
            llm_base_url: std::env::var("LOAM_LLM_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            llm_key: std::env::var("LOAM_LLM_KEY").unwrap_or_default(),
            llm_model: std::env::var("LOAM_LLM_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            mail_base_url: std::env::var("LOAM_MAIL_URL")
                .unwrap_or_else(|_| "http://localhost:9702".to_string()),
            mail_token: std::env::var("LOAM_MAIL_TOKEN").unwrap_or_default(),
            mail_from: std::env::var("LOAM_MAIL_FROM")
                .unwrap_or_else(|_| "outreach@localhost".to_string()),
            campaign_file: std::env::var("LOAM_CAMPAIGN_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("campaign.yaml")),
            http_timeout_secs: std::env::var("LOAM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
        }
    }
}

/// Bounce events from the send API's event feed.
struct MailEventBounceSource {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl MailEventBounceSource {
    fn new(base_url: &str, api_token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building bounce source client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
        })
    }
}

#[async_trait]
impl BounceSource for MailEventBounceSource {
    async fn bounced_recipients(&self) -> Result<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct BounceFeed {
            #[serde(default)]
            recipients: Vec<String>,
        }
        let url = format!("{}/events/bounces", self.base_url);
        let feed: BounceFeed = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("requesting bounce events")?
            .error_for_status()
            .context("bounce event feed rejected the request")?
            .json()
            .await
            .context("reading bounce events")?;
        Ok(feed.recipients)
    }
}

/// Fully wired application: store, collaborators, campaign settings.
struct App {
    store: ProspectStore,
    places: Arc<PlacesDiscovery>,
    contact_finder: Arc<ScrapingContactFinder>,
    verifier: Arc<VerifierClient>,
    content: Arc<SiteContentAnalyzer>,
    llm: Arc<LlmClient>,
    sender: Arc<HttpMessageSender>,
    bounces: MailEventBounceSource,
    campaign: CampaignConfig,
}

impl App {
    fn from_env(config: &EnvConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let grid = HttpGrid::new(HttpGridConfig::new(
            config.store_base_url.clone(),
            config.store_token.clone(),
        ))
        .context("building store client")?;
        let campaign = if config.campaign_file.exists() {
            CampaignConfig::from_file(&config.campaign_file)?
        } else {
            tracing::warn!(
                file = %config.campaign_file.display(),
                "campaign file not found; using built-in defaults"
            );
            CampaignConfig {
                discovery_query: String::new(),
                max_leads: 25,
                daily_send_cap: 50,
                strategy_keywords: Vec::new(),
            }
        };
        Ok(Self {
            store: ProspectStore::new(Arc::new(grid)),
            places: Arc::new(PlacesDiscovery::new(
                config.places_base_url.clone(),
                config.places_key.clone(),
            )?),
            contact_finder: Arc::new(ScrapingContactFinder::new(timeout)?),
            verifier: Arc::new(VerifierClient::new(
                config.verifier_base_url.clone(),
                config.verifier_key.clone(),
            )?),
            content: Arc::new(SiteContentAnalyzer::new(timeout)?),
            llm: Arc::new(LlmClient::new(LlmConfig::new(
                config.llm_base_url.clone(),
                config.llm_key.clone(),
                config.llm_model.clone(),
            ))?),
            sender: Arc::new(HttpMessageSender::new(
                config.mail_base_url.clone(),
                config.mail_token.clone(),
                config.mail_from.clone(),
            )?),
            bounces: MailEventBounceSource::new(
                &config.mail_base_url,
                &config.mail_token,
                timeout,
            )?,
            campaign,
        })
    }

    fn pipeline(&self, workers: usize) -> ProspectPipeline {
        ProspectPipeline::new(
            self.store.clone(),
            self.places.clone(),
            self.contact_finder.clone(),
            self.verifier.clone(),
            self.places.clone(),
            self.content.clone(),
            self.llm.clone(),
            self.llm.clone(),
            PipelineConfig {
                worker_count: workers,
                ..PipelineConfig::default()
            },
        )
    }

    fn runner(&self) -> CampaignRunner {
        CampaignRunner::new(
            self.store.clone(),
            self.sender.clone(),
            self.llm.clone(),
            StrategyGate::new(self.campaign.strategy_keywords.clone()),
            OutreachConfig::default(),
        )
    }

    async fn build(&self, query: Option<String>, max_leads: Option<usize>, workers: usize) -> Result<String> {
        let query = query.unwrap_or_else(|| self.campaign.discovery_query.clone());
        if query.trim().is_empty() {
            bail!("no discovery query given; pass --query or set it in the campaign file");
        }
        let max_leads = max_leads.unwrap_or(self.campaign.max_leads);
        let summary = self.pipeline(workers).build(&query, max_leads).await?;
        Ok(format!(
            "build complete: discovered={} new={} verified={} appended={}",
            summary.discovered,
            summary.new_candidates,
            summary.with_verified_contacts,
            summary.appended
        ))
    }

    async fn send(&self, max_emails: Option<usize>) -> Result<String> {
        let cap = max_emails.unwrap_or(self.campaign.daily_send_cap);
        let report = self.runner().run_initial_sending(cap, now()).await?;
        Ok(format!(
            "sending complete: sent={} missing_data={} failed={}",
            report.sent, report.terminated_missing_data, report.terminated_send_failed
        ))
    }

    async fn follow_ups(&self, limit: Option<usize>) -> Result<String> {
        let cap = limit.unwrap_or(self.campaign.daily_send_cap);
        let report = self.runner().run_follow_ups(cap, now()).await?;
        Ok(format!(
            "follow-ups complete: eligible={} sent={} outdated_strategy={} failed={}",
            report.eligible,
            report.sent,
            report.terminated_outdated_strategy,
            report.terminated_send_failed
        ))
    }

    async fn process_bounces(&self) -> Result<String> {
        let report = loam_sync::process_bounces(&self.store, &self.bounces).await?;
        Ok(format!(
            "bounce processing complete: reported={} matched={}",
            report.reported, report.matched
        ))
    }

    async fn dedupe(&self) -> Result<String> {
        let report = loam_sync::deduplicate(&self.store).await?;
        Ok(format!(
            "dedupe complete: scanned={} removed={}",
            report.scanned, report.removed
        ))
    }

    async fn backfill(&self) -> Result<String> {
        let report = loam_sync::backfill_last_contact(&self.store).await?;
        Ok(format!(
            "backfill complete: scanned={} corrected={}",
            report.scanned, report.corrected
        ))
    }
}

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

struct CampaignExecutor {
    app: Arc<App>,
}

#[async_trait]
impl JobExecutor for CampaignExecutor {
    fn job_names(&self) -> Vec<String> {
        ["build", "send", "follow-ups", "bounces", "dedupe", "backfill"]
            .iter()
            .map(|n| n.to_string())
            .collect()
    }

    async fn run(&self, name: &str) -> Result<String> {
        match name {
            "build" => self.app.build(None, None, 10).await,
            "send" => self.app.send(None).await,
            "follow-ups" => self.app.follow_ups(None).await,
            "bounces" => self.app.process_bounces().await,
            "dedupe" => self.app.dedupe().await,
            "backfill" => self.app.backfill().await,
            other => bail!("unknown job '{other}'"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let logs = Arc::new(LogRingBuffer::default());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(RingBufferLayer::new(logs.clone()))
        .init();

    let cli = Cli::parse();
    let config = EnvConfig::from_env();
    let app = App::from_env(&config)?;

    match cli.command {
        Commands::Build {
            query,
            max_leads,
            workers,
        } => println!("{}", app.build(query, max_leads, workers).await?),
        Commands::Send { max_emails } => println!("{}", app.send(max_emails).await?),
        Commands::FollowUps { limit } => println!("{}", app.follow_ups(limit).await?),
        Commands::Bounces => println!("{}", app.process_bounces().await?),
        Commands::Dedupe => println!("{}", app.dedupe().await?),
        Commands::Backfill => println!("{}", app.backfill().await?),
        Commands::Serve { addr } => {
            let app = Arc::new(app);
            let schedule = loam_sync::ScheduleConfig::from_env();
            let scheduler = loam_sync::maybe_build_scheduler(
                &schedule,
                {
                    let app = app.clone();
                    move || {
                        let app = app.clone();
                        tokio::spawn(async move {
                            if let Err(err) = app.send(None).await {
                                tracing::error!(%err, "scheduled sending failed");
                            }
                        });
                    }
                },
                {
                    let app = app.clone();
                    move || {
                        let app = app.clone();
                        tokio::spawn(async move {
                            if let Err(err) = app.follow_ups(None).await {
                                tracing::error!(%err, "scheduled follow-ups failed");
                            }
                        });
                    }
                },
            )
            .await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
            }

            let state = AppState::new(
                Arc::new(JobRegistry::new()),
                logs,
                Arc::new(CampaignExecutor { app: app.clone() }),
                app.store.clone(),
            );
            loam_web::serve(state, &addr).await?;
        }
    }

    Ok(())
}
