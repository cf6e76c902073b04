//! Pipeline orchestrator.
//!
//! A job runs one of two stage sequences for a channel:
//!
//! | Variant  | Stages                      | Default policy |
//! |----------|-----------------------------|----------------|
//! | `Local`  | Export(json) → Ingest → Index | `continue`   |
//! | `Remote` | Export(html) → Upload → Relocate | `abort`   |
//!
//! Each stage is bracketed by ledger entries: `Initiating` before it runs and
//! `Complete` or `Failed` after. A stage failure never escapes the
//! orchestrator; it is recorded and the policy decides whether the next stage
//! runs. The job ends with an `Archive` summary entry.
//!
//! A job is admitted only when the readiness source (job records by default,
//! or the ledger's first line) reports ready. A busy answer writes nothing.
//! Admission touches only the local database; the channel name is looked up
//! once the job runs, so a trigger can answer without waiting on the chat
//! platform. A job admitted with [`Orchestrator::begin`] must be handed to
//! [`Orchestrator::execute`].

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::chat::{notify_best_effort, ChatPlatform, DiscordClient, Notice};
use crate::config::{Config, StatusSource};
use crate::db;
use crate::error::{StageError, StageResult};
use crate::exporter::{export_destination, CommandExporter, ExportFormat, TranscriptExporter};
use crate::index::{self, VectorIndex};
use crate::ingest;
use crate::jobs::JobStore;
use crate::ledger::{Ledger, LedgerEntry, Outcome, Readiness};
use crate::mask::mask_single_line;
use crate::models::Artifact;
use crate::relocate::relocate_channel;
use crate::storage::{self, ObjectStore, S3Store};
use crate::store::MessageStore;

pub const STAGE_EXPORT: &str = "Export";
pub const STAGE_INGEST: &str = "Ingest";
pub const STAGE_INDEX: &str = "Index";
pub const STAGE_UPLOAD: &str = "Upload";
pub const STAGE_RELOCATE: &str = "Relocate";
pub const STAGE_CALLBACK: &str = "Callback";
pub const STAGE_ARCHIVE: &str = "Archive";

/// What happens to the remaining stages after one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    Continue,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineVariant {
    Local,
    Remote,
}

impl PipelineVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineVariant::Local => "local",
            PipelineVariant::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub local_policy: FailurePolicy,
    pub remote_policy: FailurePolicy,
    pub stage_timeout: Duration,
    pub status_source: StatusSource,
    pub raw_dir: PathBuf,
    pub archives_dir: PathBuf,
    pub default_guild_id: Option<String>,
    pub archive_category_id: Option<String>,
    pub archive_site_url: Option<String>,
    pub callback_url: Option<String>,
}

impl PipelineSettings {
    pub fn new(archives_dir: impl Into<PathBuf>) -> Self {
        let archives_dir = archives_dir.into();
        Self {
            local_policy: FailurePolicy::Continue,
            remote_policy: FailurePolicy::Abort,
            stage_timeout: Duration::from_secs(900),
            status_source: StatusSource::Jobs,
            raw_dir: archives_dir.join("raw"),
            archives_dir,
            default_guild_id: None,
            archive_category_id: None,
            archive_site_url: None,
            callback_url: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            local_policy: config.pipeline.local_policy,
            remote_policy: config.pipeline.remote_policy,
            stage_timeout: Duration::from_secs(config.pipeline.stage_timeout_secs),
            status_source: config.pipeline.status_source,
            raw_dir: config.archive.raw_dir(),
            archives_dir: config.archive.archives_dir.clone(),
            default_guild_id: config.chat.guild_id.clone(),
            archive_category_id: config.chat.archive_category_id.clone(),
            archive_site_url: config.chat.archive_site_url.clone(),
            callback_url: config.pipeline.callback_url.clone(),
        }
    }

    /// How long a job record may go without progress before it counts as
    /// abandoned: one full stage plus slack for the lookups between stages.
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stage_timeout).unwrap_or_else(|_| chrono::Duration::days(1))
            + chrono::Duration::minutes(5)
    }

    fn policy(&self, variant: PipelineVariant) -> FailurePolicy {
        match variant {
            PipelineVariant::Local => self.local_policy,
            PipelineVariant::Remote => self.remote_policy,
        }
    }
}

/// An admitted job. Exists from admission until its summary is written.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveJob {
    pub job_id: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub subject: String,
    pub variant: PipelineVariant,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub outcome: Outcome,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: ArchiveJob,
    pub stages: Vec<StageReport>,
    pub artifact: Option<Artifact>,
    pub outcome: Outcome,
}

impl JobReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Complete
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    /// Another job was running; nothing was recorded.
    Busy,
    Finished(JobReport),
}

pub struct Orchestrator {
    settings: PipelineSettings,
    ledger: Ledger,
    jobs: JobStore,
    store: MessageStore,
    exporter: Arc<dyn TranscriptExporter>,
    index: Arc<dyn VectorIndex>,
    objects: Option<Arc<dyn ObjectStore>>,
    chat: Option<Arc<dyn ChatPlatform>>,
    http: reqwest::Client,
    admission: Mutex<()>,
    /// Set from admission until the summary entry is written.
    active: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        settings: PipelineSettings,
        ledger: Ledger,
        pool: SqlitePool,
        exporter: Arc<dyn TranscriptExporter>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        let jobs = JobStore::new(pool.clone()).with_stale_after(settings.stale_after());
        Self {
            settings,
            ledger,
            jobs,
            store: MessageStore::new(pool),
            exporter,
            index,
            objects: None,
            chat: None,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            admission: Mutex::new(()),
            active: AtomicBool::new(false),
        }
    }

    pub fn with_object_store(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatPlatform>) -> Self {
        self.chat = Some(chat);
        self
    }

    /// Wire every collaborator from configuration. The chat token is read
    /// from `DISCORD_API_TOKEN`.
    pub fn from_config(config: &Config, pool: SqlitePool) -> Result<Self> {
        let token = crate::mask::secret_env("DISCORD_API_TOKEN")
            .context("DISCORD_API_TOKEN environment variable not set")?;

        let exporter = Arc::new(CommandExporter::new(&config.exporter, token.clone()));
        let index = index::index_from_config(config, pool.clone())?;
        let chat = Arc::new(DiscordClient::new(&config.chat, token)?);

        let mut orchestrator = Self::new(
            PipelineSettings::from_config(config),
            Ledger::new(&config.archive.ledger_path),
            pool,
            exporter,
            index,
        )
        .with_chat(chat);

        if let Some(storage) = &config.storage {
            orchestrator = orchestrator.with_object_store(Arc::new(S3Store::from_config(storage)?));
        }
        Ok(orchestrator)
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub async fn readiness(&self) -> Result<Readiness> {
        if self.active.load(Ordering::SeqCst) {
            return Ok(Readiness::Busy);
        }
        match self.settings.status_source {
            StatusSource::Jobs => Ok(self.jobs.readiness().await?),
            StatusSource::Ledger => self.ledger.read_status(),
        }
    }

    /// Admit a job if the archiver is ready. Returns `None` when busy, in
    /// which case nothing has been written.
    pub async fn begin(
        &self,
        channel_id: &str,
        guild_id: Option<&str>,
        variant: PipelineVariant,
    ) -> Result<Option<ArchiveJob>> {
        let _guard = self.admission.lock().await;
        if self.readiness().await? == Readiness::Busy {
            info!(channel = channel_id, "archiver busy, job not started");
            return Ok(None);
        }

        let guild_id = guild_id
            .map(str::to_string)
            .or_else(|| self.settings.default_guild_id.clone());
        let subject = fallback_subject(channel_id);

        let record = self
            .jobs
            .start(channel_id, guild_id.as_deref(), &subject, variant.as_str())
            .await?;
        self.active.store(true, Ordering::SeqCst);

        Ok(Some(ArchiveJob {
            job_id: record.id,
            channel_id: channel_id.to_string(),
            guild_id,
            subject,
            variant,
            started_at: record.started_at,
        }))
    }

    /// Admit and run a job to completion.
    pub async fn run(
        &self,
        channel_id: &str,
        guild_id: Option<&str>,
        variant: PipelineVariant,
    ) -> Result<JobOutcome> {
        match self.begin(channel_id, guild_id, variant).await? {
            Some(job) => Ok(JobOutcome::Finished(self.execute(job).await)),
            None => Ok(JobOutcome::Busy),
        }
    }

    /// Run the stages of an admitted job. Never fails; every stage error is
    /// captured in the report and the ledger.
    pub async fn execute(&self, mut job: ArchiveJob) -> JobReport {
        if let Some(name) = self.channel_name(&job.channel_id).await {
            job.subject = name;
            if let Err(e) = self.jobs.update_subject(&job.job_id, &job.subject).await {
                warn!(job = %job.job_id, error = %e, "could not update job subject");
            }
        }
        self.record(&LedgerEntry::new(
            STAGE_ARCHIVE,
            Outcome::Initiating,
            &job.subject,
        ));

        info!(
            job = %job.job_id,
            channel = %job.channel_id,
            variant = job.variant.as_str(),
            "job started"
        );

        let mut run = JobRun {
            job,
            stages: Vec::new(),
            artifact: None,
        };
        match run.job.variant {
            PipelineVariant::Local => self.run_local(&mut run).await,
            PipelineVariant::Remote => self.run_remote(&mut run).await,
        }
        self.finish(run).await
    }

    async fn run_local(&self, run: &mut JobRun) {
        let policy = self.settings.policy(PipelineVariant::Local);
        let channel_id = run.job.channel_id.clone();
        let raw_dir = self.settings.raw_dir.clone();

        let dest = export_destination(&raw_dir, &channel_id, ExportFormat::Json, Utc::now());
        let exported = self
            .run_stage(run, STAGE_EXPORT, async {
                self.exporter
                    .export(&channel_id, ExportFormat::Json, &dest)
                    .await
            })
            .await;
        if exported.is_none() && policy == FailurePolicy::Abort {
            return;
        }

        let ingested = self
            .run_stage(run, STAGE_INGEST, async {
                ingest::ingest_pending(&self.store, &raw_dir).await
            })
            .await;
        if ingested.is_none() && policy == FailurePolicy::Abort {
            return;
        }

        self.run_stage(run, STAGE_INDEX, async {
            index::index_pending(&self.store, self.index.as_ref()).await
        })
        .await;
    }

    async fn run_remote(&self, run: &mut JobRun) {
        let policy = self.settings.policy(PipelineVariant::Remote);
        let channel_id = run.job.channel_id.clone();
        let subject = run.job.subject.clone();
        let guild_id = run.job.guild_id.clone();

        let dest = export_destination(
            &self.settings.archives_dir,
            &channel_id,
            ExportFormat::HtmlDark,
            Utc::now(),
        );
        let exported = self
            .run_stage(run, STAGE_EXPORT, async {
                self.exporter
                    .export(&channel_id, ExportFormat::HtmlDark, &dest)
                    .await
            })
            .await;
        if exported.is_none() {
            if let Some(chat) = &self.chat {
                notify_best_effort(chat.as_ref(), &channel_id, &Notice::export_failed()).await;
            }
        }

        let mut proceed = exported.is_some() || policy == FailurePolicy::Continue;
        if proceed {
            let uploaded = self
                .run_stage(run, STAGE_UPLOAD, async {
                    let objects = self.objects.as_ref().ok_or_else(|| {
                        StageError::Data("object storage is not configured".into())
                    })?;
                    storage::upload_artifact(
                        objects.as_ref(),
                        &dest,
                        &subject,
                        ExportFormat::HtmlDark.content_type(),
                    )
                    .await
                })
                .await;
            proceed = uploaded.is_some() || policy == FailurePolicy::Continue;
            if !proceed {
                if let Some(chat) = &self.chat {
                    notify_best_effort(chat.as_ref(), &channel_id, &Notice::export_failed()).await;
                }
            }
            run.artifact = uploaded;
        }

        if proceed {
            self.run_stage(run, STAGE_RELOCATE, async {
                let chat = self
                    .chat
                    .as_ref()
                    .ok_or_else(|| StageError::Data("chat platform is not configured".into()))?;
                let category = self.settings.archive_category_id.as_deref().ok_or_else(|| {
                    StageError::Data("chat.archive_category_id is not configured".into())
                })?;
                let guild = guild_id
                    .as_deref()
                    .ok_or_else(|| StageError::Data("no guild id for this job".into()))?;
                relocate_channel(
                    chat.as_ref(),
                    &channel_id,
                    guild,
                    category,
                    self.settings.archive_site_url.as_deref(),
                )
                .await
            })
            .await;
        }

        if let Some(url) = self.settings.callback_url.clone() {
            let payload = CallbackPayload {
                channel_id: channel_id.clone(),
                guild_id: guild_id.clone(),
                success: run.failed_stages().is_empty(),
                archive_url: run.artifact.as_ref().map(|a| a.public_url.clone()),
            };
            self.run_stage(run, STAGE_CALLBACK, self.post_callback(&url, &payload))
                .await;
        }
    }

    async fn post_callback(&self, url: &str, payload: &CallbackPayload) -> StageResult<()> {
        let resp = self.http.post(url).json(payload).send().await?;
        if !resp.status().is_success() {
            return Err(StageError::Transport(format!(
                "callback returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Bracket one stage with ledger entries and the stage timeout.
    async fn run_stage<T, F>(&self, run: &mut JobRun, stage: &str, fut: F) -> Option<T>
    where
        F: Future<Output = StageResult<T>>,
    {
        let subject = run.job.subject.clone();
        self.record(&LedgerEntry::new(stage, Outcome::Initiating, &subject));
        if let Err(e) = self.jobs.update_stage(&run.job.job_id, stage).await {
            warn!(job = %run.job.job_id, error = %e, "could not update job stage");
        }

        let secs = self.settings.stage_timeout.as_secs();
        let result = match tokio::time::timeout(self.settings.stage_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout(secs)),
        };

        match result {
            Ok(value) => {
                self.record(&LedgerEntry::new(stage, Outcome::Complete, &subject));
                run.stages.push(StageReport {
                    stage: stage.to_string(),
                    outcome: Outcome::Complete,
                    detail: None,
                });
                Some(value)
            }
            Err(e) => {
                let detail = mask_single_line(&e.to_string());
                warn!(stage, kind = e.kind(), error = %detail, "stage failed");
                self.record(
                    &LedgerEntry::new(stage, Outcome::Failed, &subject).with_detail(&detail),
                );
                run.stages.push(StageReport {
                    stage: stage.to_string(),
                    outcome: Outcome::Failed,
                    detail: Some(detail),
                });
                None
            }
        }
    }

    async fn finish(&self, run: JobRun) -> JobReport {
        let failed = run.failed_stages();
        let (outcome, detail) = if failed.is_empty() {
            (Outcome::Complete, None)
        } else {
            (Outcome::Failed, Some(format!("failed: {}", failed.join(", "))))
        };

        let mut entry = LedgerEntry::new(STAGE_ARCHIVE, outcome, &run.job.subject);
        if let Some(d) = &detail {
            entry = entry.with_detail(d);
        }
        self.record(&entry);

        if let Err(e) = self
            .jobs
            .finish(&run.job.job_id, outcome, detail.as_deref())
            .await
        {
            warn!(job = %run.job.job_id, error = %e, "could not record job outcome");
        }
        info!(job = %run.job.job_id, outcome = outcome.as_str(), "job finished");
        self.active.store(false, Ordering::SeqCst);

        JobReport {
            job: run.job,
            stages: run.stages,
            artifact: run.artifact,
            outcome,
        }
    }

    async fn channel_name(&self, channel_id: &str) -> Option<String> {
        let chat = self.chat.as_ref()?;
        match chat.channel_name(channel_id).await {
            Ok(name) if !name.is_empty() => Some(name),
            Ok(_) => None,
            Err(e) => {
                warn!(channel = channel_id, error = %e, "could not look up channel name");
                None
            }
        }
    }

    fn record(&self, entry: &LedgerEntry) {
        if let Err(e) = self.ledger.append(entry) {
            warn!(error = %e, "ledger write failed");
        }
    }
}

fn fallback_subject(channel_id: &str) -> String {
    format!("channel-{}", channel_id)
}

struct JobRun {
    job: ArchiveJob,
    stages: Vec<StageReport>,
    artifact: Option<Artifact>,
}

impl JobRun {
    /// Failed stages that count against the job; the callback does not.
    fn failed_stages(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|s| s.outcome == Outcome::Failed && s.stage != STAGE_CALLBACK)
            .map(|s| s.stage.clone())
            .collect()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CallbackPayload {
    channel_id: String,
    guild_id: Option<String>,
    success: bool,
    archive_url: Option<String>,
}

/// `arc lurk` / `arc export`: run one job in the foreground.
pub async fn run_job(
    config: &Config,
    channel_id: &str,
    guild_id: Option<&str>,
    variant: PipelineVariant,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let orchestrator = Orchestrator::from_config(config, pool.clone())?;

    match orchestrator.run(channel_id, guild_id, variant).await? {
        JobOutcome::Busy => {
            println!("busy: another archive job is running; try again later");
        }
        JobOutcome::Finished(report) => {
            println!("{} {}", variant.as_str(), report.job.subject);
            for stage in &report.stages {
                match &stage.detail {
                    Some(detail) => {
                        println!("  {}: {} ({})", stage.stage, stage.outcome.as_str(), detail)
                    }
                    None => println!("  {}: {}", stage.stage, stage.outcome.as_str()),
                }
            }
            if let Some(artifact) = &report.artifact {
                println!("  url: {}", artifact.public_url);
            }
            println!("{}", report.outcome.as_str().to_lowercase());
        }
    }

    pool.close().await;
    Ok(())
}

/// `arc status`: readiness, message store counts, and the recent ledger window.
///
/// With `reset`, every running job record is failed first, and a ledger
/// whose newest line is `Initiating` gets a closing `Failed: Archive` entry.
pub async fn run_status(config: &Config, window_hours: i64, reset: bool) -> Result<()> {
    let ledger = Ledger::new(&config.archive.ledger_path);
    let pool = db::connect(config).await?;
    let jobs = JobStore::new(pool.clone())
        .with_stale_after(PipelineSettings::from_config(config).stale_after());

    if reset {
        let abandoned = jobs.abandon_running().await?;
        let closed = reset_ledger(&ledger)?;
        println!(
            "reset: {} job(s) marked failed{}",
            abandoned,
            if closed { ", ledger closed" } else { "" }
        );
    }

    let readiness = match config.pipeline.status_source {
        StatusSource::Ledger => ledger.read_status()?,
        StatusSource::Jobs => jobs.readiness().await?,
    };
    let stats = MessageStore::new(pool.clone()).stats().await?;
    pool.close().await;

    println!(
        "status: {}",
        match readiness {
            Readiness::Ready => "ready",
            Readiness::Busy => "busy",
        }
    );
    println!(
        "messages: {} ({} indexed, {} pending)",
        stats.total, stats.indexed, stats.pending
    );
    println!(
        "{}",
        ledger.render_recent_activity(chrono::Duration::hours(window_hours))?
    );
    Ok(())
}

/// Close a ledger left busy by an interrupted run. Returns whether an entry
/// was written.
pub fn reset_ledger(ledger: &Ledger) -> Result<bool> {
    if ledger.read_status()? == Readiness::Ready {
        return Ok(false);
    }
    let subject = ledger
        .first_record()?
        .as_deref()
        .and_then(LedgerEntry::parse)
        .map(|entry| entry.subject)
        .unwrap_or_else(|| "unknown".to_string());
    ledger.append(
        &LedgerEntry::new(STAGE_ARCHIVE, Outcome::Failed, subject)
            .with_detail(crate::jobs::ABANDONED_DETAIL),
    )?;
    Ok(true)
}
