//! Crawl orchestration: single-flight crawler subprocess runs and the cron schedule.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use cuponera_core::{Discount, DiscountDraft, DiscountPatch, DiscountRef};
use cuponera_store::{InsertOutcome, RecordStore};
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cuponera-crawl";

/// Environment variable telling the crawler script where to write its
/// handoff file.
pub const HANDOFF_ENV_VAR: &str = "CUPONERA_CRAWL_OUT";

const STDERR_TAIL_LIMIT: usize = 2000;

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub script: PathBuf,
    pub interpreter_candidates: Vec<PathBuf>,
    pub handoff_path: PathBuf,
    pub job_timeout: Duration,
    pub cron: String,
    pub scheduler_enabled: bool,
}

impl CrawlConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("CUPONERA_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        Self {
            script: std::env::var("CUPONERA_CRAWLER_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./crawler-scripts/main.py")),
            interpreter_candidates: std::env::var("CUPONERA_PYTHON_CANDIDATES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|part| !part.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_else(|_| default_interpreter_candidates()),
            handoff_path: std::env::var(HANDOFF_ENV_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(&data_dir).join("crawl-out.json")),
            job_timeout: Duration::from_secs(
                std::env::var("CUPONERA_CRAWL_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
            cron: std::env::var("CUPONERA_CRAWL_CRON")
                .unwrap_or_else(|_| "0 0 3 * * *".to_string()),
            scheduler_enabled: std::env::var("CUPONERA_SCHEDULER_ENABLED")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
        }
    }
}

/// Project-local virtualenv interpreters first, then whatever `python3`
/// resolves to on PATH.
pub fn default_interpreter_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("./crawler-scripts/.venv/bin/python"),
        PathBuf::from("./.venv/bin/python"),
        PathBuf::from("python3"),
    ]
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("a crawl is already running")]
    Busy,
    #[error("no usable crawler interpreter among {candidates:?}")]
    InterpreterNotFound { candidates: Vec<PathBuf> },
    #[error("crawler process failed (exit code {exit_code:?}): {stderr_tail}")]
    JobFailed {
        exit_code: Option<i32>,
        stderr_tail: String,
    },
    #[error("crawler timed out after {0:?}")]
    JobTimeout(Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Pick the first usable interpreter. Path candidates must exist on disk;
/// bare command names pass through untouched for PATH lookup at spawn time.
pub async fn resolve_interpreter(candidates: &[PathBuf]) -> Result<PathBuf, CrawlError> {
    for candidate in candidates {
        if is_bare_command(candidate) {
            return Ok(candidate.clone());
        }
        if tokio::fs::try_exists(candidate).await.unwrap_or(false) {
            return Ok(candidate.clone());
        }
    }
    Err(CrawlError::InterpreterNotFound {
        candidates: candidates.to_vec(),
    })
}

fn is_bare_command(path: &Path) -> bool {
    !path.is_absolute() && path.components().count() == 1
}

fn tail_of(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_TAIL_LIMIT {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_LIMIT;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub errors: Vec<String>,
}

/// Runs the external crawler script and folds its handoff file into the
/// record store. At most one run is in flight at a time.
pub struct CrawlOrchestrator {
    config: CrawlConfig,
    store: Arc<dyn RecordStore>,
    running: Mutex<()>,
}

impl CrawlOrchestrator {
    pub fn new(config: CrawlConfig, store: Arc<dyn RecordStore>) -> Self {
        Self {
            config,
            store,
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    /// Run one crawl now. A call while another run is in flight is rejected
    /// with [`CrawlError::Busy`] instead of queueing behind it.
    pub async fn run_once(&self) -> Result<CrawlReport, CrawlError> {
        let _guard = self.running.try_lock().map_err(|_| CrawlError::Busy)?;
        self.run_job().await
    }

    async fn run_job(&self) -> Result<CrawlReport, CrawlError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, script = %self.config.script.display(), "starting crawl run");

        let interpreter = resolve_interpreter(&self.config.interpreter_candidates).await?;
        if let Some(parent) = self.config.handoff_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating handoff directory {}", parent.display()))?;
        }

        let child = Command::new(&interpreter)
            .arg(&self.config.script)
            .env(HANDOFF_ENV_VAR, &self.config.handoff_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning crawler via {}", interpreter.display()))?;

        let output =
            match tokio::time::timeout(self.config.job_timeout, child.wait_with_output()).await {
                Ok(result) => result.context("waiting for crawler process")?,
                Err(_) => return Err(CrawlError::JobTimeout(self.config.job_timeout)),
            };
        if !output.status.success() {
            return Err(CrawlError::JobFailed {
                exit_code: output.status.code(),
                stderr_tail: tail_of(&String::from_utf8_lossy(&output.stderr)),
            });
        }

        let drafts = self.read_handoff().await?;
        let report = self.ingest(run_id, started_at, drafts).await;
        info!(
            %run_id,
            processed = report.records_processed,
            inserted = report.inserted,
            updated = report.updated,
            errors = report.errors.len(),
            "crawl run finished"
        );
        Ok(report)
    }

    async fn read_handoff(&self) -> Result<Vec<DiscountDraft>, CrawlError> {
        let path = &self.config.handoff_path;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading handoff file {}", path.display()))?;
        let drafts = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing handoff file {}", path.display()))?;
        Ok(drafts)
    }

    /// Per-draft failures become report entries; one bad draft never aborts
    /// the rest of the batch.
    async fn ingest(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        drafts: Vec<DiscountDraft>,
    ) -> CrawlReport {
        let records_processed = drafts.len();
        let mut inserted = 0;
        let mut updated = 0;
        let mut errors = Vec::new();

        for draft in drafts {
            let label = format!("{}/{}", draft.source, draft.external_id);
            if draft.url.trim().is_empty() {
                errors.push(format!("{label}: missing target url"));
                continue;
            }
            let record = Discount::from_draft(draft.clone(), Utc::now());
            match self.store.insert_discount(record).await {
                Ok(InsertOutcome::Inserted(_)) => inserted += 1,
                Ok(InsertOutcome::Duplicate(existing)) => {
                    let reference = DiscountRef::from_id(existing.id);
                    match self
                        .store
                        .update_discount(&reference, DiscountPatch::Refresh(Box::new(draft)))
                        .await
                    {
                        Ok(_) => updated += 1,
                        Err(err) => errors.push(format!("{label}: refresh failed: {err}")),
                    }
                }
                Err(err) => errors.push(format!("{label}: insert failed: {err}")),
            }
        }

        CrawlReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            records_processed,
            inserted,
            updated,
            errors,
        }
    }
}

/// Start the cron schedule when enabled. The returned handle must be kept
/// alive for the lifetime of the process.
pub async fn maybe_start_scheduler(
    orchestrator: Arc<CrawlOrchestrator>,
) -> anyhow::Result<Option<JobScheduler>> {
    if !orchestrator.config.scheduler_enabled {
        info!("crawl scheduler disabled");
        return Ok(None);
    }

    let cron = orchestrator.config.cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.run_once().await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    inserted = report.inserted,
                    updated = report.updated,
                    errors = report.errors.len(),
                    "scheduled crawl finished"
                ),
                Err(CrawlError::Busy) => {
                    warn!("scheduled crawl skipped; previous run still in flight")
                }
                Err(err) => error!(error = %err, "scheduled crawl failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "crawl scheduler started");
    Ok(Some(sched))
}
