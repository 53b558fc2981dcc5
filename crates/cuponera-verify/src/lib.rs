//! Offer URL verification: headless-browser and plain-http liveness probes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, EventResponseReceived};
use chromiumoxide::Page;
use chrono::{DateTime, Utc};
use cuponera_core::{Discount, DiscountPatch, DiscountRef};
use cuponera_store::{RecordStore, StoreError};
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cuponera-verify";

/// Desktop Chrome user agent; several coupon sites refuse obvious bots.
pub const PROBE_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// How long to wait for the navigation response event after a goto returns.
const STATUS_CAPTURE_WINDOW: Duration = Duration::from_secs(2);

/// Slack on top of the probe timeout before a record is abandoned outright.
const PASS_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    Browser,
    Http,
}

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub probe_timeout: Duration,
    pub interval: Duration,
    pub concurrency: usize,
    pub mode: ProbeMode,
}

impl VerifyConfig {
    pub fn from_env() -> Self {
        Self {
            probe_timeout: Duration::from_secs(
                std::env::var("CUPONERA_PROBE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(15),
            ),
            interval: Duration::from_secs(
                std::env::var("CUPONERA_VERIFY_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3600),
            ),
            concurrency: std::env::var("CUPONERA_VERIFY_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            mode: match std::env::var("CUPONERA_PROBE_MODE").as_deref() {
                Ok("http") => ProbeMode::Http,
                _ => ProbeMode::Browser,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("probe timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("http status {0}")]
    BadStatus(u16),
}

/// A reachable URL. `status` is absent when navigation succeeded but no
/// classifiable response event was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSuccess {
    pub status: Option<u16>,
}

#[async_trait]
pub trait ProbeClient: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ProbeSuccess, ProbeFailure>;
}

/// Plain-http prober. Redirects are followed; the final response decides.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(PROBE_USER_AGENT)
            .build()
            .context("building http probe client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProbeClient for HttpProber {
    async fn probe(&self, url: &str) -> Result<ProbeSuccess, ProbeFailure> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        let status = response.status();
        if status.is_success() {
            Ok(ProbeSuccess {
                status: Some(status.as_u16()),
            })
        } else {
            Err(ProbeFailure::BadStatus(status.as_u16()))
        }
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> ProbeFailure {
    if err.is_timeout() {
        ProbeFailure::Timeout
    } else {
        ProbeFailure::Network(err.to_string())
    }
}

/// Headless-browser prober. One shared browser process; each probe gets a
/// fresh page that is closed again before the verdict is returned.
pub struct BrowserProber {
    browser: Mutex<Browser>,
    timeout: Duration,
}

impl BrowserProber {
    pub async fn launch(timeout: Duration) -> anyhow::Result<Self> {
        let config = BrowserConfig::builder()
            .arg(format!("--user-agent={PROBE_USER_AGENT}"))
            .build()
            .map_err(anyhow::Error::msg)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("launching headless browser")?;
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        Ok(Self {
            browser: Mutex::new(browser),
            timeout,
        })
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        let mut browser = self.browser.lock().await;
        browser.close().await.context("closing headless browser")?;
        Ok(())
    }
}

#[async_trait]
impl ProbeClient for BrowserProber {
    async fn probe(&self, url: &str) -> Result<ProbeSuccess, ProbeFailure> {
        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|err| ProbeFailure::Network(err.to_string()))?
        };
        let outcome = navigate(&page, url, self.timeout).await;
        if let Err(err) = page.close().await {
            debug!(error = %err, url, "failed to close probe page");
        }
        outcome
    }
}

async fn navigate(page: &Page, url: &str, timeout: Duration) -> Result<ProbeSuccess, ProbeFailure> {
    if let Err(err) = page.execute(EnableParams::default()).await {
        debug!(error = %err, url, "could not enable network events");
    }
    let mut responses = match page.event_listener::<EventResponseReceived>().await {
        Ok(stream) => Some(stream),
        Err(err) => {
            debug!(error = %err, url, "could not subscribe to response events");
            None
        }
    };

    match tokio::time::timeout(timeout, page.goto(url)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => return Err(ProbeFailure::Network(err.to_string())),
        Err(_) => return Err(ProbeFailure::Timeout),
    }

    let Some(responses) = responses.as_mut() else {
        return Ok(ProbeSuccess { status: None });
    };

    // The navigation response is the first non-redirect html event;
    // redirect hops report 3xx and are skipped.
    let deadline = tokio::time::sleep(STATUS_CAPTURE_WINDOW);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            maybe_event = responses.next() => {
                let Some(event) = maybe_event else { break };
                let status = event.response.status as u16;
                if (300..400).contains(&status) {
                    continue;
                }
                let mime = event.response.mime_type.to_lowercase();
                if mime.contains("html") || event.response.url == url {
                    if (200..300).contains(&status) {
                        return Ok(ProbeSuccess { status: Some(status) });
                    }
                    return Err(ProbeFailure::BadStatus(status));
                }
            }
            _ = &mut deadline => break,
        }
    }
    Ok(ProbeSuccess { status: None })
}

/// Launch the configured prober, dropping back to plain http when no
/// browser binary is installed.
pub async fn build_prober(config: &VerifyConfig) -> anyhow::Result<Arc<dyn ProbeClient>> {
    if config.mode == ProbeMode::Http {
        return Ok(Arc::new(HttpProber::new(config.probe_timeout)?));
    }
    match BrowserProber::launch(config.probe_timeout).await {
        Ok(prober) => Ok(Arc::new(prober)),
        Err(err) => {
            warn!(error = %err, "headless browser unavailable; probing over plain http");
            Ok(Arc::new(HttpProber::new(config.probe_timeout)?))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checked: usize,
    pub verified: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

struct RecordOutcome {
    live: bool,
    error: Option<String>,
}

pub struct VerifyPipeline {
    store: Arc<dyn RecordStore>,
    prober: Arc<dyn ProbeClient>,
    config: VerifyConfig,
}

impl VerifyPipeline {
    pub fn new(store: Arc<dyn RecordStore>, prober: Arc<dyn ProbeClient>, config: VerifyConfig) -> Self {
        Self {
            store,
            prober,
            config,
        }
    }

    /// Probe every active record once and write the verdicts back.
    ///
    /// Only failing to list the records aborts the pass; each record's
    /// probe and write-back failures are folded into the report instead.
    pub async fn run_pass(&self) -> Result<VerificationReport, StoreError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let records = self.store.list_active().await?;
        let checked = records.len();
        info!(%run_id, records = checked, "starting verification pass");

        let deadline = self.config.probe_timeout + PASS_GRACE;
        let outcomes: Vec<RecordOutcome> = futures::stream::iter(records)
            .map(|record| {
                let store = self.store.clone();
                let prober = self.prober.clone();
                async move { verify_one(store, prober, record, deadline).await }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let verified = outcomes.iter().filter(|o| o.live).count();
        let errors: Vec<String> = outcomes.into_iter().filter_map(|o| o.error).collect();
        let report = VerificationReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            checked,
            verified,
            failed: checked - verified,
            errors,
        };
        info!(
            %run_id,
            checked = report.checked,
            verified = report.verified,
            failed = report.failed,
            errors = report.errors.len(),
            "verification pass finished"
        );
        Ok(report)
    }

    /// Periodic verification, first pass immediately.
    pub async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_pass().await {
                warn!(error = %err, "verification pass failed");
            }
        }
    }
}

async fn verify_one(
    store: Arc<dyn RecordStore>,
    prober: Arc<dyn ProbeClient>,
    record: Discount,
    deadline: Duration,
) -> RecordOutcome {
    // The target url is what gets verified; the affiliate link is a click
    // redirect, not the offer page.
    let url = record.url.clone();
    let outcome = match tokio::time::timeout(deadline, prober.probe(&url)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeFailure::Timeout),
    };
    let live = outcome.is_ok();
    match &outcome {
        Ok(success) => {
            info!(id = %record.id, url = %url, status = ?success.status, "offer url verified")
        }
        Err(failure) => {
            info!(id = %record.id, url = %url, reason = %failure, "offer url failed verification")
        }
    }

    let reference = DiscountRef::from_id(record.id);
    let patch = DiscountPatch::SetVerified {
        verified: live,
        at: Utc::now(),
    };
    let error = match store.update_discount(&reference, patch).await {
        Ok(_) => None,
        Err(err) => {
            warn!(id = %record.id, error = %err, "verification write-back failed");
            Some(format!("{}: write-back failed: {err}", record.id))
        }
    };
    RecordOutcome { live, error }
}
