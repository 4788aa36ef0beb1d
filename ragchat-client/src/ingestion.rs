//! Ingestion status polling
//!
//! The backend periodically ingests news articles into its vector store.
//! [`IngestionMonitor`] polls that job's status on a fixed interval so a UI
//! can show when the corpus was last refreshed. It shares nothing with the
//! chat engine.

use chrono::{DateTime, Local, Utc};
use ragchat_core::config::IngestionConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::IngestionSource;

/// Counters of the backend ingestion job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionStats {
    #[serde(default)]
    pub total_runs: u64,
    #[serde(default)]
    pub successful_runs: u64,
    #[serde(default)]
    pub failed_runs: u64,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub last_run_at: Option<String>,
    #[serde(default)]
    pub last_success_at: Option<String>,
    #[serde(default)]
    pub last_error_at: Option<String>,
}

/// Response of `GET /news/status`
///
/// Timestamps are kept as the backend sent them; they are not guaranteed to
/// parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionStatus {
    #[serde(default)]
    pub last_update: Option<String>,
    #[serde(default)]
    pub last_update_formatted: String,
    #[serde(default)]
    pub next_update: Option<String>,
    #[serde(default)]
    pub next_update_formatted: String,
    #[serde(default)]
    pub document_count: u64,
    #[serde(default)]
    pub cron_enabled: bool,
    #[serde(default)]
    pub cron_interval: u64,
    #[serde(default)]
    pub cron_interval_formatted: String,
    #[serde(default)]
    pub stats: IngestionStats,
}

impl IngestionStatus {
    /// Most recent successful update: `lastUpdate`, else `stats.lastSuccessAt`
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_update
            .as_deref()
            .and_then(parse_time)
            .or_else(|| self.stats.last_success_at.as_deref().and_then(parse_time))
    }

    /// One-word health marker
    pub fn indicator(&self) -> &'static str {
        if self.stats.is_running {
            "updating"
        } else if self.stats.last_error_at.is_some() {
            "warning"
        } else {
            "ok"
        }
    }

    /// Compact freshness text such as "5m ago"
    pub fn summary(&self, now: DateTime<Utc>) -> String {
        if self.stats.is_running {
            return "Updating...".to_string();
        }
        if let Some(at) = self.updated_at() {
            let minutes = (now - at).num_minutes();
            return if minutes < 1 {
                "Just updated".to_string()
            } else if minutes < 60 {
                format!("{}m ago", minutes)
            } else if minutes < 1440 {
                format!("{}h ago", minutes / 60)
            } else {
                format!("{}d ago", minutes / 1440)
            };
        }
        if self.document_count > 0 {
            "Ready".to_string()
        } else {
            "No updates yet".to_string()
        }
    }

    /// Local-time rendering of the last update
    pub fn last_update_display(&self) -> String {
        match self.updated_at() {
            Some(at) => at.with_timezone(&Local).format("%b %-d, %I:%M %p").to_string(),
            None if self.document_count > 0 => "Unknown".to_string(),
            None => "Never".to_string(),
        }
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Periodic poller of the ingestion status
pub struct IngestionMonitor {
    source: Arc<dyn IngestionSource>,
    enabled: bool,
    interval: Duration,
    refresh_delay: Duration,
    latest: Arc<RwLock<Option<IngestionStatus>>>,
    last_error: Arc<RwLock<Option<String>>>,
    running: Arc<RwLock<bool>>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl IngestionMonitor {
    pub fn new(source: Arc<dyn IngestionSource>, config: &IngestionConfig) -> Self {
        Self {
            source,
            enabled: config.enabled,
            interval: Duration::from_secs(config.poll_interval_secs),
            refresh_delay: Duration::from_secs(1),
            latest: Arc::new(RwLock::new(None)),
            last_error: Arc::new(RwLock::new(None)),
            running: Arc::new(RwLock::new(false)),
            task: RwLock::new(None),
        }
    }

    /// Override the poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Override the pause between a manual trigger and the follow-up refresh
    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    /// Start polling. Polls once immediately, then every interval.
    pub async fn start(&self) {
        if !self.enabled {
            info!("Ingestion status polling disabled");
            return;
        }

        {
            let mut running = self.running.write().await;
            if *running {
                debug!("Ingestion monitor already running");
                return;
            }
            *running = true;
        }

        let poller = Poller {
            source: Arc::clone(&self.source),
            latest: Arc::clone(&self.latest),
            last_error: Arc::clone(&self.last_error),
        };
        let running = Arc::clone(&self.running);
        let interval = self.interval;
        let task = tokio::spawn(async move {
            loop {
                if !*running.read().await {
                    break;
                }
                let _ = poller.poll().await;
                tokio::time::sleep(interval).await;
            }
        });

        *self.task.write().await = Some(task);
        info!("Ingestion monitor started (every {:?})", self.interval);
    }

    /// Stop polling
    pub async fn stop(&self) {
        *self.running.write().await = false;
        if let Some(task) = self.task.write().await.take() {
            task.abort();
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Fetch the status now
    pub async fn refresh(&self) -> ragchat_core::Result<IngestionStatus> {
        self.poller().poll().await
    }

    /// Ask the backend to run ingestion, then refresh the status
    pub async fn trigger_update(&self) -> ragchat_core::Result<IngestionStatus> {
        if let Err(e) = self.source.trigger_ingestion().await {
            warn!("Failed to trigger ingestion: {}", e);
            *self.last_error.write().await = Some(e.user_message());
            return Err(e);
        }
        info!("Ingestion update triggered");
        tokio::time::sleep(self.refresh_delay).await;
        self.refresh().await
    }

    /// Last successfully fetched status
    pub async fn latest(&self) -> Option<IngestionStatus> {
        self.latest.read().await.clone()
    }

    /// Error from the most recent failed fetch, cleared by the next success
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    fn poller(&self) -> Poller {
        Poller {
            source: Arc::clone(&self.source),
            latest: Arc::clone(&self.latest),
            last_error: Arc::clone(&self.last_error),
        }
    }
}

/// Handle moved into the poll task
struct Poller {
    source: Arc<dyn IngestionSource>,
    latest: Arc<RwLock<Option<IngestionStatus>>>,
    last_error: Arc<RwLock<Option<String>>>,
}

impl Poller {
    async fn poll(&self) -> ragchat_core::Result<IngestionStatus> {
        match self.source.ingestion_status().await {
            Ok(status) => {
                debug!(
                    documents = status.document_count,
                    running = status.stats.is_running,
                    "ingestion status refreshed"
                );
                *self.latest.write().await = Some(status.clone());
                *self.last_error.write().await = None;
                Ok(status)
            }
            Err(e) => {
                warn!("Failed to fetch ingestion status: {}", e);
                *self.last_error.write().await = Some(e.user_message());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use ragchat_core::Error;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeSource {
        polls: AtomicUsize,
        triggers: AtomicUsize,
        failing: AtomicBool,
    }

    impl FakeSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                polls: AtomicUsize::new(0),
                triggers: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl IngestionSource for FakeSource {
        async fn ingestion_status(&self) -> ragchat_core::Result<IngestionStatus> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::transport(Some(503), r#"{"error":"Service unavailable"}"#));
            }
            let n = self.polls.fetch_add(1, Ordering::SeqCst) as u64;
            Ok(IngestionStatus {
                document_count: 100 + n,
                ..Default::default()
            })
        }

        async fn trigger_ingestion(&self) -> ragchat_core::Result<()> {
            self.triggers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn monitor(source: Arc<FakeSource>) -> IngestionMonitor {
        IngestionMonitor::new(source, &IngestionConfig::default())
            .with_interval(Duration::from_millis(20))
            .with_refresh_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_status_deserializes_camel_case() {
        let status: IngestionStatus = serde_json::from_value(serde_json::json!({
            "lastUpdate": "2024-05-01T10:00:00Z",
            "lastUpdateFormatted": "May 1, 10:00 AM",
            "nextUpdate": null,
            "nextUpdateFormatted": "Not scheduled",
            "documentCount": 42,
            "cronEnabled": true,
            "cronInterval": 3600000,
            "cronIntervalFormatted": "1 hour",
            "stats": {
                "totalRuns": 3,
                "successfulRuns": 2,
                "failedRuns": 1,
                "isRunning": false,
                "lastRunAt": "2024-05-01T10:00:00Z",
                "lastSuccessAt": "2024-05-01T10:00:00Z",
                "lastErrorAt": null
            }
        }))
        .unwrap();

        assert_eq!(status.document_count, 42);
        assert_eq!(status.stats.failed_runs, 1);
        assert!(status.next_update.is_none());
        assert_eq!(status.indicator(), "ok");
    }

    #[test]
    fn test_summary_uses_freshest_timestamp() {
        let now = Utc::now();
        let mut status = IngestionStatus {
            document_count: 5,
            ..Default::default()
        };
        assert_eq!(status.summary(now), "Ready");
        assert_eq!(status.last_update_display(), "Unknown");

        status.stats.last_success_at = Some((now - ChronoDuration::minutes(5)).to_rfc3339());
        assert_eq!(status.summary(now), "5m ago");

        status.last_update = Some((now - ChronoDuration::hours(3)).to_rfc3339());
        assert_eq!(status.summary(now), "3h ago");

        status.last_update = Some("garbage".to_string());
        assert_eq!(status.summary(now), "5m ago");

        status.stats.is_running = true;
        assert_eq!(status.summary(now), "Updating...");
        assert_eq!(status.indicator(), "updating");
    }

    #[test]
    fn test_summary_without_documents() {
        let status = IngestionStatus::default();
        assert_eq!(status.summary(Utc::now()), "No updates yet");
        assert_eq!(status.last_update_display(), "Never");
    }

    #[tokio::test]
    async fn test_refresh_records_latest_and_error() {
        let source = FakeSource::new();
        let monitor = monitor(Arc::clone(&source));

        let status = monitor.refresh().await.unwrap();
        assert_eq!(status.document_count, 100);
        assert_eq!(monitor.latest().await.unwrap().document_count, 100);

        source.failing.store(true, Ordering::SeqCst);
        assert!(monitor.refresh().await.is_err());
        assert_eq!(monitor.last_error().await.as_deref(), Some("Service unavailable"));
        // The previous good status is kept
        assert_eq!(monitor.latest().await.unwrap().document_count, 100);

        source.failing.store(false, Ordering::SeqCst);
        monitor.refresh().await.unwrap();
        assert!(monitor.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_trigger_update_refreshes() {
        let source = FakeSource::new();
        let monitor = monitor(Arc::clone(&source));

        let status = monitor.trigger_update().await.unwrap();
        assert_eq!(source.triggers.load(Ordering::SeqCst), 1);
        assert_eq!(status.document_count, 100);
    }

    #[tokio::test]
    async fn test_start_polls_until_stopped() {
        let source = FakeSource::new();
        let monitor = monitor(Arc::clone(&source));

        monitor.start().await;
        assert!(monitor.is_running().await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.stop().await;
        assert!(!monitor.is_running().await);

        let polls = source.polls.load(Ordering::SeqCst);
        assert!(polls >= 2, "expected repeated polls, got {}", polls);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(source.polls.load(Ordering::SeqCst), polls);
    }

    #[tokio::test]
    async fn test_disabled_monitor_does_not_start() {
        let source = FakeSource::new();
        let config = IngestionConfig {
            enabled: false,
            ..Default::default()
        };
        let monitor = IngestionMonitor::new(source, &config);
        monitor.start().await;
        assert!(!monitor.is_running().await);
    }
}
