//! Read access to the store of active alert documents.
//!
//! The matcher only ever reads. Documents that fail to parse are skipped
//! with a warning so one bad record cannot hide the rest.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use alertcast_sdk::objects::ActiveAlert;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::config::AlertSourceConfig;

#[derive(Debug, Error)]
pub enum AlertSourceError {
    #[error("failed to read alert file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to fetch alerts: {0}")]
    Http(#[from] reqwest::Error),

    #[error("alert store did not return a JSON array: {0}")]
    Format(#[from] serde_json::Error),
}

#[async_trait]
pub trait AlertSource: Send + Sync + 'static {
    /// Every document with `active == true`.
    async fn list_active(&self) -> Result<Vec<ActiveAlert>, AlertSourceError>;
}

/// Build the source described by `config`.
pub fn from_config(config: &AlertSourceConfig) -> Arc<dyn AlertSource> {
    match config {
        AlertSourceConfig::Disabled => Arc::new(StaticAlertSource::default()),
        AlertSourceConfig::File { path } => Arc::new(FileAlertSource::new(path.clone())),
        AlertSourceConfig::Http { url, timeout } => {
            Arc::new(HttpAlertSource::new(url.clone(), *timeout))
        }
    }
}

fn parse_documents(documents: Vec<Value>) -> Vec<ActiveAlert> {
    documents
        .into_iter()
        .filter_map(|doc| match serde_json::from_value::<ActiveAlert>(doc) {
            Ok(alert) => Some(alert),
            Err(e) => {
                warn!(error = %e, "Skipping malformed alert document");
                None
            }
        })
        .filter(|alert| alert.active)
        .collect()
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Alerts held in memory; replaceable at runtime.
#[derive(Default)]
pub struct StaticAlertSource {
    alerts: RwLock<Vec<ActiveAlert>>,
}

impl StaticAlertSource {
    pub fn new(alerts: Vec<ActiveAlert>) -> Self {
        Self {
            alerts: RwLock::new(alerts),
        }
    }

    pub fn replace(&self, alerts: Vec<ActiveAlert>) {
        let mut guard = self
            .alerts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = alerts;
    }
}

#[async_trait]
impl AlertSource for StaticAlertSource {
    async fn list_active(&self) -> Result<Vec<ActiveAlert>, AlertSourceError> {
        let guard = self
            .alerts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(guard.iter().filter(|a| a.active).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// JSON file
// ---------------------------------------------------------------------------

/// A JSON array on disk, re-read on every call so edits show up on the
/// next scan.
pub struct FileAlertSource {
    path: PathBuf,
}

impl FileAlertSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl AlertSource for FileAlertSource {
    async fn list_active(&self) -> Result<Vec<ActiveAlert>, AlertSourceError> {
        let raw = tokio::fs::read(&self.path).await?;
        let documents: Vec<Value> = serde_json::from_slice(&raw)?;
        Ok(parse_documents(documents))
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// GET endpoint returning a JSON array of alert documents.
pub struct HttpAlertSource {
    url: Url,
    client: reqwest::Client,
}

impl HttpAlertSource {
    pub fn new(url: Url, timeout: std::time::Duration) -> Self {
        Self {
            url,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl AlertSource for HttpAlertSource {
    async fn list_active(&self) -> Result<Vec<ActiveAlert>, AlertSourceError> {
        let documents: Vec<Value> = self
            .client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(parse_documents(documents))
    }
}
