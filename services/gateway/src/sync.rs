//! Registry synchronization.
//!
//! Polls a JSON registry document from a file or an HTTP endpoint and
//! swaps it into the [`ServiceRegistry`] whenever it changes. The document
//! looks like:
//!
//! ```json
//! {"services": [{"protocol": "stomp", "virtual_host": "orders", "address": "10.0.0.5:61613"}]}
//! ```
//!
//! Failed polls keep the previous registrations in place.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::proxy::{Registration, ServiceRegistry};

/// Where registry documents are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrySource {
    File(PathBuf),
    Http(String),
}

impl fmt::Display for RegistrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrySource::File(path) => write!(f, "file:{}", path.display()),
            RegistrySource::Http(url) => f.write_str(url),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub services: Vec<Registration>,
}

/// Fetch and parse the current registry document.
pub async fn fetch_registrations(
    client: &reqwest::Client,
    source: &RegistrySource,
) -> Result<Vec<Registration>> {
    let document: RegistryDocument = match source {
        RegistrySource::File(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read registry file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid registry JSON in {}", path.display()))?
        }
        RegistrySource::Http(url) => {
            let resp = client.get(url).send().await?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(anyhow::anyhow!(
                    "registry query failed (status={}): {}",
                    status,
                    body
                ));
            }

            resp.json::<RegistryDocument>()
                .await
                .context("Invalid registry JSON")?
        }
    };

    Ok(document.services)
}

/// Poll once and apply the result if it differs from `last`. Returns whether
/// the registry was updated.
pub async fn sync_once(
    client: &reqwest::Client,
    source: &RegistrySource,
    registry: &ServiceRegistry,
    last: &mut Option<Vec<Registration>>,
) -> Result<bool> {
    let registrations = fetch_registrations(client, source).await?;

    if last.as_ref() == Some(&registrations) {
        debug!(source = %source, "Registry unchanged");
        return Ok(false);
    }

    info!(
        source = %source,
        registration_count = registrations.len(),
        "Applying registry update"
    );
    registry.update(registrations.clone());
    *last = Some(registrations);
    Ok(true)
}

/// Keep the registry in sync with `source` until the task is dropped.
pub async fn run_registry_sync_loop(
    source: RegistrySource,
    registry: std::sync::Arc<ServiceRegistry>,
    poll_interval: Duration,
) -> Result<()> {
    let client = reqwest::Client::builder()
        .user_agent("mgw-gateway/0.1.0")
        .timeout(poll_interval.max(Duration::from_secs(5)))
        .build()?;

    info!(source = %source, poll_ms = poll_interval.as_millis() as u64, "Registry sync started");

    let mut last = None;
    loop {
        if let Err(e) = sync_once(&client, &source, &registry, &mut last).await {
            warn!(source = %source, error = %e, "failed to sync registry; retrying");
        }
        tokio::time::sleep(poll_interval).await;
    }
}
