//! Delivery of tracking events to the collector endpoint

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::EventDescriptor;
use crate::config::TrackingConfig;
use crate::error::RelayError;

#[async_trait]
pub trait Collector: Send + Sync {
    async fn deliver(&self, event: &EventDescriptor) -> Result<(), RelayError>;
}

/// POSTs url-encoded events to the collector
pub struct HttpCollector {
    client: reqwest::Client,
    url: String,
}

impl HttpCollector {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn deliver(&self, event: &EventDescriptor) -> Result<(), RelayError> {
        debug!("Sending event to collector: {:?}", event);
        let response = self.client.post(&self.url).form(event).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Logs events instead of sending them
pub struct DryRunCollector;

#[async_trait]
impl Collector for DryRunCollector {
    async fn deliver(&self, event: &EventDescriptor) -> Result<(), RelayError> {
        info!("Would send event to collector: {:?}", event);
        Ok(())
    }
}

/// Collector for the configured mode
pub fn from_config(config: &TrackingConfig) -> Result<Arc<dyn Collector>> {
    if config.test_mode {
        return Ok(Arc::new(DryRunCollector));
    }
    Ok(Arc::new(HttpCollector::new(
        &config.collector_url,
        Duration::from_secs(config.timeout_secs),
    )?))
}

/// Forwards delivered events to a channel
#[cfg(test)]
pub(crate) struct ChannelCollector(pub tokio::sync::mpsc::UnboundedSender<EventDescriptor>);

#[cfg(test)]
#[async_trait]
impl Collector for ChannelCollector {
    async fn deliver(&self, event: &EventDescriptor) -> Result<(), RelayError> {
        let _ = self.0.send(event.clone());
        Ok(())
    }
}
