use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::config::PublishersConfig;
use cadence_core::types::Platform;
use serde::Serialize;
use tracing::info;

use crate::webhook::WebhookPublisher;

/// Payload handed to a platform publisher for one occurrence.
#[derive(Debug, Clone, Serialize)]
pub struct PublishRequest {
    pub platform: Platform,
    pub content: String,
    pub media_refs: Vec<String>,
}

/// What a platform reported back for an accepted post.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Identifier the platform assigned to the post, if it returned one.
    pub external_post_id: Option<String>,
}

/// Common interface for platform adapters (webhook, native APIs, test fakes).
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Adapter name for logging.
    fn name(&self) -> &str;

    /// Publish one post. Any `Err` counts as a failed platform result.
    async fn publish(&self, req: &PublishRequest) -> Result<PublishReceipt, PublishError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("no publisher configured for platform {0}")]
    NoPublisher(Platform),

    #[error("{0}")]
    Other(String),
}

/// Maps platform identifiers to the publisher that serves them.
#[derive(Clone, Default)]
pub struct PublisherRegistry {
    publishers: HashMap<Platform, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build webhook publishers for every `[[publishers.webhooks]]` entry.
    pub fn from_config(cfg: &PublishersConfig) -> Self {
        let mut registry = Self::new();
        for hook in &cfg.webhooks {
            let platform = Platform::new(&hook.platform);
            if platform.is_empty() {
                continue;
            }
            info!(%platform, url = %hook.url, "registering webhook publisher");
            registry.register(
                platform.clone(),
                Arc::new(WebhookPublisher::new(platform, &hook.url, hook.token.clone())),
            );
        }
        registry
    }

    /// Register (or replace) the publisher for `platform`.
    pub fn register(&mut self, platform: impl Into<Platform>, publisher: Arc<dyn Publisher>) {
        self.publishers.insert(platform.into(), publisher);
    }

    pub fn get(&self, platform: &Platform) -> Option<Arc<dyn Publisher>> {
        self.publishers.get(platform).cloned()
    }

    /// Registered platforms, sorted.
    pub fn platforms(&self) -> Vec<Platform> {
        let mut out: Vec<_> = self.publishers.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}
