use std::sync::Arc;
use std::time::Duration;

use cadence_core::types::Platform;
use futures_util::future::join_all;
use tracing::{info, instrument, warn};

use crate::{
    clock::Clock,
    error::Result,
    publisher::{PublishError, PublishRequest, PublisherRegistry},
    retry::RetryPolicy,
    store::{Applied, ItemStore},
    transition::RunResult,
    types::{ClaimedItem, PlatformResult},
};

/// Executes one claimed occurrence: publish to every target platform, log the
/// per-platform results, then write the aggregate outcome back to the store.
#[derive(Clone)]
pub struct PublishWorker {
    store: ItemStore,
    registry: Arc<PublisherRegistry>,
    policy: RetryPolicy,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl PublishWorker {
    pub fn new(
        store: ItemStore,
        registry: Arc<PublisherRegistry>,
        policy: RetryPolicy,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            timeout,
            clock,
        }
    }

    #[instrument(skip(self, claim), fields(item_id = %claim.item.id))]
    pub async fn execute(&self, claim: ClaimedItem) -> Result<Applied> {
        if !self.store.renew_claim(&claim, self.clock.now())? {
            info!("claim no longer held; skipping publish");
            return Ok(Applied::Suppressed);
        }

        let item = &claim.item;
        let occurrence = item.occurrence_count.saturating_add(1);
        let attempt = item.attempt_count.saturating_add(1);

        let results = join_all(
            item.platforms
                .iter()
                .map(|p| self.publish_one(p, &item.content, &item.media_refs)),
        )
        .await;

        if let Err(e) = self
            .store
            .record_attempts(&item.id, occurrence, attempt, &results, self.clock.now())
        {
            warn!("failed to record publish attempts: {e}");
        }

        let result = aggregate(&results);
        match &result {
            RunResult::Published => {
                info!(occurrence, attempt, platforms = results.len(), "occurrence published")
            }
            RunResult::Failed(error) => warn!(occurrence, attempt, %error, "occurrence failed"),
        }

        self.store
            .apply_outcome(&claim, &result, &self.policy, self.clock.now())
    }

    async fn publish_one(
        &self,
        platform: &Platform,
        content: &str,
        media_refs: &[String],
    ) -> PlatformResult {
        let Some(publisher) = self.registry.get(platform) else {
            return PlatformResult::failed(
                platform.clone(),
                PublishError::NoPublisher(platform.clone()).to_string(),
            );
        };

        let req = PublishRequest {
            platform: platform.clone(),
            content: content.to_string(),
            media_refs: media_refs.to_vec(),
        };

        let outcome = match tokio::time::timeout(self.timeout, publisher.publish(&req)).await {
            Ok(res) => res,
            Err(_) => Err(PublishError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        };

        match outcome {
            Ok(receipt) => PlatformResult::ok(platform.clone(), receipt.external_post_id),
            Err(e) => {
                warn!(%platform, publisher = publisher.name(), "publish failed: {e}");
                PlatformResult::failed(platform.clone(), e.to_string())
            }
        }
    }
}

/// All-or-nothing: one failed platform fails the occurrence.
fn aggregate(results: &[PlatformResult]) -> RunResult {
    let errors: Vec<String> = results
        .iter()
        .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {e}", r.platform)))
        .collect();
    if errors.is_empty() {
        RunResult::Published
    } else {
        RunResult::Failed(errors.join("; "))
    }
}
