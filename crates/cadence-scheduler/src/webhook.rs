use async_trait::async_trait;
use cadence_core::types::Platform;
use serde_json::Value;
use tracing::{debug, warn};

use crate::publisher::{PublishError, PublishReceipt, PublishRequest, Publisher};

/// Publishes by POSTing `{platform, content, media_refs}` as JSON to a fixed URL.
///
/// Any 2xx response is a success. If the body is a JSON object carrying
/// `post_id` (or `id`), it is kept as the external post identifier.
pub struct WebhookPublisher {
    client: reqwest::Client,
    platform: Platform,
    url: String,
    token: Option<String>,
}

impl WebhookPublisher {
    pub fn new(platform: Platform, url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            platform,
            url: url.to_string(),
            token,
        }
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn publish(&self, req: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        debug!(platform = %self.platform, url = %self.url, "posting to webhook");

        let mut builder = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .json(req);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder.send().await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(platform = %self.platform, status, body = %text, "webhook rejected post");
            return Err(PublishError::Rejected {
                status,
                message: text,
            });
        }

        let text = resp.text().await.unwrap_or_default();
        Ok(PublishReceipt {
            external_post_id: external_id(&text),
        })
    }
}

fn external_id(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let id = value.get("post_id").or_else(|| value.get("id"))?;
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
