use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::models::{Document, Webhook, WebhookEvent};

type HmacSha256 = Hmac<Sha256>;

/// Wire payload for every webhook delivery.
#[derive(Debug, serde::Serialize)]
struct WebhookPayload<'a> {
    success: bool,
    #[serde(rename = "type")]
    event: WebhookEvent,
    id: &'a str,
    data: &'a [Document],
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a serde_json::Value>,
}

/// Delivers webhook events as HMAC-signed JSON POSTs.
///
/// Fire-and-forget: there are no retries; idempotency comes from the event
/// type plus id, and failures are logged. Deliveries are filtered against the
/// webhook's event subscription list.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    secret: String,
}

impl WebhookNotifier {
    pub fn new(secret: String, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to build webhook client");
        WebhookNotifier { client, secret }
    }

    /// Whether this webhook subscribes to the event. An empty list means all.
    pub fn wants(webhook: &Webhook, event: WebhookEvent) -> bool {
        webhook.events.is_empty() || webhook.events.contains(&event)
    }

    pub async fn deliver(
        &self,
        webhook: &Webhook,
        event: WebhookEvent,
        id: &str,
        success: bool,
        data: &[Document],
        error: Option<&str>,
    ) {
        if !Self::wants(webhook, event) {
            return;
        }

        let payload = WebhookPayload {
            success,
            event,
            id,
            data,
            error,
            metadata: webhook.metadata.as_ref(),
        };

        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize webhook payload");
                return;
            }
        };

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();

        // HMAC-SHA256(timestamp + body), same convention as inbound auth.
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC can take key of any size");
        mac.update(timestamp.as_bytes());
        mac.update(body.as_bytes());
        let signature = format!("hmac-sha256={}", hex::encode(mac.finalize().into_bytes()));

        let mut request = self
            .client
            .post(&webhook.url)
            .header("Content-Type", "application/json")
            .header("X-Timestamp", &timestamp)
            .header("X-Signature", &signature);
        for (name, value) in &webhook.headers {
            request = request.header(name, value);
        }

        match request.body(body).send().await {
            Ok(resp) => {
                tracing::info!(
                    status = resp.status().as_u16(),
                    event = ?event,
                    id = %id,
                    "Webhook delivered"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, event = ?event, id = %id, "Webhook delivery failed");
            }
        }
    }
}
