// =============================================================================
// Notifier — outbound alert delivery
// =============================================================================
//
// Alerts leave the engine as webhook embeds. Delivery is best-effort: a
// failed send marks the persisted alert record, nothing retries here (the
// webhook service owns queueing and rate limits).
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

/// One field of an alert embed.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Webhook-compatible embed payload.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEmbed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<EmbedField>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one alert, optionally with a rendered chart image.
    async fn send_alert(&self, embed: &AlertEmbed, image_png: Option<&[u8]>)
        -> anyhow::Result<()>;
}

// =============================================================================
// Webhook implementation
// =============================================================================

/// Posts embeds to a Discord-compatible webhook. With an image attached the
/// payload goes out as multipart; without, as plain JSON.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            url: url.into(),
            client,
        }
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    embeds: [&'a AlertEmbed; 1],
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_alert(
        &self,
        embed: &AlertEmbed,
        image_png: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        let body = WebhookBody { embeds: [embed] };

        let response = match image_png {
            Some(bytes) => {
                let payload = serde_json::to_string(&body)?;
                let form = reqwest::multipart::Form::new()
                    .text("payload_json", payload)
                    .part(
                        "files[0]",
                        reqwest::multipart::Part::bytes(bytes.to_vec())
                            .file_name("chart.png")
                            .mime_str("image/png")?,
                    );
                self.client.post(&self.url).multipart(form).send().await?
            }
            None => self.client.post(&self.url).json(&body).send().await?,
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("webhook returned {status}: {text}");
        }
        debug!(title = %embed.title, "alert delivered to webhook");
        Ok(())
    }
}

// =============================================================================
// Log-only implementation
// =============================================================================

/// Fallback used when no webhook URL is configured: alerts land in the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_alert(
        &self,
        embed: &AlertEmbed,
        _image_png: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        info!(title = %embed.title, description = %embed.description, "ALERT");
        Ok(())
    }
}
