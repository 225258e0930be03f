use crate::{
    config::Ntfy as NtfyConfig,
    metrics::{self, Status},
    notification::Notification,
};
use async_trait::async_trait;
use reqwest::Client;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("sink rejected the notification: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("sink unreachable: {0}")]
    Unreachable(String),
}

/// Where built notifications are delivered
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

pub struct Ntfy {
    config: NtfyConfig,
    client: Client,
}

impl Ntfy {
    /// Create a new ntfy client
    pub fn new(config: NtfyConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.timeout())
            .build()?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl NotificationSink for Ntfy {
    /// Publish a notification through ntfy's JSON endpoint
    #[tracing::instrument(skip_all, fields(topic = %notification.topic))]
    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let _timer = metrics::dispatch::delivery_timer();

        let result = match self
            .client
            .post(&self.config.url)
            .json(notification)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();

                Err(DeliveryError::Rejected {
                    status,
                    body: body.trim().to_string(),
                })
            }
            Err(e) => Err(DeliveryError::Unreachable(e.to_string())),
        };

        match &result {
            Ok(()) => {
                tracing::debug!("Notification published");
                metrics::dispatch::record_notification_sent(Status::Success);
            }
            Err(_) => metrics::dispatch::record_notification_sent(Status::Failure),
        }

        result
    }
}
