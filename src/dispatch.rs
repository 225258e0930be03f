//! Fan-out of an alert batch into independent per-alert pipelines.
//!
//! Each alert is validated, projected into a notification and published on its own.
//! All pipelines of a batch run concurrently and every one of them runs to completion;
//! a failure is turned into a value at the pipeline boundary and only ever shows up in
//! the [`BatchOutcome`], the logs and the metrics.

use crate::{
    alertmanager::AlertBatch,
    metrics,
    notification::{BuildError, ExtractionMapping, NotificationBuilder},
    ntfy::{DeliveryError, NotificationSink},
    schema::{self, ValidationError},
};
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;

/// The pipeline step an alert failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Schema,
    Extraction,
    Notification,
    Delivery,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Schema => write!(f, "schema"),
            Stage::Extraction => write!(f, "extraction"),
            Stage::Notification => write!(f, "notification"),
            Stage::Delivery => write!(f, "delivery"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Schema(#[from] ValidationError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Schema(_) => Stage::Schema,
            PipelineError::Build(BuildError::Extraction { .. }) => Stage::Extraction,
            PipelineError::Build(_) => Stage::Notification,
            PipelineError::Delivery(_) => Stage::Delivery,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAlert {
    pub alert: String,
    pub stage: Stage,
    pub reason: String,
}

/// What happened to each alert of one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub delivered: Vec<String>,
    pub failed: Vec<FailedAlert>,
}

impl BatchOutcome {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

pub struct Dispatcher {
    builder: NotificationBuilder,
    sink: Arc<dyn NotificationSink>,
}

impl Dispatcher {
    pub fn new(builder: NotificationBuilder, sink: Arc<dyn NotificationSink>) -> Self {
        Self { builder, sink }
    }

    /// Run one pipeline per alert and wait for all of them to settle
    #[tracing::instrument(skip_all, fields(alerts = batch.len()))]
    pub async fn process_batch(
        &self,
        mapping: &ExtractionMapping,
        batch: AlertBatch,
    ) -> BatchOutcome {
        metrics::dispatch::record_alerts_received(batch.len());

        let pipelines = batch
            .alerts
            .into_iter()
            .enumerate()
            .map(|(index, document)| self.run_pipeline(mapping, index, document));

        let mut outcome = BatchOutcome::default();
        for (alert, result) in join_all(pipelines).await {
            match result {
                Ok(()) => outcome.delivered.push(alert),
                Err(e) => outcome.failed.push(FailedAlert {
                    alert,
                    stage: e.stage(),
                    reason: e.to_string(),
                }),
            }
        }

        tracing::info!(
            "Processed {} alerts: {} delivered, {} failed",
            outcome.total(),
            outcome.delivered.len(),
            outcome.failed.len()
        );

        outcome
    }

    async fn run_pipeline(
        &self,
        mapping: &ExtractionMapping,
        index: usize,
        document: Value,
    ) -> (String, Result<(), PipelineError>) {
        let alert = alert_identity(index, &document);
        let result = self.dispatch(mapping, &document).await;

        match &result {
            Ok(()) => {
                tracing::debug!("Alert '{}' delivered", alert);
                metrics::dispatch::record_alert_processed(None);
            }
            Err(e) => {
                tracing::warn!(alert = %alert, stage = %e.stage(), "Alert dropped: {}", e);
                metrics::dispatch::record_alert_processed(Some(e.stage()));
            }
        }

        (alert, result)
    }

    async fn dispatch(
        &self,
        mapping: &ExtractionMapping,
        document: &Value,
    ) -> Result<(), PipelineError> {
        let alert = schema::validate_alert(document)?;
        let notification = self.builder.build(mapping, &alert).await?;
        self.sink.send(&notification).await?;

        Ok(())
    }
}

/// The fingerprint when the alert carries one, its batch position otherwise
fn alert_identity(index: usize, document: &Value) -> String {
    document
        .get("fingerprint")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| format!("alerts[{index}]"))
}
