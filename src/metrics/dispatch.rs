use super::{Status, Timer};
use crate::dispatch::Stage;
use metrics::{counter, describe_counter, describe_histogram};

/// Register the metrics for the application
pub(super) fn register_metrics() {
    // Alerts received in accepted batches
    describe_counter!(
        "alerts_received_total",
        "Total number of alerts received in accepted batches"
    );

    // Alerts that went through the pipeline. Labeled with the status and, for failures, the stage.
    describe_counter!(
        "alerts_processed_total",
        "Total number of alerts processed, by outcome"
    );

    // Publish attempts towards ntfy, labeled with the status (success or failure).
    describe_counter!(
        "notifications_sent_total",
        "Total number of notifications published to ntfy"
    );

    describe_histogram!(
        "notification_delivery_duration_seconds",
        "Duration of notification deliveries to ntfy in seconds"
    );
}

/// Record the number of alerts in an accepted batch
pub fn record_alerts_received(count: usize) {
    counter!("alerts_received_total").increment(count as u64);
}

/// Record the outcome of one alert pipeline
pub fn record_alert_processed(failed_stage: Option<Stage>) {
    match failed_stage {
        None => counter!("alerts_processed_total", "status" => Status::Success.to_string())
            .increment(1),
        Some(stage) => counter!(
            "alerts_processed_total",
            "status" => Status::Failure.to_string(),
            "stage" => stage.to_string()
        )
        .increment(1),
    }
}

/// Record a publish attempt with the given status
pub fn record_notification_sent(status: Status) {
    counter!("notifications_sent_total", "status" => status.to_string()).increment(1);
}

/// Create a timer for a delivery to ntfy
pub fn delivery_timer() -> Timer {
    Timer::new("notification_delivery_duration_seconds")
}
