//! Structural validation of everything that enters the relay: the webhook batch,
//! the individual alerts in it and the field mapping taken from the query string.
//!
//! Validation never stops at the first problem. Every violated field is collected
//! so that a caller gets the full picture in a single response.

use crate::{
    alertmanager::{Alert, AlertBatch, AlertStatus, Annotations},
    notification::{ExtractionMapping, NotificationField},
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use validator::ValidateUrl;

/// A single field that failed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Renders a list of violations as `path: message; path: message`
pub fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {subject}: {}", format_violations(.violations))]
pub struct ValidationError {
    pub subject: Subject,
    pub violations: Vec<Violation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Batch,
    Alert,
    Mapping,
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Batch => write!(f, "alert batch"),
            Subject::Alert => write!(f, "alert"),
            Subject::Mapping => write!(f, "query mapping"),
        }
    }
}

impl ValidationError {
    fn single(subject: Subject, path: &str, message: &str) -> Self {
        Self {
            subject,
            violations: vec![Violation::new(path, message)],
        }
    }
}

/// Validate the webhook envelope: a JSON object carrying an `alerts` array of objects.
///
/// The alerts themselves are checked later, one by one, so that a single malformed
/// alert only fails its own delivery.
pub fn validate_batch(raw: Value) -> Result<AlertBatch, ValidationError> {
    let Value::Object(mut metadata) = raw else {
        return Err(ValidationError::single(
            Subject::Batch,
            "$",
            "must be a JSON object",
        ));
    };

    let alerts = match metadata.remove("alerts") {
        Some(Value::Array(alerts)) => alerts,
        Some(_) => {
            return Err(ValidationError::single(
                Subject::Batch,
                "alerts",
                "must be an array",
            ));
        }
        None => {
            return Err(ValidationError::single(
                Subject::Batch,
                "alerts",
                "is required",
            ));
        }
    };

    let violations: Vec<Violation> = alerts
        .iter()
        .enumerate()
        .filter(|(_, alert)| !alert.is_object())
        .map(|(index, _)| Violation::new(format!("alerts[{index}]"), "must be an object"))
        .collect();

    if !violations.is_empty() {
        return Err(ValidationError {
            subject: Subject::Batch,
            violations,
        });
    }

    Ok(AlertBatch { alerts, metadata })
}

/// Validate one alert document against the Alertmanager alert shape
pub fn validate_alert(raw: &Value) -> Result<Alert, ValidationError> {
    let Some(object) = raw.as_object() else {
        return Err(ValidationError::single(
            Subject::Alert,
            "$",
            "must be a JSON object",
        ));
    };

    let mut fields = Fields::new(object);

    let status = fields.required::<AlertStatus>("status", "one of \"firing\", \"resolved\"");
    let labels = fields.required::<BTreeMap<String, String>>("labels", "a map of strings");
    let annotations = fields.required::<Annotations>("annotations", "a map of strings");
    let starts_at = fields.timestamp("startsAt");
    let ends_at = fields.timestamp("endsAt");
    let generator_url = fields.url("generatorURL");
    let fingerprint = fields.required::<String>("fingerprint", "a string");

    match (
        status,
        labels,
        annotations,
        starts_at,
        ends_at,
        generator_url,
        fingerprint,
    ) {
        (
            Some(status),
            Some(labels),
            Some(annotations),
            Some(starts_at),
            Some(ends_at),
            Some(generator_url),
            Some(fingerprint),
        ) if fields.violations.is_empty() => Ok(Alert {
            status,
            labels,
            annotations,
            starts_at,
            ends_at,
            generator_url,
            fingerprint,
        }),
        _ => Err(ValidationError {
            subject: Subject::Alert,
            violations: fields.violations,
        }),
    }
}

/// Longest query accepted for a single notification field, in bytes
pub const MAX_QUERY_LEN: usize = 1024;

/// Validate the query-string pairs of a request into an extraction mapping.
///
/// Pairs keep their order; a repeated field is not an error, the last entry wins
/// when the notification is assembled. Unknown keys are dropped.
pub fn validate_mapping<I, K, V>(pairs: I) -> Result<ExtractionMapping, ValidationError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let mut entries = Vec::new();
    let mut violations = Vec::new();

    for (key, query) in pairs {
        let key = key.as_ref();
        let Some(field) = NotificationField::from_name(key) else {
            tracing::debug!("Ignoring unknown query parameter '{}'", key);
            continue;
        };

        let query: String = query.into();
        if query.trim().is_empty() {
            violations.push(Violation::new(key, "query must not be empty"));
            continue;
        }
        if query.len() > MAX_QUERY_LEN {
            violations.push(Violation::new(
                key,
                format!("query must be at most {MAX_QUERY_LEN} bytes"),
            ));
            continue;
        }

        entries.push((field, query));
    }

    if !entries
        .iter()
        .any(|(field, _)| *field == NotificationField::Topic)
        && !violations.iter().any(|v| v.path == "topic")
    {
        violations.push(Violation::new("topic", "is required"));
    }

    if !violations.is_empty() {
        return Err(ValidationError {
            subject: Subject::Mapping,
            violations,
        });
    }

    Ok(ExtractionMapping::new(entries))
}

/// Parse a timestamp as RFC 3339, falling back to a naive timestamp read as UTC
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Some(timestamp.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Collects per-field results and violations for one JSON object
struct Fields<'a> {
    object: &'a Map<String, Value>,
    violations: Vec<Violation>,
}

impl<'a> Fields<'a> {
    fn new(object: &'a Map<String, Value>) -> Self {
        Self {
            object,
            violations: Vec::new(),
        }
    }

    fn present(&mut self, key: &str) -> Option<&'a Value> {
        let value = self.object.get(key);
        if value.is_none() {
            self.violations.push(Violation::new(key, "is required"));
        }
        value
    }

    fn required<T: DeserializeOwned>(&mut self, key: &str, expected: &str) -> Option<T> {
        let value = self.present(key)?;

        match serde_json::from_value::<T>(value.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                self.violations
                    .push(Violation::new(key, format!("must be {expected} ({e})")));
                None
            }
        }
    }

    fn timestamp(&mut self, key: &str) -> Option<DateTime<Utc>> {
        let raw = self.required::<String>(key, "a timestamp string")?;

        let parsed = parse_timestamp(&raw);
        if parsed.is_none() {
            self.violations.push(Violation::new(
                key,
                format!("'{raw}' is not a valid timestamp"),
            ));
        }
        parsed
    }

    fn url(&mut self, key: &str) -> Option<String> {
        let raw = self.required::<String>(key, "a string")?;

        if !raw.validate_url() {
            self.violations
                .push(Violation::new(key, format!("'{raw}' is not a valid URL")));
            return None;
        }
        Some(raw)
    }
}
