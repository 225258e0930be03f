use crate::{
    alertmanager::Alert,
    query::{ExtractionError, FieldExtractor},
    schema::{Violation, format_violations},
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

pub const DEFAULT_TITLE: &str = "New Alert";
pub const DEFAULT_MESSAGE: &str = "Alert body";
pub const DEFAULT_PRIORITY: i64 = 3;

/// The notification fields a caller can map a query onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationField {
    Topic,
    Title,
    Message,
    Tags,
    Priority,
}

impl NotificationField {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "topic" => Some(Self::Topic),
            "title" => Some(Self::Title),
            "message" => Some(Self::Message),
            "tags" => Some(Self::Tags),
            "priority" => Some(Self::Priority),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Title => "title",
            Self::Message => "message",
            Self::Tags => "tags",
            Self::Priority => "priority",
        }
    }
}

impl std::fmt::Display for NotificationField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ordered `(field, query)` pairs taken from the request. Built by
/// [`crate::schema::validate_mapping`], which guarantees a `topic` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionMapping {
    entries: Vec<(NotificationField, String)>,
}

impl ExtractionMapping {
    pub(crate) fn new(entries: Vec<(NotificationField, String)>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> impl Iterator<Item = &(NotificationField, String)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The message published to ntfy
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Validate)]
pub struct Notification {
    #[validate(length(min = 1, message = "must not be empty"))]
    pub topic: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[validate(range(min = 1, max = 5, message = "must be between 1 and 5"))]
    pub priority: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid notification: {}", format_violations(.violations))]
pub struct NotificationSchemaError {
    pub violations: Vec<Violation>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to extract '{field}': {source}")]
    Extraction {
        field: NotificationField,
        #[source]
        source: ExtractionError,
    },

    #[error(transparent)]
    Schema(#[from] NotificationSchemaError),

    #[error("failed to render alert as JSON: {0}")]
    Document(#[from] serde_json::Error),
}

impl Notification {
    /// Check an assembled candidate against the notification contract and fill in
    /// defaults for the optional fields. A JSON `null` counts as an omitted field.
    pub fn from_candidate(
        mut candidate: Map<String, Value>,
    ) -> Result<Self, NotificationSchemaError> {
        let mut violations = Vec::new();
        let mut take = |field: NotificationField| {
            candidate
                .remove(field.as_str())
                .filter(|value| !value.is_null())
        };

        let topic = match take(NotificationField::Topic) {
            Some(Value::String(topic)) => topic,
            Some(other) => {
                violations.push(type_violation(NotificationField::Topic, "a string", &other));
                String::new()
            }
            None => {
                violations.push(Violation::new("topic", "is required"));
                String::new()
            }
        };

        let title = optional_string(NotificationField::Title, take(NotificationField::Title))
            .unwrap_or_else(|violation| {
                violations.push(violation);
                None
            })
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());

        let message =
            optional_string(NotificationField::Message, take(NotificationField::Message))
                .unwrap_or_else(|violation| {
                    violations.push(violation);
                    None
                })
                .unwrap_or_else(|| DEFAULT_MESSAGE.to_string());

        let tags = match take(NotificationField::Tags) {
            None => Vec::new(),
            Some(Value::Array(items)) if items.iter().all(Value::is_string) => items
                .into_iter()
                .filter_map(|item| item.as_str().map(String::from))
                .collect(),
            Some(other) => {
                violations.push(type_violation(
                    NotificationField::Tags,
                    "an array of strings",
                    &other,
                ));
                Vec::new()
            }
        };

        let priority = match take(NotificationField::Priority) {
            None => DEFAULT_PRIORITY,
            Some(value) => match integral(&value) {
                Some(priority) => priority,
                None => {
                    violations.push(type_violation(
                        NotificationField::Priority,
                        "an integer",
                        &value,
                    ));
                    DEFAULT_PRIORITY
                }
            },
        };

        if !violations.is_empty() {
            return Err(NotificationSchemaError { violations });
        }

        let notification = Self {
            topic,
            title,
            message,
            tags,
            priority,
        };

        if let Err(errors) = notification.validate() {
            let mut violations: Vec<Violation> = errors
                .field_errors()
                .into_iter()
                .flat_map(|(field, errors)| {
                    errors.iter().map(move |e| {
                        let message = e
                            .message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| e.code.to_string());
                        Violation::new(field.to_string(), message)
                    })
                })
                .collect();
            violations.sort_by(|a, b| a.path.cmp(&b.path));

            return Err(NotificationSchemaError { violations });
        }

        Ok(notification)
    }
}

/// Read a JSON number as an integer, accepting floats with no fractional part
fn integral(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

fn optional_string(
    field: NotificationField,
    value: Option<Value>,
) -> Result<Option<String>, Violation> {
    match value {
        None => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(other) => Err(type_violation(field, "a string", &other)),
    }
}

fn type_violation(field: NotificationField, expected: &str, actual: &Value) -> Violation {
    let actual = match actual {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };

    Violation::new(field.as_str(), format!("must be {expected}, got {actual}"))
}

/// Projects alerts into notifications through an extraction mapping
pub struct NotificationBuilder {
    extractor: FieldExtractor,
}

impl NotificationBuilder {
    pub fn new(extractor: FieldExtractor) -> Self {
        Self { extractor }
    }

    /// Run every mapped query against the alert concurrently and assemble the results.
    ///
    /// Results are merged in mapping order, so when a field is mapped more than once
    /// the last entry wins regardless of which extraction finished first.
    pub async fn build(
        &self,
        mapping: &ExtractionMapping,
        alert: &Alert,
    ) -> Result<Notification, BuildError> {
        let document = serde_json::to_value(alert)?;
        let document = &document;

        let extractions = mapping.entries().map(|(field, query)| {
            let field = *field;
            async move {
                self.extractor
                    .extract(query, document)
                    .await
                    .map(|value| (field, value))
                    .map_err(|source| BuildError::Extraction { field, source })
            }
        });

        let mut candidate = Map::new();
        for result in join_all(extractions).await {
            let (field, value) = result?;
            candidate.insert(field.as_str().to_string(), value);
        }

        Ok(Notification::from_candidate(candidate)?)
    }
}

impl Default for NotificationBuilder {
    fn default() -> Self {
        Self::new(FieldExtractor::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{query::QueryEvaluator, schema};
    use serde_json::json;
    use std::sync::Arc;

    fn alert() -> Alert {
        schema::validate_alert(&json!({
            "status": "firing",
            "labels": {"alertname": "DiskFull", "severity": "critical", "team": "storage"},
            "annotations": {"summary": "Disk full", "description": "/var is at 99%"},
            "startsAt": "2024-05-01T10:00:00Z",
            "endsAt": "0001-01-01T00:00:00Z",
            "generatorURL": "http://prometheus:9090/graph",
            "fingerprint": "c4ad3b5e9f1e2a7d"
        }))
        .unwrap()
    }

    fn mapping(pairs: &[(&str, &str)]) -> ExtractionMapping {
        schema::validate_mapping(pairs.iter().copied()).unwrap()
    }

    fn candidate(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_build_with_defaults() {
        let builder = NotificationBuilder::default();
        let mapping = mapping(&[
            ("topic", ".labels.severity"),
            ("title", ".annotations.summary"),
        ]);

        let notification = builder.build(&mapping, &alert()).await.unwrap();

        assert_eq!(
            notification,
            Notification {
                topic: "critical".into(),
                title: "Disk full".into(),
                message: "Alert body".into(),
                tags: vec![],
                priority: 3,
            }
        );
        assert_eq!(
            serde_json::to_value(&notification).unwrap(),
            json!({"topic": "critical", "title": "Disk full", "message": "Alert body", "priority": 3})
        );
    }

    #[tokio::test]
    async fn test_build_all_fields() {
        let builder = NotificationBuilder::default();
        let mapping = mapping(&[
            ("topic", ".labels.team"),
            ("title", ".labels.alertname"),
            ("message", ".annotations.description"),
            ("tags", "[.labels.severity, .status]"),
            ("priority", "5"),
        ]);

        let notification = builder.build(&mapping, &alert()).await.unwrap();

        assert_eq!(notification.topic, "storage");
        assert_eq!(notification.title, "DiskFull");
        assert_eq!(notification.message, "/var is at 99%");
        assert_eq!(notification.tags, vec!["critical", "firing"]);
        assert_eq!(notification.priority, 5);
    }

    #[tokio::test]
    async fn test_last_mapping_entry_wins() {
        let builder = NotificationBuilder::default();
        let mapping = mapping(&[
            ("topic", ".labels.team"),
            ("title", ".labels.alertname"),
            ("title", ".annotations.summary"),
        ]);

        for _ in 0..10 {
            let notification = builder.build(&mapping, &alert()).await.unwrap();
            assert_eq!(notification.title, "Disk full");
        }
    }

    #[tokio::test]
    async fn test_extraction_error_names_the_field() {
        let builder = NotificationBuilder::default();
        let mapping = mapping(&[("topic", ".labels.team"), ("title", ".labels.missing")]);

        let err = builder.build(&mapping, &alert()).await.unwrap_err();

        match err {
            BuildError::Extraction { field, source } => {
                assert_eq!(field, NotificationField::Title);
                assert!(matches!(source, ExtractionError::MissingPath { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_non_array_tags_is_a_schema_error() {
        let builder = NotificationBuilder::default();
        let mapping = mapping(&[("topic", ".labels.team"), ("tags", ".labels.severity")]);

        let err = builder.build(&mapping, &alert()).await.unwrap_err();

        match err {
            BuildError::Schema(e) => {
                assert_eq!(e.violations.len(), 1);
                assert_eq!(e.violations[0].path, "tags");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_custom_evaluator_is_used() {
        struct Constant;

        #[async_trait::async_trait]
        impl QueryEvaluator for Constant {
            async fn evaluate(&self, query: &str, _: &Value) -> Result<Value, ExtractionError> {
                Ok(Value::String(format!("const:{query}")))
            }
        }

        let builder = NotificationBuilder::new(FieldExtractor::new(Arc::new(Constant)));
        let notification = builder
            .build(&mapping(&[("topic", "anything")]), &alert())
            .await
            .unwrap();

        assert_eq!(notification.topic, "const:anything");
    }

    #[test]
    fn test_candidate_reports_every_type_violation() {
        let err = Notification::from_candidate(candidate(json!({
            "topic": 42,
            "title": ["x"],
            "tags": ["ok", 1],
            "priority": "high"
        })))
        .unwrap_err();

        let paths: Vec<_> = err.violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["topic", "title", "tags", "priority"]);
        assert_eq!(err.violations[0].message, "must be a string, got a number");
    }

    #[test]
    fn test_candidate_without_topic() {
        let err = Notification::from_candidate(candidate(json!({"title": "x"}))).unwrap_err();
        assert_eq!(err.violations, vec![Violation::new("topic", "is required")]);
    }

    #[test]
    fn test_candidate_contract_checks() {
        let err = Notification::from_candidate(candidate(json!({"topic": "", "priority": 9})))
            .unwrap_err();

        assert_eq!(
            err.violations,
            vec![
                Violation::new("priority", "must be between 1 and 5"),
                Violation::new("topic", "must not be empty"),
            ]
        );
    }

    #[test]
    fn test_candidate_null_falls_back_to_default() {
        let notification = Notification::from_candidate(candidate(json!({
            "topic": "ops",
            "title": null,
            "priority": null,
            "tags": null
        })))
        .unwrap();

        assert_eq!(notification.title, DEFAULT_TITLE);
        assert_eq!(notification.message, DEFAULT_MESSAGE);
        assert_eq!(notification.priority, DEFAULT_PRIORITY);
        assert!(notification.tags.is_empty());
    }

    #[tokio::test]
    async fn test_fields_are_extracted_concurrently() {
        struct Gathering(tokio::sync::Barrier);

        #[async_trait::async_trait]
        impl QueryEvaluator for Gathering {
            async fn evaluate(&self, query: &str, _: &Value) -> Result<Value, ExtractionError> {
                self.0.wait().await;
                Ok(Value::String(query.to_string()))
            }
        }

        let mapping = mapping(&[
            ("topic", "ops"),
            ("title", "Disk full"),
            ("message", "/var is at 99%"),
        ]);
        let evaluator = Gathering(tokio::sync::Barrier::new(mapping.len()));
        let builder = NotificationBuilder::new(FieldExtractor::new(Arc::new(evaluator)));

        let notification = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            builder.build(&mapping, &alert()),
        )
        .await
        .expect("extractions did not run concurrently")
        .unwrap();

        assert_eq!(notification.topic, "ops");
        assert_eq!(notification.message, "/var is at 99%");
    }

    #[test]
    fn test_integral_float_priority_is_accepted() {
        let notification =
            Notification::from_candidate(candidate(json!({"topic": "ops", "priority": 4.0})))
                .unwrap();
        assert_eq!(notification.priority, 4);
    }

    #[test]
    fn test_float_priority_is_rejected() {
        let err = Notification::from_candidate(candidate(json!({"topic": "ops", "priority": 2.5})))
            .unwrap_err();
        assert_eq!(err.violations[0].path, "priority");
    }
}
