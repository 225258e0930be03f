use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub mod path;

pub use path::PathEvaluator;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("invalid query '{query}': {reason}")]
    Syntax { query: String, reason: String },

    #[error("query '{query}' references missing path '{path}'")]
    MissingPath { query: String, path: String },

    #[error("query '{query}' failed: {reason}")]
    Evaluation { query: String, reason: String },
}

/// Evaluates a query expression against a JSON document
#[async_trait]
pub trait QueryEvaluator: Send + Sync {
    async fn evaluate(&self, query: &str, document: &Value) -> Result<Value, ExtractionError>;
}

/// Reads a single value out of an alert document.
///
/// Holds no per-call state, so one extractor is shared by every concurrent pipeline.
#[derive(Clone)]
pub struct FieldExtractor {
    evaluator: Arc<dyn QueryEvaluator>,
}

impl FieldExtractor {
    pub fn new(evaluator: Arc<dyn QueryEvaluator>) -> Self {
        Self { evaluator }
    }

    pub async fn extract(&self, query: &str, document: &Value) -> Result<Value, ExtractionError> {
        let value = self.evaluator.evaluate(query, document).await?;
        tracing::trace!("Query '{}' extracted {}", query, value);

        Ok(value)
    }
}

impl Default for FieldExtractor {
    fn default() -> Self {
        Self::new(Arc::new(PathEvaluator))
    }
}
