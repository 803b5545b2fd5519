//! Optional schema suggestions.
//!
//! A [`SuggestionProvider`] receives the rendered DDL and a few sample
//! records and may return advisory notes. Suggestions are attached to the
//! plan for display only; they never change table definitions. A provider
//! that fails or runs past its deadline contributes a warning instead.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::schema::ColumnType;
use crate::error::Result;

/// Number of records handed to a provider.
pub const SAMPLE_SIZE: usize = 5;

/// One advisory note about the inferred schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_type: Option<ColumnType>,
}

/// External refinement hook.
#[async_trait]
pub trait SuggestionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn suggest(&self, ddl: &str, sample: &[Value]) -> Result<Vec<Suggestion>>;
}

/// Provider used when no hook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSuggestions;

#[async_trait]
impl SuggestionProvider for NoSuggestions {
    fn name(&self) -> &str {
        "none"
    }

    async fn suggest(&self, _ddl: &str, _sample: &[Value]) -> Result<Vec<Suggestion>> {
        Ok(Vec::new())
    }
}

/// Suggestions and the warning produced when the provider did not deliver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuggestionOutcome {
    pub suggestions: Vec<Suggestion>,
    pub warning: Option<String>,
}

/// Ask `provider` for suggestions, bounded by `timeout`.
pub async fn collect_suggestions(
    provider: &dyn SuggestionProvider,
    ddl: &str,
    records: &[Value],
    timeout: Duration,
) -> SuggestionOutcome {
    let sample = &records[..records.len().min(SAMPLE_SIZE)];
    match tokio::time::timeout(timeout, provider.suggest(ddl, sample)).await {
        Ok(Ok(suggestions)) => {
            debug!(
                "Suggestion provider {} returned {} suggestions",
                provider.name(),
                suggestions.len()
            );
            SuggestionOutcome {
                suggestions,
                warning: None,
            }
        }
        Ok(Err(e)) => {
            let message = format!("suggestion provider {} failed: {}", provider.name(), e);
            warn!("{}", message);
            SuggestionOutcome {
                suggestions: Vec::new(),
                warning: Some(message),
            }
        }
        Err(_) => {
            let message = format!(
                "suggestion provider {} timed out after {:?}",
                provider.name(),
                timeout
            );
            warn!("{}", message);
            SuggestionOutcome {
                suggestions: Vec::new(),
                warning: Some(message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MigrateError;

    struct Failing;

    #[async_trait]
    impl SuggestionProvider for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn suggest(&self, _ddl: &str, _sample: &[Value]) -> Result<Vec<Suggestion>> {
            Err(MigrateError::connection("llm", "unreachable"))
        }
    }

    struct Slow;

    #[async_trait]
    impl SuggestionProvider for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn suggest(&self, _ddl: &str, _sample: &[Value]) -> Result<Vec<Suggestion>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    struct Counting;

    #[async_trait]
    impl SuggestionProvider for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn suggest(&self, _ddl: &str, sample: &[Value]) -> Result<Vec<Suggestion>> {
            Ok(vec![Suggestion {
                table: "users".into(),
                column: None,
                message: format!("saw {} records", sample.len()),
                suggested_type: None,
            }])
        }
    }

    #[tokio::test]
    async fn test_failure_becomes_warning() {
        let outcome = collect_suggestions(&Failing, "", &[], Duration::from_secs(1)).await;
        assert!(outcome.suggestions.is_empty());
        assert!(outcome.warning.unwrap().contains("failing"));
    }

    #[tokio::test]
    async fn test_timeout_becomes_warning() {
        let outcome = collect_suggestions(&Slow, "", &[], Duration::from_millis(20)).await;
        assert!(outcome.warning.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_sample_is_bounded() {
        let records: Vec<Value> = (0..20).map(|i| serde_json::json!({ "id": i })).collect();
        let outcome = collect_suggestions(&Counting, "", &records, Duration::from_secs(1)).await;
        assert_eq!(outcome.suggestions[0].message, "saw 5 records");
        assert!(outcome.warning.is_none());
    }
}
