//! Apply hook that protects stored embeddings.
//!
//! Changing the `text_embedding` column type invalidates every stored
//! vector, so a plan that does so is refused unless the operator passed
//! `--allow-clear-embedding`. With consent, all embeddings are cleared
//! before the plan runs and the indexer re-embeds them afterwards.

use anyhow::Result;
use async_trait::async_trait;

use super::{plan_migration, Plan, Schema};
use crate::error::Error;

/// Backend that can describe and change its own schema.
#[async_trait]
pub trait SchemaExecutor: Send + Sync {
    /// The currently deployed schema.
    async fn current_schema(&self) -> Result<Schema>;

    /// Apply `plan`. When `clear_embeddings` is set, every
    /// `text_embedding` is set to NULL first, as part of the same unit
    /// of work. Returns the number of embeddings cleared.
    async fn apply(&self, plan: &Plan, clear_embeddings: bool) -> Result<u64>;
}

/// What a guarded migration did.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MigrationReport {
    pub statements: usize,
    pub cleared_embeddings: u64,
}

/// Apply `plan`, refusing embedding type changes without consent.
///
/// # Errors
///
/// [`Error::NotAllowedToClearEmbedding`] when the plan changes the
/// embedding column type and `allow_clear_embedding` is false. Nothing is
/// applied in that case.
pub async fn apply_guarded(
    executor: &dyn SchemaExecutor,
    plan: &Plan,
    allow_clear_embedding: bool,
) -> Result<MigrationReport> {
    if plan.is_empty() {
        tracing::info!("schema is up to date");
        return Ok(MigrationReport::default());
    }

    let clear = match plan.embedding_type_change() {
        Some((from, to)) if !allow_clear_embedding => {
            return Err(Error::NotAllowedToClearEmbedding {
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }
        Some((from, to)) => {
            tracing::warn!(from, to, "embedding dimensions changed, clearing stored embeddings");
            true
        }
        None => false,
    };

    let statements = plan.to_sql().len();
    let cleared_embeddings = executor.apply(plan, clear).await?;
    if clear {
        tracing::warn!(count = cleared_embeddings, "cleared embeddings");
    }
    tracing::info!(statements, "schema migrated");
    Ok(MigrationReport {
        statements,
        cleared_embeddings,
    })
}

/// Introspect, plan against `dims`, and apply with the guard.
pub async fn migrate(
    executor: &dyn SchemaExecutor,
    dims: usize,
    allow_clear_embedding: bool,
) -> Result<MigrationReport> {
    let current = executor.current_schema().await?;
    let plan = plan_migration(&current, dims);
    for stmt in plan.to_sql() {
        tracing::debug!(%stmt, "planned");
    }
    apply_guarded(executor, &plan, allow_clear_embedding).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        schema: Mutex<Schema>,
        applied: Mutex<Vec<(Plan, bool)>>,
    }

    #[async_trait]
    impl SchemaExecutor for Recording {
        async fn current_schema(&self) -> Result<Schema> {
            Ok(self.schema.lock().unwrap().clone())
        }

        async fn apply(&self, plan: &Plan, clear_embeddings: bool) -> Result<u64> {
            self.schema.lock().unwrap().apply_plan(plan);
            self.applied.lock().unwrap().push((plan.clone(), clear_embeddings));
            Ok(if clear_embeddings { 3 } else { 0 })
        }
    }

    #[tokio::test]
    async fn test_fresh_install_applies_without_clearing() {
        let exec = Recording::default();
        let report = migrate(&exec, 768, false).await.unwrap();
        assert!(report.statements > 0);
        assert_eq!(report.cleared_embeddings, 0);
        assert!(!exec.applied.lock().unwrap()[0].1);
    }

    #[tokio::test]
    async fn test_dimension_change_refused_without_consent() {
        let exec = Recording::default();
        migrate(&exec, 768, false).await.unwrap();

        let err = migrate(&exec, 1536, false).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::NotAllowedToClearEmbedding {
                from: "vector(768)".into(),
                to: "vector(1536)".into()
            })
        );
        assert_eq!(exec.applied.lock().unwrap().len(), 1);
        assert_eq!(
            exec.schema.lock().unwrap().embedding_type(),
            Some("vector(768)")
        );
    }

    #[tokio::test]
    async fn test_dimension_change_clears_with_consent() {
        let exec = Recording::default();
        migrate(&exec, 768, false).await.unwrap();

        let report = migrate(&exec, 1536, true).await.unwrap();
        assert_eq!(report.cleared_embeddings, 3);
        assert!(exec.applied.lock().unwrap()[1].1);
        assert_eq!(
            exec.schema.lock().unwrap().embedding_type(),
            Some("vector(1536)")
        );
    }

    #[tokio::test]
    async fn test_consent_without_change_clears_nothing() {
        let exec = Recording::default();
        migrate(&exec, 768, false).await.unwrap();
        let report = migrate(&exec, 768, true).await.unwrap();
        assert_eq!(report, MigrationReport::default());
        assert_eq!(exec.applied.lock().unwrap().len(), 1);
    }
}
