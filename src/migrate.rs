use anyhow::{Context, Result};

use telemikiya_core::schema::guard::{self, MigrationReport};

use crate::config::Config;
use crate::db;
use crate::pg_store::PgStore;

/// Bring the database schema up to date with the configured embedding
/// dimensions.
///
/// Installs the `vector` and `pgroonga` extensions if needed, then plans
/// and applies changes through the embedding guard. A dimension change
/// fails unless `allow_clear_embedding` is set.
pub async fn run_migrations(config: &Config, allow_clear_embedding: bool) -> Result<MigrationReport> {
    let pool = db::connect(config).await?;

    for ext in ["vector", "pgroonga"] {
        sqlx::query(&format!("CREATE EXTENSION IF NOT EXISTS {}", ext))
            .execute(&pool)
            .await
            .with_context(|| format!("Failed to create extension {}", ext))?;
    }

    let store = PgStore::new(pool);
    let report = guard::migrate(&store, config.embedding.dims, allow_clear_embedding).await?;

    println!("Migrations complete.");
    if report.cleared_embeddings > 0 {
        println!(
            "Cleared {} embeddings; run `telemikiya index` to re-embed.",
            report.cleared_embeddings
        );
    }
    Ok(report)
}
