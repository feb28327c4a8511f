//! PostgreSQL implementation of the core [`Store`] trait.
//!
//! Semantic ranking uses pgvector's cosine distance operator (`<=>`) over
//! the HNSW index on `message.text_embedding`. Lexical ranking uses
//! pgroonga's match operator (`&@*`) scored by
//! `pgroonga_score(tableoid, ctid)`. Both sub-queries compute positions
//! with `RANK()` so ties share a rank.
//!
//! The same type implements [`SchemaExecutor`] so `db migrate` can
//! introspect and alter the schema through the core guard.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use telemikiya_core::media::MediaInfo;
use telemikiya_core::models::{
    Dialog, DialogType, InsertOutcome, Message, NewMessage, PendingText, RankedCandidate,
    SearchFilter,
};
use telemikiya_core::schema::guard::SchemaExecutor;
use telemikiya_core::schema::{Column, Index, Plan, Schema, Table, DIALOG_TABLE, MESSAGE_TABLE};
use telemikiya_core::store::Store;
use telemikiya_core::Error;

/// Columns returned by both search sub-queries. The embedding itself is
/// not fetched.
const SEARCH_COLUMNS: &str = "id, msg_id, dialog_id, text, has_media, media_info, sent_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_dialog(row: &PgRow) -> Result<Dialog> {
    let dialog_type: String = row.try_get("type")?;
    Ok(Dialog {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        dialog_type: dialog_type.parse::<DialogType>()?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_ranked(row: &PgRow) -> Result<RankedCandidate> {
    let Json(media_info): Json<MediaInfo> = row.try_get("media_info")?;
    let rank: i64 = row.try_get("rank")?;
    Ok(RankedCandidate {
        message: Message {
            id: row.try_get("id")?,
            msg_id: row.try_get("msg_id")?,
            dialog_id: row.try_get("dialog_id")?,
            text: row.try_get("text")?,
            text_embedding: None,
            has_media: row.try_get("has_media")?,
            media_info,
            sent_at: row.try_get("sent_at")?,
        },
        rank: usize::try_from(rank).unwrap_or(usize::MAX),
    })
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &SearchFilter) {
    if let Some(bot_id) = filter.exclude_dialog_id {
        qb.push(" AND dialog_id <> ").push_bind(bot_id);
    }
    if let Some(start) = filter.start_time {
        qb.push(" AND sent_at >= ").push_bind(start);
    }
    if let Some(end) = filter.end_time {
        qb.push(" AND sent_at <= ").push_bind(end);
    }
    if let Some(dialog_id) = filter.dialog_id {
        qb.push(" AND dialog_id = ").push_bind(dialog_id);
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl Store for PgStore {
    async fn dialog_updated_at(&self, id: i64) -> Result<Option<DateTime<Utc>>> {
        let updated_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT updated_at FROM dialog WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to query dialog {}", id))?;
        Ok(updated_at)
    }

    async fn create_dialog(&self, dialog: &Dialog) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO dialog (id, title, type, updated_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(dialog.id)
        .bind(&dialog.title)
        .bind(dialog.dialog_type.as_str())
        .bind(dialog.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::DialogExists(dialog.id).into()),
            Err(e) => {
                Err(anyhow::Error::new(e).context(format!("Failed to create dialog {}", dialog.id)))
            }
        }
    }

    async fn update_dialog_title(
        &self,
        id: i64,
        title: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE dialog SET title = $2, updated_at = GREATEST(updated_at, $3) WHERE id = $1",
        )
        .bind(id)
        .bind(title)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update dialog {}", id))?;

        if result.rows_affected() == 0 {
            return Err(Error::DialogNotFound(id).into());
        }
        Ok(())
    }

    async fn get_dialogs(&self, ids: &[i64]) -> Result<Vec<Dialog>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT id, title, type, updated_at FROM dialog WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query dialogs")?;
        rows.iter().map(row_to_dialog).collect()
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<InsertOutcome> {
        let id = Uuid::new_v4();
        let result = sqlx::query(
            "INSERT INTO message (id, msg_id, dialog_id, text, has_media, media_info, sent_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (msg_id, dialog_id) DO NOTHING",
        )
        .bind(id)
        .bind(message.msg_id)
        .bind(message.dialog_id)
        .bind(&message.text)
        .bind(message.has_media())
        .bind(Json(&message.media_info))
        .bind(message.sent_at)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "Failed to insert message {} in dialog {}",
                message.msg_id, message.dialog_id
            )
        })?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted(id))
        }
    }

    async fn pending_embeddings(&self, limit: usize) -> Result<Vec<PendingText>> {
        let rows = sqlx::query(
            "SELECT id, text FROM message WHERE text_embedding IS NULL \
             ORDER BY sent_at, id LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query messages without embedding")?;

        rows.iter()
            .map(|row| -> Result<PendingText> {
                Ok(PendingText {
                    id: row.try_get("id")?,
                    text: row.try_get("text")?,
                })
            })
            .collect()
    }

    async fn set_text_embedding(&self, id: Uuid, embedding: &[f32]) -> Result<()> {
        sqlx::query("UPDATE message SET text_embedding = $1 WHERE id = $2")
            .bind(Vector::from(embedding.to_vec()))
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to store embedding for message {}", id))?;
        Ok(())
    }

    async fn lexical_search(
        &self,
        pattern: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<RankedCandidate>> {
        if pattern.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");
        qb.push(SEARCH_COLUMNS);
        qb.push(", RANK() OVER (ORDER BY pgroonga_score(tableoid, ctid) DESC) AS rank");
        qb.push(" FROM message WHERE text &@* ").push_bind(pattern);
        push_filters(&mut qb, filter);
        qb.push(" ORDER BY pgroonga_score(tableoid, ctid) DESC, id LIMIT ")
            .push_bind(limit as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Full-text search failed")?;
        rows.iter().map(row_to_ranked).collect()
    }

    async fn semantic_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        max_distance: Option<f64>,
        filter: &SearchFilter,
    ) -> Result<Vec<RankedCandidate>> {
        let vector = Vector::from(query_vec.to_vec());
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");
        qb.push(SEARCH_COLUMNS);
        qb.push(", RANK() OVER (ORDER BY text_embedding <=> ")
            .push_bind(vector.clone())
            .push(") AS rank");
        qb.push(" FROM message WHERE text_embedding IS NOT NULL");
        if let Some(max) = max_distance {
            qb.push(" AND text_embedding <=> ")
                .push_bind(vector.clone())
                .push(" <= ")
                .push_bind(max);
        }
        push_filters(&mut qb, filter);
        qb.push(" ORDER BY text_embedding <=> ")
            .push_bind(vector)
            .push(", id LIMIT ")
            .push_bind(limit as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Vector search failed")?;
        rows.iter().map(row_to_ranked).collect()
    }
}

#[async_trait]
impl SchemaExecutor for PgStore {
    async fn current_schema(&self) -> Result<Schema> {
        let tables = [DIALOG_TABLE, MESSAGE_TABLE];

        let column_rows = sqlx::query(
            "SELECT c.relname AS table_name, a.attname AS column_name, \
                    format_type(a.atttypid, a.atttypmod) AS sql_type, \
                    NOT a.attnotnull AS nullable \
             FROM pg_attribute a \
             JOIN pg_class c ON a.attrelid = c.oid \
             JOIN pg_namespace n ON c.relnamespace = n.oid \
             WHERE n.nspname = current_schema() AND c.relkind = 'r' \
               AND c.relname = ANY($1) AND a.attnum > 0 AND NOT a.attisdropped \
             ORDER BY c.relname, a.attnum",
        )
        .bind(&tables[..])
        .fetch_all(&self.pool)
        .await
        .context("Failed to introspect columns")?;

        let index_rows = sqlx::query(
            "SELECT tablename, indexname, indexdef FROM pg_indexes \
             WHERE schemaname = current_schema() AND tablename = ANY($1)",
        )
        .bind(&tables[..])
        .fetch_all(&self.pool)
        .await
        .context("Failed to introspect indexes")?;

        let mut schema = Schema::default();
        for row in &column_rows {
            let table_name: String = row.try_get("table_name")?;
            let column = Column {
                name: row.try_get("column_name")?,
                sql_type: row.try_get("sql_type")?,
                nullable: row.try_get("nullable")?,
                constraint: None,
                default: None,
            };
            table_entry(&mut schema, &table_name).columns.push(column);
        }
        for row in &index_rows {
            let table_name: String = row.try_get("tablename")?;
            let definition: String = row.try_get("indexdef")?;
            let index = Index {
                name: row.try_get("indexname")?,
                unique: definition.starts_with("CREATE UNIQUE"),
                definition,
            };
            table_entry(&mut schema, &table_name).indexes.push(index);
        }
        Ok(schema)
    }

    async fn apply(&self, plan: &Plan, clear_embeddings: bool) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let mut cleared = 0;
        if clear_embeddings {
            cleared = sqlx::query(
                "UPDATE message SET text_embedding = NULL WHERE text_embedding IS NOT NULL",
            )
            .execute(&mut *tx)
            .await
            .context("Failed to clear embeddings")?
            .rows_affected();
        }

        for stmt in plan.to_sql() {
            sqlx::query(&stmt)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Migration statement failed: {}", stmt))?;
        }

        tx.commit().await?;
        Ok(cleared)
    }
}

fn table_entry<'a>(schema: &'a mut Schema, name: &str) -> &'a mut Table {
    if let Some(pos) = schema.tables.iter().position(|t| t.name == name) {
        return &mut schema.tables[pos];
    }
    schema.tables.push(Table {
        name: name.to_string(),
        ..Default::default()
    });
    let last = schema.tables.len() - 1;
    &mut schema.tables[last]
}
