use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};

use telemikiya_core::dialog::deep_link;
use telemikiya_core::embedding::{embed_one, EmbeddingProvider};
use telemikiya_core::models::SearchFilter;
use telemikiya_core::search::{self, SearchHit, SearchRequest};
use telemikiya_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::embedding::{verify_dimensions, ProviderRegistry};
use crate::pg_store::PgStore;

/// Time format accepted by `--start-time` and `--end-time`, read as UTC.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Request-scoped hybrid search over recorded messages.
pub struct Searcher {
    store: Arc<dyn Store>,
    provider: Arc<dyn EmbeddingProvider>,
    bot_id: Option<i64>,
    max_distance: Option<f64>,
}

impl Searcher {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            store,
            provider,
            bot_id: None,
            max_distance: None,
        }
    }

    pub fn from_config(
        store: Arc<dyn Store>,
        provider: Arc<dyn EmbeddingProvider>,
        config: &Config,
    ) -> Self {
        Self::new(store, provider)
            .bot_id(config.telegram.bot_id())
            .max_distance(config.search.max_distance)
    }

    /// Messages in this dialog never show up in results.
    pub fn bot_id(mut self, bot_id: Option<i64>) -> Self {
        self.bot_id = bot_id;
        self
    }

    pub fn max_distance(mut self, max_distance: Option<f64>) -> Self {
        self.max_distance = max_distance;
        self
    }

    /// Up to `count` messages matching `input`, best first.
    pub async fn search(
        &self,
        input: &str,
        count: usize,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        dialog_id: Option<i64>,
    ) -> Result<Vec<SearchHit>> {
        let query_vec = embed_one(self.provider.as_ref(), input)
            .await
            .context("Failed to embed search input")?;

        let req = SearchRequest {
            input,
            query_vec: &query_vec,
            count,
            filter: SearchFilter {
                exclude_dialog_id: self.bot_id,
                start_time,
                end_time,
                dialog_id,
            },
            max_distance: self.max_distance,
        };
        let hits = search::search(self.store.as_ref(), &req).await?;
        tracing::debug!(count = hits.len(), "search finished");
        Ok(hits)
    }
}

/// Parse a `YYYY-MM-DD HH:MM:SS` argument.
pub fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), TIME_FORMAT)
        .with_context(|| format!("Invalid time '{}', expected YYYY-MM-DD HH:MM:SS", s))?;
    Ok(naive.and_utc())
}

/// Numbered listing with a deep link and the indented message text.
pub fn render_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No results.\n".to_string();
    }

    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}. [{:.2}] {} / {}",
            i + 1,
            hit.score,
            hit.dialog.title,
            hit.message.sent_at.format(TIME_FORMAT)
        );
        match deep_link(&hit.dialog, hit.message.msg_id) {
            Ok(link) => {
                let _ = writeln!(out, "    {}", link);
            }
            Err(e) => {
                tracing::warn!(dialog_id = hit.dialog.id, error = %e, "no deep link");
            }
        }
        for line in hit.message.text.lines() {
            let _ = writeln!(out, "    | {}", line);
        }
        out.push('\n');
    }
    out
}

/// `telemikiya search`: connect, embed, search, print.
pub async fn run_search(
    config: &Config,
    keywords: &[String],
    count: Option<usize>,
    start_time: Option<String>,
    end_time: Option<String>,
    dialog_id: Option<i64>,
) -> Result<()> {
    let provider = ProviderRegistry::builtin().create(config)?;
    let start_time = start_time.as_deref().map(parse_time).transpose()?;
    let end_time = end_time.as_deref().map(parse_time).transpose()?;
    let count = count.unwrap_or(config.search.default_count);

    verify_dimensions(provider.as_ref()).await?;
    let pool = db::connect(config).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));

    let input = keywords.join(" ");
    let hits = Searcher::from_config(store, provider, config)
        .search(&input, count, start_time, end_time, dialog_id)
        .await?;

    print!("{}", render_hits(&hits));
    pool.close().await;
    Ok(())
}
