//! Embedding indexer: fill `text_embedding` for recorded messages.
//!
//! A single background loop:
//!
//! 1. Fetch up to `batch_size` messages without an embedding, oldest first.
//! 2. Nothing pending → sleep `idle_interval`.
//! 3. Embed the batch in one provider call. Failure → log, sleep
//!    `retry_interval`, start over.
//! 4. Write each vector on its own. A failed row stays pending.
//!
//! Shutdown is observed before every blocking step, so [`IndexerHandle::stop`]
//! returns promptly even while the provider is slow.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use telemikiya_core::embedding::{embed_checked, EmbeddingProvider};
use telemikiya_core::store::Store;

use crate::config::Config;

/// Counters for one indexer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexerStats {
    pub batches: u64,
    pub embedded: u64,
    pub failed_batches: u64,
    pub failed_writes: u64,
}

/// Summary block printed when an indexer run ends.
impl fmt::Display for IndexerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "index")?;
        writeln!(f, "  embedded: {}", self.embedded)?;
        writeln!(f, "  failed batches: {}", self.failed_batches)
    }
}

pub struct Indexer {
    store: Arc<dyn Store>,
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    idle_interval: Duration,
    retry_interval: Duration,
}

impl Indexer {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            store,
            provider,
            batch_size: 64,
            idle_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(5),
        }
    }

    pub fn from_config(
        store: Arc<dyn Store>,
        provider: Arc<dyn EmbeddingProvider>,
        config: &Config,
    ) -> Self {
        Self::new(store, provider)
            .batch_size(config.embedding.batch_size)
            .idle_interval(config.embedding.idle_interval())
            .retry_interval(config.embedding.retry_interval())
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Run until `shutdown` becomes `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> IndexerStats {
        let mut stats = IndexerStats::default();
        tracing::info!(
            provider = self.provider.name(),
            model = self.provider.model_name(),
            batch_size = self.batch_size,
            "indexer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pending = tokio::select! {
                _ = stopped(&mut shutdown) => break,
                r = self.store.pending_embeddings(self.batch_size) => r,
            };
            let pending = match pending {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(error = %e, "failed to fetch pending messages");
                    if !sleep_or_stop(&mut shutdown, self.retry_interval).await {
                        break;
                    }
                    continue;
                }
            };

            if pending.is_empty() {
                if !sleep_or_stop(&mut shutdown, self.idle_interval).await {
                    break;
                }
                continue;
            }

            let texts: Vec<String> = pending.iter().map(|p| p.text.clone()).collect();
            let vectors = tokio::select! {
                _ = stopped(&mut shutdown) => break,
                r = embed_checked(self.provider.as_ref(), &texts) => r,
            };
            stats.batches += 1;

            let vectors = match vectors {
                Ok(v) => v,
                Err(e) => {
                    stats.failed_batches += 1;
                    tracing::error!(count = texts.len(), error = %e, "embedding batch failed");
                    if !sleep_or_stop(&mut shutdown, self.retry_interval).await {
                        break;
                    }
                    continue;
                }
            };

            let mut written = 0u64;
            for (item, vector) in pending.iter().zip(vectors.iter()) {
                let result = self
                    .store
                    .set_text_embedding(item.id, vector)
                    .await
                    .with_context(|| format!("Failed to store embedding for {}", item.id));
                match result {
                    Ok(()) => written += 1,
                    Err(e) => {
                        stats.failed_writes += 1;
                        tracing::error!(id = %item.id, error = %e, "embedding write failed");
                    }
                }
            }
            stats.embedded += written;
            tracing::info!(count = written, "embedded batch");

            // Every row failed: the same batch would be selected again at once.
            if written == 0 && !sleep_or_stop(&mut shutdown, self.retry_interval).await {
                break;
            }
        }

        tracing::info!(
            embedded = stats.embedded,
            failed_batches = stats.failed_batches,
            "indexer stopped"
        );
        stats
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Returns `false` if shutdown arrived before the sleep finished.
async fn sleep_or_stop(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = stopped(shutdown) => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// A running indexer task.
pub struct IndexerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<IndexerStats>,
}

impl IndexerHandle {
    /// Spawn the indexer loop on the current tokio runtime.
    pub fn start(indexer: Indexer) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(async move { indexer.run(rx).await });
        Self { shutdown, task }
    }

    /// Signal shutdown and wait for the loop to finish.
    pub async fn stop(self) -> Result<IndexerStats> {
        let _ = self.shutdown.send(true);
        self.task.await.context("Indexer task panicked")
    }
}
