//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, plus the checks the indexer and searcher apply to every
//! provider response.
//!
//! Concrete providers (Ollama, OpenAI, Google) live in the `telemikiya`
//! app crate.

use anyhow::Result;
use async_trait::async_trait;

use crate::error::Error;

/// Trait for embedding providers.
///
/// `embed` takes a batch and must return exactly one vector per input,
/// in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Registry name (e.g. `"ollama"`).
    fn name(&self) -> &str;
    /// Returns the model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `768`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed `texts` and check the response shape against the provider's
/// configured dimensions.
///
/// # Errors
///
/// Returns [`Error::EmbeddingCountMismatch`] if the provider returned a
/// different number of vectors than texts, and [`Error::DimensionMismatch`]
/// if any vector has the wrong length.
pub async fn embed_checked(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let vectors = provider.embed(texts).await?;
    check_vectors(texts.len(), provider.dims(), &vectors)?;
    Ok(vectors)
}

/// Embed a single text.
pub async fn embed_one(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let mut vectors = embed_checked(provider, &[text.to_string()]).await?;
    vectors.pop().ok_or_else(|| {
        Error::EmbeddingCountMismatch {
            expected: 1,
            actual: 0,
        }
        .into()
    })
}

fn check_vectors(expected: usize, dims: usize, vectors: &[Vec<f32>]) -> Result<(), Error> {
    if vectors.len() != expected {
        return Err(Error::EmbeddingCountMismatch {
            expected,
            actual: vectors.len(),
        });
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(Error::DimensionMismatch {
            expected: dims,
            actual: bad.len(),
        });
    }
    Ok(())
}

/// Compute cosine distance (`1 - cosine similarity`) between two vectors.
///
/// Matches pgvector's `<=>` operator: `0.0` for identical direction,
/// `2.0` for opposite. Returns `1.0` for empty vectors, vectors of
/// different lengths, or zero vectors.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 1.0;
    }

    1.0 - dot / denom
}
