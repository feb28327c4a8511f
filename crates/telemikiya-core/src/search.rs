//! Hybrid search: fuse a semantic ranking and a lexical ranking.
//!
//! The algorithm operates entirely through the [`Store`] trait. The
//! calling application embeds the query and passes the vector in.
//!
//! # Fusion Algorithm
//!
//! 1. Fetch up to `K` semantic candidates (ascending cosine distance).
//! 2. Fetch up to `K` lexical candidates (descending full-text relevance).
//! 3. Both sub-queries apply the same [`SearchFilter`].
//! 4. Convert each position rank `r` to `(K - r + 1) / K`; a side that did
//!    not return the message contributes `0`.
//! 5. `score = semantic + lexical`. A message found by both sides always
//!    outranks one found by a single side at the same positions.
//! 6. Sort by score (desc), sent_at (desc), id (asc), keep `K`.
//! 7. Attach each message's dialog.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{Dialog, Message, RankedCandidate, SearchFilter};
use crate::store::Store;

/// Bundles all inputs for a single search invocation.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    /// Raw query text, used for the lexical match.
    pub input: &'a str,
    /// Pre-computed embedding of `input`.
    pub query_vec: &'a [f32],
    /// Maximum number of results, and capacity of each sub-query.
    pub count: usize,
    pub filter: SearchFilter,
    /// Drop semantic candidates farther than this cosine distance.
    pub max_distance: Option<f64>,
}

/// A fused result before dialogs are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub message: Message,
    pub score: f64,
    pub semantic_rank: Option<usize>,
    pub lexical_rank: Option<usize>,
}

/// A search result with its dialog.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub message: Message,
    pub dialog: Dialog,
    /// Fused score in `[0.0, 2.0]`.
    pub score: f64,
    pub semantic_rank: Option<usize>,
    pub lexical_rank: Option<usize>,
}

/// Score contribution of a 1-based `rank` in a sub-query of capacity `k`.
pub fn rank_score(rank: usize, k: usize) -> f64 {
    if k == 0 || rank == 0 || rank > k {
        return 0.0;
    }
    (k - rank + 1) as f64 / k as f64
}

/// Full outer join of the two rankings by message id, scored and sorted.
///
/// Truncated to `k`.
pub fn fuse(
    semantic: Vec<RankedCandidate>,
    lexical: Vec<RankedCandidate>,
    k: usize,
) -> Vec<FusedCandidate> {
    let mut by_id: HashMap<Uuid, FusedCandidate> = HashMap::new();

    for c in semantic {
        let entry = by_id.entry(c.message.id).or_insert_with(|| FusedCandidate {
            message: c.message,
            score: 0.0,
            semantic_rank: None,
            lexical_rank: None,
        });
        entry.semantic_rank = Some(c.rank);
    }
    for c in lexical {
        let entry = by_id.entry(c.message.id).or_insert_with(|| FusedCandidate {
            message: c.message,
            score: 0.0,
            semantic_rank: None,
            lexical_rank: None,
        });
        entry.lexical_rank = Some(c.rank);
    }

    let mut fused: Vec<FusedCandidate> = by_id
        .into_values()
        .map(|mut f| {
            f.score = f.semantic_rank.map_or(0.0, |r| rank_score(r, k))
                + f.lexical_rank.map_or(0.0, |r| rank_score(r, k));
            f
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.message.sent_at.cmp(&a.message.sent_at))
            .then(a.message.id.cmp(&b.message.id))
    });
    fused.truncate(k);
    fused
}

/// Run a hybrid search against a [`Store`] backend.
///
/// Returns at most `req.count` hits. Fewer candidates than `count` is not
/// an error.
pub async fn search<S: Store + ?Sized>(store: &S, req: &SearchRequest<'_>) -> Result<Vec<SearchHit>> {
    if req.count == 0 {
        return Ok(Vec::new());
    }

    let semantic = store
        .semantic_search(req.query_vec, req.count, req.max_distance, &req.filter)
        .await?;
    let lexical = store
        .lexical_search(req.input, req.count, &req.filter)
        .await?;
    tracing::debug!(
        semantic = semantic.len(),
        lexical = lexical.len(),
        "search candidates"
    );

    let fused = fuse(semantic, lexical, req.count);

    let mut dialog_ids: Vec<i64> = Vec::new();
    let mut seen = HashSet::new();
    for f in &fused {
        if seen.insert(f.message.dialog_id) {
            dialog_ids.push(f.message.dialog_id);
        }
    }
    let dialogs: HashMap<i64, Dialog> = store
        .get_dialogs(&dialog_ids)
        .await?
        .into_iter()
        .map(|d| (d.id, d))
        .collect();

    let mut hits = Vec::with_capacity(fused.len());
    for f in fused {
        let Some(dialog) = dialogs.get(&f.message.dialog_id) else {
            tracing::warn!(dialog_id = f.message.dialog_id, "search hit without dialog");
            continue;
        };
        hits.push(SearchHit {
            dialog: dialog.clone(),
            message: f.message,
            score: f.score,
            semantic_rank: f.semantic_rank,
            lexical_rank: f.lexical_rank,
        });
    }
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaInfo;
    use chrono::{TimeZone, Utc};

    fn message(n: u32) -> Message {
        Message {
            id: Uuid::from_u128(n as u128),
            msg_id: n as i32,
            dialog_id: 1,
            text: format!("m{}", n),
            text_embedding: None,
            has_media: false,
            media_info: MediaInfo::None,
            sent_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, n).unwrap(),
        }
    }

    fn ranked(n: u32, rank: usize) -> RankedCandidate {
        RankedCandidate {
            message: message(n),
            rank,
        }
    }

    #[test]
    fn test_rank_score_bounds() {
        assert!((rank_score(1, 4) - 1.0).abs() < 1e-9);
        assert!((rank_score(4, 4) - 0.25).abs() < 1e-9);
        assert_eq!(rank_score(5, 4), 0.0);
        assert_eq!(rank_score(1, 0), 0.0);
    }

    #[test]
    fn test_message_in_both_rankings_wins() {
        // M1 in both, M2 semantic only, M3 lexical only.
        let semantic = vec![ranked(1, 1), ranked(2, 2)];
        let lexical = vec![ranked(1, 1), ranked(3, 2)];
        let fused = fuse(semantic, lexical, 3);
        let order: Vec<i32> = fused.iter().map(|f| f.message.msg_id).collect();
        assert_eq!(order[0], 1);
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].semantic_rank, Some(1));
        assert_eq!(fused[0].lexical_rank, Some(1));
    }

    #[test]
    fn test_single_side_equal_positions_tie_newer_first() {
        let fused = fuse(vec![ranked(2, 1)], vec![ranked(3, 1)], 2);
        assert!((fused[0].score - fused[1].score).abs() < 1e-9);
        assert_eq!(fused[0].message.msg_id, 3);
    }

    #[test]
    fn test_both_sides_beat_single_side_at_same_positions() {
        for k in 1..6 {
            for r in 1..=k {
                let both = rank_score(r, k) + rank_score(r, k);
                let single = rank_score(r, k);
                assert!(both > single);
            }
        }
    }

    #[test]
    fn test_fuse_truncates_to_k() {
        let semantic = vec![ranked(1, 1), ranked(2, 2)];
        let lexical = vec![ranked(3, 1), ranked(4, 2)];
        assert_eq!(fuse(semantic, lexical, 2).len(), 2);
    }

    #[test]
    fn test_fuse_empty() {
        assert!(fuse(vec![], vec![], 10).is_empty());
    }
}
