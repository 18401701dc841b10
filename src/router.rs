//! Query routing: turns a question into ranked context chunks.
//!
//! With a target document the router runs a filtered search against that
//! document only. Without one it searches the whole index and spreads the
//! result across documents: candidates are taken in rank order, and at
//! most `max_chunks_per_doc` chunks are kept from any single document, so
//! an answer can cite several sources. The candidate pool starts at
//! `candidate_k` and doubles until the capped selection fills `top_k` or
//! the index runs out. Slots still open after that are filled from the
//! capped-out candidates in rank order.
//!
//! Ranking ties resolve in index insertion order (see [`crate::store`]),
//! so identical queries against an unchanged index return identical
//! results.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::RetrievalConfig;
use crate::documents::normalize_name;
use crate::embedding::embed_query;
use crate::error::{KbError, KbResult};
use crate::manager::KnowledgeBase;
use crate::models::SearchHit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Single,
    Multi,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Single => "single",
            QueryMode::Multi => "multi",
        }
    }
}

/// Ranked context for one question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Retrieval {
    pub mode: QueryMode,
    pub hits: Vec<SearchHit>,
    /// Distinct source documents in rank order.
    pub sources: Vec<String>,
    pub documents_searched: usize,
}

impl Retrieval {
    pub fn mean_score(&self) -> f64 {
        if self.hits.is_empty() {
            return 0.0;
        }
        self.hits.iter().map(|h| h.score).sum::<f64>() / self.hits.len() as f64
    }
}

pub struct QueryRouter {
    kb: Arc<KnowledgeBase>,
    settings: RetrievalConfig,
}

fn distinct_sources(hits: &[SearchHit]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for hit in hits {
        if !sources.contains(&hit.document) {
            sources.push(hit.document.clone());
        }
    }
    sources
}

impl QueryRouter {
    pub fn new(kb: Arc<KnowledgeBase>, settings: RetrievalConfig) -> Self {
        Self { kb, settings }
    }

    pub fn knowledge_base(&self) -> &KnowledgeBase {
        &self.kb
    }

    /// Route `question` to single-document mode when `target` is given,
    /// multi-document mode otherwise.
    pub async fn route(&self, question: &str, target: Option<&str>) -> KbResult<Retrieval> {
        match target {
            Some(document) => self.single(question, document).await,
            None => self.multi(question).await,
        }
    }

    pub async fn single(&self, question: &str, document: &str) -> KbResult<Retrieval> {
        let question = question.trim();
        if question.is_empty() {
            return Err(KbError::EmptyInput);
        }
        let document = normalize_name(document)?;
        if !self.kb.catalog().is_indexed(&document) {
            return Err(KbError::DocumentNotIndexed(document));
        }

        let query = embed_query(self.kb.embedder(), question).await?;
        let hits = self
            .kb
            .index()
            .similarity_search(&query, self.settings.top_k, Some(&document))
            .await?;
        tracing::debug!(document = %document, hits = hits.len(), "single-document retrieval");

        Ok(Retrieval {
            mode: QueryMode::Single,
            sources: distinct_sources(&hits),
            hits,
            documents_searched: 1,
        })
    }

    pub async fn multi(&self, question: &str) -> KbResult<Retrieval> {
        let question = question.trim();
        if question.is_empty() {
            return Err(KbError::EmptyInput);
        }

        let query = embed_query(self.kb.embedder(), question).await?;
        let top_k = self.settings.top_k;
        let max_per_doc = self.settings.max_chunks_per_doc.max(1);
        let mut candidate_k = self.settings.candidate_k.max(top_k).max(1);
        let hits = loop {
            let candidates = self
                .kb
                .index()
                .similarity_search(&query, candidate_k, None)
                .await?;
            let exhausted = candidates.len() < candidate_k;
            let (hits, spread) = spread_across_documents(candidates, top_k, max_per_doc);
            if spread || exhausted {
                break hits;
            }
            candidate_k = candidate_k.saturating_mul(2);
            tracing::debug!(candidate_k, "widening multi-document candidate pool");
        };
        let documents_searched = self.kb.indexed_documents().len();
        tracing::debug!(
            hits = hits.len(),
            documents_searched,
            "multi-document retrieval"
        );

        Ok(Retrieval {
            mode: QueryMode::Multi,
            sources: distinct_sources(&hits),
            hits,
            documents_searched,
        })
    }
}

/// Select `top_k` hits from ranked candidates, keeping at most
/// `max_per_doc` from any one document. Open slots are then filled from the
/// capped-out candidates. The selection keeps rank order. The flag is
/// `true` when the capped pass alone filled every slot.
fn spread_across_documents(
    candidates: Vec<SearchHit>,
    top_k: usize,
    max_per_doc: usize,
) -> (Vec<SearchHit>, bool) {
    let mut keep = vec![false; candidates.len()];
    let mut kept = 0;
    {
        let mut per_doc: HashMap<&str, usize> = HashMap::new();
        for (i, hit) in candidates.iter().enumerate() {
            if kept >= top_k {
                break;
            }
            let taken = per_doc.entry(hit.document.as_str()).or_insert(0);
            if *taken < max_per_doc {
                *taken += 1;
                keep[i] = true;
                kept += 1;
            }
        }
    }
    let spread = kept >= top_k;

    for slot in keep.iter_mut().filter(|k| !**k) {
        if kept >= top_k {
            break;
        }
        *slot = true;
        kept += 1;
    }

    let hits = candidates
        .into_iter()
        .zip(keep)
        .filter_map(|(hit, keep)| keep.then_some(hit))
        .collect();
    (hits, spread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::db;
    use crate::documents::MemoryDocuments;
    use crate::manager::IndexSettings;
    use crate::migrate::run_migrations;
    use crate::models::IndexEntry;
    use crate::store::InMemoryIndex;
    use crate::test_support::{bag_of_words, BagOfWordsEmbedder};
    use tempfile::TempDir;

    fn hit(doc: &str, seq: i64, score: f64) -> SearchHit {
        SearchHit {
            document: doc.to_string(),
            sequence: seq,
            text: String::new(),
            score,
        }
    }

    #[test]
    fn test_spread_caps_per_document() {
        let candidates = vec![
            hit("a", 0, 0.9),
            hit("a", 1, 0.8),
            hit("a", 2, 0.7),
            hit("b", 0, 0.6),
            hit("c", 0, 0.5),
        ];
        let (out, spread) = spread_across_documents(candidates, 4, 2);
        assert!(spread);
        let ids: Vec<(String, i64)> = out.iter().map(|h| (h.document.clone(), h.sequence)).collect();
        assert_eq!(
            ids,
            vec![
                ("a".to_string(), 0),
                ("a".to_string(), 1),
                ("b".to_string(), 0),
                ("c".to_string(), 0)
            ]
        );
        assert_eq!(distinct_sources(&out), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_spread_fills_open_slots_in_rank_order() {
        let candidates = vec![
            hit("a", 0, 0.9),
            hit("a", 1, 0.8),
            hit("a", 2, 0.7),
            hit("a", 3, 0.6),
            hit("b", 0, 0.5),
        ];
        let (out, spread) = spread_across_documents(candidates, 4, 2);
        assert!(!spread);
        let ids: Vec<(&str, i64)> = out.iter().map(|h| (h.document.as_str(), h.sequence)).collect();
        assert_eq!(ids, vec![("a", 0), ("a", 1), ("a", 2), ("b", 0)]);
    }

    async fn knowledge_base(tmp: &TempDir) -> Arc<KnowledgeBase> {
        let pool = db::connect(&tmp.path().join("kb.db")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        Arc::new(KnowledgeBase::new(
            Catalog::open(pool).await.unwrap(),
            Arc::new(InMemoryIndex::new()),
            Arc::new(BagOfWordsEmbedder),
            Arc::new(MemoryDocuments::new()),
            IndexSettings::default(),
        ))
    }

    #[tokio::test]
    async fn test_multi_reaches_past_a_dominant_document() {
        let tmp = TempDir::new().unwrap();
        let kb = knowledge_base(&tmp).await;
        kb.index_document("small.txt", "premium due date is in July")
            .await
            .unwrap();

        let settings = RetrievalConfig::default();
        let big: Vec<IndexEntry> = (0..settings.candidate_k as i64 + 20)
            .map(|sequence| IndexEntry {
                document: "big.txt".to_string(),
                sequence,
                text: "premium due".to_string(),
                embedding: bag_of_words("premium due"),
            })
            .collect();
        kb.index().upsert(&big).await.unwrap();

        let router = QueryRouter::new(kb.clone(), settings.clone());
        let retrieval = router.multi("premium due").await.unwrap();
        assert_eq!(retrieval.hits.len(), settings.top_k);
        assert_eq!(retrieval.hits[0].document, "big.txt");
        assert_eq!(retrieval.sources, vec!["big.txt", "small.txt"]);
        let from_big = retrieval
            .hits
            .iter()
            .filter(|h| h.document == "big.txt")
            .count();
        assert_eq!(from_big, settings.top_k - 1);
    }

    #[tokio::test]
    async fn test_multi_returns_what_a_small_index_has() {
        let tmp = TempDir::new().unwrap();
        let kb = knowledge_base(&tmp).await;
        kb.index_document("only.txt", "premium due date is in July")
            .await
            .unwrap();

        let router = QueryRouter::new(kb, RetrievalConfig::default());
        let retrieval = router.multi("premium due").await.unwrap();
        assert_eq!(retrieval.hits.len(), 1);
        assert_eq!(retrieval.sources, vec!["only.txt"]);
    }

    #[test]
    fn test_mean_score() {
        let retrieval = Retrieval {
            mode: QueryMode::Multi,
            hits: vec![hit("a", 0, 0.5), hit("b", 0, 1.0)],
            sources: vec![],
            documents_searched: 2,
        };
        assert!((retrieval.mean_score() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&QueryMode::Multi).unwrap(), "\"multi\"");
    }
}
