//! Deterministic fakes shared by unit tests.

use std::time::Duration;

use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::{KbError, KbResult};
use crate::llm::LanguageModel;
use crate::models::{IndexEntry, SearchHit};
use crate::store::VectorIndex;

pub const DIMS: usize = 64;

/// Hashes lowercased words into a fixed number of buckets. Texts sharing
/// words get similar vectors.
pub struct BagOfWordsEmbedder;

pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text.split_whitespace() {
        let word = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if word.is_empty() {
            continue;
        }
        let bucket = word
            .bytes()
            .fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize))
            % DIMS;
        v[bucket] += 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for BagOfWordsEmbedder {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> KbResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }
}

/// Rejects every write.
pub struct FailingIndex;

#[async_trait]
impl VectorIndex for FailingIndex {
    async fn upsert(&self, _entries: &[IndexEntry]) -> KbResult<()> {
        Err(KbError::IndexWrite("disk full".into()))
    }
    async fn replace_document(&self, _document: &str, _entries: &[IndexEntry]) -> KbResult<()> {
        Err(KbError::IndexWrite("disk full".into()))
    }
    async fn similarity_search(
        &self,
        _query: &[f32],
        _k: usize,
        _document: Option<&str>,
    ) -> KbResult<Vec<SearchHit>> {
        Ok(Vec::new())
    }
    async fn delete_document(&self, _document: &str) -> KbResult<u64> {
        Err(KbError::IndexWrite("disk full".into()))
    }
    async fn clear(&self) -> KbResult<()> {
        Err(KbError::IndexWrite("disk full".into()))
    }
    async fn count(&self, _document: Option<&str>) -> KbResult<u64> {
        Ok(0)
    }
}

/// Returns a fixed reply after an optional delay.
pub struct ScriptedModel {
    pub reply: String,
    pub delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            delay: None,
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }
    async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.reply.clone())
    }
}
