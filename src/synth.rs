//! Answer synthesis over retrieved context.
//!
//! The synthesizer packs retrieved chunks into a prompt (bounded by a
//! character budget), asks the [`LanguageModel`] for an answer under a
//! timeout, and scores the result.
//!
//! Confidence is `0.7 * s + 0.3 * q`, where `s` is the mean retrieval
//! similarity clamped to `[0, 1]` and `q` is 1 for a substantive answer
//! and 0 when the model declines (says the information is insufficient)
//! or returns nothing. For a fixed answer the score never decreases as
//! similarity rises.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::LlmConfig;
use crate::error::{KbError, KbResult};
use crate::llm::LanguageModel;
use crate::router::{QueryMode, Retrieval};

const SIMILARITY_WEIGHT: f64 = 0.7;
const ANSWER_WEIGHT: f64 = 0.3;

/// Phrases that mark an answer as a refusal to answer from the context.
const DECLINE_PHRASES: &[&str] = &[
    "not sufficient",
    "insufficient",
    "not enough information",
    "no information",
    "does not contain",
    "doesn't contain",
    "does not mention",
    "not mentioned",
    "cannot answer",
    "can't answer",
    "unable to answer",
    "unable to find",
    "could not find",
    "couldn't find",
    "i don't know",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: String,
    pub confidence: f64,
    pub sources: Vec<String>,
}

pub struct AnswerSynthesizer {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
    max_context_chars: usize,
}

impl AnswerSynthesizer {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration, max_context_chars: usize) -> Self {
        Self {
            model,
            timeout,
            max_context_chars,
        }
    }

    pub fn from_config(model: Arc<dyn LanguageModel>, config: &LlmConfig) -> Self {
        Self::new(
            model,
            Duration::from_secs(config.timeout_secs),
            config.max_context_chars,
        )
    }

    pub async fn synthesize(&self, question: &str, retrieval: &Retrieval) -> KbResult<Answer> {
        if retrieval.hits.is_empty() {
            return Err(KbError::NoContextFound);
        }

        let (context, sources) = build_context(retrieval, self.max_context_chars);
        let prompt = build_prompt(question.trim(), &context, retrieval.mode);

        let answer = match tokio::time::timeout(self.timeout, self.model.complete(&prompt)).await {
            Ok(Ok(text)) => text.trim().to_string(),
            Ok(Err(e)) => return Err(KbError::Synthesis(format!("{:#}", e))),
            Err(_) => {
                return Err(KbError::Synthesis(format!(
                    "{} timed out after {}s",
                    self.model.model_name(),
                    self.timeout.as_secs_f64()
                )))
            }
        };

        let confidence = confidence(retrieval.mean_score(), &answer);
        tracing::debug!(
            model = self.model.model_name(),
            confidence,
            sources = sources.len(),
            "synthesized answer"
        );
        Ok(Answer {
            answer,
            confidence,
            sources,
        })
    }
}

/// Pack chunks in rank order until the character budget is spent. The
/// first chunk is always included, truncated if it alone exceeds the
/// budget. Returns the context and the sources that made it in.
fn build_context(retrieval: &Retrieval, max_chars: usize) -> (String, Vec<String>) {
    let mut blocks: Vec<String> = Vec::new();
    let mut sources: Vec<String> = Vec::new();
    let mut used = 0usize;

    for hit in &retrieval.hits {
        let block = match retrieval.mode {
            QueryMode::Single => hit.text.clone(),
            QueryMode::Multi => format!("From {}:\n{}", hit.document, hit.text),
        };
        let len = block.chars().count();
        let separator = if blocks.is_empty() { 0 } else { 2 };

        if used + separator + len > max_chars {
            if blocks.is_empty() {
                blocks.push(block.chars().take(max_chars.max(1)).collect());
                sources.push(hit.document.clone());
            }
            break;
        }
        used += separator + len;
        blocks.push(block);
        if !sources.contains(&hit.document) {
            sources.push(hit.document.clone());
        }
    }

    (blocks.join("\n\n"), sources)
}

fn build_prompt(question: &str, context: &str, mode: QueryMode) -> String {
    match mode {
        QueryMode::Single => format!(
            "Based on the following information from the document, please answer the question. \
             If the information is not sufficient, say so.\n\n\
             Question: {}\n\n\
             Information from document:\n{}\n\n\
             Answer:",
            question, context
        ),
        QueryMode::Multi => format!(
            "Based on the following information from multiple documents, please provide a \
             comprehensive answer to the question. If the information is not sufficient, say so.\n\n\
             Question: {}\n\n\
             Information from documents:\n{}\n\n\
             Answer:",
            question, context
        ),
    }
}

/// Whether the answer is a substantive reply rather than a refusal.
pub fn is_substantive(answer: &str) -> bool {
    let lower = answer.trim().to_lowercase();
    !lower.is_empty() && !DECLINE_PHRASES.iter().any(|p| lower.contains(p))
}

pub fn confidence(mean_similarity: f64, answer: &str) -> f64 {
    let similarity = if mean_similarity.is_finite() {
        mean_similarity.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let quality = if is_substantive(answer) { 1.0 } else { 0.0 };
    (SIMILARITY_WEIGHT * similarity + ANSWER_WEIGHT * quality).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchHit;
    use crate::test_support::ScriptedModel;

    fn retrieval(mode: QueryMode, hits: &[(&str, &str, f64)]) -> Retrieval {
        let hits: Vec<SearchHit> = hits
            .iter()
            .enumerate()
            .map(|(i, (doc, text, score))| SearchHit {
                document: doc.to_string(),
                sequence: i as i64,
                text: text.to_string(),
                score: *score,
            })
            .collect();
        let mut sources: Vec<String> = Vec::new();
        for h in &hits {
            if !sources.contains(&h.document) {
                sources.push(h.document.clone());
            }
        }
        Retrieval {
            mode,
            hits,
            sources,
            documents_searched: 2,
        }
    }

    fn synth(model: ScriptedModel) -> AnswerSynthesizer {
        AnswerSynthesizer::new(Arc::new(model), Duration::from_secs(5), 6000)
    }

    #[test]
    fn test_confidence_is_monotonic_in_similarity() {
        let answers = ["The premium is due on 10 July.", "The information is not sufficient."];
        for answer in answers {
            let mut last = -1.0;
            for i in 0..=20 {
                let c = confidence(i as f64 / 20.0, answer);
                assert!(c >= last);
                assert!((0.0..=1.0).contains(&c));
                last = c;
            }
        }
    }

    #[test]
    fn test_decline_lowers_confidence() {
        assert!(confidence(0.8, "Due on 10 July.") > confidence(0.8, "I couldn't find that."));
        assert_eq!(confidence(2.0, "Yes"), 1.0);
        assert_eq!(confidence(-1.0, ""), 0.0);
    }

    #[test]
    fn test_context_respects_budget() {
        let r = retrieval(
            QueryMode::Single,
            &[("a", "0123456789", 0.9), ("a", "abcdefghij", 0.8), ("a", "zzzz", 0.7)],
        );
        let (context, sources) = build_context(&r, 22);
        assert_eq!(context, "0123456789\n\nabcdefghij");
        assert_eq!(sources, vec!["a"]);

        let (context, _) = build_context(&r, 4);
        assert_eq!(context, "0123");
    }

    #[test]
    fn test_multi_prompt_labels_sources() {
        let r = retrieval(QueryMode::Multi, &[("a.pdf", "alpha", 0.9), ("b.pdf", "beta", 0.8)]);
        let (context, sources) = build_context(&r, 6000);
        let prompt = build_prompt("What?", &context, QueryMode::Multi);
        assert!(prompt.contains("From a.pdf:\nalpha\n\nFrom b.pdf:\nbeta"));
        assert!(prompt.contains("Information from documents:"));
        assert_eq!(sources, vec!["a.pdf", "b.pdf"]);
    }

    #[tokio::test]
    async fn test_empty_retrieval_never_calls_model() {
        let r = retrieval(QueryMode::Multi, &[]);
        let err = synth(ScriptedModel::replying("x"))
            .synthesize("q", &r)
            .await
            .unwrap_err();
        assert!(matches!(err, KbError::NoContextFound));
    }

    #[tokio::test]
    async fn test_synthesize_returns_answer_and_sources() {
        let r = retrieval(QueryMode::Single, &[("p.pdf", "Premium due: 10/07/2025", 0.9)]);
        let answer = synth(ScriptedModel::replying("  It is due on 10 July 2025. "))
            .synthesize("When is it due?", &r)
            .await
            .unwrap();
        assert_eq!(answer.answer, "It is due on 10 July 2025.");
        assert_eq!(answer.sources, vec!["p.pdf"]);
        assert!((answer.confidence - (0.7 * 0.9 + 0.3)).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_model_times_out() {
        let model = ScriptedModel {
            reply: "late".into(),
            delay: Some(Duration::from_secs(30)),
        };
        let synthesizer = AnswerSynthesizer::new(Arc::new(model), Duration::from_secs(1), 6000);
        let r = retrieval(QueryMode::Single, &[("p.pdf", "text", 0.5)]);
        let err = synthesizer.synthesize("q", &r).await.unwrap_err();
        assert!(matches!(err, KbError::Synthesis(_)));
    }
}
