use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use docket::ask::QueryService;
use docket::catalog::Catalog;
use docket::config::RetrievalConfig;
use docket::db;
use docket::documents::MemoryDocuments;
use docket::embedding::EmbeddingProvider;
use docket::error::KbResult;
use docket::eval::{self, EvaluationQuery};
use docket::llm::LanguageModel;
use docket::manager::{IndexOutcome, IndexSettings, KnowledgeBase};
use docket::migrate::run_migrations;
use docket::router::{QueryMode, QueryRouter};
use docket::store::{SqliteIndex, VectorIndex};
use docket::synth::AnswerSynthesizer;

const DIMS: usize = 32;

struct HashedWords;

#[async_trait]
impl EmbeddingProvider for HashedWords {
    fn model_name(&self) -> &str {
        "hashed-words"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> KbResult<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
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
                        .fold(17usize, |h, b| h.wrapping_mul(33).wrapping_add(b as usize))
                        % DIMS;
                    v[bucket] += 1.0;
                }
                v
            })
            .collect())
    }
}

struct FixedModel(&'static str);

#[async_trait]
impl LanguageModel for FixedModel {
    fn model_name(&self) -> &str {
        "fixed"
    }
    async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
        Ok(self.0.to_string())
    }
}

const ANSWER: &str = "Hospitalisation is covered up to five lakh rupees per year.";

struct Harness {
    _tmp: TempDir,
    pool: sqlx::SqlitePool,
    docs: Arc<MemoryDocuments>,
    kb: Arc<KnowledgeBase>,
}

async fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect(&tmp.path().join("kb.sqlite")).await.unwrap();
    run_migrations(&pool).await.unwrap();

    let docs = Arc::new(MemoryDocuments::new());
    docs.insert(
        "mediclaim.txt",
        "Hospitalisation is covered up to five lakh rupees per year.",
    )
    .unwrap();
    docs.insert(
        "motor.txt",
        "Own damage and third party liability are covered.",
    )
    .unwrap();
    docs.insert(
        "travel.txt",
        "Travel insurance covers lost baggage and flight delays.",
    )
    .unwrap();

    let kb = KnowledgeBase::new(
        Catalog::open(pool.clone()).await.unwrap(),
        Arc::new(SqliteIndex::new(pool.clone())),
        Arc::new(HashedWords),
        docs.clone(),
        IndexSettings::default(),
    );
    Harness {
        _tmp: tmp,
        pool,
        docs,
        kb: Arc::new(kb),
    }
}

fn service(kb: Arc<KnowledgeBase>) -> QueryService {
    QueryService::new(
        QueryRouter::new(kb, RetrievalConfig::default()),
        AnswerSynthesizer::new(Arc::new(FixedModel(ANSWER)), Duration::from_secs(5), 4000),
    )
}

#[tokio::test]
async fn test_multi_document_answer() {
    let h = harness().await;
    let outcomes = h.kb.index_pending().await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.result.is_ok()));

    let response = service(h.kb.clone()).ask_all("Is hospitalisation covered?").await;
    assert!(!response.is_error(), "{:?}", response.error);
    assert_eq!(response.mode, QueryMode::Multi);
    assert_eq!(response.documents_searched, 3);
    assert_eq!(response.answer, ANSWER);
    assert_eq!(response.sources[0], "mediclaim.txt");
    assert!(response.confidence > 0.0 && response.confidence <= 1.0);
}

#[tokio::test]
async fn test_single_document_answer_stays_in_document() {
    let h = harness().await;
    h.kb.index_pending().await.unwrap();

    let response = service(h.kb.clone())
        .ask_single("motor.txt", "Is hospitalisation covered?")
        .await;
    assert!(!response.is_error(), "{:?}", response.error);
    assert_eq!(response.mode, QueryMode::Single);
    assert_eq!(response.documents_searched, 1);
    assert_eq!(response.sources, vec!["motor.txt".to_string()]);
}

#[tokio::test]
async fn test_unindexed_document_is_reported_in_body() {
    let h = harness().await;
    h.kb.index_from_source("mediclaim.txt").await.unwrap();

    let response = service(h.kb.clone())
        .ask_single("travel.txt", "Is baggage covered?")
        .await;
    assert_eq!(response.error_code.as_deref(), Some("document_not_indexed"));
    assert_eq!(response.confidence, 0.0);
    assert!(response.sources.is_empty());
}

#[tokio::test]
async fn test_empty_knowledge_base_has_no_context() {
    let h = harness().await;
    let response = service(h.kb.clone()).ask_all("Anything at all?").await;
    assert_eq!(response.error_code.as_deref(), Some("no_context_found"));
}

#[tokio::test]
async fn test_answers_are_deterministic() {
    let h = harness().await;
    h.kb.index_pending().await.unwrap();
    let service = service(h.kb.clone());

    let first = service.ask_all("What does travel insurance cover?").await;
    let second = service.ask_all("What does travel insurance cover?").await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_reindex_and_remove_lifecycle() {
    let h = harness().await;
    h.kb.index_all().await.unwrap();
    let entries = h.kb.index().count(None).await.unwrap();
    assert_eq!(entries, 3);

    let again = h.kb.index_from_source("motor.txt").await.unwrap();
    assert!(matches!(again, IndexOutcome::Unchanged { chunks: 1 }));

    h.docs
        .insert("motor.txt", "Zero depreciation cover is an optional add-on.")
        .unwrap();
    let changed = h.kb.index_from_source("motor.txt").await.unwrap();
    assert!(matches!(changed, IndexOutcome::Indexed { chunks: 1 }));
    assert_eq!(h.kb.index().count(Some("motor.txt")).await.unwrap(), 1);

    assert!(h.kb.remove_document("motor.txt").await.unwrap());
    assert!(!h.kb.is_indexed("motor.txt"));
    assert_eq!(h.kb.index().count(None).await.unwrap(), 2);

    let status = h.kb.get_status().await.unwrap();
    assert_eq!(status.indexed_count, 2);
    assert_eq!(status.pending, vec!["motor.txt".to_string()]);
}

#[tokio::test]
async fn test_catalog_survives_reopen() {
    let h = harness().await;
    h.kb.index_pending().await.unwrap();

    let reopened = Catalog::open(h.pool.clone()).await.unwrap();
    assert!(reopened.is_indexed("mediclaim.txt"));
    assert_eq!(reopened.list().len(), 3);
}

#[tokio::test]
async fn test_evaluation_run_and_history() {
    let h = harness().await;
    h.kb.index_pending().await.unwrap();
    let service = service(h.kb.clone());

    let queries = vec![
        EvaluationQuery {
            question: "Is hospitalisation covered?".into(),
            expected_answer: "Hospitalisation is covered up to five lakh rupees.".into(),
            expected_sources: vec!["mediclaim.txt".into()],
            document: Some("mediclaim.txt".into()),
        },
        EvaluationQuery {
            question: "What about baggage?".into(),
            expected_answer: "Lost baggage is covered.".into(),
            expected_sources: vec!["travel.txt".into()],
            document: None,
        },
        EvaluationQuery {
            question: "Is dental covered?".into(),
            expected_answer: "No.".into(),
            expected_sources: vec![],
            document: Some("dental.txt".into()),
        },
    ];

    let report = eval::run_evaluation(&service, &queries).await;
    assert_eq!(report.summary.total_queries, 3);
    assert_eq!(report.summary.successful_queries, 2);
    assert_eq!(report.summary.failed_queries, 1);
    assert_eq!(report.summary.single_document_queries, 1);
    assert_eq!(report.summary.multi_document_queries, 1);

    let first = report.results[0].metrics.as_ref().unwrap();
    assert!(first.answer_relevance > 0.5);
    assert_eq!(first.source_precision, 1.0);
    assert_eq!(first.source_recall, 1.0);
    assert!(report.results[2].metrics.is_none());

    let out = TempDir::new().unwrap();
    let saved = eval::save_report(&report, out.path()).unwrap();
    let history = eval::evaluation_history(out.path()).unwrap();
    assert_eq!(history, vec![saved.clone()]);
    let loaded = eval::load_report(&saved).unwrap();
    assert_eq!(loaded.run_id, report.run_id);
    assert!(eval::compare_reports(&report, &loaded)
        .iter()
        .all(|d| d.delta.map_or(true, |x| x.abs() < 1e-12)));
}
