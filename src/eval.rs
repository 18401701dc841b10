//! Retrieval quality evaluation.
//!
//! An evaluation run sends a batch of [`EvaluationQuery`] values through
//! the [`QueryService`] and scores each answer against its expectation.
//!
//! | Metric | Definition |
//! |--------|------------|
//! | `answer_relevance` | Jaccard similarity of expected and actual word sets (1 when both empty) |
//! | `keyword_coverage` | Share of expected non-stop-words found in the answer (1 when there are none) |
//! | `source_precision` | Expected ∩ actual sources over actual sources (0 when no actual sources) |
//! | `source_recall` | Expected ∩ actual sources over expected sources (1 when none expected) |
//! | `source_f1` | Harmonic mean of precision and recall (0 when both are 0) |
//! | `source_accuracy` | Jaccard similarity of the source sets (1 when both empty) |
//! | `length_ratio` | Actual over expected word count (`null` when nothing was expected) |
//! | `confidence` | Synthesizer confidence |
//!
//! Word sets are lowercased, split on whitespace, and stripped of leading
//! and trailing punctuation. Queries that fail are kept in the report
//! with their error but excluded from every aggregate.
//!
//! Reports are JSON files named `evaluation_results_<YYYYmmdd_HHMMSS>.json`
//! so that lexical order is chronological order.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ask::QueryService;
use crate::error::KbResult;
use crate::router::QueryMode;

const REPORT_PREFIX: &str = "evaluation_results_";

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "of", "at", "by", "for", "with", "about", "to",
    "from", "in", "on", "into", "over", "under", "is", "are", "was", "were", "be", "been",
    "being", "has", "have", "had", "do", "does", "did", "it", "its", "this", "that", "these",
    "those", "as", "can", "will", "would", "should", "may", "might", "not", "no", "so", "than",
    "then", "there", "their", "they", "them", "he", "she", "we", "you", "i", "his", "her", "our",
    "your", "which", "who", "whom", "what", "when", "where", "why", "how", "all", "any", "each",
    "also", "such", "up", "out",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationQuery {
    #[serde(alias = "query")]
    pub question: String,
    pub expected_answer: String,
    #[serde(default)]
    pub expected_sources: Vec<String>,
    #[serde(default, alias = "pdf_name", skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub answer_relevance: f64,
    pub keyword_coverage: f64,
    pub source_precision: f64,
    pub source_recall: f64,
    pub source_f1: f64,
    pub source_accuracy: f64,
    pub length_ratio: Option<f64>,
    pub confidence: f64,
}

impl QueryMetrics {
    /// Named metric values; `length_ratio` is omitted when undefined.
    pub fn values(&self) -> Vec<(&'static str, f64)> {
        let mut values = vec![
            ("answer_relevance", self.answer_relevance),
            ("keyword_coverage", self.keyword_coverage),
            ("source_precision", self.source_precision),
            ("source_recall", self.source_recall),
            ("source_f1", self.source_f1),
            ("source_accuracy", self.source_accuracy),
            ("confidence", self.confidence),
        ];
        if let Some(ratio) = self.length_ratio {
            values.push(("length_ratio", ratio));
        }
        values
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    #[serde(flatten)]
    pub query: EvaluationQuery,
    pub mode: QueryMode,
    pub actual_answer: String,
    pub actual_sources: Vec<String>,
    pub metrics: Option<QueryMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub std: f64,
}

impl MetricStats {
    /// Population statistics of `values`. `None` for an empty slice.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(Self {
            count: values.len(),
            mean,
            median,
            std: variance.sqrt(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeSummary {
    pub queries: usize,
    pub answer_relevance_mean: f64,
    pub keyword_coverage_mean: f64,
    pub confidence_mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub total_queries: usize,
    pub successful_queries: usize,
    pub failed_queries: usize,
    pub single_document_queries: usize,
    pub multi_document_queries: usize,
    pub metrics: BTreeMap<String, MetricStats>,
    pub single: Option<ModeSummary>,
    pub multi: Option<ModeSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub summary: EvaluationSummary,
    pub results: Vec<EvaluationResult>,
}

/// Change in one metric's mean between two reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDelta {
    pub metric: String,
    pub baseline: Option<f64>,
    pub current: Option<f64>,
    pub delta: Option<f64>,
}

// ============ Metrics ============

pub fn word_set(text: &str) -> BTreeSet<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

pub fn answer_relevance(expected: &str, actual: &str) -> f64 {
    jaccard(&word_set(expected), &word_set(actual))
}

pub fn keyword_coverage(expected: &str, actual: &str) -> f64 {
    let stop: HashSet<&str> = STOP_WORDS.iter().copied().collect();
    let keywords: BTreeSet<String> = word_set(expected)
        .into_iter()
        .filter(|w| !stop.contains(w.as_str()))
        .collect();
    if keywords.is_empty() {
        return 1.0;
    }
    let actual = word_set(actual);
    keywords.intersection(&actual).count() as f64 / keywords.len() as f64
}

/// Source precision, recall, F1, and Jaccard accuracy.
pub fn source_metrics(expected: &[String], actual: &[String]) -> (f64, f64, f64, f64) {
    let expected: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
    let actual: BTreeSet<&str> = actual.iter().map(String::as_str).collect();
    let hits = expected.intersection(&actual).count() as f64;

    let precision = if actual.is_empty() {
        0.0
    } else {
        hits / actual.len() as f64
    };
    let recall = if expected.is_empty() {
        1.0
    } else {
        hits / expected.len() as f64
    };
    let f1 = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };
    (precision, recall, f1, jaccard(&expected, &actual))
}

pub fn length_ratio(expected: &str, actual: &str) -> Option<f64> {
    let expected_words = expected.split_whitespace().count();
    if expected_words == 0 {
        return None;
    }
    Some(actual.split_whitespace().count() as f64 / expected_words as f64)
}

pub fn compute_metrics(
    query: &EvaluationQuery,
    actual_answer: &str,
    actual_sources: &[String],
    confidence: f64,
) -> QueryMetrics {
    let (source_precision, source_recall, source_f1, source_accuracy) =
        source_metrics(&query.expected_sources, actual_sources);
    QueryMetrics {
        answer_relevance: answer_relevance(&query.expected_answer, actual_answer),
        keyword_coverage: keyword_coverage(&query.expected_answer, actual_answer),
        source_precision,
        source_recall,
        source_f1,
        source_accuracy,
        length_ratio: length_ratio(&query.expected_answer, actual_answer),
        confidence,
    }
}

// ============ Runs ============

pub async fn run_evaluation(
    service: &QueryService,
    queries: &[EvaluationQuery],
) -> EvaluationReport {
    let mut results = Vec::with_capacity(queries.len());
    for query in queries {
        let response = service
            .ask(&query.question, query.document.as_deref())
            .await;
        let metrics = if response.is_error() {
            None
        } else {
            Some(compute_metrics(
                query,
                &response.answer,
                &response.sources,
                response.confidence,
            ))
        };
        results.push(EvaluationResult {
            query: query.clone(),
            mode: response.mode,
            actual_answer: response.answer,
            actual_sources: response.sources,
            metrics,
            error: response.error,
        });
    }

    let summary = summarize(&results);
    tracing::info!(
        total = summary.total_queries,
        failed = summary.failed_queries,
        "evaluation finished"
    );
    EvaluationReport {
        run_id: Uuid::new_v4(),
        created_at: Utc::now(),
        summary,
        results,
    }
}

fn mode_summary(results: &[&EvaluationResult]) -> Option<ModeSummary> {
    let metrics: Vec<&QueryMetrics> = results.iter().filter_map(|r| r.metrics.as_ref()).collect();
    if metrics.is_empty() {
        return None;
    }
    let mean = |f: fn(&QueryMetrics) -> f64| {
        metrics.iter().map(|m| f(m)).sum::<f64>() / metrics.len() as f64
    };
    Some(ModeSummary {
        queries: metrics.len(),
        answer_relevance_mean: mean(|m| m.answer_relevance),
        keyword_coverage_mean: mean(|m| m.keyword_coverage),
        confidence_mean: mean(|m| m.confidence),
    })
}

pub fn summarize(results: &[EvaluationResult]) -> EvaluationSummary {
    let mut by_metric: BTreeMap<&'static str, Vec<f64>> = BTreeMap::new();
    for metrics in results.iter().filter_map(|r| r.metrics.as_ref()) {
        for (name, value) in metrics.values() {
            by_metric.entry(name).or_default().push(value);
        }
    }
    let metrics = by_metric
        .into_iter()
        .filter_map(|(name, values)| MetricStats::from_values(&values).map(|s| (name.to_string(), s)))
        .collect();

    let successful: Vec<&EvaluationResult> =
        results.iter().filter(|r| r.metrics.is_some()).collect();
    let single: Vec<&EvaluationResult> = successful
        .iter()
        .copied()
        .filter(|r| r.mode == QueryMode::Single)
        .collect();
    let multi: Vec<&EvaluationResult> = successful
        .iter()
        .copied()
        .filter(|r| r.mode == QueryMode::Multi)
        .collect();

    EvaluationSummary {
        total_queries: results.len(),
        successful_queries: successful.len(),
        failed_queries: results.len() - successful.len(),
        single_document_queries: single.len(),
        multi_document_queries: multi.len(),
        metrics,
        single: mode_summary(&single),
        multi: mode_summary(&multi),
    }
}

// ============ Persistence ============

/// Write `report` into `dir`, returning the file path.
pub fn save_report(report: &EvaluationReport, dir: &Path) -> KbResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stamp = report.created_at.format("%Y%m%d_%H%M%S");
    let mut path = dir.join(format!("{}{}.json", REPORT_PREFIX, stamp));
    let mut n = 2;
    while path.exists() {
        path = dir.join(format!("{}{}_{}.json", REPORT_PREFIX, stamp, n));
        n += 1;
    }
    std::fs::write(&path, serde_json::to_string_pretty(report)?)?;
    tracing::info!(path = %path.display(), "saved evaluation report");
    Ok(path)
}

pub fn load_report(path: &Path) -> KbResult<EvaluationReport> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Saved report files in `dir`, newest first.
pub fn evaluation_history(dir: &Path) -> KbResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy())
                .is_some_and(|n| n.starts_with(REPORT_PREFIX) && n.ends_with(".json"))
        })
        .collect();
    files.sort();
    files.reverse();
    Ok(files)
}

pub fn compare_reports(baseline: &EvaluationReport, current: &EvaluationReport) -> Vec<MetricDelta> {
    let names: BTreeSet<&String> = baseline
        .summary
        .metrics
        .keys()
        .chain(current.summary.metrics.keys())
        .collect();
    names
        .into_iter()
        .map(|name| {
            let before = baseline.summary.metrics.get(name).map(|s| s.mean);
            let after = current.summary.metrics.get(name).map(|s| s.mean);
            MetricDelta {
                metric: name.clone(),
                baseline: before,
                current: after,
                delta: before.zip(after).map(|(b, a)| a - b),
            }
        })
        .collect()
}

/// Read a JSON array of queries.
pub fn load_queries(path: &Path) -> KbResult<Vec<EvaluationQuery>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Starter query set for insurance documents.
pub fn sample_queries() -> Vec<EvaluationQuery> {
    vec![
        EvaluationQuery {
            question: "What are the insurance benefits?".into(),
            expected_answer: "The insurance provides coverage for medical expenses including \
                              hospitalization, outpatient treatment, and prescription drugs."
                .into(),
            expected_sources: vec![
                "mediclaim.pdf".into(),
                "2022 Insurance Benefit Manual.pdf".into(),
            ],
            document: None,
        },
        EvaluationQuery {
            question: "What is the coverage limit?".into(),
            expected_answer:
                "The coverage limit varies by plan type and can range from 1 lakh to 10 lakhs."
                    .into(),
            expected_sources: vec!["mediclaim.pdf".into()],
            document: Some("mediclaim.pdf".into()),
        },
        EvaluationQuery {
            question: "What expenses are not covered?".into(),
            expected_answer: "Expenses not covered include cosmetic procedures, pre-existing \
                              conditions, and experimental treatments."
                .into(),
            expected_sources: vec!["NonPayableChanges.pdf".into()],
            document: Some("NonPayableChanges.pdf".into()),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn test_answer_relevance_jaccard() {
        assert!(approx(answer_relevance("a b c", "b c d"), 0.5));
        assert!(approx(answer_relevance("The Premium.", "the premium"), 1.0));
        assert_eq!(answer_relevance("", ""), 1.0);
        assert_eq!(answer_relevance("a", ""), 0.0);
    }

    #[test]
    fn test_source_metrics() {
        let (p, r, f1, acc) = source_metrics(&strings(&["x", "y"]), &strings(&["x"]));
        assert!(approx(p, 1.0));
        assert!(approx(r, 0.5));
        assert!(approx(f1, 0.667));
        assert!(approx(acc, 0.5));

        let (p, r, f1, acc) = source_metrics(&[], &[]);
        assert_eq!((p, r, f1, acc), (0.0, 1.0, 0.0, 1.0));

        let (p, r, f1, _) = source_metrics(&strings(&["x"]), &strings(&["z"]));
        assert_eq!((p, r, f1), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_keyword_coverage_ignores_stop_words() {
        assert!(approx(
            keyword_coverage("The premium is due", "premium paid"),
            0.5
        ));
        assert_eq!(keyword_coverage("the and of", "anything"), 1.0);
    }

    #[test]
    fn test_length_ratio() {
        assert_eq!(length_ratio("one two", "one two three four"), Some(2.0));
        assert_eq!(length_ratio("   ", "anything"), None);
    }

    #[test]
    fn test_metric_stats() {
        let stats = MetricStats::from_values(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(approx(stats.mean, 2.5));
        assert!(approx(stats.median, 2.5));
        assert!(approx(stats.std, 1.118));
        assert!(MetricStats::from_values(&[]).is_none());
    }

    fn result(mode: QueryMode, relevance: Option<f64>) -> EvaluationResult {
        EvaluationResult {
            query: EvaluationQuery {
                question: "q".into(),
                expected_answer: "a".into(),
                expected_sources: vec![],
                document: None,
            },
            mode,
            actual_answer: String::new(),
            actual_sources: vec![],
            metrics: relevance.map(|r| QueryMetrics {
                answer_relevance: r,
                keyword_coverage: r,
                source_precision: 0.0,
                source_recall: 1.0,
                source_f1: 0.0,
                source_accuracy: 1.0,
                length_ratio: None,
                confidence: 0.5,
            }),
            error: relevance.is_none().then(|| "document 'x' is not indexed".to_string()),
        }
    }

    #[test]
    fn test_summary_excludes_failures() {
        let results = vec![
            result(QueryMode::Single, Some(1.0)),
            result(QueryMode::Multi, Some(0.0)),
            result(QueryMode::Multi, None),
        ];
        let summary = summarize(&results);
        assert_eq!(summary.total_queries, 3);
        assert_eq!(summary.failed_queries, 1);
        assert_eq!(summary.single_document_queries, 1);
        assert_eq!(summary.multi_document_queries, 1);
        assert!(approx(summary.metrics["answer_relevance"].mean, 0.5));
        assert!(!summary.metrics.contains_key("length_ratio"));
        assert!(approx(summary.single.unwrap().answer_relevance_mean, 1.0));
    }

    fn report(relevance: f64) -> EvaluationReport {
        let results = vec![result(QueryMode::Multi, Some(relevance))];
        EvaluationReport {
            run_id: Uuid::new_v4(),
            created_at: DateTime::parse_from_rfc3339("2025-07-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            summary: summarize(&results),
            results,
        }
    }

    #[test]
    fn test_save_load_history_compare() {
        let tmp = TempDir::new().unwrap();
        let first = report(0.25);
        let second = report(0.75);

        let p1 = save_report(&first, tmp.path()).unwrap();
        let p2 = save_report(&second, tmp.path()).unwrap();
        assert_eq!(
            p1.file_name().unwrap().to_string_lossy(),
            "evaluation_results_20250701_100000.json"
        );
        assert_ne!(p1, p2);

        let history = evaluation_history(tmp.path()).unwrap();
        assert_eq!(history, vec![p2.clone(), p1.clone()]);

        let loaded = load_report(&p1).unwrap();
        assert_eq!(loaded, first);

        let deltas = compare_reports(&first, &load_report(&p2).unwrap());
        let relevance = deltas
            .iter()
            .find(|d| d.metric == "answer_relevance")
            .unwrap();
        assert!(approx(relevance.delta.unwrap(), 0.5));
    }

    #[test]
    fn test_queries_accept_legacy_field_names() {
        let json = r#"[{"query": "Q?", "expected_answer": "A", "pdf_name": "p.pdf"}]"#;
        let queries: Vec<EvaluationQuery> = serde_json::from_str(json).unwrap();
        assert_eq!(queries[0].question, "Q?");
        assert_eq!(queries[0].document.as_deref(), Some("p.pdf"));
        assert!(queries[0].expected_sources.is_empty());
    }

    #[test]
    fn test_sample_queries_cover_both_modes() {
        let samples = sample_queries();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().any(|q| q.document.is_none()));
        assert!(samples.iter().any(|q| q.document.is_some()));
    }
}
