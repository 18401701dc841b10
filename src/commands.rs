//! CLI command implementations.
//!
//! Each `run_*` function wires the components it needs from the loaded
//! [`Config`] and prints its result to stdout. Diagnostics go through
//! `tracing` to stderr.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;

use crate::ask::QueryService;
use crate::config::Config;
use crate::db;
use crate::documents::DirectoryDocuments;
use crate::eval;
use crate::extract;
use crate::llm::{create_model, LanguageModel};
use crate::manager::{DocumentOutcome, IndexOutcome, KnowledgeBase};
use crate::migrate::run_migrations;
use crate::models::{Policy, ReminderEvent};
use crate::monitor::ReminderMonitor;
use crate::policy::PolicyStore;
use crate::router::QueryRouter;
use crate::synth::AnswerSynthesizer;

async fn open_pool(config: &Config) -> Result<SqlitePool> {
    let pool = db::connect(&config.db.path)
        .await
        .with_context(|| format!("Failed to open database: {}", config.db.path.display()))?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn open_knowledge_base(config: &Config) -> Result<Arc<KnowledgeBase>> {
    let pool = open_pool(config).await?;
    Ok(Arc::new(KnowledgeBase::from_config(config, pool).await?))
}

fn query_service(config: &Config, kb: Arc<KnowledgeBase>) -> Result<QueryService> {
    let model: Arc<dyn LanguageModel> = Arc::from(create_model(&config.llm)?);
    Ok(QueryService::new(
        QueryRouter::new(kb, config.retrieval.clone()),
        AnswerSynthesizer::from_config(model, &config.llm),
    ))
}

fn print_outcomes(title: &str, outcomes: &[DocumentOutcome]) {
    let mut indexed = 0;
    let mut unchanged = 0;
    let mut failed = 0;
    println!("{}", title);
    for outcome in outcomes {
        match &outcome.result {
            Ok(IndexOutcome::Indexed { chunks }) => {
                indexed += 1;
                println!("  indexed    {} ({} chunks)", outcome.name, chunks);
            }
            Ok(IndexOutcome::Unchanged { .. }) => unchanged += 1,
            Err(e) => {
                failed += 1;
                println!("  failed     {}: {}", outcome.name, e);
            }
        }
    }
    println!("  indexed: {}", indexed);
    println!("  unchanged: {}", unchanged);
    println!("  failed: {}", failed);
}

fn print_policy(policy: &Policy) {
    let due = policy
        .due_date
        .map(|d| d.format("%d/%m/%Y").to_string())
        .unwrap_or_else(|| "not found".to_string());
    println!("{}", policy.name);
    println!("    due date: {}", due);
    println!("    state: {:?}", policy.state());
    if let Some(checked) = policy.last_checked {
        println!("    last checked: {}", checked.format("%Y-%m-%d %H:%M UTC"));
    }
}

fn print_reminder(event: &ReminderEvent) {
    println!(
        "Payment reminder: {} is due on {} ({} days remaining)",
        event.policy,
        event.due_date.format("%d/%m/%Y"),
        event.days_remaining
    );
}

// ============ Knowledge base ============

pub async fn run_init(config: &Config) -> Result<()> {
    let pool = open_pool(config).await?;
    pool.close().await;
    Ok(())
}

pub async fn run_status(config: &Config) -> Result<()> {
    let kb = open_knowledge_base(config).await?;
    let status = kb.get_status().await?;

    println!("Knowledge Base Status");
    println!("=====================");
    println!();
    println!("  Documents:   {}", status.total_documents);
    println!("  Indexed:     {}", status.indexed_count);
    println!("  Pending:     {}", status.pending_count);
    println!("  Entries:     {}", status.index_entries);
    if !status.indexed.is_empty() {
        println!();
        println!("  Indexed documents:");
        for name in &status.indexed {
            let chunks = kb.document_info(name).map(|r| r.chunk_count).unwrap_or(0);
            println!("    {} ({} chunks)", name, chunks);
        }
    }
    if !status.pending.is_empty() {
        println!();
        println!("  Pending documents:");
        for name in &status.pending {
            println!("    {}", name);
        }
    }
    Ok(())
}

/// Index one document, every document (`all`), or only unindexed ones
/// (`pending`). A `target` that names an existing file outside the
/// document root is copied in first.
pub async fn run_index(
    config: &Config,
    target: Option<String>,
    all: bool,
    pending: bool,
) -> Result<()> {
    let kb = open_knowledge_base(config).await?;

    if all || pending {
        let outcomes = if all {
            kb.index_all().await?
        } else {
            kb.index_pending().await?
        };
        print_outcomes("index", &outcomes);
        return Ok(());
    }

    let Some(target) = target else {
        bail!("Specify a document name, --all, or --pending");
    };
    let path = Path::new(&target);
    let name = if path.is_file() {
        DirectoryDocuments::new(&config.documents)?.import(path)?
    } else {
        target
    };

    let result = kb.index_from_source(&name).await;
    print_outcomes(
        "index",
        &[DocumentOutcome {
            name: name.clone(),
            result,
        }],
    );
    Ok(())
}

pub async fn run_remove(config: &Config, name: &str) -> Result<()> {
    let kb = open_knowledge_base(config).await?;
    if kb.remove_document(name).await? {
        println!("Removed {} from the knowledge base.", name);
    } else {
        println!("{} is not indexed.", name);
    }
    Ok(())
}

pub async fn run_rebuild(config: &Config) -> Result<()> {
    let kb = open_knowledge_base(config).await?;
    let outcomes = kb.rebuild_index().await?;
    print_outcomes("rebuild", &outcomes);
    Ok(())
}

pub async fn run_ask(
    config: &Config,
    question: &str,
    document: Option<&str>,
    json: bool,
) -> Result<()> {
    let kb = open_knowledge_base(config).await?;
    let service = query_service(config, kb)?;
    let response = service.ask(question, document).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    if let Some(error) = &response.error {
        bail!("{}", error);
    }
    println!("{}", response.answer);
    println!();
    println!("  confidence: {:.2}", response.confidence);
    println!("  sources: {}", response.sources.join(", "));
    println!(
        "  documents searched: {} ({})",
        response.documents_searched,
        response.mode.as_str()
    );
    Ok(())
}

// ============ Evaluation ============

pub async fn run_eval(config: &Config, queries_path: &Path, save: bool) -> Result<()> {
    let queries = eval::load_queries(queries_path)
        .with_context(|| format!("Failed to read queries: {}", queries_path.display()))?;
    let kb = open_knowledge_base(config).await?;
    let service = query_service(config, kb)?;
    let report = eval::run_evaluation(&service, &queries).await;

    let summary = &report.summary;
    println!("eval run {}", report.run_id);
    println!(
        "  queries: {} ({} single, {} multi, {} failed)",
        summary.total_queries,
        summary.single_document_queries,
        summary.multi_document_queries,
        summary.failed_queries
    );
    for (name, stats) in &summary.metrics {
        println!(
            "  {:<18} mean {:.3}  median {:.3}  std {:.3}",
            name, stats.mean, stats.median, stats.std
        );
    }
    for result in report.results.iter().filter(|r| r.error.is_some()) {
        println!(
            "  failed: {}: {}",
            result.query.question,
            result.error.as_deref().unwrap_or_default()
        );
    }

    if save {
        let path = eval::save_report(&report, &config.evaluation.results_dir)?;
        println!("  saved: {}", path.display());
    }
    Ok(())
}

pub fn run_eval_history(config: &Config) -> Result<()> {
    let files = eval::evaluation_history(&config.evaluation.results_dir)?;
    if files.is_empty() {
        println!("No saved evaluations.");
        return Ok(());
    }
    for path in files {
        match eval::load_report(&path) {
            Ok(report) => {
                let relevance = report
                    .summary
                    .metrics
                    .get("answer_relevance")
                    .map(|s| format!("{:.3}", s.mean))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {} queries  answer_relevance {}",
                    path.display(),
                    report.summary.total_queries,
                    relevance
                );
            }
            Err(e) => println!("{}  unreadable: {}", path.display(), e),
        }
    }
    Ok(())
}

pub fn run_eval_compare(baseline: &Path, current: &Path) -> Result<()> {
    let before = eval::load_report(baseline)
        .with_context(|| format!("Failed to load report: {}", baseline.display()))?;
    let after = eval::load_report(current)
        .with_context(|| format!("Failed to load report: {}", current.display()))?;

    let fmt = |v: Option<f64>| v.map(|v| format!("{:.3}", v)).unwrap_or_else(|| "-".into());
    println!("{:<18} {:>8} {:>8} {:>8}", "metric", "before", "after", "delta");
    for delta in eval::compare_reports(&before, &after) {
        let change = delta
            .delta
            .map(|d| format!("{:+.3}", d))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<18} {:>8} {:>8} {:>8}",
            delta.metric,
            fmt(delta.baseline),
            fmt(delta.current),
            change
        );
    }
    Ok(())
}

pub fn run_eval_sample() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&eval::sample_queries())?);
    Ok(())
}

// ============ Policies ============

async fn policy_store(config: &Config) -> Result<Arc<PolicyStore>> {
    Ok(Arc::new(PolicyStore::new(open_pool(config).await?)))
}

pub async fn run_policy_upload(config: &Config, file: &Path) -> Result<()> {
    let text = extract::extract_file(file)
        .with_context(|| format!("Failed to read policy: {}", file.display()))?;
    let store = policy_store(config).await?;
    let policy = store.upload(&file.to_string_lossy(), &text).await?;
    print_policy(&policy);
    Ok(())
}

pub async fn run_policy_list(config: &Config) -> Result<()> {
    let policies = policy_store(config).await?.list().await?;
    if policies.is_empty() {
        println!("No policies.");
    }
    for policy in &policies {
        print_policy(policy);
    }
    Ok(())
}

pub async fn run_policy_show(config: &Config, name: &str) -> Result<()> {
    match policy_store(config).await?.get(name).await? {
        Some(policy) => print_policy(&policy),
        None => bail!("Policy not found: {}", name),
    }
    Ok(())
}

pub async fn run_policy_delete(config: &Config, name: &str) -> Result<()> {
    if policy_store(config).await?.delete(name).await? {
        println!("Deleted policy {}.", name);
    } else {
        println!("Policy not found: {}", name);
    }
    Ok(())
}

pub async fn run_policy_check(config: &Config) -> Result<()> {
    let monitor = ReminderMonitor::from_config(policy_store(config).await?, &config.monitor);
    let events = monitor.check_reminders_now().await?;
    if events.is_empty() {
        println!("No reminders due.");
    }
    for event in &events {
        print_reminder(event);
    }
    Ok(())
}

/// Run the reminder loop until Ctrl-C.
pub async fn run_monitor(config: &Config) -> Result<()> {
    let monitor = ReminderMonitor::from_config(policy_store(config).await?, &config.monitor);
    let mut events = monitor.subscribe();
    monitor.start().await;
    println!(
        "Monitoring policies every {}s (lead window {} days). Press Ctrl-C to stop.",
        config.monitor.poll_interval_secs, config.monitor.lead_days
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_reminder(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "reminder output lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    monitor.stop().await;
    println!("Monitor stopped.");
    Ok(())
}
