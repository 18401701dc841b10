//! # Docket CLI (`docket`)
//!
//! The `docket` binary drives the knowledge base and the policy reminder
//! monitor.
//!
//! ## Usage
//!
//! ```bash
//! docket --config ./config/docket.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docket init` | Create the SQLite database and run schema migrations |
//! | `docket status` | Show indexed and pending documents |
//! | `docket index <name>` | Index one document (a path outside the root is imported first) |
//! | `docket index --all` | Index every document, skipping unchanged ones |
//! | `docket index --pending` | Index documents that have never been indexed |
//! | `docket remove <name>` | Drop a document from the index |
//! | `docket rebuild` | Clear the index and re-index everything |
//! | `docket ask "<question>"` | Answer from all documents, or one with `--doc` |
//! | `docket eval run <file>` | Score answers against a query set |
//! | `docket eval history` | List saved evaluation reports |
//! | `docket eval compare <a> <b>` | Compare two saved reports |
//! | `docket eval sample` | Print a sample query set |
//! | `docket policy upload <file>` | Record a policy and extract its due date |
//! | `docket policy check` | Run one reminder scan now |
//! | `docket monitor` | Poll for reminders until Ctrl-C |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docket::commands;
use docket::config;

/// Docket: a local-first document knowledge base with question answering
/// and policy due-date reminders.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docket.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docket",
    about = "A local-first document knowledge base with question answering and policy reminders",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docket.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Show knowledge base status.
    Status,

    /// Index documents into the knowledge base.
    ///
    /// With a name, indexes that document from the document root. If the
    /// argument is a path to an existing file, the file is first copied
    /// into the document root.
    Index {
        /// Document name or file path.
        #[arg(conflicts_with_all = ["all", "pending"])]
        target: Option<String>,

        /// Index every document, skipping ones whose content is unchanged.
        #[arg(long, conflicts_with = "pending")]
        all: bool,

        /// Index only documents that have never been indexed.
        #[arg(long)]
        pending: bool,
    },

    /// Remove a document from the index.
    Remove {
        /// Document name.
        name: String,
    },

    /// Clear the index and re-index every document.
    Rebuild,

    /// Ask a question.
    Ask {
        /// The question.
        question: String,

        /// Restrict retrieval to one document.
        #[arg(long = "doc")]
        document: Option<String>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Retrieval quality evaluation.
    Eval {
        #[command(subcommand)]
        action: EvalAction,
    },

    /// Insurance policy records.
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Run the reminder monitor in the foreground until Ctrl-C.
    Monitor,
}

#[derive(Subcommand)]
enum EvalAction {
    /// Run a query set (JSON array) and print aggregate metrics.
    Run {
        /// Path to the query file.
        queries: PathBuf,

        /// Save the report under `[evaluation].results_dir`.
        #[arg(long)]
        save: bool,
    },
    /// List saved reports, newest first.
    History,
    /// Compare the aggregate metrics of two saved reports.
    Compare { baseline: PathBuf, current: PathBuf },
    /// Print a sample query set.
    Sample,
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Upload a policy document and extract its due date.
    Upload { file: PathBuf },
    /// List all policies.
    List,
    /// Show one policy.
    Show { name: String },
    /// Delete a policy.
    Delete { name: String },
    /// Run one reminder scan now.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    match &cli.command {
        Commands::Eval {
            action: EvalAction::Sample,
        } => return commands::run_eval_sample(),
        Commands::Eval {
            action: EvalAction::Compare { baseline, current },
        } => return commands::run_eval_compare(baseline, current),
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            commands::run_init(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Status => {
            commands::run_status(&cfg).await?;
        }
        Commands::Index {
            target,
            all,
            pending,
        } => {
            commands::run_index(&cfg, target, all, pending).await?;
        }
        Commands::Remove { name } => {
            commands::run_remove(&cfg, &name).await?;
        }
        Commands::Rebuild => {
            commands::run_rebuild(&cfg).await?;
        }
        Commands::Ask {
            question,
            document,
            json,
        } => {
            commands::run_ask(&cfg, &question, document.as_deref(), json).await?;
        }
        Commands::Eval { action } => match action {
            EvalAction::Run { queries, save } => {
                commands::run_eval(&cfg, &queries, save).await?;
            }
            EvalAction::History => {
                commands::run_eval_history(&cfg)?;
            }
            EvalAction::Compare { .. } | EvalAction::Sample => {
                // Handled above (before config loading)
                unreachable!()
            }
        },
        Commands::Policy { action } => match action {
            PolicyAction::Upload { file } => {
                commands::run_policy_upload(&cfg, &file).await?;
            }
            PolicyAction::List => {
                commands::run_policy_list(&cfg).await?;
            }
            PolicyAction::Show { name } => {
                commands::run_policy_show(&cfg, &name).await?;
            }
            PolicyAction::Delete { name } => {
                commands::run_policy_delete(&cfg, &name).await?;
            }
            PolicyAction::Check => {
                commands::run_policy_check(&cfg).await?;
            }
        },
        Commands::Monitor => {
            commands::run_monitor(&cfg).await?;
        }
    }

    Ok(())
}
