//! # Docket
//!
//! A local-first document knowledge base with question answering, plus a
//! due-date reminder monitor for insurance policies.
//!
//! Documents are split into overlapping chunks, embedded, and stored in a
//! SQLite-backed vector index. Questions are answered from one document or
//! from the whole collection, with source attribution and a confidence
//! score. A separate subsystem reads due dates out of policy documents and
//! raises reminders a configurable number of days ahead.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Documents  │──▶│ Chunk + Embed │──▶│ Vector index │
//! │ dir/memory  │   │   (manager)   │   │   (SQLite)   │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             │
//!                  ┌──────────┐   ┌───────────▼─┐
//!   question ────▶ │  Router  │──▶│ Synthesizer │──▶ answer
//!                  └──────────┘   └─────────────┘
//!
//! ┌──────────┐   ┌──────────────┐   ┌───────────────────┐
//! │ Policies │──▶│ Date rules   │──▶│ Reminder monitor  │──▶ events
//! └──────────┘   └──────────────┘   └───────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docket init                          # create database
//! docket index --all                   # index everything under [documents].root
//! docket ask "What is the coverage limit?"
//! docket ask "What is excluded?" --doc mediclaim.pdf
//! docket policy upload ./car-policy.pdf
//! docket monitor                       # poll for reminders until Ctrl-C
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Domain error type |
//! | [`models`] | Core data types |
//! | [`chunk`] | Overlapping text chunking |
//! | [`extract`] | PDF/OOXML/plain-text extraction |
//! | [`documents`] | Document sources |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Language-model provider abstraction |
//! | [`store`] | Vector index trait and backends |
//! | [`catalog`] | Persistent document catalog |
//! | [`manager`] | Indexing pipeline and knowledge-base lifecycle |
//! | [`router`] | Single/multi-document retrieval |
//! | [`synth`] | Answer synthesis and confidence |
//! | [`ask`] | Question-answering API |
//! | [`eval`] | Retrieval quality evaluation |
//! | [`policy`] | Policy records and due-date extraction |
//! | [`monitor`] | Background reminder monitor |
//! | [`commands`] | CLI command implementations |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod ask;
pub mod catalog;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod error;
pub mod eval;
pub mod extract;
pub mod llm;
pub mod manager;
pub mod migrate;
pub mod models;
pub mod monitor;
pub mod policy;
pub mod router;
pub mod store;
pub mod synth;

#[cfg(test)]
pub(crate) mod test_support;
