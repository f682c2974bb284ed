//! LLM Watch Pipeline
//!
//! Detection and scoring for traffic between internal clients and LLM
//! providers. Each request/response event is scored against a versioned rule
//! snapshot, folded into a per-source session, checked against alert rules
//! and, when an alert is raised, delivered to its notification channels.
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌────────────┐    ┌──────────────┐
//! │  Event   │───▶│ Evaluator │───▶│  Session   │───▶│ Alert Engine │
//! │  stream  │    │ (rules)   │    │ Aggregator │    │ + Escalation │
//! └──────────┘    └───────────┘    └────────────┘    └──────┬───────┘
//!                                                           ▼
//!                                                   ┌──────────────┐
//!                                                   │  Dispatcher  │
//!                                                   │ chat/webhook │
//!                                                   └──────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::Utc;
//! use llm_watch_pipeline::{Event, MemoryStore, Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> llm_watch_pipeline::Result<()> {
//!     let pipeline = Pipeline::new(PipelineConfig::default(), Arc::new(MemoryStore::new()))?;
//!     pipeline.publish_rules(llm_watch_pipeline::rules::load_definitions("rules.json")?).await;
//!     let out = pipeline
//!         .process(Event::new("10.0.0.5", "openai", "gpt-4", "hello", Utc::now()), Utc::now())
//!         .await?;
//!     println!("score {}", out.assessment.score);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`rules`] - rule validation, compilation and versioned snapshots
//! - [`evaluator`] - per-event scoring
//! - [`session`] - per-source session windows and anomaly heuristics
//! - [`alerting`] - alert generation, suppression, lifecycle and escalation
//! - [`notify`] - notification delivery with retry and rate limiting
//! - [`store`] - persistence traits and the in-memory store
//! - [`pipeline`] - orchestration and source-sharded workers
//! - [`api`] - alert record operations

pub mod alerting;
pub mod api;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod keylock;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod rules;
pub mod session;
pub mod store;

pub use alerting::{AlertEngine, Raised};
pub use api::{AlertApi, Caller, Role};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use models::*;
pub use pipeline::{Pipeline, PipelineHandle, Processed};
pub use rules::{PublishReport, RuleRegistry};
pub use store::{MemoryStore, Store};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
