//! semmerge core library.
//!
//! This crate reconciles concurrent edits that several autonomous tasks made
//! to the same source files: semantic change extraction, conflict detection
//! and grading, deterministic merge strategies, AI-assisted resolution, and
//! the per-file timeline store.

pub mod analyzer;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod errors;
pub mod llm;
pub mod models;
pub mod timeline;

// Re-exports for convenience.
pub use analyzer::{Language, SemanticAnalyzer};
pub use config::MergeConfig;
pub use conflict::{AiResolver, ConflictDetector, StrategyRegistry};
pub use engine::{FileMergeOutcome, FileMergeRequest, MergeEngine, TaskInput};
pub use llm::{HttpLlmClient, LlmClient, LlmRequest};
pub use timeline::{FileTimeline, TimelineStore};
