//! Conflict detection and resolution.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- grouping every task's changes by location and grading
//!    each contested location by severity.
//! 2. **Strategies** -- deterministic merge rules for the safe classes.
//! 3. **Resolution** -- asking a language model for the rest, under a
//!    deadline and with a checked answer.

pub mod detector;
pub mod resolver;
pub mod strategies;

pub use detector::ConflictDetector;
pub use resolver::{to_prompt_context, AiResolver, ContextLimits};
pub use strategies::{strategy_for, MergeContext, StrategyId, StrategyRegistry};
