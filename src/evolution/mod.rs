//! Evolution Pipeline Module
//!
//! Closed-loop self-evolution: diagnose, plan, prioritize, execute
//! (including AI-authored tools), test, reflect. Includes the tool
//! forge, the backup-first module modifier, and the on-disk artifacts
//! (plan history, knowledge, checkpoint).

mod artifacts;
mod forge;
mod modify;
mod pipeline;
mod planner;

pub use artifacts::{EvolutionArtifacts, PLAN_HISTORY_CAP};
pub use forge::{
    strip_code_fences, validate_tool_body, validate_tool_name, ToolForge, FORBIDDEN_PATTERNS,
};
pub use modify::{ModificationOutcome, ModuleModifier};
pub use pipeline::{should_evolve, EvolutionPipeline};
pub use planner::{classify_task, slugify, TaskClass};
