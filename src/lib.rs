//! Ouroboros -- Self-Evolving Agent Runtime
//!
//! A long-running process that coordinates background jobs, routes
//! work to language models under a monetary budget, diagnoses its own
//! code, and runs closed-loop evolution cycles over its own modules.

pub mod config;
pub mod diagnosis;
pub mod error;
pub mod events;
pub mod evolution;
pub mod journal;
pub mod ledger;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod types;
