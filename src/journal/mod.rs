//! Persistent Journal Module
//!
//! Append-only action/transaction/dialogue logs plus keyed system
//! state, backing every other subsystem. The journal IS the runtime's
//! memory.

mod schema;
mod store;

pub use schema::{CREATE_TABLES, REQUIRED_TABLES, SCHEMA_VERSION};
pub use store::Journal;
