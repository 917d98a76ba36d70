//! Database access for mta-audit
//!
//! The schema itself is bootstrapped by `mta_common::db`.

pub mod batches;
pub mod organizations;
pub mod rules;
pub mod transactions;

pub use mta_common::db::init_database;
pub use rules::{RuleRepository, SqliteRuleRepository};
