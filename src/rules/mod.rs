//! Routing rules and the store they are loaded from.

pub mod model;
pub mod store;

pub use model::{Account, Rule, RuleRecord, WorkGroup};
pub use store::{JsonRuleStore, MemoryRuleStore, RuleStore};
