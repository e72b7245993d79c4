//! Mail sorter: moves incoming mail into folders whose existing messages
//! already come from the same sender.

pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod mailbox;
pub mod rules;
pub mod scheduler;
pub mod task;
