//! Proxy Inventory - connection-string inventory and connectivity tester
//!
//! Decodes proxy connection strings into records, classifies them into
//! rule-based groups, probes them with a bounded worker pool and serves
//! filtered, sorted views over the result.

pub mod config;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod proxy;
pub mod query;
pub mod rules;
pub mod scheduler;

pub use config::{Settings, TestSettings};
pub use error::{LinkError, ProbeError, SchedulerError};
pub use inventory::{ExportHeader, ImportSummary, Inventory, SharedInventory};
pub use proxy::*;
pub use query::{query, GroupFilter, QueryFilter, SortKey, SortSpec};
pub use rules::{Rule, RuleField, RuleOperator, RuleValue, SmartGroup};
pub use scheduler::{AutoTester, RunSummary, SchedulerEvent, TestProgress, TestScheduler};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
