//! Persistence layer: libSQL-backed storage for messages, verdicts,
//! decisions and learned rules.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    CalibrationSample, DecisionCounts, DecisionRecord, DecisionTotals, MessageFilter,
    PriorDecision, TriageStore,
};
