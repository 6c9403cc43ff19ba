//! Tiered decision pipeline.
//!
//! Every message flows through:
//! 1. `RuleMatcher::evaluate()`: ordered rules, no I/O
//! 2. `SenderHistory::should_bypass_classifier()`: past human decisions
//! 3. `ExampleSelector` + `ClassificationService::classify()`, then
//!    `ConfidenceCalibrator::calibrate()`
//!
//! The first tier that answers produces the message's single verdict.

pub mod calibration;
pub mod examples;
pub mod history;
pub mod miner;
pub mod processor;
pub mod rules;
pub mod scan;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use processor::DecisionPipeline;
pub use scan::{ScanOptions, Scanner, spawn_scan_loop};
