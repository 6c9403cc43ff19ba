//! Mail Triage: tiered keep/delete/archive recommendations for a mailbox.

pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod review;
pub mod source;
pub mod store;
