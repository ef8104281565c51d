//! Concurrency & Session Coordination Core: the chat half. Holds the conversation,
//! drives the router/tool-call loop, and supports edit/regenerate/delete/abort, per
//! SPEC_FULL §4.12.

pub mod data_source;
pub mod orchestrator;

pub use data_source::{ChatDataSource, StaticDataSource};
pub use orchestrator::ChatOrchestrator;
