//! Verification harness for an opaque external analysis engine.
//!
//! Cases from a [`catalog::Catalog`] are executed through a bounded
//! [`pool::SessionPool`] by the [`orchestrator::Orchestrator`]; labeled
//! values are recovered by [`extract`], classified by [`compare`], and
//! collected into a [`report::RunReport`].
pub mod catalog;
pub mod cli;
pub mod compare;
pub mod config;
pub mod engine;
pub mod extract;
pub mod orchestrator;
pub mod pool;
pub mod report;
pub mod runner;
pub mod signal;
pub mod util;
