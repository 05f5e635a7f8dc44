//! Test doubles and fixtures for the polyglot crate.
//!
//! - [`InMemoryTaskStore`] - a [`polyglot::TaskStore`] +
//!   [`polyglot::TaskSweeper`] with the Postgres implementation's
//!   observable behavior, backed by a mutex-guarded map
//! - [`MockEngine`] / [`MockEngineFactory`] - echoing engines with
//!   latency and failure injection
//! - [`StaticTokenizers`] / [`WhitespaceTokenizer`] - a trivial tokenizer
//!   contract for text round trips
//! - [`MockProbe`] - scripted device telemetry for the monitor loop
//! - [`fixtures`] - parameter and telemetry builders

pub mod engine;
pub mod fixtures;
pub mod store;

pub use engine::{
    EngineCall, MockEngine, MockEngineFactory, MockProbe, StaticTokenizers, WhitespaceTokenizer,
};
pub use fixtures::{task_params, telemetry};
pub use store::InMemoryTaskStore;
