//! Contracts for the external translation engine and its collaborators.
//!
//! The neural computation itself lives outside this crate. These traits are
//! the seams it plugs into:
//!
//! - [`TranslationEngine`] - one device-bound handle that turns token
//!   sequences into hypothesis tokens
//! - [`EngineFactory`] - creates handles per device at pool startup
//! - [`Tokenizer`] / [`TokenizerRegistry`] - text <-> tokens, keyed by
//!   source language
//! - [`ResourceProbe`] - accelerator telemetry for the monitor loop
//!
//! All engine calls are treated as opaque and potentially long-running;
//! implementations backed by blocking libraries should wrap the work in
//! `tokio::task::spawn_blocking`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::pool::InstanceKind;
use crate::store::ResourceTelemetry;

/// Device memory usage as reported by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceMemory {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl DeviceMemory {
    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }

    /// Fraction of device memory in use, in `[0, 1]`.
    pub fn used_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// A handle to the translation engine, bound to one device.
///
/// Handles are created by an [`EngineFactory`] and owned by pool instances;
/// a permit returned from acquisition exposes the handle of the instance
/// that admitted the call.
#[async_trait]
pub trait TranslationEngine: Send + Sync {
    /// Translate a batch of tokenized inputs into hypothesis tokens for
    /// `target_tag` (a canonical engine tag, see [`crate::lang`]).
    ///
    /// The output must be positionally aligned with the input. Errors are
    /// engine-level (device fault, OOM) and fail the whole batch.
    async fn translate(
        &self,
        batch: Vec<Vec<String>>,
        target_tag: &str,
    ) -> anyhow::Result<Vec<Vec<String>>>;

    /// Memory usage of the device backing this handle.
    ///
    /// CPU-backed handles return `Ok(None)`; scoring then treats the
    /// instance as having no memory pressure.
    async fn memory_info(&self) -> anyhow::Result<Option<DeviceMemory>>;
}

/// Creates engine handles at pool initialization.
///
/// Returning an error for an accelerator device tells the pool the
/// hardware is unavailable; the pool substitutes CPU instances instead of
/// failing startup.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        kind: InstanceKind,
        device_index: u32,
    ) -> anyhow::Result<Arc<dyn TranslationEngine>>;
}

/// Text to token sequence and back, for one source language.
///
/// There is exactly one tokenizer per language; if it cannot be loaded the
/// affected calls fail rather than degrading to a cruder split.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<String>>;
    fn decode(&self, tokens: &[String]) -> anyhow::Result<String>;
}

/// Resolves the tokenizer for a source language.
pub trait TokenizerRegistry: Send + Sync {
    /// An error here is fatal for calls in `lang` only; other languages
    /// are unaffected.
    fn for_language(&self, lang: &str) -> anyhow::Result<Arc<dyn Tokenizer>>;
}

/// Accelerator telemetry source polled by the resource monitor loop.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// Stable identifiers of the devices this probe can see.
    fn resource_ids(&self) -> Vec<String>;

    /// Read current telemetry for one device. A failure marks that
    /// resource stale without stopping the monitor loop.
    async fn probe(&self, resource_id: &str) -> anyhow::Result<ResourceTelemetry>;
}
