//! Scriptable engine, factory, tokenizer, and probe doubles.
//!
//! [`MockEngine`] echoes its input with the target tag prefixed onto each
//! token, so tests can assert exact outputs and count engine calls without
//! a real model. Failure injection and per-call latency are runtime
//! switches shared across clones.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use polyglot::*;

/// One recorded [`TranslationEngine::translate`] call.
#[derive(Clone, Debug)]
pub struct EngineCall {
    pub target_tag: String,
    pub batch_len: usize,
}

/// Engine double that prefixes each token with the target tag.
///
/// `translate(["hello", "world"], "fra_Latn")` yields
/// `["fra_Latn:hello", "fra_Latn:world"]`.
#[derive(Clone)]
pub struct MockEngine {
    label: String,
    delay: Option<Duration>,
    memory: Option<DeviceMemory>,
    fail_message: Arc<Mutex<Option<String>>>,
    calls: Arc<Mutex<Vec<EngineCall>>>,
}

impl MockEngine {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            delay: None,
            memory: None,
            fail_message: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sleep this long inside every `translate` call.
    pub fn with_translate_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Report this device memory from `memory_info`.
    pub fn with_memory(mut self, memory: DeviceMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Make every subsequent `translate` call fail with `message`;
    /// `None` restores success.
    pub fn set_failure(&self, message: Option<&str>) {
        *self.fail_message.lock() = message.map(str::to_string);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl TranslationEngine for MockEngine {
    async fn translate(
        &self,
        batch: Vec<Vec<String>>,
        target_tag: &str,
    ) -> anyhow::Result<Vec<Vec<String>>> {
        self.calls.lock().push(EngineCall {
            target_tag: target_tag.to_string(),
            batch_len: batch.len(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.fail_message.lock().clone() {
            anyhow::bail!("{message}");
        }
        Ok(batch
            .into_iter()
            .map(|tokens| {
                tokens
                    .into_iter()
                    .map(|token| format!("{target_tag}:{token}"))
                    .collect()
            })
            .collect())
    }

    async fn memory_info(&self) -> anyhow::Result<Option<DeviceMemory>> {
        Ok(self.memory)
    }
}

/// Factory producing [`MockEngine`]s, one per created instance.
///
/// Handles are recorded so tests can reach into any instance's engine
/// after pool construction, for failure injection or call assertions.
#[derive(Clone, Default)]
pub struct MockEngineFactory {
    delay: Option<Duration>,
    accelerator_memory: Option<DeviceMemory>,
    unavailable_accelerators: Arc<Mutex<HashSet<u32>>>,
    engines: Arc<Mutex<Vec<(InstanceKind, u32, MockEngine)>>>,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply this translate delay to every engine the factory creates.
    pub fn with_translate_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Report this memory from every accelerator engine.
    pub fn with_accelerator_memory(mut self, memory: DeviceMemory) -> Self {
        self.accelerator_memory = Some(memory);
        self
    }

    /// Refuse to create the accelerator engine for `device_index`,
    /// exercising the pool's CPU substitution path.
    pub fn without_accelerator(self, device_index: u32) -> Self {
        self.unavailable_accelerators.lock().insert(device_index);
        self
    }

    /// Every engine created so far, with its kind and device index.
    pub fn engines(&self) -> Vec<(InstanceKind, u32, MockEngine)> {
        self.engines.lock().clone()
    }

    pub fn created_count(&self) -> usize {
        self.engines.lock().len()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(
        &self,
        kind: InstanceKind,
        device_index: u32,
    ) -> anyhow::Result<Arc<dyn TranslationEngine>> {
        if kind == InstanceKind::Accelerator
            && self.unavailable_accelerators.lock().contains(&device_index)
        {
            anyhow::bail!("accelerator {device_index} is not present");
        }

        let mut engine = MockEngine::new(format!("{kind}-{device_index}"));
        if let Some(delay) = self.delay {
            engine = engine.with_translate_delay(delay);
        }
        if kind == InstanceKind::Accelerator {
            if let Some(memory) = self.accelerator_memory {
                engine = engine.with_memory(memory);
            }
        }
        self.engines
            .lock()
            .push((kind, device_index, engine.clone()));
        Ok(Arc::new(engine))
    }
}

/// Splits on whitespace, joins with single spaces.
#[derive(Clone, Copy, Debug, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<String>> {
        Ok(text.split_whitespace().map(str::to_string).collect())
    }

    fn decode(&self, tokens: &[String]) -> anyhow::Result<String> {
        Ok(tokens.join(" "))
    }
}

/// Registry resolving every language to [`WhitespaceTokenizer`], except
/// the ones tests declare missing.
#[derive(Clone, Default)]
pub struct StaticTokenizers {
    missing: Arc<Mutex<HashSet<String>>>,
}

impl StaticTokenizers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make resolution for `lang` fail.
    pub fn without_language(self, lang: impl Into<String>) -> Self {
        self.missing.lock().insert(lang.into());
        self
    }
}

impl TokenizerRegistry for StaticTokenizers {
    fn for_language(&self, lang: &str) -> anyhow::Result<Arc<dyn Tokenizer>> {
        if self.missing.lock().contains(lang) {
            anyhow::bail!("no tokenizer model for {lang}");
        }
        Ok(Arc::new(WhitespaceTokenizer))
    }
}

/// Probe double over a fixed device list with per-device failure toggles.
#[derive(Clone, Default)]
pub struct MockProbe {
    inner: Arc<Mutex<ProbeState>>,
}

#[derive(Default)]
struct ProbeState {
    devices: Vec<ResourceTelemetry>,
    failing: HashSet<String>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, telemetry: ResourceTelemetry) -> Self {
        self.inner.lock().devices.push(telemetry);
        self
    }

    /// Replace the reading for an existing device, or add a new one.
    pub fn set_telemetry(&self, telemetry: ResourceTelemetry) {
        let mut inner = self.inner.lock();
        match inner
            .devices
            .iter_mut()
            .find(|d| d.resource_id == telemetry.resource_id)
        {
            Some(device) => *device = telemetry,
            None => inner.devices.push(telemetry),
        }
    }

    /// Make `probe` fail for this device until cleared.
    pub fn set_probe_failure(&self, resource_id: &str, failing: bool) {
        let mut inner = self.inner.lock();
        if failing {
            inner.failing.insert(resource_id.to_string());
        } else {
            inner.failing.remove(resource_id);
        }
    }
}

#[async_trait]
impl ResourceProbe for MockProbe {
    fn resource_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .devices
            .iter()
            .map(|d| d.resource_id.clone())
            .collect()
    }

    async fn probe(&self, resource_id: &str) -> anyhow::Result<ResourceTelemetry> {
        let inner = self.inner.lock();
        if inner.failing.contains(resource_id) {
            anyhow::bail!("probe read failed for {resource_id}");
        }
        inner
            .devices
            .iter()
            .find(|d| d.resource_id == resource_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown resource {resource_id}"))
    }
}
