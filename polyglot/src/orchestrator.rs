//! Translation orchestration over the instance pool.
//!
//! [`TranslationOrchestrator`] turns text in, text out: it canonicalizes
//! language codes, tokenizes, admits the call onto a pool instance, runs
//! the engine, and decodes. Pivot requests chain two legs through the
//! configured pivot language, each leg acquiring its own instance so a
//! long first leg cannot pin capacity for the second.
//!
//! Every acquisition is released on every exit path, with the measured
//! elapsed time and the call outcome, so the pool's scoring history stays
//! honest even when the engine fails.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, Instrument};

use crate::engine::TokenizerRegistry;
use crate::error::{PoolError, TranslateError};
use crate::lang::{canonicalize, PIVOT_LANG};
use crate::pool::{InstanceKind, InstancePermit, InstancePool, WorkloadAffinity};
use crate::telemetry;

/// Orchestrator tuning.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Canonical tag of the pivot language used for indirect pairs.
    pub pivot_language: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pivot_language: PIVOT_LANG.to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_pivot_language(mut self, tag: impl Into<String>) -> Self {
        self.pivot_language = tag.into();
        self
    }
}

/// Routes translation calls onto pool instances.
///
/// All collaborators are constructor-injected; the orchestrator holds no
/// global state and is cheap to share behind an `Arc`.
pub struct TranslationOrchestrator {
    pool: Arc<InstancePool>,
    tokenizers: Arc<dyn TokenizerRegistry>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for TranslationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TranslationOrchestrator {
    pub fn new(
        pool: Arc<InstancePool>,
        tokenizers: Arc<dyn TokenizerRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            tokenizers,
            config,
        }
    }

    /// The pool this orchestrator admits calls through.
    pub fn pool(&self) -> Arc<InstancePool> {
        Arc::clone(&self.pool)
    }

    /// Translate a single text.
    ///
    /// Convenience wrapper over [`translate_batch`](Self::translate_batch)
    /// with a one-element batch.
    pub async fn translate_one(
        &self,
        text: &str,
        source: &str,
        target: &str,
        affinity: WorkloadAffinity,
        via_pivot: bool,
    ) -> Result<String, TranslateError> {
        let texts = vec![text.to_string()];
        let outputs = self
            .translate_batch(&texts, source, target, affinity, via_pivot)
            .await?;
        outputs
            .into_iter()
            .next()
            .ok_or_else(|| TranslateError::Engine(anyhow::anyhow!("engine returned an empty batch")))
    }

    /// Translate a batch of texts from `source` to `target`.
    ///
    /// Codes are canonicalized first; a pair that folds to the same
    /// canonical tag is rejected with [`TranslateError::SameLanguage`].
    /// When `via_pivot` is set and neither side is the pivot language the
    /// batch runs as two sequential legs through the pivot. Results are
    /// all-or-nothing: any engine failure fails the whole batch.
    pub async fn translate_batch(
        &self,
        texts: &[String],
        source: &str,
        target: &str,
        affinity: WorkloadAffinity,
        via_pivot: bool,
    ) -> Result<Vec<String>, TranslateError> {
        let source = canonicalize(source);
        let target = canonicalize(target);
        if source == target {
            return Err(TranslateError::SameLanguage {
                lang: source.to_string(),
            });
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let pivot = self.config.pivot_language.as_str();
        if via_pivot && source != pivot && target != pivot {
            debug!(source, target, pivot, "translating through pivot language");
            let intermediate = self
                .translate_direct(texts, source, pivot, affinity)
                .await?;
            return self
                .translate_direct(&intermediate, pivot, target, affinity)
                .await;
        }

        self.translate_direct(texts, source, target, affinity).await
    }

    /// One direct leg: tokenize, acquire, run the engine, decode.
    async fn translate_direct(
        &self,
        texts: &[String],
        source: &str,
        target: &str,
        affinity: WorkloadAffinity,
    ) -> Result<Vec<String>, TranslateError> {
        let span = telemetry::translate_span(source, target, texts.len());
        async move {
            let tokenizer =
                self.tokenizers
                    .for_language(source)
                    .map_err(|err| TranslateError::Tokenizer {
                        lang: source.to_string(),
                        source: err,
                    })?;

            let mut batch = Vec::with_capacity(texts.len());
            for text in texts {
                let tokens = tokenizer
                    .encode(text)
                    .map_err(|err| TranslateError::Tokenizer {
                        lang: source.to_string(),
                        source: err,
                    })?;
                batch.push(tokens);
            }

            let permit = self.acquire_instance(affinity).await?;
            let kind = permit.kind();
            let engine = permit.engine();

            let started = Instant::now();
            let outcome = engine.translate(batch, target).await;
            let elapsed = started.elapsed();

            match outcome {
                Ok(token_batches) => {
                    self.pool.release(permit, true, elapsed).await;
                    telemetry::record_translation(kind, true, elapsed);

                    if token_batches.len() != texts.len() {
                        return Err(TranslateError::Engine(anyhow::anyhow!(
                            "engine returned {} outputs for {} inputs",
                            token_batches.len(),
                            texts.len()
                        )));
                    }
                    let mut outputs = Vec::with_capacity(token_batches.len());
                    for tokens in &token_batches {
                        let text = tokenizer
                            .decode(tokens)
                            .map_err(|err| TranslateError::Tokenizer {
                                lang: source.to_string(),
                                source: err,
                            })?;
                        outputs.push(text);
                    }
                    Ok(outputs)
                }
                Err(err) => {
                    self.pool.release(permit, false, elapsed).await;
                    telemetry::record_translation(kind, false, elapsed);
                    Err(TranslateError::Engine(err))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Accelerator first; CPU only when no accelerator instance exists.
    ///
    /// An `AcquisitionTimeout` propagates unchanged so saturation stays
    /// visible instead of silently shifting load onto CPU instances.
    async fn acquire_instance(
        &self,
        affinity: WorkloadAffinity,
    ) -> Result<InstancePermit, TranslateError> {
        match self
            .pool
            .acquire(InstanceKind::Accelerator, affinity)
            .await
        {
            Ok(permit) => Ok(permit),
            Err(PoolError::ResourceExhausted { .. }) => {
                debug!("no accelerator instance available, using cpu");
                Ok(self.pool.acquire(InstanceKind::Cpu, affinity).await?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::engine::{DeviceMemory, EngineFactory, Tokenizer, TranslationEngine};
    use crate::pool::PoolConfig;

    struct WordTokenizer;

    impl Tokenizer for WordTokenizer {
        fn encode(&self, text: &str) -> anyhow::Result<Vec<String>> {
            Ok(text.split_whitespace().map(str::to_string).collect())
        }

        fn decode(&self, tokens: &[String]) -> anyhow::Result<String> {
            Ok(tokens.join(" "))
        }
    }

    struct TestTokenizers {
        fail_for: Option<String>,
    }

    impl TokenizerRegistry for TestTokenizers {
        fn for_language(&self, lang: &str) -> anyhow::Result<Arc<dyn Tokenizer>> {
            if self.fail_for.as_deref() == Some(lang) {
                anyhow::bail!("tokenizer files missing for {lang}");
            }
            Ok(Arc::new(WordTokenizer))
        }
    }

    /// Echoes the input tokens and records the target of every call.
    struct RecordingEngine {
        targets: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl TranslationEngine for RecordingEngine {
        async fn translate(
            &self,
            batch: Vec<Vec<String>>,
            target_tag: &str,
        ) -> anyhow::Result<Vec<Vec<String>>> {
            self.targets.lock().unwrap().push(target_tag.to_string());
            if self.fail {
                anyhow::bail!("device fault");
            }
            Ok(batch)
        }

        async fn memory_info(&self) -> anyhow::Result<Option<DeviceMemory>> {
            Ok(None)
        }
    }

    struct RecordingFactory {
        targets: Arc<Mutex<Vec<String>>>,
        fail_engine: bool,
    }

    #[async_trait]
    impl EngineFactory for RecordingFactory {
        async fn create(
            &self,
            _kind: InstanceKind,
            _device_index: u32,
        ) -> anyhow::Result<Arc<dyn TranslationEngine>> {
            Ok(Arc::new(RecordingEngine {
                targets: Arc::clone(&self.targets),
                fail: self.fail_engine,
            }))
        }
    }

    async fn build_orchestrator(
        accelerators: u32,
        fail_engine: bool,
        fail_lang: Option<&str>,
    ) -> (TranslationOrchestrator, Arc<Mutex<Vec<String>>>) {
        let targets = Arc::new(Mutex::new(Vec::new()));
        let factory = RecordingFactory {
            targets: Arc::clone(&targets),
            fail_engine,
        };
        let config = PoolConfig::default()
            .with_cpu_instances(1)
            .with_accelerator_instances(accelerators);
        let pool = Arc::new(InstancePool::initialize(config, &factory).await.unwrap());
        let tokenizers = Arc::new(TestTokenizers {
            fail_for: fail_lang.map(str::to_string),
        });
        let orchestrator =
            TranslationOrchestrator::new(pool, tokenizers, OrchestratorConfig::default());
        (orchestrator, targets)
    }

    #[tokio::test]
    async fn same_language_pair_is_rejected() {
        let (orchestrator, _) = build_orchestrator(0, false, None).await;
        // "en" and "eng_Latn" fold to the same canonical tag
        let err = orchestrator
            .translate_one("hello", "en", "eng_Latn", WorkloadAffinity::Interactive, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::SameLanguage { .. }));
    }

    #[tokio::test]
    async fn direct_pair_runs_one_engine_call() {
        let (orchestrator, targets) = build_orchestrator(1, false, None).await;
        let out = orchestrator
            .translate_one("hello world", "en", "zh", WorkloadAffinity::Interactive, false)
            .await
            .unwrap();
        assert_eq!(out, "hello world");
        assert_eq!(targets.lock().unwrap().as_slice(), ["zho_Hans"]);
    }

    #[tokio::test]
    async fn pivot_pair_runs_two_engine_calls() {
        let (orchestrator, targets) = build_orchestrator(1, false, None).await;
        orchestrator
            .translate_one("sain baina uu", "mn", "zh", WorkloadAffinity::Batch, true)
            .await
            .unwrap();
        assert_eq!(
            targets.lock().unwrap().as_slice(),
            ["eng_Latn", "zho_Hans"]
        );
    }

    #[tokio::test]
    async fn pivot_is_skipped_when_one_side_is_the_pivot() {
        let (orchestrator, targets) = build_orchestrator(1, false, None).await;
        orchestrator
            .translate_one("hello", "en", "zh", WorkloadAffinity::Interactive, true)
            .await
            .unwrap();
        assert_eq!(targets.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_never_reaches_the_engine() {
        let (orchestrator, targets) = build_orchestrator(1, false, None).await;
        let out = orchestrator
            .translate_batch(&[], "en", "zh", WorkloadAffinity::Batch, false)
            .await
            .unwrap();
        assert!(out.is_empty());
        assert!(targets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn engine_failure_fails_the_batch_and_releases_the_slot() {
        let (orchestrator, _) = build_orchestrator(1, true, None).await;
        let texts = vec!["one".to_string(), "two".to_string()];
        let err = orchestrator
            .translate_batch(&texts, "en", "zh", WorkloadAffinity::Batch, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::Engine(_)));

        let snaps = orchestrator.pool().snapshot().await;
        assert!(snaps.iter().all(|snap| snap.in_flight == 0));
        let used = snaps.iter().find(|snap| snap.total_tasks == 1).unwrap();
        assert_eq!(used.successful_tasks, 0);
    }

    #[tokio::test]
    async fn tokenizer_failure_is_scoped_to_its_language() {
        let (orchestrator, _) = build_orchestrator(1, false, Some("khk_Cyrl")).await;

        let err = orchestrator
            .translate_one("sain uu", "mn", "en", WorkloadAffinity::Interactive, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::Tokenizer { ref lang, .. } if lang == "khk_Cyrl"));

        // other languages keep working
        orchestrator
            .translate_one("hello", "en", "zh", WorkloadAffinity::Interactive, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn falls_back_to_cpu_without_accelerators() {
        let (orchestrator, targets) = build_orchestrator(0, false, None).await;
        orchestrator
            .translate_one("hello", "en", "zh", WorkloadAffinity::Interactive, false)
            .await
            .unwrap();
        assert_eq!(targets.lock().unwrap().len(), 1);

        let snaps = orchestrator.pool().snapshot().await;
        assert!(snaps
            .iter()
            .all(|snap| snap.kind == InstanceKind::Cpu));
        assert_eq!(snaps.iter().map(|snap| snap.total_tasks).sum::<u64>(), 1);
    }
}
