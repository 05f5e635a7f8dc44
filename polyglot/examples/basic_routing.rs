//! Basic routing example with mock engines.
//!
//! This example demonstrates how to use the instance pool and the
//! translation orchestrator with polyglot-testkit's MockEngineFactory
//! and StaticTokenizers. The mock engine echoes each token prefixed
//! with the target language tag, so the routing decisions are visible
//! in the output text.
//!
//! For the durable task pipeline (store, scheduler, events), see
//! `task_pipeline.rs`.

use std::sync::Arc;
use std::time::Duration;

use polyglot::*;
use polyglot_testkit::{MockEngineFactory, StaticTokenizers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("=== Polyglot Basic Routing Example ===\n");
    println!("This example demonstrates:");
    println!("- Instance pool with weighted scoring and affinity tags");
    println!("- Direct and pivot translation");
    println!("- Concurrent admission under per-instance limits");
    println!("- Failure handling and recovery\n");

    // Create the pool: two accelerators (one interactive, one batch)
    // plus one CPU instance.
    println!("1. Initializing the instance pool...");
    let factory = MockEngineFactory::new().with_translate_delay(Duration::from_millis(30));
    let config = PoolConfig::default()
        .with_cpu_instances(1)
        .with_accelerator_instances(2)
        .with_interactive_share(0.5)
        .with_accelerator_concurrency(2);
    let pool = Arc::new(InstancePool::initialize(config, &factory).await?);

    for snap in pool.snapshot().await {
        println!(
            "   instance {} kind={} device={} affinity={} slots={}",
            snap.id,
            snap.kind,
            snap.device_index,
            snap.affinity,
            snap.concurrency_limit
        );
    }

    let orchestrator = Arc::new(TranslationOrchestrator::new(
        Arc::clone(&pool),
        Arc::new(StaticTokenizers::new()),
        OrchestratorConfig::default(),
    ));

    // Direct pair: both sides have a supported tag.
    println!("\n2. Direct translation (en -> zh)...");
    let out = orchestrator
        .translate_one(
            "the quick brown fox",
            "en",
            "zh",
            WorkloadAffinity::Interactive,
            false,
        )
        .await?;
    println!("   in : the quick brown fox");
    println!("   out: {out}");

    // Pivot pair: Mongolian to Chinese runs two legs through English.
    // The chained prefixes in the output show both legs.
    println!("\n3. Pivot translation (mn -> zh via eng_Latn)...");
    let out = orchestrator
        .translate_one("sain baina uu", "mn", "zh", WorkloadAffinity::Batch, true)
        .await?;
    println!("   in : sain baina uu");
    println!("   out: {out}");

    // A batch is tokenized per text but runs as one engine call.
    println!("\n4. Batch translation (zh -> en)...");
    let texts = vec![
        "ni hao".to_string(),
        "xie xie".to_string(),
        "zai jian".to_string(),
    ];
    let outputs = orchestrator
        .translate_batch(&texts, "zh-CN", "en", WorkloadAffinity::Batch, false)
        .await?;
    for (text, out) in texts.iter().zip(&outputs) {
        println!("   {text} -> {out}");
    }

    // Concurrent load across both workload classes.
    println!("\n5. Running 6 concurrent translations...");
    let mut handles = Vec::new();
    for idx in 0..6 {
        let orchestrator = Arc::clone(&orchestrator);
        let affinity = if idx % 2 == 0 {
            WorkloadAffinity::Interactive
        } else {
            WorkloadAffinity::Batch
        };
        handles.push(tokio::spawn(async move {
            orchestrator
                .translate_one(&format!("text number {idx}"), "en", "zh", affinity, false)
                .await
        }));
    }
    for handle in handles {
        handle.await??;
    }
    println!("   all translations completed");

    println!("\n6. Pool state after the load:");
    for snap in pool.snapshot().await {
        let avg = snap
            .avg_response_secs
            .map(|secs| format!("{:.0}ms", secs * 1000.0))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "   instance {} ({}, {}): tasks={} ok={} avg={} in_flight={}",
            snap.id,
            snap.kind,
            snap.affinity,
            snap.total_tasks,
            snap.successful_tasks,
            avg,
            snap.in_flight
        );
    }

    // Same canonical language on both sides is rejected before any
    // engine work happens.
    println!("\n7. Failure handling...");
    let err = orchestrator
        .translate_one("hello", "en", "eng_Latn", WorkloadAffinity::Interactive, false)
        .await
        .expect_err("same-language pair must not translate");
    println!("   same-language pair rejected: {err}");

    // Engine failures fail the call; the instance slot is returned and
    // the outcome is recorded against the instance's history.
    for (kind, _, engine) in factory.engines() {
        if kind == InstanceKind::Accelerator {
            engine.set_failure(Some("simulated device reset"));
        }
    }
    let err = orchestrator
        .translate_one("hello", "en", "zh", WorkloadAffinity::Interactive, false)
        .await
        .expect_err("accelerators are failing");
    println!("   engine failure surfaced: {err}");
    for (kind, _, engine) in factory.engines() {
        if kind == InstanceKind::Accelerator {
            engine.set_failure(None);
        }
    }
    let out = orchestrator
        .translate_one("hello again", "en", "zh", WorkloadAffinity::Interactive, false)
        .await?;
    println!("   recovered after the fault cleared: {out}");

    println!("\n=== Example Complete ===");
    println!("\nKey takeaways:");
    println!("- Accelerator instances serve translation first; CPU is the fallback");
    println!("- Pivot pairs run as two legs, each admitted separately");
    println!("- Scoring prefers idle, affinity-matched, historically fast instances");
    println!("- Engine failures are recorded and reported, never retried silently");
    println!("- Mock engines and tokenizers come from polyglot-testkit");
    println!("  (see task_pipeline.rs for the durable task side)");

    Ok(())
}
