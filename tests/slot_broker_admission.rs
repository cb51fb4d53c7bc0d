mod common;

use common::{Harness, Providers, ScriptedProvider};
use scenepipe_core::config::SlotBrokerConfig;
use scenepipe_core::constants::stages;
use scenepipe_core::database::{MemoryStore, SlotStore};
use scenepipe_core::error::PipelineError;
use scenepipe_core::models::{Feature, ItemFeature, SlotLimit};
use scenepipe_core::slot_broker::{AcquireOptions, SlotBroker};
use scenepipe_core::state_machine::{ItemStatus, SlotStatus, StepStatus, TaskMode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

async fn broker(limit: SlotLimit) -> (Arc<SlotBroker>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store.upsert_slot_limit(&limit).await.unwrap();
    let broker = Arc::new(SlotBroker::new(store.clone(), SlotBrokerConfig::default()));
    (broker, store)
}

fn limit(max_slots: i32, wait_timeout: Option<f64>) -> SlotLimit {
    let mut limit = SlotLimit::new("runninghub", Some("image"), max_slots);
    limit.wait_interval_seconds = 1.0;
    limit.wait_timeout_seconds = wait_timeout;
    limit
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_holders_never_exceed_the_limit() {
    let (broker, store) = broker(limit(2, Some(60.0))).await;
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for n in 0..6 {
        let broker = broker.clone();
        let active = active.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            let token = broker
                .acquire("runninghub", Some("image"), Some(&format!("r-{n}")), AcquireOptions::default())
                .await
                .unwrap();
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(1500)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            assert!(broker.release(&token, SlotStatus::Released, None).await.unwrap());
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    let slots = store.slots_in_scope("runninghub", Some("image"));
    assert_eq!(slots.len(), 6);
    assert!(slots.iter().all(|s| s.status == SlotStatus::Released));
}

#[tokio::test(start_paused = true)]
async fn test_wait_timeout_bounds_the_wait() {
    let (broker, _store) = broker(limit(1, Some(3.5))).await;
    let _held = broker
        .acquire("runninghub", Some("image"), None, AcquireOptions::default())
        .await
        .unwrap();

    let started = Instant::now();
    let err = broker
        .acquire("runninghub", Some("image"), None, AcquireOptions::default())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(3500) && elapsed < Duration::from_millis(4500));
    match err {
        PipelineError::AdmissionTimeout { service, feature, waited } => {
            assert_eq!(service, "runninghub");
            assert_eq!(feature.as_deref(), Some("image"));
            assert!(waited >= Duration::from_millis(3500));
        }
        other => panic!("expected admission timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let (broker, store) = broker(limit(1, Some(0.0))).await;
    let token = broker
        .acquire("runninghub", Some("image"), None, AcquireOptions::default())
        .await
        .unwrap();

    assert!(broker.release(&token, SlotStatus::Released, None).await.unwrap());
    assert!(!broker.release(&token, SlotStatus::Error, None).await.unwrap());

    let slot = store.get_slot(token.slot_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(slot.status, SlotStatus::Released);
    assert!(slot.released_at.is_some());
}

#[tokio::test]
async fn test_expired_slot_is_reclaimed_on_acquire() {
    let (broker, store) = broker(limit(1, Some(0.0))).await;
    let abandoned = broker
        .acquire("runninghub", Some("image"), None, AcquireOptions::default())
        .await
        .unwrap();
    let abandoned_id = abandoned.slot_id.unwrap();
    assert!(store.age_slot(abandoned_id, chrono::Duration::hours(1)));

    let token = broker
        .acquire("runninghub", Some("image"), None, AcquireOptions::default())
        .await
        .unwrap();
    assert_ne!(token.slot_id, Some(abandoned_id));

    let slot = store.get_slot(abandoned_id).await.unwrap().unwrap();
    assert_eq!(slot.status, SlotStatus::Expired);
    // The crashed holder's late release changes nothing
    assert!(!broker.release(&abandoned, SlotStatus::Released, None).await.unwrap());
}

#[tokio::test]
async fn test_purge_expired_sweeps_every_scope() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_slot_limit(&SlotLimit::new("runninghub", Some("image"), 5))
        .await
        .unwrap();
    store
        .upsert_slot_limit(&SlotLimit::new("elevenlabs", None, 5))
        .await
        .unwrap();
    let broker = SlotBroker::new(store.clone(), SlotBrokerConfig::default());

    let mut tokens = Vec::new();
    for (service, feature) in [("runninghub", Some("image")), ("elevenlabs", Some("audio"))] {
        tokens.push(
            broker
                .acquire(service, feature, None, AcquireOptions::default())
                .await
                .unwrap(),
        );
    }
    let fresh = broker
        .acquire("runninghub", Some("image"), None, AcquireOptions::default())
        .await
        .unwrap();
    for token in &tokens {
        store.age_slot(token.slot_id.unwrap(), chrono::Duration::hours(1));
    }

    assert_eq!(broker.purge_expired(100).await.unwrap(), 2);
    assert_eq!(broker.purge_expired(100).await.unwrap(), 0);
    let fresh_slot = store.get_slot(fresh.slot_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(fresh_slot.status, SlotStatus::Active);
}

#[tokio::test]
async fn test_contended_zero_timeout_admits_exactly_one() {
    let (broker, store) = broker(limit(1, None)).await;
    let options = || AcquireOptions::default().wait_timeout(Duration::ZERO);

    let (a, b) = tokio::join!(
        broker.acquire("runninghub", Some("image"), Some("a"), options()),
        broker.acquire("runninghub", Some("image"), Some("b"), options()),
    );

    let admitted = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 1);
    let rejected = if a.is_ok() { b } else { a };
    assert!(matches!(rejected, Err(PipelineError::AdmissionTimeout { .. })));
    assert_eq!(store.count_live_slots("runninghub", Some("image")).await.unwrap(), 1);
}

#[tokio::test]
async fn test_service_wide_limit_caps_every_feature() {
    let (broker, store) = broker(SlotLimit::new("runninghub", None, 1)).await;
    let options = AcquireOptions::default().wait_timeout(Duration::ZERO);

    let image = broker
        .acquire("runninghub", Some("image"), None, options.clone())
        .await
        .unwrap();
    assert_eq!(image.feature, None);

    let err = broker
        .acquire("runninghub", Some("video"), None, options)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::AdmissionTimeout { .. }));
    assert_eq!(store.slots_in_scope("runninghub", None).len(), 1);
}

#[tokio::test]
async fn test_static_default_applies_without_a_row() {
    let store = Arc::new(MemoryStore::new());
    let mut config = SlotBrokerConfig::default();
    config.wait_timeout_seconds = Some(0.0);
    config
        .defaults
        .insert("runninghub".into(), [("image".to_string(), 1)].into_iter().collect());
    let broker = SlotBroker::new(store.clone(), config);

    let held = broker
        .acquire("RunningHub", Some("Image"), None, AcquireOptions::default())
        .await
        .unwrap();
    assert!(held.is_real());
    let err = broker
        .acquire("runninghub", Some("image"), None, AcquireOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::AdmissionTimeout { .. }));

    // Other features of the service stay unlimited
    let audio = broker
        .acquire("runninghub", Some("audio"), None, AcquireOptions::default())
        .await
        .unwrap();
    assert!(audio.unlimited);
}

#[tokio::test]
async fn test_admission_timeout_fails_the_item() {
    let image = ScriptedProvider::new("mem", Feature::Image).rate_limited("runninghub");
    let mut harness = Harness::new(Providers::new(1).with_image(image));
    harness
        .store
        .upsert_slot_limit(&limit(1, Some(0.0)))
        .await
        .unwrap();
    let task = harness.create(TaskMode::Manual, Some(common::scenes(1))).await;

    let held = harness
        .broker
        .acquire("runninghub", Some("image"), Some("elsewhere"), AcquireOptions::default())
        .await
        .unwrap();

    harness
        .orchestrator
        .trigger_step(task.id, stages::GENERATE_IMAGES)
        .await
        .unwrap();
    harness.worker.drain().await;

    assert_eq!(harness.providers.image.calls(), 0);
    let items = harness.orchestrator.list_work_items(task.id).await.unwrap();
    let state = items[0].state(ItemFeature::Image);
    assert_eq!(state.status, ItemStatus::Failed);
    assert_eq!(state.retry_count, 1);
    assert!(state.error.as_deref().is_some_and(|e| e.contains("runninghub")));
    assert_eq!(
        harness.step(task.id, stages::GENERATE_IMAGES).await.status,
        StepStatus::Failed
    );

    // Capacity freed: a retry goes through the lease and releases it afterwards
    harness
        .broker
        .release(&held, SlotStatus::Released, None)
        .await
        .unwrap();
    let step = harness.step(task.id, stages::GENERATE_IMAGES).await;
    harness.orchestrator.retry_step(step.id, false).await.unwrap();
    harness.worker.drain().await;

    assert_eq!(harness.providers.image.calls(), 1);
    let slots = harness.store.slots_in_scope("runninghub", Some("image"));
    assert_eq!(slots.len(), 2);
    assert!(slots.iter().all(|s| s.status == SlotStatus::Released));
}
