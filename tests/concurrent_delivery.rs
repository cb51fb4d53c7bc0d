mod common;

use common::{Gate, Harness, Providers, ScriptedProvider};
use scenepipe_core::constants::stages;
use scenepipe_core::models::{Feature, ItemFeature};
use scenepipe_core::state_machine::{ItemStatus, StepStatus, TaskMode};

#[tokio::test]
async fn test_second_delivery_joins_a_running_step() {
    let gate = Gate::default();
    let image = ScriptedProvider::new("mem", Feature::Image).gated(gate.clone());
    let harness = Harness::new(Providers::new(3).with_image(image));
    let task = harness.create(TaskMode::Manual, Some(common::scenes(3))).await;

    let orchestrator = harness.orchestrator.clone();
    let task_id = task.id;
    let first = tokio::spawn(async move {
        orchestrator
            .executor()
            .execute(task_id, stages::GENERATE_IMAGES, None)
            .await
    });
    gate.entered.notified().await;

    // Same message delivered again while scene 1 is still with the provider
    let second = harness
        .orchestrator
        .executor()
        .execute(task.id, stages::GENERATE_IMAGES, None)
        .await
        .unwrap();
    assert!(second.executed);
    assert_eq!(second.step.status, StepStatus::Running);

    let items = harness.orchestrator.list_work_items(task.id).await.unwrap();
    assert_eq!(items[0].status(ItemFeature::Image), ItemStatus::Running);
    assert_eq!(items[1].status(ItemFeature::Image), ItemStatus::Succeeded);
    assert_eq!(items[2].status(ItemFeature::Image), ItemStatus::Succeeded);

    gate.release.notify_one();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.step.status, StepStatus::Succeeded);

    assert_eq!(harness.providers.image.calls(), 3);
    let items = harness.orchestrator.list_work_items(task.id).await.unwrap();
    assert!(items
        .iter()
        .all(|item| item.status(ItemFeature::Image) == ItemStatus::Succeeded));
    assert_eq!(
        harness.step(task.id, stages::GENERATE_IMAGES).await.status,
        StepStatus::Succeeded
    );
}

#[tokio::test]
async fn test_settled_step_ignores_a_late_duplicate() {
    let harness = Harness::new(Providers::new(2));
    let task = harness.create(TaskMode::Manual, Some(common::scenes(2))).await;
    let executor = harness.orchestrator.executor();

    let first = executor
        .execute(task.id, stages::GENERATE_IMAGES, None)
        .await
        .unwrap();
    assert_eq!(first.step.status, StepStatus::Succeeded);

    let duplicate = executor
        .execute(task.id, stages::GENERATE_IMAGES, None)
        .await
        .unwrap();
    assert!(!duplicate.executed);
    assert_eq!(duplicate.step.status, StepStatus::Succeeded);
    assert_eq!(harness.providers.image.calls(), 2);
}

#[tokio::test]
async fn test_scoped_retry_resumes_interrupted_siblings() {
    let gate = Gate::default();
    let image = ScriptedProvider::new("mem", Feature::Image).gated(gate.clone());
    let mut harness = Harness::new(Providers::new(2).with_image(image));
    let task = harness.create(TaskMode::Manual, Some(common::scenes(2))).await;

    let orchestrator = harness.orchestrator.clone();
    let task_id = task.id;
    let running = tokio::spawn(async move {
        orchestrator
            .executor()
            .execute(task_id, stages::GENERATE_IMAGES, None)
            .await
    });
    gate.entered.notified().await;
    let step = harness.step(task.id, stages::GENERATE_IMAGES).await;
    harness.orchestrator.interrupt_step(step.id).await.unwrap();
    gate.release.notify_one();
    running.await.unwrap().unwrap();

    let items = harness.orchestrator.list_work_items(task.id).await.unwrap();
    assert_eq!(items[0].status(ItemFeature::Image), ItemStatus::Interrupted);
    assert_eq!(items[1].status(ItemFeature::Image), ItemStatus::Pending);

    harness
        .orchestrator
        .retry_work_item(items[1].id, ItemFeature::Image, false)
        .await
        .unwrap();
    harness.worker.drain().await;

    let items = harness.orchestrator.list_work_items(task.id).await.unwrap();
    assert_eq!(items[0].status(ItemFeature::Image), ItemStatus::Pending);
    assert_eq!(items[1].status(ItemFeature::Image), ItemStatus::Succeeded);
    assert_eq!(harness.providers.image.calls(), 2);
    let step = harness.step(task.id, stages::GENERATE_IMAGES).await;
    assert_eq!(step.status, StepStatus::Running);

    // The resumed sibling is picked up once the step goes quiet
    harness.store.age_step(step.id, chrono::Duration::minutes(5));
    let report = harness.orchestrator.recover_stalled_tasks().await.unwrap();
    assert_eq!(report.redispatched, 1);
    harness.worker.drain().await;

    assert_eq!(harness.providers.image.calls(), 3);
    assert_eq!(
        harness.step(task.id, stages::GENERATE_IMAGES).await.status,
        StepStatus::Succeeded
    );
}
