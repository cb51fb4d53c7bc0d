mod common;

use common::{Harness, Providers, ScriptedProvider};
use scenepipe_core::constants::stages;
use scenepipe_core::error::ProviderError;
use scenepipe_core::messaging::PipelineMessage;
use scenepipe_core::models::{Feature, ItemFeature};
use scenepipe_core::providers::ProviderOutcome;
use scenepipe_core::state_machine::{ItemStatus, StepStatus, TaskMode, TaskStatus};
use serde_json::{json, Map};

#[tokio::test]
async fn test_auto_task_runs_every_stage_in_order() {
    let mut harness = Harness::new(Providers::new(3));
    let task = harness.create(TaskMode::Auto, None).await;
    assert_eq!(task.status, TaskStatus::Pending);

    harness.worker.drain().await;

    let task = harness.task(task.id).await;
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.total_units, 3);
    assert_eq!(task.completed_units, 3);
    assert_eq!(task.progress(), 100);

    assert_eq!(harness.transport.executed_stages(), stages::DEFAULT_ORDER.to_vec());

    let steps = harness.orchestrator.list_steps(task.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Succeeded));
    let images = steps.iter().find(|s| s.name == stages::GENERATE_IMAGES).unwrap();
    assert_eq!(
        images.result,
        Some(json!({
            "provider": "mem",
            "succeeded": 3,
            "failed": 0,
            "running": 0,
            "pending": 0,
            "interrupted": 0,
            "total": 3,
        }))
    );
    let finalize = steps.iter().find(|s| s.name == stages::FINALIZE_VIDEO).unwrap();
    assert_eq!(
        finalize.result.as_ref().and_then(|r| r.get("resource_ref")),
        Some(&json!(format!("mem://task:{}:finalize_video", task.id)))
    );

    let items = harness.orchestrator.list_work_items(task.id).await.unwrap();
    assert_eq!(items.iter().map(|i| i.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
    for item in &items {
        for feature in [ItemFeature::Image, ItemFeature::Audio, ItemFeature::Video, ItemFeature::Merge] {
            assert_eq!(item.status(feature), ItemStatus::Succeeded);
        }
    }
}

#[tokio::test]
async fn test_merge_video_receives_clips_in_scene_order() {
    let mut harness = Harness::new(Providers::new(2));
    let task = harness.create(TaskMode::Auto, None).await;
    harness.worker.drain().await;

    let clips = harness
        .providers
        .compose
        .requests()
        .into_iter()
        .find_map(|r| r.extra.get("clips").cloned())
        .expect("merge_video request carries clips");
    let items = harness.orchestrator.list_work_items(task.id).await.unwrap();
    let expected: Vec<_> = items
        .iter()
        .map(|i| json!(format!("mem://{}", i.resource_key(ItemFeature::Merge))))
        .collect();
    assert_eq!(clips, json!(expected));
}

#[tokio::test]
async fn test_imported_scenes_skip_storyboard() {
    let mut harness = Harness::new(Providers::new(5));
    let task = harness
        .create(TaskMode::Auto, Some(common::scenes(2)))
        .await;
    assert_eq!(task.total_units, 2);

    let storyboard = harness.step(task.id, stages::STORYBOARD).await;
    assert_eq!(storyboard.status, StepStatus::Succeeded);
    assert_eq!(storyboard.result.as_ref().and_then(|r| r.get("imported")), Some(&json!(true)));

    harness.worker.drain().await;
    assert_eq!(harness.providers.storyboard.calls(), 0);
    assert_eq!(harness.task(task.id).await.status, TaskStatus::Succeeded);
    assert_eq!(harness.providers.image.calls(), 2);
}

#[tokio::test]
async fn test_partial_success_halts_until_retried() {
    let image = ScriptedProvider::new("mem", Feature::Image)
        .then(Ok(ProviderOutcome::completed("mem://img-1")))
        .then(Ok(ProviderOutcome::failed("content filtered")));
    let mut harness = Harness::new(Providers::new(3).with_image(image));
    let task = harness.create(TaskMode::Auto, None).await;
    harness.worker.drain().await;

    let images = harness.step(task.id, stages::GENERATE_IMAGES).await;
    assert_eq!(images.status, StepStatus::PartialSuccess);
    assert_eq!(images.error_msg.as_deref(), Some("1 of 3 items failed"));
    assert_eq!(
        harness.step(task.id, stages::GENERATE_AUDIO).await.status,
        StepStatus::Pending
    );
    let halted = harness.task(task.id).await;
    assert_eq!(halted.status, TaskStatus::PartialSuccess);

    let items = harness.orchestrator.list_work_items(task.id).await.unwrap();
    let failed = items[1].state(ItemFeature::Image);
    assert_eq!(failed.status, ItemStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.error.as_deref(), Some("content filtered"));

    let retried = harness.orchestrator.retry_step(images.id, false).await.unwrap();
    assert_eq!(retried.status, StepStatus::Pending);
    assert_eq!(retried.retry_count, 1);

    harness.worker.drain().await;

    // Only the failed scene was generated again
    assert_eq!(harness.providers.image.calls(), 4);
    assert_eq!(harness.task(task.id).await.status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn test_all_items_failing_fails_the_task() {
    let image = ScriptedProvider::new("mem", Feature::Image)
        .then(Err(ProviderError::Remote("503".into())))
        .then(Err(ProviderError::Remote("503".into())));
    let mut harness = Harness::new(Providers::new(2).with_image(image));
    let task = harness.create(TaskMode::Auto, None).await;
    harness.worker.drain().await;

    let images = harness.step(task.id, stages::GENERATE_IMAGES).await;
    assert_eq!(images.status, StepStatus::Failed);
    let task = harness.task(task.id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task
        .error_msg
        .as_deref()
        .is_some_and(|m| m.starts_with("all 2 items failed")));
}

#[tokio::test]
async fn test_queued_items_are_polled_on_reentry() {
    let video = ScriptedProvider::new("mem", Feature::Video)
        .then(Ok(ProviderOutcome::queued("job-42")))
        .then_poll(Ok(ProviderOutcome::completed("mem://video-1")));
    let mut harness = Harness::new(Providers::new(2).with_video(video));
    let task = harness.create(TaskMode::Manual, Some(common::scenes(2))).await;

    for stage in [stages::GENERATE_IMAGES, stages::GENERATE_AUDIO] {
        harness.orchestrator.trigger_step(task.id, stage).await.unwrap();
        harness.worker.drain().await;
    }
    harness
        .orchestrator
        .trigger_step(task.id, stages::GENERATE_VIDEOS)
        .await
        .unwrap();
    harness.worker.drain().await;

    let videos = harness.step(task.id, stages::GENERATE_VIDEOS).await;
    assert_eq!(videos.status, StepStatus::Running);
    let items = harness.orchestrator.list_work_items(task.id).await.unwrap();
    let queued = items[0].state(ItemFeature::Video);
    assert_eq!(queued.status, ItemStatus::Running);
    assert_eq!(queued.external_job_id.as_deref(), Some("job-42"));
    assert_eq!(items[1].status(ItemFeature::Video), ItemStatus::Succeeded);

    let result = harness
        .orchestrator
        .executor()
        .execute(task.id, stages::GENERATE_VIDEOS, None)
        .await
        .unwrap();
    assert!(result.executed);
    assert_eq!(result.step.status, StepStatus::Succeeded);
    assert_eq!(harness.providers.video.polls(), 1);
    assert_eq!(harness.providers.video.calls(), 2);

    let items = harness.orchestrator.list_work_items(task.id).await.unwrap();
    assert_eq!(items[0].resource(ItemFeature::Video), Some("mem://video-1"));
}

#[tokio::test]
async fn test_soft_admission_retry_recreates_the_job() {
    let image = ScriptedProvider::new("mem", Feature::Image)
        .then(Err(ProviderError::AdmissionLimited("queue full".into())));
    let mut harness = Harness::new(Providers::new(1).with_image(image));
    let task = harness.create(TaskMode::Manual, Some(common::scenes(1))).await;

    harness
        .orchestrator
        .trigger_step(task.id, stages::GENERATE_IMAGES)
        .await
        .unwrap();
    harness.worker.drain().await;

    assert_eq!(harness.providers.image.calls(), 2);
    let items = harness.orchestrator.list_work_items(task.id).await.unwrap();
    let state = items[0].state(ItemFeature::Image);
    assert_eq!(state.status, ItemStatus::Succeeded);
    assert_eq!(state.retry_count, 0);
}

#[tokio::test]
async fn test_scoped_retry_never_advances() {
    let mut harness = Harness::new(Providers::new(2));
    let task = harness.create(TaskMode::Auto, None).await;
    harness.worker.drain().await;
    harness.transport.clear();

    let items = harness.orchestrator.list_work_items(task.id).await.unwrap();
    harness
        .orchestrator
        .retry_work_item(items[0].id, ItemFeature::Merge, false)
        .await
        .unwrap();
    harness.worker.drain().await;

    let messages = harness.transport.messages();
    assert_eq!(
        messages,
        vec![PipelineMessage::execute_item(
            task.id,
            stages::MERGE_SCENE_MEDIA,
            items[0].id
        )]
    );
    assert_eq!(
        harness.step(task.id, stages::MERGE_SCENE_MEDIA).await.status,
        StepStatus::Succeeded
    );
}

#[tokio::test]
async fn test_video_prompt_enrichment_falls_back_to_image_prompt() {
    let mut meta = Map::new();
    meta.insert("prompt".into(), json!("slow pan across the waves"));
    let prompter = ScriptedProvider::new("mem", Feature::VideoPrompt)
        .then(Ok(ProviderOutcome::Completed {
            resource_ref: "mem://prompt-1".into(),
            meta,
        }))
        .then(Err(ProviderError::Remote("prompt model offline".into())));
    let mut harness = Harness::new(Providers::new(2).with_video_prompt(prompter));
    let task = harness.create(TaskMode::Manual, Some(common::scenes(2))).await;

    for stage in [
        stages::GENERATE_IMAGES,
        stages::GENERATE_AUDIO,
        stages::GENERATE_VIDEOS,
    ] {
        harness.orchestrator.trigger_step(task.id, stage).await.unwrap();
        harness.worker.drain().await;
    }

    let prompts: Vec<_> = harness
        .providers
        .video
        .requests()
        .into_iter()
        .map(|r| r.prompt)
        .collect();
    assert_eq!(
        prompts,
        vec![
            Some("slow pan across the waves".to_string()),
            Some("image prompt 2".to_string()),
        ]
    );

    let items = harness.orchestrator.list_work_items(task.id).await.unwrap();
    let enriched = items[0].state(ItemFeature::Video);
    assert_eq!(enriched.metadata.get("video_prompt"), Some(&json!("slow pan across the waves")));
    let fallback = items[1].state(ItemFeature::Video);
    assert_eq!(fallback.metadata.get("video_prompt_source"), Some(&json!("image_prompt")));
    assert_eq!(fallback.status, ItemStatus::Succeeded);
}
