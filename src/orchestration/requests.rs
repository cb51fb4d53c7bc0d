//! Provider request construction and upstream preconditions.

use crate::constants::stages;
use crate::models::{ItemFeature, SceneContent, Task, WorkItem};
use crate::providers::ProviderRequest;
use serde_json::{json, Map, Value};

/// Why an item cannot be dispatched yet. Not counted against its retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition(pub String);

fn config_str(task: &Task, key: &str) -> Option<String> {
    task.config
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn config_u32(task: &Task, key: &str) -> Option<u32> {
    task.config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

/// Feature-specific overrides from `task.config[<feature>]`
fn feature_extra(task: &Task, feature: &str) -> Map<String, Value> {
    task.config
        .get(feature)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

pub(crate) fn storyboard_request(task: &Task) -> Result<ProviderRequest, Precondition> {
    let script = config_str(task, "script").or_else(|| config_str(task, "prompt"));
    let Some(script) = script.filter(|s| !s.trim().is_empty()) else {
        return Err(Precondition(
            "task config has no script to build a storyboard from".into(),
        ));
    };
    let mut request = ProviderRequest {
        text: Some(script),
        extra: feature_extra(task, "storyboard"),
        resource_key: Some(format!("task:{}:storyboard", task.id)),
        ..Default::default()
    };
    if let Some(scene_count) = task.config.get("scene_count").cloned() {
        request.extra.insert("scene_count".into(), scene_count);
    }
    Ok(request)
}

/// Scenes carried in a completed storyboard's meta under `scenes`
pub(crate) fn parse_scenes(meta: &Map<String, Value>) -> Result<Vec<SceneContent>, String> {
    let Some(raw) = meta.get("scenes") else {
        return Err("storyboard result carries no scenes".into());
    };
    let scenes: Vec<SceneContent> = serde_json::from_value(raw.clone())
        .map_err(|e| format!("storyboard scenes are malformed: {e}"))?;
    if scenes.is_empty() {
        return Err("storyboard produced no scenes".into());
    }
    Ok(scenes)
}

pub(crate) fn item_request(
    task: &Task,
    item: &WorkItem,
    feature: ItemFeature,
    video_prompt: Option<&str>,
) -> Result<ProviderRequest, Precondition> {
    let mut request = ProviderRequest {
        resource_key: Some(item.resource_key(feature)),
        extra: feature_extra(task, feature.as_str()),
        ..Default::default()
    };
    request
        .extra
        .insert("task_id".into(), json!(task.id.to_string()));
    request.extra.insert("scene_seq".into(), json!(item.seq));

    match feature {
        ItemFeature::Image => {
            if item.content.image_prompt.trim().is_empty() {
                return Err(Precondition(format!("scene {} has no image prompt", item.seq)));
            }
            request.prompt = Some(item.content.image_prompt.clone());
            request.negative_prompt = config_str(task, "negative_prompt");
            request.width = config_u32(task, "width");
            request.height = config_u32(task, "height");
        }
        ItemFeature::Audio => {
            if item.content.narration.trim().is_empty() {
                return Err(Precondition(format!("scene {} has no narration", item.seq)));
            }
            request.text = Some(item.content.narration.clone());
            request.voice_id = config_str(task, "voice_id");
        }
        ItemFeature::Video => {
            let Some(image) = item.resource(ItemFeature::Image) else {
                return Err(Precondition(format!(
                    "scene {} needs a generated image before video",
                    item.seq
                )));
            };
            request.image_ref = Some(image.to_string());
            request.prompt = Some(
                video_prompt
                    .map(str::to_string)
                    .or_else(|| item.content.video_prompt.clone())
                    .unwrap_or_else(|| item.content.image_prompt.clone()),
            );
            request.duration_seconds = audio_duration(item);
            request.width = config_u32(task, "width");
            request.height = config_u32(task, "height");
        }
        ItemFeature::Merge => {
            let Some(audio) = item.resource(ItemFeature::Audio) else {
                return Err(Precondition(format!(
                    "scene {} needs generated audio before merging",
                    item.seq
                )));
            };
            request.audio_ref = Some(audio.to_string());
            match item.resource(ItemFeature::Video) {
                Some(video) => request.video_ref = Some(video.to_string()),
                None => match item.resource(ItemFeature::Image) {
                    Some(image) => request.image_ref = Some(image.to_string()),
                    None => {
                        return Err(Precondition(format!(
                            "scene {} needs a video or an image before merging",
                            item.seq
                        )))
                    }
                },
            }
            request.duration_seconds = audio_duration(item);
        }
    }
    Ok(request)
}

/// Prompt request for the optional video prompt enrichment
pub(crate) fn video_prompt_request(item: &WorkItem) -> ProviderRequest {
    ProviderRequest {
        prompt: Some(item.content.image_prompt.clone()),
        text: Some(item.content.narration.clone()),
        image_ref: item.resource(ItemFeature::Image).map(str::to_string),
        resource_key: Some(format!(
            "task:{}:item:{}:video_prompt",
            item.task_id, item.seq
        )),
        ..Default::default()
    }
}

fn audio_duration(item: &WorkItem) -> Option<f64> {
    item.states
        .get(&ItemFeature::Audio)
        .and_then(|s| s.metadata.get("duration_seconds"))
        .and_then(Value::as_f64)
}

/// Request for a task-level stage, built from the items' merged clips or the
/// previous stage's output
pub(crate) fn task_level_request(
    task: &Task,
    stage: &str,
    items: &[WorkItem],
    previous_resource: Option<&str>,
) -> Result<ProviderRequest, Precondition> {
    let mut request = ProviderRequest {
        resource_key: Some(format!("task:{}:{stage}", task.id)),
        extra: feature_extra(task, stage),
        ..Default::default()
    };
    request
        .extra
        .insert("task_id".into(), json!(task.id.to_string()));

    if stage == stages::MERGE_VIDEO {
        let clips: Vec<Value> = items
            .iter()
            .filter_map(|item| item.resource(ItemFeature::Merge))
            .map(|clip| json!(clip))
            .collect();
        if clips.is_empty() {
            return Err(Precondition("no merged scenes to join".into()));
        }
        if clips.len() < items.len() {
            return Err(Precondition(format!(
                "only {} of {} scenes are merged",
                clips.len(),
                items.len()
            )));
        }
        request.extra.insert("clips".into(), Value::Array(clips));
    } else {
        let Some(video) = previous_resource else {
            return Err(Precondition(format!("{stage} needs the previous stage's output")));
        };
        request.video_ref = Some(video.to_string());
    }
    Ok(request)
}
