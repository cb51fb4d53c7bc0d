//! # System Constants
//!
//! Stage names, slot broker defaults, and execution tuning values that define the
//! operational boundaries of the pipeline. Configuration can override every timing
//! value here; the constants are the fallbacks used by `Default` impls.

use std::time::Duration;

/// Canonical stage names, in default pipeline order.
pub mod stages {
    pub const STORYBOARD: &str = "storyboard";
    pub const GENERATE_IMAGES: &str = "generate_images";
    pub const GENERATE_AUDIO: &str = "generate_audio";
    pub const GENERATE_VIDEOS: &str = "generate_videos";
    pub const MERGE_SCENE_MEDIA: &str = "merge_scene_media";
    pub const MERGE_VIDEO: &str = "merge_video";
    pub const FINALIZE_VIDEO: &str = "finalize_video";

    /// Default ordered stage list
    pub const DEFAULT_ORDER: [&str; 7] = [
        STORYBOARD,
        GENERATE_IMAGES,
        GENERATE_AUDIO,
        GENERATE_VIDEOS,
        MERGE_SCENE_MEDIA,
        MERGE_VIDEO,
        FINALIZE_VIDEO,
    ];
}

/// Slot broker fallbacks applied when a limit row or default omits a value.
pub mod slot_defaults {
    use super::Duration;

    pub const WAIT_INTERVAL: Duration = Duration::from_secs(5);
    pub const WAIT_TIMEOUT: Duration = Duration::from_secs(60);
    pub const SLOT_TTL: Duration = Duration::from_secs(600);
    pub const LIMIT_CACHE_TTL: Duration = Duration::from_secs(5);
    /// Lower bound for both the polling interval and slot TTL
    pub const MIN_INTERVAL: Duration = Duration::from_secs(1);
    /// Expired slots reclaimed opportunistically per acquire attempt
    pub const OPPORTUNISTIC_PURGE_BATCH: i64 = 50;
    pub const PURGE_BATCH: i64 = 100;
    /// Key used in the defaults map for a service-wide limit
    pub const SERVICE_WIDE_KEY: &str = "__all__";
}

/// Step executor tuning.
pub mod execution {
    use super::Duration;

    pub const STALE_RUNNING_AFTER: Duration = Duration::from_secs(30);
    pub const MAX_ITEM_RETRIES: i32 = 3;
    pub const STEP_MAX_RETRIES: i32 = 3;
    pub const ADMISSION_RETRY_ATTEMPTS: u32 = 2;
    pub const ADMISSION_RETRY_DELAY: Duration = Duration::from_secs(2);
    /// Annotation appended to an item error when an operator interrupt is observed
    pub const INTERRUPTED_MARKER: &str = "[interrupted]";
}

/// Environment variable names recognised by the logging and config layers.
pub mod env {
    pub const ENVIRONMENT: &str = "SCENEPIPE_ENV";
    pub const FALLBACK_ENVIRONMENT: &str = "APP_ENV";
    pub const LOG_FORMAT: &str = "SCENEPIPE_LOG_FORMAT";
    pub const CONFIG_DIR: &str = "SCENEPIPE_CONFIG_DIR";
    pub const CONFIG_PREFIX: &str = "SCENEPIPE";
}
