//! # Structured Logging Module
//!
//! Environment-aware `tracing` setup plus small helpers that emit the same field
//! layout for every step, item and slot event so log pipelines can index them.

use crate::constants::env as env_keys;
use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; only the first call installs a subscriber, and an
/// already-installed global subscriber is left in place.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = std::env::var(env_keys::LOG_FORMAT)
            .map(|f| f.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var(env_keys::ENVIRONMENT)
        .or_else(|_| std::env::var(env_keys::FALLBACK_ENVIRONMENT))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for step operations
pub fn log_step_operation(
    operation: &str,
    task_id: Option<&str>,
    step_id: Option<&str>,
    step_name: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = task_id,
        step_id = step_id,
        step_name = step_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔧 STEP_OPERATION"
    );
}

/// Log structured data for work item operations
pub fn log_item_operation(
    operation: &str,
    task_id: Option<&str>,
    item_seq: Option<i32>,
    feature: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = task_id,
        item_seq = item_seq,
        feature = %feature,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🎬 ITEM_OPERATION"
    );
}

/// Log structured data for slot broker operations
pub fn log_slot_operation(
    operation: &str,
    service: &str,
    feature: Option<&str>,
    slot_id: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        service = %service,
        feature = feature,
        slot_id = slot_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🎟️ SLOT_OPERATION"
    );
}

/// Log structured error information
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_by_environment() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
    }

    #[test]
    fn test_initialization_is_idempotent() {
        init_structured_logging();
        init_structured_logging();
        log_step_operation("execute", Some("t"), Some("s"), Some("storyboard"), "running", None);
        log_item_operation("dispatch", Some("t"), Some(1), "image", "running", None);
        log_slot_operation("acquire", "svc", Some("image"), None, "active", None);
        log_error("test", "noop", "nothing happened", None);
    }
}
