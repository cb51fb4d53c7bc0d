//! # Slot Models
//!
//! `SlotLimit` is read-mostly admission configuration for a (service, feature) pair;
//! a `NULL` feature is the service-wide fallback. `Slot` is one leased admission
//! ticket, retained after release for audit.

use crate::state_machine::SlotStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotLimit {
    pub service: String,
    pub feature: Option<String>,
    pub max_slots: i32,
    pub wait_interval_seconds: f64,
    /// `None` waits without bound
    pub wait_timeout_seconds: Option<f64>,
    pub slot_ttl_seconds: f64,
    pub enabled: bool,
}

impl SlotLimit {
    pub fn new(service: impl Into<String>, feature: Option<&str>, max_slots: i32) -> Self {
        Self {
            service: normalize_key(&service.into()),
            feature: feature.map(normalize_key),
            max_slots,
            wait_interval_seconds: 5.0,
            wait_timeout_seconds: Some(60.0),
            slot_ttl_seconds: 600.0,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Uuid,
    pub service: String,
    pub feature: Option<String>,
    pub resource_id: Option<String>,
    pub status: SlotStatus,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

impl Slot {
    /// Active and not past its expiry
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == SlotStatus::Active && self.expires_at.map_or(true, |at| at > now)
    }
}

/// Admission request handed to the store once a limit has been resolved
#[derive(Debug, Clone)]
pub struct SlotRequest {
    pub service: String,
    /// Scope the limit was resolved at; a service-wide limit counts NULL-feature slots
    pub feature: Option<String>,
    pub resource_id: Option<String>,
    pub max_slots: i32,
    pub ttl: std::time::Duration,
    pub metadata: Option<serde_json::Value>,
}

/// Lease handle returned by `SlotBroker::acquire`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotToken {
    pub service: String,
    pub feature: Option<String>,
    pub slot_id: Option<Uuid>,
    pub resource_id: Option<String>,
    pub unlimited: bool,
}

impl SlotToken {
    pub fn unlimited(service: &str, feature: Option<&str>, resource_id: Option<&str>) -> Self {
        Self {
            service: service.to_string(),
            feature: feature.map(str::to_string),
            slot_id: None,
            resource_id: resource_id.map(str::to_string),
            unlimited: true,
        }
    }

    /// Backed by a slot row
    pub fn is_real(&self) -> bool {
        !self.unlimited && self.slot_id.is_some()
    }
}

/// Lowercased, trimmed key for service and feature names
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
