use std::fmt;

use serde::{Deserialize, Serialize};

/// Exporter availability as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExporterStatus {
    #[default]
    Unspecified,
    Offline,
    Available,
    BeforeLeaseHook,
    LeaseReady,
    AfterLeaseHook,
    BeforeLeaseHookFailed,
    AfterLeaseHookFailed,
}

impl ExporterStatus {
    pub const ALL: [ExporterStatus; 8] = [
        ExporterStatus::Unspecified,
        ExporterStatus::Offline,
        ExporterStatus::Available,
        ExporterStatus::BeforeLeaseHook,
        ExporterStatus::LeaseReady,
        ExporterStatus::AfterLeaseHook,
        ExporterStatus::BeforeLeaseHookFailed,
        ExporterStatus::AfterLeaseHookFailed,
    ];

    pub fn as_i32(self) -> i32 {
        match self {
            ExporterStatus::Unspecified => 0,
            ExporterStatus::Offline => 1,
            ExporterStatus::Available => 2,
            ExporterStatus::BeforeLeaseHook => 3,
            ExporterStatus::LeaseReady => 4,
            ExporterStatus::AfterLeaseHook => 5,
            ExporterStatus::BeforeLeaseHookFailed => 6,
            ExporterStatus::AfterLeaseHookFailed => 7,
        }
    }

    /// Unknown values collapse to `Unspecified`.
    pub fn from_i32(value: i32) -> Self {
        Self::ALL
            .into_iter()
            .find(|status| status.as_i32() == value)
            .unwrap_or(ExporterStatus::Unspecified)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExporterStatus::Unspecified => "UNSPECIFIED",
            ExporterStatus::Offline => "OFFLINE",
            ExporterStatus::Available => "AVAILABLE",
            ExporterStatus::BeforeLeaseHook => "BEFORE_LEASE_HOOK",
            ExporterStatus::LeaseReady => "LEASE_READY",
            ExporterStatus::AfterLeaseHook => "AFTER_LEASE_HOOK",
            ExporterStatus::BeforeLeaseHookFailed => "BEFORE_LEASE_HOOK_FAILED",
            ExporterStatus::AfterLeaseHookFailed => "AFTER_LEASE_HOOK_FAILED",
        }
    }

    pub fn is_hook_failure(self) -> bool {
        matches!(
            self,
            ExporterStatus::BeforeLeaseHookFailed | ExporterStatus::AfterLeaseHookFailed
        )
    }

    /// Driver calls are only accepted here.
    pub fn accepts_driver_calls(self) -> bool {
        self == ExporterStatus::LeaseReady
    }
}

impl fmt::Display for ExporterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Versioned view of the exporter status. `status_version` grows by exactly
/// one per transition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: ExporterStatus,
    pub status_version: u64,
    pub message: String,
    pub previous_status: Option<ExporterStatus>,
}

impl StatusSnapshot {
    pub fn new(status: ExporterStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            status_version: 0,
            message: message.into(),
            previous_status: None,
        }
    }

    /// The snapshot after one transition.
    pub fn advance(&self, status: ExporterStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            status_version: self.status_version + 1,
            message: message.into(),
            previous_status: Some(self.status),
        }
    }
}
