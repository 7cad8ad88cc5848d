//! The control RPCs an exporter serves next to its driver calls.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::status::StatusSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcCode {
    Cancelled,
    Unknown,
    DeadlineExceeded,
    Unimplemented,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl RpcCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcCode::Cancelled => "CANCELLED",
            RpcCode::Unknown => "UNKNOWN",
            RpcCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            RpcCode::Unimplemented => "UNIMPLEMENTED",
            RpcCode::Internal => "INTERNAL",
            RpcCode::Unavailable => "UNAVAILABLE",
            RpcCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct RpcStatus {
    pub code: RpcCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unimplemented, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unavailable, message)
    }

    /// Older exporters that predate the control RPCs.
    pub fn is_unimplemented(&self) -> bool {
        self.code == RpcCode::Unimplemented
    }

    /// UNAVAILABLE or CANCELLED. The one definition of connectivity loss,
    /// shared by status polling, its verification poll and `EndSession`.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self.code, RpcCode::Unavailable | RpcCode::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndSessionResponse {
    pub success: bool,
    pub message: String,
}

#[async_trait]
pub trait ExporterControl: Send + Sync {
    async fn get_status(&self) -> Result<StatusSnapshot, RpcStatus>;
    async fn end_session(&self) -> Result<EndSessionResponse, RpcStatus>;
}

#[async_trait]
impl<T: ExporterControl + ?Sized> ExporterControl for std::sync::Arc<T> {
    async fn get_status(&self) -> Result<StatusSnapshot, RpcStatus> {
        (**self).get_status().await
    }

    async fn end_session(&self) -> Result<EndSessionResponse, RpcStatus> {
        (**self).end_session().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_loss_codes() {
        let lost: Vec<RpcCode> = [
            RpcCode::Cancelled,
            RpcCode::Unknown,
            RpcCode::DeadlineExceeded,
            RpcCode::Unimplemented,
            RpcCode::Internal,
            RpcCode::Unavailable,
            RpcCode::Unauthenticated,
        ]
        .into_iter()
        .filter(|code| RpcStatus::new(*code, "x").is_connection_loss())
        .collect();
        assert_eq!(lost, vec![RpcCode::Cancelled, RpcCode::Unavailable]);
    }

    #[test]
    fn status_displays_code_and_message() {
        let status = RpcStatus::unavailable("socket closed");
        assert_eq!(status.to_string(), "UNAVAILABLE: socket closed");
        assert!(!status.is_unimplemented());
        assert!(RpcStatus::unimplemented("GetStatus").is_unimplemented());
    }
}
