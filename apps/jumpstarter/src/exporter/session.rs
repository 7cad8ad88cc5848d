use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::rpc::{EndSessionResponse, ExporterControl, RpcStatus};
use crate::signal::Event;
use crate::status::{ExporterStatus, StatusSnapshot};

pub const NO_LEASE_MESSAGE: &str = "No active lease context";
pub const END_SESSION_MESSAGE: &str =
    "Session end triggered, afterLease hook running asynchronously";

/// Exporter side of the control RPCs. Holds the versioned status that
/// clients poll and stream.
pub struct Session {
    status: watch::Sender<StatusSnapshot>,
    end_session_requested: Mutex<Option<Event>>,
}

impl Session {
    pub fn new() -> Self {
        let (status, _) = watch::channel(StatusSnapshot::new(ExporterStatus::Available, ""));
        Self {
            status,
            end_session_requested: Mutex::new(None),
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Applies one transition. Every call bumps the version by one, even if
    /// the status value repeats.
    pub fn update_status(&self, status: ExporterStatus, message: impl Into<String>) {
        let message = message.into();
        self.status.send_modify(|snapshot| {
            *snapshot = snapshot.advance(status, message);
        });
        let version = self.status.borrow().status_version;
        tracing::debug!(
            target = "jumpstarter::exporter::session",
            status = %status,
            version,
            "status updated"
        );
    }

    /// Live status feed. The receiver sees the current snapshot first, then
    /// the latest one after each change.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    pub fn driver_calls_allowed(&self) -> bool {
        self.status.borrow().status.accepts_driver_calls()
    }

    pub(crate) fn attach_lease(&self, end_session_requested: Event) {
        *self.end_session_requested.lock() = Some(end_session_requested);
    }

    pub fn detach_lease(&self) {
        self.end_session_requested.lock().take();
    }

    /// Asks the lease to wind down and returns without waiting for the
    /// after-lease hook.
    pub fn request_end_session(&self) -> EndSessionResponse {
        let Some(event) = self.end_session_requested.lock().clone() else {
            tracing::warn!(
                target = "jumpstarter::exporter::session",
                "end session requested without an active lease"
            );
            return EndSessionResponse {
                success: false,
                message: NO_LEASE_MESSAGE.to_string(),
            };
        };
        event.set();
        tracing::info!(
            target = "jumpstarter::exporter::session",
            "end session signaled"
        );
        EndSessionResponse {
            success: true,
            message: END_SESSION_MESSAGE.to_string(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExporterControl for Session {
    async fn get_status(&self) -> Result<StatusSnapshot, RpcStatus> {
        Ok(self.status())
    }

    async fn end_session(&self) -> Result<EndSessionResponse, RpcStatus> {
        Ok(self.request_end_session())
    }
}
