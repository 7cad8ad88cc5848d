use crate::rpc::{ExporterControl, RpcCode, RpcStatus};
use crate::status::{ExporterStatus, StatusSnapshot};

use super::status_monitor::{StatusMonitor, StatusMonitorConfig};

/// Client view of an exporter's control RPCs, with the soft semantics older
/// exporters and torn-down leases need.
#[derive(Debug, Clone)]
pub struct ExporterClient<C> {
    control: C,
}

impl<C: ExporterControl + Clone + 'static> ExporterClient<C> {
    pub fn new(control: C) -> Self {
        Self { control }
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    /// `None` when the exporter predates `GetStatus`.
    pub async fn get_status_snapshot(&self) -> Result<Option<StatusSnapshot>, RpcStatus> {
        match self.control.get_status().await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(err) if err.is_unimplemented() => {
                tracing::debug!(
                    target = "jumpstarter::client::control",
                    "GetStatus not implemented"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get_status(&self) -> Result<Option<ExporterStatus>, RpcStatus> {
        Ok(self
            .get_status_snapshot()
            .await?
            .map(|snapshot| snapshot.status))
    }

    /// Asks the exporter to end the session and run its after-lease hook.
    ///
    /// `false` when the exporter does not support the call or refused it.
    /// Losing the connection on the way counts as success: the lease is gone
    /// either way.
    pub async fn end_session(&self) -> Result<bool, RpcStatus> {
        match self.control.end_session().await {
            Ok(response) => {
                if !response.success {
                    tracing::debug!(
                        target = "jumpstarter::client::control",
                        message = %response.message,
                        "exporter declined end session"
                    );
                }
                Ok(response.success)
            }
            Err(err) if err.is_unimplemented() => {
                tracing::debug!(
                    target = "jumpstarter::client::control",
                    "EndSession not implemented"
                );
                Ok(false)
            }
            Err(err) if err.is_connection_loss() => {
                tracing::debug!(
                    target = "jumpstarter::client::control",
                    code = %err.code,
                    "connection closed during end session, lease released"
                );
                Ok(true)
            }
            Err(err) if err.code == RpcCode::Unknown && err.message.contains("Stream removed") => {
                tracing::debug!(
                    target = "jumpstarter::client::control",
                    "stream removed during end session, lease released"
                );
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    /// A monitor polling this exporter. Call [`StatusMonitor::start`] on it.
    pub fn status_monitor(&self, config: StatusMonitorConfig) -> StatusMonitor<C> {
        StatusMonitor::new(self.control.clone(), config)
    }
}
