use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::LeaseError;
use super::session::Session;
use crate::signal::Event;
use crate::status::ExporterStatus;

#[derive(Default)]
struct LeaseState {
    session: Option<Arc<Session>>,
    socket_path: Option<PathBuf>,
    hook_socket_path: Option<PathBuf>,
    client_name: String,
    current_status: ExporterStatus,
    status_message: String,
}

/// Everything the exporter tracks for one lease.
///
/// The lease supervisor is the only writer. Readers on other tasks only look
/// at the status fields and wait on the signals.
pub struct LeaseContext {
    lease_name: String,
    before_lease_hook: Event,
    end_session_requested: Event,
    after_lease_hook_started: Event,
    after_lease_hook_done: Event,
    lease_ended: Event,
    state: Mutex<LeaseState>,
}

impl LeaseContext {
    pub fn new(lease_name: impl Into<String>, before_lease_hook: Event) -> Result<Self, LeaseError> {
        let lease_name = lease_name.into();
        if lease_name.is_empty() {
            return Err(LeaseError::EmptyLeaseName);
        }
        Ok(Self {
            lease_name,
            before_lease_hook,
            end_session_requested: Event::new(),
            after_lease_hook_started: Event::new(),
            after_lease_hook_done: Event::new(),
            lease_ended: Event::new(),
            state: Mutex::new(LeaseState {
                current_status: ExporterStatus::Available,
                ..LeaseState::default()
            }),
        })
    }

    pub fn lease_name(&self) -> &str {
        &self.lease_name
    }

    /// Attaches the session and tells it where `EndSession` requests go.
    pub fn attach_session(&self, session: Arc<Session>) {
        session.attach_lease(self.end_session_requested.clone());
        self.state.lock().session = Some(session);
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.state.lock().session.clone()
    }

    pub fn set_socket_path(&self, path: impl Into<PathBuf>) {
        self.state.lock().socket_path = Some(path.into());
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        self.state.lock().socket_path.clone()
    }

    pub fn set_hook_socket_path(&self, path: impl Into<PathBuf>) {
        self.state.lock().hook_socket_path = Some(path.into());
    }

    pub fn hook_socket_path(&self) -> Option<PathBuf> {
        self.state.lock().hook_socket_path.clone()
    }

    /// Socket hooks should talk to: the dedicated hook socket if one exists.
    pub fn hook_target_socket(&self) -> Option<PathBuf> {
        let state = self.state.lock();
        state
            .hook_socket_path
            .clone()
            .or_else(|| state.socket_path.clone())
    }

    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.session.is_some()
            && state
                .socket_path
                .as_deref()
                .is_some_and(|path| path != Path::new(""))
    }

    pub fn is_active(&self) -> bool {
        !self.lease_name.is_empty()
    }

    pub fn has_client(&self) -> bool {
        !self.state.lock().client_name.is_empty()
    }

    pub fn client_name(&self) -> String {
        self.state.lock().client_name.clone()
    }

    pub fn update_client(&self, client_name: impl Into<String>) {
        self.state.lock().client_name = client_name.into();
    }

    pub fn clear_client(&self) {
        self.state.lock().client_name.clear();
    }

    pub fn drivers_ready(&self) -> bool {
        self.before_lease_hook.is_set()
    }

    /// Waits until the before-lease phase is over. No timeout of its own.
    pub async fn wait_for_drivers(&self) {
        self.before_lease_hook.wait().await;
    }

    pub fn current_status(&self) -> ExporterStatus {
        self.state.lock().current_status
    }

    pub fn status_message(&self) -> String {
        self.state.lock().status_message.clone()
    }

    /// Records the new status and forwards it to the attached session.
    pub fn update_status(&self, status: ExporterStatus, message: impl Into<String>) {
        let message = message.into();
        let session = {
            let mut state = self.state.lock();
            state.current_status = status;
            state.status_message = message.clone();
            state.session.clone()
        };
        tracing::info!(
            target = "jumpstarter::exporter::lease",
            lease = %self.lease_name,
            status = %status,
            message = %message,
            "lease status changed"
        );
        if let Some(session) = session {
            session.update_status(status, message);
        }
    }

    pub fn before_lease_hook(&self) -> &Event {
        &self.before_lease_hook
    }

    pub fn end_session_requested(&self) -> &Event {
        &self.end_session_requested
    }

    pub fn after_lease_hook_started(&self) -> &Event {
        &self.after_lease_hook_started
    }

    pub fn after_lease_hook_done(&self) -> &Event {
        &self.after_lease_hook_done
    }

    pub fn lease_ended(&self) -> &Event {
        &self.lease_ended
    }
}

impl std::fmt::Debug for LeaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LeaseContext")
            .field("lease_name", &self.lease_name)
            .field("client_name", &state.client_name)
            .field("current_status", &state.current_status)
            .field("has_session", &state.session.is_some())
            .finish()
    }
}
