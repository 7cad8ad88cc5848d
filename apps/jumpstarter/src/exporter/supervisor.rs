use std::sync::Arc;

use async_trait::async_trait;

use super::LeaseError;
use super::hooks::{HookError, HookExecutor, HookKind};
use super::lease_context::LeaseContext;
use crate::status::ExporterStatus;

/// The driver instances serving a lease. Torn down when the lease ends.
#[async_trait]
pub trait DriverTree: Send + Sync {
    async fn close(&self);
}

/// How a lease finished, from the exporter's point of view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseOutcome {
    pub before_hook_failed: bool,
    pub after_hook_failed: bool,
    /// A hook with `on_failure = exit` failed.
    pub shutdown_requested: bool,
    /// The before-lease hook failed hard enough to end the lease itself.
    pub ended_by_hook: bool,
}

enum Phase {
    Before,
    After,
}

impl Phase {
    fn running(&self) -> (ExporterStatus, &'static str) {
        match self {
            Phase::Before => (ExporterStatus::BeforeLeaseHook, "Running beforeLease hook"),
            Phase::After => (ExporterStatus::AfterLeaseHook, "Running afterLease hooks"),
        }
    }

    fn done(&self) -> (ExporterStatus, &'static str) {
        match self {
            Phase::Before => (ExporterStatus::LeaseReady, "Ready for commands"),
            Phase::After => (ExporterStatus::Available, "Available for new lease"),
        }
    }

    fn failed(&self) -> ExporterStatus {
        match self {
            Phase::Before => ExporterStatus::BeforeLeaseHookFailed,
            Phase::After => ExporterStatus::AfterLeaseHookFailed,
        }
    }

    fn kind(&self) -> HookKind {
        match self {
            Phase::Before => HookKind::BeforeLease,
            Phase::After => HookKind::AfterLease,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Phase::Before => "beforeLease",
            Phase::After => "afterLease",
        }
    }
}

/// Drives one lease through its hook phases.
pub struct LeaseSupervisor {
    hooks: HookExecutor,
    drivers: Arc<dyn DriverTree>,
}

impl LeaseSupervisor {
    pub fn new(hooks: HookExecutor, drivers: Arc<dyn DriverTree>) -> Self {
        Self { hooks, drivers }
    }

    /// Runs a hook phase and reports the resulting status. Returns the hook
    /// error when the phase failed.
    async fn run_phase(&self, phase: Phase, ctx: &LeaseContext) -> Option<HookError> {
        if !self.hooks.has_hook(phase.kind()) {
            let (status, message) = phase.done();
            ctx.update_status(status, message);
            return None;
        }

        let (status, message) = phase.running();
        ctx.update_status(status, message);

        match self.hooks.execute(phase.kind(), ctx).await {
            Ok(()) => {
                let (status, message) = phase.done();
                ctx.update_status(status, message);
                tracing::info!(
                    target = "jumpstarter::exporter::supervisor",
                    lease = ctx.lease_name(),
                    "{} hook completed successfully",
                    phase.label()
                );
                None
            }
            Err(err) => {
                let message = if err.should_shutdown_exporter() {
                    format!(
                        "{} hook failed (on_failure=exit, shutting down): {err}",
                        phase.label()
                    )
                } else {
                    format!("{} hook failed (on_failure={}): {err}", phase.label(), err.on_failure)
                };
                tracing::error!(
                    target = "jumpstarter::exporter::supervisor",
                    lease = ctx.lease_name(),
                    "{message}"
                );
                ctx.update_status(phase.failed(), message);
                Some(err)
            }
        }
    }

    /// Before-lease phase. The drivers-ready signal is set however it ends.
    pub async fn run_before_lease(&self, ctx: &LeaseContext) -> Result<Option<HookError>, LeaseError> {
        let result = if ctx.is_ready() {
            Ok(self.run_phase(Phase::Before, ctx).await)
        } else {
            Err(LeaseError::NotReady)
        };
        ctx.before_lease_hook().set();
        result
    }

    /// After-lease phase, bracketed by its start and done signals.
    pub async fn run_after_lease(&self, ctx: &LeaseContext) -> Option<HookError> {
        ctx.after_lease_hook_started().set();
        let result = self.run_phase(Phase::After, ctx).await;
        ctx.after_lease_hook_done().set();
        result
    }

    /// Runs the whole lease: before hook, wait for the client to finish or the
    /// lease to end, after hook, then teardown once the lease has ended.
    pub async fn run(&self, ctx: Arc<LeaseContext>) -> Result<LeaseOutcome, LeaseError> {
        let mut outcome = LeaseOutcome::default();

        let before = match self.run_before_lease(&ctx).await {
            Ok(before) => before,
            Err(err) => {
                self.teardown(&ctx).await;
                return Err(err);
            }
        };
        if let Some(err) = before {
            outcome.before_hook_failed = true;
            outcome.shutdown_requested = err.should_shutdown_exporter();
            if err.should_end_lease() {
                tracing::info!(
                    target = "jumpstarter::exporter::supervisor",
                    lease = ctx.lease_name(),
                    on_failure = %err.on_failure,
                    "ending lease after failed beforeLease hook"
                );
                outcome.ended_by_hook = true;
                ctx.lease_ended().set();
            }
        }

        tokio::select! {
            _ = ctx.end_session_requested().wait() => {
                tracing::info!(
                    target = "jumpstarter::exporter::supervisor",
                    lease = ctx.lease_name(),
                    "client ended the session"
                );
            }
            _ = ctx.lease_ended().wait() => {
                tracing::info!(
                    target = "jumpstarter::exporter::supervisor",
                    lease = ctx.lease_name(),
                    "lease ended"
                );
            }
        }

        if !outcome.before_hook_failed {
            if let Some(err) = self.run_after_lease(&ctx).await {
                outcome.after_hook_failed = true;
                outcome.shutdown_requested |= err.should_shutdown_exporter();
            }
        }

        ctx.lease_ended().wait().await;
        self.teardown(&ctx).await;
        Ok(outcome)
    }

    async fn teardown(&self, ctx: &LeaseContext) {
        self.drivers.close().await;
        if let Some(session) = ctx.session() {
            session.detach_lease();
        }
        ctx.clear_client();
        tracing::debug!(
            target = "jumpstarter::exporter::supervisor",
            lease = ctx.lease_name(),
            "lease torn down"
        );
    }
}
