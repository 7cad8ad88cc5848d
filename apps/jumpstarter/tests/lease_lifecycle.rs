use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jumpstarter_core::client::{ExporterClient, StatusMonitor, StatusMonitorConfig};
use jumpstarter_core::config::Config;
use jumpstarter_core::exporter::{
    DriverTree, HookConfig, HookInstanceConfig, LeaseContext, LeaseOutcome, LeaseSupervisor,
    Session,
};
use jumpstarter_core::signal::Event;
use jumpstarter_core::ExporterStatus;
use parking_lot::Mutex;

#[derive(Default)]
struct Drivers {
    closed: AtomicUsize,
}

#[async_trait]
impl DriverTree for Drivers {
    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn fast_config() -> Config {
    Config {
        status_poll_interval: Duration::from_millis(50),
        status_slow_poll_interval: Duration::from_millis(250),
        hook_timeout: Duration::from_secs(10),
        ..Config::default()
    }
}

fn lease(dir: &std::path::Path) -> (Arc<LeaseContext>, Arc<Session>) {
    let session = Arc::new(Session::new());
    let ctx = Arc::new(LeaseContext::new("lease-e2e", Event::new()).expect("context"));
    ctx.attach_session(session.clone());
    ctx.set_socket_path(dir.join("exporter.sock"));
    ctx.update_client("client-e2e");
    (ctx, session)
}

#[test_timeout::tokio_timeout_test(30)]
async fn client_follows_a_full_lease() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = fast_config();
    let hooks = HookConfig {
        before_lease: Some(HookInstanceConfig::new("sleep 0.5")),
        after_lease: Some(HookInstanceConfig::new("sleep 0.5")),
    };
    let drivers = Arc::new(Drivers::default());
    let supervisor = LeaseSupervisor::new(config.hook_executor(hooks), drivers.clone());
    let (ctx, session) = lease(dir.path());

    let client = ExporterClient::new(session.clone());
    let monitor = client.status_monitor(config.status_monitor());
    let seen = Arc::new(Mutex::new(Vec::new()));
    monitor.on_status_change({
        let seen = seen.clone();
        move |new, _old| {
            seen.lock().push(new);
            async { Ok::<(), anyhow::Error>(()) }
        }
    });
    monitor.start().await;
    assert!(
        monitor
            .wait_for_status(ExporterStatus::Available, Some(Duration::from_secs(5)))
            .await
    );

    let run = tokio::spawn({
        let ctx = ctx.clone();
        async move { supervisor.run(ctx).await }
    });

    assert!(
        monitor
            .wait_for_status(ExporterStatus::BeforeLeaseHook, Some(Duration::from_secs(5)))
            .await
    );
    assert!(
        monitor
            .wait_for_status(ExporterStatus::LeaseReady, Some(Duration::from_secs(5)))
            .await
    );
    assert_eq!(monitor.status_version(), 2);
    assert_eq!(monitor.missed_transitions(), 0);
    assert!(session.driver_calls_allowed());

    assert!(client.end_session().await.expect("end session"));
    assert!(
        monitor
            .wait_for_status(ExporterStatus::AfterLeaseHook, Some(Duration::from_secs(5)))
            .await
    );
    assert!(
        monitor
            .wait_for_status(ExporterStatus::Available, Some(Duration::from_secs(5)))
            .await
    );
    assert_eq!(monitor.status_version(), 4);
    assert_eq!(monitor.missed_transitions(), 0);
    assert_eq!(monitor.previous_status(), Some(ExporterStatus::AfterLeaseHook));

    ctx.lease_ended().set();
    let outcome = run.await.expect("join").expect("run");
    assert_eq!(outcome, LeaseOutcome::default());
    assert_eq!(drivers.closed.load(Ordering::SeqCst), 1);
    monitor.stop();

    assert_eq!(
        *seen.lock(),
        vec![
            ExporterStatus::Available,
            ExporterStatus::BeforeLeaseHook,
            ExporterStatus::LeaseReady,
            ExporterStatus::AfterLeaseHook,
            ExporterStatus::Available,
        ]
    );

    // The lease is gone, so a second end request is refused.
    assert!(!client.end_session().await.expect("end session"));
}

#[test_timeout::tokio_timeout_test(30)]
async fn waiter_registered_during_lease_sees_return_to_available() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = fast_config();
    let hooks = HookConfig {
        before_lease: None,
        after_lease: Some(HookInstanceConfig::new("sleep 0.3")),
    };
    let supervisor = LeaseSupervisor::new(config.hook_executor(hooks), Arc::new(Drivers::default()));
    let (ctx, session) = lease(dir.path());
    let client = ExporterClient::new(session.clone());
    let monitor = Arc::new(client.status_monitor(config.status_monitor()));
    monitor.start().await;

    let run = tokio::spawn({
        let ctx = ctx.clone();
        async move { supervisor.run(ctx).await }
    });
    ctx.wait_for_drivers().await;
    assert!(
        monitor
            .wait_for_status(ExporterStatus::LeaseReady, Some(Duration::from_secs(5)))
            .await
    );

    let waiter = tokio::spawn({
        let monitor = monitor.clone();
        async move {
            monitor
                .wait_for_status(ExporterStatus::Available, Some(Duration::from_secs(10)))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished());
    assert_eq!(monitor.active_waiters(), 1);

    assert!(client.end_session().await.expect("end session"));
    assert!(waiter.await.expect("join"));
    assert_eq!(monitor.active_waiters(), 0);

    ctx.lease_ended().set();
    let outcome = run.await.expect("join").expect("run");
    assert!(!outcome.after_hook_failed);
    monitor.stop();
}

#[test_timeout::tokio_timeout_test(30)]
async fn failed_before_hook_is_visible_to_the_client() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = fast_config();
    let hooks = HookConfig {
        before_lease: Some(
            HookInstanceConfig::new("exit 4")
                .with_on_failure(jumpstarter_core::exporter::OnFailure::EndLease),
        ),
        after_lease: Some(HookInstanceConfig::new("exit 0")),
    };
    let supervisor = LeaseSupervisor::new(config.hook_executor(hooks), Arc::new(Drivers::default()));
    let (ctx, session) = lease(dir.path());
    let client = ExporterClient::new(session.clone());
    let monitor = client.status_monitor(config.status_monitor());
    monitor.start().await;

    let run = tokio::spawn({
        let ctx = ctx.clone();
        async move { supervisor.run(ctx).await }
    });

    let reached = monitor
        .wait_for_any_of(
            &[ExporterStatus::LeaseReady, ExporterStatus::BeforeLeaseHookFailed],
            Some(Duration::from_secs(5)),
        )
        .await;
    assert_eq!(reached, Some(ExporterStatus::BeforeLeaseHookFailed));
    assert!(monitor.status_message().contains("exit code 4"));
    assert!(!session.driver_calls_allowed());

    let outcome = run.await.expect("join").expect("run");
    assert!(outcome.before_hook_failed);
    assert!(outcome.ended_by_hook);
    assert!(!outcome.shutdown_requested);
    assert!(ctx.lease_ended().is_set());
    assert!(!ctx.after_lease_hook_started().is_set());
    monitor.stop();
}

const NOTICE_BOUND: Duration = Duration::from_millis(300);

fn default_rate() -> StatusMonitorConfig {
    StatusMonitorConfig {
        poll_interval: Duration::from_millis(100),
        slow_poll_interval: Duration::from_secs(1),
    }
}

async fn waiter_for(
    monitor: &Arc<StatusMonitor<Arc<Session>>>,
    target: ExporterStatus,
) -> tokio::task::JoinHandle<bool> {
    let waiter = tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.wait_for_status(target, None).await }
    });
    while monitor.active_waiters() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    waiter
}

#[test_timeout::tokio_timeout_test(30)]
async fn waiter_notices_a_transition_within_three_polls() {
    let session = Arc::new(Session::new());
    let client = ExporterClient::new(session.clone());
    let monitor = Arc::new(client.status_monitor(default_rate()));
    monitor.start().await;
    assert!(
        monitor
            .wait_for_status(ExporterStatus::Available, Some(Duration::from_secs(5)))
            .await
    );

    for target in [
        ExporterStatus::BeforeLeaseHook,
        ExporterStatus::LeaseReady,
        ExporterStatus::AfterLeaseHook,
        ExporterStatus::Available,
    ] {
        let waiter = waiter_for(&monitor, target).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let changed = Instant::now();
        session.update_status(target, "");
        let seen = tokio::time::timeout(NOTICE_BOUND, waiter).await;
        assert!(
            matches!(seen, Ok(Ok(true))),
            "{target} not seen within {NOTICE_BOUND:?} (waited {:?})",
            changed.elapsed()
        );
    }
    assert_eq!(monitor.missed_transitions(), 0);
    monitor.stop();
}

#[test_timeout::tokio_timeout_test(30)]
async fn waiter_cuts_a_slow_ready_poll_short() {
    let session = Arc::new(Session::new());
    session.update_status(ExporterStatus::LeaseReady, "Ready");
    let client = ExporterClient::new(session.clone());
    let monitor = Arc::new(client.status_monitor(default_rate()));
    monitor.start().await;
    assert!(
        monitor
            .wait_for_status(ExporterStatus::LeaseReady, Some(Duration::from_secs(5)))
            .await
    );

    // Idle and ready: the poll loop is now in its one second sleep.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let waiter = waiter_for(&monitor, ExporterStatus::AfterLeaseHook).await;
    let changed = Instant::now();
    session.update_status(ExporterStatus::AfterLeaseHook, "");
    let seen = tokio::time::timeout(NOTICE_BOUND, waiter).await;
    assert!(
        matches!(seen, Ok(Ok(true))),
        "after-lease hook not seen within {NOTICE_BOUND:?} (waited {:?})",
        changed.elapsed()
    );
    monitor.stop();
}
