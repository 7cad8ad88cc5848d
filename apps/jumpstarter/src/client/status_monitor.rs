//! Background `GetStatus` polling for clients.
//!
//! One poll loop per monitor keeps a cached copy of the exporter status.
//! Callers read the cache without blocking and wait for particular statuses
//! on signals fed by the loop, so the poll rate stays the same however many
//! tasks are waiting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::rpc::ExporterControl;
use crate::signal::Event;
use crate::status::{ExporterStatus, StatusSnapshot};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);
pub const DEFAULT_SLOW_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMonitorConfig {
    pub poll_interval: Duration,
    /// Used only while idle in `LEASE_READY` with nobody waiting.
    pub slow_poll_interval: Duration,
}

impl Default for StatusMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            slow_poll_interval: DEFAULT_SLOW_POLL_INTERVAL,
        }
    }
}

type StatusCallback = Arc<
    dyn Fn(ExporterStatus, Option<ExporterStatus>) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

struct Cache {
    current_status: Option<ExporterStatus>,
    status_message: String,
    status_version: u64,
    previous_status: Option<ExporterStatus>,
    missed_transitions: u64,
    connection_lost: bool,
    status_unsupported: bool,
    polling: bool,
    generation: u64,
    status_events: HashMap<ExporterStatus, Event>,
    any_change: Event,
}

impl Cache {
    fn new() -> Self {
        Self {
            current_status: None,
            status_message: String::new(),
            status_version: 0,
            previous_status: None,
            missed_transitions: 0,
            connection_lost: false,
            status_unsupported: false,
            polling: false,
            generation: 0,
            status_events: HashMap::new(),
            any_change: Event::new(),
        }
    }

    /// Wakes everything waiting on the current "any change" signal. The old
    /// signal is set before it is replaced.
    fn signal_change(&mut self) {
        self.any_change.set();
        self.any_change = Event::new();
    }

    fn matching(&self, targets: &[ExporterStatus]) -> Option<ExporterStatus> {
        self.current_status.filter(|status| targets.contains(status))
    }
}

struct Shared<C> {
    control: C,
    config: StatusMonitorConfig,
    cache: Mutex<Cache>,
    callbacks: Mutex<Vec<StatusCallback>>,
    active_waiters: AtomicUsize,
    demand: Notify,
}

struct WaiterGuard<'a> {
    count: &'a AtomicUsize,
}

impl<'a> WaiterGuard<'a> {
    fn enter(count: &'a AtomicUsize, demand: &Notify) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        demand.notify_one();
        Self { count }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Verification {
    Reached(ExporterStatus),
    Lost,
    Unknown,
}

/// Polls an exporter's status in the background.
///
/// Nothing polls until [`StatusMonitor::start`] is called. Waiting on a
/// monitor that is not polling returns "not reached" right away. Dropping the
/// monitor stops its loop.
pub struct StatusMonitor<C: ExporterControl + 'static> {
    shared: Arc<Shared<C>>,
    task: Mutex<Option<(JoinHandle<()>, Event)>>,
}

impl<C: ExporterControl + 'static> StatusMonitor<C> {
    pub fn new(control: C, config: StatusMonitorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                control,
                config,
                cache: Mutex::new(Cache::new()),
                callbacks: Mutex::new(Vec::new()),
                active_waiters: AtomicUsize::new(0),
                demand: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Last cached status. `None` before the first poll, and for good once
    /// the exporter turned out not to implement `GetStatus`.
    pub fn current_status(&self) -> Option<ExporterStatus> {
        self.shared.cache.lock().current_status
    }

    pub fn status_message(&self) -> String {
        self.shared.cache.lock().status_message.clone()
    }

    pub fn status_version(&self) -> u64 {
        self.shared.cache.lock().status_version
    }

    pub fn previous_status(&self) -> Option<ExporterStatus> {
        self.shared.cache.lock().previous_status
    }

    /// Transitions that happened between two polls and were never observed.
    pub fn missed_transitions(&self) -> u64 {
        self.shared.cache.lock().missed_transitions
    }

    pub fn connection_lost(&self) -> bool {
        self.shared.cache.lock().connection_lost
    }

    pub fn status_unsupported(&self) -> bool {
        self.shared.cache.lock().status_unsupported
    }

    pub fn is_running(&self) -> bool {
        self.shared.cache.lock().polling
    }

    pub fn active_waiters(&self) -> usize {
        self.shared.active_waiters.load(Ordering::SeqCst)
    }

    /// Signal that fires the next time the status changes to `target`.
    pub fn signal_for(&self, target: ExporterStatus) -> Event {
        self.shared
            .cache
            .lock()
            .status_events
            .entry(target)
            .or_default()
            .clone()
    }

    /// Registers `callback(new, old)` to run after every observed change. An
    /// error from the callback is logged and polling goes on.
    pub fn on_status_change<F, Fut>(&self, callback: F)
    where
        F: Fn(ExporterStatus, Option<ExporterStatus>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: StatusCallback =
            Arc::new(move |new, old| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(callback(new, old))
            });
        self.shared.callbacks.lock().push(callback);
    }

    /// Spawns the poll loop on the current runtime and returns once it runs.
    /// Does nothing if the loop is already running.
    pub async fn start(&self) {
        let started = {
            let mut task = self.task.lock();
            if task.is_some() && self.is_running() {
                return;
            }
            let started = Event::new();
            *task = Some(self.spawn_loop(started.clone()));
            started
        };
        started.wait().await;
    }

    /// Asks the poll loop to exit. It does not sit out its current sleep.
    pub fn stop(&self) {
        if let Some((_, stop)) = self.task.lock().take() {
            stop.set();
        }
    }

    /// Waits until the cached status equals `target`. Returns `false` on
    /// timeout, on connection loss, or if the monitor is not polling.
    pub async fn wait_for_status(&self, target: ExporterStatus, timeout: Option<Duration>) -> bool {
        self.wait_for_any_of(&[target], timeout).await.is_some()
    }

    /// Like [`wait_for_status`](Self::wait_for_status) for a set of targets.
    /// Returns the status that was reached.
    pub async fn wait_for_any_of(
        &self,
        targets: &[ExporterStatus],
        timeout: Option<Duration>,
    ) -> Option<ExporterStatus> {
        let wait = self.wait_until(targets);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or(None),
            None => wait.await,
        }
    }

    async fn wait_until(&self, targets: &[ExporterStatus]) -> Option<ExporterStatus> {
        if self.connection_lost() {
            match self.verify_connection(targets).await {
                Verification::Reached(status) => return Some(status),
                Verification::Lost => return None,
                Verification::Unknown => {}
            }
        }

        {
            let mut cache = self.shared.cache.lock();
            if let Some(status) = cache.matching(targets) {
                return Some(status);
            }
            for target in targets {
                cache.status_events.entry(*target).or_default();
            }
        }

        let _waiter = WaiterGuard::enter(&self.shared.active_waiters, &self.shared.demand);
        loop {
            let change = {
                let cache = self.shared.cache.lock();
                if let Some(status) = cache.matching(targets) {
                    return Some(status);
                }
                if cache.connection_lost || !cache.polling {
                    tracing::debug!(
                        target = "jumpstarter::client::status_monitor",
                        connection_lost = cache.connection_lost,
                        "stopped waiting for status"
                    );
                    return None;
                }
                cache.any_change.clone()
            };
            change.wait().await;
        }
    }

    /// One direct poll, made only when the connection is believed lost.
    async fn verify_connection(&self, targets: &[ExporterStatus]) -> Verification {
        tracing::debug!(
            target = "jumpstarter::client::status_monitor",
            "connection marked lost, verifying"
        );
        match self.shared.control.get_status().await {
            Ok(snapshot) => {
                tracing::info!(
                    target = "jumpstarter::client::status_monitor",
                    status = %snapshot.status,
                    "connection recovered during verification poll"
                );
                {
                    let mut cache = self.shared.cache.lock();
                    cache.connection_lost = false;
                    cache.current_status = Some(snapshot.status);
                    cache.status_version = snapshot.status_version;
                }
                self.resume_polling();
                if targets.contains(&snapshot.status) {
                    Verification::Reached(snapshot.status)
                } else {
                    Verification::Unknown
                }
            }
            Err(err) if err.is_connection_loss() => {
                tracing::debug!(
                    target = "jumpstarter::client::status_monitor",
                    code = %err.code,
                    "connection still lost"
                );
                Verification::Lost
            }
            Err(err) => {
                // The channel may still work; let the poll loop find out.
                tracing::debug!(
                    target = "jumpstarter::client::status_monitor",
                    error = %err,
                    "status error during verification"
                );
                self.shared.cache.lock().connection_lost = false;
                self.resume_polling();
                Verification::Unknown
            }
        }
    }

    /// Restarts a loop that exited on its own, unless `stop` was called.
    fn resume_polling(&self) {
        let mut task = self.task.lock();
        if task.is_some() && !self.is_running() {
            *task = Some(self.spawn_loop(Event::new()));
        }
    }

    fn spawn_loop(&self, started: Event) -> (JoinHandle<()>, Event) {
        let generation = {
            let mut cache = self.shared.cache.lock();
            cache.generation += 1;
            cache.polling = true;
            cache.generation
        };
        let stop = Event::new();
        let handle = tokio::spawn(poll_loop(
            self.shared.clone(),
            generation,
            stop.clone(),
            started,
        ));
        (handle, stop)
    }
}

impl<C: ExporterControl + 'static> Drop for StatusMonitor<C> {
    fn drop(&mut self) {
        if let Some((handle, stop)) = self.task.get_mut().take() {
            stop.set();
            handle.abort();
        }
    }
}

impl<C> Shared<C> {
    async fn observe(&self, snapshot: StatusSnapshot) {
        let change = {
            let mut cache = self.cache.lock();
            if cache.connection_lost {
                tracing::info!(
                    target = "jumpstarter::client::status_monitor",
                    "connection recovered"
                );
                cache.connection_lost = false;
            }

            let old_version = cache.status_version;
            let new_version = snapshot.status_version;
            if old_version > 0 && new_version > old_version + 1 {
                let missed = new_version - old_version - 1;
                cache.missed_transitions += missed;
                tracing::warn!(
                    target = "jumpstarter::client::status_monitor",
                    missed,
                    "missed status transitions"
                );
            }

            let old_status = cache.current_status;
            cache.current_status = Some(snapshot.status);
            cache.status_message = snapshot.message;
            cache.status_version = new_version;
            cache.previous_status = snapshot.previous_status;

            if old_status == Some(snapshot.status) {
                None
            } else {
                tracing::info!(
                    target = "jumpstarter::client::status_monitor",
                    from = ?old_status,
                    to = %snapshot.status,
                    version = new_version,
                    "status changed"
                );
                if let Some(event) = cache.status_events.get_mut(&snapshot.status) {
                    event.set();
                    *event = Event::new();
                }
                cache.signal_change();
                Some((snapshot.status, old_status))
            }
        };

        if let Some((new, old)) = change {
            let callbacks = self.callbacks.lock().clone();
            for callback in callbacks {
                if let Err(err) = callback(new, old).await {
                    tracing::error!(
                        target = "jumpstarter::client::status_monitor",
                        error = %err,
                        "status change callback failed"
                    );
                }
            }
        }
    }

    fn next_interval(&self) -> Duration {
        let idle = self.active_waiters.load(Ordering::SeqCst) == 0;
        if idle && self.cache.lock().current_status == Some(ExporterStatus::LeaseReady) {
            self.config.slow_poll_interval
        } else {
            self.config.poll_interval
        }
    }

    fn loop_exited(&self, generation: u64) {
        let mut cache = self.cache.lock();
        if cache.generation == generation {
            cache.polling = false;
            cache.signal_change();
        }
    }
}

async fn poll_loop<C: ExporterControl>(
    shared: Arc<Shared<C>>,
    generation: u64,
    stop: Event,
    started: Event,
) {
    started.set();
    tracing::debug!(
        target = "jumpstarter::client::status_monitor",
        generation,
        "poll loop started"
    );

    'poll: loop {
        let response = tokio::select! {
            biased;
            _ = stop.wait() => break 'poll,
            response = shared.control.get_status() => response,
        };
        match response {
            Ok(snapshot) => shared.observe(snapshot).await,
            Err(err) if err.is_unimplemented() => {
                tracing::debug!(
                    target = "jumpstarter::client::status_monitor",
                    "GetStatus not implemented, stopping monitor"
                );
                let mut cache = shared.cache.lock();
                cache.status_unsupported = true;
                cache.current_status = None;
                break 'poll;
            }
            Err(err) if err.is_connection_loss() => {
                tracing::info!(
                    target = "jumpstarter::client::status_monitor",
                    code = %err.code,
                    "connection lost, signaling waiters"
                );
                shared.cache.lock().connection_lost = true;
                break 'poll;
            }
            Err(err) => {
                tracing::debug!(
                    target = "jumpstarter::client::status_monitor",
                    error = %err,
                    "status poll failed"
                );
            }
        }

        let slept_from = Instant::now();
        let mut deadline = slept_from + shared.next_interval();
        loop {
            tokio::select! {
                biased;
                _ = stop.wait() => break 'poll,
                _ = tokio::time::sleep_until(deadline) => break,
                _ = shared.demand.notified() => {
                    // A new waiter wants fast polling; shorten a slow sleep.
                    deadline = deadline.min(slept_from + shared.next_interval());
                }
            }
        }
    }

    shared.loop_exited(generation);
    tracing::debug!(
        target = "jumpstarter::client::status_monitor",
        generation,
        "poll loop exited"
    );
}
