//! Per-device polling loop.
//!
//! One [`Poller`] runs per device endpoint. Each tick it evaluates every
//! registered (observer, expression) pair and compares the result against that
//! pair's cached value:
//!
//! | previous | current      | `compare` | outcome                  |
//! |----------|--------------|-----------|--------------------------|
//! | none     | any          | any       | cache primed, no event   |
//! | `a`      | `b != a`     | any       | `Update(b)`              |
//! | `a`      | `a`          | `true`    | `Timeout(a)`             |
//! | `a`      | `a`          | `false`   | nothing                  |
//!
//! The tick period is the minimum interval across all registered commands.
//!
//! # Locking
//!
//! The registration map lives behind a single `parking_lot::Mutex`. The lock
//! is taken briefly to snapshot the work list, then again per pair to fetch the
//! expression and, after evaluation, to update the cache. Expressions are
//! awaited with the lock released, so a registration removed mid-tick is simply
//! not found on the next lookup. Sinks are handed events after the lock is
//! released and must not block.
//!
//! # Lifecycle
//!
//! ```text
//! Running ── registrations emptied ──► Stopped(Idle)
//!    │    ── transport unreachable ──► Stopped(Disconnected)
//!    └──── request_stop()        ──► Stopped(Shutdown)
//! ```
//!
//! Stopping is a request: the loop finishes the tick in progress and exits at
//! the top of the next one. A stopped poller refuses new registrations; the
//! registry replaces it with a fresh instance instead.

use crate::event::{Delivery, ObserverId, PollEvent, PollSink};
use crate::expression::PollExpression;
use crate::transport::{DeviceId, Transport};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, info_span, Instrument};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Identity of one registered command within a poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

/// Why a poller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Its last registration was removed.
    Idle,
    /// The transport reported the device unreachable.
    Disconnected,
    /// An explicit stop request.
    Shutdown,
}

/// Running state of a poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerStatus {
    /// The loop is active.
    Running,
    /// The loop has been asked to exit (or already has).
    Stopped(StopReason),
}

/// A request to poll one expression on behalf of one observer.
#[derive(Clone)]
pub struct PollRequest {
    /// Who the events are for. Also the key for `stop_polling`.
    pub observer: ObserverId,
    /// Where events go.
    pub sink: Arc<dyn PollSink>,
    /// What to evaluate.
    pub expression: PollExpression,
    /// Requested period. The poller ticks at the minimum across registrations.
    pub interval: Duration,
    /// Report unchanged values as timeouts.
    pub compare: bool,
}

impl PollRequest {
    /// Request with a 1 s interval and comparison disabled.
    pub fn new(observer: ObserverId, sink: Arc<dyn PollSink>, expression: PollExpression) -> Self {
        Self {
            observer,
            sink,
            expression,
            interval: Duration::from_millis(1000),
            compare: false,
        }
    }

    /// Set the polling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the compare flag.
    pub fn with_compare(mut self, compare: bool) -> Self {
        self.compare = compare;
        self
    }
}

impl fmt::Debug for PollRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollRequest")
            .field("observer", &self.observer)
            .field("expression", &self.expression)
            .field("interval", &self.interval)
            .field("compare", &self.compare)
            .finish_non_exhaustive()
    }
}

struct PollCommand {
    id: CommandId,
    expression: PollExpression,
    interval: Duration,
    compare: bool,
    last: Option<Value>,
}

struct Registration {
    sink: Arc<dyn PollSink>,
    commands: Vec<PollCommand>,
}

struct PollerState {
    registrations: BTreeMap<ObserverId, Registration>,
    next_command: u64,
    ticks: u64,
}

pub(crate) type DetachFn = Box<dyn Fn(&DeviceId, u64) + Send + Sync>;

struct PollerShared {
    instance: u64,
    device: DeviceId,
    transport: Arc<dyn Transport>,
    state: Mutex<PollerState>,
    status: watch::Sender<PollerStatus>,
    wake: Notify,
    detach: DetachFn,
}

/// Background loop polling one device.
///
/// Cheap to clone; clones refer to the same loop.
#[derive(Clone)]
pub struct Poller {
    shared: Arc<PollerShared>,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("device", &self.shared.device)
            .field("instance", &self.shared.instance)
            .field("status", &self.status())
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl Poller {
    pub(crate) fn new(device: DeviceId, transport: Arc<dyn Transport>, detach: DetachFn) -> Self {
        let (status, _) = watch::channel(PollerStatus::Running);
        Self {
            shared: Arc::new(PollerShared {
                instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
                device,
                transport,
                state: Mutex::new(PollerState {
                    registrations: BTreeMap::new(),
                    next_command: 1,
                    ticks: 0,
                }),
                status,
                wake: Notify::new(),
                detach,
            }),
        }
    }

    pub(crate) fn start(&self, runtime: &Handle) {
        runtime.spawn(self.clone().run());
    }

    /// Device this poller serves.
    pub fn device(&self) -> &DeviceId {
        &self.shared.device
    }

    /// Process-unique instance number. A replacement poller for the same
    /// device always has a different one.
    pub fn instance(&self) -> u64 {
        self.shared.instance
    }

    /// Current status.
    pub fn status(&self) -> PollerStatus {
        *self.shared.status.borrow()
    }

    /// Whether the loop is still running.
    pub fn is_running(&self) -> bool {
        self.status() == PollerStatus::Running
    }

    /// Effective tick period, `None` when nothing is registered.
    pub fn interval(&self) -> Option<Duration> {
        Self::min_interval(&self.shared.state.lock())
    }

    fn min_interval(state: &PollerState) -> Option<Duration> {
        state
            .registrations
            .values()
            .flat_map(|r| r.commands.iter().map(|c| c.interval))
            .min()
    }

    /// Number of distinct observers registered.
    pub fn observer_count(&self) -> usize {
        self.shared.state.lock().registrations.len()
    }

    /// Number of registered commands across all observers.
    pub fn command_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .registrations
            .values()
            .map(|r| r.commands.len())
            .sum()
    }

    /// Whether `observer` has at least one command registered.
    pub fn has_observer(&self, observer: ObserverId) -> bool {
        self.shared.state.lock().registrations.contains_key(&observer)
    }

    /// Number of ticks started so far.
    pub fn ticks(&self) -> u64 {
        self.shared.state.lock().ticks
    }

    /// Wait until the poller has stopped and return why.
    pub async fn stopped(&self) -> StopReason {
        let mut rx = self.shared.status.subscribe();
        loop {
            if let PollerStatus::Stopped(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return StopReason::Shutdown;
            }
        }
    }

    /// Add a command. Hands the request back if this poller has stopped.
    pub(crate) fn add_command(&self, request: PollRequest) -> Result<CommandId, PollRequest> {
        let mut state = self.shared.state.lock();
        if !self.is_running() {
            return Err(request);
        }

        let previous = Self::min_interval(&state);
        let id = CommandId(state.next_command);
        state.next_command += 1;

        debug!(
            device = %self.shared.device,
            observer = %request.observer,
            expression = %request.expression.label(),
            interval_ms = request.interval.as_millis(),
            compare = request.compare,
            "Registered poll command"
        );

        let command = PollCommand {
            id,
            expression: request.expression,
            interval: request.interval,
            compare: request.compare,
            last: None,
        };
        state
            .registrations
            .entry(request.observer)
            .or_insert_with(|| Registration {
                sink: request.sink,
                commands: Vec::new(),
            })
            .commands
            .push(command);
        drop(state);

        if previous.map_or(true, |p| request.interval < p) {
            self.shared.wake.notify_one();
        }
        Ok(id)
    }

    /// Remove every command of `observer`. Stops the poller if it was the last.
    pub(crate) fn remove_observer(&self, observer: ObserverId) -> bool {
        let mut state = self.shared.state.lock();
        let removed = state.registrations.remove(&observer).is_some();
        let emptied = removed && state.registrations.is_empty();
        if emptied {
            self.set_stopped(StopReason::Idle);
        }
        drop(state);

        if removed {
            debug!(device = %self.shared.device, observer = %observer, "Removed poll observer");
        }
        if emptied {
            self.finish_stop();
        }
        removed
    }

    /// Remove a single command. Stops the poller if nothing remains.
    pub(crate) fn remove_command(&self, observer: ObserverId, command: CommandId) -> bool {
        let mut state = self.shared.state.lock();
        let Some(registration) = state.registrations.get_mut(&observer) else {
            return false;
        };
        let before = registration.commands.len();
        registration.commands.retain(|c| c.id != command);
        let removed = registration.commands.len() != before;
        if registration.commands.is_empty() {
            state.registrations.remove(&observer);
        }
        let emptied = removed && state.registrations.is_empty();
        if emptied {
            self.set_stopped(StopReason::Idle);
        }
        drop(state);

        if emptied {
            self.finish_stop();
        }
        removed
    }

    /// Ask the loop to exit at the top of its next tick.
    pub fn request_stop(&self) {
        let changed = {
            let _state = self.shared.state.lock();
            self.set_stopped(StopReason::Shutdown)
        };
        if changed {
            self.finish_stop();
        }
    }

    /// Transition to `Stopped`. Callers hold the state lock so that
    /// `add_command` never races a stop.
    fn set_stopped(&self, reason: StopReason) -> bool {
        self.shared.status.send_if_modified(|status| {
            if *status == PollerStatus::Running {
                *status = PollerStatus::Stopped(reason);
                true
            } else {
                false
            }
        })
    }

    fn finish_stop(&self) {
        (self.shared.detach)(&self.shared.device, self.shared.instance);
        self.shared.wake.notify_one();
    }

    async fn run(self) {
        let span = info_span!("poller", device = %self.shared.device, instance = self.shared.instance);
        async move {
            info!("Poller started");
            loop {
                if !self.is_running() {
                    break;
                }

                if !self.shared.transport.is_connected().await {
                    error!("Device is not reachable, stopping poller");
                    let changed = {
                        let _state = self.shared.state.lock();
                        self.set_stopped(StopReason::Disconnected)
                    };
                    if changed {
                        self.finish_stop();
                    }
                    break;
                }

                let tick_started = Instant::now();
                self.tick().await;
                self.wait_next_tick(tick_started).await;
            }
            info!(status = ?self.status(), "Poller stopped");
        }
        .instrument(span)
        .await;
    }

    /// Sleep until `tick_started + interval`, re-reading the interval whenever
    /// a registration change wakes the loop.
    async fn wait_next_tick(&self, tick_started: Instant) {
        loop {
            if !self.is_running() {
                return;
            }
            let Some(interval) = self.interval() else {
                return;
            };
            tokio::select! {
                () = sleep_until(tick_started + interval) => return,
                () = self.shared.wake.notified() => {}
            }
        }
    }

    async fn tick(&self) {
        let work: Vec<(ObserverId, CommandId)> = {
            let mut state = self.shared.state.lock();
            state.ticks += 1;
            state
                .registrations
                .iter()
                .flat_map(|(observer, r)| r.commands.iter().map(move |c| (*observer, c.id)))
                .collect()
        };

        let mut gone: Vec<ObserverId> = Vec::new();
        for &(observer, command) in &work {
            if gone.contains(&observer) {
                continue;
            }
            let Some((expression, sink)) = self.lookup(observer, command) else {
                continue;
            };
            if !sink.is_alive() {
                gone.push(observer);
                continue;
            }

            match expression.evaluate(&self.shared.transport).await {
                Ok(value) => {
                    if let Some(event) = self.record(observer, command, &expression, value) {
                        if sink.deliver(event) == Delivery::Dropped {
                            gone.push(observer);
                        }
                    }
                }
                Err(err) if err.is_recoverable() => {
                    debug!(
                        observer = %observer,
                        expression = %expression.label(),
                        "Transient poll failure: {err}"
                    );
                }
                Err(err) => {
                    error!(
                        observer = %observer,
                        expression = %expression.label(),
                        kind = err.kind(),
                        "Poll expression failed: {err}"
                    );
                }
            }
        }

        // Only the commands seen this tick are pruned; a command the same
        // observer re-registered meanwhile stays.
        for observer in gone {
            debug!(observer = %observer, "Observer gone, pruning registration");
            for &(_, command) in work.iter().filter(|(o, _)| *o == observer) {
                self.remove_command(observer, command);
            }
        }
    }

    fn lookup(
        &self,
        observer: ObserverId,
        command: CommandId,
    ) -> Option<(PollExpression, Arc<dyn PollSink>)> {
        let state = self.shared.state.lock();
        let registration = state.registrations.get(&observer)?;
        let cmd = registration.commands.iter().find(|c| c.id == command)?;
        Some((cmd.expression.clone(), registration.sink.clone()))
    }

    fn record(
        &self,
        observer: ObserverId,
        command: CommandId,
        expression: &PollExpression,
        value: Value,
    ) -> Option<PollEvent> {
        let mut state = self.shared.state.lock();
        let cmd = state
            .registrations
            .get_mut(&observer)?
            .commands
            .iter_mut()
            .find(|c| c.id == command)?;

        let device = self.shared.device.clone();
        match cmd.last.replace(value.clone()) {
            None => None,
            Some(previous) if previous != value => {
                Some(PollEvent::update(device, expression.label(), value))
            }
            Some(_) if cmd.compare => Some(PollEvent::timeout(device, expression.label(), value)),
            Some(_) => None,
        }
    }
}
