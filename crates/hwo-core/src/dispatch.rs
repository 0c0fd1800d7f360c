//! Weak-observer event dispatch.
//!
//! Pollers detect changes on their own tasks, but observers (hardware objects,
//! GUI panels, the queue engine) expect callbacks on the context they live on.
//! [`EventDispatcher`] bridges the two:
//!
//! ```text
//! Poller task ── post(id, event) ──► [ unbounded mpsc per context ] ──► EventLoop::run()
//!                    │                                                     │
//!                    └─ observer gone? drop silently                       └─ invoke callback,
//!                                                                             catch errors/panics
//! ```
//!
//! Observers are held weakly. Registering never extends an observer's
//! lifetime; once it is dropped, posts to its [`ObserverId`] are discarded
//! without error. Owners should still call [`EventDispatcher::unregister`] from
//! their `Drop` so the slot is reclaimed immediately rather than on the next
//! post.
//!
//! Two observer shapes are supported:
//!
//! - **Bound methods** via [`EventDispatcher::register`]: a `Weak<T>` plus a
//!   plain `fn(&T, &PollEvent)`. The object and the function are stored
//!   separately, so neither keeps the other alive.
//! - **Callables** via [`EventDispatcher::register_fn`]: a `Weak` to a shared
//!   closure the caller owns.

use crate::error::{HwoError, HwoResult};
use crate::event::{Delivery, ObserverId, PollEvent, PollSink};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// Shared closure type accepted by [`EventDispatcher::register_fn`].
pub type ObserverFn = dyn Fn(&PollEvent) -> anyhow::Result<()> + Send + Sync;

type InvokeFn = dyn Fn(&PollEvent) -> Option<anyhow::Result<()>> + Send + Sync;
type AliveFn = dyn Fn() -> bool + Send + Sync;

/// Identity of a delivery context (one [`EventLoop`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

struct WeakObserver {
    label: String,
    invoke: Box<InvokeFn>,
    alive: Box<AliveFn>,
}

struct Envelope {
    observer: ObserverId,
    target: Arc<WeakObserver>,
    event: PollEvent,
}

struct Slot {
    target: Arc<WeakObserver>,
    context: ContextId,
    sender: mpsc::UnboundedSender<Envelope>,
}

struct DispatcherInner {
    slots: Mutex<HashMap<ObserverId, Slot>>,
    contexts: Mutex<HashMap<ContextId, mpsc::UnboundedSender<Envelope>>>,
    next_id: AtomicU64,
}

/// Process-wide registry of weakly held observers.
///
/// Cheap to clone; all clones share the same slots.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("observers", &self.observer_count())
            .field("contexts", &self.inner.contexts.lock().len())
            .finish()
    }
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                slots: Mutex::new(HashMap::new()),
                contexts: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a new delivery context.
    ///
    /// The returned [`EventLoop`] must be driven (`run`, `next` or `drain`) by
    /// whichever task or thread the observers expect to be called on.
    pub fn create_context(&self, name: impl Into<String>) -> EventLoop {
        let id = ContextId(self.next_id());
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.contexts.lock().insert(id, sender);
        let name = name.into();
        debug!(context = %name, "Created dispatch context");
        EventLoop {
            id,
            name,
            receiver,
        }
    }

    /// Close a context. Observers bound to it stop receiving events and its
    /// [`EventLoop::run`] returns once the queue is empty.
    pub fn close_context(&self, context: ContextId) {
        self.inner.contexts.lock().remove(&context);
        self.inner.slots.lock().retain(|_, slot| slot.context != context);
    }

    /// Register a bound method: `method` is invoked on `target` for every
    /// event, for as long as `target` is alive.
    pub fn register<T>(
        &self,
        context: ContextId,
        target: &Arc<T>,
        method: fn(&T, &PollEvent) -> anyhow::Result<()>,
    ) -> HwoResult<ObserverId>
    where
        T: Send + Sync + 'static,
    {
        let weak = Arc::downgrade(target);
        let liveness = weak.clone();
        let observer = WeakObserver {
            label: std::any::type_name::<T>().to_string(),
            invoke: Box::new(move |event: &PollEvent| weak.upgrade().map(|t| method(&t, event))),
            alive: Box::new(move || liveness.strong_count() > 0),
        };
        self.insert(context, observer)
    }

    /// Register a shared closure. The dispatcher keeps only a weak reference;
    /// the caller owns `callback`.
    pub fn register_fn(
        &self,
        context: ContextId,
        label: impl Into<String>,
        callback: &Arc<ObserverFn>,
    ) -> HwoResult<ObserverId> {
        let weak: Weak<ObserverFn> = Arc::downgrade(callback);
        let liveness = weak.clone();
        let observer = WeakObserver {
            label: label.into(),
            invoke: Box::new(move |event: &PollEvent| weak.upgrade().map(|f| f(event))),
            alive: Box::new(move || liveness.strong_count() > 0),
        };
        self.insert(context, observer)
    }

    fn insert(&self, context: ContextId, observer: WeakObserver) -> HwoResult<ObserverId> {
        let sender = self
            .inner
            .contexts
            .lock()
            .get(&context)
            .cloned()
            .ok_or_else(|| HwoError::Dispatch(format!("context {context:?} is closed")))?;

        let id = ObserverId::allocate();
        trace!(observer = %id, label = %observer.label, "Registered observer");
        self.inner.slots.lock().insert(
            id,
            Slot {
                target: Arc::new(observer),
                context,
                sender,
            },
        );
        Ok(id)
    }

    /// Remove a registration. Safe to call more than once.
    pub fn unregister(&self, id: ObserverId) -> bool {
        self.inner.slots.lock().remove(&id).is_some()
    }

    /// Queue `event` for the observer behind `id`.
    ///
    /// Never blocks and never fails: an unknown or dead observer simply yields
    /// [`Delivery::Dropped`].
    pub fn post(&self, id: ObserverId, event: PollEvent) -> Delivery {
        let mut slots = self.inner.slots.lock();
        let Some(slot) = slots.get(&id) else {
            return Delivery::Dropped;
        };

        if !(slot.target.alive)() {
            trace!(observer = %id, "Observer gone, dropping event");
            slots.remove(&id);
            return Delivery::Dropped;
        }

        let envelope = Envelope {
            observer: id,
            target: slot.target.clone(),
            event,
        };
        if slot.sender.send(envelope).is_err() {
            slots.remove(&id);
            return Delivery::Dropped;
        }
        Delivery::Queued
    }

    /// Whether `id` is registered and its observer still exists.
    pub fn is_alive(&self, id: ObserverId) -> bool {
        self.inner
            .slots
            .lock()
            .get(&id)
            .is_some_and(|slot| (slot.target.alive)())
    }

    /// Number of registered slots (including not-yet-reaped dead ones).
    pub fn observer_count(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// A [`PollSink`] that posts straight to `id`.
    pub fn sink(&self, id: ObserverId) -> Arc<dyn PollSink> {
        Arc::new(DispatchSink {
            dispatcher: self.clone(),
            id,
        })
    }
}

struct DispatchSink {
    dispatcher: EventDispatcher,
    id: ObserverId,
}

impl PollSink for DispatchSink {
    fn deliver(&self, event: PollEvent) -> Delivery {
        self.dispatcher.post(self.id, event)
    }

    fn is_alive(&self) -> bool {
        self.dispatcher.is_alive(self.id)
    }
}

/// Consumer side of a dispatch context.
///
/// Drive it with [`EventLoop::run`] on a dedicated task, or pump it with
/// [`EventLoop::drain`] from a frame/tick loop.
pub struct EventLoop {
    id: ContextId,
    name: String,
    receiver: mpsc::UnboundedReceiver<Envelope>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Context identity, used when registering observers.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Context name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver events until the context is closed.
    pub async fn run(mut self) {
        while self.next().await {}
        debug!(context = %self.name, "Dispatch context finished");
    }

    /// Wait for one event and deliver it. Returns `false` once closed.
    pub async fn next(&mut self) -> bool {
        match self.receiver.recv().await {
            Some(envelope) => {
                self.deliver(envelope);
                true
            }
            None => false,
        }
    }

    /// Deliver everything already queued without waiting.
    pub fn drain(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(envelope) = self.receiver.try_recv() {
            self.deliver(envelope);
            delivered += 1;
        }
        delivered
    }

    fn deliver(&self, envelope: Envelope) {
        let Envelope {
            observer,
            target,
            event,
        } = envelope;

        match catch_unwind(AssertUnwindSafe(|| (target.invoke)(&event))) {
            Ok(None) => {
                trace!(observer = %observer, "Observer dropped before delivery");
            }
            Ok(Some(Ok(()))) => {}
            Ok(Some(Err(e))) => {
                error!(
                    observer = %observer,
                    label = %target.label,
                    event = %event.kind,
                    source = %event.source,
                    "Observer callback failed: {e:#}"
                );
            }
            Err(_) => {
                error!(
                    observer = %observer,
                    label = %target.label,
                    event = %event.kind,
                    source = %event.source,
                    "Observer callback panicked"
                );
            }
        }
    }
}
