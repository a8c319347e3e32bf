//! The channel: one stored value and its ordered subscribers.
//!
//! A [`Channel`] is shared behind an `Arc` by the registry that created it
//! and by every [`Watcher`] cloned from it. A single `parking_lot::Mutex`
//! guards both the stored value and the handler list; it is never held
//! while a handler runs, so handlers may freely re-enter the store
//! (subscribe, publish, read) without deadlocking.
//!
//! Delivery is serialized per channel. A publish from another thread waits
//! until the running delivery finishes; a publish from inside a handler is
//! queued and delivered by the outer call once the current change has
//! reached every subscriber. Every subscriber therefore observes changes in
//! acceptance order, and its last notification carries the stored value.
//!
//! `event-listener` wakes async [`Watcher`]s after each genuine change and
//! when the channel is disposed.

use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, ThreadId},
};

use event_listener::Event;
use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};
use scopeguard::guard_on_unwind;
use tracing::{debug, error, trace};

use crate::{
    config::FaultPolicy,
    error::StateError,
    handler::{Handler, SubscriptionId},
    state::{AtomicState, StateSnapshot, Version},
    watch::Watcher,
};

struct Entry<V> {
    id: SubscriptionId,
    handler: Handler<V>,
}

struct Inner<V> {
    /// `None` until the first publish.
    value: Option<V>,
    /// Registration order is delivery order.
    handlers: Vec<Entry<V>>,
    /// Thread currently draining `pending`.
    deliverer: Option<ThreadId>,
    /// Accepted changes not yet delivered, oldest first.
    pending: VecDeque<V>,
}

/// Outcome of a publish attempt.
pub(crate) enum Published<V> {
    /// Accepted as a change; subscribers are or will be notified.
    Changed,
    /// Stored, but equal to the previous value.
    Unchanged,
    /// The channel is disposed. The value is handed back untouched.
    Closed(V),
}

impl<V> Published<V> {
    pub(crate) fn notified(&self) -> bool {
        matches!(self, Published::Changed)
    }
}

/// A named slot holding the last published value and its subscribers.
pub struct Channel<V> {
    name: String,
    fault_policy: FaultPolicy,
    state: AtomicState,
    changed: Event,
    /// Signalled when `deliverer` is cleared.
    idle: Condvar,
    inner: Mutex<Inner<V>>,
}

impl<V> Channel<V> {
    /// Creates an unset channel with no subscribers.
    pub fn new(name: impl Into<String>, fault_policy: FaultPolicy) -> Self {
        Self {
            name: name.into(),
            fault_policy,
            state: AtomicState::new(),
            changed: Event::new(),
            idle: Condvar::new(),
            inner: Mutex::new(Inner {
                value: None,
                handlers: Vec::new(),
                deliverer: None,
                pending: VecDeque::new(),
            }),
        }
    }

    /// The identifier this channel was created for.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers `handler` and returns its subscription token.
    ///
    /// If the same handler (by identity, see [`Handler::same_handler`]) is
    /// already registered, nothing is added and the existing token is
    /// returned.
    ///
    /// # Errors
    /// Returns [`StateError::Disposed`] if the channel has been disposed;
    /// nothing is registered.
    pub fn subscribe(&self, handler: Handler<V>) -> Result<SubscriptionId, StateError> {
        let mut inner = self.inner.lock();
        if self.is_disposed() {
            return Err(StateError::Disposed {
                channel: self.name.clone(),
            });
        }
        if let Some(existing) = inner
            .handlers
            .iter()
            .find(|entry| entry.handler.same_handler(&handler))
        {
            trace!(channel = %self.name, id = %existing.id, "handler already subscribed");
            return Ok(existing.id);
        }
        let id = SubscriptionId::next();
        inner.handlers.push(Entry { id, handler });
        trace!(channel = %self.name, %id, subscribers = inner.handlers.len(), "subscribed");
        Ok(id)
    }

    /// Removes the registration identified by `id`.
    ///
    /// Returns `false` if no such registration exists.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.remove_where(|entry| entry.id == id)
    }

    /// Removes `handler` by identity.
    ///
    /// Returns `false` if the handler was not registered.
    pub fn unsubscribe_handler(&self, handler: &Handler<V>) -> bool {
        self.remove_where(|entry| entry.handler.same_handler(handler))
    }

    fn remove_where(&self, mut matches: impl FnMut(&Entry<V>) -> bool) -> bool {
        let mut inner = self.inner.lock();
        match inner.handlers.iter().position(|entry| matches(entry)) {
            Some(index) => {
                let removed = inner.handlers.remove(index);
                trace!(channel = %self.name, id = %removed.id, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    /// Returns `true` once a value has been published.
    #[must_use]
    pub fn has_value(&self) -> bool {
        self.inner.lock().value.is_some()
    }

    /// Version of the stored value; bumped once per genuine change.
    #[must_use]
    pub fn version(&self) -> Version {
        self.state.load().version()
    }

    /// Returns `true` once the owning store has disposed this channel.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.load().is_disposed()
    }

    /// Runs `f` against the stored value without cloning it.
    ///
    /// The channel lock is held for the duration of `f`; do not publish to
    /// this channel from inside it.
    pub fn with_current<R>(&self, f: impl FnOnce(Option<&V>) -> R) -> R {
        f(self.inner.lock().value.as_ref())
    }

    /// Disposes the channel: detaches every handler, drops undelivered
    /// changes and wakes all watchers.
    ///
    /// No handler fires after this returns, including handlers captured by
    /// a publish that is still delivering on another thread. Later
    /// subscribes fail and later publishes are ignored.
    pub fn close(&self) {
        let detached = {
            let mut inner = self.inner.lock();
            self.state.set_disposed();
            inner.pending.clear();
            std::mem::take(&mut inner.handlers).len()
        };
        // usize::MAX wakes every listener, not just one
        self.changed.notify(usize::MAX);
        debug!(channel = %self.name, detached, "channel disposed");
    }

    pub(crate) fn snapshot(&self) -> StateSnapshot {
        self.state.load()
    }

    pub(crate) fn changed_event(&self) -> &Event {
        &self.changed
    }

    /// Locks the channel and projects the guard onto the stored value.
    pub(crate) fn lock_value(&self) -> MappedMutexGuard<'_, Option<V>> {
        MutexGuard::map(self.inner.lock(), |inner| &mut inner.value)
    }
}

impl<V: Clone + PartialEq> Channel<V> {
    /// Returns a clone of the stored value, or `None` if nothing has been
    /// published yet.
    #[must_use]
    pub fn current(&self) -> Option<V> {
        self.inner.lock().value.clone()
    }

    /// Publishes `value`.
    ///
    /// The value is stored unconditionally. If the channel was unset or the
    /// value differs from the previous one by `PartialEq`, subscribers are
    /// invoked in registration order on the calling thread before this
    /// returns.
    ///
    /// If another thread is delivering on this channel, this call blocks
    /// until that delivery finishes. If called from a handler of this
    /// channel, the change is queued and delivered after the change
    /// currently being delivered, before the outermost publish returns.
    /// A handler must therefore not block on another thread that publishes
    /// to the same channel.
    ///
    /// Returns `Ok(true)` if the value was accepted as a change, and
    /// `Ok(false)` if it was unchanged or the channel has been disposed.
    /// A disposed channel stores nothing.
    ///
    /// # Errors
    /// Returns [`StateError::HandlerFault`] if the channel isolates handler
    /// panics and at least one handler panicked during the deliveries this
    /// call performed.
    ///
    /// # Panics
    /// With [`FaultPolicy::Propagate`], a panic raised by a handler unwinds
    /// through this call. Changes still queued behind it are dropped.
    pub fn publish(&self, value: V) -> Result<bool, StateError> {
        self.publish_checked(value, |_, _| Ok(()))
    }

    /// Publishes `value` after `check` accepts it as a replacement for the
    /// previous value.
    ///
    /// `check` runs under the channel lock and is only called when a
    /// previous value exists. If it fails, nothing is stored and nothing is
    /// delivered.
    ///
    /// # Errors
    /// Returns whatever `check` returns, or [`StateError::HandlerFault`] as
    /// for [`publish`](Self::publish).
    pub fn publish_checked<F>(&self, value: V, check: F) -> Result<bool, StateError>
    where
        F: FnOnce(&V, &V) -> Result<(), StateError>,
    {
        Ok(self.try_publish(value, check)?.notified())
    }

    /// Like [`publish_checked`](Self::publish_checked), but hands the value
    /// back when the channel is disposed so the caller can retry elsewhere.
    pub(crate) fn try_publish<F>(&self, value: V, check: F) -> Result<Published<V>, StateError>
    where
        F: FnOnce(&V, &V) -> Result<(), StateError>,
    {
        let me = thread::current().id();
        let deliver_now = {
            let mut inner = self.inner.lock();
            while inner.deliverer.is_some_and(|deliverer| deliverer != me) {
                self.idle.wait(&mut inner);
            }
            if self.is_disposed() {
                trace!(channel = %self.name, "publish to disposed channel ignored");
                return Ok(Published::Closed(value));
            }
            if let Some(previous) = inner.value.as_ref() {
                check(previous, &value)?;
            }
            let changed = inner
                .value
                .as_ref()
                .is_none_or(|previous| *previous != value);
            inner.value = Some(value.clone());
            if !changed {
                trace!(channel = %self.name, "value unchanged, notification suppressed");
                return Ok(Published::Unchanged);
            }
            let version = self.state.increment_version();
            inner.pending.push_back(value);
            if inner.deliverer.is_some() {
                trace!(
                    channel = %self.name,
                    version = version.changes(),
                    queued = inner.pending.len(),
                    "nested publish, change queued"
                );
                false
            } else {
                inner.deliverer = Some(me);
                true
            }
        };
        self.changed.notify(usize::MAX);
        if deliver_now {
            self.drain()?;
        }
        Ok(Published::Changed)
    }

    /// Delivers queued changes until the queue is empty.
    ///
    /// Only the thread recorded as `deliverer` may run this.
    fn drain(&self) -> Result<(), StateError> {
        // A propagated panic abandons the queued changes.
        let _reset = guard_on_unwind((), |()| {
            let mut inner = self.inner.lock();
            inner.deliverer = None;
            inner.pending.clear();
            self.idle.notify_all();
        });
        let mut failed = 0;
        loop {
            let (value, handlers) = {
                let mut inner = self.inner.lock();
                let Some(value) = inner.pending.pop_front() else {
                    inner.deliverer = None;
                    self.idle.notify_all();
                    break;
                };
                let handlers: Vec<Handler<V>> = inner
                    .handlers
                    .iter()
                    .map(|entry| entry.handler.clone())
                    .collect();
                (value, handlers)
            };
            debug!(
                channel = %self.name,
                subscribers = handlers.len(),
                "delivering change"
            );
            failed += self.deliver(&handlers, &value);
        }
        if failed == 0 {
            Ok(())
        } else {
            Err(StateError::HandlerFault {
                channel: self.name.clone(),
                failed,
            })
        }
    }

    /// Runs `handlers` against `value` and returns how many panicked.
    fn deliver(&self, handlers: &[Handler<V>], value: &V) -> usize {
        let mut failed = 0;
        for handler in handlers {
            if self.is_disposed() {
                break;
            }
            match self.fault_policy {
                FaultPolicy::Propagate => handler.call(value),
                FaultPolicy::Isolate => {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler.call(value))) {
                        failed += 1;
                        error!(
                            channel = %self.name,
                            panic = panic_message(&*payload),
                            "subscriber panicked during delivery"
                        );
                    }
                }
            }
        }
        failed
    }
}

impl<V> Channel<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Creates a [`Watcher`] positioned at the current version.
    ///
    /// The watcher only reports changes published after this call.
    #[must_use]
    pub fn watch(self: &Arc<Self>) -> Watcher<V> {
        Watcher::new(self.clone())
    }
}

impl<V: fmt::Debug> fmt::Debug for Channel<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("value", &inner.value)
            .field("version", &self.state.load().version())
            .field("subscriber_count", &inner.handlers.len())
            .finish()
    }
}

/// Type-erased view of a channel, so channels with different value types
/// can share one registry.
pub(crate) trait ErasedChannel: Any + Send + Sync {
    fn close(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<V: Send + 'static> ErasedChannel for Channel<V> {
    fn close(&self) {
        Channel::close(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    fn counter() -> (Arc<AtomicUsize>, Handler<i32>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let handler = Handler::new(move |_: &i32| {
            count_clone.fetch_add(1, SeqCst);
        });
        (count, handler)
    }

    #[test]
    fn first_publish_notifies() {
        let channel = Channel::new("count", FaultPolicy::Propagate);
        let (count, handler) = counter();
        channel.subscribe(handler).unwrap();

        assert!(channel.publish(1).unwrap());
        assert_eq!(count.load(SeqCst), 1);
        assert_eq!(channel.current(), Some(1));
    }

    #[test]
    fn equal_value_is_suppressed() {
        let channel = Channel::new("count", FaultPolicy::Propagate);
        let (count, handler) = counter();
        channel.subscribe(handler).unwrap();

        channel.publish(5).unwrap();
        assert!(!channel.publish(5).unwrap());
        assert_eq!(count.load(SeqCst), 1);
        assert_eq!(channel.version().changes(), 1);
    }

    #[test]
    fn duplicate_subscribe_returns_same_id() {
        let channel = Channel::new("count", FaultPolicy::Propagate);
        let (count, handler) = counter();

        let first = channel.subscribe(handler.clone()).unwrap();
        let second = channel.subscribe(handler).unwrap();
        assert_eq!(first, second);
        assert_eq!(channel.subscriber_count(), 1);

        channel.publish(1).unwrap();
        assert_eq!(count.load(SeqCst), 1);
    }

    #[test]
    fn unsubscribe_by_id_and_by_handler() {
        let channel = Channel::new("count", FaultPolicy::Propagate);
        let (a_count, a) = counter();
        let (b_count, b) = counter();

        let a_id = channel.subscribe(a).unwrap();
        channel.subscribe(b.clone()).unwrap();

        assert!(channel.unsubscribe(a_id));
        assert!(!channel.unsubscribe(a_id));
        channel.publish(1).unwrap();
        assert_eq!(a_count.load(SeqCst), 0);
        assert_eq!(b_count.load(SeqCst), 1);

        assert!(channel.unsubscribe_handler(&b));
        channel.publish(2).unwrap();
        assert_eq!(b_count.load(SeqCst), 1);
    }

    #[test]
    fn delivery_follows_registration_order() {
        let channel = Channel::new("order", FaultPolicy::Propagate);
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ['A', 'B', 'C'] {
            let log = log.clone();
            channel.subscribe(Handler::new(move |_: &u8| log.lock().push(tag)))
                .unwrap();
        }

        channel.publish(1).unwrap();
        assert_eq!(*log.lock(), vec!['A', 'B', 'C']);
    }

    #[test]
    fn failed_check_leaves_value_untouched() {
        let channel = Channel::new("checked", FaultPolicy::Propagate);
        channel.publish(1).unwrap();

        let result = channel.publish_checked(2, |_, _| {
            Err(StateError::TypeMismatch {
                channel: "checked".into(),
                expected: "i32",
                found: "u8",
            })
        });
        assert!(matches!(result, Err(StateError::TypeMismatch { .. })));
        assert_eq!(channel.current(), Some(1));
    }

    #[test]
    fn handler_may_reenter_channel() {
        let channel = Arc::new(Channel::new("reentrant", FaultPolicy::Propagate));
        let inner = channel.clone();
        channel
            .subscribe(Handler::new(move |v: &i32| {
                if *v < 3 {
                    inner.publish(v + 1).unwrap();
                }
            }))
            .unwrap();

        channel.publish(0).unwrap();
        assert_eq!(channel.current(), Some(3));
    }

    #[test]
    fn close_detaches_handlers() {
        let channel = Channel::new("closing", FaultPolicy::Propagate);
        let (count, handler) = counter();
        channel.subscribe(handler).unwrap();

        channel.close();
        assert!(channel.is_disposed());
        assert_eq!(channel.subscriber_count(), 0);

        assert!(!channel.publish(1).unwrap());
        assert_eq!(count.load(SeqCst), 0);
        assert_eq!(channel.current(), None);
    }

    #[test]
    fn closed_channel_refuses_subscribers() {
        let channel = Channel::new("closed", FaultPolicy::Propagate);
        channel.close();

        let (count, handler) = counter();
        assert_eq!(
            channel.subscribe(handler),
            Err(StateError::Disposed {
                channel: "closed".into()
            })
        );
        assert_eq!(channel.subscriber_count(), 0);
        assert!(!channel.publish(5).unwrap());
        assert_eq!(count.load(SeqCst), 0);
    }

    #[test]
    fn nested_publish_is_delivered_after_current_change() {
        let channel = Arc::new(Channel::new("nested", FaultPolicy::Propagate));
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner = channel.clone();
        let first_log = log.clone();
        channel
            .subscribe(Handler::new(move |v: &i32| {
                first_log.lock().push(('A', *v));
                if *v == 1 {
                    assert!(inner.publish(2).unwrap());
                }
            }))
            .unwrap();
        let second_log = log.clone();
        channel
            .subscribe(Handler::new(move |v: &i32| second_log.lock().push(('B', *v))))
            .unwrap();

        channel.publish(1).unwrap();
        assert_eq!(*log.lock(), vec![('A', 1), ('B', 1), ('A', 2), ('B', 2)]);
        assert_eq!(channel.current(), Some(2));
        assert_eq!(channel.version().changes(), 2);
    }

    #[test]
    fn delivery_resumes_after_propagated_panic() {
        let channel = Arc::new(Channel::new("recovering", FaultPolicy::Propagate));
        let (count, handler) = counter();
        channel
            .subscribe(Handler::new(|v: &i32| {
                if *v == 1 {
                    panic!("boom");
                }
            }))
            .unwrap();
        channel.subscribe(handler).unwrap();

        let publisher = channel.clone();
        assert!(panic::catch_unwind(AssertUnwindSafe(move || publisher.publish(1))).is_err());

        assert!(channel.publish(2).unwrap());
        assert_eq!(count.load(SeqCst), 1);
    }

    #[test]
    fn isolated_panic_reaches_later_handlers() {
        let channel = Channel::new("faulty", FaultPolicy::Isolate);
        let (count, handler) = counter();
        channel.subscribe(Handler::new(|_: &i32| panic!("boom"))).unwrap();
        channel.subscribe(handler).unwrap();

        let result = channel.publish(1);
        assert!(matches!(
            result,
            Err(StateError::HandlerFault { failed: 1, .. })
        ));
        assert_eq!(count.load(SeqCst), 1);
        assert_eq!(channel.current(), Some(1));
    }

    #[test]
    fn propagated_panic_stops_delivery() {
        let channel = Arc::new(Channel::new("faulty", FaultPolicy::Propagate));
        let (count, handler) = counter();
        channel.subscribe(Handler::new(|_: &i32| panic!("boom"))).unwrap();
        channel.subscribe(handler).unwrap();

        let publisher = channel.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || publisher.publish(1)));
        assert!(outcome.is_err());
        assert_eq!(count.load(SeqCst), 0);
        // The value was accepted before delivery started.
        assert_eq!(channel.current(), Some(1));
    }
}
