//! Gateway fan-out: one upstream monitor shared by many subscribers.
//!
//! A gateway sitting between many clients and one data source should not
//! open one upstream subscription per client. The [`FanoutCache`] keys
//! shared subscriptions by `(record name, canonical request)`: the first
//! subscriber opens the single upstream [`Monitor`], later subscribers with
//! an equivalent request attach to it, and each gets its own bounded
//! downstream queue with independent overflow accounting.
//!
//! ```text
//!                       ┌── downstream queue ── client A
//!   record ── Monitor ──┼── downstream queue ── client B
//!                       └── downstream queue ── client C
//! ```
//!
//! A slow client overruns only its own queue; the others keep receiving
//! every delta. Unsubscribed, untouched entries are reclaimed by
//! [`FanoutCache::sweep`], with upstream teardown deferred until the cache
//! lock is released.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::monitor::{ElementQueue, Monitor, MonitorConsumer, MonitorElement};
use crate::projection::{CompileError, FilterRegistry};
use crate::request::RequestSpec;
use crate::tree::{Record, TreeInstance};

// ---------------------------------------------------------------------------
// FanoutMetrics
// ---------------------------------------------------------------------------

/// Counters for one cache, updated relaxed.
#[derive(Debug, Default)]
pub struct FanoutMetrics {
    upstream_events: AtomicU64,
    deliveries: AtomicU64,
    overruns: AtomicU64,
    swept: AtomicU64,
}

impl FanoutMetrics {
    /// Elements taken from upstream monitors.
    #[must_use]
    pub fn upstream_events(&self) -> u64 {
        self.upstream_events.load(Ordering::Relaxed)
    }

    /// Elements published into downstream queues.
    #[must_use]
    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    /// Bits folded into a downstream overrun bitmap.
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Shared subscriptions reclaimed by sweeps.
    #[must_use]
    pub fn swept(&self) -> u64 {
        self.swept.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// SharedSubscription
// ---------------------------------------------------------------------------

/// One downstream subscriber's state.
struct Downstream {
    queue: ElementQueue,
    /// Slot accumulating changes while the queue is saturated.
    active: usize,
    consumer: Arc<dyn MonitorConsumer>,
}

struct SubInner {
    /// Latest full snapshot seen from upstream; late joiners start here.
    last_known: TreeInstance,
    have_snapshot: bool,
    /// Slot map; `None` entries are reusable.
    subscribers: Vec<Option<Downstream>>,
    subscriber_count: usize,
}

/// One upstream monitor fanned out to any number of downstream queues.
pub struct SharedSubscription {
    monitor: Arc<Monitor>,
    /// Downstream queue capacity, taken from the shared request.
    queue_size: usize,
    /// Cleared by sweep, set by any subscriber activity.
    touched: AtomicBool,
    inner: Mutex<SubInner>,
    metrics: Arc<FanoutMetrics>,
}

impl SharedSubscription {
    /// Compiles the request, opens the upstream monitor and starts it.
    /// The initial snapshot arrives synchronously, priming `last_known`.
    fn open(
        record: &Arc<Record>,
        request: &RequestSpec,
        registry: &FilterRegistry,
        metrics: Arc<FanoutMetrics>,
    ) -> Result<Arc<Self>, CompileError> {
        let monitor = Monitor::new(Arc::clone(record), request, registry)?;
        let schema = monitor.copy_schema();
        let subscription = Arc::new(Self {
            queue_size: monitor.queue_capacity(),
            monitor: Arc::clone(&monitor),
            touched: AtomicBool::new(true),
            inner: Mutex::new(SubInner {
                last_known: TreeInstance::new(schema),
                have_snapshot: false,
                subscribers: Vec::new(),
                subscriber_count: 0,
            }),
            metrics,
        });
        monitor
            .start(Arc::clone(&subscription) as Arc<dyn MonitorConsumer>)
            .expect("fresh monitor cannot already be started");
        Ok(subscription)
    }

    /// Attaches a downstream queue, delivering the last-known snapshot
    /// immediately (whole-record bit 0 set).
    fn add_subscriber(self: &Arc<Self>, consumer: Arc<dyn MonitorConsumer>) -> SubscriberHandle {
        self.touched.store(true, Ordering::Release);
        let mut snapshot_ready = false;
        let id;
        {
            let mut inner = self.inner.lock();
            let schema = Arc::clone(inner.last_known.schema());
            let elements = (0..self.queue_size)
                .map(|_| MonitorElement::new(TreeInstance::new(Arc::clone(&schema))))
                .collect();
            let mut queue = ElementQueue::new(elements);
            let active = queue.claim_free().expect("capacity is at least 2");
            let mut downstream = Downstream {
                queue,
                active,
                consumer: Arc::clone(&consumer),
            };
            if inner.have_snapshot {
                let element = downstream.queue.slot_mut(downstream.active);
                element.data = inner.last_known.clone();
                element.changed.set(0);
                downstream.queue.push_filled(downstream.active);
                downstream.active = downstream
                    .queue
                    .claim_free()
                    .expect("capacity is at least 2");
                downstream.queue.slot_mut(downstream.active).reset();
                snapshot_ready = true;
            }
            id = match inner.subscribers.iter().position(Option::is_none) {
                Some(slot) => {
                    inner.subscribers[slot] = Some(downstream);
                    slot
                }
                None => {
                    inner.subscribers.push(Some(downstream));
                    inner.subscribers.len() - 1
                }
            };
            inner.subscriber_count += 1;
        }
        if snapshot_ready {
            self.metrics.deliveries.fetch_add(1, Ordering::Relaxed);
            consumer.event();
        }
        SubscriberHandle {
            subscription: Arc::clone(self),
            id,
        }
    }

    fn remove_subscriber(&self, id: usize) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.subscribers.get_mut(id) {
            if slot.take().is_some() {
                inner.subscriber_count -= 1;
            }
        }
    }

    fn subscriber_count(&self) -> usize {
        self.inner.lock().subscriber_count
    }

    /// Folds one upstream element into a downstream accumulator and
    /// publishes if a free slot exists. Returns the consumer to notify.
    fn deliver(
        downstream: &mut Downstream,
        upstream: &MonitorElement,
        metrics: &FanoutMetrics,
    ) -> Option<Arc<dyn MonitorConsumer>> {
        let active = downstream.queue.slot_mut(downstream.active);
        for bit in upstream.changed.ones() {
            if !active.changed.set(bit) {
                // changed again before this subscriber saw the first value
                active.overrun.set(bit);
                metrics.overruns.fetch_add(1, Ordering::Relaxed);
            }
        }
        active.overrun.union_with(&upstream.overrun);
        active.data = upstream.data.clone();
        if downstream.queue.free_len() == 0 {
            return None;
        }
        downstream.queue.push_filled(downstream.active);
        downstream.active = downstream
            .queue
            .claim_free()
            .expect("free slot availability checked");
        downstream.queue.slot_mut(downstream.active).reset();
        metrics.deliveries.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(&downstream.consumer))
    }
}

impl MonitorConsumer for SharedSubscription {
    fn event(&self) {
        while let Some(upstream) = self.monitor.poll() {
            self.metrics.upstream_events.fetch_add(1, Ordering::Relaxed);
            let mut notifications = Vec::new();
            {
                let mut inner = self.inner.lock();
                inner.last_known = upstream.data.clone();
                inner.have_snapshot = true;
                let SubInner { subscribers, .. } = &mut *inner;
                for downstream in subscribers.iter_mut().flatten() {
                    if let Some(consumer) = Self::deliver(downstream, &upstream, &self.metrics) {
                        notifications.push(consumer);
                    }
                }
            }
            self.monitor.release(upstream);
            for consumer in notifications {
                consumer.event();
            }
        }
    }
}

impl std::fmt::Debug for SharedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSubscription")
            .field("record", &self.monitor.record().name())
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SubscriberHandle
// ---------------------------------------------------------------------------

/// An element checked out from a downstream queue.
#[derive(Debug)]
pub struct SubscriberElement {
    element: MonitorElement,
    slot: usize,
}

impl std::ops::Deref for SubscriberElement {
    type Target = MonitorElement;

    fn deref(&self) -> &MonitorElement {
        &self.element
    }
}

/// One downstream subscription. Dropping the handle unsubscribes.
pub struct SubscriberHandle {
    subscription: Arc<SharedSubscription>,
    id: usize,
}

impl SubscriberHandle {
    /// Checks out the oldest element of this subscriber's queue.
    #[must_use]
    pub fn poll(&self) -> Option<SubscriberElement> {
        self.subscription.touched.store(true, Ordering::Release);
        let mut inner = self.subscription.inner.lock();
        let downstream = inner.subscribers[self.id].as_mut()?;
        let (slot, element) = downstream.queue.poll()?;
        Some(SubscriberElement { element, slot })
    }

    /// Returns a polled element; an accumulated overflow delta publishes
    /// into the freed slot at once.
    pub fn release(&self, polled: SubscriberElement) {
        let mut notify = None;
        {
            let mut inner = self.subscription.inner.lock();
            let Some(downstream) = inner.subscribers[self.id].as_mut() else {
                return;
            };
            downstream.queue.release(polled.slot, polled.element);
            let active = downstream.queue.slot(downstream.active);
            if active.changed.any() && downstream.queue.free_len() > 0 {
                downstream.queue.push_filled(downstream.active);
                downstream.active = downstream
                    .queue
                    .claim_free()
                    .expect("free slot availability checked");
                downstream.queue.slot_mut(downstream.active).reset();
                self.subscription
                    .metrics
                    .deliveries
                    .fetch_add(1, Ordering::Relaxed);
                notify = Some(Arc::clone(&downstream.consumer));
            }
        }
        if let Some(consumer) = notify {
            consumer.event();
        }
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.subscription.remove_subscriber(self.id);
    }
}

impl std::fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// FanoutCache
// ---------------------------------------------------------------------------

struct ChannelEntry {
    subscriptions: FxHashMap<String, Arc<SharedSubscription>>,
}

/// Cache of shared subscriptions keyed by record name and canonical
/// request text.
pub struct FanoutCache {
    registry: FilterRegistry,
    channels: Mutex<FxHashMap<String, ChannelEntry>>,
    metrics: Arc<FanoutMetrics>,
}

impl FanoutCache {
    /// Creates a cache; `registry` resolves custom filter options for every
    /// upstream compile.
    #[must_use]
    pub fn new(registry: FilterRegistry) -> Self {
        Self {
            registry,
            channels: Mutex::new(FxHashMap::default()),
            metrics: Arc::new(FanoutMetrics::default()),
        }
    }

    /// This cache's counters.
    #[must_use]
    pub fn metrics(&self) -> &FanoutMetrics {
        &self.metrics
    }

    /// Number of live shared subscriptions across all channels.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.channels
            .lock()
            .values()
            .map(|entry| entry.subscriptions.len())
            .sum()
    }

    /// Attaches `consumer` to the shared subscription for
    /// `(record, request)`, opening the upstream monitor if this is the
    /// first equivalent request. The last-known snapshot is delivered
    /// before this returns.
    ///
    /// # Errors
    ///
    /// Returns the [`CompileError`] if the request does not fit the
    /// record's schema; the cache is unchanged.
    pub fn subscribe(
        &self,
        record: &Arc<Record>,
        request: &RequestSpec,
        consumer: Arc<dyn MonitorConsumer>,
    ) -> Result<SubscriberHandle, CompileError> {
        let key = request.canonical();
        let subscription = {
            let mut channels = self.channels.lock();
            let entry = channels
                .entry(record.name().to_string())
                .or_insert_with(|| ChannelEntry {
                    subscriptions: FxHashMap::default(),
                });
            match entry.subscriptions.get(&key) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let created = SharedSubscription::open(
                        record,
                        request,
                        &self.registry,
                        Arc::clone(&self.metrics),
                    )?;
                    debug!(record = record.name(), request = %key, "opened upstream subscription");
                    entry.subscriptions.insert(key, Arc::clone(&created));
                    created
                }
            }
        };
        Ok(subscription.add_subscriber(consumer))
    }

    /// Reclaims shared subscriptions that have no subscribers and saw no
    /// activity since the previous sweep. Returns how many were removed.
    ///
    /// Upstream monitors are torn down after the cache lock is released,
    /// so record teardown never nests inside it.
    pub fn sweep(&self) -> usize {
        let mut reclaimed = Vec::new();
        {
            let mut channels = self.channels.lock();
            for entry in channels.values_mut() {
                entry.subscriptions.retain(|_, subscription| {
                    let touched = subscription.touched.swap(false, Ordering::AcqRel);
                    if subscription.subscriber_count() == 0 && !touched {
                        reclaimed.push(Arc::clone(subscription));
                        false
                    } else {
                        true
                    }
                });
            }
            channels.retain(|_, entry| !entry.subscriptions.is_empty());
        }
        let count = reclaimed.len();
        for subscription in reclaimed {
            subscription.monitor.destroy();
        }
        if count > 0 {
            self.metrics.swept.fetch_add(count as u64, Ordering::Relaxed);
            debug!(count, "swept idle subscriptions");
        }
        count
    }
}

impl Default for FanoutCache {
    fn default() -> Self {
        Self::new(FilterRegistry::new())
    }
}

impl std::fmt::Debug for FanoutCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutCache")
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Scalar, ScalarType, SchemaBuilder, Value};

    fn test_record() -> Arc<Record> {
        let schema = SchemaBuilder::new("signal")
            .scalar("value", ScalarType::Float)
            .alarm()
            .build();
        Record::new("signal01", schema)
    }

    #[derive(Default)]
    struct Counting {
        events: AtomicU64,
    }

    impl MonitorConsumer for Counting {
        fn event(&self) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request(text: &str) -> RequestSpec {
        RequestSpec::parse(text).unwrap()
    }

    fn float(v: f64) -> Value {
        Value::Scalar(Scalar::Float(v))
    }

    // -- sharing tests --

    #[test]
    fn test_fanout_equivalent_requests_share_upstream() {
        let cache = FanoutCache::default();
        let record = test_record();
        let a = cache
            .subscribe(&record, &request("value,alarm"), Arc::new(Counting::default()))
            .unwrap();
        // same selection, different spelling: canonicalizes identically
        let b = cache
            .subscribe(&record, &request("alarm,value"), Arc::new(Counting::default()))
            .unwrap();
        assert_eq!(cache.subscription_count(), 1);
        drop(a);
        drop(b);
    }

    #[test]
    fn test_fanout_vacated_slot_is_reused() {
        let cache = FanoutCache::default();
        let record = test_record();
        let a = cache
            .subscribe(&record, &request("value"), Arc::new(Counting::default()))
            .unwrap();
        let b = cache
            .subscribe(&record, &request("value"), Arc::new(Counting::default()))
            .unwrap();
        drop(a);
        // the new subscriber fills a's vacated slot and still gets the
        // shared upstream's snapshot
        let c = cache
            .subscribe(&record, &request("value"), Arc::new(Counting::default()))
            .unwrap();
        assert_eq!(cache.subscription_count(), 1);
        c.release(c.poll().expect("snapshot for reused slot"));
        record.write(1, float(8.0)).unwrap();
        let polled = c.poll().expect("delta for reused slot");
        assert_eq!(polled.data.get(1), &float(8.0));
        c.release(polled);
        drop(b);
    }

    #[test]
    fn test_fanout_distinct_requests_distinct_upstreams() {
        let cache = FanoutCache::default();
        let record = test_record();
        let _a = cache
            .subscribe(&record, &request("value"), Arc::new(Counting::default()))
            .unwrap();
        let _b = cache
            .subscribe(&record, &request("alarm"), Arc::new(Counting::default()))
            .unwrap();
        assert_eq!(cache.subscription_count(), 2);
    }

    #[test]
    fn test_fanout_bad_request_leaves_cache_unchanged() {
        let cache = FanoutCache::default();
        let record = test_record();
        let err = cache.subscribe(&record, &request("nope"), Arc::new(Counting::default()));
        assert!(err.is_err());
        assert_eq!(cache.subscription_count(), 0);
    }

    // -- delivery tests --

    #[test]
    fn test_fanout_late_joiner_gets_current_snapshot() {
        let cache = FanoutCache::default();
        let record = test_record();
        let _a = cache
            .subscribe(&record, &request("value"), Arc::new(Counting::default()))
            .unwrap();
        record.write(1, float(6.0)).unwrap();

        let consumer = Arc::new(Counting::default());
        let b = cache
            .subscribe(&record, &request("value"), consumer.clone())
            .unwrap();
        assert_eq!(consumer.events.load(Ordering::SeqCst), 1);
        let polled = b.poll().expect("snapshot for late joiner");
        assert_eq!(polled.changed.ones().collect::<Vec<_>>(), vec![0]);
        assert_eq!(polled.data.get(1), &float(6.0));
        b.release(polled);
    }

    #[test]
    fn test_fanout_deltas_reach_every_subscriber() {
        let cache = FanoutCache::default();
        let record = test_record();
        let ca = Arc::new(Counting::default());
        let cb = Arc::new(Counting::default());
        let a = cache.subscribe(&record, &request("value"), ca.clone()).unwrap();
        let b = cache.subscribe(&record, &request("value"), cb.clone()).unwrap();
        a.release(a.poll().unwrap());
        b.release(b.poll().unwrap());

        record.write(1, float(2.5)).unwrap();
        assert_eq!(ca.events.load(Ordering::SeqCst), 2);
        assert_eq!(cb.events.load(Ordering::SeqCst), 2);
        let pa = a.poll().unwrap();
        assert_eq!(pa.data.get(1), &float(2.5));
        assert_eq!(pa.changed.ones().collect::<Vec<_>>(), vec![1]);
        a.release(pa);
    }

    #[test]
    fn test_fanout_slow_subscriber_overruns_alone() {
        let cache = FanoutCache::default();
        let record = test_record();
        let slow = cache
            .subscribe(&record, &request("value"), Arc::new(Counting::default()))
            .unwrap();
        let fast = cache
            .subscribe(&record, &request("value"), Arc::new(Counting::default()))
            .unwrap();
        fast.release(fast.poll().unwrap()); // fast drains its snapshot; slow does not

        for v in [1.0, 2.0, 3.0] {
            record.write(1, float(v)).unwrap();
            // fast keeps up: every delta arrives distinct and clean
            let polled = fast.poll().expect("fast subscriber keeps up");
            assert_eq!(polled.data.get(1), &float(v));
            assert!(!polled.overrun.any());
            fast.release(polled);
        }

        // slow still holds its snapshot plus one folded delta
        let snapshot = slow.poll().unwrap();
        assert_eq!(snapshot.changed.ones().collect::<Vec<_>>(), vec![0]);
        slow.release(snapshot);
        let folded = slow.poll().expect("folded delta after release");
        assert_eq!(folded.data.get(1), &float(3.0));
        assert!(folded.overrun.get(1)); // intermediate values were lost
        slow.release(folded);
    }

    // -- sweep tests --

    #[test]
    fn test_fanout_sweep_reclaims_after_grace_period() {
        let cache = FanoutCache::default();
        let record = test_record();
        let handle = cache
            .subscribe(&record, &request("value"), Arc::new(Counting::default()))
            .unwrap();
        drop(handle);

        // first sweep only clears the touched mark
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.subscription_count(), 1);
        // second sweep reclaims
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.subscription_count(), 0);
        assert_eq!(cache.metrics().swept(), 1);

        // the record saw the upstream monitor go away: further writes are
        // delivered nowhere and must not panic
        record.write(1, float(1.0)).unwrap();
    }

    #[test]
    fn test_fanout_sweep_keeps_live_subscriptions() {
        let cache = FanoutCache::default();
        let record = test_record();
        let handle = cache
            .subscribe(&record, &request("value"), Arc::new(Counting::default()))
            .unwrap();
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.sweep(), 0); // still subscribed: never reclaimed
        assert_eq!(cache.subscription_count(), 1);
        drop(handle);
    }

    #[test]
    fn test_fanout_unsubscribe_leaves_others_attached() {
        let cache = FanoutCache::default();
        let record = test_record();
        let ca = Arc::new(Counting::default());
        let a = cache.subscribe(&record, &request("value"), ca.clone()).unwrap();
        let b = cache
            .subscribe(&record, &request("value"), Arc::new(Counting::default()))
            .unwrap();
        drop(b);

        record.write(1, float(4.0)).unwrap();
        assert_eq!(ca.events.load(Ordering::SeqCst), 2);
        drop(a);
    }
}
