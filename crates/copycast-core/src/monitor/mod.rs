//! Change-tracking subscriptions over a shared record.
//!
//! A [`Monitor`] couples a compiled [`Projection`] with an [`ElementQueue`]
//! and registers itself as a listener on the master [`Record`]. Each field
//! write triggers one master→copy delta pass; the resulting delta
//! accumulates into the monitor's *active* element, which is published to
//! the filled queue as soon as a free element exists to take its place.
//!
//! While the queue is saturated the active element keeps accumulating:
//! `changed` grows, and any bit that changes a second time is also recorded
//! in `overrun` (the consumer knows intermediate values were dropped).
//! Releasing an element flushes such an accumulated delta immediately.
//!
//! Lock order is record data → monitor state; consumer callbacks run with
//! neither held.

mod queue;

pub use queue::{ElementQueue, MonitorElement};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::bitset::ChangeBitmap;
use crate::projection::{CompileError, FilterRegistry, Projection};
use crate::request::RequestSpec;
use crate::tree::{ListenerId, Record, RecordListener, TreeInstance};

/// Queue capacity used when the request carries no `queueSize` option.
pub const DEFAULT_QUEUE_SIZE: usize = 2;

// ---------------------------------------------------------------------------
// MonitorError
// ---------------------------------------------------------------------------

/// Monitor lifecycle error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    /// `start` on a monitor that is already active.
    #[error("monitor is already started")]
    AlreadyStarted,
    /// `stop` on a monitor that is not active.
    #[error("monitor is not started")]
    NotStarted,
    /// Any lifecycle call on a destroyed monitor.
    #[error("monitor has been destroyed")]
    Destroyed,
}

/// Lifecycle state. `Active → Idle → Active` is allowed; `Destroyed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    Idle,
    Active,
    Destroyed,
}

// ---------------------------------------------------------------------------
// MonitorConsumer
// ---------------------------------------------------------------------------

/// Downstream notification hook.
///
/// Called once per newly filled element, with no monitor or record lock
/// held, so the implementation may poll immediately.
pub trait MonitorConsumer: Send + Sync {
    /// A new element is available to [`Monitor::poll`].
    fn event(&self);
}

// ---------------------------------------------------------------------------
// MonitorMetrics
// ---------------------------------------------------------------------------

/// Counters for one monitor, updated relaxed.
#[derive(Debug, Default)]
pub struct MonitorMetrics {
    published: AtomicU64,
    suppressed: AtomicU64,
    overruns: AtomicU64,
    overflows: AtomicU64,
    polls: AtomicU64,
}

impl MonitorMetrics {
    /// Elements moved to the filled queue (initial snapshot included).
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Record writes that produced no reportable delta (unprojected
    /// fields, deadband suppression, no-op value changes).
    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Bits recorded in an overrun bitmap (intermediate values lost).
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Publishes deferred because no free element was available.
    #[must_use]
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Successful polls.
    #[must_use]
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// PolledElement
// ---------------------------------------------------------------------------

/// An element checked out by [`Monitor::poll`].
///
/// Owns the element's snapshot outright, so the consumer reads it without
/// any lock. Hand it back with [`Monitor::release`].
#[derive(Debug)]
pub struct PolledElement {
    element: MonitorElement,
    slot: usize,
}

impl std::ops::Deref for PolledElement {
    type Target = MonitorElement;

    fn deref(&self) -> &MonitorElement {
        &self.element
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

struct MonitorInner {
    projection: Projection,
    /// The monitor's own up-to-date projected instance; element snapshots
    /// are cloned from it at accumulation time.
    canonical: TreeInstance,
    queue: ElementQueue,
    /// Slot index of the element currently accumulating changes.
    active: usize,
    state: MonitorState,
    group_put_depth: u32,
    /// A change arrived during a group put and awaits the closing bracket.
    pending: bool,
    consumer: Option<Arc<dyn MonitorConsumer>>,
}

/// A change-tracking subscription on one [`Record`].
pub struct Monitor {
    record: Arc<Record>,
    inner: Mutex<MonitorInner>,
    listener_id: Mutex<Option<ListenerId>>,
    metrics: MonitorMetrics,
}

impl Monitor {
    /// Compiles `request` against `record` and builds an idle monitor.
    ///
    /// Queue capacity comes from the request's `queueSize` option
    /// (default [`DEFAULT_QUEUE_SIZE`]).
    ///
    /// # Errors
    ///
    /// Returns the [`CompileError`] if the request does not fit the
    /// record's schema.
    pub fn new(
        record: Arc<Record>,
        request: &RequestSpec,
        registry: &FilterRegistry,
    ) -> Result<Arc<Self>, CompileError> {
        let (projection, canonical, queue, active) = {
            let master = record.lock();
            let projection = Projection::compile(&master, request, registry)?;
            let canonical = projection.new_copy_instance();
            let capacity = projection
                .root_options()
                .queue_size
                .unwrap_or(DEFAULT_QUEUE_SIZE);
            let elements = (0..capacity)
                .map(|_| MonitorElement::new(projection.new_copy_instance()))
                .collect();
            let mut queue = ElementQueue::new(elements);
            let active = queue.claim_free().expect("capacity is at least 2");
            (projection, canonical, queue, active)
        };
        debug!(record = record.name(), capacity = queue.capacity(), "monitor created");
        Ok(Arc::new(Self {
            record,
            inner: Mutex::new(MonitorInner {
                projection,
                canonical,
                queue,
                active,
                state: MonitorState::Idle,
                group_put_depth: 0,
                pending: false,
                consumer: None,
            }),
            listener_id: Mutex::new(None),
            metrics: MonitorMetrics::default(),
        }))
    }

    /// The monitored record.
    #[must_use]
    pub fn record(&self) -> &Arc<Record> {
        &self.record
    }

    /// This monitor's counters.
    #[must_use]
    pub fn metrics(&self) -> &MonitorMetrics {
        &self.metrics
    }

    /// Total element count (active accumulator included).
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.inner.lock().queue.capacity()
    }

    /// Schema of the projected tree delivered in elements.
    #[must_use]
    pub fn copy_schema(&self) -> Arc<crate::tree::Schema> {
        Arc::clone(self.inner.lock().projection.copy_schema())
    }

    /// Activates the monitor and publishes the initial full snapshot
    /// (its `changed` bitmap is the single whole-record bit 0).
    ///
    /// # Errors
    ///
    /// [`MonitorError::AlreadyStarted`] if active,
    /// [`MonitorError::Destroyed`] if destroyed.
    pub fn start(
        self: &Arc<Self>,
        consumer: Arc<dyn MonitorConsumer>,
    ) -> Result<(), MonitorError> {
        let master = self.record.lock();
        let mut inner = self.inner.lock();
        match inner.state {
            MonitorState::Active => return Err(MonitorError::AlreadyStarted),
            MonitorState::Destroyed => return Err(MonitorError::Destroyed),
            MonitorState::Idle => {}
        }
        inner.state = MonitorState::Active;
        inner.group_put_depth = 0;
        inner.pending = false;
        inner.consumer = Some(Arc::clone(&consumer));
        {
            let MonitorInner {
                projection,
                canonical,
                queue,
                active,
                ..
            } = &mut *inner;
            queue.requeue_filled();
            let mut scratch = ChangeBitmap::new(projection.copy_schema().field_count());
            projection.init_copy(canonical, &master, &mut scratch);
            let element = queue.slot_mut(*active);
            element.reset();
            element.data = canonical.clone();
            element.changed.set(0);
            queue.push_filled(*active);
            *active = queue.claim_free().expect("capacity is at least 2");
            queue.slot_mut(*active).reset();
        }
        // registering while the record is still locked closes the window
        // between snapshot and first notification
        let id = self
            .record
            .add_listener(Arc::clone(self) as Arc<dyn RecordListener>);
        *self.listener_id.lock() = Some(id);
        drop(master);
        drop(inner);
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        consumer.event();
        Ok(())
    }

    /// Deactivates the monitor. Already-filled elements remain pollable;
    /// no further elements are published until the next `start`.
    ///
    /// # Errors
    ///
    /// [`MonitorError::NotStarted`] if idle, [`MonitorError::Destroyed`]
    /// if destroyed.
    pub fn stop(&self) -> Result<(), MonitorError> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                MonitorState::Idle => return Err(MonitorError::NotStarted),
                MonitorState::Destroyed => return Err(MonitorError::Destroyed),
                MonitorState::Active => {}
            }
            inner.state = MonitorState::Idle;
            inner.consumer = None;
        }
        if let Some(id) = self.listener_id.lock().take() {
            self.record.remove_listener(id);
        }
        Ok(())
    }

    /// Tears the monitor down permanently. Idempotent.
    pub fn destroy(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == MonitorState::Destroyed {
                return;
            }
            inner.state = MonitorState::Destroyed;
            inner.consumer = None;
            inner.queue.requeue_filled();
        }
        if let Some(id) = self.listener_id.lock().take() {
            self.record.remove_listener(id);
        }
    }

    /// Checks out the oldest filled element, if any.
    #[must_use]
    pub fn poll(&self) -> Option<PolledElement> {
        let mut inner = self.inner.lock();
        let (slot, element) = inner.queue.poll()?;
        self.metrics.polls.fetch_add(1, Ordering::Relaxed);
        Some(PolledElement { element, slot })
    }

    /// Returns a polled element. If the active element accumulated an
    /// overflow delta in the meantime, the freed slot lets it publish now.
    pub fn release(&self, polled: PolledElement) {
        let mut notify = None;
        {
            let mut inner = self.inner.lock();
            inner.queue.release(polled.slot, polled.element);
            if inner.state == MonitorState::Active {
                let flushed = {
                    let MonitorInner {
                        projection,
                        queue,
                        active,
                        ..
                    } = &mut *inner;
                    if queue.slot(*active).changed.any() && queue.free_len() > 0 {
                        Self::swap_active(projection, queue, active);
                        true
                    } else {
                        false
                    }
                };
                if flushed {
                    self.metrics.published.fetch_add(1, Ordering::Relaxed);
                    notify = inner.consumer.clone();
                }
            }
        }
        if let Some(consumer) = notify {
            consumer.event();
        }
    }

    // -- internals ---------------------------------------------------------

    /// One accumulate-and-maybe-publish cycle. Consumes the record guard
    /// (dropped as soon as the delta pass is done) and returns whether an
    /// element was published.
    fn publish_locked(
        &self,
        master: MutexGuard<'_, TreeInstance>,
        inner: &mut MonitorInner,
    ) -> bool {
        let MonitorInner {
            projection,
            canonical,
            queue,
            active,
            ..
        } = inner;
        let mut scratch = ChangeBitmap::new(projection.copy_schema().field_count());
        let changed = projection.update_copy_set_bitset(canonical, &master, &mut scratch);
        drop(master);
        if !changed {
            self.metrics.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let element = queue.slot_mut(*active);
        for bit in scratch.ones() {
            if !element.changed.set(bit) {
                element.overrun.set(bit);
                self.metrics.overruns.fetch_add(1, Ordering::Relaxed);
            }
        }
        element.data = canonical.clone();
        if queue.free_len() == 0 {
            self.metrics.overflows.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        Self::swap_active(projection, queue, active);
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Publishes the active element and claims a fresh accumulator.
    fn swap_active(projection: &Projection, queue: &mut ElementQueue, active: &mut usize) {
        let element = queue.slot_mut(*active);
        projection.compress_bitmap(&mut element.changed);
        projection.compress_bitmap(&mut element.overrun);
        queue.push_filled(*active);
        *active = queue.claim_free().expect("free element availability checked");
        queue.slot_mut(*active).reset();
    }
}

impl RecordListener for Monitor {
    fn on_field_changed(&self, offset: usize) {
        let master = self.record.lock();
        let mut inner = self.inner.lock();
        if inner.state != MonitorState::Active {
            return;
        }
        if inner.group_put_depth > 0 {
            inner.pending = true;
            return;
        }
        if inner.projection.copy_offset(offset).is_none() {
            self.metrics.suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let published = self.publish_locked(master, &mut inner);
        let notify = if published { inner.consumer.clone() } else { None };
        drop(inner);
        if let Some(consumer) = notify {
            consumer.event();
        }
    }

    fn on_group_put_begin(&self) {
        let mut inner = self.inner.lock();
        if inner.state == MonitorState::Active {
            inner.group_put_depth += 1;
        }
    }

    fn on_group_put_end(&self) {
        let master = self.record.lock();
        let mut inner = self.inner.lock();
        if inner.state != MonitorState::Active {
            return;
        }
        inner.group_put_depth = inner.group_put_depth.saturating_sub(1);
        if inner.group_put_depth > 0 || !inner.pending {
            return;
        }
        inner.pending = false;
        let published = self.publish_locked(master, &mut inner);
        let notify = if published { inner.consumer.clone() } else { None };
        drop(inner);
        if let Some(consumer) = notify {
            consumer.event();
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Monitor")
            .field("record", &self.record.name())
            .field("state", &inner.state)
            .field("filled", &inner.queue.filled_len())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
