//! The bounded element queue backing a monitor.
//!
//! Every element cycles through three states:
//!
//! ```text
//!            publish            poll
//!   free ───────────► filled ─────────► in-use
//!    ▲                                    │
//!    └────────────────────────────────────┘
//!                   release
//! ```
//!
//! One additional element (the monitor's *active* element) is permanently
//! claimed from the free list and accumulates changes between publishes,
//! which is why the capacity floor is 2.
//!
//! Slots hold `Option`: a polled element is moved out to the consumer and
//! moved back on release, so the consumer reads its snapshot without any
//! lock held.

use std::collections::VecDeque;

use crate::bitset::ChangeBitmap;
use crate::tree::TreeInstance;

// ---------------------------------------------------------------------------
// MonitorElement
// ---------------------------------------------------------------------------

/// One queue slot: a full snapshot of the projected tree plus the delta
/// bitmaps describing it.
#[derive(Debug, Clone)]
pub struct MonitorElement {
    /// Snapshot of the projected tree at publish time.
    pub data: TreeInstance,
    /// Projected offsets that changed since the previous delivered element.
    pub changed: ChangeBitmap,
    /// Offsets that changed more than once while this element waited for a
    /// free slot (intermediate values were lost).
    pub overrun: ChangeBitmap,
}

impl MonitorElement {
    /// Creates an element with cleared bitmaps.
    #[must_use]
    pub fn new(data: TreeInstance) -> Self {
        let len = data.schema().field_count();
        Self {
            data,
            changed: ChangeBitmap::new(len),
            overrun: ChangeBitmap::new(len),
        }
    }

    /// Clears both bitmaps, readying the element for reuse.
    pub fn reset(&mut self) {
        self.changed.clear_all();
        self.overrun.clear_all();
    }
}

// ---------------------------------------------------------------------------
// ElementQueue
// ---------------------------------------------------------------------------

/// Fixed-capacity free/filled bookkeeping over a set of elements.
///
/// Pure data structure: all policy (when to publish, overflow folding)
/// lives in the monitor.
#[derive(Debug)]
pub struct ElementQueue {
    slots: Vec<Option<MonitorElement>>,
    free: VecDeque<usize>,
    filled: VecDeque<usize>,
    /// Number of polled elements not yet released.
    outstanding: usize,
}

impl ElementQueue {
    /// Builds a queue owning `elements`. Every element starts free.
    ///
    /// # Panics
    ///
    /// Panics if fewer than 2 elements are supplied; a monitor cannot make
    /// progress with less (one is always the active accumulator).
    #[must_use]
    pub fn new(elements: Vec<MonitorElement>) -> Self {
        assert!(
            elements.len() >= 2,
            "element queue needs at least 2 elements, got {}",
            elements.len()
        );
        let free = (0..elements.len()).collect();
        Self {
            slots: elements.into_iter().map(Some).collect(),
            free,
            filled: VecDeque::new(),
            outstanding: 0,
        }
    }

    /// Total number of elements.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of elements currently free.
    #[must_use]
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Number of published elements awaiting poll.
    #[must_use]
    pub fn filled_len(&self) -> usize {
        self.filled.len()
    }

    /// Claims a free element, removing it from the free list.
    pub fn claim_free(&mut self) -> Option<usize> {
        self.free.pop_front()
    }

    /// Borrows the element in `slot`.
    ///
    /// # Panics
    ///
    /// Panics if the slot's element is checked out to a consumer.
    #[must_use]
    pub fn slot(&self, slot: usize) -> &MonitorElement {
        self.slots[slot]
            .as_ref()
            .unwrap_or_else(|| panic!("element {slot} is checked out"))
    }

    /// Mutably borrows the element in `slot`.
    ///
    /// # Panics
    ///
    /// Panics if the slot's element is checked out to a consumer.
    pub fn slot_mut(&mut self, slot: usize) -> &mut MonitorElement {
        self.slots[slot]
            .as_mut()
            .unwrap_or_else(|| panic!("element {slot} is checked out"))
    }

    /// Publishes a claimed element: it becomes visible to poll.
    pub fn push_filled(&mut self, slot: usize) {
        debug_assert!(self.slots[slot].is_some());
        self.filled.push_back(slot);
    }

    /// Takes the oldest filled element out of its slot for the consumer.
    pub fn poll(&mut self) -> Option<(usize, MonitorElement)> {
        let slot = self.filled.pop_front()?;
        let element = self.slots[slot]
            .take()
            .unwrap_or_else(|| panic!("filled element {slot} missing"));
        self.outstanding += 1;
        Some((slot, element))
    }

    /// Returns a polled element to the free list.
    ///
    /// # Panics
    ///
    /// Panics if nothing is checked out or the slot is still occupied —
    /// releasing an element that was never polled is a caller defect.
    pub fn release(&mut self, slot: usize, element: MonitorElement) {
        assert!(self.outstanding > 0, "release without a matching poll");
        assert!(
            self.slots[slot].is_none(),
            "element {slot} was not checked out"
        );
        self.slots[slot] = Some(element);
        self.outstanding -= 1;
        self.free.push_back(slot);
    }

    /// Returns every filled element to the free list and clears its
    /// bitmaps. Checked-out elements stay checked out; they rejoin the
    /// free list on release.
    pub fn requeue_filled(&mut self) {
        while let Some(slot) = self.filled.pop_front() {
            if let Some(element) = self.slots[slot].as_mut() {
                element.reset();
            }
            self.free.push_back(slot);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
