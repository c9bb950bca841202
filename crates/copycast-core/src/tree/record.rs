//! The master record: a locked tree instance with change listeners.
//!
//! One mutex guards the record's values so a concurrent writer can never be
//! observed half-applied (the projection passes run under this lock too).
//! Listener callbacks are collected under the lock but delivered after it is
//! released, so a listener may freely re-enter the record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::{Schema, TreeInstance, Value, ValueError};

// ---------------------------------------------------------------------------
// RecordListener
// ---------------------------------------------------------------------------

/// Callback interface for observers of a [`Record`].
///
/// Delivered outside the record lock. A group put brackets a series of
/// field writes that should be coalesced into one delta by monitors.
pub trait RecordListener: Send + Sync {
    /// One field of the record was written (and its stored value changed).
    fn on_field_changed(&self, offset: usize);
    /// A group put started; notifications until the matching end should be
    /// coalesced.
    fn on_group_put_begin(&self) {}
    /// The group put ended.
    fn on_group_put_end(&self) {}
}

/// Handle identifying a registered listener, for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A shared master record: one [`TreeInstance`] behind a mutex plus a
/// listener registry.
pub struct Record {
    name: String,
    data: Mutex<TreeInstance>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn RecordListener>)>>,
    next_listener_id: AtomicU64,
}

impl Record {
    /// Creates a record with default-initialized values.
    #[must_use]
    pub fn new(name: impl Into<String>, schema: Arc<Schema>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            data: Mutex::new(TreeInstance::new(schema)),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// The record's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The record's schema.
    #[must_use]
    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(self.data.lock().schema())
    }

    /// Locks the record's values for a compound read/modify sequence.
    ///
    /// Writes made through the guard bypass change notification; use
    /// [`Record::write`] / [`Record::write_many`] when monitors must see
    /// the change.
    pub fn lock(&self) -> MutexGuard<'_, TreeInstance> {
        self.data.lock()
    }

    /// Locks two records in a stable total order (by allocation address),
    /// preventing lock-order inversion when moving values between records.
    ///
    /// Returns the guards in argument order regardless of lock order.
    pub fn lock_pair<'a>(
        a: &'a Self,
        b: &'a Self,
    ) -> (MutexGuard<'a, TreeInstance>, MutexGuard<'a, TreeInstance>) {
        if std::ptr::from_ref(a) <= std::ptr::from_ref(b) {
            let ga = a.data.lock();
            let gb = b.data.lock();
            (ga, gb)
        } else {
            let gb = b.data.lock();
            let ga = a.data.lock();
            (ga, gb)
        }
    }

    /// Returns a clone of the value at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of range.
    #[must_use]
    pub fn read(&self, offset: usize) -> Value {
        self.data.lock().get(offset).clone()
    }

    /// Writes one field, notifying listeners if the stored value changed.
    ///
    /// # Errors
    ///
    /// Returns a [`ValueError`] if the value does not fit the field type;
    /// the record is left unmodified.
    pub fn write(&self, offset: usize, value: Value) -> Result<(), ValueError> {
        let changed = self.data.lock().set(offset, value)?;
        if changed {
            for listener in self.snapshot_listeners() {
                listener.on_field_changed(offset);
            }
        }
        Ok(())
    }

    /// Writes several fields under a single lock hold (the `atomic` put),
    /// then notifies listeners of every changed offset.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValueError`] encountered. Fields written before
    /// the failing one remain applied; their notifications are still
    /// delivered.
    pub fn write_many(&self, puts: Vec<(usize, Value)>) -> Result<(), ValueError> {
        let mut changed = Vec::new();
        let result = {
            let mut data = self.data.lock();
            let mut result = Ok(());
            for (offset, value) in puts {
                match data.set(offset, value) {
                    Ok(true) => changed.push(offset),
                    Ok(false) => {}
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            result
        };
        let listeners = self.snapshot_listeners();
        for listener in &listeners {
            for &offset in &changed {
                listener.on_field_changed(offset);
            }
        }
        result
    }

    /// Marks the start of a group put; monitors defer publication until the
    /// matching [`Record::end_group_put`].
    pub fn begin_group_put(&self) {
        for listener in self.snapshot_listeners() {
            listener.on_group_put_begin();
        }
    }

    /// Marks the end of a group put.
    pub fn end_group_put(&self) {
        for listener in self.snapshot_listeners() {
            listener.on_group_put_end();
        }
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn RecordListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    /// Removes a listener. Removing an unknown id is a no-op (the listener
    /// may have raced a teardown).
    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn RecordListener>> {
        self.listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("name", &self.name)
            .field("listeners", &self.listeners.lock().len())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Scalar, ScalarType, SchemaBuilder};
    use parking_lot::Mutex as PlMutex;

    fn test_record() -> Arc<Record> {
        let schema = SchemaBuilder::new("rec")
            .scalar("value", ScalarType::Float)
            .alarm()
            .build();
        Record::new("rec01", schema)
    }

    #[derive(Default)]
    struct Recording {
        events: PlMutex<Vec<String>>,
    }

    impl RecordListener for Recording {
        fn on_field_changed(&self, offset: usize) {
            self.events.lock().push(format!("changed:{offset}"));
        }
        fn on_group_put_begin(&self) {
            self.events.lock().push("begin".into());
        }
        fn on_group_put_end(&self) {
            self.events.lock().push("end".into());
        }
    }

    // -- write / notify --

    #[test]
    fn test_record_write_notifies_on_change() {
        let record = test_record();
        let listener = Arc::new(Recording::default());
        record.add_listener(listener.clone());

        record.write(1, Value::Scalar(Scalar::Float(1.0))).unwrap();
        // unchanged write: no notification
        record.write(1, Value::Scalar(Scalar::Float(1.0))).unwrap();
        record.write(1, Value::Scalar(Scalar::Float(2.0))).unwrap();

        assert_eq!(
            *listener.events.lock(),
            vec!["changed:1".to_string(), "changed:1".to_string()]
        );
    }

    #[test]
    fn test_record_write_type_error_leaves_value() {
        let record = test_record();
        record.write(1, Value::Scalar(Scalar::Float(3.0))).unwrap();
        let err = record.write(1, Value::Scalar(Scalar::Str("x".into())));
        assert!(err.is_err());
        assert_eq!(record.read(1), Value::Scalar(Scalar::Float(3.0)));
    }

    #[test]
    fn test_record_write_many_single_lock() {
        let record = test_record();
        let listener = Arc::new(Recording::default());
        record.add_listener(listener.clone());

        record
            .write_many(vec![
                (1, Value::Scalar(Scalar::Float(1.0))),
                (3, Value::Scalar(Scalar::Int(2))),
            ])
            .unwrap();
        assert_eq!(
            *listener.events.lock(),
            vec!["changed:1".to_string(), "changed:3".to_string()]
        );
    }

    // -- listeners --

    #[test]
    fn test_record_remove_listener() {
        let record = test_record();
        let listener = Arc::new(Recording::default());
        let id = record.add_listener(listener.clone());
        record.remove_listener(id);

        record.write(1, Value::Scalar(Scalar::Float(1.0))).unwrap();
        assert!(listener.events.lock().is_empty());

        // removing again is a no-op
        record.remove_listener(id);
    }

    #[test]
    fn test_record_group_put_callbacks() {
        let record = test_record();
        let listener = Arc::new(Recording::default());
        record.add_listener(listener.clone());

        record.begin_group_put();
        record.write(1, Value::Scalar(Scalar::Float(1.0))).unwrap();
        record.end_group_put();

        assert_eq!(
            *listener.events.lock(),
            vec!["begin".to_string(), "changed:1".to_string(), "end".to_string()]
        );
    }

    // -- locking --

    #[test]
    fn test_record_lock_pair_either_order() {
        let a = test_record();
        let b = test_record();
        {
            let (mut ga, _gb) = Record::lock_pair(&a, &b);
            ga.set(1, Value::Scalar(Scalar::Float(9.0))).unwrap();
        }
        {
            let (_gb, ga) = Record::lock_pair(&b, &a);
            assert_eq!(ga.get(1), &Value::Scalar(Scalar::Float(9.0)));
        }
    }

    #[test]
    fn test_record_concurrent_writes() {
        let record = test_record();
        let mut handles = Vec::new();
        for t in 0..4i64 {
            let record = Arc::clone(&record);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    record
                        .write(3, Value::Scalar(Scalar::Int(t * 1000 + i)))
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // last write wins; value is one of the written ones
        match record.read(3) {
            Value::Scalar(Scalar::Int(v)) => assert!((0..4000).contains(&v)),
            other => panic!("unexpected value {other:?}"),
        }
    }
}
