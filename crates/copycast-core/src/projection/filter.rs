//! Per-field value filters.
//!
//! A filter is attached to a leaf copy node at compile time and runs during
//! the synchronization passes. Returning `true` means the filter handled
//! the field and the engine's default copy is suppressed for it in that
//! direction.
//!
//! The set is a closed enum dispatched by match; only [`FieldFilter::Custom`]
//! goes through dynamic dispatch, and the [`FilterRegistry`] stays open for
//! exactly that case.

use std::time::{SystemTime, UNIX_EPOCH};

use fxhash::FxHashMap;
use tracing::warn;

use crate::bitset::ChangeBitmap;
use crate::request::{ArrayRange, Deadband};
use crate::tree::{Scalar, TreeInstance, Value};

// ---------------------------------------------------------------------------
// FilterNode — the slice of compile-time state a filter sees
// ---------------------------------------------------------------------------

/// Address information of the leaf node a filter is attached to.
#[derive(Debug, Clone, Copy)]
pub struct FilterNode {
    /// The node's offset in the projected tree.
    pub copy_offset: usize,
    /// The mirrored field's offset in the master tree.
    pub master_offset: usize,
    /// Number of offsets covered (identical on both sides for a leaf).
    pub field_count: usize,
}

// ---------------------------------------------------------------------------
// CustomFilter
// ---------------------------------------------------------------------------

/// Extension seam for filters outside the built-in set.
///
/// Instances are created by a [`FilterRegistry`] factory at compile time,
/// one per decorated node, and owned by that node.
pub trait CustomFilter: Send + std::fmt::Debug {
    /// Master→copy direction. Return `true` to suppress the default copy.
    fn to_copy(
        &mut self,
        node: FilterNode,
        copy: &mut TreeInstance,
        master: &TreeInstance,
        bitmap: &mut ChangeBitmap,
    ) -> bool;

    /// Copy→master direction. Return `true` to suppress the default copy.
    fn to_master(
        &mut self,
        node: FilterNode,
        copy: &TreeInstance,
        master: &mut TreeInstance,
        bitmap: &mut ChangeBitmap,
    ) -> bool;
}

// ---------------------------------------------------------------------------
// FilterRegistry
// ---------------------------------------------------------------------------

/// Factory map for [`CustomFilter`]s, keyed by option name.
///
/// Passed into compile explicitly — there is no process-wide registry.
pub type FilterFactory =
    Box<dyn Fn(&str) -> Option<Box<dyn CustomFilter>> + Send + Sync>;

/// Registry of custom filter factories consulted for request options that
/// are not in the reserved set.
#[derive(Default)]
pub struct FilterRegistry {
    factories: FxHashMap<String, FilterFactory>,
}

impl FilterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for option `name`. The factory receives the
    /// option's value and may decline by returning `None`.
    pub fn register(&mut self, name: impl Into<String>, factory: FilterFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Instantiates a custom filter for `name=value`, if registered.
    #[must_use]
    pub fn create(&self, name: &str, value: &str) -> Option<Box<dyn CustomFilter>> {
        self.factories.get(name).and_then(|f| f(value))
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FieldFilter
// ---------------------------------------------------------------------------

/// A value filter attached to one leaf copy node.
#[derive(Debug)]
pub enum FieldFilter {
    /// Suppresses master→copy updates whose numeric change since the last
    /// *reported* value is below a threshold.
    DeadbandFilter {
        /// Threshold mode and magnitude.
        mode: Deadband,
        /// Last value actually reported through this filter.
        last: f64,
        /// Whether a value has been reported yet.
        primed: bool,
    },
    /// Replaces the copied value with current wall-clock time.
    TimestampOverride,
    /// Copies a strided sub-range of a master array.
    ArraySlice(ArrayRange),
    /// A registry-created extension filter.
    Custom(Box<dyn CustomFilter>),
}

impl FieldFilter {
    /// Creates a deadband filter.
    #[must_use]
    pub fn deadband(mode: Deadband) -> Self {
        Self::DeadbandFilter {
            mode,
            last: 0.0,
            primed: false,
        }
    }

    /// Runs the filter in the master→copy direction.
    pub fn to_copy(
        &mut self,
        node: FilterNode,
        copy: &mut TreeInstance,
        master: &TreeInstance,
        bitmap: &mut ChangeBitmap,
    ) -> bool {
        match self {
            Self::DeadbandFilter { mode, last, primed } => {
                deadband_to_copy(*mode, last, primed, node, master)
            }
            Self::TimestampOverride => timestamp_to_copy(node, copy, bitmap),
            Self::ArraySlice(range) => slice_to_copy(*range, node, copy, master, bitmap),
            Self::Custom(custom) => custom.to_copy(node, copy, master, bitmap),
        }
    }

    /// Runs the filter in the copy→master direction.
    pub fn to_master(
        &mut self,
        node: FilterNode,
        copy: &TreeInstance,
        master: &mut TreeInstance,
        bitmap: &mut ChangeBitmap,
    ) -> bool {
        match self {
            // Deadband only gates notification toward the copy; a put
            // through the projection always lands on the master.
            Self::DeadbandFilter { .. } => false,
            // Timestamps are injected, never written back.
            Self::TimestampOverride => true,
            Self::ArraySlice(_) => {
                // A strided slice has no faithful inverse write.
                warn!(
                    copy_offset = node.copy_offset,
                    "put through an array-sliced projection is suppressed"
                );
                true
            }
            Self::Custom(custom) => custom.to_master(node, copy, master, bitmap),
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in filter bodies
// ---------------------------------------------------------------------------

fn deadband_to_copy(
    mode: Deadband,
    last: &mut f64,
    primed: &mut bool,
    node: FilterNode,
    master: &TreeInstance,
) -> bool {
    let Value::Scalar(scalar) = master.get(node.master_offset) else {
        return false;
    };
    let Some(v) = scalar.as_f64() else {
        return false;
    };
    if *primed {
        let threshold = match mode {
            Deadband::Abs(t) => t,
            Deadband::Rel(t) => t * last.abs(),
        };
        if (v - *last).abs() < threshold {
            // below threshold: handled, default copy suppressed
            return true;
        }
    }
    *last = v;
    *primed = true;
    false
}

fn timestamp_to_copy(
    node: FilterNode,
    copy: &mut TreeInstance,
    bitmap: &mut ChangeBitmap,
) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    #[allow(clippy::cast_possible_wrap)]
    let secs = now.as_secs() as i64;
    let nanos = i64::from(now.subsec_nanos());

    let schema = copy.schema().clone();
    let field = schema.field(node.copy_offset);
    if field.ty.is_leaf() {
        // scalar target: seconds past epoch
        if copy
            .set(node.copy_offset, Value::Scalar(Scalar::Int(secs)))
            .unwrap_or(false)
        {
            bitmap.set(node.copy_offset);
        }
        return true;
    }
    // conventional timeStamp structure target
    for (name, v) in [("secondsPastEpoch", secs), ("nanoseconds", nanos)] {
        if let Some(child) = schema.child_by_name(node.copy_offset, name) {
            if copy
                .set(child, Value::Scalar(Scalar::Int(v)))
                .unwrap_or(false)
            {
                bitmap.set(child);
            }
        }
    }
    true
}

fn slice_to_copy(
    range: ArrayRange,
    node: FilterNode,
    copy: &mut TreeInstance,
    master: &TreeInstance,
    bitmap: &mut ChangeBitmap,
) -> bool {
    let Value::Array(items) = master.get(node.master_offset) else {
        return false;
    };
    let sliced: Vec<Scalar> = items
        .iter()
        .skip(range.start)
        .step_by(range.incr)
        .cloned()
        .collect();
    if copy
        .set(node.copy_offset, Value::Array(sliced))
        .unwrap_or(false)
    {
        bitmap.set(node.copy_offset);
    }
    true
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{ScalarType, SchemaBuilder, TreeInstance};

    fn master_and_copy() -> (TreeInstance, TreeInstance) {
        let schema = SchemaBuilder::new("rec")
            .scalar("value", ScalarType::Float)
            .array("data", ScalarType::Int)
            .time_stamp()
            .build();
        (TreeInstance::new(schema.clone()), TreeInstance::new(schema))
    }

    fn node(offset: usize) -> FilterNode {
        FilterNode {
            copy_offset: offset,
            master_offset: offset,
            field_count: 1,
        }
    }

    // -- deadband --

    #[test]
    fn test_deadband_abs_thresholding() {
        let (mut master, mut copy) = master_and_copy();
        let mut bm = ChangeBitmap::new(master.schema().field_count());
        let mut f = FieldFilter::deadband(Deadband::Abs(1.0));

        // first value always reported (primes the filter)
        master.set(1, Value::Scalar(Scalar::Float(5.0))).unwrap();
        assert!(!f.to_copy(node(1), &mut copy, &master, &mut bm));

        // below threshold: suppressed
        master.set(1, Value::Scalar(Scalar::Float(5.1))).unwrap();
        assert!(f.to_copy(node(1), &mut copy, &master, &mut bm));

        // cumulative drift past the threshold: reported
        master.set(1, Value::Scalar(Scalar::Float(6.1))).unwrap();
        assert!(!f.to_copy(node(1), &mut copy, &master, &mut bm));
    }

    #[test]
    fn test_deadband_rel_thresholding() {
        let (mut master, mut copy) = master_and_copy();
        let mut bm = ChangeBitmap::new(master.schema().field_count());
        let mut f = FieldFilter::deadband(Deadband::Rel(0.1));

        master.set(1, Value::Scalar(Scalar::Float(100.0))).unwrap();
        assert!(!f.to_copy(node(1), &mut copy, &master, &mut bm));

        // 5% change of 100: suppressed at rel:0.1
        master.set(1, Value::Scalar(Scalar::Float(105.0))).unwrap();
        assert!(f.to_copy(node(1), &mut copy, &master, &mut bm));

        // 15% change: reported
        master.set(1, Value::Scalar(Scalar::Float(115.0))).unwrap();
        assert!(!f.to_copy(node(1), &mut copy, &master, &mut bm));
    }

    #[test]
    fn test_deadband_put_direction_passes_through() {
        let (mut master, copy) = master_and_copy();
        let mut bm = ChangeBitmap::new(copy.schema().field_count());
        let mut f = FieldFilter::deadband(Deadband::Abs(10.0));
        assert!(!f.to_master(node(1), &copy, &mut master, &mut bm));
    }

    // -- timestamp override --

    #[test]
    fn test_timestamp_override_structure_target() {
        let (master, mut copy) = master_and_copy();
        let mut bm = ChangeBitmap::new(copy.schema().field_count());
        let ts = copy.schema().lookup("timeStamp").unwrap();
        let secs = copy.schema().lookup("timeStamp.secondsPastEpoch").unwrap();

        let mut f = FieldFilter::TimestampOverride;
        assert!(f.to_copy(
            FilterNode {
                copy_offset: ts,
                master_offset: ts,
                field_count: 3
            },
            &mut copy,
            &master,
            &mut bm
        ));
        assert!(bm.get(secs));
        match copy.get(secs) {
            Value::Scalar(Scalar::Int(s)) => assert!(*s > 1_600_000_000),
            other => panic!("unexpected {other:?}"),
        }
    }

    // -- array slice --

    #[test]
    fn test_array_slice_strided_copy() {
        let (mut master, mut copy) = master_and_copy();
        let mut bm = ChangeBitmap::new(copy.schema().field_count());
        let data = master.schema().lookup("data").unwrap();
        master
            .set(
                data,
                Value::Array((0..10).map(Scalar::Int).collect()),
            )
            .unwrap();

        let mut f = FieldFilter::ArraySlice(ArrayRange { start: 1, incr: 3 });
        assert!(f.to_copy(node(data), &mut copy, &master, &mut bm));
        assert_eq!(
            copy.get(data),
            &Value::Array(vec![Scalar::Int(1), Scalar::Int(4), Scalar::Int(7)])
        );
        assert!(bm.get(data));

        // unchanged slice: no new bit
        bm.clear_all();
        assert!(f.to_copy(node(data), &mut copy, &master, &mut bm));
        assert!(!bm.get(data));
    }

    #[test]
    fn test_array_slice_suppresses_put() {
        let (mut master, copy) = master_and_copy();
        let mut bm = ChangeBitmap::new(copy.schema().field_count());
        let data = copy.schema().lookup("data").unwrap();
        let mut f = FieldFilter::ArraySlice(ArrayRange { start: 0, incr: 2 });
        assert!(f.to_master(node(data), &copy, &mut master, &mut bm));
    }

    // -- registry --

    #[derive(Debug)]
    struct Negate;

    impl CustomFilter for Negate {
        fn to_copy(
            &mut self,
            node: FilterNode,
            copy: &mut TreeInstance,
            master: &TreeInstance,
            bitmap: &mut ChangeBitmap,
        ) -> bool {
            if let Value::Scalar(Scalar::Float(v)) = master.get(node.master_offset) {
                let negated = Value::Scalar(Scalar::Float(-v));
                if copy.set(node.copy_offset, negated).unwrap_or(false) {
                    bitmap.set(node.copy_offset);
                }
            }
            true
        }

        fn to_master(
            &mut self,
            _node: FilterNode,
            _copy: &TreeInstance,
            _master: &mut TreeInstance,
            _bitmap: &mut ChangeBitmap,
        ) -> bool {
            false
        }
    }

    #[test]
    fn test_registry_creates_custom_filter() {
        let mut registry = FilterRegistry::new();
        registry.register("negate", Box::new(|_value| Some(Box::new(Negate))));
        assert!(registry.create("negate", "x").is_some());
        assert!(registry.create("unknown", "x").is_none());

        let (mut master, mut copy) = master_and_copy();
        let mut bm = ChangeBitmap::new(copy.schema().field_count());
        master.set(1, Value::Scalar(Scalar::Float(2.0))).unwrap();

        let mut f = FieldFilter::Custom(registry.create("negate", "").unwrap());
        assert!(f.to_copy(node(1), &mut copy, &master, &mut bm));
        assert_eq!(copy.get(1), &Value::Scalar(Scalar::Float(-2.0)));
        assert!(bm.get(1));
    }
}
