//! Typed field trees.
//!
//! The master side of every projection is a [`Schema`]: an immutable,
//! hierarchically-typed field layout (scalars, arrays, nested structures,
//! tagged unions) in which every field is addressable by a stable integer
//! offset. Offsets are assigned in pre-order, so a structure field's
//! descendants occupy the contiguous range `[offset, offset + field_count)`.
//!
//! Values live separately, in a [`TreeInstance`] ([`value`] module); the
//! shared, mutex-guarded master record with change listeners is
//! [`Record`] ([`record`] module).

mod record;
mod value;

pub use record::{ListenerId, Record, RecordListener};
pub use value::{Scalar, TreeInstance, Value, ValueError};

use std::sync::Arc;

// ---------------------------------------------------------------------------
// Field types
// ---------------------------------------------------------------------------

/// Scalar value kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// 64-bit floating point.
    Float,
    /// UTF-8 string.
    Str,
}

/// Type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// A single scalar value.
    Scalar(ScalarType),
    /// A variable-length array of scalars of one kind.
    Array(ScalarType),
    /// An ordered collection of named sub-fields.
    Structure,
    /// A tagged union: named alternatives, exactly one selected at a time.
    Union,
}

impl FieldType {
    /// Returns `true` for field types that carry a value directly
    /// (scalars and arrays), as opposed to container fields.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Scalar(_) | Self::Array(_))
    }
}

// ---------------------------------------------------------------------------
// FieldDef
// ---------------------------------------------------------------------------

/// One field of a [`Schema`].
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Field name within its parent (the root's name is the record type name).
    pub name: String,
    /// Field type.
    pub ty: FieldType,
    /// This field's offset (equals its index in the schema's field table).
    pub offset: usize,
    /// Number of offsets covered by this field including itself;
    /// 1 for leaves, `1 + descendants` for containers.
    pub field_count: usize,
    /// Offset of the enclosing container, `None` for the root.
    pub parent: Option<usize>,
    /// Offsets of direct children, in declaration order.
    pub children: Vec<usize>,
}

impl FieldDef {
    /// The offset range covered by this field and its descendants.
    #[must_use]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.field_count
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Immutable typed field hierarchy with pre-order offset addressing.
///
/// Built once via [`SchemaBuilder`], then shared (`Arc`) between the master
/// record and every projection compiled against it. Offset 0 is always the
/// root structure.
#[derive(Debug)]
pub struct Schema {
    fields: Vec<FieldDef>,
}

impl Schema {
    /// Builds a schema from an already-flattened pre-order field table.
    ///
    /// Used by the projection compiler to assemble projected schemas.
    /// Debug-asserts the pre-order invariants.
    pub(crate) fn from_fields(fields: Vec<FieldDef>) -> Arc<Self> {
        debug_assert!(fields.iter().enumerate().all(|(i, f)| f.offset == i));
        Arc::new(Self { fields })
    }

    /// Returns the field at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of range — addressing a field outside the
    /// schema is a caller defect, not a recoverable condition.
    #[must_use]
    pub fn field(&self, offset: usize) -> &FieldDef {
        assert!(
            offset < self.fields.len(),
            "field offset {offset} out of range {}",
            self.fields.len()
        );
        &self.fields[offset]
    }

    /// Total number of field offsets (root included).
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Looks up a direct child of `parent` by name.
    #[must_use]
    pub fn child_by_name(&self, parent: usize, name: &str) -> Option<usize> {
        self.field(parent)
            .children
            .iter()
            .copied()
            .find(|&c| self.fields[c].name == name)
    }

    /// Resolves a dotted path (e.g. `"alarm.severity"`) from the root.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<usize> {
        let mut offset = 0;
        for part in path.split('.') {
            offset = self.child_by_name(offset, part)?;
        }
        Some(offset)
    }

    /// Returns `true` if the field at `offset` is a value-carrying leaf.
    #[must_use]
    pub fn is_leaf(&self, offset: usize) -> bool {
        self.field(offset).ty.is_leaf()
    }
}

// ---------------------------------------------------------------------------
// SchemaBuilder
// ---------------------------------------------------------------------------

/// Builder for [`Schema`]. Fields appear in declaration order.
///
/// ```
/// use copycast_core::tree::{ScalarType, SchemaBuilder};
///
/// let schema = SchemaBuilder::new("exampleRecord")
///     .scalar("value", ScalarType::Float)
///     .structure("alarm", |b| {
///         b.scalar("severity", ScalarType::Int)
///             .scalar("message", ScalarType::Str)
///     })
///     .build();
/// assert_eq!(schema.lookup("alarm.severity"), Some(3));
/// ```
pub struct SchemaBuilder {
    node: BuilderNode,
}

struct BuilderNode {
    name: String,
    ty: FieldType,
    children: Vec<BuilderNode>,
}

impl SchemaBuilder {
    /// Starts a schema whose root structure is named `type_name`.
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            node: BuilderNode {
                name: type_name.into(),
                ty: FieldType::Structure,
                children: Vec::new(),
            },
        }
    }

    /// Adds a scalar field.
    #[must_use]
    pub fn scalar(mut self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.node.children.push(BuilderNode {
            name: name.into(),
            ty: FieldType::Scalar(ty),
            children: Vec::new(),
        });
        self
    }

    /// Adds an array field.
    #[must_use]
    pub fn array(mut self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.node.children.push(BuilderNode {
            name: name.into(),
            ty: FieldType::Array(ty),
            children: Vec::new(),
        });
        self
    }

    /// Adds a nested structure field, populated by `f`.
    #[must_use]
    pub fn structure(mut self, name: impl Into<String>, f: impl FnOnce(Self) -> Self) -> Self {
        let sub = f(Self {
            node: BuilderNode {
                name: name.into(),
                ty: FieldType::Structure,
                children: Vec::new(),
            },
        });
        self.node.children.push(sub.node);
        self
    }

    /// Adds a tagged-union field whose alternatives are populated by `f`.
    ///
    /// The first alternative is selected by default in new instances.
    #[must_use]
    pub fn union(mut self, name: impl Into<String>, f: impl FnOnce(Self) -> Self) -> Self {
        let sub = f(Self {
            node: BuilderNode {
                name: name.into(),
                ty: FieldType::Union,
                children: Vec::new(),
            },
        });
        self.node.children.push(sub.node);
        self
    }

    /// Adds the conventional `alarm {severity, status, message}` structure.
    #[must_use]
    pub fn alarm(self) -> Self {
        self.structure("alarm", |b| {
            b.scalar("severity", ScalarType::Int)
                .scalar("status", ScalarType::Int)
                .scalar("message", ScalarType::Str)
        })
    }

    /// Adds the conventional `timeStamp {secondsPastEpoch, nanoseconds}`
    /// structure.
    #[must_use]
    pub fn time_stamp(self) -> Self {
        self.structure("timeStamp", |b| {
            b.scalar("secondsPastEpoch", ScalarType::Int)
                .scalar("nanoseconds", ScalarType::Int)
        })
    }

    /// Finalizes the schema, assigning pre-order offsets.
    #[must_use]
    pub fn build(self) -> Arc<Schema> {
        let mut fields = Vec::new();
        flatten(&self.node, None, &mut fields);
        Arc::new(Schema { fields })
    }
}

/// Pre-order flattening; returns the flattened field's `field_count`.
fn flatten(node: &BuilderNode, parent: Option<usize>, out: &mut Vec<FieldDef>) -> usize {
    let offset = out.len();
    out.push(FieldDef {
        name: node.name.clone(),
        ty: node.ty,
        offset,
        field_count: 1,
        parent,
        children: Vec::new(),
    });
    let mut count = 1;
    for child in &node.children {
        let child_offset = out.len();
        out[offset].children.push(child_offset);
        count += flatten(child, Some(offset), out);
    }
    out[offset].field_count = count;
    count
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn example_schema() -> Arc<Schema> {
        SchemaBuilder::new("exampleRecord")
            .scalar("value", ScalarType::Float)
            .alarm()
            .time_stamp()
            .array("waveform", ScalarType::Float)
            .build()
    }

    // -- offset assignment --

    #[test]
    fn test_schema_preorder_offsets() {
        let schema = example_schema();
        // root=0, value=1, alarm=2..=5, timeStamp=6..=8, waveform=9
        assert_eq!(schema.field_count(), 10);
        assert_eq!(schema.lookup("value"), Some(1));
        assert_eq!(schema.lookup("alarm"), Some(2));
        assert_eq!(schema.lookup("alarm.severity"), Some(3));
        assert_eq!(schema.lookup("alarm.status"), Some(4));
        assert_eq!(schema.lookup("alarm.message"), Some(5));
        assert_eq!(schema.lookup("timeStamp"), Some(6));
        assert_eq!(schema.lookup("timeStamp.secondsPastEpoch"), Some(7));
        assert_eq!(schema.lookup("waveform"), Some(9));
        assert_eq!(schema.lookup("nope"), None);
        assert_eq!(schema.lookup("alarm.nope"), None);
    }

    #[test]
    fn test_schema_field_count_ranges() {
        let schema = example_schema();
        assert_eq!(schema.field(0).range(), 0..10);
        assert_eq!(schema.field(2).range(), 2..6); // alarm covers itself + 3
        assert_eq!(schema.field(6).range(), 6..9);
        assert_eq!(schema.field(1).range(), 1..2); // leaf
    }

    #[test]
    fn test_schema_parent_links() {
        let schema = example_schema();
        assert_eq!(schema.field(0).parent, None);
        assert_eq!(schema.field(1).parent, Some(0));
        assert_eq!(schema.field(3).parent, Some(2));
        assert_eq!(schema.field(7).parent, Some(6));
    }

    #[test]
    fn test_schema_leaf_classification() {
        let schema = example_schema();
        assert!(schema.is_leaf(1));
        assert!(!schema.is_leaf(2));
        assert!(schema.is_leaf(9)); // arrays are leaves
        assert!(!schema.is_leaf(0));
    }

    // -- unions --

    #[test]
    fn test_schema_union_children() {
        let schema = SchemaBuilder::new("rec")
            .union("u", |b| {
                b.scalar("asInt", ScalarType::Int)
                    .scalar("asFloat", ScalarType::Float)
            })
            .build();
        let u = schema.lookup("u").unwrap();
        assert_eq!(schema.field(u).ty, FieldType::Union);
        assert_eq!(schema.field(u).children.len(), 2);
        assert_eq!(schema.lookup("u.asInt"), Some(u + 1));
        assert_eq!(schema.lookup("u.asFloat"), Some(u + 2));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_schema_bad_offset_panics() {
        let schema = example_schema();
        let _ = schema.field(10);
    }
}
