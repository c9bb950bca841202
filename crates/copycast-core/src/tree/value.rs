//! Values and per-offset value storage for typed trees.

use std::sync::Arc;

use super::{FieldType, ScalarType, Schema};

// ---------------------------------------------------------------------------
// Scalar / Value
// ---------------------------------------------------------------------------

/// A single scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point.
    Float(f64),
    /// UTF-8 string.
    Str(String),
}

impl Scalar {
    /// Returns the kind of this scalar.
    #[must_use]
    pub fn kind(&self) -> ScalarType {
        match self {
            Self::Bool(_) => ScalarType::Bool,
            Self::Int(_) => ScalarType::Int,
            Self::Float(_) => ScalarType::Float,
            Self::Str(_) => ScalarType::Str,
        }
    }

    /// Default value for a scalar kind.
    #[must_use]
    pub fn default_for(ty: ScalarType) -> Self {
        match ty {
            ScalarType::Bool => Self::Bool(false),
            ScalarType::Int => Self::Int(0),
            ScalarType::Float => Self::Float(0.0),
            ScalarType::Str => Self::Str(String::new()),
        }
    }

    /// Returns the value as `f64` for numeric kinds.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// The value stored at one field offset.
///
/// Container fields (structures, unions) occupy an offset but carry no
/// scalar data; a union slot stores the index of the selected alternative.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Slot of a structure field (no direct data).
    Structure,
    /// Slot of a union field: index (into the union's children) of the
    /// currently selected alternative.
    Union(usize),
    /// A scalar leaf.
    Scalar(Scalar),
    /// An array leaf.
    Array(Vec<Scalar>),
}

impl Value {
    /// Default value for a field type.
    #[must_use]
    pub fn default_for(ty: FieldType) -> Self {
        match ty {
            FieldType::Scalar(s) => Self::Scalar(Scalar::default_for(s)),
            FieldType::Array(_) => Self::Array(Vec::new()),
            FieldType::Structure => Self::Structure,
            FieldType::Union => Self::Union(0),
        }
    }

    /// Returns the scalar kind this value would satisfy, if it is a leaf.
    fn leaf_kind(&self) -> Option<(bool, ScalarType)> {
        match self {
            Self::Scalar(s) => Some((false, s.kind())),
            Self::Array(items) => items.first().map(|s| (true, s.kind())),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ValueError
// ---------------------------------------------------------------------------

/// Error from a checked value assignment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    /// The assigned value's kind does not match the field's declared type.
    #[error("type mismatch at offset {offset}: field is {field:?}, value is {value}")]
    TypeMismatch {
        /// Target field offset.
        offset: usize,
        /// The field's declared type.
        field: FieldType,
        /// A short description of the offered value.
        value: String,
    },
    /// A union selector index is out of range for its alternatives.
    #[error("union selector {selector} out of range at offset {offset} ({alternatives} alternatives)")]
    BadSelector {
        /// Union field offset.
        offset: usize,
        /// Offered selector.
        selector: usize,
        /// Number of alternatives.
        alternatives: usize,
    },
}

// ---------------------------------------------------------------------------
// TreeInstance
// ---------------------------------------------------------------------------

/// One instance of a [`Schema`]: a value per field offset.
///
/// Master records own one instance behind a lock; every monitor snapshot is
/// an independent instance of the projected schema.
#[derive(Debug, Clone)]
pub struct TreeInstance {
    schema: Arc<Schema>,
    values: Vec<Value>,
}

impl TreeInstance {
    /// Creates a default-initialized instance of `schema`.
    #[must_use]
    pub fn new(schema: Arc<Schema>) -> Self {
        let values = (0..schema.field_count())
            .map(|off| Value::default_for(schema.field(off).ty))
            .collect();
        Self { schema, values }
    }

    /// Returns the instance's schema.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Returns the value at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of range.
    #[must_use]
    pub fn get(&self, offset: usize) -> &Value {
        let _ = self.schema.field(offset); // range check with the schema's message
        &self.values[offset]
    }

    /// Type-checked assignment. Returns `Ok(true)` if the stored value
    /// changed, `Ok(false)` if the new value equals the old one.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::TypeMismatch`] if the value's kind does not
    /// match the field's declared type, or [`ValueError::BadSelector`] for
    /// an out-of-range union selector.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of range.
    pub fn set(&mut self, offset: usize, value: Value) -> Result<bool, ValueError> {
        let field = self.schema.field(offset);
        let ok = match (&field.ty, &value) {
            (FieldType::Scalar(want), Value::Scalar(s)) => s.kind() == *want,
            (FieldType::Array(want), Value::Array(items)) => {
                items.iter().all(|s| s.kind() == *want)
            }
            (FieldType::Structure, Value::Structure) => true,
            (FieldType::Union, Value::Union(sel)) => {
                if *sel >= field.children.len() {
                    return Err(ValueError::BadSelector {
                        offset,
                        selector: *sel,
                        alternatives: field.children.len(),
                    });
                }
                true
            }
            _ => false,
        };
        if !ok {
            let desc = match value.leaf_kind() {
                Some((true, k)) => format!("array of {k:?}"),
                Some((false, k)) => format!("scalar {k:?}"),
                None => format!("{value:?}"),
            };
            return Err(ValueError::TypeMismatch {
                offset,
                field: field.ty,
                value: desc,
            });
        }
        if self.values[offset] == value {
            return Ok(false);
        }
        self.values[offset] = value;
        Ok(true)
    }

    /// Copies the leaf value at `from_offset` of `source` into
    /// `into_offset` of `self` without a type check. Returns whether the
    /// stored value changed.
    ///
    /// Used by the projection engine after compile-time type validation;
    /// the two offsets are guaranteed to have identical leaf types.
    ///
    /// # Panics
    ///
    /// Panics if either offset is out of range.
    pub fn copy_leaf_from(
        &mut self,
        into_offset: usize,
        source: &TreeInstance,
        from_offset: usize,
    ) -> bool {
        let value = source.get(from_offset);
        if &self.values[into_offset] == value {
            return false;
        }
        self.values[into_offset] = value.clone();
        true
    }

    /// Returns the selected alternative index of the union at `offset`,
    /// or `None` if the field is not a union.
    #[must_use]
    pub fn selected(&self, offset: usize) -> Option<usize> {
        match self.get(offset) {
            Value::Union(sel) => Some(*sel),
            _ => None,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
