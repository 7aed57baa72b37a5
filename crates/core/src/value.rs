use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// One cell of a [`ResultTable`](crate::ResultTable) or a stored property row.
///
/// Equality is total: floats compare by bit pattern and `Null == Null`, so
/// scalars can key hash maps during `distinct` and `merge`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Null,
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Float(x) => Some(*x),
            Scalar::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Numbers compare numerically, strings lexically; anything else
    /// (including null) is incomparable.
    pub fn compare(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
            (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Scalar::Str(_) => 0,
            Scalar::Int(_) => 1,
            Scalar::Float(_) => 2,
            Scalar::Null => 3,
        }
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scalar::Str(a), Scalar::Str(b)) => a == b,
            (Scalar::Int(a), Scalar::Int(b)) => a == b,
            (Scalar::Float(a), Scalar::Float(b)) => a.to_bits() == b.to_bits(),
            (Scalar::Null, Scalar::Null) => true,
            _ => false,
        }
    }
}

impl Eq for Scalar {}

impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        match self {
            Scalar::Str(s) => s.hash(state),
            Scalar::Int(i) => i.hash(state),
            Scalar::Float(x) => x.to_bits().hash(state),
            Scalar::Null => {}
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}
impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}
impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}
impl From<i32> for Scalar {
    fn from(i: i32) -> Self {
        Scalar::Int(i64::from(i))
    }
}
impl From<f64> for Scalar {
    fn from(x: f64) -> Self {
        Scalar::Float(x)
    }
}
impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(v: Option<T>) -> Self {
        v.map_or(Scalar::Null, Into::into)
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Str(s) => write!(f, "{s:?}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Null => write!(f, "null"),
        }
    }
}

/// Declared type of a property column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Str,
    Int,
    Float,
    NullableInt,
    NullableFloat,
}

impl ColumnType {
    pub fn is_nullable(self) -> bool {
        matches!(self, ColumnType::NullableInt | ColumnType::NullableFloat)
    }

    /// Type-check `value` for storage in a column of this type.
    ///
    /// Integers widen to floats for float columns; nothing else converts.
    pub fn coerce(self, column: &str, value: Scalar) -> Result<Scalar> {
        let out = match (self, value) {
            (ColumnType::Str, v @ Scalar::Str(_)) => v,
            (ColumnType::Int | ColumnType::NullableInt, v @ Scalar::Int(_)) => v,
            (ColumnType::Float | ColumnType::NullableFloat, v @ Scalar::Float(_)) => v,
            (ColumnType::Float | ColumnType::NullableFloat, Scalar::Int(i)) => {
                Scalar::Float(i as f64)
            }
            (ColumnType::NullableInt | ColumnType::NullableFloat, Scalar::Null) => Scalar::Null,
            (expected, found) => {
                return Err(CatalogError::TypeMismatch {
                    column: column.to_string(),
                    expected,
                    found,
                })
            }
        };
        Ok(out)
    }

    /// Like [`coerce`](Self::coerce), but `Null` is accepted for every type.
    ///
    /// Resolved property values are null whenever no interval covers the
    /// query time, so filters must be able to ask for that.
    pub fn coerce_match(self, column: &str, value: Scalar) -> Result<Scalar> {
        match value {
            Scalar::Null => Ok(Scalar::Null),
            v => self.coerce(column, v),
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ColumnType::Str => "string",
            ColumnType::Int => "integer",
            ColumnType::Float => "float",
            ColumnType::NullableInt => "nullable integer",
            ColumnType::NullableFloat => "nullable float",
        };
        f.write_str(s)
    }
}

/// A named, typed column of a property table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}
