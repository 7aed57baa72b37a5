//! The tabular value produced by every catalog query.
//!
//! A [`ResultTable`] is an ordered list of rows aligned to an ordered list of
//! column names (`keys`). Operations never mutate their input; each returns
//! a fresh table, so results can be fed back into later queries.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};
use crate::value::{ColumnType, Scalar};

/// One row, aligned to the owning table's keys.
pub type Row = Vec<Scalar>;

/// Keys must be distinct. Each key may carry the declared [`ColumnType`] of
/// the property it came from; untyped keys are inferred from their values by
/// [`as_structured`](Self::as_structured). Equality compares keys and rows
/// only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "RawResultTable")]
pub struct ResultTable {
    keys: Vec<String>,
    #[serde(skip_serializing_if = "all_untyped")]
    types: Vec<Option<ColumnType>>,
    rows: Vec<Row>,
}

fn all_untyped(types: &[Option<ColumnType>]) -> bool {
    types.iter().all(Option::is_none)
}

/// Wire form of a [`ResultTable`], checked by `TryFrom` before use.
#[derive(Deserialize)]
struct RawResultTable {
    keys: Vec<String>,
    #[serde(default)]
    types: Option<Vec<Option<ColumnType>>>,
    rows: Vec<Row>,
}

impl TryFrom<RawResultTable> for ResultTable {
    type Error = CatalogError;

    fn try_from(raw: RawResultTable) -> Result<Self> {
        let mut table = Self::from_rows(raw.keys, raw.rows)?;
        if let Some(types) = raw.types {
            if types.len() != table.keys.len() {
                return Err(CatalogError::Schema(format!(
                    "{} column types for {} keys",
                    types.len(),
                    table.keys.len()
                )));
            }
            table.types = types;
        }
        Ok(table)
    }
}

impl PartialEq for ResultTable {
    fn eq(&self, other: &Self) -> bool {
        self.keys == other.keys && self.rows == other.rows
    }
}

impl Eq for ResultTable {}

fn check_distinct(keys: &[String]) -> Result<()> {
    let mut seen = HashSet::with_capacity(keys.len());
    for k in keys {
        if !seen.insert(k.as_str()) {
            return Err(CatalogError::DuplicateColumn(k.clone()));
        }
    }
    Ok(())
}

impl ResultTable {
    /// An empty table with the given untyped columns. Keys are not checked
    /// for duplicates; use [`from_rows`](Self::from_rows) for untrusted keys.
    pub fn new<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        Self {
            types: vec![None; keys.len()],
            keys,
            rows: Vec::new(),
        }
    }

    /// An empty table whose columns carry declared types.
    pub fn typed<I, K>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, Option<ColumnType>)>,
        K: Into<String>,
    {
        let (keys, types): (Vec<String>, Vec<_>) = columns
            .into_iter()
            .map(|(k, ty)| (k.into(), ty))
            .unzip();
        check_distinct(&keys)?;
        Ok(Self {
            keys,
            types,
            rows: Vec::new(),
        })
    }

    /// Build a table from raw rows, checking key uniqueness and every
    /// row's arity.
    pub fn from_rows<I, K>(keys: I, rows: Vec<Row>) -> Result<Self>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let mut table = Self::new(keys);
        check_distinct(&table.keys)?;
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Declared type of `key`, if it has one.
    pub fn column_type(&self, key: &str) -> Result<Option<ColumnType>> {
        Ok(self.types[self.key_index(key)?])
    }

    pub fn set_column_type(&mut self, key: &str, ty: Option<ColumnType>) -> Result<()> {
        let i = self.key_index(key)?;
        self.types[i] = ty;
        Ok(())
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    /// Position of `key` in [`keys`](Self::keys).
    pub fn key_index(&self, key: &str) -> Result<usize> {
        self.keys
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| CatalogError::UnknownColumn(key.to_string()))
    }

    pub fn push_row(&mut self, row: Row) -> Result<()> {
        if row.len() != self.keys.len() {
            return Err(CatalogError::RowArity {
                expected: self.keys.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Append a row given as a key→value mapping. Every key of the table
    /// must be present; extra entries are ignored.
    pub fn push_record(&mut self, record: &IndexMap<String, Scalar>) -> Result<()> {
        let row = self
            .keys
            .iter()
            .map(|k| {
                record
                    .get(k)
                    .cloned()
                    .ok_or_else(|| CatalogError::UnknownColumn(k.clone()))
            })
            .collect::<Result<Row>>()?;
        self.rows.push(row);
        Ok(())
    }

    /// Append all rows of `other`, whose keys must match exactly. Columns
    /// untyped here take the type `other` declares.
    pub fn extend(&mut self, other: ResultTable) -> Result<()> {
        if self.keys != other.keys {
            return Err(CatalogError::Schema(format!(
                "cannot extend [{}] with [{}]",
                self.keys.join(","),
                other.keys.join(",")
            )));
        }
        for (mine, theirs) in self.types.iter_mut().zip(other.types) {
            if mine.is_none() {
                *mine = theirs;
            }
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    /// Concatenate tables sharing the same keys, in order.
    pub fn concat(tables: impl IntoIterator<Item = ResultTable>) -> Result<Self> {
        let mut iter = tables.into_iter();
        let Some(mut out) = iter.next() else {
            return Ok(Self::default());
        };
        for t in iter {
            out.extend(t)?;
        }
        Ok(out)
    }

    /// Row `index` as an ordered key→value mapping.
    pub fn row(&self, index: usize) -> Result<IndexMap<String, Scalar>> {
        let row = self
            .rows
            .get(index)
            .ok_or(CatalogError::IndexOutOfRange {
                index,
                len: self.rows.len(),
            })?;
        Ok(self.keys.iter().cloned().zip(row.iter().cloned()).collect())
    }

    /// All values of one column, in row order.
    pub fn column(&self, key: &str) -> Result<Vec<&Scalar>> {
        let i = self.key_index(key)?;
        Ok(self.rows.iter().map(|r| &r[i]).collect())
    }

    /// Restrict to the named columns, preserving row order and count.
    pub fn project<K: AsRef<str>>(&self, keys: &[K]) -> Result<Self> {
        let idx = keys
            .iter()
            .map(|k| self.key_index(k.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        check_distinct(&keys)?;
        Ok(Self {
            keys,
            types: idx.iter().map(|&i| self.types[i]).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| idx.iter().map(|&i| r[i].clone()).collect())
                .collect(),
        })
    }

    /// Keep the first occurrence of every distinct row, in first-seen order.
    pub fn distinct(&self) -> Self {
        let mut seen: HashSet<&Row> = HashSet::with_capacity(self.rows.len());
        let rows = self
            .rows
            .iter()
            .filter(|r| seen.insert(*r))
            .cloned()
            .collect();
        Self {
            keys: self.keys.clone(),
            types: self.types.clone(),
            rows,
        }
    }

    /// Keep only the rows at `indices`, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Result<Self> {
        let rows = indices
            .iter()
            .map(|&i| {
                self.rows
                    .get(i)
                    .cloned()
                    .ok_or(CatalogError::IndexOutOfRange {
                        index: i,
                        len: self.rows.len(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            keys: self.keys.clone(),
            types: self.types.clone(),
            rows,
        })
    }

    /// Remove the first matching prefix from each key, e.g. `base.` turns
    /// `base.freq` into `freq`. Fails if two keys collapse to the same name.
    pub fn strip_prefixes<P: AsRef<str>>(&self, patterns: &[P]) -> Result<Self> {
        let keys: Vec<String> = self
            .keys
            .iter()
            .map(|k| {
                patterns
                    .iter()
                    .find_map(|p| k.strip_prefix(p.as_ref()))
                    .unwrap_or(k)
                    .to_string()
            })
            .collect();
        check_distinct(&keys)?;
        Ok(Self {
            keys,
            types: self.types.clone(),
            rows: self.rows.clone(),
        })
    }

    /// Attach the non-key columns of `other` to each row of `self`.
    ///
    /// This is a lookup, not a general join: every left row yields exactly
    /// one output row (in left order), and `other` may hold at most one
    /// distinct row per value of `on`. Left rows without a match get nulls.
    pub fn merge<K: AsRef<str>>(&self, other: &ResultTable, on: &[K]) -> Result<Self> {
        let left_on = on
            .iter()
            .map(|k| self.key_index(k.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let right_on = on
            .iter()
            .map(|k| other.key_index(k.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let extra: Vec<usize> = (0..other.keys.len())
            .filter(|i| !right_on.contains(i))
            .collect();
        for &i in &extra {
            if self.has_key(&other.keys[i]) {
                return Err(CatalogError::DuplicateColumn(other.keys[i].clone()));
            }
        }

        let mut lookup: HashMap<Row, &Row> = HashMap::with_capacity(other.rows.len());
        for row in &other.rows {
            let key: Row = right_on.iter().map(|&i| row[i].clone()).collect();
            match lookup.entry(key) {
                Entry::Occupied(hit) if *hit.get() != row => {
                    let shown: Vec<String> = hit.key().iter().map(ToString::to_string).collect();
                    return Err(CatalogError::AmbiguousMatch {
                        key: shown.join(","),
                    });
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(slot) => {
                    slot.insert(row);
                }
            }
        }

        let mut keys = self.keys.clone();
        keys.extend(extra.iter().map(|&i| other.keys[i].clone()));
        let mut types = self.types.clone();
        types.extend(extra.iter().map(|&i| other.types[i]));
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let key: Row = left_on.iter().map(|&i| row[i].clone()).collect();
                let mut out = row.clone();
                match lookup.get(&key) {
                    Some(hit) => out.extend(extra.iter().map(|&i| hit[i].clone())),
                    None => out.extend(std::iter::repeat(Scalar::Null).take(extra.len())),
                }
                out
            })
            .collect();
        Ok(Self { keys, types, rows })
    }

    /// Column-major view with one typed vector per column. Declared column
    /// types decide the vector type; untyped columns are inferred.
    pub fn as_structured(&self) -> Result<StructuredArray> {
        let mut fields = IndexMap::with_capacity(self.keys.len());
        for (i, key) in self.keys.iter().enumerate() {
            let values = self.rows.iter().map(|r| &r[i]);
            let column = match self.types[i] {
                Some(ty) => Column::declared(key, ty, values)?,
                None => Column::infer(key, values)?,
            };
            fields.insert(key.clone(), column);
        }
        Ok(StructuredArray {
            len: self.rows.len(),
            fields,
        })
    }
}

impl<'a> IntoIterator for &'a ResultTable {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

impl std::fmt::Display for ResultTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ResultTable<[{}], {} rows>",
            self.keys.join(","),
            self.rows.len()
        )
    }
}

/// One typed column of a [`StructuredArray`].
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Str(Vec<String>),
    NullableStr(Vec<Option<String>>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    NullableInt(Vec<Option<i64>>),
    NullableFloat(Vec<Option<f64>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Str(v) => v.len(),
            Column::NullableStr(v) => v.len(),
            Column::Int(v) => v.len(),
            Column::Float(v) => v.len(),
            Column::NullableInt(v) => v.len(),
            Column::NullableFloat(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Nulls are allowed in every declared type, since a property with no
    // covering row resolves to null; any null makes the column nullable.
    fn declared<'a>(
        key: &str,
        ty: ColumnType,
        values: impl Iterator<Item = &'a Scalar> + Clone,
    ) -> Result<Self> {
        let nulls = values.clone().any(Scalar::is_null);
        let mismatch = values
            .clone()
            .find(|v| !v.is_null() && ty.coerce(key, (*v).clone()).is_err());
        if let Some(bad) = mismatch {
            return Err(CatalogError::TypeMismatch {
                column: key.to_string(),
                expected: ty,
                found: bad.clone(),
            });
        }

        Ok(match ty {
            ColumnType::Str => {
                let col: Vec<Option<String>> =
                    values.map(|v| v.as_str().map(str::to_string)).collect();
                if nulls {
                    Column::NullableStr(col)
                } else {
                    Column::Str(col.into_iter().flatten().collect())
                }
            }
            ColumnType::Int | ColumnType::NullableInt => {
                let col: Vec<Option<i64>> = values.map(Scalar::as_i64).collect();
                if nulls || ty.is_nullable() {
                    Column::NullableInt(col)
                } else {
                    Column::Int(col.into_iter().flatten().collect())
                }
            }
            ColumnType::Float | ColumnType::NullableFloat => {
                let col: Vec<Option<f64>> = values.map(Scalar::as_f64).collect();
                if nulls || ty.is_nullable() {
                    Column::NullableFloat(col)
                } else {
                    Column::Float(col.into_iter().flatten().collect())
                }
            }
        })
    }

    // Strings and numbers never share a column. Integers mixed with floats
    // widen to floats; any null makes the column nullable. An all-null (or
    // empty) column comes out as nullable float.
    fn infer<'a>(key: &str, values: impl Iterator<Item = &'a Scalar> + Clone) -> Result<Self> {
        let (mut strs, mut ints, mut floats, mut nulls) = (false, false, false, false);
        for v in values.clone() {
            match v {
                Scalar::Str(_) => strs = true,
                Scalar::Int(_) => ints = true,
                Scalar::Float(_) => floats = true,
                Scalar::Null => nulls = true,
            }
        }

        if strs {
            if let Some(bad) = values.clone().find(|v| matches!(v, Scalar::Int(_) | Scalar::Float(_))) {
                return Err(CatalogError::TypeMismatch {
                    column: key.to_string(),
                    expected: ColumnType::Str,
                    found: bad.clone(),
                });
            }
            let col: Vec<Option<String>> = values.map(|v| v.as_str().map(str::to_string)).collect();
            return Ok(if nulls {
                Column::NullableStr(col)
            } else {
                Column::Str(col.into_iter().flatten().collect())
            });
        }

        if ints && !floats {
            let col: Vec<Option<i64>> = values.map(Scalar::as_i64).collect();
            return Ok(if nulls {
                Column::NullableInt(col)
            } else {
                Column::Int(col.into_iter().flatten().collect())
            });
        }

        let col: Vec<Option<f64>> = values.map(Scalar::as_f64).collect();
        Ok(if nulls || !floats {
            Column::NullableFloat(col)
        } else {
            Column::Float(col.into_iter().flatten().collect())
        })
    }
}

/// Column-major form of a [`ResultTable`], for numeric post-processing.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredArray {
    len: usize,
    fields: IndexMap<String, Column>,
}

impl StructuredArray {
    /// Number of records (rows).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn field(&self, name: &str) -> Option<&Column> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Scalar {
        Scalar::from(v)
    }

    fn sample() -> ResultTable {
        ResultTable::from_rows(
            ["name", "array", "freq"],
            vec![
                vec![s("d1"), s("LF"), s("f030")],
                vec![s("d2"), s("MF"), s("f090")],
                vec![s("d3"), s("LF"), s("f030")],
                vec![s("d4"), s("MF"), s("f150")],
            ],
        )
        .unwrap()
    }

    #[test]
    fn project_preserves_order_and_count() {
        let t = sample().project(&["freq", "array"]).unwrap();
        assert_eq!(t.keys(), ["freq", "array"]);
        assert_eq!(t.len(), 4);
        assert_eq!(t.rows()[1], vec![s("f090"), s("MF")]);
    }

    #[test]
    fn project_unknown_column_fails() {
        let err = sample().project(&["name", "wafer"]).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownColumn(ref k) if k == "wafer"));
    }

    #[test]
    fn distinct_keeps_first_seen_order() {
        let t = sample().project(&["array", "freq"]).unwrap().distinct();
        assert_eq!(
            t.rows(),
            [
                vec![s("LF"), s("f030")],
                vec![s("MF"), s("f090")],
                vec![s("MF"), s("f150")],
            ]
        );
    }

    #[test]
    fn distinct_is_idempotent() {
        let once = sample().project(&["array"]).unwrap().distinct();
        assert_eq!(once.distinct(), once);
        assert_eq!(once.len(), 2);
    }

    #[test]
    fn distinct_treats_null_as_a_value() {
        let t = ResultTable::from_rows(
            ["x"],
            vec![vec![Scalar::Null], vec![Scalar::Int(0)], vec![Scalar::Null]],
        )
        .unwrap();
        assert_eq!(t.distinct().rows(), [vec![Scalar::Null], vec![Scalar::Int(0)]]);
    }

    #[test]
    fn row_access_is_a_keyed_mapping() {
        let row = sample().row(2).unwrap();
        assert_eq!(row.get("name"), Some(&s("d3")));
        assert_eq!(row.keys().collect::<Vec<_>>(), ["name", "array", "freq"]);

        let err = sample().row(4).unwrap_err();
        assert!(matches!(err, CatalogError::IndexOutOfRange { index: 4, len: 4 }));
    }

    #[test]
    fn from_rows_checks_arity() {
        let err = ResultTable::from_rows(["a", "b"], vec![vec![Scalar::Int(1)]]).unwrap_err();
        assert!(matches!(err, CatalogError::RowArity { expected: 2, found: 1 }));
    }

    #[test]
    fn merge_attaches_columns_in_left_order() {
        let left = ResultTable::from_rows(
            ["name"],
            vec![vec![s("d3")], vec![s("d1")], vec![s("d3")], vec![s("d9")]],
        )
        .unwrap();
        let right = sample();
        let merged = left.merge(&right, &["name"]).unwrap();

        assert_eq!(merged.keys(), ["name", "array", "freq"]);
        assert_eq!(merged.len(), 4, "each left row yields one output row");
        assert_eq!(merged.rows()[0], vec![s("d3"), s("LF"), s("f030")]);
        assert_eq!(merged.rows()[1], vec![s("d1"), s("LF"), s("f030")]);
        assert_eq!(merged.rows()[2], merged.rows()[0]);
        assert_eq!(merged.rows()[3], vec![s("d9"), Scalar::Null, Scalar::Null]);
    }

    #[test]
    fn merge_rejects_ambiguous_right_side() {
        let left = ResultTable::from_rows(["array"], vec![vec![s("LF")]]).unwrap();
        let right = sample().project(&["array", "name"]).unwrap();
        let err = left.merge(&right, &["array"]).unwrap_err();
        assert!(matches!(err, CatalogError::AmbiguousMatch { .. }));
    }

    #[test]
    fn merge_tolerates_identical_duplicates() {
        let left = ResultTable::from_rows(["array"], vec![vec![s("LF")]]).unwrap();
        let right = sample().project(&["array", "freq"]).unwrap();
        let lf_only = right.select_rows(&[0, 2]).unwrap();
        let merged = left.merge(&lf_only, &["array"]).unwrap();
        assert_eq!(merged.rows(), [vec![s("LF"), s("f030")]]);
    }

    #[test]
    fn merge_rejects_colliding_columns() {
        let left = sample();
        let right = sample().project(&["name", "freq"]).unwrap();
        let err = left.merge(&right, &["name"]).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateColumn(ref k) if k == "freq"));
    }

    #[test]
    fn structured_view_types_columns() {
        let t = ResultTable::from_rows(
            ["name", "n", "x", "gain", "w"],
            vec![
                vec![s("a"), Scalar::Int(1), Scalar::Float(0.5), Scalar::Int(2), Scalar::Null],
                vec![s("b"), Scalar::Int(2), Scalar::Int(1), Scalar::Null, Scalar::Float(1.5)],
            ],
        )
        .unwrap();
        let arr = t.as_structured().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(
            arr.field("name"),
            Some(&Column::Str(vec!["a".into(), "b".into()]))
        );
        assert_eq!(arr.field("n"), Some(&Column::Int(vec![1, 2])));
        assert_eq!(arr.field("x"), Some(&Column::Float(vec![0.5, 1.0])));
        assert_eq!(arr.field("gain"), Some(&Column::NullableInt(vec![Some(2), None])));
        assert_eq!(arr.field("w"), Some(&Column::NullableFloat(vec![None, Some(1.5)])));
    }

    #[test]
    fn structured_view_rejects_mixed_strings_and_numbers() {
        let t = ResultTable::from_rows(["v"], vec![vec![s("a")], vec![Scalar::Int(1)]]).unwrap();
        assert!(matches!(
            t.as_structured(),
            Err(CatalogError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn empty_table_keeps_keys() {
        let t = ResultTable::new(["name", "freq"]);
        let p = t.project(&["freq"]).unwrap().distinct();
        assert!(p.is_empty());
        assert_eq!(p.keys(), ["freq"]);
        assert_eq!(p.to_string(), "ResultTable<[freq], 0 rows>");
    }

    #[test]
    fn strip_prefixes_renames_and_checks_collisions() {
        let t = ResultTable::new(["base.freq", "geometry.x"]);
        let stripped = t.strip_prefixes(&["base."]).unwrap();
        assert_eq!(stripped.keys(), ["freq", "geometry.x"]);

        let clash = ResultTable::new(["base.x", "geometry.x"]);
        assert!(clash.strip_prefixes(&["base.", "geometry."]).is_err());
    }

    #[test]
    fn concat_requires_matching_keys() {
        let a = sample();
        let b = sample().select_rows(&[0]).unwrap();
        let joined = ResultTable::concat([a, b]).unwrap();
        assert_eq!(joined.len(), 5);

        let mut c = sample();
        assert!(c.extend(ResultTable::new(["name"])).is_err());
    }

    #[test]
    fn push_record_requires_every_key() {
        let mut t = ResultTable::new(["name", "freq"]);
        let mut rec = IndexMap::new();
        rec.insert("freq".to_string(), s("f090"));
        rec.insert("name".to_string(), s("d1"));
        t.push_record(&rec).unwrap();
        assert_eq!(t.rows()[0], vec![s("d1"), s("f090")]);

        rec.shift_remove("freq");
        assert!(t.push_record(&rec).is_err());
    }

    #[test]
    fn declared_types_drive_the_structured_view() {
        let mut t = ResultTable::typed([
            ("name", Some(ColumnType::Str)),
            ("band", Some(ColumnType::Str)),
            ("n", Some(ColumnType::Int)),
            ("gain", Some(ColumnType::NullableFloat)),
            ("x", None),
        ])
        .unwrap();
        t.push_row(vec![s("d1"), Scalar::Null, Scalar::Int(3), Scalar::Int(2), Scalar::Null])
            .unwrap();
        t.push_row(vec![s("d2"), Scalar::Null, Scalar::Int(4), Scalar::Float(0.5), Scalar::Null])
            .unwrap();

        let arr = t.as_structured().unwrap();
        assert_eq!(arr.field("band"), Some(&Column::NullableStr(vec![None, None])));
        assert_eq!(arr.field("n"), Some(&Column::Int(vec![3, 4])));
        assert_eq!(
            arr.field("gain"),
            Some(&Column::NullableFloat(vec![Some(2.0), Some(0.5)]))
        );
        // Untyped columns are still inferred.
        assert_eq!(arr.field("x"), Some(&Column::NullableFloat(vec![None, None])));

        let mut bad = ResultTable::typed([("band", Some(ColumnType::Str))]).unwrap();
        bad.push_row(vec![Scalar::Int(1)]).unwrap();
        assert!(matches!(
            bad.as_structured(),
            Err(CatalogError::TypeMismatch { expected: ColumnType::Str, .. })
        ));
    }

    #[test]
    fn column_types_follow_projection_and_merge() {
        let mut right = sample();
        right.set_column_type("freq", Some(ColumnType::Str)).unwrap();
        let left = ResultTable::from_rows(["name"], vec![vec![s("d9")]]).unwrap();

        let merged = left.merge(&right, &["name"]).unwrap();
        assert_eq!(merged.column_type("freq").unwrap(), Some(ColumnType::Str));
        assert_eq!(merged.column_type("array").unwrap(), None);
        assert_eq!(
            merged.project(&["freq"]).unwrap().as_structured().unwrap().field("freq"),
            Some(&Column::NullableStr(vec![None]))
        );
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let err = ResultTable::from_rows(["a", "a"], vec![]).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateColumn(ref k) if k == "a"));

        let err = sample().project(&["name", "name"]).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateColumn(ref k) if k == "name"));
    }

    #[test]
    fn deserialize_validates_shape() {
        let ok: ResultTable =
            serde_json::from_str(r#"{"keys":["a"],"rows":[[{"type":"Int","value":1}]]}"#).unwrap();
        assert_eq!(ok.rows(), [vec![Scalar::Int(1)]]);
        assert_eq!(ok.column_type("a").unwrap(), None);

        let ragged = serde_json::from_str::<ResultTable>(
            r#"{"keys":["a","b"],"rows":[[{"type":"Int","value":1}]]}"#,
        );
        assert!(ragged.is_err());

        let dup = serde_json::from_str::<ResultTable>(r#"{"keys":["a","a"],"rows":[]}"#);
        assert!(dup.is_err());

        let short_types =
            serde_json::from_str::<ResultTable>(r#"{"keys":["a","b"],"types":["Str"],"rows":[]}"#);
        assert!(short_types.is_err());
    }

    #[test]
    fn serialized_tables_keep_declared_types() {
        let t = ResultTable::typed([("freq", Some(ColumnType::Str))]).unwrap();
        let back: ResultTable = serde_json::from_str(&serde_json::to_string(&t).unwrap()).unwrap();
        assert_eq!(back.column_type("freq").unwrap(), Some(ColumnType::Str));
    }
}
