//! Property-match filters.
//!
//! The three accepted shapes (one mapping, any of several mappings, or the
//! rows of an existing [`ResultTable`]) are all lowered to one
//! [`CompiledFilter`]: a set of columns plus a list of candidate rows, where
//! a detector matches if its resolved values equal any candidate.

use indexmap::IndexMap;

use crate::error::Result;
use crate::result_table::ResultTable;
use crate::schema::{ColumnRef, PropertySchema};
use crate::value::Scalar;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every named property must equal the given value.
    Exact(IndexMap<String, Scalar>),
    /// At least one of the mappings must match in full.
    AnyOf(Vec<IndexMap<String, Scalar>>),
    /// The detector's properties, restricted to the table's columns, must
    /// equal one of the table's rows.
    MatchesTable(ResultTable),
}

impl Filter {
    pub fn exact<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Scalar>,
    {
        Filter::Exact(mapping(pairs))
    }

    pub fn any_of<I, M, K, V>(maps: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Scalar>,
    {
        Filter::AnyOf(maps.into_iter().map(mapping).collect())
    }

    pub(crate) fn compile(&self, schema: &PropertySchema) -> Result<CompiledFilter> {
        let maps: Vec<Vec<(String, Scalar)>> = match self {
            Filter::Exact(m) => vec![pairs_of(m)],
            Filter::AnyOf(ms) => ms.iter().map(pairs_of).collect(),
            Filter::MatchesTable(t) => t
                .distinct()
                .rows()
                .iter()
                .map(|row| t.keys().iter().cloned().zip(row.iter().cloned()).collect())
                .collect(),
        };

        let mut compiled = CompiledFilter {
            columns: Vec::new(),
            candidates: Vec::with_capacity(maps.len()),
        };
        // Columns of an empty table are still validated.
        if let Filter::MatchesTable(t) = self {
            for k in t.keys() {
                compiled.column_slot(schema.resolve(k)?);
            }
        }
        for pairs in maps {
            let mut constraints = Vec::with_capacity(pairs.len());
            for (name, value) in pairs {
                let col = schema.resolve(&name)?;
                let value = col.ty.coerce_match(&col.qualified(), value)?;
                constraints.push((compiled.column_slot(col), value));
            }
            compiled.candidates.push(constraints);
        }
        Ok(compiled)
    }
}

fn mapping<I, K, V>(pairs: I) -> IndexMap<String, Scalar>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Scalar>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

fn pairs_of(m: &IndexMap<String, Scalar>) -> Vec<(String, Scalar)> {
    m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Normalized form of a [`Filter`].
#[derive(Debug, Clone)]
pub(crate) struct CompiledFilter {
    /// Columns the filter reads, deduplicated by qualified name.
    pub columns: Vec<ColumnRef>,
    /// Each candidate lists `(column slot, required value)` pairs.
    candidates: Vec<Vec<(usize, Scalar)>>,
}

impl CompiledFilter {
    fn column_slot(&mut self, col: ColumnRef) -> usize {
        match self
            .columns
            .iter()
            .position(|c| c.table == col.table && c.column == col.column)
        {
            Some(i) => i,
            None => {
                self.columns.push(col);
                self.columns.len() - 1
            }
        }
    }

    /// `resolved[i]` is the detector's value for `self.columns[i]`.
    pub fn matches(&self, resolved: &[Scalar]) -> bool {
        self.candidates
            .iter()
            .any(|c| c.iter().all(|(slot, want)| resolved[*slot] == *want))
    }

    /// True when no detector can match (an empty list of mappings).
    pub fn rejects_all(&self) -> bool {
        self.candidates.is_empty()
    }
}
