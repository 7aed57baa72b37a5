use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};
use crate::value::{ColumnDescriptor, ColumnType};

/// Columns every property row carries implicitly; user columns may not
/// reuse these names.
pub const RESERVED_COLUMNS: [&str; 3] = ["det_id", "time0", "time1"];

/// A resolved reference to one column of one property table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
    /// Position of the column in the table's stored value vector.
    pub index: usize,
    pub ty: ColumnType,
}

impl ColumnRef {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }
}

/// Logical property-table name → ordered, typed column descriptors.
///
/// Loaded from the store when it is opened and kept current by
/// `create_table`; every query validates its column names against it.
/// Tables are kept sorted by name, the order a reload produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    tables: IndexMap<String, Vec<ColumnDescriptor>>,
}

impl PropertySchema {
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn table(&self, name: &str) -> Result<&[ColumnDescriptor]> {
        self.tables
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| CatalogError::Schema(format!("no property table named {name}")))
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Register a table. Re-registering an identical definition is a no-op;
    /// a conflicting one is a schema error.
    pub(crate) fn insert(&mut self, name: &str, columns: Vec<ColumnDescriptor>) -> Result<bool> {
        validate_definition(name, &columns)?;
        match self.tables.get(name) {
            Some(existing) if *existing == columns => Ok(false),
            Some(_) => Err(CatalogError::Schema(format!(
                "property table {name} already exists with different columns"
            ))),
            None => {
                self.tables.insert(name.to_string(), columns);
                self.tables.sort_keys();
                Ok(true)
            }
        }
    }

    /// Resolve `table.column`, or a bare `column` that exactly one table has.
    pub fn resolve(&self, name: &str) -> Result<ColumnRef> {
        if let Some((table, column)) = name.split_once('.') {
            let cols = self
                .tables
                .get(table)
                .ok_or_else(|| CatalogError::UnknownColumn(name.to_string()))?;
            return column_ref(table, cols, column)
                .ok_or_else(|| CatalogError::UnknownColumn(name.to_string()));
        }

        let mut found = self
            .tables
            .iter()
            .filter_map(|(table, cols)| column_ref(table, cols, name));
        match (found.next(), found.next()) {
            (Some(c), None) => Ok(c),
            (None, _) => Err(CatalogError::UnknownColumn(name.to_string())),
            (Some(_), Some(_)) => Err(CatalogError::AmbiguousColumn(name.to_string())),
        }
    }

    /// Expand a list of requested property names.
    ///
    /// `table.` (trailing dot) stands for every column of that table. The
    /// returned pairs keep the caller's spelling as the output key. Two
    /// requests producing the same key fail with `DuplicateColumn`.
    pub fn expand(&self, names: &[String]) -> Result<Vec<(String, ColumnRef)>> {
        let mut out: Vec<(String, ColumnRef)> = Vec::with_capacity(names.len());
        for name in names {
            match name.strip_suffix('.') {
                Some(table) => {
                    let cols = self
                        .tables
                        .get(table)
                        .ok_or_else(|| CatalogError::UnknownColumn(name.clone()))?;
                    for (index, c) in cols.iter().enumerate() {
                        let r = ColumnRef {
                            table: table.to_string(),
                            column: c.name.clone(),
                            index,
                            ty: c.ty,
                        };
                        out.push((r.qualified(), r));
                    }
                }
                None => out.push((name.clone(), self.resolve(name)?)),
            }
        }
        let mut seen = HashSet::with_capacity(out.len());
        if let Some((key, _)) = out.iter().find(|(k, _)| !seen.insert(k.as_str())) {
            return Err(CatalogError::DuplicateColumn(key.clone()));
        }
        Ok(out)
    }

    /// Every column of every table, as `table.column`, tables in name order.
    pub fn all_columns(&self) -> Vec<String> {
        self.tables
            .iter()
            .flat_map(|(t, cols)| cols.iter().map(move |c| format!("{t}.{}", c.name)))
            .collect()
    }
}

fn column_ref(table: &str, cols: &[ColumnDescriptor], column: &str) -> Option<ColumnRef> {
    cols.iter()
        .position(|c| c.name == column)
        .map(|index| ColumnRef {
            table: table.to_string(),
            column: column.to_string(),
            index,
            ty: cols[index].ty,
        })
}

fn validate_definition(name: &str, columns: &[ColumnDescriptor]) -> Result<()> {
    if name.is_empty() || name.contains(['.', ':']) {
        return Err(CatalogError::Schema(format!(
            "invalid property table name {name:?}"
        )));
    }
    if columns.is_empty() {
        return Err(CatalogError::Schema(format!(
            "property table {name} needs at least one column"
        )));
    }
    for (i, c) in columns.iter().enumerate() {
        if c.name.is_empty() || c.name.contains(['.', ':']) {
            return Err(CatalogError::Schema(format!(
                "invalid column name {:?} in table {name}",
                c.name
            )));
        }
        if RESERVED_COLUMNS.contains(&c.name.as_str()) {
            return Err(CatalogError::Schema(format!(
                "column name {} is reserved",
                c.name
            )));
        }
        if columns[..i].iter().any(|o| o.name == c.name) {
            return Err(CatalogError::DuplicateColumn(format!("{name}.{}", c.name)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> PropertySchema {
        let mut s = PropertySchema::default();
        s.insert(
            "base",
            vec![
                ColumnDescriptor::new("array", ColumnType::Str),
                ColumnDescriptor::new("freq", ColumnType::Str),
                ColumnDescriptor::new("pol", ColumnType::NullableFloat),
            ],
        )
        .unwrap();
        s.insert(
            "geometry",
            vec![
                ColumnDescriptor::new("x", ColumnType::Float),
                ColumnDescriptor::new("pol", ColumnType::Float),
            ],
        )
        .unwrap();
        s
    }

    #[test]
    fn bare_names_resolve_when_unique() {
        let r = schema().resolve("freq").unwrap();
        assert_eq!(r.qualified(), "base.freq");
        assert_eq!(r.index, 1);
    }

    #[test]
    fn bare_names_shared_by_tables_are_ambiguous() {
        assert!(matches!(
            schema().resolve("pol"),
            Err(CatalogError::AmbiguousColumn(_))
        ));
        assert_eq!(schema().resolve("geometry.pol").unwrap().ty, ColumnType::Float);
    }

    #[test]
    fn unknown_names_are_reported() {
        assert!(matches!(
            schema().resolve("base.wafer"),
            Err(CatalogError::UnknownColumn(ref n)) if n == "base.wafer"
        ));
        assert!(matches!(
            schema().resolve("nothing.x"),
            Err(CatalogError::UnknownColumn(_))
        ));
    }

    #[test]
    fn trailing_dot_expands_a_table() {
        let cols = schema()
            .expand(&["geometry.".to_string(), "freq".to_string()])
            .unwrap();
        let keys: Vec<&str> = cols.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["geometry.x", "geometry.pol", "freq"]);
    }

    #[test]
    fn expansion_rejects_repeated_keys() {
        let err = schema()
            .expand(&["geometry.".to_string(), "geometry.x".to_string()])
            .unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateColumn(ref k) if k == "geometry.x"));

        let err = schema()
            .expand(&["freq".to_string(), "freq".to_string()])
            .unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateColumn(ref k) if k == "freq"));

        // Different spellings of one column are distinct keys.
        assert_eq!(
            schema()
                .expand(&["freq".to_string(), "base.freq".to_string()])
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn redefinition_must_match() {
        let mut s = schema();
        let same = s.table("geometry").unwrap().to_vec();
        assert!(!s.insert("geometry", same).unwrap());
        assert!(s
            .insert("geometry", vec![ColumnDescriptor::new("x", ColumnType::Int)])
            .is_err());
    }

    #[test]
    fn reserved_and_duplicate_columns_are_rejected() {
        let mut s = PropertySchema::default();
        assert!(s
            .insert("t", vec![ColumnDescriptor::new("time0", ColumnType::Int)])
            .is_err());
        assert!(s
            .insert(
                "t",
                vec![
                    ColumnDescriptor::new("a", ColumnType::Int),
                    ColumnDescriptor::new("a", ColumnType::Str),
                ],
            )
            .is_err());
        assert!(s
            .insert("a.b", vec![ColumnDescriptor::new("a", ColumnType::Int)])
            .is_err());
    }

    #[test]
    fn all_columns_are_qualified() {
        assert_eq!(
            schema().all_columns(),
            ["base.array", "base.freq", "base.pol", "geometry.x", "geometry.pol"]
        );
    }
}
