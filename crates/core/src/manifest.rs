//! Manifest: maps index data to the file (and data fields) that answer it.
//!
//! A [`ManifestScheme`] declares the fields. Exact-match and range-match
//! fields are inputs, so every lookup must supply a value for each of them.
//! Data fields are outputs returned next to the matched file name. A typical
//! use is "which calibration file applies to this array at this time".

use std::collections::HashSet;
use std::path::Path;

use indexmap::IndexMap;
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};
use crate::storage;
use crate::value::{ColumnType, Scalar};

/// `(exact key, seq)` → JSON [`StoredEntry`]. The exact key is the JSON
/// array of an entry's exact-match values, so a lookup scans one prefix.
const ENTRIES: TableDefinition<(&str, u64), &str> = TableDefinition::new("entries");
/// File name → number of entries pointing at it.
const FILES: TableDefinition<&str, u64> = TableDefinition::new("files");
const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

const LAYOUT_VERSION: &str = "1";
const VERSION_KEY: &str = "manifest_version";
const SCHEME_KEY: &str = "scheme";

/// Output key holding the matched file name.
pub const FILENAME_KEY: &str = "filename";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    /// Input matched by equality.
    Exact,
    /// Input matched by `lo <= value < hi`.
    Range,
    /// Output returned with the file name.
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemeField {
    pub name: String,
    pub role: FieldRole,
    pub ty: ColumnType,
}

/// The fields of a manifest, in declaration order.
///
/// ```
/// use todcat::{ColumnType, ManifestScheme};
///
/// let scheme = ManifestScheme::new()
///     .add_exact_match("array", ColumnType::Str)
///     .add_range_match("time", ColumnType::Float)
///     .add_data_field("beam_id", ColumnType::Int);
/// assert!(scheme.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestScheme {
    fields: Vec<SchemeField>,
}

impl ManifestScheme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_exact_match(self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.with_field(name.into(), FieldRole::Exact, ty)
    }

    pub fn add_range_match(self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.with_field(name.into(), FieldRole::Range, ty)
    }

    pub fn add_data_field(self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.with_field(name.into(), FieldRole::Data, ty)
    }

    fn with_field(mut self, name: String, role: FieldRole, ty: ColumnType) -> Self {
        self.fields.push(SchemeField { name, role, ty });
        self
    }

    pub fn fields(&self) -> &[SchemeField] {
        &self.fields
    }

    fn with_role(&self, role: FieldRole) -> impl Iterator<Item = &SchemeField> {
        self.fields.iter().filter(move |f| f.role == role)
    }

    /// Field names must be non-empty, distinct, and not `filename`.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.fields.len());
        for f in &self.fields {
            if f.name.is_empty() || f.name == FILENAME_KEY {
                return Err(CatalogError::Schema(format!(
                    "invalid manifest field name {:?}",
                    f.name
                )));
            }
            if !seen.insert(f.name.as_str()) {
                return Err(CatalogError::DuplicateColumn(f.name.clone()));
            }
        }
        Ok(())
    }
}

/// One field value given to [`ManifestLoader::add_entry`].
#[derive(Debug, Clone, PartialEq)]
pub enum EntryValue {
    /// For exact-match and data fields.
    Value(Scalar),
    /// `[lo, hi)`, for range-match fields.
    Range(Scalar, Scalar),
}

impl EntryValue {
    pub fn value(v: impl Into<Scalar>) -> Self {
        EntryValue::Value(v.into())
    }

    pub fn range(lo: impl Into<Scalar>, hi: impl Into<Scalar>) -> Self {
        EntryValue::Range(lo.into(), hi.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    /// One `[lo, hi)` per range field, in scheme order.
    ranges: Vec<(Scalar, Scalar)>,
    /// One value per data field, in scheme order.
    data: Vec<Scalar>,
    file: String,
}

impl StoredEntry {
    fn covers(&self, points: &[Scalar]) -> bool {
        self.ranges
            .iter()
            .zip(points)
            .all(|((lo, hi), v)| is_le(lo, v) && is_lt(v, hi))
    }

    /// Both boxes non-empty and intersecting in every range dimension.
    fn overlaps(&self, other: &StoredEntry) -> bool {
        let non_empty = |e: &StoredEntry| e.ranges.iter().all(|(lo, hi)| is_lt(lo, hi));
        non_empty(self)
            && non_empty(other)
            && self
                .ranges
                .iter()
                .zip(&other.ranges)
                .all(|((alo, ahi), (blo, bhi))| is_lt(alo, bhi) && is_lt(blo, ahi))
    }
}

fn is_lt(a: &Scalar, b: &Scalar) -> bool {
    a.compare(b) == Some(std::cmp::Ordering::Less)
}

fn is_le(a: &Scalar, b: &Scalar) -> bool {
    matches!(
        a.compare(b),
        Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
    )
}

/// Map from index data to a file name plus data fields.
pub struct ManifestDb {
    db: Database,
    scheme: ManifestScheme,
}

impl ManifestDb {
    /// Create a new manifest file, which must not exist yet.
    pub fn create(path: impl AsRef<Path>, scheme: ManifestScheme) -> Result<Self> {
        scheme.validate()?;
        let path = path.as_ref();
        let db = storage::create_new_file(path)?;
        tracing::debug!(path = %path.display(), fields = scheme.fields.len(), "created manifest");
        Self::init_new(db, scheme)
    }

    pub fn open_in_memory(scheme: ManifestScheme) -> Result<Self> {
        scheme.validate()?;
        Self::init_new(storage::open_in_memory()?, scheme)
    }

    /// Open an existing manifest; its scheme is read from the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = storage::open_existing(path)?;
        let scheme = {
            let read_txn = db.begin_read()?;
            let meta = read_txn.open_table(META)?;
            let version = meta.get(VERSION_KEY)?.map(|g| g.value().to_string());
            if version.as_deref() != Some(LAYOUT_VERSION) {
                return Err(CatalogError::Schema(format!(
                    "unsupported manifest layout version {version:?}"
                )));
            }
            let raw = meta
                .get(SCHEME_KEY)?
                .map(|g| g.value().to_string())
                .ok_or_else(|| CatalogError::Schema("manifest has no scheme".into()))?;
            serde_json::from_str::<ManifestScheme>(&raw)?
        };
        scheme.validate()?;
        tracing::debug!(path = %path.display(), "opened manifest");
        Ok(Self { db, scheme })
    }

    fn init_new(db: Database, scheme: ManifestScheme) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(ENTRIES)?;
        write_txn.open_table(FILES)?;
        {
            let mut meta = write_txn.open_table(META)?;
            meta.insert(VERSION_KEY, LAYOUT_VERSION)?;
            meta.insert(SCHEME_KEY, serde_json::to_string(&scheme)?.as_str())?;
        }
        write_txn.commit()?;
        Ok(Self { db, scheme })
    }

    pub fn scheme(&self) -> &ManifestScheme {
        &self.scheme
    }

    /// Number of entries.
    pub fn len(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        Ok(read_txn.open_table(ENTRIES)?.len()? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every file name some entry points at, sorted.
    pub fn files(&self) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let files = read_txn.open_table(FILES)?;
        let mut out = Vec::new();
        for entry in files.iter()? {
            let (name, _) = entry?;
            out.push(name.value().to_string());
        }
        Ok(out)
    }

    pub fn close(self) {
        drop(self.db);
        tracing::debug!("closed manifest");
    }

    /// Start a bulk load. Dropping the loader rolls back.
    pub fn begin_load(&self) -> Result<ManifestLoader<'_>> {
        Ok(ManifestLoader {
            scheme: &self.scheme,
            txn: self.db.begin_write()?,
            entries: 0,
        })
    }

    pub fn add_entry<I, K>(&self, params: I, filename: &str) -> Result<()>
    where
        I: IntoIterator<Item = (K, EntryValue)>,
        K: Into<String>,
    {
        let mut loader = self.begin_load()?;
        loader.add_entry(params, filename)?;
        loader.commit()
    }

    /// Look up the entry matching the given index data.
    ///
    /// Every exact and range field must be supplied; other keys are ignored.
    /// Returns `filename` followed by the data fields, `None` when nothing
    /// matches, and `ManifestOverlap` when more than one entry does.
    pub fn match_entry<I, K, V>(&self, params: I) -> Result<Option<IndexMap<String, Scalar>>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Scalar>,
    {
        let mut given: IndexMap<String, Scalar> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let mut take = |f: &SchemeField| -> Result<Scalar> {
            let v = given
                .shift_remove(&f.name)
                .ok_or_else(|| CatalogError::MissingParameter(f.name.clone()))?;
            f.ty.coerce(&f.name, v)
        };
        let exact = self
            .scheme
            .with_role(FieldRole::Exact)
            .map(&mut take)
            .collect::<Result<Vec<_>>>()?;
        let points = self
            .scheme
            .with_role(FieldRole::Range)
            .map(&mut take)
            .collect::<Result<Vec<_>>>()?;
        let key = serde_json::to_string(&exact)?;

        let read_txn = self.db.begin_read()?;
        let entries = read_txn.open_table(ENTRIES)?;
        let mut hit: Option<StoredEntry> = None;
        for entry in entries.range((key.as_str(), 0)..=(key.as_str(), u64::MAX))? {
            let (_, value) = entry?;
            let stored: StoredEntry = serde_json::from_str(value.value())?;
            if !stored.covers(&points) {
                continue;
            }
            if let Some(first) = &hit {
                return Err(CatalogError::ManifestOverlap {
                    first: first.file.clone(),
                    second: stored.file,
                });
            }
            hit = Some(stored);
        }

        Ok(hit.map(|e| {
            let mut out = IndexMap::with_capacity(1 + e.data.len());
            out.insert(FILENAME_KEY.to_string(), Scalar::Str(e.file));
            for (f, v) in self.scheme.with_role(FieldRole::Data).zip(e.data) {
                out.insert(f.name.clone(), v);
            }
            out
        }))
    }

    /// Check the scheme, then check that no index data can match two
    /// entries: entries sharing exact-match values must have disjoint
    /// ranges.
    pub fn validate(&self) -> Result<()> {
        self.scheme.validate()?;
        let read_txn = self.db.begin_read()?;
        let entries = read_txn.open_table(ENTRIES)?;
        let mut group: Vec<StoredEntry> = Vec::new();
        let mut group_key = String::new();
        for entry in entries.iter()? {
            let (k, v) = entry?;
            let (key, _) = k.value();
            if key != group_key {
                check_disjoint(&group)?;
                group.clear();
                group_key = key.to_string();
            }
            group.push(serde_json::from_str(v.value())?);
        }
        check_disjoint(&group)
    }
}

fn check_disjoint(group: &[StoredEntry]) -> Result<()> {
    for (i, a) in group.iter().enumerate() {
        if let Some(b) = group[i + 1..].iter().find(|b| a.overlaps(b)) {
            return Err(CatalogError::ManifestOverlap {
                first: a.file.clone(),
                second: b.file.clone(),
            });
        }
    }
    Ok(())
}

/// A write transaction over a [`ManifestDb`].
pub struct ManifestLoader<'a> {
    scheme: &'a ManifestScheme,
    txn: WriteTransaction,
    entries: usize,
}

impl ManifestLoader<'_> {
    /// Add one entry. Every scheme field must be given: exact and data
    /// fields as [`EntryValue::Value`], range fields as
    /// [`EntryValue::Range`]. Unknown keys are rejected.
    pub fn add_entry<I, K>(&mut self, params: I, filename: &str) -> Result<()>
    where
        I: IntoIterator<Item = (K, EntryValue)>,
        K: Into<String>,
    {
        if filename.is_empty() {
            return Err(CatalogError::InvalidPath(filename.to_string()));
        }
        let mut given: IndexMap<String, EntryValue> =
            params.into_iter().map(|(k, v)| (k.into(), v)).collect();

        let mut exact = Vec::new();
        let mut ranges = Vec::new();
        let mut data = Vec::new();
        for f in &self.scheme.fields {
            let value = given
                .shift_remove(&f.name)
                .ok_or_else(|| CatalogError::MissingParameter(f.name.clone()))?;
            match (f.role, value) {
                (FieldRole::Exact, EntryValue::Value(v)) => exact.push(f.ty.coerce(&f.name, v)?),
                (FieldRole::Data, EntryValue::Value(v)) => data.push(f.ty.coerce(&f.name, v)?),
                (FieldRole::Range, EntryValue::Range(lo, hi)) => {
                    let lo = f.ty.coerce(&f.name, lo)?;
                    let hi = f.ty.coerce(&f.name, hi)?;
                    if !is_le(&lo, &hi) {
                        return Err(CatalogError::InvalidRange(format!(
                            "{filename}: {} range [{lo}, {hi}) is not ordered",
                            f.name
                        )));
                    }
                    ranges.push((lo, hi));
                }
                (FieldRole::Range, EntryValue::Value(_)) => {
                    return Err(CatalogError::Schema(format!(
                        "field {} needs a [lo, hi) range",
                        f.name
                    )))
                }
                (_, EntryValue::Range(..)) => {
                    return Err(CatalogError::Schema(format!(
                        "field {} takes a single value",
                        f.name
                    )))
                }
            }
        }
        if let Some(extra) = given.keys().next() {
            return Err(CatalogError::UnknownColumn(extra.clone()));
        }

        let key = serde_json::to_string(&exact)?;
        let stored = serde_json::to_string(&StoredEntry {
            ranges,
            data,
            file: filename.to_string(),
        })?;
        let mut table = self.txn.open_table(ENTRIES)?;
        let seq = table.len()?;
        table.insert((key.as_str(), seq), stored.as_str())?;

        let mut files = self.txn.open_table(FILES)?;
        let n = files.get(filename)?.map_or(0, |g| g.value());
        files.insert(filename, n + 1)?;
        self.entries += 1;
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        tracing::debug!(entries = self.entries, "committed manifest load");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beam_scheme() -> ManifestScheme {
        ManifestScheme::new()
            .add_exact_match("array", ColumnType::Str)
            .add_range_match("time", ColumnType::Float)
            .add_data_field("beam_id", ColumnType::Int)
    }

    fn beam_manifest() -> ManifestDb {
        let db = ManifestDb::open_in_memory(beam_scheme()).unwrap();
        let mut load = db.begin_load().unwrap();
        for (array, lo, hi, file, id) in [
            ("LF", 0.0, 100.0, "beams_a.h5", 1_i64),
            ("LF", 100.0, 200.0, "beams_b.h5", 2),
            ("MF", 0.0, 200.0, "beams_a.h5", 3),
        ] {
            load.add_entry(
                [
                    ("array", EntryValue::value(array)),
                    ("time", EntryValue::range(lo, hi)),
                    ("beam_id", EntryValue::value(id)),
                ],
                file,
            )
            .unwrap();
        }
        load.commit().unwrap();
        db
    }

    #[test]
    fn match_uses_exact_fields_and_semi_open_ranges() {
        let db = beam_manifest();
        let hit = db
            .match_entry([("array", Scalar::from("LF")), ("time", Scalar::Float(100.0))])
            .unwrap()
            .unwrap();
        assert_eq!(hit.keys().collect::<Vec<_>>(), ["filename", "beam_id"]);
        assert_eq!(hit["filename"], Scalar::from("beams_b.h5"));
        assert_eq!(hit["beam_id"], Scalar::Int(2));

        // Integers widen for a float range field.
        let hit = db
            .match_entry([("array", Scalar::from("MF")), ("time", Scalar::Int(5))])
            .unwrap()
            .unwrap();
        assert_eq!(hit["beam_id"], Scalar::Int(3));

        let miss = db
            .match_entry([("array", Scalar::from("LF")), ("time", Scalar::Float(200.0))])
            .unwrap();
        assert!(miss.is_none());
        let miss = db
            .match_entry([("array", Scalar::from("HF")), ("time", Scalar::Float(5.0))])
            .unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn match_requires_every_input_field() {
        let db = beam_manifest();
        let err = db.match_entry([("array", "LF")]).unwrap_err();
        assert!(matches!(err, CatalogError::MissingParameter(ref f) if f == "time"));

        // Extra keys are ignored.
        let hit = db
            .match_entry([
                ("array", Scalar::from("LF")),
                ("time", Scalar::Float(1.0)),
                ("note", Scalar::from("x")),
            ])
            .unwrap();
        assert!(hit.is_some());
    }

    #[test]
    fn entries_are_checked_against_the_scheme() {
        let db = ManifestDb::open_in_memory(beam_scheme()).unwrap();
        let base = || {
            vec![
                ("array", EntryValue::value("LF")),
                ("time", EntryValue::range(0.0, 1.0)),
                ("beam_id", EntryValue::value(1_i64)),
            ]
        };

        let mut missing = base();
        missing.pop();
        assert!(matches!(
            db.add_entry(missing, "f"),
            Err(CatalogError::MissingParameter(ref f)) if f == "beam_id"
        ));

        let mut extra = base();
        extra.push(("wafer", EntryValue::value("w0")));
        assert!(matches!(
            db.add_entry(extra, "f"),
            Err(CatalogError::UnknownColumn(ref f)) if f == "wafer"
        ));

        let mut shape = base();
        shape[1] = ("time", EntryValue::value(0.5));
        assert!(matches!(db.add_entry(shape, "f"), Err(CatalogError::Schema(_))));

        let mut typed = base();
        typed[2] = ("beam_id", EntryValue::value("one"));
        assert!(matches!(
            db.add_entry(typed, "f"),
            Err(CatalogError::TypeMismatch { .. })
        ));

        let mut reversed = base();
        reversed[1] = ("time", EntryValue::range(2.0, 1.0));
        assert!(matches!(
            db.add_entry(reversed, "f"),
            Err(CatalogError::InvalidRange(_))
        ));

        assert!(matches!(db.add_entry(base(), ""), Err(CatalogError::InvalidPath(_))));
        assert!(db.is_empty().unwrap());

        db.add_entry(base(), "f").unwrap();
        assert_eq!(db.len().unwrap(), 1);
    }

    #[test]
    fn validate_finds_entries_that_match_the_same_data() {
        let db = beam_manifest();
        db.validate().unwrap();

        // Touching ranges and empty ranges do not overlap.
        db.add_entry(
            [
                ("array", EntryValue::value("LF")),
                ("time", EntryValue::range(50.0, 50.0)),
                ("beam_id", EntryValue::value(9_i64)),
            ],
            "empty.h5",
        )
        .unwrap();
        db.validate().unwrap();

        db.add_entry(
            [
                ("array", EntryValue::value("LF")),
                ("time", EntryValue::range(150.0, 300.0)),
                ("beam_id", EntryValue::value(4_i64)),
            ],
            "beams_c.h5",
        )
        .unwrap();
        assert!(matches!(
            db.validate(),
            Err(CatalogError::ManifestOverlap { ref first, ref second })
                if first == "beams_b.h5" && second == "beams_c.h5"
        ));
        assert!(matches!(
            db.match_entry([("array", Scalar::from("LF")), ("time", Scalar::Float(160.0))]),
            Err(CatalogError::ManifestOverlap { .. })
        ));
        // Outside the overlap, lookups still resolve.
        let hit = db
            .match_entry([("array", Scalar::from("LF")), ("time", Scalar::Float(250.0))])
            .unwrap()
            .unwrap();
        assert_eq!(hit["filename"], Scalar::from("beams_c.h5"));
    }

    #[test]
    fn scheme_names_must_be_distinct() {
        let dup = beam_scheme().add_data_field("array", ColumnType::Str);
        assert!(matches!(dup.validate(), Err(CatalogError::DuplicateColumn(_))));
        let reserved = ManifestScheme::new().add_data_field(FILENAME_KEY, ColumnType::Str);
        assert!(ManifestDb::open_in_memory(reserved).is_err());
    }

    #[test]
    fn scheme_and_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.redb");
        {
            let db = ManifestDb::create(&path, beam_scheme()).unwrap();
            db.add_entry(
                [
                    ("array", EntryValue::value("LF")),
                    ("time", EntryValue::range(0.0, 10.0)),
                    ("beam_id", EntryValue::value(1_i64)),
                ],
                "beams_a.h5",
            )
            .unwrap();
            db.close();
        }
        assert!(ManifestDb::create(&path, beam_scheme()).is_err());
        assert!(ManifestDb::open(dir.path().join("missing.redb")).is_err());

        let db = ManifestDb::open(&path).unwrap();
        assert_eq!(db.scheme(), &beam_scheme());
        assert_eq!(db.files().unwrap(), ["beams_a.h5"]);
        let hit = db
            .match_entry([("array", Scalar::from("LF")), ("time", Scalar::Float(3.0))])
            .unwrap();
        assert!(hit.is_some());
    }

    #[test]
    fn files_are_listed_once() {
        let db = beam_manifest();
        assert_eq!(db.files().unwrap(), ["beams_a.h5", "beams_b.h5"]);
    }

    #[test]
    fn dropped_loader_rolls_back() {
        let db = beam_manifest();
        {
            let mut load = db.begin_load().unwrap();
            load.add_entry(
                [
                    ("array", EntryValue::value("HF")),
                    ("time", EntryValue::range(0.0, 1.0)),
                    ("beam_id", EntryValue::value(7_i64)),
                ],
                "ghost.h5",
            )
            .unwrap();
        }
        assert_eq!(db.len().unwrap(), 3);
        assert!(!db.files().unwrap().contains(&"ghost.h5".to_string()));
    }
}
