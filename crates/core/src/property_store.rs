//! Detector property store.
//!
//! The `dets` table gives every detector a stable name and an internal
//! integer id. All other data lives in user-defined *property tables*; each
//! row carries `(det_id, time0, time1)` plus the table's typed columns, and
//! is valid over the semi-open interval `[time0, time1)`.
//!
//! Rows for one detector in one table must not overlap, so a query at time
//! `t` matches at most one row per table. That rule is checked explicitly by
//! [`PropertyStore::check_intervals`]; a query that runs into a violation
//! fails with [`CatalogError::AmbiguousProperty`] rather than picking a row.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard};

use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, ReadableTableMetadata,
    TableDefinition, WriteTransaction,
};
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result, RowSpan};
use crate::filter::Filter;
use crate::result_table::ResultTable;
use crate::schema::{ColumnRef, PropertySchema};
use crate::storage;
use crate::value::{ColumnDescriptor, ColumnType, Scalar};
use crate::{AtTime, DetId, Timestamp, ALWAYS};

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// `id` → detector name. Ids start at 1 and are assigned in insertion order.
const DETS: TableDefinition<u64, &str> = TableDefinition::new("dets");
/// Detector name → `id`.
const DET_NAMES: TableDefinition<&str, u64> = TableDefinition::new("det_names");
/// Property table name → JSON list of [`ColumnDescriptor`]s.
const PROPERTY_TABLES: TableDefinition<&str, &str> = TableDefinition::new("property_tables");
/// Counters and the layout version.
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const LAYOUT_VERSION: u64 = 1;
const VERSION_KEY: &str = "detdb_version";
const NEXT_DET_ID: &str = "next_det_id";
const NEXT_ROW_SEQ: &str = "next_row_seq";

/// Property rows are keyed `(det_id, time0, seq)`. `seq` is a store-wide
/// insertion counter, so two rows with the same start time can coexist and
/// be reported by validation instead of silently replacing each other.
type RowKey = (u64, i64, u64);

/// Join key used internally when attaching property columns to a detector
/// list. Property names cannot contain `:`, so it never collides.
const JOIN_KEY: &str = "dets:name";

fn rows_table_name(table: &str) -> String {
    format!("prop:{table}")
}

fn rows_def(name: &str) -> TableDefinition<'_, RowKey, &'static str> {
    TableDefinition::new(name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow {
    time1: Timestamp,
    values: Vec<Scalar>,
}

#[derive(Debug, Clone)]
struct Detector {
    id: DetId,
    name: String,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Which detectors a property query covers.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Detectors {
    /// Every detector, in id order.
    #[default]
    All,
    Names(Vec<String>),
    Ids(Vec<DetId>),
    /// The `name` column of an earlier result.
    Table(ResultTable),
}

/// Arguments to [`PropertyStore::get_properties`].
///
/// ```rust
/// use todcat::{AtTime, Filter, PropertyQuery};
///
/// let q = PropertyQuery::new()
///     .properties(["base.freq", "geometry."])
///     .filter(Filter::exact([("array", "LF")]))
///     .at(AtTime::At(1_700_000_000));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyQuery {
    pub detectors: Detectors,
    /// Output columns; `None` means every column of every table.
    pub properties: Option<Vec<String>>,
    pub filter: Option<Filter>,
    pub at: AtTime,
}

impl PropertyQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detectors<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.detectors = Detectors::Names(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn detector_ids(mut self, ids: impl IntoIterator<Item = DetId>) -> Self {
        self.detectors = Detectors::Ids(ids.into_iter().collect());
        self
    }

    pub fn detectors_from(mut self, table: ResultTable) -> Self {
        self.detectors = Detectors::Table(table);
        self
    }

    pub fn properties<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn at(mut self, at: impl Into<AtTime>) -> Self {
        self.at = at.into();
        self
    }
}

/// Time restriction for [`PropertyStore::reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Timestamp,
    /// `None` keeps only rows covering the instant `start`.
    pub stop: Option<Timestamp>,
}

impl TimeWindow {
    pub fn instant(t: Timestamp) -> Self {
        Self {
            start: t,
            stop: None,
        }
    }

    pub fn span(start: Timestamp, stop: Timestamp) -> Self {
        Self {
            start,
            stop: Some(stop),
        }
    }

    /// Does the non-empty row interval `[time0, time1)` touch this window?
    pub fn intersects(&self, time0: Timestamp, time1: Timestamp) -> bool {
        match self.stop {
            None => AtTime::At(self.start).covers(time0, time1),
            Some(stop) => time0 < time1 && time0 < stop && self.start < time1,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Interval-versioned detector property catalog.
///
/// Reads are safe from many threads at once (each runs in its own redb read
/// transaction). Writes are serialized by redb; a long bulk load should go
/// through [`begin_load`](Self::begin_load) so it commits once.
///
/// ```rust,no_run
/// use todcat::{ColumnDescriptor, ColumnType, PropertyQuery, PropertyStore};
///
/// let store = PropertyStore::open("detdb.redb").unwrap();
/// store
///     .create_table("base", vec![ColumnDescriptor::new("freq", ColumnType::Str)])
///     .unwrap();
/// store.add_props("base", "det00", None, [("freq", "f090")]).unwrap();
/// let props = store.get_properties(&PropertyQuery::new()).unwrap();
/// assert_eq!(props.keys(), ["base.freq"]);
/// ```
pub struct PropertyStore {
    db: Database,
    /// Column descriptors for every property table, read once at open and
    /// replaced after each committed schema change.
    schema: RwLock<PropertySchema>,
}

impl PropertyStore {
    /// Open or create a property store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = storage::open_file(path)?;
        tracing::debug!(path = %path.display(), "opened property store");
        Self::init(db)
    }

    /// Open a store that must already exist. A missing file fails with
    /// `Storage` instead of creating an empty store.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = storage::open_existing(path)?;
        tracing::debug!(path = %path.display(), "opened existing property store");
        Self::init(db)
    }

    /// Create an in-memory property store (no file I/O).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(storage::open_in_memory()?)
    }

    fn init(db: Database) -> Result<Self> {
        let mut schema = PropertySchema::default();
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(DETS)?;
            write_txn.open_table(DET_NAMES)?;
            {
                let mut meta = write_txn.open_table(META)?;
                let version: Option<u64> = meta.get(VERSION_KEY)?.map(|g| g.value());
                match version {
                    None => {
                        meta.insert(VERSION_KEY, LAYOUT_VERSION)?;
                    }
                    Some(v) if v > LAYOUT_VERSION => {
                        return Err(CatalogError::Schema(format!(
                            "property store layout version {v} is newer than supported {LAYOUT_VERSION}"
                        )));
                    }
                    Some(_) => {}
                }
            }
            {
                let tables = write_txn.open_table(PROPERTY_TABLES)?;
                for entry in tables.iter()? {
                    let (name, columns) = entry?;
                    let columns: Vec<ColumnDescriptor> = serde_json::from_str(columns.value())?;
                    schema.insert(name.value(), columns)?;
                }
            }
            write_txn.commit()?;
        }
        Ok(Self {
            db,
            schema: RwLock::new(schema),
        })
    }

    /// Release the underlying store.
    pub fn close(self) {
        drop(self.db);
        tracing::debug!("closed property store");
    }

    fn schema_guard(&self) -> Result<RwLockReadGuard<'_, PropertySchema>> {
        self.schema
            .read()
            .map_err(|_| CatalogError::Internal("property schema lock poisoned".into()))
    }

    /// A copy of the current table/column descriptors.
    pub fn schema(&self) -> Result<PropertySchema> {
        Ok(self.schema_guard()?.clone())
    }

    /// Number of registered detectors.
    pub fn len(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let dets = read_txn.open_table(DETS)?;
        Ok(dets.len()? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // -- writes --------------------------------------------------------------

    /// Start a bulk load. Nothing is visible to readers until
    /// [`PropertyLoader::commit`]; dropping the loader rolls back.
    pub fn begin_load(&self) -> Result<PropertyLoader<'_>> {
        let txn = self.db.begin_write()?;
        // Taken after the write lock so concurrent loaders cannot interleave
        // schema changes.
        let schema = self.schema()?;
        Ok(PropertyLoader {
            store: self,
            txn,
            schema,
            rows: 0,
        })
    }

    /// Define a property table. Idempotent for an identical definition.
    pub fn create_table(&self, name: &str, columns: Vec<ColumnDescriptor>) -> Result<()> {
        let mut loader = self.begin_load()?;
        loader.create_table(name, columns)?;
        loader.commit()
    }

    /// Return the id for `name`, registering the detector if it is new.
    pub fn add_detector(&self, name: &str) -> Result<DetId> {
        let mut loader = self.begin_load()?;
        let id = loader.add_detector(name)?;
        loader.commit()?;
        Ok(id)
    }

    /// Write one property row; see [`PropertyLoader::add_props`].
    pub fn add_props<I, K, V>(
        &self,
        table: &str,
        detector: &str,
        time_range: Option<(Timestamp, Timestamp)>,
        values: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Scalar>,
    {
        let mut loader = self.begin_load()?;
        loader.add_props(table, detector, time_range, values)?;
        loader.commit()
    }

    // -- reads ---------------------------------------------------------------

    pub fn detector_id(&self, name: &str) -> Result<DetId> {
        let read_txn = self.db.begin_read()?;
        let names = read_txn.open_table(DET_NAMES)?;
        let id = names.get(name)?.map(|g| g.value());
        id.ok_or_else(|| CatalogError::UnknownDetector(name.to_string()))
    }

    pub fn detector_name(&self, id: DetId) -> Result<String> {
        let read_txn = self.db.begin_read()?;
        let dets = read_txn.open_table(DETS)?;
        let name = dets.get(id)?.map(|g| g.value().to_string());
        name.ok_or_else(|| CatalogError::UnknownDetector(format!("id {id}")))
    }

    /// Detector names, in id order, optionally restricted to those whose
    /// properties at `at` satisfy `filter`. Returns a `[name]` table.
    pub fn list_detectors(
        &self,
        filter: Option<&Filter>,
        at: impl Into<AtTime>,
    ) -> Result<ResultTable> {
        let schema = self.schema_guard()?;
        let read_txn = self.db.begin_read()?;
        let mut resolver = Resolver::new(&read_txn, at.into());
        let dets = all_detectors(&read_txn)?;
        let dets = apply_filter(&schema, &mut resolver, dets, filter)?;

        let mut out = ResultTable::typed([("name", Some(ColumnType::Str))])?;
        for d in dets {
            out.push_row(vec![Scalar::Str(d.name)])?;
        }
        Ok(out)
    }

    /// Resolve property values, one output row per selected detector.
    ///
    /// Rows follow the order of the detector selection (id order for
    /// [`Detectors::All`]); columns are the requested property names as
    /// spelled, or every `table.column` when none are given. A property with
    /// no row covering the query time is null.
    pub fn get_properties(&self, query: &PropertyQuery) -> Result<ResultTable> {
        let schema = self.schema_guard()?;
        let names = match &query.properties {
            Some(names) => names.clone(),
            None => schema.all_columns(),
        };
        let columns = schema.expand(&names)?;
        let keys: Vec<String> = columns.iter().map(|(k, _)| k.clone()).collect();

        let read_txn = self.db.begin_read()?;
        let mut resolver = Resolver::new(&read_txn, query.at);
        let selected = select_detectors(&read_txn, &query.detectors)?;
        let selected = apply_filter(&schema, &mut resolver, selected, query.filter.as_ref())?;

        let mut dets = ResultTable::new([JOIN_KEY]);
        for d in &selected {
            dets.push_row(vec![Scalar::Str(d.name.clone())])?;
        }
        let lookup = resolve_table(&mut resolver, &selected, &columns, JOIN_KEY)?;
        dets.merge(&lookup, &[JOIN_KEY])?.project(&keys)
    }

    /// Append property columns to an existing result that has a `name`
    /// column, preserving its rows and order.
    pub fn with_properties(
        &self,
        table: &ResultTable,
        properties: &[String],
        at: impl Into<AtTime>,
    ) -> Result<ResultTable> {
        let schema = self.schema_guard()?;
        let columns = schema.expand(properties)?;
        let read_txn = self.db.begin_read()?;
        let mut resolver = Resolver::new(&read_txn, at.into());
        let dets = detectors_in_table(&read_txn, table)?;
        let lookup = resolve_table(&mut resolver, &dets, &columns, "name")?;
        table.merge(&lookup, &["name"])
    }

    // -- validation and maintenance -------------------------------------------

    /// Walk one property table in `(det_id, time0)` order and fail on the
    /// first negative-size interval or pair of overlapping intervals.
    ///
    /// Empty intervals (`time0 == time1`) are logically absent and never
    /// overlap anything. A negative interval is reported with the same row
    /// on both sides.
    pub fn check_intervals(&self, table: &str) -> Result<()> {
        self.schema_guard()?.table(table)?;
        let read_txn = self.db.begin_read()?;
        let rows = read_txn.open_table(rows_def(&rows_table_name(table)))?;

        let mut last: Option<(DetId, RowSpan)> = None;
        for entry in rows.iter()? {
            let (key, value) = entry?;
            let (det_id, time0, _) = key.value();
            let time1 = serde_json::from_str::<StoredRow>(value.value())?.time1;
            let span = RowSpan { time0, time1 };

            if time1 < time0 {
                return Err(CatalogError::OverlapDetected {
                    table: table.to_string(),
                    det_id,
                    row_a: span.clone(),
                    row_b: span,
                });
            }
            if time0 == time1 {
                continue;
            }
            if let Some((prev_det, prev)) = &last {
                if *prev_det == det_id && time0 < prev.time1 {
                    return Err(CatalogError::OverlapDetected {
                        table: table.to_string(),
                        det_id,
                        row_a: prev.clone(),
                        row_b: span,
                    });
                }
            }
            last = Some((det_id, span));
        }
        Ok(())
    }

    /// Run [`check_intervals`](Self::check_intervals) on every table.
    pub fn validate(&self) -> Result<()> {
        let tables: Vec<String> = self.schema_guard()?.table_names().map(String::from).collect();
        for table in &tables {
            self.check_intervals(table)?;
        }
        tracing::debug!(tables = tables.len(), "property store validated");
        Ok(())
    }

    /// Discard data that is not relevant, in place.
    ///
    /// With `keep`, detectors not listed are removed along with all their
    /// rows (every listed name must exist). With `window`, property rows
    /// whose interval does not intersect it are removed.
    pub fn reduce(&self, keep: Option<&[&str]>, window: Option<TimeWindow>) -> Result<()> {
        let schema = self.schema()?;
        let write_txn = self.db.begin_write()?;

        let mut dropped: HashSet<DetId> = HashSet::new();
        if let Some(keep) = keep {
            let mut keep_ids = HashSet::with_capacity(keep.len());
            {
                let names = write_txn.open_table(DET_NAMES)?;
                for name in keep {
                    let id = names.get(*name)?.map(|g| g.value());
                    keep_ids.insert(
                        id.ok_or_else(|| CatalogError::UnknownDetector(name.to_string()))?,
                    );
                }
            }
            let mut dets = write_txn.open_table(DETS)?;
            let mut names = write_txn.open_table(DET_NAMES)?;
            let mut doomed = Vec::new();
            for entry in dets.iter()? {
                let (id, name) = entry?;
                if !keep_ids.contains(&id.value()) {
                    doomed.push((id.value(), name.value().to_string()));
                }
            }
            for (id, name) in doomed {
                dets.remove(id)?;
                names.remove(name.as_str())?;
                dropped.insert(id);
            }
        }

        let mut removed_rows = 0usize;
        for table in schema.table_names() {
            let mut rows = write_txn.open_table(rows_def(&rows_table_name(table)))?;
            let mut doomed: Vec<RowKey> = Vec::new();
            for entry in rows.iter()? {
                let (key, value) = entry?;
                let (det_id, time0, seq) = key.value();
                let time1 = serde_json::from_str::<StoredRow>(value.value())?.time1;
                let outside = window.is_some_and(|w| !w.intersects(time0, time1));
                if outside || dropped.contains(&det_id) {
                    doomed.push((det_id, time0, seq));
                }
            }
            removed_rows += doomed.len();
            for key in doomed {
                rows.remove(key)?;
            }
        }

        write_txn.commit()?;
        tracing::debug!(
            detectors = dropped.len(),
            rows = removed_rows,
            "reduced property store"
        );
        Ok(())
    }

    /// Duplicate this store into a new file, which must not exist yet.
    pub fn copy_to(&self, path: impl AsRef<Path>) -> Result<PropertyStore> {
        let db = storage::create_new_file(path.as_ref())?;
        self.copy_into(db)
    }

    /// Duplicate this store into memory.
    pub fn snapshot_in_memory(&self) -> Result<PropertyStore> {
        self.copy_into(storage::open_in_memory()?)
    }

    fn copy_into(&self, db: Database) -> Result<PropertyStore> {
        let tables: Vec<String> = self.schema_guard()?.table_names().map(String::from).collect();
        let read_txn = self.db.begin_read()?;
        let write_txn = db.begin_write()?;
        storage::copy_table(&read_txn, &write_txn, DETS)?;
        storage::copy_table(&read_txn, &write_txn, DET_NAMES)?;
        storage::copy_table(&read_txn, &write_txn, PROPERTY_TABLES)?;
        storage::copy_table(&read_txn, &write_txn, META)?;
        for table in &tables {
            let name = rows_table_name(table);
            storage::copy_table(&read_txn, &write_txn, rows_def(&name))?;
        }
        write_txn.commit()?;
        Self::init(db)
    }
}

// ---------------------------------------------------------------------------
// Bulk loading
// ---------------------------------------------------------------------------

/// A write transaction over a [`PropertyStore`].
pub struct PropertyLoader<'a> {
    store: &'a PropertyStore,
    txn: WriteTransaction,
    /// Working copy of the schema; published to the store on commit.
    schema: PropertySchema,
    rows: usize,
}

impl PropertyLoader<'_> {
    pub fn create_table(&mut self, name: &str, columns: Vec<ColumnDescriptor>) -> Result<()> {
        if !self.schema.insert(name, columns.clone())? {
            return Ok(());
        }
        let json = serde_json::to_string(&columns)?;
        {
            let mut tables = self.txn.open_table(PROPERTY_TABLES)?;
            tables.insert(name, json.as_str())?;
        }
        self.txn.open_table(rows_def(&rows_table_name(name)))?;
        tracing::debug!(table = name, columns = columns.len(), "created property table");
        Ok(())
    }

    pub fn add_detector(&mut self, name: &str) -> Result<DetId> {
        let existing = {
            let names = self.txn.open_table(DET_NAMES)?;
            let id = names.get(name)?.map(|g| g.value());
            id
        };
        if let Some(id) = existing {
            return Ok(id);
        }

        let id = next_counter(&self.txn, NEXT_DET_ID)?;
        {
            let mut dets = self.txn.open_table(DETS)?;
            dets.insert(id, name)?;
        }
        {
            let mut names = self.txn.open_table(DET_NAMES)?;
            names.insert(name, id)?;
        }
        Ok(id)
    }

    /// Add one row of `table` for `detector`, valid over `time_range`
    /// (default [`ALWAYS`]). The detector is registered if new.
    ///
    /// Every value is type-checked against the column's descriptor; columns
    /// left out are stored as null, which only nullable columns accept.
    pub fn add_props<I, K, V>(
        &mut self,
        table: &str,
        detector: &str,
        time_range: Option<(Timestamp, Timestamp)>,
        values: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Scalar>,
    {
        let (time0, time1) = time_range.unwrap_or(ALWAYS);
        if time1 < time0 {
            return Err(CatalogError::InvalidRange(format!(
                "time1 {time1} < time0 {time0} for {detector} in {table}"
            )));
        }
        let values = typed_row(self.schema.table(table)?, table, values)?;
        let det_id = self.add_detector(detector)?;
        let seq = next_counter(&self.txn, NEXT_ROW_SEQ)?;

        let payload = serde_json::to_string(&StoredRow { time1, values })?;
        {
            let mut rows = self.txn.open_table(rows_def(&rows_table_name(table)))?;
            rows.insert((det_id, time0, seq), payload.as_str())?;
        }
        self.rows += 1;
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        let PropertyLoader {
            store,
            txn,
            schema,
            rows,
        } = self;
        txn.commit()?;
        *store
            .schema
            .write()
            .map_err(|_| CatalogError::Internal("property schema lock poisoned".into()))? = schema;
        tracing::debug!(rows, "committed property load");
        Ok(())
    }
}

fn next_counter(txn: &WriteTransaction, key: &str) -> Result<u64> {
    let mut meta = txn.open_table(META)?;
    let current: u64 = meta.get(key)?.map(|g| g.value()).unwrap_or(1);
    meta.insert(key, current + 1)?;
    Ok(current)
}

fn typed_row<I, K, V>(columns: &[ColumnDescriptor], table: &str, values: I) -> Result<Vec<Scalar>>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<Scalar>,
{
    let mut row: Vec<Option<Scalar>> = vec![None; columns.len()];
    for (k, v) in values {
        let k = k.as_ref();
        let i = columns
            .iter()
            .position(|c| c.name == k)
            .ok_or_else(|| CatalogError::UnknownColumn(format!("{table}.{k}")))?;
        row[i] = Some(columns[i].ty.coerce(&format!("{table}.{k}"), v.into())?);
    }
    row.into_iter()
        .zip(columns)
        .map(|(v, c)| match v {
            Some(v) => Ok(v),
            None => c.ty.coerce(&format!("{table}.{}", c.name), Scalar::Null),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolves property values inside one read transaction, caching the row
/// found for each `(table, detector)` pair.
struct Resolver<'t> {
    txn: &'t ReadTransaction,
    at: AtTime,
    cache: HashMap<(String, DetId), Option<StoredRow>>,
}

impl<'t> Resolver<'t> {
    fn new(txn: &'t ReadTransaction, at: AtTime) -> Self {
        Self {
            txn,
            at,
            cache: HashMap::new(),
        }
    }

    fn value(&mut self, det: &Detector, col: &ColumnRef) -> Result<Scalar> {
        let key = (col.table.clone(), det.id);
        if !self.cache.contains_key(&key) {
            let row = self.active_row(&col.table, det)?;
            self.cache.insert(key.clone(), row);
        }
        Ok(self.cache[&key]
            .as_ref()
            .and_then(|r| r.values.get(col.index).cloned())
            .unwrap_or(Scalar::Null))
    }

    fn values(&mut self, det: &Detector, cols: &[ColumnRef]) -> Result<Vec<Scalar>> {
        cols.iter().map(|c| self.value(det, c)).collect()
    }

    /// The row of `table` active for `det` at `self.at`, if any.
    fn active_row(&self, table: &str, det: &Detector) -> Result<Option<StoredRow>> {
        let rows = self.txn.open_table(rows_def(&rows_table_name(table)))?;
        // Only rows starting at or before `t` can cover it.
        let upper = match self.at {
            AtTime::At(t) => t,
            AtTime::Current => i64::MAX,
        };

        let mut hits: Vec<(Timestamp, StoredRow)> = Vec::new();
        for entry in rows.range((det.id, i64::MIN, 0)..=(det.id, upper, u64::MAX))? {
            let (key, value) = entry?;
            let (_, time0, _) = key.value();
            let row: StoredRow = serde_json::from_str(value.value())?;
            if self.at.covers(time0, row.time1) {
                hits.push((time0, row));
            }
        }

        if hits.len() > 1 {
            return Err(CatalogError::AmbiguousProperty {
                table: table.to_string(),
                detector: det.name.clone(),
                at: self.at.to_string(),
                rows: hits
                    .iter()
                    .map(|(time0, r)| RowSpan {
                        time0: *time0,
                        time1: r.time1,
                    })
                    .collect(),
            });
        }
        Ok(hits.pop().map(|(_, r)| r))
    }
}

fn all_detectors(txn: &ReadTransaction) -> Result<Vec<Detector>> {
    let dets = txn.open_table(DETS)?;
    let mut out = Vec::new();
    for entry in dets.iter()? {
        let (id, name) = entry?;
        out.push(Detector {
            id: id.value(),
            name: name.value().to_string(),
        });
    }
    Ok(out)
}

fn select_detectors(txn: &ReadTransaction, selection: &Detectors) -> Result<Vec<Detector>> {
    match selection {
        Detectors::All => all_detectors(txn),
        Detectors::Names(names) => detectors_by_name(txn, names.iter().map(String::as_str)),
        Detectors::Ids(ids) => {
            let dets = txn.open_table(DETS)?;
            ids.iter()
                .map(|&id| {
                    let name = dets.get(id)?.map(|g| g.value().to_string());
                    name.map(|name| Detector { id, name })
                        .ok_or_else(|| CatalogError::UnknownDetector(format!("id {id}")))
                })
                .collect()
        }
        Detectors::Table(table) => detectors_in_table(txn, table),
    }
}

fn detectors_by_name<'n>(
    txn: &ReadTransaction,
    names: impl Iterator<Item = &'n str>,
) -> Result<Vec<Detector>> {
    let ids = txn.open_table(DET_NAMES)?;
    names
        .map(|name| {
            let id = ids.get(name)?.map(|g| g.value());
            id.map(|id| Detector {
                id,
                name: name.to_string(),
            })
            .ok_or_else(|| CatalogError::UnknownDetector(name.to_string()))
        })
        .collect()
}

fn detectors_in_table(txn: &ReadTransaction, table: &ResultTable) -> Result<Vec<Detector>> {
    let names = table
        .column("name")?
        .into_iter()
        .map(|v| {
            v.as_str().ok_or_else(|| CatalogError::TypeMismatch {
                column: "name".to_string(),
                expected: ColumnType::Str,
                found: v.clone(),
            })
        })
        .collect::<Result<Vec<&str>>>()?;
    detectors_by_name(txn, names.into_iter())
}

fn apply_filter(
    schema: &PropertySchema,
    resolver: &mut Resolver<'_>,
    dets: Vec<Detector>,
    filter: Option<&Filter>,
) -> Result<Vec<Detector>> {
    let Some(filter) = filter else {
        return Ok(dets);
    };
    let compiled = filter.compile(schema)?;
    if compiled.rejects_all() {
        return Ok(Vec::new());
    }
    let mut kept = Vec::new();
    for det in dets {
        if compiled.matches(&resolver.values(&det, &compiled.columns)?) {
            kept.push(det);
        }
    }
    Ok(kept)
}

/// One row per distinct detector: `[name_key, <columns>...]`.
fn resolve_table(
    resolver: &mut Resolver<'_>,
    dets: &[Detector],
    columns: &[(String, ColumnRef)],
    name_key: &str,
) -> Result<ResultTable> {
    let mut out = ResultTable::typed(
        std::iter::once((name_key.to_string(), Some(ColumnType::Str)))
            .chain(columns.iter().map(|(k, c)| (k.clone(), Some(c.ty)))),
    )?;
    let refs: Vec<ColumnRef> = columns.iter().map(|(_, c)| c.clone()).collect();
    let mut seen = HashSet::with_capacity(dets.len());
    for det in dets {
        if !seen.insert(det.id) {
            continue;
        }
        let mut row = vec![Scalar::Str(det.name.clone())];
        row.extend(resolver.values(det, &refs)?);
        out.push_row(row)?;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
