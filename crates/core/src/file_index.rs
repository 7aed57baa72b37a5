//! Observation file index.
//!
//! Maps each observation to the files holding its data, grouped by detset
//! (a named group of detectors that is always stored together) and ordered
//! by the first sample each file contains. File names are stored relative
//! to a catalog root supplied at open time; the index never touches the
//! data files themselves.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, ReadableTableMetadata,
    TableDefinition, WriteTransaction,
};
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};
use crate::storage;
use crate::value::Scalar;

/// `(detset, det)` membership.
const DETSETS: TableDefinition<(&str, &str), ()> = TableDefinition::new("detsets");
/// `(det, detset)`: the same pairs, for reverse lookup.
const DET_DETSETS: TableDefinition<(&str, &str), ()> = TableDefinition::new("det_detsets");
/// `(obs_id, detset, sample_start, name)` → JSON [`FileRecord`].
const FILES: TableDefinition<(&str, &str, i64, &str), &str> = TableDefinition::new("files");
/// `name` → `(obs_id, detset, sample_start)`: each file name is registered once.
const FILE_NAMES: TableDefinition<&str, (&str, &str, i64)> = TableDefinition::new("file_names");
/// `(obs_id, tag)` → JSON [`Scalar`].
const OBS_TAGS: TableDefinition<(&str, &str), &str> = TableDefinition::new("obs_tags");
const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

const LAYOUT_VERSION: u32 = 1;
const VERSION_KEY: &str = "obsfiledb_version";

/// Store file name used by [`FileIndex::for_dir`].
pub const DEFAULT_FILE_NAME: &str = "obsfiledb.redb";

/// One registered data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the catalog root.
    pub name: String,
    pub obs_id: String,
    pub detset: String,
    pub sample_start: i64,
    /// `None` when the end of the file's sample range is not recorded.
    pub sample_stop: Option<i64>,
}

/// A file record with its name joined onto the catalog root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFile {
    pub path: PathBuf,
    pub sample_start: i64,
    pub sample_stop: Option<i64>,
}

/// A condition on an observation-level tag. An observation without the
/// tag never satisfies a predicate on it.
#[derive(Debug, Clone, PartialEq)]
pub enum ObsPredicate {
    Eq {
        tag: String,
        value: Scalar,
    },
    /// `lo <= value < hi`; either bound may be omitted.
    Range {
        tag: String,
        lo: Option<Scalar>,
        hi: Option<Scalar>,
    },
}

impl ObsPredicate {
    pub fn eq(tag: impl Into<String>, value: impl Into<Scalar>) -> Self {
        ObsPredicate::Eq {
            tag: tag.into(),
            value: value.into(),
        }
    }

    pub fn range(
        tag: impl Into<String>,
        lo: Option<impl Into<Scalar>>,
        hi: Option<impl Into<Scalar>>,
    ) -> Self {
        ObsPredicate::Range {
            tag: tag.into(),
            lo: lo.map(Into::into),
            hi: hi.map(Into::into),
        }
    }

    fn tag(&self) -> &str {
        match self {
            ObsPredicate::Eq { tag, .. } | ObsPredicate::Range { tag, .. } => tag,
        }
    }

    fn holds(&self, value: &Scalar) -> bool {
        match self {
            ObsPredicate::Eq { value: want, .. } => value.compare(want) == Some(Ordering::Equal),
            ObsPredicate::Range { lo, hi, .. } => {
                let above = lo.as_ref().is_none_or(|lo| {
                    matches!(value.compare(lo), Some(Ordering::Greater | Ordering::Equal))
                });
                let below = hi
                    .as_ref()
                    .is_none_or(|hi| value.compare(hi) == Some(Ordering::Less));
                above && below
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleConflictKind {
    /// `second` starts before `first` ends.
    Overlap,
    /// Samples between the end of `first` and the start of `second` are
    /// not covered by any file.
    Gap,
}

/// Two files of one observation and detset that do not partition the
/// sample range cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleConflict {
    pub obs_id: String,
    pub detset: String,
    pub kind: SampleConflictKind,
    pub first: FileRecord,
    pub second: FileRecord,
}

/// Catalog of observation data files.
///
/// ```rust,no_run
/// use todcat::FileIndex;
///
/// let index = FileIndex::for_dir("/data/archive").unwrap();
/// for (detset, files) in index.resolve_files("obs0", None).unwrap() {
///     println!("{detset}: {} files", files.len());
/// }
/// ```
pub struct FileIndex {
    db: Database,
    root: PathBuf,
}

impl FileIndex {
    /// Open or create an index. The root defaults to the directory holding
    /// the store file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = storage::open_file(path)?;
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        tracing::debug!(path = %path.display(), root = %root.display(), "opened file index");
        Self::init(db, root)
    }

    /// Open an index that must already exist, e.g. for a read-only service.
    /// A missing file fails with `Storage` instead of creating an empty
    /// index.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = storage::open_existing(path)?;
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        tracing::debug!(path = %path.display(), root = %root.display(), "opened existing file index");
        Self::init(db, root)
    }

    /// Open `dir/obsfiledb.redb`, rooted at `dir`.
    pub fn for_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Self::open(dir.join(DEFAULT_FILE_NAME)).map(|index| index.with_root(dir))
    }

    /// Create an in-memory index. Its root is empty, so resolved paths are
    /// the stored names.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(storage::open_in_memory()?, PathBuf::new())
    }

    fn init(db: Database, root: PathBuf) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(DETSETS)?;
        write_txn.open_table(DET_DETSETS)?;
        write_txn.open_table(FILES)?;
        write_txn.open_table(FILE_NAMES)?;
        write_txn.open_table(OBS_TAGS)?;
        {
            let mut meta = write_txn.open_table(META)?;
            let version = meta.get(VERSION_KEY)?.map(|g| g.value().to_string());
            match version {
                None => {
                    meta.insert(VERSION_KEY, LAYOUT_VERSION.to_string().as_str())?;
                }
                Some(v) => {
                    let v: u32 = v.parse().map_err(|_| {
                        CatalogError::Schema(format!("unreadable file index version {v:?}"))
                    })?;
                    if v > LAYOUT_VERSION {
                        return Err(CatalogError::Schema(format!(
                            "file index layout version {v} is newer than supported {LAYOUT_VERSION}"
                        )));
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(Self { db, root })
    }

    /// Resolve file names against `root` instead of the default.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join a stored relative name onto the root. Pure path composition.
    pub fn full_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn close(self) {
        drop(self.db);
        tracing::debug!("closed file index");
    }

    /// Number of registered files.
    pub fn file_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let files = read_txn.open_table(FILES)?;
        Ok(files.len()? as usize)
    }

    // -- writes --------------------------------------------------------------

    /// Start a bulk load. Nothing is visible until
    /// [`FileIndexLoader::commit`]; dropping the loader rolls back.
    pub fn begin_load(&self) -> Result<FileIndexLoader> {
        Ok(FileIndexLoader {
            txn: self.db.begin_write()?,
            files: 0,
            members: 0,
        })
    }

    pub fn add_detset<I, S>(&self, detset: &str, detectors: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut loader = self.begin_load()?;
        loader.add_detset(detset, detectors)?;
        loader.commit()
    }

    pub fn add_file(
        &self,
        name: &str,
        obs_id: &str,
        detset: &str,
        sample_start: i64,
        sample_stop: Option<i64>,
    ) -> Result<()> {
        let mut loader = self.begin_load()?;
        loader.add_file(name, obs_id, detset, sample_start, sample_stop)?;
        loader.commit()
    }

    pub fn set_obs_tag(&self, obs_id: &str, tag: &str, value: impl Into<Scalar>) -> Result<()> {
        let mut loader = self.begin_load()?;
        loader.set_obs_tag(obs_id, tag, value)?;
        loader.commit()
    }

    // -- reads ---------------------------------------------------------------

    /// Every observation with at least one file, sorted, keeping only those
    /// whose tags satisfy all `predicates`.
    pub fn list_observations(&self, predicates: &[ObsPredicate]) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let files = read_txn.open_table(FILES)?;
        let mut all: Vec<String> = Vec::new();
        for entry in files.iter()? {
            let (key, _) = entry?;
            let (obs_id, ..) = key.value();
            if all.last().map(String::as_str) != Some(obs_id) {
                all.push(obs_id.to_string());
            }
        }
        if predicates.is_empty() {
            return Ok(all);
        }

        let tags = read_txn.open_table(OBS_TAGS)?;
        let mut kept = Vec::new();
        'obs: for obs_id in all {
            for p in predicates {
                let value = match tags.get((obs_id.as_str(), p.tag()))? {
                    Some(raw) => serde_json::from_str::<Scalar>(raw.value())?,
                    None => continue 'obs,
                };
                if !p.holds(&value) {
                    continue 'obs;
                }
            }
            kept.push(obs_id);
        }
        Ok(kept)
    }

    /// Tags recorded for one observation.
    pub fn obs_tags(&self, obs_id: &str) -> Result<IndexMap<String, Scalar>> {
        let read_txn = self.db.begin_read()?;
        let tags = read_txn.open_table(OBS_TAGS)?;
        let mut out = IndexMap::new();
        for entry in tags.range((obs_id, "")..)? {
            let (key, value) = entry?;
            let (obs, tag) = key.value();
            if obs != obs_id {
                break;
            }
            out.insert(tag.to_string(), serde_json::from_str(value.value())?);
        }
        Ok(out)
    }

    /// Detsets with at least one file in the observation, sorted.
    pub fn list_detsets(&self, obs_id: &str) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let detsets = detsets_in_obs(&read_txn, obs_id)?;
        if detsets.is_empty() {
            return Err(CatalogError::UnknownObservation(obs_id.to_string()));
        }
        Ok(detsets)
    }

    /// Members of a detset, sorted.
    pub fn list_detectors(&self, detset: &str) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let members = pairs_with_first(&read_txn, DETSETS, detset)?;
        if members.is_empty() {
            return Err(CatalogError::UnknownDetset(detset.to_string()));
        }
        Ok(members)
    }

    /// Detsets a detector belongs to, sorted. Empty if it belongs to none.
    pub fn detsets_of(&self, det: &str) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        pairs_with_first(&read_txn, DET_DETSETS, det)
    }

    /// Files of one observation, grouped by detset and ordered by
    /// `sample_start` (then name).
    ///
    /// `detsets` defaults to every detset present in the observation. A
    /// requested detset that is registered but has no files here maps to an
    /// empty list; one that is neither fails with `UnknownDetset`.
    pub fn resolve_files(
        &self,
        obs_id: &str,
        detsets: Option<&[&str]>,
    ) -> Result<IndexMap<String, Vec<ResolvedFile>>> {
        let read_txn = self.db.begin_read()?;
        let present = detsets_in_obs(&read_txn, obs_id)?;
        if present.is_empty() {
            return Err(CatalogError::UnknownObservation(obs_id.to_string()));
        }
        let wanted: Vec<String> = match detsets {
            None => present.clone(),
            Some(names) => names.iter().map(|s| s.to_string()).collect(),
        };

        let mut out = IndexMap::with_capacity(wanted.len());
        for detset in wanted {
            if !present.contains(&detset) && pairs_with_first(&read_txn, DETSETS, &detset)?.is_empty()
            {
                return Err(CatalogError::UnknownDetset(detset));
            }
            let files = files_in(&read_txn, obs_id, &detset)?
                .into_iter()
                .map(|f| self.resolve(f))
                .collect();
            out.insert(detset, files);
        }
        Ok(out)
    }

    /// Files of one observation that carry data for `det`, grouped by the
    /// detsets it belongs to.
    pub fn files_for_detector(
        &self,
        obs_id: &str,
        det: &str,
    ) -> Result<IndexMap<String, Vec<ResolvedFile>>> {
        let detsets = self.detsets_of(det)?;
        if detsets.is_empty() {
            return Err(CatalogError::UnknownDetector(det.to_string()));
        }
        let present: HashSet<String> = self.list_detsets(obs_id)?.into_iter().collect();
        let here: Vec<&str> = detsets
            .iter()
            .map(String::as_str)
            .filter(|d| present.contains(*d))
            .collect();
        self.resolve_files(obs_id, Some(here.as_slice()))
    }

    /// Report every overlap or gap between consecutive files of each
    /// (observation, detset), for one observation or all of them.
    ///
    /// Nothing enforces the partition at write time and reads never fail
    /// on it; this is the explicit check. A file whose `sample_stop` is
    /// unknown is open-ended: every later file of the detset overlaps it.
    pub fn check_consistency(&self, obs_id: Option<&str>) -> Result<Vec<SampleConflict>> {
        let observations = match obs_id {
            Some(obs) => vec![obs.to_string()],
            None => self.list_observations(&[])?,
        };
        let read_txn = self.db.begin_read()?;
        let mut conflicts = Vec::new();
        for obs in &observations {
            let detsets = detsets_in_obs(&read_txn, obs)?;
            if detsets.is_empty() {
                return Err(CatalogError::UnknownObservation(obs.clone()));
            }
            for detset in &detsets {
                check_partition(files_in(&read_txn, obs, detset)?, &mut conflicts);
            }
        }
        tracing::debug!(
            observations = observations.len(),
            conflicts = conflicts.len(),
            "checked file partitions"
        );
        Ok(conflicts)
    }

    /// Duplicate the index into a new file, which must not exist yet. The
    /// copy keeps this index's root.
    pub fn copy_to(&self, path: impl AsRef<Path>) -> Result<FileIndex> {
        let db = storage::create_new_file(path.as_ref())?;
        {
            let read_txn = self.db.begin_read()?;
            let write_txn = db.begin_write()?;
            storage::copy_table(&read_txn, &write_txn, DETSETS)?;
            storage::copy_table(&read_txn, &write_txn, DET_DETSETS)?;
            let files = storage::copy_table(&read_txn, &write_txn, FILES)?;
            storage::copy_table(&read_txn, &write_txn, FILE_NAMES)?;
            storage::copy_table(&read_txn, &write_txn, OBS_TAGS)?;
            storage::copy_table(&read_txn, &write_txn, META)?;
            write_txn.commit()?;
            tracing::debug!(files, "copied file index");
        }
        Self::init(db, self.root.clone())
    }

    fn resolve(&self, f: FileRecord) -> ResolvedFile {
        ResolvedFile {
            path: self.full_path(&f.name),
            sample_start: f.sample_start,
            sample_stop: f.sample_stop,
        }
    }
}

fn check_partition(files: Vec<FileRecord>, out: &mut Vec<SampleConflict>) {
    // The file whose range reaches furthest so far, and where it ends.
    let mut frontier: Option<(FileRecord, Option<i64>)> = None;
    for file in files {
        let Some((prev, end)) = frontier.take() else {
            let end = file.sample_stop;
            frontier = Some((file, end));
            continue;
        };
        let kind = match end.map(|end| file.sample_start.cmp(&end)) {
            None | Some(Ordering::Less) => Some(SampleConflictKind::Overlap),
            Some(Ordering::Greater) => Some(SampleConflictKind::Gap),
            Some(Ordering::Equal) => None,
        };
        if let Some(kind) = kind {
            out.push(SampleConflict {
                obs_id: file.obs_id.clone(),
                detset: file.detset.clone(),
                kind,
                first: prev.clone(),
                second: file.clone(),
            });
        }
        let stop = file.sample_stop;
        frontier = match (end, stop) {
            (None, _) => Some((prev, None)),
            (Some(end), Some(stop)) if stop <= end => Some((prev, Some(end))),
            _ => Some((file, stop)),
        };
    }
}

/// Distinct detsets with files under `obs_id`, in key order.
fn detsets_in_obs(txn: &ReadTransaction, obs_id: &str) -> Result<Vec<String>> {
    let files = txn.open_table(FILES)?;
    let mut out: Vec<String> = Vec::new();
    for entry in files.range((obs_id, "", i64::MIN, "")..)? {
        let (key, _) = entry?;
        let (obs, detset, ..) = key.value();
        if obs != obs_id {
            break;
        }
        if out.last().map(String::as_str) != Some(detset) {
            out.push(detset.to_string());
        }
    }
    Ok(out)
}

fn files_in(txn: &ReadTransaction, obs_id: &str, detset: &str) -> Result<Vec<FileRecord>> {
    let files = txn.open_table(FILES)?;
    let mut out = Vec::new();
    for entry in files.range((obs_id, detset, i64::MIN, "")..)? {
        let (key, value) = entry?;
        let (obs, ds, ..) = key.value();
        if obs != obs_id || ds != detset {
            break;
        }
        out.push(serde_json::from_str(value.value())?);
    }
    Ok(out)
}

/// Second elements of every `(first, second)` key in a membership table.
fn pairs_with_first(
    txn: &ReadTransaction,
    def: TableDefinition<'static, (&'static str, &'static str), ()>,
    first: &str,
) -> Result<Vec<String>> {
    let table = txn.open_table(def)?;
    let mut out = Vec::new();
    for entry in table.range((first, "")..)? {
        let (key, _) = entry?;
        let (a, b) = key.value();
        if a != first {
            break;
        }
        out.push(b.to_string());
    }
    Ok(out)
}

/// A write transaction over a [`FileIndex`].
pub struct FileIndexLoader {
    txn: WriteTransaction,
    files: usize,
    members: usize,
}

impl FileIndexLoader {
    /// Register detector membership. Re-adding a pair is a no-op.
    pub fn add_detset<I, S>(&mut self, detset: &str, detectors: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if detset.is_empty() {
            return Err(CatalogError::Schema("detset name may not be empty".into()));
        }
        let mut forward = self.txn.open_table(DETSETS)?;
        let mut reverse = self.txn.open_table(DET_DETSETS)?;
        for det in detectors {
            let det = det.as_ref();
            if forward.insert((detset, det), ())?.is_none() {
                self.members += 1;
            }
            reverse.insert((det, detset), ())?;
        }
        Ok(())
    }

    /// Register one file. A name may be registered only once, whatever its
    /// observation, detset or start.
    pub fn add_file(
        &mut self,
        name: &str,
        obs_id: &str,
        detset: &str,
        sample_start: i64,
        sample_stop: Option<i64>,
    ) -> Result<()> {
        if name.is_empty() || name.starts_with('/') || Path::new(name).is_absolute() {
            return Err(CatalogError::InvalidPath(name.to_string()));
        }
        if sample_start < 0 {
            return Err(CatalogError::InvalidRange(format!(
                "{name}: sample_start {sample_start} is negative"
            )));
        }
        if let Some(stop) = sample_stop {
            if stop < sample_start {
                return Err(CatalogError::InvalidRange(format!(
                    "{name}: sample_stop {stop} < sample_start {sample_start}"
                )));
            }
        }

        let record = FileRecord {
            name: name.to_string(),
            obs_id: obs_id.to_string(),
            detset: detset.to_string(),
            sample_start,
            sample_stop,
        };
        let mut names = self.txn.open_table(FILE_NAMES)?;
        if let Some(hit) = names.get(name)? {
            let (obs, ds, _) = hit.value();
            return Err(CatalogError::DuplicateFile {
                name: name.to_string(),
                obs_id: obs.to_string(),
                detset: ds.to_string(),
            });
        }
        names.insert(name, (obs_id, detset, sample_start))?;

        let json = serde_json::to_string(&record)?;
        let mut files = self.txn.open_table(FILES)?;
        files.insert((obs_id, detset, sample_start, name), json.as_str())?;
        self.files += 1;
        Ok(())
    }

    pub fn set_obs_tag(&mut self, obs_id: &str, tag: &str, value: impl Into<Scalar>) -> Result<()> {
        let json = serde_json::to_string(&value.into())?;
        let mut tags = self.txn.open_table(OBS_TAGS)?;
        tags.insert((obs_id, tag), json.as_str())?;
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        tracing::debug!(
            files = self.files,
            members = self.members,
            "committed file index load"
        );
        Ok(())
    }
}
