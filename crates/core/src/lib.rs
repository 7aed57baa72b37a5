//! todcat: metadata catalog for large time-ordered detector datasets.
//!
//! Two independent catalogs answer questions about a data archive without
//! opening any data file:
//!
//! - [`FileIndex`]: which files hold a given observation's data, for which
//!   detsets (detector groups) and which sample ranges.
//! - [`PropertyStore`]: what value each detector property had at a given
//!   time. Properties live in *property tables* whose rows carry a
//!   semi-open validity interval `[time0, time1)`.
//!
//! A [`ManifestDb`] maps index data (exact keys and value ranges) to the
//! archive file holding the matching data.
//!
//! Both return [`ResultTable`]s (or plain ordered collections), and accept
//! result tables back as input, so queries chain.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use todcat::{AtTime, ColumnDescriptor, ColumnType, Filter, PropertyQuery, PropertyStore};
//!
//! let store = PropertyStore::open("detdb.redb").unwrap();
//! store
//!     .create_table("base", vec![ColumnDescriptor::new("freq", ColumnType::Str)])
//!     .unwrap();
//! store.add_props("base", "det00", Some((0, 100)), [("freq", "f090")]).unwrap();
//!
//! let dets = store
//!     .list_detectors(Some(&Filter::exact([("freq", "f090")])), AtTime::At(50))
//!     .unwrap();
//! let props = store
//!     .get_properties(&PropertyQuery::new().detectors_from(dets).at(50_i64))
//!     .unwrap();
//! ```

pub mod error;
pub mod file_index;
pub mod filter;
pub mod manifest;
pub mod property_store;
pub mod result_table;
pub mod schema;
mod storage;
pub mod value;

use chrono::{DateTime, Utc};

pub use error::{CatalogError, Result, RowSpan};
pub use file_index::{
    FileIndex, FileIndexLoader, FileRecord, ObsPredicate, ResolvedFile, SampleConflict,
    SampleConflictKind,
};
pub use filter::Filter;
pub use manifest::{
    EntryValue, FieldRole, ManifestDb, ManifestLoader, ManifestScheme, SchemeField,
};
pub use property_store::{Detectors, PropertyLoader, PropertyQuery, PropertyStore, TimeWindow};
pub use result_table::{Column, ResultTable, Row, StructuredArray};
pub use schema::{ColumnRef, PropertySchema};
pub use value::{ColumnDescriptor, ColumnType, Scalar};

/// Internal detector id. Used for joins only; not stable across rebuilds.
pub type DetId = u64;

/// Property validity times, in unix seconds.
pub type Timestamp = i64;

/// The interval given to rows added without an explicit time range: it
/// spans 1970 to 2096, i.e. "all reasonable times".
pub const ALWAYS: (Timestamp, Timestamp) = (0, 4_000_000_000);

/// The instant a property query resolves at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AtTime {
    /// No time filtering. A detector's single row in each table is used;
    /// more than one non-empty row is an [`CatalogError::AmbiguousProperty`].
    #[default]
    Current,
    /// The row whose interval satisfies `time0 <= t < time1`.
    At(Timestamp),
}

impl AtTime {
    /// Does `[time0, time1)` apply at this instant?
    pub fn covers(self, time0: Timestamp, time1: Timestamp) -> bool {
        match self {
            AtTime::Current => time0 < time1,
            AtTime::At(t) => time0 <= t && t < time1,
        }
    }
}

impl From<Timestamp> for AtTime {
    fn from(t: Timestamp) -> Self {
        AtTime::At(t)
    }
}

impl From<DateTime<Utc>> for AtTime {
    fn from(t: DateTime<Utc>) -> Self {
        AtTime::At(t.timestamp())
    }
}

impl std::fmt::Display for AtTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AtTime::Current => f.write_str("current"),
            AtTime::At(t) => write!(f, "t={t}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_is_semi_open() {
        assert!(AtTime::At(0).covers(0, 100));
        assert!(AtTime::At(99).covers(0, 100));
        assert!(!AtTime::At(100).covers(0, 100));
        assert!(!AtTime::At(-1).covers(0, 100));
    }

    #[test]
    fn empty_intervals_never_apply() {
        assert!(!AtTime::At(5).covers(5, 5));
        assert!(!AtTime::Current.covers(5, 5));
        assert!(AtTime::Current.covers(ALWAYS.0, ALWAYS.1));
    }

    #[test]
    fn datetimes_convert_to_unix_seconds() {
        let t: DateTime<Utc> = "2024-03-01T00:00:00Z".parse().unwrap();
        assert_eq!(AtTime::from(t), AtTime::At(1_709_251_200));
    }
}
