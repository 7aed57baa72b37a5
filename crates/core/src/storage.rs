//! Thin helpers over `redb` shared by both catalogs.

use std::path::Path;

use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};

use crate::error::{CatalogError, Result};

/// Open or create a file-backed store.
pub(crate) fn open_file(path: &Path) -> Result<Database> {
    Ok(Database::create(path)?)
}

/// Open a store that must already exist; never creates a file.
pub(crate) fn open_existing(path: &Path) -> Result<Database> {
    if !path.is_file() {
        return Err(CatalogError::Storage(format!(
            "{} does not exist",
            path.display()
        )));
    }
    Ok(Database::open(path)?)
}

/// Create a fresh file-backed store, refusing to reuse an existing file.
pub(crate) fn create_new_file(path: &Path) -> Result<Database> {
    if path.exists() {
        return Err(CatalogError::Storage(format!(
            "{} already exists",
            path.display()
        )));
    }
    open_file(path)
}

/// An ephemeral store; data is lost when the handle is dropped.
pub(crate) fn open_in_memory() -> Result<Database> {
    let backend = redb::backends::InMemoryBackend::new();
    Ok(Database::builder().create_with_backend(backend)?)
}

/// Copy every entry of one table from `src` into the same table in `dst`.
pub(crate) fn copy_table<K, V>(
    src: &ReadTransaction,
    dst: &WriteTransaction,
    def: TableDefinition<K, V>,
) -> Result<u64>
where
    K: redb::Key + 'static,
    V: redb::Value + 'static,
{
    let from = src.open_table(def)?;
    let mut to = dst.open_table(def)?;
    let mut n = 0;
    for entry in from.iter()? {
        let (k, v) = entry?;
        to.insert(k.value(), v.value())?;
        n += 1;
    }
    Ok(n)
}
