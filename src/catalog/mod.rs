//! Table metadata: the `tables_meta.json` document mapping each table
//! name to its declared keys.
//!
//! The metadata file and every per-key index file must stay consistent:
//! a key present here has a corresponding index file, and vice versa.
//! The engine enforces that by mutating both under the exclusive lock.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, StorageError};
use crate::types::{KeyColumns, KeyMap, META_FILE};

/// One table's metadata: its declared keys by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub keys: KeyMap,
}

/// The whole metadata document: table name to table metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TablesMeta(pub BTreeMap<String, TableMeta>);

impl TablesMeta {
    /// Metadata for one table, if declared.
    pub fn table(&self, name: &str) -> Option<&TableMeta> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Columns of one declared key, or why it cannot be resolved.
    pub fn key_columns(&self, table: &str, key: &str) -> Result<&KeyColumns> {
        let meta = self
            .0
            .get(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
        meta.keys
            .get(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }
}

/// Load the metadata document. A missing file reads as an empty
/// document, the state of a freshly initialized engine directory.
pub fn load(dir: &Path) -> Result<TablesMeta> {
    let path = dir.join(META_FILE);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(TablesMeta::default()),
        Err(e) => return Err(StorageError::Io(e).into()),
    };
    let meta = serde_json::from_str(&text)
        .map_err(|e| StorageError::Corrupted(format!("{META_FILE}: {e}")))?;
    Ok(meta)
}

/// Persist the metadata document, pretty-printed.
pub fn save(dir: &Path, meta: &TablesMeta) -> Result<()> {
    let text = serde_json::to_string_pretty(meta)
        .map_err(|e| StorageError::Corrupted(format!("failed to serialize {META_FILE}: {e}")))?;
    fs::write(dir.join(META_FILE), text).map_err(StorageError::Io)?;
    Ok(())
}
