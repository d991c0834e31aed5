//! Core types: connection handles, key definitions, on-disk file naming.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Process-unique connection identifier (monotonically increasing,
/// never reused).
pub type ConnectionId = u64;

/// Byte position of a row's first character within its table's row file.
pub type Offset = u64;

/// Name of the table-metadata file inside the engine directory.
pub const META_FILE: &str = "tables_meta.json";

/// Extension of per-table row files.
pub const ROW_FILE_EXT: &str = "txt";

/// Extension of per-(table, key) index files.
pub const INDEX_FILE_EXT: &str = "json";

/// Opaque connection handle returned by
/// [`RowboatDB::connect`](crate::RowboatDB::connect).
///
/// Wraps a process-unique id; the engine owns all connection state, the
/// caller only ever holds a copy of the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    pub(crate) id: ConnectionId,
}

impl Connection {
    /// The raw connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

/// The ordered column list backing one secondary key.
///
/// Serialized untagged: a single column stays a bare string in
/// `tables_meta.json`, multiple columns become an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyColumns {
    Single(String),
    Multiple(Vec<String>),
}

impl KeyColumns {
    /// The column names in declared order.
    pub fn columns(&self) -> &[String] {
        match self {
            KeyColumns::Single(column) => std::slice::from_ref(column),
            KeyColumns::Multiple(columns) => columns,
        }
    }
}

impl From<&str> for KeyColumns {
    fn from(column: &str) -> Self {
        KeyColumns::Single(column.to_string())
    }
}

impl From<Vec<String>> for KeyColumns {
    fn from(columns: Vec<String>) -> Self {
        KeyColumns::Multiple(columns)
    }
}

/// Declared keys of one table: key name to ordered column list.
pub type KeyMap = BTreeMap<String, KeyColumns>;

/// Path of a table's row file inside the engine directory.
pub fn row_file(dir: &Path, table: &str) -> PathBuf {
    dir.join(format!("{table}.{ROW_FILE_EXT}"))
}

/// Path of a (table, key) index file inside the engine directory.
pub fn index_file(dir: &Path, table: &str, key: &str) -> PathBuf {
    dir.join(format!("{table}_{key}.{INDEX_FILE_EXT}"))
}
