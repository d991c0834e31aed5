//! The engine: connection lifecycle, table and key management, row
//! storage, lookups, and cursor navigation, under one process-wide
//! reader/writer lock.
//!
//! Locking discipline: every mutation (`create_table`, `remove_table`,
//! `add_key`, `remove_key`, `append_row`, `remove_row`) holds the state
//! lock exclusively for its full duration; lookups and navigation hold
//! it shared. Lazy index-cache population needs exclusive access even
//! on a read path, so it runs as its own critical section, fully
//! released before the surrounding shared section begins (the lock is
//! not reentrant, and there is no upgrade). The connection registry has
//! its own mutex and is never held while the state lock is acquired.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, trace};

use crate::catalog::{self, TableMeta, TablesMeta};
use crate::connection::ConnectionRegistry;
use crate::cursor::{Cursor, OpenCursor};
use crate::error::{Error, Result, StorageError};
use crate::index::{self, CompositeKey, Index};
use crate::storage::lock::DirLock;
use crate::storage::rows;
use crate::types::{index_file, row_file, Connection, KeyColumns, KeyMap, Offset};

/// Mutable shared state guarded by the process-wide reader/writer lock:
/// the lazily populated index cache. The metadata file, index files and
/// row files live on disk and are only touched while this lock is held.
#[derive(Default)]
struct SharedState {
    indexes: HashMap<(String, String), Index>,
}

struct DatabaseInner {
    dir: PathBuf,
    state: RwLock<SharedState>,
    connections: Mutex<ConnectionRegistry>,
    _dir_lock: DirLock,
}

/// The main engine handle.
///
/// `RowboatDB` is cheaply clonable (`Arc`-based) and `Send + Sync`;
/// clones share one engine. Callers interact through [`Connection`]
/// handles issued by [`RowboatDB::connect`]. Sharing a single handle
/// between threads is unsupported: it can corrupt that handle's cursor
/// state, though never committed data.
#[derive(Clone)]
pub struct RowboatDB {
    inner: Arc<DatabaseInner>,
}

enum Direction {
    Forward,
    Backward,
}

impl RowboatDB {
    /// Open an engine over the given data directory, creating the
    /// directory if needed. The directory is advisorily locked for the
    /// engine's lifetime.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(StorageError::Io)?;
        let dir_lock = DirLock::acquire(dir)?;

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                dir: dir.to_path_buf(),
                state: RwLock::new(SharedState::default()),
                connections: Mutex::new(ConnectionRegistry::new()),
                _dir_lock: dir_lock,
            }),
        })
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Register a new connection and return its handle. Never fails.
    pub fn connect(&self) -> Connection {
        let conn = self.inner.connections.lock().connect();
        trace!(id = conn.id(), "connect");
        conn
    }

    /// Invalidate a handle. Any later use of it fails with
    /// `NO_CONNECTION`; so does disconnecting twice.
    pub fn disconnect(&self, conn: Connection) -> Result<()> {
        trace!(id = conn.id(), "disconnect");
        self.inner.connections.lock().disconnect(conn)
    }

    fn ensure_connected(&self, conn: Connection) -> Result<()> {
        self.inner.connections.lock().ensure_connected(conn)
    }

    // -----------------------------------------------------------------------
    // Table and key management
    // -----------------------------------------------------------------------

    /// Declare a table and its keys, creating one empty index file per
    /// key.
    ///
    /// An existing table of the same name is overwritten rather than
    /// rejected; its cached indexes and every connection's cursors for
    /// it are dropped, and each declared key starts from a fresh index.
    pub fn create_table(&self, table: &str, keys: KeyMap, conn: Connection) -> Result<()> {
        self.ensure_connected(conn)?;
        debug!(table, "create table");

        let mut state = self.inner.state.write();
        let mut meta = catalog::load(&self.inner.dir)?;
        for key_name in keys.keys() {
            let path = index_file(&self.inner.dir, table, key_name);
            index::dump_index(&path, key_name, &Index::new())?;
        }
        meta.0.insert(table.to_string(), TableMeta { keys });
        catalog::save(&self.inner.dir, &meta)?;
        state.indexes.retain(|(t, _), _| t != table);
        drop(state);

        self.inner.connections.lock().purge_table(table);
        Ok(())
    }

    /// Remove a table: its metadata entry, every key's index file, and
    /// the row file.
    pub fn remove_table(&self, table: &str, conn: Connection) -> Result<()> {
        self.ensure_connected(conn)?;
        debug!(table, "remove table");

        let mut state = self.inner.state.write();
        let mut meta = catalog::load(&self.inner.dir)?;
        let entry = meta
            .0
            .remove(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
        for key_name in entry.keys.keys() {
            remove_file_if_exists(&index_file(&self.inner.dir, table, key_name))?;
        }
        remove_file_if_exists(&row_file(&self.inner.dir, table))?;
        catalog::save(&self.inner.dir, &meta)?;
        state.indexes.retain(|(t, _), _| t != table);
        drop(state);

        self.inner.connections.lock().purge_table(table);
        Ok(())
    }

    /// Declare an additional key on an existing table, building its
    /// index from every stored row in one scan.
    pub fn add_key(
        &self,
        table: &str,
        key_name: &str,
        columns: KeyColumns,
        conn: Connection,
    ) -> Result<()> {
        self.ensure_connected(conn)?;
        debug!(table, key_name, "add key");

        let mut state = self.inner.state.write();
        let mut meta = catalog::load(&self.inner.dir)?;
        if !meta.contains(table) {
            return Err(Error::TableNotFound(table.to_string()));
        }

        let mut parsed = Vec::new();
        for (offset, line) in rows::scan_lines(&row_file(&self.inner.dir, table))? {
            parsed.push((offset, parse_row(&line, offset)?));
        }
        let built = index::build_from_rows(&parsed, &columns)?;
        index::dump_index(&index_file(&self.inner.dir, table, key_name), key_name, &built)?;

        if let Some(entry) = meta.0.get_mut(table) {
            entry.keys.insert(key_name.to_string(), columns);
        }
        catalog::save(&self.inner.dir, &meta)?;
        state.indexes.insert(state_key(table, key_name), built);
        Ok(())
    }

    /// Remove a declared key: its metadata entry, cached index, and
    /// index file.
    pub fn remove_key(&self, table: &str, key_name: &str, conn: Connection) -> Result<()> {
        self.ensure_connected(conn)?;
        debug!(table, key_name, "remove key");

        let mut state = self.inner.state.write();
        let mut meta = catalog::load(&self.inner.dir)?;
        let entry = meta
            .0
            .get_mut(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
        entry
            .keys
            .remove(key_name)
            .ok_or_else(|| Error::KeyNotFound(key_name.to_string()))?;
        state.indexes.remove(&state_key(table, key_name));
        remove_file_if_exists(&index_file(&self.inner.dir, table, key_name))?;
        catalog::save(&self.inner.dir, &meta)?;
        Ok(())
    }

    /// All table names, sorted.
    pub fn list_tables(&self, conn: Connection) -> Result<Vec<String>> {
        self.ensure_connected(conn)?;
        let _state = self.inner.state.read();
        let meta = catalog::load(&self.inner.dir)?;
        Ok(meta.0.keys().cloned().collect())
    }

    /// A table's declared keys.
    pub fn describe_table(&self, table: &str, conn: Connection) -> Result<KeyMap> {
        self.ensure_connected(conn)?;
        let _state = self.inner.state.read();
        let meta = catalog::load(&self.inner.dir)?;
        meta.table(table)
            .map(|t| t.keys.clone())
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Exact-match lookup on one declared key. Opens a cursor at the
    /// first offset of the matching bucket and returns that row.
    ///
    /// `filter` holds a single `{keyName: value}` pair; the value is a
    /// bare scalar for single-column keys or an object naming every
    /// column otherwise.
    pub fn get_row_by_key(&self, table: &str, filter: &Value, conn: Connection) -> Result<Value> {
        self.ensure_connected(conn)?;
        let (key_name, key_value) = filter
            .as_object()
            .and_then(|map| map.iter().next())
            .ok_or_else(|| Error::KeyNotFound("key filter is empty".to_string()))?;
        self.ensure_index_loaded(table, key_name)?;

        let (cursor, row) = {
            let state = self.inner.state.read();
            let index = state
                .indexes
                .get(&state_key(table, key_name))
                .ok_or_else(|| not_found(table, key_name))?;
            let meta = catalog::load(&self.inner.dir)?;
            let columns = meta.key_columns(table, key_name)?;
            let target = CompositeKey::from_lookup(key_value, columns)?;

            let (entry, bucket) = index
                .get_key_value(&target)
                .ok_or_else(|| Error::KeyValueNotFound(key_name.clone()))?;
            let row = self.read_row(table, bucket[0])?;
            let cursor = OpenCursor {
                key_name: key_name.clone(),
                entry: entry.clone(),
                bucket_pos: 0,
            };
            (cursor, row)
        };

        self.inner
            .connections
            .lock()
            .store_cursor(conn, table, Cursor::Open(cursor))?;
        Ok(row)
    }

    /// Endpoint lookup: the row whose composite value under `key_name`
    /// is the minimum, or the maximum when `reversed`. Opens a cursor
    /// at the bucket's first (respectively last) offset.
    pub fn get_row_in_sorted_table(
        &self,
        table: &str,
        key_name: &str,
        reversed: bool,
        conn: Connection,
    ) -> Result<Value> {
        self.ensure_connected(conn)?;
        self.ensure_index_loaded(table, key_name)?;

        let (cursor, row) = {
            let state = self.inner.state.read();
            let index = state
                .indexes
                .get(&state_key(table, key_name))
                .ok_or_else(|| not_found(table, key_name))?;

            let endpoint = if reversed {
                index.iter().next_back()
            } else {
                index.iter().next()
            };
            let (entry, bucket) =
                endpoint.ok_or_else(|| Error::TableIsEmpty(table.to_string()))?;
            let bucket_pos = if reversed { bucket.len() - 1 } else { 0 };
            let row = self.read_row(table, bucket[bucket_pos])?;
            let cursor = OpenCursor {
                key_name: key_name.to_string(),
                entry: entry.clone(),
                bucket_pos,
            };
            (cursor, row)
        };

        self.inner
            .connections
            .lock()
            .store_cursor(conn, table, Cursor::Open(cursor))?;
        Ok(row)
    }

    /// Advance the connection's cursor for `table` one row forward and
    /// return that row. Fails with `NO_MORE_DATA_AVAILABLE` past the
    /// last row, leaving the cursor where it was.
    pub fn get_next_row(&self, table: &str, conn: Connection) -> Result<Value> {
        self.navigate(table, conn, Direction::Forward)
    }

    /// Move the connection's cursor for `table` one row back and return
    /// that row. Fails with `NO_MORE_DATA_AVAILABLE` before the first
    /// row, leaving the cursor where it was.
    pub fn get_prev_row(&self, table: &str, conn: Connection) -> Result<Value> {
        self.navigate(table, conn, Direction::Backward)
    }

    fn navigate(&self, table: &str, conn: Connection, direction: Direction) -> Result<Value> {
        self.ensure_connected(conn)?;
        let cursor = self.current_cursor(conn, table)?;
        self.ensure_index_loaded(table, &cursor.key_name)?;

        let (moved, row) = {
            let state = self.inner.state.read();
            let index = state
                .indexes
                .get(&state_key(table, &cursor.key_name))
                .ok_or_else(|| not_found(table, &cursor.key_name))?;
            let moved = match direction {
                Direction::Forward => cursor.advanced(index)?,
                Direction::Backward => cursor.retreated(index)?,
            };
            let row = self.read_row(table, moved.offset(index)?)?;
            (moved, row)
        };

        self.inner
            .connections
            .lock()
            .store_cursor(conn, table, Cursor::Open(moved))?;
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Rows
    // -----------------------------------------------------------------------

    /// Append a document to a table, registering its offset under every
    /// key named in `key_values`, and folding those keys' column values
    /// back into the stored document so the row is self-describing.
    ///
    /// All preconditions are validated before any index is touched, so
    /// a failed append never leaves some indexes updated and others
    /// not.
    pub fn append_row(
        &self,
        table: &str,
        key_values: &Value,
        document: Value,
        conn: Connection,
    ) -> Result<()> {
        self.ensure_connected(conn)?;
        debug!(table, "append row");

        let mut state = self.inner.state.write();
        let meta = catalog::load(&self.inner.dir)?;
        let table_meta = meta
            .table(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
        let pairs = key_values
            .as_object()
            .ok_or_else(|| StorageError::BadKeyValue(key_values.to_string()))?;

        // Validate first: every named key must be declared and its
        // composite value must project cleanly.
        let mut projected: Vec<(String, CompositeKey)> = Vec::with_capacity(pairs.len());
        for (key_name, value) in pairs {
            let columns = table_meta
                .keys
                .get(key_name)
                .ok_or_else(|| Error::KeyNotFound(key_name.clone()))?;
            projected.push((key_name.clone(), CompositeKey::from_lookup(value, columns)?));
        }

        let row_path = row_file(&self.inner.dir, table);
        let offset = rows::end_offset(&row_path)?;

        let mut document = document;
        for (key_name, composite) in &projected {
            self.load_index_locked(&mut state, &meta, table, key_name)?;
            let index = state
                .indexes
                .get_mut(&state_key(table, key_name))
                .ok_or_else(|| not_found(table, key_name))?;
            index.entry(composite.clone()).or_default().push(offset);
            index::dump_index(&index_file(&self.inner.dir, table, key_name), key_name, index)?;
            composite.fold_into(&mut document);
        }

        let line = serde_json::to_string(&document)
            .map_err(|e| StorageError::Corrupted(format!("failed to serialize row: {e}")))?;
        rows::append_line(&row_path, &line)?;
        Ok(())
    }

    /// Remove the row under the connection's current cursor for
    /// `table`.
    ///
    /// The cursor is repositioned forward, then backward; when neither
    /// neighbor exists it reverts to not-opened and a fresh lookup is
    /// required. Every declared key's index is updated: the removed
    /// offset leaves its bucket, and every offset past the removed line
    /// shifts down by the line's byte length, because the row file is
    /// compacted in place and every later row changes address.
    pub fn remove_row(&self, table: &str, conn: Connection) -> Result<()> {
        self.ensure_connected(conn)?;
        let cursor = self.current_cursor(conn, table)?;
        debug!(table, "remove row");

        let mut state = self.inner.state.write();
        let meta = catalog::load(&self.inner.dir)?;
        let table_meta = meta
            .table(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
        let row_path = row_file(&self.inner.dir, table);

        self.load_index_locked(&mut state, &meta, table, &cursor.key_name)?;
        let tracked = state
            .indexes
            .get(&state_key(table, &cursor.key_name))
            .ok_or_else(|| not_found(table, &cursor.key_name))?;
        let removed_offset = cursor.offset(tracked)?;
        let (line, removed_len) = rows::read_line_at(&row_path, removed_offset)?;
        let removed_doc = parse_row(&line, removed_offset)?;

        // Pick the replacement position before anything mutates: the
        // next row on the tracked index, else the previous, else none.
        let target = match cursor.advanced(tracked).or_else(|_| cursor.retreated(tracked)) {
            Ok(neighbor) => {
                let offset = neighbor.offset(tracked)?;
                Some((neighbor.entry, offset))
            }
            Err(_) => None,
        };

        for (key_name, columns) in &table_meta.keys {
            self.load_index_locked(&mut state, &meta, table, key_name)?;
            let index = state
                .indexes
                .get_mut(&state_key(table, key_name))
                .ok_or_else(|| not_found(table, key_name))?;
            // Rows appended under only some keys have no bucket here;
            // the offset shift below still applies to this index.
            if let Ok(composite) = CompositeKey::project(&removed_doc, columns) {
                index::remove_offset(index, &composite, removed_offset);
            }
            index::shift_offsets(index, removed_offset, removed_len);
            index::dump_index(&index_file(&self.inner.dir, table, key_name), key_name, index)?;
        }

        rows::remove_line_at(&row_path, removed_offset, removed_len)?;

        let new_cursor = match target {
            Some((entry, offset)) => {
                let shifted = if offset > removed_offset {
                    offset - removed_len
                } else {
                    offset
                };
                let index = state
                    .indexes
                    .get(&state_key(table, &cursor.key_name))
                    .ok_or_else(|| not_found(table, &cursor.key_name))?;
                index
                    .get(&entry)
                    .and_then(|bucket| bucket.iter().position(|o| *o == shifted))
                    .map(|bucket_pos| {
                        Cursor::Open(OpenCursor {
                            key_name: cursor.key_name.clone(),
                            entry,
                            bucket_pos,
                        })
                    })
                    .unwrap_or_default()
            }
            None => Cursor::Unopened,
        };
        drop(state);

        self.inner
            .connections
            .lock()
            .store_cursor(conn, table, new_cursor)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Make sure the (table, key) index is cached, on behalf of a read
    /// path.
    ///
    /// Runs as its own exclusive critical section and returns with the
    /// lock fully released; a writer may interleave before the caller's
    /// shared section, so readers re-check the cache afterwards.
    fn ensure_index_loaded(&self, table: &str, key_name: &str) -> Result<()> {
        {
            let state = self.inner.state.read();
            if state.indexes.contains_key(&state_key(table, key_name)) {
                return Ok(());
            }
        }
        let mut state = self.inner.state.write();
        let meta = catalog::load(&self.inner.dir)?;
        self.load_index_locked(&mut state, &meta, table, key_name)
    }

    /// Load an index into the cache while the exclusive lock is already
    /// held (the lock is not reentrant; write paths must not reacquire
    /// it).
    fn load_index_locked(
        &self,
        state: &mut SharedState,
        meta: &TablesMeta,
        table: &str,
        key_name: &str,
    ) -> Result<()> {
        let cache_key = state_key(table, key_name);
        if state.indexes.contains_key(&cache_key) {
            return Ok(());
        }
        trace!(table, key_name, "loading index");
        let columns = meta
            .table(table)
            .and_then(|t| t.keys.get(key_name))
            .ok_or_else(|| not_found(table, key_name))?;
        let loaded = index::load_index(
            &index_file(&self.inner.dir, table, key_name),
            table,
            key_name,
            columns,
        )?;
        state.indexes.insert(cache_key, loaded);
        Ok(())
    }

    /// The connection's current cursor for `table`, after validating
    /// that the table exists and that a lookup has opened the cursor.
    fn current_cursor(&self, conn: Connection, table: &str) -> Result<OpenCursor> {
        {
            let _state = self.inner.state.read();
            let meta = catalog::load(&self.inner.dir)?;
            if !meta.contains(table) {
                return Err(Error::TableNotFound(table.to_string()));
            }
        }
        match self.inner.connections.lock().cursor(conn, table)? {
            Cursor::Open(cursor) => Ok(cursor),
            Cursor::Unopened => Err(Error::CursorNotOpened(table.to_string())),
        }
    }

    fn read_row(&self, table: &str, offset: Offset) -> Result<Value> {
        let (line, _) = rows::read_line_at(&row_file(&self.inner.dir, table), offset)?;
        parse_row(&line, offset)
    }
}

fn state_key(table: &str, key: &str) -> (String, String) {
    (table.to_string(), key.to_string())
}

fn not_found(table: &str, key: &str) -> Error {
    Error::NotFound {
        table: table.to_string(),
        key: key.to_string(),
    }
}

fn parse_row(line: &str, offset: Offset) -> Result<Value> {
    let doc = serde_json::from_str(line)
        .map_err(|e| StorageError::Corrupted(format!("row at offset {offset}: {e}")))?;
    Ok(doc)
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::Io(e).into()),
    }
}
