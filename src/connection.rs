//! Connection registry: issues never-reused handles and tracks the
//! last cursor opened per (connection, table).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::types::{Connection, ConnectionId};

/// Connection ids are allocated from one process-wide counter, so they
/// stay unique for the lifetime of the process even across engines and
/// disconnects.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Registry of live connection handles and their per-table cursors.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    cursors: HashMap<ConnectionId, HashMap<String, Cursor>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next handle and register an empty cursor map for it.
    pub fn connect(&mut self) -> Connection {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        self.cursors.insert(id, HashMap::new());
        Connection { id }
    }

    /// Remove a handle. Double-disconnect fails with `NO_CONNECTION`.
    pub fn disconnect(&mut self, conn: Connection) -> Result<()> {
        self.cursors
            .remove(&conn.id)
            .map(|_| ())
            .ok_or(Error::NoConnection(conn.id))
    }

    /// Fail with `NO_CONNECTION` unless the handle is registered.
    pub fn ensure_connected(&self, conn: Connection) -> Result<()> {
        if self.cursors.contains_key(&conn.id) {
            Ok(())
        } else {
            Err(Error::NoConnection(conn.id))
        }
    }

    /// The cursor stored for (connection, table); `Unopened` when no
    /// lookup has positioned one yet.
    pub fn cursor(&self, conn: Connection, table: &str) -> Result<Cursor> {
        let cursors = self.cursors.get(&conn.id).ok_or(Error::NoConnection(conn.id))?;
        Ok(cursors.get(table).cloned().unwrap_or_default())
    }

    /// Store the cursor for (connection, table).
    pub fn store_cursor(&mut self, conn: Connection, table: &str, cursor: Cursor) -> Result<()> {
        let cursors = self
            .cursors
            .get_mut(&conn.id)
            .ok_or(Error::NoConnection(conn.id))?;
        cursors.insert(table.to_string(), cursor);
        Ok(())
    }

    /// Drop every connection's cursor state for `table` (its backing
    /// files are gone or replaced).
    pub fn purge_table(&mut self, table: &str) {
        for cursors in self.cursors.values_mut() {
            cursors.remove(table);
        }
    }
}
