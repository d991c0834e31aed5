//! Error types for all RowboatDB operations.

use std::io;
use thiserror::Error;

/// Top-level error type for RowboatDB operations.
///
/// Every failure aborts the current operation immediately; none are
/// retried internally. Each variant is a distinct, machine-checkable
/// kind carrying a human-readable message.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The handle was never registered, or has already been
    /// disconnected (handles are never reused).
    #[error("no connection with id {0}")]
    NoConnection(u64),

    /// No usable index exists for the (table, key) pair. A missing
    /// table and a missing key are indistinguishable at this layer.
    #[error("table or key not found: no index for '{table}'.'{key}'")]
    NotFound { table: String, key: String },

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table is empty: {0}")]
    TableIsEmpty(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key value not found under key '{0}'")]
    KeyValueNotFound(String),

    /// No lookup has positioned a cursor for this (connection, table)
    /// yet, or the last positioned row was removed with no neighbor.
    #[error("cursor is not opened for table '{0}'")]
    CursorNotOpened(String),

    /// The cursor is already at the first or last row of its index.
    /// Cursor state is left untouched.
    #[error("no more data available")]
    NoMoreDataAvailable,
}

/// Low-level storage failures: I/O errors and malformed on-disk state.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupted file: {0}")]
    Corrupted(String),

    #[error("data directory is locked by another engine instance")]
    DirectoryLocked,

    #[error("unsupported key value: expected number or string, got {0}")]
    BadKeyValue(String),

    #[error("no row stored at offset {0}")]
    NoRowAtOffset(u64),
}

pub type Result<T> = std::result::Result<T, Error>;
