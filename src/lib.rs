//! # RowboatDB
//!
//! An embeddable, file-backed JSON document store.
//!
//! RowboatDB keeps tables of JSON documents in newline-delimited row
//! files, addressed by one or more declared secondary keys. Each key is
//! backed by an ordered index mapping composite key values to row byte
//! offsets, supporting exact-match lookup, min/max lookup, and
//! bidirectional cursor traversal. Multiple connections may use one
//! engine concurrently from multiple threads.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rowboat::{KeyColumns, KeyMap, RowboatDB};
//! use serde_json::json;
//!
//! // Open (or create) an engine over a data directory.
//! let db = RowboatDB::open("my_database").unwrap();
//! let conn = db.connect();
//!
//! // Declare a table with one secondary key over the "email" column.
//! let mut keys = KeyMap::new();
//! keys.insert("emailKey".to_string(), KeyColumns::Single("email".to_string()));
//! db.create_table("clients", keys, conn).unwrap();
//!
//! // Append a row, indexed under emailKey.
//! db.append_row(
//!     "clients",
//!     &json!({"emailKey": "alice@mail.com"}),
//!     json!({"message": "hello, Alice"}),
//!     conn,
//! )
//! .unwrap();
//!
//! // Point lookup opens a cursor and returns the row.
//! let row = db
//!     .get_row_by_key("clients", &json!({"emailKey": "alice@mail.com"}), conn)
//!     .unwrap();
//! assert_eq!(row["message"], "hello, Alice");
//! ```

pub mod api;
pub mod catalog;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod index;
pub mod storage;
pub mod types;

pub use api::RowboatDB;
pub use error::{Error, Result, StorageError};
pub use types::{Connection, KeyColumns, KeyMap};
