//! Per-(connection, table) cursor state machine over one key's index.
//!
//! A cursor tracks one index entry plus a position inside that entry's
//! offset bucket. Navigation moves within the bucket first, then across
//! entries in sort order. Transitions build a new cursor value, so a
//! failed move never leaves partial state behind.

use std::ops::Bound::{Excluded, Unbounded};

use crate::error::{Error, Result};
use crate::index::{CompositeKey, Index};
use crate::types::Offset;

/// Cursor state stored per (connection, table).
///
/// A cursor starts [`Cursor::Unopened`] and becomes positioned only via
/// a lookup operation; it reverts to unopened when the only row it
/// pointed at is removed and no neighbor exists.
#[derive(Debug, Clone, Default)]
pub enum Cursor {
    #[default]
    Unopened,
    Open(OpenCursor),
}

/// A positioned cursor: the tracked key name, the current index entry,
/// and the position within that entry's offset bucket.
#[derive(Debug, Clone)]
pub struct OpenCursor {
    pub key_name: String,
    pub entry: CompositeKey,
    pub bucket_pos: usize,
}

impl OpenCursor {
    /// The row offset under the cursor.
    ///
    /// Fails with `KEY_VALUE_NOT_FOUND` when the tracked entry or the
    /// bucket position no longer exists (another connection removed it).
    pub fn offset(&self, index: &Index) -> Result<Offset> {
        index
            .get(&self.entry)
            .and_then(|bucket| bucket.get(self.bucket_pos))
            .copied()
            .ok_or_else(|| Error::KeyValueNotFound(self.key_name.clone()))
    }

    /// Advance one row: first within the current bucket, then to offset
    /// position 0 of the next entry in sort order. Fails with
    /// `NO_MORE_DATA_AVAILABLE` past the last entry; `self` is untouched
    /// either way.
    pub fn advanced(&self, index: &Index) -> Result<OpenCursor> {
        if let Some(bucket) = index.get(&self.entry) {
            if self.bucket_pos + 1 < bucket.len() {
                return Ok(OpenCursor {
                    bucket_pos: self.bucket_pos + 1,
                    ..self.clone()
                });
            }
        }
        // The stored entry doubles as a range bound, so advancing still
        // works when the entry itself has been removed.
        let (entry, _) = index
            .range((Excluded(&self.entry), Unbounded))
            .next()
            .ok_or(Error::NoMoreDataAvailable)?;
        Ok(OpenCursor {
            key_name: self.key_name.clone(),
            entry: entry.clone(),
            bucket_pos: 0,
        })
    }

    /// Move one row back: first within the current bucket, then to the
    /// last offset of the previous entry in sort order.
    pub fn retreated(&self, index: &Index) -> Result<OpenCursor> {
        if self.bucket_pos > 0 {
            return Ok(OpenCursor {
                bucket_pos: self.bucket_pos - 1,
                ..self.clone()
            });
        }
        let (entry, bucket) = index
            .range((Unbounded, Excluded(&self.entry)))
            .next_back()
            .ok_or(Error::NoMoreDataAvailable)?;
        Ok(OpenCursor {
            key_name: self.key_name.clone(),
            entry: entry.clone(),
            bucket_pos: bucket.len() - 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyColumns;
    use serde_json::json;

    /// Index over emails: a@ has two offsets, b@ and c@ one each.
    fn sample_index() -> Index {
        let columns = KeyColumns::Single("email".to_string());
        let mut index = Index::new();
        for (email, offsets) in [
            ("a@mail.com", vec![0, 40]),
            ("b@mail.com", vec![80]),
            ("c@mail.com", vec![120]),
        ] {
            let key = CompositeKey::from_lookup(&json!(email), &columns).unwrap();
            index.insert(key, offsets);
        }
        index
    }

    fn cursor_at(index: &Index, email: &str, bucket_pos: usize) -> OpenCursor {
        let columns = KeyColumns::Single("email".to_string());
        let entry = CompositeKey::from_lookup(&json!(email), &columns).unwrap();
        assert!(index.contains_key(&entry));
        OpenCursor {
            key_name: "emailKey".to_string(),
            entry,
            bucket_pos,
        }
    }

    #[test]
    fn test_advance_within_bucket_then_across_entries() {
        let index = sample_index();
        let start = cursor_at(&index, "a@mail.com", 0);

        let second = start.advanced(&index).unwrap();
        assert_eq!(second.offset(&index).unwrap(), 40);

        let third = second.advanced(&index).unwrap();
        assert_eq!(third.offset(&index).unwrap(), 80);
        assert_eq!(third.bucket_pos, 0);
    }

    #[test]
    fn test_advance_past_last_entry() {
        let index = sample_index();
        let last = cursor_at(&index, "c@mail.com", 0);

        match last.advanced(&index) {
            Err(Error::NoMoreDataAvailable) => {}
            other => panic!("expected NoMoreDataAvailable, got {other:?}"),
        }
        // The failed move left the cursor usable.
        assert_eq!(last.offset(&index).unwrap(), 120);
    }

    #[test]
    fn test_retreat_lands_on_last_bucket_offset() {
        let index = sample_index();
        let cursor = cursor_at(&index, "b@mail.com", 0);

        let back = cursor.retreated(&index).unwrap();
        assert_eq!(back.bucket_pos, 1, "should land on a@'s last offset");
        assert_eq!(back.offset(&index).unwrap(), 40);

        let front = back.retreated(&index).unwrap();
        assert_eq!(front.offset(&index).unwrap(), 0);

        match front.retreated(&index) {
            Err(Error::NoMoreDataAvailable) => {}
            other => panic!("expected NoMoreDataAvailable, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_entry_still_navigates() {
        let mut index = sample_index();
        let cursor = cursor_at(&index, "b@mail.com", 0);

        // Another connection removed the entry under the cursor.
        index.remove(&cursor.entry);

        match cursor.offset(&index) {
            Err(Error::KeyValueNotFound(_)) => {}
            other => panic!("expected KeyValueNotFound, got {other:?}"),
        }
        // The stored entry still works as a range bound in both directions.
        assert_eq!(cursor.advanced(&index).unwrap().offset(&index).unwrap(), 120);
        assert_eq!(cursor.retreated(&index).unwrap().offset(&index).unwrap(), 40);
    }
}
