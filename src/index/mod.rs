//! Ordered secondary indexes: composite key values mapped to row-offset
//! buckets, plus the on-disk index-file codec.
//!
//! Each (table, key) pair owns one index file holding an array of
//! `{"<keyName>": <compositeKeyValue>, "offsets": [...]}` entries,
//! persisted in current sort order. In memory the index is a `BTreeMap`
//! from [`CompositeKey`] to its offset bucket. Keys are secondary and
//! non-unique: one entry may own several offsets, in insertion order.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::{json, Map, Value};

use crate::error::{Error, Result, StorageError};
use crate::types::{KeyColumns, Offset};

/// A single indexed field value. Only numbers and strings participate
/// in key ordering.
///
/// Numbers keep their original JSON representation, so an integer key
/// value folds back into the stored row as an integer; ordering and
/// equality always compare the numeric value, so `2` and `2.0` address
/// the same index entry.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Number(serde_json::Number),
    Str(String),
}

impl FieldValue {
    /// Convert a JSON value into an indexable field value. Anything
    /// other than a number or a string is rejected.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) if n.as_f64().is_some() => Ok(FieldValue::Number(n.clone())),
            Value::String(s) => Ok(FieldValue::Str(s.clone())),
            other => Err(StorageError::BadKeyValue(other.to_string()).into()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Number(n) => Value::Number(n.clone()),
            FieldValue::Str(s) => Value::String(s.clone()),
        }
    }
}

impl Ord for FieldValue {
    /// Total order over {number, string}: numbers compare numerically,
    /// strings lexicographically, and numbers sort before strings.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (FieldValue::Number(a), FieldValue::Number(b)) => {
                // from_json guarantees a numeric value exists.
                let a = a.as_f64().unwrap_or(f64::NAN);
                let b = b.as_f64().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
            (FieldValue::Str(a), FieldValue::Str(b)) => a.cmp(b),
            (FieldValue::Number(_), FieldValue::Str(_)) => Ordering::Less,
            (FieldValue::Str(_), FieldValue::Number(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FieldValue {}

/// The projection of a document onto a key definition's columns, each
/// value paired with its column name, in declared order.
///
/// Comparison walks the values field-by-field in that fixed order; the
/// first differing field decides. Column names never participate.
#[derive(Debug, Clone)]
pub struct CompositeKey {
    fields: Vec<(String, FieldValue)>,
}

impl CompositeKey {
    /// Project `columns` out of `doc`, in declared order. Every column
    /// must be present for comparisons to be meaningful, so a missing
    /// column fails with `KEY_NOT_FOUND`.
    pub fn project(doc: &Value, columns: &KeyColumns) -> Result<Self> {
        let mut fields = Vec::with_capacity(columns.columns().len());
        for column in columns.columns() {
            let value = doc.get(column).ok_or_else(|| {
                Error::KeyNotFound(format!("column '{column}' missing from document"))
            })?;
            fields.push((column.clone(), FieldValue::from_json(value)?));
        }
        Ok(Self { fields })
    }

    /// Build a composite key from a lookup value: a bare scalar for a
    /// single-column key, or an object naming every column otherwise.
    pub fn from_lookup(value: &Value, columns: &KeyColumns) -> Result<Self> {
        match columns.columns() {
            [column] if !value.is_object() => Ok(Self {
                fields: vec![(column.clone(), FieldValue::from_json(value)?)],
            }),
            _ => Self::project(value, columns),
        }
    }

    /// Serialize back to JSON, mirroring [`Self::from_lookup`]: a bare
    /// value for single-field keys, an object in declared order
    /// otherwise.
    pub fn to_json(&self) -> Value {
        match self.fields.as_slice() {
            [(_, value)] => value.to_json(),
            fields => {
                let mut map = Map::new();
                for (column, value) in fields {
                    map.insert(column.clone(), value.to_json());
                }
                Value::Object(map)
            }
        }
    }

    /// Fold the key's column values into `doc`, so the stored row is
    /// self-describing without consulting the index.
    pub fn fold_into(&self, doc: &mut Value) {
        if let Some(map) = doc.as_object_mut() {
            for (column, value) in &self.fields {
                map.insert(column.clone(), value.to_json());
            }
        }
    }

    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }
}

impl Ord for CompositeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((_, a), (_, b)) in self.fields.iter().zip(&other.fields) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                decided => return decided,
            }
        }
        // Arity differences cannot arise within one index; the tiebreak
        // only keeps the order total.
        self.fields.len().cmp(&other.fields.len())
    }
}

impl PartialOrd for CompositeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for CompositeKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CompositeKey {}

/// Ordered index for one (table, key) pair: composite key value to the
/// ordered, non-empty bucket of row offsets sharing that value.
pub type Index = BTreeMap<CompositeKey, Vec<Offset>>;

/// Load an index from its file. An absent or unparseable file surfaces
/// `NOT_FOUND`: at this layer a missing table and a missing key are
/// indistinguishable.
pub fn load_index(path: &Path, table: &str, key: &str, columns: &KeyColumns) -> Result<Index> {
    parse_index_file(path, key, columns).ok_or_else(|| Error::NotFound {
        table: table.to_string(),
        key: key.to_string(),
    })
}

fn parse_index_file(path: &Path, key: &str, columns: &KeyColumns) -> Option<Index> {
    let text = fs::read_to_string(path).ok()?;
    let entries: Vec<Value> = serde_json::from_str(&text).ok()?;

    let mut index = Index::new();
    for entry in &entries {
        let value = entry.get(key)?;
        let offsets: Vec<Offset> = entry
            .get("offsets")?
            .as_array()?
            .iter()
            .map(Value::as_u64)
            .collect::<Option<_>>()?;
        let composite = CompositeKey::from_lookup(value, columns).ok()?;
        index.insert(composite, offsets);
    }
    Some(index)
}

/// Persist an index in its current sorted iteration order, so the
/// on-disk order always mirrors the sort order.
pub fn dump_index(path: &Path, key: &str, index: &Index) -> Result<()> {
    let entries: Vec<Value> = index
        .iter()
        .map(|(composite, offsets)| {
            let mut entry = Map::new();
            entry.insert(key.to_string(), composite.to_json());
            entry.insert("offsets".to_string(), json!(offsets));
            Value::Object(entry)
        })
        .collect();

    let text = serde_json::to_string(&entries)
        .map_err(|e| StorageError::Corrupted(format!("failed to serialize index: {e}")))?;
    fs::write(path, text).map_err(StorageError::Io)?;
    Ok(())
}

/// Rebuild an index for a newly declared key by grouping row offsets by
/// composite value, preserving file order within each bucket.
pub fn build_from_rows(rows: &[(Offset, Value)], columns: &KeyColumns) -> Result<Index> {
    let mut index = Index::new();
    for (offset, doc) in rows {
        let composite = CompositeKey::project(doc, columns)?;
        index.entry(composite).or_default().push(*offset);
    }
    Ok(index)
}

/// Remove one offset from the bucket for `key_value`, dropping the
/// bucket entirely when that was its sole offset.
///
/// Rows may be indexed under only some of a table's keys, so an absent
/// bucket or offset is legitimate, not an error.
pub fn remove_offset(index: &mut Index, key_value: &CompositeKey, offset: Offset) {
    if let Some(bucket) = index.get_mut(key_value) {
        bucket.retain(|o| *o != offset);
        if bucket.is_empty() {
            index.remove(key_value);
        }
    }
}

/// Shift every offset greater than `removed` down by `len`: compacting
/// the row file changes the address of every row after the deletion
/// point.
pub fn shift_offsets(index: &mut Index, removed: Offset, len: u64) {
    for bucket in index.values_mut() {
        for offset in bucket.iter_mut() {
            if *offset > removed {
                *offset -= len;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn email_key() -> KeyColumns {
        KeyColumns::Single("email".to_string())
    }

    fn id_name_key() -> KeyColumns {
        KeyColumns::Multiple(vec!["id".to_string(), "name".to_string()])
    }

    fn num(value: f64) -> FieldValue {
        FieldValue::Number(serde_json::Number::from_f64(value).unwrap())
    }

    #[test]
    fn test_field_value_ordering() {
        let one = num(1.0);
        let two = num(2.0);
        let negative = num(-3.5);
        let alpha = FieldValue::Str("alpha".to_string());
        let beta = FieldValue::Str("beta".to_string());

        assert!(one < two);
        assert!(negative < one);
        assert!(alpha < beta);
        // Numbers sort before strings.
        assert!(two < alpha);
        // Equality is numeric, not representational.
        assert!(one == FieldValue::Number(serde_json::Number::from(1)));
    }

    #[test]
    fn test_composite_ordering_by_declared_column_order() {
        let columns = id_name_key();
        let a = CompositeKey::project(&json!({"id": 1, "name": "Zoe"}), &columns).unwrap();
        let b = CompositeKey::project(&json!({"id": 2, "name": "Alan"}), &columns).unwrap();
        let c = CompositeKey::project(&json!({"id": 2, "name": "Beth"}), &columns).unwrap();

        // First column decides; the second only breaks ties.
        assert!(a < b, "id 1 should order before id 2 regardless of name");
        assert!(b < c, "equal ids fall through to the name column");
    }

    #[test]
    fn test_project_missing_column() {
        let result = CompositeKey::project(&json!({"id": 1}), &id_name_key());
        match result {
            Err(Error::KeyNotFound(msg)) => assert!(msg.contains("name")),
            other => panic!("expected KeyNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_from_lookup_scalar_and_object() {
        let scalar = CompositeKey::from_lookup(&json!("a@mail.com"), &email_key()).unwrap();
        assert_eq!(scalar.to_json(), json!("a@mail.com"));

        let object =
            CompositeKey::from_lookup(&json!({"id": 1, "name": "John"}), &id_name_key()).unwrap();
        assert_eq!(object.to_json(), json!({"id": 1, "name": "John"}));
    }

    #[test]
    fn test_number_representation_survives_folding() {
        let composite =
            CompositeKey::from_lookup(&json!({"id": 2, "name": "Mary"}), &id_name_key()).unwrap();
        let mut doc = json!({"message": "hello"});
        composite.fold_into(&mut doc);
        // Integer in, integer out: never widened to 2.0.
        assert_eq!(doc["id"], json!(2));

        let float = CompositeKey::from_lookup(&json!(2.5), &email_key()).unwrap();
        assert_eq!(float.to_json(), json!(2.5));

        // Both representations address the same index entry.
        let int_key = CompositeKey::from_lookup(&json!(2), &email_key()).unwrap();
        let float_key = CompositeKey::from_lookup(&json!(2.0), &email_key()).unwrap();
        assert_eq!(int_key, float_key);
    }

    #[test]
    fn test_lookup_rejects_unsupported_value() {
        let result = CompositeKey::from_lookup(&json!(true), &email_key());
        match result {
            Err(Error::Storage(StorageError::BadKeyValue(_))) => {}
            other => panic!("expected BadKeyValue, got {other:?}"),
        }
    }

    #[test]
    fn test_fold_into_makes_row_self_describing() {
        let composite =
            CompositeKey::from_lookup(&json!({"id": 1, "name": "John"}), &id_name_key()).unwrap();
        let mut doc = json!({"message": "hello"});
        composite.fold_into(&mut doc);

        assert_eq!(doc["id"], 1.0);
        assert_eq!(doc["name"], "John");
        assert_eq!(doc["message"], "hello");
    }

    #[test]
    fn test_dump_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clients_emailKey.json");
        let columns = email_key();

        let mut index = Index::new();
        let a = CompositeKey::from_lookup(&json!("a@mail.com"), &columns).unwrap();
        let b = CompositeKey::from_lookup(&json!("b@mail.com"), &columns).unwrap();
        index.insert(b.clone(), vec![120]);
        index.insert(a.clone(), vec![0, 60]);

        dump_index(&path, "emailKey", &index).unwrap();
        let loaded = load_index(&path, "clients", "emailKey", &columns).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&a], vec![0, 60]);
        assert_eq!(loaded[&b], vec![120]);
    }

    #[test]
    fn test_dump_writes_sorted_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t_k.json");
        let columns = email_key();

        let mut index = Index::new();
        for email in ["c@mail.com", "a@mail.com", "b@mail.com"] {
            let key = CompositeKey::from_lookup(&json!(email), &columns).unwrap();
            index.insert(key, vec![0]);
        }
        dump_index(&path, "k", &index).unwrap();

        let entries: Vec<Value> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let emails: Vec<&str> = entries.iter().map(|e| e["k"].as_str().unwrap()).collect();
        assert_eq!(emails, ["a@mail.com", "b@mail.com", "c@mail.com"]);
    }

    #[test]
    fn test_load_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let result = load_index(
            &dir.path().join("absent.json"),
            "clients",
            "emailKey",
            &email_key(),
        );
        match result {
            Err(Error::NotFound { table, key }) => {
                assert_eq!(table, "clients");
                assert_eq!(key, "emailKey");
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_load_unparseable_file_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t_k.json");
        fs::write(&path, "{{{").unwrap();

        assert!(matches!(
            load_index(&path, "t", "k", &email_key()),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_build_from_rows_groups_duplicates() {
        let rows = vec![
            (0, json!({"id": 1, "name": "John", "n": "first"})),
            (50, json!({"id": 2, "name": "Mary", "n": "second"})),
            (100, json!({"id": 1, "name": "John", "n": "third"})),
        ];
        let index = build_from_rows(&rows, &id_name_key()).unwrap();

        assert_eq!(index.len(), 2);
        let john =
            CompositeKey::from_lookup(&json!({"id": 1, "name": "John"}), &id_name_key()).unwrap();
        // Offsets within a bucket preserve file order.
        assert_eq!(index[&john], vec![0, 100]);
    }

    #[test]
    fn test_remove_offset_drops_empty_bucket() {
        let columns = email_key();
        let key = CompositeKey::from_lookup(&json!("a@mail.com"), &columns).unwrap();
        let mut index = Index::new();
        index.insert(key.clone(), vec![40]);

        remove_offset(&mut index, &key, 40);
        assert!(index.is_empty());

        // Removing from an absent bucket is tolerated.
        remove_offset(&mut index, &key, 40);
    }

    #[test]
    fn test_shift_offsets_only_past_removal_point() {
        let columns = email_key();
        let a = CompositeKey::from_lookup(&json!("a@mail.com"), &columns).unwrap();
        let b = CompositeKey::from_lookup(&json!("b@mail.com"), &columns).unwrap();
        let mut index = Index::new();
        index.insert(a.clone(), vec![0, 90]);
        index.insert(b.clone(), vec![150]);

        // A 60-byte line at offset 30 was removed.
        shift_offsets(&mut index, 30, 60);
        assert_eq!(index[&a], vec![0, 30]);
        assert_eq!(index[&b], vec![90]);
    }
}
