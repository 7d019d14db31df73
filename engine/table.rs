// ========================================================================================
//
//                          KEYED TABLES: PROJECTION, RE-KEYING & JOINS
//
// ========================================================================================
//
// Every artifact that flows between pipeline steps is, at heart, a table: an ordered
// mapping from a primary key to a record of named string fields. An empty string is the
// "missing" value. The join operations below have fixed, documented collision policies:
//
// - `merge`:   union of keys; on a shared key, the incoming table's values win.
// - `attach`:  left join; unmatched rows get empty values, fields already present stay.
// - `reorder`: re-keys on a field; collisions follow an explicit `CollisionPolicy`.
// - `add_field`: never overwrites an existing field.

use ahash::AHashMap;
use log::{debug, warn};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Schema and I/O failures. `DuplicateField` and `KeyCollision` are the schema errors that
/// must reach the caller rather than being swallowed.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("Field '{field}' already exists in the table keyed by '{key_field}'.")]
    DuplicateField { field: String, key_field: String },
    #[error("Re-keying on '{field}' maps rows '{first}' and '{second}' onto the same key '{key}'.")]
    KeyCollision {
        field: String,
        key: String,
        first: String,
        second: String,
    },
    #[error("Field '{0}' is not present in the table.")]
    UnknownField(String),
    #[error("Key field '{0}' was not found in the header row.")]
    MissingKeyField(String),
    #[error("Row '{key}' has {found} values, but the table has {expected} fields.")]
    RaggedRow {
        key: String,
        found: usize,
        expected: usize,
    },
    #[error("Delimited input is empty; a header row is required.")]
    MissingHeader,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Delimited data error: {0}")]
    Csv(#[from] csv::Error),
}

/// What `reorder` does when two source rows land on the same new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// The later row replaces the earlier one, keeping the earlier row's position.
    LastWriteWins,
    /// The first collision aborts the re-keying with `TableError::KeyCollision`.
    Reject,
}

/// A borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    fields: &'a [String],
    values: &'a [String],
}

impl<'a> Record<'a> {
    pub fn get(&self, field: &str) -> Option<&'a str> {
        self.fields
            .iter()
            .position(|f| f == field)
            .map(|i| self.values[i].as_str())
    }

    /// Like `get`, but folds the empty string into `None`.
    pub fn present(&self, field: &str) -> Option<&'a str> {
        self.get(field).filter(|v| !v.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.fields
            .iter()
            .zip(self.values.iter())
            .map(|(f, v)| (f.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyedTable {
    key_field: String,
    fields: Vec<String>,
    keys: Vec<String>,
    rows: Vec<Vec<String>>,
    index: AHashMap<String, usize>,
}

impl KeyedTable {
    pub fn new(key_field: impl Into<String>, fields: Vec<String>) -> Result<Self, TableError> {
        let key_field = key_field.into();
        for (i, field) in fields.iter().enumerate() {
            if *field == key_field || fields[..i].contains(field) {
                return Err(TableError::DuplicateField {
                    field: field.clone(),
                    key_field,
                });
            }
        }
        Ok(Self {
            key_field,
            fields,
            keys: Vec::new(),
            rows: Vec::new(),
            index: AHashMap::new(),
        })
    }

    /// A table with no fields and no rows.
    pub fn empty(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            fields: Vec::new(),
            keys: Vec::new(),
            rows: Vec::new(),
            index: AHashMap::new(),
        }
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Renames the key field. Keys themselves are untouched.
    pub fn set_key_field(&mut self, key_field: impl Into<String>) -> Result<(), TableError> {
        let key_field = key_field.into();
        if self.fields.contains(&key_field) {
            return Err(TableError::DuplicateField {
                field: key_field,
                key_field: self.key_field.clone(),
            });
        }
        self.key_field = key_field;
        Ok(())
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.field_position(field).is_some()
    }

    fn field_position(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == field)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn row(&self, key: &str) -> Option<Record<'_>> {
        self.index.get(key).map(|&i| Record {
            fields: &self.fields,
            values: &self.rows[i],
        })
    }

    pub fn get(&self, key: &str, field: &str) -> Option<&str> {
        let column = self.field_position(field)?;
        self.index.get(key).map(|&i| self.rows[i][column].as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Record<'_>)> {
        self.keys.iter().zip(self.rows.iter()).map(|(key, values)| {
            (
                key.as_str(),
                Record {
                    fields: &self.fields,
                    values,
                },
            )
        })
    }

    /// All values of one field, in key order.
    pub fn column(&self, field: &str) -> Result<Vec<&str>, TableError> {
        let column = self
            .field_position(field)
            .ok_or_else(|| TableError::UnknownField(field.to_string()))?;
        Ok(self.rows.iter().map(|row| row[column].as_str()).collect())
    }

    /// Inserts a row, replacing any existing row with the same key in place.
    pub fn push_row(
        &mut self,
        key: impl Into<String>,
        values: Vec<String>,
    ) -> Result<(), TableError> {
        let key = key.into();
        if values.len() != self.fields.len() {
            return Err(TableError::RaggedRow {
                key,
                found: values.len(),
                expected: self.fields.len(),
            });
        }
        self.upsert(key, values);
        Ok(())
    }

    /// Returns `true` when the key was already present.
    fn upsert(&mut self, key: String, values: Vec<String>) -> bool {
        match self.index.get(&key) {
            Some(&i) => {
                self.rows[i] = values;
                true
            }
            None => {
                self.index.insert(key.clone(), self.keys.len());
                self.keys.push(key);
                self.rows.push(values);
                false
            }
        }
    }

    /// Appends a computed field. Existing fields are never overwritten.
    pub fn add_field<F>(&mut self, name: &str, mut compute: F) -> Result<(), TableError>
    where
        F: FnMut(&str, &Record<'_>) -> String,
    {
        if name == self.key_field || self.has_field(name) {
            return Err(TableError::DuplicateField {
                field: name.to_string(),
                key_field: self.key_field.clone(),
            });
        }

        let computed: Vec<String> = self
            .iter()
            .map(|(key, record)| compute(key, &record))
            .collect();

        self.fields.push(name.to_string());
        for (row, value) in self.rows.iter_mut().zip(computed) {
            row.push(value);
        }
        Ok(())
    }

    /// Projects onto the given fields, keeping every key.
    pub fn slice(&self, fields: &[&str]) -> Result<KeyedTable, TableError> {
        let positions = fields
            .iter()
            .map(|f| {
                self.field_position(f)
                    .ok_or_else(|| TableError::UnknownField(f.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut sliced = KeyedTable::new(
            self.key_field.clone(),
            fields.iter().map(|f| f.to_string()).collect(),
        )?;
        for (key, row) in self.keys.iter().zip(&self.rows) {
            let values = positions.iter().map(|&p| row[p].clone()).collect();
            sliced.upsert(key.clone(), values);
        }
        Ok(sliced)
    }

    /// Rows for the requested keys that exist, in request order.
    pub fn select_keys<S: AsRef<str>>(&self, keys: &[S]) -> KeyedTable {
        let mut selected = Self {
            key_field: self.key_field.clone(),
            fields: self.fields.clone(),
            keys: Vec::new(),
            rows: Vec::new(),
            index: AHashMap::new(),
        };
        for key in keys {
            if let Some(&i) = self.index.get(key.as_ref()) {
                selected.upsert(key.as_ref().to_string(), self.rows[i].clone());
            }
        }
        selected
    }

    /// Re-keys the table on the values of `new_key_field`. The old key becomes the first
    /// field. Under `LastWriteWins` distinct rows can collapse into one, so re-keying back
    /// is not an identity unless the field was unique.
    pub fn reorder(
        &self,
        new_key_field: &str,
        policy: CollisionPolicy,
    ) -> Result<KeyedTable, TableError> {
        let pivot = self
            .field_position(new_key_field)
            .ok_or_else(|| TableError::UnknownField(new_key_field.to_string()))?;

        let mut fields = Vec::with_capacity(self.fields.len());
        fields.push(self.key_field.clone());
        fields.extend(
            self.fields
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != pivot)
                .map(|(_, f)| f.clone()),
        );
        let mut reordered = KeyedTable::new(new_key_field, fields)?;

        let mut collisions = 0usize;
        for (old_key, row) in self.keys.iter().zip(&self.rows) {
            let new_key = row[pivot].clone();
            if let Some(&existing) = reordered.index.get(&new_key) {
                if policy == CollisionPolicy::Reject {
                    return Err(TableError::KeyCollision {
                        field: new_key_field.to_string(),
                        key: new_key,
                        first: reordered.rows[existing][0].clone(),
                        second: old_key.clone(),
                    });
                }
                collisions += 1;
            }

            let mut values = Vec::with_capacity(row.len());
            values.push(old_key.clone());
            values.extend(
                row.iter()
                    .enumerate()
                    .filter(|(i, _)| *i != pivot)
                    .map(|(_, v)| v.clone()),
            );
            reordered.upsert(new_key, values);
        }

        if collisions > 0 {
            warn!(
                "Re-keying on '{new_key_field}' collapsed {collisions} rows onto existing keys (last write wins)."
            );
        }
        Ok(reordered)
    }

    /// Union of both tables. Keys only in `other` are appended; on shared keys the values
    /// of `other`'s fields replace ours. Fields new to us are added, empty for old rows.
    pub fn merge(&mut self, other: &KeyedTable) {
        let mut targets = Vec::with_capacity(other.fields.len());
        for (source, field) in other.fields.iter().enumerate() {
            if *field == self.key_field {
                debug!("merge: skipping field '{field}', it names our key");
                continue;
            }
            let target = match self.field_position(field) {
                Some(p) => p,
                None => {
                    self.fields.push(field.clone());
                    for row in &mut self.rows {
                        row.push(String::new());
                    }
                    self.fields.len() - 1
                }
            };
            targets.push((source, target));
        }

        let width = self.fields.len();
        for (key, values) in other.keys.iter().zip(&other.rows) {
            let row_index = match self.index.get(key) {
                Some(&i) => i,
                None => {
                    self.upsert(key.clone(), vec![String::new(); width]);
                    self.rows.len() - 1
                }
            };
            for &(source, target) in &targets {
                self.rows[row_index][target] = values[source].clone();
            }
        }
    }

    /// Left join on primary keys: adds `other`'s fields, empty where `other` has no row.
    /// Fields we already carry keep our values.
    pub fn attach(&mut self, other: &KeyedTable) {
        let incoming: Vec<usize> = other
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| **f != self.key_field && !self.has_field(f))
            .map(|(i, _)| i)
            .collect();
        if incoming.len() < other.fields.len() {
            debug!(
                "attach: {} of {} fields already present, keeping existing values",
                other.fields.len() - incoming.len(),
                other.fields.len()
            );
        }

        self.fields
            .extend(incoming.iter().map(|&i| other.fields[i].clone()));
        for (key, row) in self.keys.iter().zip(self.rows.iter_mut()) {
            match other.index.get(key) {
                Some(&j) => row.extend(incoming.iter().map(|&i| other.rows[j][i].clone())),
                None => row.extend(std::iter::repeat_n(String::new(), incoming.len())),
            }
        }
    }

    // ------------------------------------------------------------------------------------
    //                                   Persistence
    // ------------------------------------------------------------------------------------

    /// Header row `#<key>\t<field>...`, then one row per key in table order.
    pub fn write_delimited<W: Write>(&self, writer: W, delimiter: u8) -> Result<(), TableError> {
        let mut out = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .from_writer(writer);

        let header = std::iter::once(format!("#{}", self.key_field))
            .chain(self.fields.iter().cloned());
        out.write_record(header)?;
        for (key, row) in self.keys.iter().zip(&self.rows) {
            out.write_record(std::iter::once(key).chain(row.iter()))?;
        }
        out.flush()?;
        Ok(())
    }

    /// Reads a delimited table with a header row. One leading `#` is stripped from the first
    /// header cell; every other cell is taken verbatim. The key column is `key_field` when
    /// given, the first column otherwise. Duplicate keys are a `KeyCollision`.
    pub fn read_delimited<R: Read>(
        reader: R,
        delimiter: u8,
        key_field: Option<&str>,
    ) -> Result<Self, TableError> {
        let mut input = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .from_reader(reader);
        let mut records = input.records();

        let header: Vec<String> = match records.next() {
            Some(record) => record?
                .iter()
                .enumerate()
                .map(|(i, h)| match h.strip_prefix('#') {
                    Some(name) if i == 0 => name.to_string(),
                    _ => h.to_string(),
                })
                .collect(),
            None => return Err(TableError::MissingHeader),
        };

        let key_column = match key_field {
            Some(name) => header
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| TableError::MissingKeyField(name.to_string()))?,
            None => 0,
        };
        if header.is_empty() {
            return Err(TableError::MissingHeader);
        }

        let fields = header
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != key_column)
            .map(|(_, h)| h.clone())
            .collect();
        let mut table = KeyedTable::new(header[key_column].clone(), fields)?;

        for record in records {
            let record = record?;
            let key = record.get(key_column).unwrap_or_default().to_string();
            let values: Vec<String> = record
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != key_column)
                .map(|(_, v)| v.to_string())
                .collect();
            if let Some(&existing) = table.index.get(&key) {
                return Err(TableError::KeyCollision {
                    field: table.key_field.clone(),
                    first: table.keys[existing].clone(),
                    second: key.clone(),
                    key,
                });
            }
            table.push_row(key, values)?;
        }
        Ok(table)
    }

    pub fn write_tsv(&self, path: &Path) -> Result<(), TableError> {
        let file = File::create(path)?;
        self.write_delimited(BufWriter::new(file), b'\t')
    }

    pub fn read_tsv(path: &Path) -> Result<Self, TableError> {
        let file = File::open(path)?;
        Self::read_delimited(BufReader::new(file), b'\t', None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(key_field: &str, fields: &[&str], rows: &[(&str, &[&str])]) -> KeyedTable {
        let mut t = KeyedTable::new(key_field, fields.iter().map(|f| f.to_string()).collect())
            .unwrap();
        for (key, values) in rows {
            t.push_row(*key, values.iter().map(|v| v.to_string()).collect())
                .unwrap();
        }
        t
    }

    #[test]
    fn add_field_computes_from_key_and_record() {
        let mut t = table("Id", &["Score"], &[("a", &["1"]), ("b", &["2"])]);
        t.add_field("Label", |key, record| {
            format!("{key}-{}", record.get("Score").unwrap())
        })
        .unwrap();
        assert_eq!(t.get("a", "Label"), Some("a-1"));
        assert_eq!(t.get("b", "Label"), Some("b-2"));
    }

    #[test]
    fn add_field_refuses_to_overwrite() {
        let mut t = table("Id", &["Score"], &[("a", &["1"])]);
        let err = t.add_field("Score", |_, _| "x".to_string()).unwrap_err();
        assert!(matches!(err, TableError::DuplicateField { .. }));
        assert_eq!(t.get("a", "Score"), Some("1"));

        let err = t.add_field("Id", |_, _| "x".to_string()).unwrap_err();
        assert!(matches!(err, TableError::DuplicateField { .. }));
    }

    #[test]
    fn merge_keeps_union_and_prefers_incoming_values() {
        let mut a = table("K", &["x", "y"], &[("1", &["a1", "b1"]), ("2", &["a2", "b2"])]);
        let b = table("K", &["y", "z"], &[("2", &["B2", "c2"]), ("3", &["B3", "c3"])]);
        a.merge(&b);

        assert_eq!(a.keys().collect::<Vec<_>>(), vec!["1", "2", "3"]);
        assert_eq!(a.fields(), &["x", "y", "z"]);
        assert_eq!(a.get("1", "y"), Some("b1"));
        assert_eq!(a.get("1", "z"), Some(""));
        assert_eq!(a.get("2", "x"), Some("a2"));
        assert_eq!(a.get("2", "y"), Some("B2"));
        assert_eq!(a.get("3", "x"), Some(""));
        assert_eq!(a.get("3", "z"), Some("c3"));
    }

    #[test]
    fn merge_into_empty_table_adopts_rows() {
        let mut acc = KeyedTable::empty("Mutation");
        let b = table("Mutation", &["pred"], &[("P1:A10G", &["true"])]);
        acc.merge(&b);
        assert_eq!(acc.len(), 1);
        assert_eq!(acc.get("P1:A10G", "pred"), Some("true"));
    }

    #[test]
    fn reorder_moves_old_key_into_fields() {
        let t = table("Row", &["Mutation", "Score"], &[("0", &["m1", "0.1"]), ("1", &["m2", "0.2"])]);
        let r = t.reorder("Mutation", CollisionPolicy::Reject).unwrap();
        assert_eq!(r.key_field(), "Mutation");
        assert_eq!(r.fields(), &["Row", "Score"]);
        assert_eq!(r.get("m2", "Row"), Some("1"));
        assert_eq!(r.get("m2", "Score"), Some("0.2"));
    }

    #[test]
    fn reorder_last_write_wins_collapses_rows_and_is_not_reversible() {
        let t = table(
            "Row",
            &["Mutation", "Score"],
            &[("0", &["m1", "0.1"]), ("1", &["m1", "0.9"]), ("2", &["m2", "0.5"])],
        );
        let r = t.reorder("Mutation", CollisionPolicy::LastWriteWins).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r.keys().collect::<Vec<_>>(), vec!["m1", "m2"]);
        assert_eq!(r.get("m1", "Score"), Some("0.9"));
        assert_eq!(r.get("m1", "Row"), Some("1"));

        let back = r.reorder("Row", CollisionPolicy::Reject).unwrap();
        assert_eq!(back.len(), 2);
        assert!(!back.contains_key("0"));
        assert_ne!(back.len(), t.len());
    }

    #[test]
    fn reorder_reject_reports_both_rows() {
        let t = table("Row", &["Mutation"], &[("0", &["m1"]), ("1", &["m1"])]);
        match t.reorder("Mutation", CollisionPolicy::Reject).unwrap_err() {
            TableError::KeyCollision {
                key, first, second, ..
            } => {
                assert_eq!(key, "m1");
                assert_eq!(first, "0");
                assert_eq!(second, "1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn slice_projects_columns_and_rejects_unknown() {
        let t = table("K", &["a", "b", "c"], &[("1", &["x", "y", "z"])]);
        let s = t.slice(&["c", "a"]).unwrap();
        assert_eq!(s.fields(), &["c", "a"]);
        assert_eq!(s.get("1", "c"), Some("z"));
        assert_eq!(s.len(), 1);
        assert!(matches!(t.slice(&["nope"]), Err(TableError::UnknownField(_))));
    }

    #[test]
    fn attach_is_a_left_join_with_empty_fill() {
        let mut left = table("Mutation", &["SIFT"], &[("m1", &["D"]), ("m2", &["T"])]);
        let right = table("Other", &["PMut", "SIFT"], &[("m2", &["D", "ignored"]), ("m9", &["B", "x"])]);
        left.attach(&right);

        assert_eq!(left.fields(), &["SIFT", "PMut"]);
        assert_eq!(left.len(), 2);
        assert_eq!(left.get("m1", "PMut"), Some(""));
        assert_eq!(left.get("m2", "PMut"), Some("D"));
        assert_eq!(left.get("m2", "SIFT"), Some("T"));
        assert!(!left.contains_key("m9"));
    }

    #[test]
    fn select_keys_keeps_request_order_and_skips_absent() {
        let t = table("K", &["v"], &[("a", &["1"]), ("b", &["2"]), ("c", &["3"])]);
        let s = t.select_keys(&["c", "zz", "a"]);
        assert_eq!(s.keys().collect::<Vec<_>>(), vec!["c", "a"]);
    }

    #[test]
    fn delimited_round_trip_is_exact() {
        let t = table(
            "Mutation",
            &["Score", "Note"],
            &[
                ("m1", &["0.5", ""]),
                ("m2", &["1e-3", "with\ttab"]),
                ("m3", &["", "quote \" inside"]),
            ],
        );
        let mut buffer = Vec::new();
        t.write_delimited(&mut buffer, b'\t').unwrap();
        let back = KeyedTable::read_delimited(buffer.as_slice(), b'\t', None).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn round_trip_of_keys_only_table() {
        let t = table("Item", &[], &[("", &[]), ("x", &[])]);
        let mut buffer = Vec::new();
        t.write_delimited(&mut buffer, b'\t').unwrap();
        let back = KeyedTable::read_delimited(buffer.as_slice(), b'\t', None).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn header_names_round_trip_verbatim() {
        let t = table(
            "#id",
            &[" padded", "#hash", "trailing "],
            &[("k", &["1", "2", "3"])],
        );
        let mut buffer = Vec::new();
        t.write_delimited(&mut buffer, b'\t').unwrap();
        let back = KeyedTable::read_delimited(buffer.as_slice(), b'\t', None).unwrap();
        assert_eq!(back.key_field(), "#id");
        assert_eq!(back.fields(), &[" padded", "#hash", "trailing "]);
        assert_eq!(back, t);
    }

    #[test]
    fn read_delimited_uses_named_key_and_strips_hash() {
        let data = "#Num,Variant,Score\n1,v1,0.3\n2,v2,0.7\n";
        let t = KeyedTable::read_delimited(data.as_bytes(), b',', Some("Num")).unwrap();
        assert_eq!(t.key_field(), "Num");
        assert_eq!(t.fields(), &["Variant", "Score"]);
        assert_eq!(t.get("2", "Score"), Some("0.7"));

        let err = KeyedTable::read_delimited(data.as_bytes(), b',', Some("Id")).unwrap_err();
        assert!(matches!(err, TableError::MissingKeyField(_)));
    }

    #[test]
    fn read_delimited_rejects_duplicate_keys() {
        let data = "Num,Variant\n1,a\n1,b\n";
        let err = KeyedTable::read_delimited(data.as_bytes(), b',', None).unwrap_err();
        assert!(matches!(err, TableError::KeyCollision { .. }));
    }
}
