//! Step outputs and their on-disk form.
//!
//! Every artifact is written as a tab-separated file whose first row is a `#`-prefixed
//! header, so a cached step can be reloaded exactly as it was produced:
//!
//! - tables: `#<key field>\t<field>...`
//! - lists: `#Item`, one item per row (duplicates preserved)
//! - mappings: `#Key\tValues`, values joined with `|`; a key with no values is written
//!   without a second column, so it stays distinct from a single empty value

use crate::table::{KeyedTable, TableError};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

const LIST_HEADER: &str = "#Item";
const MAPPING_HEADER: [&str; 2] = ["#Key", "Values"];
const VALUE_SEPARATOR: char = '|';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Table,
    List,
    Mapping,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Table => "table",
            Self::List => "list",
            Self::Mapping => "mapping",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Table(KeyedTable),
    List(Vec<String>),
    Mapping(BTreeMap<String, Vec<String>>),
}

impl Artifact {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Self::Table(_) => ArtifactKind::Table,
            Self::List(_) => ArtifactKind::List,
            Self::Mapping(_) => ArtifactKind::Mapping,
        }
    }

    pub fn as_table(&self) -> Option<&KeyedTable> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, Vec<String>>> {
        match self {
            Self::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn write_to(&self, path: &Path) -> Result<(), TableError> {
        match self {
            Self::Table(table) => table.write_tsv(path),
            Self::List(items) => {
                let mut out = tsv_writer(path)?;
                out.write_record([LIST_HEADER])?;
                for item in items {
                    out.write_record([item])?;
                }
                out.flush()?;
                Ok(())
            }
            Self::Mapping(mapping) => {
                let mut out = tsv_writer(path)?;
                out.write_record(MAPPING_HEADER)?;
                for (key, values) in mapping {
                    if values.is_empty() {
                        out.write_record([key.as_str()])?;
                    } else {
                        let joined = values.join(&VALUE_SEPARATOR.to_string());
                        out.write_record([key.as_str(), joined.as_str()])?;
                    }
                }
                out.flush()?;
                Ok(())
            }
        }
    }

    pub fn read_from(path: &Path, kind: ArtifactKind) -> Result<Self, TableError> {
        if kind == ArtifactKind::Table {
            return KeyedTable::read_tsv(path).map(Self::Table);
        }

        let mut input = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_reader(BufReader::new(File::open(path)?));
        let mut records = input.records();
        if records.next().transpose()?.is_none() {
            return Err(TableError::MissingHeader);
        }

        match kind {
            ArtifactKind::List => {
                let mut items = Vec::new();
                for record in records {
                    items.push(record?.get(0).unwrap_or_default().to_string());
                }
                Ok(Self::List(items))
            }
            _ => {
                let mut mapping = BTreeMap::new();
                for record in records {
                    let record = record?;
                    let key = record.get(0).unwrap_or_default().to_string();
                    let values = match record.get(1) {
                        Some(joined) => joined.split(VALUE_SEPARATOR).map(str::to_string).collect(),
                        None => Vec::new(),
                    };
                    mapping.insert(key, values);
                }
                Ok(Self::Mapping(mapping))
            }
        }
    }
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<BufWriter<File>>, TableError> {
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_writer(BufWriter::new(File::create(path)?)))
}
