// ========================================================================================
//                          Sample records & genomic mutation keys
// ========================================================================================
//
// Samples arrive as two comma-separated files sharing a numeric id: the variant metadata
// and the clinical outcome. The outcome is attached onto the metadata, and every row gets
// a derived `Genomic Mutation` key. A variant that cannot be parsed fails the whole load,
// since everything downstream is joined on that key.

use crate::table::{KeyedTable, TableError};
use crate::types::{GenomicMutation, ParseError};
use ahash::AHashMap;
use log::info;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const GENOMIC_MUTATION_FIELD: &str = "Genomic Mutation";

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("Failed to read sample table '{path}': {source}")]
    Read { path: PathBuf, source: TableError },
    #[error("Sample table has no '{0}' field to derive genomic mutations from.")]
    MissingVariantField(String),
    #[error("Sample '{key}': {source}")]
    Variant { key: String, source: ParseError },
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Produces the raw (metadata, outcome) pair.
pub trait SampleSource: Send + Sync {
    fn load(&self) -> Result<(KeyedTable, KeyedTable), SampleError>;
}

/// Two delimited files keyed by the same field.
#[derive(Debug, Clone)]
pub struct PairedFiles {
    pub samples: PathBuf,
    pub outcomes: PathBuf,
    pub key_field: String,
    pub delimiter: u8,
}

impl PairedFiles {
    fn read(&self, path: &Path) -> Result<KeyedTable, SampleError> {
        let read = |source: TableError| SampleError::Read {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(|e| read(e.into()))?;
        KeyedTable::read_delimited(BufReader::new(file), self.delimiter, Some(self.key_field.as_str()))
            .map_err(read)
    }
}

impl SampleSource for PairedFiles {
    fn load(&self) -> Result<(KeyedTable, KeyedTable), SampleError> {
        let samples = self.read(&self.samples)?;
        let outcomes = self.read(&self.outcomes)?;
        info!(
            "Loaded {} samples and {} outcomes keyed by '{}'",
            samples.len(),
            outcomes.len(),
            self.key_field
        );
        Ok((samples, outcomes))
    }
}

/// Tables already in memory.
#[derive(Debug, Clone)]
pub struct InMemorySamples {
    pub samples: KeyedTable,
    pub outcomes: KeyedTable,
}

impl SampleSource for InMemorySamples {
    fn load(&self) -> Result<(KeyedTable, KeyedTable), SampleError> {
        Ok((self.samples.clone(), self.outcomes.clone()))
    }
}

/// Derives the genomic mutation of every sample and attaches the outcomes.
pub fn parse_samples(
    mut samples: KeyedTable,
    outcomes: &KeyedTable,
    variant_field: &str,
) -> Result<KeyedTable, SampleError> {
    if !samples.has_field(variant_field) {
        return Err(SampleError::MissingVariantField(variant_field.to_string()));
    }

    let mut derived = AHashMap::with_capacity(samples.len());
    for (key, record) in samples.iter() {
        let variant = record.get(variant_field).unwrap_or_default();
        let mutation = GenomicMutation::parse_variant(variant).map_err(|source| {
            SampleError::Variant {
                key: key.to_string(),
                source,
            }
        })?;
        derived.insert(key.to_string(), mutation.key());
    }

    samples.add_field(GENOMIC_MUTATION_FIELD, |key, _| {
        derived.remove(key).unwrap_or_default()
    })?;
    samples.attach(outcomes);
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const INPUT: &str = "#Num,Variant,REVEL_SCORE\n\
                         1,Chr1(GRCh37):g.100A>G,0.7\n\
                         2,Chr2(GRCh37):g.200C>T,0.2\n";
    const OUTPUT: &str = "Num,PATHOGENICITY\n1,PATHOGENIC\n";

    #[test]
    fn paired_files_are_joined_on_the_shared_key() {
        let dir = tempdir().unwrap();
        let samples = dir.path().join("input.csv");
        let outcomes = dir.path().join("output.csv");
        fs::write(&samples, INPUT).unwrap();
        fs::write(&outcomes, OUTPUT).unwrap();

        let source = PairedFiles {
            samples,
            outcomes,
            key_field: "Num".to_string(),
            delimiter: b',',
        };
        let (raw, outcome) = source.load().unwrap();
        let parsed = parse_samples(raw, &outcome, "Variant").unwrap();

        assert_eq!(parsed.key_field(), "Num");
        assert_eq!(
            parsed.fields(),
            &["Variant", "REVEL_SCORE", GENOMIC_MUTATION_FIELD, "PATHOGENICITY"]
        );
        assert_eq!(parsed.get("1", GENOMIC_MUTATION_FIELD), Some("1:100:G"));
        assert_eq!(parsed.get("2", GENOMIC_MUTATION_FIELD), Some("2:200:T"));
        assert_eq!(parsed.get("1", "PATHOGENICITY"), Some("PATHOGENIC"));
        assert_eq!(parsed.get("2", "PATHOGENICITY"), Some(""));
    }

    #[test]
    fn unparseable_variant_names_the_sample() {
        let raw = KeyedTable::read_delimited("Num,Variant\n7,garbage\n".as_bytes(), b',', None)
            .unwrap();
        let outcomes = KeyedTable::empty("Num");
        match parse_samples(raw, &outcomes, "Variant").unwrap_err() {
            SampleError::Variant { key, .. } => assert_eq!(key, "7"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_variant_field_is_reported() {
        let raw = KeyedTable::read_delimited("Num,Other\n1,x\n".as_bytes(), b',', None).unwrap();
        assert!(matches!(
            parse_samples(raw, &KeyedTable::empty("Num"), "Variant"),
            Err(SampleError::MissingVariantField(_))
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let source = PairedFiles {
            samples: PathBuf::from("/nonexistent/input.csv"),
            outcomes: PathBuf::from("/nonexistent/output.csv"),
            key_field: "Num".to_string(),
            delimiter: b',',
        };
        assert!(matches!(source.load(), Err(SampleError::Read { .. })));
    }
}
