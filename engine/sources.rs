// ========================================================================================
//                        External collaborators & file-backed stand-ins
// ========================================================================================
//
// The isoform-mutation generator and the bulk database predictor are external services.
// The pipeline only depends on the traits below; the file-backed implementations serve
// precomputed exports of those services.

use crate::artifact::{Artifact, ArtifactKind};
use crate::bridge::TableResolver;
use crate::table::{KeyedTable, TableError};
use log::{debug, info};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to load '{path}': {source}")]
    Load { path: PathBuf, source: TableError },
    #[error("{0}")]
    Unavailable(String),
}

/// Expands genomic mutations into the protein-isoform mutations they cause.
pub trait IsoformGenerator: Send + Sync {
    /// Must return an entry for every input mutation, empty when no isoform is affected.
    fn expand(
        &self,
        genomic_mutations: &[String],
        organism: &str,
    ) -> Result<BTreeMap<String, Vec<String>>, SourceError>;
}

/// Bulk lookup of precomputed predictor rows, keyed by isoform mutation.
pub trait DatabasePredictor: Send + Sync {
    fn predict(&self, isoform_mutations: &[String]) -> Result<KeyedTable, SourceError>;
}

/// A precomputed genomic → isoform mapping (`#Key\tValues`, values joined with `|`).
#[derive(Debug, Clone, Default)]
pub struct IsoformFile {
    mapping: BTreeMap<String, Vec<String>>,
}

impl IsoformFile {
    pub fn new(mapping: BTreeMap<String, Vec<String>>) -> Self {
        Self { mapping }
    }

    pub fn load(path: &Path) -> Result<Self, SourceError> {
        let artifact = Artifact::read_from(path, ArtifactKind::Mapping).map_err(|source| {
            SourceError::Load {
                path: path.to_path_buf(),
                source,
            }
        })?;
        match artifact {
            Artifact::Mapping(mut mapping) => {
                // `key\t` reads as one empty id; a blank isoform id names nothing.
                for isoforms in mapping.values_mut() {
                    isoforms.retain(|id| !id.is_empty());
                }
                info!("Loaded isoform mapping for {} genomic mutations", mapping.len());
                Ok(Self { mapping })
            }
            other => Err(SourceError::Unavailable(format!(
                "'{}' holds a {}, not a mapping",
                path.display(),
                other.kind()
            ))),
        }
    }
}

impl IsoformGenerator for IsoformFile {
    fn expand(
        &self,
        genomic_mutations: &[String],
        organism: &str,
    ) -> Result<BTreeMap<String, Vec<String>>, SourceError> {
        debug!("Expanding {} mutations for organism {organism}", genomic_mutations.len());
        let mut expanded = BTreeMap::new();
        let mut unknown = 0usize;
        for mutation in genomic_mutations {
            let isoforms = match self.mapping.get(mutation) {
                Some(isoforms) => isoforms.clone(),
                None => {
                    unknown += 1;
                    Vec::new()
                }
            };
            expanded.insert(mutation.clone(), isoforms);
        }
        if unknown > 0 {
            info!("{unknown} genomic mutations affect no known isoform");
        }
        Ok(expanded)
    }
}

/// A precomputed predictor table keyed by isoform mutation.
#[derive(Debug, Clone)]
pub struct DatabaseFile {
    table: KeyedTable,
}

impl DatabaseFile {
    pub fn new(table: KeyedTable) -> Self {
        Self { table }
    }

    pub fn load(path: &Path) -> Result<Self, SourceError> {
        let table = KeyedTable::read_tsv(path).map_err(|source| SourceError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            "Loaded {} precomputed predictions with {} fields",
            table.len(),
            table.fields().len()
        );
        Ok(Self { table })
    }
}

impl DatabasePredictor for DatabaseFile {
    fn predict(&self, isoform_mutations: &[String]) -> Result<KeyedTable, SourceError> {
        let mut seen = HashSet::with_capacity(isoform_mutations.len());
        let unique: Vec<&String> = isoform_mutations
            .iter()
            .filter(|m| seen.insert(m.as_str()))
            .collect();
        let selected = self.table.select_keys(&unique);
        debug!(
            "Database predictor matched {} of {} isoform mutations",
            selected.len(),
            unique.len()
        );
        Ok(selected)
    }
}

/// Loads a two-column identifier index (source id → `target_field`).
pub fn load_accession_index(path: &Path, target_field: &str) -> Result<TableResolver, SourceError> {
    let load = |source: TableError| SourceError::Load {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(|e| load(e.into()))?;
    let table = KeyedTable::read_delimited(BufReader::new(file), b'\t', None).map_err(load)?;
    TableResolver::new(table, target_field).map_err(load)
}
