//! Run configuration, read from a TOML file. Every field has a default, so an empty file
//! is a valid configuration; only the input paths have to be supplied before a run.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Directory for on-disk step memoization. Nothing is persisted when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    pub inputs: InputsConfig,
    pub collaborators: CollaboratorsConfig,
    pub remote: RemoteConfig,
    pub evaluation: EvaluationConfig,
    pub thresholds: Vec<ThresholdRule>,
    pub export: ExportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcomes: Option<PathBuf>,
    pub sample_key: String,
    pub variant_field: String,
    pub delimiter: char,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollaboratorsConfig {
    /// Genomic → isoform mutation mapping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isoforms: Option<PathBuf>,
    /// Precomputed predictor rows keyed by isoform mutation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
    /// Isoform protein id → external accession index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accessions: Option<PathBuf>,
    pub accession_field: String,
    pub organism: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub url_template: String,
    pub timeout_secs: u64,
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluationConfig {
    pub label_field: String,
    pub positive_label: String,
    pub excluded_predictors: Vec<String>,
    /// Isoform-level calls that make a genomic mutation pathogenic.
    pub pathogenic_classes: Vec<String>,
}

/// Binarizes the continuous `source` column into `target` with a strict `>` comparison.
/// `param` is the step input that can override `default` for a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdRule {
    pub param: String,
    pub source: String,
    pub target: String,
    pub default: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    pub community_id: String,
    pub event_id: String,
    pub challenge_id: String,
    pub contacts: Vec<String>,
    pub tool_link: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            inputs: InputsConfig::default(),
            collaborators: CollaboratorsConfig::default(),
            remote: RemoteConfig::default(),
            evaluation: EvaluationConfig::default(),
            thresholds: default_thresholds(),
            export: ExportConfig::default(),
        }
    }
}

impl Default for InputsConfig {
    fn default() -> Self {
        Self {
            samples: None,
            outcomes: None,
            sample_key: "Num".to_string(),
            variant_field: "Variant".to_string(),
            delimiter: ',',
        }
    }
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self {
            isoforms: None,
            database: None,
            accessions: None,
            accession_field: "UniProt/SwissProt Accession".to_string(),
            organism: "Hsa/feb2014".to_string(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url_template:
                "https://mmb.irbbarcelona.org/PMut/uniprot/{accession}/{position}/{alternate}/features.csv"
                    .to_string(),
            timeout_secs: 30,
            workers: 8,
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            label_field: "PATHOGENICITY".to_string(),
            positive_label: "PATHOGENIC".to_string(),
            excluded_predictors: vec!["Aloft_pred".to_string()],
            pathogenic_classes: ["D", "H", "M"].map(String::from).to_vec(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            community_id: "AMetaPred".to_string(),
            event_id: "AMetaPred-DDD".to_string(),
            challenge_id: "RD".to_string(),
            contacts: Vec::new(),
            tool_link: "https://sites.google.com/site/jpopgen/dbNSFP".to_string(),
        }
    }
}

fn default_thresholds() -> Vec<ThresholdRule> {
    [
        ("threshold", "XAIscoring", "Fujitsu-XAIscoring", 0.6),
        ("revel_threshold", "REVEL_SCORE", "REVEL", 0.5),
        ("clinpred_threshold", "CLINPRED_SCORE", "ClinPred_ORIG", 0.5),
    ]
    .into_iter()
    .map(|(param, source, target, default)| ThresholdRule {
        param: param.to_string(),
        source: source.to_string(),
        target: target.to_string(),
        default,
    })
    .collect()
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.remote.workers == 0 {
            return invalid("remote.workers must be at least 1".to_string());
        }
        if self.remote.timeout_secs == 0 {
            return invalid("remote.timeout_secs must be at least 1".to_string());
        }
        if !self.inputs.delimiter.is_ascii() {
            return invalid(format!(
                "inputs.delimiter '{}' must be a single ASCII character",
                self.inputs.delimiter
            ));
        }

        let mut params = HashSet::new();
        let mut targets = HashSet::new();
        for rule in &self.thresholds {
            if !rule.default.is_finite() {
                return invalid(format!("threshold '{}' must be finite", rule.param));
            }
            if !params.insert(rule.param.as_str()) {
                return invalid(format!("threshold parameter '{}' is declared twice", rule.param));
            }
            if !targets.insert(rule.target.as_str()) {
                return invalid(format!("threshold target '{}' is declared twice", rule.target));
            }
        }
        Ok(())
    }

    /// The delimiter as a byte; validated to be ASCII.
    pub fn delimiter(&self) -> u8 {
        self.inputs.delimiter as u8
    }
}
