// ========================================================================================
//
//                     THE PREDICTION PIPELINE AS A GRAPH OF STEPS
//
// ========================================================================================
//
// parse_samples ─> genomic_mutations ─> isoform_mutations ─> distinct_isoform_ids
//                                                               ├─> db_predictions ──┐
//                                                               └─> remote_predictions┴─> merged_predictions
// merged_predictions + isoform_mutations + parse_samples ─> genomic_level_predictions
//   ─> thresholded ─> evaluate
//
// Each step reads only the artifacts of the steps it depends on. The remote predictor
// degrades per mutation, so a dead endpoint yields an empty remote table rather than a
// failed merge.

use crate::aggregate::{HttpRemotePredictor, MUTATION_FIELD, PredictorAggregator, RemotePredictor};
use crate::artifact::{Artifact, ArtifactKind};
use crate::bridge::{IdentifierBridge, Resolver};
use crate::config::{ConfigError, PipelineConfig};
use crate::graph::{GraphError, Params, Step, StepError, TaskGraph};
use crate::metrics::{Evaluation, MetricsEngine};
use crate::samples::{self, GENOMIC_MUTATION_FIELD, InMemorySamples, PairedFiles, SampleSource};
use crate::sources::{
    DatabaseFile, DatabasePredictor, IsoformFile, IsoformGenerator, SourceError,
    load_accession_index,
};
use crate::table::{KeyedTable, TableError};
use ahash::AHashMap;
use itertools::Itertools;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod steps {
    pub const PARSE_SAMPLES: &str = "parse_samples";
    pub const GENOMIC_MUTATIONS: &str = "genomic_mutations";
    pub const ISOFORM_MUTATIONS: &str = "isoform_mutations";
    pub const DISTINCT_ISOFORM_IDS: &str = "distinct_isoform_ids";
    pub const DB_PREDICTIONS: &str = "db_predictions";
    pub const REMOTE_PREDICTIONS: &str = "remote_predictions";
    pub const MERGED_PREDICTIONS: &str = "merged_predictions";
    pub const GENOMIC_LEVEL_PREDICTIONS: &str = "genomic_level_predictions";
    pub const THRESHOLDED: &str = "thresholded";
    pub const EVALUATE: &str = "evaluate";
    pub const PREDICTION_VALUE_COUNTS: &str = "prediction_value_counts";
}

/// Column holding the binarized remote call (`D` damaging, `B` benign).
pub const REMOTE_CALL_FIELD: &str = "PMut";
/// The remote predictor's own disease flag.
pub const REMOTE_DISEASE_FIELD: &str = "pred_disease";
pub const ORGANISM_INPUT: &str = "organism";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("Failed to set up the remote predictor client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Configuration is missing '{0}'.")]
    MissingPath(&'static str),
    #[error("Step '{step}' produced a {found}, expected a {expected}.")]
    UnexpectedArtifact {
        step: String,
        expected: ArtifactKind,
        found: ArtifactKind,
    },
}

/// The external systems the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub samples: Arc<dyn SampleSource>,
    pub isoforms: Arc<dyn IsoformGenerator>,
    pub database: Arc<dyn DatabasePredictor>,
    pub accessions: Arc<dyn Resolver>,
    /// `None` disables remote fetching; the remote table is then empty.
    pub remote: Option<Arc<dyn RemotePredictor>>,
}

fn required<'a>(path: &'a Option<PathBuf>, name: &'static str) -> Result<&'a Path, PipelineError> {
    path.as_deref().ok_or(PipelineError::MissingPath(name))
}

impl Collaborators {
    /// File-backed collaborators and the HTTP remote predictor, as configured.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let inputs = &config.inputs;
        let samples = PairedFiles {
            samples: required(&inputs.samples, "inputs.samples")?.to_path_buf(),
            outcomes: required(&inputs.outcomes, "inputs.outcomes")?.to_path_buf(),
            key_field: inputs.sample_key.clone(),
            delimiter: config.delimiter(),
        };

        let sources = &config.collaborators;
        let isoforms = IsoformFile::load(required(&sources.isoforms, "collaborators.isoforms")?)?;
        let database = DatabaseFile::load(required(&sources.database, "collaborators.database")?)?;

        let accessions: Arc<dyn Resolver>;
        let remote: Option<Arc<dyn RemotePredictor>>;
        if config.remote.enabled {
            let index = load_accession_index(
                required(&sources.accessions, "collaborators.accessions")?,
                &sources.accession_field,
            )?;
            let http = HttpRemotePredictor::new(
                &config.remote.url_template,
                Duration::from_secs(config.remote.timeout_secs),
            )?;
            accessions = Arc::new(index);
            remote = Some(Arc::new(http));
        } else {
            accessions = Arc::new(HashMap::<String, String>::new());
            remote = None;
        }

        Ok(Self {
            samples: Arc::new(samples),
            isoforms: Arc::new(isoforms),
            database: Arc::new(database),
            accessions,
            remote,
        })
    }

    /// Collaborators without any data; enough to build and inspect the graph.
    pub fn empty() -> Self {
        Self {
            samples: Arc::new(InMemorySamples {
                samples: KeyedTable::empty("Num"),
                outcomes: KeyedTable::empty("Num"),
            }),
            isoforms: Arc::new(IsoformFile::default()),
            database: Arc::new(DatabaseFile::new(KeyedTable::empty(MUTATION_FIELD))),
            accessions: Arc::new(HashMap::<String, String>::new()),
            remote: None,
        }
    }
}

/// Registers every step of the pipeline. Threshold and organism defaults come from
/// `config` and can be overridden per request through `Params`.
pub fn build_graph(config: &PipelineConfig, collaborators: Collaborators) -> Result<TaskGraph, GraphError> {
    let mut graph = match &config.cache_dir {
        Some(dir) => TaskGraph::new().with_cache_dir(dir),
        None => TaskGraph::new(),
    };

    let source = Arc::clone(&collaborators.samples);
    let variant_field = config.inputs.variant_field.clone();
    graph.register(Step::new(steps::PARSE_SAMPLES, ArtifactKind::Table, move |_| {
        let (raw, outcomes) = source.load()?;
        let parsed = samples::parse_samples(raw, &outcomes, &variant_field)?;
        Ok(Artifact::Table(parsed))
    }))?;

    graph.register(
        Step::new(steps::GENOMIC_MUTATIONS, ArtifactKind::List, |ctx| {
            let samples = ctx.table(steps::PARSE_SAMPLES)?;
            let mutations = samples
                .column(GENOMIC_MUTATION_FIELD)?
                .into_iter()
                .map(str::to_string)
                .collect();
            Ok(Artifact::List(mutations))
        })
        .dep(steps::PARSE_SAMPLES),
    )?;

    let generator = Arc::clone(&collaborators.isoforms);
    graph.register(
        Step::new(steps::ISOFORM_MUTATIONS, ArtifactKind::Mapping, move |ctx| {
            let genomic = ctx.list(steps::GENOMIC_MUTATIONS)?;
            let organism = ctx.text(ORGANISM_INPUT)?;
            Ok(Artifact::Mapping(generator.expand(genomic, organism)?))
        })
        .dep(steps::GENOMIC_MUTATIONS)
        .input(ORGANISM_INPUT, config.collaborators.organism.as_str()),
    )?;

    graph.register(
        Step::new(steps::DISTINCT_ISOFORM_IDS, ArtifactKind::List, |ctx| {
            let mapping = ctx.mapping(steps::ISOFORM_MUTATIONS)?;
            let distinct = mapping.values().flatten().unique().cloned().collect();
            Ok(Artifact::List(distinct))
        })
        .dep(steps::ISOFORM_MUTATIONS),
    )?;

    let database = Arc::clone(&collaborators.database);
    graph.register(
        Step::new(steps::DB_PREDICTIONS, ArtifactKind::Table, move |ctx| {
            let ids = ctx.list(steps::DISTINCT_ISOFORM_IDS)?;
            Ok(Artifact::Table(database.predict(ids)?))
        })
        .dep(steps::DISTINCT_ISOFORM_IDS),
    )?;

    let bridge = IdentifierBridge::new(Arc::clone(&collaborators.accessions));
    let remote = collaborators.remote.clone();
    let workers = config.remote.workers;
    graph.register(
        Step::new(steps::REMOTE_PREDICTIONS, ArtifactKind::Table, move |ctx| {
            let ids = ctx.list(steps::DISTINCT_ISOFORM_IDS)?;
            let Some(remote) = &remote else {
                info!("Remote predictor disabled; skipping {} isoform mutations", ids.len());
                return Ok(Artifact::Table(KeyedTable::empty(MUTATION_FIELD)));
            };
            let mut aggregator = PredictorAggregator::new(bridge.clone(), Arc::clone(remote), workers);
            Ok(Artifact::Table(aggregator.fetch_all(ids)?))
        })
        .dep(steps::DISTINCT_ISOFORM_IDS),
    )?;

    graph.register(
        Step::new(steps::MERGED_PREDICTIONS, ArtifactKind::Table, |ctx| {
            let database = ctx.table(steps::DB_PREDICTIONS)?;
            let remote = ctx.table(steps::REMOTE_PREDICTIONS)?;
            Ok(Artifact::Table(merge_predictions(database, remote)?))
        })
        .dep(steps::DB_PREDICTIONS)
        .dep(steps::REMOTE_PREDICTIONS),
    )?;

    let collapse = Collapse {
        pathogenic_classes: config.evaluation.pathogenic_classes.clone(),
        score_fields: score_fields(config),
    };
    graph.register(
        Step::new(steps::GENOMIC_LEVEL_PREDICTIONS, ArtifactKind::Table, move |ctx| {
            let samples = ctx.table(steps::PARSE_SAMPLES)?;
            let predictions = ctx.table(steps::MERGED_PREDICTIONS)?;
            let isoforms = ctx.mapping(steps::ISOFORM_MUTATIONS)?;
            Ok(Artifact::Table(collapse_to_samples(samples, predictions, isoforms, &collapse)?))
        })
        .dep(steps::PARSE_SAMPLES)
        .dep(steps::MERGED_PREDICTIONS)
        .dep(steps::ISOFORM_MUTATIONS),
    )?;

    let rules = config.thresholds.clone();
    let mut thresholded = Step::new(steps::THRESHOLDED, ArtifactKind::Table, move |ctx| {
        let mut table = ctx.table(steps::GENOMIC_LEVEL_PREDICTIONS)?.clone();
        for rule in &rules {
            let threshold = ctx.float(&rule.param)?;
            binarize(&mut table, &rule.source, &rule.target, threshold)?;
        }
        Ok(Artifact::Table(table))
    })
    .dep(steps::GENOMIC_LEVEL_PREDICTIONS);
    for rule in &config.thresholds {
        thresholded = thresholded.input(&rule.param, rule.default);
    }
    graph.register(thresholded)?;

    let engine = MetricsEngine::new(
        &config.evaluation.label_field,
        &config.evaluation.positive_label,
        &config.evaluation.excluded_predictors,
    );
    let raw_scores = score_fields(config);
    graph.register(
        Step::new(steps::EVALUATE, ArtifactKind::Table, move |ctx| {
            let table = ctx.table(steps::THRESHOLDED)?;
            let samples = ctx.table(steps::PARSE_SAMPLES)?;
            let predictors: Vec<&String> = table
                .fields()
                .iter()
                .filter(|f| !samples.has_field(f) && !raw_scores.contains(f))
                .collect();
            let evaluation = engine.evaluate(table, &predictors)?;
            Ok(Artifact::Table(evaluation.to_table()?))
        })
        .dep(steps::THRESHOLDED)
        .dep(steps::PARSE_SAMPLES),
    )?;

    graph.register(
        Step::new(steps::PREDICTION_VALUE_COUNTS, ArtifactKind::Table, |ctx| {
            let database = ctx.table(steps::DB_PREDICTIONS)?;
            Ok(Artifact::Table(value_counts(database)?))
        })
        .dep(steps::DB_PREDICTIONS),
    )?;

    Ok(graph)
}

/// Turns the remote disease flag into a `D`/`B` call and attaches it onto the database rows.
pub fn merge_predictions(database: &KeyedTable, remote: &KeyedTable) -> Result<KeyedTable, TableError> {
    let mut remote = remote.clone();
    remote.add_field(REMOTE_CALL_FIELD, |_, record| {
        match record.present(REMOTE_DISEASE_FIELD) {
            Some(flag) if flag.eq_ignore_ascii_case("true") => "D".to_string(),
            Some(_) => "B".to_string(),
            None => String::new(),
        }
    })?;
    let mut calls = remote.slice(&[REMOTE_CALL_FIELD])?;
    calls.set_key_field(database.key_field())?;

    let mut merged = database.clone();
    merged.attach(&calls);
    Ok(merged)
}

/// Continuous score columns, as named by the threshold rules.
fn score_fields(config: &PipelineConfig) -> Vec<String> {
    config.thresholds.iter().map(|rule| rule.source.clone()).unique().collect()
}

/// How isoform-level predictions fold into one value per genomic mutation.
#[derive(Debug, Clone, Default)]
pub struct Collapse {
    /// Calls that make a categorical column pathogenic.
    pub pathogenic_classes: Vec<String>,
    /// Continuous columns; these keep the highest score across isoforms.
    pub score_fields: Vec<String>,
}

impl Collapse {
    fn categorical<'a>(&self, mut calls: impl Iterator<Item = &'a str>) -> String {
        calls
            .any(|call| self.pathogenic_classes.iter().any(|c| c == call))
            .to_string()
    }

    /// The highest parseable score, written as it appeared; empty when none parses.
    fn continuous<'a>(&self, scores: impl Iterator<Item = &'a str>) -> String {
        scores
            .filter_map(|raw| {
                let score = raw.trim().parse::<f64>().ok()?;
                (!score.is_nan()).then_some((score, raw))
            })
            .max_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, raw)| raw.trim().to_string())
            .unwrap_or_default()
    }
}

/// One row per sample, with each predictor folded over the isoform mutations of the
/// sample's genomic mutation. Categorical columns read `true` when any isoform carries a
/// pathogenic call; score columns keep the highest score. Isoforms without a prediction
/// row are skipped, so a sample with no predicted isoform reads `false` (or an empty score).
pub fn collapse_to_samples(
    samples: &KeyedTable,
    predictions: &KeyedTable,
    isoforms: &BTreeMap<String, Vec<String>>,
    collapse: &Collapse,
) -> Result<KeyedTable, StepError> {
    let mutations = samples.column(GENOMIC_MUTATION_FIELD)?;
    if let Some(unmapped) = mutations.iter().find(|m| !isoforms.contains_key(**m)) {
        return Err(format!("genomic mutation '{unmapped}' has no isoform mapping").into());
    }

    let mut table = samples.clone();
    for predictor in predictions.fields() {
        if table.has_field(predictor) {
            debug!("'{predictor}' is already a sample field, not collapsing it");
            continue;
        }
        let values: AHashMap<&str, &str> = predictions
            .keys()
            .zip(predictions.column(predictor)?)
            .collect();
        let is_score = collapse.score_fields.contains(predictor);
        table.add_field(predictor, |_, record| {
            let mutation = record.get(GENOMIC_MUTATION_FIELD).unwrap_or_default();
            let found = isoforms
                .get(mutation)
                .into_iter()
                .flatten()
                .filter_map(|mi| values.get(mi.as_str()).copied());
            if is_score {
                collapse.continuous(found)
            } else {
                collapse.categorical(found)
            }
        })?;
    }
    Ok(table)
}

/// Adds `target` = `source > threshold`. Missing or non-numeric scores stay empty.
pub fn binarize(
    table: &mut KeyedTable,
    source: &str,
    target: &str,
    threshold: f64,
) -> Result<(), TableError> {
    if !table.has_field(source) {
        return Err(TableError::UnknownField(source.to_string()));
    }
    table.add_field(target, |_, record| {
        record
            .present(source)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|score| (score > threshold).to_string())
            .unwrap_or_default()
    })
}

/// Distinct non-empty values per field, as `value=count` joined with `|`.
pub fn value_counts(table: &KeyedTable) -> Result<KeyedTable, TableError> {
    let mut counts = KeyedTable::new("Field", vec!["Counts".to_string()])?;
    for field in table.fields() {
        let mut tally: BTreeMap<&str, usize> = BTreeMap::new();
        for value in table.column(field)? {
            if !value.is_empty() {
                *tally.entry(value).or_default() += 1;
            }
        }
        let summary = tally
            .iter()
            .map(|(value, n)| format!("{value}={n}"))
            .join("|");
        info!("{field}: {summary}");
        counts.push_row(field.clone(), vec![summary])?;
    }
    Ok(counts)
}

/// Runs `step` and returns its table.
pub fn request_table(
    graph: &mut TaskGraph,
    step: &str,
    params: &Params,
) -> Result<KeyedTable, PipelineError> {
    let artifact = graph.request(step, params)?;
    match artifact.as_ref() {
        Artifact::Table(table) => Ok(table.clone()),
        other => Err(PipelineError::UnexpectedArtifact {
            step: step.to_string(),
            expected: ArtifactKind::Table,
            found: other.kind(),
        }),
    }
}

/// Runs the whole pipeline up to the evaluation.
pub fn evaluate(graph: &mut TaskGraph, params: &Params) -> Result<Evaluation, PipelineError> {
    let table = request_table(graph, steps::EVALUATE, params)?;
    Ok(Evaluation::from_table(&table)?)
}
