// ========================================================================================
//
//                        THE TASK GRAPH: MEMOIZED DEPENDENCY EXECUTION
//
// ========================================================================================
//
// A step is identified by its name plus the values bound to its declared inputs, and by
// the identities of its dependencies. That identity is hashed into an instance key; each
// instance moves Pending -> Running -> Cached, or ends in Failed. A Cached instance is
// never recomputed during the run and, when a cache directory is configured, its artifact
// is written to disk under the same key so later runs can pick it up.
//
// Steps run one at a time, depth first, so dependencies are always Cached before their
// dependent starts. A failed dependency fails every transitive dependent without running it.

use crate::artifact::{Artifact, ArtifactKind};
use crate::table::KeyedTable;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub type StepError = Box<dyn Error + Send + Sync>;

type StepFn = dyn Fn(&StepContext<'_>) -> Result<Artifact, StepError> + Send + Sync;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("No step named '{0}' is registered.")]
    UnknownStep(String),
    #[error("A step named '{0}' is already registered.")]
    DuplicateStep(String),
    #[error("Dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("Input '{input}' of step '{step}' must be {expected}.")]
    InputType {
        step: String,
        input: String,
        expected: &'static str,
    },
    #[error("Step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },
    #[error("Step '{step}' was not run because step '{failed}' failed: {reason}")]
    DependencyFailed {
        step: String,
        failed: String,
        reason: String,
    },
}

impl GraphError {
    /// The error a dependent sees when this one comes out of its dependency.
    fn propagate(self, dependent: &str) -> GraphError {
        match self {
            GraphError::StepFailed { step, reason }
            | GraphError::DependencyFailed {
                failed: step,
                reason,
                ..
            } => GraphError::DependencyFailed {
                step: dependent.to_string(),
                failed: step,
                reason,
            },
            other => other,
        }
    }
}

/// Misuse of the context from inside a step body.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Step '{step}' did not declare a dependency on '{dependency}'.")]
    UndeclaredDependency { step: String, dependency: String },
    #[error("Step '{step}' did not declare an input named '{input}'.")]
    UndeclaredInput { step: String, input: String },
    #[error("Dependency '{dependency}' of step '{step}' produced a {found}, not a {expected}.")]
    WrongArtifact {
        step: String,
        dependency: String,
        expected: ArtifactKind,
        found: ArtifactKind,
    },
}

/// A scalar value bound to a step input.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Float(f64),
    Text(String),
}

impl ParamValue {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Float(_) => "a number",
            Self::Text(_) => "text",
        }
    }

    /// Bit-exact rendering for hashing.
    fn canonical(&self) -> String {
        match self {
            Self::Float(v) => format!("f:{:016x}", v.to_bits()),
            Self::Text(s) => format!("t:{s}"),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Input bindings for a request. Each step only sees the entries it declares.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<ParamValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }
}

/// One node of the graph.
pub struct Step {
    name: String,
    kind: ArtifactKind,
    deps: Vec<String>,
    inputs: Vec<(String, ParamValue)>,
    run: Box<StepFn>,
}

impl Step {
    pub fn new<F>(name: &str, kind: ArtifactKind, run: F) -> Self
    where
        F: Fn(&StepContext<'_>) -> Result<Artifact, StepError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            kind,
            deps: Vec::new(),
            inputs: Vec::new(),
            run: Box::new(run),
        }
    }

    pub fn dep(mut self, name: &str) -> Self {
        self.deps.push(name.to_string());
        self
    }

    /// Declares a scalar input and the value used when a request does not bind it.
    pub fn input(mut self, name: &str, default: impl Into<ParamValue>) -> Self {
        self.inputs.push((name.to_string(), default.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn deps(&self) -> &[String] {
        &self.deps
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    fn bind(&self, params: &Params) -> Result<BTreeMap<String, ParamValue>, GraphError> {
        let mut bound = BTreeMap::new();
        for (input, default) in &self.inputs {
            let value = match params.get(input) {
                Some(v) if std::mem::discriminant(v) != std::mem::discriminant(default) => {
                    return Err(GraphError::InputType {
                        step: self.name.clone(),
                        input: input.clone(),
                        expected: default.kind_name(),
                    });
                }
                Some(v) => v.clone(),
                None => default.clone(),
            };
            bound.insert(input.clone(), value);
        }
        Ok(bound)
    }
}

/// What a step body may read: its declared dependencies and its declared inputs.
pub struct StepContext<'a> {
    step: &'a str,
    deps: &'a HashMap<String, Arc<Artifact>>,
    inputs: &'a BTreeMap<String, ParamValue>,
}

impl StepContext<'_> {
    pub fn step(&self) -> &str {
        self.step
    }

    pub fn dependency(&self, name: &str) -> Result<&Artifact, ContextError> {
        self.deps
            .get(name)
            .map(Arc::as_ref)
            .ok_or_else(|| ContextError::UndeclaredDependency {
                step: self.step.to_string(),
                dependency: name.to_string(),
            })
    }

    fn wrong_kind(&self, dependency: &str, expected: ArtifactKind, found: &Artifact) -> ContextError {
        ContextError::WrongArtifact {
            step: self.step.to_string(),
            dependency: dependency.to_string(),
            expected,
            found: found.kind(),
        }
    }

    pub fn table(&self, name: &str) -> Result<&KeyedTable, ContextError> {
        let artifact = self.dependency(name)?;
        artifact
            .as_table()
            .ok_or_else(|| self.wrong_kind(name, ArtifactKind::Table, artifact))
    }

    pub fn list(&self, name: &str) -> Result<&[String], ContextError> {
        let artifact = self.dependency(name)?;
        artifact
            .as_list()
            .ok_or_else(|| self.wrong_kind(name, ArtifactKind::List, artifact))
    }

    pub fn mapping(&self, name: &str) -> Result<&BTreeMap<String, Vec<String>>, ContextError> {
        let artifact = self.dependency(name)?;
        artifact
            .as_mapping()
            .ok_or_else(|| self.wrong_kind(name, ArtifactKind::Mapping, artifact))
    }

    pub fn input(&self, name: &str) -> Result<&ParamValue, ContextError> {
        self.inputs
            .get(name)
            .ok_or_else(|| ContextError::UndeclaredInput {
                step: self.step.to_string(),
                input: name.to_string(),
            })
    }

    /// Numeric input. Declared inputs are type-checked at binding time, so a text value here
    /// means the step declared it as text.
    pub fn float(&self, name: &str) -> Result<f64, StepError> {
        match self.input(name)? {
            ParamValue::Float(v) => Ok(*v),
            ParamValue::Text(s) => Err(format!("input '{name}' is text ('{s}'), not a number").into()),
        }
    }

    pub fn text(&self, name: &str) -> Result<&str, StepError> {
        match self.input(name)? {
            ParamValue::Text(s) => Ok(s),
            ParamValue::Float(v) => Err(format!("input '{name}' is a number ({v}), not text").into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepState {
    Pending,
    Running,
    Cached(Arc<Artifact>),
    Failed(GraphError),
}

#[derive(Default)]
pub struct TaskGraph {
    steps: HashMap<String, Arc<Step>>,
    order: Vec<String>,
    states: HashMap<String, StepState>,
    cache_dir: Option<PathBuf>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists every computed artifact under `dir` and reloads matching ones instead of
    /// recomputing them.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn register(&mut self, step: Step) -> Result<(), GraphError> {
        if self.steps.contains_key(&step.name) {
            return Err(GraphError::DuplicateStep(step.name));
        }
        self.order.push(step.name.clone());
        self.steps.insert(step.name.clone(), Arc::new(step));
        Ok(())
    }

    /// Registered steps in registration order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.order.iter().filter_map(|name| self.steps.get(name).map(Arc::as_ref))
    }

    fn step(&self, name: &str) -> Result<Arc<Step>, GraphError> {
        self.steps
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownStep(name.to_string()))
    }

    /// The order in which `name` and its transitive dependencies would run.
    pub fn plan(&self, name: &str) -> Result<Vec<String>, GraphError> {
        fn visit(
            graph: &TaskGraph,
            name: &str,
            stack: &mut Vec<String>,
            order: &mut Vec<String>,
        ) -> Result<(), GraphError> {
            if order.iter().any(|n| n == name) {
                return Ok(());
            }
            if let Some(pos) = stack.iter().position(|n| n == name) {
                let mut cycle = stack[pos..].to_vec();
                cycle.push(name.to_string());
                return Err(GraphError::Cycle(cycle));
            }
            let step = graph.step(name)?;
            stack.push(name.to_string());
            for dep in &step.deps {
                visit(graph, dep, stack, order)?;
            }
            stack.pop();
            order.push(name.to_string());
            Ok(())
        }

        let mut order = Vec::new();
        visit(self, name, &mut Vec::new(), &mut order)?;
        Ok(order)
    }

    /// SHA-256 over the step name, its bound inputs and its dependencies' instance keys.
    pub fn instance_key(&self, name: &str, params: &Params) -> Result<String, GraphError> {
        self.plan(name)?;
        self.key_of(name, params)
    }

    fn key_of(&self, name: &str, params: &Params) -> Result<String, GraphError> {
        let step = self.step(name)?;
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        for (input, value) in step.bind(params)? {
            hasher.update(input.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.canonical().as_bytes());
            hasher.update([0u8]);
        }
        for dep in &step.deps {
            hasher.update(self.key_of(dep, params)?.as_bytes());
            hasher.update([0u8]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn state(&self, name: &str, params: &Params) -> Result<StepState, GraphError> {
        let key = self.instance_key(name, params)?;
        Ok(self.states.get(&key).cloned().unwrap_or(StepState::Pending))
    }

    /// Forces an instance into `Failed`, e.g. when an external precondition is known to be
    /// broken. Dependents requested later fail without running.
    pub fn mark_failed(&mut self, name: &str, params: &Params, reason: &str) -> Result<(), GraphError> {
        let key = self.instance_key(name, params)?;
        self.states.insert(
            key,
            StepState::Failed(GraphError::StepFailed {
                step: name.to_string(),
                reason: reason.to_string(),
            }),
        );
        Ok(())
    }

    /// Returns the artifact of `name` under `params`, running whatever is not cached yet.
    pub fn request(&mut self, name: &str, params: &Params) -> Result<Arc<Artifact>, GraphError> {
        self.plan(name)?;
        self.evaluate(name, params)
    }

    fn evaluate(&mut self, name: &str, params: &Params) -> Result<Arc<Artifact>, GraphError> {
        let key = self.key_of(name, params)?;
        match self.states.get(&key) {
            Some(StepState::Cached(artifact)) => {
                debug!("step '{name}': memory cache hit");
                return Ok(Arc::clone(artifact));
            }
            Some(StepState::Failed(error)) => return Err(error.clone()),
            Some(StepState::Running) => return Err(GraphError::Cycle(vec![name.to_string()])),
            Some(StepState::Pending) | None => {}
        }

        let step = self.step(name)?;
        if let Some(artifact) = self.load_persisted(&step, &key) {
            info!("step '{name}': loaded from disk cache");
            let artifact = Arc::new(artifact);
            self.states
                .insert(key, StepState::Cached(Arc::clone(&artifact)));
            return Ok(artifact);
        }
        self.states.insert(key.clone(), StepState::Pending);

        let mut resolved = HashMap::with_capacity(step.deps.len());
        for dep in &step.deps {
            match self.evaluate(dep, params) {
                Ok(artifact) => {
                    resolved.insert(dep.clone(), artifact);
                }
                Err(error) => {
                    let failure = error.propagate(name);
                    warn!("{failure}");
                    self.states.insert(key, StepState::Failed(failure.clone()));
                    return Err(failure);
                }
            }
        }

        let inputs = step.bind(params)?;
        self.states.insert(key.clone(), StepState::Running);
        info!("step '{name}': started");
        let start = Instant::now();

        let context = StepContext {
            step: name,
            deps: &resolved,
            inputs: &inputs,
        };
        let outcome = (step.run)(&context)
            .map_err(|e| e.to_string())
            .and_then(|artifact| {
                if artifact.kind() == step.kind {
                    Ok(artifact)
                } else {
                    Err(format!(
                        "produced a {} but is declared to produce a {}",
                        artifact.kind(),
                        step.kind
                    ))
                }
            });

        match outcome {
            Ok(artifact) => {
                let artifact = Arc::new(artifact);
                self.persist(&step, &key, &artifact);
                self.states
                    .insert(key, StepState::Cached(Arc::clone(&artifact)));
                info!(
                    "step '{name}': finished in {} ms",
                    start.elapsed().as_millis()
                );
                Ok(artifact)
            }
            Err(reason) => {
                let failure = GraphError::StepFailed {
                    step: name.to_string(),
                    reason,
                };
                warn!("{failure}");
                self.states.insert(key, StepState::Failed(failure.clone()));
                Err(failure)
            }
        }
    }

    fn cache_path(&self, step: &Step, key: &str) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(&step.name).join(format!("{key}.tsv")))
    }

    fn load_persisted(&self, step: &Step, key: &str) -> Option<Artifact> {
        let path = self.cache_path(step, key)?;
        if !path.exists() {
            return None;
        }
        match Artifact::read_from(&path, step.kind) {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                warn!(
                    "Ignoring unreadable cache file '{}' for step '{}': {e}",
                    path.display(),
                    step.name
                );
                None
            }
        }
    }

    fn persist(&self, step: &Step, key: &str, artifact: &Artifact) {
        let Some(path) = self.cache_path(step, key) else {
            return;
        };
        if let Err(e) = write_atomically(&path, artifact) {
            warn!(
                "Could not persist step '{}' to '{}': {e}",
                step.name,
                path.display()
            );
        }
    }
}

fn write_atomically(path: &Path, artifact: &Artifact) -> Result<(), StepError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("tsv.partial");
    artifact.write_to(&staging)?;
    fs::rename(&staging, path)?;
    Ok(())
}
