//! Dependency-Ordered Executor
//!
//! Steps are registered with the ids they depend on. `apply` checks the
//! whole graph before running anything, then runs each step only after
//! every dependency completed. The first failure stops the run; nothing is
//! rolled back.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::addresses::AddressError;
use crate::render::RenderError;
use crate::secrets::SecretStoreError;
use crate::tool_runner::ExternalToolError;

/// Named values a completed step publishes to its dependents.
pub type StepOutputs = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    ExternalTool(#[from] ExternalToolError),

    #[error(transparent)]
    SecretStore(#[from] SecretStoreError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("Step {step} read outputs of {dependency}, which it does not depend on")]
    UndeclaredDependency { step: String, dependency: String },

    #[error("Step {step} could not encode its outputs: {source}")]
    Outputs {
        step: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Step {0} is registered twice")]
    DuplicateStep(String),

    #[error("Step {step} depends on {dependency}, which is not part of the plan")]
    DependencyUnmet { step: String, dependency: String },

    #[error("Circular dependency between steps: {0}")]
    CycleDetected(String),

    #[error("Step {step} failed: {source}")]
    StepFailed {
        step: String,
        completed: Vec<String>,
        #[source]
        source: StepError,
    },
}

/// One unit of work. Steps run at most once and are consumed by running.
pub trait Step {
    fn kind(&self) -> &'static str;
    fn run(self: Box<Self>, ctx: &StepContext<'_>) -> Result<StepOutputs, StepError>;
}

/// What a running step may see: outputs of the steps it declared.
pub struct StepContext<'a> {
    step: &'a str,
    depends_on: &'a BTreeSet<String>,
    completed: &'a BTreeMap<String, StepOutputs>,
}

impl<'a> StepContext<'a> {
    pub fn step_id(&self) -> &str {
        self.step
    }

    pub fn output(&self, dependency: &str, key: &str) -> Result<Option<&'a Value>, StepError> {
        if !self.depends_on.contains(dependency) {
            return Err(StepError::UndeclaredDependency {
                step: self.step.to_string(),
                dependency: dependency.to_string(),
            });
        }
        Ok(self.completed.get(dependency).and_then(|o| o.get(key)))
    }
}

struct PlannedStep {
    step: Box<dyn Step>,
    depends_on: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedStepSummary {
    pub id: String,
    pub kind: String,
    pub depends_on: Vec<String>,
}

#[derive(Default)]
pub struct Plan {
    steps: BTreeMap<String, PlannedStep>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S>(&mut self, id: &str, step: S, depends_on: &[&str]) -> Result<String, ExecutorError>
    where
        S: Step + 'static,
    {
        if self.steps.contains_key(id) {
            return Err(ExecutorError::DuplicateStep(id.to_string()));
        }
        self.steps.insert(
            id.to_string(),
            PlannedStep {
                step: Box::new(step),
                depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            },
        );
        Ok(id.to_string())
    }

    /// Register only when `enabled`. A disabled step is never built, has no
    /// edges, and produces nothing.
    pub fn register_if<S, F>(
        &mut self,
        enabled: bool,
        id: &str,
        depends_on: &[&str],
        build: F,
    ) -> Result<Option<String>, ExecutorError>
    where
        S: Step + 'static,
        F: FnOnce() -> S,
    {
        if !enabled {
            debug!(step = id, "step disabled");
            return Ok(None);
        }
        self.register(id, build(), depends_on).map(Some)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.steps.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn describe(&self) -> Result<Vec<PlannedStepSummary>, ExecutorError> {
        Ok(self
            .order()?
            .into_iter()
            .map(|id| {
                let planned = &self.steps[&id];
                PlannedStepSummary {
                    kind: planned.step.kind().to_string(),
                    depends_on: planned.depends_on.iter().cloned().collect(),
                    id,
                }
            })
            .collect())
    }

    /// Execution order. Kahn's algorithm; ready steps are taken in id order
    /// so the order is stable across runs.
    pub fn order(&self) -> Result<Vec<String>, ExecutorError> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for (id, planned) in &self.steps {
            in_degree.entry(id).or_insert(0);
            for dep in &planned.depends_on {
                if !self.steps.contains_key(dep) {
                    return Err(ExecutorError::DependencyUnmet {
                        step: id.clone(),
                        dependency: dep.clone(),
                    });
                }
                *in_degree.entry(id).or_insert(0) += 1;
                dependents.entry(dep).or_default().push(id);
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(current) = queue.pop_front() {
            order.push(current.to_string());
            let mut next_batch = vec![];
            for &dependent in dependents.get(current).map(Vec::as_slice).unwrap_or_default() {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        next_batch.push(dependent);
                    }
                }
            }
            next_batch.sort();
            queue.extend(next_batch);
        }

        if order.len() != self.steps.len() {
            let remaining: Vec<_> = in_degree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(ExecutorError::CycleDetected(remaining.join(", ")));
        }

        Ok(order)
    }

    pub fn apply(mut self) -> Result<ApplyReport, ExecutorError> {
        let order = self.order()?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, steps = order.len(), "applying plan");

        let mut completed: BTreeMap<String, StepOutputs> = BTreeMap::new();
        let mut records = Vec::with_capacity(order.len());

        for id in order {
            let Some(PlannedStep { step, depends_on }) = self.steps.remove(&id) else {
                continue;
            };
            if let Some(missing) = depends_on.iter().find(|d| !completed.contains_key(*d)) {
                return Err(ExecutorError::DependencyUnmet {
                    step: id,
                    dependency: missing.clone(),
                });
            }

            let kind = step.kind();
            let step_started = Utc::now();
            debug!(step = %id, kind, "starting step");
            let ctx = StepContext {
                step: &id,
                depends_on: &depends_on,
                completed: &completed,
            };
            let outputs = match step.run(&ctx) {
                Ok(outputs) => outputs,
                Err(source) => {
                    error!(step = %id, error = %source, "step failed, stopping");
                    return Err(ExecutorError::StepFailed {
                        step: id,
                        completed: completed.into_keys().collect(),
                        source,
                    });
                }
            };

            records.push(StepRecord {
                id: id.clone(),
                kind: kind.to_string(),
                started_at: step_started,
                finished_at: Utc::now(),
                outputs: outputs.clone(),
            });
            completed.insert(id, outputs);
        }

        let finished_at = Utc::now();
        info!(%run_id, "plan applied");
        Ok(ApplyReport {
            run_id,
            started_at,
            finished_at,
            steps: records,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outputs: StepOutputs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
}

impl ApplyReport {
    pub fn ran(&self, id: &str) -> bool {
        self.steps.iter().any(|s| s.id == id)
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    /// Typed view of one output of a completed step.
    pub fn output<T: DeserializeOwned>(&self, id: &str, key: &str) -> Option<T> {
        let value = self.steps.iter().find(|s| s.id == id)?.outputs.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }
}
