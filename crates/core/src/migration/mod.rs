//! Install, migration and validation pipelines.
//!
//! A pipeline is an ordered list of named [`MigrationStep`]s run by an [`Orchestrator`]. Every
//! step is idempotent, so a pipeline that was aborted half way can simply be run again.
//!
//! Step and pipeline state:
//!
//! ```text
//! step:      Pending -> Running -> Succeeded | Failed
//! pipeline:  NotStarted -> InProgress -> Completed | Aborted { step }
//! ```
//!
//! A step fails when it returns an error (schema-level problems) or when any of its item
//! outcomes failed. The orchestrator stops at the first failed step; later steps stay
//! `Pending`. Values one step hands to the next travel in an explicit [`Carry`].

mod legacy;
mod steps;

pub use legacy::{seed_demo_data, MigrateLegacyData, SeedDemoData, LEGACY_CHECKPOINT};
pub use steps::{InstallBaseTypes, InstallSupportTypes, RebuildDerivedArtifacts, Validate};

use crate::schema::{SchemaChange, SchemaRegistry, SchemaUpsert};
use crate::store::ResourceStore;
use crate::{IdmpError, IdmpResult};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// Public domain-level types
// ============================================================================

/// What happened to one item a step touched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemResult {
    Created,
    Updated,
    Unchanged,
    Deleted,
    /// Re-validated without changes.
    Checked,
    Skipped { reason: String },
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemOutcome {
    /// Path, schema name or artifact the outcome is about.
    pub item: String,
    pub result: ItemResult,
}

impl ItemOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.result, ItemResult::Failed { .. })
    }
}

impl fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            ItemResult::Created => write!(f, "created    {}", self.item),
            ItemResult::Updated => write!(f, "updated    {}", self.item),
            ItemResult::Unchanged => write!(f, "unchanged  {}", self.item),
            ItemResult::Deleted => write!(f, "deleted    {}", self.item),
            ItemResult::Checked => write!(f, "ok         {}", self.item),
            ItemResult::Skipped { reason } => write!(f, "skipped    {}: {reason}", self.item),
            ItemResult::Failed { reason } => write!(f, "FAILED     {}: {reason}", self.item),
        }
    }
}

/// Concept codes collected while migrating, keyed by coding system.
///
/// Migration records every code it writes; validation checks that each of them is still used
/// by a stored instance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Carry {
    pub vocabulary: BTreeMap<String, BTreeSet<String>>,
}

impl Carry {
    pub fn add_code(&mut self, system: &str, code: &str) {
        self.vocabulary
            .entry(system.to_owned())
            .or_default()
            .insert(code.to_owned());
    }

    pub fn contains(&self, system: &str, code: &str) -> bool {
        self.vocabulary
            .get(system)
            .is_some_and(|codes| codes.contains(code))
    }

    /// Every `(system, code)` pair, ordered.
    pub fn codes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vocabulary.iter().flat_map(|(system, codes)| {
            codes
                .iter()
                .map(move |code| (system.as_str(), code.as_str()))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.vocabulary.values().all(BTreeSet::is_empty)
    }

    pub fn merge(&mut self, other: Carry) {
        for (system, codes) in other.vocabulary {
            self.vocabulary.entry(system).or_default().extend(codes);
        }
    }
}

/// Counters and item outcomes of one step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub schema_changes: usize,
    pub outcomes: Vec<ItemOutcome>,
    /// Handed to the next step, merged with what earlier steps carried.
    pub carry: Carry,
}

impl StepReport {
    /// Record an instance-level outcome.
    pub fn record(&mut self, item: impl Into<String>, result: ItemResult) {
        match result {
            ItemResult::Created => self.created += 1,
            ItemResult::Updated => self.updated += 1,
            ItemResult::Unchanged | ItemResult::Checked => self.unchanged += 1,
            ItemResult::Deleted => self.deleted += 1,
            ItemResult::Skipped { .. } | ItemResult::Failed { .. } => {}
        }
        self.outcomes.push(ItemOutcome {
            item: item.into(),
            result,
        });
    }

    /// Record a schema write. Only effective changes are counted.
    pub fn record_schema(&mut self, upsert: &SchemaUpsert) {
        let result = match upsert.change {
            SchemaChange::Created => ItemResult::Created,
            SchemaChange::Updated => ItemResult::Updated,
            SchemaChange::Unchanged => ItemResult::Unchanged,
        };
        if upsert.change.is_change() {
            self.schema_changes += 1;
        }
        self.outcomes.push(ItemOutcome {
            item: format!("schema {}", upsert.resource_type.name),
            result,
        });
    }

    pub fn fail(&mut self, item: impl Into<String>, err: &IdmpError) {
        let item = item.into();
        tracing::warn!(item = %item, error = %err, "item failed");
        self.record(
            item,
            ItemResult::Failed {
                reason: err.to_string(),
            },
        );
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// What a step works against.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub store: &'a ResourceStore,
}

impl<'a> StepContext<'a> {
    pub fn new(store: &'a ResourceStore) -> Self {
        Self { store }
    }

    pub fn registry(&self) -> &'a SchemaRegistry {
        self.store.registry()
    }
}

/// One named, idempotent unit of a pipeline.
pub trait MigrationStep: Send + Sync {
    fn name(&self) -> &str;

    /// Run the step.
    ///
    /// Item-level problems go into the report; an `Err` means the step could not run at all.
    fn run(&self, ctx: &StepContext<'_>, carry: &Carry) -> IdmpResult<StepReport>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrchestratorState {
    NotStarted,
    InProgress,
    Completed,
    Aborted { step: String },
}

/// State and report of one step within a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepRun {
    pub name: String,
    pub state: StepState,
    /// `None` while pending and when the step returned an error.
    pub report: Option<StepReport>,
}

/// Outcome of [`Orchestrator::run`].
#[derive(Debug)]
pub struct RunReport {
    pub state: OrchestratorState,
    pub steps: Vec<StepRun>,
    /// `MigrationStepFailed` for the step that aborted the run.
    pub failure: Option<IdmpError>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == OrchestratorState::Completed
    }

    pub fn created(&self) -> usize {
        self.reports().map(|r| r.created).sum()
    }

    pub fn schema_changes(&self) -> usize {
        self.reports().map(|r| r.schema_changes).sum()
    }

    pub fn step(&self, name: &str) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.name == name)
    }

    fn reports(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter_map(|s| s.report.as_ref())
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs steps in order and stops at the first failure.
pub struct Orchestrator {
    steps: Vec<Box<dyn MigrationStep>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("steps", &self.step_names())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(steps: Vec<Box<dyn MigrationStep>>) -> Self {
        Self { steps }
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn run(&self, ctx: &StepContext<'_>) -> RunReport {
        let mut report = RunReport {
            state: OrchestratorState::NotStarted,
            steps: self
                .steps
                .iter()
                .map(|s| StepRun {
                    name: s.name().to_owned(),
                    state: StepState::Pending,
                    report: None,
                })
                .collect(),
            failure: None,
        };

        let mut carry = Carry::default();
        for (index, step) in self.steps.iter().enumerate() {
            report.state = OrchestratorState::InProgress;
            report.steps[index].state = StepState::Running;
            tracing::info!(step = step.name(), "step started");

            let reason = match step.run(ctx, &carry) {
                Ok(step_report) => {
                    let failed: Vec<String> =
                        step_report.failures().map(ToString::to_string).collect();
                    carry.merge(step_report.carry.clone());
                    tracing::info!(
                        step = step.name(),
                        created = step_report.created,
                        updated = step_report.updated,
                        unchanged = step_report.unchanged,
                        schema_changes = step_report.schema_changes,
                        failed = failed.len(),
                        "step finished"
                    );
                    report.steps[index].report = Some(step_report);
                    if failed.is_empty() {
                        report.steps[index].state = StepState::Succeeded;
                        continue;
                    }
                    format!("{} item(s) failed, first: {}", failed.len(), failed[0])
                }
                Err(err) => err.to_string(),
            };

            tracing::error!(step = step.name(), %reason, "step failed, aborting");
            report.steps[index].state = StepState::Failed;
            report.state = OrchestratorState::Aborted {
                step: step.name().to_owned(),
            };
            report.failure = Some(IdmpError::MigrationStepFailed {
                step: step.name().to_owned(),
                reason,
            });
            return report;
        }

        report.state = OrchestratorState::Completed;
        report
    }
}

// ============================================================================
// Pipelines
// ============================================================================

/// install-base-types, install-support-types, migrate-legacy-data, rebuild-derived-artifacts,
/// validate.
pub fn standard_pipeline() -> Orchestrator {
    Orchestrator::new(vec![
        Box::new(InstallBaseTypes),
        Box::new(InstallSupportTypes),
        Box::new(MigrateLegacyData),
        Box::new(RebuildDerivedArtifacts),
        Box::new(Validate),
    ])
}

/// The standard pipeline without the legacy migration.
pub fn install_pipeline() -> Orchestrator {
    Orchestrator::new(vec![
        Box::new(InstallBaseTypes),
        Box::new(InstallSupportTypes),
        Box::new(RebuildDerivedArtifacts),
        Box::new(Validate),
    ])
}

/// Install the types, then create the demo legacy data.
pub fn seed_pipeline() -> Orchestrator {
    Orchestrator::new(vec![
        Box::new(InstallBaseTypes),
        Box::new(InstallSupportTypes),
        Box::new(SeedDemoData),
    ])
}

/// Validation on its own.
pub fn validate_pipeline() -> Orchestrator {
    Orchestrator::new(vec![Box::new(Validate)])
}
