#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rt_agg::{
    AggError, AggregationSpec, aggregate, denominator_slug, has_helper_columns, is_reducible,
    join_aggregated, numerator_slug, reduce_aggregated,
};
use rt_expr::{
    AggregationKind, EvalContext, EvalError, ParseError, ParsedFormula, parse_formula,
    reserved_words,
};
use rt_frame::{
    DataFrame, Dataset, DatasetId, DatasetState, FrameError, Schema, parse_date_text,
    slugify_columns, split_groups, unique_slug,
};
use rt_types::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Agg(#[from] AggError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("no dataset with id {0}")]
    UnknownDataset(DatasetId),
    #[error("invalid argument: {0}")]
    Argument(String),
    #[error("cannot delete calculation {name}: {dependents:?} depend on it")]
    Dependency {
        name: String,
        dependents: Vec<String>,
    },
    #[error("a calculation named {name} already exists for this dataset and group")]
    UniqueCalculation { name: String },
    #[error("column {column} is not a dimension and cannot be grouped on")]
    ColumnType { column: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CalculationState {
    Pending,
    Ready,
    Failed { message: String },
}

/// A named, formula-defined column (or aggregation) attached to a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculation {
    pub dataset_id: DatasetId,
    /// Result column slug; unique per dataset, or per aggregated dataset when
    /// the formula is grouped.
    pub name: String,
    pub label: String,
    pub formula: String,
    /// Comma-joined group column slugs; empty for ungrouped.
    pub group_str: String,
    pub aggregation: Option<AggregationKind>,
    pub aggregated_dataset_id: Option<DatasetId>,
    /// Names of sibling calculations this formula reads.
    pub dependencies: BTreeSet<String>,
    /// Names of sibling calculations reading this one's column.
    pub dependent_calculations: BTreeSet<String>,
    pub state: CalculationState,
}

impl Calculation {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == CalculationState::Pending
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == CalculationState::Ready
    }

    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        split_groups(&self.group_str)
    }
}

/// Reference to one calculation inside a task payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalcRef {
    pub name: String,
    pub group_str: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    CalculateBatch {
        dataset_id: DatasetId,
        members: Vec<CalcRef>,
    },
    Updates {
        dataset_id: DatasetId,
        rows: Vec<BTreeMap<String, Value>>,
    },
}

/// FIFO of deferred engine work. Drained one task at a time, which is what
/// serializes calculation batches per dataset.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,
    requeues: u64,
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        self.tasks.push_back(task);
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Number of times a batch observed sibling pending work and went back to
    /// the end of the queue.
    #[must_use]
    pub fn requeues(&self) -> u64 {
        self.requeues
    }
}

/// In-memory repository of datasets, their row frames, and their
/// calculations. Passed explicitly through every engine call.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DatasetStore {
    datasets: BTreeMap<DatasetId, Dataset>,
    frames: BTreeMap<DatasetId, DataFrame>,
    calculations: BTreeMap<DatasetId, Vec<Calculation>>,
    next_id: u64,
}

impl DatasetStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> DatasetId {
        self.next_id += 1;
        DatasetId::new(format!("ds{}", self.next_id))
    }

    /// Register a new source dataset from a frame whose column names are raw
    /// labels. Labels are slugified, text columns that look like dates are
    /// converted, and the schema is built from the result.
    pub fn create_dataset(&mut self, labeled: DataFrame) -> Result<DatasetId, EngineError> {
        let labels: Vec<String> = labeled.column_names().map(str::to_owned).collect();
        let slugs = slugify_columns(&labels, &reserved_words());

        let mut frame = DataFrame::new();
        for (label, slug) in labels.iter().zip(&slugs) {
            let values = labeled
                .column(label)
                .map(<[Value]>::to_vec)
                .unwrap_or_default();
            frame.insert_column(slug.clone(), values)?;
        }
        recognize_date_columns(&mut frame);

        let mut schema = Schema::from_frame(&frame, None);
        for (label, slug) in labels.iter().zip(&slugs) {
            if let Some(column) = schema.get(slug) {
                let mut column = column.clone();
                column.label = label.clone();
                schema.insert(slug.clone(), column);
            }
        }

        let id = self.allocate_id();
        let mut dataset = Dataset::new(id.clone());
        dataset.set_schema(schema);
        dataset.set_state(DatasetState::Ready);
        info!(dataset = %id, columns = slugs.len(), rows = frame.num_rows(), "dataset created");
        self.datasets.insert(id.clone(), dataset);
        self.frames.insert(id.clone(), frame);
        Ok(id)
    }

    pub fn dataset(&self, id: &DatasetId) -> Result<&Dataset, EngineError> {
        self.datasets
            .get(id)
            .ok_or_else(|| EngineError::UnknownDataset(id.clone()))
    }

    pub fn dataset_mut(&mut self, id: &DatasetId) -> Result<&mut Dataset, EngineError> {
        self.datasets
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownDataset(id.clone()))
    }

    /// Raw stored frame, provenance column included.
    pub fn frame(&self, id: &DatasetId) -> Result<&DataFrame, EngineError> {
        self.frames
            .get(id)
            .ok_or_else(|| EngineError::UnknownDataset(id.clone()))
    }

    #[must_use]
    pub fn frame_if_exists(&self, id: &DatasetId) -> Option<&DataFrame> {
        self.frames.get(id)
    }

    /// Column-oriented view of the rows without the hidden provenance tag,
    /// which is what formulas evaluate against.
    pub fn dframe(&self, id: &DatasetId) -> Result<DataFrame, EngineError> {
        Ok(self.frame(id)?.without_parent_column())
    }

    /// Swap a dataset's row set for a new frame, rebuilding the schema from
    /// the new columns while keeping known labels.
    pub fn replace_observations(
        &mut self,
        id: &DatasetId,
        frame: DataFrame,
    ) -> Result<(), EngineError> {
        let schema = {
            let dataset = self.dataset(id)?;
            Schema::from_frame(&frame.without_parent_column(), Some(dataset.schema()))
        };
        let dataset = self.dataset_mut(id)?;
        dataset.set_schema(schema);
        dataset.set_state(DatasetState::Ready);
        dataset.bump_version();
        dataset.clear_summary_stats();
        self.frames.insert(id.clone(), frame);
        Ok(())
    }

    fn set_column_label(&mut self, id: &DatasetId, slug: &str, label: &str) {
        if let Ok(dataset) = self.dataset_mut(id)
            && let Some(mut column) = dataset.schema().get(slug).cloned()
        {
            column.label = label.to_owned();
            dataset.schema_mut().insert(slug, column);
        }
    }

    #[must_use]
    pub fn calculations(&self, id: &DatasetId) -> &[Calculation] {
        self.calculations.get(id).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn calculation(&self, id: &DatasetId, name: &str, group_str: &str) -> Option<&Calculation> {
        self.calculations(id)
            .iter()
            .find(|calc| calc.name == name && calc.group_str == group_str)
    }

    fn calculation_mut(
        &mut self,
        id: &DatasetId,
        name: &str,
        group_str: &str,
    ) -> Option<&mut Calculation> {
        self.calculations
            .get_mut(id)?
            .iter_mut()
            .find(|calc| calc.name == name && calc.group_str == group_str)
    }

    fn push_calculation(&mut self, calc: Calculation) {
        self.calculations
            .entry(calc.dataset_id.clone())
            .or_default()
            .push(calc);
    }
}

/// Convert whole text columns that parse as dates into datetime values.
fn recognize_date_columns(frame: &mut DataFrame) {
    let candidates: Vec<String> = frame
        .iter_columns()
        .filter(|(_, values)| {
            let mut any = false;
            for value in *values {
                match value {
                    Value::Null => {}
                    Value::Text(text) if parse_date_text(text).is_some() => any = true,
                    _ => return false,
                }
            }
            any
        })
        .map(|(name, _)| name.to_owned())
        .collect();
    for name in candidates {
        let converted = frame
            .column(&name)
            .map(|values| {
                values
                    .iter()
                    .map(|value| match value {
                        Value::Text(text) => parse_date_text(text)
                            .map_or(Value::Null, Value::Datetime),
                        other => other.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        // Length unchanged, so this cannot fail.
        let _ = frame.set_column(name, converted);
    }
}

// ── Validation and the calculation lifecycle ───────────────────────────

/// Parse and validate a formula against a dataset, without scheduling
/// anything. Returns the aggregation prefix, if any.
pub fn validate(
    store: &DatasetStore,
    dataset_id: &DatasetId,
    formula: &str,
    group_str: &str,
) -> Result<Option<AggregationKind>, EngineError> {
    let parsed = validated_parse(store, dataset_id, formula, group_str)?;
    Ok(parsed.aggregation)
}

fn validated_parse(
    store: &DatasetStore,
    dataset_id: &DatasetId,
    formula: &str,
    group_str: &str,
) -> Result<ParsedFormula, EngineError> {
    let dataset = store.dataset(dataset_id)?;
    let schema = dataset.schema();
    if schema.is_empty() {
        return Err(ParseError::MissingSchema.into());
    }

    let parsed = parse_formula(formula)?;

    let groups = split_groups(group_str);
    if !groups.is_empty() && parsed.aggregation.is_none() {
        return Err(EngineError::Argument(
            "groups are only valid for aggregation formulas".to_owned(),
        ));
    }
    for group in &groups {
        if !schema.contains(group) {
            return Err(ParseError::UnknownGroup(group.clone()).into());
        }
        if !schema.is_dimension(group) {
            return Err(EngineError::ColumnType {
                column: group.clone(),
            });
        }
    }

    // A formula may read schema columns or the output of sibling row-wise
    // calculations, including ones still pending in the same batch.
    let calc_columns: BTreeSet<&str> = store
        .calculations(dataset_id)
        .iter()
        .filter(|calc| calc.aggregation.is_none())
        .map(|calc| calc.name.as_str())
        .collect();
    for column in parsed.dependent_columns() {
        if !schema.contains(&column) && !calc_columns.contains(column.as_str()) {
            return Err(ParseError::MissingColumn(column).into());
        }
    }
    Ok(parsed)
}

/// Column slugs a formula reads, validated against the dataset.
pub fn dependent_columns(
    store: &DatasetStore,
    dataset_id: &DatasetId,
    formula: &str,
) -> Result<BTreeSet<String>, EngineError> {
    let parsed = validated_parse(store, dataset_id, formula, "")?;
    Ok(parsed.dependent_columns())
}

/// One calculation request, for batch submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationRequest {
    pub formula: String,
    pub label: String,
    pub group_str: String,
}

/// Validate and register a calculation in `pending` state, scheduling the
/// compute on the queue. Validation failures surface here, before any
/// deferred work exists.
pub fn create_calculation(
    store: &mut DatasetStore,
    queue: &mut TaskQueue,
    dataset_id: &DatasetId,
    formula: &str,
    label: &str,
    group_str: &str,
) -> Result<Calculation, EngineError> {
    let calc = install_calculation(store, dataset_id, formula, label, group_str)?;
    queue.push(Task::CalculateBatch {
        dataset_id: dataset_id.clone(),
        members: vec![CalcRef {
            name: calc.name.clone(),
            group_str: calc.group_str.clone(),
        }],
    });
    Ok(calc)
}

/// Validate and register several calculations as one batch. Any validation
/// failure rejects the whole list before anything is installed.
pub fn create_calculations_from_list(
    store: &mut DatasetStore,
    queue: &mut TaskQueue,
    dataset_id: &DatasetId,
    requests: &[CalculationRequest],
) -> Result<Vec<Calculation>, EngineError> {
    let mut installed = Vec::with_capacity(requests.len());
    for request in requests {
        // Each install makes the new name visible to the next request's
        // dependency check, so in-batch references validate.
        installed.push(install_calculation(
            store,
            dataset_id,
            &request.formula,
            &request.label,
            &request.group_str,
        )?);
    }
    queue.push(Task::CalculateBatch {
        dataset_id: dataset_id.clone(),
        members: installed
            .iter()
            .map(|calc| CalcRef {
                name: calc.name.clone(),
                group_str: calc.group_str.clone(),
            })
            .collect(),
    });
    Ok(installed)
}

fn install_calculation(
    store: &mut DatasetStore,
    dataset_id: &DatasetId,
    formula: &str,
    label: &str,
    group_str: &str,
) -> Result<Calculation, EngineError> {
    let parsed = validated_parse(store, dataset_id, formula, group_str)?;
    let aggregation = parsed.aggregation;

    let reserved = reserved_words();
    let base = slugify_columns(&[label.to_owned()], &reserved)
        .pop()
        .unwrap_or_default();

    // Names are unique per dataset for row-wise calculations and per
    // (dataset, group) for aggregations, so different groups may reuse one.
    let collision = store.calculations(dataset_id).iter().any(|calc| {
        calc.name == base
            && if aggregation.is_some() {
                calc.group_str == group_str
            } else {
                calc.aggregation.is_none()
            }
    });
    if collision {
        return Err(EngineError::UniqueCalculation { name: base });
    }

    let taken: BTreeSet<String> = if aggregation.is_some() {
        store
            .dataset(dataset_id)?
            .aggregated_dataset(group_str)
            .and_then(|agg_id| store.frame_if_exists(agg_id))
            .map(|frame| frame.column_names().map(str::to_owned).collect())
            .unwrap_or_default()
    } else {
        store
            .dataset(dataset_id)?
            .schema()
            .slugs()
            .map(str::to_owned)
            .collect()
    };
    let name = unique_slug(&base, &taken, &reserved);

    let calc = Calculation {
        dataset_id: dataset_id.clone(),
        name,
        label: label.to_owned(),
        formula: formula.to_owned(),
        group_str: group_str.to_owned(),
        aggregation,
        aggregated_dataset_id: None,
        dependencies: BTreeSet::new(),
        dependent_calculations: BTreeSet::new(),
        state: CalculationState::Pending,
    };
    debug!(dataset = %dataset_id, name = %calc.name, group = %group_str, "calculation installed");
    store.push_calculation(calc.clone());
    Ok(calc)
}

/// Remove a calculation and its column, refusing while other calculations
/// still read it.
pub fn delete_calculation(
    store: &mut DatasetStore,
    dataset_id: &DatasetId,
    name: &str,
    group_str: &str,
) -> Result<(), EngineError> {
    let calc = store
        .calculation(dataset_id, name, group_str)
        .cloned()
        .ok_or_else(|| EngineError::Argument(format!("no calculation named {name}")))?;
    if !calc.dependent_calculations.is_empty() {
        return Err(EngineError::Dependency {
            name: name.to_owned(),
            dependents: calc.dependent_calculations.iter().cloned().collect(),
        });
    }

    if let Some(kind) = calc.aggregation {
        let agg_id = store.dataset(dataset_id)?.aggregated_dataset(group_str).cloned();
        if let Some(agg_id) = agg_id
            && let Some(frame) = store.frame_if_exists(&agg_id)
        {
            let mut frame = frame.clone();
            let mut slugs = vec![name.to_owned()];
            if has_helper_columns(kind) {
                slugs.push(numerator_slug(name));
                slugs.push(denominator_slug(name));
            }
            for slug in slugs {
                if frame.has_column(&slug) {
                    frame.drop_column(&slug)?;
                }
            }
            store.replace_observations(&agg_id, frame)?;
        }
    } else {
        let mut frame = store.frame(dataset_id)?.clone();
        if frame.has_column(name) {
            frame.drop_column(name)?;
        }
        store.replace_observations(dataset_id, frame)?;
        propagate_to_children(store, dataset_id)?;
    }

    for dependency in &calc.dependencies {
        if let Some(other) = store.calculation_mut(dataset_id, dependency, "") {
            other.dependent_calculations.remove(name);
        }
    }
    if let Some(list) = store.calculations.get_mut(dataset_id) {
        list.retain(|entry| !(entry.name == name && entry.group_str == group_str));
    }
    info!(dataset = %dataset_id, name, "calculation deleted");
    Ok(())
}

// ── Merged datasets ────────────────────────────────────────────────────

/// Create a dataset holding the concatenated rows of the given parents, each
/// row tagged with its originating parent id.
pub fn create_merged_dataset(
    store: &mut DatasetStore,
    parent_ids: &[DatasetId],
) -> Result<DatasetId, EngineError> {
    if parent_ids.len() < 2 {
        return Err(EngineError::Argument(
            "merging requires at least two datasets".to_owned(),
        ));
    }
    let distinct: BTreeSet<&DatasetId> = parent_ids.iter().collect();
    if distinct.len() != parent_ids.len() {
        return Err(EngineError::Argument(
            "cannot merge a dataset with itself".to_owned(),
        ));
    }
    for parent_id in parent_ids {
        store.dataset(parent_id)?;
    }

    let child_id = store.allocate_id();
    store
        .datasets
        .insert(child_id.clone(), Dataset::new(child_id.clone()));

    let mut contributions = Vec::with_capacity(parent_ids.len());
    for parent_id in parent_ids {
        let mut contribution = store.frame(parent_id)?.without_parent_column();
        contribution.add_parent_column(parent_id);
        contributions.push(contribution);
    }
    let combined = DataFrame::concat(&contributions.iter().collect::<Vec<_>>());
    store.replace_observations(&child_id, combined)?;

    for parent_id in parent_ids {
        link_merged_dataset(store, parent_id, &child_id)?;
    }
    info!(child = %child_id, parents = parent_ids.len(), "merged dataset created");
    Ok(child_id)
}

/// Record `child` as a merged child of `parent`, rejecting links that would
/// close a propagation cycle.
pub fn link_merged_dataset(
    store: &mut DatasetStore,
    parent_id: &DatasetId,
    child_id: &DatasetId,
) -> Result<(), EngineError> {
    if parent_id == child_id || is_merge_descendant(store, child_id, parent_id) {
        return Err(EngineError::Argument(format!(
            "linking {child_id} under {parent_id} would create a cycle"
        )));
    }
    store.dataset_mut(parent_id)?.link_merged(child_id.clone());
    Ok(())
}

/// Whether `target` is reachable from `from` by following merged-child links.
fn is_merge_descendant(store: &DatasetStore, from: &DatasetId, target: &DatasetId) -> bool {
    let Ok(dataset) = store.dataset(from) else {
        return false;
    };
    dataset.merged_dataset_ids().iter().any(|child| {
        child == target || is_merge_descendant(store, child, target)
    })
}

/// Replace each merged child's partition of rows contributed by `parent_id`
/// with the parent's current rows, then recurse. Partitions from other
/// parents are left untouched.
fn propagate_to_children(store: &mut DatasetStore, parent_id: &DatasetId) -> Result<(), EngineError> {
    let children = store.dataset(parent_id)?.merged_dataset_ids().to_vec();
    for child_id in children {
        let mut contribution = store.frame(parent_id)?.without_parent_column();
        contribution.add_parent_column(parent_id);

        let mut child_frame = store.frame(&child_id)?.clone();
        child_frame.remove_parent_rows(parent_id);
        let combined = DataFrame::concat(&[&child_frame, &contribution]);
        debug!(parent = %parent_id, child = %child_id, rows = combined.num_rows(), "parent partition replaced");
        store.replace_observations(&child_id, combined)?;

        refresh_row_calculations(store, &child_id)?;
        refresh_aggregations(store, &child_id)?;
        propagate_to_children(store, &child_id)?;
    }
    Ok(())
}

/// Recompute every ready row-wise calculation of a dataset over its full
/// frame, so refreshed partitions carry the dataset's own derived columns.
fn refresh_row_calculations(
    store: &mut DatasetStore,
    dataset_id: &DatasetId,
) -> Result<(), EngineError> {
    let members: Vec<Calculation> = store
        .calculations(dataset_id)
        .iter()
        .filter(|calc| calc.aggregation.is_none() && calc.is_ready())
        .cloned()
        .collect();
    for calc in members {
        let outcome = parse_formula(&calc.formula)
            .map_err(EngineError::from)
            .and_then(|parsed| {
                let dframe = store.dframe(dataset_id)?;
                let schema = store.dataset(dataset_id)?.schema().clone();
                evaluate_column(&parsed.expressions[0], &dframe, &schema)
            });
        match outcome {
            Ok(values) => {
                let mut raw = store.frame(dataset_id)?.clone();
                raw.set_column(&calc.name, values)?;
                store.replace_observations(dataset_id, raw)?;
            }
            Err(err) => mark_failed(store, dataset_id, &calc, &err),
        }
    }
    Ok(())
}

/// Recompute every ready aggregation of a dataset from its full frame.
fn refresh_aggregations(store: &mut DatasetStore, dataset_id: &DatasetId) -> Result<(), EngineError> {
    let members: Vec<Calculation> = store
        .calculations(dataset_id)
        .iter()
        .filter(|calc| calc.aggregation.is_some() && calc.is_ready())
        .cloned()
        .collect();
    for calc in members {
        if let Err(err) = run_one_calculation(store, dataset_id, &calc) {
            mark_failed(store, dataset_id, &calc, &err);
        }
    }
    Ok(())
}

// ── The task loop ──────────────────────────────────────────────────────

/// Schedule an incremental row update for a dataset.
pub fn submit_updates(
    queue: &mut TaskQueue,
    dataset_id: &DatasetId,
    rows: Vec<BTreeMap<String, Value>>,
) {
    queue.push(Task::Updates {
        dataset_id: dataset_id.clone(),
        rows,
    });
}

/// Drain the queue one task at a time until no work remains.
pub fn run_until_idle(store: &mut DatasetStore, queue: &mut TaskQueue) -> Result<(), EngineError> {
    while let Some(task) = queue.pop() {
        match task {
            Task::CalculateBatch {
                dataset_id,
                members,
            } => {
                if let Some(expanded) = restart_if_has_pending(store, &dataset_id, &members) {
                    queue.requeues += 1;
                    queue.push(Task::CalculateBatch {
                        dataset_id,
                        members: expanded,
                    });
                    continue;
                }
                run_batch(store, &dataset_id, &members)?;
            }
            Task::Updates { dataset_id, rows } => {
                calculate_updates(store, &dataset_id, rows)?;
            }
        }
    }
    Ok(())
}

/// Cooperative at-most-one-batch-per-dataset policy: a batch that observes
/// sibling pending calculations outside itself steps aside and requeues,
/// widened to cover the whole pending set so the retry makes progress.
fn restart_if_has_pending(
    store: &DatasetStore,
    dataset_id: &DatasetId,
    members: &[CalcRef],
) -> Option<Vec<CalcRef>> {
    let pending: Vec<CalcRef> = store
        .calculations(dataset_id)
        .iter()
        .filter(|calc| calc.is_pending())
        .map(|calc| CalcRef {
            name: calc.name.clone(),
            group_str: calc.group_str.clone(),
        })
        .collect();
    let outside_batch = pending.iter().any(|entry| !members.contains(entry));
    if outside_batch {
        debug!(dataset = %dataset_id, pending = pending.len(), "sibling pending work, requeueing batch");
        Some(pending)
    } else {
        None
    }
}

fn run_batch(
    store: &mut DatasetStore,
    dataset_id: &DatasetId,
    members: &[CalcRef],
) -> Result<(), EngineError> {
    for member in members {
        let Some(calc) = store
            .calculation(dataset_id, &member.name, &member.group_str)
            .cloned()
        else {
            continue;
        };
        if !calc.is_pending() {
            continue;
        }
        debug!(dataset = %dataset_id, name = %calc.name, "running calculation");
        match run_one_calculation(store, dataset_id, &calc) {
            Ok(()) => {
                record_dependency_edges(store, dataset_id, &calc);
                let agg_id = store
                    .dataset(dataset_id)?
                    .aggregated_dataset(&calc.group_str)
                    .cloned();
                if let Some(entry) = store.calculation_mut(dataset_id, &calc.name, &calc.group_str)
                {
                    if entry.aggregation.is_some() {
                        entry.aggregated_dataset_id = agg_id;
                    }
                    entry.state = CalculationState::Ready;
                }
            }
            Err(err) => mark_failed(store, dataset_id, &calc, &err),
        }
    }
    Ok(())
}

/// Runtime failures mark the calculation, never the dataset: no partial
/// column is installed and dependents are left untouched.
fn mark_failed(store: &mut DatasetStore, dataset_id: &DatasetId, calc: &Calculation, err: &EngineError) {
    warn!(dataset = %dataset_id, name = %calc.name, error = %err, "calculation failed");
    if let Some(entry) = store.calculation_mut(dataset_id, &calc.name, &calc.group_str) {
        entry.state = CalculationState::Failed {
            message: err.to_string(),
        };
    }
}

fn run_one_calculation(
    store: &mut DatasetStore,
    dataset_id: &DatasetId,
    calc: &Calculation,
) -> Result<(), EngineError> {
    let parsed = parse_formula(&calc.formula)?;
    match parsed.aggregation {
        Some(kind) => run_aggregation_full(store, dataset_id, calc, kind, &parsed.expressions),
        None => {
            let dframe = store.dframe(dataset_id)?;
            let schema = store.dataset(dataset_id)?.schema().clone();
            let values = evaluate_column(&parsed.expressions[0], &dframe, &schema)?;

            let mut raw = store.frame(dataset_id)?.clone();
            raw.set_column(&calc.name, values)?;
            store.replace_observations(dataset_id, raw)?;
            store.set_column_label(dataset_id, &calc.name, &calc.label);
            propagate_to_children(store, dataset_id)
        }
    }
}

fn evaluate_column(
    expr: &rt_expr::Expr,
    frame: &DataFrame,
    schema: &Schema,
) -> Result<Vec<Value>, EngineError> {
    let context = EvalContext::with_frame(schema, frame);
    let mut values = Vec::with_capacity(frame.num_rows());
    for row in frame.rows() {
        values.push(expr.evaluate(&row, &context)?);
    }
    Ok(values)
}

fn run_aggregation_full(
    store: &mut DatasetStore,
    dataset_id: &DatasetId,
    calc: &Calculation,
    kind: AggregationKind,
    expressions: &[rt_expr::Expr],
) -> Result<(), EngineError> {
    let dframe = store.dframe(dataset_id)?;
    let schema = store.dataset(dataset_id)?.schema().clone();
    let groups = calc.groups();
    let spec = AggregationSpec {
        name: &calc.name,
        kind,
        expressions,
        groups: &groups,
    };
    let fragment = aggregate(&spec, &dframe, &schema)?;

    let agg_id = ensure_aggregated_dataset(store, dataset_id, &calc.group_str)?;
    let joined = join_aggregated(store.frame_if_exists(&agg_id), &fragment, &groups)?;
    store.replace_observations(&agg_id, joined)?;
    store.set_column_label(&agg_id, &calc.name, &calc.label);
    Ok(())
}

/// Aggregated dataset for (dataset, group key), created and linked on first
/// use. At most one exists per pair.
fn ensure_aggregated_dataset(
    store: &mut DatasetStore,
    dataset_id: &DatasetId,
    group_str: &str,
) -> Result<DatasetId, EngineError> {
    if let Some(existing) = store.dataset(dataset_id)?.aggregated_dataset(group_str) {
        return Ok(existing.clone());
    }
    let agg_id = store.allocate_id();
    let mut dataset = Dataset::new(agg_id.clone());
    dataset.set_state(DatasetState::Ready);
    store.datasets.insert(agg_id.clone(), dataset);
    store
        .dataset_mut(dataset_id)?
        .link_aggregated(group_str, agg_id.clone());
    info!(dataset = %dataset_id, aggregated = %agg_id, group = group_str, "aggregated dataset created");
    Ok(agg_id)
}

/// Bidirectional dependency edges between a freshly installed calculation
/// and the sibling calculations whose columns its formula reads.
fn record_dependency_edges(store: &mut DatasetStore, dataset_id: &DatasetId, calc: &Calculation) {
    let Ok(parsed) = parse_formula(&calc.formula) else {
        return;
    };
    let referenced = parsed.dependent_columns();
    let siblings: Vec<String> = store
        .calculations(dataset_id)
        .iter()
        .filter(|other| other.aggregation.is_none() && other.name != calc.name)
        .map(|other| other.name.clone())
        .collect();
    for sibling in siblings {
        if !referenced.contains(&sibling) {
            continue;
        }
        if let Some(entry) = store.calculation_mut(dataset_id, &calc.name, &calc.group_str) {
            entry.dependencies.insert(sibling.clone());
        }
        if let Some(other) = store.calculation_mut(dataset_id, &sibling, "") {
            other.dependent_calculations.insert(calc.name.clone());
        }
    }
}

// ── Incremental updates ────────────────────────────────────────────────

/// Apply new rows to a dataset: compute existing row-wise calculations on
/// the new rows, append them, fold the new rows into each aggregation
/// (incrementally where the kind allows it), and replace this dataset's
/// partition in every merged child.
pub fn calculate_updates(
    store: &mut DatasetStore,
    dataset_id: &DatasetId,
    rows: Vec<BTreeMap<String, Value>>,
) -> Result<(), EngineError> {
    let schema = store.dataset(dataset_id)?.schema().clone();
    let labels_to_slugs = schema.labels_to_slugs();
    let reserved = reserved_words();

    let remapped: Vec<BTreeMap<String, Value>> = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(key, value)| {
                    let slug = if schema.contains(&key) {
                        key
                    } else if let Some(slug) = labels_to_slugs.get(&key) {
                        slug.clone()
                    } else {
                        slugify_columns(&[key], &reserved)
                            .pop()
                            .unwrap_or_default()
                    };
                    (slug, value)
                })
                .collect()
        })
        .collect();

    let mut new_frame = DataFrame::from_rows(&remapped);
    new_frame.recognize_dates_from_schema(&schema);
    info!(dataset = %dataset_id, rows = new_frame.num_rows(), "applying row updates");

    // Row-wise calculations run for only the new rows, in creation order so
    // in-batch references resolve. Evaluation sees the concatenated frame:
    // column-wide functions must rank against every row, not just the batch.
    let existing = store.frame(dataset_id)?.clone();
    let start = existing.num_rows();
    let mut combined = DataFrame::concat(&[&existing, &new_frame]);
    let row_calcs: Vec<Calculation> = store
        .calculations(dataset_id)
        .iter()
        .filter(|calc| calc.aggregation.is_none() && calc.is_ready())
        .cloned()
        .collect();
    for calc in &row_calcs {
        let outcome = parse_formula(&calc.formula)
            .map_err(EngineError::from)
            .and_then(|parsed| {
                let context = EvalContext::with_frame(&schema, &combined);
                let mut tail = Vec::with_capacity(combined.num_rows() - start);
                for idx in start..combined.num_rows() {
                    tail.push(parsed.expressions[0].evaluate(&combined.row(idx), &context)?);
                }
                Ok(tail)
            });
        match outcome {
            Ok(tail) => {
                new_frame.set_column(&calc.name, tail.clone())?;
                let mut values: Vec<Value> = combined
                    .column(&calc.name)
                    .map(<[Value]>::to_vec)
                    .unwrap_or_else(|| vec![Value::Null; start]);
                values.truncate(start);
                values.extend(tail);
                combined.set_column(&calc.name, values)?;
            }
            Err(err) => mark_failed(store, dataset_id, calc, &err),
        }
    }
    store.replace_observations(dataset_id, combined)?;

    // Aggregations fold in the new rows; reducible kinds merge partial sums,
    // the rest rescan the full frame.
    let agg_calcs: Vec<Calculation> = store
        .calculations(dataset_id)
        .iter()
        .filter(|calc| calc.aggregation.is_some() && calc.is_ready())
        .cloned()
        .collect();
    for calc in &agg_calcs {
        if let Err(err) = update_aggregation(store, dataset_id, calc, &new_frame, &schema) {
            mark_failed(store, dataset_id, calc, &err);
        }
    }

    propagate_to_children(store, dataset_id)
}

fn update_aggregation(
    store: &mut DatasetStore,
    dataset_id: &DatasetId,
    calc: &Calculation,
    new_frame: &DataFrame,
    schema: &Schema,
) -> Result<(), EngineError> {
    let kind = calc
        .aggregation
        .ok_or_else(|| EngineError::Argument("not an aggregation".to_owned()))?;
    let parsed = parse_formula(&calc.formula)?;
    let groups = calc.groups();

    let agg_id = store
        .dataset(dataset_id)?
        .aggregated_dataset(&calc.group_str)
        .cloned();
    let existing = agg_id
        .as_ref()
        .and_then(|id| store.frame_if_exists(id))
        .cloned();

    if let (Some(agg_id), Some(existing)) = (agg_id, existing)
        && is_reducible(kind)
        && existing.has_column(&calc.name)
    {
        let spec = AggregationSpec {
            name: &calc.name,
            kind,
            expressions: &parsed.expressions,
            groups: &groups,
        };
        let fragment = aggregate(&spec, new_frame, schema)?;
        let reduced = reduce_aggregated(&existing, &fragment, &groups, &calc.name, kind)?;
        debug!(dataset = %dataset_id, name = %calc.name, "aggregation reduced incrementally");
        return store.replace_observations(&agg_id, reduced);
    }
    run_aggregation_full(store, dataset_id, calc, kind, &parsed.expressions)
}
