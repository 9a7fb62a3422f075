#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use rt_types::{OlapType, SimpleType, Value, infer_simple_type};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hidden provenance column recording which source dataset a row came from
/// after a merge or an aggregation fan-out. Never part of the schema.
pub const PARENT_COLUMN: &str = "_parent_dataset_id";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("column {name} has {got} rows, frame has {want}")]
    LengthMismatch {
        name: String,
        got: usize,
        want: usize,
    },
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("duplicate column: {0}")]
    DuplicateColumn(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl DatasetId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatasetId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub label: String,
    pub simple_type: SimpleType,
    pub olap_type: OlapType,
    pub cardinality: Option<u64>,
}

/// Ordered map from column slug to column metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    columns: BTreeMap<String, ColumnSchema>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn get(&self, slug: &str) -> Option<&ColumnSchema> {
        self.columns.get(slug)
    }

    #[must_use]
    pub fn contains(&self, slug: &str) -> bool {
        self.columns.contains_key(slug)
    }

    pub fn insert(&mut self, slug: impl Into<String>, column: ColumnSchema) {
        self.columns.insert(slug.into(), column);
    }

    pub fn remove(&mut self, slug: &str) -> Option<ColumnSchema> {
        self.columns.remove(slug)
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnSchema)> {
        self.columns.iter().map(|(slug, col)| (slug.as_str(), col))
    }

    #[must_use]
    pub fn is_date(&self, slug: &str) -> bool {
        self.columns
            .get(slug)
            .is_some_and(|col| col.simple_type == SimpleType::Datetime)
    }

    #[must_use]
    pub fn is_dimension(&self, slug: &str) -> bool {
        self.columns
            .get(slug)
            .is_some_and(|col| col.olap_type == OlapType::Dimension)
    }

    #[must_use]
    pub fn labels_to_slugs(&self) -> BTreeMap<String, String> {
        self.columns
            .iter()
            .map(|(slug, col)| (col.label.clone(), slug.clone()))
            .collect()
    }

    /// Build a schema for `frame`, keeping labels already known for columns
    /// that survive from `existing`. Column names in the frame are assumed to
    /// be slugs already (the frame layer never sees raw labels).
    #[must_use]
    pub fn from_frame(frame: &DataFrame, existing: Option<&Schema>) -> Self {
        let mut schema = Schema::new();
        for (name, values) in frame.iter_columns() {
            if name == PARENT_COLUMN {
                continue;
            }
            let label = existing
                .and_then(|prev| prev.get(name))
                .map_or_else(|| name.to_owned(), |col| col.label.clone());
            let simple_type = infer_simple_type(values);
            schema.insert(
                name,
                ColumnSchema {
                    label,
                    simple_type,
                    olap_type: simple_type.olap_type(),
                    cardinality: Some(distinct_count(values)),
                },
            );
        }
        schema
    }
}

fn distinct_count(values: &[Value]) -> u64 {
    let mut seen = BTreeSet::new();
    for value in values {
        if !value.is_missing() {
            seen.insert(value.to_text());
        }
    }
    seen.len() as u64
}

/// Convert labels into machine-safe, unique column slugs: non-alphanumerics
/// become underscores, everything lowercases, and collisions with reserved
/// words or earlier slugs grow trailing underscores.
#[must_use]
pub fn slugify_columns(labels: &[String], reserved_words: &[&str]) -> Vec<String> {
    let non_word = Regex::new(r"\W").expect("static pattern");
    let mut encoded: Vec<String> = Vec::with_capacity(labels.len());

    for label in labels {
        let mut slug = non_word.replace_all(label, "_").to_lowercase();
        while encoded.iter().any(|used| *used == slug)
            || reserved_words.contains(&slug.as_str())
        {
            slug.push('_');
        }
        encoded.push(slug);
    }
    encoded
}

/// Uniquify one candidate slug against a set of taken names.
#[must_use]
pub fn unique_slug(candidate: &str, taken: &BTreeSet<String>, reserved_words: &[&str]) -> String {
    let mut slug = candidate.to_owned();
    while taken.contains(&slug) || reserved_words.contains(&slug.as_str()) {
        slug.push('_');
    }
    slug
}

/// Split a comma-delimited group specifier into column slugs.
#[must_use]
pub fn split_groups(group_str: &str) -> Vec<String> {
    group_str
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Row-major view over one row of a frame.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    frame: &'a DataFrame,
    idx: usize,
}

impl<'a> Row<'a> {
    #[must_use]
    pub fn get(&self, slug: &str) -> Option<&'a Value> {
        self.frame.column(slug).and_then(|values| values.get(self.idx))
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.idx
    }
}

/// Ordered collection of equally-long value columns. Column order is
/// insertion order, which keeps group columns ahead of derived ones in
/// aggregated frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    columns: Vec<(String, Vec<Value>)>,
}

impl DataFrame {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a frame from keyed rows. Columns appear in first-seen order and
    /// rows missing a key are padded with `Null`.
    #[must_use]
    pub fn from_rows(rows: &[BTreeMap<String, Value>]) -> Self {
        let mut order: Vec<String> = Vec::new();
        for row in rows {
            for key in row.keys() {
                if !order.iter().any(|name| name == key) {
                    order.push(key.clone());
                }
            }
        }

        let mut frame = Self::new();
        for name in order {
            let values = rows
                .iter()
                .map(|row| row.get(&name).cloned().unwrap_or(Value::Null))
                .collect();
            frame.columns.push((name, values));
        }
        frame
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, |(_, values)| values.len())
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    #[must_use]
    pub fn column(&self, slug: &str) -> Option<&[Value]> {
        self.columns
            .iter()
            .find(|(name, _)| name == slug)
            .map(|(_, values)| values.as_slice())
    }

    #[must_use]
    pub fn has_column(&self, slug: &str) -> bool {
        self.column(slug).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter_columns(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.columns
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    #[must_use]
    pub fn row(&self, idx: usize) -> Row<'_> {
        Row { frame: self, idx }
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        (0..self.num_rows()).map(|idx| self.row(idx))
    }

    pub fn insert_column(
        &mut self,
        slug: impl Into<String>,
        values: Vec<Value>,
    ) -> Result<(), FrameError> {
        let slug = slug.into();
        if self.has_column(&slug) {
            return Err(FrameError::DuplicateColumn(slug));
        }
        if !self.columns.is_empty() && values.len() != self.num_rows() {
            return Err(FrameError::LengthMismatch {
                name: slug,
                got: values.len(),
                want: self.num_rows(),
            });
        }
        self.columns.push((slug, values));
        Ok(())
    }

    /// Insert or overwrite a column in place.
    pub fn set_column(
        &mut self,
        slug: impl Into<String>,
        values: Vec<Value>,
    ) -> Result<(), FrameError> {
        let slug = slug.into();
        if !self.columns.is_empty() && values.len() != self.num_rows() {
            return Err(FrameError::LengthMismatch {
                name: slug,
                got: values.len(),
                want: self.num_rows(),
            });
        }
        if let Some(entry) = self.columns.iter_mut().find(|(name, _)| *name == slug) {
            entry.1 = values;
        } else {
            self.columns.push((slug, values));
        }
        Ok(())
    }

    pub fn drop_column(&mut self, slug: &str) -> Result<(), FrameError> {
        let before = self.columns.len();
        self.columns.retain(|(name, _)| name != slug);
        if self.columns.len() == before {
            return Err(FrameError::UnknownColumn(slug.to_owned()));
        }
        Ok(())
    }

    /// Concatenate frames row-wise. The column set is the union in first-seen
    /// order; absent cells are padded with `Null`.
    #[must_use]
    pub fn concat(frames: &[&DataFrame]) -> DataFrame {
        let mut order: Vec<String> = Vec::new();
        for frame in frames {
            for name in frame.column_names() {
                if !order.iter().any(|seen| seen == name) {
                    order.push(name.to_owned());
                }
            }
        }

        let total_rows: usize = frames.iter().map(|frame| frame.num_rows()).sum();
        let mut out = DataFrame::new();
        for name in order {
            let mut values = Vec::with_capacity(total_rows);
            for frame in frames {
                match frame.column(&name) {
                    Some(column) => values.extend_from_slice(column),
                    None => values.extend(std::iter::repeat_n(Value::Null, frame.num_rows())),
                }
            }
            out.columns.push((name, values));
        }
        out
    }

    /// Tag every row with its originating dataset.
    pub fn add_parent_column(&mut self, parent_id: &DatasetId) {
        let tag = Value::Text(parent_id.0.clone());
        let values = vec![tag; self.num_rows()];
        // set_column cannot fail here: the length matches by construction.
        let _ = self.set_column(PARENT_COLUMN, values);
    }

    /// Drop all rows tagged with `parent_id`. Rows without a tag are kept.
    pub fn remove_parent_rows(&mut self, parent_id: &DatasetId) {
        let Some(tags) = self.column(PARENT_COLUMN) else {
            return;
        };
        let keep: Vec<bool> = tags
            .iter()
            .map(|tag| !matches!(tag, Value::Text(id) if *id == parent_id.0))
            .collect();
        self.retain_rows(&keep);
    }

    /// Frame without the hidden provenance column.
    #[must_use]
    pub fn without_parent_column(&self) -> DataFrame {
        let mut out = self.clone();
        if out.has_column(PARENT_COLUMN) {
            let _ = out.drop_column(PARENT_COLUMN);
        }
        out
    }

    fn retain_rows(&mut self, keep: &[bool]) {
        for (_, values) in &mut self.columns {
            let mut idx = 0;
            values.retain(|_| {
                let keep_row = keep.get(idx).copied().unwrap_or(true);
                idx += 1;
                keep_row
            });
        }
    }

    /// Rewrite text cells of datetime-typed columns into unix timestamps.
    /// Applied to freshly ingested update rows before evaluation.
    pub fn recognize_dates_from_schema(&mut self, schema: &Schema) {
        for (name, values) in &mut self.columns {
            if !schema.is_date(name) {
                continue;
            }
            for value in values.iter_mut() {
                if let Value::Text(text) = value
                    && let Some(unix) = parse_date_text(text)
                {
                    *value = Value::Datetime(unix);
                }
            }
        }
    }
}

/// Parse a date literal to unix seconds. Accepts RFC 3339 plus common
/// short date forms.
#[must_use]
pub fn parse_date_text(text: &str) -> Option<i64> {
    if let Ok(stamp) = DateTime::parse_from_rfc3339(text) {
        return Some(stamp.timestamp());
    }
    if let Ok(stamp) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(stamp.and_utc().timestamp());
    }
    for format in ["%Y-%m-%d", "%m-%d-%Y", "%Y/%m/%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(
                date.and_hms_opt(0, 0, 0)
                    .unwrap_or_default()
                    .and_utc()
                    .timestamp(),
            );
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetState {
    Pending,
    Ready,
    Failed,
}

/// Dataset metadata: everything about a table except its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    id: DatasetId,
    schema: Schema,
    /// Group-key string -> aggregated dataset holding one row per group.
    aggregated_datasets: BTreeMap<String, DatasetId>,
    /// Children formed by merging this dataset with others.
    merged_dataset_ids: Vec<DatasetId>,
    state: DatasetState,
    summary_cache: Option<serde_json::Value>,
    version: u64,
}

impl Dataset {
    #[must_use]
    pub fn new(id: DatasetId) -> Self {
        Self {
            id,
            schema: Schema::new(),
            aggregated_datasets: BTreeMap::new(),
            merged_dataset_ids: Vec::new(),
            state: DatasetState::Pending,
            summary_cache: None,
            version: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn schema_mut(&mut self) -> &mut Schema {
        &mut self.schema
    }

    pub fn set_schema(&mut self, schema: Schema) {
        self.schema = schema;
    }

    #[must_use]
    pub fn state(&self) -> DatasetState {
        self.state
    }

    pub fn set_state(&mut self, state: DatasetState) {
        self.state = state;
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == DatasetState::Ready
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    #[must_use]
    pub fn aggregated_datasets(&self) -> &BTreeMap<String, DatasetId> {
        &self.aggregated_datasets
    }

    #[must_use]
    pub fn aggregated_dataset(&self, group_str: &str) -> Option<&DatasetId> {
        self.aggregated_datasets.get(group_str)
    }

    pub fn link_aggregated(&mut self, group_str: impl Into<String>, id: DatasetId) {
        self.aggregated_datasets.insert(group_str.into(), id);
    }

    #[must_use]
    pub fn merged_dataset_ids(&self) -> &[DatasetId] {
        &self.merged_dataset_ids
    }

    pub fn link_merged(&mut self, child: DatasetId) {
        if !self.merged_dataset_ids.contains(&child) {
            self.merged_dataset_ids.push(child);
        }
    }

    #[must_use]
    pub fn summary_cache(&self) -> Option<&serde_json::Value> {
        self.summary_cache.as_ref()
    }

    pub fn set_summary_cache(&mut self, cache: serde_json::Value) {
        self.summary_cache = Some(cache);
    }

    /// Invalidate the cached summary blob after any structural change.
    pub fn clear_summary_stats(&mut self) {
        self.summary_cache = None;
    }
}
