#![forbid(unsafe_code)]

use std::collections::HashMap;

use rt_expr::{AggregationKind, EvalContext, EvalError, Expr};
use rt_frame::{DataFrame, FrameError, Schema};
use rt_types::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AggError {
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("group {0} not in dataset columns")]
    UnknownGroup(String),
    #[error("aggregation {0} cannot be incrementally reduced")]
    NotReducible(&'static str),
}

/// One aggregation to run against a parent frame.
#[derive(Debug, Clone, Copy)]
pub struct AggregationSpec<'a> {
    /// Slug of the column the result lands in.
    pub name: &'a str,
    pub kind: AggregationKind,
    /// Argument expressions, already parsed. Two for ratio and newest,
    /// otherwise one.
    pub expressions: &'a [Expr],
    /// Group column slugs; empty means a single whole-frame row.
    pub groups: &'a [String],
}

/// Slug of the hidden numerator column backing a ratio-style result.
#[must_use]
pub fn numerator_slug(name: &str) -> String {
    format!("{name}_numerator")
}

/// Slug of the hidden denominator column backing a ratio-style result.
#[must_use]
pub fn denominator_slug(name: &str) -> String {
    format!("{name}_denominator")
}

/// Ratio-style kinds keep numerator/denominator columns alongside the result
/// so updates can combine partial sums instead of rescanning the parent.
#[must_use]
pub fn has_helper_columns(kind: AggregationKind) -> bool {
    matches!(kind, AggregationKind::Mean | AggregationKind::Ratio)
}

/// Kinds whose result over old+new rows can be derived from the stored result
/// over old rows plus a fresh pass over only the new rows.
#[must_use]
pub fn is_reducible(kind: AggregationKind) -> bool {
    matches!(
        kind,
        AggregationKind::Sum | AggregationKind::Count | AggregationKind::Mean | AggregationKind::Ratio
    )
}

struct AggOutput {
    value: Value,
    numerator: Option<f64>,
    denominator: Option<f64>,
}

fn numeric(values: &[Value], idxs: &[usize]) -> Result<Vec<f64>, AggError> {
    idxs.iter()
        .map(|&idx| values[idx].to_f64().map_err(EvalError::from).map_err(AggError::from))
        .collect()
}

fn finite(values: Vec<f64>) -> Vec<f64> {
    values.into_iter().filter(|v| !v.is_nan()).collect()
}

fn nan_safe_div(numerator: f64, denominator: f64) -> f64 {
    let out = numerator / denominator;
    if out.is_infinite() { f64::NAN } else { out }
}

fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
}

/// Pearson correlation coefficient over paired samples. Constant inputs
/// yield NaN through the zero denominator.
fn pearson_r(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() < 2 {
        return f64::NAN;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut covariance = 0.0;
    let mut spread_x = 0.0;
    let mut spread_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        covariance += (x - mean_x) * (y - mean_y);
        spread_x += (x - mean_x).powi(2);
        spread_y += (y - mean_y).powi(2);
    }
    nan_safe_div(covariance, (spread_x * spread_y).sqrt())
}

fn compute(
    kind: AggregationKind,
    args: &[Vec<Value>],
    idxs: &[usize],
) -> Result<AggOutput, AggError> {
    let plain = |value: Value| AggOutput {
        value,
        numerator: None,
        denominator: None,
    };
    match kind {
        AggregationKind::Sum => {
            let total: f64 = finite(numeric(&args[0], idxs)?).iter().sum();
            Ok(plain(Value::Number(total)))
        }
        AggregationKind::Count => {
            // Bare count() evaluates a constant 1 per row, so every row is
            // truthy; count(expr) counts rows where the criterion holds.
            let count = idxs.iter().filter(|&&idx| args[0][idx].truthy()).count();
            Ok(plain(Value::Number(count as f64)))
        }
        AggregationKind::Mean => {
            // Denominator counts every row, missing values included.
            let numerator: f64 = finite(numeric(&args[0], idxs)?).iter().sum();
            let denominator = idxs.len() as f64;
            Ok(AggOutput {
                value: Value::Number(nan_safe_div(numerator, denominator)),
                numerator: Some(numerator),
                denominator: Some(denominator),
            })
        }
        AggregationKind::Ratio => {
            // Rows where either operand is missing contribute to neither sum.
            let mut numerator = 0.0;
            let mut denominator = 0.0;
            for &idx in idxs {
                let top = args[0][idx].to_f64().map_err(EvalError::from)?;
                let bottom = args[1][idx].to_f64().map_err(EvalError::from)?;
                if top.is_nan() || bottom.is_nan() {
                    continue;
                }
                numerator += top;
                denominator += bottom;
            }
            Ok(AggOutput {
                value: Value::Number(nan_safe_div(numerator, denominator)),
                numerator: Some(numerator),
                denominator: Some(denominator),
            })
        }
        AggregationKind::Max => {
            let values = finite(numeric(&args[0], idxs)?);
            let out = values.into_iter().fold(f64::NAN, f64::max);
            Ok(plain(Value::Number(out)))
        }
        AggregationKind::Min => {
            let values = finite(numeric(&args[0], idxs)?);
            let out = values.into_iter().fold(f64::NAN, f64::min);
            Ok(plain(Value::Number(out)))
        }
        AggregationKind::Median => {
            let mut values = finite(numeric(&args[0], idxs)?);
            if values.is_empty() {
                return Ok(plain(Value::Number(f64::NAN)));
            }
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = values.len() / 2;
            let out = if values.len() % 2 == 1 {
                values[mid]
            } else {
                (values[mid - 1] + values[mid]) / 2.0
            };
            Ok(plain(Value::Number(out)))
        }
        AggregationKind::Pearson => {
            // Rows where either operand is missing are dropped pairwise.
            let mut xs = Vec::with_capacity(idxs.len());
            let mut ys = Vec::with_capacity(idxs.len());
            for &idx in idxs {
                let x = args[0][idx].to_f64().map_err(EvalError::from)?;
                let y = args[1][idx].to_f64().map_err(EvalError::from)?;
                if x.is_nan() || y.is_nan() {
                    continue;
                }
                xs.push(x);
                ys.push(y);
            }
            Ok(plain(Value::Number(pearson_r(&xs, &ys))))
        }
        AggregationKind::Std => {
            let values = finite(numeric(&args[0], idxs)?);
            Ok(plain(Value::Number(sample_variance(&values).sqrt())))
        }
        AggregationKind::Var => {
            let values = finite(numeric(&args[0], idxs)?);
            Ok(plain(Value::Number(sample_variance(&values))))
        }
        AggregationKind::Argmax => Ok(plain(match argmax_index(&args[0], idxs)? {
            Some(idx) => Value::Number(idx as f64),
            None => Value::Number(f64::NAN),
        })),
        AggregationKind::Newest => Ok(plain(match argmax_index(&args[0], idxs)? {
            Some(idx) => args[1][idx].clone(),
            None => Value::Null,
        })),
    }
}

/// Global row index holding the maximal non-missing value, if any.
fn argmax_index(values: &[Value], idxs: &[usize]) -> Result<Option<usize>, AggError> {
    let mut best: Option<(usize, f64)> = None;
    for &idx in idxs {
        let v = values[idx].to_f64().map_err(EvalError::from)?;
        if v.is_nan() {
            continue;
        }
        if best.is_none_or(|(_, max)| v > max) {
            best = Some((idx, v));
        }
    }
    Ok(best.map(|(idx, _)| idx))
}

fn group_key(frame: &DataFrame, groups: &[String], row: usize) -> Vec<String> {
    groups
        .iter()
        .map(|group| {
            frame
                .column(group)
                .and_then(|values| values.get(row))
                .map_or_else(String::new, Value::to_text)
        })
        .collect()
}

/// Run one aggregation over `frame`, producing a fragment frame: for scalar
/// aggregations one row with the result column, for grouped aggregations the
/// group columns (in first-seen row order) followed by the result column.
/// Ratio-style kinds also carry their numerator/denominator columns.
pub fn aggregate(
    spec: &AggregationSpec<'_>,
    frame: &DataFrame,
    schema: &Schema,
) -> Result<DataFrame, AggError> {
    for group in spec.groups {
        if !frame.has_column(group) {
            return Err(AggError::UnknownGroup(group.clone()));
        }
    }

    let context = EvalContext::with_frame(schema, frame);
    let mut args: Vec<Vec<Value>> = Vec::with_capacity(spec.expressions.len());
    for expr in spec.expressions {
        let mut column = Vec::with_capacity(frame.num_rows());
        for row in frame.rows() {
            column.push(expr.evaluate(&row, &context)?);
        }
        args.push(column);
    }

    if spec.groups.is_empty() {
        let idxs: Vec<usize> = (0..frame.num_rows()).collect();
        let out = compute(spec.kind, &args, &idxs)?;
        let mut fragment = DataFrame::new();
        fragment.insert_column(spec.name, vec![out.value])?;
        if let (Some(numerator), Some(denominator)) = (out.numerator, out.denominator) {
            fragment.insert_column(numerator_slug(spec.name), vec![Value::Number(numerator)])?;
            fragment.insert_column(denominator_slug(spec.name), vec![Value::Number(denominator)])?;
        }
        return Ok(fragment);
    }

    // Group rows by stringified key, keeping first-seen order and one
    // representative value per group column.
    let mut ordering: Vec<Vec<String>> = Vec::new();
    let mut representatives: Vec<Vec<Value>> = Vec::new();
    let mut indices: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
    for row in 0..frame.num_rows() {
        let key = group_key(frame, spec.groups, row);
        if !indices.contains_key(&key) {
            ordering.push(key.clone());
            representatives.push(
                spec.groups
                    .iter()
                    .map(|group| {
                        frame
                            .column(group)
                            .and_then(|values| values.get(row))
                            .cloned()
                            .unwrap_or(Value::Null)
                    })
                    .collect(),
            );
        }
        indices.entry(key).or_default().push(row);
    }

    let mut results = Vec::with_capacity(ordering.len());
    let mut numerators = Vec::new();
    let mut denominators = Vec::new();
    for key in &ordering {
        let idxs = indices.get(key).map(Vec::as_slice).unwrap_or_default();
        let out = compute(spec.kind, &args, idxs)?;
        results.push(out.value);
        if let (Some(numerator), Some(denominator)) = (out.numerator, out.denominator) {
            numerators.push(Value::Number(numerator));
            denominators.push(Value::Number(denominator));
        }
    }

    let mut fragment = DataFrame::new();
    for (pos, group) in spec.groups.iter().enumerate() {
        let values = representatives.iter().map(|rep| rep[pos].clone()).collect();
        fragment.insert_column(group.clone(), values)?;
    }
    fragment.insert_column(spec.name, results)?;
    if !numerators.is_empty() {
        fragment.insert_column(numerator_slug(spec.name), numerators)?;
        fragment.insert_column(denominator_slug(spec.name), denominators)?;
    }
    Ok(fragment)
}

fn frame_keys(frame: &DataFrame, groups: &[String]) -> Vec<Vec<String>> {
    (0..frame.num_rows())
        .map(|row| group_key(frame, groups, row))
        .collect()
}

/// Outer-join a freshly computed fragment into an existing aggregated frame
/// on the group columns. Matched groups take the fragment's values for the
/// fragment's columns; groups only in the fragment are appended with `Null`
/// in every other column.
pub fn join_aggregated(
    existing: Option<&DataFrame>,
    fragment: &DataFrame,
    groups: &[String],
) -> Result<DataFrame, AggError> {
    let Some(existing) = existing.filter(|frame| !frame.is_empty()) else {
        return Ok(fragment.clone());
    };

    if groups.is_empty() {
        let mut out = existing.clone();
        for (name, values) in fragment.iter_columns() {
            out.set_column(name, values.to_vec())?;
        }
        return Ok(out);
    }

    let fragment_keys = frame_keys(fragment, groups);
    let mut by_key: HashMap<&Vec<String>, usize> = HashMap::new();
    for (row, key) in fragment_keys.iter().enumerate() {
        by_key.insert(key, row);
    }
    let existing_keys = frame_keys(existing, groups);
    let appended: Vec<usize> = fragment_keys
        .iter()
        .enumerate()
        .filter(|(_, key)| !existing_keys.contains(key))
        .map(|(row, _)| row)
        .collect();

    let mut names: Vec<String> = existing.column_names().map(str::to_owned).collect();
    for name in fragment.column_names() {
        if !names.iter().any(|seen| seen == name) {
            names.push(name.to_owned());
        }
    }

    let mut out = DataFrame::new();
    for name in &names {
        let existing_col = existing.column(name);
        let fragment_col = fragment.column(name);
        let is_group = groups.contains(name);
        let mut values = Vec::with_capacity(existing.num_rows() + appended.len());
        for (row, key) in existing_keys.iter().enumerate() {
            let matched = by_key.get(key).copied();
            let value = if is_group {
                existing_col.and_then(|col| col.get(row)).cloned()
            } else if let (Some(col), Some(frag_row)) = (fragment_col, matched) {
                col.get(frag_row).cloned()
            } else {
                existing_col.and_then(|col| col.get(row)).cloned()
            };
            values.push(value.unwrap_or(Value::Null));
        }
        for &frag_row in &appended {
            let value = fragment_col.and_then(|col| col.get(frag_row)).cloned();
            values.push(value.unwrap_or(Value::Null));
        }
        out.insert_column(name.clone(), values)?;
    }
    Ok(out)
}

fn cell(frame: &DataFrame, name: &str, row: usize) -> f64 {
    frame
        .column(name)
        .and_then(|values| values.get(row))
        .and_then(|value| value.to_f64().ok())
        .unwrap_or(f64::NAN)
}

/// Fold a fragment computed over only the new rows into an existing
/// aggregated frame, without rescanning the parent. Sums and counts add;
/// ratio-style kinds add their hidden numerator and denominator columns and
/// re-derive the quotient.
pub fn reduce_aggregated(
    existing: &DataFrame,
    fragment: &DataFrame,
    groups: &[String],
    name: &str,
    kind: AggregationKind,
) -> Result<DataFrame, AggError> {
    if !is_reducible(kind) {
        return Err(AggError::NotReducible(kind.formula_name()));
    }

    let combined = join_with(existing, fragment, groups, name, |old, new| match kind {
        AggregationKind::Sum | AggregationKind::Count => {
            vec![(name.to_owned(), Value::Number(old[0] + new[0]))]
        }
        _ => {
            let numerator = old[1] + new[1];
            let denominator = old[2] + new[2];
            vec![
                (name.to_owned(), Value::Number(nan_safe_div(numerator, denominator))),
                (numerator_slug(name), Value::Number(numerator)),
                (denominator_slug(name), Value::Number(denominator)),
            ]
        }
    })?;
    Ok(combined)
}

/// Join `fragment` into `existing` on the group key, combining the named
/// column (and its helpers) for matched groups and appending unmatched
/// fragment groups as-is.
fn join_with(
    existing: &DataFrame,
    fragment: &DataFrame,
    groups: &[String],
    name: &str,
    combine: impl Fn(&[f64; 3], &[f64; 3]) -> Vec<(String, Value)>,
) -> Result<DataFrame, AggError> {
    let tracked = [name.to_owned(), numerator_slug(name), denominator_slug(name)];
    let read = |frame: &DataFrame, row: usize| -> [f64; 3] {
        [
            cell(frame, &tracked[0], row),
            cell(frame, &tracked[1], row),
            cell(frame, &tracked[2], row),
        ]
    };

    if groups.is_empty() {
        let combined = combine(&read(existing, 0), &read(fragment, 0));
        let mut out = existing.clone();
        for (slug, value) in combined {
            if out.has_column(&slug) {
                out.set_column(slug, vec![value])?;
            }
        }
        return Ok(out);
    }

    let fragment_keys = frame_keys(fragment, groups);
    let mut by_key: HashMap<&Vec<String>, usize> = HashMap::new();
    for (row, key) in fragment_keys.iter().enumerate() {
        by_key.insert(key, row);
    }
    let existing_keys = frame_keys(existing, groups);
    let appended: Vec<usize> = fragment_keys
        .iter()
        .enumerate()
        .filter(|(_, key)| !existing_keys.contains(key))
        .map(|(row, _)| row)
        .collect();

    // Combined values for matched existing rows, keyed by column slug.
    let mut updates: HashMap<String, Vec<(usize, Value)>> = HashMap::new();
    for (row, key) in existing_keys.iter().enumerate() {
        let Some(&frag_row) = by_key.get(key) else {
            continue;
        };
        // A group appended by a sibling aggregation's reduce has no value in
        // this column yet; fold from the additive identity, not from NaN.
        let old = if existing
            .column(name)
            .and_then(|col| col.get(row))
            .is_none_or(Value::is_missing)
        {
            [0.0; 3]
        } else {
            read(existing, row)
        };
        for (slug, value) in combine(&old, &read(fragment, frag_row)) {
            updates.entry(slug).or_default().push((row, value));
        }
    }

    let mut out = DataFrame::new();
    for (col_name, values) in existing.iter_columns() {
        let mut values: Vec<Value> = values.to_vec();
        if let Some(changes) = updates.get(col_name) {
            for (row, value) in changes {
                values[*row] = value.clone();
            }
        }
        let fragment_col = fragment.column(col_name);
        for &frag_row in &appended {
            let from_fragment = groups.contains(&col_name.to_owned())
                || tracked.iter().any(|slug| slug == col_name);
            let value = if from_fragment {
                fragment_col.and_then(|col| col.get(frag_row)).cloned()
            } else {
                None
            };
            values.push(value.unwrap_or(Value::Null));
        }
        out.insert_column(col_name, values)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use rt_expr::{AggregationKind, parse_formula};
    use rt_frame::{DataFrame, Schema};
    use rt_types::Value;

    use super::{
        AggregationSpec, aggregate, denominator_slug, has_helper_columns, is_reducible,
        join_aggregated, numerator_slug, reduce_aggregated,
    };

    fn frame_of(pairs: Vec<(&str, Vec<Value>)>) -> (DataFrame, Schema) {
        let mut frame = DataFrame::new();
        for (name, values) in pairs {
            frame.insert_column(name, values).expect("column fits");
        }
        let schema = Schema::from_frame(&frame, None);
        (frame, schema)
    }

    fn run(formula: &str, name: &str, groups: &[String], frame: &DataFrame, schema: &Schema) -> DataFrame {
        let parsed = parse_formula(formula).expect("formula parses");
        let kind = parsed.aggregation.expect("aggregation formula");
        let spec = AggregationSpec {
            name,
            kind,
            expressions: &parsed.expressions,
            groups,
        };
        aggregate(&spec, frame, schema).expect("aggregates")
    }

    fn number(frame: &DataFrame, name: &str, row: usize) -> f64 {
        match frame.column(name).expect("column")[row] {
            Value::Number(v) => v,
            ref other => panic!("expected number, got {other:?}"),
        }
    }

    #[test]
    fn scalar_sum_skips_missing_values() {
        let (frame, schema) = frame_of(vec![(
            "amount",
            vec![Value::Number(1.0), Value::Number(f64::NAN), Value::Number(4.0)],
        )]);
        let out = run("sum(amount)", "total", &[], &frame, &schema);
        assert_eq!(out.num_rows(), 1);
        assert_eq!(number(&out, "total", 0), 5.0);
    }

    #[test]
    fn scalar_mean_denominator_counts_every_row() {
        let (frame, schema) = frame_of(vec![(
            "amount",
            vec![Value::Number(3.0), Value::Number(f64::NAN), Value::Number(5.0)],
        )]);
        let out = run("mean(amount)", "avg", &[], &frame, &schema);
        assert_eq!(number(&out, "avg", 0), 8.0 / 3.0);
        assert_eq!(number(&out, &numerator_slug("avg"), 0), 8.0);
        assert_eq!(number(&out, &denominator_slug("avg"), 0), 3.0);
    }

    #[test]
    fn count_with_and_without_criteria() {
        let (frame, schema) = frame_of(vec![(
            "amount",
            vec![Value::Number(1.0), Value::Null, Value::Number(3.0)],
        )]);
        let out = run("count()", "n", &[], &frame, &schema);
        assert_eq!(number(&out, "n", 0), 3.0);
        let out = run("count(amount)", "n", &[], &frame, &schema);
        assert_eq!(number(&out, "n", 0), 2.0);
        let out = run("count(amount > 2)", "n", &[], &frame, &schema);
        assert_eq!(number(&out, "n", 0), 1.0);
    }

    #[test]
    fn ratio_skips_rows_where_either_side_is_missing() {
        let (frame, schema) = frame_of(vec![
            (
                "won",
                vec![Value::Number(2.0), Value::Number(f64::NAN), Value::Number(1.0)],
            ),
            (
                "played",
                vec![Value::Number(4.0), Value::Number(10.0), Value::Number(1.0)],
            ),
        ]);
        let out = run("ratio(won, played)", "win_rate", &[], &frame, &schema);
        assert_eq!(number(&out, "win_rate", 0), 3.0 / 5.0);
        assert_eq!(number(&out, &numerator_slug("win_rate"), 0), 3.0);
        assert_eq!(number(&out, &denominator_slug("win_rate"), 0), 5.0);
    }

    #[test]
    fn ratio_with_zero_denominator_is_nan() {
        let (frame, schema) = frame_of(vec![
            ("won", vec![Value::Number(2.0)]),
            ("played", vec![Value::Number(0.0)]),
        ]);
        let out = run("ratio(won, played)", "win_rate", &[], &frame, &schema);
        assert!(
            out.column("win_rate").expect("column")[0].semantic_eq(&Value::Number(f64::NAN))
        );
    }

    #[test]
    fn grouped_sum_preserves_first_seen_order() {
        let (frame, schema) = frame_of(vec![
            (
                "food_type",
                vec![
                    Value::Text("lunch".to_owned()),
                    Value::Text("dinner".to_owned()),
                    Value::Text("lunch".to_owned()),
                ],
            ),
            (
                "amount",
                vec![Value::Number(1.0), Value::Number(2.0), Value::Number(4.0)],
            ),
        ]);
        let groups = vec!["food_type".to_owned()];
        let out = run("sum(amount)", "total", &groups, &frame, &schema);
        assert_eq!(out.num_rows(), 2);
        assert_eq!(
            out.column("food_type").expect("group column"),
            &[Value::Text("lunch".to_owned()), Value::Text("dinner".to_owned())]
        );
        assert_eq!(number(&out, "total", 0), 5.0);
        assert_eq!(number(&out, "total", 1), 2.0);
    }

    #[test]
    fn multi_column_groups_key_on_every_column() {
        let (frame, schema) = frame_of(vec![
            (
                "a",
                vec![Value::Text("x".to_owned()), Value::Text("x".to_owned())],
            ),
            (
                "b",
                vec![Value::Text("1".to_owned()), Value::Text("2".to_owned())],
            ),
            ("amount", vec![Value::Number(1.0), Value::Number(2.0)]),
        ]);
        let groups = vec!["a".to_owned(), "b".to_owned()];
        let out = run("sum(amount)", "total", &groups, &frame, &schema);
        assert_eq!(out.num_rows(), 2);
    }

    #[test]
    fn median_handles_even_and_odd_counts() {
        let (frame, schema) = frame_of(vec![(
            "amount",
            vec![Value::Number(3.0), Value::Number(1.0), Value::Number(2.0)],
        )]);
        let out = run("median(amount)", "mid", &[], &frame, &schema);
        assert_eq!(number(&out, "mid", 0), 2.0);

        let (frame, schema) = frame_of(vec![(
            "amount",
            vec![Value::Number(4.0), Value::Number(1.0)],
        )]);
        let out = run("median(amount)", "mid", &[], &frame, &schema);
        assert_eq!(number(&out, "mid", 0), 2.5);
    }

    #[test]
    fn std_and_var_are_sample_statistics() {
        let (frame, schema) = frame_of(vec![(
            "amount",
            vec![Value::Number(2.0), Value::Number(4.0), Value::Number(6.0)],
        )]);
        let out = run("var(amount)", "spread", &[], &frame, &schema);
        assert_eq!(number(&out, "spread", 0), 4.0);
        let out = run("std(amount)", "spread", &[], &frame, &schema);
        assert_eq!(number(&out, "spread", 0), 2.0);

        let (frame, schema) = frame_of(vec![("amount", vec![Value::Number(2.0)])]);
        let out = run("var(amount)", "spread", &[], &frame, &schema);
        assert!(number(&out, "spread", 0).is_nan());
    }

    #[test]
    fn pearson_measures_linear_correlation() {
        let (frame, schema) = frame_of(vec![
            (
                "x",
                vec![
                    Value::Number(1.0),
                    Value::Number(2.0),
                    Value::Number(3.0),
                    Value::Number(f64::NAN),
                ],
            ),
            (
                "y",
                vec![
                    Value::Number(2.0),
                    Value::Number(4.0),
                    Value::Number(6.0),
                    Value::Number(100.0),
                ],
            ),
        ]);
        let out = run("pearson(x, y)", "corr", &[], &frame, &schema);
        assert_eq!(number(&out, "corr", 0), 1.0);

        let (frame, schema) = frame_of(vec![
            (
                "x",
                vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)],
            ),
            (
                "y",
                vec![Value::Number(6.0), Value::Number(4.0), Value::Number(2.0)],
            ),
        ]);
        let out = run("pearson(x, y)", "corr", &[], &frame, &schema);
        assert_eq!(number(&out, "corr", 0), -1.0);

        let (frame, schema) = frame_of(vec![
            ("x", vec![Value::Number(1.0)]),
            ("y", vec![Value::Number(2.0)]),
        ]);
        let out = run("pearson(x, y)", "corr", &[], &frame, &schema);
        assert!(number(&out, "corr", 0).is_nan());
    }

    #[test]
    fn newest_returns_value_at_latest_date() {
        let (frame, schema) = frame_of(vec![
            (
                "submit_date",
                vec![Value::Datetime(100), Value::Datetime(300), Value::Datetime(200)],
            ),
            (
                "rating",
                vec![
                    Value::Text("ok".to_owned()),
                    Value::Text("great".to_owned()),
                    Value::Text("bad".to_owned()),
                ],
            ),
        ]);
        let out = run("newest(submit_date, rating)", "latest", &[], &frame, &schema);
        assert_eq!(
            out.column("latest").expect("column"),
            &[Value::Text("great".to_owned())]
        );
    }

    #[test]
    fn newest_grouped_resolves_per_group() {
        let (frame, schema) = frame_of(vec![
            (
                "food_type",
                vec![
                    Value::Text("lunch".to_owned()),
                    Value::Text("dinner".to_owned()),
                    Value::Text("lunch".to_owned()),
                ],
            ),
            (
                "submit_date",
                vec![Value::Datetime(100), Value::Datetime(300), Value::Datetime(200)],
            ),
            (
                "rating",
                vec![
                    Value::Text("ok".to_owned()),
                    Value::Text("great".to_owned()),
                    Value::Text("bad".to_owned()),
                ],
            ),
        ]);
        let groups = vec!["food_type".to_owned()];
        let out = run("newest(submit_date, rating)", "latest", &groups, &frame, &schema);
        assert_eq!(out.num_rows(), 2);
        // Each group resolves its own latest date: lunch at t=200, dinner at
        // t=300.
        assert_eq!(
            out.column("latest").expect("column"),
            &[Value::Text("bad".to_owned()), Value::Text("great".to_owned())]
        );
    }

    #[test]
    fn argmax_returns_row_index_of_maximum() {
        let (frame, schema) = frame_of(vec![(
            "amount",
            vec![Value::Number(2.0), Value::Number(9.0), Value::Number(4.0)],
        )]);
        let out = run("argmax(amount)", "peak", &[], &frame, &schema);
        assert_eq!(number(&out, "peak", 0), 1.0);
    }

    #[test]
    fn max_of_empty_frame_is_nan() {
        let (frame, schema) = frame_of(vec![("amount", vec![])]);
        let out = run("max(amount)", "peak", &[], &frame, &schema);
        assert!(number(&out, "peak", 0).is_nan());
    }

    #[test]
    fn unknown_group_is_rejected() {
        let (frame, schema) = frame_of(vec![("amount", vec![Value::Number(1.0)])]);
        let parsed = parse_formula("sum(amount)").expect("parses");
        let groups = vec!["missing".to_owned()];
        let spec = AggregationSpec {
            name: "total",
            kind: parsed.aggregation.expect("aggregation"),
            expressions: &parsed.expressions,
            groups: &groups,
        };
        assert!(aggregate(&spec, &frame, &schema).is_err());
    }

    #[test]
    fn join_appends_new_groups_and_new_columns() {
        let (existing, _) = frame_of(vec![
            (
                "food_type",
                vec![Value::Text("lunch".to_owned()), Value::Text("dinner".to_owned())],
            ),
            ("total", vec![Value::Number(5.0), Value::Number(2.0)]),
        ]);
        let (fragment, _) = frame_of(vec![
            (
                "food_type",
                vec![Value::Text("dinner".to_owned()), Value::Text("deserts".to_owned())],
            ),
            ("peak", vec![Value::Number(7.0), Value::Number(3.0)]),
        ]);
        let groups = vec!["food_type".to_owned()];
        let out = join_aggregated(Some(&existing), &fragment, &groups).expect("joins");
        assert_eq!(out.num_rows(), 3);
        assert_eq!(
            out.column("food_type").expect("groups"),
            &[
                Value::Text("lunch".to_owned()),
                Value::Text("dinner".to_owned()),
                Value::Text("deserts".to_owned())
            ]
        );
        assert!(out.column("peak").expect("peak")[0] == Value::Null);
        assert_eq!(number(&out, "peak", 1), 7.0);
        assert!(out.column("total").expect("total")[2] == Value::Null);
    }

    #[test]
    fn join_into_empty_returns_fragment() {
        let (fragment, _) = frame_of(vec![("total", vec![Value::Number(5.0)])]);
        let out = join_aggregated(None, &fragment, &[]).expect("joins");
        assert_eq!(out, fragment);
    }

    #[test]
    fn reduce_sum_matches_full_recompute() {
        let (old_rows, schema) = frame_of(vec![
            (
                "food_type",
                vec![Value::Text("lunch".to_owned()), Value::Text("dinner".to_owned())],
            ),
            ("amount", vec![Value::Number(1.0), Value::Number(2.0)]),
        ]);
        let (new_rows, new_schema) = frame_of(vec![
            (
                "food_type",
                vec![Value::Text("lunch".to_owned()), Value::Text("deserts".to_owned())],
            ),
            ("amount", vec![Value::Number(4.0), Value::Number(8.0)]),
        ]);
        let groups = vec!["food_type".to_owned()];
        let existing = run("sum(amount)", "total", &groups, &old_rows, &schema);
        let fragment = run("sum(amount)", "total", &groups, &new_rows, &new_schema);

        let reduced = reduce_aggregated(&existing, &fragment, &groups, "total", AggregationKind::Sum)
            .expect("reduces");
        assert_eq!(reduced.num_rows(), 3);
        assert_eq!(number(&reduced, "total", 0), 5.0);
        assert_eq!(number(&reduced, "total", 1), 2.0);
        assert_eq!(number(&reduced, "total", 2), 8.0);
    }

    #[test]
    fn reduce_mean_combines_hidden_sums() {
        let (old_rows, schema) = frame_of(vec![(
            "amount",
            vec![Value::Number(2.0), Value::Number(4.0)],
        )]);
        let (new_rows, new_schema) = frame_of(vec![("amount", vec![Value::Number(9.0)])]);
        let existing = run("mean(amount)", "avg", &[], &old_rows, &schema);
        let fragment = run("mean(amount)", "avg", &[], &new_rows, &new_schema);

        let reduced = reduce_aggregated(&existing, &fragment, &[], "avg", AggregationKind::Mean)
            .expect("reduces");
        assert_eq!(number(&reduced, "avg", 0), 5.0);
        assert_eq!(number(&reduced, &numerator_slug("avg"), 0), 15.0);
        assert_eq!(number(&reduced, &denominator_slug("avg"), 0), 3.0);
    }

    #[test]
    fn reduce_treats_sibling_appended_groups_as_fresh() {
        // A sibling aggregation's reduce appended the deserts row before this
        // column had a value there; folding starts from the fragment alone.
        let (existing, _) = frame_of(vec![
            (
                "food_type",
                vec![Value::Text("lunch".to_owned()), Value::Text("deserts".to_owned())],
            ),
            ("n", vec![Value::Number(2.0), Value::Null]),
        ]);
        let (fragment, _) = frame_of(vec![
            ("food_type", vec![Value::Text("deserts".to_owned())]),
            ("n", vec![Value::Number(1.0)]),
        ]);
        let groups = vec!["food_type".to_owned()];
        let reduced = reduce_aggregated(&existing, &fragment, &groups, "n", AggregationKind::Count)
            .expect("reduces");
        assert_eq!(number(&reduced, "n", 0), 2.0);
        assert_eq!(number(&reduced, "n", 1), 1.0);
    }

    #[test]
    fn order_statistics_are_not_reducible() {
        assert!(!is_reducible(AggregationKind::Median));
        assert!(!is_reducible(AggregationKind::Max));
        assert!(!is_reducible(AggregationKind::Pearson));
        assert!(is_reducible(AggregationKind::Ratio));
        assert!(has_helper_columns(AggregationKind::Mean));
        assert!(has_helper_columns(AggregationKind::Ratio));
        assert!(!has_helper_columns(AggregationKind::Sum));
        let (existing, _) = frame_of(vec![("mid", vec![Value::Number(1.0)])]);
        assert!(
            reduce_aggregated(&existing, &existing, &[], "mid", AggregationKind::Median).is_err()
        );
    }
}
