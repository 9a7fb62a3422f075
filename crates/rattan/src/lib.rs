#![forbid(unsafe_code)]

//! Formula-defined calculated columns and aggregations over tabular
//! datasets.
//!
//! A formula like `amount + 1` becomes a new column; `sum(amount)` grouped
//! by a dimension becomes a row-per-group aggregated dataset. The engine
//! keeps both consistent as rows are appended and as datasets are merged.
//!
//! ```
//! use rattan::{DataFrame, DatasetStore, TaskQueue, Value, create_calculation, run_until_idle};
//!
//! let mut store = DatasetStore::new();
//! let mut frame = DataFrame::new();
//! frame.insert_column("amount", vec![Value::Number(9.0), Value::Number(2.0)])?;
//! let id = store.create_dataset(frame)?;
//!
//! let mut queue = TaskQueue::new();
//! create_calculation(&mut store, &mut queue, &id, "amount + 1", "Plus", "")?;
//! run_until_idle(&mut store, &mut queue)?;
//!
//! let plus = store.frame(&id)?.column("plus").expect("column installed");
//! assert_eq!(plus, &[Value::Number(10.0), Value::Number(3.0)]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub use rt_agg::{
    AggError, AggregationSpec, aggregate, denominator_slug, has_helper_columns, is_reducible,
    join_aggregated, numerator_slug, reduce_aggregated,
};
pub use rt_engine::{
    CalcRef, Calculation, CalculationRequest, CalculationState, DatasetStore, EngineError, Task,
    TaskQueue, calculate_updates, create_calculation, create_calculations_from_list,
    create_merged_dataset, delete_calculation, dependent_columns, link_merged_dataset,
    run_until_idle, submit_updates, validate,
};
pub use rt_expr::{
    AggregationKind, EvalContext, EvalError, Expr, ParseError, ParsedFormula, parse_formula,
    reserved_words,
};
pub use rt_frame::{
    ColumnSchema, DataFrame, Dataset, DatasetId, DatasetState, FrameError, PARENT_COLUMN, Row,
    Schema, parse_date_text, slugify_columns, split_groups, unique_slug,
};
pub use rt_types::{OlapType, SimpleType, TypeError, Value, infer_simple_type};
