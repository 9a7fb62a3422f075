#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage type of a column, as surfaced to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimpleType {
    String,
    Integer,
    Float,
    Boolean,
    Datetime,
}

/// OLAP role of a column: dimensions are groupable, measures are aggregable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OlapType {
    Dimension,
    Measure,
}

impl SimpleType {
    #[must_use]
    pub fn olap_type(self) -> OlapType {
        match self {
            Self::String | Self::Boolean => OlapType::Dimension,
            Self::Integer | Self::Float | Self::Datetime => OlapType::Measure,
        }
    }
}

/// A single cell of a dataset row. Datetimes are stored as unix seconds so
/// formula arithmetic can treat them as numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Datetime(i64),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("value {value:?} is not numeric")]
    NonNumericText { value: String },
}

impl Value {
    #[must_use]
    pub fn simple_type(&self) -> Option<SimpleType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(SimpleType::Boolean),
            Self::Number(v) => Some(if v.is_finite() && v.fract() == 0.0 {
                SimpleType::Integer
            } else {
                SimpleType::Float
            }),
            Self::Text(_) => Some(SimpleType::String),
            Self::Datetime(_) => Some(SimpleType::Datetime),
        }
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Number(v) => v.is_nan(),
            _ => false,
        }
    }

    /// Numeric view of the value. `Null` coerces to NaN so missing cells
    /// flow through arithmetic; text only converts when it parses as a
    /// number.
    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Null => Ok(f64::NAN),
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Number(v) => Ok(*v),
            Self::Datetime(v) => Ok(*v as f64),
            Self::Text(v) => v.parse::<f64>().map_err(|_| TypeError::NonNumericText {
                value: v.clone(),
            }),
        }
    }

    /// Python-style truthiness. NaN is truthy (it is a non-zero float), the
    /// empty string and `Null` are falsy.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(v) => *v,
            Self::Number(v) => *v != 0.0,
            Self::Text(v) => !v.is_empty(),
            Self::Datetime(v) => *v != 0,
        }
    }

    /// Stringification used by `in [..]` membership. Integral floats keep one
    /// decimal place, so `9.0` renders as `"9.0"`.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(v) => v.to_string(),
            Self::Number(v) => {
                if v.is_finite() && v.fract() == 0.0 {
                    format!("{v:.1}")
                } else {
                    format!("{v}")
                }
            }
            Self::Text(v) => v.clone(),
            Self::Datetime(v) => v.to_string(),
        }
    }

    /// Equality that treats NaN as equal to NaN, for asserting on results.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => (a.is_nan() && b.is_nan()) || (a == b),
            _ => self == other,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Promote the per-value types of a column to a single column type: any
/// text wins, datetime wins over numbers, integers widen to float.
#[must_use]
pub fn infer_simple_type(values: &[Value]) -> SimpleType {
    let mut current: Option<SimpleType> = None;
    for value in values {
        let Some(vtype) = value.simple_type() else {
            continue;
        };
        current = Some(match (current, vtype) {
            (None, v) => v,
            (Some(prev), v) if prev == v => prev,
            (Some(SimpleType::Integer), SimpleType::Float)
            | (Some(SimpleType::Float), SimpleType::Integer) => SimpleType::Float,
            // Any datetime value marks the whole column as datetime.
            (Some(SimpleType::Datetime), _) | (_, SimpleType::Datetime) => SimpleType::Datetime,
            _ => SimpleType::String,
        });
    }
    current.unwrap_or(SimpleType::String)
}

#[cfg(test)]
mod tests {
    use super::{OlapType, SimpleType, Value, infer_simple_type};

    #[test]
    fn nan_is_truthy_and_null_is_not() {
        assert!(Value::Number(f64::NAN).truthy());
        assert!(!Value::Null.truthy());
        assert!(!Value::Number(0.0).truthy());
        assert!(!Value::Text(String::new()).truthy());
        assert!(Value::Text("x".to_owned()).truthy());
    }

    #[test]
    fn integral_floats_stringify_with_one_decimal() {
        assert_eq!(Value::Number(9.0).to_text(), "9.0");
        assert_eq!(Value::Number(9.5).to_text(), "9.5");
        assert_eq!(Value::Text("low_risk".to_owned()).to_text(), "low_risk");
    }

    #[test]
    fn numeric_coercion_follows_row_model() {
        assert!(Value::Null.to_f64().expect("null coerces").is_nan());
        assert_eq!(Value::Bool(true).to_f64().expect("bool coerces"), 1.0);
        assert_eq!(Value::Datetime(60).to_f64().expect("date coerces"), 60.0);
        assert!(Value::Text("abc".to_owned()).to_f64().is_err());
        assert_eq!(Value::Text("2.5".to_owned()).to_f64().expect("parses"), 2.5);
    }

    #[test]
    fn semantic_eq_treats_nan_as_equal() {
        assert!(Value::Number(f64::NAN).semantic_eq(&Value::Number(f64::NAN)));
        assert!(!Value::Number(1.0).semantic_eq(&Value::Number(2.0)));
        assert!(Value::Null.semantic_eq(&Value::Null));
        assert!(!Value::Number(f64::NAN).semantic_eq(&Value::Null));
    }

    #[test]
    fn inference_widens_integers_and_prefers_text() {
        let ints = vec![Value::Number(1.0), Value::Number(2.0)];
        assert_eq!(infer_simple_type(&ints), SimpleType::Integer);

        let mixed = vec![Value::Number(1.0), Value::Number(2.5)];
        assert_eq!(infer_simple_type(&mixed), SimpleType::Float);

        let texty = vec![Value::Number(1.0), Value::Text("a".to_owned())];
        assert_eq!(infer_simple_type(&texty), SimpleType::String);

        let nully = vec![Value::Null, Value::Number(3.0)];
        assert_eq!(infer_simple_type(&nully), SimpleType::Integer);
    }

    #[test]
    fn olap_roles_split_on_groupability() {
        assert_eq!(SimpleType::String.olap_type(), OlapType::Dimension);
        assert_eq!(SimpleType::Boolean.olap_type(), OlapType::Dimension);
        assert_eq!(SimpleType::Float.olap_type(), OlapType::Measure);
        assert_eq!(SimpleType::Datetime.olap_type(), OlapType::Measure);
    }
}
