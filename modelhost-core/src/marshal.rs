//! Normalizing raw model output into the canonical table for a target type.
//!
//! Models return anything from a flat vector of regression values to an
//! `n x k` probability matrix with their own label ordering. Everything that
//! leaves the adapter goes through [`marshal_predictions`] so downstream code
//! only ever sees one shape per target type.

use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayD;
use ndarray::Axis;
use ndarray::Ix2;
use ndarray::IxDyn;
use serde_json::Value;

use crate::error::AdapterError;
use crate::error::Result;
use crate::labels::reconcile_labels;
use crate::table::Table;
use crate::target_type::PRED_COLUMN;
use crate::target_type::TargetType;

const PROBABILITY_ATOL: f64 = 1e-8;
const PROBABILITY_RTOL: f64 = 1e-5;

/// Raw prediction output before marshalling.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionArray {
    Numeric(ArrayD<f64>),
    /// Text, geo points, embeddings or anything else that is not a plain float.
    Objects(ArrayD<Value>),
}

impl PredictionArray {
    pub fn from_vec(values: Vec<f64>) -> Self {
        Self::Numeric(Array1::from(values).into_dyn())
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self::Objects(Array1::from(values).into_dyn())
    }

    /// Row-major matrix; every row must have the same width.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let width = rows.first().map_or(0, Vec::len);
        let height = rows.len();
        if rows.iter().any(|row| row.len() != width) {
            return Err(AdapterError::shape(
                "predictions must return a 2 dimensional array with rows of equal length",
            ));
        }
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        ArrayD::from_shape_vec(IxDyn(&[height, width]), flat)
            .map(Self::Numeric)
            .map_err(|err| AdapterError::shape(format!("invalid prediction matrix: {err}")))
    }

    /// Matrix view of a table. Numeric when every cell is a number.
    pub fn from_table(table: &Table) -> Result<Self> {
        let shape = IxDyn(&[table.num_rows(), table.num_columns()]);
        let cells: Vec<Value> = table.rows().into_iter().flatten().collect();
        let invalid =
            |err: ndarray::ShapeError| AdapterError::shape(format!("invalid table shape: {err}"));
        if table.is_all_numeric() {
            let numbers: Vec<f64> = cells.iter().filter_map(Value::as_f64).collect();
            return ArrayD::from_shape_vec(shape, numbers)
                .map(Self::Numeric)
                .map_err(invalid);
        }
        ArrayD::from_shape_vec(shape, cells)
            .map(Self::Objects)
            .map_err(invalid)
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Numeric(array) => array.shape(),
            Self::Objects(array) => array.shape(),
        }
    }

    /// Numeric view, converting object arrays that only hold numbers.
    fn to_numeric(&self) -> Option<ArrayD<f64>> {
        match self {
            Self::Numeric(array) => Some(array.clone()),
            Self::Objects(array) => {
                let numbers: Option<Vec<f64>> = array.iter().map(Value::as_f64).collect();
                ArrayD::from_shape_vec(array.raw_dim(), numbers?).ok()
            }
        }
    }

    fn to_values(&self) -> ArrayD<Value> {
        match self {
            Self::Numeric(array) => array.mapv(Value::from),
            Self::Objects(array) => array.clone(),
        }
    }
}

/// Turn raw output into the canonical table for `target_type`.
///
/// `request_labels` is the caller's label order (classification only) and
/// `model_labels` the order the model reported for its columns, if any.
pub fn marshal_predictions(
    request_labels: Option<&[String]>,
    predictions: &PredictionArray,
    target_type: TargetType,
    model_labels: Option<&[Value]>,
) -> Result<Table> {
    let ndim = predictions.ndim();
    if ndim != 1 && ndim != 2 {
        return Err(AdapterError::shape(format!(
            "predictions must return a 2 dimensional array, but received a {ndim} dimensional array"
        )));
    }

    match target_type {
        TargetType::Unstructured => Err(AdapterError::configuration(
            "unstructured predictions are returned as-is and cannot be marshalled",
        )),
        TargetType::Transform => transform_table(predictions),
        target if target.is_single_column() => single_column(predictions, target),
        _ => classification(request_labels, predictions, target_type, model_labels),
    }
}

fn transform_table(predictions: &PredictionArray) -> Result<Table> {
    let matrix = as_matrix(predictions.to_values())?;
    let columns = matrix
        .axis_iter(Axis(1))
        .enumerate()
        .map(|(index, column)| (index.to_string(), column.to_vec()));
    Table::from_columns(columns)
}

fn single_column(predictions: &PredictionArray, target_type: TargetType) -> Result<Table> {
    let shape = predictions.shape();
    if shape.len() == 2 && shape[1] != 1 {
        return Err(AdapterError::shape(format!(
            "{target_type} predictions must contain only 1 column, but received {}",
            shape[1]
        )));
    }

    let values: Vec<Value> = if target_type.has_text_predictions() {
        predictions.to_values().iter().cloned().collect()
    } else {
        let numeric = predictions.to_numeric().ok_or_else(|| {
            AdapterError::shape(format!("{target_type} predictions must be numeric"))
        })?;
        numeric.iter().copied().map(Value::from).collect()
    };
    Ok(Table::single(PRED_COLUMN, values))
}

fn classification(
    request_labels: Option<&[String]>,
    predictions: &PredictionArray,
    target_type: TargetType,
    model_labels: Option<&[Value]>,
) -> Result<Table> {
    let labels = request_labels.ok_or_else(|| {
        AdapterError::configuration(format!("{target_type} predictions require class labels"))
    })?;
    let numeric = predictions.to_numeric().ok_or_else(|| {
        AdapterError::shape(format!(
            "{target_type} predictions must be numeric class probabilities"
        ))
    })?;

    let matrix = if numeric.ndim() == 1 && target_type == TargetType::Binary {
        // Only the positive class probability was returned.
        let mut stacked = Array2::<f64>::zeros((numeric.len(), 2));
        for (row, p) in numeric.iter().copied().enumerate() {
            stacked[[row, 0]] = 1.0 - p;
            stacked[[row, 1]] = p;
        }
        stacked
    } else {
        as_matrix(numeric)?
    };

    let columns = matrix.ncols();
    if columns != labels.len() {
        let direction = if columns > labels.len() {
            "more columns than"
        } else {
            "fewer columns than"
        };
        return Err(AdapterError::shape(format!(
            "Your prediction array has {direction} the {} class labels provided ({columns} columns): \
             predictions must return the probability distribution for the correct number of \
             class labels",
            labels.len()
        )));
    }

    if matrix.iter().any(|p| !p.is_finite()) {
        return Err(AdapterError::probability(
            "Your prediction probabilities contain NaN or infinite values",
        ));
    }
    if matrix.iter().any(|p| *p < 0.0) {
        return Err(AdapterError::probability(
            "Your prediction probabilities have negative values",
        ));
    }

    let bad_rows: Vec<f64> = matrix
        .sum_axis(Axis(1))
        .iter()
        .copied()
        .filter(|sum| (sum - 1.0).abs() > PROBABILITY_ATOL + PROBABILITY_RTOL)
        .collect();
    if !bad_rows.is_empty() {
        return Err(AdapterError::probability(format!(
            "Your prediction probabilities do not add up to 1. Row sums: {:?}",
            &bad_rows[..bad_rows.len().min(5)]
        )));
    }

    let model_order = reconcile_labels(labels, model_labels)?;
    let columns = model_order
        .into_iter()
        .zip(matrix.axis_iter(Axis(1)))
        .map(|(label, column)| {
            let values: Vec<Value> = column.iter().copied().map(Value::from).collect();
            (label, values)
        });
    let table = Table::from_columns(columns)?;

    let request_order: Vec<&str> = labels.iter().map(String::as_str).collect();
    table.select(&request_order)
}

/// View a rank 1 or rank 2 array as a matrix; vectors become one column.
fn as_matrix<T>(array: ArrayD<T>) -> Result<Array2<T>> {
    let array = if array.ndim() == 1 {
        array.insert_axis(Axis(1))
    } else {
        array
    };
    array.into_dimensionality::<Ix2>().map_err(|err| {
        AdapterError::shape(format!("predictions must return a 2 dimensional array: {err}"))
    })
}

/// Separate label (or target) columns from additional model output.
///
/// Returns the prediction columns and, when the score hook produced more
/// columns than the contract needs, the remaining columns.
pub fn split_predictions_and_extra_output(
    result: &Table,
    request_labels: Option<&[String]>,
    target_name: Option<&str>,
) -> Result<(Table, Option<Table>)> {
    if let Some(labels) = request_labels.filter(|labels| !labels.is_empty()) {
        if result.num_columns() <= labels.len() {
            return Ok((result.clone(), None));
        }
        let names = result.column_names();
        let mut matched = Vec::with_capacity(labels.len());
        for label in labels {
            let column = names
                .iter()
                .find(|name| **name == label.as_str())
                .or_else(|| names.iter().find(|name| numerically_equal(name, label)))
                .ok_or_else(|| {
                    AdapterError::label_mismatch(format!(
                        "Expected prediction column for class label '{label}' in {names:?}"
                    ))
                })?;
            matched.push(*column);
        }
        let predictions = result.select(&matched)?;
        let extra = result.drop_columns(&matched);
        return Ok((predictions, Some(extra)));
    }

    if result.num_columns() <= 1 {
        return Ok((result.clone(), None));
    }

    let target_column = match target_name {
        Some(name) if result.contains(name) => name.to_string(),
        Some(name) => strip_quotes(name).to_string(),
        None => PRED_COLUMN.to_string(),
    };
    let predictions = result.select(&[target_column.as_str()])?;
    let extra = result.drop_columns(&[target_column.as_str()]);
    Ok((predictions, Some(extra)))
}

fn strip_quotes(name: &str) -> &str {
    name.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(name)
}

fn numerically_equal(left: &str, right: &str) -> bool {
    match (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}

/// Labels of a table's columns as JSON values, for feeding back into marshalling.
pub fn column_labels(table: &Table) -> Vec<Value> {
    table
        .column_names()
        .into_iter()
        .map(|name| Value::String(name.to_string()))
        .collect()
}
