//! Aligning the labels a request declares with the labels a model reports.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::error::AdapterError;
use crate::error::Result;

/// Labels the caller expects, in output column order.
///
/// Multiclass deployments pass `class_labels`; binary ones pass the two class
/// labels, which become `[negative, positive]`.
pub fn request_labels(
    class_labels: Option<&[String]>,
    positive: Option<&str>,
    negative: Option<&str>,
) -> Option<Vec<String>> {
    if let Some(labels) = class_labels {
        return Some(labels.to_vec());
    }
    match (positive, negative) {
        (Some(positive), Some(negative)) => Some(vec![negative.to_string(), positive.to_string()]),
        _ => None,
    }
}

/// String form of a label reported by a model.
pub fn standardize_label(label: &Value) -> String {
    match label {
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

/// Reorder `request` so position `i` names the class of model output column `i`.
pub fn reconcile_labels(request: &[String], model: Option<&[Value]>) -> Result<Vec<String>> {
    let Some(model) = model else {
        return Ok(request.to_vec());
    };
    let model: Vec<String> = model.iter().map(standardize_label).collect();
    if model.len() != request.len() {
        return Err(AdapterError::label_mismatch(format!(
            "Wrong class labels {request:?}. The model reports {} labels: {model:?}",
            model.len()
        )));
    }

    let request_set: BTreeSet<&str> = request.iter().map(String::as_str).collect();
    let model_set: BTreeSet<&str> = model.iter().map(String::as_str).collect();
    if request_set == model_set {
        return Ok(model);
    }

    order_by_numeric_value(request, &model)
}

fn order_by_numeric_value(request: &[String], model: &[String]) -> Result<Vec<String>> {
    let mismatch = || {
        AdapterError::label_mismatch(format!(
            "Wrong class labels {request:?}. Use class labels detected by the model: {model:?}"
        ))
    };

    let request_values = numeric_values(request).ok_or_else(mismatch)?;
    let model_values = numeric_values(model).ok_or_else(mismatch)?;
    reject_aliases(request, &request_values)?;
    reject_aliases(model, &model_values)?;

    if request_values.len() != model_values.len() {
        return Err(mismatch());
    }

    model_values
        .iter()
        .map(|value| {
            request_values
                .iter()
                .position(|candidate| candidate == value)
                .map(|index| request[index].clone())
                .ok_or_else(mismatch)
        })
        .collect()
}

fn numeric_values(labels: &[String]) -> Option<Vec<f64>> {
    labels
        .iter()
        .map(|label| {
            label
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
        })
        .collect()
}

/// Two labels on one side that share a numeric value cannot be told apart.
fn reject_aliases(labels: &[String], values: &[f64]) -> Result<()> {
    for (i, left) in values.iter().enumerate() {
        if let Some(j) = values[i + 1..].iter().position(|right| right == left) {
            return Err(AdapterError::label_mismatch(format!(
                "Class labels '{}' and '{}' refer to the same numeric value",
                labels[i],
                labels[i + 1 + j]
            )));
        }
    }
    Ok(())
}
