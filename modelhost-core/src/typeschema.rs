//! Declared input/output requirements for a model, checked against tables.

use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::AdapterError;
use crate::error::Result;
use crate::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    DataTypes,
    Sparse,
    NumberOfColumns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    Equals,
    In,
    NotIn,
    GreaterThan,
    LessThan,
    NotGreaterThan,
    NotLessThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Num,
    Txt,
    Cat,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Num => "NUM",
            Self::Txt => "TXT",
            Self::Cat => "CAT",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sparsity {
    Forbidden,
    Supported,
    Required,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub field: Field,
    pub condition: Condition,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeSchema {
    #[serde(default)]
    pub input_requirements: Vec<Requirement>,
    #[serde(default)]
    pub output_requirements: Vec<Requirement>,
}

impl TypeSchema {
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|err| AdapterError::configuration(format!("invalid type schema: {err}")))
    }

    pub fn validate_inputs(&self, table: &Table) -> Result<()> {
        validate(&self.input_requirements, table, "input")
    }

    pub fn validate_outputs(&self, table: &Table) -> Result<()> {
        validate(&self.output_requirements, table, "output")
    }
}

fn validate(requirements: &[Requirement], table: &Table, side: &str) -> Result<()> {
    let mut failures = Vec::new();
    for requirement in requirements {
        if let Some(failure) = check(requirement, table)? {
            failures.push(failure);
        }
    }
    if failures.is_empty() {
        return Ok(());
    }
    Err(AdapterError::schema(format!(
        "{side} data does not meet the declared requirements:\n{}",
        failures.join("\n")
    )))
}

/// `Ok(Some(reason))` when the table fails the requirement; `Err` when the
/// requirement itself is malformed.
fn check(requirement: &Requirement, table: &Table) -> Result<Option<String>> {
    match requirement.field {
        Field::DataTypes => check_data_types(requirement, table),
        Field::Sparse => check_sparse(requirement, table),
        Field::NumberOfColumns => check_column_count(requirement, table),
    }
}

fn malformed(requirement: &Requirement) -> AdapterError {
    AdapterError::configuration(format!(
        "unsupported type schema requirement {:?} {:?} {}",
        requirement.field, requirement.condition, requirement.value
    ))
}

fn check_data_types(requirement: &Requirement, table: &Table) -> Result<Option<String>> {
    let declared: BTreeSet<DataType> = match &requirement.value {
        Value::Array(_) | Value::String(_) => {
            let values = match &requirement.value {
                Value::String(_) => Value::Array(vec![requirement.value.clone()]),
                other => other.clone(),
            };
            serde_json::from_value(values).map_err(|_| malformed(requirement))?
        }
        _ => return Err(malformed(requirement)),
    };
    let found = detect_data_types(table);
    let ok = match requirement.condition {
        Condition::Equals => found == declared,
        Condition::In => found.is_subset(&declared),
        Condition::NotIn => found.is_disjoint(&declared),
        _ => return Err(malformed(requirement)),
    };
    if ok {
        return Ok(None);
    }
    Ok(Some(format!(
        "Datatypes incorrect. Data has types: {}, required {:?} {}",
        join(&found),
        requirement.condition,
        join(&declared)
    )))
}

fn join(types: &BTreeSet<DataType>) -> String {
    types
        .iter()
        .map(DataType::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Numeric columns are NUM; string columns with whitespace in any cell are
/// TXT, other string columns CAT.
pub fn detect_data_types(table: &Table) -> BTreeSet<DataType> {
    table
        .columns()
        .iter()
        .filter_map(|column| {
            let present: Vec<&Value> =
                column.values.iter().filter(|cell| !cell.is_null()).collect();
            if present.is_empty() {
                return None;
            }
            if present.iter().all(|cell| cell.is_number()) {
                return Some(DataType::Num);
            }
            let is_text = present
                .iter()
                .filter_map(|cell| cell.as_str())
                .any(|text| text.trim().contains(char::is_whitespace));
            Some(if is_text { DataType::Txt } else { DataType::Cat })
        })
        .collect()
}

fn check_sparse(requirement: &Requirement, table: &Table) -> Result<Option<String>> {
    if requirement.condition != Condition::Equals {
        return Err(malformed(requirement));
    }
    let sparsity: Sparsity =
        serde_json::from_value(requirement.value.clone()).map_err(|_| malformed(requirement))?;
    let failure = match (sparsity, table.is_sparse()) {
        (Sparsity::Forbidden, true) => {
            Some("Sparse data is not allowed, but sparse data was received")
        }
        (Sparsity::Required, false) => Some("Sparse data is required, but dense data was received"),
        _ => None,
    };
    Ok(failure.map(str::to_string))
}

fn check_column_count(requirement: &Requirement, table: &Table) -> Result<Option<String>> {
    let expected = requirement
        .value
        .as_u64()
        .ok_or_else(|| malformed(requirement))?;
    let actual = table.num_columns() as u64;
    let ok = match requirement.condition {
        Condition::Equals => actual == expected,
        Condition::GreaterThan => actual > expected,
        Condition::LessThan => actual < expected,
        Condition::NotGreaterThan => actual <= expected,
        Condition::NotLessThan => actual >= expected,
        Condition::In | Condition::NotIn => return Err(malformed(requirement)),
    };
    if ok {
        return Ok(None);
    }
    Ok(Some(format!(
        "Incorrect number of columns. Data has {actual} columns, required {:?} {expected}",
        requirement.condition
    )))
}
