use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::AdapterError;

/// Canonical name of the single prediction column.
pub const PRED_COLUMN: &str = "Predictions";

/// Learning problem a deployed model solves. Fixed for the lifetime of a bound
/// model and decides both the output contract and which hooks are honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Binary,
    Multiclass,
    Regression,
    Anomaly,
    Unstructured,
    Transform,
    #[serde(rename = "textgeneration")]
    TextGeneration,
    #[serde(rename = "geopoint")]
    GeoPoint,
    #[serde(rename = "vectordatabase")]
    VectorDatabase,
    #[serde(rename = "agenticworkflow")]
    AgenticWorkflow,
}

impl TargetType {
    pub const ALL: [TargetType; 10] = [
        Self::Binary,
        Self::Multiclass,
        Self::Regression,
        Self::Anomaly,
        Self::Unstructured,
        Self::Transform,
        Self::TextGeneration,
        Self::GeoPoint,
        Self::VectorDatabase,
        Self::AgenticWorkflow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Multiclass => "multiclass",
            Self::Regression => "regression",
            Self::Anomaly => "anomaly",
            Self::Unstructured => "unstructured",
            Self::Transform => "transform",
            Self::TextGeneration => "textgeneration",
            Self::GeoPoint => "geopoint",
            Self::VectorDatabase => "vectordatabase",
            Self::AgenticWorkflow => "agenticworkflow",
        }
    }

    pub fn is_classification(self) -> bool {
        matches!(self, Self::Binary | Self::Multiclass)
    }

    /// Types whose canonical output is exactly one column named [`PRED_COLUMN`].
    pub fn is_single_column(self) -> bool {
        matches!(
            self,
            Self::Regression
                | Self::Anomaly
                | Self::TextGeneration
                | Self::GeoPoint
                | Self::VectorDatabase
                | Self::AgenticWorkflow
        )
    }

    pub fn requires_target_name(self) -> bool {
        matches!(
            self,
            Self::TextGeneration | Self::VectorDatabase | Self::AgenticWorkflow
        )
    }

    /// Single-column types whose predictions are not plain numbers.
    pub fn has_text_predictions(self) -> bool {
        matches!(
            self,
            Self::TextGeneration | Self::GeoPoint | Self::VectorDatabase | Self::AgenticWorkflow
        )
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = AdapterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|target| target.as_str() == normalized)
            .ok_or_else(|| {
                AdapterError::configuration(format!(
                    "unsupported target type '{value}', expected one of: {}",
                    Self::ALL.map(TargetType::as_str).join(", ")
                ))
            })
    }
}
