//! Prediction telemetry: the reporting interface plus a local JSON-lines
//! sink and an in-memory recorder.

use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::Context;
use anyhow::Result;
use chrono::SecondsFormat;
use chrono::Utc;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::table::Table;

/// Where deployment statistics and prediction data are sent.
pub trait Telemetry: Send + Sync {
    fn report_deployment_stats(&self, num_predictions: usize, latency_ms: f64) -> Result<()>;

    /// `predictions` holds one entry per row: a scalar for single-column
    /// outputs, or an array of class probabilities ordered like `class_names`.
    fn report_predictions_data(
        &self,
        features: &Table,
        predictions: &[Value],
        class_names: Option<&[String]>,
        association_ids: Option<&[String]>,
    ) -> Result<()>;
}

/// Send a report, logging instead of propagating any failure.
pub fn report_quietly<F>(telemetry: Option<&dyn Telemetry>, report: F)
where
    F: FnOnce(&dyn Telemetry) -> Result<()>,
{
    let Some(telemetry) = telemetry else {
        return;
    };
    if let Err(err) = report(telemetry) {
        tracing::warn!(error = %format!("{err:#}"), "failed to report telemetry");
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    DeploymentStats {
        num_predictions: usize,
        latency_ms: f64,
    },
    PredictionsData {
        features: Vec<Map<String, Value>>,
        predictions: Vec<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        class_names: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        association_ids: Option<Vec<String>>,
    },
}

impl TelemetryEvent {
    fn predictions_data(
        features: &Table,
        predictions: &[Value],
        class_names: Option<&[String]>,
        association_ids: Option<&[String]>,
    ) -> Self {
        Self::PredictionsData {
            features: features.records(),
            predictions: predictions.to_vec(),
            class_names: class_names.map(<[String]>::to_vec),
            association_ids: association_ids.map(<[String]>::to_vec),
        }
    }
}

/// Appends every report to `<log_dir>/<deployment>/<run_id>/events.jsonl`.
pub struct LocalTelemetry {
    deployment: String,
    log_dir: PathBuf,
    run_id: String,
}

impl LocalTelemetry {
    pub fn new(deployment: impl Into<String>, log_dir: Option<PathBuf>) -> Result<Self> {
        let deployment = deployment.into();
        let log_dir = log_dir.unwrap_or_else(default_log_dir);
        let telemetry = Self {
            deployment,
            log_dir,
            run_id: Utc::now().format("%Y%m%dT%H%M%S%.3f").to_string(),
        };
        let run_dir = telemetry.run_dir();
        fs::create_dir_all(&run_dir).with_context(|| {
            format!("failed to create telemetry directory {}", run_dir.display())
        })?;
        tracing::info!(path = %run_dir.display(), "local telemetry enabled");
        Ok(telemetry)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> PathBuf {
        self.log_dir.join(&self.deployment).join(&self.run_id)
    }

    pub fn events_path(&self) -> PathBuf {
        self.run_dir().join("events.jsonl")
    }

    fn append(&self, event: &TelemetryEvent) -> Result<()> {
        let mut line = match serde_json::to_value(event)? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        line.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        let path = self.events_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{}", Value::Object(line))
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

impl Telemetry for LocalTelemetry {
    fn report_deployment_stats(&self, num_predictions: usize, latency_ms: f64) -> Result<()> {
        self.append(&TelemetryEvent::DeploymentStats {
            num_predictions,
            latency_ms,
        })
    }

    fn report_predictions_data(
        &self,
        features: &Table,
        predictions: &[Value],
        class_names: Option<&[String]>,
        association_ids: Option<&[String]>,
    ) -> Result<()> {
        self.append(&TelemetryEvent::predictions_data(
            features,
            predictions,
            class_names,
            association_ids,
        ))
    }
}

/// `$XDG_STATE_HOME/modelhost/telemetry`, falling back to `~/.local/state`.
pub fn default_log_dir() -> PathBuf {
    let state_home = std::env::var("XDG_STATE_HOME")
        .ok()
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            Path::new(&home).join(".local").join("state")
        });
    state_home.join("modelhost").join("telemetry")
}

/// Keeps reports in memory.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, event: TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl Telemetry for MemoryTelemetry {
    fn report_deployment_stats(&self, num_predictions: usize, latency_ms: f64) -> Result<()> {
        self.record(TelemetryEvent::DeploymentStats {
            num_predictions,
            latency_ms,
        });
        Ok(())
    }

    fn report_predictions_data(
        &self,
        features: &Table,
        predictions: &[Value],
        class_names: Option<&[String]>,
        association_ids: Option<&[String]>,
    ) -> Result<()> {
        self.record(TelemetryEvent::predictions_data(
            features,
            predictions,
            class_names,
            association_ids,
        ));
        Ok(())
    }
}
