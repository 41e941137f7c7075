//! The predictor a server talks to: a bound [`ModelAdapter`] plus the
//! deployment settings (class ordering, monitoring, output schema).

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;
use tracing::info;

use crate::adapter::ModelAdapter;
use crate::adapter::StructuredRequest;
use crate::artifacts::PredictorRegistry;
use crate::chat::ChatCoordinator;
use crate::chat::ChatOutcome;
use crate::codec::SupportedPayloadFormats;
use crate::codec::UnstructuredInput;
use crate::codec::UnstructuredOutput;
use crate::config::RunnerConfig;
use crate::error::AdapterError;
use crate::error::Result;
use crate::hooks::ChatParams;
use crate::hooks::LoadContext;
use crate::marshal::marshal_predictions;
use crate::table::Table;
use crate::target_type::TargetType;
use crate::telemetry::LocalTelemetry;
use crate::telemetry::Telemetry;
use crate::telemetry::report_quietly;
use crate::typeschema::TypeSchema;

/// Keys of the `/info/` document.
pub mod model_info_keys {
    pub const CODE_DIR: &str = "codeDir";
    pub const TARGET_TYPE: &str = "targetType";
    pub const PREDICTOR: &str = "predictor";
    pub const POSITIVE_CLASS_LABEL: &str = "positiveClassLabel";
    pub const NEGATIVE_CLASS_LABEL: &str = "negativeClassLabel";
    pub const CLASS_LABELS: &str = "classLabels";
    pub const VERSION: &str = "modelhostVersion";
}

/// Canonical predictions with any extra columns the model produced.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictResponse {
    pub predictions: Table,
    pub extra_model_output: Option<Table>,
}

impl PredictResponse {
    /// Predictions and extra output side by side.
    pub fn combined(&self) -> Result<Table> {
        match &self.extra_model_output {
            Some(extra) => self.predictions.join(extra),
            None => Ok(self.predictions.clone()),
        }
    }
}

pub struct Predictor {
    adapter: ModelAdapter,
    code_dir: PathBuf,
    positive_class_label: Option<String>,
    negative_class_label: Option<String>,
    class_labels: Option<Vec<String>>,
    telemetry: Option<Arc<dyn Telemetry>>,
    type_schema: Option<TypeSchema>,
    chat: ChatCoordinator,
}

impl Predictor {
    /// Wrap a bound adapter. `telemetry` is only used when `config.monitor`
    /// is set.
    pub fn new(
        adapter: ModelAdapter,
        config: &RunnerConfig,
        telemetry: Option<Arc<dyn Telemetry>>,
    ) -> Result<Self> {
        let telemetry = telemetry.filter(|_| config.monitor);
        let type_schema = match config.type_schema.clone() {
            Some(schema) => Some(TypeSchema::from_json(schema)?),
            None => None,
        };
        let chat = ChatCoordinator::new(telemetry.clone(), config.prompt_column_name.clone());
        Ok(Self {
            code_dir: adapter.model_dir().to_path_buf(),
            adapter,
            positive_class_label: config.positive_class_label.clone(),
            negative_class_label: config.negative_class_label.clone(),
            class_labels: config.class_labels.clone(),
            telemetry,
            type_schema,
            chat,
        })
    }

    /// Bind the model in `config.code_dir`: resolve user code, load the model
    /// and attach the local telemetry sink when monitoring is on.
    pub fn from_config(
        config: &RunnerConfig,
        ctx: &mut LoadContext,
        registry: PredictorRegistry,
    ) -> anyhow::Result<Self> {
        let target_type = config.target_type()?;
        let code_dir = config.code_dir()?;

        let mut adapter =
            ModelAdapter::new(code_dir, target_type, config.target_name.clone(), registry)?
                .with_llm_id(config.llm_id.clone());
        adapter
            .load_custom_hooks(ctx)
            .with_context(|| format!("failed to load custom code from {}", code_dir.display()))?;
        adapter
            .load_model_from_artifact(false)
            .with_context(|| format!("failed to load the model in {}", code_dir.display()))?;

        let telemetry = match config.telemetry_log_dir() {
            Some(log_dir) => {
                let sink = LocalTelemetry::new(deployment_name(code_dir), Some(log_dir))?;
                Some(Arc::new(sink) as Arc<dyn Telemetry>)
            }
            None => None,
        };

        info!(
            target_type = %target_type,
            code_dir = %code_dir.display(),
            monitor = config.monitor,
            "predictor ready"
        );
        Ok(Self::new(adapter, config, telemetry)?)
    }

    pub fn adapter(&self) -> &ModelAdapter {
        &self.adapter
    }

    pub fn target_type(&self) -> TargetType {
        self.adapter.target_type()
    }

    pub fn code_dir(&self) -> &Path {
        &self.code_dir
    }

    /// Output column order for classification: `[negative, positive]` for
    /// binary, the configured class labels for multiclass.
    pub fn class_ordering(&self) -> Option<Vec<String>> {
        match self.target_type() {
            TargetType::Binary => match (&self.negative_class_label, &self.positive_class_label) {
                (Some(negative), Some(positive)) => Some(vec![negative.clone(), positive.clone()]),
                _ => None,
            },
            TargetType::Multiclass => self.class_labels.clone(),
            _ => None,
        }
    }

    pub fn supported_payload_formats(&self) -> SupportedPayloadFormats {
        self.adapter.supported_payload_formats()
    }

    pub fn has_read_input_data_hook(&self) -> bool {
        self.adapter.has_read_input_data_hook()
    }

    pub fn predict(&self, mut request: StructuredRequest) -> Result<PredictResponse> {
        let params = &mut request.params;
        if params.positive_class_label.is_none() {
            params.positive_class_label = self.positive_class_label.clone();
        }
        if params.negative_class_label.is_none() {
            params.negative_class_label = self.negative_class_label.clone();
        }
        if params.class_labels.is_none() {
            params.class_labels = self.class_labels.clone();
        }

        let started = Instant::now();
        let raw = self.adapter.predict(&request)?;
        let predictions = marshal_predictions(
            self.class_ordering().as_deref(),
            &raw.predictions,
            self.target_type(),
            raw.model_labels.as_deref(),
        )?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        if predictions.num_rows() != raw.features.num_rows() {
            return Err(AdapterError::shape(format!(
                "Prediction result has {} rows but the input data has {} rows",
                predictions.num_rows(),
                raw.features.num_rows()
            )));
        }
        debug!(
            rows = predictions.num_rows(),
            columns = predictions.num_columns(),
            latency_ms,
            "predictions marshalled"
        );

        self.monitor(&raw.features, &predictions, latency_ms);

        Ok(PredictResponse {
            predictions,
            extra_model_output: raw.extra_model_output,
        })
    }

    fn monitor(&self, features: &Table, predictions: &Table, latency_ms: f64) {
        let Some(telemetry) = self.telemetry.as_deref() else {
            return;
        };
        report_quietly(Some(telemetry), |sink| {
            sink.report_deployment_stats(predictions.num_rows(), latency_ms)
        });
        report_quietly(Some(telemetry), |sink| {
            if predictions.num_columns() == 1 {
                let values = predictions
                    .first_column()
                    .map(|column| column.values.clone())
                    .unwrap_or_default();
                sink.report_predictions_data(features, &values, None, None)
            } else {
                let rows: Vec<Value> = predictions.rows().into_iter().map(Value::Array).collect();
                let class_names: Vec<String> = predictions
                    .column_names()
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                sink.report_predictions_data(features, &rows, Some(class_names.as_slice()), None)
            }
        });
    }

    /// Transform features; transform models are checked against the declared
    /// output requirements.
    pub fn transform(&self, request: &StructuredRequest) -> Result<(Table, Option<Table>)> {
        let (features, target) = self.adapter.transform(request)?;
        if self.target_type() == TargetType::Transform
            && let Some(schema) = &self.type_schema
        {
            schema.validate_outputs(&features)?;
        }
        Ok((features, target))
    }

    pub fn predict_unstructured(&self, input: &UnstructuredInput) -> Result<UnstructuredOutput> {
        self.adapter.predict_unstructured(input)
    }

    pub fn supports_chat(&self) -> bool {
        self.adapter.supports_chat()
    }

    pub fn chat(&self, request: &Value, headers: BTreeMap<String, String>) -> Result<ChatOutcome> {
        self.chat.run(request, |association_id| {
            let params = ChatParams {
                headers,
                association_id: Some(association_id.to_string()),
            };
            self.adapter.chat(request, &params)
        })
    }

    pub fn get_supported_llm_models(&self) -> Result<Value> {
        self.adapter.get_supported_llm_models()
    }

    pub fn model_info(&self) -> Map<String, Value> {
        let mut info = Map::new();
        info.insert(
            model_info_keys::TARGET_TYPE.to_string(),
            Value::String(self.target_type().to_string()),
        );
        info.insert(
            model_info_keys::CODE_DIR.to_string(),
            Value::String(self.code_dir.display().to_string()),
        );
        info.insert(
            model_info_keys::VERSION.to_string(),
            Value::String(env!("CARGO_PKG_VERSION").to_string()),
        );
        match self.target_type() {
            TargetType::Binary => {
                let label =
                    |value: &Option<String>| value.clone().map_or(Value::Null, Value::String);
                info.insert(
                    model_info_keys::POSITIVE_CLASS_LABEL.to_string(),
                    label(&self.positive_class_label),
                );
                info.insert(
                    model_info_keys::NEGATIVE_CLASS_LABEL.to_string(),
                    label(&self.negative_class_label),
                );
            }
            TargetType::Multiclass => {
                let labels = self
                    .class_labels
                    .iter()
                    .flatten()
                    .cloned()
                    .map(Value::String)
                    .collect();
                info.insert(model_info_keys::CLASS_LABELS.to_string(), Value::Array(labels));
            }
            _ => {}
        }
        info.extend(self.adapter.model_info());
        info
    }
}

impl std::fmt::Debug for Predictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predictor")
            .field("adapter", &self.adapter)
            .field("class_ordering", &self.class_ordering())
            .field("monitor", &self.telemetry.is_some())
            .finish_non_exhaustive()
    }
}

fn deployment_name(code_dir: &Path) -> String {
    code_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string())
}
