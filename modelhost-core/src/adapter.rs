//! Binds one model directory to its user code and framework predictors and
//! exposes the raw predict / transform / unstructured / chat / fit entry points.

use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;

use crate::artifacts::ArtifactPredictor;
use crate::artifacts::Model;
use crate::artifacts::PredictorRegistry;
use crate::chat::ChatResponse;
use crate::codec::PayloadFormat;
use crate::codec::SupportedPayloadFormats;
use crate::codec::UnstructuredInput;
use crate::codec::UnstructuredOutput;
use crate::codec::decode_structured;
use crate::error::AdapterError;
use crate::error::Result;
use crate::hooks::ChatFn;
use crate::hooks::ChatParams;
use crate::hooks::CustomTask;
use crate::hooks::FitRequest;
use crate::hooks::HookBinding;
use crate::hooks::HookName;
use crate::hooks::HookResolver;
use crate::hooks::HookSet;
use crate::hooks::LoadContext;
use crate::hooks::ScoreFn;
use crate::hooks::ScoreParams;
use crate::labels::request_labels;
use crate::marshal::PredictionArray;
use crate::marshal::column_labels;
use crate::marshal::marshal_predictions;
use crate::marshal::split_predictions_and_extra_output;
use crate::table::Table;
use crate::target_type::TargetType;

/// `created` timestamp reported for the configured LLM (2025-01-01T00:00:00Z).
const LLM_ID_CREATED: i64 = 1_735_689_600;
const LLM_OWNER: &str = "modelhost";
/// Column a moderation pipeline names the generated text.
const MODERATION_COMPLETION_COLUMN: &str = "completion";

/// Guard layer wrapped around the score and chat hooks of text models.
pub trait ModerationPipeline: Send + Sync {
    fn score(
        &self,
        data: &Table,
        model: &Model,
        score: &ScoreFn,
        params: &ScoreParams,
    ) -> anyhow::Result<Table>;

    fn chat(
        &self,
        request: &Value,
        model: &Model,
        chat: &ChatFn,
        params: &ChatParams,
    ) -> anyhow::Result<ChatResponse>;
}

/// A structured payload plus the request options that travel with it.
#[derive(Debug, Clone, Default)]
pub struct StructuredRequest {
    pub binary_data: Vec<u8>,
    pub mimetype: String,
    pub sparse_colnames: Option<Vec<String>>,
    pub target_binary_data: Option<Vec<u8>>,
    pub target_mimetype: Option<String>,
    pub params: ScoreParams,
}

impl StructuredRequest {
    pub fn new(binary_data: impl Into<Vec<u8>>, mimetype: impl Into<String>) -> Self {
        Self {
            binary_data: binary_data.into(),
            mimetype: mimetype.into(),
            ..Self::default()
        }
    }
}

/// Predictions before marshalling, with the labels the model reported.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPredictResponse {
    pub predictions: PredictionArray,
    pub model_labels: Option<Vec<Value>>,
    pub extra_model_output: Option<Table>,
    /// Decoded request features, before the transform hook.
    pub features: Table,
}

pub struct ModelAdapter {
    model_dir: PathBuf,
    target_type: TargetType,
    target_name: Option<String>,
    registry: PredictorRegistry,
    binding: HookBinding,
    model: Option<Model>,
    task: Option<Box<dyn CustomTask>>,
    predictor: Option<Arc<dyn ArtifactPredictor>>,
    moderation: Option<Arc<dyn ModerationPipeline>>,
    llm_id: Option<String>,
}

impl ModelAdapter {
    pub fn new(
        model_dir: impl Into<PathBuf>,
        target_type: TargetType,
        target_name: Option<String>,
        registry: PredictorRegistry,
    ) -> Result<Self> {
        let target_name = target_name.filter(|name| !name.is_empty());
        if target_type.requires_target_name() && target_name.is_none() {
            return Err(AdapterError::configuration(format!(
                "Unexpected empty target name for {target_type} target."
            )));
        }
        Ok(Self {
            model_dir: model_dir.into(),
            target_type,
            target_name,
            registry,
            binding: HookBinding::Legacy(HookSet::default()),
            model: None,
            task: None,
            predictor: None,
            moderation: None,
            llm_id: None,
        })
    }

    pub fn with_moderation(mut self, pipeline: Arc<dyn ModerationPipeline>) -> Self {
        self.moderation = Some(pipeline);
        self
    }

    pub fn with_llm_id(mut self, llm_id: Option<String>) -> Self {
        self.llm_id = llm_id.filter(|id| !id.is_empty());
        self
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn target_type(&self) -> TargetType {
        self.target_type
    }

    pub fn target_name(&self) -> Option<&str> {
        self.target_name.as_deref()
    }

    pub fn is_custom_task_class(&self) -> bool {
        self.binding.is_task()
    }

    pub fn has_hook(&self, name: HookName) -> bool {
        self.binding.hooks().is_some_and(|hooks| hooks.has(name))
    }

    pub fn has_read_input_data_hook(&self) -> bool {
        self.has_hook(HookName::ReadInputData)
    }

    pub fn supports_chat(&self) -> bool {
        self.has_hook(HookName::Chat)
    }

    pub fn predictor_name(&self) -> Option<&str> {
        self.predictor.as_ref().map(|predictor| predictor.name())
    }

    fn hooks(&self) -> Option<&HookSet> {
        self.binding.hooks()
    }

    fn model(&self) -> Result<&Model> {
        self.model.as_ref().ok_or_else(|| {
            AdapterError::configuration("The model has not been loaded from its artifact yet.")
        })
    }

    /// Resolve and bind the user code in the model directory.
    pub fn load_custom_hooks(&mut self, ctx: &mut LoadContext) -> Result<()> {
        self.binding = HookResolver::resolve(ctx, &self.model_dir, self.target_type)?;
        debug!(binding = ?self.binding, "custom code bound");
        Ok(())
    }

    /// Load the model: through the task class, the `load_model` hook, or the
    /// single artifact in the model directory.
    pub fn load_model_from_artifact(&mut self, skip_predictor_lookup: bool) -> Result<()> {
        let hooks = match &self.binding {
            HookBinding::Task(task_class) => {
                let task = task_class.load(&self.model_dir).map_err(|err| {
                    AdapterError::hook("Custom task 'load' failed to load the model.", err)
                })?;
                self.task = Some(task);
                return Ok(());
            }
            HookBinding::Legacy(hooks) => hooks.clone(),
        };

        let model = match hooks.load_model.as_ref() {
            Some(load_model) => {
                debug!("Load model hook will be used to load the model");
                load_model(&self.model_dir)
                    .map_err(|err| {
                        AdapterError::hook("'load_model' hook failed to load the model.", err)
                    })?
                    .ok_or_else(|| {
                        AdapterError::load(
                            HookName::LoadModel.as_str(),
                            "'load_model' hook failed to load model, None is returned.",
                        )
                    })?
            }
            None => {
                let artifact = self.registry.detect_artifact(&self.model_dir)?;
                info!(artifact = %artifact.display(), "loading model artifact");
                self.registry.load_via_predictors(&artifact)?
            }
        };

        if !matches!(
            self.target_type,
            TargetType::Unstructured | TargetType::Transform
        ) && !hooks.has(HookName::Score)
            && !hooks.has(HookName::Chat)
            && !skip_predictor_lookup
        {
            self.predictor = self.registry.find_predictor_to_use(&model, false)?;
        }

        if self.target_type == TargetType::Transform
            && !hooks.has(HookName::Transform)
            && self.registry.find_transformer(&model).is_none()
        {
            return Err(AdapterError::configuration(
                "A transform task requires a user-defined transform hook for models that are \
                 not native transformers",
            ));
        }

        self.model = Some(model);
        Ok(())
    }

    pub fn supported_payload_formats(&self) -> SupportedPayloadFormats {
        let mut formats = SupportedPayloadFormats::default();
        formats.add(PayloadFormat::Csv);
        formats.add(PayloadFormat::Mtx);
        formats
    }

    pub fn model_info(&self) -> Map<String, Value> {
        let mut info = Map::new();
        info.insert(
            "predictor".to_string(),
            self.predictor_name()
                .map_or(Value::Null, |name| Value::String(name.to_string())),
        );
        info
    }

    /// Decode a payload, preferring the `read_input_data` hook when allowed.
    pub fn load_data(
        &self,
        binary_data: &[u8],
        mimetype: &str,
        try_hook: bool,
        sparse_colnames: Option<&[String]>,
    ) -> Result<Table> {
        if try_hook
            && let Some(read_input_data) = self
                .hooks()
                .and_then(|hooks| hooks.read_input_data.as_ref())
        {
            return read_input_data(binary_data).map_err(|err| {
                AdapterError::hook("Model 'read_input_data' hook failed to read input data.", err)
            });
        }
        decode_structured(binary_data, mimetype, sparse_colnames)
    }

    /// Apply the transform hook, if any, ahead of scoring or fitting.
    pub fn preprocess(&self, data: Table, model: Option<&Model>) -> Result<Table> {
        match self.hooks().and_then(|hooks| hooks.transform.as_ref()) {
            Some(transform) => transform(&data, model, None).map_err(|err| {
                AdapterError::hook("Model 'transform hook' failed to transform dataset.", err)
            }),
            None => Ok(data),
        }
    }

    pub fn predict(&self, request: &StructuredRequest) -> Result<RawPredictResponse> {
        let features = self.load_data(
            &request.binary_data,
            &request.mimetype,
            true,
            request.sparse_colnames.as_deref(),
        )?;
        let data = self.preprocess(features.clone(), self.model.as_ref())?;

        match &self.task {
            Some(task) => self.predict_with_task(task.as_ref(), &data, features, &request.params),
            None => self.predict_with_hooks(&data, features, &request.params),
        }
    }

    fn predict_with_task(
        &self,
        task: &dyn CustomTask,
        data: &Table,
        features: Table,
        params: &ScoreParams,
    ) -> Result<RawPredictResponse> {
        let output = if self.target_type.is_classification() {
            task.predict_proba(data, params)
        } else {
            task.predict(data, params)
        }
        .map_err(|err| AdapterError::hook("Model 'score' hook failed to make predictions.", err))?;
        Ok(RawPredictResponse {
            predictions: PredictionArray::from_table(&output)?,
            model_labels: Some(column_labels(&output)),
            extra_model_output: None,
            features,
        })
    }

    fn predict_with_hooks(
        &self,
        data: &Table,
        features: Table,
        params: &ScoreParams,
    ) -> Result<RawPredictResponse> {
        let hooks = self.hooks().cloned().unwrap_or_default();
        let model = self.model()?;
        let request_labels = if self.target_type.is_classification() {
            request_labels(
                params.class_labels.as_deref(),
                params.positive_class_label.as_deref(),
                params.negative_class_label.as_deref(),
            )
        } else {
            None
        };

        let (mut predictions, mut model_labels, extra_model_output) = match hooks.score.as_ref() {
            Some(score) => {
                let result = self.score_with_hook(score, data, model, params).map_err(|err| {
                    AdapterError::hook("Model 'score' hook failed to make predictions.", err)
                })?;
                let (predictions, extra) = split_predictions_and_extra_output(
                    &result,
                    request_labels.as_deref(),
                    self.target_name.as_deref(),
                )?;
                (
                    PredictionArray::from_table(&predictions)?,
                    Some(column_labels(&predictions)),
                    extra,
                )
            }
            None => {
                let predictor = self
                    .predictor
                    .as_ref()
                    .ok_or(AdapterError::NoPredictorAvailable)?;
                let (predictions, labels) = predictor
                    .predict(data, model, params)
                    .map_err(|err| AdapterError::hook("Failure when making predictions.", err))?;
                (predictions, labels, None)
            }
        };

        if let Some(post_process) = hooks.post_process.as_ref() {
            let marshalled = marshal_predictions(
                request_labels.as_deref(),
                &predictions,
                self.target_type,
                model_labels.as_deref(),
            )?;
            let processed = post_process(&marshalled, model).map_err(|err| {
                AdapterError::hook(
                    "Model 'post_process' hook failed to post-process predictions.",
                    err,
                )
            })?;
            predictions = PredictionArray::from_table(&processed)?;
            model_labels = Some(column_labels(&processed));
        }

        Ok(RawPredictResponse {
            predictions,
            model_labels,
            extra_model_output,
            features,
        })
    }

    fn score_with_hook(
        &self,
        score: &ScoreFn,
        data: &Table,
        model: &Model,
        params: &ScoreParams,
    ) -> anyhow::Result<Table> {
        let Some(pipeline) = &self.moderation else {
            return score(data, model, params);
        };
        let mut result = pipeline.score(data, model, score, params)?;
        if let Some(target) = self.target_name.as_deref()
            && !result.contains(target)
            && result.contains(MODERATION_COMPLETION_COLUMN)
        {
            result.rename_column(MODERATION_COMPLETION_COLUMN, target)?;
        }
        Ok(result)
    }

    /// Standalone transform for transform models. The target payload, if
    /// sent, is decoded without the read hook and passed through unchanged.
    pub fn transform(&self, request: &StructuredRequest) -> Result<(Table, Option<Table>)> {
        let data = self.load_data(
            &request.binary_data,
            &request.mimetype,
            true,
            request.sparse_colnames.as_deref(),
        )?;
        let target = match request.target_binary_data.as_deref() {
            Some(bytes) if !bytes.is_empty() => Some(self.load_data(
                bytes,
                request.target_mimetype.as_deref().unwrap_or_default(),
                false,
                None,
            )?),
            _ => None,
        };

        if let Some(task) = &self.task {
            let output = task.transform(&data).map_err(|err| {
                AdapterError::hook("Model 'transform' hook failed to transform dataset.", err)
            })?;
            validate_transform_rows(&output, &data)?;
            return Ok((output, target));
        }

        let model = self.model.as_ref();
        if let Some(transform) = self.hooks().and_then(|hooks| hooks.transform.as_ref()) {
            let output = transform(&data, model, target.as_ref()).map_err(|err| {
                AdapterError::hook("Model 'transform hook' failed to transform dataset.", err)
            })?;
            validate_transform_rows(&output, &data)?;
            return Ok((output, target));
        }

        if let Some(model) = model
            && let Some(transformer) = self.registry.find_transformer(model)
        {
            let output = transformer.transform(&data, model).map_err(|err| {
                AdapterError::hook("Model 'transform hook' failed to transform dataset.", err)
            })?;
            validate_transform_rows(&output, &data)?;
            return Ok((output, target));
        }

        Err(AdapterError::configuration(
            "Transform hook must be implemented for custom transforms, for models that are not \
             native transformers.",
        ))
    }

    pub fn predict_unstructured(&self, input: &UnstructuredInput) -> Result<UnstructuredOutput> {
        let score_unstructured = self
            .hooks()
            .and_then(|hooks| hooks.score_unstructured.as_ref())
            .ok_or_else(|| {
                AdapterError::configuration(format!(
                    "In '{}' mode hook '{}' must be provided.",
                    TargetType::Unstructured,
                    HookName::ScoreUnstructured
                ))
            })?;
        let output = score_unstructured(self.model()?, input).map_err(|err| {
            AdapterError::hook(
                "Model 'score_unstructured' hook failed to make predictions.",
                err,
            )
        })?;
        validate_unstructured_output(&output)?;
        Ok(output)
    }

    pub fn chat(&self, request: &Value, params: &ChatParams) -> Result<ChatResponse> {
        let chat = self
            .hooks()
            .and_then(|hooks| hooks.chat.as_ref())
            .ok_or_else(|| {
                AdapterError::configuration(
                    "This model's chat interface was called, but chat() is not implemented.",
                )
            })?;
        let model = self.model()?;
        let response = match &self.moderation {
            Some(pipeline) => pipeline.chat(request, model, chat, params),
            None => chat(request, model, params),
        };
        response.map_err(|err| AdapterError::hook("Model 'chat' hook failed.", err))
    }

    /// OpenAI-style model list: the hook's entries, else the configured LLM
    /// id, else nothing.
    pub fn get_supported_llm_models(&self) -> Result<Value> {
        let mut data = Vec::new();
        if let Some(hook) = self
            .hooks()
            .and_then(|hooks| hooks.get_supported_llm_models.as_ref())
        {
            debug!("get_supported_llm_models: using the hook");
            let listed = hook(self.model()?).map_err(|err| {
                AdapterError::hook("Model 'get_supported_llm_models' hook failed.", err)
            })?;
            data.extend(listed.into_iter().filter(is_openai_model));
        } else if let Some(llm_id) = &self.llm_id {
            debug!("get_supported_llm_models: returning the configured LLM id");
            data.push(json!({
                "id": llm_id,
                "object": "model",
                "created": LLM_ID_CREATED,
                "owned_by": LLM_OWNER,
            }));
        }
        Ok(json!({"object": "list", "data": data}))
    }

    /// Train through the task class or the `fit` hook.
    pub fn fit(&mut self, request: FitRequest) -> Result<()> {
        if let HookBinding::Task(task_class) = &self.binding {
            let mut task = task_class.create().map_err(|err| {
                AdapterError::hook("Custom task could not be instantiated.", err)
            })?;
            task.fit(&request)
                .map_err(|err| AdapterError::hook("Custom task 'fit' failed.", err))?;
            if let Err(err) = task.save(&self.model_dir) {
                tracing::error!(error = ?err, "saving custom task failed");
                return Err(AdapterError::serialization(
                    "An error occurred when saving your custom task. Ensure all state held by \
                     the task can be serialized or is excluded when saving",
                ));
            }
            self.task = Some(task);
            return Ok(());
        }

        let Some(fit) = self.hooks().and_then(|hooks| hooks.fit.clone()) else {
            let mut files: Vec<String> = fs::read_dir(&self.model_dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect();
            files.sort();
            files.truncate(100);
            let hooks = self.hooks().map(HookSet::describe).unwrap_or_default();
            return Err(AdapterError::configuration(format!(
                "fit() must be implemented by the module bound in '{}'. Files in this \
                 directory: {files:?}. Hooks the module provides: {hooks}",
                self.model_dir.display()
            )));
        };

        let request = if self.target_type == TargetType::Transform {
            request
        } else {
            FitRequest {
                features: self.preprocess(request.features, None)?,
                ..request
            }
        };
        fit(&request).map_err(|err| AdapterError::hook("Model 'fit' hook failed.", err))
    }
}

impl fmt::Debug for ModelAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelAdapter")
            .field("model_dir", &self.model_dir)
            .field("target_type", &self.target_type)
            .field("binding", &self.binding)
            .field("predictor", &self.predictor_name())
            .field("loaded", &(self.model.is_some() || self.task.is_some()))
            .finish()
    }
}

fn validate_transform_rows(output: &Table, data: &Table) -> Result<()> {
    if output.num_rows() != data.num_rows() {
        return Err(AdapterError::shape(
            "Transformation resulted in different number of rows than original data",
        ));
    }
    Ok(())
}

fn validate_unstructured_output(output: &UnstructuredOutput) -> Result<()> {
    let Some(kwargs) = &output.kwargs else {
        return Ok(());
    };
    for key in ["mimetype", "charset"] {
        if let Some(value) = kwargs.get(key)
            && !value.is_string()
        {
            return Err(AdapterError::serialization(format!(
                "In unstructured mode the '{key}' response option must be a string, but received {value}"
            )));
        }
    }
    Ok(())
}

/// Entries shaped like an OpenAI model object.
fn is_openai_model(entry: &Value) -> bool {
    entry.get("id").is_some_and(Value::is_string)
        && entry.get("object").and_then(Value::as_str) == Some("model")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FrameworkBackend;
    use crate::artifacts::FrameworkFamily;
    use crate::artifacts::FrameworkPrediction;
    use crate::codec::UnstructuredData;
    use crate::hooks::CustomTaskClass;
    use crate::hooks::HOOK_MANIFEST_FILE;
    use crate::hooks::UserModule;
    use anyhow::anyhow;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Weights(f64);

    fn weights_model() -> Model {
        Arc::new(Weights(2.0))
    }

    fn bind(
        module: UserModule,
        target_type: TargetType,
        target_name: Option<&str>,
    ) -> (TempDir, ModelAdapter) {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(HOOK_MANIFEST_FILE),
            format!("module = \"{}\"\n", module.name()),
        )
        .unwrap();
        let mut ctx = LoadContext::new();
        ctx.register(module);
        let mut adapter = ModelAdapter::new(
            temp.path(),
            target_type,
            target_name.map(str::to_string),
            PredictorRegistry::standard(),
        )
        .unwrap();
        adapter.load_custom_hooks(&mut ctx).unwrap();
        (temp, adapter)
    }

    fn loaded(module: UserModule, target_type: TargetType) -> (TempDir, ModelAdapter) {
        let (temp, mut adapter) = bind(
            module.with_load_model(|_| Ok(Some(weights_model()))),
            target_type,
            Some("y"),
        );
        adapter.load_model_from_artifact(false).unwrap();
        (temp, adapter)
    }

    fn doubling_score(data: &Table, model: &Model, _params: &ScoreParams) -> anyhow::Result<Table> {
        let factor = model
            .downcast_ref::<Weights>()
            .ok_or_else(|| anyhow!("unexpected model"))?
            .0;
        let values = data
            .column_as_f64("x")
            .ok_or_else(|| anyhow!("x must be numeric"))?
            .into_iter()
            .map(|x| json!(x * factor))
            .collect();
        Ok(Table::single("Predictions", values))
    }

    #[test]
    fn text_targets_need_a_target_name() {
        let err = ModelAdapter::new(
            "/tmp",
            TargetType::TextGeneration,
            Some(String::new()),
            PredictorRegistry::standard(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("empty target name"));
    }

    #[test]
    fn score_hook_predictions() {
        let (_temp, adapter) = loaded(
            UserModule::new("reg").with_score(doubling_score),
            TargetType::Regression,
        );
        let raw = adapter
            .predict(&StructuredRequest::new("x\n1\n2\n", "text/csv"))
            .unwrap();
        assert_eq!(
            raw.predictions,
            PredictionArray::from_rows(vec![vec![2.0], vec![4.0]]).unwrap()
        );
        assert_eq!(raw.model_labels, Some(vec![json!("Predictions")]));
        assert!(raw.extra_model_output.is_none());
        assert_eq!(adapter.model_info()["predictor"], Value::Null);
    }

    #[test]
    fn score_hook_extra_columns_are_split_off() {
        let module = UserModule::new("bin").with_score(|data, _model, _params| {
            let rows = data.num_rows();
            Ok(Table::from_columns([
                ("no", vec![json!(0.3); rows]),
                ("yes", vec![json!(0.7); rows]),
                ("explanation", vec![json!("high amount"); rows]),
            ])?)
        });
        let (_temp, adapter) = loaded(module, TargetType::Binary);
        let mut request = StructuredRequest::new("x\n1\n", "text/csv");
        request.params.positive_class_label = Some("yes".into());
        request.params.negative_class_label = Some("no".into());
        let raw = adapter.predict(&request).unwrap();
        assert_eq!(raw.model_labels, Some(vec![json!("no"), json!("yes")]));
        let extra = raw.extra_model_output.unwrap();
        assert_eq!(extra.column_names(), vec!["explanation"]);
    }

    #[test]
    fn post_process_sees_marshalled_predictions() {
        let module = UserModule::new("post")
            .with_score(doubling_score)
            .with_post_process(|table, _model| {
                let values = table
                    .column_as_f64("Predictions")
                    .ok_or_else(|| anyhow!("missing predictions"))?
                    .into_iter()
                    .map(|value| json!(value + 1.0))
                    .collect();
                Ok(Table::single("Predictions", values))
            });
        let (_temp, adapter) = loaded(module, TargetType::Regression);
        let raw = adapter
            .predict(&StructuredRequest::new("x\n1\n", "text/csv"))
            .unwrap();
        assert_eq!(raw.predictions, PredictionArray::from_rows(vec![vec![3.0]]).unwrap());
    }

    #[test]
    fn read_input_data_hook_takes_priority() {
        let module = UserModule::new("reader")
            .with_read_input_data(|bytes| {
                let x = std::str::from_utf8(bytes)?.trim().parse::<f64>()?;
                Ok(Table::single("x", vec![json!(x)]))
            })
            .with_score(doubling_score);
        let (_temp, adapter) = loaded(module, TargetType::Regression);
        assert!(adapter.has_read_input_data_hook());
        let raw = adapter
            .predict(&StructuredRequest::new("21", "application/x-custom"))
            .unwrap();
        assert_eq!(raw.predictions, PredictionArray::from_rows(vec![vec![42.0]]).unwrap());
    }

    #[test]
    fn score_hook_failures_keep_the_cause() {
        let module =
            UserModule::new("broken").with_score(|_, _, _| Err(anyhow!("division by zero")));
        let (_temp, adapter) = loaded(module, TargetType::Regression);
        let err = adapter
            .predict(&StructuredRequest::new("x\n1\n", "text/csv"))
            .unwrap_err();
        assert!(matches!(err, AdapterError::Hook { .. }));
        assert!(err.to_string().contains("Model 'score' hook failed to make predictions."));
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn load_model_returning_nothing_is_an_error() {
        let (_temp, mut adapter) = bind(
            UserModule::new("empty").with_load_model(|_| Ok(None)),
            TargetType::Regression,
            None,
        );
        let err = adapter.load_model_from_artifact(false).unwrap_err();
        assert!(err.to_string().contains("None is returned"));
    }

    #[test]
    fn missing_predictor_without_score_hook_fails() {
        let (_temp, mut adapter) = bind(
            UserModule::new("loader").with_load_model(|_| Ok(Some(weights_model()))),
            TargetType::Regression,
            None,
        );
        let err = adapter.load_model_from_artifact(false).unwrap_err();
        assert!(matches!(err, AdapterError::NoPredictorAvailable));
        assert!(adapter.load_model_from_artifact(true).is_ok());
    }

    struct LinearBackend;

    impl FrameworkBackend for LinearBackend {
        fn load(&self, _path: &Path) -> anyhow::Result<Model> {
            Ok(weights_model())
        }

        fn can_use(&self, model: &Model) -> bool {
            model.downcast_ref::<Weights>().is_some()
        }

        fn predict(
            &self,
            data: &Table,
            model: &Model,
            params: &ScoreParams,
        ) -> anyhow::Result<FrameworkPrediction> {
            let table = doubling_score(data, model, params)?;
            Ok((PredictionArray::from_table(&table)?, None))
        }
    }

    #[test]
    fn framework_predictor_scores_artifacts() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("model.joblib"), b"weights").unwrap();
        let mut registry = PredictorRegistry::standard();
        registry.install(FrameworkFamily::SkLearn, Arc::new(LinearBackend));
        let mut adapter =
            ModelAdapter::new(temp.path(), TargetType::Regression, None, registry).unwrap();
        adapter
            .load_custom_hooks(&mut LoadContext::new())
            .unwrap();
        adapter.load_model_from_artifact(false).unwrap();
        assert_eq!(adapter.predictor_name(), Some("scikit-learn"));
        let raw = adapter
            .predict(&StructuredRequest::new("x\n5\n", "text/csv"))
            .unwrap();
        assert_eq!(raw.predictions, PredictionArray::from_rows(vec![vec![10.0]]).unwrap());
        assert_eq!(adapter.model_info()["predictor"], json!("scikit-learn"));
    }

    #[test]
    fn moderation_renames_completion_column() {
        struct Passthrough;

        impl ModerationPipeline for Passthrough {
            fn score(
                &self,
                data: &Table,
                model: &Model,
                score: &ScoreFn,
                params: &ScoreParams,
            ) -> anyhow::Result<Table> {
                let mut result = score(data, model, params)?;
                result.rename_column("answer", "completion")?;
                Ok(result)
            }

            fn chat(
                &self,
                request: &Value,
                model: &Model,
                chat: &ChatFn,
                params: &ChatParams,
            ) -> anyhow::Result<ChatResponse> {
                chat(request, model, params)
            }
        }

        let module = UserModule::new("llm").with_score(|data, _model, _params| {
            Ok(Table::single("answer", vec![json!("hello"); data.num_rows()]))
        });
        let (_temp, adapter) = loaded(module, TargetType::TextGeneration);
        let adapter = adapter.with_moderation(Arc::new(Passthrough));
        let raw = adapter
            .predict(&StructuredRequest::new("promptText\nhi\n", "text/csv"))
            .unwrap();
        assert_eq!(raw.model_labels, Some(vec![json!("y")]));
    }

    #[test]
    fn transform_validates_rows_and_passes_target_through() {
        let module = UserModule::new("scaler").with_transform(|data, _model, target| {
            assert!(target.is_some());
            let values = data
                .column_as_f64("x")
                .ok_or_else(|| anyhow!("x must be numeric"))?
                .into_iter()
                .map(|x| json!(x / 10.0))
                .collect();
            Ok(Table::single("x_scaled", values))
        });
        let (_temp, adapter) = loaded(module, TargetType::Transform);
        let mut request = StructuredRequest::new("x\n10\n20\n", "text/csv");
        request.target_binary_data = Some(b"y\n0\n1\n".to_vec());
        request.target_mimetype = Some("text/csv".into());
        let (features, target) = adapter.transform(&request).unwrap();
        assert_eq!(features.column_as_f64("x_scaled"), Some(vec![1.0, 2.0]));
        assert_eq!(target.unwrap().column_as_f64("y"), Some(vec![0.0, 1.0]));

        let dropping =
            UserModule::new("dropper").with_transform(|_, _, _| Ok(Table::single("x", vec![])));
        let (_temp, adapter) = loaded(dropping, TargetType::Transform);
        let err = adapter
            .transform(&StructuredRequest::new("x\n1\n", "text/csv"))
            .unwrap_err();
        assert!(err.to_string().contains("different number of rows"));
    }

    #[test]
    fn transform_without_hook_needs_native_transformer() {
        let (_temp, mut adapter) = bind(
            UserModule::new("plain").with_load_model(|_| Ok(Some(weights_model()))),
            TargetType::Transform,
            None,
        );
        let err = adapter.load_model_from_artifact(false).unwrap_err();
        assert!(err.to_string().contains("requires a user-defined transform hook"));
    }

    #[test]
    fn unstructured_scoring() {
        let module = UserModule::new("echo").with_score_unstructured(|_model, input| {
            let UnstructuredData::Text(text) = &input.data else {
                anyhow::bail!("expected text");
            };
            Ok(UnstructuredOutput::text(text.to_uppercase()).with_option("mimetype", "text/plain"))
        });
        let (_temp, adapter) = loaded(module, TargetType::Unstructured);
        let input = UnstructuredInput {
            data: UnstructuredData::Text("ping".into()),
            mimetype: "text/plain".into(),
            charset: Some("utf8".into()),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
        };
        let output = adapter.predict_unstructured(&input).unwrap();
        assert_eq!(output.data, Some(UnstructuredData::Text("PING".into())));

        let bad = UserModule::new("bad").with_score_unstructured(|_, _| {
            Ok(UnstructuredOutput::text("x").with_option("mimetype", 5))
        });
        let (_temp, adapter) = loaded(bad, TargetType::Unstructured);
        assert!(adapter.predict_unstructured(&input).is_err());
    }

    #[test]
    fn supported_llm_models_sources() {
        let module = UserModule::new("models")
            .with_score(|data, _, _| Ok(data.clone()))
            .with_supported_llm_models(|_| {
                Ok(vec![
                    json!({"id": "gpt-x", "object": "model", "created": 1, "owned_by": "me"}),
                    json!({"name": "not a model"}),
                ])
            });
        let (_temp, adapter) = loaded(module, TargetType::TextGeneration);
        let listed = adapter.get_supported_llm_models().unwrap();
        assert_eq!(listed["object"], "list");
        assert_eq!(listed["data"].as_array().unwrap().len(), 1);

        let plain = UserModule::new("plain-llm").with_score(|data, _, _| Ok(data.clone()));
        let (_temp, adapter) = loaded(plain, TargetType::TextGeneration);
        assert_eq!(
            adapter.get_supported_llm_models().unwrap(),
            json!({"object": "list", "data": []})
        );
        let adapter = adapter.with_llm_id(Some("azure-gpt".into()));
        let listed = adapter.get_supported_llm_models().unwrap();
        assert_eq!(listed["data"][0]["id"], "azure-gpt");
        assert_eq!(listed["data"][0]["created"], LLM_ID_CREATED);
    }

    #[test]
    fn fit_without_hook_lists_available_hooks() {
        let (temp, mut adapter) = bind(
            UserModule::new("scorer").with_score(|data, _, _| Ok(data.clone())),
            TargetType::Regression,
            None,
        );
        let err = adapter
            .fit(FitRequest {
                features: Table::single("x", vec![json!(1)]),
                target: Some(vec![json!(2)]),
                output_dir: temp.path().to_path_buf(),
                class_order: None,
                row_weights: None,
                parameters: None,
            })
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("score: true"));
        assert!(message.contains("fit: false"));
        assert!(message.contains(HOOK_MANIFEST_FILE));
    }

    struct ConstantTask {
        fitted: bool,
        fail_save: bool,
    }

    impl CustomTask for ConstantTask {
        fn fit(&mut self, _request: &FitRequest) -> anyhow::Result<()> {
            self.fitted = true;
            Ok(())
        }

        fn save(&self, _dir: &Path) -> anyhow::Result<()> {
            if self.fail_save {
                anyhow::bail!("cannot serialize socket handle");
            }
            Ok(())
        }

        fn predict(&self, data: &Table, _params: &ScoreParams) -> anyhow::Result<Table> {
            Ok(Table::single("Predictions", vec![json!(1.0); data.num_rows()]))
        }

        fn predict_proba(&self, data: &Table, _params: &ScoreParams) -> anyhow::Result<Table> {
            let rows = data.num_rows();
            Ok(Table::from_columns([
                ("no", vec![json!(0.25); rows]),
                ("yes", vec![json!(0.75); rows]),
            ])?)
        }
    }

    struct ConstantTaskClass {
        fail_save: bool,
        loaded: Arc<AtomicBool>,
    }

    impl CustomTaskClass for ConstantTaskClass {
        fn create(&self) -> anyhow::Result<Box<dyn CustomTask>> {
            Ok(Box::new(ConstantTask {
                fitted: false,
                fail_save: self.fail_save,
            }))
        }

        fn load(&self, _dir: &Path) -> anyhow::Result<Box<dyn CustomTask>> {
            self.loaded.store(true, Ordering::SeqCst);
            Ok(Box::new(ConstantTask {
                fitted: true,
                fail_save: false,
            }))
        }
    }

    fn fit_request(dir: &Path) -> FitRequest {
        FitRequest {
            features: Table::single("x", vec![json!(1)]),
            target: Some(vec![json!("yes")]),
            output_dir: dir.to_path_buf(),
            class_order: Some(vec!["no".into(), "yes".into()]),
            row_weights: None,
            parameters: None,
        }
    }

    #[test]
    fn task_class_predicts_probabilities() {
        let loaded_flag = Arc::new(AtomicBool::new(false));
        let module = UserModule::new("task").with_task_class(ConstantTaskClass {
            fail_save: false,
            loaded: Arc::clone(&loaded_flag),
        });
        let (temp, mut adapter) = bind(module, TargetType::Binary, None);
        assert!(adapter.is_custom_task_class());
        adapter.fit(fit_request(temp.path())).unwrap();
        adapter.load_model_from_artifact(false).unwrap();
        assert!(loaded_flag.load(Ordering::SeqCst));

        let raw = adapter
            .predict(&StructuredRequest::new("x\n1\n", "text/csv"))
            .unwrap();
        assert_eq!(raw.model_labels, Some(vec![json!("no"), json!("yes")]));
        assert_eq!(raw.predictions, PredictionArray::from_rows(vec![vec![0.25, 0.75]]).unwrap());
    }

    #[test]
    fn task_save_failures_are_serialization_errors() {
        let module = UserModule::new("leaky").with_task_class(ConstantTaskClass {
            fail_save: true,
            loaded: Arc::new(AtomicBool::new(false)),
        });
        let (temp, mut adapter) = bind(module, TargetType::Binary, None);
        let err = adapter.fit(fit_request(temp.path())).unwrap_err();
        assert!(matches!(err, AdapterError::Serialization { .. }));
    }
}
