//! Server-agnostic request dispatch. An HTTP layer turns its request into an
//! [`InboundRequest`], picks a [`Route`] and writes back the
//! [`ServiceResponse`].

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::adapter::StructuredRequest;
use crate::chat::ChatOutcome;
use crate::chat::ChatStream;
use crate::codec::MultipartBody;
use crate::codec::SPARSE_COLNAMES;
use crate::codec::SseEvents;
use crate::codec::UnstructuredInput;
use crate::codec::encode_predictions_json;
use crate::codec::encode_transform_response;
use crate::codec::mimetypes;
use crate::codec::parse_content_type;
use crate::codec::read_sparse_column_names;
use crate::codec::resolve_incoming_unstructured;
use crate::codec::resolve_mimetype_by_filename;
use crate::codec::resolve_outgoing_unstructured;
use crate::codec::sse_events;
use crate::error::AdapterError;
use crate::error::Result;
use crate::predictor::Predictor;
use crate::target_type::TargetType;

pub const HTTP_200_OK: u16 = 200;
pub const HTTP_404_NOT_FOUND: u16 = 404;
pub const HTTP_422_UNPROCESSABLE_ENTITY: u16 = 422;
pub const HTTP_500_INTERNAL_SERVER_ERROR: u16 = 500;

const FEATURES_KEY: &str = "X";
const TARGET_KEY: &str = "y";

/// An uploaded form-data file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormFile {
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

impl FormFile {
    pub fn new(filename: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: Some(filename.into()),
            data: data.into(),
        }
    }
}

/// The parts of an HTTP request the service looks at.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub files: BTreeMap<String, FormFile>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    /// Pre-parsed JSON body, if the server already decoded it.
    pub json: Option<Value>,
}

impl InboundRequest {
    pub fn with_file(mut self, key: &str, file: FormFile) -> Self {
        self.files.insert(key.to_string(), file);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>, content_type: Option<&str>) -> Self {
        self.body = body.into();
        self.content_type = content_type.map(str::to_string);
        self
    }

    pub fn with_json(mut self, json: Value) -> Self {
        self.json = Some(json);
        self
    }

    fn json_body(&self) -> Result<Value> {
        if let Some(json) = &self.json {
            return Ok(json.clone());
        }
        serde_json::from_slice(&self.body)
            .map_err(|err| AdapterError::payload(format!("request body is not valid JSON: {err}")))
    }
}

pub enum ResponseBody {
    Json(Value),
    Raw {
        data: Vec<u8>,
        content_type: Option<String>,
    },
    Multipart(MultipartBody),
    /// Server-sent events, pulled lazily by the server.
    EventStream(SseEvents<ChatStream>),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Raw { data, content_type } => f
                .debug_struct("Raw")
                .field("len", &data.len())
                .field("content_type", content_type)
                .finish(),
            Self::Multipart(body) => f.debug_tuple("Multipart").field(body).finish(),
            Self::EventStream(_) => f.write_str("EventStream"),
        }
    }
}

#[derive(Debug)]
pub struct ServiceResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl ServiceResponse {
    pub fn ok(body: ResponseBody) -> Self {
        Self {
            status: HTTP_200_OK,
            body,
        }
    }

    pub fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            body: ResponseBody::Json(value),
        }
    }

    fn message(status: u16, message: &str) -> Self {
        Self::json(status, json!({"message": format!("ERROR: {message}")}))
    }

    /// Map an adapter failure to its status and error document.
    pub fn from_error(err: &AdapterError) -> Self {
        if err.is_schema_validation() {
            return Self::json(
                HTTP_422_UNPROCESSABLE_ENTITY,
                json!({"message": format!("ERROR: {err}"), "is_schema_validation_error": true}),
            );
        }
        let status = if err.is_client_error() {
            HTTP_422_UNPROCESSABLE_ENTITY
        } else {
            HTTP_500_INTERNAL_SERVER_ERROR
        };
        Self::message(status, &err.to_string())
    }

    pub fn content_type(&self) -> Option<String> {
        match &self.body {
            ResponseBody::Json(_) => Some(mimetypes::APPLICATION_JSON.to_string()),
            ResponseBody::Raw { content_type, .. } => content_type.clone(),
            ResponseBody::Multipart(body) => Some(body.content_type()),
            ResponseBody::EventStream(_) => Some(mimetypes::TEXT_EVENT_STREAM.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == HTTP_200_OK
    }
}

/// Endpoints the service answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Ping,
    Health,
    Info,
    Capabilities,
    Predict,
    Transform,
    PredictUnstructured,
    Chat,
    SupportedLlmModels,
}

impl Route {
    /// Match a request path, with or without surrounding slashes.
    pub fn from_path(path: &str) -> Option<Self> {
        let route = match path.trim_matches('/') {
            "" | "ping" => Self::Ping,
            "health" => Self::Health,
            "info" => Self::Info,
            "capabilities" => Self::Capabilities,
            "predict" | "predictions" => Self::Predict,
            "transform" => Self::Transform,
            "predictUnstructured" | "predictionsUnstructured" => Self::PredictUnstructured,
            "chat/completions" | "v1/chat/completions" => Self::Chat,
            "models" | "v1/models" => Self::SupportedLlmModels,
            _ => return None,
        };
        Some(route)
    }
}

/// Dispatches requests to a [`Predictor`].
#[derive(Debug)]
pub struct PredictionService {
    predictor: Predictor,
}

impl PredictionService {
    pub fn new(predictor: Predictor) -> Self {
        Self { predictor }
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }

    fn target_type(&self) -> TargetType {
        self.predictor.target_type()
    }

    pub fn handle(&self, route: Route, request: &InboundRequest) -> ServiceResponse {
        match route {
            Route::Ping | Route::Health => {
                ServiceResponse::json(HTTP_200_OK, json!({"message": "OK"}))
            }
            Route::Info => {
                ServiceResponse::json(HTTP_200_OK, Value::Object(self.predictor.model_info()))
            }
            Route::Capabilities => ServiceResponse::json(HTTP_200_OK, self.capabilities()),
            Route::Predict => self.predict_structured(request),
            Route::Transform => self.transform(request),
            Route::PredictUnstructured => self.predict_unstructured(request),
            Route::Chat => self.chat(request),
            Route::SupportedLlmModels => self.supported_llm_models(),
        }
    }

    pub fn capabilities(&self) -> Value {
        json!({
            "supported_payload_formats": self.predictor.supported_payload_formats().to_json(),
            "supported_methods": {"chat": self.predictor.supports_chat()},
        })
    }

    pub fn predict_structured(&self, request: &InboundRequest) -> ServiceResponse {
        let target_type = self.target_type();
        let endpoint = match target_type {
            TargetType::Transform => Some("/transform/"),
            TargetType::Unstructured => Some("/predictUnstructured/ or /predictionsUnstructured/"),
            _ => None,
        };
        if let Some(endpoint) = endpoint {
            let message =
                format!("This model has target type '{target_type}', use the {endpoint} endpoint.");
            error!("{message}");
            return ServiceResponse::message(HTTP_422_UNPROCESSABLE_ENTITY, &message);
        }

        let structured = match self.structured_request(request, false) {
            Ok(Ok(structured)) => structured,
            Ok(Err(rejection)) => return rejection,
            Err(err) => return ServiceResponse::from_error(&err),
        };

        match self.predictor.predict(structured) {
            Ok(response) => ServiceResponse::ok(ResponseBody::Json(encode_predictions_json(
                &response.predictions,
                response.extra_model_output.as_ref(),
            ))),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    pub fn transform(&self, request: &InboundRequest) -> ServiceResponse {
        let target_type = self.target_type();
        if target_type != TargetType::Transform {
            let endpoint = if target_type == TargetType::Unstructured {
                "predictUnstructured"
            } else {
                "predict"
            };
            let message =
                format!("This model has target type {target_type}, use the /{endpoint}/ endpoint.");
            error!("{message}");
            return ServiceResponse::message(HTTP_422_UNPROCESSABLE_ENTITY, &message);
        }

        let structured = match self.structured_request(request, true) {
            Ok(Ok(structured)) => structured,
            Ok(Err(rejection)) => return rejection,
            Err(err) => return ServiceResponse::from_error(&err),
        };

        let result = self
            .predictor
            .transform(&structured)
            .and_then(|(features, target)| encode_transform_response(&features, target.as_ref()));
        match result {
            Ok(body) => ServiceResponse::ok(ResponseBody::Multipart(body)),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    /// Gather the features (and, for transform, the optional target) of a
    /// structured request. The inner `Err` is a ready-made rejection.
    fn structured_request(
        &self,
        request: &InboundRequest,
        with_target: bool,
    ) -> Result<std::result::Result<StructuredRequest, ServiceResponse>> {
        let (data, mimetype) = fetch_data(request, FEATURES_KEY)?;
        let sparse_colnames = match request.files.get(SPARSE_COLNAMES) {
            Some(file) if !file.data.is_empty() => Some(read_sparse_column_names(&file.data)?),
            _ => None,
        };
        if let Some(rejection) = self.check_mimetype_support(&mimetype) {
            return Ok(Err(rejection));
        }

        let mut structured = StructuredRequest::new(data, mimetype);
        structured.sparse_colnames = sparse_colnames;

        if with_target && request.files.contains_key(TARGET_KEY) {
            let (target, target_mimetype) = fetch_data(request, TARGET_KEY)?;
            if let Some(rejection) = self.check_mimetype_support(&target_mimetype) {
                return Ok(Err(rejection));
            }
            structured.target_binary_data = Some(target);
            structured.target_mimetype = Some(target_mimetype);
        }
        Ok(Ok(structured))
    }

    fn check_mimetype_support(&self, mimetype: &str) -> Option<ServiceResponse> {
        if self
            .predictor
            .supported_payload_formats()
            .is_mimetype_supported(mimetype)
            || self.predictor.has_read_input_data_hook()
        {
            return None;
        }
        Some(ServiceResponse::json(
            HTTP_422_UNPROCESSABLE_ENTITY,
            json!({
                "message": format!(
                    "ERROR: payload format `{mimetype}` is not supported by predictor/transformer. \
                     Make modelhost support the format or implement `read_input_data` hook to read the data. "
                )
            }),
        ))
    }

    pub fn predict_unstructured(&self, request: &InboundRequest) -> ServiceResponse {
        let target_type = self.target_type();
        if !matches!(target_type, TargetType::Unstructured | TargetType::TextGeneration) {
            let message = format!(
                "This model has target type {target_type}, use either /predict/ or /predictions/ endpoint."
            );
            error!("{message}");
            return ServiceResponse::message(HTTP_422_UNPROCESSABLE_ENTITY, &message);
        }
        match self.run_unstructured(request) {
            Ok(response) => response,
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    fn run_unstructured(&self, request: &InboundRequest) -> Result<ServiceResponse> {
        let (mimetype, charset) = parse_content_type(request.content_type.as_deref());
        let (data, mimetype, charset) =
            resolve_incoming_unstructured(request.body.clone(), &mimetype, charset.as_deref())?;
        let input = UnstructuredInput {
            data,
            mimetype,
            charset,
            query: request.query.clone(),
            headers: request.headers.clone(),
        };

        let output = self.predictor.predict_unstructured(&input)?;
        let (data, mimetype, charset) = resolve_outgoing_unstructured(&output)?;
        let content_type = mimetype.map(|mimetype| match charset {
            Some(charset) => format!("{mimetype}; charset={charset}"),
            None => mimetype,
        });
        Ok(ServiceResponse::ok(ResponseBody::Raw { data, content_type }))
    }

    pub fn chat(&self, request: &InboundRequest) -> ServiceResponse {
        if !self.predictor.supports_chat() {
            let message = if matches!(
                self.target_type(),
                TargetType::TextGeneration | TargetType::AgenticWorkflow
            ) {
                "This model's chat interface was called, but chat() is not implemented."
            } else {
                "This model's chat interface was called, but chat is not supported."
            };
            error!("{message}");
            return ServiceResponse::message(HTTP_404_NOT_FOUND, message);
        }

        let outcome = request
            .json_body()
            .and_then(|body| self.predictor.chat(&body, request.headers.clone()));
        match outcome {
            Ok(ChatOutcome::Completion(completion)) => {
                ServiceResponse::ok(ResponseBody::Json(completion))
            }
            Ok(ChatOutcome::Stream(stream)) => {
                debug!(association_id = %stream.association_id(), "streaming chat response");
                ServiceResponse::ok(ResponseBody::EventStream(sse_events(stream)))
            }
            Err(err) => ServiceResponse::from_error(&err),
        }
    }

    pub fn supported_llm_models(&self) -> ServiceResponse {
        if self.target_type() != TargetType::TextGeneration {
            let message = "get_supported_llm_models is supported only for TextGen models";
            warn!("{message}");
            return ServiceResponse::message(HTTP_404_NOT_FOUND, message);
        }
        match self.predictor.get_supported_llm_models() {
            Ok(models) => ServiceResponse::ok(ResponseBody::Json(models)),
            Err(err) => ServiceResponse::from_error(&err),
        }
    }
}

/// Payload under `key` as a form file, or for features the raw body.
fn fetch_data(request: &InboundRequest, key: &str) -> Result<(Vec<u8>, String)> {
    if let Some(file) = request.files.get(key) {
        debug!(key, filename = ?file.filename, "payload provided as form data");
        let mimetype = resolve_mimetype_by_filename(file.filename.as_deref());
        return Ok((file.data.clone(), mimetype.to_string()));
    }
    if key == FEATURES_KEY && !request.body.is_empty() {
        let (mimetype, _charset) = parse_content_type(request.content_type.as_deref());
        return Ok((request.body.clone(), mimetype));
    }
    let message = format!(
        "Samples should be provided as:   - a csv or mtx under `{key}` form-data param key.  - binary data"
    );
    error!("{message}");
    Err(AdapterError::payload(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ModelAdapter;
    use crate::artifacts::Model;
    use crate::artifacts::PredictorRegistry;
    use crate::chat::CHAT_COMPLETION;
    use crate::chat::CHAT_COMPLETION_CHUNK;
    use crate::chat::ChatResponse;
    use crate::codec::UnstructuredOutput;
    use crate::codec::X_TRANSFORM_KEY;
    use crate::codec::Y_TRANSFORM_KEY;
    use crate::config::RunnerConfig;
    use crate::hooks::HOOK_MANIFEST_FILE;
    use crate::hooks::LoadContext;
    use crate::hooks::UserModule;
    use crate::table::Table;
    use anyhow::anyhow;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Stub;

    fn service(module: UserModule, config: RunnerConfig) -> (TempDir, PredictionService) {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(HOOK_MANIFEST_FILE),
            format!("module = \"{}\"\n", module.name()),
        )
        .unwrap();
        let mut ctx = LoadContext::new();
        ctx.register(module.with_load_model(|_| Ok(Some(Arc::new(Stub) as Model))));
        let mut adapter = ModelAdapter::new(
            temp.path(),
            config.target_type().unwrap(),
            config.target_name.clone(),
            PredictorRegistry::standard(),
        )
        .unwrap();
        adapter.load_custom_hooks(&mut ctx).unwrap();
        adapter.load_model_from_artifact(false).unwrap();
        let predictor = Predictor::new(adapter, &config, None).unwrap();
        (temp, PredictionService::new(predictor))
    }

    fn target(target_type: TargetType) -> RunnerConfig {
        RunnerConfig {
            target_type: Some(target_type),
            ..RunnerConfig::default()
        }
    }

    fn text_target(target_type: TargetType) -> RunnerConfig {
        RunnerConfig {
            target_name: Some("completion".into()),
            ..target(target_type)
        }
    }

    fn regression() -> (TempDir, PredictionService) {
        let module = UserModule::new("reg").with_score(|data, _model, _params| {
            let values = data
                .column_as_f64("x")
                .ok_or_else(|| anyhow!("x must be numeric"))?
                .into_iter()
                .map(|x| json!(x * 2.0))
                .collect();
            Ok(Table::single("Predictions", values))
        });
        service(module, target(TargetType::Regression))
    }

    fn json_of(response: &ServiceResponse) -> &Value {
        match &response.body {
            ResponseBody::Json(value) => value,
            other => panic!("expected a JSON body, got {other:?}"),
        }
    }

    #[test]
    fn routes_resolve_from_paths() {
        assert_eq!(Route::from_path("/predictions/"), Some(Route::Predict));
        assert_eq!(Route::from_path("predictUnstructured"), Some(Route::PredictUnstructured));
        assert_eq!(Route::from_path("/v1/chat/completions"), Some(Route::Chat));
        assert_eq!(Route::from_path("/"), Some(Route::Ping));
        assert_eq!(Route::from_path("/train/"), None);
    }

    #[test]
    fn predicts_from_form_file_and_raw_body() {
        let (_temp, service) = regression();
        let form = InboundRequest::default().with_file("X", FormFile::new("X.csv", "x\n1\n2\n"));
        let response = service.handle(Route::Predict, &form);
        assert_eq!(response.status, HTTP_200_OK);
        assert_eq!(json_of(&response), &json!({"predictions": [2.0, 4.0]}));

        let raw = InboundRequest::default().with_body("x\n3\n", Some("text/csv; charset=utf-8"));
        let response = service.predict_structured(&raw);
        assert_eq!(json_of(&response)["predictions"], json!([6.0]));
    }

    #[test]
    fn missing_payload_is_a_client_error() {
        let (_temp, service) = regression();
        let response = service.predict_structured(&InboundRequest::default());
        assert_eq!(response.status, HTTP_422_UNPROCESSABLE_ENTITY);
        let message = json_of(&response)["message"].as_str().unwrap();
        assert!(message.starts_with("ERROR: Samples should be provided as:"));
    }

    #[test]
    fn unsupported_mimetype_is_rejected() {
        let (_temp, service) = regression();
        let request = InboundRequest::default().with_body("{}", Some("application/x-parquet"));
        let response = service.predict_structured(&request);
        assert_eq!(response.status, HTTP_422_UNPROCESSABLE_ENTITY);
        assert!(
            json_of(&response)["message"]
                .as_str()
                .unwrap()
                .contains("payload format `application/x-parquet` is not supported")
        );
    }

    #[test]
    fn hook_failures_are_server_errors() {
        let module = UserModule::new("broken").with_score(|_, _, _| Err(anyhow!("boom")));
        let (_temp, service) = service(module, target(TargetType::Regression));
        let request = InboundRequest::default().with_body("x\n1\n", Some("text/csv"));
        let response = service.predict_structured(&request);
        assert_eq!(response.status, HTTP_500_INTERNAL_SERVER_ERROR);
        assert!(json_of(&response)["message"].as_str().unwrap().contains("boom"));
    }

    #[test]
    fn wrong_endpoints_name_the_right_one() {
        let module = UserModule::new("scaler")
            .with_transform(|data, _model, _target| Ok(data.clone()));
        let (_temp, transformer) = service(module, target(TargetType::Transform));
        let response = transformer.predict_structured(&InboundRequest::default());
        assert_eq!(response.status, HTTP_422_UNPROCESSABLE_ENTITY);
        assert_eq!(
            json_of(&response)["message"],
            json!("ERROR: This model has target type 'transform', use the /transform/ endpoint.")
        );

        let (_temp, regressor) = regression();
        let response = regressor.transform(&InboundRequest::default());
        assert_eq!(
            json_of(&response)["message"],
            json!("ERROR: This model has target type regression, use the /predict/ endpoint.")
        );
        let response = regressor.predict_unstructured(&InboundRequest::default());
        assert_eq!(response.status, HTTP_422_UNPROCESSABLE_ENTITY);
        assert!(json_of(&response)["message"].as_str().unwrap().contains("use either /predict/"));
    }

    #[test]
    fn transform_returns_multipart_with_target() {
        let module = UserModule::new("scaler").with_transform(|data, _model, _target| {
            let values = data
                .column_as_f64("x")
                .ok_or_else(|| anyhow!("x must be numeric"))?
                .into_iter()
                .map(|x| json!(x / 10.0))
                .collect();
            Ok(Table::single("x", values))
        });
        let (_temp, service) = service(module, target(TargetType::Transform));
        let request = InboundRequest::default()
            .with_file("X", FormFile::new("X.csv", "x\n10\n20\n"))
            .with_file("y", FormFile::new("y.csv", "y\n1\n0\n"));
        let response = service.transform(&request);
        assert_eq!(response.status, HTTP_200_OK);
        let ResponseBody::Multipart(body) = &response.body else {
            panic!("expected multipart");
        };
        assert_eq!(body.part(X_TRANSFORM_KEY).unwrap().data, b"x\r\n1.0\r\n2.0".to_vec());
        assert!(body.part(Y_TRANSFORM_KEY).is_some());
        assert!(response.content_type().unwrap().starts_with("multipart/form-data; boundary="));
    }

    #[test]
    fn transform_schema_failures_are_flagged() {
        let module = UserModule::new("wide")
            .with_transform(|data, _model, _target| Ok(data.clone()));
        let config = RunnerConfig {
            type_schema: Some(json!({
                "output_requirements": [
                    {"field": "number_of_columns", "condition": "GREATER_THAN", "value": 5}
                ]
            })),
            ..target(TargetType::Transform)
        };
        let (_temp, service) = service(module, config);
        let request = InboundRequest::default().with_body("x\n1\n", Some("text/csv"));
        let response = service.transform(&request);
        assert_eq!(response.status, HTTP_422_UNPROCESSABLE_ENTITY);
        assert_eq!(json_of(&response)["is_schema_validation_error"], json!(true));
    }

    #[test]
    fn unstructured_round_trip_sets_content_type() {
        let module = UserModule::new("echo").with_score_unstructured(|_model, input| {
            assert_eq!(input.query.get("lang").map(String::as_str), Some("en"));
            let crate::codec::UnstructuredData::Text(text) = &input.data else {
                anyhow::bail!("expected text");
            };
            Ok(UnstructuredOutput::text(text.to_uppercase()).with_option("mimetype", "text/plain"))
        });
        let (_temp, service) = service(module, target(TargetType::Unstructured));
        let mut request = InboundRequest::default().with_body("hello", Some("text/plain"));
        request.query.insert("lang".into(), "en".into());
        let response = service.handle(Route::PredictUnstructured, &request);
        assert_eq!(response.status, HTTP_200_OK);
        let ResponseBody::Raw { data, content_type } = &response.body else {
            panic!("expected a raw body");
        };
        assert_eq!(data, b"HELLO");
        assert_eq!(content_type.as_deref(), Some("text/plain; charset=utf8"));
    }

    #[test]
    fn chat_without_hook_is_not_found() {
        let module = UserModule::new("plain").with_score(|data, _model, _params| {
            Ok(Table::single("completion", vec![json!("x"); data.num_rows()]))
        });
        let (_temp, textgen) = service(module, text_target(TargetType::TextGeneration));
        let response = textgen.chat(&InboundRequest::default());
        assert_eq!(response.status, HTTP_404_NOT_FOUND);
        assert!(
            json_of(&response)["message"]
                .as_str()
                .unwrap()
                .contains("chat() is not implemented")
        );

        let (_temp, regressor) = regression();
        let response = regressor.chat(&InboundRequest::default());
        assert!(json_of(&response)["message"].as_str().unwrap().contains("chat is not supported"));
        assert_eq!(regressor.capabilities()["supported_methods"], json!({"chat": false}));
    }

    #[test]
    fn chat_streams_server_sent_events() {
        let module = UserModule::new("streamer").with_chat(|_request, _model, _params| {
            let chunks = ["Hel", "lo"].map(|part| {
                Ok(json!({
                    "object": CHAT_COMPLETION_CHUNK,
                    "choices": [{"index": 0, "delta": {"content": part}}]
                }))
            });
            Ok(ChatResponse::stream(chunks))
        });
        let (_temp, service) = service(module, text_target(TargetType::TextGeneration));
        let request = InboundRequest::default().with_json(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }));
        let response = service.handle(Route::Chat, &request);
        assert_eq!(response.content_type().as_deref(), Some(mimetypes::TEXT_EVENT_STREAM));
        let ResponseBody::EventStream(events) = response.body else {
            panic!("expected an event stream");
        };
        let events: Vec<String> = events.map(|event| event.unwrap()).collect();
        assert_eq!(events.len(), 3);
        assert!(events[0].starts_with("data: {"));
        assert!(events[0].contains("\"association_id\""));
        assert_eq!(events[2], "data: [DONE]\n\n");
    }

    #[test]
    fn chat_completion_and_bad_body() {
        let module = UserModule::new("assistant").with_chat(|_request, _model, _params| {
            Ok(ChatResponse::Completion(json!({
                "object": CHAT_COMPLETION,
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}}]
            })))
        });
        let (_temp, service) = service(module, text_target(TargetType::TextGeneration));
        let request = InboundRequest::default().with_body(
            r#"{"model": "m", "messages": [{"role": "user", "content": "hey"}]}"#,
            Some("application/json"),
        );
        let response = service.chat(&request);
        assert_eq!(response.status, HTTP_200_OK);
        assert_eq!(json_of(&response)["object"], json!(CHAT_COMPLETION));

        let bad = InboundRequest::default().with_body("not json", Some("application/json"));
        assert_eq!(service.chat(&bad).status, HTTP_422_UNPROCESSABLE_ENTITY);
        assert_eq!(service.capabilities()["supported_methods"], json!({"chat": true}));
    }

    #[test]
    fn supported_llm_models_only_for_text_generation() {
        let (_temp, regressor) = regression();
        assert_eq!(regressor.supported_llm_models().status, HTTP_404_NOT_FOUND);

        let module = UserModule::new("llm").with_score(|data, _model, _params| {
            Ok(Table::single("completion", vec![json!("x"); data.num_rows()]))
        });
        let (_temp, textgen) = service(module, text_target(TargetType::TextGeneration));
        let response = textgen.handle(Route::SupportedLlmModels, &InboundRequest::default());
        assert_eq!(response.status, HTTP_200_OK);
        assert_eq!(json_of(&response), &json!({"object": "list", "data": []}));
    }

    #[test]
    fn info_and_capabilities() {
        let (_temp, service) = regression();
        let info = service.handle(Route::Info, &InboundRequest::default());
        assert_eq!(json_of(&info)["targetType"], json!("regression"));
        let capabilities = service.handle(Route::Capabilities, &InboundRequest::default());
        assert_eq!(
            json_of(&capabilities)["supported_payload_formats"],
            json!({"csv": null, "mtx": null})
        );
    }
}
