//! Chat-completion dispatch: response validation, association ids, streaming
//! with single-slot lookahead, and the final telemetry report.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use jsonschema::JSONSchema;
use serde_json::Value;
use serde_json::json;
use uuid::Uuid;

use crate::error::AdapterError;
use crate::error::Result;
use crate::table::Table;
use crate::telemetry::Telemetry;
use crate::telemetry::report_quietly;

/// Field added to completions and chunks to correlate them with telemetry.
pub const ASSOCIATION_ID_FIELD: &str = "association_id";
pub const CHAT_COMPLETION: &str = "chat.completion";
pub const CHAT_COMPLETION_CHUNK: &str = "chat.completion.chunk";

pub type ChunkStream = Box<dyn Iterator<Item = anyhow::Result<Value>> + Send>;

/// What a chat hook hands back.
pub enum ChatResponse {
    Completion(Value),
    Stream(ChunkStream),
}

impl ChatResponse {
    pub fn stream<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = anyhow::Result<Value>>,
        I::IntoIter: Send + 'static,
    {
        Self::Stream(Box::new(chunks.into_iter()))
    }
}

impl fmt::Debug for ChatResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completion(value) => f.debug_tuple("Completion").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Created,
    Dispatched,
    Completed,
    Streaming,
    Drained,
    Failed,
}

impl ChatState {
    pub fn can_advance_to(self, next: ChatState) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Dispatched)
                | (Self::Dispatched, Self::Completed)
                | (Self::Dispatched, Self::Streaming)
                | (Self::Dispatched, Self::Failed)
                | (Self::Streaming, Self::Drained)
                | (Self::Streaming, Self::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Drained | Self::Failed)
    }
}

/// One chat call: its association id, start time and lifecycle state.
#[derive(Debug)]
pub struct ChatSession {
    association_id: String,
    started: Instant,
    streaming: bool,
    state: ChatState,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    pub fn new() -> Self {
        Self {
            association_id: Uuid::new_v4().to_string(),
            started: Instant::now(),
            streaming: false,
            state: ChatState::Created,
        }
    }

    pub fn association_id(&self) -> &str {
        &self.association_id
    }

    pub fn state(&self) -> ChatState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    fn advance(&mut self, next: ChatState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid chat transition {:?} -> {next:?}",
            self.state
        );
        tracing::debug!(
            association_id = %self.association_id,
            from = ?self.state,
            to = ?next,
            "chat state"
        );
        if next == ChatState::Streaming {
            self.streaming = true;
        }
        self.state = next;
    }
}

/// A chat response that passed shape validation. A stream keeps the element
/// peeked during validation so nothing is lost or reordered.
pub enum ValidatedChat {
    Completion(Value),
    Stream {
        head: Option<Value>,
        rest: ChunkStream,
    },
}

fn completion_schema() -> &'static std::result::Result<JSONSchema, String> {
    static SCHEMA: OnceLock<std::result::Result<JSONSchema, String>> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        let schema = json!({
            "type": "object",
            "required": ["object", "choices"],
            "properties": {
                "object": {"const": CHAT_COMPLETION},
                "choices": {"type": "array"}
            }
        });
        JSONSchema::compile(&schema).map_err(|err| err.to_string())
    })
}

fn is_chat_completion(value: &Value) -> Result<bool> {
    match completion_schema() {
        Ok(schema) => Ok(schema.is_valid(value)),
        Err(err) => Err(AdapterError::chat_protocol(format!(
            "chat completion schema failed to compile: {err}"
        ))),
    }
}

fn is_chat_chunk(value: &Value) -> bool {
    value.get("object").and_then(Value::as_str) == Some(CHAT_COMPLETION_CHUNK)
}

/// Check that a hook returned a completion or a stream of completion chunks.
///
/// A stream is validated by pulling its first element; an empty stream is
/// accepted and stays empty.
pub fn validate_chat_response(response: ChatResponse) -> Result<ValidatedChat> {
    match response {
        ChatResponse::Completion(value) => {
            if is_chat_completion(&value)? {
                Ok(ValidatedChat::Completion(value))
            } else {
                Err(AdapterError::chat_protocol(format!(
                    "Expected response to be a chat completion or a stream of chat completion \
                     chunks. Received: {value}"
                )))
            }
        }
        ChatResponse::Stream(mut rest) => match rest.next() {
            None => Ok(ValidatedChat::Stream { head: None, rest }),
            Some(Err(err)) => Err(AdapterError::hook(
                "Model 'chat' hook failed to produce the first chunk.",
                err,
            )),
            Some(Ok(chunk)) if is_chat_chunk(&chunk) => Ok(ValidatedChat::Stream {
                head: Some(chunk),
                rest,
            }),
            Some(Ok(chunk)) => Err(AdapterError::chat_protocol(format!(
                "First chunk does not look like chat completion chunk. Received: {chunk}"
            ))),
        },
    }
}

/// Text of the last message, used as the prompt in telemetry.
pub fn extract_prompt(request: &Value) -> Option<String> {
    let content = request.get("messages")?.as_array()?.last()?.get("content")?;
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .map(describe_content_part)
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    }
}

fn describe_content_part(part: &Value) -> String {
    let kind = part.get("type").and_then(Value::as_str).unwrap_or_default();
    let field = |outer: &str, inner: &str| {
        part.get(outer)
            .and_then(|value| value.get(inner))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    match kind {
        "text" => part
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        "image_url" => format!("Image URL: {}", field("image_url", "url")),
        "input_audio" => format!("Audio Input, Format: {}", field("input_audio", "format")),
        other => format!("Unhandled content type: {other}"),
    }
}

fn tag_association_id(value: &mut Value, association_id: &str) {
    if let Value::Object(map) = value {
        map.insert(
            ASSOCIATION_ID_FIELD.to_string(),
            Value::String(association_id.to_string()),
        );
    }
}

/// Reports chat outcomes to telemetry.
#[derive(Clone)]
struct ChatReporter {
    telemetry: Option<Arc<dyn Telemetry>>,
    prompt_column_name: String,
    prompt: Option<String>,
}

impl ChatReporter {
    fn failure(&self, session: &ChatSession) {
        let latency_ms = session.elapsed_ms();
        report_quietly(self.telemetry.as_deref(), |sink| {
            sink.report_deployment_stats(0, latency_ms)
        });
    }

    fn success(&self, session: &ChatSession, content: &str) {
        let latency_ms = session.elapsed_ms();
        report_quietly(self.telemetry.as_deref(), |sink| {
            sink.report_deployment_stats(1, latency_ms)
        });
        report_quietly(self.telemetry.as_deref(), |sink| {
            let prompt = self.prompt.clone().map_or(Value::Null, Value::String);
            let features = Table::single(self.prompt_column_name.clone(), vec![prompt]);
            let ids = [session.association_id().to_string()];
            sink.report_predictions_data(
                &features,
                &[Value::String(content.to_string())],
                None,
                Some(&ids),
            )
        });
    }
}

/// Chunk iterator handed to callers. Every chunk carries the session's
/// association id; telemetry is reported once on drain, on the first error,
/// or when the stream is dropped early.
pub struct ChatStream {
    head: Option<Value>,
    rest: ChunkStream,
    session: ChatSession,
    reporter: ChatReporter,
    content: String,
    finished: bool,
}

impl ChatStream {
    pub fn association_id(&self) -> &str {
        self.session.association_id()
    }

    pub fn state(&self) -> ChatState {
        self.session.state()
    }

    fn accumulate(&mut self, chunk: &Value) {
        if let Some(delta) = chunk
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("delta"))
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str)
        {
            self.content.push_str(delta);
        }
    }
}

impl Iterator for ChatStream {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let next = match self.head.take() {
            Some(chunk) => Some(Ok(chunk)),
            None => self.rest.next(),
        };
        match next {
            Some(Ok(mut chunk)) => {
                self.accumulate(&chunk);
                tag_association_id(&mut chunk, self.session.association_id());
                Some(Ok(chunk))
            }
            Some(Err(err)) => {
                self.finished = true;
                self.session.advance(ChatState::Failed);
                self.reporter.failure(&self.session);
                Some(Err(AdapterError::hook(
                    "Model 'chat' hook failed while streaming.",
                    err,
                )))
            }
            None => {
                self.finished = true;
                self.session.advance(ChatState::Drained);
                self.reporter.success(&self.session, &self.content);
                None
            }
        }
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(
                association_id = %self.session.association_id(),
                "chat stream dropped before completion"
            );
            self.reporter.success(&self.session, &self.content);
        }
    }
}

impl fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatStream")
            .field("session", &self.session)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Outcome of a chat call after validation.
#[derive(Debug)]
pub enum ChatOutcome {
    Completion(Value),
    Stream(ChatStream),
}

/// Runs a chat call through its lifecycle and reports it to telemetry.
#[derive(Clone)]
pub struct ChatCoordinator {
    telemetry: Option<Arc<dyn Telemetry>>,
    prompt_column_name: String,
}

impl ChatCoordinator {
    pub fn new(
        telemetry: Option<Arc<dyn Telemetry>>,
        prompt_column_name: impl Into<String>,
    ) -> Self {
        Self {
            telemetry,
            prompt_column_name: prompt_column_name.into(),
        }
    }

    /// Dispatch `request` through `dispatch`, which receives the fresh
    /// association id. Any failure before streaming starts reports a
    /// zero-prediction event and is returned.
    pub fn run<F>(&self, request: &Value, dispatch: F) -> Result<ChatOutcome>
    where
        F: FnOnce(&str) -> Result<ChatResponse>,
    {
        let mut session = ChatSession::new();
        let reporter = ChatReporter {
            telemetry: self.telemetry.clone(),
            prompt_column_name: self.prompt_column_name.clone(),
            prompt: extract_prompt(request),
        };

        session.advance(ChatState::Dispatched);
        let validated = match dispatch(session.association_id()).and_then(validate_chat_response) {
            Ok(validated) => validated,
            Err(err) => {
                session.advance(ChatState::Failed);
                reporter.failure(&session);
                return Err(err);
            }
        };

        match validated {
            ValidatedChat::Completion(mut completion) => {
                session.advance(ChatState::Completed);
                let content = completion
                    .pointer("/choices/0/message/content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                reporter.success(&session, &content);
                tag_association_id(&mut completion, session.association_id());
                Ok(ChatOutcome::Completion(completion))
            }
            ValidatedChat::Stream { head, rest } => {
                session.advance(ChatState::Streaming);
                Ok(ChatOutcome::Stream(ChatStream {
                    head,
                    rest,
                    session,
                    reporter,
                    content: String::new(),
                    finished: false,
                }))
            }
        }
    }
}

impl fmt::Debug for ChatCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatCoordinator")
            .field("prompt_column_name", &self.prompt_column_name)
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}
