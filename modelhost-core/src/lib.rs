//! Core library for the modelhost model adapter: binding user models,
//! normalizing their predictions and dispatching prediction requests.

pub mod adapter;
pub mod artifacts;
pub mod chat;
pub mod codec;
pub mod config;
pub mod error;
pub mod hooks;
pub mod labels;
pub mod marshal;
pub mod predictor;
pub mod service;
pub mod table;
pub mod target_type;
pub mod telemetry;
pub mod typeschema;

pub use adapter::ModelAdapter;
pub use adapter::ModerationPipeline;
pub use adapter::RawPredictResponse;
pub use adapter::StructuredRequest;
pub use artifacts::FrameworkBackend;
pub use artifacts::FrameworkFamily;
pub use artifacts::Model;
pub use artifacts::PredictorRegistry;
pub use chat::ChatCoordinator;
pub use chat::ChatOutcome;
pub use chat::ChatResponse;
pub use chat::ChatStream;
pub use config::RunnerConfig;
pub use config::load_runner_config;
pub use error::AdapterError;
pub use error::Result;
pub use hooks::CustomTask;
pub use hooks::CustomTaskClass;
pub use hooks::HookName;
pub use hooks::LoadContext;
pub use hooks::UserModule;
pub use marshal::PredictionArray;
pub use marshal::marshal_predictions;
pub use predictor::PredictResponse;
pub use predictor::Predictor;
pub use service::InboundRequest;
pub use service::PredictionService;
pub use service::Route;
pub use service::ServiceResponse;
pub use table::Table;
pub use target_type::TargetType;
pub use telemetry::LocalTelemetry;
pub use telemetry::MemoryTelemetry;
pub use telemetry::Telemetry;
pub use typeschema::TypeSchema;
