//! Error taxonomy shared by every layer of the adapter.
//!
//! User code, framework backends and telemetry sinks speak `anyhow`; anything
//! they raise is logged and folded into [`AdapterError::Hook`] before it leaves
//! the adapter so callers only ever match on this enum.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Why an artifact could not be turned into a loaded model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArtifactResolutionError {
    #[error(
        "Multiple serialized model files found. Remove extra artifacts or implement the \
         load_model hook. List of retrieved files is: {}",
        .files.join(" | ")
    )]
    Ambiguous { files: Vec<String> },

    #[error(
        "Could not find model artifact file in {} supported by default predictors. They \
         support filenames with the following extensions {}. If your artifact is not \
         supported, implement the load_model hook. List of retrieved files is: {}",
        .dir.display(),
        .extensions.join(", "),
        .files.join(" | ")
    )]
    NotFound {
        dir: PathBuf,
        extensions: Vec<String>,
        files: Vec<String>,
    },

    #[error(
        "The following frameworks support this model artifact but could not load the model. \
         Check if requirements are missing: {}",
        .frameworks.join("; ")
    )]
    FrameworkUnavailable { frameworks: Vec<String> },

    #[error(
        "Could not load model from artifact file {}. No builtin support for this model was detected",
        .path.display()
    )]
    Unsupported { path: PathBuf },
}

/// Main error type for the adapter layer.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Missing or duplicate hook files, missing mandatory hooks, bad settings.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error(transparent)]
    ArtifactResolution(#[from] ArtifactResolutionError),

    /// A strategy claimed the artifact and then failed to load it.
    #[error("Could not load model from the artifact file using {framework}: {message}")]
    Load { framework: String, message: String },

    #[error(
        "Could not find any framework to handle the loaded model and a score hook is not provided"
    )]
    NoPredictorAvailable,

    #[error("{message}")]
    ShapeValidation { message: String },

    #[error("{message}")]
    ProbabilityValidation { message: String },

    #[error("{message}")]
    LabelMismatch { message: String },

    #[error("{message}")]
    PayloadFormat { message: String },

    #[error("{message}")]
    ChatProtocol { message: String },

    /// A user hook, task class or framework backend failed.
    #[error("{context} Exception: {message}")]
    Hook { context: String, message: String },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn load(framework: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Load {
            framework: framework.into(),
            message: message.into(),
        }
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::ShapeValidation {
            message: message.into(),
        }
    }

    pub fn probability(message: impl Into<String>) -> Self {
        Self::ProbabilityValidation {
            message: message.into(),
        }
    }

    pub fn label_mismatch(message: impl Into<String>) -> Self {
        Self::LabelMismatch {
            message: message.into(),
        }
    }

    pub fn payload(message: impl Into<String>) -> Self {
        Self::PayloadFormat {
            message: message.into(),
        }
    }

    pub fn chat_protocol(message: impl Into<String>) -> Self {
        Self::ChatProtocol {
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::SchemaValidation {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Log a failure coming out of user or framework code and wrap it.
    ///
    /// The full `anyhow` chain is logged; the wrapped error keeps the rendered
    /// chain as its message so the original cause survives the conversion.
    pub fn hook(context: impl Into<String>, err: anyhow::Error) -> Self {
        let context = context.into();
        tracing::error!(error = ?err, "{context}");
        Self::Hook {
            context,
            message: format!("{err:#}"),
        }
    }

    /// Schema failures get a dedicated flag in error payloads.
    pub fn is_schema_validation(&self) -> bool {
        matches!(self, Self::SchemaValidation { .. })
    }

    /// Errors caused by the request rather than by the model.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::PayloadFormat { .. } | Self::SchemaValidation { .. }
        )
    }
}
