//! Built-in artifact predictors and the ordered registry that picks one.
//!
//! Framework families are probed in a fixed order; the first predictor whose
//! capability check accepts an artifact (or a loaded model) wins. The generic
//! scikit-learn family is last because its checks overlap the others.

use std::any::Any;
use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::bail;
use serde_json::Value;
use tracing::debug;
use tracing::error;

use crate::error::AdapterError;
use crate::error::ArtifactResolutionError;
use crate::error::Result;
use crate::hooks::ScoreParams;
use crate::marshal::PredictionArray;
use crate::table::Table;

/// A deserialized model. Opaque to the adapter; only predictors and user
/// hooks know the concrete type.
pub type Model = Arc<dyn Any + Send + Sync>;

/// Predictions plus the label order the model reported for its columns.
pub type FrameworkPrediction = (PredictionArray, Option<Vec<Value>>);

/// A strategy that can load and score one family of serialized models.
pub trait ArtifactPredictor: Send + Sync {
    fn name(&self) -> &str;

    fn artifact_extensions(&self) -> &[&'static str];

    /// Human readable list of what the framework needs at runtime.
    fn requirements(&self) -> String;

    fn supports_artifact(&self, path: &Path) -> bool {
        has_extension(path, self.artifact_extensions())
    }

    fn can_load(&self, path: &Path) -> bool;

    fn load(&self, path: &Path) -> anyhow::Result<Model>;

    fn can_use(&self, model: &Model) -> bool;

    fn predict(
        &self,
        data: &Table,
        model: &Model,
        params: &ScoreParams,
    ) -> anyhow::Result<FrameworkPrediction>;

    /// Whether `model` is a native transformer usable without a transform hook.
    fn can_transform(&self, _model: &Model) -> bool {
        false
    }

    fn transform(&self, _data: &Table, _model: &Model) -> anyhow::Result<Table> {
        bail!("{} models cannot be applied as transformers", self.name())
    }
}

/// Deserialization and inference for one framework, supplied by the embedding
/// runtime. The adapter never looks inside the model it returns.
pub trait FrameworkBackend: Send + Sync {
    fn can_load(&self, _path: &Path) -> bool {
        true
    }

    fn load(&self, path: &Path) -> anyhow::Result<Model>;

    fn can_use(&self, model: &Model) -> bool;

    fn predict(
        &self,
        data: &Table,
        model: &Model,
        params: &ScoreParams,
    ) -> anyhow::Result<FrameworkPrediction>;

    fn can_transform(&self, _model: &Model) -> bool {
        false
    }

    fn transform(&self, _data: &Table, _model: &Model) -> anyhow::Result<Table> {
        bail!("transformation is not supported by this backend")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameworkFamily {
    Keras,
    XGBoost,
    PyTorch,
    Onnx,
    SkLearn,
}

impl FrameworkFamily {
    /// Probe order used by [`PredictorRegistry::standard`].
    pub const ALL: [FrameworkFamily; 5] = [
        Self::Keras,
        Self::XGBoost,
        Self::PyTorch,
        Self::Onnx,
        Self::SkLearn,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Keras => "keras",
            Self::XGBoost => "xgboost",
            Self::PyTorch => "pytorch",
            Self::Onnx => "onnx",
            Self::SkLearn => "scikit-learn",
        }
    }

    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Keras => &[".h5"],
            Self::XGBoost => &[".pkl"],
            Self::PyTorch => &[".pth"],
            Self::Onnx => &[".onnx"],
            Self::SkLearn => &[".pkl", ".joblib"],
        }
    }

    pub fn requirements(self) -> &'static str {
        match self {
            Self::Keras => "tensorflow, keras",
            Self::XGBoost => "xgboost, scikit-learn",
            Self::PyTorch => "torch",
            Self::Onnx => "onnxruntime",
            Self::SkLearn => "scikit-learn, joblib",
        }
    }
}

impl fmt::Display for FrameworkFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FrameworkFamily {
    type Err = AdapterError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keras" | "tensorflow" => Ok(Self::Keras),
            "xgboost" => Ok(Self::XGBoost),
            "pytorch" | "torch" => Ok(Self::PyTorch),
            "onnx" | "onnxruntime" => Ok(Self::Onnx),
            "sklearn" | "scikit-learn" | "scikit_learn" => Ok(Self::SkLearn),
            other => Err(AdapterError::configuration(format!(
                "unsupported framework '{other}'"
            ))),
        }
    }
}

/// Built-in predictor for a framework family. Without a backend it still
/// recognizes its artifact extensions, which is what lets the registry tell a
/// missing framework apart from an unknown artifact.
pub struct FrameworkPredictor {
    family: FrameworkFamily,
    backend: Option<Arc<dyn FrameworkBackend>>,
}

impl FrameworkPredictor {
    pub fn new(family: FrameworkFamily) -> Self {
        Self {
            family,
            backend: None,
        }
    }

    pub fn with_backend(family: FrameworkFamily, backend: Arc<dyn FrameworkBackend>) -> Self {
        Self {
            family,
            backend: Some(backend),
        }
    }

    pub fn family(&self) -> FrameworkFamily {
        self.family
    }

    fn backend(&self) -> anyhow::Result<&Arc<dyn FrameworkBackend>> {
        match self.backend.as_ref() {
            Some(backend) => Ok(backend),
            None => bail!("{} runtime is not available", self.family),
        }
    }
}

impl ArtifactPredictor for FrameworkPredictor {
    fn name(&self) -> &str {
        self.family.name()
    }

    fn artifact_extensions(&self) -> &[&'static str] {
        self.family.extensions()
    }

    fn requirements(&self) -> String {
        self.family.requirements().to_string()
    }

    fn can_load(&self, path: &Path) -> bool {
        self.supports_artifact(path)
            && self
                .backend
                .as_ref()
                .is_some_and(|backend| backend.can_load(path))
    }

    fn load(&self, path: &Path) -> anyhow::Result<Model> {
        self.backend()?.load(path)
    }

    fn can_use(&self, model: &Model) -> bool {
        self.backend
            .as_ref()
            .is_some_and(|backend| backend.can_use(model))
    }

    fn predict(
        &self,
        data: &Table,
        model: &Model,
        params: &ScoreParams,
    ) -> anyhow::Result<FrameworkPrediction> {
        self.backend()?.predict(data, model, params)
    }

    fn can_transform(&self, model: &Model) -> bool {
        self.backend
            .as_ref()
            .is_some_and(|backend| backend.can_transform(model))
    }

    fn transform(&self, data: &Table, model: &Model) -> anyhow::Result<Table> {
        self.backend()?.transform(data, model)
    }
}

/// Ordered list of artifact predictors.
#[derive(Clone)]
pub struct PredictorRegistry {
    predictors: Vec<Arc<dyn ArtifactPredictor>>,
}

impl Default for PredictorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl PredictorRegistry {
    /// Every built-in family, in probe order, without runtimes attached.
    pub fn standard() -> Self {
        Self {
            predictors: FrameworkFamily::ALL
                .into_iter()
                .map(|family| {
                    Arc::new(FrameworkPredictor::new(family)) as Arc<dyn ArtifactPredictor>
                })
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            predictors: Vec::new(),
        }
    }

    /// Attach a runtime to a built-in family, keeping its position.
    pub fn install(&mut self, family: FrameworkFamily, backend: Arc<dyn FrameworkBackend>) {
        let predictor: Arc<dyn ArtifactPredictor> =
            Arc::new(FrameworkPredictor::with_backend(family, backend));
        match self
            .predictors
            .iter()
            .position(|existing| existing.name() == family.name())
        {
            Some(index) => self.predictors[index] = predictor,
            None => self.predictors.push(predictor),
        }
    }

    /// Append a custom predictor after the built-in ones.
    pub fn push(&mut self, predictor: Arc<dyn ArtifactPredictor>) {
        self.predictors.push(predictor);
    }

    pub fn predictors(&self) -> &[Arc<dyn ArtifactPredictor>] {
        &self.predictors
    }

    /// Sorted, de-duplicated union of every predictor's extensions.
    pub fn supported_extensions(&self) -> Vec<String> {
        let mut extensions: Vec<String> = self
            .predictors
            .iter()
            .flat_map(|predictor| predictor.artifact_extensions().iter())
            .map(|extension| extension.to_string())
            .collect();
        extensions.sort();
        extensions.dedup();
        extensions
    }

    /// Find the single top-level artifact file in `dir`.
    pub fn detect_artifact(&self, dir: &Path) -> Result<PathBuf> {
        let extensions = self.supported_extensions();
        debug!(?extensions, dir = %dir.display(), "scanning for model artifact");

        let mut entries: Vec<(String, PathBuf)> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
            .collect();
        entries.sort_by(|left, right| left.0.cmp(&right.0));
        let files: Vec<String> = entries.iter().map(|(name, _)| name.clone()).collect();

        let candidates: Vec<&PathBuf> = entries
            .iter()
            .filter(|(_, path)| !path.is_dir())
            .filter(|(_, path)| has_extension(path, &extensions))
            .map(|(_, path)| path)
            .collect();

        match candidates.as_slice() {
            [artifact] => {
                debug!(artifact = %artifact.display(), "detected model artifact");
                Ok((*artifact).clone())
            }
            [] => Err(ArtifactResolutionError::NotFound {
                dir: dir.to_path_buf(),
                extensions,
                files,
            }
            .into()),
            _ => Err(ArtifactResolutionError::Ambiguous { files }.into()),
        }
    }

    /// Load `path` with the first predictor able to. A failing load is fatal;
    /// later predictors are not tried.
    pub fn load_via_predictors(&self, path: &Path) -> Result<Model> {
        let mut supporting = Vec::new();
        for predictor in &self.predictors {
            if predictor.supports_artifact(path) {
                supporting.push(predictor);
            }
            if predictor.can_load(path) {
                debug!(predictor = predictor.name(), path = %path.display(), "loading artifact");
                return predictor.load(path).map_err(|err| {
                    error!(predictor = predictor.name(), error = ?err, "artifact load failed");
                    AdapterError::load(predictor.name(), format!("{err:#}"))
                });
            }
        }

        if supporting.is_empty() {
            return Err(ArtifactResolutionError::Unsupported {
                path: path.to_path_buf(),
            }
            .into());
        }

        Err(ArtifactResolutionError::FrameworkUnavailable {
            frameworks: supporting
                .iter()
                .map(|predictor| {
                    format!(
                        "Framework: {}, requirements: {}",
                        predictor.name(),
                        predictor.requirements()
                    )
                })
                .collect(),
        }
        .into())
    }

    /// First predictor able to score `model`. Having none is only an error
    /// when no score hook will take over.
    pub fn find_predictor_to_use(
        &self,
        model: &Model,
        has_score_hook: bool,
    ) -> Result<Option<Arc<dyn ArtifactPredictor>>> {
        let found = self
            .predictors
            .iter()
            .find(|predictor| predictor.can_use(model))
            .cloned();
        match found {
            Some(predictor) => {
                debug!(predictor = predictor.name(), "predictor selected");
                Ok(Some(predictor))
            }
            None if has_score_hook => Ok(None),
            None => Err(AdapterError::NoPredictorAvailable),
        }
    }

    /// Predictor that can apply `model` as a native transformer.
    pub fn find_transformer(&self, model: &Model) -> Option<Arc<dyn ArtifactPredictor>> {
        self.predictors
            .iter()
            .find(|predictor| predictor.can_transform(model))
            .cloned()
    }
}

fn has_extension<S: AsRef<str>>(path: &Path, extensions: &[S]) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    extensions
        .iter()
        .any(|extension| name.ends_with(&extension.as_ref().to_ascii_lowercase()))
}
