//! User code binding: hook tables, task classes and the load context that
//! maps a model directory to the module implementing it.
//!
//! A model directory opts into custom code with a single `custom.toml`
//! manifest naming a [`UserModule`] registered with the [`LoadContext`]:
//!
//! ```toml
//! module = "fraud-scorer"
//! ```

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::bail;
use config::Config as ConfigLoader;
use config::File;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;
use tracing::info;

use crate::artifacts::Model;
use crate::chat::ChatResponse;
use crate::codec::UnstructuredInput;
use crate::codec::UnstructuredOutput;
use crate::error::AdapterError;
use crate::error::Result;
use crate::table::Table;
use crate::target_type::TargetType;

/// File that marks a directory as carrying custom code.
pub const HOOK_MANIFEST_FILE: &str = "custom.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookName {
    Init,
    ReadInputData,
    LoadModel,
    Transform,
    Score,
    ScoreUnstructured,
    PostProcess,
    Fit,
    Chat,
    GetSupportedLlmModels,
}

impl HookName {
    /// Hooks honoured for every structured target type.
    pub const STRUCTURED: [HookName; 10] = [
        Self::Init,
        Self::ReadInputData,
        Self::LoadModel,
        Self::Transform,
        Self::Score,
        Self::ScoreUnstructured,
        Self::PostProcess,
        Self::Fit,
        Self::Chat,
        Self::GetSupportedLlmModels,
    ];

    pub const UNSTRUCTURED: [HookName; 3] =
        [Self::Init, Self::LoadModel, Self::ScoreUnstructured];

    pub fn allowed_for(target_type: TargetType) -> &'static [HookName] {
        if target_type == TargetType::Unstructured {
            &Self::UNSTRUCTURED
        } else {
            &Self::STRUCTURED
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::ReadInputData => "read_input_data",
            Self::LoadModel => "load_model",
            Self::Transform => "transform",
            Self::Score => "score",
            Self::ScoreUnstructured => "score_unstructured",
            Self::PostProcess => "post_process",
            Self::Fit => "fit",
            Self::Chat => "chat",
            Self::GetSupportedLlmModels => "get_supported_llm_models",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keyword arguments forwarded to score hooks and predictors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreParams {
    pub positive_class_label: Option<String>,
    pub negative_class_label: Option<String>,
    pub class_labels: Option<Vec<String>>,
    pub extra: Map<String, Value>,
}

/// Request context forwarded to chat hooks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatParams {
    pub headers: BTreeMap<String, String>,
    pub association_id: Option<String>,
}

/// Everything a training entry point receives.
#[derive(Debug, Clone)]
pub struct FitRequest {
    pub features: Table,
    pub target: Option<Vec<Value>>,
    pub output_dir: PathBuf,
    pub class_order: Option<Vec<String>>,
    pub row_weights: Option<Vec<f64>>,
    pub parameters: Option<Map<String, Value>>,
}

pub type InitFn = Arc<dyn Fn(&Path) -> anyhow::Result<()> + Send + Sync>;
pub type ReadInputDataFn = Arc<dyn Fn(&[u8]) -> anyhow::Result<Table> + Send + Sync>;
pub type LoadModelFn = Arc<dyn Fn(&Path) -> anyhow::Result<Option<Model>> + Send + Sync>;
/// Receives features, the model (absent during fit) and an optional target.
pub type TransformFn =
    Arc<dyn Fn(&Table, Option<&Model>, Option<&Table>) -> anyhow::Result<Table> + Send + Sync>;
pub type ScoreFn = Arc<dyn Fn(&Table, &Model, &ScoreParams) -> anyhow::Result<Table> + Send + Sync>;
pub type ScoreUnstructuredFn =
    Arc<dyn Fn(&Model, &UnstructuredInput) -> anyhow::Result<UnstructuredOutput> + Send + Sync>;
pub type PostProcessFn = Arc<dyn Fn(&Table, &Model) -> anyhow::Result<Table> + Send + Sync>;
pub type FitFn = Arc<dyn Fn(&FitRequest) -> anyhow::Result<()> + Send + Sync>;
pub type ChatFn =
    Arc<dyn Fn(&Value, &Model, &ChatParams) -> anyhow::Result<ChatResponse> + Send + Sync>;
pub type SupportedModelsFn = Arc<dyn Fn(&Model) -> anyhow::Result<Vec<Value>> + Send + Sync>;

/// Optional entry points bound from a user module. Immutable once bound.
#[derive(Clone, Default)]
pub struct HookSet {
    pub init: Option<InitFn>,
    pub read_input_data: Option<ReadInputDataFn>,
    pub load_model: Option<LoadModelFn>,
    pub transform: Option<TransformFn>,
    pub score: Option<ScoreFn>,
    pub score_unstructured: Option<ScoreUnstructuredFn>,
    pub post_process: Option<PostProcessFn>,
    pub fit: Option<FitFn>,
    pub chat: Option<ChatFn>,
    pub get_supported_llm_models: Option<SupportedModelsFn>,
}

impl HookSet {
    pub fn has(&self, name: HookName) -> bool {
        match name {
            HookName::Init => self.init.is_some(),
            HookName::ReadInputData => self.read_input_data.is_some(),
            HookName::LoadModel => self.load_model.is_some(),
            HookName::Transform => self.transform.is_some(),
            HookName::Score => self.score.is_some(),
            HookName::ScoreUnstructured => self.score_unstructured.is_some(),
            HookName::PostProcess => self.post_process.is_some(),
            HookName::Fit => self.fit.is_some(),
            HookName::Chat => self.chat.is_some(),
            HookName::GetSupportedLlmModels => self.get_supported_llm_models.is_some(),
        }
    }

    pub fn present(&self) -> Vec<HookName> {
        HookName::STRUCTURED
            .into_iter()
            .filter(|name| self.has(*name))
            .collect()
    }

    /// Copy of this set keeping only `allowed` hooks.
    pub fn restricted_to(&self, allowed: &[HookName]) -> Self {
        let keep = |name: HookName| allowed.contains(&name);
        Self {
            init: self.init.clone().filter(|_| keep(HookName::Init)),
            read_input_data: self
                .read_input_data
                .clone()
                .filter(|_| keep(HookName::ReadInputData)),
            load_model: self.load_model.clone().filter(|_| keep(HookName::LoadModel)),
            transform: self.transform.clone().filter(|_| keep(HookName::Transform)),
            score: self.score.clone().filter(|_| keep(HookName::Score)),
            score_unstructured: self
                .score_unstructured
                .clone()
                .filter(|_| keep(HookName::ScoreUnstructured)),
            post_process: self
                .post_process
                .clone()
                .filter(|_| keep(HookName::PostProcess)),
            fit: self.fit.clone().filter(|_| keep(HookName::Fit)),
            chat: self.chat.clone().filter(|_| keep(HookName::Chat)),
            get_supported_llm_models: self
                .get_supported_llm_models
                .clone()
                .filter(|_| keep(HookName::GetSupportedLlmModels)),
        }
    }

    /// `name: bool` pairs, used in error messages about missing hooks.
    pub fn describe(&self) -> String {
        HookName::STRUCTURED
            .iter()
            .map(|name| format!("{name}: {}", self.has(*name)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.present()).finish()
    }
}

/// A trained instance produced by a [`CustomTaskClass`].
pub trait CustomTask: Send + Sync {
    fn fit(&mut self, request: &FitRequest) -> anyhow::Result<()>;

    fn save(&self, dir: &Path) -> anyhow::Result<()>;

    fn predict(&self, data: &Table, params: &ScoreParams) -> anyhow::Result<Table>;

    /// Class probabilities; classification targets call this instead of `predict`.
    fn predict_proba(&self, data: &Table, params: &ScoreParams) -> anyhow::Result<Table> {
        self.predict(data, params)
    }

    fn transform(&self, _data: &Table) -> anyhow::Result<Table> {
        bail!("transform is not implemented by this task")
    }
}

/// Structured alternative to loose hooks: one type owning fit, persistence and
/// inference.
pub trait CustomTaskClass: Send + Sync {
    fn create(&self) -> anyhow::Result<Box<dyn CustomTask>>;

    fn load(&self, dir: &Path) -> anyhow::Result<Box<dyn CustomTask>>;
}

/// Named bundle of user code, the unit a manifest refers to.
#[derive(Clone)]
pub struct UserModule {
    name: String,
    hooks: HookSet,
    task_class: Option<Arc<dyn CustomTaskClass>>,
}

impl UserModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hooks: HookSet::default(),
            task_class: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    pub fn task_class(&self) -> Option<&Arc<dyn CustomTaskClass>> {
        self.task_class.as_ref()
    }

    pub fn with_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Path) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.init = Some(Arc::new(hook));
        self
    }

    pub fn with_read_input_data<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[u8]) -> anyhow::Result<Table> + Send + Sync + 'static,
    {
        self.hooks.read_input_data = Some(Arc::new(hook));
        self
    }

    pub fn with_load_model<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Path) -> anyhow::Result<Option<Model>> + Send + Sync + 'static,
    {
        self.hooks.load_model = Some(Arc::new(hook));
        self
    }

    pub fn with_transform<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Table, Option<&Model>, Option<&Table>) -> anyhow::Result<Table>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.transform = Some(Arc::new(hook));
        self
    }

    pub fn with_score<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Table, &Model, &ScoreParams) -> anyhow::Result<Table> + Send + Sync + 'static,
    {
        self.hooks.score = Some(Arc::new(hook));
        self
    }

    pub fn with_score_unstructured<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Model, &UnstructuredInput) -> anyhow::Result<UnstructuredOutput>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.score_unstructured = Some(Arc::new(hook));
        self
    }

    pub fn with_post_process<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Table, &Model) -> anyhow::Result<Table> + Send + Sync + 'static,
    {
        self.hooks.post_process = Some(Arc::new(hook));
        self
    }

    pub fn with_fit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&FitRequest) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.fit = Some(Arc::new(hook));
        self
    }

    pub fn with_chat<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Value, &Model, &ChatParams) -> anyhow::Result<ChatResponse> + Send + Sync + 'static,
    {
        self.hooks.chat = Some(Arc::new(hook));
        self
    }

    pub fn with_supported_llm_models<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Model) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        self.hooks.get_supported_llm_models = Some(Arc::new(hook));
        self
    }

    pub fn with_task_class(mut self, task_class: impl CustomTaskClass + 'static) -> Self {
        self.task_class = Some(Arc::new(task_class));
        self
    }
}

impl fmt::Debug for UserModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserModule")
            .field("name", &self.name)
            .field("hooks", &self.hooks)
            .field("task_class", &self.task_class.is_some())
            .finish()
    }
}

/// What a model directory resolved to.
#[derive(Clone)]
pub enum HookBinding {
    Legacy(HookSet),
    Task(Arc<dyn CustomTaskClass>),
}

impl HookBinding {
    pub fn hooks(&self) -> Option<&HookSet> {
        match self {
            Self::Legacy(hooks) => Some(hooks),
            Self::Task(_) => None,
        }
    }

    pub fn is_task(&self) -> bool {
        matches!(self, Self::Task(_))
    }
}

impl fmt::Debug for HookBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy(hooks) => f.debug_tuple("Legacy").field(hooks).finish(),
            Self::Task(_) => f.write_str("Task"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HookManifest {
    module: String,
}

/// Registry of importable user modules plus the state import resolution
/// accumulates across loads.
#[derive(Default)]
pub struct LoadContext {
    global: HashMap<String, Arc<UserModule>>,
    scoped: HashMap<PathBuf, HashMap<String, Arc<UserModule>>>,
    search_path: Vec<PathBuf>,
    bindings: HashMap<(PathBuf, TargetType), HookBinding>,
}

impl LoadContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `module` importable from any directory.
    pub fn register(&mut self, module: UserModule) {
        self.global
            .insert(module.name().to_string(), Arc::new(module));
    }

    /// Make `module` importable only once `dir` is on the search path.
    pub fn register_at(&mut self, dir: impl Into<PathBuf>, module: UserModule) {
        self.scoped
            .entry(dir.into())
            .or_default()
            .insert(module.name().to_string(), Arc::new(module));
    }

    /// Put `dir` at the front of the search path. Repeated inserts are no-ops.
    pub fn insert_search_path(&mut self, dir: &Path) {
        if !self.search_path.iter().any(|existing| existing == dir) {
            self.search_path.insert(0, dir.to_path_buf());
        }
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// Modules scoped to a search path directory shadow global ones.
    pub fn import(&self, name: &str) -> Option<Arc<UserModule>> {
        self.search_path
            .iter()
            .filter_map(|dir| self.scoped.get(dir))
            .find_map(|modules| modules.get(name))
            .or_else(|| self.global.get(name))
            .cloned()
    }

    fn cached(&self, key: &(PathBuf, TargetType)) -> Option<HookBinding> {
        self.bindings.get(key).cloned()
    }
}

/// Binds the user code for a model directory.
pub struct HookResolver;

impl HookResolver {
    pub fn resolve(
        ctx: &mut LoadContext,
        model_dir: &Path,
        target_type: TargetType,
    ) -> Result<HookBinding> {
        let key = (model_dir.to_path_buf(), target_type);
        if let Some(binding) = ctx.cached(&key) {
            debug!(dir = %model_dir.display(), "reusing hook binding");
            return Ok(binding);
        }

        let binding = Self::bind(ctx, model_dir, target_type)?;
        ctx.bindings.insert(key, binding.clone());
        Ok(binding)
    }

    fn bind(
        ctx: &mut LoadContext,
        model_dir: &Path,
        target_type: TargetType,
    ) -> Result<HookBinding> {
        let manifests = find_manifests(model_dir)?;
        let manifest_path = match manifests.as_slice() {
            [] => {
                info!(
                    "No {HOOK_MANIFEST_FILE} file detected in {}",
                    model_dir.display()
                );
                return Ok(HookBinding::Legacy(HookSet::default()));
            }
            [single] => single.clone(),
            many => {
                let listed: Vec<String> =
                    many.iter().map(|path| path.display().to_string()).collect();
                return Err(AdapterError::configuration(format!(
                    "Found too many custom hook files: {}",
                    listed.join(", ")
                )));
            }
        };

        info!("Detected {} .. trying to load hooks", manifest_path.display());
        let manifest = read_manifest(&manifest_path).map_err(|err| {
            AdapterError::configuration(format!(
                "Failed loading hooks from [{}]: {err:#}",
                manifest_path.display()
            ))
        })?;

        if let Some(parent) = manifest_path.parent() {
            ctx.insert_search_path(parent);
        }

        let module = ctx.import(&manifest.module).ok_or_else(|| {
            AdapterError::configuration(format!(
                "Failed loading hooks from [{}]: module '{}' is not registered",
                manifest_path.display(),
                manifest.module
            ))
        })?;

        if let Some(task_class) = module.task_class() {
            debug!(module = module.name(), "binding custom task class");
            return Ok(HookBinding::Task(Arc::clone(task_class)));
        }

        let hooks = module
            .hooks()
            .restricted_to(HookName::allowed_for(target_type));

        if target_type == TargetType::Unstructured && !hooks.has(HookName::ScoreUnstructured) {
            return Err(AdapterError::configuration(format!(
                "In '{target_type}' mode hook '{}' must be provided.",
                HookName::ScoreUnstructured
            )));
        }

        if let Some(init) = hooks.init.as_ref() {
            init(model_dir).map_err(|err| AdapterError::hook("Model 'init' hook failed.", err))?;
        }

        debug!(module = module.name(), hooks = ?hooks, "hooks loaded");
        Ok(HookBinding::Legacy(hooks))
    }
}

/// Hook manifests under `dir` with the module each one names.
pub fn list_manifests(dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    find_manifests(dir)?
        .into_iter()
        .map(|path| {
            let manifest = read_manifest(&path).map_err(|err| {
                AdapterError::configuration(format!(
                    "Failed loading hooks from [{}]: {err:#}",
                    path.display()
                ))
            })?;
            Ok((path, manifest.module))
        })
        .collect()
}

fn read_manifest(path: &Path) -> anyhow::Result<HookManifest> {
    let manifest: HookManifest = ConfigLoader::builder()
        .add_source(File::from(path.to_path_buf()))
        .build()
        .with_context(|| format!("failed to parse hook manifest {}", path.display()))?
        .try_deserialize()
        .context("hook manifest must name a module")?;
    if manifest.module.trim().is_empty() {
        bail!("hook manifest must name a module");
    }
    Ok(manifest)
}

/// Every manifest under `dir`, sorted for stable error messages.
fn find_manifests(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.file_name().is_some_and(|name| name == HOOK_MANIFEST_FILE) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}
