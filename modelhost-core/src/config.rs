use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use config::Config as ConfigLoader;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::target_type::TargetType;
use crate::typeschema::TypeSchema;

pub const APP_NAME: &str = "modelhost";
/// Prefix of environment overrides, e.g. `MODELHOST__TARGET_TYPE=binary`.
pub const ENV_PREFIX: &str = "MODELHOST";
/// Fallback source for the target name when the configuration omits it.
pub const TARGET_NAME_ENV: &str = "TARGET_NAME";
pub const DEFAULT_PROMPT_COLUMN_NAME: &str = "promptText";

/// Load the runner configuration from `path` (or the default location when it
/// exists) layered under `MODELHOST__*` environment overrides, then validate it.
pub fn load_runner_config(path: Option<&Path>) -> Result<RunnerConfig> {
    let config_file = match path {
        Some(path) => {
            if !path.exists() {
                bail!("configuration file {} does not exist", path.display());
            }
            Some(path.to_path_buf())
        }
        None => default_config_path().filter(|candidate| candidate.exists()),
    };

    let mut builder = ConfigLoader::builder();
    if let Some(config_file) = config_file.as_ref() {
        builder = builder.add_source(File::from(config_file.clone()));
    }
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let source = config_file
        .as_ref()
        .map_or_else(|| "environment".to_string(), |file| file.display().to_string());
    let mut config: RunnerConfig = builder
        .build()
        .with_context(|| format!("failed to parse configuration from {source}"))?
        .try_deserialize()
        .context("failed to deserialize configuration into RunnerConfig")?;

    // Relative paths are anchored at the file that declared them.
    let base_dir = match config_file.as_ref().and_then(|file| file.parent()) {
        Some(parent) => parent.to_path_buf(),
        None => env::current_dir().context("unable to determine the working directory")?,
    };
    config.normalize(&base_dir)?;

    Ok(config)
}

/// `$XDG_CONFIG_HOME/modelhost/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> Option<PathBuf> {
    let home = home_dir()?;
    Some(
        xdg_dir("XDG_CONFIG_HOME", &home, ".config")
            .join(APP_NAME)
            .join("config.toml"),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub target_type: Option<TargetType>,
    pub code_dir: Option<PathBuf>,
    pub positive_class_label: Option<String>,
    pub negative_class_label: Option<String>,
    pub class_labels: Option<Vec<String>>,
    /// Newline separated class labels; mutually exclusive with `class_labels`.
    pub class_labels_file: Option<PathBuf>,
    pub target_name: Option<String>,
    pub monitor: bool,
    pub prompt_column_name: String,
    pub llm_id: Option<String>,
    pub telemetry: TelemetrySettings,
    /// Declared output requirements, checked after transform.
    pub type_schema: Option<Value>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            target_type: None,
            code_dir: None,
            positive_class_label: None,
            negative_class_label: None,
            class_labels: None,
            class_labels_file: None,
            target_name: None,
            monitor: false,
            prompt_column_name: DEFAULT_PROMPT_COLUMN_NAME.to_string(),
            llm_id: None,
            telemetry: TelemetrySettings::default(),
            type_schema: None,
        }
    }
}

impl RunnerConfig {
    pub fn normalize(&mut self, base_dir: &Path) -> Result<()> {
        let target_type = self.target_type()?;

        if let Some(code_dir) = self.code_dir.as_ref() {
            self.code_dir = Some(resolve_path_value(&code_dir.to_string_lossy(), base_dir)?);
        }
        if let Some(log_dir) = self.telemetry.log_dir.as_ref() {
            self.telemetry.log_dir =
                Some(resolve_path_value(&log_dir.to_string_lossy(), base_dir)?);
        }

        self.target_name = self
            .target_name
            .take()
            .or_else(|| env::var(TARGET_NAME_ENV).ok())
            .filter(|name| !name.trim().is_empty());

        if self.prompt_column_name.trim().is_empty() {
            self.prompt_column_name = DEFAULT_PROMPT_COLUMN_NAME.to_string();
        }

        if let Some(labels_file) = self.class_labels_file.take() {
            if self.class_labels.is_some() {
                bail!("class_labels and class_labels_file are mutually exclusive");
            }
            let labels_file = resolve_path_value(&labels_file.to_string_lossy(), base_dir)?;
            self.class_labels = Some(read_class_labels(&labels_file)?);
        }

        match target_type {
            TargetType::Binary => {
                let (Some(positive), Some(negative)) = (
                    self.positive_class_label.as_ref(),
                    self.negative_class_label.as_ref(),
                ) else {
                    bail!(
                        "binary target requires both positive_class_label and negative_class_label"
                    );
                };
                if positive == negative {
                    bail!("positive and negative class labels must differ, both are '{positive}'");
                }
            }
            TargetType::Multiclass => {
                let count = self.class_labels.as_ref().map_or(0, Vec::len);
                if count < 2 {
                    bail!("multiclass target requires at least 2 class labels, found {count}");
                }
            }
            _ => {}
        }

        if target_type.requires_target_name() && self.target_name.is_none() {
            bail!(
                "{target_type} target requires target_name (or the {TARGET_NAME_ENV} environment variable)"
            );
        }

        self.parsed_type_schema()?;
        Ok(())
    }

    pub fn target_type(&self) -> Result<TargetType> {
        self.target_type
            .ok_or_else(|| anyhow!("target_type must be configured"))
    }

    pub fn code_dir(&self) -> Result<&Path> {
        self.code_dir
            .as_deref()
            .ok_or_else(|| anyhow!("code_dir must be configured"))
    }

    pub fn parsed_type_schema(&self) -> Result<Option<TypeSchema>> {
        self.type_schema
            .clone()
            .map(TypeSchema::from_json)
            .transpose()
            .context("failed to parse type_schema")
    }

    /// Log directory for the local telemetry sink, `None` when disabled.
    pub fn telemetry_log_dir(&self) -> Option<PathBuf> {
        if !self.monitor || !self.telemetry.local_logging {
            return None;
        }
        Some(
            self.telemetry
                .log_dir
                .clone()
                .unwrap_or_else(crate::telemetry::default_log_dir),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub local_logging: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            local_logging: true,
            log_dir: None,
        }
    }
}

fn read_class_labels(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read class labels from {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn xdg_dir(var: &str, home: &Path, fallback_suffix: &str) -> PathBuf {
    env::var(var)
        .ok()
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| home.join(fallback_suffix))
}

pub fn resolve_path_value(value: &str, base_dir: &Path) -> Result<PathBuf> {
    let expanded = expand_path(value)?;
    let mut path = PathBuf::from(&expanded);
    if path.is_absolute() {
        path = path.components().collect();
        Ok(path)
    } else {
        Ok(base_dir.join(path))
    }
}

fn expand_path(value: &str) -> Result<String> {
    let home = home_dir();
    let home_utf8 = match home.as_ref() {
        Some(path) => Some(
            path.to_str()
                .ok_or_else(|| anyhow!("home directory contains invalid UTF-8"))?
                .to_string(),
        ),
        None => None,
    };

    let expanded = shellexpand::full_with_context(
        value,
        || home_utf8.as_deref(),
        |var| Ok(env::var(var).ok()),
    )
    .map_err(|error: shellexpand::LookupError<std::env::VarError>| {
        anyhow!("failed to expand '{value}': {error}")
    })?;
    Ok(expanded.into_owned())
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("USERPROFILE").map(PathBuf::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::OnceLock;
    use tempfile::TempDir;

    // `std::env::set_var` / `remove_var` are unsafe since Rust 1.88 because
    // they mutate global process state; every env-touching test holds the lock.
    fn set_env(var: &str, value: &str) {
        unsafe { env::set_var(var, value) };
    }

    fn remove_env(var: &str) {
        unsafe { env::remove_var(var) };
    }

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.toml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn loads_binary_config_and_resolves_paths() {
        let _guard = env_lock().lock().unwrap();
        remove_env(TARGET_NAME_ENV);
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
                target_type = "binary"
                code_dir = "model"
                positive_class_label = "yes"
                negative_class_label = "no"
                monitor = true

                [telemetry]
                log_dir = "logs"
            "#,
        );

        let config = load_runner_config(Some(path.as_path())).unwrap();
        assert_eq!(config.target_type().unwrap(), TargetType::Binary);
        assert_eq!(config.code_dir().unwrap(), tmp.path().join("model"));
        assert_eq!(config.prompt_column_name, DEFAULT_PROMPT_COLUMN_NAME);
        assert_eq!(config.telemetry_log_dir(), Some(tmp.path().join("logs")));
    }

    #[test]
    fn environment_overrides_file_values() {
        let _guard = env_lock().lock().unwrap();
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
                target_type = "regression"
                code_dir = "/srv/model"
            "#,
        );

        set_env("MODELHOST__TARGET_TYPE", "anomaly");
        set_env("MODELHOST__TELEMETRY__LOCAL_LOGGING", "false");
        let loaded = load_runner_config(Some(path.as_path()));
        remove_env("MODELHOST__TARGET_TYPE");
        remove_env("MODELHOST__TELEMETRY__LOCAL_LOGGING");

        let config = loaded.unwrap();
        assert_eq!(config.target_type().unwrap(), TargetType::Anomaly);
        assert!(!config.telemetry.local_logging);
        assert_eq!(config.code_dir().unwrap(), Path::new("/srv/model"));
    }

    #[test]
    fn reads_class_labels_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("labels.txt"), "cat\ndog\n\nbird\n").unwrap();
        let mut config = RunnerConfig {
            target_type: Some(TargetType::Multiclass),
            class_labels_file: Some(PathBuf::from("labels.txt")),
            ..RunnerConfig::default()
        };
        config.normalize(tmp.path()).unwrap();
        assert_eq!(
            config.class_labels,
            Some(vec!["cat".to_string(), "dog".to_string(), "bird".to_string()])
        );

        let mut both = RunnerConfig {
            target_type: Some(TargetType::Multiclass),
            class_labels: Some(vec!["a".into(), "b".into()]),
            class_labels_file: Some(PathBuf::from("labels.txt")),
            ..RunnerConfig::default()
        };
        assert!(both.normalize(tmp.path()).is_err());
    }

    #[test]
    fn rejects_incomplete_label_settings() {
        let tmp = TempDir::new().unwrap();
        let mut binary = RunnerConfig {
            target_type: Some(TargetType::Binary),
            positive_class_label: Some("1".into()),
            negative_class_label: Some("1".into()),
            ..RunnerConfig::default()
        };
        let err = binary.normalize(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("must differ"));

        let mut multiclass = RunnerConfig {
            target_type: Some(TargetType::Multiclass),
            class_labels: Some(vec!["only".into()]),
            ..RunnerConfig::default()
        };
        assert!(multiclass.normalize(tmp.path()).is_err());

        let mut missing = RunnerConfig::default();
        assert!(missing.normalize(tmp.path()).is_err());
    }

    #[test]
    fn text_generation_falls_back_to_target_name_env() {
        let _guard = env_lock().lock().unwrap();
        let tmp = TempDir::new().unwrap();
        let mut config = RunnerConfig {
            target_type: Some(TargetType::TextGeneration),
            ..RunnerConfig::default()
        };

        remove_env(TARGET_NAME_ENV);
        assert!(config.clone().normalize(tmp.path()).is_err());

        set_env(TARGET_NAME_ENV, "completion");
        let normalized = config.normalize(tmp.path());
        remove_env(TARGET_NAME_ENV);
        normalized.unwrap();
        assert_eq!(config.target_name.as_deref(), Some("completion"));
    }

    #[test]
    fn invalid_type_schema_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = RunnerConfig {
            target_type: Some(TargetType::Transform),
            type_schema: Some(serde_json::json!({"output_requirements": [{"field": "colour"}]})),
            ..RunnerConfig::default()
        };
        assert!(config.normalize(tmp.path()).is_err());
    }
}
