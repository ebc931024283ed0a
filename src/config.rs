//! Runtime configuration.
//!
//! Values come from an optional TOML file and are then overridden by command
//! line flags or `DETECTBOT_*` environment variables.
//!
//! ```toml
//! artifact_store = "s3://images-bucket/tg-photos"
//! database = "/var/lib/detectbot/predictions.db"
//! inference_endpoint = "http://yolo5:8081/predict"
//! runs_dir = "/usr/src/app/static/data"
//! concurrency = 8
//! request_timeout_secs = 60
//! run_timeout_secs = 120
//! class_names_file = "/etc/detectbot/coco.names"
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use url::Url;

use crate::models::ClassNames;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{field} is not a valid URL ({value:?}): {source}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        source: url::ParseError,
    },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Object store URL: `s3://bucket/prefix`, `file:///abs/dir` or `memory://`.
    pub artifact_store: String,
    /// SQLite file holding prediction summaries.
    pub database: PathBuf,
    pub inference_endpoint: String,
    /// Where relative engine output directories are resolved.
    pub runs_dir: PathBuf,
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub class_names: Option<Vec<String>>,
    /// One class name per line; takes precedence over `class_names`.
    pub class_names_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            artifact_store: "memory://".to_string(),
            database: PathBuf::from("detectbot.db"),
            inference_endpoint: "http://localhost:8081/predict".to_string(),
            runs_dir: PathBuf::from("static/data"),
            concurrency: 4,
            request_timeout_secs: 60,
            run_timeout_secs: 120,
            class_names: None,
            class_names_file: None,
        }
    }
}

impl Settings {
    /// Defaults, overlaid with the TOML file at `path` if given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".to_string()));
        }
        if self.request_timeout_secs == 0 || self.run_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than zero".to_string()));
        }
        self.artifact_store_url()?;
        self.inference_endpoint_url()?;
        if self.class_names.as_ref().is_some_and(|names| names.is_empty()) {
            return Err(ConfigError::Invalid("class_names must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn artifact_store_url(&self) -> Result<Url, ConfigError> {
        parse_url("artifact_store", &self.artifact_store)
    }

    pub fn inference_endpoint_url(&self) -> Result<Url, ConfigError> {
        parse_url("inference_endpoint", &self.inference_endpoint)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Class table: the names file, else inline names, else COCO.
    pub fn class_names(&self) -> Result<ClassNames, ConfigError> {
        if let Some(path) = &self.class_names_file {
            let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let names: Vec<String> = raw
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            if names.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "class names file {path:?} is empty"
                )));
            }
            return Ok(ClassNames::new(names));
        }
        match &self.class_names {
            Some(names) if names.is_empty() => {
                Err(ConfigError::Invalid("class_names must not be empty".to_string()))
            }
            Some(names) => Ok(ClassNames::new(names.clone())),
            None => Ok(ClassNames::coco()),
        }
    }
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        source,
    })
}

/// Command line / environment overrides for [`Settings`].
#[derive(Debug, Clone, Default, clap::Args)]
pub struct SettingsArgs {
    /// Object store URL for original and annotated images
    #[arg(long, env = "DETECTBOT_ARTIFACT_STORE")]
    pub artifact_store: Option<String>,

    /// SQLite database file for prediction summaries
    #[arg(long, env = "DETECTBOT_DATABASE")]
    pub database: Option<PathBuf>,

    /// URL of the detection engine's predict endpoint
    #[arg(long, env = "DETECTBOT_INFERENCE_ENDPOINT")]
    pub inference_endpoint: Option<String>,

    /// Directory the engine writes its run outputs to
    #[arg(long, env = "DETECTBOT_RUNS_DIR")]
    pub runs_dir: Option<PathBuf>,

    /// Maximum number of runs in flight
    #[arg(long, env = "DETECTBOT_CONCURRENCY")]
    pub concurrency: Option<usize>,

    #[arg(long, env = "DETECTBOT_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    #[arg(long, env = "DETECTBOT_RUN_TIMEOUT_SECS")]
    pub run_timeout_secs: Option<u64>,

    /// File with one class name per line
    #[arg(long, env = "DETECTBOT_CLASS_NAMES_FILE")]
    pub class_names_file: Option<PathBuf>,
}

impl SettingsArgs {
    pub fn apply(self, mut settings: Settings) -> Settings {
        if let Some(value) = self.artifact_store {
            settings.artifact_store = value;
        }
        if let Some(value) = self.database {
            settings.database = value;
        }
        if let Some(value) = self.inference_endpoint {
            settings.inference_endpoint = value;
        }
        if let Some(value) = self.runs_dir {
            settings.runs_dir = value;
        }
        if let Some(value) = self.concurrency {
            settings.concurrency = value;
        }
        if let Some(value) = self.request_timeout_secs {
            settings.request_timeout_secs = value;
        }
        if let Some(value) = self.run_timeout_secs {
            settings.run_timeout_secs = value;
        }
        if let Some(value) = self.class_names_file {
            settings.class_names_file = Some(value);
        }
        settings
    }
}
