use log::{debug, LevelFilter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::identifier::DEFAULT_PAD_WIDTH;
use crate::structure::DirectoryTree;

/// Name of the configuration file looked up in the home and config dirs
pub const CONFIG_FILE_NAME: &str = "miresearch.json";

/// Environment variable naming an extra configuration file
pub const CONFIG_ENV_VAR: &str = "MIRESEARCH_CONF";

/// Widest zero-padded number that still fits a u64
const MAX_PAD_WIDTH: usize = 20;

/// Log level for the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Project configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding one directory per subject
    pub data_root: Option<PathBuf>,

    /// Subject ID prefix; guessed from `data_root` when unset
    pub subject_prefix: Option<String>,

    /// Digits in a subject number
    pub pad_width: usize,

    /// Patient name written when anonymising on load
    pub anon_name: Option<String>,

    /// Tree created under every subject
    pub directory_structure: DirectoryTree,

    /// Extra study-level DICOM tags cached in the metadata file
    pub dicom_meta_tags: Vec<String>,

    /// Log level
    pub log_level: LogLevel,

    /// Directory for the rolling application log; console only when unset
    pub log_dir: Option<PathBuf>,

    /// Hide progress bars and console logging
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: None,
            subject_prefix: None,
            pad_width: DEFAULT_PAD_WIDTH,
            anon_name: None,
            directory_structure: DirectoryTree::default(),
            dicom_meta_tags: Vec::new(),
            log_level: LogLevel::Info,
            log_dir: None,
            quiet: false,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Configuration(format!("Failed to open config file {}: {}", path.display(), e)))?;

        let config: Config = serde_json::from_reader(file)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file {}: {}", path.display(), e)))?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .map_err(|e| Error::Configuration(format!("Failed to create config file: {}", e)))?;

        serde_json::to_writer_pretty(file, self)
            .map_err(|e| Error::Configuration(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Standard configuration file locations, lowest precedence first
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(CONFIG_FILE_NAME));
            paths.push(home.join(format!(".{}", CONFIG_FILE_NAME)));
        }
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join(CONFIG_FILE_NAME));
        }
        if let Some(env_path) = std::env::var_os(CONFIG_ENV_VAR) {
            paths.push(PathBuf::from(env_path));
        }
        paths
    }

    /// Load every existing file in [`Config::search_paths`]
    pub fn discover() -> Result<(Self, Vec<PathBuf>)> {
        Self::load_layered(&Self::search_paths())
    }

    /// Merge the existing files among `paths` key by key, later files
    /// winning. Returns the config and the files that were read.
    pub fn load_layered(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>)> {
        let mut merged = Map::new();
        let mut used = Vec::new();

        for path in paths.iter().filter(|p| p.is_file()) {
            let text = std::fs::read_to_string(path)
                .map_err(|e| Error::Configuration(format!("Failed to read {}: {}", path.display(), e)))?;
            let value: Value = serde_json::from_str(&text)
                .map_err(|e| Error::Configuration(format!("Failed to parse {}: {}", path.display(), e)))?;
            let Value::Object(map) = value else {
                return Err(Error::Configuration(format!(
                    "{} must hold a JSON object",
                    path.display()
                )));
            };
            debug!("Read configuration from {}", path.display());
            merged.extend(map);
            used.push(path.clone());
        }

        let config = serde_json::from_value(Value::Object(merged))
            .map_err(|e| Error::Configuration(format!("Invalid configuration: {}", e)))?;
        Ok((config, used))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pad_width == 0 || self.pad_width > MAX_PAD_WIDTH {
            return Err(Error::Configuration(format!(
                "pad_width must be between 1 and {}",
                MAX_PAD_WIDTH
            )));
        }

        if let Some(prefix) = &self.subject_prefix {
            if prefix.is_empty() {
                return Err(Error::Configuration("subject_prefix must not be empty".to_string()));
            }
            // Digits would be read as part of the subject number
            if prefix.chars().any(|c| c.is_ascii_digit() || std::path::is_separator(c)) {
                return Err(Error::Configuration(format!(
                    "subject_prefix '{}' must not contain digits or path separators",
                    prefix
                )));
            }
        }

        if !self.directory_structure.has_required_layout() {
            return Err(Error::Configuration(
                "directory_structure must contain RAW/DICOM and META".to_string(),
            ));
        }

        Ok(())
    }

    /// The data root, which every subject operation needs
    pub fn data_root(&self) -> Result<&Path> {
        self.data_root
            .as_deref()
            .ok_or_else(|| Error::Configuration("No data root configured".to_string()))
    }
}
