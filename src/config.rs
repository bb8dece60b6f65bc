// =============================================================================
// CONFIGURATION - Load integration settings from a config file
// =============================================================================
//
// The file starts with plain `key=value` lines:
//
//     init_steps_x=100
//     init_steps_y=100
//     x_start=-50
//     x_end=50
//     ...
//
// Those lines are read the way a stream extraction of a double reads them:
// the value is the longest numeric prefix (`50.`, `.5` and `1e-7 # note` all
// work), the last occurrence of a key wins, and lines without a number are
// skipped. The required keys are then handed to TOML together with the
// optional `[gpu]` and `[debug]` tables that may follow.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Keys every configuration file must provide, in reporting order
pub const REQUIRED_KEYS: [&str; 9] = [
    "init_steps_x",
    "init_steps_y",
    "x_start",
    "x_end",
    "y_start",
    "y_end",
    "abs_err",
    "rel_err",
    "max_iter",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to open configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required parameter in configuration file: {0}")]
    MissingKey(&'static str),

    #[error("invalid value for {key}: {value} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: f64,
        reason: &'static str,
    },
}

/// Fully validated run configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub init_steps: [u64; 2],
    pub x_range: (f64, f64),
    pub y_range: (f64, f64),
    pub abs_err: f64,
    pub rel_err: f64,
    pub max_iter: u32,
    pub gpu: GpuConfig,
    pub debug: DebugConfig,
}

/// How the compute queue is driven
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Work-group counts along x and y (z is always 1)
    pub grid: [u32; 2],
    /// Number of (fence, semaphore) slots in the synchronization pool
    pub sync_slots: usize,
    pub timeline_semaphores: bool,
    pub dispatch: DispatchConfig,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            grid: [16, 16],
            sync_slots: 1,
            timeline_semaphores: false,
            dispatch: DispatchConfig::Sync,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchConfig {
    Sync,
    Async,
}

/// Debug settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_file: Option<String>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_file: None,
        }
    }
}

// Mirror of the file: every required key is optional here so a missing one
// can be named instead of surfacing as a generic serde error.
#[derive(Debug, Deserialize)]
struct RawConfig {
    init_steps_x: Option<f64>,
    init_steps_y: Option<f64>,
    x_start: Option<f64>,
    x_end: Option<f64>,
    y_start: Option<f64>,
    y_end: Option<f64>,
    abs_err: Option<f64>,
    rel_err: Option<f64>,
    max_iter: Option<f64>,
    #[serde(default)]
    gpu: GpuConfig,
    #[serde(default)]
    debug: DebugConfig,
}

impl RawConfig {
    fn value(&self, key: &'static str) -> Option<f64> {
        match key {
            "init_steps_x" => self.init_steps_x,
            "init_steps_y" => self.init_steps_y,
            "x_start" => self.x_start,
            "x_end" => self.x_end,
            "y_start" => self.y_start,
            "y_end" => self.y_end,
            "abs_err" => self.abs_err,
            "rel_err" => self.rel_err,
            "max_iter" => self.max_iter,
            _ => None,
        }
    }

    fn require(&self, key: &'static str) -> Result<f64, ConfigError> {
        let value = self.value(key).ok_or(ConfigError::MissingKey(key))?;
        if !value.is_finite() {
            return Err(ConfigError::InvalidValue {
                key,
                value,
                reason: "must be finite",
            });
        }
        Ok(value)
    }

    fn require_count(&self, key: &'static str) -> Result<u64, ConfigError> {
        let value = self.require(key)?;
        if value < 1.0 || value.fract() != 0.0 {
            return Err(ConfigError::InvalidValue {
                key,
                value,
                reason: "must be a positive integer",
            });
        }
        Ok(value as u64)
    }

    fn require_tolerance(&self, key: &'static str) -> Result<f64, ConfigError> {
        let value = self.require(key)?;
        if value < 0.0 {
            return Err(ConfigError::InvalidValue {
                key,
                value,
                reason: "must not be negative",
            });
        }
        Ok(value)
    }

    fn validate(self) -> Result<Config, ConfigError> {
        // Report the first absent key in the documented order
        if let Some(&key) = REQUIRED_KEYS.iter().find(|&&k| self.value(k).is_none()) {
            return Err(ConfigError::MissingKey(key));
        }

        let max_iter = self.require_count("max_iter")?;
        Ok(Config {
            init_steps: [
                self.require_count("init_steps_x")?,
                self.require_count("init_steps_y")?,
            ],
            x_range: (self.require("x_start")?, self.require("x_end")?),
            y_range: (self.require("y_start")?, self.require("y_end")?),
            abs_err: self.require_tolerance("abs_err")?,
            rel_err: self.require_tolerance("rel_err")?,
            max_iter: u32::try_from(max_iter).unwrap_or(u32::MAX),
            gpu: self.gpu,
            debug: self.debug,
        })
    }
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(&normalize_key_values(content)).map_err(|source| {
                ConfigError::Parse {
                    path: PathBuf::new(),
                    source,
                }
            })?;
        raw.validate()
    }
}

/// Rewrite the leading `key=value` block as TOML and pass the tables after
/// it through unchanged
fn normalize_key_values(content: &str) -> String {
    let mut values = BTreeMap::new();
    let mut tables = String::new();

    let mut lines = content.lines();
    for line in lines.by_ref() {
        if line.trim_start().starts_with('[') {
            tables.push_str(line);
            tables.push('\n');
            break;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if let Some(&key) = REQUIRED_KEYS.iter().find(|&&k| k == key.trim()) {
            if let Some(value) = leading_number(value) {
                values.insert(key, value);
            }
        }
    }
    for line in lines {
        tables.push_str(line);
        tables.push('\n');
    }

    let mut out = String::new();
    for (key, value) in values {
        // Debug formatting always yields a TOML float (`50.0`, `1e-7`)
        let _ = writeln!(out, "{key} = {value:?}");
    }
    out.push_str(&tables);
    out
}

/// Longest prefix of `text` (after leading whitespace) that reads as a
/// finite number
fn leading_number(text: &str) -> Option<f64> {
    let text = text.trim_start();
    let candidate = text
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E')))
        .map_or(text, |end| &text[..end]);
    (1..=candidate.len())
        .rev()
        .find_map(|end| candidate[..end].parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_VALUE_FILE: &str = "\
init_steps_x=100
init_steps_y=100
x_start=-50
x_end=50
y_start=-50
y_end=50
abs_err=0.000005
rel_err=0.0002
max_iter=20
";

    #[test]
    fn key_value_files_parse_as_toml() {
        let config = Config::from_toml_str(KEY_VALUE_FILE).unwrap();
        assert_eq!(config.init_steps, [100, 100]);
        assert_eq!(config.x_range, (-50.0, 50.0));
        assert_eq!(config.y_range, (-50.0, 50.0));
        assert_eq!(config.abs_err, 0.000005);
        assert_eq!(config.rel_err, 0.0002);
        assert_eq!(config.max_iter, 20);
        assert_eq!(config.gpu, GpuConfig::default());
        assert!(config.debug.validation_layers);
    }

    #[test]
    fn first_missing_key_is_reported() {
        let text = KEY_VALUE_FILE.replace("y_start=-50\n", "").replace("max_iter=20\n", "");
        match Config::from_toml_str(&text) {
            Err(ConfigError::MissingKey(key)) => assert_eq!(key, "y_start"),
            other => panic!("expected a missing key, got {other:?}"),
        }
    }

    #[test]
    fn optional_tables_override_defaults() {
        let text = format!(
            "{KEY_VALUE_FILE}\n[gpu]\ngrid = [8, 4]\nsync_slots = 3\n\
             timeline_semaphores = true\ndispatch = \"async\"\n\n\
             [debug]\nvalidation_layers = false\nlog_file = \"run.log\"\n"
        );
        let config = Config::from_toml_str(&text).unwrap();
        assert_eq!(config.gpu.grid, [8, 4]);
        assert_eq!(config.gpu.sync_slots, 3);
        assert!(config.gpu.timeline_semaphores);
        assert_eq!(config.gpu.dispatch, DispatchConfig::Async);
        assert!(!config.debug.validation_layers);
        assert_eq!(config.debug.log_file.as_deref(), Some("run.log"));
    }

    #[test]
    fn fractional_step_counts_are_rejected() {
        let text = KEY_VALUE_FILE.replace("init_steps_x=100", "init_steps_x=2.5");
        assert!(matches!(
            Config::from_toml_str(&text),
            Err(ConfigError::InvalidValue { key: "init_steps_x", .. })
        ));
    }

    #[test]
    fn negative_tolerances_are_rejected() {
        let text = KEY_VALUE_FILE.replace("rel_err=0.0002", "rel_err=-1");
        assert!(matches!(
            Config::from_toml_str(&text),
            Err(ConfigError::InvalidValue { key: "rel_err", .. })
        ));
    }

    #[test]
    fn lenient_numbers_are_accepted() {
        let text = KEY_VALUE_FILE
            .replace("x_end=50", "x_end=50.")
            .replace("abs_err=0.000005", "abs_err=.5")
            .replace("max_iter=20", "max_iter=20 # iteration cap");
        let config = Config::from_toml_str(&text).unwrap();
        assert_eq!(config.x_range, (-50.0, 50.0));
        assert_eq!(config.abs_err, 0.5);
        assert_eq!(config.max_iter, 20);
    }

    #[test]
    fn last_occurrence_of_a_key_wins() {
        let text = format!("{KEY_VALUE_FILE}rel_err=0.01\n");
        assert_eq!(Config::from_toml_str(&text).unwrap().rel_err, 0.01);
    }

    #[test]
    fn lines_without_a_number_are_skipped() {
        let text = format!("# integration settings\ntitle=ackley run\n\n{KEY_VALUE_FILE}");
        assert!(Config::from_toml_str(&text).is_ok());

        // A required key with no number behind it counts as missing
        let text = KEY_VALUE_FILE.replace("x_start=-50", "x_start=left");
        assert!(matches!(
            Config::from_toml_str(&text),
            Err(ConfigError::MissingKey("x_start"))
        ));
    }

    #[test]
    fn unreadable_file_is_a_read_error() {
        let err = Config::load_from_path("/definitely/not/here.cfg").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
