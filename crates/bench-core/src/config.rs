use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Free-form options attached to a rate or invoker descriptor.
pub type Options = BTreeMap<String, serde_yaml::Value>;

/// Root of the YAML benchmark descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Output filename; `$date` and `$name` are substituted.
    pub output: String,
    pub workload: WorkloadConfig,
}

impl BenchmarkConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut contents = String::new();
        reader.read_to_string(&mut contents)?;
        Self::from_str(&contents)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub name: String,
    /// URL or platform identifier, inherited by every phase.
    pub target: String,
    pub invoker: InvokerConfig,
    pub phases: Vec<PhaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    pub threads: usize,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(rename = "hatchRate")]
    pub hatch_rate: HatchRateConfig,
}

impl PhaseConfig {
    pub fn timeout(&self) -> Result<Option<Duration>> {
        self.timeout.as_deref().map(parse_duration).transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HatchRateConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: Options,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: Options,
}

/// Parse a `"15s"` / `"2m"` style duration string.
pub fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|err| anyhow!("invalid duration {value:?}: {err}"))
}

/// Fail with the canonical missing-option error unless all `keys` are present.
pub fn require_options(kind: &str, options: &Options, keys: &[&str]) -> Result<()> {
    for key in keys {
        if !options.contains_key(*key) {
            bail!("missing values for {kind}");
        }
    }
    Ok(())
}

pub fn flag_option(options: &Options, key: &str, default: bool) -> bool {
    options
        .get(key)
        .and_then(serde_yaml::Value::as_bool)
        .unwrap_or(default)
}

pub fn u64_option(options: &Options, key: &str) -> Result<u64> {
    options
        .get(key)
        .and_then(serde_yaml::Value::as_u64)
        .ok_or_else(|| anyhow!("option {key} must be a non-negative integer"))
}

pub fn f64_option(options: &Options, key: &str) -> Result<f64> {
    options
        .get(key)
        .and_then(serde_yaml::Value::as_f64)
        .ok_or_else(|| anyhow!("option {key} must be a number"))
}

pub fn str_option(options: &Options, key: &str) -> Option<String> {
    options
        .get(key)
        .and_then(serde_yaml::Value::as_str)
        .map(str::to_string)
}

pub fn duration_option(options: &Options, key: &str) -> Result<Duration> {
    let value = str_option(options, key)
        .ok_or_else(|| anyhow!("option {key} must be a duration string"))?;
    parse_duration(&value)
}

/// Substitute `$date` (YYYY_MM_DD) and `$name` in an output filename.
pub fn render_output_path(template: &str, name: &str, date: NaiveDate) -> String {
    template
        .replace("$name", name)
        .replace("$date", &date.format("%Y_%m_%d").to_string())
}
