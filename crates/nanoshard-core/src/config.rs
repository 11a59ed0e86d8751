use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::NanoshardError;
use crate::types::Result;

fn default_num_readers() -> usize {
    4
}

fn default_qsize() -> usize {
    256
}

fn default_lines_per_file() -> usize {
    10_000
}

fn default_gzip_level() -> u32 {
    6
}

fn default_buffer_size() -> usize {
    1024 * 1024
}

fn default_batch_size() -> usize {
    8
}

fn default_batch_wait_ms() -> u64 {
    200
}

fn default_split() -> String {
    "train".to_string()
}

/// Core pipeline knobs, shared across every dataset in a run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseSettings {
    /// Number of parallel reader workers per dataset.
    #[serde(default = "default_num_readers")]
    pub num_readers: usize,
    /// Work queue capacity; the memory/latency tradeoff knob.
    #[serde(default = "default_qsize")]
    pub qsize: usize,
    /// Records per shard file before rotation.
    #[serde(default = "default_lines_per_file")]
    pub lines_per_file: usize,
    /// Directory receiving all shard files.
    pub out_dir: PathBuf,
    /// Gzip compression level for shard files (0-9).
    #[serde(default = "default_gzip_level")]
    pub gzip_level: u32,
    /// Write buffer size in bytes between the gzip stream and the file.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum samples per codec batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum milliseconds a non-empty batch waits before encoding.
    #[serde(default = "default_batch_wait_ms")]
    pub batch_wait_ms: u64,
}

/// Where the assembled dataset goes; either sink may be disabled.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaveSettings {
    /// Local path for the assembled dataset, if any.
    #[serde(default)]
    pub local: Option<PathBuf>,
    /// Remote catalog identifier for upload, if any.
    #[serde(default)]
    pub catalog: Option<String>,
}

impl SaveSettings {
    pub fn is_disabled(&self) -> bool {
        self.local.is_none() && self.catalog.is_none()
    }
}

/// One dataset to process: where it lives and how its columns map onto the
/// output schema.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub name: String,
    /// Subset/configuration selector passed through to the source.
    #[serde(default)]
    pub sub_name: Option<String>,
    #[serde(default = "default_split")]
    pub split: String,
    pub text_column: String,
    pub audio_column: String,
    #[serde(default)]
    pub speaker_column: Option<String>,
    /// Constant string fields injected into every record of this dataset.
    #[serde(default)]
    pub constant_fields: BTreeMap<String, String>,
}

impl DatasetConfig {
    /// Shard filename prefix: the last `/`-separated segment of the name.
    pub fn dataset_prefix(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// Fully validated run configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub base: BaseSettings,
    #[serde(default)]
    pub save: SaveSettings,
    #[serde(rename = "dataset")]
    pub datasets: Vec<DatasetConfig>,
}

impl PipelineConfig {
    /// Loads and validates a TOML config file, failing fast on unknown keys.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|err| NanoshardError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation: structural limits plus cross-dataset constant-field
    /// agreement, so the assembled dataset cannot end up with a ragged schema.
    pub fn validate(&self) -> Result<()> {
        if self.datasets.is_empty() {
            return Err(NanoshardError::InvalidConfig(
                "no datasets configured".to_string(),
            ));
        }
        if self.base.num_readers == 0 {
            return Err(NanoshardError::InvalidConfig(
                "num_readers must be at least 1".to_string(),
            ));
        }
        if self.base.qsize == 0 {
            return Err(NanoshardError::InvalidConfig(
                "qsize must be at least 1".to_string(),
            ));
        }
        if self.base.lines_per_file == 0 {
            return Err(NanoshardError::InvalidConfig(
                "lines_per_file must be at least 1".to_string(),
            ));
        }
        if self.base.gzip_level > 9 {
            return Err(NanoshardError::InvalidConfig(format!(
                "gzip_level {} out of range 0-9",
                self.base.gzip_level
            )));
        }
        if self.base.batch_size == 0 {
            return Err(NanoshardError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }

        let all_keys: BTreeSet<&str> = self
            .datasets
            .iter()
            .flat_map(|ds| ds.constant_fields.keys().map(String::as_str))
            .collect();
        for dataset in &self.datasets {
            let keys: BTreeSet<&str> = dataset
                .constant_fields
                .keys()
                .map(String::as_str)
                .collect();
            let missing: Vec<&str> = all_keys.difference(&keys).copied().collect();
            if !missing.is_empty() {
                return Err(NanoshardError::InvalidConfig(format!(
                    "dataset '{}' is missing constant fields {:?}; every dataset must declare \
                     the same constant fields so the assembled dataset has one schema",
                    dataset.name, missing
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [base]
        out_dir = "out"

        [[dataset]]
        name = "corpora/voices-en"
        text_column = "text"
        audio_column = "audio"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = PipelineConfig::from_toml_str(MINIMAL).expect("valid config");
        assert_eq!(config.base.num_readers, 4);
        assert_eq!(config.base.qsize, 256);
        assert_eq!(config.base.lines_per_file, 10_000);
        assert_eq!(config.base.gzip_level, 6);
        assert!(config.save.is_disabled());
        assert_eq!(config.datasets[0].split, "train");
    }

    #[test]
    fn dataset_prefix_is_last_path_segment() {
        let config = PipelineConfig::from_toml_str(MINIMAL).expect("valid config");
        assert_eq!(config.datasets[0].dataset_prefix(), "voices-en");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = r#"
            [base]
            out_dir = "out"
            lines_per_shard = 100

            [[dataset]]
            name = "d"
            text_column = "text"
            audio_column = "audio"
        "#;
        assert!(matches!(
            PipelineConfig::from_toml_str(raw),
            Err(NanoshardError::InvalidConfig(_))
        ));
    }

    #[test]
    fn empty_dataset_list_is_rejected() {
        let raw = r#"
            [base]
            out_dir = "out"
        "#;
        assert!(PipelineConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn mismatched_constant_fields_are_rejected() {
        let raw = r#"
            [base]
            out_dir = "out"

            [[dataset]]
            name = "a"
            text_column = "text"
            audio_column = "audio"
            constant_fields = { lang = "en" }

            [[dataset]]
            name = "b"
            text_column = "text"
            audio_column = "audio"
        "#;
        let err = PipelineConfig::from_toml_str(raw).expect_err("must fail");
        assert!(err.to_string().contains("constant fields"));
    }

    #[test]
    fn gzip_level_out_of_range_is_rejected() {
        let raw = r#"
            [base]
            out_dir = "out"
            gzip_level = 12

            [[dataset]]
            name = "a"
            text_column = "text"
            audio_column = "audio"
        "#;
        assert!(PipelineConfig::from_toml_str(raw).is_err());
    }
}
