use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::config::DatasetConfig;
use crate::error::NanoshardError;
use crate::types::{PcmAudio, Result};

/// Sample rate raw audio is normalized to when the source does not say.
pub const DEFAULT_SAMPLE_RATE: u32 = 22_050;

/// One column value as exposed by a sample source, before column mapping.
#[derive(Debug, Clone)]
pub enum ColumnValue {
    Text(String),
    Audio(PcmAudio),
}

/// One raw source record: a bag of named columns.
#[derive(Debug, Clone, Default)]
pub struct SourceRecord {
    pub columns: BTreeMap<String, ColumnValue>,
}

impl SourceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, column: &str, value: impl Into<String>) -> Self {
        self.columns
            .insert(column.to_string(), ColumnValue::Text(value.into()));
        self
    }

    pub fn with_audio(mut self, column: &str, audio: PcmAudio) -> Self {
        self.columns
            .insert(column.to_string(), ColumnValue::Audio(audio));
        self
    }
}

/// A finite, lazily-produced sequence of records, partitionable by index.
///
/// Partition `index` of `count` yields source indices
/// `index, index + count, index + 2*count, ...` so the partitions are
/// pairwise disjoint and jointly exhaustive: every record is read by exactly
/// one reader.
pub trait SampleSource: Send + Sync {
    fn partition(
        &self,
        index: usize,
        count: usize,
    ) -> Box<dyn Iterator<Item = Result<SourceRecord>> + Send + '_>;
}

/// Opens the sample source for one configured dataset.
///
/// The seam where remote catalogs plug in; the pipeline itself only ever
/// sees the `SampleSource` it returns.
pub trait SourceProvider: Send + Sync {
    fn open(&self, dataset: &DatasetConfig) -> Result<Arc<dyn SampleSource>>;
}

/// In-memory source, mainly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    records: Vec<SourceRecord>,
}

impl MemorySource {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl SampleSource for MemorySource {
    fn partition(
        &self,
        index: usize,
        count: usize,
    ) -> Box<dyn Iterator<Item = Result<SourceRecord>> + Send + '_> {
        let count = count.max(1);
        Box::new(
            self.records
                .iter()
                .skip(index)
                .step_by(count)
                .cloned()
                .map(Ok),
        )
    }
}

/// Line-delimited JSON source: one record object per line.
///
/// Audio columns follow the `{"array": [...], "sampling_rate": n}` shape or
/// a bare number array; everything else is treated as text. A line that does
/// not parse is yielded as a malformed-record error so readers can skip and
/// count it; an unreadable file is a fatal source error.
#[derive(Debug, Clone)]
pub struct JsonlSource {
    path: PathBuf,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse_line(line: &str) -> Result<SourceRecord> {
        let value: Value = serde_json::from_str(line)
            .map_err(|err| NanoshardError::MalformedRecord(err.to_string()))?;
        let object = value.as_object().ok_or_else(|| {
            NanoshardError::MalformedRecord("record line is not a JSON object".to_string())
        })?;

        let mut record = SourceRecord::new();
        for (key, value) in object {
            match value {
                Value::Null => {}
                Value::String(text) => {
                    record
                        .columns
                        .insert(key.clone(), ColumnValue::Text(text.clone()));
                }
                Value::Array(_) => {
                    let audio = parse_audio(value, DEFAULT_SAMPLE_RATE)?;
                    record.columns.insert(key.clone(), ColumnValue::Audio(audio));
                }
                Value::Object(map) if map.contains_key("array") => {
                    let rate = map
                        .get("sampling_rate")
                        .and_then(Value::as_u64)
                        .map(|rate| rate as u32)
                        .unwrap_or(DEFAULT_SAMPLE_RATE);
                    let audio = parse_audio(
                        map.get("array").unwrap_or(&Value::Null),
                        rate,
                    )?;
                    record.columns.insert(key.clone(), ColumnValue::Audio(audio));
                }
                other => {
                    record
                        .columns
                        .insert(key.clone(), ColumnValue::Text(other.to_string()));
                }
            }
        }
        Ok(record)
    }
}

fn parse_audio(value: &Value, sample_rate: u32) -> Result<PcmAudio> {
    let items = value.as_array().ok_or_else(|| {
        NanoshardError::MalformedRecord("audio column is not a number array".to_string())
    })?;
    let mut samples = Vec::with_capacity(items.len());
    for item in items {
        let sample = item.as_f64().ok_or_else(|| {
            NanoshardError::MalformedRecord("audio array holds a non-number".to_string())
        })?;
        samples.push(sample as f32);
    }
    Ok(PcmAudio::new(samples, sample_rate))
}

impl SampleSource for JsonlSource {
    fn partition(
        &self,
        index: usize,
        count: usize,
    ) -> Box<dyn Iterator<Item = Result<SourceRecord>> + Send + '_> {
        let count = count.max(1);
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) => {
                let message = format!("{}: {err}", self.path.display());
                return Box::new(std::iter::once(Err(NanoshardError::SourceUnavailable(
                    message,
                ))));
            }
        };

        let lines = BufReader::new(file).lines();
        Box::new(
            lines
                .enumerate()
                .filter(move |(line_no, _)| line_no % count == index)
                .map(|(_, line)| match line {
                    Ok(line) => JsonlSource::parse_line(&line),
                    Err(err) => Err(NanoshardError::SourceUnavailable(err.to_string())),
                }),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn record(i: usize) -> SourceRecord {
        SourceRecord::new()
            .with_text("text", format!("utterance {i}"))
            .with_audio("audio", PcmAudio::new(vec![0.1; 8], DEFAULT_SAMPLE_RATE))
    }

    #[test]
    fn strided_partitions_are_disjoint_and_exhaustive() {
        let source = MemorySource::new((0..10).map(record).collect());
        let mut seen = Vec::new();
        for index in 0..3 {
            for item in source.partition(index, 3) {
                let record = item.expect("memory records are valid");
                match record.columns.get("text") {
                    Some(ColumnValue::Text(text)) => seen.push(text.clone()),
                    other => panic!("expected text column, got {other:?}"),
                }
            }
        }
        seen.sort();
        let mut expected: Vec<String> = (0..10).map(|i| format!("utterance {i}")).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn jsonl_lines_parse_audio_objects() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"{{"text": "hi", "audio": {{"array": [0.5, -0.5], "sampling_rate": 16000}}}}"#
        )
        .expect("write line");
        file.flush().expect("flush");

        let source = JsonlSource::new(file.path());
        let records: Vec<_> = source.partition(0, 1).collect();
        assert_eq!(records.len(), 1);
        let record = records[0].as_ref().expect("valid record");
        match record.columns.get("audio") {
            Some(ColumnValue::Audio(audio)) => {
                assert_eq!(audio.samples, vec![0.5, -0.5]);
                assert_eq!(audio.sample_rate, 16000);
            }
            other => panic!("expected audio column, got {other:?}"),
        }
    }

    #[test]
    fn malformed_jsonl_line_is_a_skippable_error() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "{{not json").expect("write line");
        writeln!(file, r#"{{"text": "ok", "audio": [0.1]}}"#).expect("write line");
        file.flush().expect("flush");

        let source = JsonlSource::new(file.path());
        let records: Vec<_> = source.partition(0, 1).collect();
        assert_eq!(records.len(), 2);
        assert!(matches!(
            records[0],
            Err(NanoshardError::MalformedRecord(_))
        ));
        assert!(records[1].is_ok());
    }

    #[test]
    fn missing_file_is_a_fatal_source_error() {
        let source = JsonlSource::new("/nonexistent/records.jsonl");
        let records: Vec<_> = source.partition(0, 2).collect();
        assert_eq!(records.len(), 1);
        assert!(matches!(
            records[0],
            Err(NanoshardError::SourceUnavailable(_))
        ));
    }
}
