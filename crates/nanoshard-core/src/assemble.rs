use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use jwalk::WalkDir;
use rayon::prelude::*;
use serde_json::{Map, Value};

use crate::error::NanoshardError;
use crate::types::{EncodedSample, Result};
use crate::writer::is_shard_file;

/// The logical concatenation of every shard produced by a run, in shard
/// discovery order. Built once after all datasets finish; handed to sinks and
/// then discarded.
#[derive(Debug, Clone, Default)]
pub struct AssembledDataset {
    pub records: Vec<Map<String, Value>>,
    pub schema: BTreeSet<String>,
    pub shard_files: usize,
}

impl AssembledDataset {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Validation report for one shard file.
#[derive(Debug, Clone)]
pub struct ShardReport {
    pub path: PathBuf,
    pub records: usize,
    pub fields: BTreeSet<String>,
}

/// Receives the assembled dataset. Disk save and catalog upload both
/// implement this; either can be disabled by configuration.
pub trait PersistenceSink {
    fn name(&self) -> &str;
    fn persist(&self, dataset: &AssembledDataset) -> Result<()>;
}

/// Saves the assembled dataset as a single gzip jsonl file on local disk.
#[derive(Debug, Clone)]
pub struct LocalDiskSink {
    path: PathBuf,
}

impl LocalDiskSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PersistenceSink for LocalDiskSink {
    fn name(&self) -> &str {
        "local-disk"
    }

    fn persist(&self, dataset: &AssembledDataset) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.path)?;
        let mut gz = GzEncoder::new(BufWriter::new(file), Compression::default());
        for record in &dataset.records {
            serde_json::to_writer(&mut gz, record)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
            gz.write_all(b"\n")?;
        }
        let mut buffered = gz.finish()?;
        buffered.flush()?;
        tracing::info!(
            path = %self.path.display(),
            records = dataset.records.len(),
            "assembled dataset saved"
        );
        Ok(())
    }
}

/// Merges every shard under the output directory into one dataset.
#[derive(Debug, Clone)]
pub struct Assembler {
    out_dir: PathBuf,
}

impl Assembler {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    /// Every shard file under the output directory, lexicographically sorted
    /// so discovery order is reproducible across runs.
    pub fn discover_shards(&self) -> Result<Vec<PathBuf>> {
        let mut shards = Vec::new();
        for entry in WalkDir::new(&self.out_dir) {
            let entry = entry.map_err(anyhow::Error::from)?;
            let path = entry.path();
            if entry.file_type().is_file() && is_shard_file(&path) {
                shards.push(path);
            }
        }
        shards.sort();
        Ok(shards)
    }

    /// Decompresses and concatenates all shards, then validates that every
    /// record carries the same field names. Validation runs before any sink
    /// writes: a schema mismatch or truncated shard aborts assembly with
    /// nothing persisted.
    pub fn assemble(&self) -> Result<AssembledDataset> {
        let shards = self.discover_shards()?;
        tracing::info!(
            out_dir = %self.out_dir.display(),
            shard_files = shards.len(),
            "assembling dataset from shards"
        );

        let per_shard: Vec<(PathBuf, Vec<Map<String, Value>>)> = shards
            .par_iter()
            .map(|path| read_shard(path).map(|records| (path.clone(), records)))
            .collect::<Result<Vec<_>>>()?;

        let mut schema: Option<BTreeSet<String>> = None;
        let mut records = Vec::new();
        for (path, shard_records) in per_shard {
            for (index, record) in shard_records.into_iter().enumerate() {
                let fields: BTreeSet<String> = record.keys().cloned().collect();
                match &schema {
                    None => schema = Some(fields),
                    Some(expected) if *expected != fields => {
                        return Err(NanoshardError::SchemaMismatch(format!(
                            "record {index} in {} has fields {:?}, expected {:?}",
                            path.display(),
                            fields,
                            expected
                        )));
                    }
                    Some(_) => {}
                }
                records.push(record);
            }
        }

        Ok(AssembledDataset {
            records,
            schema: schema.unwrap_or_default(),
            shard_files: shards.len(),
        })
    }
}

fn read_shard(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let file = File::open(path)?;
    let reader = BufReader::new(MultiGzDecoder::new(file));
    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| {
            NanoshardError::ShardError(format!(
                "{}: line {line_no}: {err}",
                path.display()
            ))
        })?;
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line).map_err(|err| {
            NanoshardError::ShardError(format!(
                "{}: line {line_no}: {err}",
                path.display()
            ))
        })?;
        match value {
            Value::Object(map) => records.push(map),
            _ => {
                return Err(NanoshardError::ShardError(format!(
                    "{}: line {line_no}: record is not a JSON object",
                    path.display()
                )));
            }
        }
    }
    Ok(records)
}

/// Validates that one shard decompresses cleanly and that every record keeps
/// the equal-length layer invariant. This is the detection path for files
/// truncated by a crash mid-write.
pub fn inspect_shard(path: &Path) -> Result<ShardReport> {
    let file = File::open(path)?;
    let reader = BufReader::new(MultiGzDecoder::new(file));
    let mut records = 0usize;
    let mut fields = BTreeSet::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| {
            NanoshardError::ShardError(format!(
                "{}: line {line_no}: {err}",
                path.display()
            ))
        })?;
        if line.is_empty() {
            continue;
        }
        let record: EncodedSample = serde_json::from_str(&line).map_err(|err| {
            NanoshardError::ShardError(format!(
                "{}: line {line_no}: {err}",
                path.display()
            ))
        })?;
        if !record.layers_consistent() {
            return Err(NanoshardError::ShardError(format!(
                "{}: line {line_no}: encoded_len {} does not match layer lengths",
                path.display(),
                record.encoded_len
            )));
        }
        fields = record.field_names();
        records += 1;
    }

    Ok(ShardReport {
        path: path.to_path_buf(),
        records,
        fields,
    })
}
