use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::DatasetConfig;
use crate::error::{ErrorAction, NanoshardError};
use crate::queue::BoundedQueue;
use crate::source::{ColumnValue, SampleSource, SourceRecord};
use crate::telemetry::PipelineTelemetry;
use crate::types::{RawSample, ReaderStats, Result};

/// Maps one source record onto the output schema for `dataset`.
///
/// Pulls the configured text and audio columns, the optional speaker column,
/// and injects the dataset's constant fields. A missing or mistyped mapped
/// column is a malformed record, recovered by skip-and-count.
pub fn prepare_sample(dataset: &DatasetConfig, mut record: SourceRecord) -> Result<RawSample> {
    let text = match record.columns.remove(&dataset.text_column) {
        Some(ColumnValue::Text(text)) => text,
        Some(ColumnValue::Audio(_)) => {
            return Err(NanoshardError::MalformedRecord(format!(
                "column '{}' is audio, expected text",
                dataset.text_column
            )));
        }
        None => {
            return Err(NanoshardError::MalformedRecord(format!(
                "missing text column '{}'",
                dataset.text_column
            )));
        }
    };

    let audio = match record.columns.remove(&dataset.audio_column) {
        Some(ColumnValue::Audio(audio)) => audio,
        Some(ColumnValue::Text(_)) => {
            return Err(NanoshardError::MalformedRecord(format!(
                "column '{}' is text, expected audio",
                dataset.audio_column
            )));
        }
        None => {
            return Err(NanoshardError::MalformedRecord(format!(
                "missing audio column '{}'",
                dataset.audio_column
            )));
        }
    };

    let speaker = match &dataset.speaker_column {
        Some(column) => match record.columns.remove(column) {
            Some(ColumnValue::Text(speaker)) => Some(speaker),
            Some(ColumnValue::Audio(_)) => {
                return Err(NanoshardError::MalformedRecord(format!(
                    "column '{column}' is audio, expected a speaker label"
                )));
            }
            None => {
                return Err(NanoshardError::MalformedRecord(format!(
                    "missing speaker column '{column}'"
                )));
            }
        },
        None => None,
    };

    Ok(RawSample {
        text,
        audio,
        speaker,
        extra_fields: dataset.constant_fields.clone(),
    })
}

/// Handle over the spawned reader threads for one dataset.
pub struct ReaderPoolHandle {
    handles: Vec<JoinHandle<ReaderStats>>,
    counters: Vec<Arc<AtomicU64>>,
}

impl ReaderPoolHandle {
    /// Live per-reader read counts, safe to sample while readers run.
    pub fn read_counts(&self) -> Vec<u64> {
        self.counters
            .iter()
            .map(|counter| counter.load(Ordering::Acquire))
            .collect()
    }

    pub fn total_read(&self) -> u64 {
        self.read_counts().iter().sum()
    }

    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(JoinHandle::is_finished)
    }

    /// Joins every reader and returns their final counters.
    ///
    /// A panicked reader never delivered its sentinel, so its place in the
    /// sentinel count is repaired here; encoders always see one sentinel per
    /// reader.
    pub fn join(self, queue: &BoundedQueue) -> Vec<ReaderStats> {
        let mut all = Vec::with_capacity(self.handles.len());
        for (reader_id, handle) in self.handles.into_iter().enumerate() {
            match handle.join() {
                Ok(stats) => all.push(stats),
                Err(_) => {
                    tracing::error!(reader_id, "reader thread panicked");
                    let _ = queue.put_done();
                    all.push(ReaderStats {
                        reader_id,
                        failed: true,
                        ..ReaderStats::default()
                    });
                }
            }
        }
        all
    }
}

/// Spawns `num_readers` threads over disjoint strided partitions of `source`.
///
/// Every reader pushes exactly one sentinel on exit, including early exit
/// after a fatal source error, so downstream sentinel accounting always
/// completes.
pub fn spawn_readers(
    source: Arc<dyn SampleSource>,
    dataset: DatasetConfig,
    queue: &BoundedQueue,
    num_readers: usize,
    telemetry: Arc<dyn PipelineTelemetry>,
) -> ReaderPoolHandle {
    let num_readers = num_readers.max(1);
    let mut handles = Vec::with_capacity(num_readers);
    let mut counters = Vec::with_capacity(num_readers);

    for reader_id in 0..num_readers {
        let counter = Arc::new(AtomicU64::new(0));
        counters.push(Arc::clone(&counter));

        let source = Arc::clone(&source);
        let dataset = dataset.clone();
        let queue = queue.clone();
        let telemetry = Arc::clone(&telemetry);

        let handle = thread::spawn(move || {
            run_reader(reader_id, num_readers, source, dataset, queue, counter, telemetry)
        });
        handles.push(handle);
    }

    ReaderPoolHandle { handles, counters }
}

fn run_reader(
    reader_id: usize,
    num_readers: usize,
    source: Arc<dyn SampleSource>,
    dataset: DatasetConfig,
    queue: BoundedQueue,
    counter: Arc<AtomicU64>,
    telemetry: Arc<dyn PipelineTelemetry>,
) -> ReaderStats {
    let mut stats = ReaderStats {
        reader_id,
        ..ReaderStats::default()
    };

    for record in source.partition(reader_id, num_readers) {
        match record.and_then(|record| prepare_sample(&dataset, record)) {
            Ok(sample) => {
                if queue.put(sample).is_err() {
                    // All consumers are gone; nothing more to deliver.
                    tracing::error!(reader_id, "work queue closed, reader stopping early");
                    stats.failed = true;
                    break;
                }
                counter.fetch_add(1, Ordering::AcqRel);
                stats.samples_read += 1;
                telemetry.on_sample_read(reader_id);
            }
            Err(err) => match err.classify() {
                ErrorAction::SkipAndCount => {
                    tracing::warn!(reader_id, error = %err, "skipping malformed record");
                    stats.records_skipped += 1;
                    telemetry.on_record_skipped_at_read(reader_id);
                }
                ErrorAction::Fatal => {
                    tracing::error!(reader_id, error = %err, "reader failed, stopping early");
                    stats.failed = true;
                    break;
                }
            },
        }
    }

    // The sentinel must go out on every exit path or encoders would wait for
    // this reader forever.
    if queue.put_done().is_err() {
        tracing::error!(reader_id, "could not deliver reader sentinel");
    }
    telemetry.on_reader_finished(&stats);
    stats
}
