use std::path::Path;
use std::time::Duration;

use crate::types::{EncoderStats, ReaderStats};

/// Telemetry contract for pipeline workers.
///
/// Workers call these hooks to surface progress without depending on a
/// specific backend. Strictly observational: no hook may influence pipeline
/// behavior.
pub trait PipelineTelemetry: Send + Sync {
    fn on_sample_read(&self, reader_id: usize);
    fn on_record_skipped_at_read(&self, reader_id: usize);
    fn on_sample_encoded(&self, worker_id: usize, elapsed: Duration);
    fn on_sample_skipped(&self, worker_id: usize, reason: &str);
    fn on_shard_opened(&self, worker_id: usize, path: &Path);
    fn on_shard_closed(&self, worker_id: usize, path: &Path, records: u64);
    fn on_reader_finished(&self, stats: &ReaderStats);
    fn on_encoder_finished(&self, stats: &EncoderStats);
}

/// Default telemetry backend that reports through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPipelineTelemetry;

impl PipelineTelemetry for DefaultPipelineTelemetry {
    fn on_sample_read(&self, _reader_id: usize) {}

    fn on_record_skipped_at_read(&self, reader_id: usize) {
        tracing::debug!(reader_id, "skipped malformed source record");
    }

    fn on_sample_encoded(&self, _worker_id: usize, _elapsed: Duration) {}

    fn on_sample_skipped(&self, worker_id: usize, reason: &str) {
        tracing::debug!(worker_id, reason, "skipped sample during encoding");
    }

    fn on_shard_opened(&self, worker_id: usize, path: &Path) {
        tracing::debug!(worker_id, path = %path.display(), "opened shard file");
    }

    fn on_shard_closed(&self, worker_id: usize, path: &Path, records: u64) {
        tracing::debug!(worker_id, path = %path.display(), records, "closed shard file");
    }

    fn on_reader_finished(&self, stats: &ReaderStats) {
        tracing::info!(
            reader_id = stats.reader_id,
            samples_read = stats.samples_read,
            records_skipped = stats.records_skipped,
            failed = stats.failed,
            "reader finished"
        );
    }

    fn on_encoder_finished(&self, stats: &EncoderStats) {
        tracing::info!(
            worker_id = stats.worker_id,
            samples_encoded = stats.samples_encoded,
            samples_skipped = stats.samples_skipped,
            files_written = stats.files_written,
            failed = stats.failed,
            "encoder finished"
        );
    }
}
