use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::assemble::{AssembledDataset, Assembler, LocalDiskSink, PersistenceSink};
use crate::codec::CodecFactory;
use crate::config::{DatasetConfig, PipelineConfig};
use crate::encoder::{spawn_encoders, BatchPolicy, EncoderPoolOptions};
use crate::queue::BoundedQueue;
use crate::reader::spawn_readers;
use crate::source::{SampleSource, SourceProvider};
use crate::telemetry::{DefaultPipelineTelemetry, PipelineTelemetry};
use crate::types::{DatasetStats, ProgressSnapshot, Result};

/// Final accounting for one full run: every dataset processed, then one
/// assembly pass.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub datasets: Vec<DatasetStats>,
    pub assembled_records: usize,
    pub assembled_shards: usize,
    pub elapsed: Duration,
}

/// Orchestrates the reader and encoder pools for one dataset at a time.
///
/// Datasets run strictly sequentially, so peak memory is bounded by one
/// dataset's in-flight queue contents. Per dataset: spawn encoders, spawn
/// readers, join readers, join encoders (they exit once every reader sentinel
/// is observed and the queue is drained), then aggregate worker counters.
pub struct Pipeline {
    config: PipelineConfig,
    factory: Arc<dyn CodecFactory>,
    telemetry: Arc<dyn PipelineTelemetry>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, factory: Arc<dyn CodecFactory>) -> Self {
        Self::with_telemetry(config, factory, Arc::new(DefaultPipelineTelemetry))
    }

    pub fn with_telemetry(
        config: PipelineConfig,
        factory: Arc<dyn CodecFactory>,
        telemetry: Arc<dyn PipelineTelemetry>,
    ) -> Self {
        Self {
            config,
            factory,
            telemetry,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Number of encoder workers a run will use: one per device, or one host
    /// worker when no device is visible.
    pub fn encoder_workers(&self) -> usize {
        self.factory.device_count().max(1)
    }

    /// Processes every configured dataset, then assembles and persists.
    pub fn run(&self, provider: &dyn SourceProvider) -> Result<RunReport> {
        self.run_with_progress(provider, Duration::from_secs(3600), |_snapshot| {})
    }

    /// Like [`run`](Self::run), emitting a progress snapshot roughly every
    /// `progress_interval` while a dataset is in flight.
    pub fn run_with_progress<F>(
        &self,
        provider: &dyn SourceProvider,
        progress_interval: Duration,
        mut on_progress: F,
    ) -> Result<RunReport>
    where
        F: FnMut(ProgressSnapshot),
    {
        self.config.validate()?;
        fs::create_dir_all(&self.config.base.out_dir)?;

        let started = Instant::now();
        let mut datasets = Vec::with_capacity(self.config.datasets.len());

        for (index, dataset) in self.config.datasets.iter().enumerate() {
            tracing::info!(
                dataset = %dataset.name,
                prefix = dataset.dataset_prefix(),
                position = index + 1,
                total = self.config.datasets.len(),
                "processing dataset"
            );
            let source = provider.open(dataset)?;
            let stats = self.process_dataset_with_progress(
                dataset,
                source,
                progress_interval,
                &mut on_progress,
            )?;
            tracing::info!(
                dataset = %dataset.name,
                samples_encoded = stats.samples_encoded,
                samples_skipped = stats.samples_skipped,
                files = stats.files_written,
                bytes = stats.bytes_written,
                "dataset complete"
            );
            datasets.push(stats);
        }

        let assembled = self.assemble_and_persist()?;

        Ok(RunReport {
            datasets,
            assembled_records: assembled.len(),
            assembled_shards: assembled.shard_files,
            elapsed: started.elapsed(),
        })
    }

    /// Runs the reader and encoder pools for one dataset to completion.
    pub fn process_dataset(
        &self,
        dataset: &DatasetConfig,
        source: Arc<dyn SampleSource>,
    ) -> Result<DatasetStats> {
        self.process_dataset_with_progress(
            dataset,
            source,
            Duration::from_secs(3600),
            &mut |_snapshot| {},
        )
    }

    fn process_dataset_with_progress<F>(
        &self,
        dataset: &DatasetConfig,
        source: Arc<dyn SampleSource>,
        progress_interval: Duration,
        on_progress: &mut F,
    ) -> Result<DatasetStats>
    where
        F: FnMut(ProgressSnapshot),
    {
        let started = Instant::now();
        let base = &self.config.base;
        fs::create_dir_all(&base.out_dir)?;

        let queue = BoundedQueue::new(base.qsize);
        let options = EncoderPoolOptions {
            out_dir: base.out_dir.clone(),
            dataset_prefix: dataset.dataset_prefix().to_string(),
            gzip_level: base.gzip_level,
            buffer_size: base.buffer_size,
            lines_per_file: base.lines_per_file,
            batch: BatchPolicy {
                max_samples: base.batch_size,
                max_wait: Duration::from_millis(base.batch_wait_ms),
            },
            expected_sentinels: base.num_readers,
        };

        let encoders = spawn_encoders(
            Arc::clone(&self.factory),
            &queue,
            options,
            Arc::clone(&self.telemetry),
        );
        let readers = spawn_readers(
            source,
            dataset.clone(),
            &queue,
            base.num_readers,
            Arc::clone(&self.telemetry),
        );

        let poll = progress_interval.max(Duration::from_millis(50));
        let snapshot = |read: u64, encoded: u64, skipped: u64| ProgressSnapshot {
            dataset_prefix: dataset.dataset_prefix().to_string(),
            elapsed: started.elapsed(),
            samples_read: read,
            samples_encoded: encoded,
            samples_skipped: skipped,
            queue_len: queue.len(),
            queue_capacity: queue.capacity(),
        };

        let mut last_emit = Instant::now();
        let mut maybe_emit = |read: u64, encoded: u64, skipped: u64, on_progress: &mut F| {
            if last_emit.elapsed() >= poll {
                on_progress(snapshot(read, encoded, skipped));
                last_emit = Instant::now();
            }
        };

        while !readers.is_finished() {
            thread::sleep(Duration::from_millis(25));
            maybe_emit(
                readers.total_read(),
                encoders.encoded_total(),
                encoders.skipped_total(),
                on_progress,
            );
        }
        let reader_stats = readers.join(&queue);

        while !encoders.is_finished() {
            thread::sleep(Duration::from_millis(25));
            maybe_emit(
                reader_stats.iter().map(|r| r.samples_read).sum(),
                encoders.encoded_total(),
                encoders.skipped_total(),
                on_progress,
            );
        }
        let total_read: u64 = reader_stats.iter().map(|r| r.samples_read).sum();
        on_progress(snapshot(
            total_read,
            encoders.encoded_total(),
            encoders.skipped_total(),
        ));
        let encoder_stats = encoders.join();

        Ok(DatasetStats::aggregate(
            dataset.dataset_prefix().to_string(),
            started.elapsed(),
            reader_stats,
            encoder_stats,
        ))
    }

    /// Assembles all shards and hands the result to the configured sinks.
    ///
    /// Remote catalog upload is delegated to the deployment's catalog client;
    /// this pipeline only announces where the assembled dataset lives.
    pub fn assemble_and_persist(&self) -> Result<AssembledDataset> {
        let assembled = Assembler::new(&self.config.base.out_dir).assemble()?;
        tracing::info!(
            records = assembled.len(),
            shards = assembled.shard_files,
            "assembled final dataset"
        );

        if let Some(local) = &self.config.save.local {
            let sink = LocalDiskSink::new(local);
            sink.persist(&assembled)
                .map_err(|err| err.with_context(format!("sink '{}'", sink.name())))?;
        }
        if let Some(catalog) = &self.config.save.catalog {
            tracing::info!(
                catalog = %catalog,
                "catalog upload is delegated to the external catalog client"
            );
        }

        Ok(assembled)
    }
}
