use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::codec::{AudioCodec, CodecFactory};
use crate::queue::{BoundedQueue, QueueItem};
use crate::telemetry::PipelineTelemetry;
use crate::types::{EncodedSample, EncoderStats, PcmAudio, RawSample};
use crate::writer::ShardWriter;

/// How long an idle encoder parks between queue polls while waiting for work
/// or for the drain condition to come true.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Batch accumulation policy: encode once the batch holds `max_samples`, or
/// once `max_wait` has passed since its first sample.
#[derive(Debug, Clone, Copy)]
pub struct BatchPolicy {
    pub max_samples: usize,
    pub max_wait: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_samples: 8,
            max_wait: Duration::from_millis(200),
        }
    }
}

/// Everything an encoder worker needs beyond the queue and its codec.
#[derive(Debug, Clone)]
pub struct EncoderPoolOptions {
    pub out_dir: PathBuf,
    pub dataset_prefix: String,
    pub gzip_level: u32,
    pub buffer_size: usize,
    pub lines_per_file: usize,
    pub batch: BatchPolicy,
    /// Sentinels to observe before draining: one per reader.
    pub expected_sentinels: usize,
}

/// Worker lifecycle; `Draining -> Terminated` is guarded solely by
/// "all sentinels observed and the queue is empty".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Starting,
    Running,
    Draining,
    Terminated,
}

/// Handle over the spawned encoder threads for one dataset.
pub struct EncoderPoolHandle {
    handles: Vec<JoinHandle<EncoderStats>>,
    encoded: Vec<Arc<AtomicU64>>,
    skipped: Vec<Arc<AtomicU64>>,
}

impl EncoderPoolHandle {
    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    pub fn encoded_total(&self) -> u64 {
        self.encoded
            .iter()
            .map(|counter| counter.load(Ordering::Acquire))
            .sum()
    }

    pub fn skipped_total(&self) -> u64 {
        self.skipped
            .iter()
            .map(|counter| counter.load(Ordering::Acquire))
            .sum()
    }

    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(JoinHandle::is_finished)
    }

    /// Joins every encoder and returns their final counters.
    pub fn join(self) -> Vec<EncoderStats> {
        let mut all = Vec::with_capacity(self.handles.len());
        for (worker_id, handle) in self.handles.into_iter().enumerate() {
            match handle.join() {
                Ok(stats) => all.push(stats),
                Err(_) => {
                    tracing::error!(worker_id, "encoder thread panicked");
                    all.push(EncoderStats {
                        worker_id,
                        failed: true,
                        ..EncoderStats::default()
                    });
                }
            }
        }
        all
    }
}

/// Spawns one encoder worker per visible device, or a single host worker when
/// none is visible. Each worker owns its codec instance and its shard writer
/// for its whole lifetime; the device is never shared.
pub fn spawn_encoders(
    factory: Arc<dyn CodecFactory>,
    queue: &BoundedQueue,
    options: EncoderPoolOptions,
    telemetry: Arc<dyn PipelineTelemetry>,
) -> EncoderPoolHandle {
    let num_workers = factory.device_count().max(1);
    let sentinels_seen = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::with_capacity(num_workers);
    let mut encoded = Vec::with_capacity(num_workers);
    let mut skipped = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let encoded_counter = Arc::new(AtomicU64::new(0));
        let skipped_counter = Arc::new(AtomicU64::new(0));
        encoded.push(Arc::clone(&encoded_counter));
        skipped.push(Arc::clone(&skipped_counter));

        let factory = Arc::clone(&factory);
        let queue = queue.clone();
        let options = options.clone();
        let sentinels_seen = Arc::clone(&sentinels_seen);
        let telemetry = Arc::clone(&telemetry);

        let handle = thread::spawn(move || {
            run_encoder(
                worker_id,
                factory,
                queue,
                options,
                sentinels_seen,
                encoded_counter,
                skipped_counter,
                telemetry,
            )
        });
        handles.push(handle);
    }

    EncoderPoolHandle {
        handles,
        encoded,
        skipped,
    }
}

#[allow(clippy::too_many_arguments)]
fn run_encoder(
    worker_id: usize,
    factory: Arc<dyn CodecFactory>,
    queue: BoundedQueue,
    options: EncoderPoolOptions,
    sentinels_seen: Arc<AtomicUsize>,
    encoded_counter: Arc<AtomicU64>,
    skipped_counter: Arc<AtomicU64>,
    telemetry: Arc<dyn PipelineTelemetry>,
) -> EncoderStats {
    let mut stats = EncoderStats {
        worker_id,
        ..EncoderStats::default()
    };
    let mut state = WorkerState::Starting;
    tracing::debug!(worker_id, ?state, "encoder starting");

    let mut codec = match factory.open(worker_id) {
        Ok(codec) => codec,
        Err(err) => {
            // The worker is lost but the pipeline must still drain: keep
            // consuming so readers never block on a full queue forever.
            tracing::error!(worker_id, error = %err, "codec init failed, draining without encoding");
            stats.failed = true;
            drain_discard(
                &queue,
                &sentinels_seen,
                options.expected_sentinels,
                &mut stats,
                &skipped_counter,
            );
            telemetry.on_encoder_finished(&stats);
            return stats;
        }
    };

    let mut writer = ShardWriter::new(
        &options.out_dir,
        &options.dataset_prefix,
        worker_id,
        options.gzip_level,
        options.buffer_size,
        options.lines_per_file,
        Arc::clone(&telemetry),
    );

    state = WorkerState::Running;
    tracing::debug!(worker_id, ?state, "encoder ready");

    let mut batch: Vec<RawSample> = Vec::with_capacity(options.batch.max_samples);
    let mut batch_started: Option<Instant> = None;

    loop {
        if state == WorkerState::Running
            && sentinels_seen.load(Ordering::Acquire) >= options.expected_sentinels
        {
            state = WorkerState::Draining;
            tracing::debug!(worker_id, ?state, "all readers finished, draining queue");
        }

        // Once every sentinel is in, FIFO order guarantees every sample has
        // already been dequeued by some worker; an empty queue means done.
        if state == WorkerState::Draining && queue.is_empty() {
            if !batch.is_empty() {
                if !flush_batch(
                    worker_id,
                    codec.as_mut(),
                    &mut writer,
                    &mut batch,
                    &mut stats,
                    &encoded_counter,
                    &skipped_counter,
                    &telemetry,
                ) {
                    break;
                }
            }
            state = WorkerState::Terminated;
            tracing::debug!(worker_id, ?state, "queue drained");
            break;
        }

        let wait = match batch_started {
            None => IDLE_POLL,
            Some(started) => {
                let deadline = started + options.batch.max_wait;
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    if !flush_batch(
                        worker_id,
                        codec.as_mut(),
                        &mut writer,
                        &mut batch,
                        &mut stats,
                        &encoded_counter,
                        &skipped_counter,
                        &telemetry,
                    ) {
                        break;
                    }
                    batch_started = None;
                    continue;
                }
                remaining.min(IDLE_POLL)
            }
        };

        match queue.get_timeout(wait) {
            Some(QueueItem::Sample(sample)) => {
                if batch.is_empty() {
                    batch_started = Some(Instant::now());
                }
                batch.push(*sample);
                if batch.len() >= options.batch.max_samples {
                    if !flush_batch(
                        worker_id,
                        codec.as_mut(),
                        &mut writer,
                        &mut batch,
                        &mut stats,
                        &encoded_counter,
                        &skipped_counter,
                        &telemetry,
                    ) {
                        break;
                    }
                    batch_started = None;
                }
            }
            Some(QueueItem::Done) => {
                sentinels_seen.fetch_add(1, Ordering::AcqRel);
            }
            None => {}
        }
    }

    if state != WorkerState::Terminated {
        // A write failure broke the loop; keep draining so producers and
        // sibling workers can still finish.
        stats.failed = true;
        drain_discard(
            &queue,
            &sentinels_seen,
            options.expected_sentinels,
            &mut stats,
            &skipped_counter,
        );
    }

    match writer.finish() {
        Ok(writer_stats) => {
            stats.files_written = writer_stats.files_written;
            stats.records_written = writer_stats.records_written;
            stats.bytes_written = writer_stats.bytes_written;
        }
        Err(err) => {
            tracing::error!(worker_id, error = %err, "failed to finalize shard writer");
            stats.failed = true;
        }
    }

    telemetry.on_encoder_finished(&stats);
    stats
}

/// Encodes the accumulated batch and writes every successful sample.
///
/// Per-sample codec failures are skipped and counted; the batch survives.
/// Returns false only on a writer failure, which is fatal for this worker.
#[allow(clippy::too_many_arguments)]
fn flush_batch(
    worker_id: usize,
    codec: &mut dyn AudioCodec,
    writer: &mut ShardWriter,
    batch: &mut Vec<RawSample>,
    stats: &mut EncoderStats,
    encoded_counter: &AtomicU64,
    skipped_counter: &AtomicU64,
    telemetry: &Arc<dyn PipelineTelemetry>,
) -> bool {
    type SampleMeta = (String, Option<String>, BTreeMap<String, String>);

    let mut metas: Vec<SampleMeta> = Vec::with_capacity(batch.len());
    let mut audios: Vec<PcmAudio> = Vec::with_capacity(batch.len());
    for sample in batch.drain(..) {
        metas.push((sample.text, sample.speaker, sample.extra_fields));
        audios.push(sample.audio);
    }

    let started = Instant::now();
    let results = codec.encode_batch(&audios);
    let elapsed = started.elapsed();

    for ((text, speaker, extra_fields), result) in metas.into_iter().zip(results) {
        match result {
            Ok(tokens) => {
                let record = EncodedSample::from_parts(text, speaker, extra_fields, tokens);
                if let Err(err) = writer.write(&record) {
                    tracing::error!(worker_id, error = %err, "shard write failed");
                    return false;
                }
                stats.samples_encoded += 1;
                encoded_counter.fetch_add(1, Ordering::AcqRel);
                telemetry.on_sample_encoded(worker_id, elapsed);
            }
            Err(err) => {
                tracing::warn!(worker_id, error = %err, "skipping sample the codec rejected");
                stats.samples_skipped += 1;
                skipped_counter.fetch_add(1, Ordering::AcqRel);
                telemetry.on_sample_skipped(worker_id, "codec");
            }
        }
    }

    true
}

/// Consumes and discards queue items until the drain condition holds, so a
/// dead worker cannot stall producers or sibling workers.
fn drain_discard(
    queue: &BoundedQueue,
    sentinels_seen: &AtomicUsize,
    expected_sentinels: usize,
    stats: &mut EncoderStats,
    skipped_counter: &AtomicU64,
) {
    loop {
        if sentinels_seen.load(Ordering::Acquire) >= expected_sentinels && queue.is_empty() {
            return;
        }
        match queue.get_timeout(IDLE_POLL) {
            Some(QueueItem::Sample(_)) => {
                stats.samples_skipped += 1;
                skipped_counter.fetch_add(1, Ordering::AcqRel);
            }
            Some(QueueItem::Done) => {
                sentinels_seen.fetch_add(1, Ordering::AcqRel);
            }
            None => {}
        }
    }
}
