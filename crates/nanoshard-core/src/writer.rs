use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::telemetry::PipelineTelemetry;
use crate::types::{EncodedSample, Result};

/// Totals for one writer's lifetime, reported when it is finished.
#[derive(Debug, Clone, Default)]
pub struct WriterStats {
    pub files_written: usize,
    pub records_written: u64,
    pub bytes_written: u64,
}

struct OpenShard {
    gz: GzEncoder<BufWriter<File>>,
    path: PathBuf,
    records: u64,
}

/// Appends encoded records to size-bounded gzip shard files.
///
/// Each record is one JSON object per line, written through a buffered gzip
/// stream. After `lines_per_file` records the current file is finalized and
/// the next index opened; a finalized shard is complete and independently
/// decompressible. Files open lazily on the first record, so a worker that
/// never receives work leaves nothing behind.
pub struct ShardWriter {
    out_dir: PathBuf,
    dataset_prefix: String,
    worker_id: usize,
    gzip_level: u32,
    buffer_size: usize,
    lines_per_file: usize,
    next_file_index: usize,
    current: Option<OpenShard>,
    stats: WriterStats,
    telemetry: Arc<dyn PipelineTelemetry>,
}

impl ShardWriter {
    pub fn new(
        out_dir: impl Into<PathBuf>,
        dataset_prefix: impl Into<String>,
        worker_id: usize,
        gzip_level: u32,
        buffer_size: usize,
        lines_per_file: usize,
        telemetry: Arc<dyn PipelineTelemetry>,
    ) -> Self {
        Self {
            out_dir: out_dir.into(),
            dataset_prefix: dataset_prefix.into(),
            worker_id,
            gzip_level: gzip_level.min(9),
            buffer_size: buffer_size.max(1),
            lines_per_file: lines_per_file.max(1),
            next_file_index: 0,
            current: None,
            stats: WriterStats::default(),
            telemetry,
        }
    }

    /// Shard filename for a `(prefix, worker, index)` identity. The worker id
    /// keeps two writers from ever colliding on a name, and the zero-padded
    /// index keeps discovery order lexicographic.
    pub fn shard_filename(dataset_prefix: &str, worker_id: usize, file_index: usize) -> String {
        format!("{dataset_prefix}-worker{worker_id:02}-{file_index:05}.jsonl.gz")
    }

    /// Index of the shard file the next record lands in.
    pub fn current_file_index(&self) -> usize {
        match self.current {
            Some(_) => self.next_file_index - 1,
            None => self.next_file_index,
        }
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Appends one record, rotating to a fresh shard when the current one is
    /// full.
    pub fn write(&mut self, sample: &EncodedSample) -> Result<()> {
        if self.current.is_none() {
            self.open_next()?;
        }

        let shard = self
            .current
            .as_mut()
            .expect("shard opened by the branch above");
        serde_json::to_writer(&mut shard.gz, sample)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        shard.gz.write_all(b"\n")?;
        shard.records += 1;
        self.stats.records_written += 1;

        if shard.records >= self.lines_per_file as u64 {
            self.close_current()?;
        }
        Ok(())
    }

    /// Finalizes the open shard, if any, and returns the lifetime totals.
    pub fn finish(mut self) -> Result<WriterStats> {
        self.close_current()?;
        Ok(self.stats.clone())
    }

    fn open_next(&mut self) -> Result<()> {
        let filename = Self::shard_filename(
            &self.dataset_prefix,
            self.worker_id,
            self.next_file_index,
        );
        let path = self.out_dir.join(filename);
        let file = File::create(&path)?;
        let buffered = BufWriter::with_capacity(self.buffer_size, file);
        let gz = GzEncoder::new(buffered, Compression::new(self.gzip_level));

        self.telemetry.on_shard_opened(self.worker_id, &path);
        self.next_file_index += 1;
        self.current = Some(OpenShard {
            gz,
            path,
            records: 0,
        });
        Ok(())
    }

    fn close_current(&mut self) -> Result<()> {
        let Some(shard) = self.current.take() else {
            return Ok(());
        };

        let mut buffered = shard.gz.finish()?;
        buffered.flush()?;
        drop(buffered);

        let bytes = fs::metadata(&shard.path).map(|meta| meta.len()).unwrap_or(0);
        self.stats.files_written += 1;
        self.stats.bytes_written += bytes;
        self.telemetry
            .on_shard_closed(self.worker_id, &shard.path, shard.records);
        Ok(())
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        // Best-effort flush on abnormal exit; a truncated final shard is an
        // accepted failure mode detected downstream.
        if self.current.is_some() {
            let _ = self.close_current();
        }
    }
}

/// True when `path` looks like a shard file produced by a [`ShardWriter`].
pub fn is_shard_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(".jsonl.gz"))
        .unwrap_or(false)
}
