use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use nanoshard_core::{
    inspect_shard, Assembler, DatasetConfig, FrameHashCodecFactory, JsonlSource, LocalDiskSink,
    NanoshardError, PersistenceSink, Pipeline, PipelineConfig, RunReport, SampleSource,
    SourceProvider,
};

#[derive(Parser)]
#[command(
    name = "nanoshard",
    version,
    about = "Audio tokenization pipeline CLI",
    long_about = "Encode audio datasets into gzip jsonl token shards and assemble them."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every configured dataset, then assemble the final dataset.
    Run {
        /// Pipeline configuration file (TOML).
        #[arg(short, long, default_value = "nanoshard.toml")]
        config: PathBuf,

        /// Directory containing local jsonl dataset files.
        #[arg(long, default_value = ".")]
        data_root: PathBuf,

        /// Number of encoder devices (defaults to environment discovery).
        #[arg(long)]
        devices: Option<usize>,

        /// Progress refresh interval in milliseconds.
        #[arg(long, default_value_t = 250)]
        stats_interval_ms: u64,
    },
    /// Assemble existing shards from an output directory without encoding.
    Assemble {
        /// Directory holding the shard files.
        out_dir: PathBuf,

        /// Destination for the assembled dataset.
        #[arg(short, long)]
        local: Option<PathBuf>,
    },
    /// Validate that a shard file decompresses cleanly and is well formed.
    Inspect {
        /// Shard file to check.
        shard: PathBuf,
    },
}

/// Opens dataset sources as local jsonl files under a root directory.
///
/// Looks for `<root>/<name>.jsonl` first, then `<root>/<name>/<split>.jsonl`.
/// Remote catalog sources are a deployment concern layered on the same trait.
struct LocalJsonlProvider {
    root: PathBuf,
}

impl SourceProvider for LocalJsonlProvider {
    fn open(
        &self,
        dataset: &DatasetConfig,
    ) -> nanoshard_core::Result<Arc<dyn SampleSource>> {
        let direct = self.root.join(format!("{}.jsonl", dataset.name));
        let split = self
            .root
            .join(&dataset.name)
            .join(format!("{}.jsonl", dataset.split));

        let path = if direct.is_file() {
            direct
        } else if split.is_file() {
            split
        } else {
            return Err(NanoshardError::SourceUnavailable(format!(
                "no jsonl file for dataset '{}' under {}",
                dataset.name,
                self.root.display()
            )));
        };

        tracing::info!(dataset = %dataset.name, path = %path.display(), "opening dataset");
        Ok(Arc::new(JsonlSource::new(path)))
    }
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            data_root,
            devices,
            stats_interval_ms,
        } => run_command(config, data_root, devices, stats_interval_ms)?,
        Commands::Assemble { out_dir, local } => assemble_command(out_dir, local)?,
        Commands::Inspect { shard } => inspect_command(&shard)?,
    }
    Ok(())
}

fn run_command(
    config_path: PathBuf,
    data_root: PathBuf,
    devices: Option<usize>,
    stats_interval_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::from_path(&config_path)?;
    let factory = match devices {
        Some(devices) => FrameHashCodecFactory::new(devices),
        None => FrameHashCodecFactory::from_env(),
    };

    let pipeline = Pipeline::new(config, Arc::new(factory));
    let provider = LocalJsonlProvider { root: data_root };

    println!("starting pipeline");
    println!("  config: {}", config_path.display());
    println!("  datasets: {}", pipeline.config().datasets.len());
    println!("  readers: {}", pipeline.config().base.num_readers);
    println!("  encoder workers: {}", pipeline.encoder_workers());
    println!("  queue capacity: {}", pipeline.config().base.qsize);
    println!(
        "  lines per file: {}",
        pipeline.config().base.lines_per_file
    );
    println!(
        "  output: {}",
        pipeline.config().base.out_dir.display()
    );

    let bar = ProgressBar::new_spinner().with_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("static template is valid"),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    let interval = Duration::from_millis(stats_interval_ms.max(50));
    let report = pipeline.run_with_progress(&provider, interval, |snapshot| {
        bar.set_message(format!(
            "{}: read {} | encoded {} | skipped {} | queue {}/{}",
            snapshot.dataset_prefix,
            snapshot.samples_read,
            snapshot.samples_encoded,
            snapshot.samples_skipped,
            snapshot.queue_len,
            snapshot.queue_capacity,
        ));
    })?;
    bar.finish_and_clear();

    print_run_summary(&report);
    Ok(())
}

fn print_run_summary(report: &RunReport) {
    println!("pipeline complete");
    println!("  elapsed: {}", format_duration(report.elapsed));
    println!(
        "  assembled: {} records from {} shards",
        report.assembled_records, report.assembled_shards
    );
    for stats in &report.datasets {
        println!("  dataset {}:", stats.dataset_prefix);
        println!(
            "    read {} | encoded {} | skipped {} (+{} at read)",
            stats.samples_read,
            stats.samples_encoded,
            stats.samples_skipped,
            stats.records_skipped_at_read,
        );
        println!(
            "    files {} | size {} | elapsed {}",
            stats.files_written,
            format_bytes(stats.bytes_written),
            format_duration(stats.elapsed),
        );
        for encoder in &stats.encoders {
            println!(
                "    w{:02} encoded {:>8} | skipped {:>6} | files {:>4}{}",
                encoder.worker_id,
                encoder.samples_encoded,
                encoder.samples_skipped,
                encoder.files_written,
                if encoder.failed { " | FAILED" } else { "" },
            );
        }
    }
}

fn assemble_command(
    out_dir: PathBuf,
    local: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let assembled = Assembler::new(&out_dir).assemble()?;
    println!("assembled {} records from {} shards", assembled.len(), assembled.shard_files);
    println!("  schema: {:?}", assembled.schema);

    if let Some(local) = local {
        LocalDiskSink::new(&local).persist(&assembled)?;
        println!("  saved to: {}", local.display());
    }
    Ok(())
}

fn inspect_command(shard: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let report = inspect_shard(shard)?;
    println!("shard ok");
    println!("  path: {}", report.path.display());
    println!("  records: {}", report.records);
    println!("  fields: {:?}", report.fields);
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let millis = duration.subsec_millis();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else if minutes > 0 {
        format!("{minutes:02}:{seconds:02}")
    } else {
        format!("{seconds}.{millis:03}s")
    }
}
