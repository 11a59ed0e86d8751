use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use nanoshard_core::{
    DefaultPipelineTelemetry, EncodedSample, ShardWriter, TokenLayers,
};
use tempfile::TempDir;

fn record(i: usize) -> EncodedSample {
    let tokens = TokenLayers::new([
        vec![i as u32; 3],
        vec![(i + 1) as u32; 3],
        vec![(i + 2) as u32; 3],
        vec![(i + 3) as u32; 3],
    ])
    .expect("valid layers");
    EncodedSample::from_parts(format!("utterance {i}"), None, BTreeMap::new(), tokens)
}

fn count_lines(path: &std::path::Path) -> usize {
    let reader = BufReader::new(MultiGzDecoder::new(File::open(path).expect("open shard")));
    reader.lines().map(|line| line.expect("read line")).count()
}

#[test]
fn rotates_after_lines_per_file_records() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let mut writer = ShardWriter::new(
        dir.path(),
        "voices",
        0,
        6,
        64 * 1024,
        10,
        Arc::new(DefaultPipelineTelemetry),
    );

    for i in 0..25 {
        writer.write(&record(i))?;
    }
    let stats = writer.finish()?;

    assert_eq!(stats.files_written, 3);
    assert_eq!(stats.records_written, 25);
    assert!(stats.bytes_written > 0);

    let expected = [
        ("voices-worker00-00000.jsonl.gz", 10),
        ("voices-worker00-00001.jsonl.gz", 10),
        ("voices-worker00-00002.jsonl.gz", 5),
    ];
    for (name, lines) in expected {
        let path = dir.path().join(name);
        assert!(path.exists(), "missing shard {name}");
        assert_eq!(count_lines(&path), lines, "wrong line count in {name}");
    }
    Ok(())
}

#[test]
fn closed_shards_are_independently_readable() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let mut writer = ShardWriter::new(
        dir.path(),
        "voices",
        3,
        9,
        8 * 1024,
        4,
        Arc::new(DefaultPipelineTelemetry),
    );
    for i in 0..9 {
        writer.write(&record(i))?;
    }
    writer.finish()?;

    // Each file decodes on its own; no state leaks across rotations.
    for (index, lines) in [(0usize, 4usize), (1, 4), (2, 1)] {
        let name = ShardWriter::shard_filename("voices", 3, index);
        let path = dir.path().join(name);
        let reader = BufReader::new(MultiGzDecoder::new(File::open(&path)?));
        let mut seen = 0usize;
        for line in reader.lines() {
            let parsed: EncodedSample = serde_json::from_str(&line?)?;
            assert!(parsed.layers_consistent());
            seen += 1;
        }
        assert_eq!(seen, lines);
    }
    Ok(())
}

#[test]
fn workers_never_collide_on_filenames() {
    let a = ShardWriter::shard_filename("set", 0, 7);
    let b = ShardWriter::shard_filename("set", 1, 7);
    assert_ne!(a, b);
    assert_eq!(a, "set-worker00-00007.jsonl.gz");
    assert_eq!(b, "set-worker01-00007.jsonl.gz");
}

#[test]
fn idle_writer_leaves_no_files_behind() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let writer = ShardWriter::new(
        dir.path(),
        "voices",
        0,
        6,
        1024,
        10,
        Arc::new(DefaultPipelineTelemetry),
    );
    let stats = writer.finish()?;
    assert_eq!(stats.files_written, 0);
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}
