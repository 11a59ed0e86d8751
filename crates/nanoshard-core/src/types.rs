use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NanoshardError;

pub type Result<T> = std::result::Result<T, NanoshardError>;

/// Number of parallel token streams produced by the hierarchical codec.
pub const NUM_CODEC_LAYERS: usize = 4;

/// Raw PCM audio as delivered by a sample source.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// One source record after column mapping, ready for encoding.
///
/// Owned by exactly one worker at a time: the reader that built it until the
/// blocking queue put returns, then the encoder that dequeued it.
#[derive(Debug, Clone)]
pub struct RawSample {
    pub text: String,
    pub audio: PcmAudio,
    pub speaker: Option<String>,
    pub extra_fields: BTreeMap<String, String>,
}

/// The four equal-length token streams produced for one audio input.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenLayers {
    layers: [Vec<u32>; NUM_CODEC_LAYERS],
}

impl TokenLayers {
    /// Builds the layer set, rejecting unequal lengths and empty encodes.
    pub fn new(layers: [Vec<u32>; NUM_CODEC_LAYERS]) -> Result<Self> {
        let len = layers[0].len();
        if len == 0 {
            return Err(NanoshardError::CodecError(
                "codec produced an empty token sequence".to_string(),
            ));
        }
        if layers.iter().any(|layer| layer.len() != len) {
            return Err(NanoshardError::CodecError(format!(
                "codec layer lengths diverge: {:?}",
                layers.iter().map(Vec::len).collect::<Vec<_>>()
            )));
        }
        Ok(Self { layers })
    }

    pub fn encoded_len(&self) -> usize {
        self.layers[0].len()
    }

    pub fn layer(&self, index: usize) -> &[u32] {
        &self.layers[index]
    }

    pub fn into_layers(self) -> [Vec<u32>; NUM_CODEC_LAYERS] {
        self.layers
    }
}

/// One encoded record as written to a shard file, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedSample {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub nano_layer_1: Vec<u32>,
    pub nano_layer_2: Vec<u32>,
    pub nano_layer_3: Vec<u32>,
    pub nano_layer_4: Vec<u32>,
    pub encoded_len: usize,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, String>,
}

impl EncodedSample {
    /// Assembles a record from the sample's metadata and its token layers.
    pub fn from_parts(
        text: String,
        speaker: Option<String>,
        extra_fields: BTreeMap<String, String>,
        tokens: TokenLayers,
    ) -> Self {
        let encoded_len = tokens.encoded_len();
        let [nano_layer_1, nano_layer_2, nano_layer_3, nano_layer_4] = tokens.into_layers();
        Self {
            text,
            speaker,
            nano_layer_1,
            nano_layer_2,
            nano_layer_3,
            nano_layer_4,
            encoded_len,
            extra_fields,
        }
    }

    /// True when every layer carries exactly `encoded_len` tokens and the
    /// record is non-empty.
    pub fn layers_consistent(&self) -> bool {
        self.encoded_len > 0
            && self.nano_layer_1.len() == self.encoded_len
            && self.nano_layer_2.len() == self.encoded_len
            && self.nano_layer_3.len() == self.encoded_len
            && self.nano_layer_4.len() == self.encoded_len
    }

    /// Field names this record serializes to, for schema validation.
    pub fn field_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = [
            "text",
            "nano_layer_1",
            "nano_layer_2",
            "nano_layer_3",
            "nano_layer_4",
            "encoded_len",
        ]
        .iter()
        .map(|name| name.to_string())
        .collect();
        if self.speaker.is_some() {
            names.insert("speaker".to_string());
        }
        names.extend(self.extra_fields.keys().cloned());
        names
    }
}

/// Per-reader counters, returned when a reader thread joins.
#[derive(Debug, Clone, Default)]
pub struct ReaderStats {
    pub reader_id: usize,
    pub samples_read: u64,
    pub records_skipped: u64,
    pub failed: bool,
}

/// Per-encoder counters, returned when an encoder thread joins.
#[derive(Debug, Clone, Default)]
pub struct EncoderStats {
    pub worker_id: usize,
    pub samples_encoded: u64,
    pub samples_skipped: u64,
    pub files_written: usize,
    pub records_written: u64,
    pub bytes_written: u64,
    pub failed: bool,
}

/// Aggregated statistics for one fully processed dataset.
#[derive(Debug, Clone, Default)]
pub struct DatasetStats {
    pub dataset_prefix: String,
    pub samples_read: u64,
    pub samples_encoded: u64,
    pub samples_skipped: u64,
    pub records_skipped_at_read: u64,
    pub files_written: usize,
    pub bytes_written: u64,
    pub elapsed: Duration,
    pub readers: Vec<ReaderStats>,
    pub encoders: Vec<EncoderStats>,
}

impl DatasetStats {
    pub fn aggregate(
        dataset_prefix: String,
        elapsed: Duration,
        readers: Vec<ReaderStats>,
        encoders: Vec<EncoderStats>,
    ) -> Self {
        let samples_read = readers.iter().map(|r| r.samples_read).sum();
        let records_skipped_at_read = readers.iter().map(|r| r.records_skipped).sum();
        let samples_encoded = encoders.iter().map(|e| e.samples_encoded).sum();
        let samples_skipped = encoders.iter().map(|e| e.samples_skipped).sum();
        let files_written = encoders.iter().map(|e| e.files_written).sum();
        let bytes_written = encoders.iter().map(|e| e.bytes_written).sum();
        Self {
            dataset_prefix,
            samples_read,
            samples_encoded,
            samples_skipped,
            records_skipped_at_read,
            files_written,
            bytes_written,
            elapsed,
            readers,
            encoders,
        }
    }
}

/// Live counters sampled while a dataset is in flight.
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub dataset_prefix: String,
    pub elapsed: Duration,
    pub samples_read: u64,
    pub samples_encoded: u64,
    pub samples_skipped: u64,
    pub queue_len: usize,
    pub queue_capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layers(len: usize) -> [Vec<u32>; NUM_CODEC_LAYERS] {
        [
            vec![1; len],
            vec![2; len],
            vec![3; len],
            vec![4; len],
        ]
    }

    #[test]
    fn token_layers_reject_unequal_lengths() {
        let mut bad = layers(5);
        bad[2].pop();
        assert!(TokenLayers::new(bad).is_err());
    }

    #[test]
    fn token_layers_reject_empty_encodes() {
        assert!(TokenLayers::new(layers(0)).is_err());
    }

    #[test]
    fn encoded_sample_round_trips_extra_fields() {
        let mut extra = BTreeMap::new();
        extra.insert("lang".to_string(), "en".to_string());
        let sample = EncodedSample::from_parts(
            "hello".to_string(),
            Some("spk0".to_string()),
            extra,
            TokenLayers::new(layers(3)).expect("valid layers"),
        );

        let line = serde_json::to_string(&sample).expect("serializes");
        assert!(line.contains("\"lang\":\"en\""));
        let parsed: EncodedSample = serde_json::from_str(&line).expect("parses");
        assert_eq!(parsed, sample);
        assert!(parsed.layers_consistent());
    }

    #[test]
    fn field_names_cover_base_schema_and_constants() {
        let mut extra = BTreeMap::new();
        extra.insert("lang".to_string(), "fr".to_string());
        let sample = EncodedSample::from_parts(
            "bonjour".to_string(),
            None,
            extra,
            TokenLayers::new(layers(2)).expect("valid layers"),
        );
        let names = sample.field_names();
        assert!(names.contains("text"));
        assert!(names.contains("encoded_len"));
        assert!(names.contains("lang"));
        assert!(!names.contains("speaker"));
    }
}
