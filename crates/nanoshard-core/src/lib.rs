pub mod assemble;
pub mod codec;
pub mod config;
pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod reader;
pub mod source;
pub mod telemetry;
pub mod types;
pub mod writer;

pub use assemble::{
    inspect_shard, AssembledDataset, Assembler, LocalDiskSink, PersistenceSink, ShardReport,
};
pub use codec::{AudioCodec, CodecFactory, FrameHashCodec, FrameHashCodecFactory};
pub use config::{BaseSettings, DatasetConfig, PipelineConfig, SaveSettings};
pub use error::{ErrorAction, NanoshardError};
pub use pipeline::{Pipeline, RunReport};
pub use queue::{BoundedQueue, QueueItem};
pub use source::{
    ColumnValue, JsonlSource, MemorySource, SampleSource, SourceProvider, SourceRecord,
};
pub use telemetry::{DefaultPipelineTelemetry, PipelineTelemetry};
pub use types::{
    DatasetStats, EncodedSample, EncoderStats, PcmAudio, ProgressSnapshot, RawSample, ReaderStats,
    Result, TokenLayers, NUM_CODEC_LAYERS,
};
pub use writer::{ShardWriter, WriterStats};
