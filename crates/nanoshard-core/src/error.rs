use thiserror::Error;

#[derive(Debug, Error)]
pub enum NanoshardError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("codec error: {0}")]
    CodecError(String),
    #[error("shard error: {0}")]
    ShardError(String),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("pipeline error: {0}")]
    PipelineError(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<NanoshardError>,
    },
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl NanoshardError {
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Recovery policy for an error observed while reading or encoding one sample.
///
/// Classification is the single decision point for skip-vs-fail: a recoverable
/// error is counted and the worker moves on, a fatal one ends the worker early
/// (which still emits its completion signal so the pipeline can drain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    SkipAndCount,
    Fatal,
}

impl NanoshardError {
    /// Classifies an error hit while producing or encoding a single sample.
    pub fn classify(&self) -> ErrorAction {
        match self {
            Self::MalformedRecord(_) | Self::CodecError(_) => ErrorAction::SkipAndCount,
            _ => ErrorAction::Fatal,
        }
    }
}
