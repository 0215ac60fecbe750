use std::fmt::Display;

/// EmberDB errors.
#[derive(Debug)]
pub enum Error {
    /// The key does not exist at the requested version, or the newest
    /// visible record is a tombstone. Expected on the read path and never
    /// logged by the engine.
    KeyNotFound,
    /// No shard with the requested id is registered.
    ShardNotFound,
    /// The shard exists but its (id, version) epoch does not match the
    /// request, or the shard is passive. The caller refreshes its routing
    /// and retries.
    ShardNotMatch,
    /// Pre-split was requested while the shard is not in the initial stage.
    PreSplitWrongStage,
    /// Split-files was requested while the shard is not in the pre-split stage.
    SplitFilesWrongStage,
    /// Finish-split was requested while the shard has not finished splitting files.
    FinishSplitWrongStage,
    /// A write batch entry violated the managed/unmanaged version rule of
    /// its column family.
    InvalidBatch(String),
    /// Memtable arena allocation exceeded the configured cap.
    Alloc,
    /// A table file failed its magic or checksum validation. Fatal for the
    /// affected shard.
    CorruptFile(String),
    /// Invalid configuration. Fatal at open time.
    Config(String),
    /// The engine has been closed.
    Closed,
    /// A disk or object-storage failure.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::KeyNotFound => write!(f, "key not found"),
            Error::ShardNotFound => write!(f, "shard not found"),
            Error::ShardNotMatch => write!(f, "shard not match"),
            Error::PreSplitWrongStage => write!(f, "pre-split wrong stage"),
            Error::SplitFilesWrongStage => write!(f, "split-files wrong stage"),
            Error::FinishSplitWrongStage => write!(f, "finish-split wrong stage"),
            Error::InvalidBatch(msg) => write!(f, "invalid batch: {msg}"),
            Error::Alloc => write!(f, "memtable arena exhausted"),
            Error::CorruptFile(msg) => write!(f, "corrupt file: {msg}"),
            Error::Config(msg) => write!(f, "invalid config: {msg}"),
            Error::Closed => write!(f, "engine closed"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::CorruptFile(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}
