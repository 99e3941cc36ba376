use crate::types::{DataType, Rank, ReduceOp};

pub type Result<T> = std::result::Result<T, FlexError>;

#[derive(Debug, thiserror::Error)]
pub enum FlexError {
    #[error("connection to rank {rank} failed: {reason}")]
    ConnectionFailed { rank: Rank, reason: String },

    #[error("peer {rank} disconnected unexpectedly")]
    PeerDisconnected { rank: Rank },

    #[error("rank {rank} not found in group")]
    UnknownPeer { rank: Rank },

    #[error("invalid rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("unsupported data type {dtype} for {op}")]
    UnsupportedDType { dtype: DataType, op: ReduceOp },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("invalid stage factorization {stages:?}: {reason}")]
    InvalidStages { stages: Vec<usize>, reason: String },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} failed at rank {rank}: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("a receive for tag {tag:#x} from rank {rank} is already pending")]
    DuplicateReceive { rank: Rank, tag: u64 },

    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { len: u64, max: u64 },

    #[error("mesh formation timed out: {connected}/{expected} peers connected")]
    MeshFormationTimeout { connected: u32, expected: u32 },

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl FlexError {
    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Shorthand for a stage-plan precondition failure.
    pub(crate) fn invalid_stages(stages: &[usize], reason: impl Into<String>) -> Self {
        Self::InvalidStages {
            stages: stages.to_vec(),
            reason: reason.into(),
        }
    }
}
