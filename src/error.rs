use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Allocation refused because the bucket is at quota. Retryable once
    /// the pager has reclaimed memory.
    #[error("TMPFAIL bucket memory usage is above the quota")]
    TempFail,

    #[error("ERR no such key")]
    KeyNotFound,

    #[error("ERR no such vbucket {0}")]
    NotMyVBucket(u16),

    #[error("ERR vbucket {0} is dead")]
    VBucketDead(u16),

    #[error("ERR not stored: vbucket does not accept writes in its current state")]
    NotStored,

    #[error("ERR item is not evictable: {0}")]
    NotEvictable(&'static str),

    #[error("ERR operation not supported for this bucket type")]
    NotSupported,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
