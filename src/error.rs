//! The error surface the on-disk/HAL contract names, as a real sum type
//! rather than a string-tagged catch-all.

use thiserror::Error;

/// Every non-`Ok` outcome the core can produce. Named so callers can match
/// on intent, not text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HnError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory")]
    Nomem,

    #[error("hardware I/O failure: {0}")]
    HwIo(String),

    #[error("geometry error: {0}")]
    Geometry(String),

    #[error("alignment failure: {0}")]
    AlignmentFail(String),

    #[error("bad superblock: {0}")]
    BadSuperblock(String),

    #[error("tampered superblock mirrors: {0}")]
    Tampered(String),

    #[error("wipe pending / poisoned mirror")]
    WipePending,

    #[error("volume is locked")]
    VolumeLocked,

    #[error("incompatible on-disk version: {0}")]
    VersionIncompat(String),

    #[error("volume is uninitialized")]
    Uninitialized,

    #[error("data rot detected: {0}")]
    DataRot(String),

    #[error("epoch record lost or corrupt")]
    EpochLost,

    #[error("epoch time dilation (mirror lag) detected")]
    TimeDilation,

    #[error("epoch generation skew (rollback) detected")]
    GenerationSkew,

    #[error("media reports an impossible future epoch")]
    MediaToxic,

    #[error("bitmap corruption: {0}")]
    BitmapCorrupt(String),

    #[error("format profile mismatch: {0}")]
    ProfileMismatch(String),

    #[error("thermal critical: {0}")]
    ThermalCritical(String),

    #[error("no space left")]
    Enospc,

    #[error("event horizon: Horizon region exhausted")]
    EventHorizon,

    #[error("gravity collapse: fractal-scale request cannot spill to Horizon")]
    GravityCollapse,

    #[error("access denied")]
    AccessDenied,

    #[error("not found")]
    NotFound,

    #[error("internal fault: {0}")]
    InternalFault(String),

    #[error("entry already exists")]
    Eexist,
}

pub type HnResult<T> = Result<T, HnError>;

/// `anyhow::ensure!`-shaped guard that short-circuits with a specific
/// [`HnError`] variant instead of a formatted string.
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !($cond) {
            return Err($err);
        }
    };
}

pub(crate) use ensure;
