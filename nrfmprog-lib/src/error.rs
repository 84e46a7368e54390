use crate::TargetId;
use std::path::PathBuf;
use strum::Display;
use thiserror::Error;

/// Convenient result type for `nrfmprog-lib`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("probe-rs error: {0}")]
    ProbeRs(#[from] probe_rs::Error),

    #[error("debug probe error: {0}")]
    DebugProbe(#[from] probe_rs::probe::DebugProbeError),

    #[error("Intel HEX parse error: {0}")]
    IntelHex(#[from] ihex::ReaderError),

    #[error("ELF parse error: {0}")]
    Elf(#[from] goblin::error::Error),

    #[error("invalid image: {0}")]
    Image(String),

    #[error("failed to load image `{}`: {source}", .path.display())]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to enumerate debug probes: {0}")]
    Enumeration(#[source] Box<Error>),

    #[error("erase modes are mutually exclusive, got: {}", .0.join(", "))]
    EraseModeConflict(Vec<&'static str>),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no debug probe with serial number {0} is attached")]
    ProbeNotFound(TargetId),

    #[error("invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        expected: String,
        actual: String,
    },

    #[error(
        "verify failed for segment at 0x{segment:08X}: byte at 0x{address:08X} is {actual:#04X}, expected {expected:#04X}"
    )]
    VerifyMismatch {
        segment: u32,
        address: u32,
        expected: u8,
        actual: u8,
    },

    #[error("worker thread panicked: {0}")]
    WorkerPanic(String),

    #[error("timeout while {0}")]
    Timeout(String),
}

impl Error {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn image(msg: impl Into<String>) -> Self {
        Self::Image(msg.into())
    }
}

/// The step of a device session during which a target failed.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    #[strum(serialize = "connect")]
    Connect,
    #[strum(serialize = "erase")]
    Erase,
    #[strum(serialize = "write")]
    Write,
    #[strum(serialize = "verify")]
    Verify,
    #[strum(serialize = "reset")]
    Reset,
    #[strum(serialize = "disconnect")]
    Disconnect,
    /// The worker thread itself died before reporting.
    #[strum(serialize = "worker")]
    Worker,
}

/// A failure that is fatal to exactly one target.
#[derive(Debug, Error)]
#[error("target {target} failed during {phase}: {source}")]
pub struct TargetError {
    pub target: TargetId,
    pub phase: Phase,
    #[source]
    pub source: Error,
}

impl TargetError {
    pub fn new(target: TargetId, phase: Phase, source: Error) -> Self {
        Self {
            target,
            phase,
            source,
        }
    }
}
