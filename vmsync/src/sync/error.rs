// Error types for sync trace loading and event reconstruction

use super::point::PointKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid record file magic: expected {expected:#x}, got {got:#x}")]
    InvalidMagic { expected: u64, got: u64 },

    #[error("Invalid data file magic: expected {expected:#x}, got {got:#x}")]
    InvalidDataMagic { expected: u64, got: u64 },

    #[error("Unsupported version: {version}, expecting version {supported}")]
    UnsupportedVersion { version: u32, supported: u32 },

    #[error("Invalid record size: {record_size} bytes, layout needs at least {minimum}")]
    InvalidRecordSize { record_size: u32, minimum: u32 },

    #[error("Record file too small: expected at least {expected} bytes, got {actual}")]
    FileTooSmall { expected: usize, actual: usize },

    #[error("Data file too small: expected at least {expected} bytes, got {actual}")]
    DataFileTooSmall { expected: usize, actual: usize },

    #[error("Malformed scenario at ${position}: {violation}")]
    Malformed { position: u64, violation: Violation },
}

/// Ways a record stream can break the exit → interrupt → enter contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("VMExit without a VMEnter (found {found})")]
    MissingVmEnter { found: PointKind },

    #[error("context should be identical for duplicated interrupt")]
    DuplicateInterruptMismatch,

    #[error("context should be identical after the interrupt")]
    InterruptContextMismatch,

    #[error("instruction emulation but immediate interrupt combined: not handled")]
    EmulationWithImmediateInterrupt,

    #[error("CR2 change with non page-fault interrupt {vector:#04x}: not supported")]
    Cr2ChangeWithoutPageFault { vector: u8 },

    #[error("CPU fault {vector:#04x} that should wait doesn't make sense")]
    DeferredCpuFault { vector: u8 },

    #[error("unforeseen context change in {register}")]
    UnexpectedRegisterChange { register: &'static str },
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn malformed(position: u64, violation: Violation) -> Self {
        Self::Malformed {
            position,
            violation,
        }
    }

    /// True for errors raised while validating file headers.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidMagic { .. }
                | Self::InvalidDataMagic { .. }
                | Self::UnsupportedVersion { .. }
                | Self::InvalidRecordSize { .. }
                | Self::FileTooSmall { .. }
                | Self::DataFileTooSmall { .. }
        )
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }

    /// Record position the error was detected at, if it concerns a record.
    pub fn position(&self) -> Option<u64> {
        match self {
            Self::Malformed { position, .. } => Some(*position),
            _ => None,
        }
    }
}
