use thiserror::Error;

/// Errors raised while operating on a FAT32 volume.
///
/// The first error aborts the current target and the whole session; there
/// are no partial retries.
#[derive(Debug, Error)]
pub enum FatwipeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid boot sector: {0}")]
    InvalidBootSector(String),

    #[error("unsupported volume format: {0}")]
    UnsupportedFormat(String),

    #[error("no mount point found for {0}")]
    NoMountPoint(String),

    #[error("volume is busy: {0}")]
    VolumeBusy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("broken FAT chain: {0}")]
    BrokenChain(String),
}

pub type Result<T> = std::result::Result<T, FatwipeError>;
