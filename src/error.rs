use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    // Device
    IoError,
    ReadError,
    WriteError,

    // On-disk inconsistencies
    InvalidBootSector,
    BootChecksumMismatch,
    ChecksumMismatch,
    CrossLinked,
    BadCluster,
    ChainLoop,
    UnexpectedEndOfChain,
    EntrySetMismatch,
    CorruptedBitmap,
    CorruptedUpcase,

    // Expected conditions
    NotFound,
    AlreadyExists,
    DirNotEmpty,
    NoSpace,
    NotDirectory,
    IsDirectory,
    InvalidFileName,
    FileTooLarge,
    DirectoryFull,
    VolumeDirty,

    // Contract violations
    OutOfBounds,
    InvalidBlockId,
    InvalidArgument,
    Detached,
    UnsupportedGeometry,
}

/// Coarse classification of an [`FsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device failed a read or write.
    Io,
    /// On-disk structures contradict each other.
    Inconsistency,
    /// Ordinary result codes: not found, exists, no space, ...
    Expected,
    /// The caller broke the interface contract.
    Contract,
}

impl FsError {
    pub fn kind(&self) -> ErrorKind {
        use FsError::*;
        match self {
            IoError | ReadError | WriteError => ErrorKind::Io,
            InvalidBootSector | BootChecksumMismatch | ChecksumMismatch | CrossLinked
            | BadCluster | ChainLoop | UnexpectedEndOfChain | EntrySetMismatch
            | CorruptedBitmap | CorruptedUpcase => ErrorKind::Inconsistency,
            NotFound | AlreadyExists | DirNotEmpty | NoSpace | NotDirectory | IsDirectory
            | InvalidFileName | FileTooLarge | DirectoryFull | VolumeDirty => ErrorKind::Expected,
            OutOfBounds | InvalidBlockId | InvalidArgument | Detached | UnsupportedGeometry => {
                ErrorKind::Contract
            }
        }
    }

    pub fn is_inconsistency(&self) -> bool {
        self.kind() == ErrorKind::Inconsistency
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::IoError => "i/o error",
            FsError::ReadError => "device read failed",
            FsError::WriteError => "device write failed",
            FsError::InvalidBootSector => "invalid boot sector",
            FsError::BootChecksumMismatch => "boot region checksum mismatch",
            FsError::ChecksumMismatch => "entry set checksum mismatch",
            FsError::CrossLinked => "cluster chain points at a free cluster",
            FsError::BadCluster => "bad cluster in an active chain",
            FsError::ChainLoop => "cluster chain loops",
            FsError::UnexpectedEndOfChain => "cluster chain shorter than its owner",
            FsError::EntrySetMismatch => "entry set does not match its header",
            FsError::CorruptedBitmap => "allocation bitmap is corrupted",
            FsError::CorruptedUpcase => "up-case table is corrupted",
            FsError::NotFound => "not found",
            FsError::AlreadyExists => "already exists",
            FsError::DirNotEmpty => "directory not empty",
            FsError::NoSpace => "no space left on volume",
            FsError::NotDirectory => "not a directory",
            FsError::IsDirectory => "is a directory",
            FsError::InvalidFileName => "invalid file name",
            FsError::FileTooLarge => "file too large",
            FsError::DirectoryFull => "directory reached its maximum size",
            FsError::VolumeDirty => "volume was not cleanly unmounted",
            FsError::OutOfBounds => "cluster index out of range",
            FsError::InvalidBlockId => "sector out of device range",
            FsError::InvalidArgument => "invalid argument",
            FsError::Detached => "node is detached from its directory entry",
            FsError::UnsupportedGeometry => "unsupported volume geometry",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, FsError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(FsError::IoError.kind(), ErrorKind::Io);
        assert!(FsError::ChecksumMismatch.is_inconsistency());
        assert_eq!(FsError::NoSpace.kind(), ErrorKind::Expected);
        assert_eq!(FsError::Detached.kind(), ErrorKind::Contract);
    }
}
