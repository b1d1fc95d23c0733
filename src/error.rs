use crate::position::{Address, Position};

pub type Result<T> = std::result::Result<T, Error>;

/// Which file-level operation an I/O failure happened during. Kept separate
/// from `Error` itself so the stable per-kind code (§7) survives regardless
/// of how many call sites end up producing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Force,
    Close,
    Truncate,
    Size,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("backing file not found")]
    FileNotFound,

    #[error("bad signature: not a pack file, or file is corrupt")]
    BadSignature,

    #[error("header is corrupt")]
    HeaderCorrupt,

    #[error("block at {0} is corrupt (checksum mismatch)")]
    BlockCorrupt(Position),

    #[error("address {0} has been freed")]
    FreedAddress(Address),

    #[error("static address {0} has been freed")]
    FreedStaticAddress(Address),

    #[error("address {0} is not valid for this pack")]
    InvalidAddress(Address),

    #[error("io {kind:?} error")]
    Io {
        kind: IoKind,
        #[source]
        source: std::io::Error,
    },

    #[error("pack is shut down")]
    Shutdown,
}

impl Error {
    pub fn io(kind: IoKind, source: std::io::Error) -> Error {
        Error::Io { kind, source }
    }

    /// Stable integer code callers may switch on, per §7.
    pub fn code(&self) -> i32 {
        match self {
            Error::FileNotFound => 1,
            Error::BadSignature => 2,
            Error::HeaderCorrupt => 3,
            Error::BlockCorrupt(_) => 4,
            Error::FreedAddress(_) => 5,
            Error::FreedStaticAddress(_) => 6,
            Error::InvalidAddress(_) => 7,
            Error::Io { kind, .. } => match kind {
                IoKind::Read => 8,
                IoKind::Write => 9,
                IoKind::Force => 10,
                IoKind::Close => 11,
                IoKind::Truncate => 12,
                IoKind::Size => 13,
            },
            Error::Shutdown => 14,
        }
    }
}
