use thiserror::Error;

#[derive(Error, Debug)]
pub enum HfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not an HFS+ volume: signature 0x{0:04X} (expected 0x482B or 0x4858)")]
    NotHfs(u16),

    #[error("unsupported volume version: {0}")]
    UnsupportedVersion(u16),

    #[error("corrupt volume: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("volume is read-only")]
    ReadOnly,
}

pub type Result<T> = std::result::Result<T, HfsError>;
