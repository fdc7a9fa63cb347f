//! Error taxonomy for the Board Session and its collaborators.
//!
//! Mirrors the shape of the teacher's `stm32_uart::Error`: one flat
//! `thiserror` enum with `#[from]` conversions at the I/O seams, no
//! panics or exception-style bailouts anywhere in non-test code.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("serial port error: {0}")]
    PortIo(#[from] serialport::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("port closed")]
    PortClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("boot sequence did not complete in time")]
    BootTimeout,

    #[error("board reported invalid firmware")]
    InvalidFirmware,

    #[error("prerequisite files could not be installed")]
    InvalidPrerequisites,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("no board is attached")]
    NotAttached,

    #[error("an upgrade is already in progress")]
    UpgradeInProgress,

    #[error("malformed board info: {0}")]
    BoardInfo(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors from the external-collaborator trait boundaries (§10 of the
/// expanded spec): archive download/extraction and the firmware commit
/// index. Kept distinct from [`SessionError`] because these failures are
/// recoverable at the call site (fall back to files already on the board,
/// then to the most recent local copy) rather than terminal for the
/// session.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("http request failed: {0}")]
    Http(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(String),
}
