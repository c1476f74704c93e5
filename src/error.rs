use std::{fmt, io};

use nusb::transfer::TransferError;

pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong with a streaming transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FaultKind {
    /// The I/O subsystem reported a failed submission or completion.
    Transfer(TransferError),
    /// Transfers were pending but none completed within the pool timeout.
    Timeout,
}

/// Sticky streaming fault recorded by a session, tagged with the code path
/// that observed it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fault {
    pub tag: &'static str,
    pub kind: FaultKind,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FaultKind::Transfer(e) => write!(f, "{}: {}", self.tag, e),
            FaultKind::Timeout => write!(f, "{}: transfer timed out", self.tag),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no bound device with serial {0}")]
    DeviceNotFound(String),

    #[error("transport error at {0}")]
    Transport(Fault),

    #[error("timed out waiting for the session to complete")]
    Timeout,

    /// Only produced by explicit validation requests; streaming code
    /// substitutes default calibration instead.
    #[error("stored calibration failed validation")]
    CalibrationInvalid,

    #[error("invalid calibration file: {0}")]
    InvalidCalibrationFile(String),

    #[error("input sample queue overflowed, samples were dropped")]
    Overflow,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("session is streaming")]
    Busy,

    #[error("unsupported by {0}")]
    Unsupported(&'static str),

    #[error("io error: {0}")]
    IoError(io::Error),

    #[error("usb control transfer error: {0}")]
    UsbTransferError(TransferError),

    #[error("short control transfer: expected {expected} bytes, got {actual}")]
    InvalidResponse { expected: usize, actual: usize },
}

impl Error {
    /// Map a control transfer failure, keeping cancellation distinguishable.
    pub(crate) fn control(e: TransferError) -> Error {
        match e {
            TransferError::Cancelled => Error::Cancelled,
            e => Error::UsbTransferError(e),
        }
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Error::Transport(fault)
    }
}
