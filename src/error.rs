use crate::dwarf::DwarfErrorCode;

/// The coarse error taxonomy surfaced by the unwinder driver.
///
/// Engines record errors instead of returning them through `Result`: each
/// failed step parks an [`ErrorData`] in the owning object's last-error
/// slot, the driver copies the most recent one into its own, records a
/// terminal frame and stops. Symbolization failures are never recorded
/// here; they only produce frames without function names.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCode {
    #[default]
    #[error("No error")]
    None,

    #[error("Memory could not be read at a required address")]
    InvalidMemory,

    #[error("ELF file invalid or of an unexpected architecture")]
    InvalidElf,

    #[error("No unwind information for the address, or the encoding is malformed")]
    UnwindInfo,

    #[error("Unwinding encountered an unsupported feature")]
    Unsupported,

    #[error("PC is not in any known map")]
    InvalidMap,

    #[error("Frame cap reached before natural termination")]
    MaxFrames,

    #[error("Neither PC nor SP advanced, or SP moved backwards")]
    RepeatedFrame,

    #[error("Inconsistent parameters supplied by the caller")]
    InvalidParameters,

    #[error("Timed out waiting for the target thread")]
    ThreadTimeout,

    #[error("The target thread does not exist")]
    ThreadDoesNotExist,
}

/// An error code plus the address at which the condition was detected.
/// The address is zero when the condition has no meaningful location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub address: u64,
}

impl ErrorData {
    pub fn new(code: ErrorCode, address: u64) -> Self {
        ErrorData { code, address }
    }
}

impl From<DwarfErrorCode> for ErrorCode {
    fn from(code: DwarfErrorCode) -> Self {
        match code {
            DwarfErrorCode::None => ErrorCode::None,
            DwarfErrorCode::MemoryInvalid => ErrorCode::InvalidMemory,
            DwarfErrorCode::NotImplemented | DwarfErrorCode::UnsupportedVersion => {
                ErrorCode::Unsupported
            }
            DwarfErrorCode::IllegalValue
            | DwarfErrorCode::IllegalState
            | DwarfErrorCode::StackIndexNotValid
            | DwarfErrorCode::TooManyIterations
            | DwarfErrorCode::CfaNotDefined
            | DwarfErrorCode::NoFdes => ErrorCode::UnwindInfo,
        }
    }
}
