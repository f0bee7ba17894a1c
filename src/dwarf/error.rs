/// Fine-grained failure codes for the CFI engine. Every parse or
/// evaluation step that fails records one of these together with the
/// offending address or section offset.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DwarfErrorCode {
    #[default]
    #[error("No error")]
    None,

    #[error("Memory could not be read")]
    MemoryInvalid,

    #[error("Illegal value in the unwind data")]
    IllegalValue,

    #[error("Instruction not valid in the current state")]
    IllegalState,

    #[error("Value stack index out of range")]
    StackIndexNotValid,

    #[error("Opcode or encoding not implemented")]
    NotImplemented,

    #[error("Evaluation exceeded the iteration limit")]
    TooManyIterations,

    #[error("No CFA rule is defined at the target PC")]
    CfaNotDefined,

    #[error("CIE version not supported")]
    UnsupportedVersion,

    #[error("Section contains no FDEs")]
    NoFdes,
}

/// A [`DwarfErrorCode`] plus the address at which it was detected. For
/// `MemoryInvalid` the address is the unreadable location; for malformed
/// data it is the section offset of the bad bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DwarfErrorData {
    pub code: DwarfErrorCode,
    pub address: u64,
}

impl DwarfErrorData {
    pub fn new(code: DwarfErrorCode, address: u64) -> Self {
        DwarfErrorData { code, address }
    }
}
