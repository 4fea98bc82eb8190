use std::fmt;

pub type Result<T> = std::result::Result<T, FfiError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FfiError {
    /// A struct member list entry cannot be laid out. `index` is 1-based;
    /// `0` means the list itself was rejected.
    InvalidMember { index: usize, reason: &'static str },
    AllocationFailure { size: usize },
    TypeMismatch { expected: &'static str, got: &'static str },
    UnsupportedValue { kind: &'static str },
    PrepFailed { reason: String },
    ArityMismatch { expected: usize, got: usize },
    NotLoaded { reason: &'static str },
    SymbolResolutionFailure { name: String, message: String },
    NotAStruct,
    InvalidIndex { index: usize, count: usize },
}

impl fmt::Display for FfiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMember { index: 0, reason } => {
                write!(f, "invalid struct member list: {reason}")
            }
            Self::InvalidMember { index, reason } => {
                write!(f, "incorrect FFI type #{index}: {reason}")
            }
            Self::AllocationFailure { size } => {
                write!(f, "failed to allocate {size} bytes of native memory")
            }
            Self::TypeMismatch { expected, got } => {
                write!(f, "type mismatch: expected {expected}, got {got}")
            }
            Self::UnsupportedValue { kind } => {
                write!(f, "{kind} values cannot be marshaled")
            }
            Self::PrepFailed { reason } => {
                write!(f, "ffi_prep_cif() failed: {reason}")
            }
            Self::ArityMismatch { expected, got } => {
                write!(f, "passed {got} arguments, but {expected} expected")
            }
            Self::NotLoaded { reason } => {
                write!(f, "function is not callable: {reason}")
            }
            Self::SymbolResolutionFailure { name, message } => {
                write!(f, "failed to resolve {name}: {message}")
            }
            Self::NotAStruct => write!(f, "FFI type is not a structure"),
            Self::InvalidIndex { index, count } => {
                write!(f, "invalid element index {index} (structure has {count})")
            }
        }
    }
}

impl std::error::Error for FfiError {}
