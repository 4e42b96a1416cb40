//! Hyper-V management objects and job error codes

pub mod kvp;
pub mod power;
pub mod vm;

pub use vm::{EnabledState, VirtualMachine};

use std::fmt;

use crate::Error;

/// Namespace holding the Hyper-V management classes
pub const HYPERV_NAMESPACE: &str = r"root\virtualization\v2";

pub const VIRTUAL_SYSTEM_MANAGEMENT_SERVICE: &str = "Msvm_VirtualSystemManagementService";
pub const COMPUTER_SYSTEM: &str = "Msvm_ComputerSystem";
pub const KVP_EXCHANGE_DATA_ITEM: &str = "Msvm_KvpExchangeDataItem";
pub const CONCRETE_JOB: &str = "Msvm_ConcreteJob";
pub const SHUTDOWN_COMPONENT: &str = "Msvm_ShutdownComponent";
pub const KVP_EXCHANGE_COMPONENT: &str = "Msvm_KvpExchangeComponent";
pub const KVP_EXCHANGE_COMPONENT_SETTING_DATA: &str = "Msvm_KvpExchangeComponentSettingData";

pub const ERR_OPERATION_FAILED: u32 = 32768;
pub const ERR_ACCESS_DENIED: u32 = 32769;
pub const ERR_NOT_SUPPORTED: u32 = 32770;
pub const ERR_STATUS_UNKNOWN: u32 = 32771;
pub const ERR_TIMEOUT: u32 = 32772;
pub const ERR_ILLEGAL_ARGUMENT: u32 = 32773;
pub const ERR_SYSTEM_IN_USE: u32 = 32774;
pub const ERR_INVALID_STATE: u32 = 32775;
pub const ERR_INCORRECT_DATA_TYPE: u32 = 32776;
pub const ERR_SYSTEM_NOT_AVAILABLE: u32 = 32777;
pub const ERR_OUT_OF_MEMORY: u32 = 32778;
pub const ERR_NOT_FOUND: u32 = 32779;

/// Recognized job failure kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainErrorKind {
    OperationFailed,
    AccessDenied,
    NotSupported,
    StatusUnknown,
    Timeout,
    /// The broker gives no parameter-level detail; `hint` is the caller's guess
    IllegalArgument { hint: String },
    SystemInUse,
    InvalidState,
    IncorrectDataType,
    SystemNotAvailable,
    OutOfMemory,
    NotFound,
}

impl DomainErrorKind {
    pub fn from_code(code: u32, hint: &str) -> Option<Self> {
        Some(match code {
            ERR_OPERATION_FAILED => Self::OperationFailed,
            ERR_ACCESS_DENIED => Self::AccessDenied,
            ERR_NOT_SUPPORTED => Self::NotSupported,
            ERR_STATUS_UNKNOWN => Self::StatusUnknown,
            ERR_TIMEOUT => Self::Timeout,
            ERR_ILLEGAL_ARGUMENT => Self::IllegalArgument { hint: hint.to_string() },
            ERR_SYSTEM_IN_USE => Self::SystemInUse,
            ERR_INVALID_STATE => Self::InvalidState,
            ERR_INCORRECT_DATA_TYPE => Self::IncorrectDataType,
            ERR_SYSTEM_NOT_AVAILABLE => Self::SystemNotAvailable,
            ERR_OUT_OF_MEMORY => Self::OutOfMemory,
            ERR_NOT_FOUND => Self::NotFound,
            _ => return None,
        })
    }
}

impl fmt::Display for DomainErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperationFailed => f.write_str("Operation failed"),
            Self::AccessDenied => f.write_str("Access denied"),
            Self::NotSupported => f.write_str("Not supported"),
            Self::StatusUnknown => f.write_str("Status is unknown"),
            Self::Timeout => f.write_str("Timeout occurred"),
            Self::IllegalArgument { hint } => write!(f, "Illegal argument ({})", hint),
            Self::SystemInUse => f.write_str("System is in use"),
            Self::InvalidState => f.write_str("Invalid state for this operation"),
            Self::IncorrectDataType => f.write_str("Incorrect data type"),
            Self::SystemNotAvailable => f.write_str("System is not available"),
            Self::OutOfMemory => f.write_str("Out of memory"),
            Self::NotFound => f.write_str("Not found"),
        }
    }
}

/// Translate a failed job's code into a domain error.
///
/// Other errors, and job codes outside the known set, pass through unchanged.
pub fn translate(err: Error, hint: &str) -> Error {
    match err {
        Error::Job { code, description } => match DomainErrorKind::from_code(code, hint) {
            Some(kind) => Error::Domain { kind, code },
            None => Error::Job { code, description },
        },
        other => other,
    }
}

/// Quote a value for a WQL string literal
pub fn escape_wql(value: &str) -> String {
    value.replace('\\', r"\\").replace('\'', r"\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_known_codes() {
        let err = translate(
            Error::Job { code: ERR_ILLEGAL_ARGUMENT, description: "bad key".into() },
            "key already exists?",
        );
        assert_eq!(err.to_string(), "Illegal argument (key already exists?) (32773)");
        assert!(err.is_illegal_argument());
        assert_eq!(err.job_code(), Some(32773));

        let err = translate(Error::Job { code: ERR_ACCESS_DENIED, description: String::new() }, "");
        assert!(matches!(err, Error::Domain { kind: DomainErrorKind::AccessDenied, code: 32769 }));
        assert_eq!(err.to_string(), "Access denied (32769)");
    }

    #[test]
    fn test_translate_passes_through() {
        let err = translate(Error::Job { code: 2, description: "x".into() }, "hint");
        assert!(matches!(err, Error::Job { code: 2, .. }));

        let err = translate(Error::NotFound("vm".into()), "hint");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_every_code_has_a_kind() {
        for code in ERR_OPERATION_FAILED..=ERR_NOT_FOUND {
            assert!(DomainErrorKind::from_code(code, "").is_some(), "code {}", code);
        }
        assert!(DomainErrorKind::from_code(ERR_NOT_FOUND + 1, "").is_none());
    }

    #[test]
    fn test_escape_wql() {
        assert_eq!(escape_wql("it's"), r"it\'s");
        assert_eq!(escape_wql(r"a\b"), r"a\\b");
    }
}
