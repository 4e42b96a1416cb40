//! Error types for WMI marshaling, invocation and job tracking

use thiserror::Error;

use crate::hyperv::DomainErrorKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Malformed CIM datetime {value:?}: {reason}")]
    MalformedDatetime { value: String, reason: String },

    #[error("Type conversion failed: cannot convert {wire} to {target}")]
    TypeConversion { wire: String, target: String },

    #[error("{}", job_message(.code, .description))]
    Job { code: u32, description: String },

    #[error("{kind} ({code})")]
    Domain { kind: DomainErrorKind, code: u32 },

    #[error("Method {method} failed with return value {code}")]
    MethodFailed { method: String, code: u32 },

    #[error("WMI provider error: {0}")]
    Remote(String),

    /// The machine's `EnabledState` does not allow the requested action
    #[error("{0}")]
    MachineState(&'static str),

    #[error("Failed to destroy system {name}: {reason}")]
    DestroyFailed { name: String, reason: &'static str },

    #[error("Malformed exchange item: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("Timed out after {0:?} waiting for job")]
    Timeout(std::time::Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn job_message(code: &u32, description: &str) -> String {
    if description.is_empty() {
        format!("Job failed with error code: {}", code)
    } else {
        format!("Job failed with error code: {}. Description: {}", code, description)
    }
}

impl Error {
    pub(crate) fn conversion(wire: impl Into<String>, target: impl Into<String>) -> Self {
        Error::TypeConversion {
            wire: wire.into(),
            target: target.into(),
        }
    }

    pub(crate) fn datetime(value: &str, reason: impl Into<String>) -> Self {
        Error::MalformedDatetime {
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if this error means the remote side had nothing to return
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if this is a translated "illegal argument" job failure
    pub fn is_illegal_argument(&self) -> bool {
        matches!(
            self,
            Error::Domain {
                kind: DomainErrorKind::IllegalArgument { .. },
                ..
            }
        )
    }

    /// Check if the action was refused because of the machine's current state
    pub fn is_machine_state(&self) -> bool {
        matches!(self, Error::MachineState(_))
    }

    /// Remote error code carried by a failed job, translated or not
    pub fn job_code(&self) -> Option<u32> {
        match self {
            Error::Job { code, .. } | Error::Domain { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_message() {
        let err = Error::Job { code: 32773, description: "bad key".into() };
        assert_eq!(err.to_string(), "Job failed with error code: 32773. Description: bad key");
        assert_eq!(err.job_code(), Some(32773));

        let err = Error::Job { code: 2, description: String::new() };
        assert_eq!(err.to_string(), "Job failed with error code: 2");
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(Error::NotFound("Msvm_Foo".into()).is_not_found());
        assert!(!Error::Remote("boom".into()).is_not_found());
        assert_eq!(Error::Remote("boom".into()).job_code(), None);
    }
}
