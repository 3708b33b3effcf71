use std::{collections::BTreeMap, fmt, time::Duration};

use thiserror::Error;

use crate::remote::RemoteFault;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The kind of member a failed reference pointed at.
///
/// Used by [`Error::ReferenceNotFound`] to tell apart unresolved fields, properties,
/// methods and types discovered while walking a method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// A field reference (`ldfld`, `stfld`, `ldsfld`, `stsfld`)
    Field,
    /// A property, resolved through one of its accessor methods
    Property,
    /// A called method
    Method,
    /// A type referenced by any of the above
    Type,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReferenceKind::Field => "field",
            ReferenceKind::Property => "property",
            ReferenceKind::Method => "method",
            ReferenceKind::Type => "type",
        };
        f.write_str(name)
    }
}

/// The collected failures of an exhausted fault recoverer.
///
/// A [`crate::remote::Retry`] records one error per attempt, in attempt order. A
/// [`crate::remote::Failover`] records one error per endpoint, keyed by endpoint.
#[derive(Debug)]
pub enum RecoveryFailure {
    /// Every attempt of a retry recoverer failed
    Retry(Vec<Error>),
    /// Every endpoint of a failover recoverer failed
    Failover(BTreeMap<String, Error>),
}

impl RecoveryFailure {
    /// Number of failed attempts carried by this failure.
    #[must_use]
    pub fn attempts(&self) -> usize {
        match self {
            RecoveryFailure::Retry(errors) => errors.len(),
            RecoveryFailure::Failover(errors) => errors.len(),
        }
    }
}

impl fmt::Display for RecoveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryFailure::Retry(errors) => {
                write!(f, "{} attempts failed", errors.len())?;
                if let Some(last) = errors.last() {
                    write!(f, ", last error: {last}")?;
                }
                Ok(())
            }
            RecoveryFailure::Failover(errors) => {
                write!(f, "{} endpoints failed", errors.len())?;
                for (endpoint, error) in errors {
                    write!(f, "; {endpoint}: {error}")?;
                }
                Ok(())
            }
        }
    }
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Build-time (discovery and rewriting)
/// - [`Error::ReferenceNotFound`] - A field, property or method referenced by a body does not resolve
/// - [`Error::InvalidNomadMethod`] - A marked method violates the preconditions of its execution mode
///
/// ## Remote execution
/// - [`Error::StaleModule`] - The server already runs another version of the module
/// - [`Error::MemberNotFound`] - The server cannot resolve the requested type, method or overload
/// - [`Error::ServerTimeout`] - No response arrived before the client timeout
/// - [`Error::Remote`] - The server reported a failure that is not a user exception
/// - [`Error::Transport`] - The channel failed
/// - [`Error::RecoveryFailed`] - A retry or failover wrapper ran out of attempts
///
/// ## Execution
/// - [`Error::UserException`] - User code threw; never wrapped, always propagated as-is
/// - [`Error::AccessorUnavailable`] - A property has no setter (callers skip the variable)
/// - [`Error::InvalidOperation`] - A parameter variable was asked to copy itself
/// - [`Error::RecursionLimit`] - The interpreter call depth limit was reached
///
/// # Examples
///
/// ```rust
/// use nomad::Error;
///
/// fn describe(err: &Error) -> &'static str {
///     match err {
///         Error::ServerTimeout { .. } => "server did not answer",
///         Error::UserException { .. } => "the method itself failed",
///         Error::RecoveryFailed(_) => "all attempts failed",
///         _ => "other",
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// Encoded data (a module file, a wire payload, a mailbox message) is damaged.
    ///
    /// The error includes the source location where the malformation was detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Serialization or deserialization of a payload failed.
    #[error("Codec failure - {0}")]
    Codec(String),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// A reference found in a method body could not be resolved during discovery.
    ///
    /// Remote execution cannot be made correct without the full closure of touched
    /// state, so this aborts processing of the enclosing module.
    #[error("Unresolved {kind} reference '{name}' on '{owner}' in method '{method}'")]
    ReferenceNotFound {
        /// What was referenced
        kind: ReferenceKind,
        /// Name of the referenced member
        name: String,
        /// Full name of the type owning the referenced member
        owner: String,
        /// Method whose body contains the reference
        method: String,
    },

    /// A method marked nomadic cannot be rewritten under its declared mode.
    #[error("Invalid nomadic method '{method}' in module '{module}' - {reason}")]
    InvalidNomadMethod {
        /// Full name of the offending method
        method: String,
        /// Module declaring the method
        module: String,
        /// Which precondition failed
        reason: String,
    },

    /// A request named a module version other than the one already loaded for a type.
    ///
    /// Loaded code cannot be swapped out; the host has to be restarted.
    #[error("Module '{module}' is loaded with hash {loaded_hash} but type '{type_name}' was requested with hash {requested_hash}; restart the host")]
    StaleModule {
        /// Module file name
        module: String,
        /// Requested type
        type_name: String,
        /// Hash of the version already loaded
        loaded_hash: String,
        /// Hash carried by the request
        requested_hash: String,
    },

    /// A type, method or overload could not be resolved at run time.
    #[error("Member '{member}' not found on '{type_name}' in module '{module}'")]
    MemberNotFound {
        /// Method or field name (or the type name itself for missing types)
        member: String,
        /// Full name of the type searched
        type_name: String,
        /// Module searched
        module: String,
    },

    /// A property cannot be written because it has no setter.
    #[error("Property '{property}' on '{type_name}' has no setter")]
    AccessorUnavailable {
        /// Property name
        property: String,
        /// Declaring type
        type_name: String,
    },

    /// An operation is not valid for the receiving object.
    #[error("Invalid operation - {0}")]
    InvalidOperation(String),

    /// No response arrived before the configured timeout elapsed.
    #[error("Server did not answer within {timeout:?} for '{type_name}::{method}' in module '{module}'")]
    ServerTimeout {
        /// Method name
        method: String,
        /// Declaring type
        type_name: String,
        /// Module file name
        module: String,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// Every attempt of a fault recoverer failed.
    #[error("Fault recovery failed - {0}")]
    RecoveryFailed(RecoveryFailure),

    /// User code threw an exception.
    ///
    /// Raised by the `throw` instruction. The engine never wraps it: a user exception
    /// raised on the server is re-raised on the client with the same contents.
    #[error("Exception in '{type_name}::{method}': {message}")]
    UserException {
        /// Declaring type of the throwing method
        type_name: String,
        /// Throwing method
        method: String,
        /// Thrown message
        message: String,
    },

    /// The server failed the request for a reason other than a user exception.
    #[error("Remote execution failed - {0}")]
    Remote(RemoteFault),

    /// The channel failed to deliver the request or the response.
    #[error("Transport failure towards '{endpoint}' - {message}")]
    Transport {
        /// Destination endpoint
        endpoint: String,
        /// Description of the underlying fault
        message: String,
    },

    /// Recursion limit reached.
    ///
    /// The associated value shows the call depth limit that was reached.
    #[error("Reach the maximum recursion level allowed - {0}")]
    RecursionLimit(usize),

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,
}

impl From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Self {
        Error::Codec(error.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(error: base64::DecodeError) -> Self {
        Error::Codec(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_macro_records_location() {
        let err = malformed_error!("bad field count {}", 3);
        match err {
            Error::Malformed {
                message,
                file,
                line,
            } => {
                assert_eq!(message, "bad field count 3");
                assert!(file.ends_with("error.rs"));
                assert!(line > 0);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_recovery_failure_display() {
        let failure = RecoveryFailure::Retry(vec![
            Error::Error("first".into()),
            Error::Error("second".into()),
        ]);
        assert_eq!(failure.attempts(), 2);
        assert_eq!(failure.to_string(), "2 attempts failed, last error: second");

        let mut per_endpoint = BTreeMap::new();
        per_endpoint.insert("a".to_string(), Error::Error("down".into()));
        let failure = RecoveryFailure::Failover(per_endpoint);
        assert_eq!(failure.to_string(), "1 endpoints failed; a: down");
    }
}
