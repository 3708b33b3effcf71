//! Request and response envelopes exchanged between execution client and server.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    ir::{ExecutionMode, Value},
    utils::{from_bytes, to_bytes},
    variable::Variable,
    Error, Result,
};

/// A request to run one method on a remote host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlates the response with this request
    pub correlation_id: Uuid,
    /// Execution mode of the method
    pub mode: ExecutionMode,
    /// Run on the server's dedicated main thread
    pub run_on_main_thread: bool,
    /// File name of the code module declaring the type
    pub module_file_name: String,
    /// Content digest of the client's code module
    pub module_hash: String,
    /// Full name of the declaring type
    pub type_full_name: String,
    /// Method name
    pub method_name: String,
    /// Arguments, in declaration order
    pub parameters: Vec<Variable>,
    /// Non-local state the method touches, normal mode only
    pub non_locals: Vec<Variable>,
    /// Raw module file, attached only when resending after [`ResultEnvelope::ModuleUnknown`]
    pub module_bytes: Option<Vec<u8>>,
}

impl Request {
    /// A request without parameters, state or module bytes, under a fresh correlation id.
    #[must_use]
    pub fn new(
        mode: ExecutionMode,
        module_file_name: impl Into<String>,
        module_hash: impl Into<String>,
        type_full_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> Self {
        Request {
            correlation_id: Uuid::new_v4(),
            mode,
            run_on_main_thread: false,
            module_file_name: module_file_name.into(),
            module_hash: module_hash.into(),
            type_full_name: type_full_name.into(),
            method_name: method_name.into(),
            parameters: Vec::new(),
            non_locals: Vec::new(),
            module_bytes: None,
        }
    }

    /// Requests the server's main thread.
    #[must_use]
    pub fn on_main_thread(mut self, main_thread: bool) -> Self {
        self.run_on_main_thread = main_thread;
        self
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Vec<Variable>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the non-local state.
    #[must_use]
    pub fn with_non_locals(mut self, non_locals: Vec<Variable>) -> Self {
        self.non_locals = non_locals;
        self
    }

    /// Attaches the raw module file.
    #[must_use]
    pub fn with_module_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.module_bytes = Some(bytes);
        self
    }

    /// The argument values, in declaration order.
    #[must_use]
    pub fn arguments(&self) -> Vec<Value> {
        self.parameters.iter().map(|p| p.value().clone()).collect()
    }

    /// The error reported when no response arrives within `timeout`.
    #[must_use]
    pub fn timeout_error(&self, timeout: Duration) -> Error {
        Error::ServerTimeout {
            method: self.method_name.clone(),
            type_name: self.type_full_name.clone(),
            module: self.module_file_name.clone(),
            timeout,
        }
    }

    /// Encodes the request for an RPC-style channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if a value cannot be encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_bytes(self)
    }

    /// Decodes a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] for undecodable input.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        from_bytes(data)
    }
}

/// Classification of a server-side failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// The invoked method threw
    UserException {
        /// Declaring type of the throwing method
        type_name: String,
        /// Throwing method
        method: String,
    },
    /// The server runs another version of the module
    StaleModule,
    /// The type, method or overload does not exist on the server
    MemberNotFound,
    /// The request could not be honoured as sent
    InvalidRequest,
    /// Any other server failure
    Internal,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::UserException { type_name, method } => {
                write!(f, "exception in {type_name}::{method}")
            }
            FaultKind::StaleModule => f.write_str("stale module"),
            FaultKind::MemberNotFound => f.write_str("member not found"),
            FaultKind::InvalidRequest => f.write_str("invalid request"),
            FaultKind::Internal => f.write_str("internal error"),
        }
    }
}

/// A failure reported by the server in place of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    /// What went wrong
    pub kind: FaultKind,
    /// The server-side error message
    pub message: String,
}

impl RemoteFault {
    /// Classifies a server-side error.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        let kind = match error {
            Error::UserException {
                type_name, method, ..
            } => FaultKind::UserException {
                type_name: type_name.clone(),
                method: method.clone(),
            },
            Error::StaleModule { .. } => FaultKind::StaleModule,
            Error::MemberNotFound { .. } => FaultKind::MemberNotFound,
            Error::InvalidOperation(_) | Error::Malformed { .. } | Error::Codec(_) => {
                FaultKind::InvalidRequest
            }
            _ => FaultKind::Internal,
        };
        let message = match error {
            Error::UserException { message, .. } => message.clone(),
            other => other.to_string(),
        };
        RemoteFault { kind, message }
    }

    /// The error the client raises for this fault.
    ///
    /// User exceptions are re-raised with their original contents; everything else is
    /// an [`Error::Remote`].
    #[must_use]
    pub fn into_error(self) -> Error {
        match self.kind {
            FaultKind::UserException { type_name, method } => Error::UserException {
                type_name,
                method,
                message: self.message,
            },
            _ => Error::Remote(self),
        }
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The server's answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultEnvelope {
    /// The method ran
    Completed {
        /// Return value, `Null` for void methods
        return_value: Value,
        /// Non-local state after the invocation, normal mode only
        non_locals: Vec<Variable>,
    },
    /// The server has no module matching the request's name and hash; resend with the
    /// module bytes attached
    ModuleUnknown,
    /// The invocation failed
    Fault(RemoteFault),
}

impl ResultEnvelope {
    /// Encodes the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if a value cannot be encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_bytes(self)
    }

    /// Decodes an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] for undecodable input.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        from_bytes(data)
    }

    /// Converts the envelope into the client-side call result.
    ///
    /// # Errors
    ///
    /// A [`ResultEnvelope::Fault`] becomes its [`RemoteFault::into_error`].
    pub fn into_call_result(self) -> Result<ExecuteServiceCallResult> {
        match self {
            ResultEnvelope::Completed {
                return_value,
                non_locals,
            } => Ok(ExecuteServiceCallResult::executed(return_value, non_locals)),
            ResultEnvelope::ModuleUnknown => Ok(ExecuteServiceCallResult::assembly_missing()),
            ResultEnvelope::Fault(fault) => Err(fault.into_error()),
        }
    }
}

/// Outcome of one execution-client call as seen by the calling method.
///
/// Executed, disabled and module-missing are mutually exclusive: the only way to build
/// a result is through one of the three constructors.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteServiceCallResult {
    is_executed: bool,
    is_assembly_missing: bool,
    result: Value,
    non_locals: Vec<Variable>,
}

impl ExecuteServiceCallResult {
    /// Nomad dispatch is disabled; the caller runs the method locally.
    #[must_use]
    pub fn disabled() -> Self {
        ExecuteServiceCallResult {
            is_executed: false,
            is_assembly_missing: false,
            result: Value::Null,
            non_locals: Vec::new(),
        }
    }

    /// The server needs the module bytes.
    #[must_use]
    pub fn assembly_missing() -> Self {
        ExecuteServiceCallResult {
            is_executed: false,
            is_assembly_missing: true,
            result: Value::Null,
            non_locals: Vec::new(),
        }
    }

    /// The method ran remotely.
    #[must_use]
    pub fn executed(result: Value, non_locals: Vec<Variable>) -> Self {
        ExecuteServiceCallResult {
            is_executed: true,
            is_assembly_missing: false,
            result,
            non_locals,
        }
    }

    /// Whether the method ran remotely.
    #[must_use]
    pub fn is_executed(&self) -> bool {
        self.is_executed
    }

    /// Whether the server asked for the module bytes.
    #[must_use]
    pub fn is_assembly_missing(&self) -> bool {
        self.is_assembly_missing
    }

    /// The remote return value.
    #[must_use]
    pub fn result(&self) -> &Value {
        &self.result
    }

    /// The non-local state returned by the server.
    #[must_use]
    pub fn non_locals(&self) -> &[Variable] {
        &self.non_locals
    }

    /// Consumes the result, returning the remote return value.
    #[must_use]
    pub fn into_result(self) -> Value {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::INT32;

    #[test]
    fn test_user_exception_survives_the_wire() {
        let error = Error::UserException {
            type_name: "Shop.Cart".into(),
            method: "Checkout".into(),
            message: "empty cart".into(),
        };
        let fault = RemoteFault::from_error(&error);
        let envelope = ResultEnvelope::Fault(fault);
        let decoded = ResultEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();

        let ResultEnvelope::Fault(fault) = decoded else {
            panic!("expected a fault");
        };
        match fault.into_error() {
            Error::UserException {
                type_name,
                method,
                message,
            } => {
                assert_eq!(type_name, "Shop.Cart");
                assert_eq!(method, "Checkout");
                assert_eq!(message, "empty cart");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_other_faults_become_remote_errors() {
        let error = Error::MemberNotFound {
            member: "Run".into(),
            type_name: "Ops.Jobs".into(),
            module: "Ops.nmod".into(),
        };
        let fault = RemoteFault::from_error(&error);
        assert_eq!(fault.kind, FaultKind::MemberNotFound);
        assert!(fault.to_string().starts_with("member not found: "));
        assert!(matches!(fault.into_error(), Error::Remote(_)));
    }

    #[test]
    fn test_service_call_result_flags() {
        let disabled = ExecuteServiceCallResult::disabled();
        assert!(!disabled.is_executed() && !disabled.is_assembly_missing());

        let missing = ResultEnvelope::ModuleUnknown.into_call_result().unwrap();
        assert!(missing.is_assembly_missing() && !missing.is_executed());

        let done = ResultEnvelope::Completed {
            return_value: Value::I32(6),
            non_locals: vec![Variable::field("Shop.Counter", "count", INT32, Value::I32(6), false)],
        }
        .into_call_result()
        .unwrap();
        assert!(done.is_executed());
        assert_eq!(done.non_locals().len(), 1);
        assert_eq!(done.into_result(), Value::I32(6));
    }

    #[test]
    fn test_request_timeout_error_names_the_method() {
        let request = Request::new(
            ExecutionMode::Normal,
            "Shop.nmod",
            "abc",
            "Shop.Counter",
            "Increment",
        );
        let err = request.timeout_error(Duration::from_millis(10));
        let text = err.to_string();
        assert!(text.contains("Shop.Counter::Increment"));
        assert!(text.contains("Shop.nmod"));
    }
}
