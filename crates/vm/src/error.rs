//! Error types for the Skein VM crate.
//!
//! This module provides error handling for VM execution, the call
//! protocol, continuation transfer and bytecode loading.

use thiserror::Error;

/// VM execution errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// Wrong number of arguments for a closure or primitive.
    #[error("{callee} requires {expected} (got {given})")]
    WrongArity {
        callee: String,
        expected: String,
        given: usize,
    },

    /// Non-procedure in operator position.
    #[error("bad function {callee}, cannot be applied")]
    BadCallable { callee: String },

    /// Primitive invoked with an argument outside its domain.
    #[error("{primitive}: bad argument {value}")]
    BadOperandType { primitive: String, value: String },

    /// Division by zero in an exact operation.
    #[error("{primitive}: division by zero")]
    DivisionByZero { primitive: String },

    /// Restore applied to a non-continuation.
    #[error("bad continuation {value}")]
    BadContinuation { value: String },

    /// Malformed container, truncated instruction stream or invalid code.
    #[error("bad bytecode: {reason}")]
    BadBytecode { reason: String },

    /// Reference to an unbound global variable.
    #[error("variable {name} unbound")]
    UnboundVariable { name: String },

    /// Scheme stack bounds violation.
    #[error("stack overflow")]
    StackOverflow,

    /// Pop from an empty operand region.
    #[error("stack underflow")]
    StackUnderflow,

    /// A condition was raised and no handler was installed.
    #[error("uncaught condition: {message}")]
    UncaughtCondition { message: String },

    /// Raised by `exit` with the requested status code.
    #[error("exit requested with code {code}")]
    ExitRequested { code: i32 },

    /// Inconsistent saved state found in a stack record.
    #[error("corrupted stack record: {message}")]
    CorruptedStack { message: String },

    /// I/O failure while reading or writing a bytecode container.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Internal nonlocal transfer toward the re-entry that installed the
    /// topmost escape anchor. Never surfaced to callers.
    #[error("handler transfer to re-entry {depth}")]
    HandlerUnwind { depth: usize },

    /// Internal nonlocal transfer carrying a pending continuation
    /// restoration. Never surfaced to callers.
    #[error("continuation transfer")]
    ContinuationUnwind,
}

impl VmError {
    /// Creates a wrong-arity error for an exact-arity callee.
    pub fn arity_exact<S: Into<String>>(callee: S, expected: i16, given: usize) -> Self {
        let plural = if expected == 1 { "" } else { "s" };
        VmError::WrongArity {
            callee: callee.into(),
            expected: format!("{expected} argument{plural}"),
            given,
        }
    }

    /// Creates a wrong-arity error for a variadic callee with a minimum count.
    pub fn arity_at_least<S: Into<String>>(callee: S, min: i16, given: usize) -> Self {
        let plural = if min == 1 { "" } else { "s" };
        VmError::WrongArity {
            callee: callee.into(),
            expected: format!("at least {min} argument{plural}"),
            given,
        }
    }

    /// Creates a bad-callable error.
    pub fn bad_callable<S: Into<String>>(callee: S) -> Self {
        VmError::BadCallable {
            callee: callee.into(),
        }
    }

    /// Creates a bad-operand error on behalf of a primitive.
    pub fn bad_operand<S: Into<String>, T: Into<String>>(primitive: S, value: T) -> Self {
        VmError::BadOperandType {
            primitive: primitive.into(),
            value: value.into(),
        }
    }

    /// Creates a bad-bytecode error.
    pub fn bad_bytecode<S: Into<String>>(reason: S) -> Self {
        VmError::BadBytecode {
            reason: reason.into(),
        }
    }

    /// Creates a corrupted-stack error.
    pub fn corrupted_stack<S: Into<String>>(message: S) -> Self {
        VmError::CorruptedStack {
            message: message.into(),
        }
    }

    /// Creates an I/O error.
    pub fn io<S: Into<String>>(message: S) -> Self {
        VmError::Io {
            message: message.into(),
        }
    }

    /// Returns true for the internal control variants that implement
    /// nonlocal transfer and must never be converted into conditions.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            VmError::HandlerUnwind { .. }
                | VmError::ContinuationUnwind
                | VmError::UncaughtCondition { .. }
        )
    }
}

/// Result type alias for VM operations.
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity_message_pluralization() {
        let err = VmError::arity_exact("square", 1, 3);
        assert_eq!(err.to_string(), "square requires 1 argument (got 3)");

        let err = VmError::arity_at_least("list", 2, 0);
        assert_eq!(err.to_string(), "list requires at least 2 arguments (got 0)");
    }

    #[test]
    fn test_control_classification() {
        assert!(VmError::HandlerUnwind { depth: 1 }.is_control());
        assert!(VmError::ContinuationUnwind.is_control());
        assert!(!VmError::StackOverflow.is_control());
        assert!(!VmError::bad_callable("42").is_control());
    }
}
