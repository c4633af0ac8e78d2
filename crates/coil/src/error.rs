use thiserror::Error;

use crate::context::ContextId;
use crate::exception::Exception;
use crate::suspend::SuspendKind;

#[derive(Debug, Error)]
pub enum Error {
    /// A script exception. The only kind of error that exceptional jumps can catch.
    #[error("{0}")]
    Exception(Exception),

    /// A non-`None` value was sent to a generator or coroutine that has not started.
    #[error("can't send non-None value to a just-started {kind} (got {value_type})")]
    InvalidSend {
        kind: SuspendKind,
        value_type: &'static str,
    },

    #[error("Instruction limit exceeded (limit: {0})")]
    InstructionLimitExceeded(u64),

    #[error("Recursion limit exceeded (limit: {0})")]
    RecursionLimitExceeded(usize),

    /// The context was never allocated or has already been released.
    #[error("unknown context {0}")]
    UnknownContext(ContextId),

    #[error("data stack underflow in '{0}'")]
    StackUnderflow(String),

    /// An instruction referenced a pool entry or target that does not exist.
    #[error("bad operand: {0}")]
    BadOperand(String),
}

impl Error {
    /// Whether exception handlers in script code may intercept this error.
    ///
    /// Everything but [`Error::Exception`] leaves the dispatch loop immediately.
    pub fn is_catchable(&self) -> bool {
        matches!(self, Error::Exception(_))
    }

    /// Get the script exception if this is one.
    pub fn as_exception(&self) -> Option<&Exception> {
        match self {
            Error::Exception(exc) => Some(exc),
            _ => None,
        }
    }

    pub fn into_exception(self) -> Option<Exception> {
        match self {
            Error::Exception(exc) => Some(exc),
            _ => None,
        }
    }
}

impl From<Exception> for Error {
    fn from(exc: Exception) -> Self {
        Error::Exception(exc)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
