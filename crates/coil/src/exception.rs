//! Script exceptions and the carrier that moves them between frames.
//!
//! Anything an instruction raises, whether a script-level `raise` or a failure
//! thrown by a host call, travels as an [`Exception`]. Host calls made through a
//! reflective invoker report failures wrapped in one or more
//! [`Thrown::InvocationTarget`] layers; the carrier strips those layers when it
//! is constructed, so messages, type checks and handler matching always see the
//! value that was originally thrown.

use std::fmt;

use strum::{Display, EnumString, IntoStaticStr};

/// Built-in exception kinds understood by the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExcType {
    BaseException,
    Exception,
    StopIteration,
    RuntimeError,
    TypeError,
    ValueError,
    NameError,
    IndexError,
    KeyError,
    AttributeError,
    ZeroDivisionError,
    /// A failure thrown by the host runtime rather than by script code.
    HostError,
}

impl ExcType {
    /// Check whether an exception of this kind is caught by a handler for `handler`.
    ///
    /// `Exception` and `BaseException` match everything. Otherwise the kinds
    /// must match exactly.
    pub fn matches(self, handler: ExcType) -> bool {
        matches!(handler, ExcType::Exception | ExcType::BaseException) || self == handler
    }
}

/// A raw thrown value, before or after unwrapping.
#[derive(Debug, Clone, PartialEq)]
pub enum Thrown {
    /// Raised by script code or by an instruction.
    Raised { kind: ExcType, message: String },
    /// Thrown by the host runtime.
    Host { type_name: String, message: String },
    /// Wrapping added by a reflective invocation around whatever the target threw.
    InvocationTarget(Box<Thrown>),
}

impl Thrown {
    pub fn raised(kind: ExcType, message: impl Into<String>) -> Self {
        Thrown::Raised {
            kind,
            message: message.into(),
        }
    }

    pub fn host(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Thrown::Host {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Wrap `self` the way a reflective call wraps a failure of its target.
    pub fn into_invocation_target(self) -> Self {
        Thrown::InvocationTarget(Box::new(self))
    }
}

/// Strip every layer of invocation-target wrapping.
///
/// Applying this to an already unwrapped value returns it unchanged.
pub fn unwrap_invocation(mut thrown: Thrown) -> Thrown {
    while let Thrown::InvocationTarget(inner) = thrown {
        thrown = *inner;
    }
    thrown
}

/// One entry of an exception's traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceFrame {
    /// Label of the context the frame belongs to (usually the function name).
    pub name: String,
    /// Source line of the instruction that was executing, when known.
    pub line: Option<u32>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}, in {}", line, self.name),
            None => write!(f, "in {}", self.name),
        }
    }
}

/// A thrown value plus the traceback accumulated while it was unwound.
///
/// Frames are stored innermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    thrown: Thrown,
    traceback: Vec<TraceFrame>,
}

impl Exception {
    /// Wrap a thrown value, unwrapping nested invocation-target layers.
    pub fn new(thrown: Thrown) -> Self {
        Self {
            thrown: unwrap_invocation(thrown),
            traceback: Vec::new(),
        }
    }

    pub fn raised(kind: ExcType, message: impl Into<String>) -> Self {
        Self::new(Thrown::raised(kind, message))
    }

    pub fn stop_iteration() -> Self {
        Self::raised(ExcType::StopIteration, "")
    }

    /// The fully unwrapped thrown value.
    pub fn thrown(&self) -> &Thrown {
        &self.thrown
    }

    /// Consume the carrier, returning the thrown value.
    pub fn into_thrown(self) -> Thrown {
        self.thrown
    }

    pub fn kind(&self) -> ExcType {
        match &self.thrown {
            Thrown::Raised { kind, .. } => *kind,
            Thrown::Host { .. } | Thrown::InvocationTarget(_) => ExcType::HostError,
        }
    }

    /// Name of the exception type as shown to users.
    pub fn type_name(&self) -> &str {
        match &self.thrown {
            Thrown::Raised { kind, .. } => (*kind).into(),
            Thrown::Host { type_name, .. } => type_name,
            Thrown::InvocationTarget(_) => ExcType::HostError.into(),
        }
    }

    pub fn message(&self) -> &str {
        match &self.thrown {
            Thrown::Raised { message, .. } | Thrown::Host { message, .. } => message,
            Thrown::InvocationTarget(_) => "",
        }
    }

    pub fn is_stop_iteration(&self) -> bool {
        self.kind() == ExcType::StopIteration
    }

    pub fn traceback(&self) -> &[TraceFrame] {
        &self.traceback
    }

    pub(crate) fn push_frame(&mut self, frame: TraceFrame) {
        self.traceback.push(frame);
    }

    /// Render the traceback outermost frame first, followed by the message.
    pub fn render_traceback(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for frame in self.traceback.iter().rev() {
            out.push_str("  ");
            out.push_str(&frame.to_string());
            out.push('\n');
        }
        out.push_str(&self.to_string());
        out
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.message();
        if message.is_empty() {
            write!(f, "{}", self.type_name())
        } else {
            write!(f, "{}: {}", self.type_name(), message)
        }
    }
}

impl std::error::Error for Exception {}

impl From<Thrown> for Exception {
    fn from(thrown: Thrown) -> Self {
        Self::new(thrown)
    }
}
