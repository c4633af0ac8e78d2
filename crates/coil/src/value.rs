use std::borrow::Cow;
use std::fmt;

use crate::suspend::{SuspendKind, Suspendable};

/// A runtime value held in a context's data stack or constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The language's "no value" marker. Also the null argument at host call sites.
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    /// A generator or coroutine object wrapping a parked context.
    Suspended(Suspendable),
    /// Exhaustion sentinel pushed when an iterator-advance or generator-send
    /// instruction observes `StopIteration`.
    StopIteration,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Suspended(handle) => match handle.kind() {
                SuspendKind::Generator => "generator",
                SuspendKind::Coroutine => "coroutine",
            },
            Value::StopIteration => "StopIteration",
        }
    }

    /// The runtime type used to fingerprint host call sites.
    ///
    /// Returns `None` for [`Value::None`], which stands in for a null argument.
    pub fn host_type(&self) -> Option<HostType> {
        match self {
            Value::None => None,
            other => Some(HostType::from_static(other.type_name())),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn is_stop_iteration(&self) -> bool {
        matches!(self, Value::StopIteration)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None | Value::StopIteration => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Suspended(_) => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_suspendable(&self) -> Option<Suspendable> {
        match self {
            Value::Suspended(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Convert to the string form used in exception messages and `print`.
    ///
    /// Unlike `Display`, strings are not quoted.
    pub fn to_print_string(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => {
                if fl.fract() == 0.0 {
                    write!(f, "{}.0", fl)
                } else {
                    write!(f, "{}", fl)
                }
            }
            Value::Str(s) => write!(f, "'{}'", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Suspended(handle) => {
                write!(f, "<{} object at {}>", handle.kind(), handle.context())
            }
            Value::StopIteration => write!(f, "<StopIteration>"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::None,
        }
    }
}

/// Name of a host-runtime type: a declaring type at a host call site, or the
/// runtime type of one argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostType(Cow<'static, str>);

impl HostType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for HostType {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}
