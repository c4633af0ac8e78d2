//! Cache of resolved host-call targets, keyed by call signature.
//!
//! Resolving which host method or constructor a call site means (overload
//! selection against runtime argument types) is expensive. Call sites tend to
//! see the same argument types again and again, so the resolution is memoized
//! under an [`ExecutableKey`] built from the call kind, the declaring type, the
//! member name and the runtime type of every argument.
//!
//! Entries are never evicted: the set of call shapes a program produces is
//! bounded by its call sites.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use strum::Display;
use tracing::debug;

use crate::host::Resolution;
use crate::memo::Memoized;
use crate::value::{HostType, Value};

/// What a host call site invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ExecutableKind {
    InstanceMethod,
    StaticMethod,
    Constructor,
}

/// The signature of a host call site, as seen at run time.
///
/// Keys are equal when kind, declaring type, member name and the per-argument
/// fingerprint are all equal. A `None` entry in the fingerprint marks a null
/// argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutableKey {
    kind: ExecutableKind,
    declaring: HostType,
    member: Option<String>,
    fingerprint: Vec<Option<HostType>>,
}

impl ExecutableKey {
    /// Key for a method call. The receiver of an instance method, if passed as
    /// an argument, is part of `args`.
    pub fn method(
        declaring: impl Into<HostType>,
        name: impl Into<String>,
        is_static: bool,
        args: &[Value],
    ) -> Self {
        Self {
            kind: if is_static {
                ExecutableKind::StaticMethod
            } else {
                ExecutableKind::InstanceMethod
            },
            declaring: declaring.into(),
            member: Some(name.into()),
            fingerprint: fingerprint(args),
        }
    }

    /// Key for a constructor call.
    pub fn constructor(declaring: impl Into<HostType>, args: &[Value]) -> Self {
        Self {
            kind: ExecutableKind::Constructor,
            declaring: declaring.into(),
            member: None,
            fingerprint: fingerprint(args),
        }
    }

    pub fn kind(&self) -> ExecutableKind {
        self.kind
    }

    pub fn declaring(&self) -> &HostType {
        &self.declaring
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn fingerprint(&self) -> &[Option<HostType>] {
        &self.fingerprint
    }
}

impl fmt::Display for ExecutableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.declaring)?;
        if let Some(member) = &self.member {
            write!(f, ".{}", member)?;
        }
        write!(f, "(")?;
        for (i, ty) in self.fingerprint.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match ty {
                Some(ty) => write!(f, "{}", ty)?,
                None => write!(f, "null")?,
            }
        }
        write!(f, ")")
    }
}

fn fingerprint(args: &[Value]) -> Vec<Option<HostType>> {
    args.iter().map(Value::host_type).collect()
}

/// Thread-safe map from call signature to memoized resolution.
///
/// The map lock is held only to find or insert an entry; the resolution itself
/// runs under the entry's own [`Memoized`] lock, so different call shapes
/// resolve in parallel and each shape resolves once.
pub struct InvokerCache<V = Resolution> {
    entries: RwLock<HashMap<ExecutableKey, Arc<Memoized<V>>>>,
}

impl<V> InvokerCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Return the value cached for `key`, running `resolve` if the key is new.
    ///
    /// Whatever `resolve` returns, including failures, is cached as is.
    pub fn get_or_resolve<F>(&self, key: ExecutableKey, resolve: F) -> V
    where
        F: FnOnce() -> V + Send + 'static,
    {
        let existing = self.entries.read().get(&key).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => {
                let mut entries = self.entries.write();
                Arc::clone(entries.entry(key).or_insert_with_key(|key| {
                    debug!(signature = %key, "invoker cache miss");
                    Arc::new(Memoized::boxed(resolve))
                }))
            }
        };
        entry.get().clone()
    }

    pub fn contains(&self, key: &ExecutableKey) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<V> Default for InvokerCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for InvokerCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokerCache")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}
