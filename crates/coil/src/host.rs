//! The boundary between the VM and the host runtime.
//!
//! `CallHost` instructions describe a call site by [`ExecutableKey`]. On a
//! cache miss the VM asks a [`HostBridge`] to resolve the key into an
//! [`Invoker`]; the invoker is what actually performs the call. Both halves
//! belong to the embedder: the VM only caches resolutions and runs invokers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cache::{ExecutableKey, ExecutableKind};
use crate::exception::{ExcType, Thrown};
use crate::value::{HostType, Value};

/// A resolved host call target.
///
/// Failures of the target should come back wrapped in
/// [`Thrown::InvocationTarget`]; the VM unwraps them before raising.
pub type Invoker = Arc<dyn Fn(&[Value]) -> Result<Value, Thrown> + Send + Sync>;

/// Outcome of resolving a call site, cached per [`ExecutableKey`].
pub type Resolution = Result<Invoker, Thrown>;

/// Resolves host call sites into invokers.
pub trait HostBridge: Send + Sync {
    /// Find the target for `key`. The key carries the runtime type of every
    /// argument; later calls with the same key reuse the result.
    fn resolve(&self, key: &ExecutableKey) -> Resolution;
}

/// A bridge with nothing registered. Every host call raises `AttributeError`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHost;

impl HostBridge for NoHost {
    fn resolve(&self, key: &ExecutableKey) -> Resolution {
        Err(Thrown::raised(
            ExcType::AttributeError,
            format!("no host bridge configured for {}", key),
        ))
    }
}

/// Parameter type that accepts any argument, including null.
pub const ANY: HostType = HostType::from_static("object");

/// Type alias for host functions registered by the embedder.
pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value, Thrown> + Send + Sync>;

#[derive(Clone)]
struct Overload {
    params: Vec<HostType>,
    func: HostFn,
}

impl Overload {
    /// Whether the overload accepts arguments with this fingerprint.
    ///
    /// A null argument is accepted by every parameter type.
    fn accepts(&self, fingerprint: &[Option<HostType>]) -> bool {
        self.params.len() == fingerprint.len()
            && self.params.iter().zip(fingerprint).all(|(param, arg)| {
                *param == ANY || arg.as_ref().is_none_or(|arg| arg == param)
            })
    }
}

type RegistryKey = (ExecutableKind, HostType, Option<String>);

/// A [`HostBridge`] backed by Rust closures registered up front.
///
/// Overloads are tried in registration order; the first whose parameter types
/// accept the call's fingerprint wins.
///
/// ```
/// use coil::{ExecutableKey, HostBridge, HostRegistry, Value};
///
/// let mut host = HostRegistry::new();
/// host.register_static("math", "double", &["int"], |args| {
///     Ok(Value::Int(args[0].as_int().unwrap_or(0) * 2))
/// });
///
/// let key = ExecutableKey::method("math", "double", true, &[Value::Int(21)]);
/// let invoker = host.resolve(&key).unwrap();
/// assert_eq!(invoker(&[Value::Int(21)]).unwrap(), Value::Int(42));
/// ```
#[derive(Default)]
pub struct HostRegistry {
    overloads: HashMap<RegistryKey, Vec<Overload>>,
    resolutions: AtomicUsize,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance method. The receiver is the first parameter.
    pub fn register_method<F>(
        &mut self,
        declaring: impl Into<HostType>,
        name: impl Into<String>,
        params: &[&str],
        f: F,
    ) where
        F: Fn(&[Value]) -> Result<Value, Thrown> + Send + Sync + 'static,
    {
        self.register(
            (ExecutableKind::InstanceMethod, declaring.into(), Some(name.into())),
            params,
            Arc::new(f),
        );
    }

    /// Register a static method.
    pub fn register_static<F>(
        &mut self,
        declaring: impl Into<HostType>,
        name: impl Into<String>,
        params: &[&str],
        f: F,
    ) where
        F: Fn(&[Value]) -> Result<Value, Thrown> + Send + Sync + 'static,
    {
        self.register(
            (ExecutableKind::StaticMethod, declaring.into(), Some(name.into())),
            params,
            Arc::new(f),
        );
    }

    /// Register a constructor.
    pub fn register_constructor<F>(&mut self, declaring: impl Into<HostType>, params: &[&str], f: F)
    where
        F: Fn(&[Value]) -> Result<Value, Thrown> + Send + Sync + 'static,
    {
        self.register(
            (ExecutableKind::Constructor, declaring.into(), None),
            params,
            Arc::new(f),
        );
    }

    fn register(&mut self, key: RegistryKey, params: &[&str], func: HostFn) {
        let params = params.iter().map(|p| HostType::new(*p)).collect();
        self.overloads
            .entry(key)
            .or_default()
            .push(Overload { params, func });
    }

    /// How many times [`HostBridge::resolve`] has run.
    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::Relaxed)
    }
}

impl HostBridge for HostRegistry {
    fn resolve(&self, key: &ExecutableKey) -> Resolution {
        self.resolutions.fetch_add(1, Ordering::Relaxed);
        let lookup = (
            key.kind(),
            key.declaring().clone(),
            key.member().map(str::to_string),
        );
        let Some(candidates) = self.overloads.get(&lookup) else {
            return Err(Thrown::raised(
                ExcType::AttributeError,
                match key.member() {
                    Some(member) => {
                        format!("type '{}' has no attribute '{}'", key.declaring(), member)
                    }
                    None => format!("type '{}' has no constructor", key.declaring()),
                },
            ));
        };
        let Some(overload) = candidates.iter().find(|o| o.accepts(key.fingerprint())) else {
            return Err(Thrown::raised(
                ExcType::TypeError,
                format!("no overload matches {}", key),
            ));
        };

        let func = Arc::clone(&overload.func);
        Ok(Arc::new(move |args: &[Value]| {
            func(args).map_err(Thrown::into_invocation_target)
        }))
    }
}

impl fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegistry")
            .field("targets", &self.overloads.len())
            .field("resolutions", &self.resolutions())
            .finish()
    }
}
