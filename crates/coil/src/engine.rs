use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::bytecode::CodeObject;
use crate::cache::InvokerCache;
use crate::error::Result;
use crate::host::{HostBridge, NoHost};
use crate::value::Value;
use crate::vm::Vm;

/// Resource limits for script execution.
///
/// Both limits default to `None` (unlimited). Exceeding either one is an
/// uncatchable error: exception handlers in script code never see it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Limits {
    /// Maximum number of instructions dispatched by one run.
    pub instruction_limit: Option<u64>,
    /// Maximum depth of the caller chain, counting the root frame.
    pub recursion_limit: Option<usize>,
}

/// An execution engine: the host bridge, limits and invoker cache shared by
/// every [`Vm`] it creates.
///
/// Cloning an engine is cheap and the clones share the cache, so independent
/// runs on different threads reuse each other's resolved host targets. Two
/// engines built separately share nothing.
///
/// # Example
///
/// ```
/// use coil::{CodeBuilder, Engine, Op, Value};
/// use coil::BinOp;
///
/// let mut b = CodeBuilder::new("<module>");
/// let six = b.add_const(Value::Int(6));
/// let seven = b.add_const(Value::Int(7));
/// b.emit(Op::LoadConst(six));
/// b.emit(Op::LoadConst(seven));
/// b.emit(Op::BinaryOp(BinOp::Mult));
/// b.emit(Op::ReturnValue);
///
/// let output = Engine::new().run(b.build()).unwrap();
/// assert_eq!(output.result, Value::Int(42));
/// assert_eq!(output.instructions, 4);
/// ```
#[derive(Clone)]
pub struct Engine {
    host: Arc<dyn HostBridge>,
    cache: Arc<InvokerCache>,
    limits: Limits,
}

impl Engine {
    /// An engine without a host bridge. Host calls raise `AttributeError`.
    pub fn new() -> Self {
        Self::with_host(NoHost)
    }

    pub fn with_host(host: impl HostBridge + 'static) -> Self {
        Self::with_shared_host(Arc::new(host))
    }

    pub fn with_shared_host(host: Arc<dyn HostBridge>) -> Self {
        Self {
            host,
            cache: Arc::new(InvokerCache::new()),
            limits: Limits::default(),
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Set the limits applied to VMs created from now on.
    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// A fresh VM with its own context arena, sharing this engine's cache.
    pub fn vm(&self) -> Vm {
        Vm::new(
            Arc::clone(&self.host),
            Arc::clone(&self.cache),
            self.limits,
        )
    }

    /// Load `code` as a root context in a fresh VM and run it to completion.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Exception`] if a script exception escapes the
    /// root frame, and the other error variants for limit violations and
    /// malformed code.
    pub fn run(&self, code: CodeObject) -> Result<ExecuteOutput> {
        let mut vm = self.vm();
        let root = vm.load(Arc::new(code));
        let result = vm.run(root)?;
        let instructions = vm.instructions_executed();
        debug!(instructions, cached = self.cache_len(), "run finished");
        Ok(ExecuteOutput {
            result,
            instructions,
        })
    }

    pub fn cache(&self) -> &Arc<InvokerCache> {
        &self.cache
    }

    /// Number of call shapes resolved so far.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("cache", &self.cache)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// Result of [`Engine::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteOutput {
    /// The value returned by the root frame.
    pub result: Value,
    /// Number of instructions dispatched.
    pub instructions: u64,
}
