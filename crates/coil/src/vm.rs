//! Stack-based bytecode virtual machine.
//!
//! The VM executes [`CodeObject`]s one instruction at a time. Every frame
//! (plain call, generator body, coroutine body) is a [`Context`] in the VM's
//! arena, and an instruction that transfers control returns the id of the
//! context that should run next. Calls, returns, yields and resumptions are
//! all expressed this way, so there is no separate trampoline and no Rust
//! recursion per script call.
//!
//! When an instruction raises, [`Vm::execute_next`] walks the caller chain
//! looking for an exceptional jump that covers the faulting instruction. A
//! `StopIteration` observed at `ForIter` or `Send` is not unwound at all: it
//! becomes the [`Value::StopIteration`] sentinel on the data stack of the
//! context that was advancing the iterator.
//!
//! The VM is the only module that mutates contexts. Everything else is either
//! data (`bytecode`, `value`) or a stateless helper (`operators`).

use std::sync::Arc;

use tracing::{debug, trace};

use crate::bytecode::{CodeObject, Op};
use crate::cache::{ExecutableKey, ExecutableKind, InvokerCache};
use crate::context::{Context, ContextId, Contexts};
use crate::engine::Limits;
use crate::error::{Error, Result};
use crate::exception::{ExcType, Exception};
use crate::host::{HostBridge, NoHost};
use crate::operators::apply_binop;
use crate::suspend::{Abandoned, SuspendKind, Suspendable};
use crate::value::Value;

/// The bytecode virtual machine.
///
/// Owns the context arena of one logical thread of script execution. The
/// invoker cache and host bridge are shared with other VMs created by the
/// same [`crate::Engine`].
pub struct Vm {
    contexts: Contexts,
    cache: Arc<InvokerCache>,
    host: Arc<dyn HostBridge>,
    limits: Limits,
    instruction_count: u64,
    abandoned: Abandoned,
}

impl Vm {
    pub fn new(host: Arc<dyn HostBridge>, cache: Arc<InvokerCache>, limits: Limits) -> Self {
        Self {
            contexts: Contexts::new(),
            cache,
            host,
            limits,
            instruction_count: 0,
            abandoned: Abandoned::default(),
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    /// Create a root context for `code`: pointer 0, empty stack, no caller.
    pub fn load(&mut self, code: Arc<CodeObject>) -> ContextId {
        let id = self.contexts.insert(Context::new(code));
        debug!(context = %id, "loaded root context");
        id
    }

    pub fn context(&self, id: ContextId) -> Result<&Context> {
        self.contexts.get(id)
    }

    pub fn context_mut(&mut self, id: ContextId) -> Result<&mut Context> {
        self.contexts.get_mut(id)
    }

    /// Number of contexts currently alive in the arena.
    pub fn live_contexts(&self) -> usize {
        self.contexts.len()
    }

    /// Instructions dispatched since the last [`Vm::run`] started.
    pub fn instructions_executed(&self) -> u64 {
        self.instruction_count
    }

    // -----------------------------------------------------------------------
    // Driver contract
    // -----------------------------------------------------------------------

    /// Whether the context still has an instruction to execute.
    ///
    /// Released contexts have none.
    pub fn has_more(&self, id: ContextId) -> bool {
        self.contexts.get(id).is_ok_and(Context::has_more)
    }

    /// Execute exactly one instruction of `id` and return the context to
    /// drive next.
    ///
    /// A script exception raised by the instruction is routed here: to an
    /// exceptional jump somewhere up the caller chain, or to the stop-iteration
    /// sentinel at an iteration boundary. If nothing handles it, the outermost
    /// context is terminated and the exception is returned. Errors other than
    /// [`Error::Exception`] are returned without touching any context.
    pub fn execute_next(&mut self, id: ContextId) -> Result<ContextId> {
        self.instruction_count += 1;
        if let Some(limit) = self.limits.instruction_limit
            && self.instruction_count > limit
        {
            return Err(Error::InstructionLimitExceeded(limit));
        }
        self.release_abandoned();

        let ctx = self.contexts.get(id)?;
        let Some(&op) = ctx.current_op() else {
            return Err(Error::BadOperand(format!(
                "no instruction at {} in '{}'",
                ctx.ip(),
                ctx.name()
            )));
        };
        trace!(context = %id, ip = ctx.ip(), ?op, "dispatch");

        let result = self.dispatch(id, op);
        self.route(id, result)
    }

    /// Drive `root` until it has no more instructions and return its result.
    ///
    /// The result is the value the root frame returned, or `None` if it ran off
    /// the end of its code without returning. A callee that runs off its end
    /// returns `None` to its caller.
    pub fn run(&mut self, root: ContextId) -> Result<Value> {
        if !self.contexts.get(root)?.is_root() {
            return Err(Error::BadOperand(format!(
                "context {} has a caller and cannot be run as a root",
                root
            )));
        }
        self.instruction_count = 0;

        let mut current = root;
        loop {
            if self.has_more(current) {
                current = self.execute_next(current)?;
            } else if current == root {
                break;
            } else {
                let result = self.finish(current, Value::None);
                current = self.route(current, result)?;
            }
        }
        self.release_abandoned();

        let root = self.contexts.get(root)?;
        Ok(root.stack().last().cloned().unwrap_or(Value::None))
    }

    /// Resume a generator or coroutine on behalf of `calling`.
    ///
    /// Returns the body context, which the caller should drive next. The
    /// body's next yield advances `calling` past its current instruction, so
    /// `calling` must be parked on `ForIter` or `Send`, or have finished.
    /// Anything else is rejected with [`Error::BadOperand`].
    pub fn start_send(
        &mut self,
        handle: &Suspendable,
        value: Value,
        calling: ContextId,
    ) -> Result<ContextId> {
        let ctx = self.contexts.get(calling)?;
        if !ctx.is_terminated() && !ctx.current_op().is_some_and(Op::is_iteration_boundary) {
            return Err(Error::BadOperand(format!(
                "context {} is not at a resumption point (ip {})",
                calling,
                ctx.ip()
            )));
        }
        let depth = ctx.depth() + 1;
        let origin = ctx.name().to_string();
        let line = ctx.current_line();
        self.check_depth(depth)?;
        handle.start_send(&mut self.contexts, value, calling, &origin, line)
    }

    /// [`Vm::start_send`] with `None`.
    pub fn start_next(&mut self, handle: &Suspendable, calling: ContextId) -> Result<ContextId> {
        self.start_send(handle, Value::None, calling)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn route(&mut self, id: ContextId, result: Result<ContextId>) -> Result<ContextId> {
        match result {
            Err(Error::Exception(exc)) => self.unwind(id, exc),
            other => other,
        }
    }

    /// Execute one instruction. Exceptions are attributed to `id`.
    fn dispatch(&mut self, id: ContextId, op: Op) -> Result<ContextId> {
        match op {
            Op::LoadConst(idx) => {
                let ctx = self.contexts.get_mut(id)?;
                let value = ctx
                    .code()
                    .constants
                    .get(idx as usize)
                    .cloned()
                    .ok_or_else(|| bad_index("constant", idx, ctx))?;
                ctx.push(value);
                ctx.advance();
            }

            Op::Pop => {
                let ctx = self.contexts.get_mut(id)?;
                ctx.pop()?;
                ctx.advance();
            }

            Op::Dup => {
                let ctx = self.contexts.get_mut(id)?;
                let top = ctx.peek()?.clone();
                ctx.push(top);
                ctx.advance();
            }

            Op::RotN(n) => {
                let ctx = self.contexts.get_mut(id)?;
                if n > 1 {
                    let top = ctx.pop()?;
                    ctx.insert_below_top(usize::from(n) - 1, top)?;
                }
                ctx.advance();
            }

            Op::BinaryOp(op) => {
                let ctx = self.contexts.get_mut(id)?;
                let rhs = ctx.pop()?;
                let lhs = ctx.pop()?;
                ctx.push(apply_binop(op, &lhs, &rhs)?);
                ctx.advance();
            }

            Op::Jump(target) => {
                self.contexts.get_mut(id)?.set_ip(i64::from(target));
            }

            Op::PopJumpIfFalse(target) => {
                let ctx = self.contexts.get_mut(id)?;
                if ctx.pop()?.is_truthy() {
                    ctx.advance();
                } else {
                    ctx.set_ip(i64::from(target));
                }
            }

            Op::PopJumpIfExhausted(target) => {
                let ctx = self.contexts.get_mut(id)?;
                if ctx.peek()?.is_stop_iteration() {
                    ctx.pop()?;
                    ctx.set_ip(i64::from(target));
                } else {
                    ctx.advance();
                }
            }

            Op::Call { function, argc } => return self.call(id, function, argc),

            Op::ReturnValue => {
                let value = self.contexts.get_mut(id)?.pop()?;
                return self.finish(id, value);
            }

            Op::MakeSuspendable {
                function,
                argc,
                kind,
            } => return self.make_suspendable(id, function, argc, kind),

            Op::ForIter => return self.advance_suspendable(id, None),

            Op::Send => {
                let value = self.contexts.get_mut(id)?.pop()?;
                return self.advance_suspendable(id, Some(value));
            }

            Op::YieldValue => return self.yield_value(id),

            Op::Raise(kind) => {
                let message = match self.contexts.get_mut(id)?.pop()? {
                    Value::None => String::new(),
                    value => value.to_print_string(),
                };
                return Err(Exception::raised(kind, message).into());
            }

            Op::Reraise => {
                let exc = self
                    .contexts
                    .get_mut(id)?
                    .take_pending_exception()
                    .unwrap_or_else(|| {
                        Exception::raised(ExcType::RuntimeError, "No active exception to reraise")
                    });
                return Err(exc.into());
            }

            Op::CheckExcMatch(handler) => {
                let ctx = self.contexts.get_mut(id)?;
                let matched = ctx
                    .pending_exception()
                    .is_some_and(|exc| exc.kind().matches(handler));
                ctx.push(Value::Bool(matched));
                ctx.advance();
            }

            Op::PopException => {
                let ctx = self.contexts.get_mut(id)?;
                ctx.set_pending_exception(None);
                ctx.advance();
            }

            Op::CallHost {
                kind,
                declaring,
                member,
                argc,
            } => return self.call_host(id, kind, declaring, member, argc),

            Op::Nop => self.contexts.get_mut(id)?.advance(),
        }
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Calls and returns
    // -----------------------------------------------------------------------

    /// Push a callee frame for `functions[function]` and hand control to it.
    ///
    /// The caller's pointer stays on the call so that a failure in the callee
    /// is reported, and handled, at the call site.
    fn call(&mut self, id: ContextId, function: u32, argc: u32) -> Result<ContextId> {
        let depth = self.contexts.get(id)?.depth() + 1;
        self.check_depth(depth)?;

        let caller = self.contexts.get_mut(id)?;
        let code = function_at(caller, function)?;
        let args = caller.pop_n(argc as usize)?;

        let mut callee = Context::new(code);
        callee.set_caller(Some(id));
        callee.set_depth(depth);
        for arg in args {
            callee.push(arg);
        }
        let callee = self.contexts.insert(callee);
        trace!(caller = %id, callee = %callee, depth, "call");
        Ok(callee)
    }

    /// Finish `id` with `value` as its result.
    ///
    /// A plain frame is released and the value goes to its caller, which
    /// resumes after its call instruction. A root frame keeps the value as its
    /// only stack cell. A generator or coroutine body is terminated and
    /// `StopIteration` is raised to whoever resumed it.
    fn finish(&mut self, id: ContextId, value: Value) -> Result<ContextId> {
        let ctx = self.contexts.get_mut(id)?;
        if let Some(kind) = ctx.suspend_kind() {
            debug!(context = %id, %kind, "suspended body finished");
            ctx.terminate();
            return Err(Exception::stop_iteration().into());
        }

        let Some(caller) = ctx.caller() else {
            ctx.terminate();
            ctx.push(value);
            return Ok(id);
        };
        self.contexts.remove(id);
        let caller_ctx = self.contexts.get_mut(caller)?;
        caller_ctx.push(value);
        caller_ctx.advance();
        Ok(caller)
    }

    // -----------------------------------------------------------------------
    // Generators and coroutines
    // -----------------------------------------------------------------------

    fn make_suspendable(
        &mut self,
        id: ContextId,
        function: u32,
        argc: u32,
        kind: SuspendKind,
    ) -> Result<ContextId> {
        let ctx = self.contexts.get_mut(id)?;
        let code = function_at(ctx, function)?;
        let args = ctx.pop_n(argc as usize)?;

        let mut body = Context::unstarted(code, kind);
        for arg in args {
            body.push(arg);
        }
        let body = self.contexts.insert(body);

        let ctx = self.contexts.get_mut(id)?;
        ctx.push(Value::Suspended(Suspendable::new(body, kind, &self.abandoned)));
        ctx.advance();
        Ok(id)
    }

    /// `ForIter` (`value` is `None`) or `Send`: resume the handle on top of
    /// the stack. The handle stays there; the body's next yield lands above it.
    fn advance_suspendable(&mut self, id: ContextId, value: Option<Value>) -> Result<ContextId> {
        let top = self.contexts.get(id)?.peek()?;
        let Some(handle) = top.as_suspendable() else {
            let message = match value {
                None => format!("'{}' object is not an iterator", top.type_name()),
                Some(_) => format!("'{}' object has no attribute 'send'", top.type_name()),
            };
            return Err(Exception::raised(ExcType::TypeError, message).into());
        };
        match value {
            None => self.start_next(&handle, id),
            Some(value) => self.start_send(&handle, value, id),
        }
    }

    /// Park the running body and hand TOS to its resumer.
    fn yield_value(&mut self, id: ContextId) -> Result<ContextId> {
        let body = self.contexts.get_mut(id)?;
        if body.suspend_kind().is_none() {
            return Err(Error::BadOperand(format!(
                "yield outside a generator or coroutine in '{}'",
                body.name()
            )));
        }
        let Some(resumer) = body.caller() else {
            return Err(Error::BadOperand(format!(
                "yield in '{}' with no resumer",
                body.name()
            )));
        };
        let value = body.pop()?;
        body.advance();
        body.set_caller(None);
        trace!(body = %id, resumer = %resumer, "yield");

        let resumer_ctx = self.contexts.get_mut(resumer)?;
        resumer_ctx.push(value);
        resumer_ctx.advance();
        Ok(resumer)
    }

    // -----------------------------------------------------------------------
    // Host calls
    // -----------------------------------------------------------------------

    fn call_host(
        &mut self,
        id: ContextId,
        kind: ExecutableKind,
        declaring: u32,
        member: Option<u32>,
        argc: u32,
    ) -> Result<ContextId> {
        let ctx = self.contexts.get_mut(id)?;
        let code = Arc::clone(ctx.code());
        let declaring = name_at(&code, declaring, ctx)?;
        let member = member.map(|idx| name_at(&code, idx, ctx)).transpose()?;
        let args = ctx.pop_n(argc as usize)?;

        let key = match (kind, member) {
            (ExecutableKind::Constructor, _) => ExecutableKey::constructor(declaring, &args),
            (kind, Some(member)) => ExecutableKey::method(
                declaring,
                member,
                kind == ExecutableKind::StaticMethod,
                &args,
            ),
            (_, None) => {
                return Err(Error::BadOperand(format!(
                    "method call on '{}' without a member name",
                    declaring
                )));
            }
        };
        trace!(context = %id, signature = %key, "host call");

        let host = Arc::clone(&self.host);
        let lookup = key.clone();
        let invoker = self
            .cache
            .get_or_resolve(key, move || host.resolve(&lookup))
            .map_err(Exception::new)?;
        let result = invoker(&args).map_err(Exception::new)?;

        let ctx = self.contexts.get_mut(id)?;
        ctx.push(result);
        ctx.advance();
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Exception routing
    // -----------------------------------------------------------------------

    /// Route `exc`, raised by the current instruction of `faulting`.
    ///
    /// Walks up from `faulting` while no exceptional jump covers the current
    /// instruction and a caller exists. Every frame walked through is added to
    /// the traceback, then terminated and released. The frame whose jump
    /// handles the exception is not added.
    fn unwind(&mut self, faulting: ContextId, mut exc: Exception) -> Result<ContextId> {
        let mut current = faulting;
        {
            let ctx = self.contexts.get(current)?;
            ctx.record_frame(ctx.current_line(), &mut exc);
        }

        loop {
            let ctx = self.contexts.get(current)?;
            if ctx.find_jump().is_some() {
                break;
            }
            let Some(caller) = ctx.caller() else {
                break;
            };
            if self.intercept_stop_iteration(current, &exc)? {
                return Ok(current);
            }

            self.contexts.remove(current);
            current = caller;
            let ctx = self.contexts.get(current)?;
            if ctx.find_jump().is_none() {
                ctx.record_frame(ctx.current_line(), &mut exc);
            }
        }

        if self.intercept_stop_iteration(current, &exc)? {
            return Ok(current);
        }

        let ctx = self.contexts.get_mut(current)?;
        let jump = ctx.find_jump().copied();
        let Some(jump) = jump else {
            debug!(
                context = %current,
                exception = %exc,
                frames = exc.traceback().len(),
                "unhandled exception"
            );
            ctx.terminate();
            return Err(Error::Exception(exc));
        };

        debug!(
            context = %current,
            exception = %exc,
            target = jump.target,
            depth = jump.depth,
            "exception routed to handler"
        );
        ctx.truncate(jump.depth as usize);
        ctx.set_ip(i64::from(jump.target));
        ctx.set_pending_exception(Some(exc));
        Ok(current)
    }

    /// Turn a `StopIteration` observed at `ForIter` or `Send` into the
    /// stop-iteration sentinel. Returns whether it did.
    fn intercept_stop_iteration(&mut self, id: ContextId, exc: &Exception) -> Result<bool> {
        if !exc.is_stop_iteration() {
            return Ok(false);
        }
        let ctx = self.contexts.get_mut(id)?;
        if !ctx.current_op().is_some_and(Op::is_iteration_boundary) {
            return Ok(false);
        }
        debug!(context = %id, ip = ctx.ip(), "iteration exhausted");
        ctx.push(Value::StopIteration);
        ctx.advance();
        Ok(true)
    }

    /// Release bodies whose last handle has been dropped.
    ///
    /// A body that is running when its last handle goes away stays queued
    /// until it parks or finishes.
    fn release_abandoned(&mut self) {
        let pending = self.abandoned.take();
        if pending.is_empty() {
            return;
        }
        let mut running = Vec::new();
        for id in pending {
            match self.contexts.get(id) {
                Ok(body) if body.caller().is_some() => running.push(id),
                Ok(_) => {
                    trace!(body = %id, "released abandoned body");
                    self.contexts.remove(id);
                }
                Err(_) => {}
            }
        }
        if !running.is_empty() {
            self.abandoned.extend(running);
        }
    }

    fn check_depth(&self, depth: usize) -> Result<()> {
        if let Some(limit) = self.limits.recursion_limit
            && depth >= limit
        {
            return Err(Error::RecursionLimitExceeded(limit));
        }
        Ok(())
    }
}

impl Default for Vm {
    /// A VM with no host bridge, its own cache and no limits.
    fn default() -> Self {
        Self::new(
            Arc::new(NoHost),
            Arc::new(InvokerCache::new()),
            Limits::default(),
        )
    }
}

fn bad_index(pool: &str, idx: u32, ctx: &Context) -> Error {
    Error::BadOperand(format!(
        "{} index {} out of range in '{}'",
        pool,
        idx,
        ctx.name()
    ))
}

fn function_at(ctx: &Context, idx: u32) -> Result<Arc<CodeObject>> {
    ctx.code()
        .functions
        .get(idx as usize)
        .cloned()
        .ok_or_else(|| bad_index("function", idx, ctx))
}

fn name_at<'a>(code: &'a CodeObject, idx: u32, ctx: &Context) -> Result<&'a str> {
    code.names
        .get(idx as usize)
        .map(String::as_str)
        .ok_or_else(|| bad_index("name", idx, ctx))
}
