//! Activation contexts and the arena that owns them.
//!
//! A [`Context`] is one logical frame: a function call in progress or the
//! parked body of a generator or coroutine. Contexts refer to each other only
//! through [`ContextId`]s; the caller link is relational and never keeps its
//! target alive. The [`Contexts`] arena inside the VM is the sole owner.

use std::fmt;
use std::sync::Arc;

use crate::bytecode::{CodeObject, ExceptionalJump, Op};
use crate::error::{Error, Result};
use crate::exception::{Exception, TraceFrame};
use crate::suspend::SuspendKind;
use crate::value::Value;

/// Instruction pointer of a generator or coroutine that has not been started.
pub const UNSTARTED: i64 = -1;

/// Handle to a context in a [`Contexts`] arena.
///
/// The generation makes ids of released contexts stale instead of letting
/// them alias whatever reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// The mutable state of one executing or parked frame.
#[derive(Debug)]
pub struct Context {
    /// The compiled code being executed.
    code: Arc<CodeObject>,
    /// Index of the next instruction to execute; [`UNSTARTED`] for an armed
    /// generator or coroutine.
    ip: i64,
    /// Operand stack for this frame.
    stack: Vec<Value>,
    /// The exception being handled, if any. Set when a jump routes a failure
    /// here; cleared by `PopException`.
    pending: Option<Exception>,
    /// Who receives control (and exceptions) when this frame finishes.
    caller: Option<ContextId>,
    /// Label for tracebacks.
    name: String,
    /// Set for generator and coroutine bodies.
    suspend_kind: Option<SuspendKind>,
    /// Length of the caller chain above this frame.
    depth: usize,
}

impl Context {
    /// A frame for a plain call, ready to run from its first instruction.
    pub fn new(code: Arc<CodeObject>) -> Self {
        let name = code.name.clone();
        Self {
            code,
            ip: 0,
            stack: Vec::new(),
            pending: None,
            caller: None,
            name,
            suspend_kind: None,
            depth: 0,
        }
    }

    /// An armed but unstarted generator or coroutine body.
    pub fn unstarted(code: Arc<CodeObject>, kind: SuspendKind) -> Self {
        Self {
            ip: UNSTARTED,
            suspend_kind: Some(kind),
            ..Self::new(code)
        }
    }

    pub fn code(&self) -> &Arc<CodeObject> {
        &self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    // --- Instruction pointer ---

    pub fn ip(&self) -> i64 {
        self.ip
    }

    pub fn set_ip(&mut self, ip: i64) {
        self.ip = ip;
    }

    pub(crate) fn advance(&mut self) {
        self.ip += 1;
    }

    pub fn has_more(&self) -> bool {
        self.ip < self.code.len() as i64
    }

    pub fn is_unstarted(&self) -> bool {
        self.ip == UNSTARTED
    }

    pub fn is_terminated(&self) -> bool {
        !self.has_more()
    }

    /// Mark the frame finished: pointer past the end, empty stack, no pending exception.
    pub fn terminate(&mut self) {
        self.ip = self.code.len() as i64;
        self.stack.clear();
        self.pending = None;
    }

    pub fn current_op(&self) -> Option<&Op> {
        self.code.op_at(self.ip)
    }

    pub fn current_line(&self) -> Option<u32> {
        self.code.line_for(self.ip)
    }

    /// The exceptional jump guarding the current instruction.
    pub fn find_jump(&self) -> Option<&ExceptionalJump> {
        self.code.find_jump(self.ip)
    }

    // --- Data stack ---

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Error::StackUnderflow(self.name.clone()))
    }

    /// Pop the top `n` values, returned in push order.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>> {
        let start = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| Error::StackUnderflow(self.name.clone()))?;
        Ok(self.stack.split_off(start))
    }

    pub fn peek(&self) -> Result<&Value> {
        self.stack
            .last()
            .ok_or_else(|| Error::StackUnderflow(self.name.clone()))
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Drop cells until at most `depth` remain.
    pub fn truncate(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }

    pub(crate) fn insert_below_top(&mut self, n: usize, value: Value) -> Result<()> {
        let idx = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| Error::StackUnderflow(self.name.clone()))?;
        self.stack.insert(idx, value);
        Ok(())
    }

    // --- Linkage ---

    pub fn caller(&self) -> Option<ContextId> {
        self.caller
    }

    pub fn set_caller(&mut self, caller: Option<ContextId>) {
        self.caller = caller;
    }

    pub fn is_root(&self) -> bool {
        self.caller.is_none()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
    }

    pub fn suspend_kind(&self) -> Option<SuspendKind> {
        self.suspend_kind
    }

    // --- Exceptions ---

    pub fn pending_exception(&self) -> Option<&Exception> {
        self.pending.as_ref()
    }

    pub fn set_pending_exception(&mut self, exception: Option<Exception>) {
        self.pending = exception;
    }

    pub fn take_pending_exception(&mut self) -> Option<Exception> {
        self.pending.take()
    }

    /// Append this frame to `exception`'s traceback at the given line.
    pub fn record_frame(&self, line: Option<u32>, exception: &mut Exception) {
        exception.push_frame(TraceFrame {
            name: self.name.clone(),
            line,
        });
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    context: Option<Context>,
}

/// Generational arena owning every live context of one VM.
#[derive(Debug, Default)]
pub struct Contexts {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Contexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, context: Context) -> ContextId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.context = Some(context);
            return ContextId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            context: Some(context),
        });
        ContextId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: ContextId) -> Result<&Context> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.context.as_ref())
            .ok_or(Error::UnknownContext(id))
    }

    pub fn get_mut(&mut self, id: ContextId) -> Result<&mut Context> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.context.as_mut())
            .ok_or(Error::UnknownContext(id))
    }

    pub fn contains(&self, id: ContextId) -> bool {
        self.get(id).is_ok()
    }

    /// Release a context. Its id, and every copy of it, becomes stale.
    pub fn remove(&mut self, id: ContextId) -> Option<Context> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let context = slot.context.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(context)
    }

    /// Whether `target` is `from` or one of its (transitive) callers.
    pub fn chain_contains(&self, from: ContextId, target: ContextId) -> bool {
        let mut current = Some(from);
        // A chain never has more links than there are live contexts.
        for _ in 0..=self.live {
            let Some(id) = current else {
                return false;
            };
            if id == target {
                return true;
            }
            current = self.get(id).ok().and_then(Context::caller);
        }
        false
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
