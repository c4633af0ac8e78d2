//! Bytecode instruction set and compiled code representation.
//!
//! This module defines the closed set of instructions the VM executes and the
//! [`CodeObject`] that carries them, together with the line table used for
//! tracebacks and the exceptional-jump table used to route exceptions to
//! in-language handlers.

use std::sync::Arc;

use crate::cache::ExecutableKind;
use crate::exception::ExcType;
use crate::suspend::SuspendKind;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Operator enums
// ---------------------------------------------------------------------------

/// Binary arithmetic operators. The VM delegates to [`crate::operators::apply_binop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mult,
    FloorDiv,
    Mod,
}

// ---------------------------------------------------------------------------
// Bytecode instructions
// ---------------------------------------------------------------------------

/// A single bytecode instruction.
///
/// Every instruction is responsible for its own instruction pointer. Most
/// advance it by one; jumps overwrite it. Instructions that hand control to a
/// different context (calls, resumptions) leave their own pointer on
/// themselves: whichever context later hands control back advances it. This is
/// what lets a failure inside a callee be attributed to the call site.
///
/// Index arguments (`u32`) refer to entries in the pools of the [`CodeObject`]
/// that contains the instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    // --- Stack manipulation ---
    /// Push `constants[i]` onto the stack.
    LoadConst(u32),

    /// Discard the top-of-stack value.
    Pop,

    /// Duplicate the top-of-stack value.
    Dup,

    /// Rotate the top N stack items so that TOS moves to position N.
    ///
    /// `RotN(3)` with stack `[a, b, c]` (c = TOS) produces `[c, a, b]`.
    RotN(u8),

    // --- Operators ---
    /// Pop two values (right then left), apply the operator, push the result.
    BinaryOp(BinOp),

    // --- Control flow ---
    /// Unconditional jump to instruction index.
    Jump(u32),

    /// Pop TOS. If falsy, jump to target.
    PopJumpIfFalse(u32),

    /// If TOS is the stop-iteration sentinel, pop it and jump to target.
    /// Otherwise leave the stack alone and fall through.
    PopJumpIfExhausted(u32),

    // --- Calls ---
    /// Call `functions[function]` with `argc` arguments popped from the stack.
    ///
    /// The callee starts with the arguments on its data stack, first argument
    /// deepest. Control moves to the callee.
    Call { function: u32, argc: u32 },

    /// Pop TOS as the return value and finish the current frame.
    ///
    /// In a plain frame the value is pushed onto the caller and the caller
    /// resumes after its call instruction; a root frame keeps the value as
    /// its only stack cell. In a generator or coroutine body the body is
    /// terminated and `StopIteration` is raised to whoever resumed it.
    ReturnValue,

    // --- Generators and coroutines ---
    /// Build an unstarted generator or coroutine over `functions[function]`,
    /// binding `argc` arguments from the stack, and push its handle.
    MakeSuspendable {
        function: u32,
        argc: u32,
        kind: SuspendKind,
    },

    /// Iterator-advance: resume the generator whose handle is TOS.
    ///
    /// The handle stays on the stack. The next yielded value is pushed on
    /// top of it; on exhaustion the stop-iteration sentinel is pushed instead.
    ForIter,

    /// Generator-send: pop a value and send it into the generator or
    /// coroutine whose handle is then TOS. The handle stays on the stack.
    Send,

    /// Suspend the current generator or coroutine body, handing TOS to
    /// whoever resumed it. The value sent on resumption will be TOS when the
    /// instruction after this one runs.
    YieldValue,

    // --- Exception handling ---
    /// Pop TOS as the message and raise an exception of the given kind.
    Raise(ExcType),

    /// Re-raise the pending exception of the current context.
    Reraise,

    /// Push `Bool(true)` if the pending exception is caught by a handler for the kind.
    CheckExcMatch(ExcType),

    /// Clear the pending exception. Emitted at the end of each handler body.
    PopException,

    // --- Host calls ---
    /// Call into the host runtime through the invoker cache.
    ///
    /// `names[declaring]` is the declaring type and `names[member]` the
    /// method name (absent for constructors). `argc` arguments are popped;
    /// for instance methods the receiver is the first of them.
    CallHost {
        kind: ExecutableKind,
        declaring: u32,
        member: Option<u32>,
        argc: u32,
    },

    // --- Misc ---
    /// No operation.
    Nop,
}

impl Op {
    /// Instructions at which an observed `StopIteration` becomes the
    /// stop-iteration sentinel instead of unwinding.
    pub fn is_iteration_boundary(&self) -> bool {
        matches!(self, Op::ForIter | Op::Send)
    }
}

// ---------------------------------------------------------------------------
// Compiled code representation
// ---------------------------------------------------------------------------

/// An exceptional-jump record: routes failures raised inside
/// `[start, end]` (inclusive) to `target`, after truncating the data stack
/// to `depth` cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionalJump {
    pub start: u32,
    pub end: u32,
    /// Data-stack depth to restore before the handler runs.
    pub depth: u32,
    /// Instruction index of the handler.
    pub target: u32,
}

impl ExceptionalJump {
    /// A record guarding a single instruction.
    pub fn at(instruction: u32, depth: u32, target: u32) -> Self {
        Self {
            start: instruction,
            end: instruction,
            depth,
            target,
        }
    }

    /// Whether the record applies to the instruction at `ip`.
    ///
    /// A record with `start > end` guards nothing.
    pub fn covers(&self, ip: i64) -> bool {
        ip >= i64::from(self.start) && ip <= i64::from(self.end)
    }
}

/// Maps the half-open instruction range `[start, end)` to a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub start: u32,
    pub end: u32,
    pub line: u32,
}

/// A compiled unit of code: a top-level script or a function body.
///
/// Nested function bodies are referenced by `Call(i)`/`MakeSuspendable(i)`
/// through `functions`.
#[derive(Debug, Clone, Default)]
pub struct CodeObject {
    /// Name used in tracebacks (`<module>` for a top-level script).
    pub name: String,

    /// The bytecode instructions to execute.
    pub instructions: Vec<Op>,

    /// Constant pool: literal values referenced by `LoadConst(index)`.
    pub constants: Vec<Value>,

    /// Name pool: host type and member names referenced by `CallHost`.
    pub names: Vec<String>,

    /// Compiled function bodies.
    pub functions: Vec<Arc<CodeObject>>,

    /// Source line table, sorted by `start`.
    pub lines: Vec<LineEntry>,

    /// Exceptional jumps, in the order they were added.
    ///
    /// When several records cover an instruction, the last one wins, so inner
    /// handlers must be added after the ones enclosing them.
    pub exception_table: Vec<ExceptionalJump>,
}

impl CodeObject {
    /// Create a new empty code object with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// The instruction at `ip`, if `ip` is in range.
    pub fn op_at(&self, ip: i64) -> Option<&Op> {
        usize::try_from(ip).ok().and_then(|i| self.instructions.get(i))
    }

    /// Source line of the instruction at `ip`.
    pub fn line_for(&self, ip: i64) -> Option<u32> {
        let ip = u32::try_from(ip).ok()?;
        let idx = self.lines.partition_point(|entry| entry.start <= ip);
        let entry = self.lines.get(idx.checked_sub(1)?)?;
        (ip < entry.end).then_some(entry.line)
    }

    /// The exceptional jump guarding the instruction at `ip`, if any.
    pub fn find_jump(&self, ip: i64) -> Option<&ExceptionalJump> {
        // Innermost records are added last
        self.exception_table.iter().rev().find(|jump| jump.covers(ip))
    }
}
