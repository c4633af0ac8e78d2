//! Coil - the execution core of a bytecode interpreter for a Python-like language
//!
//! Coil runs pre-compiled code units on a stack-based virtual machine. It
//! routes exceptions across nested frames through per-instruction
//! exceptional-jump tables, parks and resumes generator and coroutine bodies,
//! and caches resolved host-call targets by call signature.
//!
//! # Features
//!
//! - **One instruction at a time**: drivers call [`Vm::has_more`] and
//!   [`Vm::execute_next`], or let [`Vm::run`] do it
//! - **Arena-owned frames**: every frame is a [`Context`] addressed by a
//!   [`ContextId`]; caller links never own anything
//! - **Exceptional jumps**: handled exceptions truncate the data stack to the
//!   recorded depth and jump; unhandled ones terminate the root and surface
//!   with a traceback
//! - **Iteration protocol**: `StopIteration` at `ForIter`/`Send` becomes a
//!   sentinel value instead of an error
//! - **Host calls**: resolved once per call shape through a shared
//!   [`InvokerCache`]
//! - **Resource limits**: instruction count and caller-chain depth
//!
//! # Quick Start
//!
//! ```
//! use coil::{CodeBuilder, Engine, ExcType, Op, Value};
//!
//! // Raise inside a function and catch it at the call site.
//! let mut f = CodeBuilder::new("f");
//! f.set_line(2);
//! let msg = f.add_const(Value::from("bad input"));
//! f.emit(Op::LoadConst(msg));
//! f.emit(Op::Raise(ExcType::ValueError));
//!
//! let mut b = CodeBuilder::new("<module>");
//! b.set_line(1);
//! let func = b.add_function(f.build());
//! let call = b.emit(Op::Call { function: func, argc: 0 });
//! let handler = b.current_offset();
//! b.protect(call, call, 0, handler);
//! b.emit(Op::CheckExcMatch(ExcType::ValueError));
//! b.emit(Op::ReturnValue);
//!
//! let output = Engine::new().run(b.build()).unwrap();
//! assert_eq!(output.result, Value::Bool(true));
//! ```
//!
//! # Instruction Set
//!
//! ## Stack
//! - `LoadConst`, `Pop`, `Dup`, `RotN`, `Nop`
//!
//! ## Operators
//! - `BinaryOp` with `+`, `-`, `*`, `//`, `%` on ints and floats
//!
//! ## Control Flow
//! - `Jump`, `PopJumpIfFalse`, `PopJumpIfExhausted`
//!
//! ## Functions
//! - `Call`, `ReturnValue` (running off the end returns `None`)
//!
//! ## Generators and Coroutines
//! - `MakeSuspendable`, `ForIter`, `Send`, `YieldValue`
//!
//! ## Error Handling
//! - `Raise`, `Reraise`, `CheckExcMatch`, `PopException`
//!
//! ## Host Calls
//! - `CallHost` for instance methods, static methods and constructors
//!
//! # Not Supported
//!
//! - Source compilation (code units come from an external loader)
//! - Bytecode verification
//! - Parallel execution of script code

mod builder;
mod bytecode;
mod cache;
mod context;
mod engine;
mod error;
mod exception;
mod host;
mod memo;
mod operators;
mod suspend;
mod value;
mod vm;

pub use builder::CodeBuilder;
pub use bytecode::{BinOp, CodeObject, ExceptionalJump, LineEntry, Op};
pub use cache::{ExecutableKey, ExecutableKind, InvokerCache};
pub use context::{Context, ContextId, Contexts, UNSTARTED};
pub use engine::{Engine, ExecuteOutput, Limits};
pub use error::{Error, Result};
pub use exception::{ExcType, Exception, Thrown, TraceFrame, unwrap_invocation};
pub use host::{ANY, HostBridge, HostFn, HostRegistry, Invoker, NoHost, Resolution};
pub use memo::{Memoized, Producer};
pub use operators::apply_binop;
pub use suspend::{SuspendKind, Suspendable};
pub use value::{HostType, Value};
pub use vm::Vm;
