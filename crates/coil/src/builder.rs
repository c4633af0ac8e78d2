//! Builder for assembling [`CodeObject`]s.
//!
//! Loaders and tests use `CodeBuilder` to emit instructions, manage constant
//! and name pools, patch forward jumps, and record the line and
//! exceptional-jump tables without maintaining indices by hand.
//!
//! ```
//! use coil::{CodeBuilder, ExcType, Op, Value};
//!
//! let mut b = CodeBuilder::new("<module>");
//! b.set_line(1);
//! let msg = b.add_const(Value::from("boom"));
//! b.emit(Op::LoadConst(msg));
//! let raise_at = b.emit(Op::Raise(ExcType::ValueError));
//! let handler = b.current_offset();
//! b.protect(raise_at, raise_at, 0, handler);
//! b.emit(Op::PopException);
//! let code = b.build();
//!
//! assert_eq!(code.find_jump(1).map(|j| j.target), Some(2));
//! ```

use std::sync::Arc;

use crate::bytecode::{CodeObject, ExceptionalJump, LineEntry, Op};
use crate::error::{Error, Result};
use crate::value::Value;

#[derive(Debug)]
pub struct CodeBuilder {
    code: CodeObject,
    /// Line recorded for subsequently emitted instructions.
    current_line: Option<u32>,
}

impl CodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            code: CodeObject::new(name),
            current_line: None,
        }
    }

    /// Set the source line for the instructions emitted after this call.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = Some(line);
    }

    /// Emit an instruction and return its index.
    pub fn emit(&mut self, op: Op) -> u32 {
        let idx = self.current_offset();
        self.code.instructions.push(op);
        if let Some(line) = self.current_line {
            match self.code.lines.last_mut() {
                Some(entry) if entry.line == line && entry.end == idx => entry.end = idx + 1,
                _ => self.code.lines.push(LineEntry {
                    start: idx,
                    end: idx + 1,
                    line,
                }),
            }
        }
        idx
    }

    /// Emit a jump instruction with a placeholder target (0). Returns the
    /// index of the emitted instruction so it can be patched later.
    pub fn emit_jump(&mut self, make_op: fn(u32) -> Op) -> u32 {
        self.emit(make_op(0))
    }

    /// Patch a previously emitted jump instruction to point at `target`.
    pub fn patch_jump(&mut self, idx: u32, target: u32) -> Result<()> {
        match self.code.instructions.get_mut(idx as usize) {
            Some(Op::Jump(t) | Op::PopJumpIfFalse(t) | Op::PopJumpIfExhausted(t)) => {
                *t = target;
                Ok(())
            }
            Some(other) => Err(Error::BadOperand(format!(
                "cannot patch non-jump instruction {:?} at {}",
                other, idx
            ))),
            None => Err(Error::BadOperand(format!("no instruction at {}", idx))),
        }
    }

    /// Index the next emitted instruction will get.
    pub fn current_offset(&self) -> u32 {
        self.code.instructions.len() as u32
    }

    /// Add a constant to the constant pool and return its index.
    /// Deduplicates identical constants.
    pub fn add_const(&mut self, value: Value) -> u32 {
        if let Some(idx) = self.code.constants.iter().position(|c| *c == value) {
            return idx as u32;
        }
        let idx = self.code.constants.len() as u32;
        self.code.constants.push(value);
        idx
    }

    /// Add a name to the name pool and return its index.
    pub fn add_name(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.code.names.iter().position(|n| n == name) {
            return idx as u32;
        }
        let idx = self.code.names.len() as u32;
        self.code.names.push(name.to_string());
        idx
    }

    /// Register a nested function body and return its index.
    pub fn add_function(&mut self, code: CodeObject) -> u32 {
        let idx = self.code.functions.len() as u32;
        self.code.functions.push(Arc::new(code));
        idx
    }

    /// Route failures raised by instructions `start..=end` to `target`,
    /// truncating the data stack to `depth` first.
    pub fn protect(&mut self, start: u32, end: u32, depth: u32, target: u32) {
        self.code.exception_table.push(ExceptionalJump {
            start,
            end,
            depth,
            target,
        });
    }

    pub fn build(self) -> CodeObject {
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_coalesce_into_ranges() {
        let mut b = CodeBuilder::new("f");
        b.set_line(3);
        b.emit(Op::Nop);
        b.emit(Op::Nop);
        b.set_line(4);
        b.emit(Op::Nop);
        b.set_line(3);
        b.emit(Op::Nop);
        let code = b.build();

        assert_eq!(
            code.lines,
            vec![
                LineEntry {
                    start: 0,
                    end: 2,
                    line: 3
                },
                LineEntry {
                    start: 2,
                    end: 3,
                    line: 4
                },
                LineEntry {
                    start: 3,
                    end: 4,
                    line: 3
                },
            ]
        );
    }

    #[test]
    fn test_patch_jump() {
        let mut b = CodeBuilder::new("f");
        let jump = b.emit_jump(Op::Jump);
        let nop = b.emit(Op::Nop);
        b.patch_jump(jump, 7).unwrap();
        assert!(b.patch_jump(nop, 7).is_err());
        assert!(b.patch_jump(99, 7).is_err());
        assert_eq!(b.build().instructions[0], Op::Jump(7));
    }

    #[test]
    fn test_pools_deduplicate() {
        let mut b = CodeBuilder::new("f");
        assert_eq!(b.add_const(Value::Int(1)), 0);
        assert_eq!(b.add_const(Value::from("x")), 1);
        assert_eq!(b.add_const(Value::Int(1)), 0);
        assert_eq!(b.add_name("str"), 0);
        assert_eq!(b.add_name("upper"), 1);
        assert_eq!(b.add_name("str"), 0);
    }
}
