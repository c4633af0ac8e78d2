use coil::{
    BinOp, CodeBuilder, CodeObject, Engine, Error, ExcType, Op, SuspendKind, Value, Vm,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

/// A generator body yielding each of `values`, then returning.
fn yielding(values: &[i64]) -> CodeObject {
    let mut g = CodeBuilder::new("gen");
    for v in values {
        let c = g.add_const(Value::Int(*v));
        g.emit(Op::LoadConst(c));
        g.emit(Op::YieldValue);
        g.emit(Op::Pop);
    }
    let none = g.add_const(Value::None);
    g.emit(Op::LoadConst(none));
    g.emit(Op::ReturnValue);
    g.build()
}

/// `total = 0; for v in gen: total += v; return total`
fn summing(generator: CodeObject) -> CodeObject {
    let mut b = CodeBuilder::new("<module>");
    let zero = b.add_const(Value::Int(0));
    let gen_fn = b.add_function(generator);
    b.emit(Op::LoadConst(zero));
    b.emit(Op::MakeSuspendable {
        function: gen_fn,
        argc: 0,
        kind: SuspendKind::Generator,
    });
    // [total, gen]
    let top = b.emit(Op::ForIter);
    // [total, gen, v]
    let exit = b.emit_jump(Op::PopJumpIfExhausted);
    b.emit(Op::RotN(3)); // [v, total, gen]
    b.emit(Op::RotN(3)); // [gen, v, total]
    b.emit(Op::BinaryOp(BinOp::Add)); // [gen, total]
    b.emit(Op::RotN(2)); // [total, gen]
    b.emit(Op::Jump(top));
    let done = b.emit(Op::Pop);
    b.emit(Op::ReturnValue);
    b.patch_jump(exit, done).unwrap();
    b.build()
}

#[test]
fn test_for_loop_over_generator() {
    let mut vm = Vm::default();
    let root = vm.load(Arc::new(summing(yielding(&[1, 2, 3]))));
    assert_eq!(vm.run(root).unwrap(), Value::Int(6));
    // The exhausted body was released.
    assert_eq!(vm.live_contexts(), 1);
}

#[test]
fn test_empty_generator() {
    let output = Engine::new().run(summing(yielding(&[]))).unwrap();
    assert_eq!(output.result, Value::Int(0));
}

#[test]
fn test_exhaustion_becomes_sentinel_at_for_iter() {
    let mut b = CodeBuilder::new("<module>");
    let gen_fn = b.add_function(yielding(&[]));
    b.emit(Op::MakeSuspendable {
        function: gen_fn,
        argc: 0,
        kind: SuspendKind::Generator,
    });
    let for_iter = b.emit(Op::ForIter);
    b.emit(Op::Nop);

    let mut vm = Vm::default();
    let root = vm.load(Arc::new(b.build()));
    vm.execute_next(root).unwrap();
    let body = vm.execute_next(root).unwrap();
    assert_ne!(body, root);
    vm.execute_next(body).unwrap();

    // The body's return surfaces at the ForIter as the sentinel.
    assert_eq!(vm.execute_next(body).unwrap(), root);
    let ctx = vm.context(root).unwrap();
    assert!(vm.has_more(root));
    assert_eq!(ctx.ip(), i64::from(for_iter) + 1);
    assert_eq!(ctx.peek().unwrap(), &Value::StopIteration);
    assert!(ctx.pending_exception().is_none());
}

#[test]
fn test_advancing_exhausted_generator_again() {
    let mut b = CodeBuilder::new("<module>");
    let gen_fn = b.add_function(yielding(&[]));
    b.emit(Op::MakeSuspendable {
        function: gen_fn,
        argc: 0,
        kind: SuspendKind::Generator,
    });
    b.emit(Op::ForIter); // [gen, stop]
    b.emit(Op::RotN(2)); // [stop, gen]
    b.emit(Op::ForIter); // [stop, gen, stop]

    let mut vm = Vm::default();
    let root = vm.load(Arc::new(b.build()));
    assert_eq!(vm.run(root).unwrap(), Value::StopIteration);

    let stack = vm.context(root).unwrap().stack();
    assert_eq!(stack.len(), 3);
    assert_eq!(stack[0], Value::StopIteration);
    assert!(stack[1].as_suspendable().is_some());
}

#[test]
fn test_for_iter_on_non_generator_is_type_error() {
    let mut b = CodeBuilder::new("<module>");
    let one = b.add_const(Value::Int(1));
    b.emit(Op::LoadConst(one));
    b.emit(Op::ForIter);

    let err = Engine::new().run(b.build()).unwrap_err();
    let exc = err.into_exception().unwrap();
    assert_eq!(exc.kind(), ExcType::TypeError);
    assert_eq!(exc.message(), "'int' object is not an iterator");
}

/// A coroutine keeping a running total of the values sent into it.
fn accumulator() -> CodeObject {
    let mut c = CodeBuilder::new("accumulate");
    let zero = c.add_const(Value::Int(0));
    c.emit(Op::LoadConst(zero));
    let top = c.emit(Op::Dup);
    c.emit(Op::YieldValue); // resumes with [total, sent]
    c.emit(Op::BinaryOp(BinOp::Add));
    c.emit(Op::Jump(top));
    c.build()
}

fn sending(values: &[Value]) -> CodeObject {
    let mut b = CodeBuilder::new("<module>");
    let co = b.add_function(accumulator());
    b.emit(Op::MakeSuspendable {
        function: co,
        argc: 0,
        kind: SuspendKind::Coroutine,
    });
    for (i, v) in values.iter().enumerate() {
        let c = b.add_const(v.clone());
        b.emit(Op::LoadConst(c));
        b.emit(Op::Send);
        if i + 1 < values.len() {
            b.emit(Op::Pop);
        }
    }
    b.emit(Op::ReturnValue);
    b.build()
}

#[test]
fn test_send_into_coroutine() {
    let program = sending(&[Value::None, Value::Int(5), Value::Int(10)]);
    let output = Engine::new().run(program).unwrap();
    assert_eq!(output.result, Value::Int(15));
}

#[test]
fn test_sent_value_is_top_of_stack_after_yield() {
    let mut vm = Vm::default();
    let root = vm.load(Arc::new(sending(&[Value::None, Value::Int(5)])));

    vm.execute_next(root).unwrap(); // MakeSuspendable
    vm.execute_next(root).unwrap(); // LoadConst None
    let body = vm.execute_next(root).unwrap(); // Send starts the body
    assert_eq!(vm.context(body).unwrap().ip(), 0);
    vm.execute_next(body).unwrap(); // LoadConst 0
    vm.execute_next(body).unwrap(); // Dup
    assert_eq!(vm.execute_next(body).unwrap(), root); // YieldValue
    assert_eq!(vm.context(root).unwrap().peek().unwrap(), &Value::Int(0));

    vm.execute_next(root).unwrap(); // Pop
    vm.execute_next(root).unwrap(); // LoadConst 5
    assert_eq!(vm.execute_next(root).unwrap(), body); // Send 5

    let ctx = vm.context(body).unwrap();
    assert_eq!(ctx.ip(), 3);
    assert_eq!(ctx.peek().unwrap(), &Value::Int(5));
    assert_eq!(ctx.stack(), &[Value::Int(0), Value::Int(5)]);
    assert_eq!(ctx.caller(), Some(root));
}

#[test]
fn test_non_none_first_send_is_rejected() {
    for first in [Value::Int(0), Value::from("x"), Value::Bool(false)] {
        let value_type = first.type_name();
        let mut b = CodeBuilder::new("<module>");
        let co = b.add_function(accumulator());
        b.emit(Op::MakeSuspendable {
            function: co,
            argc: 0,
            kind: SuspendKind::Coroutine,
        });
        let c = b.add_const(first);
        b.emit(Op::LoadConst(c));
        let send = b.emit(Op::Send);
        // Protocol misuse is not a script exception: this handler never runs.
        b.protect(send, send, 0, send + 1);
        b.emit(Op::Nop);

        let err = Engine::new().run(b.build()).unwrap_err();
        match err {
            Error::InvalidSend { kind, value_type: got } => {
                assert_eq!(kind, SuspendKind::Coroutine);
                assert_eq!(got, value_type);
            }
            other => panic!("expected InvalidSend, got {other:?}"),
        }
    }
}

#[test]
fn test_generator_rejects_non_none_first_send_too() {
    let mut b = CodeBuilder::new("<module>");
    let gen_fn = b.add_function(yielding(&[1]));
    b.emit(Op::MakeSuspendable {
        function: gen_fn,
        argc: 0,
        kind: SuspendKind::Generator,
    });
    let c = b.add_const(Value::Int(1));
    b.emit(Op::LoadConst(c));
    b.emit(Op::Send);

    let err = Engine::new().run(b.build()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "can't send non-None value to a just-started generator (got int)"
    );
}

#[test]
fn test_exception_in_body_surfaces_at_resumer() {
    let mut g = CodeBuilder::new("gen");
    g.set_line(40);
    let msg = g.add_const(Value::from("broken"));
    g.emit(Op::LoadConst(msg));
    g.emit(Op::Raise(ExcType::ValueError));

    let mut b = CodeBuilder::new("<module>");
    b.set_line(1);
    let gen_fn = b.add_function(g.build());
    b.emit(Op::MakeSuspendable {
        function: gen_fn,
        argc: 0,
        kind: SuspendKind::Generator,
    });
    b.set_line(2);
    let for_iter = b.emit(Op::ForIter);
    let handler = b.emit(Op::CheckExcMatch(ExcType::ValueError));
    // [gen, matched] -> [matched, gen]; advancing the dead generator again
    // yields the sentinel.
    b.emit(Op::RotN(2));
    b.emit(Op::ForIter);
    b.protect(for_iter, for_iter, 1, handler);

    let mut vm = Vm::default();
    let root = vm.load(Arc::new(b.build()));
    vm.run(root).unwrap();

    let ctx = vm.context(root).unwrap();
    let stack = ctx.stack();
    assert_eq!(stack.len(), 3);
    assert_eq!(stack[0], Value::Bool(true));
    assert_eq!(stack[2], Value::StopIteration);

    let exc = ctx.pending_exception().unwrap();
    assert_eq!(exc.traceback().len(), 1);
    assert_eq!(exc.traceback()[0].name, "gen");
    assert_eq!(exc.traceback()[0].line, Some(40));
    assert_eq!(vm.live_contexts(), 1);
}

#[test]
fn test_generator_arguments_bound_at_creation() {
    // gen(a, b): yield a - b
    let mut g = CodeBuilder::new("gen");
    g.emit(Op::BinaryOp(BinOp::Sub));
    g.emit(Op::YieldValue);

    let mut b = CodeBuilder::new("<module>");
    let nine = b.add_const(Value::Int(9));
    let four = b.add_const(Value::Int(4));
    let gen_fn = b.add_function(g.build());
    b.emit(Op::LoadConst(nine));
    b.emit(Op::LoadConst(four));
    b.emit(Op::MakeSuspendable {
        function: gen_fn,
        argc: 2,
        kind: SuspendKind::Generator,
    });
    b.emit(Op::ForIter);
    b.emit(Op::ReturnValue);

    assert_eq!(Engine::new().run(b.build()).unwrap().result, Value::Int(5));
}

#[test]
fn test_embedder_driven_resumption() {
    let mut b = CodeBuilder::new("<module>");
    let gen_fn = b.add_function(yielding(&[7]));
    b.emit(Op::MakeSuspendable {
        function: gen_fn,
        argc: 0,
        kind: SuspendKind::Generator,
    });

    let mut vm = Vm::default();
    let root = vm.load(Arc::new(b.build()));
    let handle = vm.run(root).unwrap().as_suspendable().unwrap();
    assert_eq!(handle.kind(), SuspendKind::Generator);

    let body = vm.start_next(&handle, root).unwrap();
    assert_eq!(body, handle.context());
    assert_eq!(vm.context(body).unwrap().caller(), Some(root));

    vm.execute_next(body).unwrap();
    assert_eq!(vm.execute_next(body).unwrap(), root);
    assert_eq!(vm.context(root).unwrap().peek().unwrap(), &Value::Int(7));
    assert_eq!(vm.context(body).unwrap().caller(), None);

    assert_eq!(vm.start_send(&handle, Value::Int(1), root).unwrap(), body);
    let ctx = vm.context(body).unwrap();
    assert_eq!(ctx.ip(), 2);
    assert_eq!(ctx.peek().unwrap(), &Value::Int(1));
}

#[test]
fn test_embedder_cannot_resume_from_an_ordinary_instruction() {
    let mut b = CodeBuilder::new("<module>");
    let gen_fn = b.add_function(yielding(&[7]));
    b.emit(Op::MakeSuspendable {
        function: gen_fn,
        argc: 0,
        kind: SuspendKind::Generator,
    });
    b.emit(Op::Nop);

    let mut vm = Vm::default();
    let root = vm.load(Arc::new(b.build()));
    vm.execute_next(root).unwrap();
    let handle = vm.context(root).unwrap().peek().unwrap().as_suspendable().unwrap();

    // The next yield would skip the root's Nop.
    assert!(matches!(vm.start_next(&handle, root), Err(Error::BadOperand(_))));
    let body = vm.context(handle.context()).unwrap();
    assert!(body.is_unstarted());
    assert_eq!(body.caller(), None);
}

/// A coroutine that returns the first value sent after it starts.
fn echo_once() -> CodeObject {
    let mut c = CodeBuilder::new("echo");
    let none = c.add_const(Value::None);
    c.emit(Op::LoadConst(none));
    c.emit(Op::YieldValue);
    c.emit(Op::ReturnValue);
    c.build()
}

#[test]
fn test_exhaustion_becomes_sentinel_at_send() {
    let mut b = CodeBuilder::new("<module>");
    let co = b.add_function(echo_once());
    let none = b.add_const(Value::None);
    let five = b.add_const(Value::Int(5));
    b.emit(Op::MakeSuspendable {
        function: co,
        argc: 0,
        kind: SuspendKind::Coroutine,
    });
    b.emit(Op::LoadConst(none));
    b.emit(Op::Send); // [co, None]
    b.emit(Op::Pop);
    b.emit(Op::LoadConst(five));
    let send = b.emit(Op::Send); // body returns: [co, stop]

    let mut vm = Vm::default();
    let root = vm.load(Arc::new(b.build()));
    assert_eq!(vm.run(root).unwrap(), Value::StopIteration);

    let ctx = vm.context(root).unwrap();
    assert_eq!(ctx.ip(), i64::from(send) + 1);
    assert_eq!(ctx.stack_len(), 2);
    assert!(ctx.pending_exception().is_none());
    assert_eq!(vm.live_contexts(), 1);
}

#[test]
fn test_exhaustion_inside_a_called_function() {
    // def f(): g = gen(); next(g); return next(g)   (the second is the sentinel)
    let mut f = CodeBuilder::new("f");
    let gen_fn = f.add_function(yielding(&[4]));
    f.emit(Op::MakeSuspendable {
        function: gen_fn,
        argc: 0,
        kind: SuspendKind::Generator,
    });
    f.emit(Op::ForIter);
    f.emit(Op::Pop);
    f.emit(Op::ForIter);
    f.emit(Op::ReturnValue);

    let mut b = CodeBuilder::new("<module>");
    let f = b.add_function(f.build());
    b.emit(Op::Call {
        function: f,
        argc: 0,
    });
    b.emit(Op::ReturnValue);

    let mut vm = Vm::default();
    let root = vm.load(Arc::new(b.build()));
    let f = vm.execute_next(root).unwrap();
    let mut current = f;
    // Drive f and its generator until control is back in f after the
    // generator finished.
    while !(current == f
        && vm
            .context(f)
            .unwrap()
            .peek()
            .is_ok_and(Value::is_stop_iteration))
    {
        current = vm.execute_next(current).unwrap();
    }
    // The sentinel landed in f, the frame that advanced the generator; the
    // root was never involved.
    assert_eq!(vm.context(f).unwrap().caller(), Some(root));
    assert_eq!(vm.context(f).unwrap().stack_len(), 2);
    assert_eq!(vm.context(root).unwrap().ip(), 0);
    assert!(vm.context(root).unwrap().pending_exception().is_none());

    while vm.has_more(current) {
        current = vm.execute_next(current).unwrap();
    }
    assert_eq!(current, root);
    assert_eq!(
        vm.context(root).unwrap().stack(),
        &[Value::StopIteration]
    );
    assert_eq!(vm.live_contexts(), 1);
}

#[test]
fn test_abandoned_generators_are_released() {
    // n = 100; while n: g = gen(); next(g); n -= 1
    let mut b = CodeBuilder::new("<module>");
    let gen_fn = b.add_function(yielding(&[1, 2, 3]));
    let hundred = b.add_const(Value::Int(100));
    let one = b.add_const(Value::Int(1));
    b.emit(Op::LoadConst(hundred));
    let top = b.emit(Op::Dup);
    let exit = b.emit_jump(Op::PopJumpIfFalse);
    b.emit(Op::MakeSuspendable {
        function: gen_fn,
        argc: 0,
        kind: SuspendKind::Generator,
    });
    b.emit(Op::ForIter);
    b.emit(Op::Pop);
    b.emit(Op::Pop); // drops the only handle
    b.emit(Op::LoadConst(one));
    b.emit(Op::BinaryOp(BinOp::Sub));
    b.emit(Op::Jump(top));
    let done = b.emit(Op::ReturnValue);
    b.patch_jump(exit, done).unwrap();

    let mut vm = Vm::default();
    let root = vm.load(Arc::new(b.build()));
    let mut current = root;
    let mut peak = 0;
    while vm.has_more(current) {
        current = vm.execute_next(current).unwrap();
        peak = peak.max(vm.live_contexts());
    }
    assert_eq!(vm.context(root).unwrap().stack(), &[Value::Int(0)]);
    assert!(peak <= 2, "peak of {peak} live contexts");
    assert_eq!(vm.live_contexts(), 1);
}

#[test]
fn test_body_kept_while_a_handle_is_alive() {
    let mut b = CodeBuilder::new("<module>");
    let gen_fn = b.add_function(yielding(&[1, 2]));
    b.emit(Op::MakeSuspendable {
        function: gen_fn,
        argc: 0,
        kind: SuspendKind::Generator,
    });
    b.emit(Op::Dup);
    b.emit(Op::Pop); // one copy remains on the stack
    b.emit(Op::ForIter);
    b.emit(Op::Pop);
    b.emit(Op::ForIter);
    b.emit(Op::ReturnValue);

    let output = Engine::new().run(b.build()).unwrap();
    assert_eq!(output.result, Value::Int(2));
}
