// File: src/vm.rs
//
// Virtual machine for executing Cinder bytecode.
// A stack machine with call frames, closures over open/closed upvalues,
// classes with bound methods, and a globals table. The VM is a first-class
// value: stacks, interned strings, and globals all live in it.

use crate::bytecode::OpCode;
use crate::compiler;
use crate::errors::{InterpretError, RuntimeError, TraceFrame};
use crate::object::{
    BoundMethod, Class, Closure, Function, Instance, NativeFn, ObjNative, ObjString, StringPool,
    Upvalue,
};
use crate::table::Table;
use crate::value::Value;
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;
use std::time::Instant;

/// Maximum call depth; exceeding it is the language's stack overflow.
pub const FRAMES_MAX: usize = 64;
/// Operand stack capacity reserved up front.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds elapsed since the VM process came up, as a fractional number.
fn clock_native(_args: &[Value]) -> Value {
    Value::Number(CLOCK_EPOCH.elapsed().as_secs_f64())
}

/// One activation record: the closure being run, its instruction offset,
/// and the stack index of its slot zero (the callee itself).
struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    slots: usize,
}

pub struct Vm {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    globals: Table,
    strings: StringPool,
    /// Open upvalues ordered by stack slot, highest first.
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    /// Cached so class calls can look initializers up without re-hashing.
    init_string: Rc<ObjString>,
    out: Box<dyn Write>,
    trace: bool,
    disassemble: bool,
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_output(Box::new(io::stdout()))
    }

    /// Builds a VM whose `print` output goes to `out` instead of stdout.
    pub fn with_output(out: Box<dyn Write>) -> Vm {
        let mut strings = StringPool::new();
        let init_string = strings.intern("init");
        let mut vm = Vm {
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(STACK_MAX),
            globals: Table::new(),
            strings,
            open_upvalues: Vec::new(),
            init_string,
            out,
            trace: std::env::var("CINDER_TRACE").is_ok(),
            disassemble: false,
        };
        // Pin the clock's zero point to VM startup.
        Lazy::force(&CLOCK_EPOCH);
        vm.define_native("clock", clock_native);
        vm
    }

    /// Dump each compiled function before execution.
    pub fn set_disassemble(&mut self, enabled: bool) {
        self.disassemble = enabled;
    }

    /// Compiles and runs a source string. Runtime failures reset the value
    /// and frame stacks, so the VM stays usable (the REPL relies on this).
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function =
            compiler::compile(source, &mut self.strings).map_err(InterpretError::Compile)?;
        let function = Rc::new(function);
        if self.disassemble {
            disassemble_function(&function);
        }

        let closure = Rc::new(Closure::new(function));
        self.stack.push(Value::Closure(Rc::clone(&closure)));
        if let Err(message) = self.call(closure, 0) {
            return Err(InterpretError::Runtime(self.runtime_error(message)));
        }
        self.run().map_err(InterpretError::Runtime)
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.strings.intern(name);
        self.globals.set(name, Value::Native(Rc::new(ObjNative { function })));
    }

    // ---- dispatch loop --------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        // The hot registers live in locals and are written back to the
        // frame only around operations that can change the current frame.
        let mut closure;
        let mut ip;
        let mut slots;
        {
            let frame = &self.frames[self.frames.len() - 1];
            closure = Rc::clone(&frame.closure);
            ip = frame.ip;
            slots = frame.slots;
        }

        macro_rules! save_frame {
            () => {{
                let index = self.frames.len() - 1;
                self.frames[index].ip = ip;
            }};
        }
        macro_rules! load_frame {
            () => {{
                let frame = &self.frames[self.frames.len() - 1];
                closure = Rc::clone(&frame.closure);
                ip = frame.ip;
                slots = frame.slots;
            }};
        }
        macro_rules! bail {
            ($($arg:tt)*) => {{
                save_frame!();
                return Err(self.runtime_error(format!($($arg)*)));
            }};
        }
        macro_rules! read_byte {
            () => {{
                let byte = closure.function.chunk.code[ip];
                ip += 1;
                byte
            }};
        }
        macro_rules! read_short {
            () => {{
                ip += 2;
                u16::from_be_bytes([
                    closure.function.chunk.code[ip - 2],
                    closure.function.chunk.code[ip - 1],
                ])
            }};
        }
        macro_rules! read_constant {
            () => {{
                let index = read_byte!() as usize;
                closure.function.chunk.constants[index].clone()
            }};
        }
        macro_rules! read_string {
            () => {
                match read_constant!() {
                    Value::Str(s) => s,
                    _ => unreachable!("constant operand is not a string"),
                }
            };
        }
        macro_rules! binary_op {
            ($make:path, $op:tt) => {
                match (self.peek(1), self.peek(0)) {
                    (&Value::Number(a), &Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.stack.push($make(a $op b));
                    }
                    _ => bail!("Operands must be numbers."),
                }
            };
        }

        loop {
            if self.trace {
                self.trace_stack();
                closure.function.chunk.disassemble_instruction(ip);
            }

            let op = OpCode::try_from(read_byte!()).expect("invalid opcode");
            match op {
                OpCode::Constant => {
                    let constant = read_constant!();
                    self.stack.push(constant);
                }
                OpCode::Nil => self.stack.push(Value::Nil),
                OpCode::True => self.stack.push(Value::Bool(true)),
                OpCode::False => self.stack.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = read_byte!() as usize;
                    self.stack.push(self.stack[slots + slot].clone());
                }
                OpCode::SetLocal => {
                    // Assignment is an expression; the value stays put.
                    let slot = read_byte!() as usize;
                    self.stack[slots + slot] = self.peek(0).clone();
                }
                OpCode::GetGlobal => {
                    let name = read_string!();
                    match self.globals.get(&name) {
                        Some(value) => self.stack.push(value),
                        None => bail!("Undefined variable '{}'.", name.chars),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = read_string!();
                    let value = self.peek(0).clone();
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = read_string!();
                    let value = self.peek(0).clone();
                    // Assignment never declares; undo the insert and fail.
                    if self.globals.set(Rc::clone(&name), value) {
                        self.globals.delete(&name);
                        bail!("Undefined variable '{}'.", name.chars);
                    }
                }
                OpCode::GetUpvalue => {
                    let index = read_byte!() as usize;
                    let value = match &*closure.upvalues[index].borrow() {
                        Upvalue::Open(slot) => self.stack[*slot].clone(),
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.stack.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = read_byte!() as usize;
                    let value = self.peek(0).clone();
                    let open_slot = {
                        let mut upvalue = closure.upvalues[index].borrow_mut();
                        match &mut *upvalue {
                            Upvalue::Open(slot) => Some(*slot),
                            Upvalue::Closed(cell) => {
                                *cell = value.clone();
                                None
                            }
                        }
                    };
                    if let Some(slot) = open_slot {
                        self.stack[slot] = value;
                    }
                }
                OpCode::GetProperty => {
                    let name = read_string!();
                    let Value::Instance(instance) = self.peek(0).clone() else {
                        bail!("Only instances have properties.");
                    };
                    let field = instance.fields.borrow().get(&name);
                    if let Some(value) = field {
                        self.pop();
                        self.stack.push(value);
                    } else if let Err(message) = self.bind_method(&instance.class, &name) {
                        bail!("{}", message);
                    }
                }
                OpCode::SetProperty => {
                    let name = read_string!();
                    let Value::Instance(instance) = self.peek(1).clone() else {
                        bail!("Only instances have fields.");
                    };
                    let value = self.pop();
                    instance.fields.borrow_mut().set(name, value.clone());
                    self.pop();
                    self.stack.push(value);
                }
                OpCode::GetSuper => {
                    let name = read_string!();
                    let Value::Class(superclass) = self.pop() else {
                        unreachable!("superclass slot is not a class");
                    };
                    if let Err(message) = self.bind_method(&superclass, &name) {
                        bail!("{}", message);
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(Value::Bool(a == b));
                }
                OpCode::Greater => binary_op!(Value::Bool, >),
                OpCode::Less => binary_op!(Value::Bool, <),
                OpCode::Add => match (self.peek(1), self.peek(0)) {
                    (Value::Str(_), Value::Str(_)) => {
                        let (Value::Str(b), Value::Str(a)) = (self.pop(), self.pop()) else {
                            unreachable!("operands changed under concatenation");
                        };
                        let result = self.strings.concatenate(&a, &b);
                        self.stack.push(Value::Str(result));
                    }
                    (&Value::Number(a), &Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.stack.push(Value::Number(a + b));
                    }
                    _ => bail!("Operands must be two numbers or two strings."),
                },
                OpCode::Subtract => binary_op!(Value::Number, -),
                OpCode::Multiply => binary_op!(Value::Number, *),
                OpCode::Divide => binary_op!(Value::Number, /),
                OpCode::Not => {
                    let value = self.pop();
                    self.stack.push(Value::Bool(!value.is_truthy()));
                }
                OpCode::Negate => match self.peek(0) {
                    &Value::Number(n) => {
                        self.pop();
                        self.stack.push(Value::Number(-n));
                    }
                    _ => bail!("Operand must be a number."),
                },
                OpCode::Print => {
                    let value = self.pop();
                    let _ = writeln!(self.out, "{}", value);
                }
                OpCode::Jump => {
                    let offset = read_short!();
                    ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    // Leaves the condition on the stack; the compiler pops
                    // it on both branches.
                    let offset = read_short!();
                    if !self.peek(0).is_truthy() {
                        ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = read_short!();
                    ip -= offset as usize;
                }
                OpCode::Call => {
                    let arg_count = read_byte!();
                    save_frame!();
                    let callee = self.peek(arg_count as usize).clone();
                    if let Err(message) = self.call_value(callee, arg_count) {
                        return Err(self.runtime_error(message));
                    }
                    load_frame!();
                }
                OpCode::Invoke => {
                    let name = read_string!();
                    let arg_count = read_byte!();
                    save_frame!();
                    if let Err(message) = self.invoke(&name, arg_count) {
                        return Err(self.runtime_error(message));
                    }
                    load_frame!();
                }
                OpCode::SuperInvoke => {
                    let name = read_string!();
                    let arg_count = read_byte!();
                    let Value::Class(superclass) = self.pop() else {
                        unreachable!("superclass slot is not a class");
                    };
                    save_frame!();
                    if let Err(message) = self.invoke_from_class(&superclass, &name, arg_count) {
                        return Err(self.runtime_error(message));
                    }
                    load_frame!();
                }
                OpCode::Super => unreachable!("reserved opcode"),
                OpCode::Closure => {
                    let Value::Function(function) = read_constant!() else {
                        unreachable!("closure constant is not a function");
                    };
                    let mut upvalues = Vec::with_capacity(function.upvalue_count);
                    for _ in 0..function.upvalue_count {
                        let is_local = read_byte!() != 0;
                        let index = read_byte!() as usize;
                        if is_local {
                            upvalues.push(self.capture_upvalue(slots + index));
                        } else {
                            upvalues.push(Rc::clone(&closure.upvalues[index]));
                        }
                    }
                    self.stack.push(Value::Closure(Rc::new(Closure { function, upvalues })));
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no frame to return from");
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        // Discard the top-level closure itself.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.stack.push(result);
                    load_frame!();
                }
                OpCode::Class => {
                    let name = read_string!();
                    self.stack.push(Value::Class(Rc::new(Class::new(name))));
                }
                OpCode::Inherit => {
                    let Value::Class(superclass) = self.peek(1).clone() else {
                        bail!("Superclass must be a class.");
                    };
                    let Value::Class(subclass) = self.peek(0).clone() else {
                        unreachable!("inherit target is not a class");
                    };
                    subclass.methods.borrow_mut().add_all(&superclass.methods.borrow());
                    self.pop();
                }
                OpCode::Method => {
                    let name = read_string!();
                    let method = self.peek(0).clone();
                    let Value::Class(class) = self.peek(1).clone() else {
                        unreachable!("method target is not a class");
                    };
                    class.methods.borrow_mut().set(name, method);
                    self.pop();
                }
            }
        }
    }

    // ---- call protocol --------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), String> {
        match callee {
            Value::Closure(closure) => self.call(closure, arg_count),
            Value::Native(native) => {
                let first = self.stack.len() - arg_count as usize;
                let result = (native.function)(&self.stack[first..]);
                // Drop the arguments and the callee, then publish the result.
                self.stack.truncate(first - 1);
                self.stack.push(result);
                Ok(())
            }
            Value::Class(class) => {
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = Value::Instance(Rc::new(Instance::new(Rc::clone(&class))));
                let initializer = class.methods.borrow().get(&self.init_string);
                if let Some(Value::Closure(initializer)) = initializer {
                    self.call(initializer, arg_count)
                } else if arg_count != 0 {
                    Err(format!("Expected 0 arguments but got {}.", arg_count))
                } else {
                    Ok(())
                }
            }
            Value::BoundMethod(bound) => {
                // The receiver takes the callee slot, becoming 'this'.
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = bound.receiver.clone();
                self.call(Rc::clone(&bound.method), arg_count)
            }
            _ => Err("Can only call functions and classes.".to_string()),
        }
    }

    fn call(&mut self, closure: Rc<Closure>, arg_count: u8) -> Result<(), String> {
        if arg_count != closure.function.arity {
            return Err(format!(
                "Expected {} arguments but got {}.",
                closure.function.arity, arg_count
            ));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        let slots = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame { closure, ip: 0, slots });
        Ok(())
    }

    fn invoke(&mut self, name: &Rc<ObjString>, arg_count: u8) -> Result<(), String> {
        let Value::Instance(instance) = self.peek(arg_count as usize).clone() else {
            return Err("Only instances have methods.".to_string());
        };
        // A field shadowing the method name may hold any callable.
        let field = instance.fields.borrow().get(name);
        if let Some(value) = field {
            let slot = self.stack.len() - arg_count as usize - 1;
            self.stack[slot] = value.clone();
            return self.call_value(value, arg_count);
        }
        self.invoke_from_class(&instance.class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: &Rc<Class>,
        name: &Rc<ObjString>,
        arg_count: u8,
    ) -> Result<(), String> {
        let method = class.methods.borrow().get(name);
        match method {
            Some(Value::Closure(method)) => self.call(method, arg_count),
            _ => Err(format!("Undefined property '{}'.", name.chars)),
        }
    }

    fn bind_method(&mut self, class: &Rc<Class>, name: &Rc<ObjString>) -> Result<(), String> {
        let method = class.methods.borrow().get(name);
        let Some(Value::Closure(method)) = method else {
            return Err(format!("Undefined property '{}'.", name.chars));
        };
        let receiver = self.pop();
        self.stack.push(Value::BoundMethod(Rc::new(BoundMethod { receiver, method })));
        Ok(())
    }

    // ---- upvalues -------------------------------------------------------

    /// Returns the open upvalue for a stack slot, creating one if none
    /// exists. The list stays sorted by slot, highest first, with at most
    /// one entry per slot so every capture of a variable shares it.
    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        let mut index = 0;
        while index < self.open_upvalues.len() {
            let existing = open_slot(&self.open_upvalues[index]);
            if existing == slot {
                return Rc::clone(&self.open_upvalues[index]);
            }
            if existing < slot {
                break;
            }
            index += 1;
        }
        let upvalue = Rc::new(RefCell::new(Upvalue::Open(slot)));
        self.open_upvalues.insert(index, Rc::clone(&upvalue));
        upvalue
    }

    /// Closes every open upvalue at or above `floor`: the stack value moves
    /// into the upvalue and the entry leaves the open list.
    fn close_upvalues(&mut self, floor: usize) {
        while let Some(head) = self.open_upvalues.first() {
            let slot = open_slot(head);
            if slot < floor {
                break;
            }
            let upvalue = self.open_upvalues.remove(0);
            let value = self.stack[slot].clone();
            *upvalue.borrow_mut() = Upvalue::Closed(value);
        }
    }

    // ---- plumbing -------------------------------------------------------

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    /// Builds the error with a trace over the live frames, innermost first,
    /// then resets the machine so it can be used again.
    fn runtime_error(&mut self, message: String) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = &frame.closure.function;
            // ip already sits past the faulting instruction.
            let instruction = frame.ip.saturating_sub(1);
            let line = function.chunk.lines.get(instruction).copied().unwrap_or(0);
            trace.push(TraceFrame {
                line,
                function: function.name.as_ref().map(|name| name.chars.to_string()),
            });
        }
        self.reset_stack();
        RuntimeError { message, trace }
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    fn trace_stack(&self) {
        eprint!("          ");
        for value in &self.stack {
            eprint!("[ {} ]", value);
        }
        eprintln!();
    }
}

fn open_slot(upvalue: &Rc<RefCell<Upvalue>>) -> usize {
    match &*upvalue.borrow() {
        Upvalue::Open(slot) => *slot,
        Upvalue::Closed(_) => unreachable!("closed upvalue in the open list"),
    }
}

/// Recursively disassembles a function and every function in its pool.
fn disassemble_function(function: &Function) {
    let name = match &function.name {
        Some(name) => name.chars.to_string(),
        None => "<script>".to_string(),
    };
    function.chunk.disassemble(&name);
    for constant in &function.chunk.constants {
        if let Value::Function(nested) = constant {
            disassemble_function(nested);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Print output sink shared between the test and the VM.
    #[derive(Clone, Default)]
    struct Sink(Rc<RefCell<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Compiles and runs source, returning captured stdout and the result.
    fn run_code(source: &str) -> (String, Result<(), InterpretError>) {
        let sink = Sink::default();
        let mut vm = Vm::with_output(Box::new(sink.clone()));
        let result = vm.interpret(source);
        let output = String::from_utf8(sink.0.borrow().clone()).expect("utf8 output");
        (output, result)
    }

    fn expect_output(source: &str, expected: &str) {
        let (output, result) = run_code(source);
        if let Err(e) = result {
            panic!("unexpected error: {}", e);
        }
        assert_eq!(output, expected);
    }

    fn expect_runtime_error(source: &str) -> RuntimeError {
        match run_code(source).1 {
            Err(InterpretError::Runtime(e)) => e,
            Err(InterpretError::Compile(e)) => panic!("compile error: {}", e),
            Ok(()) => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn test_arithmetic() {
        expect_output("print 1 + 2;", "3\n");
        expect_output("print 6 / 2 - 1;", "2\n");
        expect_output("print -(3 * 4);", "-12\n");
        expect_output("print 1 + 2 * 3;", "7\n");
    }

    #[test]
    fn test_comparison_and_equality() {
        expect_output("print 1 < 2;", "true\n");
        expect_output("print 2 <= 1;", "false\n");
        expect_output("print 3 >= 3;", "true\n");
        expect_output("print 1 == 1.0;", "true\n");
        expect_output("print nil == false;", "false\n");
        expect_output("print \"a\" != \"b\";", "true\n");
    }

    #[test]
    fn test_truthiness_through_not() {
        expect_output("print !nil;", "true\n");
        expect_output("print !0;", "false\n");
        expect_output("print !\"\";", "false\n");
        expect_output("print !!true;", "true\n");
    }

    #[test]
    fn test_concatenation_interning_equality() {
        expect_output("var a = \"he\"; var b = \"llo\"; print a + b == \"hello\";", "true\n");
    }

    #[test]
    fn test_globals() {
        expect_output("var a = 1; a = a + 1; print a;", "2\n");
        expect_output("var a; print a;", "nil\n");
    }

    #[test]
    fn test_locals_and_assignment_expression() {
        expect_output("{ var a = 1; print a = 2; print a; }", "2\n2\n");
    }

    #[test]
    fn test_logical_operators_short_circuit() {
        expect_output("print true and \"yes\";", "yes\n");
        expect_output("print false and \"yes\";", "false\n");
        expect_output("print false or \"no\";", "no\n");
        expect_output("print 1 or missing;", "1\n");
    }

    #[test]
    fn test_control_flow() {
        expect_output("if (true) print 1; else print 2;", "1\n");
        expect_output("if (nil) print 1; else print 2;", "2\n");
        expect_output("var i = 0; while (i < 3) { print i; i = i + 1; }", "0\n1\n2\n");
    }

    #[test]
    fn test_for_loop_sum() {
        expect_output("var n = 0; for (var i = 0; i < 3; i = i + 1) n = n + i; print n;", "3\n");
    }

    #[test]
    fn test_function_call_and_return() {
        expect_output("fun add(a, b) { return a + b; } print add(1, 2);", "3\n");
        expect_output("fun noisy() { print \"hi\"; } print noisy();", "hi\nnil\n");
        expect_output("fun first(a, b) { return a; } print first(7, 9);", "7\n");
    }

    #[test]
    fn test_recursion() {
        expect_output(
            "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);",
            "55\n",
        );
    }

    #[test]
    fn test_closure_captures_local() {
        expect_output(
            "fun make(x) { fun get() { return x; } return get; } var g = make(42); print g();",
            "42\n",
        );
    }

    #[test]
    fn test_closures_share_captured_variable() {
        expect_output(
            "var get; var set;
             fun make() {
               var x = 10;
               fun g() { return x; }
               fun s(v) { x = v; }
               get = g;
               set = s;
             }
             make();
             set(99);
             print get();",
            "99\n",
        );
    }

    #[test]
    fn test_close_upvalue_at_scope_exit() {
        expect_output(
            "var f; { var a = 1; fun g() { print a; } f = g; } f();",
            "1\n",
        );
    }

    #[test]
    fn test_closed_upvalue_keeps_value() {
        expect_output(
            "fun counter() {
               var count = 0;
               fun tick() { count = count + 1; return count; }
               return tick;
             }
             var tick = counter();
             tick();
             tick();
             print tick();",
            "3\n",
        );
    }

    #[test]
    fn test_open_upvalue_list_stays_sorted_and_shared() {
        let mut vm = Vm::with_output(Box::new(io::sink()));
        for i in 0..4 {
            vm.stack.push(Value::Number(i as f64));
        }
        let a = vm.capture_upvalue(1);
        let b = vm.capture_upvalue(3);
        let c = vm.capture_upvalue(2);
        // Capturing a slot twice hands back the same upvalue.
        assert!(Rc::ptr_eq(&b, &vm.capture_upvalue(3)));
        let slots: Vec<usize> = vm.open_upvalues.iter().map(open_slot).collect();
        assert_eq!(slots, vec![3, 2, 1]);

        vm.close_upvalues(2);
        assert_eq!(vm.open_upvalues.len(), 1);
        assert!(matches!(&*b.borrow(), Upvalue::Closed(Value::Number(n)) if *n == 3.0));
        assert!(matches!(&*c.borrow(), Upvalue::Closed(Value::Number(n)) if *n == 2.0));
        assert!(matches!(&*a.borrow(), Upvalue::Open(1)));
    }

    #[test]
    fn test_class_with_initializer() {
        expect_output(
            "class C { init(n) { this.n = n; } get() { return this.n; } } print C(7).get();",
            "7\n",
        );
    }

    #[test]
    fn test_fields() {
        expect_output(
            "class Box {} var b = Box(); b.value = 3; b.value = b.value + 1; print b.value;",
            "4\n",
        );
    }

    #[test]
    fn test_bound_method_carries_receiver() {
        expect_output(
            "class C { init() { this.n = 5; } get() { return this.n; } }
             var m = C().get;
             print m();",
            "5\n",
        );
    }

    #[test]
    fn test_method_receiver_identity() {
        expect_output(
            "class C { me() { return this; } } var c = C(); print c.me() == c;",
            "true\n",
        );
    }

    #[test]
    fn test_field_shadowing_method_is_callable() {
        expect_output(
            "class C { m() { return 1; } }
             var c = C();
             fun two() { return 2; }
             c.m = two;
             print c.m();",
            "2\n",
        );
    }

    #[test]
    fn test_inheritance_and_super() {
        expect_output(
            "class A { hi() { print \"A\"; } }
             class B < A { hi() { super.hi(); print \"B\"; } }
             B().hi();",
            "A\nB\n",
        );
    }

    #[test]
    fn test_inherited_method_without_override() {
        expect_output(
            "class A { hi() { print \"A\"; } } class B < A {} B().hi();",
            "A\n",
        );
    }

    #[test]
    fn test_super_method_reference() {
        expect_output(
            "class A { name() { return \"A\"; } }
             class B < A { name() { var parent = super.name; return parent() + \"B\"; } }
             print B().name();",
            "AB\n",
        );
    }

    #[test]
    fn test_printing_of_objects() {
        expect_output("fun f() {} print f;", "<fn f>\n");
        expect_output("print clock;", "<native fn>\n");
        expect_output("class C {} print C;", "C\n");
        expect_output("class C {} print C();", "C instance\n");
        expect_output("class C { m() {} } print C().m;", "<fn m>\n");
    }

    #[test]
    fn test_clock_native() {
        expect_output("print clock() >= 0;", "true\n");
        expect_output("var a = clock(); var b = clock(); print b >= a;", "true\n");
    }

    #[test]
    fn test_undefined_variable_error() {
        let error = expect_runtime_error("print x;");
        assert_eq!(error.to_string(), "Undefined variable 'x'.\n[line 1] in script");
    }

    #[test]
    fn test_assignment_to_undeclared_global_fails() {
        let error = expect_runtime_error("x = 1;");
        assert_eq!(error.message, "Undefined variable 'x'.");
    }

    #[test]
    fn test_add_type_error() {
        let error = expect_runtime_error("\"a\" + 1;");
        assert_eq!(error.message, "Operands must be two numbers or two strings.");
    }

    #[test]
    fn test_operand_type_errors() {
        assert_eq!(expect_runtime_error("-\"a\";").message, "Operand must be a number.");
        assert_eq!(expect_runtime_error("1 < \"a\";").message, "Operands must be numbers.");
    }

    #[test]
    fn test_stack_overflow() {
        let error = expect_runtime_error("fun f() { f(); } f();");
        assert_eq!(error.message, "Stack overflow.");
        assert_eq!(error.trace.len(), FRAMES_MAX);
        assert_eq!(error.trace[0].function.as_deref(), Some("f"));
    }

    #[test]
    fn test_trace_lists_frames_innermost_first() {
        let error = expect_runtime_error("fun f() {\n  return missing;\n}\nf();");
        assert_eq!(
            error.to_string(),
            "Undefined variable 'missing'.\n[line 2] in f()\n[line 4] in script"
        );
    }

    #[test]
    fn test_call_type_errors() {
        assert_eq!(
            expect_runtime_error("var a = 1; a();").message,
            "Can only call functions and classes."
        );
        assert_eq!(
            expect_runtime_error("fun f(a) {} f();").message,
            "Expected 1 arguments but got 0."
        );
        assert_eq!(
            expect_runtime_error("class C {} C(1);").message,
            "Expected 0 arguments but got 1."
        );
    }

    #[test]
    fn test_property_errors() {
        assert_eq!(
            expect_runtime_error("class C {} C().missing;").message,
            "Undefined property 'missing'."
        );
        assert_eq!(
            expect_runtime_error("var x = 1; x.y;").message,
            "Only instances have properties."
        );
        assert_eq!(
            expect_runtime_error("var x = 1; x.y = 2;").message,
            "Only instances have fields."
        );
        assert_eq!(
            expect_runtime_error("class C {} C().missing();").message,
            "Undefined property 'missing'."
        );
        assert_eq!(
            expect_runtime_error("var x = 1; x.m();").message,
            "Only instances have methods."
        );
    }

    #[test]
    fn test_inherit_from_non_class_fails() {
        let error = expect_runtime_error("var x = 1; class B < x {}");
        assert_eq!(error.message, "Superclass must be a class.");
    }

    #[test]
    fn test_vm_recovers_after_runtime_error() {
        let sink = Sink::default();
        let mut vm = Vm::with_output(Box::new(sink.clone()));
        assert!(vm.interpret("print x;").is_err());
        assert!(vm.interpret("print 1;").is_ok());
        let output = String::from_utf8(sink.0.borrow().clone()).expect("utf8 output");
        assert_eq!(output, "1\n");
    }

    #[test]
    fn test_globals_persist_across_interpret_calls() {
        let sink = Sink::default();
        let mut vm = Vm::with_output(Box::new(sink.clone()));
        vm.interpret("var a = 40;").expect("define");
        vm.interpret("print a + 2;").expect("use");
        let output = String::from_utf8(sink.0.borrow().clone()).expect("utf8 output");
        assert_eq!(output, "42\n");
    }

    #[test]
    fn test_compile_error_reported_not_run() {
        let (output, result) = run_code("print ;");
        assert!(matches!(result, Err(InterpretError::Compile(_))));
        assert_eq!(output, "");
    }
}
