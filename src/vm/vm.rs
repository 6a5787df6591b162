use std::fmt;
use std::io::{self, Write};
use std::time::Instant;

use crate::compiler;
use crate::config::RuntimeConfig;

use super::debug;
use super::heap::{
    GcRef, Heap, InternedStr, NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction,
    ObjInstance, ObjKind, ObjNative, ObjUpvalue,
};
use super::table::Table;
use super::{OpCode, Value};

/// Maximum simultaneous call frames.
pub const FRAMES_MAX: usize = 64;
/// Maximum value-stack slots.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// The error surface of [`VM::interpret`]. Each variant carries the
/// fully formatted report, ready to print to stderr.
#[derive(Debug)]
pub enum InterpretError {
    Compile(String),
    Runtime(String),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile(report) | InterpretError::Runtime(report) => {
                write!(f, "{}", report)
            }
        }
    }
}

impl std::error::Error for InterpretError {}

/// One in-progress call: the closure being run, the instruction
/// pointer into its chunk, and the stack slot where its window starts
/// (slot 0 holds the callee or the receiver).
struct CallFrame {
    closure: GcRef,
    /// The closure's function, cached to avoid a double lookup per fetch.
    function: GcRef,
    ip: usize,
    base: usize,
}

enum Flow {
    Continue,
    Done,
}

/// The kona virtual machine.
pub struct VM {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    heap: Heap,
    globals: Table,
    /// Upvalues still pointing into the stack, sorted by slot, highest
    /// first. The VM owns this list; closures only share the upvalues.
    open_upvalues: Vec<GcRef>,
    /// Interned "init", kept pinned so constructor lookup never misses.
    init_string: InternedStr,
    start_time: Instant,
    config: RuntimeConfig,
    /// Output stream for print statements.
    output: Box<dyn Write>,
}

impl VM {
    pub fn new() -> Self {
        Self::new_with_config(RuntimeConfig::default(), Box::new(io::stdout()))
    }

    /// Create a VM with a custom output stream.
    pub fn with_output(output: Box<dyn Write>) -> Self {
        Self::new_with_config(RuntimeConfig::default(), output)
    }

    /// Create a VM with full configuration.
    pub fn new_with_config(config: RuntimeConfig, output: Box<dyn Write>) -> Self {
        let mut heap = Heap::new_with_config(config.stress_gc, config.log_gc);
        let init_string = heap.intern("init");
        let mut vm = Self {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            heap,
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            start_time: Instant::now(),
            config,
            output,
        };
        vm.define_native("clock", clock_native);
        vm
    }

    /// Compile and run a source buffer to completion.
    ///
    /// Globals survive across calls, so a REPL can feed one line at a
    /// time. On error the stacks are reset and the formatted report is
    /// returned; nothing of the failed program keeps running.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function =
            compiler::compile(source, &mut self.heap).map_err(InterpretError::Compile)?;
        if self.config.print_code {
            self.dump_code(&function);
        }

        let function_ref = self.heap.alloc(ObjKind::Function(function));
        let closure = self.heap.alloc(ObjKind::Closure(ObjClosure {
            function: function_ref,
            upvalues: Vec::new(),
        }));
        self.push(Value::Obj(closure));
        if let Err(message) = self.call_closure(closure, 0) {
            let report = self.format_runtime_error(&message);
            self.reset_stack();
            return Err(InterpretError::Runtime(report));
        }

        self.run().map_err(InterpretError::Runtime)
    }

    // ========================================
    // Dispatch loop
    // ========================================

    fn run(&mut self) -> Result<(), String> {
        loop {
            // A collection only ever happens here, between
            // instructions, so no handler can observe an object in a
            // half-constructed state.
            if self.heap.should_gc() {
                self.collect_garbage();
            }
            if self.config.trace_execution {
                self.trace_instruction();
            }

            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => return Ok(()),
                Err(message) => {
                    // Build the trace while the frames are still intact.
                    let report = self.format_runtime_error(&message);
                    self.reset_stack();
                    return Err(report);
                }
            }
        }
    }

    fn step(&mut self) -> Result<Flow, String> {
        let op_byte = self.read_byte();
        let op =
            OpCode::from_byte(op_byte).ok_or_else(|| format!("Unknown opcode {}.", op_byte))?;

        match op {
            OpCode::Constant => {
                let value = self.read_constant();
                self.push(value);
            }
            OpCode::Nil => self.push(Value::Nil),
            OpCode::True => self.push(Value::Bool(true)),
            OpCode::False => self.push(Value::Bool(false)),
            OpCode::Pop => {
                self.pop();
            }

            OpCode::GetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frame().base;
                let value = self.stack[base + slot];
                self.push(value);
            }
            OpCode::SetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frame().base;
                self.stack[base + slot] = self.peek(0);
            }
            OpCode::GetGlobal => {
                let name = self.read_string();
                match self.globals.get(name) {
                    Some(value) => self.push(value),
                    None => {
                        return Err(format!(
                            "Undefined variable '{}'.",
                            self.heap.str_value(name)
                        ));
                    }
                }
            }
            OpCode::DefineGlobal => {
                let name = self.read_string();
                let value = self.peek(0);
                self.globals.set(name, value);
                self.pop();
            }
            OpCode::SetGlobal => {
                let name = self.read_string();
                let value = self.peek(0);
                // Assignment never creates a global; undo and report.
                if self.globals.set(name, value) {
                    self.globals.delete(name);
                    return Err(format!(
                        "Undefined variable '{}'.",
                        self.heap.str_value(name)
                    ));
                }
            }
            OpCode::GetUpvalue => {
                let index = self.read_byte() as usize;
                let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                let value = match *self.heap.upvalue(upvalue) {
                    ObjUpvalue::Open(slot) => self.stack[slot],
                    ObjUpvalue::Closed(value) => value,
                };
                self.push(value);
            }
            OpCode::SetUpvalue => {
                let index = self.read_byte() as usize;
                let value = self.peek(0);
                let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                match *self.heap.upvalue(upvalue) {
                    ObjUpvalue::Open(slot) => self.stack[slot] = value,
                    ObjUpvalue::Closed(_) => {
                        *self.heap.upvalue_mut(upvalue) = ObjUpvalue::Closed(value);
                    }
                }
            }

            OpCode::GetProperty => {
                let name = self.read_string();
                let Some(instance_ref) = self.instance_at(0) else {
                    return Err("Only instances have properties.".to_string());
                };
                let instance = self.heap.instance(instance_ref).expect("instance");
                if let Some(value) = instance.fields.get(name) {
                    self.pop();
                    self.push(value);
                } else {
                    let class = instance.class;
                    self.bind_method(class, name)?;
                }
            }
            OpCode::SetProperty => {
                let name = self.read_string();
                let Some(instance_ref) = self.instance_at(1) else {
                    return Err("Only instances have fields.".to_string());
                };
                let value = self.peek(0);
                self.heap
                    .instance_mut(instance_ref)
                    .expect("instance")
                    .fields
                    .set(name, value);
                // Leave the assigned value as the expression result.
                let value = self.pop();
                self.pop();
                self.push(value);
            }
            OpCode::GetSuper => {
                let name = self.read_string();
                let superclass = self.pop().as_obj().expect("superclass on stack");
                self.bind_method(superclass, name)?;
            }

            OpCode::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a == b));
            }
            OpCode::Greater => {
                let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                self.push(Value::Bool(a > b));
            }
            OpCode::Less => {
                let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                self.push(Value::Bool(a < b));
            }
            OpCode::Add => match (self.peek(1), self.peek(0)) {
                (Value::Number(a), Value::Number(b)) => {
                    self.pop();
                    self.pop();
                    self.push(Value::Number(a + b));
                }
                (Value::Obj(a), Value::Obj(b))
                    if self.heap.as_interned(a).is_some() && self.heap.as_interned(b).is_some() =>
                {
                    self.concatenate(a, b);
                }
                _ => return Err("Operands must be two numbers or two strings.".to_string()),
            },
            OpCode::Subtract => {
                let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                self.push(Value::Number(a - b));
            }
            OpCode::Multiply => {
                let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                self.push(Value::Number(a * b));
            }
            OpCode::Divide => {
                let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                self.push(Value::Number(a / b));
            }
            OpCode::Not => {
                let value = self.pop();
                self.push(Value::Bool(value.is_falsey()));
            }
            OpCode::Negate => match self.peek(0) {
                Value::Number(n) => {
                    self.pop();
                    self.push(Value::Number(-n));
                }
                _ => return Err("Operand must be a number.".to_string()),
            },

            OpCode::Print => {
                let value = self.pop();
                let text = self.heap.format_value(value);
                writeln!(self.output, "{}", text).map_err(|e| format!("I/O error: {}", e))?;
            }

            OpCode::Jump => {
                let offset = self.read_u16() as usize;
                self.frame_mut().ip += offset;
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_u16() as usize;
                if self.peek(0).is_falsey() {
                    self.frame_mut().ip += offset;
                }
            }
            OpCode::Loop => {
                let offset = self.read_u16() as usize;
                self.frame_mut().ip -= offset;
            }

            OpCode::Call => {
                let argc = self.read_byte() as usize;
                let callee = self.peek(argc);
                self.call_value(callee, argc)?;
            }
            OpCode::Invoke => {
                let name = self.read_string();
                let argc = self.read_byte() as usize;
                self.invoke(name, argc)?;
            }
            OpCode::SuperInvoke => {
                let name = self.read_string();
                let argc = self.read_byte() as usize;
                let superclass = self.pop().as_obj().expect("superclass on stack");
                self.invoke_from_class(superclass, name, argc)?;
            }
            OpCode::Closure => {
                let function = self.read_constant().as_obj().expect("function constant");
                let upvalue_count = self.heap.function(function).upvalue_count;
                let mut upvalues = Vec::with_capacity(upvalue_count);
                for _ in 0..upvalue_count {
                    let is_local = self.read_byte() == 1;
                    let index = self.read_byte() as usize;
                    if is_local {
                        let base = self.frame().base;
                        upvalues.push(self.capture_upvalue(base + index));
                    } else {
                        let enclosing = self.frame().closure;
                        upvalues.push(self.heap.closure(enclosing).upvalues[index]);
                    }
                }
                let closure = self
                    .heap
                    .alloc(ObjKind::Closure(ObjClosure { function, upvalues }));
                self.push(Value::Obj(closure));
            }
            OpCode::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop();
            }
            OpCode::Return => {
                let result = self.pop();
                let frame = self.frames.pop().expect("call frame");
                self.close_upvalues(frame.base);
                if self.frames.is_empty() {
                    // Pop the script closure; execution is complete.
                    self.pop();
                    return Ok(Flow::Done);
                }
                self.stack.truncate(frame.base);
                self.push(result);
            }

            OpCode::Class => {
                let name = self.read_string();
                let class = self.heap.alloc(ObjKind::Class(ObjClass {
                    name,
                    methods: Table::new(),
                }));
                self.push(Value::Obj(class));
            }
            OpCode::Inherit => {
                let superclass = self.peek(1).as_obj().filter(|&r| self.is_class(r));
                let Some(superclass) = superclass else {
                    return Err("Superclass must be a class.".to_string());
                };
                let subclass = self.peek(0).as_obj().expect("subclass on stack");
                // Copy-down inheritance: the subclass starts with every
                // inherited method and overwrites as its own compile.
                let methods = self.heap.class(superclass).methods.clone();
                self.heap.class_mut(subclass).methods.add_all(&methods);
                self.pop();
            }
            OpCode::Method => {
                let name = self.read_string();
                let method = self.peek(0);
                let class = self.peek(1).as_obj().expect("class on stack");
                self.heap.class_mut(class).methods.set(name, method);
                self.pop();
            }
        }

        Ok(Flow::Continue)
    }

    // ========================================
    // Calls and method binding
    // ========================================

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), String> {
        let Some(r) = callee.as_obj() else {
            return Err("You can only call functions and classes.".to_string());
        };
        match &self.heap.get(r).kind {
            ObjKind::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                // The receiver takes the callee's slot: slot 0 of the
                // new frame, where method bodies expect 'this'.
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
            ObjKind::Class(_) => {
                let instance = self.heap.alloc(ObjKind::Instance(ObjInstance {
                    class: r,
                    fields: Table::new(),
                }));
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = Value::Obj(instance);
                match self.heap.class(r).methods.get(self.init_string) {
                    Some(Value::Obj(initializer)) => self.call_closure(initializer, argc),
                    Some(_) => unreachable!("method table holds closures"),
                    None if argc != 0 => Err(format!("Expected 0 arguments but got {}.", argc)),
                    None => Ok(()),
                }
            }
            ObjKind::Closure(_) => self.call_closure(r, argc),
            ObjKind::Native(native) => {
                let function = native.function;
                let arg_start = self.stack.len() - argc;
                let args: Vec<Value> = self.stack[arg_start..].to_vec();
                let result = function(self, &args)?;
                self.stack.truncate(arg_start - 1);
                self.push(result);
                Ok(())
            }
            _ => Err("You can only call functions and classes.".to_string()),
        }
    }

    fn call_closure(&mut self, closure: GcRef, argc: usize) -> Result<(), String> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if argc != arity {
            return Err(format!("Expected {} arguments, but got {}.", arity, argc));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    /// INVOKE fast path: method lookup and call without materializing
    /// a bound method. Fields shadow methods, so a callable field is
    /// dispatched as a plain call.
    fn invoke(&mut self, name: InternedStr, argc: usize) -> Result<(), String> {
        let Some(instance_ref) = self.instance_at(argc) else {
            return Err("Only instances have methods.".to_string());
        };
        let instance = self.heap.instance(instance_ref).expect("instance");
        if let Some(field) = instance.fields.get(name) {
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = field;
            return self.call_value(field, argc);
        }
        let class = instance.class;
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: GcRef,
        name: InternedStr,
        argc: usize,
    ) -> Result<(), String> {
        match self.heap.class(class).methods.get(name) {
            Some(Value::Obj(method)) => self.call_closure(method, argc),
            Some(_) => unreachable!("method table holds closures"),
            None => Err(format!(
                "Undefined property '{}'.",
                self.heap.str_value(name)
            )),
        }
    }

    /// Replace the receiver on top of the stack with a bound method
    /// for `name`, or report the property as undefined.
    fn bind_method(&mut self, class: GcRef, name: InternedStr) -> Result<(), String> {
        let Some(Value::Obj(method)) = self.heap.class(class).methods.get(name) else {
            return Err(format!(
                "Undefined property '{}'.",
                self.heap.str_value(name)
            ));
        };
        let receiver = self.peek(0);
        let bound = self
            .heap
            .alloc(ObjKind::BoundMethod(ObjBoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // ========================================
    // Upvalues
    // ========================================

    /// Find or create the upvalue for a stack slot. At most one open
    /// upvalue exists per slot; the list stays sorted by slot,
    /// highest first.
    fn capture_upvalue(&mut self, slot: usize) -> GcRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &r) in self.open_upvalues.iter().enumerate() {
            let ObjUpvalue::Open(existing) = *self.heap.upvalue(r) else {
                unreachable!("closed upvalue in open list");
            };
            if existing == slot {
                return r;
            }
            if existing < slot {
                insert_at = i;
                break;
            }
        }
        let upvalue = self.heap.alloc(ObjKind::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Close every open upvalue at or above `from`: copy the stack
    /// value into the upvalue and unlink it, because its slot is about
    /// to die.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&r) = self.open_upvalues.first() {
            let ObjUpvalue::Open(slot) = *self.heap.upvalue(r) else {
                unreachable!("closed upvalue in open list");
            };
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(r) = ObjUpvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // ========================================
    // Helpers
    // ========================================

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("call frame");
        let function = frame.function;
        let ip = frame.ip;
        frame.ip += 1;
        self.heap.function(function).chunk.code[ip]
    }

    /// Jump operands are 16-bit big-endian.
    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().expect("call frame");
        self.heap.function(frame.function).chunk.constants[index]
    }

    fn read_string(&mut self) -> InternedStr {
        let value = self.read_constant();
        let r = value.as_obj().expect("string constant");
        self.heap.as_interned(r).expect("string constant")
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    /// The instance at stack depth `distance`, if it is one.
    fn instance_at(&self, distance: usize) -> Option<GcRef> {
        self.peek(distance)
            .as_obj()
            .filter(|&r| self.heap.instance(r).is_some())
    }

    fn is_class(&self, r: GcRef) -> bool {
        matches!(&self.heap.get(r).kind, ObjKind::Class(_))
    }

    fn pop_numbers(&mut self, message: &str) -> Result<(f64, f64), String> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                Ok((a, b))
            }
            _ => Err(message.to_string()),
        }
    }

    /// ADD on two strings: build the combined buffer, then intern it.
    /// If an equal string already exists the buffer is dropped and the
    /// canonical object is reused.
    fn concatenate(&mut self, a: GcRef, b: GcRef) {
        let mut chars = self.heap.string(a).chars.clone();
        chars.push_str(&self.heap.string(b).chars);
        let key = self.heap.intern_owned(chars);
        self.pop();
        self.pop();
        self.push(Value::Obj(key.r));
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let key = self.heap.intern(name);
        let native = self.heap.alloc(ObjKind::Native(ObjNative { function }));
        self.globals.set(key, Value::Obj(native));
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    /// "RUNTIME ERROR: message" plus one stack-trace line per frame,
    /// innermost first.
    fn format_runtime_error(&self, message: &str) -> String {
        let mut report = format!("RUNTIME ERROR: {}", message);
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            // ip points one past the instruction that failed.
            let instruction = frame.ip.saturating_sub(1);
            let line = function.chunk.lines.get(instruction).copied().unwrap_or(0);
            match function.name {
                Some(name) => {
                    report.push_str(&format!(
                        "\n    [Line {}] in {}()",
                        line,
                        self.heap.str_value(name)
                    ));
                }
                None => report.push_str(&format!("\n    [Line {}] in script", line)),
            }
        }
        report
    }

    // ========================================
    // Garbage collection
    // ========================================

    /// Gather every root the interpreter can still reach and hand them
    /// to the heap: live stack slots, frame closures, open upvalues,
    /// the globals table, and the pinned "init" string. Functions being
    /// compiled are plain values owned by the compiler, not heap
    /// objects, so compilation contributes no roots.
    fn collect_garbage(&mut self) {
        let mut roots: Vec<Value> = self.stack.clone();
        roots.extend(self.frames.iter().map(|f| Value::Obj(f.closure)));
        roots.extend(self.open_upvalues.iter().map(|&r| Value::Obj(r)));
        for (key, value) in self.globals.iter() {
            roots.push(Value::Obj(key.r));
            roots.push(value);
        }
        roots.push(Value::Obj(self.init_string.r));
        self.heap.collect(&roots);
    }

    // ========================================
    // Debug output
    // ========================================

    fn trace_instruction(&self) {
        let mut stack_line = String::from("          ");
        for value in &self.stack {
            stack_line.push_str(&format!("[ {} ]", self.heap.format_value(*value)));
        }
        eprintln!("{}", stack_line);

        let frame = self.frame();
        let chunk = &self.heap.function(frame.function).chunk;
        let mut out = String::new();
        debug::disassemble_instruction(&self.heap, chunk, frame.ip, &mut out);
        eprint!("{}", out);
    }

    /// Disassemble a function and, recursively, every function nested
    /// in its constant pool.
    fn dump_code(&self, function: &ObjFunction) {
        let name = match function.name {
            Some(n) => self.heap.str_value(n).to_string(),
            None => "script".to_string(),
        };
        eprint!(
            "{}",
            debug::disassemble_chunk(&self.heap, &function.chunk, &name)
        );
        for constant in &function.chunk.constants {
            if let Some(r) = constant.as_obj() {
                if let ObjKind::Function(nested) = &self.heap.get(r).kind {
                    self.dump_code(nested);
                }
            }
        }
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in `clock()`: seconds since the interpreter started.
fn clock_native(vm: &VM, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.start_time.elapsed().as_secs_f64()))
}
