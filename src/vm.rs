//! The interpreter: value stack, call frames, opcode dispatch, allocation,
//! and the module loader. This is the core the rest of the crate exists to
//! support.

use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::trace;

use crate::call_frame::CallFrame;
use crate::chunk::OpCode;
use crate::compiler;
use crate::errors::RuntimeError;
use crate::natives;
use crate::object::{self, Obj, ObjType};
use crate::objects::bound::{ObjBoundMethod, ObjBoundNative};
use crate::objects::class::{ObjClass, ObjInstance};
use crate::objects::closure::ObjClosure;
use crate::objects::function::ObjFunction;
use crate::objects::list::ObjList;
use crate::objects::map::ObjMap;
use crate::objects::module::ObjModule;
use crate::objects::native::{NativeFn, ObjNative};
use crate::objects::string::ObjString;
use crate::objects::upvalue::ObjUpvalue;
use crate::table::Table;
use crate::value::{format_number, Value};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

pub struct Vm {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) globals: Table,
    pub(crate) strings: Table,
    pub(crate) modules: Table,
    pub(crate) open_upvalues: *mut ObjUpvalue,
    pub(crate) objects: *mut Obj,
    pub(crate) bytes_allocated: usize,
    pub(crate) next_gc: usize,
    pub(crate) init_string: *mut ObjString,
    pub(crate) temp_roots: Vec<Value>,
    /// Roots the in-progress `ObjFunction` of every `Compiler` currently on
    /// the parser's stack, mirroring clox's `markCompilerRoots` — without
    /// it, a function mid-compile with no other reference could be
    /// collected by a GC cycle triggered from an allocation elsewhere in
    /// the same expression (e.g. a large string constant).
    pub(crate) compiling_functions: Vec<*mut ObjFunction>,
    pub(crate) string_class: *mut ObjClass,
    pub(crate) number_class: *mut ObjClass,
    pub(crate) list_class: *mut ObjClass,
    pub(crate) map_class: *mut ObjClass,
    pub(crate) test_mode: bool,
    pub(crate) test_failures: Option<*mut ObjList>,
    pub(crate) current_test_name: Option<*mut ObjString>,
    start_time: Instant,
    /// Sink for `print` statements. `None` writes to real stdout; tests
    /// install a buffer here to assert on exact program output.
    output: Option<Arc<Mutex<Vec<u8>>>>,
}

impl Vm {
    pub fn new() -> Vm {
        let mut vm = Vm {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            strings: Table::new(),
            modules: Table::new(),
            open_upvalues: std::ptr::null_mut(),
            objects: std::ptr::null_mut(),
            bytes_allocated: 0,
            next_gc: 1024 * 1024,
            init_string: std::ptr::null_mut(),
            temp_roots: Vec::new(),
            compiling_functions: Vec::new(),
            string_class: std::ptr::null_mut(),
            number_class: std::ptr::null_mut(),
            list_class: std::ptr::null_mut(),
            map_class: std::ptr::null_mut(),
            test_mode: false,
            test_failures: None,
            current_test_name: None,
            start_time: Instant::now(),
            output: None,
        };
        vm.init_string = vm.intern("init");
        natives::register(&mut vm);
        vm
    }

    /// Redirects `print` output to `sink` instead of stdout.
    pub fn set_output(&mut self, sink: Arc<Mutex<Vec<u8>>>) {
        self.output = Some(sink);
    }

    fn write_output(&self, text: &str) {
        if let Some(sink) = &self.output {
            let mut buf = sink.lock().unwrap();
            let _ = writeln!(buf, "{text}");
        } else {
            println!("{text}");
        }
    }

    // ---- stack ----

    /// Panics rather than letting the backing `Vec` grow past `STACK_MAX`:
    /// `open_upvalues` hold raw pointers into `self.stack`'s buffer, and a
    /// reallocation there would dangle every one of them. Reserving
    /// `STACK_MAX` up front in `Vm::new` means this is only ever hit by
    /// pathological bytecode (the frame-depth check in `call` already
    /// rejects the common case, unbounded recursion, with a catchable
    /// `RuntimeError::StackOverflow`).
    pub fn push(&mut self, value: Value) {
        assert!(self.stack.len() < STACK_MAX, "value stack overflow");
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    pub fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = std::ptr::null_mut();
    }

    // ---- allocation ----

    fn track<T>(&mut self, value: T, obj_type: ObjType) -> *mut T {
        let _ = obj_type;
        // The threshold check runs *before* this object exists, mirroring
        // clox's `reallocate`: a GC triggered here can never see (and so
        // can never sweep) the object being allocated, since it isn't
        // linked into `self.objects` yet.
        if self.bytes_allocated > self.next_gc {
            crate::gc::collect_garbage(self);
        }
        let boxed = Box::into_raw(Box::new(value));
        let obj_ptr = boxed as *mut Obj;
        unsafe {
            (*obj_ptr).next.set(self.objects);
        }
        self.objects = obj_ptr;
        self.bytes_allocated += unsafe { object::deep_size(obj_ptr) };
        boxed
    }

    /// Interns `text`, returning the canonical `ObjString`. Equal byte
    /// content always yields the same pointer.
    pub fn intern(&mut self, text: &str) -> *mut ObjString {
        let hash = crate::objects::string::fnv1a(text.as_bytes());
        if let Some(existing) = self.strings.find_string(text, hash) {
            return existing;
        }
        let ptr = self.track(ObjString::new(text.into()), ObjType::String);
        self.push(Value::Obj(ptr as *mut Obj));
        self.strings.set(ptr, Value::Nil);
        self.pop();
        ptr
    }

    pub fn alloc_function(&mut self, name: Option<*mut ObjString>) -> *mut ObjFunction {
        self.track(ObjFunction::new(name), ObjType::Function)
    }

    pub fn alloc_closure(&mut self, function: *mut ObjFunction, module: Option<*mut ObjModule>) -> *mut ObjClosure {
        self.track(ObjClosure::new(function, module), ObjType::Closure)
    }

    pub fn alloc_upvalue(&mut self, location: *mut Value) -> *mut ObjUpvalue {
        self.track(ObjUpvalue::new(location), ObjType::Upvalue)
    }

    pub fn alloc_native(&mut self, name: *mut ObjString, arity: i32, function: NativeFn) -> *mut ObjNative {
        self.track(ObjNative::new(name, arity, function), ObjType::Native)
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: *mut ObjClosure) -> *mut ObjBoundMethod {
        self.track(ObjBoundMethod::new(receiver, method), ObjType::BoundMethod)
    }

    pub fn alloc_bound_native(&mut self, receiver: Value, method: *mut ObjNative) -> *mut ObjBoundNative {
        self.track(ObjBoundNative::new(receiver, method), ObjType::BoundNative)
    }

    pub fn alloc_class(&mut self, name: *mut ObjString) -> *mut ObjClass {
        self.track(ObjClass::new(name), ObjType::Class)
    }

    pub fn alloc_instance(&mut self, class: *mut ObjClass) -> *mut ObjInstance {
        self.track(ObjInstance::new(class), ObjType::Instance)
    }

    pub fn alloc_list(&mut self, items: Vec<Value>) -> *mut ObjList {
        self.track(ObjList::from_values(items), ObjType::List)
    }

    pub fn alloc_map(&mut self) -> *mut ObjMap {
        self.track(ObjMap::new(), ObjType::Map)
    }

    pub fn alloc_module(&mut self, name: *mut ObjString) -> *mut ObjModule {
        self.track(ObjModule::new(name), ObjType::Module)
    }

    /// Seconds since the VM started, backing the `clock()` native.
    pub(crate) fn elapsed_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn define_native(&mut self, name: &str, arity: i32, function: NativeFn) {
        let name_ptr = self.intern(name);
        let native_ptr = self.alloc_native(name_ptr, arity, function);
        self.globals.set(name_ptr, Value::Obj(native_ptr as *mut Obj));
    }

    pub fn define_primitive(&mut self, class: *mut ObjClass, name: &str, arity: i32, function: NativeFn) {
        let name_ptr = self.intern(name);
        let native_ptr = self.alloc_native(name_ptr, arity, function);
        unsafe {
            (*class).methods.set(name_ptr, Value::Obj(native_ptr as *mut Obj));
        }
    }

    // ---- entry point ----

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = match compiler::compile(source, self) {
            Some(f) => f,
            None => return InterpretResult::CompileError,
        };

        self.push(Value::Obj(function as *mut Obj));
        let closure = self.alloc_closure(function, None);
        self.pop();
        self.push(Value::Obj(closure as *mut Obj));
        self.frames.push(CallFrame::new(closure, 0));

        match self.run(0) {
            Ok(()) => InterpretResult::Ok,
            Err(err) => {
                self.report_runtime_error(&err);
                self.reset_stack();
                InterpretResult::RuntimeError
            }
        }
    }

    /// Used by higher-order natives to call back into bytecode. Pushes
    /// `callee` and `args`, calls, runs until the new frame returns, then
    /// hands back the produced value.
    pub fn call_reentrant(&mut self, callee: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let initial = self.frames.len();
        self.push(callee);
        for arg in args {
            self.push(*arg);
        }
        self.call_value(callee, args.len() as u8)?;
        // A native (or an init-less class) never pushes a frame, so its
        // result is already sitting on the stack — entering `run` in that
        // case would execute the *caller's* subsequent bytecode instead of
        // returning, since no `OP_RETURN` will ever drop the frame count
        // back to `initial`.
        if self.frames.len() > initial {
            self.run(initial)?;
        }
        Ok(self.pop())
    }

    fn report_runtime_error(&mut self, err: &RuntimeError) {
        eprintln!("{err}");
        for frame in self.frames.iter().rev() {
            let function = unsafe { &*frame.function() };
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            match function.name_str() {
                Some(name) => eprintln!("[line {line}] in {name}"),
                None => eprintln!("[line {line}] in script"),
            }
        }
    }

    // ---- bytecode cursor helpers ----

    fn current_frame_index(&self) -> usize {
        self.frames.len() - 1
    }

    fn read_byte(&mut self) -> u8 {
        let idx = self.current_frame_index();
        let frame = &mut self.frames[idx];
        let function = unsafe { &(*frame.function()) };
        let byte = function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        ((high as u16) << 8) | low as u16
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let idx = self.current_frame_index();
        let function = unsafe { &(*self.frames[idx].function()) };
        function.chunk.constants[index]
    }

    fn read_constant_long(&mut self) -> Value {
        let b0 = self.read_byte() as usize;
        let b1 = self.read_byte() as usize;
        let b2 = self.read_byte() as usize;
        let index = b0 | (b1 << 8) | (b2 << 16);
        let idx = self.current_frame_index();
        let function = unsafe { &(*self.frames[idx].function()) };
        function.chunk.constants[index]
    }

    fn read_string(&mut self) -> *mut ObjString {
        match self.read_constant() {
            Value::Obj(ptr) => unsafe { object::as_string(ptr) },
            _ => unreachable!("constant is not a string"),
        }
    }

    fn frame_base(&self) -> usize {
        self.frames[self.current_frame_index()].slots_base
    }

    /// The globals table currently in scope for the executing frame: the
    /// owning module's table if the closure belongs to one, else the
    /// script-level table. A per-frame lookup rather than swapping
    /// `vm.globals` in and out while a module loads.
    fn active_globals(&mut self) -> &mut Table {
        let idx = self.current_frame_index();
        let closure = self.frames[idx].closure;
        match unsafe { (*closure).module } {
            Some(module) => unsafe { &mut (*module).globals },
            None => &mut self.globals,
        }
    }

    fn current_module(&self) -> Option<*mut ObjModule> {
        let idx = self.current_frame_index();
        unsafe { (*self.frames[idx].closure).module }
    }

    // ---- interpreter loop ----

    fn run(&mut self, initial_frame_count: usize) -> Result<(), RuntimeError> {
        loop {
            #[cfg(feature = "debug_trace_execution")]
            self.trace_frame();

            let instruction = OpCode::from_byte(self.read_byte());
            match instruction {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::ConstantLong => {
                    let value = self.read_constant_long();
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
                    let base = self.frame_base();
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame_base();
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let name_str = unsafe { (*name).as_str().to_string() };
                    match self.active_globals().get(name) {
                        Some(value) => self.push(value),
                        None => return Err(RuntimeError::UndefinedVariable(name_str)),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.pop();
                    self.active_globals().set(name, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let name_str = unsafe { (*name).as_str().to_string() };
                    let value = self.peek(0);
                    if self.active_globals().set(name, value) {
                        self.active_globals().delete(name);
                        return Err(RuntimeError::UndefinedVariable(name_str));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let idx = self.current_frame_index();
                    let closure = self.frames[idx].closure;
                    let upvalue = unsafe { (*closure).upvalues[slot] };
                    self.push(unsafe { *(*upvalue).location });
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let idx = self.current_frame_index();
                    let closure = self.frames[idx].closure;
                    let upvalue = unsafe { (*closure).upvalues[slot] };
                    let value = self.peek(0);
                    unsafe { *(*upvalue).location = value };
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    self.get_property(name)?;
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    self.set_property(name)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop();
                    let class = match superclass {
                        Value::Obj(ptr) => unsafe { object::as_class(ptr) },
                        _ => unreachable!("superclass operand is not a class"),
                    };
                    self.bind_method(class, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.numeric_compare(|a, b| a > b)?,
                OpCode::Less => self.numeric_compare(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.numeric_binary(|a, b| a - b)?,
                OpCode::Multiply => self.numeric_binary(|a, b| a * b)?,
                OpCode::Divide => self.numeric_binary(|a, b| a / b)?,
                OpCode::Modulo => self.numeric_binary(|a, b| a % b)?,
                OpCode::Negate => {
                    let value = self.peek(0);
                    match value {
                        Value::Number(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        _ => return Err(RuntimeError::OperandMustBeNumber),
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Print => {
                    let value = self.pop();
                    let text = self.stringify(&value);
                    self.write_output(&text);
                }
                OpCode::Jump => {
                    let offset = self.read_short();
                    let idx = self.current_frame_index();
                    self.frames[idx].ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short();
                    if self.peek(0).is_falsey() {
                        let idx = self.current_frame_index();
                        self.frames[idx].ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short();
                    let idx = self.current_frame_index();
                    self.frames[idx].ip -= offset as usize;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte();
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte();
                    let superclass = self.pop();
                    let class = match superclass {
                        Value::Obj(ptr) => unsafe { object::as_class(ptr) },
                        _ => unreachable!("superclass operand is not a class"),
                    };
                    self.invoke_from_class(class, name, arg_count)?;
                }
                OpCode::Closure => {
                    let value = self.read_constant();
                    let function = match value {
                        Value::Obj(ptr) => unsafe { object::as_function(ptr) },
                        _ => unreachable!("closure constant is not a function"),
                    };
                    let module = self.current_module();
                    let closure = self.alloc_closure(function, module);
                    self.push(Value::Obj(closure as *mut Obj));
                    let upvalue_count = unsafe { (*function).upvalue_count };
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue_ptr = if is_local {
                            let base = self.frame_base();
                            self.capture_upvalue(base + index)
                        } else {
                            let idx = self.current_frame_index();
                            let caller_closure = self.frames[idx].closure;
                            unsafe { (*caller_closure).upvalues[index] }
                        };
                        unsafe { (*closure).upvalues.push(upvalue_ptr) };
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let base = self.frame_base();
                    self.close_upvalues(base);
                    self.stack.truncate(base);
                    self.frames.pop();
                    self.push(result);
                    if self.frames.len() == initial_frame_count {
                        return Ok(());
                    }
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.alloc_class(name);
                    self.push(Value::Obj(class as *mut Obj));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let superclass_class = match superclass {
                        Value::Obj(ptr) if unsafe { (*ptr).obj_type } == ObjType::Class => unsafe { object::as_class(ptr) },
                        _ => return Err(RuntimeError::SuperclassMustBeClass),
                    };
                    let subclass = match self.peek(0) {
                        Value::Obj(ptr) => unsafe { object::as_class(ptr) },
                        _ => unreachable!("subclass operand is not a class"),
                    };
                    let methods = unsafe { (*superclass_class).methods.iter().collect::<Vec<_>>() };
                    for (key, value) in methods {
                        unsafe { (*subclass).methods.set(key, value) };
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    self.define_method(name);
                }
                OpCode::BuildList => {
                    // Allocate the (empty) list and root it on the stack
                    // *before* touching the operands: they're still on the
                    // stack below it (and so still reachable from the root
                    // set) for the whole append loop, only coming off after
                    // the list itself no longer depends on a fresh
                    // allocation to stay alive.
                    let count = self.read_byte() as usize;
                    let list = self.alloc_list(Vec::new());
                    self.push(Value::Obj(list as *mut Obj));
                    for i in (1..=count).rev() {
                        let item = self.peek(i);
                        unsafe { (*list).items.push(item) };
                    }
                    self.pop();
                    self.stack.truncate(self.stack.len() - count);
                    self.push(Value::Obj(list as *mut Obj));
                }
                OpCode::BuildMap => {
                    // Same rooting discipline as OP_BUILD_LIST: the map is
                    // allocated and pushed first, and every key/value pair
                    // read via `peek` while still sitting on the stack.
                    let pair_count = self.read_byte() as usize;
                    let map = self.alloc_map();
                    self.push(Value::Obj(map as *mut Obj));
                    for i in (1..=pair_count).rev() {
                        let key_value = self.peek(2 * i);
                        let value = self.peek(2 * i - 1);
                        let key = match key_value {
                            Value::Obj(ptr) if unsafe { (*ptr).obj_type } == ObjType::String => unsafe { object::as_string(ptr) },
                            _ => return Err(RuntimeError::KeyMustBeString),
                        };
                        unsafe { (*map).set(key, value) };
                    }
                    self.pop();
                    self.stack.truncate(self.stack.len() - pair_count * 2);
                    self.push(Value::Obj(map as *mut Obj));
                }
                OpCode::Index => self.index_get()?,
                OpCode::Store => self.index_set()?,
                OpCode::Import => {
                    let path = self.read_string();
                    let module = self.load_module(path)?;
                    let exports: Vec<_> = unsafe { (*module).exports.iter().collect() };
                    for (key, value) in exports {
                        self.active_globals().set(key, value);
                    }
                }
                OpCode::ImportFrom => {
                    let path = self.read_string();
                    let name = self.read_string();
                    let module = self.load_module(path)?;
                    let value = unsafe { (*module).exports.get(name) };
                    match value {
                        Some(value) => {
                            self.active_globals().set(name, value);
                        }
                        None => {
                            let name_str = unsafe { (*name).as_str().to_string() };
                            return Err(RuntimeError::UndefinedProperty(name_str));
                        }
                    }
                }
                OpCode::Export => {
                    let name = self.read_string();
                    let value = match self.active_globals().get(name) {
                        Some(value) => value,
                        None => {
                            let name_str = unsafe { (*name).as_str().to_string() };
                            return Err(RuntimeError::UndefinedVariable(name_str));
                        }
                    };
                    match self.current_module() {
                        Some(module) => {
                            unsafe { (*module).exports.set(name, value) };
                        }
                        None => return Err(RuntimeError::Other("Can only export from a module.".to_string())),
                    }
                }
            }
        }
    }

    #[cfg(feature = "debug_trace_execution")]
    fn trace_frame(&self) {
        let idx = self.current_frame_index();
        let frame = &self.frames[idx];
        let function = unsafe { &*frame.function() };
        trace!(ip = frame.ip, stack_depth = self.stack.len(), "{}", crate::debug::disassemble_instruction(&function.chunk, frame.ip).0);
    }

    fn numeric_binary(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_number_pair()?;
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn numeric_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_number_pair()?;
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    fn pop_number_pair(&mut self) -> Result<(f64, f64), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => Ok((a, b)),
            _ => Err(RuntimeError::OperandsMustBeNumbers),
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(x + y));
            }
            (a, b) if a.is_obj() && unsafe { (*a.as_obj()).obj_type } == ObjType::String
                || b.is_obj() && unsafe { (*b.as_obj()).obj_type } == ObjType::String =>
            {
                self.pop();
                self.pop();
                let left = self.stringify(&a);
                let right = self.stringify(&b);
                let combined = format!("{left}{right}");
                let ptr = self.intern(&combined);
                self.push(Value::Obj(ptr as *mut Obj));
            }
            _ => return Err(RuntimeError::AddOperandMismatch),
        }
        Ok(())
    }

    pub fn stringify(&self, value: &Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Error => "error".to_string(),
            Value::Obj(ptr) => unsafe {
                match (**ptr).obj_type {
                    ObjType::String => (*object::as_string(*ptr)).as_str().to_string(),
                    ObjType::Function => match (*object::as_function(*ptr)).name_str() {
                        Some(name) => format!("<fn {name}>"),
                        None => "<script>".to_string(),
                    },
                    ObjType::Closure => match (*(*object::as_closure(*ptr)).function).name_str() {
                        Some(name) => format!("<fn {name}>"),
                        None => "<script>".to_string(),
                    },
                    ObjType::Native => "<native fn>".to_string(),
                    ObjType::BoundMethod | ObjType::BoundNative => "<bound method>".to_string(),
                    ObjType::Class => format!("<class {}>", (*object::as_class(*ptr)).name_str_unchecked()),
                    ObjType::Instance => format!("<instance {}>", (*(*object::as_instance(*ptr)).class).name_str_unchecked()),
                    ObjType::List => {
                        let list = &*object::as_list(*ptr);
                        let parts: Vec<String> = list.items.iter().map(|v| self.stringify(v)).collect();
                        format!("[{}]", parts.join(", "))
                    }
                    ObjType::Map => "<map>".to_string(),
                    ObjType::Module => format!("<module {}>", (*(*object::as_module(*ptr)).name).as_str()),
                    ObjType::Upvalue => "<upvalue>".to_string(),
                }
            },
        }
    }

    fn get_property(&mut self, name: *mut ObjString) -> Result<(), RuntimeError> {
        let receiver = self.peek(0);
        match receiver {
            Value::Obj(ptr) => match unsafe { (*ptr).obj_type } {
                ObjType::Instance => {
                    let instance = unsafe { &*object::as_instance(ptr) };
                    if let Some(value) = instance.get(name) {
                        self.pop();
                        self.push(value);
                        return Ok(());
                    }
                    let class = instance.class;
                    self.bind_method(class, name)
                }
                ObjType::String => self.bind_native(self.string_class, receiver, name),
                ObjType::List => self.bind_native(self.list_class, receiver, name),
                ObjType::Map => self.bind_native(self.map_class, receiver, name),
                ObjType::Module => {
                    let module = unsafe { &*object::as_module(ptr) };
                    match module.exports.get(name) {
                        Some(value) => {
                            self.pop();
                            self.push(value);
                            Ok(())
                        }
                        None => Err(RuntimeError::UndefinedProperty(unsafe { (*name).as_str().to_string() })),
                    }
                }
                _ => Err(RuntimeError::NotAnInstance),
            },
            Value::Number(_) => self.bind_native(self.number_class, receiver, name),
            _ => Err(RuntimeError::NotAnInstance),
        }
    }

    fn set_property(&mut self, name: *mut ObjString) -> Result<(), RuntimeError> {
        let receiver = self.peek(1);
        let instance_ptr = match receiver {
            Value::Obj(ptr) if unsafe { (*ptr).obj_type } == ObjType::Instance => unsafe { object::as_instance(ptr) },
            _ => return Err(RuntimeError::NotAnInstance),
        };
        let value = self.pop();
        unsafe { (*instance_ptr).set(name, value) };
        self.pop();
        self.push(value);
        Ok(())
    }

    fn bind_method(&mut self, class: *mut ObjClass, name: *mut ObjString) -> Result<(), RuntimeError> {
        let method = unsafe { (*class).methods.get(name) };
        match method {
            Some(Value::Obj(ptr)) => {
                let closure = unsafe { object::as_closure(ptr) };
                let receiver = self.pop();
                let bound = self.alloc_bound_method(receiver, closure);
                self.push(Value::Obj(bound as *mut Obj));
                Ok(())
            }
            _ => Err(RuntimeError::UndefinedMethod(unsafe { (*name).as_str().to_string() })),
        }
    }

    fn bind_native(&mut self, class: *mut ObjClass, receiver: Value, name: *mut ObjString) -> Result<(), RuntimeError> {
        let method = unsafe { (*class).methods.get(name) };
        match method {
            Some(Value::Obj(ptr)) => {
                let native = unsafe { object::as_native(ptr) };
                self.pop();
                let bound = self.alloc_bound_native(receiver, native);
                self.push(Value::Obj(bound as *mut Obj));
                Ok(())
            }
            _ => Err(RuntimeError::UndefinedMethod(unsafe { (*name).as_str().to_string() })),
        }
    }

    fn define_method(&mut self, name: *mut ObjString) {
        let method = self.peek(0);
        let class = match self.peek(1) {
            Value::Obj(ptr) => unsafe { object::as_class(ptr) },
            _ => unreachable!("method target is not a class"),
        };
        unsafe { (*class).methods.set(name, method) };
        self.pop();
    }

    fn index_get(&mut self) -> Result<(), RuntimeError> {
        let index = self.pop();
        let container = self.pop();
        match container {
            Value::Obj(ptr) if unsafe { (*ptr).obj_type } == ObjType::List => {
                let list = unsafe { &*object::as_list(ptr) };
                let i = match index {
                    Value::Number(n) => n,
                    _ => return Err(RuntimeError::IndexMustBeNumber),
                };
                let i = i as i64;
                if i < 0 || i as usize >= list.items.len() {
                    return Err(RuntimeError::IndexOutOfRange);
                }
                self.push(list.items[i as usize]);
                Ok(())
            }
            Value::Obj(ptr) if unsafe { (*ptr).obj_type } == ObjType::Map => {
                let map = unsafe { &*object::as_map(ptr) };
                let key = match index {
                    Value::Obj(key_ptr) if unsafe { (*key_ptr).obj_type } == ObjType::String => unsafe { object::as_string(key_ptr) },
                    _ => return Err(RuntimeError::KeyMustBeString),
                };
                self.push(map.get(key).unwrap_or(Value::Nil));
                Ok(())
            }
            _ => Err(RuntimeError::NotIndexable),
        }
    }

    fn index_set(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop();
        let index = self.pop();
        let container = self.pop();
        match container {
            Value::Obj(ptr) if unsafe { (*ptr).obj_type } == ObjType::List => {
                let list = unsafe { &mut *object::as_list(ptr) };
                let i = match index {
                    Value::Number(n) => n,
                    _ => return Err(RuntimeError::IndexMustBeNumber),
                };
                let i = i as i64;
                if i < 0 || i as usize >= list.items.len() {
                    return Err(RuntimeError::IndexOutOfRange);
                }
                list.items[i as usize] = value;
                self.push(value);
                Ok(())
            }
            Value::Obj(ptr) if unsafe { (*ptr).obj_type } == ObjType::Map => {
                let map = unsafe { &mut *object::as_map(ptr) };
                let key = match index {
                    Value::Obj(key_ptr) if unsafe { (*key_ptr).obj_type } == ObjType::String => unsafe { object::as_string(key_ptr) },
                    _ => return Err(RuntimeError::KeyMustBeString),
                };
                map.set(key, value);
                self.push(value);
                Ok(())
            }
            _ => Err(RuntimeError::NotIndexable),
        }
    }

    // ---- calling ----

    pub(crate) fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        match callee {
            Value::Obj(ptr) => match unsafe { (*ptr).obj_type } {
                ObjType::Closure => self.call(unsafe { object::as_closure(ptr) }, arg_count),
                ObjType::BoundMethod => {
                    let bound = unsafe { &*object::as_bound_method(ptr) };
                    let slot = self.stack.len() - arg_count as usize - 1;
                    self.stack[slot] = bound.receiver;
                    self.call(bound.method, arg_count)
                }
                ObjType::BoundNative => {
                    let bound = unsafe { &*object::as_bound_native(ptr) };
                    let slot = self.stack.len() - arg_count as usize - 1;
                    self.stack[slot] = bound.receiver;
                    self.call_native(bound.method, arg_count as usize + 1)
                }
                ObjType::Native => self.call_native(unsafe { object::as_native(ptr) }, arg_count as usize),
                ObjType::Class => self.instantiate(unsafe { object::as_class(ptr) }, arg_count),
                _ => Err(RuntimeError::NotCallable),
            },
            _ => Err(RuntimeError::NotCallable),
        }
    }

    fn call_native(&mut self, native_ptr: *mut ObjNative, total_args: usize) -> Result<(), RuntimeError> {
        let native = unsafe { &*native_ptr };
        let arity = native.arity;
        if arity >= 0 && total_args != arity as usize {
            return Err(RuntimeError::ArityMismatch { expected: arity as usize, got: total_args });
        }
        let base = self.stack.len() - total_args;
        let args: Vec<Value> = self.stack[base..].to_vec();
        let result = (native.function)(self, &args).map_err(RuntimeError::Other)?;
        self.stack.truncate(base - 1);
        self.push(result);
        Ok(())
    }

    fn call(&mut self, closure: *mut ObjClosure, arg_count: u8) -> Result<(), RuntimeError> {
        let function = unsafe { &*(*closure).function };
        if arg_count as usize != function.arity as usize {
            return Err(RuntimeError::ArityMismatch { expected: function.arity as usize, got: arg_count as usize });
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(RuntimeError::StackOverflow);
        }
        let base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame::new(closure, base));
        Ok(())
    }

    fn instantiate(&mut self, class: *mut ObjClass, arg_count: u8) -> Result<(), RuntimeError> {
        let instance = self.alloc_instance(class);
        let slot = self.stack.len() - arg_count as usize - 1;
        self.stack[slot] = Value::Obj(instance as *mut Obj);
        let init = unsafe { (*class).methods.get(self.init_string) };
        match init {
            Some(Value::Obj(ptr)) => {
                let closure = unsafe { object::as_closure(ptr) };
                self.call(closure, arg_count)
            }
            _ => {
                if arg_count != 0 {
                    return Err(RuntimeError::ArityMismatch { expected: 0, got: arg_count as usize });
                }
                Ok(())
            }
        }
    }

    fn invoke(&mut self, name: *mut ObjString, arg_count: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count as usize);
        match receiver {
            Value::Obj(ptr) => match unsafe { (*ptr).obj_type } {
                ObjType::Instance => {
                    let instance = unsafe { &*object::as_instance(ptr) };
                    if let Some(value) = instance.get(name) {
                        let slot = self.stack.len() - arg_count as usize - 1;
                        self.stack[slot] = value;
                        return self.call_value(value, arg_count);
                    }
                    self.invoke_from_class(instance.class, name, arg_count)
                }
                ObjType::String => self.invoke_primitive(self.string_class, arg_count, name),
                ObjType::List => self.invoke_primitive(self.list_class, arg_count, name),
                ObjType::Map => self.invoke_primitive(self.map_class, arg_count, name),
                ObjType::Module => {
                    let module = unsafe { &*object::as_module(ptr) };
                    let value = module
                        .exports
                        .get(name)
                        .ok_or_else(|| RuntimeError::UndefinedProperty(unsafe { (*name).as_str().to_string() }))?;
                    let slot = self.stack.len() - arg_count as usize - 1;
                    self.stack[slot] = value;
                    self.call_value(value, arg_count)
                }
                _ => Err(RuntimeError::NotAnInstance),
            },
            Value::Number(_) => self.invoke_primitive(self.number_class, arg_count, name),
            _ => Err(RuntimeError::NotAnInstance),
        }
    }

    fn invoke_from_class(&mut self, class: *mut ObjClass, name: *mut ObjString, arg_count: u8) -> Result<(), RuntimeError> {
        let method = unsafe { (*class).methods.get(name) };
        match method {
            Some(Value::Obj(ptr)) => self.call(unsafe { object::as_closure(ptr) }, arg_count),
            _ => Err(RuntimeError::UndefinedMethod(unsafe { (*name).as_str().to_string() })),
        }
    }

    fn invoke_primitive(&mut self, class: *mut ObjClass, arg_count: u8, name: *mut ObjString) -> Result<(), RuntimeError> {
        let method = unsafe { (*class).methods.get(name) };
        match method {
            Some(Value::Obj(ptr)) => self.call_native(unsafe { object::as_native(ptr) }, arg_count as usize + 1),
            _ => Err(RuntimeError::UndefinedMethod(unsafe { (*name).as_str().to_string() })),
        }
    }

    // ---- upvalues ----

    fn capture_upvalue(&mut self, stack_index: usize) -> *mut ObjUpvalue {
        let mut prev: *mut ObjUpvalue = std::ptr::null_mut();
        let mut current = self.open_upvalues;
        while !current.is_null() {
            let current_index = self.slot_index_of(unsafe { (*current).location });
            if current_index <= stack_index {
                break;
            }
            prev = current;
            current = unsafe { (*current).next_open };
        }

        if !current.is_null() && self.slot_index_of(unsafe { (*current).location }) == stack_index {
            return current;
        }

        let location = &mut self.stack[stack_index] as *mut Value;
        let created = self.alloc_upvalue(location);
        unsafe { (*created).next_open = current };

        if prev.is_null() {
            self.open_upvalues = created;
        } else {
            unsafe { (*prev).next_open = created };
        }
        created
    }

    fn slot_index_of(&self, location: *mut Value) -> usize {
        let base = self.stack.as_ptr() as usize;
        let addr = location as usize;
        (addr - base) / std::mem::size_of::<Value>()
    }

    fn close_upvalues(&mut self, from_index: usize) {
        while !self.open_upvalues.is_null() {
            let index = self.slot_index_of(unsafe { (*self.open_upvalues).location });
            if index < from_index {
                break;
            }
            let upvalue = self.open_upvalues;
            unsafe {
                (*upvalue).close();
            }
            self.open_upvalues = unsafe { (*upvalue).next_open };
        }
    }

    // ---- modules ----

    fn load_module(&mut self, path: *mut ObjString) -> Result<*mut ObjModule, RuntimeError> {
        if let Some(Value::Obj(ptr)) = self.modules.get(path) {
            return Ok(unsafe { object::as_module(ptr) });
        }

        let path_str = unsafe { (*path).as_str().to_string() };
        let source = std::fs::read_to_string(format!("{path_str}.cmel"))
            .map_err(|e| RuntimeError::ModuleLoad(path_str.clone(), e.to_string()))?;

        let module = self.alloc_module(path);
        self.push(Value::Obj(module as *mut Obj));
        let caller_globals_snapshot: Vec<_> = self.globals.iter().collect();
        for (key, value) in caller_globals_snapshot {
            if let Value::Obj(ptr) = value {
                let obj_type = unsafe { (*ptr).obj_type };
                if obj_type == ObjType::Native || obj_type == ObjType::Class {
                    unsafe { (*module).globals.set(key, value) };
                }
            }
        }

        let function = compiler::compile(&source, self)
            .ok_or_else(|| RuntimeError::ModuleLoad(path_str.clone(), "compile error".to_string()))?;
        self.push(Value::Obj(function as *mut Obj));
        let closure = self.alloc_closure(function, Some(module));
        self.pop();
        self.pop();
        self.push(Value::Obj(closure as *mut Obj));

        let initial = self.frames.len();
        self.call_value(Value::Obj(closure as *mut Obj), 0)?;
        self.run(initial)?;
        self.pop();

        self.modules.set(path, Value::Obj(module as *mut Obj));
        Ok(module)
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_and_print() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("print 1 + 2;"), InterpretResult::Ok);
    }

    #[test]
    fn string_and_number_concat() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("var s = \"hi\"; print s + \" \" + 2;"), InterpretResult::Ok);
    }

    #[test]
    fn class_instance_and_methods() {
        let mut vm = Vm::new();
        let source = "class A { init(x){ this.x = x; } get(){ return this.x; } } print A(7).get();";
        assert_eq!(vm.interpret(source), InterpretResult::Ok);
    }

    #[test]
    fn inheritance_and_super() {
        let mut vm = Vm::new();
        let source = "class A { get(){ return 4; } } class B < A { get(){ return super.get() + 1; } } print B().get();";
        assert_eq!(vm.interpret(source), InterpretResult::Ok);
    }

    #[test]
    fn closures_share_upvalues() {
        let mut vm = Vm::new();
        let source = "fun make(){ var i = 0; fun inc(){ i = i + 1; return i; } return inc; } var f = make(); print f(); print f();";
        assert_eq!(vm.interpret(source), InterpretResult::Ok);
    }

    #[test]
    fn type_error_on_bad_add() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("print 1 + true;"), InterpretResult::RuntimeError);
    }

    #[test]
    fn list_build_and_index() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("var xs = [1,2,3]; print xs[1];"), InterpretResult::Ok);
    }

    #[test]
    fn load_module_reads_relative_path_with_cmel_extension_and_caches_it() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("greeter");
        std::fs::write(format!("{}.cmel", base.display()), "fun hello(){ return 1; } export hello;").unwrap();

        let mut vm = Vm::new();
        let path = vm.intern(&base.display().to_string());
        let first = vm.load_module(path).expect("module should load from disk");
        assert!(vm.modules.get(path).is_some());

        let second = vm.load_module(path).expect("cached module should reload");
        assert!(std::ptr::eq(first, second), "re-importing the same path must return the cached module");
    }
}
