//! Single-pass Pratt-parsing compiler: tokens in, a top-level `ObjFunction`
//! out. Every nested `fun`/`fn` body gets its own `Compiler` frame linked to
//! its enclosing one via `enclosing`.
//!
//! Local variables, upvalue capture/dedup, and the `ClassCompiler` stack for
//! `super` all follow the standard single-pass bytecode-compiler algorithm:
//! a local is a stack slot tracked by name and scope depth; an upvalue is
//! resolved by walking the enclosing compiler chain and is deduplicated per
//! function; `this`/`super` are ordinary locals reserved at closure-creation
//! time, not special-cased at the bytecode level.

use crate::chunk::{Chunk, OpCode};
use crate::object::Obj;
use crate::objects::function::ObjFunction;
use crate::scanner::{Scanner, Token, TokenType};
use crate::value::Value;
use crate::vm::Vm;

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionType {
    Function,
    Script,
    Method,
    Initializer,
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = fn(&mut Parser<'_>, bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence) -> ParseRule {
        ParseRule { prefix, infix, precedence }
    }
}

const NUM_TOKENS: usize = TokenType::Eof as usize + 1;

const RULES: [ParseRule; NUM_TOKENS] = {
    let mut rules = [ParseRule::new(None, None, Precedence::None); NUM_TOKENS];
    rules[TokenType::LeftParen as usize] = ParseRule::new(Some(Parser::grouping), Some(Parser::call), Precedence::Call);
    rules[TokenType::LeftBracket as usize] = ParseRule::new(Some(Parser::list_literal), Some(Parser::index_), Precedence::Call);
    rules[TokenType::LeftBrace as usize] = ParseRule::new(Some(Parser::map_literal), None, Precedence::None);
    rules[TokenType::Dot as usize] = ParseRule::new(None, Some(Parser::dot), Precedence::Call);
    rules[TokenType::Minus as usize] = ParseRule::new(Some(Parser::unary), Some(Parser::binary), Precedence::Term);
    rules[TokenType::Plus as usize] = ParseRule::new(None, Some(Parser::binary), Precedence::Term);
    rules[TokenType::Slash as usize] = ParseRule::new(None, Some(Parser::binary), Precedence::Factor);
    rules[TokenType::Star as usize] = ParseRule::new(None, Some(Parser::binary), Precedence::Factor);
    rules[TokenType::Percent as usize] = ParseRule::new(None, Some(Parser::binary), Precedence::Factor);
    rules[TokenType::Number as usize] = ParseRule::new(Some(Parser::number), None, Precedence::None);
    rules[TokenType::String as usize] = ParseRule::new(Some(Parser::string), None, Precedence::None);
    rules[TokenType::False as usize] = ParseRule::new(Some(Parser::literal), None, Precedence::None);
    rules[TokenType::True as usize] = ParseRule::new(Some(Parser::literal), None, Precedence::None);
    rules[TokenType::Nil as usize] = ParseRule::new(Some(Parser::literal), None, Precedence::None);
    rules[TokenType::Bang as usize] = ParseRule::new(Some(Parser::unary), None, Precedence::None);
    rules[TokenType::BangEqual as usize] = ParseRule::new(None, Some(Parser::binary), Precedence::Equality);
    rules[TokenType::EqualEqual as usize] = ParseRule::new(None, Some(Parser::binary), Precedence::Equality);
    rules[TokenType::Greater as usize] = ParseRule::new(None, Some(Parser::binary), Precedence::Comparison);
    rules[TokenType::GreaterEqual as usize] = ParseRule::new(None, Some(Parser::binary), Precedence::Comparison);
    rules[TokenType::Less as usize] = ParseRule::new(None, Some(Parser::binary), Precedence::Comparison);
    rules[TokenType::LessEqual as usize] = ParseRule::new(None, Some(Parser::binary), Precedence::Comparison);
    rules[TokenType::Identifier as usize] = ParseRule::new(Some(Parser::variable), None, Precedence::None);
    rules[TokenType::And as usize] = ParseRule::new(None, Some(Parser::and_), Precedence::And);
    rules[TokenType::Or as usize] = ParseRule::new(None, Some(Parser::or_), Precedence::Or);
    rules[TokenType::This as usize] = ParseRule::new(Some(Parser::this_), None, Precedence::None);
    rules[TokenType::Super as usize] = ParseRule::new(Some(Parser::super_), None, Precedence::None);
    rules[TokenType::Fn as usize] = ParseRule::new(Some(Parser::lambda), None, Precedence::None);
    rules
};

fn get_rule(token_type: TokenType) -> &'static ParseRule {
    &RULES[token_type as usize]
}

struct Local<'a> {
    name: &'a str,
    /// `-1` while declared-but-not-yet-initialized, so `var a = a;` can't
    /// read itself (clox's sentinel, carried through unchanged).
    depth: i32,
    is_captured: bool,
}

struct Upvalue {
    index: u8,
    is_local: bool,
}

struct Compiler<'a> {
    enclosing: Option<Box<Compiler<'a>>>,
    function: *mut ObjFunction,
    function_type: FunctionType,
    locals: Vec<Local<'a>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
}

struct ClassCompiler {
    enclosing: Option<Box<ClassCompiler>>,
    has_superclass: bool,
}

pub struct Parser<'a> {
    current: Token<'a>,
    previous: Token<'a>,
    scanner: Box<Scanner<'a>>,
    vm: &'a mut Vm,
    compiler: Box<Compiler<'a>>,
    class_compiler: Option<Box<ClassCompiler>>,
    has_error: bool,
    panic_mode: bool,
}

/// Compiles `source` against `vm` (needed for interning/allocation, and so
/// every allocation lands on the VM's heap before it has a GC root),
/// returning the top-level script function or `None` on a compile error.
pub fn compile(source: &str, vm: &mut Vm) -> Option<*mut ObjFunction> {
    let mut parser = Parser::new(source, vm);
    parser.advance();
    while !parser.match_token(TokenType::Eof) {
        parser.declaration();
    }
    parser.consume(TokenType::Eof, "Expect end of expression.");
    let has_error = parser.has_error;
    let (function, _upvalues) = parser.end_compiler();
    if has_error {
        None
    } else {
        Some(function)
    }
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, vm: &'a mut Vm) -> Parser<'a> {
        let function = vm.alloc_function(None);
        vm.compiling_functions.push(function);
        let compiler = Compiler {
            enclosing: None,
            function,
            function_type: FunctionType::Script,
            locals: vec![Local { name: "", depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        };
        Parser {
            current: Token { token_type: TokenType::Eof, value: "", line: 0 },
            previous: Token { token_type: TokenType::Eof, value: "", line: 0 },
            scanner: Scanner::new(source),
            vm,
            compiler: Box::new(compiler),
            class_compiler: None,
            has_error: false,
            panic_mode: false,
        }
    }

    // ---- token stream ----

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.scanner.scan_token();
            if self.current.token_type != TokenType::Error {
                break;
            }
            let message = self.current.value;
            self.error_at_current(message);
        }
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, token_type: TokenType, message: &str) {
        if self.current.token_type == token_type {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    // ---- error reporting ----

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'a>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        eprint!("[line {}] Error", token.line);
        match token.token_type {
            TokenType::Eof => eprint!(" at end"),
            TokenType::Error => {}
            _ => eprint!(" at '{}'", token.value),
        }
        eprintln!(": {message}");
        self.has_error = true;
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.token_type != TokenType::Eof {
            if self.previous.token_type == TokenType::Semicolon {
                return;
            }
            match self.current.token_type {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return
                | TokenType::Import
                | TokenType::Export => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- bytecode emission ----

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        unsafe { &mut (*self.compiler.function).chunk }
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line as u32;
        self.current_chunk_mut().write(byte, line);
    }

    fn emit_bytes(&mut self, byte1: u8, byte2: u8) {
        self.emit_byte(byte1);
        self.emit_byte(byte2);
    }

    fn emit_return(&mut self) {
        if self.compiler.function_type == FunctionType::Initializer {
            self.emit_bytes(OpCode::GetLocal as u8, 0);
        } else {
            self.emit_byte(OpCode::Nil as u8);
        }
        self.emit_byte(OpCode::Return as u8);
    }

    /// Used for identifier/name constants (global, property, method names):
    /// always a single byte, matching every `read_string` call site in the
    /// interpreter.
    fn make_constant(&mut self, value: Value) -> u8 {
        self.vm.push(value);
        let index = self.current_chunk_mut().add_constant(value);
        self.vm.pop();
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    /// Used for literal values (numbers, string literals): picks the short
    /// or long constant form automatically.
    fn emit_constant(&mut self, value: Value) {
        self.vm.push(value);
        let line = self.previous.line as u32;
        self.current_chunk_mut().write_constant(value, line);
        self.vm.pop();
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let ptr = self.vm.intern(name);
        self.make_constant(Value::Obj(ptr as *mut Obj))
    }

    fn string_literal_value(&mut self, token_value: &str) -> Value {
        let inner = &token_value[1..token_value.len() - 1];
        let ptr = self.vm.intern(inner);
        Value::Obj(ptr as *mut Obj)
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_byte(op as u8);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk_mut().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk_mut().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.current_chunk_mut();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(OpCode::Loop as u8);
        let offset = self.current_chunk_mut().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // ---- compiler stack ----

    fn push_compiler(&mut self, function_type: FunctionType, name: Option<&str>) {
        let name_ptr = name.map(|n| self.vm.intern(n));
        let function = self.vm.alloc_function(name_ptr);
        self.vm.compiling_functions.push(function);
        let slot0_name = if matches!(function_type, FunctionType::Method | FunctionType::Initializer) { "this" } else { "" };
        let new_compiler = Compiler {
            enclosing: None,
            function,
            function_type,
            locals: vec![Local { name: slot0_name, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        };
        let old = std::mem::replace(&mut self.compiler, Box::new(new_compiler));
        self.compiler.enclosing = Some(old);
    }

    fn end_compiler(&mut self) -> (*mut ObjFunction, Vec<Upvalue>) {
        self.emit_return();
        let function = self.compiler.function;
        let upvalues = std::mem::take(&mut self.compiler.upvalues);

        #[cfg(feature = "debug_print_code")]
        if !self.has_error {
            let name = unsafe { (*function).name_str().unwrap_or("<script>").to_string() };
            crate::debug::disassemble_chunk(unsafe { &(*function).chunk }, &name);
        }

        self.vm.compiling_functions.pop();
        if let Some(enclosing) = self.compiler.enclosing.take() {
            self.compiler = enclosing;
        }
        (function, upvalues)
    }

    fn begin_scope(&mut self) {
        self.compiler.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.compiler.scope_depth -= 1;
        while let Some(local) = self.compiler.locals.last() {
            if local.depth <= self.compiler.scope_depth {
                break;
            }
            if self.compiler.locals.last().unwrap().is_captured {
                self.emit_byte(OpCode::CloseUpvalue as u8);
            } else {
                self.emit_byte(OpCode::Pop as u8);
            }
            self.compiler.locals.pop();
        }
    }

    // ---- variable resolution ----

    fn resolve_local(compiler: &Compiler<'a>, name: &str) -> Option<usize> {
        compiler.locals.iter().enumerate().rev().find(|(_, l)| l.name == name).map(|(i, _)| i)
    }

    fn resolve_upvalue(compiler: &mut Compiler<'a>, name: &str) -> Option<usize> {
        let enclosing = compiler.enclosing.as_deref_mut()?;
        if let Some(local) = Self::resolve_local(enclosing, name) {
            enclosing.locals[local].is_captured = true;
            return Some(Self::add_upvalue(compiler, local as u8, true));
        }
        if let Some(up) = Self::resolve_upvalue(enclosing, name) {
            return Some(Self::add_upvalue(compiler, up as u8, false));
        }
        None
    }

    fn add_upvalue(compiler: &mut Compiler<'a>, index: u8, is_local: bool) -> usize {
        for (i, existing) in compiler.upvalues.iter().enumerate() {
            if existing.index == index && existing.is_local == is_local {
                return i;
            }
        }
        compiler.upvalues.push(Upvalue { index, is_local });
        unsafe { (*compiler.function).upvalue_count = compiler.upvalues.len() };
        compiler.upvalues.len() - 1
    }

    fn add_local(&mut self, name: &'a str) {
        if self.compiler.locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.compiler.locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        let name = self.previous.value;
        for local in self.compiler.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.compiler.scope_depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
            }
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);
        self.declare_variable();
        if self.compiler.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.value)
    }

    fn mark_initialized(&mut self) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        let depth = self.compiler.scope_depth;
        self.compiler.locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.compiler.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal as u8, global);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let get_op;
        let set_op;
        let arg;
        if let Some(idx) = Self::resolve_local(&self.compiler, name) {
            if self.compiler.locals[idx].depth == -1 {
                self.error("Can't read local variable in its own initializer.");
            }
            get_op = OpCode::GetLocal;
            set_op = OpCode::SetLocal;
            arg = idx as u8;
        } else if let Some(idx) = Self::resolve_upvalue(&mut self.compiler, name) {
            get_op = OpCode::GetUpvalue;
            set_op = OpCode::SetUpvalue;
            arg = idx as u8;
        } else {
            arg = self.identifier_constant(name);
            get_op = OpCode::GetGlobal;
            set_op = OpCode::SetGlobal;
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(set_op as u8, arg);
        } else {
            self.emit_bytes(get_op as u8, arg);
        }
    }

    // ---- declarations & statements ----

    fn declaration(&mut self) {
        if self.match_token(TokenType::Class) {
            self.class_declaration();
        } else if self.match_token(TokenType::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous.value;
        let name_const = self.identifier_constant(class_name);
        self.declare_variable();
        self.emit_bytes(OpCode::Class as u8, name_const);
        self.define_variable(name_const);

        let enclosing_class = self.class_compiler.take();
        self.class_compiler = Some(Box::new(ClassCompiler { enclosing: enclosing_class, has_superclass: false }));

        if self.match_token(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            let superclass_name = self.previous.value;
            if superclass_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(superclass_name, false);

            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_byte(OpCode::Inherit as u8);
            if let Some(cc) = self.class_compiler.as_mut() {
                cc.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_byte(OpCode::Pop as u8);

        let has_superclass = self.class_compiler.as_ref().map(|c| c.has_superclass).unwrap_or(false);
        if has_superclass {
            self.end_scope();
        }

        self.class_compiler = self.class_compiler.take().and_then(|c| c.enclosing);
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let name = self.previous.value.to_string();
        let name_const = self.identifier_constant(&name);
        let function_type = if name == "init" { FunctionType::Initializer } else { FunctionType::Method };
        self.function(function_type, Some(&name));
        self.emit_bytes(OpCode::Method as u8, name_const);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        let name = self.previous.value.to_string();
        self.mark_initialized();
        self.function(FunctionType::Function, Some(&name));
        self.define_variable(global);
    }

    /// Compiles a function body (named `fun`, method, or `fn` lambda) into
    /// its own `Compiler` frame and emits the `OP_CLOSURE` that wraps it,
    /// including its upvalue capture descriptors.
    fn function(&mut self, function_type: FunctionType, name: Option<&str>) {
        self.push_compiler(function_type, name);
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                let arity = unsafe { &mut (*self.compiler.function).arity };
                if *arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    *arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");

        if self.match_token(TokenType::Arrow) {
            self.expression();
            self.emit_byte(OpCode::Return as u8);
        } else {
            self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
            self.block();
        }

        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Value::Obj(function as *mut Obj));
        self.emit_bytes(OpCode::Closure as u8, constant);
        for upvalue in &upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_byte(OpCode::Nil as u8);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::Print) {
            self.print_statement();
        } else if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::Import) {
            self.import_statement();
        } else if self.match_token(TokenType::Export) {
            self.export_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_byte(OpCode::Print as u8);
    }

    fn return_statement(&mut self) {
        if self.compiler.function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.compiler.function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_byte(OpCode::Return as u8);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop as u8);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_byte(OpCode::Pop as u8);

        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk_mut().code.len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop as u8);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_byte(OpCode::Pop as u8);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenType::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk_mut().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_byte(OpCode::Pop as u8);
        }

        if !self.match_token(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk_mut().code.len();
            self.expression();
            self.emit_byte(OpCode::Pop as u8);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_byte(OpCode::Pop as u8);
        }

        self.end_scope();
    }

    fn import_statement(&mut self) {
        if self.check(TokenType::String) {
            self.advance();
            let value = self.string_literal_value(self.previous.value);
            let path_const = self.make_constant(value);
            self.emit_bytes(OpCode::Import as u8, path_const);
        } else {
            self.consume(TokenType::Identifier, "Expect imported name.");
            let name_const = self.identifier_constant(self.previous.value);
            self.consume(TokenType::From, "Expect 'from' after import name.");
            self.consume(TokenType::String, "Expect module path string.");
            let value = self.string_literal_value(self.previous.value);
            let path_const = self.make_constant(value);
            self.emit_byte(OpCode::ImportFrom as u8);
            self.emit_byte(path_const);
            self.emit_byte(name_const);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after import statement.");
    }

    fn export_statement(&mut self) {
        self.consume(TokenType::Identifier, "Expect exported name.");
        let name_const = self.identifier_constant(self.previous.value);
        self.emit_bytes(OpCode::Export as u8, name_const);
        self.consume(TokenType::Semicolon, "Expect ';' after export statement.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_byte(OpCode::Pop as u8);
    }

    // ---- expressions ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix_rule = match get_rule(self.previous.token_type).prefix {
            Some(rule) => rule,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix_rule(self, can_assign);

        while precedence <= get_rule(self.current.token_type).precedence {
            self.advance();
            let infix_rule = get_rule(self.previous.token_type).infix.unwrap();
            infix_rule(self, can_assign);
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.value.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let value = self.string_literal_value(self.previous.value);
        self.emit_constant(value);
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.token_type {
            TokenType::False => self.emit_byte(OpCode::False as u8),
            TokenType::True => self.emit_byte(OpCode::True as u8),
            TokenType::Nil => self.emit_byte(OpCode::Nil as u8),
            _ => unreachable!("not a literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.value;
        self.named_variable(name, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.class_compiler.is_none() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match &self.class_compiler {
            None => self.error("Can't use 'super' outside of a class."),
            Some(cc) if !cc.has_superclass => self.error("Can't use 'super' in a class with no superclass."),
            _ => {}
        }

        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name_const = self.identifier_constant(self.previous.value);

        self.named_variable("this", false);
        if self.match_token(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_bytes(OpCode::SuperInvoke as u8, name_const);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_bytes(OpCode::GetSuper as u8, name_const);
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.token_type;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenType::Bang => self.emit_byte(OpCode::Not as u8),
            TokenType::Minus => self.emit_byte(OpCode::Negate as u8),
            _ => unreachable!("not a unary operator"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.token_type;
        let rule = get_rule(operator);
        self.parse_precedence(rule.precedence.next());
        match operator {
            TokenType::Plus => self.emit_byte(OpCode::Add as u8),
            TokenType::Minus => self.emit_byte(OpCode::Subtract as u8),
            TokenType::Star => self.emit_byte(OpCode::Multiply as u8),
            TokenType::Slash => self.emit_byte(OpCode::Divide as u8),
            TokenType::Percent => self.emit_byte(OpCode::Modulo as u8),
            TokenType::BangEqual => self.emit_bytes(OpCode::Equal as u8, OpCode::Not as u8),
            TokenType::EqualEqual => self.emit_byte(OpCode::Equal as u8),
            TokenType::Greater => self.emit_byte(OpCode::Greater as u8),
            TokenType::GreaterEqual => self.emit_bytes(OpCode::Less as u8, OpCode::Not as u8),
            TokenType::Less => self.emit_byte(OpCode::Less as u8),
            TokenType::LessEqual => self.emit_bytes(OpCode::Greater as u8, OpCode::Not as u8),
            _ => unreachable!("not a binary operator"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop as u8);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_byte(OpCode::Pop as u8);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_bytes(OpCode::Call as u8, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u8 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if count == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        count
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name_const = self.identifier_constant(self.previous.value);

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty as u8, name_const);
        } else if self.match_token(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_bytes(OpCode::Invoke as u8, name_const);
            self.emit_byte(arg_count);
        } else {
            self.emit_bytes(OpCode::GetProperty as u8, name_const);
        }
    }

    fn index_(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenType::RightBracket, "Expect ']' after index.");
        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_byte(OpCode::Store as u8);
        } else {
            self.emit_byte(OpCode::Index as u8);
        }
    }

    fn list_literal(&mut self, _can_assign: bool) {
        let mut count: u8 = 0;
        if !self.check(TokenType::RightBracket) {
            loop {
                self.expression();
                if count == u8::MAX {
                    self.error("Can't have more than 255 elements in a list literal.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightBracket, "Expect ']' after list elements.");
        self.emit_bytes(OpCode::BuildList as u8, count);
    }

    fn map_literal(&mut self, _can_assign: bool) {
        let mut count: u8 = 0;
        if !self.check(TokenType::RightBrace) {
            loop {
                self.consume(TokenType::String, "Expect string key.");
                self.string(false);
                self.consume(TokenType::Colon, "Expect ':' after map key.");
                self.expression();
                if count == u8::MAX {
                    self.error("Can't have more than 255 entries in a map literal.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightBrace, "Expect '}' after map entries.");
        self.emit_bytes(OpCode::BuildMap as u8, count);
    }

    fn lambda(&mut self, _can_assign: bool) {
        self.function(FunctionType::Function, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    #[test]
    fn compiles_simple_arithmetic() {
        let mut vm = Vm::new();
        assert!(compile("print 1 + 2 * 3;", &mut vm).is_some());
    }

    #[test]
    fn compiles_classes_and_methods() {
        let mut vm = Vm::new();
        let source = "class A { init(x) { this.x = x; } get() { return this.x; } } print A(1).get();";
        assert!(compile(source, &mut vm).is_some());
    }

    #[test]
    fn compiles_closures() {
        let mut vm = Vm::new();
        let source = "fun make() { var i = 0; fun inc() { i = i + 1; return i; } return inc; }";
        assert!(compile(source, &mut vm).is_some());
    }

    #[test]
    fn compiles_list_and_map_literals() {
        let mut vm = Vm::new();
        assert!(compile("var xs = [1, 2, 3]; var m = {\"a\": 1}; print xs[0] + m[\"a\"];", &mut vm).is_some());
    }

    #[test]
    fn reports_error_on_unclosed_block() {
        let mut vm = Vm::new();
        assert!(compile("fun f() { print 1;", &mut vm).is_none());
    }

    #[test]
    fn reports_error_on_self_referential_initializer() {
        let mut vm = Vm::new();
        assert!(compile("{ var a = a; }", &mut vm).is_none());
    }

    #[test]
    fn compiles_lambda_with_arrow_body() {
        let mut vm = Vm::new();
        assert!(compile("var f = fn(x) -> x * x; print f(3);", &mut vm).is_some());
    }

    #[test]
    fn compiles_import_and_export_statements() {
        let mut vm = Vm::new();
        assert!(compile("fun square(x) { return x * x; } export square;", &mut vm).is_some());
        assert!(compile("import square from \"math\"; print square(2);", &mut vm).is_some());
        assert!(compile("import \"math\";", &mut vm).is_some());
    }
}
