use crate::compiler::lexer::{Scanner, Token, TokenKind};
use crate::vm::{Chunk, Heap, ObjFunction, ObjKind, OpCode, Value};

/// Locals and upvalues are addressed by a one-byte slot index.
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Expression precedence, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
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
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Parser<'src, 'h>, bool);

/// One row of the Pratt table: how a token parses in prefix position,
/// in infix position, and how tightly its infix form binds.
struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

/// What kind of function body is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A local variable while its function is being compiled.
/// `depth == -1` means declared but not yet initialized.
struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

/// How a closure reaches one captured variable: a slot in the
/// enclosing function (`is_local`) or one of its upvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. The stack of these mirrors the
/// lexical nesting of function bodies; the enclosing function is the
/// previous element.
struct FuncState<'src> {
    function: ObjFunction,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FuncState<'src> {
    fn new(function: ObjFunction, kind: FunctionKind) -> Self {
        // Slot 0 belongs to the function itself: it holds the receiver
        // inside methods and is unnameable in plain functions.
        let slot_zero = Local {
            name: if kind == FunctionKind::Function {
                ""
            } else {
                "this"
            },
            depth: 0,
            is_captured: false,
        };
        Self {
            function,
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Per-class compilation state, stacked for nested class bodies.
struct ClassState {
    has_superclass: bool,
}

/// The single-pass compiler: a Pratt parser that emits bytecode into
/// the chunk of the function currently being compiled. There is no
/// AST; parsing a construct and lowering it happen together.
pub struct Parser<'src, 'h> {
    scanner: Scanner<'src>,
    heap: &'h mut Heap,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<String>,
    states: Vec<FuncState<'src>>,
    classes: Vec<ClassState>,
}

/// Compile a source buffer into the top-level script function.
///
/// On failure, the error is the full report: one formatted line per
/// diagnostic that survived panic-mode suppression.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjFunction, String> {
    let mut parser = Parser::new(source, heap);
    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }
    parser.finish()
}

impl<'src, 'h> Parser<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        };
        Self {
            scanner: Scanner::new(source),
            heap,
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            states: vec![FuncState::new(
                ObjFunction::new(None),
                FunctionKind::Script,
            )],
            classes: Vec::new(),
        }
    }

    fn finish(mut self) -> Result<ObjFunction, String> {
        self.emit_return();
        if self.had_error {
            Err(self.errors.join("\n"))
        } else {
            let state = self.states.pop().expect("script state");
            Ok(state.function)
        }
    }

    // ========================================
    // Token plumbing and error reporting
    // ========================================

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        // Panic mode suppresses cascading reports until the parser
        // resynchronizes at a statement boundary.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        let mut report = format!("COMPILE ERROR: [Line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => report.push_str(" at end of source code."),
            TokenKind::Error => {}
            _ => report.push_str(&format!(" at '{}'", token.lexeme)),
        }
        report.push_str(&format!(": {}", message));

        self.errors.push(report);
        self.had_error = true;
    }

    /// Skip tokens until a statement boundary so one mistake does not
    /// drown the rest of the file in noise.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ========================================
    // Bytecode emission
    // ========================================

    fn state(&self) -> &FuncState<'src> {
        self.states.last().expect("compiler state")
    }

    fn state_mut(&mut self) -> &mut FuncState<'src> {
        self.states.last_mut().expect("compiler state")
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.state_mut().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_op_byte(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        // An initializer implicitly returns the receiver in slot 0;
        // everything else returns nil.
        if self.state().kind == FunctionKind::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.current_chunk().add_constant(value);
        if index > u8::MAX as usize {
            self.error("Cannot add any more constants in this bytecode chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, constant);
    }

    /// Emit a forward jump with a placeholder operand; returns the
    /// operand's offset for `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    /// Backpatch a forward jump to land on the next instruction.
    /// Offsets are 16-bit big-endian, relative to the byte after the
    /// operand.
    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let code = &mut self.current_chunk().code;
        code[offset] = ((jump >> 8) & 0xff) as u8;
        code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        // +2 covers the operand bytes of the LOOP instruction itself.
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body contains too many instructions to jump over.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // ========================================
    // Scopes, locals, upvalues
    // ========================================

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        // Pop this scope's locals; captured ones are hoisted onto the
        // heap instead of discarded.
        loop {
            let state = self.state();
            let Some(local) = state.locals.last() else {
                break;
            };
            if local.depth <= state.scope_depth {
                break;
            }
            let captured = local.is_captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.state_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.state().locals.len() == MAX_LOCALS {
            self.error("There are too many local variables in this function.");
            return;
        }
        self.state_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    /// Record a local declaration; globals are late-bound and skip this.
    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let mut duplicate = false;
        {
            let state = self.state();
            for local in state.locals.iter().rev() {
                if local.depth != -1 && local.depth < state.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("There is already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Parse a variable name. Returns its name-constant index for
    /// globals; locals resolve by slot and get a dummy 0.
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn define_variable(&mut self, global: u8) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let key = self.heap.intern(name);
        self.make_constant(Value::Obj(key.r))
    }

    fn resolve_local(&mut self, state: usize, name: &str) -> Option<u8> {
        for i in (0..self.states[state].locals.len()).rev() {
            if self.states[state].locals[i].name == name {
                if self.states[state].locals[i].depth == -1 {
                    self.error("You can't read a local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    /// Resolve a name against enclosing functions, threading it inward
    /// as a chain of upvalues. Marks the captured local so its scope
    /// exit closes it instead of popping it.
    fn resolve_upvalue(&mut self, state: usize, name: &str) -> Option<u8> {
        if state == 0 {
            return None;
        }
        let enclosing = state - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.states[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(state, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(state, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, state: usize, index: u8, is_local: bool) -> u8 {
        let desc = UpvalueDesc { index, is_local };
        // A variable captured twice reuses one upvalue.
        if let Some(existing) = self.states[state].upvalues.iter().position(|u| *u == desc) {
            return existing as u8;
        }
        if self.states[state].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.states[state].upvalues.push(desc);
        let count = self.states[state].upvalues.len();
        self.states[state].function.upvalue_count = count;
        (count - 1) as u8
    }

    // ========================================
    // Expressions
    // ========================================

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::get_rule(self.previous.kind).prefix else {
            self.error("Expected expression.");
            return;
        };

        // Only targets parsed at assignment precedence or looser may
        // consume a trailing '='.
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::get_rule(self.current.kind).precedence {
            self.advance();
            let infix = Self::get_rule(self.previous.kind)
                .infix
                .expect("token with precedence has an infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn get_rule(kind: TokenKind) -> ParseRule<'src, 'h> {
        let rule = |prefix, infix, precedence| ParseRule {
            prefix,
            infix,
            precedence,
        };
        match kind {
            TokenKind::LeftParen => rule(
                Some(Self::grouping as ParseFn<'src, 'h>),
                Some(Self::call),
                Precedence::Call,
            ),
            TokenKind::Dot => rule(None, Some(Self::dot), Precedence::Call),
            TokenKind::Minus => rule(Some(Self::unary), Some(Self::binary), Precedence::Term),
            TokenKind::Plus => rule(None, Some(Self::binary), Precedence::Term),
            TokenKind::Slash | TokenKind::Star => {
                rule(None, Some(Self::binary), Precedence::Factor)
            }
            TokenKind::Bang => rule(Some(Self::unary), None, Precedence::None),
            TokenKind::BangEqual | TokenKind::EqualEqual => {
                rule(None, Some(Self::binary), Precedence::Equality)
            }
            TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => rule(None, Some(Self::binary), Precedence::Comparison),
            TokenKind::Identifier => rule(Some(Self::variable), None, Precedence::None),
            TokenKind::String => rule(Some(Self::string), None, Precedence::None),
            TokenKind::Number => rule(Some(Self::number), None, Precedence::None),
            TokenKind::And => rule(None, Some(Self::and_), Precedence::And),
            TokenKind::Or => rule(None, Some(Self::or_), Precedence::Or),
            TokenKind::False | TokenKind::Nil | TokenKind::True => {
                rule(Some(Self::literal), None, Precedence::None)
            }
            TokenKind::Super => rule(Some(Self::super_), None, Precedence::None),
            TokenKind::This => rule(Some(Self::this_), None, Precedence::None),
            _ => rule(None, None, Precedence::None),
        }
    }

    fn number(&mut self, _can_assign: bool) {
        // The lexer only produces digit sequences, so this cannot fail.
        let value: f64 = self.previous.lexeme.parse().unwrap_or_default();
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let chars = &lexeme[1..lexeme.len() - 1]; // strip the quotes
        let key = self.heap.intern(chars);
        self.emit_constant(Value::Obj(key.r));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        let precedence = Self::get_rule(op).precedence;
        // Left-associative: the right operand binds one level tighter.
        self.parse_precedence(precedence.next());
        match op {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        // Short-circuit: if the left operand is falsey it stays on the
        // stack as the result and the right operand is skipped.
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op_byte(OpCode::Call, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == u8::MAX {
                    self.error("Can't have more than 255 function arguments.");
                } else {
                    argc += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after function arguments.");
        argc
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expected property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            // Fused property-get + call.
            let argc = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name);
            self.emit_byte(argc);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let state = self.states.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(state, name.lexeme) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(state, name.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let constant = self.identifier_constant(name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            _ => {}
        }

        self.consume(TokenKind::Dot, "Expected '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expected superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        // 'this' and 'super' resolve like ordinary variables: the
        // receiver is slot 0 and the superclass is the synthetic local
        // bound around the class body, captured as an upvalue here.
        self.named_variable(self.synthetic_token("this"), false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(self.synthetic_token("super"), false);
            self.emit_op_byte(OpCode::SuperInvoke, name);
            self.emit_byte(argc);
        } else {
            self.named_variable(self.synthetic_token("super"), false);
            self.emit_op_byte(OpCode::GetSuper, name);
        }
    }

    fn synthetic_token(&self, lexeme: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Identifier,
            lexeme,
            line: self.previous.line,
        }
    }

    // ========================================
    // Declarations and statements
    // ========================================

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after block.");
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expected variable name.");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expected ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(
            TokenKind::Semicolon,
            "Expected ';' after print statement value",
        );
        self.emit_op(OpCode::Print);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after if condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'while'.");
        self.expression();
        self.consume(
            TokenKind::RightParen,
            "Expected ')' after while loop condition.",
        );

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    /// Desugars to a while loop. When an increment clause is present
    /// the body jumps over it on entry and loops back to it at the
    /// end of each iteration, which then loops back to the condition.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'for'.");

        // Initializer clause.
        if self.match_token(TokenKind::Semicolon) {
            // None.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        // Condition clause.
        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(
                TokenKind::Semicolon,
                "Expected ';' after for loop condition.",
            );
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        // Increment clause.
        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(
                TokenKind::RightParen,
                "Expected ')' after for loop clauses.",
            );

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.state().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.state().kind == FunctionKind::Initializer {
                self.error("Can't return a value from a class initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expected function name.");
        // A function may refer to itself; its name is usable as soon
        // as it is declared.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compile a function body into a fresh nested compiler state,
    /// then emit the CLOSURE instruction that captures its upvalues.
    fn function(&mut self, kind: FunctionKind) {
        let name = self.heap.intern(self.previous.lexeme);
        self.states
            .push(FuncState::new(ObjFunction::new(Some(name)), kind));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expected '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.state().function.arity == 255 {
                    self.error_at_current("Can't have more than 255 function parameters.");
                } else {
                    self.state_mut().function.arity += 1;
                }
                let constant = self.parse_variable("Expected function parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(
            TokenKind::RightParen,
            "Expected ')' after function parameters.",
        );
        self.consume(TokenKind::LeftBrace, "Expected '{' before function body.");
        self.block();

        // No end_scope: the whole state is discarded, and RETURN
        // unwinds the frame at runtime.
        self.emit_return();
        let state = self.states.pop().expect("function state");
        let function_ref = self.heap.alloc(ObjKind::Function(state.function));
        let constant = self.make_constant(Value::Obj(function_ref));
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in &state.upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expected class method name.");
        let constant = self.identifier_constant(self.previous.lexeme);
        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_op_byte(OpCode::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expected superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            // Bind the superclass to a synthetic local named 'super'
            // in a scope around the class body, so methods capture it
            // as an upvalue.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().expect("class state").has_superclass = true;
        }

        // Put the class back on the stack so METHOD can attach to it.
        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expected '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().expect("class state").has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> (Heap, ObjFunction) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).expect("compile error");
        (heap, function)
    }

    fn compile_err(source: &str) -> String {
        let mut heap = Heap::new();
        compile(source, &mut heap).expect_err("expected a compile error")
    }

    #[test]
    fn test_expression_statement_bytecode() {
        let (_, function) = compile_ok("1 + 2;");
        let expected = [
            OpCode::Constant as u8,
            0,
            OpCode::Constant as u8,
            1,
            OpCode::Add as u8,
            OpCode::Pop as u8,
            // Implicit script return.
            OpCode::Nil as u8,
            OpCode::Return as u8,
        ];
        assert_eq!(function.chunk.code, expected);
        assert_eq!(function.chunk.constants[0], Value::Number(1.0));
        assert_eq!(function.chunk.constants[1], Value::Number(2.0));
    }

    #[test]
    fn test_precedence_mul_binds_tighter() {
        let (_, function) = compile_ok("print 1 + 2 * 3;");
        let code = &function.chunk.code;
        // ADD must come after MULTIPLY.
        let add = code.iter().position(|&b| b == OpCode::Add as u8);
        let mul = code.iter().position(|&b| b == OpCode::Multiply as u8);
        assert!(mul < add, "expected MULTIPLY before ADD: {:?}", code);
    }

    #[test]
    fn test_string_literals_are_interned() {
        let (heap, function) = compile_ok("\"hi\"; \"hi\";");
        let refs: Vec<_> = function
            .chunk
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .collect();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0], refs[1]);
        assert_eq!(heap.string(refs[0]).chars, "hi");
    }

    #[test]
    fn test_local_slots() {
        let (_, function) = compile_ok("{ var a = 1; var b = 2; print a; print b; }");
        let code = &function.chunk.code;
        // Locals live on the stack; no global traffic.
        assert!(!code.contains(&(OpCode::GetGlobal as u8)));
        assert!(!code.contains(&(OpCode::DefineGlobal as u8)));
        assert!(code.contains(&(OpCode::GetLocal as u8)));
    }

    #[test]
    fn test_jump_operands_are_big_endian() {
        let (_, function) = compile_ok("if (true) { print 1; }");
        let code = &function.chunk.code;
        let jif = code
            .iter()
            .position(|&b| b == OpCode::JumpIfFalse as u8)
            .unwrap();
        let offset = ((code[jif + 1] as usize) << 8) | code[jif + 2] as usize;
        // The decoded target must land inside the chunk.
        assert!(jif + 3 + offset <= code.len());
    }

    #[test]
    fn test_closure_upvalue_descriptors() {
        let (heap, function) = compile_ok(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        // outer is a constant of the script; inner is a constant of outer.
        let outer_ref = function
            .chunk
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .find(|r| matches!(&heap.get(*r).kind, ObjKind::Function(_)))
            .expect("outer function constant");
        let outer = heap.function(outer_ref);
        let inner_ref = outer
            .chunk
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .find(|r| matches!(&heap.get(*r).kind, ObjKind::Function(_)))
            .expect("inner function constant");
        assert_eq!(heap.function(inner_ref).upvalue_count, 1);

        // The CLOSURE instruction for inner carries (is_local=1, index=1).
        let code = &outer.chunk.code;
        let closure_at = code
            .iter()
            .position(|&b| b == OpCode::Closure as u8)
            .unwrap();
        assert_eq!(code[closure_at + 2], 1);
        assert_eq!(code[closure_at + 3], 1);
    }

    #[test]
    fn test_error_read_own_initializer() {
        let report = compile_err("{ var x = x; }");
        assert!(
            report.contains("You can't read a local variable in its own initializer."),
            "got: {}",
            report
        );
        assert!(report.contains("COMPILE ERROR: [Line 1] Error at 'x'"));
    }

    #[test]
    fn test_error_invalid_assignment_target() {
        let report = compile_err("var a = 1; var b = 2; a + b = 3;");
        assert!(report.contains("Invalid assignment target."), "got: {}", report);
    }

    #[test]
    fn test_error_duplicate_local() {
        let report = compile_err("{ var a = 1; var a = 2; }");
        assert!(report.contains("There is already a variable with this name in this scope."));
    }

    #[test]
    fn test_error_return_at_top_level() {
        let report = compile_err("return 1;");
        assert!(report.contains("Can't return from top-level code."));
    }

    #[test]
    fn test_error_return_value_from_initializer() {
        let report = compile_err("class A { init() { return 1; } }");
        assert!(report.contains("Can't return a value from a class initializer."));
    }

    #[test]
    fn test_error_this_outside_class() {
        let report = compile_err("print this;");
        assert!(report.contains("Can't use 'this' outside of a class."));
    }

    #[test]
    fn test_error_super_outside_class() {
        let report = compile_err("print super.x;");
        assert!(report.contains("Can't use 'super' outside of a class."));
    }

    #[test]
    fn test_error_super_without_superclass() {
        let report = compile_err("class A { f() { super.f(); } }");
        assert!(report.contains("Can't use 'super' in a class with no superclass."));
    }

    #[test]
    fn test_error_self_inheritance() {
        let report = compile_err("class A < A {}");
        assert!(report.contains("A class can't inherit from itself."));
    }

    #[test]
    fn test_error_at_end() {
        let report = compile_err("print 1");
        assert!(report.contains("at end of source code."), "got: {}", report);
    }

    #[test]
    fn test_error_too_many_constants() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("var v{} = {};\n", i, i));
        }
        let report = compile_err(&source);
        assert!(report.contains("Cannot add any more constants in this bytecode chunk."));
    }

    #[test]
    fn test_panic_mode_suppresses_cascades_until_sync() {
        // Two broken statements: each gets exactly one report.
        let report = compile_err("var = 1; var = 2;");
        assert_eq!(report.lines().count(), 2, "got: {}", report);
    }

    #[test]
    fn test_errors_keep_compiling() {
        // An error in the first statement still surfaces one in the last.
        let report = compile_err("var = 1; print this;");
        assert!(report.contains("Can't use 'this' outside of a class."));
    }
}
