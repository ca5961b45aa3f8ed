//! Integer calculator evaluator.
//!
//! A deliberately small language used by the CLI and the test suites:
//!
//! ```text
//! let x = 6 * 7
//! print("x is", x)
//! (x + 1) % 5
//! ```
//!
//! Statements are separated by newlines or `;`. The value of the last
//! statement is the cell result. Builtins:
//!
//! | Builtin | Effect |
//! |---|---|
//! | `print(a, ...)` / `eprint(a, ...)` | write a line to stdout / stderr |
//! | `input(prompt)` | read a line from the front-end |
//! | `sleep(ms)` | wait, stopping early when interrupted |
//! | `spin()` | busy-wait until released, outlasting an interrupt by a second |
//! | `fail(msg)` | raise a `RuntimeError` |
//! | `display(v[, id])` / `update(v, id)` | emit or replace rich output |
//! | `keep(v)` | as the last statement, return `v` as a live object |

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use super::{
    CompletenessStatus, CompletionResult, Diagnostic, DisplayData, EvalOutcome, EvalRequest,
    EvalValue, Evaluator, LanguageInfo, Severity,
};
use crate::execute::{Fault, TaskContext};
use crate::io::ExecutionIo;

/// MIME type under which kept values are referenced.
pub const KEPT_VALUE_MIME: &str = "application/vnd.ember.value-ref";

const BUILTINS: &[&str] = &[
    "display", "eprint", "fail", "input", "keep", "print", "sleep", "spin", "update",
];

const SLEEP_SLICE: Duration = Duration::from_millis(5);

/// Deepest expression tree the parser builds. Parsing, evaluation and
/// dropping all recurse on it.
const MAX_DEPTH: usize = 256;

/// How long `spin()` keeps running once its task is interrupted.
const SPIN_OUTLASTS_INTERRUPT: Duration = Duration::from_secs(1);

/// A calculator value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalcValue {
    Int(i64),
    Str(String),
    Unit,
}

impl std::fmt::Display for CalcValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Str(s) => write!(f, "{}", s),
            Self::Unit => write!(f, "()"),
        }
    }
}

// --- lexing ---

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Int(i64),
    Str(String),
    Ident(String),
    Let,
    Op(char),
    LParen,
    RParen,
    Comma,
    Assign,
    Sep,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    start: usize,
    end: usize,
    line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParseError {
    message: String,
    start: usize,
    end: usize,
    /// More input could make the code valid.
    incomplete: bool,
}

impl ParseError {
    fn new(message: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            message: message.into(),
            start,
            end,
            incomplete: false,
        }
    }

    fn incomplete(mut self) -> Self {
        self.incomplete = true;
        self
    }

    fn into_fault(self) -> Fault {
        Fault::new("ParseError", self.message)
    }
}

fn lex(code: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = code.chars().collect();
    let mut tokens = Vec::new();
    let mut depth = 0i64;
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let tok = match c {
            '\n' => {
                line += 1;
                i += 1;
                if depth > 0 {
                    continue;
                }
                Tok::Sep
            }
            ';' => {
                i += 1;
                Tok::Sep
            }
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '0'..='9' => {
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let digits: String = chars[start..i].iter().collect();
                let n = digits
                    .parse::<i64>()
                    .map_err(|_| ParseError::new("integer literal too large", start, i))?;
                Tok::Int(n)
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ParseError::new("unterminated string", start, i).incomplete());
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(&other) => s.push(other),
                                None => {
                                    return Err(ParseError::new("unterminated string", start, i + 1)
                                        .incomplete());
                                }
                            }
                            i += 2;
                        }
                        Some(&other) => {
                            if other == '\n' {
                                line += 1;
                            }
                            s.push(other);
                            i += 1;
                        }
                    }
                }
                Tok::Str(s)
            }
            c if c.is_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if word == "let" { Tok::Let } else { Tok::Ident(word) }
            }
            '+' | '-' | '*' | '/' | '%' => {
                i += 1;
                Tok::Op(c)
            }
            '(' => {
                i += 1;
                depth += 1;
                Tok::LParen
            }
            ')' => {
                i += 1;
                depth -= 1;
                Tok::RParen
            }
            ',' => {
                i += 1;
                Tok::Comma
            }
            '=' => {
                i += 1;
                Tok::Assign
            }
            other => {
                return Err(ParseError::new(
                    format!("unexpected character '{}'", other),
                    start,
                    start + 1,
                ));
            }
        };
        tokens.push(Token {
            tok,
            start,
            end: i,
            line,
        });
    }
    Ok(tokens)
}

// --- parsing ---

#[derive(Debug, Clone)]
enum Expr {
    Int(i64),
    Str(String),
    Var(String, usize),
    Neg(Box<Expr>, usize),
    Bin(char, Box<Expr>, Box<Expr>, usize),
    Call(String, Vec<Expr>, usize),
}

#[derive(Debug, Clone)]
enum Stmt {
    Let(String, Expr),
    Expr(Expr),
}

fn too_deep(start: usize, end: usize) -> ParseError {
    ParseError::new("expression nested too deeply", start, end)
}

/// Recursive-descent parser. Every expression rule returns the tree it
/// built together with that tree's depth.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    len: usize,
    nesting: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, len: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            len,
            nesting: 0,
        }
    }

    fn last_span(&self) -> (usize, usize) {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or((self.len, self.len), |t| (t.start, t.end))
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.nesting += 1;
        if self.nesting > MAX_DEPTH {
            let (start, end) = self.last_span();
            return Err(too_deep(start, end));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.nesting -= 1;
    }

    /// Depth of a node whose deepest child has depth `child`.
    fn deeper(&self, child: usize) -> Result<usize, ParseError> {
        if child >= MAX_DEPTH {
            let (start, end) = self.last_span();
            return Err(too_deep(start, end));
        }
        Ok(child + 1)
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eof_error(&self, what: &str) -> ParseError {
        ParseError::new(format!("expected {} but found end of input", what), self.len, self.len)
    }

    fn unexpected(&self, token: &Token, what: &str) -> ParseError {
        ParseError::new(
            format!("expected {} but found {:?}", what, token.tok),
            token.start,
            token.end,
        )
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<Token, ParseError> {
        match self.next() {
            Some(token) if token.tok == tok => Ok(token),
            Some(token) => Err(self.unexpected(&token, what)),
            None => Err(self.eof_error(what)),
        }
    }

    fn program(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = Vec::new();
        loop {
            while self.peek() == Some(&Tok::Sep) {
                self.pos += 1;
            }
            if self.peek().is_none() {
                return Ok(stmts);
            }
            stmts.push(self.statement()?);
            match self.next() {
                None => return Ok(stmts),
                Some(token) if token.tok == Tok::Sep => {}
                Some(token) => return Err(self.unexpected(&token, "end of statement")),
            }
        }
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        if self.peek() == Some(&Tok::Let) {
            self.pos += 1;
            let name = match self.next() {
                Some(Token {
                    tok: Tok::Ident(name),
                    ..
                }) => name,
                Some(token) => return Err(self.unexpected(&token, "a name")),
                None => return Err(self.eof_error("a name")),
            };
            self.expect(Tok::Assign, "'='")?;
            return Ok(Stmt::Let(name, self.expr()?.0));
        }
        Ok(Stmt::Expr(self.expr()?.0))
    }

    fn expr(&mut self) -> Result<(Expr, usize), ParseError> {
        let (mut lhs, mut depth) = self.term()?;
        while let Some(Tok::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            let line = self.tokens[self.pos].line;
            self.pos += 1;
            let (rhs, rhs_depth) = self.term()?;
            depth = self.deeper(depth.max(rhs_depth))?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs), line);
        }
        Ok((lhs, depth))
    }

    fn term(&mut self) -> Result<(Expr, usize), ParseError> {
        let (mut lhs, mut depth) = self.unary()?;
        while let Some(Tok::Op(op @ ('*' | '/' | '%'))) = self.peek().cloned() {
            let line = self.tokens[self.pos].line;
            self.pos += 1;
            let (rhs, rhs_depth) = self.unary()?;
            depth = self.deeper(depth.max(rhs_depth))?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs), line);
        }
        Ok((lhs, depth))
    }

    fn unary(&mut self) -> Result<(Expr, usize), ParseError> {
        if self.peek() == Some(&Tok::Op('-')) {
            let line = self.tokens[self.pos].line;
            self.pos += 1;
            self.enter()?;
            let (inner, depth) = self.unary()?;
            self.leave();
            let depth = self.deeper(depth)?;
            return Ok((Expr::Neg(Box::new(inner), line), depth));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<(Expr, usize), ParseError> {
        let Some(token) = self.next() else {
            return Err(self.eof_error("an expression"));
        };
        match token.tok {
            Tok::Int(n) => Ok((Expr::Int(n), 1)),
            Tok::Str(s) => Ok((Expr::Str(s), 1)),
            Tok::LParen => {
                self.enter()?;
                let inner = self.expr()?;
                self.expect(Tok::RParen, "')'")?;
                self.leave();
                Ok(inner)
            }
            Tok::Ident(name) => {
                if self.peek() != Some(&Tok::LParen) {
                    return Ok((Expr::Var(name, token.line), 1));
                }
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() == Some(&Tok::RParen) {
                    self.pos += 1;
                    return Ok((Expr::Call(name, args, token.line), 1));
                }
                self.enter()?;
                let mut depth = 0;
                loop {
                    let (arg, arg_depth) = self.expr()?;
                    args.push(arg);
                    depth = depth.max(arg_depth);
                    match self.next() {
                        Some(Token { tok: Tok::Comma, .. }) => {}
                        Some(Token {
                            tok: Tok::RParen, ..
                        }) => break,
                        Some(other) => return Err(self.unexpected(&other, "',' or ')'")),
                        None => return Err(self.eof_error("')'")),
                    }
                }
                self.leave();
                let depth = self.deeper(depth)?;
                Ok((Expr::Call(name, args, token.line), depth))
            }
            _ => Err(self.unexpected(&token, "an expression")),
        }
    }
}

fn parse(code: &str) -> Result<Vec<Stmt>, ParseError> {
    let tokens = lex(code)?;

    let mut depth = 0i64;
    for token in &tokens {
        match token.tok {
            Tok::LParen => {
                depth += 1;
                if depth > MAX_DEPTH as i64 {
                    return Err(too_deep(token.start, token.end));
                }
            }
            Tok::RParen => {
                depth -= 1;
                if depth < 0 {
                    return Err(ParseError::new("unmatched ')'", token.start, token.end));
                }
            }
            _ => {}
        }
    }
    let len = code.chars().count();
    if depth > 0 {
        return Err(ParseError::new("unclosed '('", len, len).incomplete());
    }

    Parser::new(tokens, len).program()
}

// --- evaluation ---

fn runtime_fault(kind: &str, message: impl Into<String>, line: usize) -> Fault {
    Fault::new(kind, message).with_trace(vec![format!("at cell line {}", line)])
}

struct Interp<'a> {
    calc: &'a Calculator,
    io: &'a mut ExecutionIo,
    task: &'a TaskContext,
}

impl Interp<'_> {
    fn eval(&mut self, expr: &Expr) -> Result<CalcValue, Fault> {
        match expr {
            Expr::Int(n) => Ok(CalcValue::Int(*n)),
            Expr::Str(s) => Ok(CalcValue::Str(s.clone())),
            Expr::Var(name, line) => self.calc.vars().get(name).cloned().ok_or_else(|| {
                runtime_fault("UnknownVariable", format!("'{}' is not defined", name), *line)
            }),
            Expr::Neg(inner, line) => match self.eval(inner)? {
                CalcValue::Int(n) => n.checked_neg().map(CalcValue::Int).ok_or_else(|| {
                    runtime_fault("ArithmeticOverflow", "integer overflow", *line)
                }),
                other => Err(runtime_fault(
                    "TypeError",
                    format!("cannot negate {}", type_name(&other)),
                    *line,
                )),
            },
            Expr::Bin(op, lhs, rhs, line) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(*op, lhs, rhs, *line)
            }
            Expr::Call(name, args, line) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                self.call(name, values, *line)
            }
        }
    }

    fn call(&mut self, name: &str, args: Vec<CalcValue>, line: usize) -> Result<CalcValue, Fault> {
        match name {
            "print" | "eprint" => {
                let text = args.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ");
                let out = if name == "print" {
                    self.io.stdout()
                } else {
                    self.io.stderr()
                };
                writeln!(out, "{}", text)
                    .map_err(|e| runtime_fault("IOError", e.to_string(), line))?;
                Ok(CalcValue::Unit)
            }
            "input" => {
                let prompt = args.first().map(ToString::to_string).unwrap_or_default();
                self.io
                    .read_line(&prompt, false)
                    .map(CalcValue::Str)
                    .map_err(|e| runtime_fault("StdinError", e.to_string(), line))
            }
            "sleep" => {
                let ms = int_arg(&args, 0, name, line)?;
                let deadline = Instant::now() + Duration::from_millis(ms.max(0) as u64);
                loop {
                    self.task.check_interrupted()?;
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(CalcValue::Unit);
                    }
                    thread::sleep(SLEEP_SLICE.min(deadline - now));
                }
            }
            "spin" => {
                let mut interrupted_at = None;
                while !self.calc.spin_release.swap(false, Ordering::SeqCst) {
                    if self.task.is_interrupted() {
                        let since = *interrupted_at.get_or_insert_with(Instant::now);
                        if since.elapsed() >= SPIN_OUTLASTS_INTERRUPT {
                            return Err(Fault::interrupted());
                        }
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(CalcValue::Unit)
            }
            "fail" => {
                let message = args
                    .first()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "failure".to_string());
                Err(runtime_fault("RuntimeError", message, line))
            }
            "display" | "update" => {
                let Some(value) = args.first() else {
                    return Err(runtime_fault(
                        "ArgumentError",
                        format!("{}() takes a value", name),
                        line,
                    ));
                };
                let mut data = DisplayData::text(value.to_string());
                if let Some(id) = args.get(1) {
                    data = data.with_display_id(id.to_string());
                } else if name == "update" {
                    return Err(runtime_fault(
                        "ArgumentError",
                        "update() needs a display id",
                        line,
                    ));
                }
                self.io.display(data, name == "update");
                Ok(CalcValue::Unit)
            }
            "keep" => args.into_iter().next().ok_or_else(|| {
                runtime_fault("ArgumentError", "keep() takes a value", line)
            }),
            _ => Err(runtime_fault(
                "UnknownFunction",
                format!("'{}' is not a function", name),
                line,
            )),
        }
    }
}

fn type_name(value: &CalcValue) -> &'static str {
    match value {
        CalcValue::Int(_) => "an integer",
        CalcValue::Str(_) => "a string",
        CalcValue::Unit => "unit",
    }
}

fn int_arg(args: &[CalcValue], index: usize, name: &str, line: usize) -> Result<i64, Fault> {
    match args.get(index) {
        Some(CalcValue::Int(n)) => Ok(*n),
        _ => Err(runtime_fault(
            "ArgumentError",
            format!("{}() takes an integer", name),
            line,
        )),
    }
}

fn binary(op: char, lhs: CalcValue, rhs: CalcValue, line: usize) -> Result<CalcValue, Fault> {
    let (a, b) = match (lhs, rhs) {
        (CalcValue::Int(a), CalcValue::Int(b)) => (a, b),
        (lhs @ CalcValue::Str(_), rhs) | (lhs, rhs @ CalcValue::Str(_)) if op == '+' => {
            return Ok(CalcValue::Str(format!("{}{}", lhs, rhs)));
        }
        (lhs, rhs) => {
            return Err(runtime_fault(
                "TypeError",
                format!("cannot apply '{}' to {} and {}", op, type_name(&lhs), type_name(&rhs)),
                line,
            ));
        }
    };
    if matches!(op, '/' | '%') && b == 0 {
        return Err(runtime_fault("DivisionByZero", "division by zero", line));
    }
    let result = match op {
        '+' => a.checked_add(b),
        '-' => a.checked_sub(b),
        '*' => a.checked_mul(b),
        '/' => a.checked_div(b),
        _ => a.checked_rem(b),
    };
    result
        .map(CalcValue::Int)
        .ok_or_else(|| runtime_fault("ArithmeticOverflow", "integer overflow", line))
}

/// The built-in calculator.
#[derive(Default)]
pub struct Calculator {
    vars: Mutex<FxHashMap<String, CalcValue>>,
    spin_release: Arc<AtomicBool>,
}

impl Calculator {
    pub fn new() -> Self {
        Self::default()
    }

    fn vars(&self) -> MutexGuard<'_, FxHashMap<String, CalcValue>> {
        self.vars.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value of a variable.
    pub fn variable(&self, name: &str) -> Option<CalcValue> {
        self.vars().get(name).cloned()
    }

    /// Let one pending or future `spin()` call return.
    pub fn release_spin(&self) {
        self.spin_release.store(true, Ordering::SeqCst);
    }
}

impl Evaluator for Calculator {
    fn language(&self) -> LanguageInfo {
        LanguageInfo {
            name: "calc".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            mimetype: "text/x-ember-calc".to_string(),
            file_extension: ".calc".to_string(),
        }
    }

    fn eval(
        &self,
        request: &EvalRequest,
        io: &mut ExecutionIo,
        task: &TaskContext,
    ) -> Result<EvalOutcome, Fault> {
        let stmts = parse(&request.code).map_err(ParseError::into_fault)?;
        let mut interp = Interp {
            calc: self,
            io,
            task,
        };

        let mut last = CalcValue::Unit;
        let mut kept = false;
        for stmt in &stmts {
            task.check_interrupted()?;
            match stmt {
                Stmt::Let(name, expr) => {
                    let value = interp.eval(expr)?;
                    self.vars().insert(name.clone(), value);
                    last = CalcValue::Unit;
                    kept = false;
                }
                Stmt::Expr(expr) => {
                    last = interp.eval(expr)?;
                    kept = matches!(expr, Expr::Call(name, _, _) if name == "keep");
                }
            }
        }
        interp.io.flush().map_err(|e| Fault::new("IOError", e.to_string()))?;

        let value = match last {
            CalcValue::Unit => EvalValue::Unit,
            value if kept => EvalValue::InMemory {
                fallback: value.to_string(),
                mime_type: KEPT_VALUE_MIME.to_string(),
                value: Arc::new(value),
                id: None,
            },
            value => EvalValue::Text(value.to_string()),
        };
        Ok(EvalOutcome::Value(value))
    }

    fn check_complete(&self, code: &str) -> CompletenessStatus {
        match parse(code) {
            Ok(_) => CompletenessStatus::Complete,
            Err(e) if e.incomplete => CompletenessStatus::Incomplete {
                indent: String::new(),
            },
            Err(_) => CompletenessStatus::Invalid,
        }
    }

    fn complete(&self, code: &str, cursor: usize) -> CompletionResult {
        let chars: Vec<char> = code.chars().collect();
        let cursor = cursor.min(chars.len());
        let mut start = cursor;
        while start > 0 && (chars[start - 1].is_alphanumeric() || chars[start - 1] == '_') {
            start -= 1;
        }
        let prefix: String = chars[start..cursor].iter().collect();

        let mut matches: Vec<String> = BUILTINS
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once("let".to_string()))
            .chain(self.vars().keys().cloned())
            .filter(|candidate| candidate.starts_with(&prefix))
            .collect();
        matches.sort();
        matches.dedup();

        CompletionResult {
            matches,
            cursor_start: start,
            cursor_end: cursor,
        }
    }

    fn list_errors(&self, code: &str) -> Vec<Diagnostic> {
        match parse(code) {
            Ok(_) => Vec::new(),
            Err(e) => vec![Diagnostic {
                message: e.message,
                severity: Severity::Error,
                start: e.start,
                end: e.end,
            }],
        }
    }

    fn context_token(&self) -> Option<String> {
        Some("calc".to_string())
    }

    fn on_shutdown(&self) {
        let mut vars = self.vars();
        tracing::debug!(variables = vars.len(), "calculator shutting down");
        vars.clear();
    }
}
