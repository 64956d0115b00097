//! LC-002: Restricted formula language.
//!
//! Formulas are arithmetic over named symbols: numeric literals, `+ - * /`,
//! exponentiation (`**` or `^`, right-associative), parentheses, unary sign,
//! and a fixed allow-list of one-argument math functions. Evaluation reads
//! only the symbol table it is handed; there is no other environment.
//!
//! Identifiers are `[A-Za-z_][A-Za-z0-9_]*`. Number tokens are consumed
//! greedily, so `1e5` is a literal and never contains an identifier `e5`.
//! Renaming works on tokens, not substrings, so renaming `x` leaves `x2`
//! untouched.

use super::error::{EngineError, Result};
use super::types::SymbolTable;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Deepest allowed nesting of parentheses, signs, and exponents.
pub const MAX_DEPTH: usize = 256;

/// Longest allowed formula, in tokens.
pub const MAX_TOKENS: usize = 4096;

/// Functions callable from formulas.
pub const FUNCTIONS: &[&str] = &[
    "sqrt", "exp", "ln", "log", "log10", "abs", "sin", "cos", "tan", "floor", "ceil",
];

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

/// Whether `name` matches the identifier grammar.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Whether `name` can name a parameter: an identifier that is not a function.
pub fn is_valid_parameter_name(name: &str) -> bool {
    is_identifier(name) && !FUNCTIONS.contains(&name)
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Ident,
    Plus,
    Minus,
    Star,
    Slash,
    Pow,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

fn tokenize(src: &str) -> std::result::Result<Vec<Token>, String> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        let kind = match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'/' => TokenKind::Slash,
            b'^' => TokenKind::Pow,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'*' => {
                if bytes.get(i + 1) == Some(&b'*') {
                    i += 1;
                    TokenKind::Pow
                } else {
                    TokenKind::Star
                }
            }
            b'0'..=b'9' | b'.' => {
                i = scan_number(bytes, i);
                let text = &src[start..i];
                let value = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}' at {}", text, start))?;
                tokens.push(Token {
                    kind: TokenKind::Number(value),
                    start,
                    end: i,
                });
                continue;
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident,
                    start,
                    end: i,
                });
                continue;
            }
            _ => {
                let ch = src[start..].chars().next().unwrap_or('?');
                return Err(format!("unexpected character '{}' at {}", ch, start));
            }
        };
        i += 1;
        tokens.push(Token {
            kind,
            start,
            end: i,
        });
    }

    Ok(tokens)
}

/// Scan digits, an optional fraction, and an optional exponent. Returns the end index.
fn scan_number(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    i
}

// ============================================================================
// AST + parser
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Sqrt,
    Exp,
    Ln,
    Log10,
    Abs,
    Sin,
    Cos,
    Tan,
    Floor,
    Ceil,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "sqrt" => Self::Sqrt,
            "exp" => Self::Exp,
            "ln" | "log" => Self::Ln,
            "log10" => Self::Log10,
            "abs" => Self::Abs,
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            _ => return None,
        })
    }

    fn apply(self, x: f64) -> f64 {
        match self {
            Self::Sqrt => x.sqrt(),
            Self::Exp => x.exp(),
            Self::Ln => x.ln(),
            Self::Log10 => x.log10(),
            Self::Abs => x.abs(),
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Tan => x.tan(),
            Self::Floor => x.floor(),
            Self::Ceil => x.ceil(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Symbol(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        func: Func,
        arg: Box<Expr>,
    },
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect_rparen(&mut self) -> std::result::Result<(), String> {
        match self.bump() {
            Some(Token {
                kind: TokenKind::RParen,
                ..
            }) => Ok(()),
            Some(t) => Err(format!("expected ')' at {}", t.start)),
            None => Err("expected ')' at end of formula".to_string()),
        }
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Star) => BinOp::Mul,
                Some(TokenKind::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    // unary := ('-' | '+') unary | power
    fn unary(&mut self) -> std::result::Result<Expr, String> {
        // Every recursive path (sign, exponent, parenthesis, call) passes here
        if self.depth >= MAX_DEPTH {
            return Err(format!("nesting deeper than {} levels", MAX_DEPTH));
        }
        self.depth += 1;
        let result = self.signed();
        self.depth -= 1;
        result
    }

    fn signed(&mut self) -> std::result::Result<Expr, String> {
        match self.peek() {
            Some(TokenKind::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(TokenKind::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    // power := primary (pow unary)?   right-associative, so -2**2 == -(2**2)
    fn power(&mut self) -> std::result::Result<Expr, String> {
        let base = self.primary()?;
        if self.peek() == Some(&TokenKind::Pow) {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                lhs: Box::new(base),
                rhs: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn primary(&mut self) -> std::result::Result<Expr, String> {
        let token = self
            .bump()
            .ok_or_else(|| "unexpected end of formula".to_string())?;
        match token.kind {
            TokenKind::Number(v) => Ok(Expr::Number(v)),
            TokenKind::Ident => {
                let name = &self.src[token.start..token.end];
                if self.peek() == Some(&TokenKind::LParen) {
                    let func = Func::lookup(name)
                        .ok_or_else(|| format!("unknown function '{}'", name))?;
                    self.pos += 1;
                    let arg = self.expr()?;
                    self.expect_rparen()?;
                    return Ok(Expr::Call {
                        func,
                        arg: Box::new(arg),
                    });
                }
                if FUNCTIONS.contains(&name) {
                    return Err(format!("function '{}' used without arguments", name));
                }
                Ok(Expr::Symbol(name.to_string()))
            }
            TokenKind::LParen => {
                let inner = self.expr()?;
                self.expect_rparen()?;
                Ok(inner)
            }
            _ => Err(format!(
                "unexpected '{}' at {}",
                &self.src[token.start..token.end],
                token.start
            )),
        }
    }
}

impl Expr {
    fn collect_symbols(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Number(_) => {}
            Self::Symbol(name) => {
                out.insert(name.clone());
            }
            Self::Neg(inner) => inner.collect_symbols(out),
            Self::Binary { lhs, rhs, .. } => {
                lhs.collect_symbols(out);
                rhs.collect_symbols(out);
            }
            Self::Call { arg, .. } => arg.collect_symbols(out),
        }
    }

    /// Evaluate against `table`. Callers check symbol coverage first.
    fn eval(&self, table: &SymbolTable) -> f64 {
        match self {
            Self::Number(v) => *v,
            Self::Symbol(name) => table.get(name).copied().unwrap_or(f64::NAN),
            Self::Neg(inner) => -inner.eval(table),
            Self::Binary { op, lhs, rhs } => {
                let (a, b) = (lhs.eval(table), rhs.eval(table));
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::Pow => a.powf(b),
                }
            }
            Self::Call { func, arg } => func.apply(arg.eval(table)),
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

/// A parsed formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    /// Parse formula text.
    pub fn parse(src: &str) -> Result<Self> {
        let tokens = tokenize(src).map_err(|m| EngineError::formula(src, m))?;
        if tokens.is_empty() {
            return Err(EngineError::formula(src, "empty formula"));
        }
        if tokens.len() > MAX_TOKENS {
            return Err(EngineError::formula(
                src,
                format!("{} tokens exceeds the limit of {}", tokens.len(), MAX_TOKENS),
            ));
        }
        let mut parser = Parser {
            src,
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr().map_err(|m| EngineError::formula(src, m))?;
        if let Some(extra) = parser.tokens.get(parser.pos) {
            return Err(EngineError::formula(
                src,
                format!("unexpected '{}' at {}", &src[extra.start..extra.end], extra.start),
            ));
        }
        Ok(Self {
            source: src.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every symbol the formula references.
    pub fn symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.expr.collect_symbols(&mut out);
        out
    }

    /// Evaluate against `table`. Reports every unresolved symbol at once.
    pub fn evaluate(&self, table: &SymbolTable) -> Result<f64> {
        let missing: Vec<String> = self
            .symbols()
            .into_iter()
            .filter(|s| !table.contains_key(s))
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::missing(missing));
        }
        let value = self.expr.eval(table);
        if !value.is_finite() {
            return Err(EngineError::formula(
                &self.source,
                format!("evaluates to non-finite value {}", value),
            ));
        }
        Ok(value)
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(src: &str, table: &SymbolTable) -> Result<f64> {
    Formula::parse(src)?.evaluate(table)
}

/// Symbols referenced by formula text.
pub fn symbols(src: &str) -> Result<BTreeSet<String>> {
    Ok(Formula::parse(src)?.symbols())
}

/// Whether formula text references `name` as a whole symbol.
pub fn references(src: &str, name: &str) -> Result<bool> {
    Ok(symbols(src)?.contains(name))
}

/// Replace every symbol token equal to `old` with `new`, leaving all other text intact.
pub fn rename_symbol(src: &str, old: &str, new: &str) -> Result<String> {
    if !is_valid_parameter_name(new) {
        return Err(EngineError::InvalidName(new.to_string()));
    }
    let tokens = tokenize(src).map_err(|m| EngineError::formula(src, m))?;
    let mut out = String::with_capacity(src.len());
    let mut last = 0;
    for (idx, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Ident || &src[token.start..token.end] != old {
            continue;
        }
        let is_call = tokens
            .get(idx + 1)
            .is_some_and(|next| next.kind == TokenKind::LParen);
        if is_call {
            continue;
        }
        out.push_str(&src[last..token.start]);
        out.push_str(new);
        last = token.end;
    }
    out.push_str(&src[last..]);
    Ok(out)
}
