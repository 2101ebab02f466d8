//! Portable reference shader compiler.
//!
//! Stands in for the vendor compilers behind the [`ShaderCompiler`] seam. It
//! preprocesses HLSL-style source, checks its structure, reflects the global
//! uniforms into a constant table and emits a digest-stamped container that
//! [`ShaderCompiler::reflect`] and [`ShaderCompiler::disassemble`] read back.
//!
//! Diagnostics follow the fxc layout: `file(line): error X3000: message`.
//!
//! `#pragma scw_fault(mode)` makes the compiler misbehave the way unstable
//! native compilers do:
//!
//! - `panic`: the call faults.
//! - `abort`: the process aborts.
//! - `hang`: the call never returns.
//! - `attributes`: the call faults while `COMPILER_SUPPORTS_ATTRIBUTES` is non-zero.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use super::include::IncludeResolver;
use crate::job::CompileFlags;
use crate::result::{ConstantDesc, RegisterSet};

const MAX_INCLUDE_DEPTH: usize = 32;
const MAX_EXPANSION_DEPTH: usize = 32;
const DIGEST_LEN: usize = 32;

/// One entry of a native define list. The list must end with [`Define::END`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Define {
    pub name: Option<String>,
    pub definition: Option<String>,
}

impl Define {
    pub const END: Define = Define {
        name: None,
        definition: None,
    };

    pub fn new(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            definition: Some(definition.into()),
        }
    }

    pub fn is_end(&self) -> bool {
        self.name.is_none()
    }
}

/// Arguments of one native compile call.
#[derive(Debug, Clone, Copy)]
pub struct NativeRequest<'a> {
    pub source: &'a str,
    pub source_name: &'a str,
    pub entry: &'a str,
    pub profile: &'a str,
    pub flags: CompileFlags,
    pub defines: &'a [Define],
}

/// Successful native compile: bytecode plus any warning text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeOutput {
    pub bytecode: Vec<u8>,
    pub warnings: String,
}

/// A native shader compiler as seen by the backend adapters.
///
/// `Err` values carry developer-facing diagnostic text. Faults surface as panics
/// and are contained by [`guard`](super::fault::guard).
pub trait ShaderCompiler: Send {
    fn name(&self) -> &'static str;

    fn preprocess(
        &self,
        request: &NativeRequest<'_>,
        includes: &dyn IncludeResolver,
    ) -> Result<String, String>;

    fn compile(
        &self,
        request: &NativeRequest<'_>,
        includes: &dyn IncludeResolver,
    ) -> Result<NativeOutput, String>;

    fn reflect(&self, bytecode: &[u8]) -> Result<Vec<ConstantDesc>, String>;

    fn disassemble(&self, bytecode: &[u8]) -> Result<String, String>;
}

/// Bytecode dialect; fixes the container magic and accepted profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    D3D9,
    D3D10,
}

impl Dialect {
    fn magic(self) -> [u8; 4] {
        match self {
            Self::D3D9 => *b"SCW9",
            Self::D3D10 => *b"DXBC",
        }
    }

    fn accepts(self, profile: &str) -> bool {
        match self {
            Self::D3D9 => matches!(
                profile,
                "vs_2_0" | "vs_2_a" | "vs_3_0" | "ps_2_0" | "ps_2_a" | "ps_2_b" | "ps_3_0"
            ),
            Self::D3D10 => matches!(
                profile,
                "vs_4_0" | "ps_4_0" | "gs_4_0" | "vs_4_1" | "ps_4_1" | "gs_4_1"
            ),
        }
    }
}

/// Instruction slot limit for a profile.
fn instruction_limit(profile: &str) -> u32 {
    match profile {
        "ps_2_0" => 64,
        "vs_2_0" | "vs_2_a" => 256,
        "ps_2_a" | "ps_2_b" | "vs_3_0" | "ps_3_0" => 512,
        _ => u32::MAX,
    }
}

/// Shader type token stored in the container header.
fn version_token(profile: &str) -> u32 {
    let kind: u32 = match profile.get(..2) {
        Some("vs") => 0xFFFE,
        Some("ps") => 0xFFFF,
        _ => 0xFFFD,
    };
    let mut digits = profile.bytes().filter(u8::is_ascii_digit);
    let major = digits.next().map_or(0, |d| u32::from(d - b'0'));
    let minor = digits.next().map_or(0, |d| u32::from(d - b'0'));
    (kind << 16) | (major << 8) | minor
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultMode {
    Panic,
    Abort,
    Hang,
    Attributes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceLocation {
    file: String,
    line: usize,
}

fn error_at(loc: &SourceLocation, code: &str, message: impl AsRef<str>) -> String {
    format!("{}({}): error {}: {}", loc.file, loc.line, code, message.as_ref())
}

fn warning_at(loc: &SourceLocation, code: &str, message: impl AsRef<str>) -> String {
    format!("{}({}): warning {}: {}", loc.file, loc.line, code, message.as_ref())
}

struct Conditional {
    active: bool,
    parent_active: bool,
    taken: bool,
    seen_else: bool,
}

/// Preprocessed translation unit.
struct Preprocessed {
    text: String,
    locations: Vec<SourceLocation>,
    warnings: Vec<String>,
    fault: Option<FaultMode>,
    defines: HashMap<String, String>,
}

impl Preprocessed {
    fn location(&self, line: usize) -> SourceLocation {
        self.locations
            .get(line)
            .or_else(|| self.locations.last())
            .cloned()
            .unwrap_or(SourceLocation {
                file: String::new(),
                line: 1,
            })
    }
}

struct Preprocessor<'a> {
    includes: &'a dyn IncludeResolver,
    defines: HashMap<String, String>,
    once: HashSet<String>,
    text: String,
    locations: Vec<SourceLocation>,
    warnings: Vec<String>,
    fault: Option<FaultMode>,
}

impl<'a> Preprocessor<'a> {
    fn new(defines: &[Define], includes: &'a dyn IncludeResolver) -> Result<Self, String> {
        let mut table = HashMap::new();
        let mut terminated = false;
        for define in defines {
            if define.is_end() {
                terminated = true;
                break;
            }
            if let Some(name) = &define.name {
                table.insert(name.clone(), define.definition.clone().unwrap_or_default());
            }
        }
        if !terminated {
            return Err("error X1507: define list is not terminated".to_string());
        }
        Ok(Self {
            includes,
            defines: table,
            once: HashSet::new(),
            text: String::new(),
            locations: Vec::new(),
            warnings: Vec::new(),
            fault: None,
        })
    }

    fn run(mut self, file: &str, source: &str) -> Result<Preprocessed, String> {
        self.process(file, source, 0)?;
        Ok(Preprocessed {
            text: self.text,
            locations: self.locations,
            warnings: self.warnings,
            fault: self.fault,
            defines: self.defines,
        })
    }

    fn emit(&mut self, line: &str, loc: SourceLocation) {
        self.text.push_str(line);
        self.text.push('\n');
        self.locations.push(loc);
    }

    fn process(&mut self, file: &str, source: &str, depth: usize) -> Result<(), String> {
        let mut conditions: Vec<Conditional> = Vec::new();
        let mut last_line = 0;

        for (index, raw) in source.lines().enumerate() {
            let loc = SourceLocation {
                file: file.to_string(),
                line: index + 1,
            };
            last_line = index + 1;
            let active = conditions.iter().all(|c| c.active);
            let trimmed = raw.trim_start();

            let Some(directive) = trimmed.strip_prefix('#') else {
                if active {
                    let expanded = self.expand(raw, 0);
                    self.emit(&expanded, loc);
                } else {
                    self.emit("", loc);
                }
                continue;
            };

            let directive = directive.trim_start();
            let keyword_len = directive
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(directive.len());
            let (keyword, rest) = directive.split_at(keyword_len);
            let rest = strip_line_comment(rest).trim();

            match keyword {
                "ifdef" | "ifndef" => {
                    let defined = self.defines.contains_key(rest);
                    let taken = defined == (keyword == "ifdef");
                    conditions.push(Conditional {
                        active: active && taken,
                        parent_active: active,
                        taken,
                        seen_else: false,
                    });
                }
                "if" => {
                    let taken = if active {
                        self.evaluate(rest).map_err(|e| error_at(&loc, "X1017", e))?
                    } else {
                        false
                    };
                    conditions.push(Conditional {
                        active: active && taken,
                        parent_active: active,
                        taken,
                        seen_else: false,
                    });
                }
                "elif" => {
                    let Some(mut top) = conditions.pop() else {
                        return Err(error_at(&loc, "X1018", "#elif without matching #if"));
                    };
                    if top.seen_else {
                        return Err(error_at(&loc, "X1018", "#elif after #else"));
                    }
                    if top.taken || !top.parent_active {
                        top.active = false;
                    } else {
                        let taken = self.evaluate(rest).map_err(|e| error_at(&loc, "X1017", e))?;
                        top.active = taken;
                        top.taken = taken;
                    }
                    conditions.push(top);
                }
                "else" => {
                    let Some(top) = conditions.last_mut() else {
                        return Err(error_at(&loc, "X1018", "#else without matching #if"));
                    };
                    if top.seen_else {
                        return Err(error_at(&loc, "X1018", "duplicate #else"));
                    }
                    top.seen_else = true;
                    top.active = top.parent_active && !top.taken;
                    top.taken = true;
                }
                "endif" => {
                    if conditions.pop().is_none() {
                        return Err(error_at(&loc, "X1018", "unexpected #endif"));
                    }
                }
                _ if !active => {}
                "include" => {
                    self.emit("", loc.clone());
                    self.include(rest, &loc, depth)?;
                    continue;
                }
                "define" => self.define(rest, &loc)?,
                "undef" => {
                    self.defines.remove(rest);
                }
                "error" => {
                    return Err(error_at(&loc, "X1003", format!("#error directive: {rest}")));
                }
                "pragma" => self.pragma(rest, file, &loc),
                "line" | "" => {}
                other => {
                    return Err(error_at(
                        &loc,
                        "X1004",
                        format!("unknown preprocessor directive '#{other}'"),
                    ));
                }
            }
            self.emit("", loc);
        }

        if !conditions.is_empty() {
            let loc = SourceLocation {
                file: file.to_string(),
                line: last_line.max(1),
            };
            return Err(error_at(&loc, "X1004", "unexpected end of file in conditional"));
        }
        Ok(())
    }

    fn include(&mut self, target: &str, loc: &SourceLocation, depth: usize) -> Result<(), String> {
        let name = target
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .or_else(|| target.strip_prefix('<').and_then(|s| s.strip_suffix('>')))
            .ok_or_else(|| error_at(loc, "X1004", format!("malformed #include {target}")))?;

        if depth >= MAX_INCLUDE_DEPTH {
            return Err(error_at(loc, "X1505", "#include nested too deeply"));
        }
        if self.once.contains(name) {
            return Ok(());
        }
        let contents = self.includes.open(name).ok_or_else(|| {
            error_at(loc, "X1507", format!("failed to open source file: '{name}'"))
        })?;
        self.process(name, &contents, depth + 1)
    }

    fn define(&mut self, rest: &str, loc: &SourceLocation) -> Result<(), String> {
        let name_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        let (name, value) = rest.split_at(name_len);
        if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(error_at(loc, "X1008", "#define requires a macro name"));
        }
        if value.starts_with('(') {
            return Err(error_at(
                loc,
                "X1009",
                format!("function-like macro '{name}' is not supported"),
            ));
        }
        self.defines.insert(name.to_string(), value.trim().to_string());
        Ok(())
    }

    fn pragma(&mut self, rest: &str, file: &str, loc: &SourceLocation) {
        if rest == "once" {
            self.once.insert(file.to_string());
            return;
        }
        if let Some(mode) = rest
            .strip_prefix("scw_fault")
            .map(str::trim)
            .and_then(|s| s.strip_prefix('('))
            .and_then(|s| s.strip_suffix(')'))
        {
            self.fault = match mode.trim() {
                "panic" => Some(FaultMode::Panic),
                "abort" => Some(FaultMode::Abort),
                "hang" => Some(FaultMode::Hang),
                "attributes" => Some(FaultMode::Attributes),
                _ => self.fault,
            };
            return;
        }
        let known = ["pack_matrix", "warning", "def", "message"];
        let name: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if !known.contains(&name.as_str()) {
            self.warnings.push(warning_at(
                loc,
                "X3568",
                format!("'{name}' : unknown pragma ignored"),
            ));
        }
    }

    /// Expand object-like macros in one line.
    fn expand(&self, line: &str, depth: usize) -> String {
        let mut out = String::with_capacity(line.len());
        let mut chars = line.char_indices().peekable();
        while let Some((start, c)) = chars.next() {
            if c.is_ascii_alphabetic() || c == '_' {
                let mut end = start + c.len_utf8();
                while let Some(&(i, n)) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        end = i + n.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let ident = &line[start..end];
                match self.defines.get(ident) {
                    Some(value) if depth < MAX_EXPANSION_DEPTH => {
                        out.push_str(&self.expand(value, depth + 1));
                    }
                    _ => out.push_str(ident),
                }
            } else if c.is_ascii_digit() {
                out.push(c);
                while let Some(&(_, n)) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '.' {
                        out.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
            } else if c == '/' && chars.peek().map(|&(_, n)| n) == Some('/') {
                out.push_str(&line[start..]);
                break;
            } else {
                out.push(c);
            }
        }
        out
    }

    fn evaluate(&self, expr: &str) -> Result<bool, String> {
        let tokens = expr_tokens(expr)?;
        let mut parser = ExprParser {
            tokens: &tokens,
            pos: 0,
            defines: &self.defines,
            depth: 0,
        };
        let value = parser.or()?;
        if parser.pos != tokens.len() {
            return Err(format!("invalid integer constant expression '{expr}'"));
        }
        Ok(value != 0)
    }
}

fn strip_line_comment(s: &str) -> &str {
    match s.find("//") {
        Some(i) => &s[..i],
        None => s,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ExprToken {
    Num(i64),
    Ident(String),
    Op(&'static str),
}

fn expr_tokens(expr: &str) -> Result<Vec<ExprToken>, String> {
    const OPS: [&str; 16] = [
        "||", "&&", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "!", "(", ")",
    ];
    let mut tokens = Vec::new();
    let mut rest = expr.trim();
    while !rest.is_empty() {
        let c = rest.chars().next().unwrap_or(' ');
        if c.is_whitespace() {
            rest = rest.trim_start();
            continue;
        }
        if c.is_ascii_digit() {
            let len = rest
                .find(|c: char| !c.is_ascii_alphanumeric())
                .unwrap_or(rest.len());
            let digits = rest[..len].trim_end_matches(['u', 'U', 'l', 'L']);
            let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
                Some(hex) => i64::from_str_radix(hex, 16),
                None => digits.parse(),
            }
            .map_err(|_| format!("invalid integer constant '{}'", &rest[..len]))?;
            tokens.push(ExprToken::Num(value));
            rest = &rest[len..];
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let len = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            tokens.push(ExprToken::Ident(rest[..len].to_string()));
            rest = &rest[len..];
            continue;
        }
        let op = OPS
            .iter()
            .find(|op| rest.starts_with(**op))
            .ok_or_else(|| format!("unexpected character '{c}' in expression"))?;
        tokens.push(ExprToken::Op(op));
        rest = &rest[op.len()..];
    }
    Ok(tokens)
}

struct ExprParser<'t> {
    tokens: &'t [ExprToken],
    pos: usize,
    defines: &'t HashMap<String, String>,
    depth: usize,
}

impl ExprParser<'_> {
    fn peek_op(&self, op: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(ExprToken::Op(o)) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.peek_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> Result<i64, String> {
        let mut value = self.and()?;
        while self.eat_op("||") {
            let rhs = self.and()?;
            value = i64::from(value != 0 || rhs != 0);
        }
        Ok(value)
    }

    fn and(&mut self) -> Result<i64, String> {
        let mut value = self.equality()?;
        while self.eat_op("&&") {
            let rhs = self.equality()?;
            value = i64::from(value != 0 && rhs != 0);
        }
        Ok(value)
    }

    fn equality(&mut self) -> Result<i64, String> {
        let mut value = self.relational()?;
        loop {
            if self.eat_op("==") {
                value = i64::from(value == self.relational()?);
            } else if self.eat_op("!=") {
                value = i64::from(value != self.relational()?);
            } else {
                return Ok(value);
            }
        }
    }

    fn relational(&mut self) -> Result<i64, String> {
        let mut value = self.additive()?;
        loop {
            if self.eat_op("<=") {
                value = i64::from(value <= self.additive()?);
            } else if self.eat_op(">=") {
                value = i64::from(value >= self.additive()?);
            } else if self.eat_op("<") {
                value = i64::from(value < self.additive()?);
            } else if self.eat_op(">") {
                value = i64::from(value > self.additive()?);
            } else {
                return Ok(value);
            }
        }
    }

    fn additive(&mut self) -> Result<i64, String> {
        let mut value = self.multiplicative()?;
        loop {
            if self.eat_op("+") {
                value = value.wrapping_add(self.multiplicative()?);
            } else if self.eat_op("-") {
                value = value.wrapping_sub(self.multiplicative()?);
            } else {
                return Ok(value);
            }
        }
    }

    fn multiplicative(&mut self) -> Result<i64, String> {
        let mut value = self.unary()?;
        loop {
            let op = if self.eat_op("*") {
                "*"
            } else if self.eat_op("/") {
                "/"
            } else if self.eat_op("%") {
                "%"
            } else {
                return Ok(value);
            };
            let rhs = self.unary()?;
            value = match op {
                "*" => value.wrapping_mul(rhs),
                _ if rhs == 0 => return Err("division by zero in #if".to_string()),
                "/" => value / rhs,
                _ => value % rhs,
            };
        }
    }

    fn unary(&mut self) -> Result<i64, String> {
        if self.eat_op("!") {
            return Ok(i64::from(self.unary()? == 0));
        }
        if self.eat_op("-") {
            return Ok(self.unary()?.wrapping_neg());
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<i64, String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "unexpected end of expression".to_string())?;
        self.pos += 1;
        match token {
            ExprToken::Num(n) => Ok(n),
            ExprToken::Op("(") => {
                let value = self.or()?;
                if !self.eat_op(")") {
                    return Err("missing ')' in expression".to_string());
                }
                Ok(value)
            }
            ExprToken::Ident(name) if name == "defined" => {
                let parens = self.eat_op("(");
                let Some(ExprToken::Ident(target)) = self.tokens.get(self.pos).cloned() else {
                    return Err("'defined' requires an identifier".to_string());
                };
                self.pos += 1;
                if parens && !self.eat_op(")") {
                    return Err("missing ')' after defined".to_string());
                }
                Ok(i64::from(self.defines.contains_key(&target)))
            }
            ExprToken::Ident(name) => match self.defines.get(&name) {
                Some(value) if self.depth < MAX_EXPANSION_DEPTH && !value.trim().is_empty() => {
                    let tokens = expr_tokens(value)?;
                    let mut nested = ExprParser {
                        tokens: &tokens,
                        pos: 0,
                        defines: self.defines,
                        depth: self.depth + 1,
                    };
                    nested.or()
                }
                _ => Ok(0),
            },
            ExprToken::Op(op) => Err(format!("unexpected '{op}' in expression")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Ident,
    Number,
    Punct,
    Str,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    text: String,
    line: usize,
}

impl Token {
    fn is(&self, text: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == text
    }
}

const TWO_CHAR_PUNCT: [&str; 14] = [
    "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "&&", "||", "++", "--", "<<", ">>",
];
const ONE_CHAR_PUNCT: &str = "{}()[];,.:?+-*/%<>=!&|^~";

fn tokenize(unit: &Preprocessed) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = unit.text.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 0;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if c == '\n' {
            line += 1;
            i += 1;
        } else if c.is_whitespace() {
            i += 1;
        } else if c == '/' && next == Some('/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && next == Some('*') {
            let start_line = line;
            i += 2;
            loop {
                match chars.get(i) {
                    None => {
                        return Err(error_at(
                            &unit.location(start_line),
                            "X1004",
                            "unexpected end of file in comment",
                        ));
                    }
                    Some('*') if chars.get(i + 1) == Some(&'/') => {
                        i += 2;
                        break;
                    }
                    Some('\n') => {
                        line += 1;
                        i += 1;
                    }
                    Some(_) => i += 1,
                }
            }
        } else if c == '"' {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i] != '"' {
                if chars[i] == '\n' {
                    return Err(error_at(
                        &unit.location(line),
                        "X1010",
                        "newline in string constant",
                    ));
                }
                i += 1;
            }
            i += 1;
            tokens.push(Token {
                kind: TokenKind::Str,
                text: chars[start..i.min(chars.len())].iter().collect(),
                line,
            });
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Ident,
                text: chars[start..i].iter().collect(),
                line,
            });
        } else if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Number,
                text: chars[start..i].iter().collect(),
                line,
            });
        } else {
            let pair: String = chars[i..(i + 2).min(chars.len())].iter().collect();
            let text = if TWO_CHAR_PUNCT.contains(&pair.as_str()) {
                pair
            } else if ONE_CHAR_PUNCT.contains(c) {
                c.to_string()
            } else {
                return Err(error_at(
                    &unit.location(line),
                    "X3000",
                    format!("syntax error: unexpected character '{c}'"),
                ));
            };
            i += text.chars().count();
            tokens.push(Token {
                kind: TokenKind::Punct,
                text,
                line,
            });
        }
    }
    Ok(tokens)
}

/// Bracket balance and a few statement-level checks.
fn check_syntax(unit: &Preprocessed, tokens: &[Token]) -> Result<(), String> {
    let mut stack: Vec<&Token> = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Punct {
            continue;
        }
        match token.text.as_str() {
            "(" | "[" | "{" => stack.push(token),
            ")" | "]" | "}" => {
                let expected = match token.text.as_str() {
                    ")" => "(",
                    "]" => "[",
                    _ => "{",
                };
                match stack.pop() {
                    Some(open) if open.text == expected => {}
                    _ => {
                        return Err(error_at(
                            &unit.location(token.line),
                            "X3000",
                            format!("syntax error: unexpected token '{}'", token.text),
                        ));
                    }
                }
            }
            "=" => {
                if let Some(next) = tokens.get(i + 1)
                    && (next.is(";") || next.is(",") || next.is(")") || next.is("}"))
                {
                    return Err(error_at(
                        &unit.location(next.line),
                        "X3000",
                        format!("syntax error: unexpected token '{}'", next.text),
                    ));
                }
            }
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        let last_line = tokens.last().map_or(open.line, |t| t.line);
        return Err(error_at(
            &unit.location(last_line),
            "X3000",
            format!(
                "syntax error: unexpected end of file, unmatched '{}' opened on line {}",
                open.text,
                unit.location(open.line).line
            ),
        ));
    }
    Ok(())
}

/// Token range of the entry point body (exclusive of braces).
fn find_entry(tokens: &[Token], entry: &str) -> Option<(usize, usize)> {
    let mut depth = 0usize;
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        if token.is("{") || token.is("(") || token.is("[") {
            depth += 1;
        } else if token.is("}") || token.is(")") || token.is("]") {
            depth = depth.saturating_sub(1);
        } else if depth == 0
            && token.kind == TokenKind::Ident
            && token.text == entry
            && i > 0
            && tokens[i - 1].kind == TokenKind::Ident
            && tokens.get(i + 1).is_some_and(|t| t.is("("))
        {
            // Skip the parameter list.
            let mut j = i + 1;
            let mut parens = 0usize;
            while j < tokens.len() {
                if tokens[j].is("(") {
                    parens += 1;
                } else if tokens[j].is(")") {
                    parens -= 1;
                    if parens == 0 {
                        break;
                    }
                }
                j += 1;
            }
            // Optional `: SEMANTIC` before the body; a `;` means a prototype.
            while j < tokens.len() && !tokens[j].is("{") && !tokens[j].is(";") {
                j += 1;
            }
            if tokens.get(j).is_some_and(|t| t.is("{")) {
                let open = j;
                let mut braces = 0usize;
                while j < tokens.len() {
                    if tokens[j].is("{") {
                        braces += 1;
                    } else if tokens[j].is("}") {
                        braces -= 1;
                        if braces == 0 {
                            return Some((open + 1, j));
                        }
                    }
                    j += 1;
                }
            }
        }
        i += 1;
    }
    None
}

fn register_class(type_name: &str) -> (RegisterSet, u32) {
    let lower = type_name.to_ascii_lowercase();
    if lower.starts_with("sampler") || lower.starts_with("texture") {
        return (RegisterSet::Sampler, 1);
    }
    if lower.starts_with("bool") {
        return (RegisterSet::Bool, 1);
    }
    if lower.starts_with("int") || lower.starts_with("uint") {
        return (RegisterSet::Int4, 1);
    }
    if lower == "matrix" {
        return (RegisterSet::Float4, 4);
    }
    // floatRxC occupies R registers.
    let rows = lower
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .split_once('x')
        .and_then(|(rows, _)| rows.parse().ok())
        .unwrap_or(1);
    (RegisterSet::Float4, rows)
}

fn parse_declaration(tokens: &[&Token]) -> Option<(ConstantDesc, Option<u32>)> {
    const QUALIFIERS: [&str; 5] = ["uniform", "extern", "shared", "row_major", "column_major"];
    const SKIP: [&str; 6] = ["static", "const", "struct", "typedef", "groupshared", "cbuffer"];

    let tokens: Vec<&Token> = tokens
        .iter()
        .copied()
        .skip_while(|t| QUALIFIERS.contains(&t.text.as_str()))
        .collect();
    if tokens.iter().any(|t| SKIP.contains(&t.text.as_str())) {
        return None;
    }
    let (type_token, name_token) = (tokens.first()?, tokens.get(1)?);
    if type_token.kind != TokenKind::Ident || name_token.kind != TokenKind::Ident {
        return None;
    }
    if tokens.get(2).is_some_and(|t| t.is("(")) {
        return None;
    }

    let (register_set, mut count) = register_class(&type_token.text);
    let mut explicit = None;
    let mut i = 2;
    while i < tokens.len() {
        if tokens[i].is("[") {
            if let Some(n) = tokens.get(i + 1).and_then(|t| t.text.parse::<u32>().ok()) {
                count = count.saturating_mul(n.max(1));
            }
        } else if tokens[i].is(":")
            && tokens.get(i + 1).is_some_and(|t| t.text == "register")
            && let Some(reg) = tokens.get(i + 3)
        {
            explicit = reg
                .text
                .trim_start_matches(|c: char| c.is_ascii_alphabetic())
                .parse()
                .ok();
        } else if tokens[i].is("=") {
            break;
        }
        i += 1;
    }

    Some((
        ConstantDesc {
            name: name_token.text.clone(),
            register_set,
            register_index: 0,
            register_count: count,
        },
        explicit,
    ))
}

/// Reflect top-level uniforms (and `cbuffer` members) into a constant table.
fn collect_constants(unit: &Preprocessed, tokens: &[Token]) -> Result<Vec<ConstantDesc>, String> {
    let mut constants = Vec::new();
    let mut next_free: HashMap<RegisterSet, u32> = HashMap::new();
    let mut statement: Vec<&Token> = Vec::new();
    // Brace depth, and the depth at which declarations count as globals.
    let mut depth = 0usize;
    let mut parens = 0usize;
    let mut cbuffer_depths: Vec<usize> = Vec::new();
    let mut pending_cbuffer = false;

    for token in tokens {
        let global_scope = depth == 0 || cbuffer_depths.last() == Some(&depth);
        if token.is("{") {
            if global_scope && statement.first().is_some_and(|t| t.text == "cbuffer") {
                pending_cbuffer = true;
            }
            depth += 1;
            if pending_cbuffer {
                cbuffer_depths.push(depth);
                pending_cbuffer = false;
            }
            statement.clear();
            continue;
        }
        if token.is("}") {
            if cbuffer_depths.last() == Some(&depth) {
                cbuffer_depths.pop();
            }
            depth = depth.saturating_sub(1);
            statement.clear();
            continue;
        }
        if !global_scope {
            continue;
        }
        if token.is("(") {
            parens += 1;
        } else if token.is(")") {
            parens = parens.saturating_sub(1);
        }
        if token.is(";") && parens == 0 {
            if let Some((mut constant, explicit)) = parse_declaration(&statement) {
                let next = next_free.entry(constant.register_set).or_insert(0);
                constant.register_index = match explicit {
                    Some(index) => index,
                    None => {
                        let index = *next;
                        *next = index.checked_add(constant.register_count).ok_or_else(|| {
                            error_at(
                                &unit.location(statement[0].line),
                                "X4550",
                                format!("'{}': out of constant registers", constant.name),
                            )
                        })?;
                        index
                    }
                };
                constants.push(constant);
            }
            statement.clear();
        } else {
            statement.push(token);
        }
    }
    Ok(constants)
}

/// The reference compiler for one bytecode dialect.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceCompiler {
    dialect: Dialect,
}

impl ReferenceCompiler {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    fn run_preprocessor(
        &self,
        request: &NativeRequest<'_>,
        includes: &dyn IncludeResolver,
    ) -> Result<Preprocessed, String> {
        Preprocessor::new(request.defines, includes)?.run(request.source_name, request.source)
    }

    fn digest(unit: &Preprocessed, request: &NativeRequest<'_>) -> [u8; DIGEST_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(unit.text.as_bytes());
        hasher.update([0]);
        hasher.update(request.entry.as_bytes());
        hasher.update([0]);
        hasher.update(request.profile.as_bytes());
        hasher.update(request.flags.bits().to_le_bytes());
        hasher.finalize().into()
    }
}

const INVALID_BYTECODE: &str = "invalid bytecode";

struct Cursor<'b> {
    bytes: &'b [u8],
    pos: usize,
}

impl<'b> Cursor<'b> {
    fn take(&mut self, n: usize) -> Result<&'b [u8], String> {
        let end = self.pos.checked_add(n).ok_or(INVALID_BYTECODE)?;
        let slice = self.bytes.get(self.pos..end).ok_or(INVALID_BYTECODE)?;
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, String> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn string(&mut self) -> Result<String, String> {
        let len = self.u32()? as usize;
        String::from_utf8(self.take(len)?.to_vec()).map_err(|_| INVALID_BYTECODE.to_string())
    }
}

/// Decoded bytecode container.
struct Container {
    profile: String,
    flags: CompileFlags,
    instruction_slots: u32,
    constants: Vec<ConstantDesc>,
    digest: Vec<u8>,
}

impl Container {
    fn encode(&self, dialect: Dialect) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.constants.len() * 24);
        out.extend_from_slice(&dialect.magic());
        out.extend_from_slice(&version_token(&self.profile).to_le_bytes());
        out.extend_from_slice(&(self.profile.len() as u32).to_le_bytes());
        out.extend_from_slice(self.profile.as_bytes());
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.extend_from_slice(&self.instruction_slots.to_le_bytes());
        out.extend_from_slice(&(self.constants.len() as u32).to_le_bytes());
        for constant in &self.constants {
            out.extend_from_slice(&(constant.name.len() as u32).to_le_bytes());
            out.extend_from_slice(constant.name.as_bytes());
            out.push(constant.register_set.to_byte());
            out.extend_from_slice(&constant.register_index.to_le_bytes());
            out.extend_from_slice(&constant.register_count.to_le_bytes());
        }
        out.extend_from_slice(&self.digest);
        out
    }

    fn decode(dialect: Dialect, bytes: &[u8]) -> Result<Self, String> {
        let mut cursor = Cursor { bytes, pos: 0 };
        if cursor.take(4)? != dialect.magic() {
            return Err(INVALID_BYTECODE.to_string());
        }
        let _version = cursor.u32()?;
        let profile = cursor.string()?;
        let flags = CompileFlags::from_bits(cursor.u32()?);
        let instruction_slots = cursor.u32()?;
        let count = cursor.u32()? as usize;
        let mut constants = Vec::with_capacity(count.min(bytes.len() / 13));
        for _ in 0..count {
            let name = cursor.string()?;
            let register_set = RegisterSet::from_byte(cursor.take(1)?[0])
                .ok_or_else(|| INVALID_BYTECODE.to_string())?;
            constants.push(ConstantDesc {
                name,
                register_set,
                register_index: cursor.u32()?,
                register_count: cursor.u32()?,
            });
        }
        let digest = cursor.take(DIGEST_LEN)?.to_vec();
        if cursor.pos != bytes.len() {
            return Err(INVALID_BYTECODE.to_string());
        }
        Ok(Self {
            profile,
            flags,
            instruction_slots,
            constants,
            digest,
        })
    }
}

impl ShaderCompiler for ReferenceCompiler {
    fn name(&self) -> &'static str {
        match self.dialect {
            Dialect::D3D9 => "reference-d3d9",
            Dialect::D3D10 => "reference-d3d10",
        }
    }

    fn preprocess(
        &self,
        request: &NativeRequest<'_>,
        includes: &dyn IncludeResolver,
    ) -> Result<String, String> {
        self.run_preprocessor(request, includes).map(|unit| unit.text)
    }

    fn compile(
        &self,
        request: &NativeRequest<'_>,
        includes: &dyn IncludeResolver,
    ) -> Result<NativeOutput, String> {
        let unit = self.run_preprocessor(request, includes)?;

        match unit.fault {
            Some(FaultMode::Panic) => panic!("{}: internal compiler fault", request.source_name),
            Some(FaultMode::Abort) => std::process::abort(),
            Some(FaultMode::Hang) => loop {
                std::thread::sleep(std::time::Duration::from_secs(1));
            },
            Some(FaultMode::Attributes)
                if unit
                    .defines
                    .get("COMPILER_SUPPORTS_ATTRIBUTES")
                    .is_some_and(|v| v.trim() != "0") =>
            {
                panic!("{}: fault while parsing attributes", request.source_name)
            }
            _ => {}
        }

        if !self.dialect.accepts(request.profile) {
            return Err(format!(
                "{}: error X3523: invalid target profile '{}'",
                request.source_name, request.profile
            ));
        }

        let tokens = tokenize(&unit)?;
        check_syntax(&unit, &tokens)?;

        let (body_start, body_end) = find_entry(&tokens, request.entry).ok_or_else(|| {
            format!(
                "{}: error X3501: '{}': entrypoint not found",
                request.source_name, request.entry
            )
        })?;

        let statements = tokens[body_start..body_end]
            .iter()
            .filter(|t| t.is(";"))
            .count() as u32;
        let instruction_slots = statements + 1;
        let limit = instruction_limit(request.profile);
        if instruction_slots > limit {
            let loc = unit.location(tokens[body_start.saturating_sub(1)].line);
            return Err(error_at(
                &loc,
                "X5608",
                format!(
                    "Compiled shader code uses too many arithmetic instruction slots ({}). Max. allowed by the target ({}) is {}.",
                    instruction_slots, request.profile, limit
                ),
            ));
        }

        let container = Container {
            profile: request.profile.to_string(),
            flags: request.flags,
            instruction_slots,
            constants: collect_constants(&unit, &tokens)?,
            digest: Self::digest(&unit, request).to_vec(),
        };

        Ok(NativeOutput {
            bytecode: container.encode(self.dialect),
            warnings: unit.warnings.join("\n"),
        })
    }

    fn reflect(&self, bytecode: &[u8]) -> Result<Vec<ConstantDesc>, String> {
        Container::decode(self.dialect, bytecode).map(|c| c.constants)
    }

    fn disassemble(&self, bytecode: &[u8]) -> Result<String, String> {
        let container = Container::decode(self.dialect, bytecode)?;
        let mut out = String::new();
        let _ = writeln!(out, "//\n// Generated by scw {}\n//", self.name());
        if container.flags.contains(CompileFlags::USE_LEGACY_D3DX9_31_DLL) {
            let _ = writeln!(out, "// Compiled with the legacy compiler\n//");
        }
        if !container.constants.is_empty() {
            let width = container
                .constants
                .iter()
                .map(|c| c.name.len())
                .max()
                .unwrap_or(4)
                .max(4);
            let _ = writeln!(out, "// Registers:\n//");
            let _ = writeln!(out, "//   {:<width$} Reg   Size", "Name");
            let _ = writeln!(out, "//   {} ----- ----", "-".repeat(width));
            for c in &container.constants {
                let reg = format!("{}{}", c.register_set.prefix(), c.register_index);
                let _ = writeln!(out, "//   {:<width$} {:<5} {:>4}", c.name, reg, c.register_count);
            }
            let _ = writeln!(out, "//");
        }
        let _ = writeln!(out, "    {}", container.profile);
        let digest: String = container.digest.iter().map(|b| format!("{b:02x}")).collect();
        let _ = writeln!(out, "    // digest {digest}");
        let _ = writeln!(
            out,
            "// approximately {} instruction slots used",
            container.instruction_slots
        );
        Ok(out)
    }
}
