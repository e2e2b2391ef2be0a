//! # vBulletin Reference Fixer (vbfix)
//!
//! A CLI tool that rewrites deprecated assign/pass-by-reference constructs
//! in vBulletin PHP sources. It scans files on disk and, optionally, plugin
//! code stored in the forum's MySQL database.
//!
//! ## Overview
//!
//! PHP 5 deprecated `$obj =& new ClassName()` in favor of plain assignment,
//! and passing the engine globals `$vbulletin` / `$db` by reference has been
//! pointless since objects became reference types. `vbfix` finds both
//! constructs with a per-line token scan and offers the corrected text,
//! either interactively, as a generated `.patch` plus in-place overwrite, or
//! as a database field update.
//!
//! ## Key Components
//!
//! - **Tokenizer**: a lossless line lexer classifying PHP tokens (variables,
//!   keywords, operators, punctuation, comments, literals).
//! - **Inspections**: named rewrite rules, each a small per-line state
//!   machine consuming one token at a time.
//! - **ChangeSet**: original lines, rewritten lines, and the indices that
//!   differ, collected per source unit before anything is written.
//! - **Application strategies**: interactive confirm-per-line, unconditional
//!   patch-and-overwrite, or a plugin field update in the database.
//!
//! ## Algorithm Flow
//!
//! ```text
//! Input → Discovery → Per-line Inspection → ChangeSet → Apply
//!                           ↓
//!                     For each line:
//!                       - tokenize
//!                       - split bundled punctuation
//!                       - run each enabled inspection's state machine
//!                       - mark dirty when the text changed
//! ```
//!
//! ## Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | General error (file not found, permission denied, I/O error) |
//! | 2 | Invalid command-line arguments |
//! | 3 | Dry-run mode: changes would be made |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand, ValueEnum};
use encoding_rs::Encoding;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use logos::Logos;
use rich_rust::terminal;
use rich_rust::{ColorSystem, Console};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::{MySqlPool, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use time::macros::format_description;

// ─────────────────────────────────────────────────────────────────────────────
// Exit Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Semantic exit codes for scripting and CI integration
mod exit_codes {
    /// Success - completed without errors
    pub const SUCCESS: i32 = 0;
    /// General error (file not found, permission denied, I/O error)
    pub const ERROR: i32 = 1;
    /// Invalid command-line arguments
    pub const INVALID_ARGS: i32 = 2;
    /// Dry-run mode: changes would be made
    pub const WOULD_CHANGE: i32 = 3;
}

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Recoverable per-unit failure: the unit (one file, one config read, one
/// database connection) is reported and skipped, processing continues.
#[derive(Debug)]
struct WontFix(String);

impl fmt::Display for WontFix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for WontFix {}

#[derive(Debug)]
struct ArgError(String);

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ArgError {}

fn error_chain_has<T: std::error::Error + 'static>(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<T>())
}

fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    if error_chain_has::<ArgError>(err) {
        exit_codes::INVALID_ARGS
    } else {
        exit_codes::ERROR
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Token Model
// ─────────────────────────────────────────────────────────────────────────────

/// Classification of a lexical token.
///
/// The taxonomy mirrors what a PHP highlighter emits: enough to drive the
/// rewrite rules, nowhere near a full grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    /// `$name` style variable
    Variable,
    /// Reserved word of the language
    Keyword,
    /// Class, function or constant name
    Name,
    /// Operator text such as `=`, `=&`, `&`, `->`
    Operator,
    /// Bracket, brace, semicolon or comma; may bundle several characters
    Punctuation,
    /// Line or block comment
    Comment,
    /// `<?php` / `?>` markers
    Preprocessor,
    /// Whitespace and anything the lexer cannot classify
    Text,
    /// Quoted string literal, quotes included
    Str,
    /// Integer literal
    Int,
    /// Floating point literal
    Float,
}

/// One classified lexical unit. Concatenating `text` over a line's token
/// stream reconstructs the line exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Token<'a> {
    kind: TokenKind,
    text: &'a str,
}

/// Raw lexer patterns. Punctuation deliberately matches runs, the way
/// highlighter lexers bundle `");"` into one token; consumers that need
/// single characters must split (see `feed_line`).
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
enum RawToken {
    #[token("<?php", priority = 15)]
    #[token("<?", priority = 15)]
    #[token("?>", priority = 15)]
    OpenClose,

    #[regex(r"//[^\n]*", priority = 20)]
    #[regex(r"#[^\n]*", priority = 20)]
    LineComment,

    #[regex(r"/\*([^*]|\*[^/])*\*/", priority = 20)]
    BlockComment,

    #[regex(r"\$[a-zA-Z_][a-zA-Z0-9_]*")]
    Variable,

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    #[regex(r"'([^'\\]|\\.)*'")]
    #[regex(r#""([^"\\]|\\.)*""#)]
    Quoted,

    #[regex(r"[0-9]+\.[0-9]+", priority = 5)]
    Float,

    #[regex(r"[0-9]+", priority = 4)]
    Integer,

    #[token("=&", priority = 10)]
    AssignRef,

    #[regex(r"[=+\-*/%.<>!^|~@?:&]+", priority = 3)]
    Operator,

    #[regex(r"[(){}\[\];,]+")]
    Punctuation,

    #[regex(r"[ \t\r\n]+")]
    Whitespace,
}

/// Reserved words recognized by the lexer. Matching is case-insensitive,
/// as in PHP itself.
const PHP_KEYWORDS: &[&str] = &[
    "abstract", "and", "array", "as", "break", "case", "class", "clone",
    "const", "continue", "declare", "default", "die", "do", "echo", "else",
    "elseif", "empty", "exit", "extends", "false", "final", "for", "foreach",
    "function", "global", "if", "implements", "include", "include_once",
    "interface", "isset", "list", "new", "null", "or", "print", "private",
    "protected", "public", "require", "require_once", "return", "static",
    "switch", "throw", "true", "try", "unset", "var", "while", "xor",
];

fn classify_ident(text: &str) -> TokenKind {
    let lowered = text.to_ascii_lowercase();
    if PHP_KEYWORDS.contains(&lowered.as_str()) {
        TokenKind::Keyword
    } else {
        TokenKind::Name
    }
}

/// Tokenize one line of PHP source. Lossless: unlexable bytes degrade to
/// `Text` tokens instead of being dropped.
fn tokenize(line: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut lexer = RawToken::lexer(line);
    while let Some(step) = lexer.next() {
        let text = lexer.slice();
        let kind = match step {
            Ok(RawToken::OpenClose) => TokenKind::Preprocessor,
            Ok(RawToken::LineComment) | Ok(RawToken::BlockComment) => TokenKind::Comment,
            Ok(RawToken::Variable) => TokenKind::Variable,
            Ok(RawToken::Ident) => classify_ident(text),
            Ok(RawToken::Quoted) => TokenKind::Str,
            Ok(RawToken::Float) => TokenKind::Float,
            Ok(RawToken::Integer) => TokenKind::Int,
            Ok(RawToken::AssignRef) | Ok(RawToken::Operator) => TokenKind::Operator,
            Ok(RawToken::Punctuation) => TokenKind::Punctuation,
            Ok(RawToken::Whitespace) => TokenKind::Text,
            Err(()) => TokenKind::Text,
        };
        tokens.push(Token { kind, text });
    }
    tokens
}

// ─────────────────────────────────────────────────────────────────────────────
// Reference-Assignment Inspection
// ─────────────────────────────────────────────────────────────────────────────

/// Engine globals that must never be passed by reference.
const RESERVED_GLOBALS: &[&str] = &["$vbulletin", "$db"];

/// Count of fixes applied, by rule.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct FixCounts {
    /// `=& new ClassName(...)` rewritten to `= new ClassName(...)`
    assign_new: usize,
    /// `&$vbulletin` / `&$db` rewritten to a plain-value pass
    ref_global: usize,
}

impl FixCounts {
    fn merge(&mut self, other: FixCounts) {
        self.assign_new += other.assign_new;
        self.ref_global += other.ref_global;
    }

    fn total(&self) -> usize {
        self.assign_new + self.ref_global
    }
}

/// Per-line state for the reference-assignment inspection. A fresh value is
/// built for every line/inspection pair; nothing carries across lines.
#[derive(Debug, Clone, PartialEq)]
struct RefAssignContext {
    /// Current best-known text of the line, patched in place as fixes land
    line: String,
    /// Most recent keyword or name token, a candidate callee
    last_function: Option<String>,
    /// True while nested inside a detected call's parentheses
    in_function_call: bool,
    /// Callee names pushed on `(` and popped on `)`. Tracked but not yet
    /// consulted by either rule; future inspections may condition on it.
    call_stack: Vec<String>,
    /// True while the tokens since the last `=&` still look like a single
    /// assignment right-hand side
    is_assign: bool,
    /// Token texts accumulated since `=&`, used to reconstruct the exact
    /// substring to replace
    assign_text: Vec<String>,
    /// True immediately after a lone `&` operator
    is_amp: bool,
    fixes: FixCounts,
}

impl RefAssignContext {
    fn new(line: &str) -> Self {
        Self {
            line: line.to_string(),
            last_function: None,
            in_function_call: false,
            call_stack: Vec::new(),
            is_assign: false,
            assign_text: Vec::new(),
            is_amp: false,
            fixes: FixCounts::default(),
        }
    }

    /// Advance the state machine by one token.
    ///
    /// Fire conditions are evaluated against the incoming state before any
    /// field is updated for the current token; `assign_text` accumulates
    /// before `is_assign` is recomputed. Changing that order changes which
    /// substring gets replaced.
    fn step(&mut self, token: &Token<'_>) {
        if matches!(token.kind, TokenKind::Comment | TokenKind::Preprocessor) {
            return;
        }

        let is_variable = token.kind == TokenKind::Variable;
        let is_keyword = token.kind == TokenKind::Keyword;
        let is_name = token.kind == TokenKind::Name;
        let is_operator = token.kind == TokenKind::Operator;
        let is_open_bracket = token.kind == TokenKind::Punctuation && token.text.starts_with('(');
        let is_close_bracket = token.kind == TokenKind::Punctuation && token.text.starts_with(')');
        let is_assign_ref = is_operator && token.text == "=&";

        let fires_assign_new = self.is_assign && is_keyword && token.text == "new";
        let fires_ref_global = self.is_amp && is_variable && RESERVED_GLOBALS.contains(&token.text);

        if self.is_assign {
            self.assign_text.push(token.text.to_string());
        }
        self.is_assign = (self.is_assign && token.kind == TokenKind::Text) || is_assign_ref;
        if is_assign_ref {
            self.assign_text = vec![token.text.to_string()];
        }
        self.is_amp = is_operator && token.text == "&";

        if fires_assign_new {
            let needle = self.assign_text.concat();
            self.line = self.line.replacen(&needle, "= new", 1);
            self.fixes.assign_new += 1;
        }
        if fires_ref_global {
            let needle = format!("&{}", token.text);
            self.line = self.line.replacen(&needle, token.text, 1);
            self.fixes.ref_global += 1;
        }

        if is_open_bracket {
            if let Some(name) = &self.last_function {
                self.in_function_call = true;
                self.call_stack.push(name.clone());
            }
        }
        if is_close_bracket && self.in_function_call {
            self.call_stack.pop();
            self.in_function_call = !self.call_stack.is_empty();
        }
        if is_keyword || is_name {
            self.last_function = Some(token.text.to_string());
        }
    }
}

/// Feed a line's full token stream into a context, splitting bundled
/// punctuation into single-character tokens first. The lexer may emit
/// `");"` as one token; the state machine's bracket bookkeeping needs the
/// characters one at a time.
fn feed_line(ctx: &mut RefAssignContext, line: &str) {
    for token in tokenize(line) {
        if token.kind == TokenKind::Punctuation && token.text.chars().count() > 1 {
            for (start, ch) in token.text.char_indices() {
                ctx.step(&Token {
                    kind: TokenKind::Punctuation,
                    text: &token.text[start..start + ch.len_utf8()],
                });
            }
        } else {
            ctx.step(&token);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inspections
// ─────────────────────────────────────────────────────────────────────────────

/// The closed set of rewrite rules. The CLI and config file can only enable
/// names from this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Inspection {
    /// Deprecated `=& new` assignments and by-reference passes of the
    /// engine globals
    AssignByReference,
}

impl Inspection {
    /// Every known inspection, in application order.
    const ALL: [Inspection; 1] = [Inspection::AssignByReference];

    fn name(&self) -> &'static str {
        match self {
            Inspection::AssignByReference => "assign-by-reference",
        }
    }

    /// Run this inspection's state machine over one line and return the
    /// possibly-rewritten text.
    fn rewrite_line(&self, line: &str) -> (String, FixCounts) {
        match self {
            Inspection::AssignByReference => {
                let mut ctx = RefAssignContext::new(line);
                feed_line(&mut ctx, line);
                (ctx.line, ctx.fixes)
            }
        }
    }
}

/// Resolve the enabled inspection list: an explicit selection, or all of
/// them.
fn enabled_inspections(selected: &[Inspection]) -> Vec<Inspection> {
    if selected.is_empty() {
        Inspection::ALL.to_vec()
    } else {
        selected.to_vec()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Line Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Split text into lines, keeping each line's original terminator attached.
fn split_lines_keep_ends(text: &str) -> Vec<String> {
    text.split_inclusive('\n').map(String::from).collect()
}

/// Normalize stored plugin code into lines with a uniform `\n` terminator,
/// matching how the code is later rejoined for the database field.
fn plugin_code_lines(code: &str) -> Vec<String> {
    code.lines().map(|line| format!("{line}\n")).collect()
}

/// The accumulated rewrite decision for one source unit: full before and
/// after buffers plus the indices that differ.
///
/// Invariants: `original` and `rewritten` have equal length; `dirty` is
/// ascending and duplicate-free; an index is in `dirty` exactly when the
/// two buffers disagree at it.
#[derive(Debug, Clone, PartialEq)]
struct ChangeSet {
    original: Vec<String>,
    rewritten: Vec<String>,
    dirty: Vec<usize>,
    fixes: FixCounts,
}

impl ChangeSet {
    fn is_clean(&self) -> bool {
        self.dirty.is_empty()
    }
}

/// Run every enabled inspection over every line and collect the unit's
/// ChangeSet. Inspections chain: each consumes the previous one's output
/// line, re-tokenized from scratch.
fn run_inspections(lines: &[String], inspections: &[Inspection]) -> ChangeSet {
    let mut rewritten = Vec::with_capacity(lines.len());
    let mut dirty = Vec::new();
    let mut fixes = FixCounts::default();

    for (idx, original) in lines.iter().enumerate() {
        let mut line = original.clone();
        for inspection in inspections {
            let (next, line_fixes) = inspection.rewrite_line(&line);
            fixes.merge(line_fixes);
            line = next;
        }
        if &line != original {
            dirty.push(idx);
        }
        rewritten.push(line);
    }

    ChangeSet {
        original: lines.to_vec(),
        rewritten,
        dirty,
        fixes,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum file size (100 MB) - reject larger files to prevent memory issues
const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Resolve a user-supplied charset label, defaulting to UTF-8.
fn resolve_charset(label: Option<&str>) -> Result<&'static Encoding> {
    match label {
        Some(label) => Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| WontFix(format!("unknown charset '{label}'")).into()),
        None => Ok(encoding_rs::UTF_8),
    }
}

/// Read a source file and split it into terminator-preserving lines.
/// Returns the encoding the bytes actually decoded with, so the write side
/// can round-trip it.
fn read_unit(path: &Path, charset: Option<&str>) -> Result<(Vec<String>, &'static Encoding)> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read file metadata: {}", path.display()))?;
    if metadata.len() > MAX_FILE_SIZE {
        return Err(WontFix(format!(
            "file too large: {} ({} MB)",
            path.display(),
            metadata.len() / (1024 * 1024)
        ))
        .into());
    }

    let bytes =
        fs::read(path).with_context(|| format!("Failed to read file: {}", path.display()))?;
    let encoding = resolve_charset(charset)?;
    let (text, actual, had_errors) = encoding.decode(&bytes);
    if had_errors {
        return Err(WontFix(format!(
            "encoding problem in {} (try --charset)",
            path.display()
        ))
        .into());
    }

    Ok((split_lines_keep_ends(&text), actual))
}

/// Write text back in the same encoding the unit was read with.
fn write_encoded(path: &Path, text: &str, encoding: &'static Encoding) -> Result<()> {
    let (bytes, _, _) = encoding.encode(text);
    fs::write(path, &bytes).with_context(|| format!("Failed to write {}", path.display()))
}

// ─────────────────────────────────────────────────────────────────────────────
// vBulletin Config Reader
// ─────────────────────────────────────────────────────────────────────────────

/// A scalar value found on the right-hand side of a `$config[...]`
/// assignment.
#[derive(Debug, Clone, PartialEq)]
enum ConfigScalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

/// Nested string-keyed mapping extracted from `includes/config.php`.
/// Leaves hold the ordered scalar list of one assignment.
#[derive(Debug, Default)]
struct ConfigTree {
    children: BTreeMap<String, ConfigTree>,
    values: Vec<ConfigScalar>,
}

impl ConfigTree {
    fn insert(&mut self, path: &[String], values: Vec<ConfigScalar>) {
        match path {
            [] => self.values = values,
            [head, rest @ ..] => self
                .children
                .entry(head.clone())
                .or_default()
                .insert(rest, values),
        }
    }

    fn get(&self, path: &[&str]) -> Option<&ConfigTree> {
        path.iter()
            .try_fold(self, |node, key| node.children.get(*key))
    }

    fn first_str(&self, path: &[&str]) -> Option<&str> {
        match self.get(path)?.values.first()? {
            ConfigScalar::Str(s) => Some(s),
            _ => None,
        }
    }

    fn first_int(&self, path: &[&str]) -> Option<i64> {
        match self.get(path)?.values.first()? {
            ConfigScalar::Int(i) => Some(*i),
            ConfigScalar::Str(s) => s.parse().ok(),
            _ => None,
        }
    }
}

fn dequote(text: &str) -> String {
    if text.len() >= 2 {
        text[1..text.len() - 1].to_string()
    } else {
        text.to_string()
    }
}

fn scalar_from_token(kind: TokenKind, text: &str) -> Option<ConfigScalar> {
    match kind {
        TokenKind::Int => text.parse().ok().map(ConfigScalar::Int),
        TokenKind::Float => text.parse().ok().map(ConfigScalar::Float),
        TokenKind::Str => Some(ConfigScalar::Str(dequote(text))),
        TokenKind::Keyword => match text.to_ascii_lowercase().as_str() {
            "true" => Some(ConfigScalar::Bool(true)),
            "false" => Some(ConfigScalar::Bool(false)),
            "null" => Some(ConfigScalar::Null),
            _ => None,
        },
        _ => None,
    }
}

/// Scan one line for a `$config['Group']['key'] = value;` assignment.
/// Comment lines are skipped wholesale. Returns the bracket path and the
/// scalar values, or None when the line is not a config assignment.
fn scan_config_line(line: &str) -> Option<(Vec<String>, Vec<ConfigScalar>)> {
    let mut in_config = false;
    let mut group: Vec<String> = Vec::new();
    let mut group_ended = false;
    let mut values: Vec<ConfigScalar> = Vec::new();

    for token in tokenize(line) {
        if matches!(token.kind, TokenKind::Comment | TokenKind::Preprocessor) {
            return None;
        }
        if in_config && token.kind == TokenKind::Punctuation && token.text.contains(';') {
            in_config = false;
        }
        if in_config && !group_ended && token.kind == TokenKind::Str {
            group.push(dequote(token.text));
        }
        if in_config && group_ended && token.kind != TokenKind::Text {
            if let Some(scalar) = scalar_from_token(token.kind, token.text) {
                values.push(scalar);
            }
        }
        if in_config && token.kind == TokenKind::Operator && token.text == "=" {
            group_ended = true;
        }
        if token.kind == TokenKind::Variable && token.text == "$config" {
            in_config = true;
        }
    }

    if group.is_empty() { None } else { Some((group, values)) }
}

/// Build the nested config mapping from the file's lines.
fn parse_vb_config(lines: &[String]) -> ConfigTree {
    let mut tree = ConfigTree::default();
    for line in lines {
        if let Some((path, values)) = scan_config_line(line) {
            tree.insert(&path, values);
        }
    }
    tree
}

/// Read and parse a vBulletin `config.php`.
fn read_vb_config(path: &Path, charset: Option<&str>) -> Result<ConfigTree> {
    let (lines, _) = read_unit(path, charset)?;
    Ok(parse_vb_config(&lines))
}

/// Connection settings extracted from a parsed config.
#[derive(Debug, Clone, PartialEq)]
struct DbCredentials {
    database: String,
    host: String,
    port: u16,
    user: String,
    password: String,
    charset: Option<String>,
    table_prefix: String,
}

/// Pull database credentials out of the config mapping. Database name and
/// username are mandatory; everything else has the stock vBulletin
/// defaults.
fn credentials_from_config(config: &ConfigTree) -> Result<DbCredentials> {
    let database = config
        .first_str(&["Database", "dbname"])
        .ok_or_else(|| WontFix("no database name in config".to_string()))?
        .to_string();
    let user = config
        .first_str(&["MasterServer", "username"])
        .ok_or_else(|| WontFix("no mysql username in config".to_string()))?
        .to_string();
    let host = config
        .first_str(&["MasterServer", "servername"])
        .unwrap_or("localhost")
        .to_string();
    let port = config
        .first_int(&["MasterServer", "port"])
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(3306);
    let password = config
        .first_str(&["MasterServer", "password"])
        .unwrap_or_default()
        .to_string();
    let charset = config
        .first_str(&["Mysqli", "charset"])
        .filter(|c| !c.is_empty())
        .map(String::from);
    let table_prefix = config
        .first_str(&["Database", "tableprefix"])
        .unwrap_or_default()
        .to_string();

    Ok(DbCredentials {
        database,
        host,
        port,
        user,
        password,
        charset,
        table_prefix,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Store
// ─────────────────────────────────────────────────────────────────────────────

/// One row of the forum's plugin table.
#[derive(Debug, Clone)]
struct Plugin {
    pluginid: u64,
    title: String,
    hookname: String,
    phpcode: Option<String>,
}

impl Plugin {
    fn label(&self) -> String {
        format!("[{}] {}", self.hookname, self.title)
    }
}

/// Handle to the plugin table. Connects eagerly: construction fails with
/// `WontFix` when the database is unreachable, and file processing never
/// depends on it.
struct PluginStore {
    pool: MySqlPool,
    table: String,
    runtime: tokio::runtime::Runtime,
}

impl PluginStore {
    fn connect(creds: &DbCredentials) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start async runtime")?;

        let mut options = MySqlConnectOptions::new()
            .host(&creds.host)
            .port(creds.port)
            .username(&creds.user)
            .password(&creds.password)
            .database(&creds.database);
        if let Some(charset) = &creds.charset {
            options = options.charset(charset);
        }

        let pool = runtime
            .block_on(
                MySqlPoolOptions::new()
                    .max_connections(1)
                    .acquire_timeout(Duration::from_secs(15))
                    .connect_with(options),
            )
            .map_err(|err| WontFix(format!("unable to connect to MySQL: {err}")))?;

        Ok(Self {
            pool,
            table: format!("{}plugin", creds.table_prefix),
            runtime,
        })
    }

    /// Load every plugin row, ordered by id.
    fn all_plugins(&self) -> Result<Vec<Plugin>> {
        let sql = format!(
            "SELECT pluginid, title, hookname, phpcode FROM `{}` ORDER BY pluginid",
            self.table
        );
        let rows = self
            .runtime
            .block_on(sqlx::query(&sql).fetch_all(&self.pool))
            .map_err(|err| WontFix(format!("unable to load plugins: {err}")))?;

        rows.into_iter()
            .map(|row| {
                Ok(Plugin {
                    pluginid: row.try_get("pluginid")?,
                    title: row.try_get("title")?,
                    hookname: row.try_get("hookname")?,
                    phpcode: row.try_get("phpcode")?,
                })
            })
            .collect()
    }

    /// Persist a plugin's rewritten code. Only the code field is touched.
    fn save_phpcode(&self, plugin: &Plugin, code: &str) -> Result<()> {
        let sql = format!("UPDATE `{}` SET phpcode = ? WHERE pluginid = ?", self.table);
        self.runtime
            .block_on(
                sqlx::query(&sql)
                    .bind(code)
                    .bind(plugin.pluginid)
                    .execute(&self.pool),
            )
            .map_err(|err| WontFix(format!("unable to update plugin {}: {err}", plugin.pluginid)))?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CLI
// ─────────────────────────────────────────────────────────────────────────────

/// How to handle color output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ColorMode {
    /// Auto-detect color support
    Auto,
    /// Always emit colors (even when not a TTY)
    Always,
    /// Never emit colors
    Never,
}

/// vBulletin Reference Fixer: rewrites deprecated assign/pass-by-reference PHP
#[derive(Parser, Debug)]
#[command(
    name = "vbfix",
    version,
    about,
    long_about = None,
    after_help = "EXIT CODES:\n  0  Success\n  1  General error (file not found, permission denied, I/O error)\n  2  Invalid command-line arguments\n  3  Dry-run mode: changes would be made\n"
)]
struct Args {
    /// PHP file or directory to scan
    #[arg(value_name = "PATH")]
    path: Option<PathBuf>,

    /// Path to config file (default: search for .vbfixrc)
    #[arg(long = "config", value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Ignore config files
    #[arg(long = "no-config")]
    no_config: bool,

    /// Charset of the PHP sources (default: UTF-8 with BOM detection)
    #[arg(short = 'c', long)]
    charset: Option<String>,

    /// Apply every fix without prompting; changed files get a sibling
    /// .patch artifact
    #[arg(short = 's', long)]
    silent: bool,

    /// Enable only the named inspections (repeatable)
    #[arg(short = 'i', long = "inspection", value_enum, value_name = "NAME")]
    inspections: Vec<Inspection>,

    /// Do not inspect plugins stored in the database
    #[arg(long = "no-db")]
    no_db: bool,

    /// Glob pattern to match files when scanning a directory (comma-separated)
    #[arg(long, default_value = "*.php")]
    glob: String,

    /// Do not respect .gitignore when scanning
    #[arg(long = "no-gitignore")]
    no_gitignore: bool,

    /// Maximum directory depth (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_depth: usize,

    /// Preview changes without writing (exit 0=no changes, 3=would change)
    #[arg(short = 'n', long, conflicts_with = "silent")]
    dry_run: bool,

    /// Show unified diffs of proposed changes instead of applying them
    #[arg(short = 'd', long, conflicts_with = "silent")]
    diff: bool,

    /// Verbose output showing per-unit progress
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Color output: auto, always, or never
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorMode,

    /// Output the scan report as JSON (performs no writes)
    #[arg(long, conflicts_with_all = ["verbose", "diff", "silent"])]
    json: bool,

    /// Subcommand (config management)
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config management actions
#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Initialize a new .vbfixrc config file
    Init {
        /// Create in home directory instead of current
        #[arg(long)]
        global: bool,
    },
    /// Show effective configuration (merged file + CLI)
    Show,
    /// Show path to active config file
    Path,
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// What the run is allowed to do with a dirty unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// Prompt per dirty line, then persist accepted lines
    Interactive,
    /// Accept everything; files get patch artifacts, plugins a field update
    Silent,
    /// Report only, never write (dry-run, diff, json)
    Scan,
}

/// Runtime configuration derived from CLI args and the config file
#[derive(Debug)]
struct Config {
    charset: Option<String>,
    silent: bool,
    inspections: Vec<Inspection>,
    no_db: bool,
    glob: String,
    gitignore: bool,
    max_depth: usize,
    dry_run: bool,
    diff: bool,
    verbose: bool,
    color: ColorMode,
    json: bool,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            charset: args.charset.clone(),
            silent: args.silent,
            inspections: args.inspections.clone(),
            no_db: args.no_db,
            glob: args.glob.clone(),
            gitignore: !args.no_gitignore,
            max_depth: args.max_depth,
            dry_run: args.dry_run,
            diff: args.diff,
            verbose: args.verbose,
            color: args.color,
            json: args.json,
        }
    }
}

impl Config {
    fn run_mode(&self) -> RunMode {
        if self.json || self.dry_run || self.diff {
            RunMode::Scan
        } else if self.silent {
            RunMode::Silent
        } else {
            RunMode::Interactive
        }
    }
}

/// Config file names searched in order
const CONFIG_FILENAMES: &[&str] = &[".vbfixrc", ".vbfixrc.toml", "vbfixrc.toml"];

/// Configuration loaded from a .vbfixrc file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    /// Charset of the PHP sources
    charset: Option<String>,
    /// Apply fixes without prompting
    silent: Option<bool>,
    /// Inspections to enable
    inspections: Option<Vec<String>>,
    /// Skip database-stored plugins
    no_db: Option<bool>,
    /// Glob patterns for directory scans
    glob: Option<String>,
    /// Respect .gitignore
    gitignore: Option<bool>,
    /// Maximum directory depth
    max_depth: Option<usize>,
    /// Show verbose output
    verbose: Option<bool>,
    /// Color mode: auto, always, never
    color: Option<ColorMode>,
    /// Output as JSON
    json: Option<bool>,
}

/// Search for a config file starting from the given directory
fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();

    // Search up the directory tree
    loop {
        for filename in CONFIG_FILENAMES {
            let config_path = current.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    // Check home directory
    if let Some(home) = dirs::home_dir() {
        for filename in CONFIG_FILENAMES {
            let config_path = home.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }
    }

    None
}

/// Load and parse a config file
fn load_config_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Create Config by merging file config with CLI args (CLI wins)
fn create_config(args: &Args) -> Result<Config> {
    let mut config = Config::from(args);

    if args.no_config {
        return Ok(config);
    }

    let config_path = if let Some(ref path) = args.config_file {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        Some(path.clone())
    } else {
        let start_dir = args
            .path
            .as_ref()
            .and_then(|p| {
                if p.is_dir() {
                    Some(p.clone())
                } else {
                    p.parent().map(|p| p.to_path_buf())
                }
            })
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

        find_config_file(&start_dir)
    };

    if let Some(path) = config_path {
        let file_config = load_config_file(&path)?;

        // Only apply file config values when CLI used defaults
        if args.charset.is_none() {
            if let Some(charset) = file_config.charset {
                config.charset = Some(charset);
            }
        }

        if !args.silent {
            if let Some(s) = file_config.silent {
                config.silent = s;
            }
        }

        if args.inspections.is_empty() {
            if let Some(names) = file_config.inspections {
                let mut selected = Vec::new();
                for name in &names {
                    let inspection =
                        <Inspection as ValueEnum>::from_str(name, true).map_err(|_| {
                            anyhow::anyhow!("Unknown inspection '{}' in {}", name, path.display())
                        })?;
                    selected.push(inspection);
                }
                config.inspections = selected;
            }
        }

        if !args.no_db {
            if let Some(n) = file_config.no_db {
                config.no_db = n;
            }
        }

        if args.glob == "*.php" {
            if let Some(g) = file_config.glob {
                config.glob = g;
            }
        }

        if !args.no_gitignore {
            if let Some(gi) = file_config.gitignore {
                config.gitignore = gi;
            }
        }

        if args.max_depth == 0 {
            if let Some(d) = file_config.max_depth {
                config.max_depth = d;
            }
        }

        if !args.verbose {
            if let Some(v) = file_config.verbose {
                config.verbose = v;
            }
        }

        if args.color == ColorMode::Auto {
            if let Some(c) = file_config.color {
                config.color = c;
            }
        }

        if !args.json {
            if let Some(j) = file_config.json {
                config.json = j;
            }
        }
    }

    Ok(config)
}

/// Default config file content
const DEFAULT_CONFIG: &str = r#"# .vbfixrc - vbfix configuration file

# Charset of the PHP sources. Detected from the file when unset.
# charset = "windows-1251"

# Apply every fix without prompting; changed files get .patch artifacts
# silent = false

# Inspections to run (default: all)
# inspections = ["assign-by-reference"]

# Skip plugins stored in the database
# no_db = false

# Directory scan options
# glob = "*.php"
# gitignore = true
# max_depth = 0

# Output options
# verbose = false
# color = "auto"
# json = false
"#;

/// Handle the config subcommand
fn run_config_command(action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { global } => {
            let path = if *global {
                dirs::home_dir()
                    .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?
                    .join(".vbfixrc")
            } else {
                PathBuf::from(".vbfixrc")
            };

            if path.exists() {
                return Err(anyhow::anyhow!(
                    "Config file already exists: {}",
                    path.display()
                ));
            }

            fs::write(&path, DEFAULT_CONFIG)
                .with_context(|| format!("Failed to create config file: {}", path.display()))?;

            eprintln!("Created config file: {}", path.display());
            Ok(())
        }

        ConfigAction::Show => {
            let args = Args::parse_from(["vbfix"]);
            let config = create_config(&args)?;

            eprintln!("Effective configuration:");
            eprintln!("  charset: {}", config.charset.as_deref().unwrap_or("auto"));
            eprintln!("  silent: {}", config.silent);
            let inspections = enabled_inspections(&config.inspections)
                .iter()
                .map(|i| i.name())
                .collect::<Vec<_>>()
                .join(", ");
            eprintln!("  inspections: {}", inspections);
            eprintln!("  no_db: {}", config.no_db);
            eprintln!("  glob: {}", config.glob);
            eprintln!("  gitignore: {}", config.gitignore);
            eprintln!("  max_depth: {}", config.max_depth);
            eprintln!("  verbose: {}", config.verbose);
            eprintln!("  color: {:?}", config.color);
            eprintln!("  json: {}", config.json);

            let start_dir = std::env::current_dir().unwrap_or_default();
            if let Some(path) = find_config_file(&start_dir) {
                eprintln!();
                eprintln!("Config file: {}", path.display());
            }

            Ok(())
        }

        ConfigAction::Path => {
            let start_dir = std::env::current_dir().unwrap_or_default();
            if let Some(path) = find_config_file(&start_dir) {
                println!("{}", path.display());
                Ok(())
            } else {
                eprintln!("No config file found");
                std::process::exit(1);
            }
        }
    }
}

fn validate_args(args: &Args) -> Result<()> {
    if args.path.is_none() && args.command.is_none() {
        return Err(ArgError("PATH is required".to_string()).into());
    }

    if args.glob.split(',').all(|p| p.trim().is_empty()) {
        return Err(ArgError("--glob must name at least one pattern".to_string()).into());
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Console Output
// ─────────────────────────────────────────────────────────────────────────────

struct VerboseStyle {
    use_color: bool,
}

impl VerboseStyle {
    fn new(use_color: bool) -> Self {
        Self { use_color }
    }

    fn wrap(&self, tag: &str, text: impl fmt::Display) -> String {
        if self.use_color {
            format!("[{}]{}[/]", tag, text)
        } else {
            text.to_string()
        }
    }

    fn block(&self, text: impl fmt::Display) -> String {
        self.wrap("yellow", text)
    }

    fn success(&self, text: impl fmt::Display) -> String {
        self.wrap("bold green", text)
    }

    fn dim(&self, text: impl fmt::Display) -> String {
        self.wrap("dim", text)
    }

    fn bold(&self, text: impl fmt::Display) -> String {
        self.wrap("bold", text)
    }

    fn error(&self, text: impl fmt::Display) -> String {
        self.wrap("bold red", text)
    }

    fn stat_label(&self, text: impl fmt::Display) -> String {
        self.wrap("bold blue", text)
    }

    fn separator(&self) -> String {
        self.wrap("dim", "───")
    }
}

fn build_console(color: ColorMode) -> (Console, VerboseStyle) {
    match color {
        ColorMode::Never => (Console::new(), VerboseStyle::new(false)),
        ColorMode::Always => {
            let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
            let console = Console::builder()
                .force_terminal(true)
                .color_system(system)
                .build();
            (console, VerboseStyle::new(true))
        }
        ColorMode::Auto => {
            if std::env::var("NO_COLOR").is_ok() {
                return (Console::new(), VerboseStyle::new(false));
            }

            if std::env::var("FORCE_COLOR").is_ok() {
                let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
                let console = Console::builder()
                    .force_terminal(true)
                    .color_system(system)
                    .build();
                return (console, VerboseStyle::new(true));
            }

            let console = Console::new();
            let use_color = console.is_color_enabled();
            (console, VerboseStyle::new(use_color))
        }
    }
}

/// Wall-clock timestamp for verbose progress lines.
fn timestamp() -> String {
    let format = format_description!("[hour]:[minute]:[second]");
    OffsetDateTime::now_local()
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .format(&format)
        .unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// Statistics and JSON Report
// ─────────────────────────────────────────────────────────────────────────────

/// Statistics collected over a whole run
#[derive(Default, Clone)]
struct Stats {
    files_scanned: usize,
    files_changed: usize,
    plugins_scanned: usize,
    plugins_changed: usize,
    lines_scanned: usize,
    lines_flagged: usize,
    lines_applied: usize,
    patches_written: usize,
    fixes: FixCounts,
    errors: usize,
    elapsed: Duration,
}

impl Stats {
    fn record(&mut self, report: &UnitReport) {
        match report.kind {
            UnitKind::File => {
                self.files_scanned += 1;
                if !report.dirty.is_empty() {
                    self.files_changed += 1;
                }
            }
            UnitKind::Plugin => {
                self.plugins_scanned += 1;
                if !report.dirty.is_empty() {
                    self.plugins_changed += 1;
                }
            }
        }
        self.lines_scanned += report.lines;
        self.lines_flagged += report.dirty.len();
        self.lines_applied += report.applied;
        if report.patch.is_some() {
            self.patches_written += 1;
        }
        self.fixes.merge(report.fixes);
    }
}

/// Print a statistics summary to the console
fn print_stats_summary(stats: &Stats, console: &Console, styles: &VerboseStyle) {
    console.print("");
    console.print(&format!(
        "{} Summary {}",
        styles.separator(),
        styles.separator()
    ));

    console.print(&format!(
        "  {} {} scanned, {} with fixes",
        styles.stat_label("Files:"),
        stats.files_scanned,
        stats.files_changed
    ));

    if stats.plugins_scanned > 0 {
        console.print(&format!(
            "  {} {} scanned, {} with fixes",
            styles.stat_label("Plugins:"),
            stats.plugins_scanned,
            stats.plugins_changed
        ));
    }

    console.print(&format!(
        "  {} {} scanned, {} flagged, {} applied",
        styles.stat_label("Lines:"),
        stats.lines_scanned,
        stats.lines_flagged,
        stats.lines_applied
    ));

    console.print(&format!(
        "  {} {} assign-new, {} ref-global",
        styles.stat_label("Fixes:"),
        stats.fixes.assign_new,
        stats.fixes.ref_global
    ));

    if stats.patches_written > 0 {
        console.print(&format!(
            "  {} {}",
            styles.stat_label("Patches:"),
            stats.patches_written
        ));
    }

    let elapsed_ms = stats.elapsed.as_secs_f64() * 1000.0;
    console.print(&format!(
        "  {} {:.2}ms",
        styles.stat_label("Time:"),
        elapsed_ms
    ));

    if stats.errors > 0 {
        console.print(&format!("  {} {}", styles.error("Skipped:"), stats.errors));
    }

    console.print("");
}

#[derive(Serialize)]
struct JsonReport {
    version: &'static str,
    status: &'static str,
    units: Vec<JsonUnit>,
    summary: JsonSummary,
}

#[derive(Serialize)]
struct JsonUnit {
    unit: String,
    kind: &'static str,
    lines: usize,
    dirty_lines: Vec<usize>,
    fixes_assign_new: usize,
    fixes_ref_global: usize,
}

#[derive(Serialize)]
struct JsonSummary {
    files_scanned: usize,
    files_with_changes: usize,
    plugins_scanned: usize,
    plugins_with_changes: usize,
    lines_flagged: usize,
    fixes_total: usize,
    errors: usize,
}

fn print_json_report(reports: &[UnitReport], stats: &Stats, dry_run: bool) -> Result<()> {
    let report = JsonReport {
        version: "1.0",
        status: if dry_run { "dry_run" } else { "scan" },
        units: reports
            .iter()
            .map(|r| JsonUnit {
                unit: r.label.clone(),
                kind: r.kind.as_str(),
                lines: r.lines,
                dirty_lines: r.dirty.clone(),
                fixes_assign_new: r.fixes.assign_new,
                fixes_ref_global: r.fixes.ref_global,
            })
            .collect(),
        summary: JsonSummary {
            files_scanned: stats.files_scanned,
            files_with_changes: stats.files_changed,
            plugins_scanned: stats.plugins_scanned,
            plugins_with_changes: stats.plugins_changed,
            lines_flagged: stats.lines_flagged,
            fixes_total: stats.fixes.total(),
            errors: stats.errors,
        },
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize JSON report")?
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Diff and Patch
// ─────────────────────────────────────────────────────────────────────────────

/// Render a unified diff of the whole unit, both headers naming the
/// original path, the way a reviewable patch artifact expects.
fn build_patch(changes: &ChangeSet, path_label: &str) -> String {
    let original = changes.original.concat();
    let rewritten = changes.rewritten.concat();
    let diff = TextDiff::from_lines(&original, &rewritten);
    diff.unified_diff()
        .context_radius(3)
        .header(path_label, path_label)
        .to_string()
}

/// Print a unified diff of the proposed changes to stdout
fn print_unified_diff(changes: &ChangeSet, label: &str, proposed: bool) -> Result<()> {
    if changes.is_clean() {
        return Ok(());
    }

    let original = changes.original.concat();
    let rewritten = changes.rewritten.concat();
    let diff = TextDiff::from_lines(&original, &rewritten);
    let mut stdout = io::stdout().lock();

    writeln!(stdout, "--- a/{}", label)?;
    if proposed {
        writeln!(stdout, "+++ b/{} (proposed)", label)?;
    } else {
        writeln!(stdout, "+++ b/{}", label)?;
    }

    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        writeln!(stdout, "{}", hunk.header())?;
        for change in hunk.iter_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => "-",
                ChangeTag::Insert => "+",
                ChangeTag::Equal => " ",
            };
            let line = change.value();
            if line.ends_with('\n') {
                write!(stdout, "{}{}", sign, line)?;
            } else {
                writeln!(stdout, "{}{}", sign, line)?;
            }
        }
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Application Strategies
// ─────────────────────────────────────────────────────────────────────────────

/// What a review pass decided for one unit.
struct ReviewOutcome {
    /// Original buffer with the accepted candidates merged in
    buffer: Vec<String>,
    accepted: usize,
}

fn trim_line_end(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

/// Show one dirty line with a single line of context on each side, current
/// text and proposed text.
fn print_change_preview(
    changes: &ChangeSet,
    label: &str,
    idx: usize,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<()> {
    let banner = styles.block("#######################");
    let mut stdout = io::stdout().lock();

    console.print(&banner);
    console.print(&styles.block(format!("# Current version {}:{}", label, idx + 1)));
    console.print(&banner);
    if idx > 0 {
        writeln!(stdout, "  {}", trim_line_end(&changes.original[idx - 1]))?;
    }
    writeln!(stdout, "- {}", trim_line_end(&changes.original[idx]))?;
    if idx + 1 < changes.original.len() {
        writeln!(stdout, "  {}", trim_line_end(&changes.original[idx + 1]))?;
    }

    console.print(&banner);
    console.print(&styles.block("# Proposed replacement"));
    console.print(&banner);
    if idx > 0 {
        writeln!(stdout, "  {}", trim_line_end(&changes.original[idx - 1]))?;
    }
    writeln!(stdout, "+ {}", trim_line_end(&changes.rewritten[idx]))?;
    if idx + 1 < changes.original.len() {
        writeln!(stdout, "  {}", trim_line_end(&changes.original[idx + 1]))?;
    }

    Ok(())
}

/// Ask the user whether to apply the shown replacement. Empty input means
/// yes; end of input declines.
fn confirm_replacement(console: &Console, styles: &VerboseStyle) -> Result<bool> {
    console.print(&styles.bold("Apply this replacement? [Y/n]"));
    let mut answer = String::new();
    let read = io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;
    if read == 0 {
        return Ok(false);
    }
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "" | "y" | "yes"
    ))
}

/// Walk the dirty lines of a unit, prompting per line. Returns None when
/// nothing was accepted, so callers skip the write entirely.
fn review_changes(
    changes: &ChangeSet,
    label: &str,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<Option<ReviewOutcome>> {
    let mut buffer = changes.original.clone();
    let mut accepted = 0;

    for &idx in &changes.dirty {
        print_change_preview(changes, label, idx, console, styles)?;
        if confirm_replacement(console, styles)? {
            buffer[idx] = changes.rewritten[idx].clone();
            accepted += 1;
            console.print(&styles.success("Replaced"));
        }
    }

    if accepted > 0 {
        Ok(Some(ReviewOutcome { buffer, accepted }))
    } else {
        Ok(None)
    }
}

/// Accept every dirty line: write a `.patch` artifact beside the file, then
/// overwrite the file in its original encoding. A clean unit produces no
/// artifact and no write.
fn apply_patch_and_overwrite(
    changes: &ChangeSet,
    path: &Path,
    encoding: &'static Encoding,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<Option<PathBuf>> {
    if changes.is_clean() {
        return Ok(None);
    }

    let patch_path = path.with_extension("patch");
    let patch = build_patch(changes, &path.display().to_string());
    fs::write(&patch_path, patch.as_bytes())
        .with_context(|| format!("Failed to write patch {}", patch_path.display()))?;
    write_encoded(path, &changes.rewritten.concat(), encoding)?;

    console.print(&styles.success(format!("Updated {}", path.display())));
    console.print(&styles.success(format!("Wrote patch {}", patch_path.display())));
    Ok(Some(patch_path))
}

// ─────────────────────────────────────────────────────────────────────────────
// Source Discovery
// ─────────────────────────────────────────────────────────────────────────────

fn is_php_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("php"))
}

/// A vBulletin install keeps its credentials in `includes/config.php`.
fn is_config_candidate(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == "config.php")
        && path
            .parent()
            .and_then(|dir| dir.file_name())
            .is_some_and(|name| name == "includes")
}

fn build_globset(patterns: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    let mut added = 0;

    for raw in patterns.split(',') {
        let pattern = raw.trim();
        if pattern.is_empty() {
            continue;
        }
        let glob = Glob::new(pattern)
            .map_err(|err| ArgError(format!("Invalid glob pattern '{}': {}", pattern, err)))?;
        builder.add(glob);
        added += 1;
    }

    if added == 0 {
        return Err(ArgError("--glob must name at least one pattern".to_string()).into());
    }

    builder.build().context("Failed to build glob set")
}

/// PHP sources plus any config candidates found under the given path.
#[derive(Debug)]
struct DiscoveredSources {
    files: Vec<PathBuf>,
    configs: Vec<PathBuf>,
}

fn discover_sources(root: &Path, config: &Config) -> Result<DiscoveredSources> {
    if root.is_file() {
        if !is_php_file(root) {
            return Err(ArgError(format!("{} is not a PHP file", root.display())).into());
        }
        let configs = if root.file_name().is_some_and(|name| name == "config.php") {
            vec![root.to_path_buf()]
        } else {
            Vec::new()
        };
        return Ok(DiscoveredSources {
            files: vec![root.to_path_buf()],
            configs,
        });
    }

    if !root.is_dir() {
        anyhow::bail!("Path does not exist: {}", root.display());
    }

    let globs = build_globset(&config.glob)?;
    let mut files = BTreeSet::new();
    let mut configs = BTreeSet::new();

    let mut walker = WalkBuilder::new(root);
    walker.git_ignore(config.gitignore);
    walker.git_exclude(config.gitignore);
    walker.git_global(config.gitignore);
    walker.ignore(config.gitignore);
    walker.hidden(false);

    if config.max_depth > 0 {
        walker.max_depth(Some(config.max_depth));
    }

    for entry in walker.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };

        let entry_path = entry.path();
        if !entry_path.is_file() {
            continue;
        }
        if let Some(name) = entry_path.file_name() {
            if globs.is_match(name) {
                files.insert(entry_path.to_path_buf());
                if is_config_candidate(entry_path) {
                    configs.insert(entry_path.to_path_buf());
                }
            }
        }
    }

    Ok(DiscoveredSources {
        files: files.into_iter().collect(),
        configs: configs.into_iter().collect(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitKind {
    File,
    Plugin,
}

impl UnitKind {
    fn as_str(&self) -> &'static str {
        match self {
            UnitKind::File => "file",
            UnitKind::Plugin => "plugin",
        }
    }
}

/// What happened to one source unit.
#[derive(Debug)]
struct UnitReport {
    label: String,
    kind: UnitKind,
    lines: usize,
    dirty: Vec<usize>,
    fixes: FixCounts,
    applied: usize,
    patch: Option<PathBuf>,
}

#[derive(Debug)]
struct RunOutcome {
    dry_run: bool,
    would_change: bool,
}

/// Inspect one PHP file and apply the configured strategy.
fn process_file(
    path: &Path,
    config: &Config,
    inspections: &[Inspection],
    console: &Console,
    styles: &VerboseStyle,
) -> Result<UnitReport> {
    let (lines, encoding) = read_unit(path, config.charset.as_deref())?;
    let changes = run_inspections(&lines, inspections);
    let label = path.display().to_string();

    let mut report = UnitReport {
        label: label.clone(),
        kind: UnitKind::File,
        lines: lines.len(),
        dirty: changes.dirty.clone(),
        fixes: changes.fixes,
        applied: 0,
        patch: None,
    };

    if changes.is_clean() {
        if config.verbose {
            console.print(&styles.dim(format!("No changes needed: {}", label)));
        }
        return Ok(report);
    }

    match config.run_mode() {
        RunMode::Scan => {
            if config.diff {
                print_unified_diff(&changes, &label, config.dry_run)?;
            }
            if config.verbose || config.dry_run {
                console.print(&styles.block(format!(
                    "Would fix {}: {} line(s)",
                    label,
                    changes.dirty.len()
                )));
            }
        }
        RunMode::Silent => {
            report.patch = apply_patch_and_overwrite(&changes, path, encoding, console, styles)?;
            report.applied = changes.dirty.len();
        }
        RunMode::Interactive => {
            if let Some(outcome) = review_changes(&changes, &label, console, styles)? {
                write_encoded(path, &outcome.buffer.concat(), encoding)?;
                console.print(&styles.success(format!("Updated {}", label)));
                report.applied = outcome.accepted;
            }
        }
    }

    Ok(report)
}

/// Inspect every plugin stored in the database and apply the configured
/// strategy to each.
fn process_plugins(
    store: &PluginStore,
    config: &Config,
    inspections: &[Inspection],
    console: &Console,
    styles: &VerboseStyle,
) -> Result<Vec<UnitReport>> {
    let mut reports = Vec::new();

    for plugin in store.all_plugins()? {
        let code = match plugin.phpcode.as_deref() {
            Some(code) if !code.is_empty() => code,
            _ => continue,
        };
        let lines = plugin_code_lines(code);
        let changes = run_inspections(&lines, inspections);
        let label = plugin.label();

        let mut report = UnitReport {
            label: label.clone(),
            kind: UnitKind::Plugin,
            lines: lines.len(),
            dirty: changes.dirty.clone(),
            fixes: changes.fixes,
            applied: 0,
            patch: None,
        };

        if changes.is_clean() {
            if config.verbose {
                console.print(&styles.dim(format!("No changes needed: {}", label)));
            }
            reports.push(report);
            continue;
        }

        match config.run_mode() {
            RunMode::Scan => {
                if config.diff {
                    print_unified_diff(&changes, &label, config.dry_run)?;
                }
                if config.verbose || config.dry_run {
                    console.print(&styles.block(format!(
                        "Would fix {}: {} line(s)",
                        label,
                        changes.dirty.len()
                    )));
                }
            }
            RunMode::Silent => {
                store.save_phpcode(&plugin, &changes.rewritten.concat())?;
                console.print(&styles.success(format!("Updated {}", label)));
                report.applied = changes.dirty.len();
            }
            RunMode::Interactive => {
                if let Some(outcome) = review_changes(&changes, &label, console, styles)? {
                    store.save_phpcode(&plugin, &outcome.buffer.concat())?;
                    console.print(&styles.success(format!("Updated {}", label)));
                    report.applied = outcome.accepted;
                }
            }
        }

        reports.push(report);
    }

    Ok(reports)
}

fn run(args: Args) -> Result<RunOutcome> {
    validate_args(&args)?;

    let config = create_config(&args)?;
    let (console, styles) = build_console(config.color);
    let inspections = enabled_inspections(&config.inspections);
    let start_time = Instant::now();

    let root = args
        .path
        .as_ref()
        .ok_or_else(|| ArgError("PATH is required".to_string()))?;
    let sources = discover_sources(root, &config)?;

    if sources.files.is_empty() {
        eprintln!(
            "Warning: no files matched pattern '{}' under {}",
            config.glob,
            root.display()
        );
        return Ok(RunOutcome {
            dry_run: config.dry_run,
            would_change: false,
        });
    }

    let mut stats = Stats::default();
    let mut reports = Vec::new();

    // Skipped-unit reports must not interleave with the JSON document
    let report_skip = |message: String| {
        if config.json {
            eprintln!("{}", message);
        } else {
            console.print(&styles.error(message));
        }
    };

    for path in &sources.files {
        if config.verbose {
            console.print(&styles.bold(format!(
                "[{}] Checking file: {}",
                timestamp(),
                path.display()
            )));
        }
        match process_file(path, &config, &inspections, &console, &styles) {
            Ok(report) => {
                stats.record(&report);
                reports.push(report);
            }
            Err(err) if error_chain_has::<WontFix>(&err) => {
                report_skip(format!(
                    "Could not check file {}: {:#}",
                    path.display(),
                    err
                ));
                stats.errors += 1;
            }
            Err(err) => return Err(err),
        }
    }

    if !config.no_db {
        for config_path in &sources.configs {
            if config.verbose {
                console.print(&styles.bold(format!(
                    "[{}] Reading config: {}",
                    timestamp(),
                    config_path.display()
                )));
            }

            let tree = match read_vb_config(config_path, config.charset.as_deref()) {
                Ok(tree) => tree,
                Err(err) if error_chain_has::<WontFix>(&err) => {
                    report_skip(format!(
                        "Could not read config {}: {:#}",
                        config_path.display(),
                        err
                    ));
                    stats.errors += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let store = match credentials_from_config(&tree)
                .and_then(|creds| PluginStore::connect(&creds))
            {
                Ok(store) => store,
                Err(err) if error_chain_has::<WontFix>(&err) => {
                    report_skip(format!("Could not connect to MySQL: {:#}", err));
                    stats.errors += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            match process_plugins(&store, &config, &inspections, &console, &styles) {
                Ok(plugin_reports) => {
                    for report in &plugin_reports {
                        stats.record(report);
                    }
                    reports.extend(plugin_reports);
                }
                Err(err) if error_chain_has::<WontFix>(&err) => {
                    report_skip(format!(
                        "Could not update plugins in the database: {:#}",
                        err
                    ));
                    stats.errors += 1;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    stats.elapsed = start_time.elapsed();
    let would_change = stats.lines_flagged > 0;

    if config.json {
        print_json_report(&reports, &stats, config.dry_run)?;
    } else if config.verbose {
        print_stats_summary(&stats, &console, &styles);
    }

    Ok(RunOutcome {
        dry_run: config.dry_run,
        would_change,
    })
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_codes::SUCCESS,
                _ => exit_codes::INVALID_ARGS,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    // Handle subcommands first
    if let Some(command) = &args.command {
        let exit_code = match command {
            Commands::Config { action } => match run_config_command(action) {
                Ok(()) => exit_codes::SUCCESS,
                Err(err) => {
                    eprintln!("Error: {:#}", err);
                    exit_code_for_error(&err)
                }
            },
        };
        std::process::exit(exit_code);
    }

    let exit_code = match run(args) {
        Ok(outcome) => {
            if outcome.dry_run && outcome.would_change {
                exit_codes::WOULD_CHANGE
            } else {
                exit_codes::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("Error: {:#}", err);
            exit_code_for_error(&err)
        }
    };

    std::process::exit(exit_code);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn lines_of(text: &str) -> Vec<String> {
        split_lines_keep_ends(text)
    }

    fn rewrite(line: &str) -> String {
        Inspection::AssignByReference.rewrite_line(line).0
    }

    fn assert_changeset_invariants(changes: &ChangeSet) {
        assert_eq!(changes.original.len(), changes.rewritten.len());
        for window in changes.dirty.windows(2) {
            assert!(window[0] < window[1], "dirty indices must be ascending");
        }
        for idx in 0..changes.original.len() {
            let flagged = changes.dirty.contains(&idx);
            let differs = changes.original[idx] != changes.rewritten[idx];
            assert_eq!(
                flagged, differs,
                "index {} flagged={} but differs={}",
                idx, flagged, differs
            );
        }
    }

    // =========================================================================
    // Tokenizer tests
    // =========================================================================

    #[test]
    fn test_tokenize_is_lossless() {
        let samples = [
            "$obj =& new Foo();\n",
            "do_hook(&$vbulletin);\n",
            "if ($a && $b) { return $c; }\n",
            "$s = 'it\\'s'; // trailing comment\n",
            "<?php echo 3.14 + 42; ?>\n",
            "weird \\ bytes ` here\n",
            "\t    \r\n",
        ];
        for sample in samples {
            let joined: String = tokenize(sample).iter().map(|t| t.text).collect();
            assert_eq!(joined, sample, "tokens must reconstruct the line exactly");
        }
    }

    #[test]
    fn test_tokenize_classification() {
        let kind_of = |src: &str| tokenize(src)[0].kind;
        assert_eq!(kind_of("$db"), TokenKind::Variable);
        assert_eq!(kind_of("new"), TokenKind::Keyword);
        assert_eq!(kind_of("NEW"), TokenKind::Keyword);
        assert_eq!(kind_of("Foo"), TokenKind::Name);
        assert_eq!(kind_of("=&"), TokenKind::Operator);
        assert_eq!(kind_of("&"), TokenKind::Operator);
        assert_eq!(kind_of("'s'"), TokenKind::Str);
        assert_eq!(kind_of("\"s\""), TokenKind::Str);
        assert_eq!(kind_of("3"), TokenKind::Int);
        assert_eq!(kind_of("3.5"), TokenKind::Float);
        assert_eq!(kind_of("<?php"), TokenKind::Preprocessor);
        assert_eq!(kind_of("?>"), TokenKind::Preprocessor);
        assert_eq!(kind_of("// x"), TokenKind::Comment);
        assert_eq!(kind_of("#x"), TokenKind::Comment);
        assert_eq!(kind_of("/* x */"), TokenKind::Comment);
        assert_eq!(kind_of(" "), TokenKind::Text);
    }

    #[test]
    fn test_tokenize_assign_ref_is_one_operator() {
        let tokens = tokenize("$a =&new Foo()");
        let op = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Operator)
            .unwrap();
        assert_eq!(op.text, "=&");
    }

    #[test]
    fn test_tokenize_double_amp_stays_bundled() {
        let tokens = tokenize("$a && $b");
        let op = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Operator)
            .unwrap();
        assert_eq!(op.text, "&&");
    }

    #[test]
    fn test_tokenize_bundles_punctuation_runs() {
        let tokens = tokenize("f(g());");
        let bundled = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Punctuation && t.text.len() > 1)
            .expect("expected a bundled punctuation token");
        assert_eq!(bundled.text, "));");
    }

    // =========================================================================
    // State machine tests
    // =========================================================================

    #[test]
    fn test_assign_new_by_reference() {
        assert_eq!(rewrite("$obj =& new Foo();\n"), "$obj = new Foo();\n");
    }

    #[test]
    fn test_assign_new_without_space() {
        assert_eq!(
            rewrite("$obj =&new Foo($a, $b);\n"),
            "$obj = new Foo($a, $b);\n"
        );
    }

    #[test]
    fn test_reserved_global_by_reference() {
        assert_eq!(rewrite("do_hook(&$vbulletin);\n"), "do_hook($vbulletin);\n");
        assert_eq!(rewrite("do_hook(&$db);\n"), "do_hook($db);\n");
    }

    #[test]
    fn test_other_variable_by_reference_is_kept() {
        let line = "do_hook(&$other);\n";
        assert_eq!(rewrite(line), line);
    }

    #[test]
    fn test_plain_assignment_is_kept() {
        let line = "$x = 1 + 2;\n";
        assert_eq!(rewrite(line), line);
    }

    #[test]
    fn test_assign_ref_without_new_is_kept() {
        let line = "$a =& $b;\n";
        assert_eq!(rewrite(line), line);
    }

    #[test]
    fn test_double_amp_is_not_a_reference_pass() {
        let line = "if ($a && $db) { }\n";
        assert_eq!(rewrite(line), line);
    }

    #[test]
    fn test_comment_lines_are_kept() {
        let line = "// $a =& new Foo();\n";
        assert_eq!(rewrite(line), line);
    }

    #[test]
    fn test_fix_inside_open_close_tags() {
        assert_eq!(
            rewrite("<?php $a =& new Foo(); ?>\n"),
            "<?php $a = new Foo(); ?>\n"
        );
    }

    #[test]
    fn test_both_rules_on_one_line() {
        assert_eq!(
            rewrite("$h =& new Hook(&$vbulletin);\n"),
            "$h = new Hook($vbulletin);\n"
        );
    }

    /// The replacement targets the first occurrence of the reconstructed
    /// substring, even when that occurrence sits inside a string literal.
    #[test]
    fn test_rewrite_replaces_first_occurrence_of_needle() {
        assert_eq!(
            rewrite("$log = '=& new'; $a =& new Foo();\n"),
            "$log = '= new'; $a =& new Foo();\n"
        );
    }

    #[test]
    fn test_fix_counts_per_rule() {
        let (_, fixes) = Inspection::AssignByReference
            .rewrite_line("$h =& new Hook(&$vbulletin, &$db);\n");
        assert_eq!(fixes.assign_new, 1);
        assert_eq!(fixes.ref_global, 2);
        assert_eq!(fixes.total(), 3);
    }

    #[test]
    fn test_bundled_punctuation_is_split_before_stepping() {
        // Fed one character at a time, the bracket stack fully unwinds.
        let mut split = RefAssignContext::new("f(g());\n");
        feed_line(&mut split, "f(g());\n");
        assert!(split.call_stack.is_empty());
        assert!(!split.in_function_call);

        // Fed the bundled token whole, only one of the two closers is seen.
        let mut bundled = RefAssignContext::new("f(g());\n");
        for token in tokenize("f(g());\n") {
            bundled.step(&token);
        }
        assert_eq!(bundled.call_stack, vec!["f".to_string()]);
        assert!(bundled.in_function_call);
    }

    #[test]
    fn test_split_and_presplit_punctuation_agree() {
        // A lexer that already emits single-character punctuation must land
        // in exactly the same state as the splitting feeder.
        let line = "foo(bar());\n";
        let mut fed = RefAssignContext::new(line);
        feed_line(&mut fed, line);

        let mut manual = RefAssignContext::new(line);
        for token in tokenize(line) {
            if token.kind == TokenKind::Punctuation {
                for (start, ch) in token.text.char_indices() {
                    manual.step(&Token {
                        kind: TokenKind::Punctuation,
                        text: &token.text[start..start + ch.len_utf8()],
                    });
                }
            } else {
                manual.step(&token);
            }
        }

        assert_eq!(fed, manual);
    }

    #[test]
    fn test_call_stack_bookkeeping() {
        let mut ctx = RefAssignContext::new("outer(inner($a), $b)\n");
        feed_line(&mut ctx, "outer(inner($a), $b)\n");
        assert!(ctx.call_stack.is_empty());
        assert!(!ctx.in_function_call);
        assert_eq!(ctx.last_function.as_deref(), Some("inner"));
    }

    // =========================================================================
    // Line pipeline tests
    // =========================================================================

    #[test]
    fn test_split_lines_keep_ends() {
        assert_eq!(split_lines_keep_ends(""), Vec::<String>::new());
        assert_eq!(split_lines_keep_ends("x"), vec!["x"]);
        assert_eq!(split_lines_keep_ends("x\ny"), vec!["x\n", "y"]);
        assert_eq!(split_lines_keep_ends("x\r\ny\n"), vec!["x\r\n", "y\n"]);
    }

    #[test]
    fn test_plugin_code_lines_normalize_terminators() {
        assert_eq!(plugin_code_lines("a\r\nb"), vec!["a\n", "b\n"]);
        assert_eq!(plugin_code_lines("a\nb\n"), vec!["a\n", "b\n"]);
        assert_eq!(plugin_code_lines(""), Vec::<String>::new());
    }

    #[test]
    fn test_run_inspections_changeset() {
        let lines = lines_of("$a =& new A();\n$x = 1;\ndo_hook(&$db);\n");
        let changes = run_inspections(&lines, &Inspection::ALL);

        assert_eq!(changes.dirty, vec![0, 2]);
        assert_eq!(changes.rewritten[0], "$a = new A();\n");
        assert_eq!(changes.rewritten[1], "$x = 1;\n");
        assert_eq!(changes.rewritten[2], "do_hook($db);\n");
        assert_eq!(changes.fixes.assign_new, 1);
        assert_eq!(changes.fixes.ref_global, 1);
        assert_changeset_invariants(&changes);
    }

    #[test]
    fn test_run_inspections_is_idempotent() {
        let lines = lines_of("$a =& new A();\ndo_hook(&$vbulletin);\n");
        let first = run_inspections(&lines, &Inspection::ALL);
        assert!(!first.is_clean());

        let second = run_inspections(&first.rewritten, &Inspection::ALL);
        assert!(second.is_clean(), "second pass must find nothing");
        assert_eq!(second.fixes.total(), 0);
        assert_changeset_invariants(&second);
    }

    #[test]
    fn test_clean_unit_has_empty_dirty_set() {
        let lines = lines_of("<?php\n$x = 1;\necho $x;\n");
        let changes = run_inspections(&lines, &Inspection::ALL);
        assert!(changes.is_clean());
        assert_eq!(changes.original, changes.rewritten);
        assert_changeset_invariants(&changes);
    }

    #[test]
    fn test_enabled_inspections_default_to_all() {
        assert_eq!(enabled_inspections(&[]), Inspection::ALL.to_vec());
        assert_eq!(
            enabled_inspections(&[Inspection::AssignByReference]),
            vec![Inspection::AssignByReference]
        );
    }

    // =========================================================================
    // Encoding tests
    // =========================================================================

    #[test]
    fn test_resolve_charset() {
        assert_eq!(resolve_charset(None).unwrap(), encoding_rs::UTF_8);
        assert_eq!(
            resolve_charset(Some("windows-1251")).unwrap(),
            encoding_rs::WINDOWS_1251
        );
        let err = resolve_charset(Some("no-such-charset")).unwrap_err();
        assert!(error_chain_has::<WontFix>(&err));
    }

    #[test]
    fn test_read_unit_rejects_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.php");
        fs::write(&path, [0xC3, 0x28, 0x0A]).unwrap();

        let err = read_unit(&path, None).unwrap_err();
        assert!(error_chain_has::<WontFix>(&err));
    }

    #[test]
    fn test_read_unit_round_trips_windows_1251() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.php");
        let text = "<?php\n// Привет\n$x = 1;\n";
        let (bytes, _, _) = encoding_rs::WINDOWS_1251.encode(text);
        fs::write(&path, &bytes).unwrap();

        let (lines, encoding) = read_unit(&path, Some("windows-1251")).unwrap();
        assert_eq!(encoding, encoding_rs::WINDOWS_1251);
        assert_eq!(lines.concat(), text);

        write_encoded(&path, &lines.concat(), encoding).unwrap();
        assert_eq!(fs::read(&path).unwrap(), bytes.to_vec());
    }

    // =========================================================================
    // Config reader tests
    // =========================================================================

    const SAMPLE_CONFIG: &str = "<?php\n\
        $config['Database']['dbname'] = 'forum';\n\
        $config['Database']['tableprefix'] = 'vb_';\n\
        $config['MasterServer']['servername'] = 'db.local';\n\
        $config['MasterServer']['port'] = 3306;\n\
        $config['MasterServer']['username'] = 'forumuser';\n\
        $config['MasterServer']['password'] = 's3cret';\n\
        $config['Mysqli']['charset'] = 'utf8';\n\
        $config['Misc']['debug'] = false;\n";

    #[test]
    fn test_parse_vb_config() {
        let tree = parse_vb_config(&lines_of(SAMPLE_CONFIG));
        assert_eq!(tree.first_str(&["Database", "dbname"]), Some("forum"));
        assert_eq!(tree.first_str(&["MasterServer", "servername"]), Some("db.local"));
        assert_eq!(tree.first_int(&["MasterServer", "port"]), Some(3306));
        assert_eq!(
            tree.get(&["Misc", "debug"]).unwrap().values,
            vec![ConfigScalar::Bool(false)]
        );
        assert_eq!(tree.first_str(&["Database", "missing"]), None);
    }

    #[test]
    fn test_config_line_in_comment_is_ignored() {
        assert_eq!(
            scan_config_line("// $config['Database']['dbname'] = 'x';\n"),
            None
        );
        assert_eq!(scan_config_line("$x = 1;\n"), None);
    }

    #[test]
    fn test_config_port_as_string_still_parses() {
        let tree = parse_vb_config(&lines_of(
            "$config['MasterServer']['port'] = '3307';\n",
        ));
        assert_eq!(tree.first_int(&["MasterServer", "port"]), Some(3307));
    }

    #[test]
    fn test_credentials_from_config() {
        let tree = parse_vb_config(&lines_of(SAMPLE_CONFIG));
        let creds = credentials_from_config(&tree).unwrap();
        assert_eq!(creds.database, "forum");
        assert_eq!(creds.host, "db.local");
        assert_eq!(creds.port, 3306);
        assert_eq!(creds.user, "forumuser");
        assert_eq!(creds.password, "s3cret");
        assert_eq!(creds.charset.as_deref(), Some("utf8"));
        assert_eq!(creds.table_prefix, "vb_");
    }

    #[test]
    fn test_credentials_defaults() {
        let tree = parse_vb_config(&lines_of(
            "$config['Database']['dbname'] = 'forum';\n\
             $config['MasterServer']['username'] = 'u';\n",
        ));
        let creds = credentials_from_config(&tree).unwrap();
        assert_eq!(creds.host, "localhost");
        assert_eq!(creds.port, 3306);
        assert_eq!(creds.password, "");
        assert_eq!(creds.charset, None);
        assert_eq!(creds.table_prefix, "");
    }

    #[test]
    fn test_credentials_require_dbname_and_username() {
        let no_db = parse_vb_config(&lines_of(
            "$config['MasterServer']['username'] = 'u';\n",
        ));
        let err = credentials_from_config(&no_db).unwrap_err();
        assert!(error_chain_has::<WontFix>(&err));

        let no_user = parse_vb_config(&lines_of(
            "$config['Database']['dbname'] = 'forum';\n",
        ));
        let err = credentials_from_config(&no_user).unwrap_err();
        assert!(error_chain_has::<WontFix>(&err));
    }

    #[test]
    fn test_dequote() {
        assert_eq!(dequote("'abc'"), "abc");
        assert_eq!(dequote("\"\""), "");
        assert_eq!(dequote("x"), "x");
    }

    // =========================================================================
    // Patch and diff tests
    // =========================================================================

    #[test]
    fn test_build_patch_headers_name_the_path() {
        let lines = lines_of("$a =& new A();\n$x = 1;\n");
        let changes = run_inspections(&lines, &Inspection::ALL);
        let patch = build_patch(&changes, "forum/global.php");

        assert!(patch.starts_with("--- forum/global.php"));
        assert!(patch.contains("+++ forum/global.php"));
        assert!(patch.contains("-$a =& new A();"));
        assert!(patch.contains("+$a = new A();"));
    }

    #[test]
    fn test_patch_and_overwrite_applies_fixes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dirty.php");
        fs::write(&path, "<?php\n$a =& new A();\n").unwrap();

        let (lines, encoding) = read_unit(&path, None).unwrap();
        let changes = run_inspections(&lines, &Inspection::ALL);
        let (console, styles) = build_console(ColorMode::Never);
        let patch = apply_patch_and_overwrite(&changes, &path, encoding, &console, &styles)
            .unwrap()
            .expect("dirty unit must produce a patch");

        assert_eq!(patch, dir.path().join("dirty.patch"));
        assert!(patch.exists());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "<?php\n$a = new A();\n"
        );
    }

    #[test]
    fn test_patch_and_overwrite_skips_clean_unit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clean.php");
        fs::write(&path, "<?php\n$x = 1;\n").unwrap();

        let (lines, encoding) = read_unit(&path, None).unwrap();
        let changes = run_inspections(&lines, &Inspection::ALL);
        assert!(changes.is_clean());

        let (console, styles) = build_console(ColorMode::Never);
        let patch =
            apply_patch_and_overwrite(&changes, &path, encoding, &console, &styles).unwrap();

        assert!(patch.is_none());
        assert!(!dir.path().join("clean.patch").exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "<?php\n$x = 1;\n");
    }

    // =========================================================================
    // Discovery tests
    // =========================================================================

    #[test]
    fn test_is_php_file() {
        assert!(is_php_file(Path::new("global.php")));
        assert!(is_php_file(Path::new("GLOBAL.PHP")));
        assert!(!is_php_file(Path::new("notes.txt")));
        assert!(!is_php_file(Path::new("php")));
    }

    #[test]
    fn test_is_config_candidate() {
        assert!(is_config_candidate(Path::new("forum/includes/config.php")));
        assert!(is_config_candidate(Path::new("includes/config.php")));
        assert!(!is_config_candidate(Path::new("forum/config.php")));
        assert!(!is_config_candidate(Path::new("includes/other.php")));
    }

    #[test]
    fn test_discover_sources_in_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("includes")).unwrap();
        fs::write(dir.path().join("global.php"), "<?php\n").unwrap();
        fs::write(dir.path().join("readme.txt"), "not php\n").unwrap();
        fs::write(dir.path().join("includes/config.php"), "<?php\n").unwrap();

        let args = Args::parse_from(["vbfix", "--no-config", "."]);
        let config = Config::from(&args);
        let sources = discover_sources(dir.path(), &config).unwrap();

        assert_eq!(sources.files.len(), 2);
        assert!(sources.files.iter().all(|p| is_php_file(p)));
        assert_eq!(sources.configs.len(), 1);
        assert!(is_config_candidate(&sources.configs[0]));
    }

    #[test]
    fn test_discover_sources_rejects_non_php_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "text\n").unwrap();

        let args = Args::parse_from(["vbfix", "--no-config", "."]);
        let config = Config::from(&args);
        let err = discover_sources(&path, &config).unwrap_err();
        assert!(error_chain_has::<ArgError>(&err));
    }

    // =========================================================================
    // Args parsing + config merge tests
    // =========================================================================

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["vbfix", "forum"]);
        assert_eq!(args.path, Some(PathBuf::from("forum")));
        assert!(args.charset.is_none());
        assert!(!args.silent);
        assert!(args.inspections.is_empty());
        assert!(!args.no_db);
        assert_eq!(args.glob, "*.php");
        assert!(!args.no_gitignore);
        assert_eq!(args.max_depth, 0);
        assert!(!args.dry_run);
        assert!(!args.diff);
        assert!(!args.verbose);
        assert!(matches!(args.color, ColorMode::Auto));
        assert!(!args.json);
    }

    #[test]
    fn test_args_custom() {
        let args = Args::parse_from([
            "vbfix",
            "-s",
            "-v",
            "-c",
            "windows-1251",
            "--no-db",
            "--max-depth",
            "3",
            "forum",
        ]);
        assert!(args.silent);
        assert!(args.verbose);
        assert_eq!(args.charset.as_deref(), Some("windows-1251"));
        assert!(args.no_db);
        assert_eq!(args.max_depth, 3);
    }

    #[test]
    fn test_args_inspection_selection() {
        let args = Args::parse_from(["vbfix", "-i", "assign-by-reference", "forum"]);
        assert_eq!(args.inspections, vec![Inspection::AssignByReference]);

        let result = Args::try_parse_from(["vbfix", "-i", "bogus", "forum"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_args_silent_conflicts_with_dry_run() {
        let result = Args::try_parse_from(["vbfix", "-s", "-n", "forum"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_args_json_conflicts_with_verbose() {
        let result = Args::try_parse_from(["vbfix", "--json", "-v", "forum"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_args_requires_path() {
        let args = Args::parse_from(["vbfix"]);
        let err = validate_args(&args).unwrap_err();
        assert!(error_chain_has::<ArgError>(&err));
    }

    #[test]
    fn test_run_mode_selection() {
        let config = |argv: &[&str]| {
            let mut full = vec!["vbfix"];
            full.extend_from_slice(argv);
            full.push("forum");
            Config::from(&Args::parse_from(full))
        };
        assert_eq!(config(&[]).run_mode(), RunMode::Interactive);
        assert_eq!(config(&["-s"]).run_mode(), RunMode::Silent);
        assert_eq!(config(&["-n"]).run_mode(), RunMode::Scan);
        assert_eq!(config(&["-d"]).run_mode(), RunMode::Scan);
        assert_eq!(config(&["--json"]).run_mode(), RunMode::Scan);
    }

    #[test]
    fn test_file_config_merge() {
        let dir = tempfile::tempdir().unwrap();
        let rc_path = dir.path().join(".vbfixrc");
        fs::write(
            &rc_path,
            "charset = \"windows-1251\"\nsilent = true\nglob = \"*.php,*.inc\"\n\
             inspections = [\"assign-by-reference\"]\n",
        )
        .unwrap();

        let mut args = Args::parse_from(["vbfix", "forum"]);
        args.config_file = Some(rc_path);
        let config = create_config(&args).unwrap();

        assert_eq!(config.charset.as_deref(), Some("windows-1251"));
        assert!(config.silent);
        assert_eq!(config.glob, "*.php,*.inc");
        assert_eq!(config.inspections, vec![Inspection::AssignByReference]);
    }

    #[test]
    fn test_file_config_does_not_override_cli() {
        let dir = tempfile::tempdir().unwrap();
        let rc_path = dir.path().join(".vbfixrc");
        fs::write(&rc_path, "charset = \"windows-1251\"\nsilent = true\n").unwrap();

        let mut args = Args::parse_from(["vbfix", "-c", "utf-8", "forum"]);
        args.config_file = Some(rc_path);
        let config = create_config(&args).unwrap();

        // CLI charset wins; silent comes from the file
        assert_eq!(config.charset.as_deref(), Some("utf-8"));
        assert!(config.silent);
    }

    #[test]
    fn test_file_config_rejects_unknown_inspection() {
        let dir = tempfile::tempdir().unwrap();
        let rc_path = dir.path().join(".vbfixrc");
        fs::write(&rc_path, "inspections = [\"no-such-rule\"]\n").unwrap();

        let mut args = Args::parse_from(["vbfix", "forum"]);
        args.config_file = Some(rc_path);
        assert!(create_config(&args).is_err());
    }

    #[test]
    fn test_default_config_template_parses() {
        let parsed: FileConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert!(parsed.charset.is_none());
        assert!(parsed.silent.is_none());
    }

    // =========================================================================
    // Error plumbing tests
    // =========================================================================

    #[test]
    fn test_exit_code_for_error() {
        let arg_err: anyhow::Error = ArgError("bad".to_string()).into();
        assert_eq!(exit_code_for_error(&arg_err), exit_codes::INVALID_ARGS);

        let wont_fix: anyhow::Error = WontFix("nope".to_string()).into();
        assert_eq!(exit_code_for_error(&wont_fix), exit_codes::ERROR);

        let wrapped = arg_err.context("outer context");
        assert_eq!(exit_code_for_error(&wrapped), exit_codes::INVALID_ARGS);
    }

    #[test]
    fn test_error_chain_detects_wont_fix_through_context() {
        let err: anyhow::Error = WontFix("encoding problem".to_string()).into();
        let wrapped = err.context("while reading unit");
        assert!(error_chain_has::<WontFix>(&wrapped));
        assert!(!error_chain_has::<ArgError>(&wrapped));
    }

    #[test]
    fn test_timestamp_format() {
        let ts = timestamp();
        assert_eq!(ts.len(), 8);
        assert_eq!(ts.matches(':').count(), 2);
    }
}
