//! Go build-constraint parsing and satisfiability.
//!
//! When the validity gate test-compiles one edited `.go` file, it must
//! decide which sibling files belong in the same compilation: platform-
//! specific siblings whose constraints can't hold together with the
//! target's would produce spurious redeclaration errors. The solver finds
//! a build context `{GOOS, GOARCH, cgo, custom tags}` satisfying the
//! target's constraint and keeps exactly the siblings that are eligible
//! under that context.
//!
//! Both the modern `//go:build` expression form and the legacy
//! `// +build` lines (space = OR, comma = AND, lines conjoined) are
//! understood; when both appear, `//go:build` wins.

mod compile;

pub use compile::{COMPILE_ERROR_BLACKLIST, check_go_compile};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A build-constraint expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Tag(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn and(a: Expr, b: Expr) -> Expr {
        Expr::And(Box::new(a), Box::new(b))
    }

    fn or(a: Expr, b: Expr) -> Expr {
        Expr::Or(Box::new(a), Box::new(b))
    }

    fn not(e: Expr) -> Expr {
        Expr::Not(Box::new(e))
    }

    /// Tags with no built-in meaning, in first-appearance order.
    pub fn custom_tags(&self) -> Vec<String> {
        let mut tags = Vec::new();
        self.collect_custom(&mut tags);
        tags
    }

    fn collect_custom(&self, out: &mut Vec<String>) {
        match self {
            Expr::Tag(t) => {
                if !is_known_tag(t) && !out.iter().any(|x| x == t) {
                    out.push(t.clone());
                }
            }
            Expr::Not(e) => e.collect_custom(out),
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.collect_custom(out);
                b.collect_custom(out);
            }
        }
    }
}

const KNOWN_GOOS: &[&str] = &[
    "aix", "android", "darwin", "dragonfly", "freebsd", "illumos", "ios", "js", "linux", "netbsd",
    "openbsd", "plan9", "solaris", "wasip1", "windows",
];

/// Operating systems for which the `unix` tag holds.
const UNIX_GOOS: &[&str] = &[
    "aix", "android", "darwin", "dragonfly", "freebsd", "illumos", "ios", "linux", "netbsd",
    "openbsd", "solaris",
];

const KNOWN_GOARCH: &[&str] = &[
    "386", "amd64", "arm", "arm64", "loong64", "mips", "mips64", "mips64le", "mipsle", "ppc64",
    "ppc64le", "riscv64", "s390x", "wasm",
];

/// Custom-tag search is capped: at most this many unknown tags are
/// enumerated over {true, false} (256 assignments).
pub const MAX_CUSTOM_TAGS: usize = 8;

fn is_known_tag(tag: &str) -> bool {
    tag == "cgo" || tag == "unix" || KNOWN_GOOS.contains(&tag) || KNOWN_GOARCH.contains(&tag)
}

/// A concrete build context the solver evaluates constraints under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub goos: String,
    pub goarch: String,
    pub cgo: bool,
    pub custom_tags: BTreeMap<String, bool>,
}

impl BuildContext {
    /// The host context: current process GOOS/GOARCH, cgo off.
    pub fn host() -> Self {
        Self {
            goos: host_goos().to_string(),
            goarch: host_goarch().to_string(),
            cgo: false,
            custom_tags: BTreeMap::new(),
        }
    }

    /// Evaluate a constraint under this context. Unknown tags absent from
    /// `custom_tags` are false.
    pub fn eval(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Tag(tag) => self.eval_tag(tag),
            Expr::Not(e) => !self.eval(e),
            Expr::And(a, b) => self.eval(a) && self.eval(b),
            Expr::Or(a, b) => self.eval(a) || self.eval(b),
        }
    }

    fn eval_tag(&self, tag: &str) -> bool {
        if tag == self.goos || tag == self.goarch {
            return true;
        }
        if tag == "cgo" {
            return self.cgo;
        }
        if tag == "unix" {
            return UNIX_GOOS.contains(&self.goos.as_str());
        }
        if KNOWN_GOOS.contains(&tag) || KNOWN_GOARCH.contains(&tag) {
            return false;
        }
        self.custom_tags.get(tag).copied().unwrap_or(false)
    }
}

fn host_goos() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "linux" => "linux",
        "windows" => "windows",
        "freebsd" => "freebsd",
        "netbsd" => "netbsd",
        "openbsd" => "openbsd",
        "solaris" => "solaris",
        "android" => "android",
        "ios" => "ios",
        _ => "linux",
    }
}

fn host_goarch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "arm" => "arm",
        "powerpc64" => "ppc64",
        "riscv64" => "riscv64",
        "s390x" => "s390x",
        "loongarch64" => "loong64",
        _ => "amd64",
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Extract the build constraint from Go source, if any. Scans the header
/// (everything before the `package` clause); `//go:build` takes
/// precedence over legacy `// +build` lines.
pub fn parse_file_constraint(source: &str) -> Option<Expr> {
    let mut legacy_lines: Vec<&str> = Vec::new();
    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("package ") {
            break;
        }
        if let Some(rest) = trimmed.strip_prefix("//go:build") {
            // The constraint must be the whole rest of the line.
            return parse_build_expr(rest.trim());
        }
        if let Some(rest) = trimmed.strip_prefix("// +build") {
            legacy_lines.push(rest.trim());
        }
    }
    parse_legacy_lines(&legacy_lines)
}

/// Parse a `//go:build` expression: `!`, `&&`, `||` and parentheses over
/// tag identifiers.
pub fn parse_build_expr(input: &str) -> Option<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return None;
    }
    Some(expr)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Not,
    AndAnd,
    OrOr,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return None;
                }
                tokens.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return None;
                }
                tokens.push(Token::OrOr);
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '.' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            _ => return None,
        }
    }
    if tokens.is_empty() { None } else { Some(tokens) }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Option<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::or(left, right);
        }
        Some(left)
    }

    fn parse_and(&mut self) -> Option<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::and(left, right);
        }
        Some(left)
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        match self.peek()? {
            Token::Not => {
                self.pos += 1;
                Some(Expr::not(self.parse_unary()?))
            }
            Token::LParen => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::RParen) {
                    return None;
                }
                self.pos += 1;
                Some(inner)
            }
            Token::Ident(_) => {
                let Some(Token::Ident(name)) = self.tokens.get(self.pos).cloned() else {
                    return None;
                };
                self.pos += 1;
                Some(Expr::Tag(name))
            }
            _ => None,
        }
    }
}

/// Legacy `// +build` lines: within a line, space separates OR-terms and
/// comma separates AND-factors; multiple lines are conjoined.
fn parse_legacy_lines(lines: &[&str]) -> Option<Expr> {
    let mut all: Option<Expr> = None;
    for line in lines {
        let mut line_expr: Option<Expr> = None;
        for group in line.split_whitespace() {
            let mut group_expr: Option<Expr> = None;
            for factor in group.split(',') {
                let term = match factor.strip_prefix('!') {
                    Some(tag) if !tag.is_empty() => Expr::not(Expr::Tag(tag.to_string())),
                    None if !factor.is_empty() => Expr::Tag(factor.to_string()),
                    _ => return None,
                };
                group_expr = Some(match group_expr {
                    Some(e) => Expr::and(e, term),
                    None => term,
                });
            }
            if let Some(g) = group_expr {
                line_expr = Some(match line_expr {
                    Some(e) => Expr::or(e, g),
                    None => g,
                });
            }
        }
        if let Some(l) = line_expr {
            all = Some(match all {
                Some(e) => Expr::and(e, l),
                None => l,
            });
        }
    }
    all
}

// =============================================================================
// Solving
// =============================================================================

/// Find a build context satisfying `expr`, preferring the host context
/// with cgo off.
pub fn solve(expr: &Expr) -> Option<BuildContext> {
    let mut custom = expr.custom_tags();
    custom.truncate(MAX_CUSTOM_TAGS);

    let host = BuildContext::host();
    let mut candidates: Vec<(String, String, bool)> = vec![
        (host.goos.clone(), host.goarch.clone(), false),
        (host.goos.clone(), host.goarch.clone(), true),
    ];
    for goos in KNOWN_GOOS {
        for goarch in KNOWN_GOARCH {
            for cgo in [false, true] {
                candidates.push((goos.to_string(), goarch.to_string(), cgo));
            }
        }
    }

    for (goos, goarch, cgo) in candidates {
        for mask in 0u32..(1 << custom.len()) {
            let custom_tags: BTreeMap<String, bool> = custom
                .iter()
                .enumerate()
                .map(|(i, tag)| (tag.clone(), mask & (1 << i) != 0))
                .collect();
            let ctx = BuildContext {
                goos: goos.clone(),
                goarch: goarch.clone(),
                cgo,
                custom_tags,
            };
            if ctx.eval(expr) {
                return Some(ctx);
            }
        }
    }
    None
}

/// Whether two constraints can hold in the same build. Conservative by
/// construction: `false` means no context satisfies the conjunction.
pub fn constraints_compatible(a: &Expr, b: &Expr) -> bool {
    solve(&Expr::and(a.clone(), b.clone())).is_some()
}

/// Select the files to hand to `go test -c` when checking `target_path`.
///
/// Parses the target's constraint, finds a satisfying context, and keeps
/// the target plus every sibling whose own constraint holds under that
/// context (constraint-free siblings always do). Input order is
/// preserved. With no satisfying context the target stands alone; or,
/// when the target isn't among the inputs, the inputs pass unfiltered.
pub fn select_compile_files(
    target_path: &Path,
    sibling_paths: &[PathBuf],
) -> anyhow::Result<Vec<PathBuf>> {
    let target_source = std::fs::read_to_string(target_path)?;
    let target_constraint = parse_file_constraint(&target_source);

    let context = match &target_constraint {
        Some(expr) => solve(expr),
        // Unconstrained targets build everywhere; use the host context.
        None => Some(BuildContext::host()),
    };

    let Some(context) = context else {
        if sibling_paths.iter().any(|p| p == target_path) {
            return Ok(vec![target_path.to_path_buf()]);
        }
        return Ok(sibling_paths.to_vec());
    };

    let mut selected = Vec::new();
    let mut saw_target = false;
    for path in sibling_paths {
        if path == target_path {
            selected.push(path.clone());
            saw_target = true;
            continue;
        }
        let source = std::fs::read_to_string(path)?;
        let eligible = match parse_file_constraint(&source) {
            Some(expr) => context.eval(&expr),
            None => true,
        };
        if eligible {
            selected.push(path.clone());
        }
    }
    if !saw_target {
        selected.insert(0, target_path.to_path_buf());
    }
    Ok(selected)
}
