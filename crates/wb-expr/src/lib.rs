#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wb_types::{Clock, FixedClock, HistoryPoint, TransformContext};

// ── Tokenizer ───────────────────────────────────────────────────────────
//
// Left-to-right single pass. Malformed input never errors: unknown
// characters are dropped, malformed numeric literals parse best-effort,
// an unterminated string literal takes the rest of the input. The parser
// downstream is equally permissive, so any token stream is evaluable.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
    Str(String),
}

#[must_use]
pub fn tokenize(source: &str) -> Vec<Token> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(literal.parse().unwrap_or(0.0)));
            }
            _ if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '+' | '-' | '*' | '/' | '%' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                tokens.push(Token::Str(chars[start..i].iter().collect()));
                if i < chars.len() {
                    i += 1; // closing quote
                }
            }
            _ => {
                i += 1;
            }
        }
    }
    tokens
}

// ── Window-duration parser ──────────────────────────────────────────────

pub const DEFAULT_WINDOW_MS: i64 = 60_000;

static WINDOW_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(s|m|h)$").expect("window pattern is valid"));

/// Parse a trailing-window string such as `"5m"` into milliseconds.
///
/// Any non-match (wrong unit, non-integer count, missing suffix, or a
/// digit run that overflows `i64`) silently yields the 60s default.
#[must_use]
pub fn parse_window(raw: &str) -> i64 {
    let Some(caps) = WINDOW_PATTERN.captures(raw) else {
        return DEFAULT_WINDOW_MS;
    };
    let Ok(count) = caps[1].parse::<i64>() else {
        return DEFAULT_WINDOW_MS;
    };
    let scale = match &caps[2] {
        "s" => 1_000,
        "m" => 60_000,
        _ => 3_600_000,
    };
    count.saturating_mul(scale)
}

// ── Function arguments ──────────────────────────────────────────────────

/// A call argument, typed by its token position: a lone identifier is a
/// series reference, literals pass through, anything else evaluates as a
/// nested sub-expression to a number.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg<'a> {
    Series(&'a [HistoryPoint]),
    Number(f64),
    Text(&'a str),
}

impl<'a> Arg<'a> {
    fn series(&self, ctx: &'a TransformContext) -> &'a [HistoryPoint] {
        match self {
            Self::Series(points) => points,
            Self::Number(_) | Self::Text(_) => &ctx.history,
        }
    }

    fn number(&self, ctx: &TransformContext) -> f64 {
        match self {
            Self::Number(v) => *v,
            Self::Text(s) => s.trim().parse().unwrap_or(0.0),
            // The freshest reading of the series, mirroring the
            // empty-window fallback to the current value.
            Self::Series(points) => points.last().map_or(ctx.current_value, |p| p.value),
        }
    }

    fn window_ms(&self) -> i64 {
        match self {
            Self::Text(s) => parse_window(s),
            Self::Number(v) if v.is_finite() && *v > 0.0 => *v as i64,
            _ => DEFAULT_WINDOW_MS,
        }
    }
}

fn arg_series<'a>(
    args: &'a [Arg<'a>],
    idx: usize,
    ctx: &'a TransformContext,
) -> &'a [HistoryPoint] {
    args.get(idx).map_or(ctx.history.as_slice(), |arg| arg.series(ctx))
}

fn arg_number(args: &[Arg<'_>], idx: usize, ctx: &TransformContext, default: f64) -> f64 {
    args.get(idx).map_or(default, |arg| arg.number(ctx))
}

fn arg_window(args: &[Arg<'_>], idx: usize) -> i64 {
    args.get(idx).map_or(DEFAULT_WINDOW_MS, Arg::window_ms)
}

// ── Function library ────────────────────────────────────────────────────
//
// All functions are total. Arithmetic edge cases (empty series, zero
// elapsed time, non-positive log/sqrt input) degrade to zero or to the
// context's current value rather than producing NaN/infinity.

fn rate(points: &[HistoryPoint]) -> f64 {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return 0.0;
    };
    if points.len() < 2 {
        return 0.0;
    }
    let elapsed_s = (last.timestamp - first.timestamp) as f64 / 1_000.0;
    if elapsed_s <= 0.0 {
        return 0.0;
    }
    (last.value - first.value) / elapsed_s
}

fn irate(points: &[HistoryPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    rate(&points[points.len() - 2..])
}

fn delta(points: &[HistoryPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    points[points.len() - 1].value - points[points.len() - 2].value
}

fn increase(points: &[HistoryPoint]) -> f64 {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return 0.0;
    };
    // A counter reset makes the difference negative; clamp to zero.
    (last.value - first.value).max(0.0)
}

fn window_values(points: &[HistoryPoint], now_ms: i64, window_ms: i64) -> Vec<f64> {
    let cutoff = now_ms.saturating_sub(window_ms);
    points
        .iter()
        .filter(|p| p.timestamp >= cutoff)
        .map(|p| p.value)
        .collect()
}

fn windowed_avg(values: &[f64], ctx: &TransformContext) -> f64 {
    if values.is_empty() {
        return ctx.current_value;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn windowed_min(values: &[f64], ctx: &TransformContext) -> f64 {
    if values.is_empty() {
        return ctx.current_value;
    }
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn windowed_max(values: &[f64], ctx: &TransformContext) -> f64 {
    if values.is_empty() {
        return ctx.current_value;
    }
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn windowed_stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    variance.sqrt()
}

fn percentile(points: &[HistoryPoint], p: f64, ctx: &TransformContext) -> f64 {
    if points.is_empty() {
        return ctx.current_value;
    }
    let mut values: Vec<f64> = points.iter().map(|p| p.value).collect();
    values.sort_by(f64::total_cmp);

    let p = if p > 1.0 { p / 100.0 } else { p };
    let p = p.clamp(0.0, 1.0);
    let idx = (values.len() - 1) as f64 * p;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    let frac = idx - lo as f64;
    values[lo] + (values[hi] - values[lo]) * frac
}

fn round_to(value: f64, digits: f64) -> f64 {
    let factor = 10_f64.powf(digits);
    if !factor.is_finite() || factor == 0.0 {
        return value.round();
    }
    (value * factor).round() / factor
}

/// Dispatch a library function by name. `None` means the name is not in
/// the catalog; the evaluator folds that to zero.
fn call(name: &str, args: &[Arg<'_>], ctx: &TransformContext, now_ms: i64) -> Option<f64> {
    let out = match name {
        "rate" => rate(arg_series(args, 0, ctx)),
        "irate" => irate(arg_series(args, 0, ctx)),
        "delta" => delta(arg_series(args, 0, ctx)),
        "increase" => increase(arg_series(args, 0, ctx)),
        "avg" => {
            let values = window_values(arg_series(args, 0, ctx), now_ms, arg_window(args, 1));
            windowed_avg(&values, ctx)
        }
        "min" => {
            let values = window_values(arg_series(args, 0, ctx), now_ms, arg_window(args, 1));
            windowed_min(&values, ctx)
        }
        "max" => {
            let values = window_values(arg_series(args, 0, ctx), now_ms, arg_window(args, 1));
            windowed_max(&values, ctx)
        }
        "sum" => window_values(arg_series(args, 0, ctx), now_ms, arg_window(args, 1))
            .iter()
            .sum(),
        "count" => {
            window_values(arg_series(args, 0, ctx), now_ms, arg_window(args, 1)).len() as f64
        }
        "percentile" => percentile(arg_series(args, 0, ctx), arg_number(args, 1, ctx, 0.5), ctx),
        "median" => percentile(arg_series(args, 0, ctx), 0.5, ctx),
        "stddev" => windowed_stddev(&window_values(
            arg_series(args, 0, ctx),
            now_ms,
            arg_window(args, 1),
        )),
        "abs" => arg_number(args, 0, ctx, 0.0).abs(),
        "round" => round_to(arg_number(args, 0, ctx, 0.0), arg_number(args, 1, ctx, 0.0)),
        "floor" => arg_number(args, 0, ctx, 0.0).floor(),
        "ceil" => arg_number(args, 0, ctx, 0.0).ceil(),
        "sqrt" => {
            let v = arg_number(args, 0, ctx, 0.0);
            if v <= 0.0 { 0.0 } else { v.sqrt() }
        }
        "log10" => {
            let v = arg_number(args, 0, ctx, 0.0);
            if v <= 0.0 { 0.0 } else { v.log10() }
        }
        "ln" => {
            let v = arg_number(args, 0, ctx, 0.0);
            if v <= 0.0 { 0.0 } else { v.ln() }
        }
        "pow" => arg_number(args, 0, ctx, 0.0).powf(arg_number(args, 1, ctx, 0.0)),
        "clamp" => {
            let v = arg_number(args, 0, ctx, 0.0);
            let lo = arg_number(args, 1, ctx, f64::NEG_INFINITY);
            let hi = arg_number(args, 2, ctx, f64::INFINITY);
            v.max(lo).min(hi)
        }
        "clamp_min" => {
            arg_number(args, 0, ctx, 0.0).max(arg_number(args, 1, ctx, f64::NEG_INFINITY))
        }
        "clamp_max" => arg_number(args, 0, ctx, 0.0).min(arg_number(args, 1, ctx, f64::INFINITY)),
        _ => return None,
    };
    Some(out)
}

// ── Parser / Evaluator ──────────────────────────────────────────────────
//
// Recursive descent that folds directly to f64 against the per-call
// context; no AST is persisted. Grammar, left-associative:
//
//   expression := addsub
//   addsub     := muldiv (('+'|'-') muldiv)*
//   muldiv     := unary  (('*'|'/'|'%') unary)*
//   unary      := '-' primary | primary
//   primary    := number | '(' expression ')' | identifier ['(' arglist ')']
//
// Maximally permissive: division/modulo by zero fold to 0, unknown
// identifiers resolve to 0, an unterminated parenthesis is tolerated,
// trailing tokens are ignored.

struct Evaluator<'a> {
    tokens: &'a [Token],
    pos: usize,
    ctx: &'a TransformContext,
    now_ms: i64,
}

impl<'a> Evaluator<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_ahead(&self, n: usize) -> Option<&'a Token> {
        self.tokens.get(self.pos + n)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn expression(&mut self) -> f64 {
        self.add_sub()
    }

    fn add_sub(&mut self) -> f64 {
        let mut acc = self.mul_div();
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            let op = *op;
            self.advance();
            let rhs = self.mul_div();
            acc = if op == '+' { acc + rhs } else { acc - rhs };
        }
        acc
    }

    fn mul_div(&mut self) -> f64 {
        let mut acc = self.unary();
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek() {
            let op = *op;
            self.advance();
            let rhs = self.unary();
            acc = match op {
                '*' => acc * rhs,
                '/' if rhs == 0.0 => 0.0,
                '/' => acc / rhs,
                _ if rhs == 0.0 => 0.0,
                _ => acc % rhs,
            };
        }
        acc
    }

    fn unary(&mut self) -> f64 {
        if let Some(Token::Op('-')) = self.peek() {
            self.advance();
            return -self.primary();
        }
        self.primary()
    }

    fn primary(&mut self) -> f64 {
        match self.peek() {
            Some(Token::Number(v)) => {
                let v = *v;
                self.advance();
                v
            }
            Some(Token::Str(s)) => {
                let v = s.trim().parse().unwrap_or(0.0);
                self.advance();
                v
            }
            Some(Token::LParen) => {
                self.advance();
                let inner = self.expression();
                if matches!(self.peek(), Some(Token::RParen)) {
                    self.advance();
                }
                inner
            }
            Some(Token::Ident(name)) => {
                self.advance();
                if matches!(self.peek(), Some(Token::LParen)) {
                    let args = self.call_args();
                    call(name, &args, self.ctx, self.now_ms).unwrap_or(0.0)
                } else {
                    self.resolve_value(name)
                }
            }
            // Value position holds ',' / ')' / a stray operator, or the
            // tokens ran out: degrade to zero without consuming so the
            // enclosing loops keep ownership of the cursor.
            Some(_) | None => 0.0,
        }
    }

    fn call_args(&mut self) -> Vec<Arg<'a>> {
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::LParen)) {
            self.advance();
        }
        loop {
            match self.peek() {
                None => break,
                Some(Token::RParen) => {
                    self.advance();
                    break;
                }
                Some(Token::Comma) => self.advance(),
                // A lone identifier in argument position is a series
                // reference; one opening a nested call falls through to
                // the sub-expression branch below.
                Some(Token::Ident(name))
                    if !matches!(self.peek_ahead(1), Some(Token::LParen)) =>
                {
                    args.push(Arg::Series(self.resolve_series(name)));
                    self.advance();
                }
                Some(Token::Number(v)) => {
                    args.push(Arg::Number(*v));
                    self.advance();
                }
                Some(Token::Str(s)) => {
                    args.push(Arg::Text(s));
                    self.advance();
                }
                Some(_) => {
                    let before = self.pos;
                    let value = self.expression();
                    if self.pos == before {
                        // Forward progress on arbitrary token streams.
                        self.advance();
                    } else {
                        args.push(Arg::Number(value));
                    }
                }
            }
        }
        args
    }

    fn resolve_series(&self, name: &str) -> &'a [HistoryPoint] {
        self.ctx
            .named_histories
            .get(name)
            .map_or(self.ctx.history.as_slice(), Vec::as_slice)
    }

    fn resolve_value(&self, name: &str) -> f64 {
        if name == "value" || name == "$value" {
            return self.ctx.current_value;
        }
        self.ctx.named_values.get(name).copied().unwrap_or(0.0)
    }
}

// ── Compiled expressions and the cache ──────────────────────────────────

/// An expression bound to its immutable token list. Tokenization happens
/// once; evaluation re-runs the descent against each fresh context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledExpression {
    tokens: Vec<Token>,
}

impl CompiledExpression {
    #[must_use]
    pub fn compile(source: &str) -> Self {
        Self {
            tokens: tokenize(source),
        }
    }

    #[must_use]
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Evaluate without the finiteness clamp. The result can be
    /// non-finite (e.g. `pow(10, 400)`); [`ExprCache::evaluate`] clamps,
    /// while [`validate_expression`] inspects the raw value.
    #[must_use]
    pub fn evaluate_raw(&self, ctx: &TransformContext, clock: &dyn Clock) -> f64 {
        let mut eval = Evaluator {
            tokens: &self.tokens,
            pos: 0,
            ctx,
            now_ms: clock.now_ms(),
        };
        eval.expression()
    }
}

/// Memoizes tokenization per distinct source string.
///
/// Owned by the call site rather than living in process-wide state, so
/// tests and panels don't share hidden entries. Keys are the exact
/// source text: two expressions differing only in whitespace compile
/// and cache separately. Entries are never evicted; the set of distinct
/// user-authored expressions is small in practice.
#[derive(Debug, Clone, Default)]
pub struct ExprCache {
    compiled: HashMap<String, CompiledExpression>,
}

impl ExprCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            compiled: HashMap::new(),
        }
    }

    /// Evaluate `source` against `ctx`. Always returns a finite number
    /// and never panics: a non-finite raw result falls back to the
    /// context's current value.
    pub fn evaluate(&mut self, source: &str, ctx: &TransformContext, clock: &dyn Clock) -> f64 {
        let compiled = self.compiled.entry(source.to_owned()).or_insert_with(|| {
            #[cfg(feature = "tracing")]
            tracing::debug!(source, "compiling watch expression");
            CompiledExpression::compile(source)
        });
        let raw = compiled.evaluate_raw(ctx, clock);
        if raw.is_finite() { raw } else { ctx.current_value }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

// ── Validation ──────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidateError {
    #[error("unbalanced parentheses")]
    UnbalancedParens,
    #[error("expression does not produce a finite number")]
    NonFiniteResult,
}

/// Advisory pre-flight check for user-authored expressions: balanced
/// parentheses plus a dry-run evaluation against an empty context.
/// Nothing in the core enforces it; evaluation degrades safely whether
/// or not the expression passed validation.
pub fn validate_expression(source: &str) -> Result<(), ValidateError> {
    let mut depth = 0_i32;
    for c in source.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(ValidateError::UnbalancedParens);
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ValidateError::UnbalancedParens);
    }

    let raw = CompiledExpression::compile(source)
        .evaluate_raw(&TransformContext::default(), &FixedClock(0));
    if raw.is_finite() {
        Ok(())
    } else {
        Err(ValidateError::NonFiniteResult)
    }
}

// ── Function catalog ────────────────────────────────────────────────────

/// One autocomplete entry. The catalog mirrors the dispatch table in
/// [`call`]; a test keeps the two synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FunctionSpec {
    pub name: &'static str,
    pub signature: &'static str,
    pub description: &'static str,
}

pub const FUNCTION_CATALOG: &[FunctionSpec] = &[
    FunctionSpec {
        name: "rate",
        signature: "rate(series)",
        description: "Per-second rate of change between the first and last sample.",
    },
    FunctionSpec {
        name: "irate",
        signature: "irate(series)",
        description: "Instantaneous per-second rate from the last two samples.",
    },
    FunctionSpec {
        name: "delta",
        signature: "delta(series)",
        description: "Difference between the last two sample values.",
    },
    FunctionSpec {
        name: "increase",
        signature: "increase(series)",
        description: "Total increase first-to-last, clamped at zero across counter resets.",
    },
    FunctionSpec {
        name: "avg",
        signature: "avg(series, window?)",
        description: "Mean over the trailing window (default 60s).",
    },
    FunctionSpec {
        name: "min",
        signature: "min(series, window?)",
        description: "Minimum over the trailing window (default 60s).",
    },
    FunctionSpec {
        name: "max",
        signature: "max(series, window?)",
        description: "Maximum over the trailing window (default 60s).",
    },
    FunctionSpec {
        name: "sum",
        signature: "sum(series, window?)",
        description: "Sum over the trailing window (default 60s).",
    },
    FunctionSpec {
        name: "count",
        signature: "count(series, window?)",
        description: "Number of samples in the trailing window (default 60s).",
    },
    FunctionSpec {
        name: "percentile",
        signature: "percentile(series, p)",
        description: "Interpolated p-th percentile of the series (p as fraction or percent).",
    },
    FunctionSpec {
        name: "median",
        signature: "median(series)",
        description: "50th percentile of the series.",
    },
    FunctionSpec {
        name: "stddev",
        signature: "stddev(series, window?)",
        description: "Population standard deviation over the trailing window.",
    },
    FunctionSpec {
        name: "abs",
        signature: "abs(x)",
        description: "Absolute value.",
    },
    FunctionSpec {
        name: "round",
        signature: "round(x, digits?)",
        description: "Round to the given number of decimal digits (default 0).",
    },
    FunctionSpec {
        name: "floor",
        signature: "floor(x)",
        description: "Largest integer not above x.",
    },
    FunctionSpec {
        name: "ceil",
        signature: "ceil(x)",
        description: "Smallest integer not below x.",
    },
    FunctionSpec {
        name: "sqrt",
        signature: "sqrt(x)",
        description: "Square root; zero for non-positive input.",
    },
    FunctionSpec {
        name: "log10",
        signature: "log10(x)",
        description: "Base-10 logarithm; zero for non-positive input.",
    },
    FunctionSpec {
        name: "ln",
        signature: "ln(x)",
        description: "Natural logarithm; zero for non-positive input.",
    },
    FunctionSpec {
        name: "pow",
        signature: "pow(base, exp)",
        description: "base raised to exp.",
    },
    FunctionSpec {
        name: "clamp",
        signature: "clamp(x, lo, hi)",
        description: "Restrict x to the [lo, hi] range.",
    },
    FunctionSpec {
        name: "clamp_min",
        signature: "clamp_min(x, lo)",
        description: "Restrict x to at least lo.",
    },
    FunctionSpec {
        name: "clamp_max",
        signature: "clamp_max(x, hi)",
        description: "Restrict x to at most hi.",
    },
];
