// SPDX-License-Identifier: Apache-2.0

//! Line-oriented rule language.
//!
//! ```text
//! # comment
//! /<regex>/ inc <counter> [<amount>]
//! /<regex>/ set <gauge> <amount>
//! /<regex>/ add <gauge> <amount>
//! ```
//!
//! An amount is a number literal or a capture reference, `$name` or `$N`.
//! A `/` inside the regex is written as `\/`.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::Arc;

use super::{CompileError, Compiler, LogLine, Program, RuntimeFault};
use crate::metrics::{MetricKind, MetricStore};

const EXTENSION: &str = "rules";

#[derive(Debug, Default, Clone, Copy)]
pub struct RuleCompiler;

impl RuleCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl Compiler for RuleCompiler {
    fn compile(&self, name: &str, source: &str) -> Result<Arc<dyn Program>, CompileError> {
        let mut rules = Vec::new();
        let mut kinds: HashMap<String, MetricKind> = HashMap::new();

        for (idx, raw) in source.lines().enumerate() {
            let line_no = idx + 1;
            let trimmed = raw.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let indent = raw.len() - trimmed.len();
            let rule = parse_rule(name, line_no, raw, indent)?;

            let kind = rule.action.kind();
            match kinds.get(&rule.metric) {
                Some(existing) if *existing != kind => {
                    return Err(CompileError::new(
                        name,
                        line_no,
                        column(raw, rule.metric_offset),
                        format!(
                            "metric {:?} is used as both a {} and a {}",
                            rule.metric, existing, kind
                        ),
                    ));
                }
                _ => {
                    kinds.insert(rule.metric.clone(), kind);
                }
            }

            rules.push(rule);
        }

        Ok(Arc::new(RuleProgram { rules }))
    }

    fn extension(&self) -> &str {
        EXTENSION
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Inc,
    Set,
    Add,
}

impl Action {
    fn kind(&self) -> MetricKind {
        match self {
            Action::Inc => MetricKind::Counter,
            Action::Set | Action::Add => MetricKind::Gauge,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Amount {
    Literal(f64),
    Named(String),
    Index(usize),
}

#[derive(Debug)]
struct Rule {
    regex: Regex,
    action: Action,
    metric: String,
    metric_offset: usize,
    amount: Amount,
}

/// Byte offset to 1-based character column.
fn column(raw: &str, offset: usize) -> usize {
    raw[..offset].chars().count() + 1
}

/// Splits `s` on whitespace, keeping each token's byte offset relative to `base`.
fn tokens(s: &str, base: usize) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in s.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(st)) => {
                out.push((base + st, &s[st..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(st) = start {
        out.push((base + st, &s[st..]));
    }
    out
}

fn valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn parse_rule(program: &str, line_no: usize, raw: &str, start: usize) -> Result<Rule, CompileError> {
    let err = |offset: usize, msg: String| CompileError::new(program, line_no, column(raw, offset), msg);

    let body = &raw[start..];
    if !body.starts_with('/') {
        return Err(err(start, "rule must start with a /regex/".to_string()));
    }

    // Find the closing delimiter, unescaping `\/`.
    let mut pattern = String::new();
    let mut end = None;
    let mut chars = body.char_indices().skip(1).peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => match chars.peek() {
                Some((_, '/')) => {
                    pattern.push('/');
                    chars.next();
                }
                Some(&(_, next)) => {
                    pattern.push('\\');
                    pattern.push(next);
                    chars.next();
                }
                None => pattern.push('\\'),
            },
            '/' => {
                end = Some(i);
                break;
            }
            _ => pattern.push(c),
        }
    }
    let Some(end) = end else {
        return Err(err(start, "unterminated regex".to_string()));
    };

    let regex = Regex::new(&pattern).map_err(|e| err(start + 1, format!("invalid regex: {}", e)))?;

    let rest_offset = start + end + 1;
    let rest = &raw[rest_offset..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return Err(err(rest_offset, "expected whitespace after regex".to_string()));
    }

    let toks = tokens(rest, rest_offset);
    let Some(&(action_offset, action_tok)) = toks.first() else {
        return Err(err(rest_offset, "missing action (inc, set or add)".to_string()));
    };
    let action = match action_tok {
        "inc" => Action::Inc,
        "set" => Action::Set,
        "add" => Action::Add,
        other => return Err(err(action_offset, format!("unknown action {:?}", other))),
    };

    let Some(&(metric_offset, metric)) = toks.get(1) else {
        return Err(err(rest_offset + rest.len(), "missing metric name".to_string()));
    };
    if !valid_metric_name(metric) {
        return Err(err(metric_offset, format!("invalid metric name {:?}", metric)));
    }

    let amount = match toks.get(2) {
        None if action == Action::Inc => Amount::Literal(1.0),
        None => {
            return Err(err(
                rest_offset + rest.len(),
                format!("{} requires an amount", action_tok),
            ));
        }
        Some(&(offset, tok)) => parse_amount(tok, &regex, action).map_err(|m| err(offset, m))?,
    };

    if let Some(&(offset, tok)) = toks.get(3) {
        return Err(err(offset, format!("unexpected token {:?}", tok)));
    }

    Ok(Rule {
        regex,
        action,
        metric: metric.to_string(),
        metric_offset,
        amount,
    })
}

fn parse_amount(tok: &str, regex: &Regex, action: Action) -> Result<Amount, String> {
    if let Some(reference) = tok.strip_prefix('$') {
        if let Ok(index) = reference.parse::<usize>() {
            if index >= regex.captures_len() {
                return Err(format!("capture group ${} does not exist", index));
            }
            return Ok(Amount::Index(index));
        }
        if !regex.capture_names().flatten().any(|n| n == reference) {
            return Err(format!("capture group ${} does not exist", reference));
        }
        return Ok(Amount::Named(reference.to_string()));
    }

    let value: f64 = tok
        .parse()
        .map_err(|_| format!("invalid amount {:?}", tok))?;
    if !value.is_finite() {
        return Err(format!("invalid amount {:?}", tok));
    }
    if action == Action::Inc {
        counter_delta(value).map_err(|f| f.message)?;
    }
    Ok(Amount::Literal(value))
}

fn counter_delta(value: f64) -> Result<u64, RuntimeFault> {
    if value < 0.0 || value.fract() != 0.0 {
        return Err(RuntimeFault::new(format!(
            "counter increment must be a non-negative integer, got {}",
            value
        )));
    }
    // u64::MAX rounds up to 2^64 as an f64.
    if value >= u64::MAX as f64 {
        return Err(RuntimeFault::new(format!(
            "counter increment {} is out of range",
            value
        )));
    }
    Ok(value as u64)
}

impl Rule {
    fn resolve(&self, caps: &Captures<'_>) -> Result<f64, RuntimeFault> {
        let text = match &self.amount {
            Amount::Literal(v) => return Ok(*v),
            Amount::Named(name) => caps.name(name).map(|m| m.as_str()).ok_or_else(|| {
                RuntimeFault::new(format!("capture ${} did not participate in the match", name))
            })?,
            Amount::Index(idx) => caps.get(*idx).map(|m| m.as_str()).ok_or_else(|| {
                RuntimeFault::new(format!("capture ${} did not participate in the match", idx))
            })?,
        };

        text.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| RuntimeFault::new(format!("captured value {:?} is not a number", text)))
    }

    fn apply(&self, caps: &Captures<'_>, store: &MetricStore) -> Result<(), RuntimeFault> {
        let amount = self.resolve(caps)?;
        let to_fault = |e: crate::metrics::MetricError| RuntimeFault::new(e.to_string());

        match self.action {
            Action::Inc => {
                let delta = counter_delta(amount)?;
                let counter = store.counter(&self.metric).map_err(to_fault)?;
                if counter.checked_add(delta).is_none() {
                    return Err(RuntimeFault::new(format!(
                        "counter {:?} would overflow adding {}",
                        self.metric, delta
                    )));
                }
            }
            Action::Set => store.gauge(&self.metric).map_err(to_fault)?.set(amount),
            Action::Add => store.gauge(&self.metric).map_err(to_fault)?.add(amount),
        }
        Ok(())
    }
}

struct RuleProgram {
    rules: Vec<Rule>,
}

impl Program for RuleProgram {
    /// Every matching rule fires. The first fault is reported once all rules ran.
    fn execute(&self, line: &LogLine, store: &MetricStore) -> Result<(), RuntimeFault> {
        let mut first_fault = None;
        for rule in &self.rules {
            let Some(caps) = rule.regex.captures(&line.text) else {
                continue;
            };
            if let Err(fault) = rule.apply(&caps, store) {
                first_fault.get_or_insert(fault);
            }
        }

        match first_fault {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}
