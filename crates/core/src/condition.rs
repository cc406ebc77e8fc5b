//! Condition predicates
//!
//! A job's `condition` is a small predicate over the rendered build
//! environment: `name = 'value'` and `name != 'value'` comparisons joined
//! by `and` / `or` (`and` binds tighter). A bare name tests that the
//! variable is set and non-empty. Jobs whose condition is false are skipped
//! without error.

use crate::errors::{HoneError, Result};
use crate::graph::JobCallback;
use crate::job::Job;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Value(String),
    Eq,
    Ne,
    And,
    Or,
}

fn tokenize(condition: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = condition.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => value.push(ch),
                        None => {
                            return Err(HoneError::config(format!(
                                "Unterminated string in condition: {condition}"
                            )));
                        }
                    }
                }
                tokens.push(Token::Value(value));
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(HoneError::config(format!(
                        "Expected != in condition: {condition}"
                    )));
                }
                tokens.push(Token::Ne);
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' || ch == '-' || ch == '.' {
                        word.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if word.is_empty() {
                    return Err(HoneError::config(format!(
                        "Unexpected character {c:?} in condition: {condition}"
                    )));
                }
                match word.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: std::iter::Peekable<std::slice::Iter<'a, Token>>,
    env: &'a IndexMap<String, String>,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn clause(&mut self) -> Result<bool> {
        let name = match self.tokens.next() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(HoneError::config(format!(
                    "Expected a variable name, found {other:?} in condition: {}",
                    self.source
                )));
            }
        };

        let current = self.env.get(name).cloned().unwrap_or_default();

        match self.tokens.peek() {
            Some(Token::Eq) | Some(Token::Ne) => {
                let negate = matches!(self.tokens.next(), Some(Token::Ne));
                let expected = match self.tokens.next() {
                    Some(Token::Value(v)) => v.clone(),
                    Some(Token::Ident(v)) => v.clone(),
                    other => {
                        return Err(HoneError::config(format!(
                            "Expected a value, found {other:?} in condition: {}",
                            self.source
                        )));
                    }
                };
                Ok((current == expected) != negate)
            }
            _ => Ok(!current.is_empty()),
        }
    }

    fn and_expr(&mut self) -> Result<bool> {
        let mut value = self.clause()?;
        while self.tokens.peek() == Some(&&Token::And) {
            self.tokens.next();
            let rhs = self.clause()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn or_expr(&mut self) -> Result<bool> {
        let mut value = self.and_expr()?;
        while self.tokens.peek() == Some(&&Token::Or) {
            self.tokens.next();
            let rhs = self.and_expr()?;
            value = value || rhs;
        }
        Ok(value)
    }
}

/// Evaluate a condition string against the rendered build environment.
pub fn evaluate(condition: &str, env: &IndexMap<String, String>) -> Result<bool> {
    let tokens = tokenize(condition)?;
    if tokens.is_empty() {
        return Ok(true);
    }

    let mut parser = Parser {
        tokens: tokens.iter().peekable(),
        env,
        source: condition,
    };
    let value = parser.or_expr()?;

    if let Some(extra) = parser.tokens.next() {
        return Err(HoneError::config(format!(
            "Trailing {extra:?} in condition: {condition}"
        )));
    }

    Ok(value)
}

/// Wrap a callback so jobs whose condition evaluates false are skipped
/// successfully without reaching the executor.
pub fn with_condition(env: IndexMap<String, String>, inner: JobCallback) -> JobCallback {
    JobCallback::new(move |job: Arc<Job>| {
        let env = env.clone();
        let inner = inner.clone();
        Box::pin(async move {
            if let Some(condition) = &job.condition {
                if !evaluate(condition, &env)? {
                    info!(job = %job.name, "Skipping job, condition not met: {}", condition);
                    return Ok(());
                }
            }
            inner.run(job).await
        })
    })
}
