/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Parser and evaluator for DARC rule expressions.
//!
//! The grammar, in order of increasing precedence:
//!
//! ```text
//! expr   := term ('|' term)*
//! term   := factor ('&' factor)*
//! factor := '(' expr ')' | atom
//! ```
//!
//! An atom is an identity string such as `ed25519:<hex>` or `darc:<hex>`. A `darc:` atom is
//! resolved through the caller-supplied resolver and satisfied when the referenced DARC's sign
//! rule is satisfied, transitively. Every DARC is visited at most once per evaluation, so cyclic
//! references terminate (and evaluate to false on the back edge).

use std::collections::HashSet;

use super::{Darc, DarcError, DarcId, SIGN_ACTION};

/// Resolves a `darc:<hex>` identity string into the latest version of that DARC, typically by
/// looking it up in the state trie.
pub type DarcResolver<'a> = &'a dyn Fn(&str) -> Option<Darc>;

/// Evaluate a rule expression against a set of identity strings.
///
/// Returns `Ok(())` when the expression is satisfied and an error when it is malformed or
/// unsatisfied.
pub fn eval_expr(
    expr: &str,
    resolver: DarcResolver,
    identities: &[String],
) -> Result<(), DarcError> {
    let mut visited = HashSet::new();
    if eval_expr_inner(expr, resolver, identities, &mut visited)? {
        Ok(())
    } else {
        Err(DarcError::ExpressionUnsatisfied)
    }
}

fn eval_expr_inner(
    expr: &str,
    resolver: DarcResolver,
    identities: &[String],
    visited: &mut HashSet<DarcId>,
) -> Result<bool, DarcError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        resolver,
        identities,
        visited,
    };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(DarcError::MalformedExpression);
    }
    Ok(value)
}

#[derive(Clone, PartialEq, Eq, Debug)]
enum Token {
    And,
    Or,
    Open,
    Close,
    Atom(String),
}

fn tokenize(expr: &str) -> Result<Vec<Token>, DarcError> {
    let mut tokens = Vec::new();
    let mut atom = String::new();
    for c in expr.chars() {
        let delim = match c {
            '&' => Some(Token::And),
            '|' => Some(Token::Or),
            '(' => Some(Token::Open),
            ')' => Some(Token::Close),
            c if c.is_whitespace() => None,
            c => {
                atom.push(c);
                continue;
            }
        };
        if !atom.is_empty() {
            tokens.push(Token::Atom(std::mem::take(&mut atom)));
        }
        if let Some(t) = delim {
            tokens.push(t);
        }
    }
    if !atom.is_empty() {
        tokens.push(Token::Atom(atom));
    }
    if tokens.is_empty() {
        return Err(DarcError::MalformedExpression);
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    resolver: DarcResolver<'a>,
    identities: &'a [String],
    visited: &'a mut HashSet<DarcId>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expr(&mut self) -> Result<bool, DarcError> {
        let mut value = self.term()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.term()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<bool, DarcError> {
        let mut value = self.factor()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.factor()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<bool, DarcError> {
        match self.next() {
            Some(Token::Open) => {
                let value = self.expr()?;
                if self.next() != Some(Token::Close) {
                    return Err(DarcError::MalformedExpression);
                }
                Ok(value)
            }
            Some(Token::Atom(atom)) => self.atom(&atom),
            _ => Err(DarcError::MalformedExpression),
        }
    }

    fn atom(&mut self, atom: &str) -> Result<bool, DarcError> {
        if self.identities.iter().any(|id| id == atom) {
            return Ok(true);
        }
        if let Some(hex) = atom.strip_prefix("darc:") {
            let Some(id) = DarcId::from_hex(hex) else {
                return Ok(false);
            };
            // Each darc is visited at most once, so cyclic references terminate.
            if !self.visited.insert(id) {
                return Ok(false);
            }
            let Some(darc) = (self.resolver)(atom) else {
                return Ok(false);
            };
            let Some(sign_expr) = darc.rules.get(SIGN_ACTION) else {
                return Ok(false);
            };
            return eval_expr_inner(sign_expr, self.resolver, self.identities, self.visited);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::darc::{Rules, SIGN_ACTION};

    fn ids(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    fn no_resolver(_: &str) -> Option<Darc> {
        None
    }

    #[test]
    fn single_atom() {
        assert!(eval_expr("ed25519:aa", &no_resolver, &ids(&["ed25519:aa"])).is_ok());
        assert!(eval_expr("ed25519:aa", &no_resolver, &ids(&["ed25519:bb"])).is_err());
    }

    #[test]
    fn and_or_precedence() {
        // a | b & c parses as a | (b & c).
        let identities = ids(&["a"]);
        assert!(eval_expr("a | b & c", &no_resolver, &identities).is_ok());
        let identities = ids(&["b"]);
        assert!(eval_expr("a | b & c", &no_resolver, &identities).is_err());
        let identities = ids(&["b", "c"]);
        assert!(eval_expr("a | b & c", &no_resolver, &identities).is_ok());
    }

    #[test]
    fn parenthesized() {
        let identities = ids(&["a", "c"]);
        assert!(eval_expr("(a | b) & c", &no_resolver, &identities).is_ok());
        let identities = ids(&["a"]);
        assert!(eval_expr("(a | b) & c", &no_resolver, &identities).is_err());
    }

    #[test]
    fn malformed_expressions_rejected() {
        assert_eq!(
            eval_expr("", &no_resolver, &ids(&["a"])).unwrap_err(),
            DarcError::MalformedExpression
        );
        assert!(eval_expr("a &", &no_resolver, &ids(&["a"])).is_err());
        assert!(eval_expr("(a", &no_resolver, &ids(&["a"])).is_err());
        assert!(eval_expr("a b", &no_resolver, &ids(&["a"])).is_err());
    }

    #[test]
    fn nested_darc_reference() {
        let mut rules = Rules::new();
        rules.set(SIGN_ACTION, "ed25519:aa");
        let inner = Darc::new(rules, b"inner");
        let inner_atom = format!("darc:{}", inner.base_id().hex());

        let resolver = move |s: &str| {
            if s == inner_atom {
                Some(inner.clone())
            } else {
                None
            }
        };

        let inner2 = Darc::new(
            {
                let mut r = Rules::new();
                r.set(SIGN_ACTION, "ed25519:aa");
                r
            },
            b"inner",
        );
        let atom = format!("darc:{}", inner2.base_id().hex());
        assert!(eval_expr(&atom, &resolver, &ids(&["ed25519:aa"])).is_ok());
        assert!(eval_expr(&atom, &resolver, &ids(&["ed25519:bb"])).is_err());
    }

    #[test]
    fn cyclic_darc_references_terminate() {
        // A darc whose sign rule refers back to itself must evaluate to false, not hang.
        let mut rules = Rules::new();
        rules.set(SIGN_ACTION, "placeholder");
        let mut cyclic = Darc::new(rules, b"cyclic");
        let self_atom = format!("darc:{}", cyclic.base_id().hex());
        cyclic.rules.set(SIGN_ACTION, &self_atom);

        let atom = self_atom.clone();
        let resolver = move |s: &str| {
            if s == atom {
                Some(cyclic.clone())
            } else {
                None
            }
        };
        assert!(eval_expr(&self_atom, &resolver, &ids(&["ed25519:aa"])).is_err());
    }
}
