//! A small CBQL evaluator over the fixture workspace.
//!
//! Supports `AND`/`OR`/`NOT`, parentheses, comparisons (`= != ~ !~ < > <=
//! >=`), `[NOT] IN (...)`, and the relation predicates `hasLinkTo`,
//! `hasParent`, `hasChild`. Anything else is a parse error, which the
//! adapter reports the way the real remote does: as an invalid query.

use crate::workspace::{FixtureItem, FixtureWorkspace};
use almgate_kernel::RemoteId;
use almgate_kernel::cbql::{Token, tokenize};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct EvalError(pub String);

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(i64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    LinkTo,
    Parent,
    Child,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
    Compare {
        field: String,
        op: String,
        value: Literal,
    },
    In {
        field: String,
        negated: bool,
        values: Vec<Literal>,
    },
    Related {
        relation: Relation,
        targets: Vec<RemoteId>,
    },
}

pub fn compile(cbql: &str) -> Result<Filter, EvalError> {
    let mut parser = Parser {
        tokens: tokenize(cbql),
        pos: 0,
    };
    if parser.tokens.is_empty() {
        return Err(EvalError("empty query".to_string()));
    }
    let filter = parser.or()?;
    match parser.tokens.get(parser.pos) {
        None => Ok(filter),
        Some(token) => Err(EvalError(format!("unexpected {token:?}"))),
    }
}

impl Filter {
    pub fn matches(&self, item: &FixtureItem, workspace: &FixtureWorkspace) -> bool {
        match self {
            Self::And(a, b) => a.matches(item, workspace) && b.matches(item, workspace),
            Self::Or(a, b) => a.matches(item, workspace) || b.matches(item, workspace),
            Self::Not(inner) => !inner.matches(item, workspace),
            Self::Compare { field, op, value } => {
                let candidates = field_values(field, item, workspace);
                match op.as_str() {
                    "!=" => !candidates.iter().any(|c| c == value),
                    "!~" => !candidates.iter().any(|c| contains(c, value)),
                    "=" => candidates.iter().any(|c| c == value),
                    "~" => candidates.iter().any(|c| contains(c, value)),
                    ordering => candidates.iter().any(|c| {
                        let Some(cmp) = compare(c, value) else {
                            return false;
                        };
                        match ordering {
                            "<" => cmp == Ordering::Less,
                            ">" => cmp == Ordering::Greater,
                            "<=" => cmp != Ordering::Greater,
                            ">=" => cmp != Ordering::Less,
                            _ => false,
                        }
                    }),
                }
            }
            Self::In {
                field,
                negated,
                values,
            } => {
                let candidates = field_values(field, item, workspace);
                let hit = candidates.iter().any(|c| values.contains(c));
                hit != *negated
            }
            Self::Related { relation, targets } => match relation {
                Relation::LinkTo => item.links.iter().any(|l| targets.contains(l)),
                Relation::Parent => item.parent.is_some_and(|p| targets.contains(&p)),
                Relation::Child => targets.iter().any(|t| {
                    workspace
                        .item(*t)
                        .is_some_and(|child| child.parent == Some(item.id))
                }),
            },
        }
    }
}

fn contains(candidate: &Literal, needle: &Literal) -> bool {
    match (candidate, needle) {
        (Literal::Text(hay), Literal::Text(needle)) => {
            hay.to_lowercase().contains(&needle.to_lowercase())
        }
        _ => false,
    }
}

fn compare(a: &Literal, b: &Literal) -> Option<Ordering> {
    match (a, b) {
        (Literal::Number(a), Literal::Number(b)) => Some(a.cmp(b)),
        (Literal::Text(a), Literal::Text(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn id_literal(id: RemoteId) -> Literal {
    Literal::Number(id.get() as i64)
}

/// Every value `field` has on `item`, in each type it can be compared as.
fn field_values(field: &str, item: &FixtureItem, workspace: &FixtureWorkspace) -> Vec<Literal> {
    let tracker = workspace.tracker(item.tracker);
    match field.to_ascii_lowercase().as_str() {
        "id" => vec![id_literal(item.id)],
        "name" | "summary" => vec![Literal::Text(item.name.clone())],
        "parent" => item.parent.map(id_literal).into_iter().collect(),
        "tracker" => tracker
            .map(|(_, t)| vec![id_literal(t.id), Literal::Text(t.name.clone())])
            .unwrap_or_default(),
        "tracker.id" => vec![id_literal(item.tracker)],
        "tracker.name" => tracker
            .map(|(_, t)| vec![Literal::Text(t.name.clone())])
            .unwrap_or_default(),
        "project" => tracker
            .map(|(p, _)| vec![id_literal(p.id), Literal::Text(p.name.clone())])
            .unwrap_or_default(),
        "project.id" => tracker
            .map(|(p, _)| vec![id_literal(p.id)])
            .unwrap_or_default(),
        "project.name" => tracker
            .map(|(p, _)| vec![Literal::Text(p.name.clone())])
            .unwrap_or_default(),
        _ => {
            let value = item.fields.get(field).or_else(|| {
                item.fields
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(field))
                    .map(|(_, v)| v)
            });
            value.map(json_literals).unwrap_or_default()
        }
    }
}

fn json_literals(value: &Value) -> Vec<Literal> {
    match value {
        Value::String(s) => vec![Literal::Text(s.clone())],
        Value::Number(n) => n.as_i64().map(Literal::Number).into_iter().collect(),
        Value::Bool(b) => vec![Literal::Text(b.to_string())],
        Value::Array(values) => values.iter().flat_map(json_literals).collect(),
        Value::Null | Value::Object(_) => Vec::new(),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.keyword_at(self.pos, keyword)
    }

    fn keyword_at(&self, pos: usize, keyword: &str) -> bool {
        matches!(self.tokens.get(pos), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, wanted: Token) -> Result<(), EvalError> {
        match self.next() {
            Some(token) if token == wanted => Ok(()),
            Some(token) => Err(EvalError(format!("expected {wanted:?}, found {token:?}"))),
            None => Err(EvalError(format!("expected {wanted:?}, found end of query"))),
        }
    }

    fn or(&mut self) -> Result<Filter, EvalError> {
        let mut left = self.and()?;
        while self.peek_keyword("OR") {
            self.pos += 1;
            left = Filter::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Filter, EvalError> {
        let mut left = self.unary()?;
        while self.peek_keyword("AND") {
            self.pos += 1;
            left = Filter::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Filter, EvalError> {
        if self.peek_keyword("NOT") {
            self.pos += 1;
            return Ok(Filter::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Filter, EvalError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Word(name)) if self.peek() == Some(&Token::LParen) => {
                let relation = match name.as_str() {
                    "hasLinkTo" => Relation::LinkTo,
                    "hasParent" => Relation::Parent,
                    "hasChild" => Relation::Child,
                    other => return Err(EvalError(format!("unknown function `{other}`"))),
                };
                let targets = self
                    .list()?
                    .into_iter()
                    .map(|literal| match literal {
                        Literal::Number(n) if n >= 0 => Ok(RemoteId::new(n as u64)),
                        other => Err(EvalError(format!("{name} expects item ids, got {other:?}"))),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Filter::Related { relation, targets })
            }
            Some(Token::Word(field)) => self.condition(field),
            Some(token) => Err(EvalError(format!("unexpected {token:?}"))),
            None => Err(EvalError("unexpected end of query".to_string())),
        }
    }

    fn condition(&mut self, field: String) -> Result<Filter, EvalError> {
        if self.peek_keyword("IN") {
            self.pos += 1;
            return Ok(Filter::In {
                field,
                negated: false,
                values: self.list()?,
            });
        }
        if self.peek_keyword("NOT") && self.keyword_at(self.pos + 1, "IN") {
            self.pos += 2;
            return Ok(Filter::In {
                field,
                negated: true,
                values: self.list()?,
            });
        }
        match self.next() {
            Some(Token::Op(op)) => Ok(Filter::Compare {
                field,
                op,
                value: self.literal()?,
            }),
            _ => Err(EvalError(format!("expected an operator after `{field}`"))),
        }
    }

    fn list(&mut self) -> Result<Vec<Literal>, EvalError> {
        self.expect(Token::LParen)?;
        let mut values = vec![self.literal()?];
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            values.push(self.literal()?);
        }
        self.expect(Token::RParen)?;
        Ok(values)
    }

    fn literal(&mut self) -> Result<Literal, EvalError> {
        match self.next() {
            Some(Token::Number(raw)) => raw
                .parse()
                .map(Literal::Number)
                .map_err(|_| EvalError(format!("number out of range: {raw}"))),
            Some(Token::Str { value, .. }) => Ok(Literal::Text(value)),
            Some(token) => Err(EvalError(format!("expected a value, found {token:?}"))),
            None => Err(EvalError("expected a value, found end of query".to_string())),
        }
    }
}
