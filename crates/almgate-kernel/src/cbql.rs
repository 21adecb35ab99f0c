//! CBQL token stream and the structured query expression built on it.
//!
//! CBQL is the tracker's read-only item query language. The kernel never
//! evaluates it; it only needs enough structure to find scope clauses,
//! relation predicates, forbidden constructs, and statement boundaries, and
//! to carry identifier bindings until dispatch.

use crate::identifier::{Binding, IdentifierKind, RemoteId};
use serde::{Serialize, Serializer};
use std::fmt;

/// Boolean and membership keywords. Never relation predicates.
pub const KEYWORDS: &[&str] = &["AND", "OR", "NOT", "IN"];

/// Fields that open a scope clause.
pub const SCOPE_FIELDS: &[&str] = &[
    "tracker",
    "tracker.id",
    "tracker.name",
    "project",
    "project.id",
    "project.name",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(String),
    Number(String),
    Str { value: String, quote: char },
    Op(String),
    LParen,
    RParen,
    Comma,
    Semicolon,
    Star,
    /// A resolved or pending identifier; renders as its remote ID.
    Ident(Binding),
    Other(char),
}

impl Token {
    pub fn word(text: impl Into<String>) -> Self {
        Self::Word(text.into())
    }

    pub fn is_keyword(&self) -> bool {
        match self {
            Self::Word(w) => KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(w)),
            _ => false,
        }
    }

    fn is_keyword_named(&self, keyword: &str) -> bool {
        matches!(self, Self::Word(w) if w.eq_ignore_ascii_case(keyword))
    }
}

/// The identifier kind addressed by an ID field, if `word` is one.
fn id_field_kind(word: &str) -> Option<IdentifierKind> {
    match word.to_ascii_lowercase().as_str() {
        "tracker" | "tracker.id" => Some(IdentifierKind::Tracker),
        "project" | "project.id" => Some(IdentifierKind::Project),
        "id" | "item.id" => Some(IdentifierKind::Item),
        _ => None,
    }
}

/// Split CBQL source into tokens.
///
/// Tokenizing never fails: unknown characters become [`Token::Other`] and an
/// unterminated string swallows the rest of the input, leaving judgement to
/// the grammar validator and the remote parser.
pub fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let mut word = String::new();
            while let Some(&n) = chars.peek() {
                if n.is_ascii_alphanumeric() || n == '_' || n == '.' {
                    word.push(n);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Word(word));
            continue;
        }
        if c.is_ascii_digit() {
            let mut number = String::new();
            while let Some(&n) = chars.peek() {
                if n.is_ascii_digit() {
                    number.push(n);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Number(number));
            continue;
        }

        chars.next();
        let token = match c {
            '\'' | '"' => {
                let mut value = String::new();
                for n in chars.by_ref() {
                    if n == c {
                        break;
                    }
                    value.push(n);
                }
                Token::Str { value, quote: c }
            }
            '=' => Token::Op("=".to_string()),
            '~' => Token::Op("~".to_string()),
            '!' => match chars.peek() {
                Some('=') => {
                    chars.next();
                    Token::Op("!=".to_string())
                }
                Some('~') => {
                    chars.next();
                    Token::Op("!~".to_string())
                }
                _ => Token::Other('!'),
            },
            '<' | '>' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    Token::Op(format!("{c}="))
                } else {
                    Token::Op(c.to_string())
                }
            }
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            ';' => Token::Semicolon,
            '*' => Token::Star,
            other => Token::Other(other),
        };
        tokens.push(token);
    }

    tokens
}

/// Whether a scope clause bounds trackers or projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Tracker,
    Project,
}

impl ScopeKind {
    pub fn identifier_kind(self) -> IdentifierKind {
        match self {
            Self::Tracker => IdentifierKind::Tracker,
            Self::Project => IdentifierKind::Project,
        }
    }

    fn id_field(self) -> &'static str {
        match self {
            Self::Tracker => "tracker.id",
            Self::Project => "project.id",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier_kind().as_str())
    }
}

/// Location of one scope clause within an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeClause {
    pub kind: ScopeKind,
    /// Token index of the scope field.
    pub field_index: usize,
    /// Whether the field addresses remote IDs (`tracker`, `tracker.id`)
    /// rather than names.
    pub by_id: bool,
    /// Token indices of the clause's value operands.
    pub value_indices: Vec<usize>,
}

/// A relational term: `name(args...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationalTerm {
    pub name: String,
    pub name_index: usize,
    pub arg_indices: Vec<usize>,
}

/// A numeric literal that names a remote identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierLiteral {
    pub index: usize,
    pub kind: IdentifierKind,
    pub id: RemoteId,
}

/// Rendering failed because an identifier slot is still pending.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot render query: {0} is still unresolved")]
pub struct UnboundSlot(pub String);

/// A CBQL read request as a token stream.
///
/// Immutable once built: rewriting methods return a new expression.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryExpression {
    tokens: Vec<Token>,
}

impl QueryExpression {
    pub fn parse(source: &str) -> Self {
        Self {
            tokens: tokenize(source),
        }
    }

    pub fn from_tokens(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Number of `;`-separated statements, ignoring empty ones.
    pub fn statement_count(&self) -> usize {
        self.tokens
            .split(|t| *t == Token::Semicolon)
            .filter(|segment| !segment.is_empty())
            .count()
    }

    pub fn semicolon_count(&self) -> usize {
        self.tokens.iter().filter(|t| **t == Token::Semicolon).count()
    }

    /// Every scope clause, in source order.
    pub fn scope_clauses(&self) -> Vec<ScopeClause> {
        let mut clauses = Vec::new();
        for (index, token) in self.tokens.iter().enumerate() {
            let Token::Word(word) = token else {
                continue;
            };
            let field = word.to_ascii_lowercase();
            if !SCOPE_FIELDS.contains(&field.as_str()) {
                continue;
            }
            let Some(operands_start) = self.scope_operator_end(index + 1) else {
                continue;
            };
            let kind = if field.starts_with("tracker") {
                ScopeKind::Tracker
            } else {
                ScopeKind::Project
            };
            clauses.push(ScopeClause {
                kind,
                field_index: index,
                by_id: !field.ends_with(".name"),
                value_indices: self.operand_indices(operands_start),
            });
        }
        clauses
    }

    /// If a scope operator (`=` or `IN`) starts at `index`, return the index
    /// just past it. Negated forms widen the query instead of bounding it,
    /// so they never open a scope clause.
    fn scope_operator_end(&self, index: usize) -> Option<usize> {
        match self.tokens.get(index)? {
            Token::Op(op) if op == "=" => Some(index + 1),
            t if t.is_keyword_named("IN") => Some(index + 1),
            _ => None,
        }
    }

    /// Like [`Self::scope_operator_end`], but also accepts `!=` and `NOT IN`:
    /// a negated comparison still names identifiers.
    fn id_operator_end(&self, index: usize) -> Option<usize> {
        if let Some(end) = self.scope_operator_end(index) {
            return Some(end);
        }
        match self.tokens.get(index)? {
            Token::Op(op) if op == "!=" => Some(index + 1),
            t if t.is_keyword_named("NOT") => match self.tokens.get(index + 1) {
                Some(next) if next.is_keyword_named("IN") => Some(index + 2),
                _ => None,
            },
            _ => None,
        }
    }

    /// Value operands starting at `index`: a single value, or a parenthesised
    /// comma list.
    fn operand_indices(&self, index: usize) -> Vec<usize> {
        match self.tokens.get(index) {
            Some(Token::LParen) => self.group_indices(index),
            Some(_) => vec![index],
            None => Vec::new(),
        }
    }

    /// Indices of non-punctuation tokens inside the parenthesised group that
    /// opens at `open`.
    fn group_indices(&self, open: usize) -> Vec<usize> {
        let mut depth = 0usize;
        let mut indices = Vec::new();
        for (index, token) in self.tokens.iter().enumerate().skip(open) {
            match token {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        break;
                    }
                }
                Token::Comma => {}
                _ if depth == 1 => indices.push(index),
                _ => {}
            }
        }
        indices
    }

    /// Every `name(...)` term whose name is not a keyword.
    pub fn relational_terms(&self) -> Vec<RelationalTerm> {
        self.tokens
            .windows(2)
            .enumerate()
            .filter_map(|(index, pair)| match pair {
                [Token::Word(name), Token::LParen] if !pair[0].is_keyword() => {
                    Some(RelationalTerm {
                        name: name.clone(),
                        name_index: index,
                        arg_indices: self.group_indices(index + 1),
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// Numeric literals that stand for remote identifiers: values compared
    /// against an ID field (`tracker.id`, `project.id`, `id`, `item.id`, ...)
    /// and arguments of relational terms.
    pub fn identifier_literals(&self) -> Vec<IdentifierLiteral> {
        let mut literals = Vec::new();
        for (index, token) in self.tokens.iter().enumerate() {
            let Token::Word(word) = token else {
                continue;
            };
            let Some(kind) = id_field_kind(word) else {
                continue;
            };
            let Some(operands_start) = self.id_operator_end(index + 1) else {
                continue;
            };
            literals.extend(
                self.operand_indices(operands_start)
                    .into_iter()
                    .filter_map(|i| self.number_literal(i, kind)),
            );
        }
        for term in self.relational_terms() {
            literals.extend(
                term.arg_indices
                    .into_iter()
                    .filter_map(|i| self.number_literal(i, IdentifierKind::Item)),
            );
        }
        literals.sort_by_key(|literal| literal.index);
        literals
    }

    fn number_literal(&self, index: usize, kind: IdentifierKind) -> Option<IdentifierLiteral> {
        let Some(Token::Number(raw)) = self.tokens.get(index) else {
            return None;
        };
        let id = raw.parse::<u64>().ok()?;
        Some(IdentifierLiteral {
            index,
            kind,
            id: RemoteId::new(id),
        })
    }

    /// All identifier bindings carried by the expression.
    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.tokens.iter().filter_map(|t| match t {
            Token::Ident(binding) => Some(binding),
            _ => None,
        })
    }

    /// Replace tokens at the given indices.
    pub fn with_replacements(&self, replacements: Vec<(usize, Token)>) -> Self {
        let mut tokens = self.tokens.clone();
        for (index, token) in replacements {
            if let Some(slot) = tokens.get_mut(index) {
                *slot = token;
            }
        }
        Self { tokens }
    }

    /// Return a copy with every binding passed through `bind`.
    pub fn map_bindings<E>(
        &self,
        mut bind: impl FnMut(&Binding) -> Result<Binding, E>,
    ) -> Result<Self, E> {
        let tokens = self
            .tokens
            .iter()
            .map(|token| match token {
                Token::Ident(binding) => bind(binding).map(Token::Ident),
                other => Ok(other.clone()),
            })
            .collect::<Result<Vec<_>, E>>()?;
        Ok(Self { tokens })
    }

    /// Conjoin `AND term` tokens onto the expression.
    pub fn and(&self, term: Vec<Token>) -> Self {
        let mut tokens = self.tokens.clone();
        if !tokens.is_empty() {
            tokens.push(Token::word("AND"));
        }
        tokens.extend(term);
        Self { tokens }
    }

    /// Prefix a `tracker.id IN (...)`/`project.id IN (...)` scope clause.
    ///
    /// A non-empty body is parenthesised so its own `OR`s stay inside the
    /// scope.
    pub fn scoped(&self, kind: ScopeKind, targets: &[Binding]) -> Self {
        let mut tokens = vec![
            Token::word(kind.id_field()),
            Token::word("IN"),
            Token::LParen,
        ];
        for (i, binding) in targets.iter().enumerate() {
            if i > 0 {
                tokens.push(Token::Comma);
            }
            tokens.push(Token::Ident(binding.clone()));
        }
        tokens.push(Token::RParen);
        if !self.tokens.is_empty() {
            tokens.push(Token::word("AND"));
            tokens.push(Token::LParen);
            tokens.extend(self.tokens.iter().cloned());
            tokens.push(Token::RParen);
        }
        Self { tokens }
    }

    /// Render the final CBQL string. Fails on pending bindings.
    pub fn render(&self) -> Result<String, UnboundSlot> {
        render_tokens(&self.tokens, |binding| match binding {
            Binding::Known(identifier) => Ok(identifier.id().to_string()),
            pending => Err(UnboundSlot(pending.preview())),
        })
    }

    /// Render with pending bindings shown as placeholders. For display only.
    pub fn preview(&self) -> String {
        render_tokens(&self.tokens, |binding| {
            Ok::<_, std::convert::Infallible>(binding.preview())
        })
        .unwrap_or_default()
    }
}

impl fmt::Display for QueryExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.preview())
    }
}

impl Serialize for QueryExpression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.preview())
    }
}

fn render_tokens<E>(
    tokens: &[Token],
    mut ident: impl FnMut(&Binding) -> Result<String, E>,
) -> Result<String, E> {
    let mut out = String::new();
    let mut prev: Option<&Token> = None;
    for token in tokens {
        let text = match token {
            Token::Word(w) => w.clone(),
            Token::Number(n) => n.clone(),
            Token::Str { value, quote } => format!("{quote}{value}{quote}"),
            Token::Op(op) => op.clone(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::Comma => ",".to_string(),
            Token::Semicolon => ";".to_string(),
            Token::Star => "*".to_string(),
            Token::Ident(binding) => ident(binding)?,
            Token::Other(c) => c.to_string(),
        };
        let glue = match (prev, token) {
            (None, _) => false,
            (Some(Token::LParen), _) => false,
            (_, Token::RParen | Token::Comma | Token::Semicolon) => false,
            (Some(p @ Token::Word(_)), Token::LParen) => p.is_keyword(),
            _ => true,
        };
        if glue {
            out.push(' ');
        }
        out.push_str(&text);
        prev = Some(token);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::ToolKind;
    use crate::identifier::{CallId, Identifier, Provenance, Reference};

    fn known(kind: IdentifierKind, id: u64) -> Binding {
        Binding::Known(Identifier::observed(
            kind,
            RemoteId::new(id),
            None,
            None,
            Provenance {
                call_id: CallId::new(1),
                tool: ToolKind::Query,
            },
        ))
    }

    #[test]
    fn tokenizes_operators_strings_and_groups() {
        let tokens = tokenize("tracker IN ('A','B') AND summary ~ \"x;y\" AND priority >= 2");
        assert_eq!(tokens[0], Token::word("tracker"));
        assert_eq!(tokens[1], Token::word("IN"));
        assert_eq!(tokens[2], Token::LParen);
        assert_eq!(
            tokens[3],
            Token::Str {
                value: "A".to_string(),
                quote: '\''
            }
        );
        assert!(tokens.contains(&Token::Op("~".to_string())));
        assert!(tokens.contains(&Token::Op(">=".to_string())));
        assert!(
            !tokens.contains(&Token::Semicolon),
            "semicolon inside a string literal is not a separator"
        );
    }

    #[test]
    fn finds_scope_clauses_by_operator() {
        let expr = QueryExpression::parse("tracker.id IN (42, 43) AND project.name = 'P'");
        let clauses = expr.scope_clauses();
        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[0].kind, ScopeKind::Tracker);
        assert!(clauses[0].by_id);
        assert_eq!(clauses[0].value_indices.len(), 2);
        assert_eq!(clauses[1].kind, ScopeKind::Project);
        assert!(!clauses[1].by_id);
    }

    #[test]
    fn scope_field_without_operator_is_not_a_clause() {
        let expr = QueryExpression::parse("tracker.id != 42 AND status = 'Open'");
        assert!(expr.scope_clauses().is_empty());
    }

    #[test]
    fn negated_membership_is_not_a_scope_clause() {
        let expr = QueryExpression::parse("tracker NOT IN (1)");
        assert!(expr.scope_clauses().is_empty());
        let expr = QueryExpression::parse("project.id NOT IN (1, 2) AND tracker = 42");
        let clauses = expr.scope_clauses();
        assert_eq!(clauses.len(), 1);
        assert_eq!(clauses[0].kind, ScopeKind::Tracker);
    }

    #[test]
    fn keywords_followed_by_paren_are_not_relational_terms() {
        let expr = QueryExpression::parse("tracker IN (1) AND (hasLinkTo(100) OR NOT(hasChild(7)))");
        let names: Vec<String> = expr
            .relational_terms()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["hasLinkTo".to_string(), "hasChild".to_string()]);
    }

    #[test]
    fn identifier_literals_cover_id_scopes_and_predicate_args() {
        let expr = QueryExpression::parse("tracker = 42 AND hasParent(100) AND priority = 3");
        let literals = expr.identifier_literals();
        assert_eq!(literals.len(), 2);
        assert_eq!(literals[0].kind, IdentifierKind::Tracker);
        assert_eq!(literals[0].id, RemoteId::new(42));
        assert_eq!(literals[1].kind, IdentifierKind::Item);
        assert_eq!(literals[1].id, RemoteId::new(100));
    }

    #[test]
    fn identifier_literals_cover_item_id_filters() {
        let expr = QueryExpression::parse(
            "tracker.id = 42 AND id IN (101, 999999) AND item.id != 7 AND priority IN (1, 2)",
        );
        let literals: Vec<(IdentifierKind, u64)> = expr
            .identifier_literals()
            .into_iter()
            .map(|l| (l.kind, l.id.get()))
            .collect();
        assert_eq!(
            literals,
            vec![
                (IdentifierKind::Tracker, 42),
                (IdentifierKind::Item, 101),
                (IdentifierKind::Item, 999999),
                (IdentifierKind::Item, 7),
            ]
        );
    }

    #[test]
    fn negated_id_filters_still_name_identifiers() {
        let expr = QueryExpression::parse("project = 1 AND tracker.id NOT IN (43)");
        let kinds: Vec<IdentifierKind> =
            expr.identifier_literals().into_iter().map(|l| l.kind).collect();
        assert_eq!(kinds, vec![IdentifierKind::Project, IdentifierKind::Tracker]);
    }

    #[test]
    fn scoped_wraps_existing_body() {
        let expr = QueryExpression::parse("status = 'Open' OR status = 'New'")
            .scoped(ScopeKind::Tracker, &[known(IdentifierKind::Tracker, 42)]);
        assert_eq!(
            expr.render().expect("all bindings known"),
            "tracker.id IN (42) AND (status = 'Open' OR status = 'New')"
        );
    }

    #[test]
    fn render_glues_function_calls_but_not_keywords() {
        let expr = QueryExpression::parse("tracker.id IN (1,2) AND hasLinkTo( 100 )");
        assert_eq!(
            expr.render().expect("no bindings"),
            "tracker.id IN (1, 2) AND hasLinkTo(100)"
        );
    }

    #[test]
    fn render_refuses_pending_bindings() {
        let pending = Binding::Pending {
            kind: IdentifierKind::Tracker,
            reference: Reference::name("Bugs"),
            producer: CallId::new(2),
        };
        let expr = QueryExpression::default().scoped(ScopeKind::Tracker, &[pending]);
        assert!(expr.render().is_err());
        assert_eq!(expr.preview(), "tracker.id IN (<tracker 'Bugs' via call-2>)");
    }
}
