//! Read-only safety gate for model-generated SQL
//!
//! SQL produced by the translator arrives as a [`CandidateQuery`] and is never
//! executed as-is. [`SafetyGate::approve`] is the only way to obtain an
//! [`ApprovedQuery`], which is the only type the executor accepts.
//!
//! Rules, checked in order (first violation wins):
//! 1. the statement is not empty
//! 2. the statement tokenizes
//! 3. nothing but whitespace follows a `;` (no stacked statements)
//! 4. no blocked keyword appears as a whole word, anywhere
//! 5. the first token is the keyword `SELECT`
//! 6. if the statement parses, it parses to exactly one query

use std::fmt;

use sqlparser::ast::Statement;
use sqlparser::dialect::DuckDbDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use thiserror::Error;

/// Keywords that can never appear in an approved query.
pub const BLOCKED_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "INSERT", "UPDATE", "ALTER", "TRUNCATE", "ATTACH", "CREATE",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockedQueryError {
    #[error("query is empty")]
    Empty,

    #[error("query could not be tokenized: {0}")]
    Malformed(String),

    #[error("multiple statements are not allowed (content after ';')")]
    StackedStatements,

    #[error("blocked keyword: {0}")]
    BlockedKeyword(String),

    #[error("query must start with SELECT, found `{0}`")]
    NotSelect(String),

    #[error("statement is not a read-only query")]
    NotReadOnly,
}

impl BlockedQueryError {
    /// The offending keyword, when a blocked keyword caused the rejection
    pub fn keyword(&self) -> Option<&str> {
        match self {
            BlockedQueryError::BlockedKeyword(kw) => Some(kw),
            _ => None,
        }
    }
}

/// Untrusted SQL text, as returned by the translator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery(String);

impl CandidateQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CandidateQuery {
    fn from(sql: String) -> Self {
        Self(sql)
    }
}

impl From<&str> for CandidateQuery {
    fn from(sql: &str) -> Self {
        Self(sql.to_string())
    }
}

impl fmt::Display for CandidateQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SQL that passed the gate. Can only be built by [`SafetyGate::approve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedQuery(String);

impl ApprovedQuery {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApprovedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct SafetyGate {
    blocked: Vec<String>,
}

impl SafetyGate {
    pub fn new() -> Self {
        Self {
            blocked: BLOCKED_KEYWORDS.iter().map(|kw| kw.to_string()).collect(),
        }
    }

    /// Block additional keywords on top of [`BLOCKED_KEYWORDS`]
    pub fn with_blocked_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for kw in keywords {
            let kw = kw.as_ref().trim().to_ascii_uppercase();
            if !kw.is_empty() && !self.blocked.contains(&kw) {
                self.blocked.push(kw);
            }
        }
        self
    }

    pub fn blocked_keywords(&self) -> &[String] {
        &self.blocked
    }

    /// Upgrade a candidate to an approved query, or say why not.
    ///
    /// The SQL text is passed through unchanged.
    pub fn approve(&self, candidate: CandidateQuery) -> Result<ApprovedQuery, BlockedQueryError> {
        match self.check(candidate.as_str()) {
            Ok(()) => {
                tracing::debug!(sql = %candidate, "query approved");
                Ok(ApprovedQuery(candidate.0))
            }
            Err(e) => {
                tracing::warn!(sql = %candidate, reason = %e, "query blocked");
                Err(e)
            }
        }
    }

    /// Run every rule against `sql` without consuming it
    pub fn check(&self, sql: &str) -> Result<(), BlockedQueryError> {
        if sql.trim().is_empty() {
            return Err(BlockedQueryError::Empty);
        }

        let dialect = DuckDbDialect {};
        let tokens = Tokenizer::new(&dialect, sql)
            .tokenize()
            .map_err(|e| BlockedQueryError::Malformed(e.to_string()))?;

        check_single_statement(&tokens)?;
        self.check_blocked_keywords(sql)?;
        check_starts_with_select(&tokens)?;

        // sqlparser does not know every DuckDB extension; text it cannot
        // parse goes to the engine, which reports its own syntax errors.
        match Parser::parse_sql(&dialect, sql) {
            Ok(statements) => match statements.as_slice() {
                [Statement::Query(_)] => Ok(()),
                _ => Err(BlockedQueryError::NotReadOnly),
            },
            Err(e) => {
                tracing::debug!(error = %e, "sqlparser could not parse query, deferring to engine");
                Ok(())
            }
        }
    }

    /// Whole-word, case-insensitive scan over the raw text. String literals,
    /// quoted identifiers and comments are scanned too.
    fn check_blocked_keywords(&self, sql: &str) -> Result<(), BlockedQueryError> {
        for word in sql.split(|c: char| !is_word_char(c)) {
            if word.is_empty() {
                continue;
            }
            if let Some(kw) = self.blocked.iter().find(|kw| kw.eq_ignore_ascii_case(word)) {
                return Err(BlockedQueryError::BlockedKeyword(kw.clone()));
            }
        }
        Ok(())
    }
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::new()
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_blank(token: &Token) -> bool {
    matches!(
        token,
        Token::Whitespace(Whitespace::Space | Whitespace::Newline | Whitespace::Tab)
    )
}

fn check_single_statement(tokens: &[Token]) -> Result<(), BlockedQueryError> {
    let Some(pos) = tokens.iter().position(|t| *t == Token::SemiColon) else {
        return Ok(());
    };
    let trailing = tokens[pos + 1..]
        .iter()
        .any(|t| !is_blank(t) && *t != Token::EOF);
    if trailing {
        return Err(BlockedQueryError::StackedStatements);
    }
    Ok(())
}

fn check_starts_with_select(tokens: &[Token]) -> Result<(), BlockedQueryError> {
    match tokens.iter().find(|t| !is_blank(t)) {
        Some(Token::Word(w))
            if w.keyword == Keyword::SELECT
                && w.quote_style.is_none()
                && w.value.eq_ignore_ascii_case("SELECT") =>
        {
            Ok(())
        }
        Some(other) => {
            let found: String = other.to_string().chars().take(32).collect();
            Err(BlockedQueryError::NotSelect(found))
        }
        None => Err(BlockedQueryError::Empty),
    }
}
