//! Table reference extraction
//!
//! Turns command text into the set of known tables it touches. Reads report every
//! table adjacent to `FROM`/`JOIN`/`APPLY`; writes report only their target table.
//! Anything not recognised resolves to the whole candidate set, since invalidating
//! too much is safe and invalidating too little serves stale rows.

use crate::sql::lexer::{statements, tokenize, Token};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

const WRITE_VERBS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE", "TRUNCATE"];

const PREAMBLE_VERBS: &[&str] = &["SET", "DECLARE"];

/// Words that can follow a table reference and therefore are never its alias
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "ON", "GROUP",
    "ORDER", "WITH", "UNION", "EXCEPT", "INTERSECT", "HAVING", "OPTION", "FOR", "PIVOT",
    "UNPIVOT", "LIMIT", "OFFSET", "FETCH", "WINDOW", "TABLESAMPLE", "SET", "SELECT",
    "INSERT", "UPDATE", "DELETE", "MERGE", "WHEN", "THEN", "USING", "OUTPUT", "RETURNING",
    "APPLY", "NATURAL", "LATERAL", "STRAIGHT_JOIN", "USE", "FORCE", "IGNORE", "VALUES",
    "INTO", "AND", "OR", "NOT", "FROM", "AS",
];

/// Classification of a command's leading statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// SELECT, or a CTE whose main statement is a SELECT
    Read,

    /// INSERT, UPDATE, DELETE, MERGE or TRUNCATE
    Write,

    /// Anything else (EXEC, DDL, empty text ...)
    Unknown,
}

/// A table named in a FROM/JOIN position, with the alias it was given
#[derive(Debug, Clone, PartialEq, Eq)]
struct TableRef {
    name: String,
    alias: Option<String>,
}

/// Extracts referenced table names from command text
#[derive(Debug, Clone, Copy, Default)]
pub struct TableNameExtractor {
    case_sensitive: bool,
}

impl TableNameExtractor {
    /// Create an extractor; table names match ignoring case unless `case_sensitive`
    pub fn new(case_sensitive: bool) -> Self {
        Self { case_sensitive }
    }

    /// Return the candidate tables referenced by `command_text`, spelled as in
    /// `candidates`. Unrecognised commands yield every candidate.
    pub fn extract(&self, command_text: &str, candidates: &BTreeSet<String>) -> BTreeSet<String> {
        let tokens = tokenize(command_text);
        let stmts = statements(&tokens);

        let lookup: HashMap<String, &String> = candidates
            .iter()
            .map(|name| (self.normalize(name), name))
            .collect();

        let Some((kind, verb_pos, stmt)) = classify_statements(&stmts) else {
            warn!("No statement recognised in command text; invalidating all candidates");
            return candidates.clone();
        };

        match kind {
            StatementKind::Write => {
                let refs = collect_table_refs(stmt);
                let target = write_target(stmt, verb_pos)
                    .and_then(|target| self.resolve_target(&target, &refs, &lookup));

                match target {
                    Some(name) => BTreeSet::from([name]),
                    None => {
                        warn!("Write target not among known tables; invalidating all candidates");
                        candidates.clone()
                    }
                }
            }
            StatementKind::Read => {
                let found: BTreeSet<String> = collect_table_refs(&tokens)
                    .into_iter()
                    .filter_map(|r| lookup.get(&self.normalize(&r.name)).map(|n| (*n).clone()))
                    .collect();
                debug!("Extracted {} table reference(s) from read command", found.len());
                found
            }
            StatementKind::Unknown => {
                warn!("Unrecognised command verb; invalidating all candidates");
                candidates.clone()
            }
        }
    }

    fn normalize(&self, name: &str) -> String {
        if self.case_sensitive {
            name.to_string()
        } else {
            name.to_lowercase()
        }
    }

    /// Match a write target against the candidates, directly or through an alias
    fn resolve_target(
        &self,
        target: &str,
        refs: &[TableRef],
        lookup: &HashMap<String, &String>,
    ) -> Option<String> {
        if let Some(name) = lookup.get(&self.normalize(target)) {
            return Some((*name).clone());
        }

        let key = self.normalize(target);
        refs.iter()
            .filter(|r| r.alias.as_deref().map(|a| self.normalize(a)) == Some(key.clone()))
            .find_map(|r| lookup.get(&self.normalize(&r.name)).map(|n| (*n).clone()))
    }
}

/// Extract referenced table names with the default (case-insensitive) extractor
pub fn extract_table_names(command_text: &str, candidates: &BTreeSet<String>) -> BTreeSet<String> {
    TableNameExtractor::default().extract(command_text, candidates)
}

/// Classify the leading statement of a command, skipping `SET`/`DECLARE` preambles
pub fn classify(command_text: &str) -> StatementKind {
    let tokens = tokenize(command_text);
    let stmts = statements(&tokens);
    classify_statements(&stmts)
        .map(|(kind, _, _)| kind)
        .unwrap_or(StatementKind::Unknown)
}

/// True if the command's leading statement is INSERT, UPDATE, DELETE, MERGE or TRUNCATE
pub fn is_write_command(command_text: &str) -> bool {
    classify(command_text) == StatementKind::Write
}

/// Returns the kind, the index of the main verb and the statement it lives in
fn classify_statements<'a>(stmts: &[&'a [Token]]) -> Option<(StatementKind, usize, &'a [Token])> {
    let stmt = stmts
        .iter()
        .copied()
        .find(|s| !s[0].is_any_keyword(PREAMBLE_VERBS))?;

    let first = stmt.iter().position(|t| *t != Token::LParen)?;
    let head = &stmt[first];

    if head.is_any_keyword(WRITE_VERBS) {
        return Some((StatementKind::Write, first, stmt));
    }
    if head.is_keyword("SELECT") {
        return Some((StatementKind::Read, first, stmt));
    }
    if head.is_keyword("WITH") {
        // The main statement is the first verb at depth zero after the CTE list
        let mut depth = 0usize;
        for (i, token) in stmt.iter().enumerate().skip(first + 1) {
            match token {
                Token::LParen => depth += 1,
                Token::RParen => depth = depth.saturating_sub(1),
                t if depth == 0 && t.is_any_keyword(WRITE_VERBS) => {
                    return Some((StatementKind::Write, i, stmt));
                }
                t if depth == 0 && t.is_keyword("SELECT") => {
                    return Some((StatementKind::Read, i, stmt));
                }
                _ => {}
            }
        }
        return Some((StatementKind::Read, first, stmt));
    }

    Some((StatementKind::Unknown, first, stmt))
}

/// Name written immediately after the write verb at `verb_pos`
fn write_target(stmt: &[Token], verb_pos: usize) -> Option<String> {
    let mut pos = verb_pos + 1;
    pos = skip_top_clause(stmt, pos);

    if let Some(token) = stmt.get(pos) {
        if token.is_any_keyword(&["INTO", "FROM", "TABLE"]) {
            pos += 1;
        }
    }

    read_object_name(stmt, pos).map(|(name, _)| name)
}

/// Skip `TOP (n)` / `TOP n` / `TOP (n) PERCENT`
fn skip_top_clause(tokens: &[Token], mut pos: usize) -> usize {
    if !tokens.get(pos).is_some_and(|t| t.is_keyword("TOP")) {
        return pos;
    }
    pos += 1;
    if tokens.get(pos) == Some(&Token::LParen) {
        pos = skip_paren_group(tokens, pos);
    } else if tokens.get(pos).is_some() {
        pos += 1;
    }
    if tokens.get(pos).is_some_and(|t| t.is_keyword("PERCENT")) {
        pos += 1;
    }
    pos
}

/// Given `pos` at an opening parenthesis, return the index past its match
fn skip_paren_group(tokens: &[Token], mut pos: usize) -> usize {
    let mut depth = 0usize;
    while pos < tokens.len() {
        match tokens[pos] {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return pos + 1;
                }
            }
            _ => {}
        }
        pos += 1;
    }
    pos
}

/// Read a possibly multi-part object name (`a`, `s.[t]`, `db..t`) and return its last
/// part with the index just past it. Variables (`@t`) are not object names.
fn read_object_name(tokens: &[Token], mut pos: usize) -> Option<(String, usize)> {
    let mut last = name_part(tokens.get(pos)?)?;
    pos += 1;

    loop {
        let mut look = pos;
        while tokens.get(look) == Some(&Token::Dot) {
            look += 1;
        }
        if look == pos {
            break;
        }
        match tokens.get(look).and_then(name_part) {
            Some(part) => {
                last = part;
                pos = look + 1;
            }
            None => break,
        }
    }

    Some((last, pos))
}

fn name_part(token: &Token) -> Option<String> {
    match token {
        Token::Quoted(q) => Some(q.clone()),
        Token::Word(w) if !w.starts_with('@') && !w.starts_with(|c: char| c.is_ascii_digit()) => {
            Some(w.clone())
        }
        _ => None,
    }
}

/// Collect every table named after FROM, JOIN or APPLY, including comma lists,
/// aliases and table hints. Subqueries are skipped here and picked up when the scan
/// reaches their own FROM.
fn collect_table_refs(tokens: &[Token]) -> Vec<TableRef> {
    let mut refs = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        if !tokens[i].is_any_keyword(&["FROM", "JOIN", "APPLY"]) {
            i += 1;
            continue;
        }

        let mut pos = i + 1;
        loop {
            let Some((name, next)) = read_object_name(tokens, pos) else {
                break;
            };
            pos = next;

            // Table-valued function call, not a table
            if tokens.get(pos) == Some(&Token::LParen) {
                break;
            }

            let mut alias = None;
            if tokens.get(pos).is_some_and(|t| t.is_keyword("AS")) {
                alias = tokens.get(pos + 1).and_then(name_part);
                pos += 2;
            } else if let Some(token) = tokens.get(pos) {
                if !token.is_any_keyword(CLAUSE_KEYWORDS) {
                    if let Some(a) = name_part(token) {
                        alias = Some(a);
                        pos += 1;
                    }
                }
            }

            // WITH (NOLOCK) style table hints
            if tokens.get(pos).is_some_and(|t| t.is_keyword("WITH"))
                && tokens.get(pos + 1) == Some(&Token::LParen)
            {
                pos = skip_paren_group(tokens, pos + 1);
            }

            refs.push(TableRef { name, alias });

            if tokens.get(pos) == Some(&Token::Comma) {
                pos += 1;
                continue;
            }
            break;
        }

        i = pos.max(i + 1);
    }

    refs
}
