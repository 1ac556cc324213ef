//! Minimal tokenizer for command text
//!
//! This is not a SQL grammar. It only knows enough to tell identifiers apart from
//! everything else: string literals and comments are consumed whole and never yield
//! identifier tokens, so a bracketed name inside a literal value cannot leak out.

/// A lexical token of command text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Bare word: keyword, unquoted identifier, number or `@variable`
    Word(String),

    /// Identifier quoted with `[..]`, `` `..` `` or `".."`, escapes resolved
    Quoted(String),

    /// Single-quoted string literal (contents discarded)
    Literal,

    Dot,
    Comma,
    LParen,
    RParen,
    Semicolon,

    /// Any other punctuation or operator character
    Symbol(char),
}

impl Token {
    /// True if this is a bare word equal to `keyword`, ignoring ASCII case
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    /// True if this is one of the bare words in `keywords`, ignoring ASCII case
    pub fn is_any_keyword(&self, keywords: &[&str]) -> bool {
        match self {
            Token::Word(w) => keywords.iter().any(|k| w.eq_ignore_ascii_case(k)),
            _ => false,
        }
    }

    /// The identifier text, if this token can name an object
    pub fn identifier(&self) -> Option<&str> {
        match self {
            Token::Word(w) => Some(w.as_str()),
            Token::Quoted(q) => Some(q.as_str()),
            _ => None,
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '@' | '#' | '$')
}

/// Split command text into tokens. Never fails; unterminated literals, quoted
/// identifiers and block comments simply run to the end of the input.
pub fn tokenize(text: &str) -> Vec<Token> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // -- line comment
        if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        // /* block comment */
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i = (i + 2).min(chars.len());
            continue;
        }

        match c {
            '\'' => {
                i = skip_delimited(&chars, i + 1, '\'', None);
                tokens.push(Token::Literal);
            }
            '[' => {
                let mut ident = String::new();
                i = skip_delimited(&chars, i + 1, ']', Some(&mut ident));
                tokens.push(Token::Quoted(ident));
            }
            '`' => {
                let mut ident = String::new();
                i = skip_delimited(&chars, i + 1, '`', Some(&mut ident));
                tokens.push(Token::Quoted(ident));
            }
            '"' => {
                let mut ident = String::new();
                i = skip_delimited(&chars, i + 1, '"', Some(&mut ident));
                tokens.push(Token::Quoted(ident));
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
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
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }
            c if is_word_char(c) => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            other => {
                tokens.push(Token::Symbol(other));
                i += 1;
            }
        }
    }

    tokens
}

/// Consume a delimited run starting just after the opening delimiter. A doubled
/// closing delimiter is an escaped literal character. Returns the index just past
/// the closing delimiter (or the end of input).
fn skip_delimited(chars: &[char], mut i: usize, close: char, mut out: Option<&mut String>) -> usize {
    while i < chars.len() {
        if chars[i] == close {
            if chars.get(i + 1) == Some(&close) {
                if let Some(buf) = out.as_deref_mut() {
                    buf.push(close);
                }
                i += 2;
                continue;
            }
            return i + 1;
        }
        if let Some(buf) = out.as_deref_mut() {
            buf.push(chars[i]);
        }
        i += 1;
    }
    i
}

/// Split a token stream into statements on `;`, dropping empty statements
pub fn statements(tokens: &[Token]) -> Vec<&[Token]> {
    tokens
        .split(|t| *t == Token::Semicolon)
        .filter(|s| !s.is_empty())
        .collect()
}
