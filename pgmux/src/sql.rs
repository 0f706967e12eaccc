//! Sql string operation.
//!
//! Sql text is opaque, the only thing looked at is where literals, identifiers and comments
//! start and end, so that placeholders and separators inside them are left alone. One
//! [`Scanner`] drives both [`rewrite_named_parameters`] and [`split_statements`].
use std::ops::Range;

use crate::{Error, Result};

/// Type that represent sql string.
pub trait Sql {
    /// Returns sql string.
    fn sql(&self) -> &str;

    /// Return `true` if current statement should be cached.
    fn persistent(&self) -> bool;
}

impl Sql for &str {
    fn sql(&self) -> &str {
        self
    }

    fn persistent(&self) -> bool {
        true
    }
}

impl Sql for String {
    fn sql(&self) -> &str {
        self
    }

    fn persistent(&self) -> bool {
        true
    }
}

/// Non persistent query string.
#[derive(Debug)]
pub struct SqlOnce<'sql>(&'sql str);

impl Sql for SqlOnce<'_> {
    fn sql(&self) -> &str {
        self.0
    }

    fn persistent(&self) -> bool {
        false
    }
}

/// Extension trait for easier query persistence config.
pub trait SqlExt<'a> {
    /// Disable statement caching.
    fn once(self) -> SqlOnce<'a>;
}

impl<'a> SqlExt<'a> for &'a str {
    fn once(self) -> SqlOnce<'a> {
        SqlOnce(self)
    }
}

impl<'a> SqlExt<'a> for SqlOnce<'a> {
    fn once(self) -> SqlOnce<'a> {
        self
    }
}

// ===== Scanner =====

/// Significant token outside literals and comments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    /// `$n` placeholder.
    Positional { range: Range<usize>, index: u32 },
    /// `@name` or `:name` placeholder, `name` excludes the prefix.
    Named { range: Range<usize>, name: &'a str },
    /// `;` at the given offset.
    Separator(usize),
}

/// Literal aware sql tokenizer.
///
/// Skips single quoted strings (`E'..'` with backslash escapes), quoted identifiers,
/// dollar quoted strings, `--` line comments and nested `/* */` block comments. Unterminated
/// literals and comments extend to the end of the input.
#[derive(Debug, Clone)]
pub struct Scanner<'a> {
    sql: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self { sql, pos: 0 }
    }

    fn bytes(&self) -> &'a [u8] {
        self.sql.as_bytes()
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes().get(self.pos + offset).copied()
    }

    fn prev(&self) -> Option<u8> {
        self.pos.checked_sub(1).map(|i| self.bytes()[i])
    }

    /// Advance past `needle`, or to the end.
    fn skip_past(&mut self, needle: &[u8]) {
        match find(&self.bytes()[self.pos..], needle) {
            Some(i) => self.pos += i + needle.len(),
            None => self.pos = self.bytes().len(),
        }
    }

    fn skip_quoted(&mut self, quote: u8, backslash: bool) {
        // at opening quote
        self.pos += 1;
        let bytes = self.bytes();
        while let Some(&b) = bytes.get(self.pos) {
            self.pos += 1;
            if backslash && b == b'\\' {
                self.pos += 1;
            } else if b == quote {
                return;
            }
        }
        self.pos = self.pos.min(bytes.len());
    }

    fn skip_block_comment(&mut self) {
        let bytes = self.bytes();
        let mut depth = 0usize;
        while self.pos < bytes.len() {
            match (bytes[self.pos], bytes.get(self.pos + 1)) {
                (b'/', Some(b'*')) => {
                    depth += 1;
                    self.pos += 2;
                }
                (b'*', Some(b'/')) => {
                    depth -= 1;
                    self.pos += 2;
                    if depth == 0 {
                        return;
                    }
                }
                _ => self.pos += 1,
            }
        }
    }

    /// Length of the `$tag$` opening a dollar quote at the current position.
    fn dollar_tag(&self) -> Option<usize> {
        let rest = &self.bytes()[self.pos + 1..];
        if rest.first().is_some_and(u8::is_ascii_digit) {
            return None;
        }
        let len = rest.iter().position(|b| !is_ident(*b))?;
        match rest[len] {
            b'$' => Some(len + 2),
            _ => None,
        }
    }

    fn ident_end(&self, start: usize) -> usize {
        let bytes = self.bytes();
        let mut end = start;
        while end < bytes.len() && is_ident(bytes[end]) {
            end += 1;
        }
        end
    }
}

impl<'a> Iterator for Scanner<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.bytes();

        while let Some(&b) = bytes.get(self.pos) {
            match b {
                b'\'' => {
                    let escape = matches!(self.prev(), Some(b'E' | b'e'))
                        && !self.pos.checked_sub(2).is_some_and(|i| is_ident(bytes[i]));
                    self.skip_quoted(b'\'', escape);
                }
                b'"' => self.skip_quoted(b'"', false),
                b'-' if self.peek(1) == Some(b'-') => self.skip_past(b"\n"),
                b'/' if self.peek(1) == Some(b'*') => self.skip_block_comment(),
                b'$' if self.prev().is_some_and(is_ident) => self.pos += 1,
                b'$' if self.peek(1).is_some_and(|b| b.is_ascii_digit()) => {
                    let start = self.pos;
                    let mut end = start + 1;
                    while end < bytes.len() && bytes[end].is_ascii_digit() {
                        end += 1;
                    }
                    self.pos = end;
                    if let Ok(index) = self.sql[start + 1..end].parse() {
                        return Some(Token::Positional { range: start..end, index });
                    }
                }
                b'$' => match self.dollar_tag() {
                    Some(len) => {
                        let tag = &bytes[self.pos..self.pos + len];
                        self.pos += len;
                        self.skip_past(tag);
                    }
                    None => self.pos += 1,
                },
                b'@' | b':' if self.is_named_start() => {
                    let start = self.pos;
                    let end = self.ident_end(start + 1);
                    self.pos = end;
                    return Some(Token::Named { range: start..end, name: &self.sql[start + 1..end] });
                }
                // `::` cast and operators such as `@>` are consumed whole
                b':' | b'@' => {
                    self.pos += 1;
                    while matches!(self.peek(0), Some(b':' | b'@' | b'>' | b'<')) {
                        self.pos += 1;
                    }
                }
                b';' => {
                    self.pos += 1;
                    return Some(Token::Separator(self.pos - 1));
                }
                _ => self.pos += 1,
            }
        }

        None
    }
}

impl Scanner<'_> {
    fn is_named_start(&self) -> bool {
        let next_ok = self.peek(1).is_some_and(|b| b.is_ascii_alphabetic() || b == b'_');
        let prev_ok = !self
            .prev()
            .is_some_and(|b| is_ident(b) || matches!(b, b':' | b'@' | b']' | b')'));
        next_ok && prev_ok
    }
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ===== Operations =====

/// Rewrite `@name` and `:name` placeholders into `$n`.
///
/// Names are numbered in order of first occurrence, a repeated name reuses its number. Returns
/// the rewritten sql and the names by position. Sql without named placeholders is returned as is,
/// mixing named and positional placeholders is an error.
pub fn rewrite_named_parameters(sql: &str) -> Result<(String, Vec<String>)> {
    let mut names = Vec::<String>::new();
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    let mut positional = false;

    for token in Scanner::new(sql) {
        match token {
            Token::Named { range, name } => {
                let nth = match names.iter().position(|e| e == name) {
                    Some(nth) => nth,
                    None => {
                        names.push(name.to_owned());
                        names.len() - 1
                    }
                };
                out.push_str(&sql[last..range.start]);
                out.push('$');
                out.push_str(itoa::Buffer::new().format(nth + 1));
                last = range.end;
            }
            Token::Positional { .. } => positional = true,
            Token::Separator(_) => {}
        }
    }

    if positional && !names.is_empty() {
        return Err(Error::config("named and positional parameters cannot be mixed"));
    }

    out.push_str(&sql[last..]);
    Ok((out, names))
}

/// Highest `$n` placeholder in `sql`, zero when there is none.
pub fn positional_count(sql: &str) -> u32 {
    Scanner::new(sql)
        .filter_map(|e| match e {
            Token::Positional { index, .. } => Some(index),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

/// Split sql into statements on `;` outside literals and comments.
///
/// Statements are trimmed and blank ones dropped. The text after the last separator is a
/// statement of its own.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let separators = Scanner::new(sql).filter_map(|e| match e {
        Token::Separator(at) => Some(at),
        _ => None,
    });

    for at in separators.chain(std::iter::once(sql.len())) {
        let piece = sql[start..at].trim();
        if !piece.is_empty() {
            out.push(piece);
        }
        start = (at + 1).min(sql.len());
    }

    out
}

/// Rewrite a stored procedure call into a `SELECT`.
///
/// Text already starting with `SELECT` is kept. A bare name becomes a call with `params`
/// positional arguments, text with an argument list is selected from as is.
pub fn procedure_call(text: &str, params: usize) -> String {
    let text = text.trim();
    let is_select = text
        .get(..6)
        .is_some_and(|e| e.eq_ignore_ascii_case("select"))
        && text[6..].starts_with(|c: char| c.is_whitespace());
    if is_select {
        return text.to_owned();
    }
    if text.contains('(') {
        return format!("SELECT * FROM {text}");
    }

    let mut out = format!("SELECT * FROM {text}(");
    for i in 1..=params {
        if i > 1 {
            out.push_str(", ");
        }
        out.push('$');
        out.push_str(itoa::Buffer::new().format(i));
    }
    out.push(')');
    out
}
