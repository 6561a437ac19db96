//! Tokenizer shared by principal names, allow-list rules and datalog rules.

use std::fmt;

/// A malformed principal name or policy rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty input")]
    Empty,
    #[error("unexpected character {ch:?} at offset {pos}")]
    UnexpectedChar { pos: usize, ch: char },
    #[error("unterminated string starting at offset {pos}")]
    UnterminatedString { pos: usize },
    #[error("invalid hex byte string at offset {pos}")]
    BadHex { pos: usize },
    #[error("invalid integer at offset {pos}")]
    BadInt { pos: usize },
    #[error("expected {expected} at offset {pos}, found {found}")]
    Unexpected {
        pos: usize,
        expected: &'static str,
        found: String,
    },
    #[error("trailing input at offset {pos}")]
    Trailing { pos: usize },
    #[error("variable {0} is not quantified")]
    UnboundVariable(String),
    #[error("variable {0} in conclusion does not occur in any condition")]
    UnsafeVariable(String),
    #[error("variable {0} quantified twice")]
    DuplicateVariable(String),
    #[error("{0} is a built-in predicate and cannot be concluded")]
    ReservedPredicate(String),
    #[error("{0} is a keyword")]
    Keyword(String),
    #[error("expected 3 comma-separated fields, found {0}")]
    FieldCount(usize),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Bytes(Vec<u8>),
    LParen,
    RParen,
    Comma,
    Dot,
    Colon,
    Star,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::Str(s) => write!(f, "{}", quote(s)),
            Token::Int(i) => write!(f, "{i}"),
            Token::Bytes(b) => write!(f, "[{}]", hex::encode(b)),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
            Token::Dot => f.write_str("."),
            Token::Colon => f.write_str(":"),
            Token::Star => f.write_str("*"),
        }
    }
}

/// Render `s` as a double-quoted string literal.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    peeked: Option<(usize, Token)>,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            peeked: None,
        }
    }

    /// Byte offset of the next unread token.
    pub fn offset(&mut self) -> usize {
        match &self.peeked {
            Some((pos, _)) => *pos,
            None => {
                self.skip_whitespace();
                self.pos
            }
        }
    }

    pub fn peek(&mut self) -> Result<Option<&Token>, ParseError> {
        if self.peeked.is_none() {
            self.peeked = self.scan()?;
        }
        Ok(self.peeked.as_ref().map(|(_, t)| t))
    }

    pub fn next_token(&mut self) -> Result<Option<(usize, Token)>, ParseError> {
        match self.peeked.take() {
            Some(t) => Ok(Some(t)),
            None => self.scan(),
        }
    }

    /// Consume the next token if it equals `want`.
    pub fn eat(&mut self, want: &Token) -> Result<bool, ParseError> {
        if self.peek()? == Some(want) {
            self.peeked = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn expect(&mut self, want: &Token, expected: &'static str) -> Result<(), ParseError> {
        match self.next_token()? {
            Some((_, t)) if &t == want => Ok(()),
            other => Err(self.unexpected(other, expected)),
        }
    }

    pub fn expect_ident(&mut self, expected: &'static str) -> Result<String, ParseError> {
        match self.next_token()? {
            Some((_, Token::Ident(name))) => Ok(name),
            other => Err(self.unexpected(other, expected)),
        }
    }

    /// Error unless all input has been consumed.
    pub fn finish(&mut self) -> Result<(), ParseError> {
        match self.next_token()? {
            None => Ok(()),
            Some((pos, _)) => Err(ParseError::Trailing { pos }),
        }
    }

    pub fn unexpected(&self, got: Option<(usize, Token)>, expected: &'static str) -> ParseError {
        match got {
            Some((pos, t)) => ParseError::Unexpected {
                pos,
                expected,
                found: t.to_string(),
            },
            None => ParseError::Unexpected {
                pos: self.src.len(),
                expected,
                found: "end of input".into(),
            },
        }
    }

    fn skip_whitespace(&mut self) {
        let rest = &self.src[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn scan(&mut self) -> Result<Option<(usize, Token)>, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        let rest = &self.src[start..];
        let Some(c) = rest.chars().next() else {
            return Ok(None);
        };

        let single = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            '.' => Some(Token::Dot),
            ':' => Some(Token::Colon),
            '*' => Some(Token::Star),
            _ => None,
        };
        if let Some(t) = single {
            self.pos += 1;
            return Ok(Some((start, t)));
        }

        let token = match c {
            '"' => self.scan_string(start)?,
            '[' => {
                let end = rest
                    .find(']')
                    .ok_or(ParseError::BadHex { pos: start })?;
                let bytes =
                    hex::decode(&rest[1..end]).map_err(|_| ParseError::BadHex { pos: start })?;
                self.pos += end + 1;
                Token::Bytes(bytes)
            }
            c if c.is_ascii_digit() || (c == '-' && rest[1..].starts_with(|d: char| d.is_ascii_digit())) => {
                let len = 1 + rest[1..]
                    .find(|d: char| !d.is_ascii_digit())
                    .unwrap_or(rest.len() - 1);
                let value = rest[..len]
                    .parse()
                    .map_err(|_| ParseError::BadInt { pos: start })?;
                self.pos += len;
                Token::Int(value)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let len = rest
                    .find(|d: char| !(d.is_ascii_alphanumeric() || d == '_'))
                    .unwrap_or(rest.len());
                self.pos += len;
                Token::Ident(rest[..len].to_string())
            }
            ch => return Err(ParseError::UnexpectedChar { pos: start, ch }),
        };
        Ok(Some((start, token)))
    }

    fn scan_string(&mut self, start: usize) -> Result<Token, ParseError> {
        let mut out = String::new();
        let mut chars = self.src[start + 1..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos = start + 1 + i + 1;
                    return Ok(Token::Str(out));
                }
                '\\' => match chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err(ParseError::UnterminatedString { pos: start })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        let mut lx = Lexer::new(src);
        let mut out = vec![];
        while let Some((_, t)) = lx.next_token().unwrap() {
            out.push(t);
        }
        out
    }

    #[test]
    fn scans_all_token_kinds() {
        assert_eq!(
            tokens(r#"key([0aff]).Ext("a\"b", -12) : *"#),
            vec![
                Token::Ident("key".into()),
                Token::LParen,
                Token::Bytes(vec![0x0a, 0xff]),
                Token::RParen,
                Token::Dot,
                Token::Ident("Ext".into()),
                Token::LParen,
                Token::Str("a\"b".into()),
                Token::Comma,
                Token::Int(-12),
                Token::RParen,
                Token::Colon,
                Token::Star,
            ]
        );
    }

    #[test]
    fn rejects_bad_hex_and_strings() {
        assert_eq!(
            Lexer::new("[0g]").next_token(),
            Err(ParseError::BadHex { pos: 0 })
        );
        assert_eq!(
            Lexer::new("  \"open").next_token(),
            Err(ParseError::UnterminatedString { pos: 2 })
        );
        assert!(matches!(
            Lexer::new("#").next_token(),
            Err(ParseError::UnexpectedChar { ch: '#', .. })
        ));
    }

    #[test]
    fn quote_escapes() {
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }
}
