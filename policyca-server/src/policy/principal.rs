//! Structured principal names.
//!
//! A principal is a root element followed by zero or more extensions:
//! `key([0a1b]).Program([ff00]).Args("x", 3)`. The extensions alone form a
//! [`Tail`], written `ext.Program([ff00]).Args("x", 3)`.

use std::fmt;
use std::str::FromStr;

use super::lexer::{quote, Lexer, ParseError, Token};

/// An argument to a principal element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arg {
    Str(String),
    Int(i64),
    Bytes(Vec<u8>),
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Str(s) => f.write_str(&quote(s)),
            Arg::Int(i) => write!(f, "{i}"),
            Arg::Bytes(b) => write!(f, "[{}]", hex::encode(b)),
        }
    }
}

/// `Name(arg, ...)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Element {
    pub name: String,
    pub args: Vec<Arg>,
}

impl Element {
    pub fn new(name: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

/// The extension part of a principal name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tail(pub Vec<Element>);

impl Tail {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Tail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ext")?;
        for e in &self.0 {
            write!(f, ".{e}")?;
        }
        Ok(())
    }
}

impl FromStr for Tail {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut lx = Lexer::new(s);
        match lx.next_token()? {
            Some((_, Token::Ident(kw))) if kw == "ext" => {}
            other => return Err(lx.unexpected(other, "ext")),
        }
        let tail = parse_extensions(&mut lx)?;
        lx.finish()?;
        Ok(tail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Principal {
    pub root: Element,
    pub ext: Tail,
}

impl Principal {
    /// `key([<bytes>])`
    pub fn key(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            root: Element::new("key", vec![Arg::Bytes(bytes.into())]),
            ext: Tail::default(),
        }
    }

    pub fn extend(&self, tail: &Tail) -> Self {
        let mut out = self.clone();
        out.ext.0.extend(tail.0.iter().cloned());
        out
    }

    /// If `self` is `parent` followed by some extensions, return them.
    pub fn strip_parent(&self, parent: &Principal) -> Option<Tail> {
        if self.root != parent.root {
            return None;
        }
        self.ext
            .0
            .strip_prefix(parent.ext.0.as_slice())
            .map(|rest| Tail(rest.to_vec()))
    }

    /// The final extension alone, as a tail.
    pub fn last_extension(&self) -> Option<Tail> {
        self.ext.0.last().map(|e| Tail(vec![e.clone()]))
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for e in &self.ext.0 {
            write!(f, ".{e}")?;
        }
        Ok(())
    }
}

impl FromStr for Principal {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseError::Empty);
        }
        let mut lx = Lexer::new(s);
        let name = lx.expect_ident("principal")?;
        let p = parse_principal_after(&mut lx, name)?;
        lx.finish()?;
        Ok(p)
    }
}

// ─── Parsing helpers shared with the rule parsers ───────────────────────────

/// Parse `(args).Ext(args)...` once the root name has been consumed.
pub(crate) fn parse_principal_after(lx: &mut Lexer<'_>, name: String) -> Result<Principal, ParseError> {
    let args = parse_args(lx)?;
    let ext = parse_extensions(lx)?;
    Ok(Principal {
        root: Element::new(name, args),
        ext,
    })
}

/// Parse `.Ext(args)...` until no dot follows.
pub(crate) fn parse_extensions(lx: &mut Lexer<'_>) -> Result<Tail, ParseError> {
    let mut elems = Vec::new();
    while lx.eat(&Token::Dot)? {
        let name = lx.expect_ident("extension name")?;
        elems.push(Element::new(name, parse_args(lx)?));
    }
    Ok(Tail(elems))
}

fn parse_args(lx: &mut Lexer<'_>) -> Result<Vec<Arg>, ParseError> {
    lx.expect(&Token::LParen, "(")?;
    let mut args = Vec::new();
    if lx.eat(&Token::RParen)? {
        return Ok(args);
    }
    loop {
        let arg = match lx.next_token()? {
            Some((_, Token::Str(s))) => Arg::Str(s),
            Some((_, Token::Int(i))) => Arg::Int(i),
            Some((_, Token::Bytes(b))) => Arg::Bytes(b),
            other => return Err(lx.unexpected(other, "string, integer or [hex]")),
        };
        args.push(arg);
        if lx.eat(&Token::RParen)? {
            return Ok(args);
        }
        lx.expect(&Token::Comma, ", or )")?;
    }
}
