//! Allow-list guard.
//!
//! Each rule is `OU, CN, Principal`. OU and CN are `*`, a quoted string, or a
//! bare token. A principal may claim a certificate when some rule names it
//! and its OU/CN patterns match the requested subject.

use std::fmt;
use std::str::FromStr;

use super::guard::{Guard, RuleSet, CLAIM_CERTIFICATE};
use super::lexer::{quote, Lexer, ParseError, Token};
use super::principal::Principal;

/// OU or CN matcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pattern {
    Any,
    Exact(String),
}

impl Pattern {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(s) => s == value,
        }
    }

    fn parse(field: &'static str, text: &str) -> Result<Self, ParseError> {
        let text = text.trim();
        let invalid = |reason: &str| ParseError::InvalidField {
            field,
            reason: reason.to_string(),
        };
        match text {
            "" => Err(invalid("empty")),
            "*" => Ok(Pattern::Any),
            t if t.starts_with('"') => {
                let mut lx = Lexer::new(t);
                match lx.next_token()? {
                    Some((_, Token::Str(s))) => {
                        lx.finish()?;
                        Ok(Pattern::Exact(s))
                    }
                    other => Err(lx.unexpected(other, "quoted string")),
                }
            }
            t if t.contains('"') => Err(invalid("stray quote")),
            t => Ok(Pattern::Exact(t.to_string())),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => f.write_str("*"),
            Pattern::Exact(s) => f.write_str(&quote(s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AclEntry {
    pub ou: Pattern,
    pub cn: Pattern,
    pub principal: Principal,
}

impl AclEntry {
    fn is_unscoped(&self) -> bool {
        self.ou == Pattern::Any && self.cn == Pattern::Any
    }
}

impl fmt::Display for AclEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}", self.ou, self.cn, self.principal)
    }
}

impl FromStr for AclEntry {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseError::Empty);
        }
        let fields = split_top_level(s);
        let [ou, cn, principal] = fields.as_slice() else {
            return Err(ParseError::FieldCount(fields.len()));
        };
        Ok(Self {
            ou: Pattern::parse("OU", ou)?,
            cn: Pattern::parse("CN", cn)?,
            principal: principal.trim().parse()?,
        })
    }
}

/// Split on commas that are not inside quotes, parentheses or brackets.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if in_quote {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_quote = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_quote = true,
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                fields.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    fields.push(&s[start..]);
    fields
}

#[derive(Debug, Clone, Default)]
pub struct AclGuard {
    entries: RuleSet<AclEntry>,
}

impl AclGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> impl Iterator<Item = &AclEntry> {
        self.entries.iter()
    }
}

impl Guard for AclGuard {
    fn add_rule(&mut self, rule: &str) -> Result<(), ParseError> {
        self.entries.insert(rule.parse()?);
        Ok(())
    }

    fn is_authorized(&self, principal: &Principal, action: &str, args: &[String]) -> bool {
        if action != CLAIM_CERTIFICATE {
            return false;
        }
        match args {
            [] => self
                .entries
                .iter()
                .any(|e| e.is_unscoped() && e.principal == *principal),
            [ou, cn] => self.entries.iter().any(|e| {
                e.principal == *principal && e.ou.matches(ou) && e.cn.matches(cn)
            }),
            _ => false,
        }
    }

    fn render(&self) -> String {
        self.entries.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P1: &str = "key([0a0b]).Program([ff00])";
    const P2: &str = "key([0c0d])";

    fn p(s: &str) -> Principal {
        s.parse().unwrap()
    }

    fn args(ou: &str, cn: &str) -> Vec<String> {
        vec![ou.to_string(), cn.to_string()]
    }

    fn guard(rules: &[&str]) -> AclGuard {
        let mut g = AclGuard::new();
        for r in rules {
            g.add_rule(r).unwrap();
        }
        g
    }

    #[test]
    fn wildcard_entry_matches_any_subject() {
        let g = guard(&[&format!("*, *, {P1}")]);
        for (ou, cn) in [("Eng", "a.example"), ("", ""), ("Ops", "b")] {
            assert!(g.is_authorized(&p(P1), CLAIM_CERTIFICATE, &args(ou, cn)));
        }
        assert!(g.is_authorized(&p(P1), CLAIM_CERTIFICATE, &[]));
        assert!(!g.is_authorized(&p(P2), CLAIM_CERTIFICATE, &[]));
    }

    #[test]
    fn exact_entry_matches_only_its_pair() {
        let g = guard(&[&format!(r#""OUx", "CNx", {P1}"#)]);
        assert!(g.is_authorized(&p(P1), CLAIM_CERTIFICATE, &args("OUx", "CNx")));
        assert!(!g.is_authorized(&p(P1), CLAIM_CERTIFICATE, &args("OUx", "CNy")));
        assert!(!g.is_authorized(&p(P1), CLAIM_CERTIFICATE, &args("OUy", "CNx")));
        assert!(!g.is_authorized(&p(P1), CLAIM_CERTIFICATE, &[]));
        assert!(!g.is_authorized(&p(P2), CLAIM_CERTIFICATE, &args("OUx", "CNx")));
    }

    #[test]
    fn partial_wildcard() {
        let g = guard(&[&format!("Eng, *, {P1}")]);
        assert!(g.is_authorized(&p(P1), CLAIM_CERTIFICATE, &args("Eng", "svc.example")));
        assert!(!g.is_authorized(&p(P1), CLAIM_CERTIFICATE, &args("Ops", "svc.example")));
        assert!(!g.is_authorized(&p(P1), CLAIM_CERTIFICATE, &[]));
    }

    #[test]
    fn other_actions_are_refused() {
        let g = guard(&[&format!("*, *, {P1}")]);
        assert!(!g.is_authorized(&p(P1), "Execute", &[]));
        assert!(!g.is_authorized(&p(P1), CLAIM_CERTIFICATE, &["only-one".into()]));
    }

    #[test]
    fn render_is_canonical_and_deduplicated() {
        let g = guard(&[
            &format!("Eng,*,{P1}"),
            &format!(r#" "Eng" , * , {P1} "#),
            &format!(r#""Sales, EMEA", "x", {P2}"#),
        ]);
        assert_eq!(
            g.render(),
            format!("\"Eng\", *, {P1}\n\"Sales, EMEA\", \"x\", {P2}\n")
        );
    }

    #[test]
    fn commas_inside_principal_args_do_not_split() {
        let e: AclEntry = r#"*, *, key([01]).Args("a,b", 2)"#.parse().unwrap();
        assert_eq!(e.principal.to_string(), r#"key([01]).Args("a,b", 2)"#);
    }

    #[test]
    fn malformed_rules() {
        let mut g = AclGuard::new();
        assert_eq!(g.add_rule("*, *"), Err(ParseError::FieldCount(2)));
        assert_eq!(g.add_rule(""), Err(ParseError::Empty));
        assert!(g.add_rule("*, , key([01])").is_err());
        assert!(g.add_rule(r#""open, *, key([01])"#).is_err());
        assert!(g.add_rule("*, *, not a principal").is_err());
        assert!(g.render().is_empty());
    }
}
