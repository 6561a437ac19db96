//! Rule-based guard.
//!
//! Rules are ground facts or quantified implications:
//!
//! ```text
//! TrustedPlatform(key([0a1b]))
//! forall P, O, E: Subprin(P, O, E) and TrustedPlatform(O) and Known(E) implies Authorized("ClaimCertificate", P)
//! ```
//!
//! A principal may claim a certificate when
//! `Authorized("ClaimCertificate", P, args...)` is derivable. Derivation goes
//! through the [`Derivation`] trait; [`BoundedResolver`] is a depth- and
//! step-limited SLD resolver that fails closed.
//!
//! Constraints enforced:
//! - Max depth: 16
//! - Max resolution steps: 10 000

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::guard::{Guard, RuleSet};
use super::lexer::{quote, Lexer, ParseError, Token};
use super::principal::{parse_extensions, parse_principal_after, Principal, Tail};

/// `Subprin(P, O, E)` holds when `P` is `O` extended by tail `E`.
pub const SUBPRIN: &str = "Subprin";
pub const AUTHORIZED: &str = "Authorized";

const KEYWORDS: &[&str] = &["forall", "and", "implies", "ext"];

const MAX_DEPTH: usize = 16;
const MAX_STEPS: usize = 10_000;

// ─── Syntax ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    Str(String),
    Int(i64),
    Prin(Principal),
    Tail(Tail),
    Var(String),
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Str(s) => f.write_str(&quote(s)),
            Term::Int(i) => write!(f, "{i}"),
            Term::Prin(p) => write!(f, "{p}"),
            Term::Tail(t) => write!(f, "{t}"),
            Term::Var(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Atom {
    pub pred: String,
    pub args: Vec<Term>,
}

impl Atom {
    pub fn new(pred: impl Into<String>, args: Vec<Term>) -> Self {
        Self {
            pred: pred.into(),
            args,
        }
    }

    fn vars(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(|t| match t {
            Term::Var(v) => Some(v.as_str()),
            _ => None,
        })
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.pred)?;
        for (i, t) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{t}")?;
        }
        f.write_str(")")
    }
}

/// A fact (empty body) or an implication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Clause {
    pub vars: Vec<String>,
    pub body: Vec<Atom>,
    pub head: Atom,
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.vars.is_empty() {
            write!(f, "forall {}: ", self.vars.join(", "))?;
        }
        for (i, a) in self.body.iter().enumerate() {
            if i > 0 {
                f.write_str(" and ")?;
            }
            write!(f, "{a}")?;
        }
        if !self.body.is_empty() {
            f.write_str(" implies ")?;
        }
        write!(f, "{}", self.head)
    }
}

impl FromStr for Clause {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseError::Empty);
        }
        let mut lx = Lexer::new(s);

        let mut vars: Vec<String> = Vec::new();
        while lx.peek()? == Some(&Token::Ident("forall".into())) {
            lx.next_token()?;
            loop {
                let v = lx.expect_ident("variable")?;
                if KEYWORDS.contains(&v.as_str()) {
                    return Err(ParseError::Keyword(v));
                }
                if vars.contains(&v) {
                    return Err(ParseError::DuplicateVariable(v));
                }
                vars.push(v);
                if !lx.eat(&Token::Comma)? {
                    break;
                }
            }
            lx.expect(&Token::Colon, ":")?;
        }

        let mut atoms = vec![parse_atom(&mut lx)?];
        let head = loop {
            match lx.next_token()? {
                Some((_, Token::Ident(kw))) if kw == "and" => atoms.push(parse_atom(&mut lx)?),
                Some((_, Token::Ident(kw))) if kw == "implies" => {
                    let head = parse_atom(&mut lx)?;
                    lx.finish()?;
                    break head;
                }
                None if atoms.len() == 1 => {
                    break atoms.remove(0);
                }
                other => return Err(lx.unexpected(other, "and or implies")),
            }
        };

        let clause = Clause {
            vars,
            body: atoms,
            head,
        };
        clause.check()?;
        Ok(clause)
    }
}

impl Clause {
    fn check(&self) -> Result<(), ParseError> {
        if self.head.pred == SUBPRIN {
            return Err(ParseError::ReservedPredicate(SUBPRIN.into()));
        }
        for v in self.body.iter().chain([&self.head]).flat_map(Atom::vars) {
            if !self.vars.iter().any(|q| q == v) {
                return Err(ParseError::UnboundVariable(v.to_string()));
            }
        }
        for v in self.head.vars() {
            if !self.body.iter().flat_map(Atom::vars).any(|b| b == v) {
                return Err(ParseError::UnsafeVariable(v.to_string()));
            }
        }
        Ok(())
    }
}

fn parse_atom(lx: &mut Lexer<'_>) -> Result<Atom, ParseError> {
    let pred = lx.expect_ident("predicate")?;
    if KEYWORDS.contains(&pred.as_str()) {
        return Err(ParseError::Keyword(pred));
    }
    lx.expect(&Token::LParen, "(")?;
    let mut args = Vec::new();
    if lx.eat(&Token::RParen)? {
        return Ok(Atom { pred, args });
    }
    loop {
        args.push(parse_term(lx)?);
        if lx.eat(&Token::RParen)? {
            return Ok(Atom { pred, args });
        }
        lx.expect(&Token::Comma, ", or )")?;
    }
}

fn parse_term(lx: &mut Lexer<'_>) -> Result<Term, ParseError> {
    match lx.next_token()? {
        Some((_, Token::Str(s))) => Ok(Term::Str(s)),
        Some((_, Token::Int(i))) => Ok(Term::Int(i)),
        Some((_, Token::Ident(name))) if name == "ext" => Ok(Term::Tail(parse_extensions(lx)?)),
        Some((_, Token::Ident(name))) => {
            if lx.peek()? == Some(&Token::LParen) {
                Ok(Term::Prin(parse_principal_after(lx, name)?))
            } else if KEYWORDS.contains(&name.as_str()) {
                Err(ParseError::Keyword(name))
            } else {
                Ok(Term::Var(name))
            }
        }
        other => Err(lx.unexpected(other, "term")),
    }
}

// ─── Derivation ──────────────────────────────────────────────────────────────

/// Decides whether `goal` follows from `clauses`.
pub trait Derivation: Send + Sync {
    fn derives(&self, clauses: &[Clause], goal: &Atom) -> bool;
}

/// SLD resolution with a depth limit and a step budget. Running out of either
/// answers "not derivable".
#[derive(Debug, Clone, Copy)]
pub struct BoundedResolver {
    pub max_depth: usize,
    pub max_steps: usize,
}

impl Default for BoundedResolver {
    fn default() -> Self {
        Self {
            max_depth: MAX_DEPTH,
            max_steps: MAX_STEPS,
        }
    }
}

impl Derivation for BoundedResolver {
    fn derives(&self, clauses: &[Clause], goal: &Atom) -> bool {
        let mut search = Search {
            clauses,
            max_depth: self.max_depth,
            steps_left: self.max_steps,
            fresh: 0,
        };
        match search.prove(goal) {
            Ok(found) => found,
            Err(Exhausted) => {
                tracing::warn!("Derivation of {goal} exceeded {} steps", self.max_steps);
                false
            }
        }
    }
}

struct Exhausted;

#[derive(Clone, Default)]
struct Subst(HashMap<String, Term>);

impl Subst {
    /// Follow variable bindings to a ground term or an unbound variable.
    fn walk(&self, t: &Term) -> Term {
        let mut cur = t;
        while let Term::Var(v) = cur {
            match self.0.get(v) {
                Some(next) => cur = next,
                None => break,
            }
        }
        cur.clone()
    }

    fn apply(&self, atom: &Atom) -> Atom {
        Atom {
            pred: atom.pred.clone(),
            args: atom.args.iter().map(|t| self.walk(t)).collect(),
        }
    }

    fn unify(&mut self, a: &Term, b: &Term) -> bool {
        match (self.walk(a), self.walk(b)) {
            (Term::Var(x), Term::Var(y)) if x == y => true,
            (Term::Var(x), t) | (t, Term::Var(x)) => {
                self.0.insert(x, t);
                true
            }
            (x, y) => x == y,
        }
    }

    fn unify_atoms(&mut self, a: &Atom, b: &Atom) -> bool {
        a.pred == b.pred
            && a.args.len() == b.args.len()
            && a.args.iter().zip(&b.args).all(|(x, y)| self.unify(x, y))
    }
}

struct Search<'a> {
    clauses: &'a [Clause],
    max_depth: usize,
    steps_left: usize,
    fresh: usize,
}

/// A conjunction still to prove under one substitution. The next goal is last.
struct Branch {
    goals: Vec<(Atom, usize)>,
    subst: Subst,
}

impl Search<'_> {
    /// Depth-first over an explicit stack of branches; alternatives are pushed
    /// in reverse so clauses are tried in file order.
    fn prove(&mut self, goal: &Atom) -> Result<bool, Exhausted> {
        let mut branches = vec![Branch {
            goals: vec![(goal.clone(), 0)],
            subst: Subst::default(),
        }];
        while let Some(Branch { mut goals, subst }) = branches.pop() {
            let Some((goal, depth)) = goals.pop() else {
                return Ok(true);
            };
            if self.steps_left == 0 {
                return Err(Exhausted);
            }
            self.steps_left -= 1;

            let goal = subst.apply(&goal);
            let mut alternatives = Vec::new();
            if goal.pred == SUBPRIN {
                for s in subprin(&goal, &subst) {
                    alternatives.push(Branch {
                        goals: goals.clone(),
                        subst: s,
                    });
                }
            } else if depth < self.max_depth {
                let clauses = self.clauses;
                for clause in clauses {
                    if clause.head.pred != goal.pred || clause.head.args.len() != goal.args.len() {
                        continue;
                    }
                    let clause = self.rename(clause);
                    let mut s = subst.clone();
                    if !s.unify_atoms(&clause.head, &goal) {
                        continue;
                    }
                    let mut next = goals.clone();
                    next.extend(clause.body.into_iter().rev().map(|a| (a, depth + 1)));
                    alternatives.push(Branch { goals: next, subst: s });
                }
            }
            branches.extend(alternatives.into_iter().rev());
        }
        Ok(false)
    }

    /// Give the clause's variables names no other clause instance uses.
    fn rename(&mut self, clause: &Clause) -> Clause {
        self.fresh += 1;
        let n = self.fresh;
        let rename_atom = |a: &Atom| Atom {
            pred: a.pred.clone(),
            args: a
                .args
                .iter()
                .map(|t| match t {
                    Term::Var(v) => Term::Var(format!("{v}#{n}")),
                    t => t.clone(),
                })
                .collect(),
        };
        Clause {
            vars: Vec::new(),
            body: clause.body.iter().map(&rename_atom).collect(),
            head: rename_atom(&clause.head),
        }
    }
}

/// Solutions of the built-in `Subprin(P, O, E)` under `subst`.
fn subprin(goal: &Atom, subst: &Subst) -> Vec<Subst> {
    let [p, o, e] = goal.args.as_slice() else {
        return Vec::new();
    };
    let mut candidates: Vec<(Term, Term, Term)> = Vec::new();
    match (p, o, e) {
        (Term::Prin(child), _, _) => {
            for split in 0..=child.ext.0.len() {
                let parent = Principal {
                    root: child.root.clone(),
                    ext: Tail(child.ext.0[..split].to_vec()),
                };
                let tail = Tail(child.ext.0[split..].to_vec());
                candidates.push((p.clone(), Term::Prin(parent), Term::Tail(tail)));
            }
        }
        (Term::Var(_), Term::Prin(parent), Term::Tail(tail)) => {
            candidates.push((Term::Prin(parent.extend(tail)), o.clone(), e.clone()));
        }
        _ => {}
    }

    candidates
        .into_iter()
        .filter_map(|(cp, co, ce)| {
            let mut s = subst.clone();
            (s.unify(p, &cp) && s.unify(o, &co) && s.unify(e, &ce)).then_some(s)
        })
        .collect()
}

// ─── Guard ───────────────────────────────────────────────────────────────────

pub struct DatalogGuard {
    rules: RuleSet<Clause>,
    engine: Box<dyn Derivation>,
}

impl DatalogGuard {
    pub fn new() -> Self {
        Self::with_engine(BoundedResolver::default())
    }

    pub fn with_engine(engine: impl Derivation + 'static) -> Self {
        Self {
            rules: RuleSet::default(),
            engine: Box::new(engine),
        }
    }

    pub fn rules(&self) -> &[Clause] {
        self.rules.as_slice()
    }
}

impl Default for DatalogGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DatalogGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatalogGuard")
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}

impl Guard for DatalogGuard {
    fn add_rule(&mut self, rule: &str) -> Result<(), ParseError> {
        self.rules.insert(rule.parse()?);
        Ok(())
    }

    fn is_authorized(&self, principal: &Principal, action: &str, args: &[String]) -> bool {
        let mut terms = vec![Term::Str(action.to_string()), Term::Prin(principal.clone())];
        terms.extend(args.iter().map(|a| Term::Str(a.clone())));
        let goal = Atom::new(AUTHORIZED, terms);
        self.engine.derives(self.rules.as_slice(), &goal)
    }

    fn render(&self) -> String {
        self.rules.render()
    }
}
