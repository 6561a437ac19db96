//! The guard contract, the rule-file loader, and the shared handle the
//! issuance handler consults.

use std::collections::HashSet;
use std::fmt;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use super::acl::AclGuard;
use super::datalog::DatalogGuard;
use super::lexer::ParseError;
use super::principal::Principal;
use super::scanner::Scanner;

/// The only action the CA asks guards about.
pub const CLAIM_CERTIFICATE: &str = "ClaimCertificate";

/// Authorization oracle.
pub trait Guard {
    /// Add one rule. Re-adding an existing rule is a no-op.
    fn add_rule(&mut self, rule: &str) -> Result<(), ParseError>;

    /// Whether `principal` may perform `action` with `args`. Pure.
    fn is_authorized(&self, principal: &Principal, action: &str, args: &[String]) -> bool;

    /// All rules in insertion order, one canonical rule per line.
    fn render(&self) -> String;
}

// ─── Ordered rule set ────────────────────────────────────────────────────────

/// Insertion-ordered set keyed by canonical rendering.
#[derive(Debug, Clone)]
pub struct RuleSet<T> {
    items: Vec<T>,
    seen: HashSet<String>,
}

impl<T> Default for RuleSet<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            seen: HashSet::new(),
        }
    }
}

impl<T: fmt::Display> RuleSet<T> {
    /// Returns false if an equal rule was already present.
    pub fn insert(&mut self, item: T) -> bool {
        if !self.seen.insert(item.to_string()) {
            return false;
        }
        self.items.push(item);
        true
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for item in &self.items {
            out.push_str(&item.to_string());
            out.push('\n');
        }
        out
    }
}

// ─── Variants ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardKind {
    Acl,
    Datalog,
}

impl fmt::Display for GuardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GuardKind::Acl => "acl",
            GuardKind::Datalog => "datalog",
        })
    }
}

#[derive(Debug)]
pub enum PolicyGuard {
    Acl(AclGuard),
    Datalog(DatalogGuard),
}

impl PolicyGuard {
    pub fn new(kind: GuardKind) -> Self {
        match kind {
            GuardKind::Acl => PolicyGuard::Acl(AclGuard::new()),
            GuardKind::Datalog => PolicyGuard::Datalog(DatalogGuard::new()),
        }
    }

    pub fn kind(&self) -> GuardKind {
        match self {
            PolicyGuard::Acl(_) => GuardKind::Acl,
            PolicyGuard::Datalog(_) => GuardKind::Datalog,
        }
    }

    /// Load a rule file. The first logical line names the variant; every
    /// further line is a rule.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let scanner = Scanner::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_scanner(scanner, path)
    }

    /// Like [`PolicyGuard::load`] for an already-open source. `path` only
    /// labels errors.
    pub fn from_scanner<R: BufRead>(
        mut scanner: Scanner<R>,
        path: &Path,
    ) -> Result<Self, ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let kind = match scanner.next() {
            None => {
                return Err(ConfigError::MissingKind {
                    path: path.to_path_buf(),
                });
            }
            Some(line) => match line.map_err(io_err)?.text.as_str() {
                "acl" => GuardKind::Acl,
                "datalog" => GuardKind::Datalog,
                other => {
                    return Err(ConfigError::UnknownKind {
                        path: path.to_path_buf(),
                        found: other.to_string(),
                    });
                }
            },
        };

        let mut guard = PolicyGuard::new(kind);
        for line in scanner {
            let line = line.map_err(io_err)?;
            guard
                .add_rule(&line.text)
                .map_err(|source| ConfigError::Rule {
                    path: path.to_path_buf(),
                    line: line.number,
                    text: line.text.clone(),
                    source,
                })?;
        }
        Ok(guard)
    }
}

impl Guard for PolicyGuard {
    fn add_rule(&mut self, rule: &str) -> Result<(), ParseError> {
        match self {
            PolicyGuard::Acl(g) => g.add_rule(rule),
            PolicyGuard::Datalog(g) => g.add_rule(rule),
        }
    }

    fn is_authorized(&self, principal: &Principal, action: &str, args: &[String]) -> bool {
        match self {
            PolicyGuard::Acl(g) => g.is_authorized(principal, action, args),
            PolicyGuard::Datalog(g) => g.is_authorized(principal, action, args),
        }
    }

    fn render(&self) -> String {
        match self {
            PolicyGuard::Acl(g) => g.render(),
            PolicyGuard::Datalog(g) => g.render(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read policy file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("policy file {} is empty; expected \"acl\" or \"datalog\" on its first line", path.display())]
    MissingKind { path: PathBuf },
    #[error("policy file {}: unknown guard type {found:?}; expected \"acl\" or \"datalog\"", path.display())]
    UnknownKind { path: PathBuf, found: String },
    #[error("{}:{line}: invalid rule {text:?}: {source}", path.display())]
    Rule {
        path: PathBuf,
        line: usize,
        text: String,
        source: ParseError,
    },
}

// ─── Default rule file ───────────────────────────────────────────────────────

/// Written by `--init` when no rule file exists. Grants nothing.
pub const DEFAULT_POLICY: &str = r#"# Certificate-granting policy for this certificate authority.
#
# * Comment lines and blank lines are ignored.
# * A '\' at the end of a non-comment line continues it on the next line.
# * The first line names the guard type, either "acl" or "datalog".
# * Every remaining line is one rule.
#
# For an acl guard, each rule is a triplet: OU, CN, principal. A wildcard '*'
# matches any OU or CN. For example:
#   acl
#   "Engineering", "build.example.com", key([0a1b...]).Program([2c3d...])
#   *, *, key([0a1b...])
#
# For a datalog guard, each rule is a fact or a quantified implication:
#   datalog
#   forall P, OU, CN: TrustedServer(P, OU, CN) \
#       implies Authorized("ClaimCertificate", P, OU, CN)
#   forall P, O, E: Subprin(P, O, E) and TrustedHost(O) and Known(E) \
#       implies Authorized("ClaimCertificate", P)
#   TrustedHost(key([0a1b...]))
#
acl
"#;

/// Write [`DEFAULT_POLICY`] to `path` unless a file is already there.
/// Returns whether it was written.
pub fn write_default_policy(path: &Path) -> std::io::Result<bool> {
    if path.try_exists()? {
        return Ok(false);
    }
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, DEFAULT_POLICY)?;
    Ok(true)
}

// ─── Shared handle ───────────────────────────────────────────────────────────

/// The guard as seen by concurrent request handlers.
///
/// Authorization checks take a read lock. Learn mode serializes its
/// "seen before? then add" sequence on a separate mutex so each fact is added
/// at most once.
pub struct SharedGuard {
    guard: RwLock<PolicyGuard>,
    learned: Mutex<HashSet<String>>,
}

impl SharedGuard {
    pub fn new(guard: PolicyGuard) -> Self {
        Self {
            guard: RwLock::new(guard),
            learned: Mutex::new(HashSet::new()),
        }
    }

    pub fn kind(&self) -> GuardKind {
        self.guard.read().kind()
    }

    pub fn is_authorized(&self, principal: &Principal, action: &str, args: &[String]) -> bool {
        self.guard.read().is_authorized(principal, action, args)
    }

    pub fn render(&self) -> String {
        self.guard.read().render()
    }

    /// Add `fact` the first time it is seen. Returns `Ok(false)` when it was
    /// already learned. A fact the guard rejects is still remembered and is
    /// not retried.
    pub fn learn(&self, fact: &str) -> Result<bool, ParseError> {
        let mut learned = self.learned.lock();
        if !learned.insert(fact.to_string()) {
            return Ok(false);
        }
        self.guard.write().add_rule(fact)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn from_text(text: &str) -> Result<PolicyGuard, ConfigError> {
        PolicyGuard::from_scanner(Scanner::new(Cursor::new(text.as_bytes())), Path::new("test.policy"))
    }

    #[test]
    fn first_line_selects_variant() {
        assert_eq!(from_text("acl\n").unwrap().kind(), GuardKind::Acl);
        assert_eq!(
            from_text("# header\ndatalog\n").unwrap().kind(),
            GuardKind::Datalog
        );
    }

    #[test]
    fn variant_name_is_case_sensitive() {
        match from_text("ACL\n").unwrap_err() {
            ConfigError::UnknownKind { found, .. } => assert_eq!(found, "ACL"),
            other => panic!("unexpected: {other}"),
        }
        assert!(matches!(
            from_text("# only a comment\n").unwrap_err(),
            ConfigError::MissingKind { .. }
        ));
    }

    #[test]
    fn bad_rule_reports_line_and_text() {
        let err = from_text("acl\n*, *, key([01])\n\n*, *\n").unwrap_err();
        match &err {
            ConfigError::Rule { line, text, source, .. } => {
                assert_eq!(*line, 4);
                assert_eq!(text, "*, *");
                assert_eq!(*source, ParseError::FieldCount(2));
            }
            other => panic!("unexpected: {other}"),
        }
        assert!(err.to_string().starts_with("test.policy:4:"));
    }

    #[test]
    fn rule_set_keeps_order_and_drops_duplicates() {
        let mut set = RuleSet::default();
        assert!(set.insert("b"));
        assert!(set.insert("a"));
        assert!(!set.insert("b"));
        assert_eq!(set.len(), 2);
        assert_eq!(set.render(), "b\na\n");
    }

    #[test]
    fn learn_adds_each_fact_once() {
        let shared = SharedGuard::new(PolicyGuard::new(GuardKind::Datalog));
        assert_eq!(shared.learn("Known(ext.Program([01]))"), Ok(true));
        assert_eq!(shared.learn("Known(ext.Program([01]))"), Ok(false));
        assert_eq!(shared.render(), "Known(ext.Program([01]))\n");
    }

    #[test]
    fn concurrent_learners_insert_once() {
        let shared = SharedGuard::new(PolicyGuard::new(GuardKind::Datalog));
        let inserted = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| shared.learn("Known(ext.Program([01]))")))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .filter(|&added| added)
                .count()
        });
        assert_eq!(inserted, 1);
        assert_eq!(shared.render(), "Known(ext.Program([01]))\n");
    }

    #[test]
    fn default_policy_is_an_empty_acl() {
        let guard = from_text(DEFAULT_POLICY).unwrap();
        assert_eq!(guard.kind(), GuardKind::Acl);
        assert!(guard.render().is_empty());
    }

    #[test]
    fn default_policy_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("policy");
        assert!(write_default_policy(&path).unwrap());
        std::fs::write(&path, "datalog\n").unwrap();
        assert!(!write_default_policy(&path).unwrap());
        assert_eq!(PolicyGuard::load(&path).unwrap().kind(), GuardKind::Datalog);
    }

    #[test]
    fn learn_failure_is_not_retried() {
        let shared = SharedGuard::new(PolicyGuard::new(GuardKind::Acl));
        assert!(shared.learn("Known(ext.Program([01]))").is_err());
        assert_eq!(shared.learn("Known(ext.Program([01]))"), Ok(false));
        assert!(shared.render().is_empty());
    }
}
