//! Authorization policy for certificate issuance.
//!
//! # Architecture
//!
//! - `scanner` — logical-line reader for rule files
//! - `lexer` — tokens shared by principal names and rule syntaxes
//! - `principal` — structured principal names and tails
//! - `acl` — allow-list guard over `(OU, CN, Principal)` triples
//! - `datalog` — rule-based guard and the bounded resolver behind it
//! - `guard` — the `Guard` contract, rule-file loading, shared handle

pub mod acl;
pub mod datalog;
pub mod guard;
pub mod lexer;
pub mod principal;
pub mod scanner;

pub use guard::{
    CLAIM_CERTIFICATE, ConfigError, DEFAULT_POLICY, Guard, GuardKind, PolicyGuard, SharedGuard,
    write_default_policy,
};
pub use lexer::ParseError;
pub use principal::{Principal, Tail};
pub use scanner::{Line, Scanner};
