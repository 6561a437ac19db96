//! Interactive policy explorer.
//!
//! Loads a rule file, prints its rules, then reads commands from stdin:
//!
//!   add <rule>                     add a rule to the loaded guard
//!   show                           print the current rules
//!   auth <principal> [<OU> <CN>]   ask whether the principal may claim a certificate
//!   quit                           exit (end of input works too)
//!
//! Usage:
//!   cargo run --bin policyca-policy -- keys/policy

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use policyca_server::policy::{CLAIM_CERTIFICATE, Guard, PolicyGuard, Principal};

#[derive(Parser)]
#[command(name = "policyca-policy", about = "Load a policy file and query it interactively")]
struct Args {
    /// Rule file to load.
    policy: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut guard = PolicyGuard::load(&args.policy)
        .with_context(|| format!("Failed to load {}", args.policy.display()))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "=== {} policy rules ===\n{}=== end rules ===", guard.kind(), guard.render())?;

    let stdin = io::stdin();
    let mut input = stdin.lock();
    loop {
        write!(out, "$ ")?;
        out.flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            writeln!(out)?;
            return Ok(());
        }
        if !execute(&mut guard, line.trim(), &mut out)? {
            return Ok(());
        }
    }
}

/// Run one command. Returns `false` when the shell should exit.
fn execute(guard: &mut PolicyGuard, line: &str, out: &mut impl Write) -> io::Result<bool> {
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match cmd {
        "" => {}
        "quit" | "exit" => return Ok(false),
        "show" => write!(out, "{}", guard.render())?,
        "add" => match guard.add_rule(rest) {
            Ok(()) => writeln!(out, "ok")?,
            Err(e) => writeln!(out, "{e}")?,
        },
        "auth" => match parse_query(rest) {
            Ok((prin, args)) => {
                let ok = guard.is_authorized(&prin, CLAIM_CERTIFICATE, &args);
                writeln!(out, "{ok}")?;
            }
            Err(e) => writeln!(out, "{e}: {rest}")?,
        },
        other => writeln!(out, "unknown command {other:?}; try add, show, auth or quit")?,
    }
    Ok(true)
}

/// `<principal>` alone, or followed by OU and CN as the last two words.
fn parse_query(text: &str) -> Result<(Principal, Vec<String>), String> {
    let whole = match text.parse::<Principal>() {
        Ok(prin) => return Ok((prin, Vec::new())),
        Err(e) => e.to_string(),
    };
    let mut words = text.rsplitn(3, char::is_whitespace);
    if let (Some(cn), Some(ou), Some(prin)) = (words.next(), words.next(), words.next())
        && let Ok(prin) = prin.trim_end().parse::<Principal>()
    {
        return Ok((prin, vec![ou.to_string(), cn.to_string()]));
    }
    Err(whole)
}

#[cfg(test)]
mod tests {
    use super::*;
    use policyca_server::policy::GuardKind;

    fn run(guard: &mut PolicyGuard, line: &str) -> String {
        let mut out = Vec::new();
        assert!(execute(guard, line, &mut out).unwrap());
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn add_then_auth() {
        let mut g = PolicyGuard::new(GuardKind::Acl);
        assert_eq!(run(&mut g, "add \"Eng\", *, key([01])"), "ok\n");
        assert_eq!(run(&mut g, "auth key([01]) Eng svc"), "true\n");
        assert_eq!(run(&mut g, "auth key([01]) Ops svc"), "false\n");
        assert_eq!(run(&mut g, "auth key([01])"), "false\n");
        assert!(run(&mut g, "show").contains("key([01])"));
    }

    #[test]
    fn errors_are_printed_not_fatal() {
        let mut g = PolicyGuard::new(GuardKind::Acl);
        assert!(!run(&mut g, "add nonsense").is_empty());
        assert!(run(&mut g, "auth ???").ends_with(": ???\n"));
        assert!(run(&mut g, "frobnicate").contains("unknown command"));
    }

    #[test]
    fn quit_stops() {
        let mut g = PolicyGuard::new(GuardKind::Datalog);
        assert!(!execute(&mut g, "quit", &mut Vec::new()).unwrap());
    }
}
