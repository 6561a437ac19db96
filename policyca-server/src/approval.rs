//! Manual approval of certificate requests.
//!
//! Only one request is put in front of the operator at a time. The gate holds
//! an async mutex for the whole prompt; the prompt itself blocks on console
//! input and runs on the blocking pool.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval prompt failed: {0}")]
    Io(#[from] io::Error),
    #[error("approval task failed: {0}")]
    Task(String),
}

/// Asks a human (or a stand-in) whether to approve a request.
pub trait Approver: Send + Sync {
    fn confirm(&self, summary: &str) -> Result<bool, ApprovalError>;
}

/// Prompts on stdout and reads the answer from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleApprover;

impl Approver for ConsoleApprover {
    fn confirm(&self, summary: &str) -> Result<bool, ApprovalError> {
        let stdin = io::stdin();
        let stdout = io::stdout();
        Ok(prompt(&mut stdin.lock(), &mut stdout.lock(), summary)?)
    }
}

/// Print `summary` and ask until the answer is `yes` or `no`. An empty
/// answer or end of input counts as `no`.
pub fn prompt<R: BufRead, W: Write>(input: &mut R, out: &mut W, summary: &str) -> io::Result<bool> {
    writeln!(out, "{summary}")?;
    loop {
        write!(out, "Approve this request? [no]: ")?;
        out.flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            writeln!(out)?;
            return Ok(false);
        }
        match line.trim() {
            "yes" => return Ok(true),
            "no" | "" => return Ok(false),
            other => writeln!(out, "I don't understand {other:?}. Please type yes or no.")?,
        }
    }
}

pub struct ApprovalGate {
    lock: tokio::sync::Mutex<()>,
    approver: Arc<dyn Approver>,
    wait_limit: Option<Duration>,
}

impl ApprovalGate {
    /// `wait_limit` bounds how long a request waits for the operator to
    /// finish with earlier requests; `None` waits indefinitely.
    pub fn new(approver: Arc<dyn Approver>, wait_limit: Option<Duration>) -> Self {
        Self {
            lock: tokio::sync::Mutex::new(()),
            approver,
            wait_limit,
        }
    }

    /// Returns `Ok(false)` on refusal or when the wait limit expires.
    pub async fn decide(&self, summary: String) -> Result<bool, ApprovalError> {
        let _held = match self.wait_limit {
            Some(limit) => match tokio::time::timeout(limit, self.lock.lock()).await {
                Ok(guard) => guard,
                Err(_) => {
                    tracing::warn!("Gave up waiting {limit:?} for the approval prompt");
                    return Ok(false);
                }
            },
            None => self.lock.lock().await,
        };

        let approver = Arc::clone(&self.approver);
        tokio::task::spawn_blocking(move || approver.confirm(&summary))
            .await
            .map_err(|e| ApprovalError::Task(e.to_string()))?
    }
}
