//! Certificate issuance: one request, one response per connection.
//!
//! The handler reads a request, validates the subject, draws a serial number,
//! decides approval (operator prompt or guard), publishes the CPS and user
//! notice, and has the custody sign a certificate that links to both.
//! Every path writes exactly one response.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use policyca_sdk::wire::{self, Csr, Request, Response, ResponseStatus, X509Details};
use policyca_sdk::CertificationPolicy;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::approval::ApprovalGate;
use crate::custody::{CertificateTemplate, KeyCustody, SubjectKey};
use crate::documents::{self, Approval};
use crate::policy::{CLAIM_CERTIFICATE, Principal, SharedGuard};
use crate::publish::DocumentPublisher;

/// Longest validity a request may ask for.
pub const MAX_YEARS: i64 = 100;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("denied: {0}")]
    Denied(String),
    #[error("{detail}: {cause}")]
    Internal { detail: &'static str, cause: String },
}

impl IssueError {
    fn internal(detail: &'static str, cause: impl std::fmt::Display) -> Self {
        IssueError::Internal {
            detail,
            cause: cause.to_string(),
        }
    }

    pub fn status(&self) -> ResponseStatus {
        match self {
            IssueError::BadRequest(_) => ResponseStatus::BadRequest,
            IssueError::Denied(_) => ResponseStatus::RequestDenied,
            IssueError::Internal { .. } => ResponseStatus::Error,
        }
    }

    /// The response sent to the client. Internal causes stay in the log.
    pub fn to_response(&self) -> Response {
        let detail = match self {
            IssueError::BadRequest(d) | IssueError::Denied(d) => d.clone(),
            IssueError::Internal { detail, .. } => (*detail).to_string(),
        };
        Response::error(self.status(), detail)
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

fn is_legal(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b",:.()_/- ".contains(&b)
}

fn check_field(field: &str, value: &str) -> Result<(), IssueError> {
    if value.is_empty() {
        return Err(IssueError::BadRequest(format!("empty name.{field}")));
    }
    if !value.bytes().all(is_legal) {
        return Err(IssueError::BadRequest(format!(
            "invalid characters in name.{field}"
        )));
    }
    if value.trim() != value {
        return Err(IssueError::BadRequest(format!(
            "invalid whitespace in name.{field}"
        )));
    }
    Ok(())
}

fn subject_fields(name: &X509Details) -> [(&'static str, Option<&str>); 6] {
    [
        ("Country", name.country.as_deref()),
        ("State/Province", name.state.as_deref()),
        ("City/Locality", name.city.as_deref()),
        ("Organization", name.organization.as_deref()),
        ("OrganizationalUnit", name.organizational_unit.as_deref()),
        ("CommonName", name.common_name.as_deref()),
    ]
}

/// Check every supplied subject field and the validity period. Returns the
/// validity in years.
pub fn sanitize(csr: &Csr) -> Result<u32, IssueError> {
    for (field, value) in subject_fields(&csr.name) {
        if let Some(v) = value {
            check_field(field, v)?;
        }
    }
    if !(1..=MAX_YEARS).contains(&csr.years) {
        return Err(IssueError::BadRequest("invalid validity period".into()));
    }
    Ok(csr.years as u32)
}

/// A positive, non-zero 63-bit serial number.
pub fn new_serial(rng: &mut impl RngCore) -> Result<i64, rand::Error> {
    loop {
        let mut bytes = [0u8; 8];
        rng.try_fill_bytes(&mut bytes)?;
        let serial = i64::from_be_bytes(bytes) & i64::MAX;
        if serial != 0 {
            return Ok(serial);
        }
    }
}

/// Human-readable description of a request, shown to the operator.
pub fn summarize(
    csr: &Csr,
    serial: i64,
    subject_key: &SubjectKey,
    peer: Option<&Principal>,
) -> String {
    let mut out = String::from("A new certificate signing request has been received:\n");
    for (field, value) in subject_fields(&csr.name) {
        let _ = writeln!(out, "  {field}: {}", value.unwrap_or("(none)"));
    }
    let kind = if csr.is_ca {
        "Certificate Authority (can sign certificates)"
    } else {
        "Server (can't sign certificates)"
    };
    let _ = writeln!(out, "  Validity Period: {} years", csr.years);
    let _ = writeln!(out, "  Type: {kind}");
    let _ = writeln!(out, "  Serial: {serial}");
    let _ = writeln!(out, "  Public Key Principal: {}", subject_key.to_principal());
    match peer {
        Some(p) => {
            let _ = writeln!(out, "  Requesting Principal: {p}");
        }
        None => out.push_str("  Requesting Principal: (anonymous)\n"),
    }
    out
}

// ─── Statistics ──────────────────────────────────────────────────────────────

/// Per-status outcome counters.
#[derive(Debug, Default)]
pub struct Stats {
    ok: AtomicU64,
    bad_request: AtomicU64,
    denied: AtomicU64,
    error: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ok: u64,
    pub bad_request: u64,
    pub denied: u64,
    pub error: u64,
}

impl Stats {
    pub fn record(&self, status: ResponseStatus) {
        let counter = match status {
            ResponseStatus::Ok => &self.ok,
            ResponseStatus::BadRequest => &self.bad_request,
            ResponseStatus::RequestDenied => &self.denied,
            ResponseStatus::Error => &self.error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ok: self.ok.load(Ordering::Relaxed),
            bad_request: self.bad_request.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ok={} bad_request={} denied={} error={}",
            self.ok, self.bad_request, self.denied, self.error
        )
    }
}

// ─── Handler ─────────────────────────────────────────────────────────────────

/// How requests are approved.
pub enum Mode {
    /// An operator answers a prompt for every request.
    Manual(ApprovalGate),
    /// The guard decides. With `learn` set, the last extension of every
    /// authenticated peer is recorded as a `Known(...)` fact first.
    Automatic { guard: Arc<SharedGuard>, learn: bool },
}

pub struct Issuer {
    mode: Mode,
    publisher: DocumentPublisher,
    custody: Arc<dyn KeyCustody>,
    stats: Stats,
}

impl Issuer {
    pub fn new(mode: Mode, publisher: DocumentPublisher, custody: Arc<dyn KeyCustody>) -> Self {
        Self {
            mode,
            publisher,
            custody,
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Serve one request on `stream` from `peer` (`None` when anonymous),
    /// then shut the stream down.
    pub async fn handle<S>(&self, stream: &mut S, peer: Option<&Principal>) -> ResponseStatus
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let response = match self.process(stream, peer).await {
            Ok(leaf) => Response::ok(leaf, self.custody.cert_chain()),
            Err(e) => {
                match &e {
                    IssueError::Internal { .. } => tracing::error!("Error handling request: {e}"),
                    _ => tracing::warn!("Rejecting request: {e}"),
                }
                e.to_response()
            }
        };
        let status = response.status;

        if let Err(e) = wire::write_message(stream, &response).await {
            tracing::warn!("Failed to send {status} response: {e}");
        }
        if let Err(e) = stream.shutdown().await {
            tracing::debug!("Shutdown after response failed: {e}");
        }
        self.stats.record(status);
        status
    }

    async fn process<S>(&self, stream: &mut S, peer: Option<&Principal>) -> Result<Vec<u8>, IssueError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request: Request = wire::read_message(stream).await.map_err(|e| {
            tracing::debug!("Unreadable request: {e}");
            IssueError::BadRequest("failed to read request".into())
        })?;
        let csr = request.csr;

        let years = sanitize(&csr)?;
        let subject_key = SubjectKey::from_bytes(&csr.public_key)
            .ok_or_else(|| IssueError::BadRequest("can't unmarshal key".into()))?;
        let serial = new_serial(&mut OsRng)
            .map_err(|e| IssueError::internal("could not generate random serial number", e))?;

        let summary = summarize(&csr, serial, &subject_key, peer);
        tracing::debug!("{summary}");

        let approval = self.decide(&csr.name, peer, summary).await?;

        let cps = documents::cps(&approval);
        let notice = documents::user_notice(peer);
        let cps_url = self
            .publisher
            .publish(cps.as_bytes())
            .await
            .map_err(|e| IssueError::internal("failed to publish policy documents", e))?;
        let notice_url = self
            .publisher
            .publish(notice.as_bytes())
            .await
            .map_err(|e| IssueError::internal("failed to publish policy documents", e))?;

        let policy_extension = CertificationPolicy::new(cps_url.as_str(), notice_url.as_str())
            .encode()
            .map_err(|e| {
                IssueError::internal("failed to generate certificate policy extension", e)
            })?;

        let template = CertificateTemplate {
            subject: csr.name.clone(),
            serial,
            is_ca: csr.is_ca,
            years,
            policy_extension,
        };
        let leaf = self
            .custody
            .sign(&template, &subject_key)
            .map_err(|e| IssueError::internal("failed to sign certificate", e))?;

        tracing::info!(
            serial,
            "Issued certificate for ou={:?} cn={:?} to {}",
            csr.name.organizational_unit.as_deref().unwrap_or(""),
            csr.name.common_name.as_deref().unwrap_or(""),
            peer.map_or_else(|| "anonymous".to_string(), |p| p.to_string()),
        );
        Ok(leaf)
    }

    async fn decide(
        &self,
        name: &X509Details,
        peer: Option<&Principal>,
        summary: String,
    ) -> Result<Approval, IssueError> {
        let (guard, learn) = match &self.mode {
            Mode::Manual(gate) => {
                let approved = gate
                    .decide(summary)
                    .await
                    .map_err(|e| IssueError::internal("approval failed", e))?;
                if !approved {
                    return Err(IssueError::Denied("request is denied".into()));
                }
                tracing::info!("Request approved by operator");
                return Ok(Approval::Manual);
            }
            Mode::Automatic { guard, learn } => (guard, *learn),
        };

        let Some(peer) = peer else {
            return Err(IssueError::Denied("anonymous request is denied".into()));
        };

        if learn && let Some(tail) = peer.last_extension() {
            let fact = format!("Known({tail})");
            match guard.learn(&fact) {
                Ok(true) => tracing::info!("Learned: {fact}"),
                Ok(false) => {}
                Err(e) => tracing::warn!("Could not add learned rule {fact}: {e}"),
            }
        }

        let scoped = match (&name.organizational_unit, &name.common_name) {
            (Some(ou), Some(cn)) => {
                guard.is_authorized(peer, CLAIM_CERTIFICATE, &[ou.clone(), cn.clone()])
            }
            _ => false,
        };
        if !scoped && !guard.is_authorized(peer, CLAIM_CERTIFICATE, &[]) {
            tracing::warn!(
                "Policy (as follows) does not allow this request from {peer}\n{}",
                guard.render()
            );
            return Err(IssueError::Denied("request is denied".into()));
        }

        Ok(Approval::Automatic {
            kind: guard.kind(),
            rules: guard.render(),
        })
    }
}
