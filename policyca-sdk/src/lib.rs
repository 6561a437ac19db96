//! Client SDK for the policy-gated certificate authority.
//!
//! - [`wire`] — request/response messages and length-prefixed framing
//! - [`certpolicy`] — the dual-qualifier certificate-policy extension codec
//! - [`client`] — submitting a CSR and collecting the issued chain

pub mod certpolicy;
pub mod client;
pub mod wire;

pub use certpolicy::{CertificationPolicy, CodecError};
pub use client::{submit, submit_to, SubmitError};
pub use wire::{Csr, Request, Response, ResponseStatus, WireError, X509Details};
