//! Policy-gated certificate authority.
//!
//! Each connection carries one signing request. The peer is named by its TLS
//! client certificate, the request is approved by an operator or by the
//! configured guard, and the issued certificate links to content-addressed
//! policy documents describing why it was granted.

pub mod approval;
pub mod config;
pub mod custody;
pub mod documents;
pub mod issuer;
pub mod policy;
pub mod publish;
pub mod server;
pub mod transport;
