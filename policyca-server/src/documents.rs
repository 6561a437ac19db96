//! Policy statement documents linked from every issued certificate.
//!
//! The CPS (certification practices statement) describes how requests are
//! approved, including the full guard rendering in automatic mode. The user
//! notice records who requested this particular certificate. Both are
//! published content-addressed, so their URLs pin their exact text.

use crate::policy::{GuardKind, Principal};

const CPS_HEADER: &str = "\
Policy-Gated Certificate Authority
** Certification Practices Statement **

This document specifies the practices and policies under which certificate
signing requests are approved by this certificate authority.

Document Integrity
------------------

This document should be hosted as a file named <hhh>.txt where <hhh> is the
SHA-256 hash of this document. If the hash does not match the file name, the
contents of this document should not be trusted.

Policies
--------

* Issued certificates carry a certificate-policies extension linking to this
  document (id-qt-cps) and to a user notice (id-qt-unotice) that details the
  circumstances under which the certificate was issued.
";

const CPS_MANUAL: &str = "
* Certificate signing requests are vetted and approved manually by the holder
  of the certificate authority signing key.
";

const CPS_ACL: &str = "
* Certificate signing requests are approved automatically for principals as
  described in the following access-control list:
";

const CPS_DATALOG: &str = "
* Certificate signing requests are approved automatically for principals as
  described by the following datalog rules:
";

const NOTICE_HEADER: &str = "\
Policy-Gated Certificate Authority
** User Notice **

This document details the circumstances under which a certificate was issued
by this certificate authority.

Document Integrity
------------------

This document should be hosted as a file named <hhh>.txt where <hhh> is the
SHA-256 hash of this document. If the hash does not match the file name, the
contents of this document should not be trusted.

Issuance Details
----------------

";

/// How the request was approved.
#[derive(Debug, Clone)]
pub enum Approval {
    Manual,
    Automatic { kind: GuardKind, rules: String },
}

/// Render the CPS for a request approved as described by `approval`.
pub fn cps(approval: &Approval) -> String {
    match approval {
        Approval::Manual => format!("{CPS_HEADER}{CPS_MANUAL}"),
        Approval::Automatic { kind, rules } => {
            let mode = match kind {
                GuardKind::Acl => CPS_ACL,
                GuardKind::Datalog => CPS_DATALOG,
            };
            format!("{CPS_HEADER}{mode}\n{rules}")
        }
    }
}

/// Render the user notice for a request from `peer`.
pub fn user_notice(peer: Option<&Principal>) -> String {
    match peer {
        Some(p) => format!(
            "{NOTICE_HEADER}* The certificate was requested by the following principal:\n\n   {p}\n"
        ),
        None => format!("{NOTICE_HEADER}* The certificate was requested anonymously.\n"),
    }
}
