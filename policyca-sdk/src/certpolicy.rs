//! Certificate-policy extension carrying links to the CA's policy documents.
//!
//! Browsers and openssl disagree on which encodings they accept for the two
//! qualifiers. The CPS qualifier is an IA5String sibling of its OID. The
//! UserNotice qualifier has to be a VisibleString inside a one-element
//! SEQUENCE. yasna has no VisibleString writer, so the notice is written as a
//! PrintableString and its tag byte is patched afterwards. Decoding undoes
//! the patch before handing the bytes back to yasna.
//!
//! ```text
//! CertificatePolicies ::= SEQUENCE {
//!     PolicyInformation ::= SEQUENCE {
//!         subject-identity-validated,
//!         SEQUENCE {
//!             SEQUENCE { id-qt-cps,     IA5String }
//!             SEQUENCE { id-qt-unotice, SEQUENCE { VisibleString } }
//!         }
//!     }
//! }
//! ```

use yasna::models::ObjectIdentifier;
use yasna::tags::{TAG_IA5STRING, TAG_PRINTABLESTRING};
use yasna::{ASN1Error, ASN1ErrorKind};

/// joint-iso-itu-t(2) ds(5) certificateExtension(29) certificatePolicies(32)
pub const ID_CERTIFICATE_POLICIES: &[u64] = &[2, 5, 29, 32];

/// id-pkix id-qt(2) id-qt-cps(1)
pub const ID_QT_CPS: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 2, 1];

/// id-pkix id-qt(2) id-qt-unotice(2)
pub const ID_QT_UNOTICE: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 2, 2];

/// ca-browser-forum(140) certificate-policies(1) baseline-requirements(2)
/// subject-identity-validated(2)
pub const ID_SUBJECT_IDENTITY_VALIDATED: &[u64] = &[2, 23, 140, 1, 2, 2];

const PRINTABLE_STRING_TAG: u8 = 19;
const VISIBLE_STRING_TAG: u8 = 26;
const SEQUENCE_TAG: u8 = 0x30;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("CPS URL is not an IA5 string: {0:?}")]
    NotIa5(String),
    #[error("user notice URL contains characters outside the PrintableString alphabet: {0:?}")]
    NotPrintable(String),
    #[error("unexpected ASN.1 layout at offset {offset}: {bytes}")]
    UnexpectedLayout { offset: usize, bytes: String },
    #[error("failed to decode {step}: {reason}")]
    Decode { step: &'static str, reason: String },
    #[error("trailing data after {step}")]
    TrailingData { step: &'static str },
    #[error("unexpected object identifier in {step}: {found}")]
    UnexpectedOid { step: &'static str, found: String },
}

/// The pair of policy document URLs embedded in an issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificationPolicy {
    pub cps_url: String,
    pub unotice_url: String,
}

impl CertificationPolicy {
    pub fn new(cps_url: impl Into<String>, unotice_url: impl Into<String>) -> Self {
        Self {
            cps_url: cps_url.into(),
            unotice_url: unotice_url.into(),
        }
    }

    /// OID of the X.509 extension the encoded value belongs in.
    pub fn extension_oid() -> &'static [u64] {
        ID_CERTIFICATE_POLICIES
    }

    /// DER-encode the extension value.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if !self.cps_url.is_ascii() {
            return Err(CodecError::NotIa5(self.cps_url.clone()));
        }
        if !is_printable_string(&self.unotice_url) {
            return Err(CodecError::NotPrintable(self.unotice_url.clone()));
        }

        let mut der = yasna::construct_der(|w| {
            w.write_sequence(|w| {
                w.next().write_sequence(|w| {
                    w.next()
                        .write_oid(&ObjectIdentifier::from_slice(ID_SUBJECT_IDENTITY_VALIDATED));
                    w.next().write_sequence(|w| {
                        w.next().write_sequence(|w| {
                            w.next().write_oid(&ObjectIdentifier::from_slice(ID_QT_CPS));
                            w.next().write_ia5_string(&self.cps_url);
                        });
                        w.next().write_sequence(|w| {
                            w.next().write_oid(&ObjectIdentifier::from_slice(ID_QT_UNOTICE));
                            w.next().write_sequence(|w| {
                                w.next().write_printable_string(&self.unotice_url);
                            });
                        });
                    });
                });
            });
        });
        patch_notice_tag(&mut der, &self.unotice_url)?;
        Ok(der)
    }

    /// Decode an extension value produced by [`CertificationPolicy::encode`].
    pub fn decode(der: &[u8]) -> Result<Self, CodecError> {
        let info = step("certificate policies", der, |r| {
            r.read_sequence(|r| r.next().read_der())
        })?;

        let (policy_id, qualifiers) = step("policy information", &info, |r| {
            r.read_sequence(|r| {
                let oid = r.next().read_oid()?;
                let qualifiers = r.next().read_der()?;
                Ok((oid, qualifiers))
            })
        })?;
        expect_oid("policy information", &policy_id, ID_SUBJECT_IDENTITY_VALIDATED)?;

        let (cps, notice) = step("policy qualifiers", &qualifiers, |r| {
            r.read_sequence(|r| Ok((r.next().read_der()?, r.next().read_der()?)))
        })?;

        let (cps_id, cps_url) = step("CPS qualifier", &cps, |r| {
            r.read_sequence(|r| {
                let oid = r.next().read_oid()?;
                let bytes = r
                    .next()
                    .read_tagged_implicit(TAG_IA5STRING, |r| r.read_bytes())?;
                Ok((oid, bytes))
            })
        })?;
        expect_oid("CPS qualifier", &cps_id, ID_QT_CPS)?;

        let (notice_id, notice_seq) = step("user notice qualifier", &notice, |r| {
            r.read_sequence(|r| Ok((r.next().read_oid()?, r.next().read_der()?)))
        })?;
        expect_oid("user notice qualifier", &notice_id, ID_QT_UNOTICE)?;

        let notice_seq = restore_printable_tag(notice_seq)?;
        let notice_url = step("user notice", &notice_seq, |r| {
            r.read_sequence(|r| {
                r.next()
                    .read_tagged_implicit(TAG_PRINTABLESTRING, |r| r.read_bytes())
            })
        })?;

        Ok(Self {
            cps_url: ascii_string("CPS qualifier", cps_url)?,
            unotice_url: ascii_string("user notice", notice_url)?,
        })
    }
}

/// Whether `s` fits the PrintableString alphabet (X.680 §41.4), which the
/// user notice URL must.
pub fn is_printable_string(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b" '()+,-./:=?".contains(&b))
}

/// DER tag and length octets for a primitive value of `len` bytes.
fn tlv_header(tag: u8, len: usize) -> Vec<u8> {
    let mut header = vec![tag];
    if len < 0x80 {
        header.push(len as u8);
    } else {
        let octets: Vec<u8> = len
            .to_be_bytes()
            .into_iter()
            .skip_while(|b| *b == 0)
            .collect();
        header.push(0x80 | octets.len() as u8);
        header.extend(octets);
    }
    header
}

/// The notice string is the last value in the encoding, so its TLV ends the
/// buffer. Check the tag and length before touching anything.
fn patch_notice_tag(der: &mut [u8], notice: &str) -> Result<(), CodecError> {
    let header = tlv_header(PRINTABLE_STRING_TAG, notice.len());
    let layout_error = |offset: usize, der: &[u8]| CodecError::UnexpectedLayout {
        offset,
        bytes: hex::encode(der),
    };

    let start = der
        .len()
        .checked_sub(notice.len() + header.len())
        .ok_or_else(|| layout_error(0, der))?;
    let value_at = start + header.len();
    if der[start..value_at] != header[..] || &der[value_at..] != notice.as_bytes() {
        return Err(layout_error(start, der));
    }
    der[start] = VISIBLE_STRING_TAG;
    Ok(())
}

/// Rewrite the VisibleString tag inside `SEQUENCE { VisibleString }` back to
/// PrintableString so yasna can read it.
fn restore_printable_tag(mut seq: Vec<u8>) -> Result<Vec<u8>, CodecError> {
    let malformed = |reason: &str| CodecError::Decode {
        step: "user notice",
        reason: reason.to_string(),
    };
    if seq.first() != Some(&SEQUENCE_TAG) {
        return Err(malformed("expected a SEQUENCE"));
    }
    let len_byte = *seq.get(1).ok_or_else(|| malformed("truncated length"))?;
    let inner = if len_byte < 0x80 {
        2
    } else {
        2 + (len_byte & 0x7f) as usize
    };
    match seq.get(inner).copied() {
        Some(VISIBLE_STRING_TAG) => {
            seq[inner] = PRINTABLE_STRING_TAG;
            Ok(seq)
        }
        Some(PRINTABLE_STRING_TAG) => Ok(seq),
        Some(tag) => Err(malformed(&format!("unexpected string tag {tag}"))),
        None => Err(malformed("empty sequence")),
    }
}

/// Run one nested decode step, keeping "trailing data" distinct from other
/// decode failures.
fn step<T, F>(name: &'static str, der: &[u8], f: F) -> Result<T, CodecError>
where
    F: for<'a, 'b> FnOnce(yasna::BERReader<'a, 'b>) -> Result<T, ASN1Error>,
{
    yasna::parse_der(der, f).map_err(|e| match e.kind() {
        ASN1ErrorKind::Extra => CodecError::TrailingData { step: name },
        _ => CodecError::Decode {
            step: name,
            reason: e.to_string(),
        },
    })
}

fn expect_oid(
    step: &'static str,
    found: &ObjectIdentifier,
    expected: &[u64],
) -> Result<(), CodecError> {
    if found.components().as_slice() == expected {
        Ok(())
    } else {
        Err(CodecError::UnexpectedOid {
            step,
            found: found
                .components()
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join("."),
        })
    }
}

fn ascii_string(step: &'static str, bytes: Vec<u8>) -> Result<String, CodecError> {
    if !bytes.is_ascii() {
        return Err(CodecError::Decode {
            step,
            reason: "non-ASCII string".into(),
        });
    }
    String::from_utf8(bytes).map_err(|e| CodecError::Decode {
        step,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPS: &str = "https://ca.example:8443/security/0f1e2d.txt";
    const NOTICE: &str = "https://ca.example:8443/security/a1b2c3.txt";

    #[test]
    fn round_trip_recovers_both_urls() {
        let policy = CertificationPolicy::new(CPS, NOTICE);
        let der = policy.encode().unwrap();
        assert_eq!(CertificationPolicy::decode(&der).unwrap(), policy);
    }

    #[test]
    fn round_trip_various_urls() {
        let urls = [
            ("http://a/", "http://b/"),
            ("https://host/path?x=1&y=_z", "https://host/p(1),q=2"),
            ("ftp://x", "x"),
        ];
        for (cps, notice) in urls {
            let policy = CertificationPolicy::new(cps, notice);
            let der = policy.encode().unwrap();
            assert_eq!(CertificationPolicy::decode(&der).unwrap(), policy, "{cps} {notice}");
        }
    }

    #[test]
    fn notice_is_tagged_visible_string() {
        let der = CertificationPolicy::new(CPS, NOTICE).encode().unwrap();
        let at = der.len() - NOTICE.len() - 2;
        assert_eq!(der[at], VISIBLE_STRING_TAG);
        assert_eq!(der[at + 1] as usize, NOTICE.len());
        assert_eq!(&der[at + 2..], NOTICE.as_bytes());
        // The CPS string keeps its IA5 tag.
        let cps_at = der
            .windows(CPS.len())
            .position(|w| w == CPS.as_bytes())
            .unwrap();
        assert_eq!(der[cps_at - 2], 22);
    }

    #[test]
    fn long_notice_uses_long_form_length() {
        let notice = format!("https://ca.example/{}", "a".repeat(200));
        let policy = CertificationPolicy::new(CPS, notice.clone());
        let der = policy.encode().unwrap();
        let at = der.len() - notice.len() - 3;
        assert_eq!(&der[at..at + 3], &[VISIBLE_STRING_TAG, 0x81, notice.len() as u8]);
        assert_eq!(CertificationPolicy::decode(&der).unwrap(), policy);
    }

    #[test]
    fn unprintable_notice_is_rejected() {
        let err = CertificationPolicy::new(CPS, "https://x/a_b").encode().unwrap_err();
        assert!(matches!(err, CodecError::NotPrintable(_)));
    }

    #[test]
    fn non_ascii_cps_is_rejected() {
        let err = CertificationPolicy::new("https://x/é", NOTICE).encode().unwrap_err();
        assert!(matches!(err, CodecError::NotIa5(_)));
    }

    #[test]
    fn patch_refuses_unexpected_layout() {
        let mut der = yasna::construct_der(|w| w.write_ia5_string(NOTICE));
        let err = patch_notice_tag(&mut der, NOTICE).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedLayout { .. }));

        let mut short = vec![PRINTABLE_STRING_TAG];
        assert!(patch_notice_tag(&mut short, NOTICE).is_err());
    }

    #[test]
    fn trailing_bytes_are_reported_separately() {
        let mut der = CertificationPolicy::new(CPS, NOTICE).encode().unwrap();
        der.push(0);
        let err = CertificationPolicy::decode(&der).unwrap_err();
        assert_eq!(err, CodecError::TrailingData { step: "certificate policies" });
    }

    #[test]
    fn truncated_input_is_a_decode_error() {
        let der = CertificationPolicy::new(CPS, NOTICE).encode().unwrap();
        let err = CertificationPolicy::decode(&der[..der.len() - 4]).unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }

    #[test]
    fn wrong_policy_oid_is_rejected() {
        let der = yasna::construct_der(|w| {
            w.write_sequence(|w| {
                w.next().write_sequence(|w| {
                    w.next().write_oid(&ObjectIdentifier::from_slice(&[1, 2, 3]));
                    w.next().write_sequence(|_| {});
                });
            });
        });
        let err = CertificationPolicy::decode(&der).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedOid { step: "policy information", .. }));
    }
}
