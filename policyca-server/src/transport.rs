//! Peer authentication for incoming connections.
//!
//! Over TLS with a client CA configured, a peer presenting a certificate is
//! named after the CA that issued it, extended by its own key:
//! `key([<sha256 of CA SPKI>]).Key([<sha256 of peer SPKI>])`. A policy can
//! then trust the CA as a platform and admit (or learn) individual keys under
//! it. Peers without a certificate, and all peers on plain TCP, are anonymous.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::policy::Principal;
use crate::policy::principal::{Arg, Element, Tail};

/// Extension naming a peer's own key under its issuer.
pub const KEY_ELEMENT: &str = "Key";

/// SHA-256 of the certificate's SubjectPublicKeyInfo.
pub fn spki_hash(der: &[u8]) -> Option<Vec<u8>> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    Some(Sha256::digest(cert.public_key().raw).to_vec())
}

/// Turns verified client certificate chains into principals.
#[derive(Clone, Debug, Default)]
pub struct PeerNamer {
    /// (raw subject DN, SPKI hash) of each configured client CA.
    issuers: Vec<(Vec<u8>, Vec<u8>)>,
}

impl PeerNamer {
    pub fn new(client_cas: &[CertificateDer<'_>]) -> Self {
        let issuers = client_cas
            .iter()
            .filter_map(|der| {
                let (_, cert) = X509Certificate::from_der(der.as_ref()).ok()?;
                let hash = Sha256::digest(cert.public_key().raw).to_vec();
                Some((cert.subject().as_raw().to_vec(), hash))
            })
            .collect();
        Self { issuers }
    }

    /// Principal for a presented chain, leaf first. The issuer is looked up
    /// among the presented intermediates, then the configured CAs. A leaf
    /// whose issuer is unknown is named by its own key alone.
    pub fn name(&self, chain: &[CertificateDer<'_>]) -> Option<Principal> {
        let (leaf_der, presented) = chain.split_first()?;
        let (_, leaf) = X509Certificate::from_der(leaf_der.as_ref()).ok()?;
        let leaf_hash = Sha256::digest(leaf.public_key().raw).to_vec();
        let issuer_dn = leaf.issuer().as_raw();

        let from_chain = presented.iter().find_map(|der| {
            let (_, cert) = X509Certificate::from_der(der.as_ref()).ok()?;
            (cert.subject().as_raw() == issuer_dn)
                .then(|| Sha256::digest(cert.public_key().raw).to_vec())
        });
        let issuer_hash = from_chain.or_else(|| {
            self.issuers
                .iter()
                .find(|(subject, _)| subject.as_slice() == issuer_dn)
                .map(|(_, hash)| hash.clone())
        });

        match issuer_hash {
            Some(issuer) if issuer != leaf_hash => {
                let own = Tail(vec![Element::new(KEY_ELEMENT, vec![Arg::Bytes(leaf_hash)])]);
                Some(Principal::key(issuer).extend(&own))
            }
            _ => Some(Principal::key(leaf_hash)),
        }
    }

    /// Principal of the TLS peer, if it authenticated with a certificate.
    pub fn peer_principal(&self, conn: &rustls::ServerConnection) -> Option<Principal> {
        let chain = conn.peer_certificates()?;
        let principal = self.name(chain);
        if principal.is_none() {
            tracing::warn!("Peer presented an unparseable certificate; treating as anonymous");
        }
        principal
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Failed to read certificates: {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates: {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "No certificates in {}", path.display());
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Failed to read TLS key: {}", path.display()))?;
    rustls_pemfile::private_key(&mut &pem[..])
        .context("Failed to parse TLS private key")?
        .context("No private key found in PEM file")
}

/// TLS acceptor for the CA listener. With `client_ca`, client certificates
/// issued under it are verified and optional, and the returned namer knows
/// its CAs.
pub fn build_tls_acceptor(
    cert_path: &Path,
    key_path: &Path,
    client_ca: Option<&Path>,
) -> Result<(TlsAcceptor, PeerNamer)> {
    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let (builder, namer) = match client_ca {
        Some(ca_path) => {
            let cas = read_certs(ca_path)?;
            let namer = PeerNamer::new(&cas);
            let mut roots = rustls::RootCertStore::empty();
            for cert in cas {
                roots
                    .add(cert)
                    .context("Invalid client CA certificate")?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .context("Invalid client certificate verifier")?;
            (builder.with_client_cert_verifier(verifier), namer)
        }
        None => (builder.with_no_client_auth(), PeerNamer::default()),
    };
    let config = builder
        .with_single_cert(certs, key)
        .context("Invalid TLS configuration")?;

    Ok((TlsAcceptor::from(Arc::new(config)), namer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    fn ca() -> (rcgen::Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        (params.self_signed(&key).unwrap(), key)
    }

    fn leaf(issuer: &rcgen::Certificate, issuer_key: &KeyPair) -> (rcgen::Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["peer.example".into()])
            .unwrap()
            .signed_by(&key, issuer, issuer_key)
            .unwrap();
        (cert, key)
    }

    #[test]
    fn peer_is_its_key_under_the_issuing_ca() {
        let (ca_cert, ca_key) = ca();
        let (cert, key) = leaf(&ca_cert, &ca_key);
        let namer = PeerNamer::new(&[ca_cert.der().clone()]);

        let p = namer.name(&[cert.der().clone()]).unwrap();
        let own = Sha256::digest(key.public_key_der()).to_vec();
        let expected = Principal::key(Sha256::digest(ca_key.public_key_der()).to_vec())
            .extend(&Tail(vec![Element::new(KEY_ELEMENT, vec![Arg::Bytes(own)])]));
        assert_eq!(p, expected);
        assert_eq!(p.last_extension().unwrap().to_string(), format!("ext.{}", p.ext.0[0]));
        assert_eq!(spki_hash(ca_cert.der()), Some(Sha256::digest(ca_key.public_key_der()).to_vec()));
    }

    #[test]
    fn issuer_may_come_from_the_presented_chain() {
        let (ca_cert, ca_key) = ca();
        let (cert, _) = leaf(&ca_cert, &ca_key);
        let bundled = PeerNamer::new(&[ca_cert.der().clone()]).name(&[cert.der().clone()]);
        let presented = PeerNamer::default().name(&[cert.der().clone(), ca_cert.der().clone()]);
        assert_eq!(bundled, presented);
        assert!(presented.unwrap().last_extension().is_some());
    }

    #[test]
    fn unknown_issuer_names_the_key_alone() {
        let (ca_cert, ca_key) = ca();
        let (cert, key) = leaf(&ca_cert, &ca_key);
        let p = PeerNamer::default().name(&[cert.der().clone()]).unwrap();
        assert_eq!(p, Principal::key(Sha256::digest(key.public_key_der()).to_vec()));
        assert!(p.last_extension().is_none());
    }

    #[test]
    fn garbage_certificate_has_no_principal() {
        let garbage = CertificateDer::from(b"not a certificate".to_vec());
        assert!(PeerNamer::default().name(&[garbage]).is_none());
        assert!(PeerNamer::default().name(&[]).is_none());
        assert!(spki_hash(b"not a certificate").is_none());
    }

    #[test]
    fn missing_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_tls_acceptor(&dir.path().join("c.pem"), &dir.path().join("k.pem"), None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to read certificates"));
    }
}
