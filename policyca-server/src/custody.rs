//! CA signing key custody.
//!
//! [`KeyCustody`] is the seam between the issuance handler and whatever holds
//! the CA private key. [`LocalCustody`] keeps an Ed25519 root key and its
//! self-signed certificate as PEM files in a keys directory.

use std::path::{Path, PathBuf};

use ed25519_dalek::VerifyingKey;
use policyca_sdk::X509Details;
use policyca_sdk::certpolicy::ID_CERTIFICATE_POLICIES;
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_ED25519, PublicKeyData,
    SerialNumber, SignatureAlgorithm,
};
use time::{Duration, OffsetDateTime};

use crate::policy::Principal;

pub const CA_KEY_FILE: &str = "ca.key.pem";
pub const CA_CERT_FILE: &str = "ca.cert.pem";

const ROOT_VALIDITY_YEARS: u32 = 10;
const DAYS_PER_YEAR: i64 = 365;

#[derive(Debug, thiserror::Error)]
pub enum CustodyError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no CA key in {}; start with --init to create one", dir.display())]
    NotInitialized { dir: PathBuf },
    #[error("invalid CA material: {0}")]
    Pem(String),
    #[error("validity of {years} years is out of range")]
    Validity { years: u32 },
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
}

/// A subject's Ed25519 verifying key, in the shape rcgen signs over.
#[derive(Debug, Clone)]
pub struct SubjectKey(VerifyingKey);

impl SubjectKey {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: &[u8; 32] = bytes.try_into().ok()?;
        VerifyingKey::from_bytes(raw).ok().map(Self)
    }

    /// `key([<raw key bytes>])`
    pub fn to_principal(&self) -> Principal {
        Principal::key(self.0.as_bytes().to_vec())
    }
}

impl PublicKeyData for SubjectKey {
    fn der_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &PKCS_ED25519
    }
}

/// Everything the handler decides about a certificate before it is signed.
#[derive(Debug, Clone)]
pub struct CertificateTemplate {
    pub subject: X509Details,
    pub serial: i64,
    pub is_ca: bool,
    pub years: u32,
    /// DER value of the certificate-policies extension.
    pub policy_extension: Vec<u8>,
}

impl CertificateTemplate {
    fn distinguished_name(&self) -> DistinguishedName {
        let s = &self.subject;
        let mut dn = DistinguishedName::new();
        for (ty, value) in [
            (DnType::CountryName, &s.country),
            (DnType::StateOrProvinceName, &s.state),
            (DnType::LocalityName, &s.city),
            (DnType::OrganizationName, &s.organization),
            (DnType::OrganizationalUnitName, &s.organizational_unit),
            (DnType::CommonName, &s.common_name),
        ] {
            if let Some(v) = value {
                dn.push(ty, v.as_str());
            }
        }
        dn
    }
}

pub trait KeyCustody: Send + Sync {
    /// Sign a certificate for `subject` described by `template`; returns DER.
    fn sign(&self, template: &CertificateTemplate, subject: &SubjectKey)
    -> Result<Vec<u8>, CustodyError>;

    /// Issuer chain (DER), closest issuer first, root last.
    fn cert_chain(&self) -> Vec<Vec<u8>>;
}

// ─── Local custody ───────────────────────────────────────────────────────────

pub struct LocalCustody {
    key: KeyPair,
    issuer: rcgen::Certificate,
    chain: Vec<Vec<u8>>,
}

impl LocalCustody {
    /// Create a fresh self-signed root in memory.
    pub fn generate(common_name: &str) -> Result<Self, CustodyError> {
        let key = KeyPair::generate_for(&PKCS_ED25519)?;
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Policy-Gated Certificate Authority");
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(SerialNumber::from_slice(&[1]));
        let (not_before, not_after) = validity(ROOT_VALIDITY_YEARS)?;
        params.not_before = not_before;
        params.not_after = not_after;

        let issuer = params.self_signed(&key)?;
        let chain = vec![issuer.der().to_vec()];
        Ok(Self { key, issuer, chain })
    }

    /// Load the root from `dir`, or create and save one when `init` is set
    /// and none exists yet.
    pub fn open(dir: &Path, init: bool) -> Result<Self, CustodyError> {
        let key_path = dir.join(CA_KEY_FILE);
        if key_path.exists() {
            return Self::load(dir);
        }
        if !init {
            return Err(CustodyError::NotInitialized {
                dir: dir.to_path_buf(),
            });
        }
        let custody = Self::generate("Policy-Gated Root Certificate Authority")?;
        custody.save(dir)?;
        tracing::info!("Created CA key and certificate in {}", dir.display());
        Ok(custody)
    }

    pub fn load(dir: &Path) -> Result<Self, CustodyError> {
        let key_pem = read_to_string(&dir.join(CA_KEY_FILE))?;
        let cert_pem = read_to_string(&dir.join(CA_CERT_FILE))?;

        let key = KeyPair::from_pem(&key_pem).map_err(|e| CustodyError::Pem(e.to_string()))?;
        let chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .map(|c| c.map(|der| der.to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CustodyError::Pem(e.to_string()))?;
        if chain.is_empty() {
            return Err(CustodyError::Pem(format!("no certificate in {CA_CERT_FILE}")));
        }
        // rcgen signs with an issuer Certificate; rebuild it from the stored
        // root. The chain served to clients is the stored DER.
        let issuer = CertificateParams::from_ca_cert_pem(&cert_pem)?.self_signed(&key)?;
        tracing::info!("Loaded CA key from {}", dir.display());
        Ok(Self { key, issuer, chain })
    }

    pub fn save(&self, dir: &Path) -> Result<(), CustodyError> {
        std::fs::create_dir_all(dir).map_err(|source| CustodyError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        write_private(&dir.join(CA_KEY_FILE), &self.key.serialize_pem())?;
        let cert_path = dir.join(CA_CERT_FILE);
        std::fs::write(&cert_path, self.issuer.pem()).map_err(|source| CustodyError::Io {
            path: cert_path,
            source,
        })
    }
}

impl KeyCustody for LocalCustody {
    fn sign(
        &self,
        template: &CertificateTemplate,
        subject: &SubjectKey,
    ) -> Result<Vec<u8>, CustodyError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = template.distinguished_name();
        if template.is_ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
        } else {
            params.is_ca = IsCa::ExplicitNoCa;
            params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        }
        params.serial_number = Some(SerialNumber::from_slice(&template.serial.to_be_bytes()));
        let (not_before, not_after) = validity(template.years)?;
        params.not_before = not_before;
        params.not_after = not_after;
        params.custom_extensions.push(CustomExtension::from_oid_content(
            ID_CERTIFICATE_POLICIES,
            template.policy_extension.clone(),
        ));

        let cert = params.signed_by(subject, &self.issuer, &self.key)?;
        Ok(cert.der().to_vec())
    }

    fn cert_chain(&self) -> Vec<Vec<u8>> {
        self.chain.clone()
    }
}

fn validity(years: u32) -> Result<(OffsetDateTime, OffsetDateTime), CustodyError> {
    let now = OffsetDateTime::now_utc();
    let not_after = now
        .checked_add(Duration::days(i64::from(years) * DAYS_PER_YEAR))
        .ok_or(CustodyError::Validity { years })?;
    Ok((now, not_after))
}

fn read_to_string(path: &Path) -> Result<String, CustodyError> {
    std::fs::read_to_string(path).map_err(|source| CustodyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a file readable only by the owner.
fn write_private(path: &Path, contents: &str) -> Result<(), CustodyError> {
    let io_err = |source| CustodyError::Io {
        path: path.to_path_buf(),
        source,
    };
    std::fs::write(path, contents).map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }
    Ok(())
}
