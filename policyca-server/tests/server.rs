//! Listener tests: startup wiring, plain TCP and mutually authenticated TLS.
//!
//! Tests cover:
//! - `--init` creates the CA key and the default policy, later starts reuse them
//! - Plain TCP peers are anonymous (denied automatically, approved manually)
//! - TLS peers with a client certificate are named by their key under the issuing CA
//! - Learn mode admits keys issued by a trusted CA over mutual TLS
//! - TLS peers without a client certificate are anonymous
//! - Startup fails on a missing key or a broken policy file

use std::path::Path;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};

use policyca_sdk::wire::{Csr, ResponseStatus, X509Details};
use policyca_sdk::{SubmitError, submit, submit_to};
use policyca_server::approval::{ApprovalError, Approver};
use policyca_server::config::{Cli, FileConfig, ServerConfig};
use policyca_server::custody::{CA_CERT_FILE, CA_KEY_FILE};
use policyca_server::policy::{DEFAULT_POLICY, Principal};
use policyca_server::server::Server;
use policyca_server::transport::{PeerNamer, spki_hash};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn csr() -> Csr {
    Csr::new(
        SigningKey::from_bytes(&[9; 32]).verifying_key().as_bytes().to_vec(),
        X509Details {
            organizational_unit: Some("Eng".into()),
            common_name: Some("svc.example".into()),
            ..Default::default()
        },
    )
}

fn base_cli(dir: &Path) -> Cli {
    Cli {
        listen: Some("127.0.0.1:0".into()),
        keys: Some(dir.join("keys")),
        doc_dir: Some(dir.join("docs")),
        doc_url: Some("https://ca.example/security/".into()),
        init: true,
        ..Default::default()
    }
}

fn config(cli: &Cli) -> ServerConfig {
    ServerConfig::merge(cli, &FileConfig::default()).unwrap()
}

fn denied_anonymously(result: Result<Vec<Vec<u8>>, SubmitError>) {
    match result {
        Err(SubmitError::Rejected { status, detail }) => {
            assert_eq!(status, ResponseStatus::RequestDenied);
            assert_eq!(detail, "anonymous request is denied");
        }
        other => panic!("expected an anonymous denial, got {other:?}"),
    }
}

struct Approve;

impl Approver for Approve {
    fn confirm(&self, _summary: &str) -> Result<bool, ApprovalError> {
        Ok(true)
    }
}

// ─── Plain TCP ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn init_creates_key_and_default_policy() {
    let dir = tempfile::tempdir().unwrap();
    let cli = base_cli(dir.path());

    let (addr, handle) = Server::new(config(&cli)).start().await.unwrap();
    let keys = dir.path().join("keys");
    assert!(keys.join(CA_KEY_FILE).exists());
    assert!(keys.join(CA_CERT_FILE).exists());
    assert_eq!(
        std::fs::read_to_string(keys.join("policy")).unwrap(),
        DEFAULT_POLICY
    );

    denied_anonymously(submit_to(addr, csr()).await);
    handle.abort();

    // A second start reuses the stored root.
    let root = std::fs::read(keys.join(CA_CERT_FILE)).unwrap();
    let (_, handle) = Server::new(config(&cli)).start().await.unwrap();
    assert_eq!(std::fs::read(keys.join(CA_CERT_FILE)).unwrap(), root);
    handle.abort();
}

#[tokio::test]
async fn manual_mode_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let mut cli = base_cli(dir.path());
    cli.manual = true;

    let server = Server::new(config(&cli)).with_approver(Arc::new(Approve));
    let (addr, handle) = server.start().await.unwrap();

    let certs = submit_to(addr, csr()).await.unwrap();
    assert_eq!(certs.len(), 2);
    handle.abort();
}

#[tokio::test]
async fn startup_errors() {
    let dir = tempfile::tempdir().unwrap();
    let mut cli = base_cli(dir.path());
    cli.init = false;
    let err = Server::new(config(&cli)).start().await.err().unwrap();
    assert!(format!("{err:#}").contains("--init"));

    cli.init = true;
    std::fs::create_dir_all(dir.path().join("keys")).unwrap();
    std::fs::write(dir.path().join("keys/policy"), "acl\nnot a rule\n").unwrap();
    let err = Server::new(config(&cli)).start().await.err().unwrap();
    assert!(format!("{err:#}").contains(":2:"));
}

// ─── TLS ─────────────────────────────────────────────────────────────────────

struct Pki {
    ca: rcgen::Certificate,
    ca_key: KeyPair,
}

impl Pki {
    fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = params.self_signed(&ca_key).unwrap();
        Self { ca, ca_key }
    }

    fn issue(&self, names: &[&str]) -> (rcgen::Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let names = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        let cert = CertificateParams::new(names)
            .unwrap()
            .signed_by(&key, &self.ca, &self.ca_key)
            .unwrap();
        (cert, key)
    }
}

async fn start_tls(dir: &Path, pki: &Pki, policy: &str, learn: bool) -> std::net::SocketAddr {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let (server_cert, server_key) = pki.issue(&["localhost"]);
    std::fs::write(dir.join("tls.pem"), server_cert.pem()).unwrap();
    std::fs::write(dir.join("tls.key"), server_key.serialize_pem()).unwrap();
    std::fs::write(dir.join("clients.pem"), pki.ca.pem()).unwrap();
    std::fs::create_dir_all(dir.join("keys")).unwrap();
    std::fs::write(dir.join("keys/policy"), policy).unwrap();

    let mut cli = base_cli(dir);
    cli.tls_cert = Some(dir.join("tls.pem"));
    cli.tls_key = Some(dir.join("tls.key"));
    cli.client_ca = Some(dir.join("clients.pem"));
    cli.learn = learn;

    let (addr, _handle) = Server::new(config(&cli)).start().await.unwrap();
    addr
}

fn connector(pki: &Pki, client: Option<(&rcgen::Certificate, &KeyPair)>) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(pki.ca.der().clone()).unwrap();
    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let config = match client {
        Some((cert, key)) => builder
            .with_client_auth_cert(
                vec![cert.der().clone()],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            )
            .unwrap(),
        None => builder.with_no_client_auth(),
    };
    TlsConnector::from(Arc::new(config))
}

async fn submit_tls(
    addr: std::net::SocketAddr,
    connector: TlsConnector,
) -> Result<Vec<Vec<u8>>, SubmitError> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let mut stream = connector.connect(name, tcp).await.unwrap();
    submit(&mut stream, csr()).await
}

#[tokio::test]
async fn tls_client_certificate_names_the_peer() {
    let dir = tempfile::tempdir().unwrap();
    let pki = Pki::new();
    let (client_cert, client_key) = pki.issue(&["client.example"]);
    let peer = PeerNamer::new(&[pki.ca.der().clone()])
        .name(&[client_cert.der().clone()])
        .unwrap();
    assert!(peer.last_extension().is_some());

    let addr = start_tls(dir.path(), &pki, &format!("acl\n\"Eng\", *, {peer}\n"), false).await;

    let certs = submit_tls(addr, connector(&pki, Some((&client_cert, &client_key))))
        .await
        .unwrap();
    assert_eq!(certs.len(), 2);

    let notice_named_peer = std::fs::read_dir(dir.path().join("docs"))
        .unwrap()
        .map(|e| std::fs::read_to_string(e.unwrap().path()).unwrap())
        .any(|doc| doc.contains(&peer.to_string()));
    assert!(notice_named_peer);
}

#[tokio::test]
async fn tls_peer_not_in_policy_is_denied() {
    let dir = tempfile::tempdir().unwrap();
    let pki = Pki::new();
    let (client_cert, client_key) = pki.issue(&["client.example"]);

    let addr = start_tls(dir.path(), &pki, "acl\n*, *, key([00])\n", false).await;

    match submit_tls(addr, connector(&pki, Some((&client_cert, &client_key)))).await {
        Err(SubmitError::Rejected { status, detail }) => {
            assert_eq!(status, ResponseStatus::RequestDenied);
            assert_eq!(detail, "request is denied");
        }
        other => panic!("expected a denial, got {other:?}"),
    }
}

#[tokio::test]
async fn tls_without_client_certificate_is_anonymous() {
    let dir = tempfile::tempdir().unwrap();
    let pki = Pki::new();

    let addr = start_tls(dir.path(), &pki, "acl\n*, *, key([00])\n", false).await;
    denied_anonymously(submit_tls(addr, connector(&pki, None)).await);
}

fn trusted_ca_policy(pki: &Pki) -> String {
    let ca = Principal::key(spki_hash(pki.ca.der()).unwrap());
    format!(
        "datalog\n\
         TrustedHost({ca})\n\
         forall P, O, E: Subprin(P, O, E) and TrustedHost(O) and Known(E) \\\n\
         implies Authorized(\"ClaimCertificate\", P)\n"
    )
}

#[tokio::test]
async fn tls_learn_mode_admits_keys_under_a_trusted_ca() {
    let pki = Pki::new();
    let (client_cert, client_key) = pki.issue(&["client.example"]);
    let policy = trusted_ca_policy(&pki);

    // Without learning, the key under the trusted CA is not yet known.
    let dir = tempfile::tempdir().unwrap();
    let addr = start_tls(dir.path(), &pki, &policy, false).await;
    match submit_tls(addr, connector(&pki, Some((&client_cert, &client_key)))).await {
        Err(SubmitError::Rejected { status, .. }) => {
            assert_eq!(status, ResponseStatus::RequestDenied)
        }
        other => panic!("expected a denial, got {other:?}"),
    }

    let dir = tempfile::tempdir().unwrap();
    let addr = start_tls(dir.path(), &pki, &policy, true).await;
    for _ in 0..2 {
        let certs = submit_tls(addr, connector(&pki, Some((&client_cert, &client_key))))
            .await
            .unwrap();
        assert_eq!(certs.len(), 2);
    }

    // The practice statement embeds the guard's rules, now including the learned key.
    let peer = PeerNamer::new(&[pki.ca.der().clone()])
        .name(&[client_cert.der().clone()])
        .unwrap();
    let learned = format!("Known({})", peer.last_extension().unwrap());
    let docs: Vec<String> = std::fs::read_dir(dir.path().join("docs"))
        .unwrap()
        .map(|e| std::fs::read_to_string(e.unwrap().path()).unwrap())
        .collect();
    assert!(docs.iter().any(|doc| doc.contains(&learned)));
    assert!(docs.iter().all(|doc| doc.matches(&learned).count() <= 1));
}
