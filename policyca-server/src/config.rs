//! Server configuration.
//!
//! Flags come from the command line (or `POLICYCA_*` environment variables).
//! A TOML file named by `--config` supplies any value a flag leaves unset, and
//! built-in defaults fill in the rest.
//!
//! ```toml
//! listen = "0.0.0.0:8143"
//! keys = "/var/lib/policyca/keys"
//! doc_dir = "/var/www/security"
//! doc_url = "https://ca.example.com/security/"
//! learn = true
//! tls_cert = "/etc/policyca/tls.pem"
//! tls_key = "/etc/policyca/tls.key"
//! client_ca = "/etc/policyca/clients.pem"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use policyca_sdk::certpolicy::is_printable_string;
use serde::Deserialize;
use url::Url;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8143";
pub const DEFAULT_KEYS_DIR: &str = "keys";
pub const DEFAULT_DOC_DIR: &str = "docs/security";
pub const DEFAULT_DOC_URL: &str = "https://0.0.0.0:8443/security/";
/// Rule file name inside the keys directory.
pub const POLICY_FILE: &str = "policy";

/// Command-line flags. Every value is optional so the config file can fill
/// the gaps.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "policyca-server", version, about = "Policy-gated certificate authority")]
pub struct Cli {
    /// TOML config file.
    #[arg(long, env = "POLICYCA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on [default: 0.0.0.0:8143].
    #[arg(long, env = "POLICYCA_LISTEN")]
    pub listen: Option<String>,

    /// Ask the operator to approve each request instead of consulting the policy.
    #[arg(long)]
    pub manual: bool,

    /// Record a Known(...) fact for every authenticated peer.
    #[arg(long)]
    pub learn: bool,

    /// Create the CA key and a default policy if they do not exist.
    #[arg(long)]
    pub init: bool,

    /// Directory holding the CA key, certificate and policy [default: keys].
    #[arg(long, env = "POLICYCA_KEYS")]
    pub keys: Option<PathBuf>,

    /// Rule file [default: <keys>/policy].
    #[arg(long, env = "POLICYCA_POLICY")]
    pub policy: Option<PathBuf>,

    /// Directory policy documents are published to [default: docs/security].
    #[arg(long, env = "POLICYCA_DOC_DIR")]
    pub doc_dir: Option<PathBuf>,

    /// URL the document directory is served from.
    #[arg(long, env = "POLICYCA_DOC_URL")]
    pub doc_url: Option<String>,

    /// TLS certificate chain (PEM). Without it the listener is plain TCP.
    #[arg(long, env = "POLICYCA_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM).
    #[arg(long, env = "POLICYCA_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// CA bundle (PEM) used to authenticate client certificates.
    #[arg(long, env = "POLICYCA_CLIENT_CA")]
    pub client_ca: Option<PathBuf>,

    /// Give up on a manual approval after waiting this many seconds for the prompt.
    #[arg(long)]
    pub approval_timeout_secs: Option<u64>,

    /// Log issuance statistics every N seconds.
    #[arg(long)]
    pub stats_interval_secs: Option<u64>,
}

/// Contents of the `--config` file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub manual: Option<bool>,
    pub learn: Option<bool>,
    pub init: Option<bool>,
    pub keys: Option<PathBuf>,
    pub policy: Option<PathBuf>,
    pub doc_dir: Option<PathBuf>,
    pub doc_url: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub client_ca: Option<PathBuf>,
    pub approval_timeout_secs: Option<u64>,
    pub stats_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub client_ca: Option<PathBuf>,
}

/// Effective settings after merging flags, file and defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub manual: bool,
    pub learn: bool,
    pub init: bool,
    pub keys_dir: PathBuf,
    pub policy_path: PathBuf,
    pub doc_dir: PathBuf,
    pub doc_url: Url,
    pub tls: Option<TlsSettings>,
    pub approval_timeout: Option<Duration>,
    pub stats_interval: Option<Duration>,
}

impl ServerConfig {
    /// Read `--config` if given and merge.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(cli, &file)
    }

    /// Merge: CLI > config file > defaults.
    pub fn merge(cli: &Cli, file: &FileConfig) -> Result<Self> {
        let listen_addr = cli
            .listen
            .clone()
            .or_else(|| file.listen.clone())
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());

        let manual = cli.manual || file.manual.unwrap_or(false);
        let learn = cli.learn || file.learn.unwrap_or(false);
        let init = cli.init || file.init.unwrap_or(false);
        anyhow::ensure!(!(manual && learn), "--learn has no effect with --manual");

        let keys_dir = cli
            .keys
            .clone()
            .or_else(|| file.keys.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KEYS_DIR));
        let policy_path = cli
            .policy
            .clone()
            .or_else(|| file.policy.clone())
            .unwrap_or_else(|| keys_dir.join(POLICY_FILE));
        let doc_dir = cli
            .doc_dir
            .clone()
            .or_else(|| file.doc_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOC_DIR));

        let doc_url = cli
            .doc_url
            .clone()
            .or_else(|| file.doc_url.clone())
            .unwrap_or_else(|| DEFAULT_DOC_URL.to_string());
        // The URL ends up in a PrintableString inside every certificate.
        anyhow::ensure!(
            is_printable_string(&doc_url),
            "Document URL {doc_url:?} contains characters a certificate cannot carry"
        );
        let doc_url =
            Url::parse(&doc_url).with_context(|| format!("Invalid document URL {doc_url:?}"))?;

        let tls_cert = cli.tls_cert.clone().or_else(|| file.tls_cert.clone());
        let tls_key = cli.tls_key.clone().or_else(|| file.tls_key.clone());
        let client_ca = cli.client_ca.clone().or_else(|| file.client_ca.clone());
        let tls = match (tls_cert, tls_key) {
            (Some(cert), Some(key)) => Some(TlsSettings {
                cert,
                key,
                client_ca,
            }),
            (None, None) => {
                anyhow::ensure!(client_ca.is_none(), "--client-ca requires --tls-cert and --tls-key");
                None
            }
            _ => anyhow::bail!("--tls-cert and --tls-key must be given together"),
        };

        let secs = |flag: Option<u64>, file: Option<u64>| {
            flag.or(file).filter(|s| *s > 0).map(Duration::from_secs)
        };

        Ok(Self {
            listen_addr,
            manual,
            learn,
            init,
            keys_dir,
            policy_path,
            doc_dir,
            doc_url,
            tls,
            approval_timeout: secs(cli.approval_timeout_secs, file.approval_timeout_secs),
            stats_interval: secs(cli.stats_interval_secs, file.stats_interval_secs),
        })
    }

    /// Only TLS peers with a client certificate can be named.
    pub fn authenticates_peers(&self) -> bool {
        self.tls.as_ref().is_some_and(|t| t.client_ca.is_some())
    }
}
