//! Listener and startup wiring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::approval::{ApprovalGate, Approver, ConsoleApprover};
use crate::config::ServerConfig;
use crate::custody::LocalCustody;
use crate::issuer::{Issuer, Mode};
use crate::policy::{self, PolicyGuard, Principal, SharedGuard};
use crate::publish::DocumentPublisher;
use crate::transport::{self, PeerNamer};

pub struct Server {
    config: ServerConfig,
    approver: Arc<dyn Approver>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            approver: Arc::new(ConsoleApprover),
        }
    }

    /// Replace the console prompt used in manual mode.
    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    /// Open the CA key, load the policy and set up publication.
    pub fn build_issuer(&self) -> Result<Issuer> {
        let config = &self.config;
        let custody = LocalCustody::open(&config.keys_dir, config.init)
            .context("Failed to open CA key")?;

        if config.init {
            let created = policy::write_default_policy(&config.policy_path).with_context(|| {
                format!("Failed to write policy {}", config.policy_path.display())
            })?;
            if created {
                tracing::info!(
                    "Created default certificate-granting policy at {}",
                    config.policy_path.display()
                );
            } else {
                tracing::info!(
                    "Using existing certificate-granting policy at {}",
                    config.policy_path.display()
                );
            }
        }

        let mode = if config.manual {
            tracing::info!("Requests are approved manually");
            Mode::Manual(ApprovalGate::new(
                Arc::clone(&self.approver),
                config.approval_timeout,
            ))
        } else {
            let guard = PolicyGuard::load(&config.policy_path)?;
            tracing::info!(
                "Loaded {} policy from {}",
                guard.kind(),
                config.policy_path.display()
            );
            if !config.authenticates_peers() {
                tracing::warn!(
                    "No client CA configured: every peer is anonymous and every request will be denied"
                );
            }
            Mode::Automatic {
                guard: Arc::new(SharedGuard::new(guard)),
                learn: config.learn,
            }
        };

        let publisher = DocumentPublisher::new(&config.doc_dir, config.doc_url.clone());
        tracing::info!(
            "Publishing policy documents to {} as {}",
            publisher.doc_dir().display(),
            publisher.base_url()
        );

        Ok(Issuer::new(mode, publisher, Arc::new(custody)))
    }

    fn build_tls_acceptor(&self) -> Result<Option<(TlsAcceptor, Arc<PeerNamer>)>> {
        let Some(tls) = &self.config.tls else {
            return Ok(None);
        };
        let (acceptor, namer) =
            transport::build_tls_acceptor(&tls.cert, &tls.key, tls.client_ca.as_deref())?;
        Ok(Some((acceptor, Arc::new(namer))))
    }

    pub async fn run(self) -> Result<()> {
        let (_addr, handle) = self.start().await?;
        handle.await?
    }

    /// Start the server and return the bound address + task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let acceptor = self.build_tls_acceptor()?;
        let issuer = Arc::new(self.build_issuer()?);

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        let addr = listener.local_addr()?;
        let scheme = if acceptor.is_some() { "TLS" } else { "plain TCP" };
        tracing::info!("Listening on {addr} ({scheme})");

        let stats_interval = self.config.stats_interval;
        let handle = tokio::spawn(async move {
            let stats = stats_interval.map(|every| tokio::spawn(log_stats(Arc::clone(&issuer), every)));
            let result = accept_loop(listener, acceptor, issuer).await;
            if let Some(stats) = stats {
                stats.abort();
            }
            result
        });

        Ok((addr, handle))
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<(TlsAcceptor, Arc<PeerNamer>)>,
    issuer: Arc<Issuer>,
) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        tracing::debug!("Connection from {addr}");
        let issuer = Arc::clone(&issuer);
        match &acceptor {
            None => {
                tokio::spawn(async move {
                    serve(stream, None, &issuer).await;
                });
            }
            Some((acceptor, namer)) => {
                let acceptor = acceptor.clone();
                let namer = Arc::clone(namer);
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let peer = namer.peer_principal(tls_stream.get_ref().1);
                            serve(tls_stream, peer, &issuer).await;
                        }
                        Err(e) => tracing::warn!("TLS handshake with {addr} failed: {e}"),
                    }
                });
            }
        }
    }
}

async fn serve<S>(mut stream: S, peer: Option<Principal>, issuer: &Issuer)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let status = issuer.handle(&mut stream, peer.as_ref()).await;
    tracing::debug!("Request finished with {status}");
}

async fn log_stats(issuer: Arc<Issuer>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        tracing::info!("Requests: {}", issuer.stats());
    }
}
