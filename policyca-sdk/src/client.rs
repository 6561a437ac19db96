//! Submitting a CSR to the CA.
//!
//! One request, one response, then the CA closes the stream.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::wire::{self, Csr, Request, Response, ResponseStatus, WireError};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("CA answered {status}: {detail}")]
    Rejected {
        status: ResponseStatus,
        detail: String,
    },
    #[error("CA answered OK without any certificates")]
    NoCertificates,
}

/// Send `csr` over an established (already authenticated) stream and return
/// the DER chain, leaf first.
pub async fn submit<S>(stream: &mut S, csr: Csr) -> Result<Vec<Vec<u8>>, SubmitError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = Request {
        csr,
        signature: None,
    };
    wire::write_message(stream, &request).await?;
    let response: Response = wire::read_message(stream).await?;

    match response.status {
        ResponseStatus::Ok if response.certs.is_empty() => Err(SubmitError::NoCertificates),
        ResponseStatus::Ok => {
            tracing::debug!("Received {} certificate(s)", response.certs.len());
            Ok(response.certs)
        }
        status => Err(SubmitError::Rejected {
            status,
            detail: response.error_detail.unwrap_or_default(),
        }),
    }
}

/// Connect over plain TCP and [`submit`]. The CA treats such peers as
/// anonymous, so this only succeeds against a CA in manual mode.
pub async fn submit_to(addr: impl ToSocketAddrs, csr: Csr) -> Result<Vec<Vec<u8>>, SubmitError> {
    let mut stream = TcpStream::connect(addr).await.map_err(WireError::from)?;
    submit(&mut stream, csr).await
}
