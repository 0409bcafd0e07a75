//! Per-link session setup: raw TCP halves, or a TLS client session upgraded
//! in-band over the already-open stream.
//!
//! The raw stream is moved into the TLS layer, so once the handshake starts
//! every failure surfaces once, as a [`HandshakeError`].

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::config::TlsMaterial;
use crate::error::HandshakeError;

pub(crate) type SessionReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Build the client-side TLS configuration from PEM material.
///
/// `ca` supplies the trust anchors. `cert` and `key` are presented as the
/// client identity and must come together.
pub(crate) fn build_connector(tls: &TlsMaterial) -> Result<TlsConnector, HandshakeError> {
    let mut roots = RootCertStore::empty();
    for pem in &tls.ca {
        for cert in parse_certs("ca", pem)? {
            roots.add(cert)?;
        }
    }
    if roots.is_empty() {
        return Err(HandshakeError::NoTrustAnchors);
    }

    let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots);

    let config = match (&tls.cert, &tls.key) {
        (Some(cert), Some(key)) => {
            let chain = parse_certs("cert", cert)?;
            let key = rustls_pemfile::private_key(&mut key.as_bytes())
                .map_err(|e| pem_error("key", &e))?
                .ok_or_else(|| HandshakeError::Pem { field: "key", reason: "no private key found".into() })?;
            builder.with_client_auth_cert(chain, key)?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => return Err(HandshakeError::IncompleteIdentity),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Split the stream into session halves, upgrading to TLS when a connector
/// is given.
pub(crate) async fn establish(
    stream: TcpStream,
    tls: Option<&TlsConnector>,
    server_name: &str,
) -> Result<(SessionReader, SessionWriter), HandshakeError> {
    let Some(connector) = tls else {
        let (reader, writer) = stream.into_split();
        return Ok((Box::new(reader), Box::new(writer)));
    };

    let name = ServerName::try_from(server_name.to_owned())
        .map_err(|_| HandshakeError::ServerName(server_name.to_owned()))?;
    let session = connector.connect(name, stream).await?;
    let (reader, writer) = tokio::io::split(session);
    Ok((Box::new(reader), Box::new(writer)))
}

fn parse_certs(field: &'static str, pem: &str) -> Result<Vec<CertificateDer<'static>>, HandshakeError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| pem_error(field, &e))?;
    if certs.is_empty() {
        return Err(HandshakeError::Pem { field, reason: "no certificates found".into() });
    }
    Ok(certs)
}

fn pem_error(field: &'static str, err: &std::io::Error) -> HandshakeError {
    HandshakeError::Pem { field, reason: err.to_string() }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
