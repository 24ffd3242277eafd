//! Mid-stream TLS upgrade for STARTTLS-style sessions.
//!
//! When the ClientHello search hits, the relay hands both legs back with the
//! hello still buffered. The upgrade wraps the upstream leg in a TLS client
//! session first, forges a leaf from the real certificate, then accepts TLS
//! from the client over a stream that replays the buffered hello. Neither
//! socket is closed or reopened.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use super::detect::{self, HelloScan};
use super::tls::{self, LeafResolver, TlsSetupError};
use super::{BoxIo, ConnState, ProxyCore};

/// Stream adapter that serves buffered bytes before reading from the inner
/// stream. Used to replay a peeked ClientHello into the TLS acceptor.
pub struct PrefixedIo {
    prefix: BytesMut,
    inner: BoxIo,
}

impl PrefixedIo {
    pub fn new(prefix: BytesMut, inner: BoxIo) -> Self {
        PrefixedIo { prefix, inner }
    }
}

impl AsyncRead for PrefixedIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Both legs after a successful upgrade.
pub struct UpgradedLegs {
    pub client: BoxIo,
    pub server: BoxIo,
}

/// Wrap both legs of an established relay in TLS.
///
/// `buffered` must start with the ClientHello that triggered the upgrade;
/// its SNI picks the upstream server name and the forged leaf.
pub async fn upgrade(
    client: BoxIo,
    server: BoxIo,
    buffered: BytesMut,
    conn: &mut ConnState,
    core: &ProxyCore,
) -> Result<UpgradedLegs, TlsSetupError> {
    let sni = match detect::parse_client_hello(&buffered) {
        HelloScan::Hello { sni } => sni,
        _ => None,
    };
    conn.summary.sni = sni.clone();

    // Upstream first: its certificate seeds the forgery.
    let key_log = conn
        .logs
        .master
        .then(|| core.master_log.clone())
        .flatten();
    let client_cfg = tls::client_config(&conn.opts, key_log.clone())?;
    let server_name = match &sni {
        Some(name) => ServerName::try_from(name.clone())
            .unwrap_or_else(|_| ServerName::IpAddress(conn.dst_addr.ip().into())),
        None => ServerName::IpAddress(conn.dst_addr.ip().into()),
    };
    let connector = TlsConnector::from(Arc::new(client_cfg));
    let server_tls = connector.connect(server_name, server).await?;
    debug!(conn = conn.id, "autossl upstream TLS established");

    let (_, server_conn) = server_tls.get_ref();
    conn.summary.dst_tls = tls::negotiated_info(server_conn);
    let orig_der: Option<Vec<u8>> = server_conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|c| c.as_ref().to_vec());
    if let Some(der) = &orig_der {
        conn.summary.orig_fingerprint = Some(crate::cert::fingerprint(der));
    }

    let Some(leaf) = core.certs.leaf_for(sni.as_deref(), orig_der.as_deref())? else {
        return Err(TlsSetupError::NotTls);
    };
    conn.summary.used_fingerprint = Some(leaf.fingerprint.clone());
    conn.summary.ssl_names = Some(leaf.names.clone());

    let resolver = LeafResolver::new(
        core.certs.clone(),
        leaf,
        orig_der,
        conn.opts.allow_wrong_host,
    )?;
    let server_cfg = tls::server_config(resolver, &conn.opts, key_log)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_cfg));
    let client_tls = acceptor
        .accept(PrefixedIo::new(buffered, client))
        .await?;
    debug!(conn = conn.id, "autossl client TLS established");

    let (_, client_conn) = client_tls.get_ref();
    conn.summary.src_tls = tls::negotiated_info(client_conn);

    Ok(UpgradedLegs {
        client: Box::new(client_tls),
        server: Box::new(server_tls),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefixed_io_replays_prefix_first() {
        let (near, mut far) = tokio::io::duplex(1024);
        far.write_all(b" world").await.unwrap();
        far.shutdown().await.unwrap();

        let mut io = PrefixedIo::new(BytesMut::from(&b"hello"[..]), Box::new(near));
        let mut out = Vec::new();
        io.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_prefixed_io_partial_reads() {
        let (near, _far) = tokio::io::duplex(16);
        let mut io = PrefixedIo::new(BytesMut::from(&b"abcdef"[..]), Box::new(near));
        let mut buf = [0u8; 4];
        let n = io.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = io.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn test_prefixed_io_writes_pass_through() {
        let (near, mut far) = tokio::io::duplex(1024);
        let mut io = PrefixedIo::new(BytesMut::new(), Box::new(near));
        io.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
