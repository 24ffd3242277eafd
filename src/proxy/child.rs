//! Divert-mode child listener and child connections.
//!
//! Each diverted connection gets an ephemeral loopback listener whose
//! address is baked into the routing header. The downstream consumer
//! connects back here to re-inject traffic toward the original destination.
//! The first child inherits the parent's already-established upstream leg;
//! later children dial fresh ones. Children live strictly inside the
//! parent's lifetime and are torn down first.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::http::ROUTING_HEADER_KEY;
use super::relay::{self, HttpHandler, ProtoHandler, RelayBufs, Verdict};
use super::tls;
use super::{BoxIo, ConnState, ProxyCore};
use crate::config::Proto;

/// How a child connection reaches the original destination.
pub struct ChildUpstream {
    /// The parent's upstream leg, consumed by the first child.
    pub inherited: Option<BoxIo>,
    pub orig_dst: SocketAddr,
    /// SNI for fresh TLS legs, when the parent terminated TLS upstream.
    pub tls_sni: Option<String>,
    pub tls_upstream: bool,
    pub opts: Arc<crate::config::ConnOpts>,
}

/// Running child listener for one diverted connection.
pub struct ChildListenerHandle {
    pub addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl ChildListenerHandle {
    /// Tear down the listener and every outstanding child.
    pub fn shutdown(self) {
        self.accept_task.abort();
    }
}

/// Bind the ephemeral loopback listener and start accepting children.
pub async fn setup(
    core: Arc<ProxyCore>,
    parent: &ConnState,
    upstream: ChildUpstream,
) -> std::io::Result<ChildListenerHandle> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    debug!(conn = parent.id, %addr, "child listener up");

    let parent_state = ConnState::for_child(parent, addr, false);
    let proto = parent.proto;
    let capture = core.config.capture_dir.is_some() && parent.logs.content;

    let accept_task = tokio::spawn(async move {
        let mut upstream = upstream;
        let mut children: JoinSet<()> = JoinSet::new();
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("child accept failed: {e}");
                    break;
                }
            };
            let leg = match take_upstream(&mut upstream).await {
                Ok(leg) => leg,
                Err(e) => {
                    warn!("child upstream connect failed: {e}");
                    continue;
                }
            };
            let core = core.clone();
            let mut state = ConnState::for_child(&parent_state, peer, capture);
            children.spawn(async move {
                state.connected = true;
                let mut handler: Box<dyn ProtoHandler> = match proto {
                    Proto::Http | Proto::Https => Box::new(HttpHandler::new(true, None)),
                    _ => Box::new(RoutingStripHandler::default()),
                };
                let mut pcap_ctx = None;
                if let Err(e) = relay::relay(
                    Box::new(stream),
                    leg,
                    handler.as_mut(),
                    &mut state,
                    &core,
                    &mut pcap_ctx,
                )
                .await
                {
                    debug!(conn = state.id, "child relay ended with error: {e}");
                }
                state.finish(&core);
            });
        }
        // Dropping the set aborts every outstanding child.
        drop(children);
    });

    Ok(ChildListenerHandle { addr, accept_task })
}

async fn take_upstream(upstream: &mut ChildUpstream) -> Result<BoxIo, tls::TlsSetupError> {
    if let Some(leg) = upstream.inherited.take() {
        return Ok(leg);
    }
    let tcp = TcpStream::connect(upstream.orig_dst).await?;
    if !upstream.tls_upstream {
        return Ok(Box::new(tcp));
    }
    let config = tls::client_config(&upstream.opts, None)?;
    let server_name = match &upstream.tls_sni {
        Some(name) => ServerName::try_from(name.clone())
            .unwrap_or_else(|_| ServerName::IpAddress(upstream.orig_dst.ip().into())),
        None => ServerName::IpAddress(upstream.orig_dst.ip().into()),
    };
    let connector = TlsConnector::from(Arc::new(config));
    let stream = connector.connect(server_name, tcp).await?;
    Ok(Box::new(stream))
}

/// Opaque child relay that removes the routing header from the first
/// re-injected packet. Non-HTTP consumers echo the header back verbatim, so
/// it is located by substring rather than by header-line parsing.
#[derive(Default)]
pub struct RoutingStripHandler {
    removed: bool,
}

impl ProtoHandler for RoutingStripHandler {
    fn client_data(
        &mut self,
        bufs: &mut RelayBufs,
        _conn: &mut ConnState,
        _core: &ProxyCore,
    ) -> Verdict {
        if !self.removed {
            if let Some(pos) = find_subslice(&bufs.client_in, ROUTING_HEADER_KEY.as_bytes()) {
                if let Some(end) = find_subslice(&bufs.client_in[pos..], b"\r\n") {
                    let mut rest = bufs.client_in.split_off(pos);
                    let _header = rest.split_to(end + 2);
                    bufs.client_in.unsplit(rest);
                    self.removed = true;
                }
            }
        }
        bufs.to_server.extend_from_slice(&bufs.client_in);
        bufs.client_in.clear();
        Verdict::Continue
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
