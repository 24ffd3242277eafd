//! Connection lifecycle: accept, protocol engage, upstream connect, relay,
//! teardown.
//!
//! Every path funnels into [`relay::relay`]; what differs per protocol is
//! how the two legs are built (plain, TLS-terminated, or upgraded
//! mid-stream) and which handler rewrites the byte stream. TLS failures on
//! the upstream leg may fall back to passthrough while no handshake bytes
//! have reached the client; failures on the client leg are always fatal.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::BytesMut;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use super::autossl;
use super::child::{self, ChildUpstream};
use super::detect;
use super::http;
use super::relay::{self, AutosslHandler, HttpHandler, MailHandler, ProtoHandler, RelayEnd, TcpHandler};
use super::tls::{self, LeafResolver, TlsSetupError};
use super::{routing_header, BoxIo, ConnState, FilterOutcome, FilterPhase, LogEnables, ProxyCore};
use crate::config::Proto;
use crate::filter::SiteKind;
use crate::pcap::PcapCtx;

/// Entry point for one accepted connection; never returns an error to the
/// caller; everything ends in an orderly teardown. `atime` is the activity
/// clock shared with the worker's idle sweep.
pub async fn handle_connection(
    core: Arc<ProxyCore>,
    spec: crate::config::ProxySpec,
    stream: TcpStream,
    peer: SocketAddr,
    atime: Arc<std::sync::atomic::AtomicU64>,
) {
    let dst = match super::original_dst(&stream) {
        Ok(dst) => dst,
        Err(e) => match core.config.fallback_dst {
            Some(dst) => {
                debug!("no NAT state for {peer} ({e}), using fallback {dst}");
                dst
            }
            None => {
                warn!("no original destination for {peer}: {e}");
                core.stats.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        },
    };

    let logs = LogEnables {
        connect: true,
        master: core.master_log.is_some(),
        cert: false,
        content: core.config.capture_dir.is_some(),
        pcap: core.pcap.is_some(),
    };
    let capture = core.config.capture_dir.is_some();
    let mut conn = ConnState::new(&spec, peer, dst, capture, logs);
    conn.atime = atime;
    conn.touch();
    core.stats.conns.fetch_add(1, Ordering::Relaxed);
    info!(conn = conn.id, %peer, %dst, proto = %conn.proto, "new connection");

    let mut pcap_ctx = make_pcap_ctx(&core, &conn);

    // First filter pass on what is known before any protocol data: source,
    // destination address and port. Pass and block may be deferred here.
    let dst_ip = dst.ip().to_string();
    match conn.run_filter(
        &core.filter,
        &[(SiteKind::DstIp, &dst_ip)],
        FilterPhase::PreTls,
    ) {
        FilterOutcome::Terminate => {
            core.stats.blocked.fetch_add(1, Ordering::Relaxed);
            conn.finish(&core);
            return;
        }
        _ => {}
    }

    let result = match conn.proto {
        Proto::Https | Proto::Ssl | Proto::Pop3s | Proto::Smtps => {
            tls_path(&core, &spec, stream, &mut conn, &mut pcap_ctx).await
        }
        Proto::Http => http_path(&core, &spec, stream, &mut conn, &mut pcap_ctx).await,
        Proto::Tcp | Proto::Smtp | Proto::Pop3 | Proto::Passthrough => {
            plain_path(&core, &spec, stream, &mut conn, &mut pcap_ctx).await
        }
        Proto::Autossl => autossl_path(&core, stream, &mut conn, &mut pcap_ctx).await,
    };

    if let Err(e) = result {
        debug!(conn = conn.id, "connection ended: {e}");
        core.stats.errors.fetch_add(1, Ordering::Relaxed);
    }
    if let (Some(sink), Some(ctx)) = (&core.pcap, pcap_ctx.as_mut()) {
        if conn.logs.pcap {
            sink.log_close(ctx, crate::pcap::Direction::Request);
        }
    }
    conn.finish(&core);
}

fn make_pcap_ctx(core: &ProxyCore, conn: &ConnState) -> Option<PcapCtx> {
    if conn.logs.pcap {
        core.pcap
            .as_ref()
            .map(|sink| sink.conn_ctx(conn.src_addr, conn.dst_addr))
    } else {
        None
    }
}

fn handler_for(proto: Proto, routing: Option<String>) -> Box<dyn ProtoHandler> {
    match proto {
        Proto::Http | Proto::Https => Box::new(HttpHandler::new(false, routing)),
        Proto::Pop3 | Proto::Pop3s => Box::new(MailHandler::pop3(routing)),
        Proto::Smtp | Proto::Smtps => Box::new(MailHandler::smtp(routing)),
        _ => Box::new(TcpHandler { routing }),
    }
}

async fn connect_upstream(conn: &mut ConnState) -> std::io::Result<TcpStream> {
    conn.time_connect_start = super::now_micros();
    let stream = TcpStream::connect(conn.dst_addr).await?;
    conn.time_connect_end = super::now_micros();
    Ok(stream)
}

/// Wire the parent legs for relaying, setting up the child listener and the
/// consumer leg in divert mode.
async fn finish_and_relay(
    core: &Arc<ProxyCore>,
    spec: &crate::config::ProxySpec,
    conn: &mut ConnState,
    pcap_ctx: &mut Option<PcapCtx>,
    client: BoxIo,
    upstream: BoxIo,
    tls_terminated: bool,
    sni: Option<String>,
) -> std::io::Result<()> {
    conn.connected = true;

    if conn.divert {
        let Some(consumer_addr) = spec.divert_addr else {
            warn!(conn = conn.id, "divert mode without a consumer address, splitting");
            conn.divert = false;
            let mut handler = handler_for(conn.proto, None);
            relay::relay(client, upstream, handler.as_mut(), conn, core, pcap_ctx).await?;
            return Ok(());
        };

        let listener = child::setup(
            core.clone(),
            conn,
            ChildUpstream {
                inherited: Some(upstream),
                orig_dst: conn.dst_addr,
                tls_sni: sni,
                tls_upstream: tls_terminated,
                opts: conn.opts.clone(),
            },
        )
        .await?;

        let header = routing_header(
            listener.addr,
            conn.src_addr,
            conn.dst_addr,
            tls_terminated,
            None,
        );

        // The consumer leg gates client reads: only connect-success opens
        // the client side for relaying.
        let consumer = match TcpStream::connect(consumer_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(conn = conn.id, "consumer connect failed: {e}");
                listener.shutdown();
                return Err(e);
            }
        };

        let mut handler = handler_for(conn.proto, Some(header));
        let result = relay::relay(
            client,
            Box::new(consumer),
            handler.as_mut(),
            conn,
            core,
            pcap_ctx,
        )
        .await;
        // Children die before the parent finishes.
        listener.shutdown();
        result?;
        return Ok(());
    }

    let mut handler = handler_for(conn.proto, None);
    relay::relay(client, upstream, handler.as_mut(), conn, core, pcap_ctx).await?;
    Ok(())
}

/// Plain TCP-family path (tcp, smtp, pop3, passthrough).
async fn plain_path(
    core: &Arc<ProxyCore>,
    spec: &crate::config::ProxySpec,
    client: TcpStream,
    conn: &mut ConnState,
    pcap_ctx: &mut Option<PcapCtx>,
) -> std::io::Result<()> {
    let upstream = connect_upstream(conn).await?;
    finish_and_relay(
        core,
        spec,
        conn,
        pcap_ctx,
        Box::new(client),
        Box::new(upstream),
        false,
        None,
    )
    .await
}

/// HTTP path: CONNECT requests re-classify the connection as HTTPS after a
/// synthetic `200 Connection established`; anything else relays with header
/// rewriting.
async fn http_path(
    core: &Arc<ProxyCore>,
    spec: &crate::config::ProxySpec,
    mut client: TcpStream,
    conn: &mut ConnState,
    pcap_ctx: &mut Option<PcapCtx>,
) -> std::io::Result<()> {
    let mut peeked = [0u8; detect::PEEK_SIZE];
    let n = client.peek(&mut peeked).await?;
    let line_end = peeked[..n].iter().position(|&b| b == b'\n');
    let is_connect = line_end.is_some_and(|end| {
        let line = String::from_utf8_lossy(&peeked[..end]);
        line.split(' ').next().is_some_and(|m| m.eq_ignore_ascii_case("CONNECT"))
    });

    if is_connect {
        // Consume the tunnel envelope up to the blank line.
        let target = consume_connect_request(&mut client, conn).await?;
        client.write_all(http::CONNECT_ESTABLISHED).await?;
        if let Some(addr) = target {
            conn.dst_addr = addr;
            conn.summary.dst = addr.to_string();
        }
        conn.proto = Proto::Https;
        conn.summary.proto = "https".into();
        debug!(conn = conn.id, dst = %conn.dst_addr, "CONNECT tunnel established, engaging https");
        return tls_path(core, spec, client, conn, pcap_ctx).await;
    }

    let upstream = connect_upstream(conn).await?;
    finish_and_relay(
        core,
        spec,
        conn,
        pcap_ctx,
        Box::new(client),
        Box::new(upstream),
        false,
        None,
    )
    .await
}

/// Read the CONNECT request off the socket and resolve its authority when
/// the NAT gave no original destination worth keeping.
async fn consume_connect_request(
    client: &mut TcpStream,
    conn: &mut ConnState,
) -> std::io::Result<Option<SocketAddr>> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 8192 {
            break;
        }
        if client.read_buf(&mut buf).await? == 0 {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let authority = text
        .lines()
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .map(str::to_string);
    if let Some(authority) = authority {
        match tokio::net::lookup_host(authority.as_str()).await {
            Ok(mut addrs) => return Ok(addrs.next()),
            Err(e) => debug!(conn = conn.id, "cannot resolve CONNECT target {authority}: {e}"),
        }
    }
    Ok(None)
}

/// TLS-terminating path: peek the SNI, connect and handshake upstream,
/// filter on SNI/CN, forge the leaf, accept the client handshake, relay.
async fn tls_path(
    core: &Arc<ProxyCore>,
    spec: &crate::config::ProxySpec,
    client: TcpStream,
    conn: &mut ConnState,
    pcap_ctx: &mut Option<PcapCtx>,
) -> std::io::Result<()> {
    let sni = match tls::peek_sni(&client).await {
        Ok(sni) => sni,
        Err(TlsSetupError::NotTls) => {
            warn!(conn = conn.id, "expected a TLS client, dropping");
            conn.term = true;
            return Ok(());
        }
        Err(TlsSetupError::HelloTimeout) => {
            warn!(conn = conn.id, "truncated ClientHello never completed, aborting");
            conn.term = true;
            return Ok(());
        }
        Err(TlsSetupError::Io(e)) => return Err(e),
        Err(e) => {
            warn!(conn = conn.id, "SNI peek failed: {e}");
            conn.term = true;
            return Ok(());
        }
    };
    conn.summary.sni = sni.clone();
    debug!(conn = conn.id, sni = sni.as_deref().unwrap_or("n/a"), "SNI peek");

    let key_log = conn.logs.master.then(|| core.master_log.clone()).flatten();
    let upstream_tls = loop {
        let upstream_tcp = connect_upstream(conn).await?;
        match upstream_tls_handshake(conn, upstream_tcp, &sni, key_log.clone()).await {
            Ok(stream) => break stream,
            Err(e) => {
                conn.have_sslerr = true;
                // ReconnectSSL buys one fresh connection and handshake.
                if conn.opts.reconnect_ssl && !conn.reconnected {
                    warn!(conn = conn.id, "upstream TLS failed ({e}), reconnecting");
                    conn.reconnected = true;
                    continue;
                }
                // No TLS bytes have reached the client yet, so policy may
                // turn this into a passthrough instead of tearing down.
                let deferred_pass = conn.deferred_action == Some(super::DeferredAction::Pass);
                if !conn.enomem && (deferred_pass || conn.opts.passthrough) {
                    warn!(
                        conn = conn.id,
                        "upstream TLS failed ({e}), falling back to passthrough"
                    );
                    return engage_passthrough(core, Box::new(client), conn, pcap_ctx).await;
                }
                warn!(conn = conn.id, "upstream TLS handshake failed: {e}");
                conn.term = true;
                return Ok(());
            }
        }
    };

    let (_, upstream_conn) = upstream_tls.get_ref();
    conn.summary.dst_tls = tls::negotiated_info(upstream_conn);
    let orig_der: Option<Vec<u8>> = upstream_conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|c| c.as_ref().to_vec());
    if let Some(der) = &orig_der {
        conn.summary.orig_fingerprint = Some(crate::cert::fingerprint(der));
    }
    let orig_names = orig_der
        .as_deref()
        .and_then(|der| crate::cert::names_of(&rustls::pki_types::CertificateDer::from(der.to_vec())));

    // TLS-phase filter: SNI and the peer certificate's names are known now.
    // Deferred pass and block land here.
    let mut fields: Vec<(SiteKind, &str)> = Vec::new();
    if let Some(sni) = &sni {
        fields.push((SiteKind::Sni, sni));
    }
    if let Some(names) = &orig_names {
        fields.push((SiteKind::Cn, names));
    }
    match conn.run_filter(&core.filter, &fields, FilterPhase::Tls) {
        FilterOutcome::Terminate => {
            core.stats.blocked.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        FilterOutcome::EngagePassthrough => {
            return engage_passthrough(core, Box::new(client), conn, pcap_ctx).await;
        }
        FilterOutcome::None => {}
    }
    if conn.deferred_action == Some(super::DeferredAction::Pass) {
        conn.deferred_action = None;
        conn.pass = true;
        return engage_passthrough(core, Box::new(client), conn, pcap_ctx).await;
    }
    if conn.apply_deferred_block() {
        return Ok(());
    }

    let leaf = match core.certs.leaf_for(sni.as_deref(), orig_der.as_deref()) {
        Ok(Some(leaf)) => leaf,
        Ok(None) => {
            if conn.opts.passthrough {
                warn!(conn = conn.id, "no certificate material, falling back to passthrough");
                return engage_passthrough(core, Box::new(client), conn, pcap_ctx).await;
            }
            warn!(conn = conn.id, "no certificate material, terminating");
            conn.term = true;
            return Ok(());
        }
        Err(e) => {
            warn!(conn = conn.id, "leaf forging failed: {e}");
            conn.term = true;
            return Ok(());
        }
    };
    conn.summary.used_fingerprint = Some(leaf.fingerprint.clone());
    conn.summary.ssl_names = Some(leaf.names.clone());

    let accepted =
        client_tls_accept(core, conn, Box::new(client), leaf, orig_der, key_log).await;
    let client_tls = match accepted {
        Ok(stream) => stream,
        Err(e) => {
            // Client-side handshake failures are always fatal.
            warn!(conn = conn.id, "client TLS handshake failed: {e}");
            conn.term = true;
            return Ok(());
        }
    };

    finish_and_relay(
        core,
        spec,
        conn,
        pcap_ctx,
        client_tls,
        Box::new(upstream_tls),
        true,
        sni,
    )
    .await
}

async fn upstream_tls_handshake(
    conn: &mut ConnState,
    tcp: TcpStream,
    sni: &Option<String>,
    key_log: Option<Arc<crate::logging::MasterKeyLog>>,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TlsSetupError> {
    let config = tls::client_config(&conn.opts, key_log)?;
    let server_name = match sni {
        Some(name) => ServerName::try_from(name.clone())
            .unwrap_or_else(|_| ServerName::IpAddress(conn.dst_addr.ip().into())),
        None => ServerName::IpAddress(conn.dst_addr.ip().into()),
    };
    let connector = TlsConnector::from(Arc::new(config));
    Ok(connector.connect(server_name, tcp).await?)
}

async fn client_tls_accept(
    core: &Arc<ProxyCore>,
    conn: &mut ConnState,
    client: BoxIo,
    leaf: Arc<crate::cert::ForgedLeaf>,
    orig_der: Option<Vec<u8>>,
    key_log: Option<Arc<crate::logging::MasterKeyLog>>,
) -> Result<BoxIo, TlsSetupError> {
    let resolver = LeafResolver::new(
        core.certs.clone(),
        leaf,
        orig_der,
        conn.opts.allow_wrong_host,
    )?;
    let config = tls::server_config(resolver.clone(), &conn.opts, key_log)?;
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let stream = acceptor.accept(client).await?;

    let (_, server_conn) = stream.get_ref();
    conn.summary.src_tls = tls::negotiated_info(server_conn);
    // The resolver may have re-forged on SNI mismatch; log what was served.
    let served = resolver.current_leaf();
    conn.summary.used_fingerprint = Some(served.fingerprint.clone());
    conn.summary.ssl_names = Some(served.names.clone());
    Ok(Box::new(stream))
}

/// One-way switch to passthrough: drop all protocol state, reconnect the
/// original destination raw, and relay bytes untouched. The client-side
/// socket is left exactly as it was (any buffered TLS bytes flow to the
/// server, whose alert flows back).
async fn engage_passthrough(
    core: &Arc<ProxyCore>,
    client: BoxIo,
    conn: &mut ConnState,
    pcap_ctx: &mut Option<PcapCtx>,
) -> std::io::Result<()> {
    conn.proto = Proto::Passthrough;
    conn.summary.proto = "passthrough".into();
    conn.divert = false;
    conn.connected = false;
    debug!(conn = conn.id, "engaging passthrough");

    let upstream = connect_upstream(conn).await?;
    conn.connected = true;
    let mut handler = TcpHandler { routing: None };
    relay::relay(
        client,
        Box::new(upstream),
        &mut handler,
        conn,
        core,
        pcap_ctx,
    )
    .await?;
    Ok(())
}

/// Autossl path: relay in the clear while watching for a ClientHello, then
/// overlay TLS on both legs without closing them.
async fn autossl_path(
    core: &Arc<ProxyCore>,
    client: TcpStream,
    conn: &mut ConnState,
    pcap_ctx: &mut Option<PcapCtx>,
) -> std::io::Result<()> {
    let upstream = connect_upstream(conn).await?;
    conn.connected = true;

    let mut handler = AutosslHandler {
        searching: true,
        routing: None,
    };
    let end = relay::relay(
        Box::new(client),
        Box::new(upstream),
        &mut handler,
        conn,
        core,
        pcap_ctx,
    )
    .await?;

    match end {
        RelayEnd::Closed => Ok(()),
        RelayEnd::Upgrade {
            client,
            server,
            buffered,
        } => {
            if conn.divert {
                warn!(conn = conn.id, "no children set up yet, autossl protocol error");
                conn.term = true;
                return Ok(());
            }
            let legs = match autossl::upgrade(client, server, buffered, conn, core).await {
                Ok(legs) => legs,
                Err(e) => {
                    warn!(conn = conn.id, "autossl upgrade failed: {e}");
                    conn.term = true;
                    return Ok(());
                }
            };
            debug!(conn = conn.id, "autossl upgrade complete, resuming relay");
            let mut handler = AutosslHandler {
                searching: false,
                routing: None,
            };
            relay::relay(legs.client, legs.server, &mut handler, conn, core, pcap_ctx).await?;
            Ok(())
        }
    }
}
