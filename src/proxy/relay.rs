//! The relay loop.
//!
//! One loop owns both legs of a connection and moves bytes through
//! per-direction staging buffers. Reads pause when the opposite side's
//! staging buffer crosses the high watermark and resume once it drains
//! below half of it. Cross-direction effects (canned OCSP and protocol-error
//! replies, filter blocks, the autossl TLS upgrade) are decided by the
//! protocol handler while the loop enforces ordering and teardown.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::detect::{self, CommandValidator, HelloScan};
use super::http::{self, HttpState};
use super::{BoxIo, ConnState, FilterOutcome, FilterPhase, ProxyCore};
use crate::filter::SiteKind;
use crate::pcap::{Direction, PcapCtx};

/// Pause reading a side once the opposite staging buffer holds this much.
pub const OUTBUF_LIMIT: usize = 128 * 1024;
/// Resume reading once the staging buffer drains below this.
pub const OUTBUF_RESUME: usize = OUTBUF_LIMIT / 2;

/// Staging buffers shared between the loop and the protocol handler.
#[derive(Debug, Default)]
pub struct RelayBufs {
    /// Unprocessed bytes read from the client.
    pub client_in: BytesMut,
    /// Unprocessed bytes read from the server.
    pub server_in: BytesMut,
    /// Processed bytes awaiting write to the server.
    pub to_server: BytesMut,
    /// Processed bytes awaiting write to the client.
    pub to_client: BytesMut,
    /// Stop forwarding and reading; flush `to_client`, then terminate.
    /// Set for OCSP denials and protocol errors.
    pub abort_after_flush: bool,
}

impl RelayBufs {
    /// Enter the abort path: the upstream is starved, pending input is
    /// discarded, and only `to_client` (the canned reply) survives.
    pub fn starve_upstream(&mut self) {
        self.client_in.clear();
        self.server_in.clear();
        self.to_server.clear();
        self.abort_after_flush = true;
    }
}

/// Decision returned by a handler after consuming freshly read bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// A ClientHello appeared mid-stream; the caller must wrap both legs in
    /// TLS and re-enter the relay.
    UpgradeTls,
}

/// Per-protocol byte processing plugged into the relay loop.
pub trait ProtoHandler: Send {
    fn client_data(&mut self, bufs: &mut RelayBufs, conn: &mut ConnState, core: &ProxyCore)
        -> Verdict;

    fn server_data(
        &mut self,
        bufs: &mut RelayBufs,
        conn: &mut ConnState,
        core: &ProxyCore,
    ) -> Verdict {
        let _ = (conn, core);
        bufs.to_client.extend_from_slice(&bufs.server_in);
        bufs.server_in.clear();
        Verdict::Continue
    }
}

/// Prepend the routing header to the first forwarded client packet, for
/// protocols that do not rewrite header lines themselves.
fn prepend_routing(bufs: &mut RelayBufs, conn: &mut ConnState, routing: &Option<String>) {
    if conn.divert && !conn.sent_routing_header && !bufs.client_in.is_empty() {
        if let Some(header) = routing {
            bufs.to_server.extend_from_slice(header.as_bytes());
            bufs.to_server.extend_from_slice(b"\r\n");
            conn.sent_routing_header = true;
        }
    }
}

/// Opaque TCP relay; also serves passthrough.
pub struct TcpHandler {
    pub routing: Option<String>,
}

impl ProtoHandler for TcpHandler {
    fn client_data(
        &mut self,
        bufs: &mut RelayBufs,
        conn: &mut ConnState,
        _core: &ProxyCore,
    ) -> Verdict {
        if conn.apply_deferred_block() {
            return Verdict::Continue;
        }
        prepend_routing(bufs, conn, &self.routing);
        bufs.to_server.extend_from_slice(&bufs.client_in);
        bufs.client_in.clear();
        Verdict::Continue
    }
}

/// HTTP(S) relay: incremental header rewriting, late filtering, OCSP denial
/// and protocol validation.
pub struct HttpHandler {
    pub state: HttpState,
    pub is_child: bool,
    pub routing: Option<String>,
}

impl HttpHandler {
    pub fn new(is_child: bool, routing: Option<String>) -> Self {
        HttpHandler {
            state: HttpState::default(),
            is_child,
            routing,
        }
    }

    fn on_request_header_complete(
        &mut self,
        bufs: &mut RelayBufs,
        conn: &mut ConnState,
        core: &ProxyCore,
    ) {
        conn.summary.method = self.state.method.clone();
        conn.summary.uri = self.state.uri.clone();
        conn.summary.host = self.state.host.clone();

        if !self.is_child {
            let mut fields: Vec<(SiteKind, &str)> = Vec::new();
            if let Some(host) = &self.state.host {
                fields.push((SiteKind::Host, host));
            }
            if let Some(uri) = &self.state.uri {
                fields.push((SiteKind::Uri, uri));
            }
            if !fields.is_empty()
                && conn.run_filter(&core.filter, &fields, FilterPhase::HttpHeader)
                    == FilterOutcome::Terminate
            {
                core.stats
                    .blocked
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return;
            }
            // A block deferred earlier cannot wait past this point.
            if conn.apply_deferred_block() {
                return;
            }

            if conn.opts.deny_ocsp && http::is_ocsp_request(&self.state) && !self.state.ocsp_denied
            {
                debug!(conn = conn.id, "sending OCSP denied response");
                bufs.starve_upstream();
                bufs.to_client.extend_from_slice(http::OCSP_DENIED_RESPONSE);
                self.state.ocsp_denied = true;
                conn.summary.ocsp_denied = true;
            }
        }
    }
}

impl ProtoHandler for HttpHandler {
    fn client_data(
        &mut self,
        bufs: &mut RelayBufs,
        conn: &mut ConnState,
        core: &ProxyCore,
    ) -> Verdict {
        if conn.apply_deferred_block() {
            return Verdict::Continue;
        }
        if self.state.ocsp_denied {
            bufs.client_in.clear();
            return Verdict::Continue;
        }
        if conn.opts.validate_proto && !self.state.is_valid {
            self.state.seen_bytes += bufs.client_in.len() as u64;
        }

        let header_seen_on_entry = self.state.seen_req_header;
        if !self.state.seen_req_header {
            let inject = !self.is_child && conn.divert && !conn.sent_routing_header;
            let routing = if inject { self.routing.as_deref() } else { None };
            if http::scan_request(
                &mut bufs.client_in,
                &mut bufs.to_server,
                &mut self.state,
                self.is_child,
                &conn.opts,
                routing,
            ) {
                conn.sent_routing_header = true;
            }
        } else {
            bufs.to_server.extend_from_slice(&bufs.client_in);
            bufs.client_in.clear();
        }

        if !header_seen_on_entry && self.state.seen_req_header {
            self.on_request_header_complete(bufs, conn, core);
            if conn.term {
                return Verdict::Continue;
            }
        }

        if conn.opts.validate_proto
            && !self.state.is_valid
            && http::validate(&mut self.state, conn.opts.max_http_header_size).is_err()
        {
            debug!(conn = conn.id, "protocol validation failed, sending 400");
            bufs.starve_upstream();
            bufs.to_client.extend_from_slice(http::PROTO_ERROR_RESPONSE);
            conn.sent_protoerror_msg = true;
        }
        Verdict::Continue
    }

    fn server_data(
        &mut self,
        bufs: &mut RelayBufs,
        conn: &mut ConnState,
        _core: &ProxyCore,
    ) -> Verdict {
        if self.state.ocsp_denied {
            bufs.server_in.clear();
            return Verdict::Continue;
        }
        let header_seen_on_entry = self.state.seen_resp_header;
        if !self.state.seen_resp_header {
            http::scan_response(&mut bufs.server_in, &mut bufs.to_client, &mut self.state);
        } else {
            bufs.to_client.extend_from_slice(&bufs.server_in);
            bufs.server_in.clear();
        }
        if !header_seen_on_entry && self.state.seen_resp_header {
            conn.summary.status_code = self.state.status_code.clone();
            conn.summary.content_length = self.state.content_length.clone();
        }
        Verdict::Continue
    }
}

/// POP3/SMTP relay with command validation. SMTP also validates upstream
/// responses while the greeting is relayed, before the client has spoken.
pub struct MailHandler {
    pub validator: CommandValidator,
    pub smtp: bool,
    pub routing: Option<String>,
    client_spoke: bool,
}

impl MailHandler {
    pub fn pop3(routing: Option<String>) -> Self {
        MailHandler {
            validator: CommandValidator::pop3(),
            smtp: false,
            routing,
            client_spoke: false,
        }
    }

    pub fn smtp(routing: Option<String>) -> Self {
        MailHandler {
            validator: CommandValidator::smtp(),
            smtp: true,
            routing,
            client_spoke: false,
        }
    }

    fn proto_error(&self, bufs: &mut RelayBufs, conn: &mut ConnState) {
        bufs.starve_upstream();
        bufs.to_client.extend_from_slice(http::PROTO_ERROR_RESPONSE);
        conn.sent_protoerror_msg = true;
    }
}

impl ProtoHandler for MailHandler {
    fn client_data(
        &mut self,
        bufs: &mut RelayBufs,
        conn: &mut ConnState,
        _core: &ProxyCore,
    ) -> Verdict {
        if conn.apply_deferred_block() {
            return Verdict::Continue;
        }
        self.client_spoke = true;
        if conn.opts.validate_proto
            && !self.validator.is_valid
            && self.validator.validate(&bufs.client_in).is_err()
        {
            debug!(conn = conn.id, "mail command validation failed");
            self.proto_error(bufs, conn);
            return Verdict::Continue;
        }
        prepend_routing(bufs, conn, &self.routing);
        bufs.to_server.extend_from_slice(&bufs.client_in);
        bufs.client_in.clear();
        Verdict::Continue
    }

    fn server_data(
        &mut self,
        bufs: &mut RelayBufs,
        conn: &mut ConnState,
        _core: &ProxyCore,
    ) -> Verdict {
        if self.smtp
            && conn.opts.validate_proto
            && !self.client_spoke
            && !detect::valid_smtp_response(&bufs.server_in)
        {
            debug!(conn = conn.id, "smtp response validation failed");
            self.proto_error(bufs, conn);
            return Verdict::Continue;
        }
        bufs.to_client.extend_from_slice(&bufs.server_in);
        bufs.server_in.clear();
        Verdict::Continue
    }
}

/// Plain relay that watches every client read for a TLS ClientHello. On a
/// hit the buffered bytes are left in place and the loop returns them to the
/// caller for the TLS overlay.
pub struct AutosslHandler {
    pub searching: bool,
    pub routing: Option<String>,
}

impl ProtoHandler for AutosslHandler {
    fn client_data(
        &mut self,
        bufs: &mut RelayBufs,
        conn: &mut ConnState,
        _core: &ProxyCore,
    ) -> Verdict {
        if conn.apply_deferred_block() {
            return Verdict::Continue;
        }
        if self.searching {
            let window = bufs.client_in.len().min(detect::PEEK_SIZE);
            if let HelloScan::Hello { .. } = detect::parse_client_hello(&bufs.client_in[..window])
            {
                debug!(conn = conn.id, "peek found ClientHello, upgrading");
                self.searching = false;
                return Verdict::UpgradeTls;
            }
            trace!(conn = conn.id, "peek found no ClientHello");
        }
        prepend_routing(bufs, conn, &self.routing);
        bufs.to_server.extend_from_slice(&bufs.client_in);
        bufs.client_in.clear();
        Verdict::Continue
    }
}

/// How a relay ended.
pub enum RelayEnd {
    Closed,
    /// Autossl found a ClientHello: both legs handed back, with the client
    /// bytes (the hello) that must be replayed into the TLS acceptor.
    Upgrade {
        client: BoxIo,
        server: BoxIo,
        buffered: BytesMut,
    },
}

/// Pump bytes between the two legs until EOF on both, termination, or a
/// protocol upgrade.
pub async fn relay(
    client: BoxIo,
    server: BoxIo,
    handler: &mut dyn ProtoHandler,
    conn: &mut ConnState,
    core: &ProxyCore,
    pcap_ctx: &mut Option<PcapCtx>,
) -> std::io::Result<RelayEnd> {
    debug_assert!(conn.connected, "relay entered before connect completed");

    let (mut cr, mut cw) = tokio::io::split(client);
    let (mut sr, mut sw) = tokio::io::split(server);
    let mut bufs = RelayBufs::default();

    let mut client_eof = false;
    let mut server_eof = false;
    let mut client_shut = false;
    let mut server_shut = false;
    let mut paused_c2s = false;
    let mut paused_s2c = false;

    loop {
        if conn.term {
            break;
        }
        if bufs.abort_after_flush && bufs.to_client.is_empty() {
            conn.term = true;
            break;
        }

        let read_client = !client_eof
            && !bufs.abort_after_flush
            && !paused_c2s
            && bufs.client_in.len() < OUTBUF_LIMIT;
        let read_server = !server_eof
            && !bufs.abort_after_flush
            && !paused_s2c
            && bufs.server_in.len() < OUTBUF_LIMIT;

        tokio::select! {
            biased;

            res = sw.write_buf(&mut bufs.to_server), if !bufs.to_server.is_empty() && !server_shut => {
                match res {
                    Ok(_) => {
                        conn.time_last_sent = super::now_micros();
                        if conn.time_first_sent == 0 {
                            conn.time_first_sent = conn.time_last_sent;
                        }
                        if paused_c2s && bufs.to_server.len() <= OUTBUF_RESUME {
                            paused_c2s = false;
                        }
                    }
                    Err(e) => {
                        debug!(conn = conn.id, "server write error: {e}");
                        conn.term = true;
                    }
                }
            }

            res = cw.write_buf(&mut bufs.to_client), if !bufs.to_client.is_empty() && !client_shut => {
                match res {
                    Ok(_) => {
                        if paused_s2c && bufs.to_client.len() <= OUTBUF_RESUME {
                            paused_s2c = false;
                        }
                    }
                    Err(e) => {
                        debug!(conn = conn.id, "client write error: {e}");
                        conn.term = true;
                    }
                }
            }

            res = cr.read_buf(&mut bufs.client_in), if read_client => {
                match res {
                    Ok(0) => client_eof = true,
                    Ok(n) => {
                        conn.touch();
                        conn.bytes_out += n as u64;
                        observe(conn, core, pcap_ctx, Direction::Request, &bufs.client_in, n);
                        match handler.client_data(&mut bufs, conn, core) {
                            Verdict::Continue => {}
                            Verdict::UpgradeTls => {
                                // Flush queued plaintext on both sides before
                                // the TLS overlay takes the sockets.
                                while !bufs.to_server.is_empty() {
                                    sw.write_buf(&mut bufs.to_server).await?;
                                }
                                while !bufs.to_client.is_empty() {
                                    cw.write_buf(&mut bufs.to_client).await?;
                                }
                                let client = cr.unsplit(cw);
                                let server = sr.unsplit(sw);
                                let buffered = std::mem::take(&mut bufs.client_in);
                                return Ok(RelayEnd::Upgrade { client, server, buffered });
                            }
                        }
                        if bufs.to_server.len() >= OUTBUF_LIMIT {
                            paused_c2s = true;
                        }
                    }
                    Err(e) => {
                        debug!(conn = conn.id, "client read error: {e}");
                        client_eof = true;
                    }
                }
            }

            res = sr.read_buf(&mut bufs.server_in), if read_server => {
                match res {
                    Ok(0) => server_eof = true,
                    Ok(n) => {
                        conn.touch();
                        conn.bytes_in += n as u64;
                        conn.time_last_recv = super::now_micros();
                        if conn.time_first_recv == 0 {
                            conn.time_first_recv = conn.time_last_recv;
                        }
                        observe(conn, core, pcap_ctx, Direction::Response, &bufs.server_in, n);
                        let _ = handler.server_data(&mut bufs, conn, core);
                        if bufs.to_client.len() >= OUTBUF_LIMIT {
                            paused_s2c = true;
                        }
                    }
                    Err(e) => {
                        debug!(conn = conn.id, "server read error: {e}");
                        server_eof = true;
                    }
                }
            }

            else => break,
        }

        // Half-close handling: once a side hits EOF and its forwarded bytes
        // are flushed, shut down the opposite write side.
        if client_eof && bufs.to_server.is_empty() && !server_shut {
            let _ = sw.shutdown().await;
            server_shut = true;
        }
        if server_eof && bufs.to_client.is_empty() && !client_shut {
            let _ = cw.shutdown().await;
            client_shut = true;
        }
        if client_shut && server_shut {
            break;
        }
    }

    if !client_shut {
        let _ = cw.shutdown().await;
    }
    if !server_shut {
        let _ = sw.shutdown().await;
    }
    Ok(RelayEnd::Closed)
}

/// Content and pcap logging for one freshly read chunk (the last `n` bytes
/// of `buf`).
fn observe(
    conn: &mut ConnState,
    core: &ProxyCore,
    pcap_ctx: &mut Option<PcapCtx>,
    direction: Direction,
    buf: &BytesMut,
    n: usize,
) {
    let chunk = &buf[buf.len() - n..];
    if conn.logs.content {
        if let Some(capture) = &mut conn.capture {
            capture.record(direction, chunk);
        }
    }
    if conn.logs.pcap {
        if let (Some(sink), Some(ctx)) = (&core.pcap, pcap_ctx.as_mut()) {
            sink.log_payload(ctx, direction, chunk);
        }
    }
}
