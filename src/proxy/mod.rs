//! Per-connection proxy engine.
//!
//! Each accepted connection runs as one task on its owning worker: original
//! destination lookup, protocol selection, filter evaluation, TLS forging,
//! then the relay loop. Errors never escape a connection; they set flags on
//! its state and the task unwinds through an orderly teardown.

pub mod autossl;
pub mod child;
pub mod conn;
pub mod detect;
pub mod http;
pub mod relay;
pub mod tls;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::{Config, ConnOpts, Proto, ProxySpec};
use crate::filter::{FilterAction, FilterTree, LogToggle, SiteKind, Verb};
use crate::logging::{ConnSummary, ConnectLog, ContentCapture, MasterKeyLog, PcapSink};

/// Socket stream trait object used throughout the engine, so plain TCP and
/// TLS legs flow through the same relay.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxIo = Box<dyn Io>;

/// Process-wide counters, shared across workers.
#[derive(Debug, Default)]
pub struct Stats {
    pub conns: AtomicU64,
    pub errors: AtomicU64,
    pub refused: AtomicU64,
    pub blocked: AtomicU64,
    pub expired: AtomicU64,
}

/// Everything a connection needs that outlives it: configuration, the
/// certificate store, the compiled filter tree and the log sinks.
pub struct ProxyCore {
    pub config: Arc<Config>,
    pub certs: Arc<crate::cert::CertStore>,
    pub filter: Arc<FilterTree>,
    pub connect_log: Option<Arc<ConnectLog>>,
    pub pcap: Option<Arc<PcapSink>>,
    pub master_log: Option<Arc<MasterKeyLog>>,
    pub stats: Arc<Stats>,
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// A filter decision postponed until more protocol data is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredAction {
    Pass,
    Block,
}

/// Phase a filter action is applied in; later phases restrict which verbs
/// may still take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPhase {
    /// Before any TLS handshake: pass and block may be deferred.
    PreTls,
    /// At TLS accept time: everything applies immediately.
    Tls,
    /// After an HTTP request header: only block (and log downgrades) apply.
    HttpHeader,
}

/// What the engine must do after applying a filter action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    None,
    EngagePassthrough,
    Terminate,
}

/// Per-connection log enables.
#[derive(Debug, Clone, Copy)]
pub struct LogEnables {
    pub connect: bool,
    pub master: bool,
    pub cert: bool,
    pub content: bool,
    pub pcap: bool,
}

/// Mutable per-connection engine state, threaded through every phase.
pub struct ConnState {
    pub id: u64,
    pub proto: Proto,
    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,
    pub opts: Arc<ConnOpts>,

    pub divert: bool,
    pub pass: bool,
    pub term: bool,
    /// Termination was requested by policy rather than by stream EOF.
    pub term_requestor: bool,
    pub enomem: bool,
    pub filter_precedence: u32,
    pub deferred_action: Option<DeferredAction>,

    pub connected: bool,
    pub sent_routing_header: bool,
    pub sent_protoerror_msg: bool,
    /// An upstream TLS handshake failed at least once.
    pub have_sslerr: bool,
    /// The one `ReconnectSSL` retry has been spent.
    pub reconnected: bool,

    pub logs: LogEnables,

    pub time_accept: u64,
    pub time_connect_start: u64,
    pub time_connect_end: u64,
    pub time_first_sent: u64,
    pub time_last_sent: u64,
    pub time_first_recv: u64,
    pub time_last_recv: u64,
    pub time_close: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Activity clock for the idle sweep, shared with the worker registry.
    pub atime: Arc<AtomicU64>,

    pub summary: ConnSummary,
    pub capture: Option<ContentCapture>,
}

impl ConnState {
    pub fn new(
        spec: &ProxySpec,
        src_addr: SocketAddr,
        dst_addr: SocketAddr,
        capture_enabled: bool,
        logs: LogEnables,
    ) -> Self {
        let mut summary = ConnSummary::default();
        summary.proto = spec.proto.as_str().to_string();
        summary.src = src_addr.to_string();
        summary.dst = dst_addr.to_string();
        ConnState {
            id: next_conn_id(),
            proto: spec.proto,
            src_addr,
            dst_addr,
            opts: spec.opts.clone(),
            divert: spec.divert,
            pass: false,
            term: false,
            term_requestor: false,
            enomem: false,
            filter_precedence: 0,
            deferred_action: None,
            connected: false,
            sent_routing_header: false,
            sent_protoerror_msg: false,
            have_sslerr: false,
            reconnected: false,
            logs,
            time_accept: now_micros(),
            time_connect_start: 0,
            time_connect_end: 0,
            time_first_sent: 0,
            time_last_sent: 0,
            time_first_recv: 0,
            time_last_recv: 0,
            time_close: 0,
            bytes_in: 0,
            bytes_out: 0,
            atime: Arc::new(AtomicU64::new(now_micros())),
            summary,
            capture: capture_enabled.then(ContentCapture::default),
        }
    }

    /// State for a child connection accepted on the parent's ephemeral
    /// listener. Children never divert again and inherit the parent's
    /// options and log enables.
    pub fn for_child(
        parent: &ConnState,
        src_addr: SocketAddr,
        capture_enabled: bool,
    ) -> Self {
        let mut state = ConnState {
            id: next_conn_id(),
            proto: parent.proto,
            src_addr,
            dst_addr: parent.dst_addr,
            opts: parent.opts.clone(),
            divert: false,
            pass: false,
            term: false,
            term_requestor: false,
            enomem: false,
            filter_precedence: parent.filter_precedence,
            deferred_action: None,
            connected: false,
            sent_routing_header: false,
            sent_protoerror_msg: false,
            have_sslerr: false,
            reconnected: false,
            logs: parent.logs,
            time_accept: now_micros(),
            time_connect_start: 0,
            time_connect_end: 0,
            time_first_sent: 0,
            time_last_sent: 0,
            time_first_recv: 0,
            time_last_recv: 0,
            time_close: 0,
            bytes_in: 0,
            bytes_out: 0,
            atime: parent.atime.clone(),
            summary: ConnSummary::default(),
            capture: capture_enabled.then(ContentCapture::default),
        };
        state.summary.proto = parent.summary.proto.clone();
        state.summary.src = src_addr.to_string();
        state.summary.dst = parent.summary.dst.clone();
        state
    }

    pub fn touch(&self) {
        self.atime.store(now_micros(), Ordering::Relaxed);
    }

    /// Apply a deferred block if one is pending. Returns true when the
    /// connection must terminate.
    pub fn apply_deferred_block(&mut self) -> bool {
        if self.deferred_action == Some(DeferredAction::Block) {
            debug!(conn = self.id, "applying deferred block action");
            self.deferred_action = None;
            self.term = true;
            self.term_requestor = true;
            return true;
        }
        false
    }

    /// Evaluate the filter tree for this connection at the given phase and
    /// apply the winning action.
    pub fn run_filter(
        &mut self,
        tree: &FilterTree,
        fields: &[(SiteKind, &str)],
        phase: FilterPhase,
    ) -> FilterOutcome {
        let src_ip = self.src_addr.ip().to_string();
        let dst_port = self.dst_addr.port().to_string();
        let action = tree.lookup(&src_ip, &dst_port, fields, self.filter_precedence);
        match action {
            Some(action) => self.apply_filter_action(action, phase),
            None => FilterOutcome::None,
        }
    }

    /// Translate one winning filter action into connection state, honoring
    /// the phase's deferral rules. The applied precedence only ever rises.
    pub fn apply_filter_action(
        &mut self,
        action: FilterAction,
        phase: FilterPhase,
    ) -> FilterOutcome {
        self.filter_precedence = self.filter_precedence.max(action.precedence);
        let mut outcome = FilterOutcome::None;

        match action.verb {
            Verb::Divert => {
                if phase == FilterPhase::HttpHeader {
                    if self.divert {
                        // Already diverting; just drop any deferred block.
                        self.deferred_action = None;
                    } else {
                        debug!(conn = self.id, "http filter cannot enable divert mode");
                    }
                } else {
                    self.deferred_action = None;
                    self.divert = true;
                }
            }
            Verb::Split => {
                if phase == FilterPhase::HttpHeader {
                    if !self.divert {
                        self.deferred_action = None;
                    } else {
                        debug!(conn = self.id, "http filter cannot enable split mode");
                    }
                } else {
                    self.deferred_action = None;
                    self.divert = false;
                }
            }
            Verb::Pass => match phase {
                FilterPhase::PreTls => {
                    debug!(conn = self.id, "deferring pass action");
                    self.deferred_action = Some(DeferredAction::Pass);
                }
                FilterPhase::Tls => {
                    if !self.pass {
                        self.deferred_action = None;
                        self.pass = true;
                        outcome = FilterOutcome::EngagePassthrough;
                    }
                }
                FilterPhase::HttpHeader => {
                    debug!(conn = self.id, "http filter cannot take pass action");
                }
            },
            Verb::Block => match phase {
                FilterPhase::PreTls => {
                    // A block at this precedence overrides any deferred pass.
                    debug!(conn = self.id, "deferring block action");
                    self.deferred_action = Some(DeferredAction::Block);
                }
                _ => {
                    self.deferred_action = None;
                    self.term = true;
                    self.term_requestor = true;
                    outcome = FilterOutcome::Terminate;
                }
            },
            Verb::Match => {
                // Log toggles only; a match never clears a deferred action.
            }
        }

        self.apply_log_toggles(&action, phase);

        if let Some(opts) = action.conn_opts {
            self.opts = opts;
        }
        outcome
    }

    fn apply_log_toggles(&mut self, action: &FilterAction, phase: FilterPhase) {
        fn apply(flag: &mut bool, toggle: LogToggle, may_enable: bool, conn: u64) {
            match toggle {
                LogToggle::Keep => {}
                LogToggle::Disable => *flag = false,
                LogToggle::Enable => {
                    if may_enable {
                        *flag = true;
                    } else {
                        debug!(conn, "http filter cannot enable content or pcap logging");
                    }
                }
            }
        }
        // Content and pcap logging can only be lowered once headers flowed.
        let early = phase != FilterPhase::HttpHeader;
        apply(&mut self.logs.connect, action.log.connect, true, self.id);
        apply(&mut self.logs.master, action.log.master, true, self.id);
        apply(&mut self.logs.cert, action.log.cert, true, self.id);
        apply(&mut self.logs.content, action.log.content, early, self.id);
        apply(&mut self.logs.pcap, action.log.pcap, early, self.id);
    }

    /// Record close time and emit the connect log line.
    pub fn finish(&mut self, core: &ProxyCore) {
        self.time_close = now_micros();
        if self.logs.connect {
            if let Some(log) = &core.connect_log {
                log.log(&self.summary);
            } else {
                info!("{}", self.summary.line());
            }
        }
        if self.logs.content {
            if let (Some(capture), Some(dir)) = (&self.capture, &core.config.capture_dir) {
                capture.save(dir, self.id, &self.summary);
            }
        }
    }
}

/// The routing header line injected once per divert-mode connection.
///
/// Shape: `Tlstap: [child-ip]:port,[src-ip]:port,[dst-ip]:port,<s|p>[,user]`.
pub fn routing_header(
    child_addr: SocketAddr,
    src: SocketAddr,
    dst: SocketAddr,
    tls_terminated: bool,
    user: Option<&str>,
) -> String {
    let mode = if tls_terminated { 's' } else { 'p' };
    let mut header = format!(
        "{} [{}]:{},[{}]:{},[{}]:{},{}",
        http::ROUTING_HEADER_KEY,
        child_addr.ip(),
        child_addr.port(),
        src.ip(),
        src.port(),
        dst.ip(),
        dst.port(),
        mode,
    );
    if let Some(user) = user {
        header.push(',');
        header.push_str(user);
    }
    header
}

/// Original destination of a redirected connection (`SO_ORIGINAL_DST`).
#[cfg(target_os = "linux")]
pub fn original_dst(stream: &TcpStream) -> std::io::Result<SocketAddr> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    const SO_ORIGINAL_DST: libc::c_int = 80;

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len: libc::socklen_t = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddr::new(std::net::IpAddr::V4(ip), port))
}

#[cfg(not(target_os = "linux"))]
pub fn original_dst(_stream: &TcpStream) -> std::io::Result<SocketAddr> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "transparent interception requires SO_ORIGINAL_DST",
    ))
}

/// Check file-descriptor headroom before accepting: refuse when fewer than
/// the reserve remain.
pub fn fd_headroom_ok(active_conns: u64) -> bool {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if ret != 0 {
        warn!("getrlimit failed: {}", std::io::Error::last_os_error());
        return true;
    }
    // Each connection holds a handful of descriptors; estimate four per conn
    // plus a static floor for listeners and log files.
    let estimated = active_conns.saturating_mul(4).saturating_add(32);
    estimated + crate::config::FD_RESERVE < limit.rlim_cur
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::LogActions;

    fn state() -> ConnState {
        let spec = ProxySpec {
            proto: Proto::Https,
            listen: "127.0.0.1:8443".parse().unwrap(),
            divert: false,
            divert_addr: None,
            opts: Arc::new(ConnOpts::default()),
        };
        ConnState::new(
            &spec,
            "10.0.0.1:40000".parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
            false,
            LogEnables {
                connect: true,
                master: false,
                cert: false,
                content: false,
                pcap: false,
            },
        )
    }

    fn action(verb: Verb, precedence: u32) -> FilterAction {
        FilterAction {
            verb,
            log: LogActions::default(),
            conn_opts: None,
            precedence,
        }
    }

    #[test]
    fn test_pass_and_block_defer_pre_tls() {
        let mut s = state();
        assert_eq!(
            s.apply_filter_action(action(Verb::Pass, 1), FilterPhase::PreTls),
            FilterOutcome::None
        );
        assert_eq!(s.deferred_action, Some(DeferredAction::Pass));

        // A higher-precedence block overrides the deferred pass.
        assert_eq!(
            s.apply_filter_action(action(Verb::Block, 2), FilterPhase::PreTls),
            FilterOutcome::None
        );
        assert_eq!(s.deferred_action, Some(DeferredAction::Block));

        // A later match action must not clear the deferred block.
        s.apply_filter_action(action(Verb::Match, 3), FilterPhase::PreTls);
        assert_eq!(s.deferred_action, Some(DeferredAction::Block));

        assert!(s.apply_deferred_block());
        assert!(s.term);
        assert!(s.term_requestor);
    }

    #[test]
    fn test_pass_applies_at_tls_phase() {
        let mut s = state();
        assert_eq!(
            s.apply_filter_action(action(Verb::Pass, 1), FilterPhase::Tls),
            FilterOutcome::EngagePassthrough
        );
        assert!(s.pass);

        // A second pass while already passing is a no-op.
        assert_eq!(
            s.apply_filter_action(action(Verb::Pass, 2), FilterPhase::Tls),
            FilterOutcome::None
        );
    }

    #[test]
    fn test_block_terminates_immediately_at_tls() {
        let mut s = state();
        assert_eq!(
            s.apply_filter_action(action(Verb::Block, 1), FilterPhase::Tls),
            FilterOutcome::Terminate
        );
        assert!(s.term);
    }

    #[test]
    fn test_http_phase_restrictions() {
        let mut s = state();
        // Pass is ignored at the HTTP phase.
        assert_eq!(
            s.apply_filter_action(action(Verb::Pass, 1), FilterPhase::HttpHeader),
            FilterOutcome::None
        );
        assert!(!s.pass);

        // Divert cannot be enabled this late.
        assert_eq!(
            s.apply_filter_action(action(Verb::Divert, 2), FilterPhase::HttpHeader),
            FilterOutcome::None
        );
        assert!(!s.divert);

        // Block still applies.
        assert_eq!(
            s.apply_filter_action(action(Verb::Block, 3), FilterPhase::HttpHeader),
            FilterOutcome::Terminate
        );
    }

    #[test]
    fn test_content_log_cannot_be_enabled_at_http_phase() {
        let mut s = state();
        let mut a = action(Verb::Match, 1);
        a.log.content = LogToggle::Enable;
        a.log.connect = LogToggle::Enable;
        s.logs.content = false;
        s.logs.connect = false;
        s.apply_filter_action(a, FilterPhase::HttpHeader);
        assert!(!s.logs.content, "content log must not be enabled late");
        assert!(s.logs.connect, "connect log may be toggled late");

        let mut a = action(Verb::Match, 2);
        a.log.content = LogToggle::Disable;
        s.logs.content = true;
        s.apply_filter_action(a, FilterPhase::HttpHeader);
        assert!(!s.logs.content, "content log can always be disabled");
    }

    #[test]
    fn test_precedence_is_monotone() {
        let mut s = state();
        s.apply_filter_action(action(Verb::Match, 5), FilterPhase::PreTls);
        assert_eq!(s.filter_precedence, 5);
        s.apply_filter_action(action(Verb::Match, 3), FilterPhase::PreTls);
        assert_eq!(s.filter_precedence, 5);
    }

    #[test]
    fn test_conn_opts_override_replaces_options() {
        let mut s = state();
        let mut custom = ConnOpts::default();
        custom.deny_ocsp = true;
        let mut a = action(Verb::Match, 1);
        a.conn_opts = Some(Arc::new(custom));
        s.apply_filter_action(a, FilterPhase::PreTls);
        assert!(s.opts.deny_ocsp);
    }

    #[test]
    fn test_routing_header_shape() {
        let header = routing_header(
            "127.0.0.1:34567".parse().unwrap(),
            "10.0.0.1:40000".parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
            true,
            None,
        );
        assert_eq!(
            header,
            "Tlstap: [127.0.0.1]:34567,[10.0.0.1]:40000,[93.184.216.34]:443,s"
        );

        let header = routing_header(
            "127.0.0.1:34567".parse().unwrap(),
            "10.0.0.1:40000".parse().unwrap(),
            "93.184.216.34:80".parse().unwrap(),
            false,
            Some("alice"),
        );
        assert!(header.ends_with(",p,alice"));
    }
}
