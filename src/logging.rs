//! Forensic log sinks: connect log, content capture, TLS master secrets and
//! the shared PCAP output.
//!
//! Every sink degrades gracefully: a write failure logs one warning and
//! disables that sink for the remainder of the connection, never the whole
//! process.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rustls::KeyLog;
use tracing::warn;

use crate::pcap::{self, Direction, PcapCtx};

/// Locally-administered MACs used in fabricated frames; the relay never sees
/// real link-layer addresses.
pub const CLIENT_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
pub const SERVER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

/// Everything the connect log needs about one finished connection.
#[derive(Debug, Default, Clone)]
pub struct ConnSummary {
    pub proto: String,
    pub src: String,
    pub dst: String,
    pub host: Option<String>,
    pub method: Option<String>,
    pub uri: Option<String>,
    pub status_code: Option<String>,
    pub content_length: Option<String>,
    pub sni: Option<String>,
    pub ssl_names: Option<String>,
    pub src_tls: Option<String>,
    pub dst_tls: Option<String>,
    pub orig_fingerprint: Option<String>,
    pub used_fingerprint: Option<String>,
    pub ocsp_denied: bool,
}

fn dash(v: &Option<String>) -> &str {
    v.as_deref().unwrap_or("-")
}

impl ConnSummary {
    /// One connect-log line. TLS connections carry the SNI, certificate
    /// names and negotiated parameters of both legs.
    pub fn line(&self) -> String {
        let mut line = format!(
            "CONN: {} {} {} {} {} {} {} {}",
            self.proto,
            self.src,
            self.dst,
            dash(&self.host),
            dash(&self.method),
            dash(&self.uri),
            dash(&self.status_code),
            dash(&self.content_length),
        );
        if self.sni.is_some() || self.ssl_names.is_some() {
            line.push_str(&format!(
                " sni:{} names:{} sproto:{} dproto:{} origcrt:{} usedcrt:{}",
                dash(&self.sni),
                dash(&self.ssl_names),
                dash(&self.src_tls),
                dash(&self.dst_tls),
                dash(&self.orig_fingerprint),
                dash(&self.used_fingerprint),
            ));
        }
        if self.ocsp_denied {
            line.push_str(" ocsp:denied");
        }
        line
    }
}

/// Append-only one-line-per-connection log.
pub struct ConnectLog {
    file: Mutex<File>,
}

impl ConnectLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(ConnectLog {
            file: Mutex::new(file),
        })
    }

    pub fn log(&self, summary: &ConnSummary) {
        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if let Err(e) = writeln!(guard, "{}", summary.line()) {
            warn!("connect log write failed, disabling for this conn: {e}");
        }
    }
}

/// Captured content of one connection, written to the capture directory on
/// close as a pair of byte files plus a metadata record.
#[derive(Debug, Default)]
pub struct ContentCapture {
    pub request_data: Vec<u8>,
    pub response_data: Vec<u8>,
}

impl ContentCapture {
    pub fn record(&mut self, direction: Direction, data: &[u8]) {
        match direction {
            Direction::Request => self.request_data.extend_from_slice(data),
            Direction::Response => self.response_data.extend_from_slice(data),
        }
    }

    /// Persist the capture. File naming mirrors the capture database layout:
    /// `req_<stamp>_<id>.bin`, `resp_<stamp>_<id>.bin`, `meta_<stamp>_<id>.json`.
    pub fn save(&self, dir: &Path, conn_id: u64, summary: &ConnSummary) {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let stem = format!("{}_{}", timestamp, conn_id);

        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("failed to create capture dir: {e}");
            return;
        }

        let req_path = dir.join(format!("req_{stem}.bin"));
        if let Err(e) = std::fs::write(&req_path, &self.request_data) {
            warn!("failed to save request: {e}");
        }

        let resp_path = dir.join(format!("resp_{stem}.bin"));
        if let Err(e) = std::fs::write(&resp_path, &self.response_data) {
            warn!("failed to save response: {e}");
        }

        let meta = serde_json::json!({
            "conn_id": conn_id,
            "proto": summary.proto,
            "src": summary.src,
            "dst": summary.dst,
            "host": summary.host,
            "method": summary.method,
            "uri": summary.uri,
            "sni": summary.sni,
            "status_code": summary.status_code,
            "request_size": self.request_data.len(),
            "response_size": self.response_data.len(),
            "ocsp_denied": summary.ocsp_denied,
        });
        let meta_path = dir.join(format!("meta_{stem}.json"));
        match serde_json::to_string_pretty(&meta) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&meta_path, body) {
                    warn!("failed to save metadata: {e}");
                }
            }
            Err(e) => warn!("failed to encode metadata: {e}"),
        }
    }
}

/// TLS master secrets in `SSLKEYLOGFILE` format, shared by every connection
/// that has master logging enabled.
pub struct MasterKeyLog {
    file: Mutex<File>,
}

impl MasterKeyLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(MasterKeyLog {
            file: Mutex::new(file),
        })
    }
}

impl KeyLog for MasterKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        let line = format!(
            "{} {} {}\n",
            label,
            hex::encode(client_random),
            hex::encode(secret)
        );
        if let Err(e) = guard.write_all(line.as_bytes()) {
            warn!("master secret log write failed: {e}");
        }
    }

    fn will_log(&self, _label: &str) -> bool {
        true
    }
}

impl std::fmt::Debug for MasterKeyLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKeyLog")
    }
}

/// Shared PCAP output. All connections append to one capture file; each
/// holds its own [`PcapCtx`] so sequence numbers stay per-conversation.
pub struct PcapSink {
    file: Mutex<Option<File>>,
    path: PathBuf,
}

impl PcapSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        pcap::pcap_open(&mut file)?;
        Ok(PcapSink {
            file: Mutex::new(Some(file)),
            path: path.to_path_buf(),
        })
    }

    /// Fresh crafting context for one conversation.
    pub fn conn_ctx(&self, src: SocketAddr, dst: SocketAddr) -> PcapCtx {
        PcapCtx::new(CLIENT_MAC, SERVER_MAC, src, dst, pcap::MTU)
    }

    pub fn log_payload(&self, ctx: &mut PcapCtx, direction: Direction, payload: &[u8]) {
        self.with_file(|file| pcap::write_payload(ctx, file, direction, payload));
    }

    pub fn log_close(&self, ctx: &mut PcapCtx, direction: Direction) {
        self.with_file(|file| pcap::write_close(ctx, file, direction));
    }

    // A failed write poisons the whole capture file, so the sink shuts down
    // rather than emit torn records.
    fn with_file(&self, op: impl FnOnce(&mut File) -> std::io::Result<()>) {
        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if let Some(file) = guard.as_mut() {
            if let Err(e) = op(file) {
                warn!(path = %self.path.display(), "pcap write failed, disabling pcap log: {e}");
                *guard = None;
            }
        }
    }
}
