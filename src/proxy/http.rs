//! Incremental HTTP header rewriting.
//!
//! Both directions are rewritten one CRLF line at a time until the blank
//! line ends the header block; bodies pass through untouched. The rewriter
//! strips hop-by-hop, pinning, compression and tracing headers, forces
//! `Connection: close`, injects the divert-mode routing header exactly once,
//! and recognizes OCSP requests so they can be denied without ever reaching
//! the upstream.

use bytes::BytesMut;

use crate::config::ConnOpts;
use crate::proxy::detect::valid_http_method;

/// Key of the out-of-band routing header injected in divert mode and
/// stripped from all forwarded traffic.
pub const ROUTING_HEADER_KEY: &str = "Tlstap:";

/// Canned response for denied OCSP requests: a `tryLater` OCSPResponse.
pub const OCSP_DENIED_RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\n\
Content-Type: application/ocsp-response\r\n\
Content-Length: 5\r\n\
Connection: close\r\n\
\r\n\
\x30\x03\x0a\x01\x03";

/// Canned response for streams that fail protocol validation.
pub const PROTO_ERROR_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad request\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
\r\n";

/// Reply completing an HTTP CONNECT tunnel before the HTTPS re-engage.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection established\r\n\r\n";

/// Incremental parser state for one HTTP connection.
#[derive(Debug, Default)]
pub struct HttpState {
    pub seen_req_header: bool,
    pub seen_resp_header: bool,
    pub sent_http_conn_close: bool,
    pub ocsp_denied: bool,
    pub not_valid: bool,
    pub is_valid: bool,
    /// Bytes observed while protocol validation is still undecided.
    pub seen_bytes: u64,
    seen_keyword_count: u32,
    pub method: Option<String>,
    pub uri: Option<String>,
    pub host: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<String>,
    pub status_code: Option<String>,
    pub status_text: Option<String>,
}

/// What to do with one header line.
#[derive(Debug, PartialEq, Eq)]
enum LineEdit {
    Keep,
    Replace(String),
    Drop,
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    if line.len() >= name.len() && line[..name.len()].eq_ignore_ascii_case(name) {
        Some(line[name.len()..].trim_start())
    } else {
        None
    }
}

fn has_header(line: &str, name: &str) -> bool {
    header_value(line, name).is_some()
}

/// Filter one request header line, capturing fields for the connect log as a
/// side effect.
fn filter_request_line(
    line: &str,
    state: &mut HttpState,
    is_child: bool,
    opts: &ConnOpts,
) -> LineEdit {
    if state.method.is_none() && !state.seen_req_header {
        // Request line.
        let mut parts = line.splitn(3, ' ');
        match (parts.next(), parts.next()) {
            (Some(method), Some(target)) if !method.is_empty() => {
                state.method = Some(method.to_string());
                if parts.next().is_none() {
                    // HTTP/0.9: no version, no header block.
                    state.seen_req_header = true;
                }
                state.uri = Some(target.to_string());
            }
            _ => {
                // Not HTTP at all.
                state.seen_req_header = true;
                state.not_valid = true;
            }
        }
        return LineEdit::Keep;
    }

    if state.host.is_none() {
        if let Some(host) = header_value(line, "Host:") {
            state.host = Some(host.to_string());
            state.seen_keyword_count += 1;
            return LineEdit::Keep;
        }
    }
    if let Some(ct) = header_value(line, "Content-Type:") {
        state.content_type = Some(ct.to_string());
        state.seen_keyword_count += 1;
        return LineEdit::Keep;
    }
    if has_header(line, "Connection:") {
        state.sent_http_conn_close = true;
        state.seen_keyword_count += 1;
        return LineEdit::Replace("Connection: close".into());
    }
    if opts.remove_http_accept_encoding && has_header(line, "Accept-Encoding:") {
        state.seen_keyword_count += 1;
        return LineEdit::Drop;
    }
    if opts.remove_http_referer && has_header(line, "Referer:") {
        state.seen_keyword_count += 1;
        return LineEdit::Drop;
    }
    // Suppress upgrading to TLS, WebSockets or HTTP/2, and keep-alive.
    if has_header(line, "Upgrade:") || has_header(line, "Keep-Alive:") {
        state.seen_keyword_count += 1;
        return LineEdit::Drop;
    }
    if is_child && (has_header(line, "Via:") || has_header(line, "X-Forwarded-For:")) {
        state.seen_keyword_count += 1;
        return LineEdit::Drop;
    }
    // Strip any routing header, whether ours or replayed by a consumer.
    if has_header(line, ROUTING_HEADER_KEY) {
        return LineEdit::Drop;
    }
    if line.is_empty() {
        state.seen_req_header = true;
        if !state.sent_http_conn_close {
            return LineEdit::Replace("Connection: close\r\n".into());
        }
    }
    LineEdit::Keep
}

/// Filter one response header line.
fn filter_response_line(line: &str, state: &mut HttpState) -> LineEdit {
    if state.status_code.is_none() && !state.seen_resp_header {
        // Status line.
        if !line.starts_with("HTTP") || !line.contains(' ') {
            // Not HTTP, or HTTP/0.9 without a status line.
            state.seen_resp_header = true;
            return LineEdit::Keep;
        }
        let mut parts = line.splitn(3, ' ');
        let _version = parts.next();
        state.status_code = parts.next().map(str::to_string);
        state.status_text = Some(parts.next().unwrap_or("").to_string());
        return LineEdit::Keep;
    }

    if state.content_length.is_none() {
        if let Some(cl) = header_value(line, "Content-Length:") {
            state.content_length = Some(cl.to_string());
            return LineEdit::Keep;
        }
    }
    if let Some(ct) = header_value(line, "Content-Type:") {
        state.content_type = Some(ct.to_string());
        state.seen_keyword_count += 1;
        return LineEdit::Keep;
    }
    // Public key pinning, HSTS, certificate transparency, alternate
    // protocols and upgrades all break interception on later visits.
    if has_header(line, "Public-Key-Pins:")
        || has_header(line, "Public-Key-Pins-Report-Only:")
        || has_header(line, "Strict-Transport-Security:")
        || has_header(line, "Expect-CT:")
        || has_header(line, "Alternate-Protocol:")
        || has_header(line, "Upgrade:")
    {
        return LineEdit::Drop;
    }
    if line.is_empty() {
        state.seen_resp_header = true;
    }
    LineEdit::Keep
}

/// Pop one CRLF (or bare LF) line from the buffer, or `None` when no
/// complete line is pending.
fn read_line(buf: &mut BytesMut) -> Option<String> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let line = buf.split_to(pos + 1);
    let mut end = line.len() - 1;
    if end > 0 && line[end - 1] == b'\r' {
        end -= 1;
    }
    Some(String::from_utf8_lossy(&line[..end]).into_owned())
}

/// Rewrite buffered request bytes into `out` until the header block is done;
/// afterwards bytes pass through verbatim. The routing header, when given,
/// is injected exactly once, right after the first forwarded line; the
/// return value reports whether that happened during this call.
pub fn scan_request(
    inbuf: &mut BytesMut,
    out: &mut BytesMut,
    state: &mut HttpState,
    is_child: bool,
    opts: &ConnOpts,
    mut routing: Option<&str>,
) -> bool {
    let mut injected = false;
    while !state.seen_req_header {
        let Some(line) = read_line(inbuf) else {
            return injected;
        };
        match filter_request_line(&line, state, is_child, opts) {
            LineEdit::Keep => {
                out.extend_from_slice(line.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            LineEdit::Replace(replacement) => {
                out.extend_from_slice(replacement.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            LineEdit::Drop => {}
        }
        if let Some(header) = routing.take() {
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(b"\r\n");
            injected = true;
        }
    }
    if !inbuf.is_empty() {
        out.extend_from_slice(inbuf);
        inbuf.clear();
    }
    injected
}

/// Rewrite buffered response bytes into `out`; mirror of [`scan_request`].
pub fn scan_response(inbuf: &mut BytesMut, out: &mut BytesMut, state: &mut HttpState) {
    while !state.seen_resp_header {
        let Some(line) = read_line(inbuf) else {
            return;
        };
        match filter_response_line(&line, state) {
            LineEdit::Keep => {
                out.extend_from_slice(line.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            LineEdit::Replace(replacement) => {
                out.extend_from_slice(replacement.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            LineEdit::Drop => {}
        }
    }
    if !inbuf.is_empty() {
        out.extend_from_slice(inbuf);
        inbuf.clear();
    }
}

/// Protocol validation, checked while `ValidateProto` is on and the stream
/// has not yet proven itself. `Err` means the stream can no longer pass.
pub fn validate(state: &mut HttpState, max_header_size: usize) -> Result<(), ()> {
    if state.not_valid {
        return Err(());
    }
    if let Some(method) = &state.method {
        if !valid_http_method(method) {
            state.not_valid = true;
            return Err(());
        }
    }
    if state.seen_keyword_count > 0 {
        // The request line parsed and at least one known keyword followed.
        state.is_valid = true;
        return Ok(());
    }
    if state.seen_bytes > max_header_size as u64 {
        state.not_valid = true;
        return Err(());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// OCSP denial
// ---------------------------------------------------------------------------

/// Whether a completed request header block is an OCSP request that should
/// be denied.
pub fn is_ocsp_request(state: &HttpState) -> bool {
    let Some(method) = &state.method else {
        return false;
    };
    if method.eq_ignore_ascii_case("GET") {
        if let Some(uri) = &state.uri {
            return ocsp_uri_quacks(uri);
        }
    }
    if method.eq_ignore_ascii_case("POST") {
        if let Some(ct) = &state.content_type {
            return ct
                .get(..24)
                .is_some_and(|p| p.eq_ignore_ascii_case("application/ocsp-request"));
        }
    }
    false
}

/// Quick checks first to avoid decoding work: OCSP requests start with an
/// ASN.1 SEQUENCE, so the first Base64 byte is 'M' or its URL encoding;
/// there is no query string; and encoded blobs are longer than 32 bytes.
fn ocsp_uri_quacks(uri: &str) -> bool {
    let Some(tail) = uri.rsplit('/').next() else {
        return false;
    };
    if !tail.starts_with('M') && !tail.starts_with('%') {
        return false;
    }
    if uri.contains('?') {
        return false;
    }
    if tail.len() < 32 {
        return false;
    }
    let Some(decoded) = url_decode(tail) else {
        return false;
    };
    use base64::Engine;
    let Ok(der) = base64::engine::general_purpose::STANDARD.decode(decoded) else {
        return false;
    };
    der_is_ocsp_request(&der)
}

fn url_decode(input: &str) -> Option<Vec<u8>> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1)?;
            let lo = bytes.get(i + 2)?;
            let hex = [*hi, *lo];
            let s = std::str::from_utf8(&hex).ok()?;
            out.push(u8::from_str_radix(s, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Some(out)
}

/// Shallow DER check for an OCSPRequest: an outer SEQUENCE spanning the
/// whole buffer whose first element is the tbsRequest SEQUENCE.
fn der_is_ocsp_request(der: &[u8]) -> bool {
    fn parse_len(buf: &[u8]) -> Option<(usize, usize)> {
        let first = *buf.first()?;
        if first < 0x80 {
            return Some((first as usize, 1));
        }
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || buf.len() < 1 + n {
            return None;
        }
        let mut len = 0usize;
        for &b in &buf[1..1 + n] {
            len = (len << 8) | b as usize;
        }
        Some((len, 1 + n))
    }

    if der.len() < 4 || der[0] != 0x30 {
        return false;
    }
    let Some((outer_len, outer_hdr)) = parse_len(&der[1..]) else {
        return false;
    };
    if outer_len < 2 || 1 + outer_hdr + outer_len != der.len() {
        return false;
    }
    // tbsRequest
    der[1 + outer_hdr] == 0x30
}
