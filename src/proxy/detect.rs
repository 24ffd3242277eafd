//! Protocol detection: ClientHello/SNI parsing and the closed command sets
//! used to validate HTTP, POP3 and SMTP traffic.
//!
//! Detection only ever peeks at buffered bytes; nothing here consumes from
//! the stream. A truncated ClientHello is reported as such so the caller can
//! retry once more data is pending.

use crate::config::Proto;

/// Peek window for protocol classification and ClientHello searches.
pub const PEEK_SIZE: usize = 1024;

/// SNI peeks retried on a truncated hello before giving up.
pub const SNI_PEEK_RETRIES: u32 = 50;

/// Delay between SNI peek retries.
pub const SNI_PEEK_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// Outcome of scanning bytes for a TLS ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloScan {
    /// Not TLS handshake traffic.
    NotTls,
    /// Looks like a ClientHello but more bytes are needed to finish parsing.
    Truncated,
    /// Complete ClientHello; SNI extension may still be absent.
    Hello { sni: Option<String> },
}

/// Parse a TLS ClientHello from the start of `buf` and extract the SNI.
pub fn parse_client_hello(buf: &[u8]) -> HelloScan {
    // TLS record header: type 22 (handshake), version 3.x, length.
    if buf.is_empty() {
        return HelloScan::Truncated;
    }
    if buf[0] != 0x16 {
        return HelloScan::NotTls;
    }
    if buf.len() < 5 {
        return HelloScan::Truncated;
    }
    if buf[1] != 0x03 {
        return HelloScan::NotTls;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let record = &buf[5..];
    if record.len() < record_len {
        // Only part of the record is buffered; the handshake body may also
        // span multiple records, which counts as truncated too.
        return parse_hello_body(record);
    }
    parse_hello_body(&record[..record_len])
}

fn parse_hello_body(body: &[u8]) -> HelloScan {
    // Handshake header: type 1 (ClientHello), u24 length.
    if body.is_empty() {
        return HelloScan::Truncated;
    }
    if body[0] != 0x01 {
        return HelloScan::NotTls;
    }
    if body.len() < 4 {
        return HelloScan::Truncated;
    }
    let hello_len = u32::from_be_bytes([0, body[1], body[2], body[3]]) as usize;
    let hello = &body[4..];
    if hello.len() < hello_len {
        return HelloScan::Truncated;
    }
    let hello = &hello[..hello_len];

    // client_version(2) random(32) session_id cipher_suites compression
    let mut pos = 2 + 32;
    let take_len = |hello: &[u8], pos: &mut usize, width: usize| -> Option<usize> {
        if hello.len() < *pos + width {
            return None;
        }
        let len = match width {
            1 => hello[*pos] as usize,
            _ => u16::from_be_bytes([hello[*pos], hello[*pos + 1]]) as usize,
        };
        *pos += width;
        if hello.len() < *pos + len {
            return None;
        }
        Some(len)
    };

    let Some(session_len) = take_len(hello, &mut pos, 1) else {
        return HelloScan::Truncated;
    };
    pos += session_len;
    let Some(ciphers_len) = take_len(hello, &mut pos, 2) else {
        return HelloScan::Truncated;
    };
    pos += ciphers_len;
    let Some(compression_len) = take_len(hello, &mut pos, 1) else {
        return HelloScan::Truncated;
    };
    pos += compression_len;

    // Extensions are optional (SSLv3-style hello ends here).
    if pos == hello.len() {
        return HelloScan::Hello { sni: None };
    }
    let Some(ext_total) = take_len(hello, &mut pos, 2) else {
        return HelloScan::Truncated;
    };
    let mut ext = &hello[pos..pos + ext_total];
    while ext.len() >= 4 {
        let ext_type = u16::from_be_bytes([ext[0], ext[1]]);
        let ext_len = u16::from_be_bytes([ext[2], ext[3]]) as usize;
        if ext.len() < 4 + ext_len {
            return HelloScan::Truncated;
        }
        let data = &ext[4..4 + ext_len];
        if ext_type == 0x0000 {
            // server_name: list length(2), entry type(1), name length(2).
            if data.len() >= 5 && data[2] == 0 {
                let name_len = u16::from_be_bytes([data[3], data[4]]) as usize;
                if data.len() >= 5 + name_len {
                    if let Ok(name) = std::str::from_utf8(&data[5..5 + name_len]) {
                        return HelloScan::Hello {
                            sni: Some(name.to_string()),
                        };
                    }
                }
            }
            return HelloScan::Hello { sni: None };
        }
        ext = &ext[4 + ext_len..];
    }
    HelloScan::Hello { sni: None }
}

// Size = 39
pub const HTTP_METHODS: [&str; 39] = [
    "GET",
    "PUT",
    "ICY",
    "COPY",
    "HEAD",
    "LOCK",
    "MOVE",
    "POLL",
    "POST",
    "BCOPY",
    "BMOVE",
    "MKCOL",
    "TRACE",
    "LABEL",
    "MERGE",
    "DELETE",
    "SEARCH",
    "UNLOCK",
    "REPORT",
    "UPDATE",
    "NOTIFY",
    "BDELETE",
    "CONNECT",
    "OPTIONS",
    "CHECKIN",
    "PROPFIND",
    "CHECKOUT",
    "CCM_POST",
    "SUBSCRIBE",
    "PROPPATCH",
    "BPROPFIND",
    "BPROPPATCH",
    "UNCHECKOUT",
    "MKACTIVITY",
    "MKWORKSPACE",
    "UNSUBSCRIBE",
    "RPC_CONNECT",
    "VERSION-CONTROL",
    "BASELINE-CONTROL",
];

pub fn valid_http_method(method: &str) -> bool {
    HTTP_METHODS
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method))
}

pub const POP3_COMMANDS: [&str; 15] = [
    "CAPA", "USER", "PASS", "AUTH", "APOP", "STLS", "LIST", "STAT", "UIDL", "RETR", "DELE",
    "RSET", "TOP", "QUIT", "NOOP",
];

// MAIL FROM and RCPT TO validate as MAIL and RCPT, since the first word is
// what gets compared.
pub const SMTP_COMMANDS: [&str; 25] = [
    "EHLO",
    "HELO",
    "AUTH",
    "MAIL",
    "MAIL FROM",
    "RCPT",
    "RCPT TO",
    "DATA",
    "SEND",
    "RSET",
    "QUIT",
    "ATRN",
    "ETRN",
    "TURN",
    "SAML",
    "SOML",
    "EXPN",
    "NOOP",
    "HELP",
    "ONEX",
    "BDAT",
    "BURL",
    "SUBMITTER",
    "VERB",
    "VRFY",
];

/// First whitespace/CRLF-delimited word of a packet.
pub fn first_word(packet: &[u8]) -> &[u8] {
    let end = packet
        .iter()
        .position(|&b| b == b' ' || b == b'\r' || b == b'\n' || b == b'\t')
        .unwrap_or(packet.len());
    &packet[..end]
}

fn word_in(set: &[&str], word: &[u8]) -> bool {
    set.iter()
        .any(|c| c.len() == word.len() && c.as_bytes().eq_ignore_ascii_case(word))
}

/// Incremental command validator shared by POP3 and SMTP: a single
/// unrecognized command fails for good, two recognized commands confirm the
/// protocol.
#[derive(Debug, Default)]
pub struct CommandValidator {
    commands: &'static [&'static str],
    seen_command_count: u32,
    pub not_valid: bool,
    pub is_valid: bool,
}

impl CommandValidator {
    pub fn pop3() -> Self {
        CommandValidator {
            commands: &POP3_COMMANDS,
            ..Default::default()
        }
    }

    pub fn smtp() -> Self {
        CommandValidator {
            commands: &SMTP_COMMANDS,
            ..Default::default()
        }
    }

    /// Validate one client packet. `Err(())` means the stream failed
    /// validation for good.
    pub fn validate(&mut self, packet: &[u8]) -> Result<(), ()> {
        if self.not_valid {
            return Err(());
        }
        if !word_in(self.commands, first_word(packet)) {
            self.not_valid = true;
            return Err(());
        }
        self.seen_command_count += 1;
        if self.seen_command_count >= 2 {
            self.is_valid = true;
        }
        Ok(())
    }
}

/// Validate an SMTP server response: a three-digit code in 200..=599. The
/// upstream greeting is relayed before the client speaks, so a non-SMTP
/// upstream must be caught here.
pub fn valid_smtp_response(packet: &[u8]) -> bool {
    let word = first_word(packet);
    let Ok(text) = std::str::from_utf8(word) else {
        return false;
    };
    // Multiline responses separate code and text with '-'.
    let code_part = text.split('-').next().unwrap_or(text);
    matches!(code_part.parse::<u32>(), Ok(code) if (200..600).contains(&code))
}

/// Classify the first client packet of a connection.
///
/// TLS beats everything, then an HTTP request line (CONNECT re-classifies to
/// HTTPS), then the mail command sets; anything else stays opaque TCP.
pub fn classify(buf: &[u8]) -> Proto {
    match parse_client_hello(buf) {
        HelloScan::Hello { .. } | HelloScan::Truncated => return Proto::Ssl,
        HelloScan::NotTls => {}
    }

    if let Some(line_end) = buf.iter().position(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(&buf[..line_end]);
        let mut parts = line.trim_end().split(' ');
        if let (Some(method), Some(_target), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        {
            if valid_http_method(method) && version.starts_with("HTTP/") {
                return if method.eq_ignore_ascii_case("CONNECT") {
                    Proto::Https
                } else {
                    Proto::Http
                };
            }
        }
    }

    let word = first_word(buf);
    if word_in(&POP3_COMMANDS, word) {
        return Proto::Pop3;
    }
    if word_in(&SMTP_COMMANDS, word) {
        return Proto::Smtp;
    }
    Proto::Tcp
}

/// Minimal ClientHello with an SNI extension, for tests across the engine.
#[cfg(test)]
pub(crate) fn client_hello(sni: Option<&str>) -> Vec<u8> {
    tests::build_client_hello(sni)
}
