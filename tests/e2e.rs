//! End-to-end scenarios over loopback sockets: the full engine path from an
//! accepted client socket through protocol engage, TLS forging and the
//! relay, against real origin servers started inside the tests.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use tlstap::cert::{self, CertAuthority, CertStore};
use tlstap::config::{Config, ConnOpts, Proto, ProxySpec};
use tlstap::filter::{FilterTree, RuleParser};
use tlstap::proxy::conn::handle_connection;
use tlstap::proxy::{ProxyCore, Stats};

fn install_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

struct TestEnv {
    core: Arc<ProxyCore>,
    _ca_dir: tempfile::TempDir,
}

fn build_core(mut config: Config, rules: &[&str]) -> TestEnv {
    install_provider();
    let ca_dir = tempfile::tempdir().unwrap();
    CertAuthority::generate(ca_dir.path()).unwrap();
    let authority = CertAuthority::load(
        &ca_dir.path().join("ca-cert.pem"),
        &ca_dir.path().join("ca-key.pem"),
    )
    .unwrap();
    let certs = CertStore::new(authority, None).unwrap();

    let opts = config.opts.clone();
    let parsed = RuleParser::new()
        .parse_lines(rules.iter().copied(), &opts)
        .unwrap();

    config.conn_idle_timeout = std::time::Duration::from_secs(120);
    let core = Arc::new(ProxyCore {
        config: Arc::new(config),
        certs: Arc::new(certs),
        filter: Arc::new(FilterTree::build(&parsed)),
        connect_log: None,
        pcap: None,
        master_log: None,
        stats: Arc::new(Stats::default()),
    });
    TestEnv {
        core,
        _ca_dir: ca_dir,
    }
}

fn spec(proto: Proto, opts: Arc<ConnOpts>) -> ProxySpec {
    ProxySpec {
        proto,
        listen: "127.0.0.1:0".parse().unwrap(),
        divert: false,
        divert_addr: None,
        opts,
    }
}

/// Feed one client socket into the engine as if the accept loop had
/// dispatched it.
async fn drive(
    core: Arc<ProxyCore>,
    spec: ProxySpec,
) -> (TcpStream, tokio::task::JoinHandle<()>) {
    let entry = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = entry.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (accepted, peer) = entry.accept().await.unwrap();
    let task = tokio::spawn(handle_connection(
        core,
        spec,
        accepted,
        peer,
        Arc::new(AtomicU64::new(0)),
    ));
    (client, task)
}

/// Plain HTTP origin answering every request with a fixed response.
async fn http_origin(response: &'static [u8]) -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                stream.write_all(response).await.unwrap();
                stream.shutdown().await.unwrap();
                break;
            }
        }
        seen
    });
    (addr, task)
}

#[tokio::test]
async fn scenario_plain_http_get_split_mode() {
    let (origin_addr, origin) =
        http_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

    let mut config = Config::default();
    config.fallback_dst = Some(origin_addr);
    let env = build_core(config, &[]);
    let opts = env.core.config.opts.clone();

    let (mut client, task) = drive(env.core.clone(), spec(Proto::Http, opts)).await;
    client
        .write_all(
            b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\nAccept-Encoding: gzip\r\n\r\n",
        )
        .await
        .unwrap();
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(
        response,
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"
    );

    let seen = origin.await.unwrap();
    assert_eq!(
        seen,
        b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n"
    );
    task.await.unwrap();
}

#[tokio::test]
async fn scenario_filter_block_on_uri() {
    let (origin_addr, _origin) =
        http_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;

    let mut config = Config::default();
    config.fallback_dst = Some(origin_addr);
    let env = build_core(config, &["Block to uri /admin*"]);
    let opts = env.core.config.opts.clone();

    let (mut client, task) = drive(env.core.clone(), spec(Proto::Http, opts)).await;
    client
        .write_all(b"GET /admin/login HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(response.is_empty(), "client must receive nothing further");
    task.await.unwrap();
    assert_eq!(
        env.core
            .stats
            .blocked
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

/// TLS origin presenting a self-signed certificate for `host`.
async fn tls_origin(
    host: &'static str,
    response: &'static [u8],
) -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
    let (cert_der, key) = cert::self_signed_leaf(host).unwrap();
    let key_der = rustls::pki_types::PrivateKeyDer::try_from(key.serialize_der()).unwrap();
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = tls.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                tls.write_all(response).await.unwrap();
                let _ = tls.shutdown().await;
                break;
            }
        }
        seen
    });
    (addr, task)
}

/// TLS client config trusting only the proxy's CA.
fn client_tls_config(core: &ProxyCore) -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(core.certs.ca_der()).unwrap();
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

#[tokio::test]
async fn scenario_https_interception_with_forged_leaf() {
    let (origin_addr, origin) =
        tls_origin("secure.example", b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

    let mut config = Config::default();
    config.fallback_dst = Some(origin_addr);
    let env = build_core(config, &[]);
    let opts = env.core.config.opts.clone();

    let (client, task) = drive(env.core.clone(), spec(Proto::Https, opts)).await;

    let connector = TlsConnector::from(Arc::new(client_tls_config(&env.core)));
    let server_name = rustls::pki_types::ServerName::try_from("secure.example").unwrap();
    let mut tls = connector.connect(server_name, client).await.unwrap();

    // The served chain is a forged leaf for the origin's identity, not the
    // origin's own certificate.
    {
        let (_, conn) = tls.get_ref();
        let served = conn.peer_certificates().unwrap();
        let (_, parsed) =
            x509_parser::parse_x509_certificate(served[0].as_ref()).unwrap();
        let issuer: Vec<_> = parsed
            .issuer()
            .iter_common_name()
            .filter_map(|a| a.as_str().ok())
            .collect();
        assert_eq!(issuer, vec!["tlstap CA"]);
    }

    tls.write_all(b"GET / HTTP/1.1\r\nHost: secure.example\r\nConnection: keep-alive\r\n\r\n")
        .await
        .unwrap();

    let mut response = vec![0u8; 256];
    let n = tls.read(&mut response).await.unwrap();
    assert!(response[..n].starts_with(b"HTTP/1.1 200 OK"));

    let seen = origin.await.unwrap();
    let seen_text = String::from_utf8(seen).unwrap();
    assert!(seen_text.contains("Connection: close"));
    assert!(!seen_text.contains("keep-alive"));

    let _ = tls.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn scenario_connect_tunnel_reclassifies_to_https() {
    let (origin_addr, _origin) =
        tls_origin("tunnel.example", b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;

    // The fallback is a dead end; the CONNECT authority names the origin
    // and must override it.
    let mut config = Config::default();
    config.fallback_dst = Some("127.0.0.1:1".parse().unwrap());
    let env = build_core(config, &[]);
    let opts = env.core.config.opts.clone();

    let (mut client, task) = drive(env.core.clone(), spec(Proto::Http, opts)).await;
    let connect_req = format!(
        "CONNECT {origin_addr} HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n"
    );
    client.write_all(connect_req.as_bytes()).await.unwrap();

    let mut buf = [0u8; 128];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"HTTP/1.0 200 Connection established\r\n\r\n");

    // The tunnel is now intercepted TLS: handshake against the forged leaf.
    let connector = TlsConnector::from(Arc::new(client_tls_config(&env.core)));
    let server_name = rustls::pki_types::ServerName::try_from("tunnel.example").unwrap();
    let mut tls = connector.connect(server_name, client).await.unwrap();
    tls.write_all(b"GET / HTTP/1.1\r\nHost: tunnel.example\r\n\r\n")
        .await
        .unwrap();
    let mut response = vec![0u8; 128];
    let n = tls.read(&mut response).await.unwrap();
    assert!(response[..n].starts_with(b"HTTP/1.1 200 OK"));

    let _ = tls.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn scenario_divert_routes_through_consumer_and_child() {
    // Plain TCP origin that records what it got and answers.
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(b"origin-reply").await.unwrap();
        buf[..n].to_vec()
    });

    // Downstream consumer: reads the routing header, re-injects through the
    // child listener, then relays the origin's answer back to the parent.
    let consumer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let consumer_addr = consumer.local_addr().unwrap();
    let consumer_task = tokio::spawn(async move {
        let (mut from_parent, _) = consumer.accept().await.unwrap();
        let mut seen = Vec::new();
        let mut buf = [0u8; 512];
        // Keep reading until the header line and some payload arrived.
        loop {
            let n = from_parent.read(&mut buf).await.unwrap();
            seen.extend_from_slice(&buf[..n]);
            if let Some(pos) = seen.windows(2).position(|w| w == b"\r\n") {
                if seen.len() > pos + 2 {
                    break;
                }
            }
        }
        let text = String::from_utf8_lossy(&seen).into_owned();

        // First line is the routing header; payload follows.
        let (header, payload) = text.split_once("\r\n").unwrap();
        assert!(header.starts_with("Tlstap: "));
        let fields: Vec<&str> = header.trim_start_matches("Tlstap: ").split(',').collect();
        assert_eq!(fields[3], "p");
        let child_addr = fields[0]
            .replace(['[', ']'], "")
            .parse::<std::net::SocketAddr>()
            .unwrap();

        // Re-inject toward the origin, echoing the routing header back the
        // way a compliant consumer does.
        let mut to_child = TcpStream::connect(child_addr).await.unwrap();
        to_child
            .write_all(format!("{header}\r\n{payload}").as_bytes())
            .await
            .unwrap();
        let mut reply = [0u8; 128];
        let rn = to_child.read(&mut reply).await.unwrap();

        from_parent.write_all(&reply[..rn]).await.unwrap();
        text
    });

    let mut config = Config::default();
    config.fallback_dst = Some(origin_addr);
    let env = build_core(config, &[]);
    let opts = env.core.config.opts.clone();
    let mut divert_spec = spec(Proto::Tcp, opts);
    divert_spec.divert = true;
    divert_spec.divert_addr = Some(consumer_addr);

    let (mut client, task) = drive(env.core.clone(), divert_spec).await;
    client.write_all(b"client-data").await.unwrap();

    let mut buf = [0u8; 128];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"origin-reply");

    // The consumer saw the routing header exactly once, before the payload.
    let consumer_view = consumer_task.await.unwrap();
    assert_eq!(consumer_view.matches("Tlstap: ").count(), 1);
    assert!(consumer_view.ends_with("client-data"));

    // The origin saw clean payload, no routing header.
    let origin_view = origin_task.await.unwrap();
    assert_eq!(origin_view, b"client-data");

    drop(client);
    task.await.unwrap();
}

#[tokio::test]
async fn scenario_passthrough_fallback_on_upstream_tls_failure() {
    // The "TLS" origin is actually plain TCP: the upstream handshake fails
    // and, with Passthrough on, the engine reconnects raw and relays the
    // client's handshake bytes untouched.
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        // First leg is the failed TLS attempt; answer garbage and close.
        let (mut first, _) = origin.accept().await.unwrap();
        let mut buf = [0u8; 512];
        let _ = first.read(&mut buf).await;
        drop(first);

        // Second leg is the passthrough reconnect.
        let (mut second, _) = origin.accept().await.unwrap();
        let n = second.read(&mut buf).await.unwrap();
        second.write_all(b"\x15\x03\x03\x00\x02\x02\x28").await.unwrap();
        buf[..n].to_vec()
    });

    let mut opts = ConnOpts::default();
    opts.passthrough = true;
    let opts = Arc::new(opts);
    let mut config = Config::default();
    config.fallback_dst = Some(origin_addr);
    config.opts = opts.clone();
    let env = build_core(config, &[]);

    let (mut client, task) = drive(env.core.clone(), spec(Proto::Https, opts)).await;

    // Hand-rolled hello bytes: enough for the SNI peek to classify, and
    // byte fidelity is the point, since whatever goes in must come out at
    // the origin untouched.
    let hello = {
        let mut content = Vec::new();
        content.extend_from_slice(&[0x03, 0x03]); // client_version
        content.extend_from_slice(&[0u8; 32]); // random
        content.push(0); // session id
        content.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher suites
        content.extend_from_slice(&[0x01, 0x00]); // compression
        let mut body = vec![0x01, 0, 0, content.len() as u8];
        body.extend_from_slice(&content);
        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(body.len() as u16).to_be_bytes());
        record.extend_from_slice(&body);
        record
    };
    client.write_all(&hello).await.unwrap();

    // The client observes the server's raw alert bytes, untouched.
    let mut reply = [0u8; 16];
    let n = client.read(&mut reply).await.unwrap();
    assert_eq!(&reply[..n], b"\x15\x03\x03\x00\x02\x02\x28");

    let at_origin = origin_task.await.unwrap();
    assert_eq!(at_origin, hello, "handshake bytes must pass through verbatim");

    drop(client);
    task.await.unwrap();
}

#[tokio::test]
async fn scenario_reconnect_ssl_retries_upstream_handshake() {
    // First upstream leg dies mid-handshake; with ReconnectSSL on, the
    // engine dials once more and the interception completes normally.
    let (cert_der, key) = cert::self_signed_leaf("retry.example").unwrap();
    let key_der = rustls::pki_types::PrivateKeyDer::try_from(key.serialize_der()).unwrap();
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (first, _) = origin.accept().await.unwrap();
        drop(first);

        let (stream, _) = origin.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = tls.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                    .await
                    .unwrap();
                let _ = tls.shutdown().await;
                break;
            }
        }
    });

    let mut opts = ConnOpts::default();
    opts.reconnect_ssl = true;
    let opts = Arc::new(opts);
    let mut config = Config::default();
    config.fallback_dst = Some(origin_addr);
    config.opts = opts.clone();
    let env = build_core(config, &[]);

    let (client, task) = drive(env.core.clone(), spec(Proto::Https, opts)).await;

    let connector = TlsConnector::from(Arc::new(client_tls_config(&env.core)));
    let server_name = rustls::pki_types::ServerName::try_from("retry.example").unwrap();
    let mut tls = connector.connect(server_name, client).await.unwrap();
    tls.write_all(b"GET / HTTP/1.1\r\nHost: retry.example\r\n\r\n")
        .await
        .unwrap();
    let mut response = vec![0u8; 256];
    let n = tls.read(&mut response).await.unwrap();
    assert!(response[..n].starts_with(b"HTTP/1.1 200 OK"));

    let _ = tls.shutdown().await;
    origin_task.await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn scenario_autossl_starttls_upgrade() {
    // Mail-style origin: plaintext greeting exchange, then TLS on the same
    // socket once the client starts the handshake.
    let (cert_der, key) = cert::self_signed_leaf("mail.example").unwrap();
    let key_der = rustls::pki_types::PrivateKeyDer::try_from(key.serialize_der()).unwrap();
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"EHLO client.example\r\n");
        stream.write_all(b"220 Ready\r\n").await.unwrap();

        let mut tls = acceptor.accept(stream).await.unwrap();
        let n = tls.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"MAIL FROM:<a@b>\r\n");
        tls.write_all(b"250 OK\r\n").await.unwrap();
        let _ = tls.shutdown().await;
    });

    let mut config = Config::default();
    config.fallback_dst = Some(origin_addr);
    let env = build_core(config, &[]);
    let opts = env.core.config.opts.clone();

    let (mut client, task) = drive(env.core.clone(), spec(Proto::Autossl, opts)).await;

    // Plaintext phase relays both ways.
    client.write_all(b"EHLO client.example\r\n").await.unwrap();
    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"220 Ready\r\n");

    // TLS overlays both legs without closing them; the client sees the
    // forged leaf, not the origin's.
    let connector = TlsConnector::from(Arc::new(client_tls_config(&env.core)));
    let server_name = rustls::pki_types::ServerName::try_from("mail.example").unwrap();
    let mut tls = connector.connect(server_name, client).await.unwrap();
    tls.write_all(b"MAIL FROM:<a@b>\r\n").await.unwrap();
    let n = tls.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"250 OK\r\n");

    let _ = tls.shutdown().await;
    origin_task.await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn scenario_ocsp_denial_e2e() {
    let (origin_addr, _origin) =
        http_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;

    let mut opts = ConnOpts::default();
    opts.deny_ocsp = true;
    let opts = Arc::new(opts);
    let mut config = Config::default();
    config.fallback_dst = Some(origin_addr);
    config.opts = opts.clone();
    let env = build_core(config, &[]);

    let (mut client, task) = drive(env.core.clone(), spec(Proto::Http, opts)).await;

    // A base64 OCSPRequest blob in the GET path.
    use base64::Engine;
    let inner: Vec<u8> = vec![0x04, 28]
        .into_iter()
        .chain(std::iter::repeat(0).take(28))
        .collect();
    let mut tbs = vec![0x30, inner.len() as u8];
    tbs.extend_from_slice(&inner);
    let mut der = vec![0x30, tbs.len() as u8];
    der.extend_from_slice(&tbs);
    let b64 = base64::engine::general_purpose::STANDARD.encode(&der);

    client
        .write_all(format!("GET /{b64} HTTP/1.1\r\nHost: ocsp.example\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.0 200 OK"));
    assert!(text.contains("application/ocsp-response"));
    assert!(response.ends_with(b"\x30\x03\x0a\x01\x03"));
    task.await.unwrap();
}
