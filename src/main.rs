//! tlstap, a transparent TLS/TCP intercepting proxy.
//!
//! Terminates TLS with dynamically forged leaf certificates signed by a
//! local CA, relays to the original destination, and records connection
//! metadata, content and fabricated packet captures.
//!
//! Setup:
//! 1. `tlstap generate-ca` and trust the CA on the clients under test
//! 2. Redirect traffic with an iptables NAT rule to a listening proxyspec
//! 3. Inspect the capture directory / pcap output

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tlstap::cert::{CertAuthority, CertStore};
use tlstap::config::{Config, ProxySpec};
use tlstap::filter::{FilterTree, RuleParser};
use tlstap::logging::{ConnectLog, MasterKeyLog, PcapSink};
use tlstap::pool::{self, WorkerPool};
use tlstap::proxy::{ProxyCore, Stats};

/// Transparent TLS/TCP intercepting proxy
#[derive(Parser)]
#[command(name = "tlstap")]
#[command(about = "Transparent TLS/TCP intercepting proxy with forensic capture")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy
    Start {
        /// Proxy specification: 'proto addr port [split | divert addr port]'.
        /// May be given multiple times.
        #[arg(short, long = "proxyspec")]
        proxyspecs: Vec<String>,

        /// Path to CA certificate
        #[arg(long, default_value = "~/.tlstap/ca-cert.pem")]
        ca_cert: PathBuf,

        /// Path to CA private key
        #[arg(long, default_value = "~/.tlstap/ca-key.pem")]
        ca_key: PathBuf,

        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Filter rules file
        #[arg(short, long)]
        rules: Option<PathBuf>,

        /// Save captured content to this directory
        #[arg(long)]
        capture_dir: Option<PathBuf>,

        /// Write fabricated packet captures to this file
        #[arg(long)]
        pcap: Option<PathBuf>,

        /// Append one line per connection to this file
        #[arg(long)]
        connect_log: Option<PathBuf>,

        /// Write TLS master secrets (SSLKEYLOGFILE format)
        #[arg(long)]
        keylog: Option<PathBuf>,

        /// Destination for connections without NAT state (testing without
        /// iptables)
        #[arg(long)]
        fallback_dst: Option<std::net::SocketAddr>,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate a CA certificate for TLS interception
    GenerateCa {
        /// Output directory
        #[arg(short, long, default_value = "~/.tlstap")]
        output: PathBuf,
    },

    /// Parse the configuration and rules, then exit
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn expand(path: &PathBuf) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string())
}

fn load_rules(config: &Config, rules_file: Option<&PathBuf>) -> Result<FilterTree> {
    let mut lines: Vec<String> = config.rules.clone();
    if let Some(path) = rules_file {
        let text = std::fs::read_to_string(expand(path))
            .with_context(|| format!("failed to read rules file {}", path.display()))?;
        lines.extend(text.lines().map(str::to_string));
    }
    let rules = RuleParser::new()
        .parse_lines(lines.iter().map(String::as_str), &config.opts)
        .context("failed to parse filter rules")?;
    Ok(FilterTree::build(&rules))
}

#[allow(clippy::too_many_arguments)]
async fn start(
    proxyspecs: Vec<String>,
    ca_cert: PathBuf,
    ca_key: PathBuf,
    config_path: Option<PathBuf>,
    rules: Option<PathBuf>,
    capture_dir: Option<PathBuf>,
    pcap: Option<PathBuf>,
    connect_log: Option<PathBuf>,
    keylog: Option<PathBuf>,
    fallback_dst: Option<std::net::SocketAddr>,
) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => Config::load(&expand(path))
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    // Command line wins over the config file.
    for spec in &proxyspecs {
        config.specs.push(ProxySpec::parse(spec, &config.opts)?);
    }
    if config.specs.is_empty() {
        anyhow::bail!("no proxyspec given; use --proxyspec 'https 0.0.0.0 8443 split'");
    }
    if capture_dir.is_some() {
        config.capture_dir = capture_dir.map(|p| expand(&p));
    }
    if pcap.is_some() {
        config.pcap_file = pcap.map(|p| expand(&p));
    }
    if connect_log.is_some() {
        config.connect_log = connect_log.map(|p| expand(&p));
    }
    if keylog.is_some() {
        config.master_key_log = keylog.map(|p| expand(&p));
    }
    if fallback_dst.is_some() {
        config.fallback_dst = fallback_dst;
    }

    let authority = CertAuthority::load(&expand(&ca_cert), &expand(&ca_key))
        .context("failed to load CA; run 'tlstap generate-ca' first")?;
    info!("CA certificate loaded");
    let mut certs = CertStore::new(authority, config.opts.leaf_crl_url.clone())?;
    if let Some(dir) = &config.target_cert_dir {
        let loaded = tlstap::cert::load_target_dir(&certs, dir)?;
        info!("{loaded} target certificates loaded from {}", dir.display());
    }
    if let Some(path) = &config.default_leaf_cert {
        certs.set_default_leaf(tlstap::cert::load_leaf_pem(path)?);
    }
    if let Some(path) = &config.opts.cachain {
        certs.set_extra_chain(tlstap::cert::load_cert_chain(path)?);
    }

    let filter = load_rules(&config, rules.as_ref())?;
    if filter.rule_count() > 0 {
        info!("{} filter rules loaded", filter.rule_count());
    }

    let connect_sink = match &config.connect_log {
        Some(path) => Some(Arc::new(
            ConnectLog::open(path)
                .with_context(|| format!("cannot open connect log {}", path.display()))?,
        )),
        None => None,
    };
    let pcap_sink = match &config.pcap_file {
        Some(path) => Some(Arc::new(
            PcapSink::open(path)
                .with_context(|| format!("cannot open pcap file {}", path.display()))?,
        )),
        None => None,
    };
    let master_sink = match &config.master_key_log {
        Some(path) => Some(Arc::new(
            MasterKeyLog::open(path)
                .with_context(|| format!("cannot open key log {}", path.display()))?,
        )),
        None => None,
    };

    let workers = pool::worker_count(config.max_workers);
    let core = Arc::new(ProxyCore {
        config: Arc::new(config),
        certs: Arc::new(certs),
        filter: Arc::new(filter),
        connect_log: connect_sink,
        pcap: pcap_sink,
        master_log: master_sink,
        stats: Arc::new(Stats::default()),
    });

    info!("starting {workers} workers");
    let pool = Arc::new(WorkerPool::start(core.clone(), workers));
    pool::serve(core.clone(), pool.clone()).await?;

    if let Ok(pool) = Arc::try_unwrap(pool) {
        pool.shutdown();
    }
    let stats = &core.stats;
    info!(
        "done: {} conns, {} refused, {} blocked, {} expired, {} errors",
        stats.conns.load(std::sync::atomic::Ordering::Relaxed),
        stats.refused.load(std::sync::atomic::Ordering::Relaxed),
        stats.blocked.load(std::sync::atomic::Ordering::Relaxed),
        stats.expired.load(std::sync::atomic::Ordering::Relaxed),
        stats.errors.load(std::sync::atomic::Ordering::Relaxed),
    );
    Ok(())
}

fn generate_ca(output: &PathBuf) -> Result<()> {
    let output = expand(output);
    let (cert_path, key_path) = CertAuthority::generate(&output)?;
    info!("CA certificate written to {:?}", cert_path);
    info!("CA private key written to {:?}", key_path);

    println!("\nCA certificate generated.");
    println!("\nTo trust this CA on the clients under test:");
    println!("  1. Import {} into the system trust store", cert_path.display());
    println!("  2. Or point the application at it explicitly");
    println!("\nRedirect traffic with e.g.:");
    println!("  iptables -t nat -A PREROUTING -p tcp --dport 443 -j REDIRECT --to-port 8443");
    Ok(())
}

fn check_config(path: &PathBuf) -> Result<()> {
    let config = Config::load(&expand(path))?;
    let filter = load_rules(&config, None)?;
    println!(
        "ok: {} proxyspecs, {} filter rules",
        config.specs.len(),
        filter.rule_count()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            proxyspecs,
            ca_cert,
            ca_key,
            config,
            rules,
            capture_dir,
            pcap,
            connect_log,
            keylog,
            fallback_dst,
            verbose,
        } => {
            let level = if verbose { Level::DEBUG } else { Level::INFO };
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;

            start(
                proxyspecs,
                ca_cert,
                ca_key,
                config,
                rules,
                capture_dir,
                pcap,
                connect_log,
                keylog,
                fallback_dst,
            )
            .await?;
        }
        Commands::GenerateCa { output } => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(Level::INFO)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
            generate_ca(&output)?;
        }
        Commands::CheckConfig { config } => {
            check_config(&config)?;
        }
    }

    Ok(())
}
