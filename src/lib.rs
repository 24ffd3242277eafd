//! Transparent TLS/TCP intercepting proxy core.
//!
//! For each accepted client connection the engine detects the application
//! protocol, terminates TLS with a forged leaf signed by a locally trusted
//! CA, relays cleartext to the original destination over a second TLS
//! connection, and records connection metadata and content for forensic
//! analysis.
//!
//! Module map:
//! - [`config`]: connection options, proxyspecs, config file loading
//! - [`cert`]: forged-leaf cache and on-demand forging
//! - [`filter`]: the rule engine deciding divert/split/pass/block
//! - [`pcap`]: fabricated packet capture output
//! - [`logging`]: connect log, content capture, master secrets
//! - [`proxy`]: the per-connection engine and protocol handlers
//! - [`pool`]: worker threads and connection assignment

pub mod cert;
pub mod config;
pub mod filter;
pub mod logging;
pub mod pcap;
pub mod pool;
pub mod proxy;
