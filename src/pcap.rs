//! Synthetic PCAP fabrication.
//!
//! Reconstructs each intercepted conversation as a forged packet stream: the
//! relay only ever sees two byte pipes, so the Ethernet/IP/TCP framing here
//! is fabricated from scratch: synthetic handshake, MSS-sized segments with
//! correct checksums, and a FIN exchange on close. The output is a standard
//! libpcap 2.4 little-endian file that dissectors accept as a real capture.

use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

pub const PCAP_MAGIC: u32 = 0xa1b2c3d4;

/// MTU assumed for fabricated layer 3 packets, including the IP header.
pub const MTU: usize = 1500;

const ETHER_HDR_LEN: usize = 14;
const IP4_HDR_LEN: usize = 20;
const IP6_HDR_LEN: usize = 40;
const TCP_HDR_LEN: usize = 20;

/// Buffer size needed for the largest fabricated layer 2 frame.
pub const MAX_PKTSZ: usize = MTU + ETHER_HDR_LEN;

const ETHERTYPE_IP: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const IPPROTO_TCP: u8 = 6;

const TH_FIN: u16 = 0x01;
const TH_SYN: u16 = 0x02;
const TH_PSH: u16 = 0x08;
const TH_ACK: u16 = 0x10;

/// Which half of the conversation a fabricated packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server.
    Request,
    /// Server to client.
    Response,
}

impl Direction {
    fn flip(self) -> Self {
        match self {
            Direction::Request => Direction::Response,
            Direction::Response => Direction::Request,
        }
    }
}

/// Per-conversation TCP state used to fabricate packets.
///
/// Sequence numbers start at zero; the first payload (or close) triggers a
/// synthetic SYN handshake with random initial sequence numbers.
#[derive(Debug, Clone)]
pub struct PcapCtx {
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src_addr: SocketAddr,
    dst_addr: SocketAddr,
    src_seq: u32,
    dst_seq: u32,
    mss: usize,
}

impl PcapCtx {
    /// Initialize the crafting context for one conversation.
    ///
    /// The MSS is derived from `mtu` and the address family of `dst_addr`,
    /// assuming no IPv4 options and no IPv6 extension headers.
    pub fn new(
        src_mac: [u8; 6],
        dst_mac: [u8; 6],
        src_addr: SocketAddr,
        dst_addr: SocketAddr,
        mtu: usize,
    ) -> Self {
        let l3 = match dst_addr.ip() {
            IpAddr::V4(_) => IP4_HDR_LEN,
            IpAddr::V6(_) => IP6_HDR_LEN,
        };
        PcapCtx {
            src_mac,
            dst_mac,
            src_addr,
            dst_addr,
            src_seq: 0,
            dst_seq: 0,
            mss: mtu - l3 - TCP_HDR_LEN,
        }
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    fn seq(&self, direction: Direction) -> (u32, u32) {
        match direction {
            Direction::Request => (self.src_seq, self.dst_seq),
            Direction::Response => (self.dst_seq, self.src_seq),
        }
    }

    fn advance(&mut self, direction: Direction, n: u32) {
        match direction {
            Direction::Request => self.src_seq = self.src_seq.wrapping_add(n),
            Direction::Response => self.dst_seq = self.dst_seq.wrapping_add(n),
        }
    }
}

/// Prepare a PCAP file for appending records.
///
/// An empty file gets a fresh global header. A file that already begins with
/// the PCAP magic is positioned at its end so new records append. Anything
/// else is truncated and re-initialized. Calling this twice is a no-op.
pub fn pcap_open(file: &mut std::fs::File) -> std::io::Result<()> {
    let sz = file.seek(SeekFrom::End(0))?;
    if sz > 0 {
        file.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 4];
        if sz >= 4 {
            file.read_exact(&mut magic)?;
            if u32::from_le_bytes(magic) == PCAP_MAGIC {
                file.seek(SeekFrom::End(0))?;
                return Ok(());
            }
        }
        // Not a pcap file: start over.
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
    }
    write_global_header(file)
}

fn write_global_header<F: Write>(file: &mut F) -> std::io::Result<()> {
    let mut hdr = [0u8; 24];
    hdr[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
    hdr[4..6].copy_from_slice(&2u16.to_le_bytes()); // version major
    hdr[6..8].copy_from_slice(&4u16.to_le_bytes()); // version minor
    // thiszone and sigfigs stay zero
    hdr[16..20].copy_from_slice(&(MAX_PKTSZ as u32).to_le_bytes()); // snaplen
    hdr[20..24].copy_from_slice(&1u32.to_le_bytes()); // linktype: Ethernet
    file.write_all(&hdr)
}

/// Fabricate the packets carrying one payload in the given direction.
///
/// Emits the synthetic SYN handshake first if this conversation has not
/// started yet, then one PSH|ACK segment per MSS-sized slice of `payload`,
/// then an ACK from the other side.
pub fn write_payload<F>(
    ctx: &mut PcapCtx,
    file: &mut F,
    direction: Direction,
    mut payload: &[u8],
) -> std::io::Result<()>
where
    F: Write,
{
    if ctx.src_seq == 0 {
        write_syn_handshake(ctx, file)?;
    }

    while !payload.is_empty() {
        let n = payload.len().min(ctx.mss);
        write_packet(ctx, file, direction, TH_PSH | TH_ACK, &payload[..n])?;
        ctx.advance(direction, n as u32);
        payload = &payload[n..];
    }

    write_packet(ctx, file, direction.flip(), TH_ACK, &[])
}

/// Fabricate a connection close: FIN|ACK in `direction`, FIN|ACK back, and a
/// final ACK. Does not touch the underlying file handle beyond writing.
pub fn write_close<F>(ctx: &mut PcapCtx, file: &mut F, direction: Direction) -> std::io::Result<()>
where
    F: Write,
{
    if ctx.src_seq == 0 {
        write_syn_handshake(ctx, file)?;
    }

    write_packet(ctx, file, direction, TH_FIN | TH_ACK, &[])?;
    ctx.advance(direction, 1);

    write_packet(ctx, file, direction.flip(), TH_FIN | TH_ACK, &[])?;
    ctx.advance(direction.flip(), 1);

    write_packet(ctx, file, direction, TH_ACK, &[])
}

fn write_syn_handshake<F: Write>(ctx: &mut PcapCtx, file: &mut F) -> std::io::Result<()> {
    let mut rng = rand::thread_rng();

    ctx.src_seq = rng.gen();
    write_packet(ctx, file, Direction::Request, TH_SYN, &[])?;
    ctx.src_seq = ctx.src_seq.wrapping_add(1);

    ctx.dst_seq = rng.gen();
    write_packet(ctx, file, Direction::Response, TH_SYN | TH_ACK, &[])?;
    ctx.dst_seq = ctx.dst_seq.wrapping_add(1);

    write_packet(ctx, file, Direction::Request, TH_ACK, &[])
}

fn write_packet<F: Write>(
    ctx: &PcapCtx,
    file: &mut F,
    direction: Direction,
    flags: u16,
    payload: &[u8],
) -> std::io::Result<()> {
    let (src_mac, dst_mac, src, dst) = match direction {
        Direction::Request => (ctx.src_mac, ctx.dst_mac, ctx.src_addr, ctx.dst_addr),
        Direction::Response => (ctx.dst_mac, ctx.src_mac, ctx.dst_addr, ctx.src_addr),
    };
    let (seq, ack) = ctx.seq(direction);

    let mut frame = Vec::with_capacity(MAX_PKTSZ);
    build_frame(&mut frame, src_mac, dst_mac, src, dst, flags, seq, ack, payload);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut rec = [0u8; 16];
    rec[0..4].copy_from_slice(&(now.as_secs() as u32).to_le_bytes());
    rec[4..8].copy_from_slice(&now.subsec_micros().to_le_bytes());
    rec[8..12].copy_from_slice(&(frame.len() as u32).to_le_bytes());
    rec[12..16].copy_from_slice(&(frame.len() as u32).to_le_bytes());

    file.write_all(&rec)?;
    file.write_all(&frame)
}

/// Build one Ethernet II frame with an IPv4 or IPv6 + TCP packet inside,
/// checksums fixed on all layers. Stateless; header fields that cannot be
/// derived from the arguments use fixed defaults.
#[allow(clippy::too_many_arguments)]
fn build_frame(
    frame: &mut Vec<u8>,
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src: SocketAddr,
    dst: SocketAddr,
    flags: u16,
    seq: u32,
    ack: u32,
    payload: &[u8],
) {
    frame.extend_from_slice(&dst_mac);
    frame.extend_from_slice(&src_mac);

    let mut pseudo = Checksum::new();
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(sip), IpAddr::V4(dip)) => {
            frame.extend_from_slice(&ETHERTYPE_IP.to_be_bytes());

            let total = (IP4_HDR_LEN + TCP_HDR_LEN + payload.len()) as u16;
            let mut ip = [0u8; IP4_HDR_LEN];
            ip[0] = 0x45; // version 4, IHL 5
            ip[2..4].copy_from_slice(&total.to_be_bytes());
            ip[4..6].copy_from_slice(&rand::thread_rng().gen::<u16>().to_be_bytes());
            ip[8] = 64; // TTL
            ip[9] = IPPROTO_TCP;
            ip[12..16].copy_from_slice(&sip.octets());
            ip[16..20].copy_from_slice(&dip.octets());
            let mut sum = Checksum::new();
            sum.add(&ip);
            ip[10..12].copy_from_slice(&sum.finish().to_be_bytes());
            frame.extend_from_slice(&ip);

            pseudo.add(&sip.octets());
            pseudo.add(&dip.octets());
            pseudo.add(&(IPPROTO_TCP as u16).to_be_bytes());
            pseudo.add(&((TCP_HDR_LEN + payload.len()) as u16).to_be_bytes());
        }
        (IpAddr::V6(sip), IpAddr::V6(dip)) => {
            frame.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());

            let mut ip = [0u8; IP6_HDR_LEN];
            ip[0] = 0x60; // version 6
            ip[4..6].copy_from_slice(&((TCP_HDR_LEN + payload.len()) as u16).to_be_bytes());
            ip[6] = IPPROTO_TCP;
            ip[7] = 255; // hop limit
            ip[8..24].copy_from_slice(&sip.octets());
            ip[24..40].copy_from_slice(&dip.octets());
            frame.extend_from_slice(&ip);

            pseudo.add(&sip.octets());
            pseudo.add(&dip.octets());
            pseudo.add(&((TCP_HDR_LEN + payload.len()) as u32).to_be_bytes());
            pseudo.add(&(IPPROTO_TCP as u16).to_be_bytes());
        }
        // Mixed families cannot happen: both ends of a conversation share one
        // address family. Fall back to mapping everything into IPv6.
        (s, d) => {
            let sip = to_v6(s);
            let dip = to_v6(d);
            frame.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
            let mut ip = [0u8; IP6_HDR_LEN];
            ip[0] = 0x60;
            ip[4..6].copy_from_slice(&((TCP_HDR_LEN + payload.len()) as u16).to_be_bytes());
            ip[6] = IPPROTO_TCP;
            ip[7] = 255;
            ip[8..24].copy_from_slice(&sip.octets());
            ip[24..40].copy_from_slice(&dip.octets());
            frame.extend_from_slice(&ip);
            pseudo.add(&sip.octets());
            pseudo.add(&dip.octets());
            pseudo.add(&((TCP_HDR_LEN + payload.len()) as u32).to_be_bytes());
            pseudo.add(&(IPPROTO_TCP as u16).to_be_bytes());
        }
    }

    let mut tcp = [0u8; TCP_HDR_LEN];
    tcp[0..2].copy_from_slice(&src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12..14].copy_from_slice(&(0x5000 | flags).to_be_bytes()); // data offset 5
    tcp[14..16].copy_from_slice(&32767u16.to_be_bytes()); // window
    // checksum over pseudo header + TCP header + payload
    pseudo.add(&tcp);
    pseudo.add(payload);
    tcp[16..18].copy_from_slice(&pseudo.finish().to_be_bytes());

    frame.extend_from_slice(&tcp);
    frame.extend_from_slice(payload);
}

fn to_v6(addr: IpAddr) -> std::net::Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// One's-complement internet checksum accumulator.
struct Checksum {
    sum: u32,
}

impl Checksum {
    fn new() -> Self {
        Checksum { sum: 0 }
    }

    fn add(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(2);
        for pair in &mut chunks {
            self.sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
        }
        if let [last] = chunks.remainder() {
            self.sum += u32::from(u16::from_be_bytes([*last, 0]));
        }
    }

    fn finish(mut self) -> u16 {
        self.sum = (self.sum >> 16) + (self.sum & 0xffff);
        self.sum += self.sum >> 16;
        !(self.sum as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> std::fs::File {
        let mut f = tempfile::tempfile().unwrap();
        pcap_open(&mut f).unwrap();
        f
    }

    fn contents(mut f: std::fs::File) -> Vec<u8> {
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).unwrap();
        buf
    }

    fn ctx() -> PcapCtx {
        PcapCtx::new(
            [2, 0, 0, 0, 0, 1],
            [2, 0, 0, 0, 0, 2],
            "10.0.0.1:40000".parse().unwrap(),
            "10.0.0.2:443".parse().unwrap(),
            MTU,
        )
    }

    fn records(buf: &[u8]) -> Vec<&[u8]> {
        assert!(buf.len() >= 24);
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), PCAP_MAGIC);
        let mut out = Vec::new();
        let mut pos = 24;
        while pos < buf.len() {
            let incl = u32::from_le_bytes(buf[pos + 8..pos + 12].try_into().unwrap()) as usize;
            out.push(&buf[pos + 16..pos + 16 + incl]);
            pos += 16 + incl;
        }
        out
    }

    fn tcp_flags(frame: &[u8]) -> u16 {
        // Ethernet(14) + IPv4(20), then TCP offset 12
        u16::from_be_bytes(frame[14 + 20 + 12..14 + 20 + 14].try_into().unwrap()) & 0x3f
    }

    fn verify_ip_checksum(frame: &[u8]) {
        let ip = &frame[14..34];
        let mut sum = Checksum::new();
        sum.add(ip);
        assert_eq!(sum.finish(), 0, "IPv4 checksum did not verify");
    }

    #[test]
    fn test_open_writes_global_header() {
        let mut cur = open_temp();
        let buf = contents(cur);
        assert_eq!(buf.len(), 24);
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), PCAP_MAGIC);
        assert_eq!(u16::from_le_bytes(buf[4..6].try_into().unwrap()), 2);
        assert_eq!(u16::from_le_bytes(buf[6..8].try_into().unwrap()), 4);
        assert_eq!(u32::from_le_bytes(buf[20..24].try_into().unwrap()), 1);
    }

    #[test]
    fn test_open_is_idempotent() {
        let mut cur = open_temp();
        pcap_open(&mut cur).unwrap();
        assert_eq!(contents(cur).len(), 24);
    }

    #[test]
    fn test_payload_emits_handshake_then_segments() {
        let mut cur = open_temp();
        let mut ctx = ctx();
        write_payload(&mut ctx, &mut cur, Direction::Request, b"hello").unwrap();

        let buf = contents(cur);
        let recs = records(&buf);
        // SYN, SYN|ACK, ACK, PSH|ACK, ACK
        assert_eq!(recs.len(), 5);
        assert_eq!(tcp_flags(recs[0]), TH_SYN);
        assert_eq!(tcp_flags(recs[1]), TH_SYN | TH_ACK);
        assert_eq!(tcp_flags(recs[2]), TH_ACK);
        assert_eq!(tcp_flags(recs[3]), TH_PSH | TH_ACK);
        assert_eq!(tcp_flags(recs[4]), TH_ACK);
        assert_eq!(&recs[3][14 + 20 + 20..], b"hello");
        for r in &recs {
            verify_ip_checksum(r);
        }
    }

    #[test]
    fn test_payload_segmented_at_mss() {
        let mut cur = open_temp();
        let mut ctx = ctx();
        let payload = vec![0x41u8; ctx.mss() + 10];
        write_payload(&mut ctx, &mut cur, Direction::Response, &payload).unwrap();

        let buf = contents(cur);
        let recs = records(&buf);
        // handshake(3) + two segments + ack
        assert_eq!(recs.len(), 6);
        assert_eq!(recs[3].len() - 14 - 20 - 20, ctx.mss());
        assert_eq!(recs[4].len() - 14 - 20 - 20, 10);
    }

    #[test]
    fn test_sequence_deltas_match_bytes_plus_syn_fin() {
        let mut cur = open_temp();
        let mut ctx = ctx();

        write_payload(&mut ctx, &mut cur, Direction::Request, b"abcdef").unwrap();
        write_payload(&mut ctx, &mut cur, Direction::Response, b"xy").unwrap();
        write_close(&mut ctx, &mut cur, Direction::Request).unwrap();

        let buf = contents(cur);
        let recs = records(&buf);
        // handshake(3) + segment + ack + segment + ack + close(3)
        assert_eq!(recs.len(), 10);

        let seq_of = |frame: &[u8]| {
            u32::from_be_bytes(frame[14 + 20 + 4..14 + 20 + 8].try_into().unwrap())
        };
        let src_isn = seq_of(recs[0]); // SYN
        let dst_isn = seq_of(recs[1]); // SYN|ACK

        // Per direction: payload bytes plus one per SYN and FIN.
        assert_eq!(ctx.src_seq.wrapping_sub(src_isn), 1 + 6 + 1);
        assert_eq!(ctx.dst_seq.wrapping_sub(dst_isn), 1 + 2 + 1);
    }

    #[test]
    fn test_close_emits_fin_exchange() {
        let mut cur = open_temp();
        let mut ctx = ctx();
        write_payload(&mut ctx, &mut cur, Direction::Request, b"x").unwrap();
        let src_before = ctx.src_seq;
        let dst_before = ctx.dst_seq;
        write_close(&mut ctx, &mut cur, Direction::Response).unwrap();

        assert_eq!(ctx.src_seq, src_before.wrapping_add(1));
        assert_eq!(ctx.dst_seq, dst_before.wrapping_add(1));

        let buf = contents(cur);
        let recs = records(&buf);
        let n = recs.len();
        assert_eq!(tcp_flags(recs[n - 3]), TH_FIN | TH_ACK);
        assert_eq!(tcp_flags(recs[n - 2]), TH_FIN | TH_ACK);
        assert_eq!(tcp_flags(recs[n - 1]), TH_ACK);
    }

    #[test]
    fn test_ipv6_frame_shape() {
        let mut cur = open_temp();
        let mut ctx = PcapCtx::new(
            [2, 0, 0, 0, 0, 1],
            [2, 0, 0, 0, 0, 2],
            "[2001:db8::1]:40000".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
            MTU,
        );
        assert_eq!(ctx.mss(), MTU - 40 - 20);
        write_payload(&mut ctx, &mut cur, Direction::Request, b"v6").unwrap();

        let buf = contents(cur);
        let recs = records(&buf);
        let frame = recs[3];
        assert_eq!(
            u16::from_be_bytes(frame[12..14].try_into().unwrap()),
            ETHERTYPE_IPV6
        );
        assert_eq!(frame[14] >> 4, 6);
        assert_eq!(frame[14 + 7], 255); // hop limit
    }

    #[test]
    fn test_open_file_truncates_garbage() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(b"this is not a capture").unwrap();
        pcap_open(&mut f).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len(), 24);
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), PCAP_MAGIC);
    }
}
