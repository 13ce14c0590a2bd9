//! ICMP echo engine with native sockets and a `ping` command fallback.
//!
//! Runs blocking; callers on an async runtime should use `spawn_blocking`.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::Utc;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};

use super::{EchoEngine, EchoRun, Packet, ProbeError, Statistics};

/// Delay between consecutive echo requests.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // Try RAW socket first (requires CAP_NET_RAW or root)
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // Try DGRAM (unprivileged on Linux with ping_group_range set, or macOS)
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Native ICMP echo engine.
#[derive(Debug, Clone)]
pub struct IcmpEngine {
    interval: Duration,
}

impl Default for IcmpEngine {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PING_INTERVAL,
        }
    }
}

impl IcmpEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay between echo requests.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl EchoEngine for IcmpEngine {
    fn run(&self, host: &str, count: u32, timeout: Duration) -> Result<EchoRun, ProbeError> {
        let ip = resolve_address(host)?;
        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

        let (sent, packets) = if capability == IcmpCapability::Native {
            match run_native_ping(ip, count, timeout, self.interval) {
                Ok(res) => res,
                Err(ProbeError::Permission(msg)) => {
                    tracing::warn!(
                        "Native ping failed with permission error for {}, falling back to command: {}",
                        host,
                        msg
                    );
                    run_ping_command(ip, count, timeout)?
                }
                Err(e) => return Err(e),
            }
        } else {
            run_ping_command(ip, count, timeout)?
        };

        let rtts: Vec<Duration> = packets.iter().map(|p| p.rtt).collect();
        Ok(EchoRun {
            stats: Statistics::from_rtts(host, ip, sent, &rtts),
            packets,
        })
    }
}

/// Resolve hostname to IP address.
fn resolve_address(host: &str) -> Result<IpAddr, ProbeError> {
    // Try direct parse first
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let dns_error = |source| ProbeError::Dns {
        host: host.to_string(),
        source,
    };

    (host, 0)
        .to_socket_addrs()
        .map_err(dns_error)?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| dns_error(std::io::Error::new(ErrorKind::NotFound, "no addresses found")))
}

/// Open an ICMP socket for `ip`, RAW first (privileged), then DGRAM.
///
/// Returns the socket and whether it is a RAW socket.
fn open_socket(ip: IpAddr) -> Result<(Socket, bool), ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    if let Ok(socket) = Socket::new(domain, Type::RAW, Some(protocol)) {
        return Ok((socket, true));
    }

    Socket::new(domain, Type::DGRAM, Some(protocol))
        .map(|socket| (socket, false))
        .map_err(|e| {
            if e.kind() == ErrorKind::PermissionDenied {
                ProbeError::Permission(format!("failed to create ICMP socket: {}", e))
            } else {
                ProbeError::Socket(format!("failed to create ICMP socket: {}", e))
            }
        })
}

/// Send `count` echo requests `interval` apart and collect replies until all
/// have arrived or `timeout` has elapsed.
///
/// Returns the number of requests sent and the replies in arrival order.
fn run_native_ping(
    ip: IpAddr,
    count: u32,
    timeout: Duration,
    interval: Duration,
) -> Result<(u32, Vec<Packet>), ProbeError> {
    let (socket, raw) = open_socket(ip)?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Socket(format!("failed to connect: {}", e)))?;

    // Linux rewrites the identifier of unprivileged DGRAM echo requests and
    // filters replies per socket.
    let check_identifier = raw || !cfg!(target_os = "linux");
    let identifier: u16 = rand::random();

    let start = Instant::now();
    let deadline = start + timeout;
    let mut next_send = start;
    let mut sent: u32 = 0;
    let mut in_flight: HashMap<u16, Instant> = HashMap::new();
    let mut packets = Vec::new();
    let mut buf = [MaybeUninit::<u8>::uninit(); 1500];

    while (packets.len() as u32) < count {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        if sent < count && now >= next_send {
            let sequence = (sent % 65536) as u16;
            let request = match ip {
                IpAddr::V4(_) => build_icmp_echo_request(identifier, sequence),
                IpAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence),
            };
            socket.send(&request).map_err(|e| {
                if e.kind() == ErrorKind::PermissionDenied {
                    ProbeError::Permission(format!("failed to send: {}", e))
                } else {
                    ProbeError::Io(e)
                }
            })?;
            in_flight.insert(sequence, Instant::now());
            sent += 1;
            next_send += interval;
            continue;
        }

        let wake = if sent < count {
            next_send.min(deadline)
        } else {
            deadline
        };
        let wait = wake.saturating_duration_since(Instant::now());
        if wait.is_zero() {
            continue;
        }
        socket.set_read_timeout(Some(wait))?;

        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => return Err(ProbeError::Io(e)),
        };
        // Stop timing immediately after receive
        let arrived = Instant::now();
        // SAFETY: recv initialized `len` bytes
        let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let Some(reply) = parse_echo_reply(data, ip) else {
            continue;
        };
        if check_identifier && reply.identifier != identifier {
            continue;
        }
        // Duplicates and stale replies have no matching request left
        if let Some(sent_at) = in_flight.remove(&reply.sequence) {
            packets.push(Packet {
                seq: reply.sequence,
                rtt: arrived.duration_since(sent_at),
                addr: reply.source.to_string(),
                received_at: Utc::now(),
            });
        }
    }

    Ok((sent, packets))
}

/// Fields of an echo reply this engine cares about.
#[derive(Debug, Clone, Copy, PartialEq)]
struct EchoReply {
    identifier: u16,
    sequence: u16,
    source: IpAddr,
}

/// Parse an echo reply from a received datagram.
///
/// IPv4 RAW sockets (and DGRAM sockets on some platforms) deliver the IP
/// header as well; the source address is then taken from it.
fn parse_echo_reply(data: &[u8], peer: IpAddr) -> Option<EchoReply> {
    let (icmp, source, reply_type) = match peer {
        IpAddr::V4(_) => {
            if data.first()? >> 4 == 4 {
                let header_len = ((data[0] & 0x0F) as usize) * 4;
                if header_len < 20 || data.len() < header_len {
                    return None;
                }
                let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
                (&data[header_len..], IpAddr::V4(src), ICMP_ECHO_REPLY)
            } else {
                (data, peer, ICMP_ECHO_REPLY)
            }
        }
        IpAddr::V6(_) => (data, peer, ICMPV6_ECHO_REPLY),
    };

    if icmp.len() < 8 || icmp[0] != reply_type {
        return None;
    }

    Some(EchoReply {
        identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
        source,
    })
}

/// Payload timestamp in nanoseconds since the epoch.
fn payload_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = ICMP_ECHO_REQUEST;
    packet[1] = 0; // Code: 0
    // Checksum at [2..4], computed later
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&payload_timestamp().to_be_bytes());

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The kernel fills in the ICMPv6 checksum.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = ICMPV6_ECHO_REQUEST;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&payload_timestamp().to_be_bytes());

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }

    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run ping via command execution (fallback).
///
/// Replies are only delivered once the command exits, so they all share
/// roughly the same receipt time.
fn run_ping_command(
    ip: IpAddr,
    count: u32,
    timeout: Duration,
) -> Result<(u32, Vec<Packet>), ProbeError> {
    // Whole-run deadline in seconds, rounded up
    let deadline_secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    let deadline_secs = deadline_secs.max(1).to_string();
    let deadline_flag = if cfg!(target_os = "macos") { "-t" } else { "-w" };
    let program = if ip.is_ipv6() && cfg!(target_os = "macos") {
        "ping6"
    } else {
        "ping"
    };

    let output = Command::new(program)
        .args(["-n", "-c", &count.to_string(), deadline_flag, &deadline_secs])
        .arg(ip.to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_ping_output(&stdout) {
        Some((sent, replies)) => {
            let received_at = Utc::now();
            let packets = replies
                .into_iter()
                .map(|reply| Packet {
                    seq: reply.seq,
                    rtt: reply.rtt,
                    addr: reply.addr,
                    received_at,
                })
                .collect();
            Ok((sent, packets))
        }
        None => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ProbeError::Command(format!(
                "ping exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}

/// One reply line of `ping` output.
#[derive(Debug, Clone, PartialEq)]
struct CommandReply {
    seq: u16,
    addr: String,
    rtt: Duration,
}

/// Parse `ping` output into the transmitted count and the reply lines.
///
/// Returns `None` when the summary line is missing, which means ping did not
/// get as far as sending.
fn parse_ping_output(output: &str) -> Option<(u32, Vec<CommandReply>)> {
    // Per-packet response "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms"
    static REPLY_RE: OnceLock<Regex> = OnceLock::new();
    let reply_re = REPLY_RE.get_or_init(|| {
        Regex::new(
            r"from (?P<addr>[0-9A-Fa-f.:]+?):? icmp_seq=(?P<seq>\d+).*?time[=<](?P<val>[0-9.]+)\s*ms",
        )
        .unwrap()
    });

    // Summary line "4 packets transmitted, 4 received, ..."
    static SENT_RE: OnceLock<Regex> = OnceLock::new();
    let sent_re = SENT_RE.get_or_init(|| Regex::new(r"(?P<sent>\d+) packets transmitted").unwrap());

    let sent = sent_re
        .captures(output)
        .and_then(|caps| caps["sent"].parse::<u32>().ok())?;

    let replies = output
        .lines()
        .filter(|line| !line.contains("DUP!"))
        .filter_map(|line| {
            let caps = reply_re.captures(line)?;
            let ms = caps["val"].parse::<f64>().ok()?;
            Some(CommandReply {
                seq: caps["seq"].parse::<u32>().ok()? as u16,
                addr: caps["addr"].to_string(),
                rtt: Duration::from_secs_f64(ms / 1000.0),
            })
        })
        .collect();

    Some((sent, replies))
}
