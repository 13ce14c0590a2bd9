//! Probe module: runs one ICMP echo sequence per target.
//!
//! The echo engine sits behind [`EchoEngine`]; [`IcmpEngine`] is the native
//! implementation with a `ping` command fallback.

mod ping;
mod stats;

pub use ping::*;
pub use stats::*;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::PingParams;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to resolve {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create pinger: {0}")]
    Socket(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("failed to run pinger: {0}")]
    Io(#[from] std::io::Error),
    #[error("command failed: {0}")]
    Command(String),
}

impl ProbeError {
    /// Whether the scrape may skip this target and carry on.
    ///
    /// Only name resolution failures are recoverable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProbeError::Dns { .. })
    }
}

/// Everything an engine hands back from one blocking run.
#[derive(Debug, Clone, PartialEq)]
pub struct EchoRun {
    /// Replies in delivery order.
    pub packets: Vec<Packet>,
    pub stats: Statistics,
}

/// A blocking ICMP echo engine.
pub trait EchoEngine: Send + Sync {
    /// Send `count` echo requests to `host` and wait for replies, giving up
    /// once `timeout` has elapsed for the whole run.
    fn run(&self, host: &str, count: u32, timeout: Duration) -> Result<EchoRun, ProbeError>;
}

/// Result of probing one target during one scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub packets: Vec<Packet>,
    pub stats: Statistics,
    /// When the engine finished.
    pub stats_timestamp: DateTime<Utc>,
    pub tag: String,
}

/// Probe one target with already resolved parameters.
///
/// Runs the engine exactly once, without retries.
pub fn run_probe<E: EchoEngine + ?Sized>(
    engine: &E,
    host: &str,
    params: PingParams,
) -> Result<ProbeResult, ProbeError> {
    let run = engine.run(host, params.count, params.timeout)?;
    let stats_timestamp = Utc::now();

    tracing::debug!(
        host,
        sent = run.stats.packets_sent,
        received = run.stats.packets_recv,
        "Probe finished"
    );

    Ok(ProbeResult {
        packets: run.packets,
        stats: run.stats,
        stats_timestamp,
        tag: String::new(),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted engine for tests that must not touch the network.

    use super::*;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;

    /// What the fake engine does for one host.
    #[derive(Debug, Clone, Copy)]
    pub enum Script {
        /// Reply to this many of the requested packets.
        Reply(u32),
        DnsFailure,
        SocketFailure,
    }

    #[derive(Default)]
    pub struct FakeEngine {
        scripts: HashMap<String, Script>,
        calls: Mutex<Vec<(String, u32, Duration)>>,
    }

    impl FakeEngine {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, host: &str, script: Script) -> Self {
            self.scripts.insert(host.to_string(), script);
            self
        }

        pub fn calls(&self) -> Vec<(String, u32, Duration)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl EchoEngine for FakeEngine {
        fn run(&self, host: &str, count: u32, timeout: Duration) -> Result<EchoRun, ProbeError> {
            self.calls
                .lock()
                .unwrap()
                .push((host.to_string(), count, timeout));

            let script = self.scripts.get(host).copied().unwrap_or(Script::Reply(count));
            let received = match script {
                Script::Reply(n) => n.min(count),
                Script::DnsFailure => {
                    return Err(ProbeError::Dns {
                        host: host.to_string(),
                        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such host"),
                    })
                }
                Script::SocketFailure => {
                    return Err(ProbeError::Socket("operation not permitted".to_string()))
                }
            };

            let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
            let packets: Vec<Packet> = (0..received)
                .map(|seq| Packet {
                    seq: seq as u16,
                    rtt: Duration::from_micros(1_500 * (seq as u64 + 1)),
                    addr: ip.to_string(),
                    received_at: Utc::now(),
                })
                .collect();
            let rtts: Vec<Duration> = packets.iter().map(|p| p.rtt).collect();

            Ok(EchoRun {
                stats: Statistics::from_rtts(host, ip, count, &rtts),
                packets,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeEngine, Script};
    use super::*;

    fn params(count: u32) -> PingParams {
        PingParams {
            count,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_run_probe_collects_packets() {
        let engine = FakeEngine::new();
        let before = Utc::now();
        let result = run_probe(&engine, "a.test", params(4)).unwrap();

        assert_eq!(result.packets.len(), 4);
        assert_eq!(result.stats.packets_sent, 4);
        assert_eq!(result.stats.addr, "a.test");
        assert!(result.stats_timestamp >= before);
        assert!(result
            .packets
            .iter()
            .all(|p| p.received_at <= result.stats_timestamp));
        assert_eq!(engine.calls(), vec![("a.test".to_string(), 4, Duration::from_secs(5))]);
    }

    #[test]
    fn test_dns_failure_is_recoverable() {
        let engine = FakeEngine::new().with("bad.test", Script::DnsFailure);
        let err = run_probe(&engine, "bad.test", params(3)).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_other_failures_are_fatal() {
        let engine = FakeEngine::new().with("a.test", Script::SocketFailure);
        let err = run_probe(&engine, "a.test", params(3)).unwrap_err();
        assert!(!err.is_recoverable());

        assert!(!ProbeError::Command("exit status 2".to_string()).is_recoverable());
        assert!(!ProbeError::Permission("raw socket".to_string()).is_recoverable());
    }

    #[test]
    fn test_probe_runs_engine_once_without_retry() {
        let engine = FakeEngine::new().with("a.test", Script::SocketFailure);
        let _ = run_probe(&engine, "a.test", params(3));
        assert_eq!(engine.calls().len(), 1);
    }
}
