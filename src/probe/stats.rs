//! Round-trip statistics for one probe run.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// One echo reply delivered by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub seq: u16,
    pub rtt: Duration,
    /// Address the reply came from.
    pub addr: String,
    /// When the reply was handed over by the engine.
    pub received_at: DateTime<Utc>,
}

/// Aggregate result of a probe run.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    pub packets_sent: u32,
    pub packets_recv: u32,
    /// Percentage of packets lost, 0 to 100.
    pub packet_loss: f64,
    pub min_rtt: Duration,
    pub max_rtt: Duration,
    pub avg_rtt: Duration,
    pub std_dev_rtt: Duration,
    /// Host as configured.
    pub addr: String,
    /// Address the host resolved to.
    pub ip_addr: IpAddr,
}

impl Statistics {
    /// Compute statistics from the round-trip times of received packets.
    ///
    /// Loss is 100% when nothing was sent. Standard deviation is the
    /// population deviation of the received RTTs.
    pub fn from_rtts(addr: &str, ip_addr: IpAddr, packets_sent: u32, rtts: &[Duration]) -> Self {
        let packets_recv = rtts.len() as u32;
        let packet_loss = if packets_sent == 0 {
            100.0
        } else {
            let lost = packets_sent.saturating_sub(packets_recv);
            lost as f64 / packets_sent as f64 * 100.0
        };

        let mut stats = Self {
            packets_sent,
            packets_recv,
            packet_loss,
            min_rtt: Duration::ZERO,
            max_rtt: Duration::ZERO,
            avg_rtt: Duration::ZERO,
            std_dev_rtt: Duration::ZERO,
            addr: addr.to_string(),
            ip_addr,
        };

        if rtts.is_empty() {
            return stats;
        }

        let nanos: Vec<f64> = rtts.iter().map(|d| d.as_nanos() as f64).collect();
        let n = nanos.len() as f64;
        let mean = nanos.iter().sum::<f64>() / n;
        let variance = nanos.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        stats.min_rtt = rtts.iter().copied().min().unwrap_or_default();
        stats.max_rtt = rtts.iter().copied().max().unwrap_or_default();
        stats.avg_rtt = Duration::from_nanos(mean.round() as u64);
        stats.std_dev_rtt = Duration::from_nanos(variance.sqrt().round() as u64);
        stats
    }
}
