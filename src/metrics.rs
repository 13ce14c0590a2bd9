//! Metric batch model and the mapping from probe results to data points.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::probe::{Packet, ProbeResult};

pub const METRIC_RTT: &str = "ping.rtt";
pub const METRIC_RTT_MIN: &str = "ping.rtt.min";
pub const METRIC_RTT_MAX: &str = "ping.rtt.max";
pub const METRIC_RTT_AVG: &str = "ping.rtt.avg";
pub const METRIC_RTT_STDDEV: &str = "ping.rtt.stddev";
pub const METRIC_LOSS_RATIO: &str = "ping.loss.ratio";

pub const ATTR_PEER_IP: &str = "net.peer.ip";
pub const ATTR_PEER_NAME: &str = "net.peer.name";
pub const ATTR_TAG: &str = "tag";

const UNIT_MS: &str = "ms";
const NANOS_PER_MS: f64 = 1e6;

/// Attributes attached to every data point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attributes {
    #[serde(rename = "net.peer.ip")]
    pub peer_ip: String,
    #[serde(rename = "net.peer.name")]
    pub peer_name: String,
    pub tag: String,
}

/// A single gauge value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub attributes: Attributes,
}

/// A named gauge stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: &'static str,
    /// Empty for unitless streams.
    pub unit: &'static str,
    pub data_points: Vec<DataPoint>,
}

impl Metric {
    fn new(name: &'static str, unit: &'static str) -> Self {
        Self {
            name,
            unit,
            data_points: Vec::new(),
        }
    }
}

/// The six ping streams produced by one scrape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsBatch {
    pub rtt: Metric,
    pub rtt_min: Metric,
    pub rtt_max: Metric,
    pub rtt_avg: Metric,
    pub rtt_stddev: Metric,
    pub loss_ratio: Metric,
}

impl Default for MetricsBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsBatch {
    /// Create the six streams, all empty.
    pub fn new() -> Self {
        Self {
            rtt: Metric::new(METRIC_RTT, UNIT_MS),
            rtt_min: Metric::new(METRIC_RTT_MIN, UNIT_MS),
            rtt_max: Metric::new(METRIC_RTT_MAX, UNIT_MS),
            rtt_avg: Metric::new(METRIC_RTT_AVG, UNIT_MS),
            rtt_stddev: Metric::new(METRIC_RTT_STDDEV, UNIT_MS),
            loss_ratio: Metric::new(METRIC_LOSS_RATIO, ""),
        }
    }

    /// Streams in emission order.
    pub fn metrics(&self) -> [&Metric; 6] {
        [
            &self.rtt,
            &self.rtt_min,
            &self.rtt_max,
            &self.rtt_avg,
            &self.rtt_stddev,
            &self.loss_ratio,
        ]
    }

    pub fn get(&self, name: &str) -> Option<&Metric> {
        self.metrics().into_iter().find(|m| m.name == name)
    }

    pub fn data_point_count(&self) -> usize {
        self.metrics().iter().map(|m| m.data_points.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.data_point_count() == 0
    }

    /// Append the data points for one target's probe result.
    ///
    /// One `ping.rtt` point per received packet; one point in each
    /// aggregate stream regardless of how many packets came back.
    pub fn record(&mut self, result: &ProbeResult) {
        for packet in &result.packets {
            self.rtt
                .data_points
                .push(packet_point(duration_ms(packet.rtt), packet, result));
        }

        let stats = &result.stats;
        self.loss_ratio
            .data_points
            .push(stats_point(stats.packet_loss / 100.0, result));
        self.rtt_min
            .data_points
            .push(stats_point(duration_ms(stats.min_rtt), result));
        self.rtt_max
            .data_points
            .push(stats_point(duration_ms(stats.max_rtt), result));
        self.rtt_avg
            .data_points
            .push(stats_point(duration_ms(stats.avg_rtt), result));
        self.rtt_stddev
            .data_points
            .push(stats_point(duration_ms(stats.std_dev_rtt), result));
    }
}

fn duration_ms(d: std::time::Duration) -> f64 {
    d.as_nanos() as f64 / NANOS_PER_MS
}

fn packet_point(value: f64, packet: &Packet, result: &ProbeResult) -> DataPoint {
    DataPoint {
        value,
        timestamp: packet.received_at,
        attributes: Attributes {
            peer_ip: packet.addr.clone(),
            peer_name: result.stats.addr.clone(),
            tag: result.tag.clone(),
        },
    }
}

fn stats_point(value: f64, result: &ProbeResult) -> DataPoint {
    DataPoint {
        value,
        timestamp: result.stats_timestamp,
        attributes: Attributes {
            peer_ip: result.stats.ip_addr.to_string(),
            peer_name: result.stats.addr.clone(),
            tag: result.tag.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Statistics;
    use chrono::TimeZone;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn result(sent: u32, rtts_ms: &[u64]) -> ProbeResult {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));
        let rtts: Vec<Duration> = rtts_ms.iter().map(|ms| Duration::from_millis(*ms)).collect();
        let packets = rtts
            .iter()
            .enumerate()
            .map(|(i, rtt)| Packet {
                seq: i as u16,
                rtt: *rtt,
                addr: "192.0.2.8".to_string(),
                received_at: Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap(),
            })
            .collect();

        ProbeResult {
            packets,
            stats: Statistics::from_rtts("host.test", ip, sent, &rtts),
            stats_timestamp: Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
            tag: "prod".to_string(),
        }
    }

    #[test]
    fn test_new_batch_has_six_empty_streams() {
        let batch = MetricsBatch::new();
        let names: Vec<_> = batch.metrics().iter().map(|m| m.name).collect();
        assert_eq!(
            names,
            vec![
                "ping.rtt",
                "ping.rtt.min",
                "ping.rtt.max",
                "ping.rtt.avg",
                "ping.rtt.stddev",
                "ping.loss.ratio"
            ]
        );
        assert!(batch.is_empty());
        assert_eq!(batch.rtt.unit, "ms");
        assert_eq!(batch.loss_ratio.unit, "");
    }

    #[test]
    fn test_record_packet_points() {
        let mut batch = MetricsBatch::new();
        let res = result(2, &[12, 30]);
        batch.record(&res);

        assert_eq!(batch.rtt.data_points.len(), 2);
        let dp = &batch.rtt.data_points[1];
        assert_eq!(dp.value, 30.0);
        assert_eq!(dp.timestamp, res.packets[1].received_at);
        assert_eq!(dp.attributes.peer_ip, "192.0.2.8");
        assert_eq!(dp.attributes.peer_name, "host.test");
        assert_eq!(dp.attributes.tag, "prod");
    }

    #[test]
    fn test_record_stats_points() {
        let mut batch = MetricsBatch::new();
        let res = result(4, &[10, 20, 30, 40]);
        batch.record(&res);

        for metric in batch.metrics().iter().skip(1) {
            assert_eq!(metric.data_points.len(), 1, "{}", metric.name);
            let dp = &metric.data_points[0];
            assert_eq!(dp.timestamp, res.stats_timestamp);
            assert_eq!(dp.attributes.peer_ip, "192.0.2.7");
            assert_eq!(dp.attributes.peer_name, "host.test");
            assert_eq!(dp.attributes.tag, "prod");
        }
        assert_eq!(batch.rtt_min.data_points[0].value, 10.0);
        assert_eq!(batch.rtt_max.data_points[0].value, 40.0);
        assert_eq!(batch.rtt_avg.data_points[0].value, 25.0);
        assert!((batch.rtt_stddev.data_points[0].value - 11.180).abs() < 0.001);
        assert_eq!(batch.loss_ratio.data_points[0].value, 0.0);
    }

    #[test]
    fn test_zero_received_still_emits_aggregates() {
        let mut batch = MetricsBatch::new();
        batch.record(&result(4, &[]));

        assert!(batch.rtt.data_points.is_empty());
        assert_eq!(batch.loss_ratio.data_points[0].value, 1.0);
        assert_eq!(batch.rtt_avg.data_points[0].value, 0.0);
        assert_eq!(batch.data_point_count(), 5);
    }

    #[test]
    fn test_sub_millisecond_precision() {
        let mut res = result(1, &[0]);
        res.packets[0].rtt = Duration::from_nanos(1_234_567);
        let mut batch = MetricsBatch::new();
        batch.record(&res);
        assert_eq!(batch.rtt.data_points[0].value, 1.234567);
    }

    #[test]
    fn test_serialized_attribute_keys() {
        let mut batch = MetricsBatch::new();
        batch.record(&result(1, &[5]));
        let json = serde_json::to_value(&batch.rtt.data_points[0]).unwrap();

        assert_eq!(json["attributes"][ATTR_PEER_IP], "192.0.2.8");
        assert_eq!(json["attributes"][ATTR_PEER_NAME], "host.test");
        assert_eq!(json["attributes"][ATTR_TAG], "prod");
    }
}
