//! ICMP receiver: periodically pings configured hosts and turns the results
//! into round-trip time and packet loss metrics.

pub mod config;
pub mod metrics;
pub mod probe;
pub mod scheduler;
pub mod scraper;

pub use config::{FileConfig, ReceiverConfig, Target, TargetRegistry};
pub use metrics::MetricsBatch;
pub use probe::{EchoEngine, IcmpEngine, ProbeError};
pub use scraper::{ScrapeError, Scraper};
