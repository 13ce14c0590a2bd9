//! Scrape orchestration: one probe per target, folded into one batch.

use thiserror::Error;

use crate::config::{PingDefaults, ReceiverConfig, Target};
use crate::metrics::MetricsBatch;
use crate::probe::{run_probe, EchoEngine, ProbeError};

/// Scrape error types.
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("failed to execute pinger for target {target:?}: {source}")]
    Probe {
        target: String,
        #[source]
        source: ProbeError,
    },
}

/// Probes every configured target in order.
///
/// Targets run strictly one after another, so a scrape can take as long as
/// the sum of the per-target timeouts.
pub struct Scraper<E> {
    engine: E,
    targets: Vec<Target>,
    defaults: PingDefaults,
    tag: String,
}

impl<E: EchoEngine> Scraper<E> {
    /// Build a scraper from a validated configuration.
    pub fn new(config: &ReceiverConfig, engine: E) -> Self {
        Self {
            engine,
            targets: config.targets.clone(),
            defaults: config.ping_defaults(),
            tag: config.tag.clone(),
        }
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Run one scrape.
    ///
    /// Targets whose name cannot be resolved are skipped. Any other probe
    /// failure aborts the scrape and drops the points gathered so far.
    pub fn scrape(&self) -> Result<MetricsBatch, ScrapeError> {
        let mut batch = MetricsBatch::new();

        for target in &self.targets {
            let params = target.resolve(&self.defaults);

            let mut result = match run_probe(&self.engine, &target.target, params) {
                Ok(result) => result,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(host = %target.target, error = %e, "skipping target");
                    continue;
                }
                Err(e) => {
                    return Err(ScrapeError::Probe {
                        target: target.target.clone(),
                        source: e,
                    })
                }
            };

            result.tag = self.tag.clone();
            batch.record(&result);
        }

        Ok(batch)
    }
}
