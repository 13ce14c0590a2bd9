//! Metrics sink: writes each scraped batch as JSON lines.

use std::io::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::metrics::{Attributes, MetricsBatch};

/// A batch tagged with the receiver that produced it.
#[derive(Debug, Clone)]
pub struct ScrapeReport {
    pub receiver: String,
    pub batch: MetricsBatch,
}

/// One exported line.
#[derive(Debug, Serialize)]
struct ExportedPoint<'a> {
    receiver: &'a str,
    metric: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    unit: &'a str,
    value: f64,
    timestamp: DateTime<Utc>,
    attributes: &'a Attributes,
}

/// Write every data point of `report` to `sink`, one JSON object per line.
pub fn write_report<W: Write>(sink: &mut W, report: &ScrapeReport) -> std::io::Result<usize> {
    let mut written = 0;
    for metric in report.batch.metrics() {
        for dp in &metric.data_points {
            let line = ExportedPoint {
                receiver: &report.receiver,
                metric: metric.name,
                unit: metric.unit,
                value: dp.value,
                timestamp: dp.timestamp,
                attributes: &dp.attributes,
            };
            serde_json::to_writer(&mut *sink, &line)?;
            sink.write_all(b"\n")?;
            written += 1;
        }
    }
    sink.flush()?;
    Ok(written)
}

/// Drain scrape reports into `sink` until every sender is gone.
pub async fn run_metrics_writer<W: Write>(mut rx: mpsc::Receiver<ScrapeReport>, mut sink: W) {
    while let Some(report) = rx.recv().await {
        if report.batch.is_empty() {
            tracing::debug!(receiver = %report.receiver, "Empty batch, nothing to export");
            continue;
        }

        match write_report(&mut sink, &report) {
            Ok(n) => tracing::debug!(receiver = %report.receiver, points = n, "Exported batch"),
            Err(e) => tracing::error!(receiver = %report.receiver, error = %e, "Failed to export batch"),
        }
    }
}
