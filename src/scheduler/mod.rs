//! Scheduler module: scrapes each receiver on its collection interval.

mod writer;

pub use writer::*;

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::ReceiverConfig;
use crate::probe::EchoEngine;
use crate::scraper::Scraper;

/// Timing settings for one receiver's scrape loop.
#[derive(Debug, Clone, Copy)]
struct Timing {
    collection_interval: Duration,
    initial_delay: Duration,
    timeout: Duration,
}

/// Drives every receiver's scrape loop and the metrics writer.
pub struct Scheduler {
    stop_tx: broadcast::Sender<()>,
    report_tx: mpsc::Sender<ScrapeReport>,
    loops: Vec<JoinHandle<()>>,
    writer: JoinHandle<()>,
}

impl Scheduler {
    /// Create a scheduler whose batches are written to `sink`.
    pub fn new<W: Write + Send + 'static>(sink: W) -> Self {
        let (report_tx, report_rx) = mpsc::channel(100);
        let (stop_tx, _) = broadcast::channel(1);

        // Start the writer in a separate task
        let writer = tokio::spawn(run_metrics_writer(report_rx, sink));

        Self {
            stop_tx,
            report_tx,
            loops: Vec::new(),
            writer,
        }
    }

    /// Start scraping a validated receiver.
    pub fn add_receiver<E: EchoEngine + 'static>(
        &mut self,
        name: &str,
        config: &ReceiverConfig,
        engine: E,
    ) {
        let scraper = Arc::new(Scraper::new(config, engine));
        // tokio intervals cannot be zero
        let collection_interval = if config.collection_interval.is_zero() {
            ReceiverConfig::default().collection_interval
        } else {
            config.collection_interval
        };
        let timing = Timing {
            collection_interval,
            initial_delay: config.initial_delay,
            timeout: config.timeout,
        };

        tracing::info!(
            receiver = name,
            targets = config.targets.len(),
            "Scheduler: Adding receiver"
        );

        self.loops.push(tokio::spawn(run_scrape_loop(
            name.to_string(),
            scraper,
            timing,
            self.report_tx.clone(),
            self.stop_tx.subscribe(),
        )));
    }

    /// Stop all scrape loops, then let the writer drain.
    ///
    /// A scrape already in progress runs to completion first.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());

        for handle in self.loops {
            if let Err(e) = handle.await {
                tracing::error!("Scrape loop ended abnormally: {}", e);
            }
        }

        drop(self.report_tx);
        if let Err(e) = self.writer.await {
            tracing::error!("Metrics writer ended abnormally: {}", e);
        }
    }
}

/// Run the scrape loop for a single receiver.
async fn run_scrape_loop<E: EchoEngine + 'static>(
    name: String,
    scraper: Arc<Scraper<E>>,
    timing: Timing,
    tx: mpsc::Sender<ScrapeReport>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    tokio::select! {
        _ = stop_rx.recv() => return,
        _ = tokio::time::sleep(timing.initial_delay) => {}
    }

    let mut interval = tokio::time::interval(timing.collection_interval);
    // Scrapes never overlap; a slow one just delays the next tick.
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                let started = Instant::now();
                let task_scraper = scraper.clone();
                let result = tokio::task::spawn_blocking(move || task_scraper.scrape()).await;
                let elapsed = started.elapsed();

                if !timing.timeout.is_zero() && elapsed > timing.timeout {
                    tracing::warn!(
                        receiver = %name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        timeout_ms = timing.timeout.as_millis() as u64,
                        "Scrape exceeded timeout"
                    );
                }

                match result {
                    Ok(Ok(batch)) => {
                        let report = ScrapeReport { receiver: name.clone(), batch };
                        if tx.send(report).await.is_err() {
                            tracing::error!(receiver = %name, "Metrics writer is gone, stopping");
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::error!(receiver = %name, error = %e, "Scrape failed");
                    }
                    Err(e) => {
                        tracing::error!(receiver = %name, error = %e, "Scrape task panicked");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Target;
    use crate::probe::testing::{FakeEngine, Script};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn lines(&self) -> Vec<serde_json::Value> {
            let data = self.0.lock().unwrap();
            String::from_utf8_lossy(&data)
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    fn config(targets: &[&str]) -> ReceiverConfig {
        ReceiverConfig {
            collection_interval: Duration::from_millis(40),
            initial_delay: Duration::ZERO,
            default_ping_count: 4,
            tag: "prod".to_string(),
            targets: targets.iter().map(|t| Target::new(*t)).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_scheduler_exports_batches() {
        let buf = SharedBuf::default();
        let mut scheduler = Scheduler::new(buf.clone());
        scheduler.add_receiver("icmpcheck", &config(&["a.test", "b.test"]), FakeEngine::new());

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;

        let lines = buf.lines();
        // At least one full scrape: 8 rtt points and 2 in each aggregate stream
        assert!(lines.len() >= 18, "got {} lines", lines.len());
        assert_eq!(lines.len() % 18, 0);
        assert!(lines.iter().all(|l| l["receiver"] == "icmpcheck"));
    }

    #[tokio::test]
    async fn test_failed_scrapes_export_nothing() {
        let buf = SharedBuf::default();
        let mut scheduler = Scheduler::new(buf.clone());
        let engine = FakeEngine::new().with("b.test", Script::SocketFailure);
        scheduler.add_receiver("icmpcheck", &config(&["a.test", "b.test"]), engine);

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;

        assert!(buf.lines().is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_initial_delay() {
        let buf = SharedBuf::default();
        let mut scheduler = Scheduler::new(buf.clone());
        let mut cfg = config(&["a.test"]);
        cfg.initial_delay = Duration::from_secs(3600);
        scheduler.add_receiver("icmpcheck", &cfg, FakeEngine::new());

        tokio::time::timeout(Duration::from_secs(5), scheduler.stop())
            .await
            .expect("stop should not wait for the initial delay");
        assert!(buf.lines().is_empty());
    }
}
