//! ICMP receiver - network latency and packet loss metrics.

use icmp_receiver::scheduler::Scheduler;
use icmp_receiver::{FileConfig, IcmpEngine, TargetRegistry};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("icmp_receiver=info".parse()?))
        .init();

    // Load configuration
    let mut cfg = FileConfig::load()?;
    if cfg.receivers.is_empty() {
        return Err("no receivers configured".into());
    }

    // One registry for the whole process: a target may belong to one receiver only
    let registry = TargetRegistry::new();
    if let Err(failures) = cfg.validate(&registry) {
        for (name, errs) in &failures {
            tracing::error!("Invalid configuration for receiver {}: {}", name, errs);
        }
        return Err(format!("{} receiver(s) failed validation", failures.len()).into());
    }

    // Metrics go to stdout, logs to stderr
    let mut scheduler = Scheduler::new(std::io::stdout());
    for (name, receiver) in &cfg.receivers {
        scheduler.add_receiver(name, receiver, IcmpEngine::new());
    }
    tracing::info!("Started {} receiver(s) watching {} target(s)", cfg.receivers.len(), registry.len());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    scheduler.stop().await;

    Ok(())
}
